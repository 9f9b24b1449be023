use crate::detector;
use crate::folders;
use crate::media::MediaMaterializer;
use crate::model::Message;
use crate::source::{MessagePager, MessageSource};
use crate::store::Store;
use anyhow::Result;
use bridge_api::{DialogInfo, SourceMessage};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// When a backfill scan stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Stop after the first message older than the instant.
    Cutoff(OffsetDateTime),
    /// Stop after the first message the store already knew.
    KnownId,
    /// Walk back to the start of history.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    Stopped,
}

/// Result of running one message through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub message: Message,
    /// Whether a row was written to the store.
    pub written: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub written: usize,
    pub failed: usize,
    pub stopped_early: bool,
}

/// Broadcast channels and archived dialogs are left out of the archive.
pub fn is_archivable(dialog: &DialogInfo) -> bool {
    if dialog.is_channel {
        debug!(name = %dialog.name, "skipping channel");
        false
    } else if dialog.archived {
        debug!(name = %dialog.name, "skipping archived dialog");
        false
    } else {
        true
    }
}

/// Owns the store and media materializer and runs messages through them.
pub struct Archiver {
    store: Store,
    media: MediaMaterializer,
    page_size: usize,
}

impl Archiver {
    pub fn new(store: Store, media: MediaMaterializer, page_size: usize) -> Self {
        Self {
            store,
            media,
            page_size,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn into_store(self) -> Store {
        self.store
    }

    /// Make sure the dialog is recorded and return its folder. A known
    /// dialog keeps its folder; only a changed name is written back.
    pub fn ensure_dialog(&mut self, dialog: &DialogInfo) -> Result<String> {
        let known = self.store.list_dialogs()?;
        if let Some(entry) = known.get(&dialog.id) {
            let folder = entry.folder.clone();
            if entry.name != dialog.name {
                info!(id = dialog.id, old = %entry.name, new = %dialog.name, "dialog renamed");
                self.store.upsert_dialog(dialog.id, &dialog.name, &folder)?;
            }
            folders::prepare_dialog_dir(self.media.root(), dialog.id, &folder)?;
            return Ok(folder);
        }
        let folder = folders::assign_folder(dialog.id, &dialog.name, known);
        info!(id = dialog.id, name = %dialog.name, %folder, "adding new dialog");
        folders::prepare_dialog_dir(self.media.root(), dialog.id, &folder)?;
        self.store.upsert_dialog(dialog.id, &dialog.name, &folder)?;
        Ok(folder)
    }

    /// Media, change detection and persistence for one observed message.
    /// Writes only when the detector reports a difference; does not flush.
    pub async fn process_message<S: MessageSource + ?Sized>(
        &mut self,
        source: &mut S,
        dialog_id: i64,
        folder: &str,
        src: &SourceMessage,
        prior: Option<&Message>,
    ) -> Result<Processed> {
        let mut observed = Message::from_source(src);
        match self
            .media
            .materialize(&self.store, source, folder, src, prior)
            .await
        {
            Ok(Some(resolved)) => resolved.apply(&mut observed),
            Ok(None) => {}
            Err(err) => warn!(id = src.id, "media not saved: {err:#}"),
        }
        let reconciled = detector::reconcile(observed, prior);
        let written =
            reconciled.is_dirty() && self.store.upsert_message(dialog_id, &reconciled.merged)?;
        Ok(Processed {
            message: reconciled.merged,
            written,
        })
    }

    /// Backfill one dialog newest-first until the stop policy fires, then
    /// flush once.
    pub async fn archive_dialog<S: MessageSource + ?Sized>(
        &mut self,
        source: &mut S,
        dialog: &DialogInfo,
        policy: StopPolicy,
    ) -> Result<ScanReport> {
        let folder = self.ensure_dialog(dialog)?;
        let mut known = self.store.list_messages(dialog.id)?;
        debug!(dialog = %dialog.name, known = known.len(), "loaded known messages");

        let mut pager = MessagePager::new(dialog.id, self.page_size);
        let mut report = ScanReport::default();
        let mut state = ScanState::Scanning;
        let outcome = loop {
            if state == ScanState::Stopped {
                break Ok(());
            }
            let src = match pager.next(source).await {
                Ok(Some(src)) => src,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            report.scanned += 1;
            let prior = known.get(&src.id).cloned();
            let was_known = prior.is_some();
            match self
                .process_message(source, dialog.id, &folder, &src, prior.as_ref())
                .await
            {
                Ok(processed) => {
                    if processed.written {
                        report.written += 1;
                    }
                    known.insert(src.id, processed.message);
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(dialog = %dialog.name, id = src.id, "failed to archive message: {err:#}");
                }
            }

            state = match policy {
                StopPolicy::Cutoff(cutoff) if src.date.map(|d| d < cutoff).unwrap_or(false) => {
                    debug!("reached an older message - skipping the remaining");
                    ScanState::Stopped
                }
                StopPolicy::KnownId if was_known => {
                    debug!("reached a known message - skipping the remaining");
                    ScanState::Stopped
                }
                _ => ScanState::Scanning,
            };
            report.stopped_early = state == ScanState::Stopped;
        };

        self.store.flush()?;
        outcome?;
        info!(
            dialog = %dialog.name,
            scanned = report.scanned,
            written = report.written,
            "dialog scanned"
        );
        Ok(report)
    }

    /// Backfill every archivable dialog in listing order, or just `only`.
    /// A dialog that fails is logged and the next one is tried.
    pub async fn archive_all<S: MessageSource + ?Sized>(
        &mut self,
        source: &mut S,
        only: Option<i64>,
        policy: StopPolicy,
    ) -> Result<Vec<(i64, ScanReport)>> {
        let mut reports = Vec::new();
        for dialog in source.dialogs().await? {
            if only.is_some_and(|id| id != dialog.id) {
                continue;
            }
            if !is_archivable(&dialog) {
                continue;
            }
            debug!(name = %dialog.name, id = dialog.id, "archiving dialog");
            match self.archive_dialog(source, &dialog, policy).await {
                Ok(report) => reports.push((dialog.id, report)),
                Err(err) => error!(name = %dialog.name, "dialog scan failed: {err:#}"),
            }
            if only.is_some() {
                break;
            }
        }
        Ok(reports)
    }
}
