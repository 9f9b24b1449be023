use crate::error::ArchiveError;
use crate::model::Message;
use crate::source::MessageSource;
use crate::sync::{is_archivable, Archiver};
use crate::timefmt;
use anyhow::Result;
use bridge_api::{DialogInfo, SourceEvent, SourceMessage};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Applies push events to the archive, flushing after each one.
pub struct LiveReconciler {
    archiver: Archiver,
    backoff: Duration,
}

impl LiveReconciler {
    pub fn new(archiver: Archiver, backoff: Duration) -> Self {
        Self { archiver, backoff }
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    pub fn into_archiver(self) -> Archiver {
        self.archiver
    }

    /// Connect, subscribe, replay missed events and apply everything until
    /// the subscription closes. A closed subscription is reported as
    /// `ArchiveError::Disconnected`.
    pub async fn listen_once<S: MessageSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        source.connect().await?;
        let mut events = source.subscribe().await?;
        info!("catching up");
        source.catch_up().await?;
        info!("waiting for updates");
        while let Some(event) = events.recv().await {
            self.dispatch(source, event).await;
        }
        Err(ArchiveError::Disconnected.into())
    }

    /// Listen forever, waiting `backoff` after every lost connection.
    pub async fn run_forever<S: MessageSource + ?Sized>(&mut self, source: &mut S) {
        loop {
            if let Err(err) = self.listen_once(source).await {
                warn!(
                    backoff_secs = self.backoff.as_secs(),
                    "connection lost: {err:#}"
                );
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Apply one event. Failures are logged; nothing propagates to the loop.
    pub async fn dispatch<S: MessageSource + ?Sized>(&mut self, source: &mut S, event: SourceEvent) {
        if let Some(dialog) = event.dialog() {
            if !is_archivable(dialog) {
                return;
            }
        }
        let topic = event.topic();
        debug!(topic, "event received");
        let outcome = match event {
            SourceEvent::NewMessage { dialog, message }
            | SourceEvent::MessageEdited { dialog, message } => {
                self.on_message(source, &dialog, &message).await
            }
            SourceEvent::MessageRead {
                dialog,
                message_ids,
                read_at,
            } => {
                let when = timefmt::normalize(read_at.unwrap_or_else(OffsetDateTime::now_utc));
                self.mark(dialog.as_ref(), &message_ids, |msg| {
                    if msg.read_time.is_some() {
                        return false;
                    }
                    msg.read_time = Some(when);
                    true
                })
            }
            SourceEvent::MessageDeleted {
                dialog,
                message_ids,
            } => self.mark(dialog.as_ref(), &message_ids, |msg| {
                !std::mem::replace(&mut msg.deleted, true)
            }),
        };
        if let Err(err) = outcome {
            warn!(topic, "event not applied: {err:#}");
        }
        if let Err(err) = self.archiver.store_mut().flush() {
            warn!(topic, "flush after event failed: {err:#}");
        }
    }

    async fn on_message<S: MessageSource + ?Sized>(
        &mut self,
        source: &mut S,
        dialog: &DialogInfo,
        message: &SourceMessage,
    ) -> Result<()> {
        let folder = self.archiver.ensure_dialog(dialog)?;
        let prior = self.archiver.store().get_message_in(dialog.id, message.id)?;
        self.archiver
            .process_message(source, dialog.id, &folder, message, prior.as_ref())
            .await?;
        Ok(())
    }

    /// Update an attribute on each referenced message. `update` returns
    /// whether it changed anything; unknown ids are logged and skipped.
    fn mark<F>(&mut self, dialog: Option<&DialogInfo>, ids: &[i64], mut update: F) -> Result<()>
    where
        F: FnMut(&mut Message) -> bool,
    {
        for &id in ids {
            let store = self.archiver.store();
            let found = match dialog {
                Some(d) => store.get_message_in(d.id, id)?.map(|m| (m, d.id)),
                None => store.get_message(id)?,
            };
            let Some((mut msg, dialog_id)) = found else {
                warn!("{} - skipping", ArchiveError::LookupMiss { message_id: id });
                continue;
            };
            if update(&mut msg) {
                self.archiver.store_mut().upsert_message(dialog_id, &msg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaMaterializer;
    use crate::source::fake::FakeSource;
    use crate::store::Store;
    use time::macros::datetime;

    fn alice() -> DialogInfo {
        DialogInfo {
            id: 42,
            name: "Alice".into(),
            is_channel: false,
            archived: false,
        }
    }

    fn msg(id: i64, text: &str) -> SourceMessage {
        SourceMessage {
            id,
            dialog_id: 42,
            date: Some(datetime!(2023-05-01 12:00:00 UTC)),
            text: Some(text.into()),
            sender_id: Some(42),
            out: false,
            media: None,
            silent: false,
            from_scheduled: false,
            edit_date: None,
            grouped_id: None,
        }
    }

    fn reconciler(root: &std::path::Path) -> LiveReconciler {
        let archiver = Archiver::new(
            Store::open_in_memory().unwrap(),
            MediaMaterializer::new(root, true),
            10,
        );
        LiveReconciler::new(archiver, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn new_then_edit_is_flushed_each_time() {
        let tmp = tempfile::tempdir().unwrap();
        let mut live = reconciler(tmp.path());
        let mut source = FakeSource::default();
        live.dispatch(
            &mut source,
            SourceEvent::NewMessage {
                dialog: alice(),
                message: msg(1, "hi"),
            },
        )
        .await;
        assert!(!live.archiver().store().is_dirty());

        let mut edited = msg(1, "hi!");
        edited.edit_date = Some(datetime!(2023-05-01 12:05:00 UTC));
        live.dispatch(
            &mut source,
            SourceEvent::MessageEdited {
                dialog: alice(),
                message: edited,
            },
        )
        .await;
        assert!(!live.archiver().store().is_dirty());
        let stored = live.archiver().store().get_message_in(42, 1).unwrap().unwrap();
        assert_eq!(stored.text.as_deref(), Some("hi!"));
        assert_eq!(stored.edit_history(), vec!["hi"]);
        assert!(stored.edit_date.is_some());
    }

    #[tokio::test]
    async fn read_and_delete_mark_known_messages_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut live = reconciler(tmp.path());
        let mut source = FakeSource::default();
        live.dispatch(
            &mut source,
            SourceEvent::NewMessage {
                dialog: alice(),
                message: msg(1, "hi"),
            },
        )
        .await;

        let read_at = datetime!(2023-05-01 13:00:00 UTC);
        live.dispatch(
            &mut source,
            SourceEvent::MessageRead {
                dialog: Some(alice()),
                message_ids: vec![99, 1],
                read_at: Some(read_at),
            },
        )
        .await;
        live.dispatch(
            &mut source,
            SourceEvent::MessageDeleted {
                dialog: None,
                message_ids: vec![1, 100],
            },
        )
        .await;

        let store = live.archiver().store();
        let stored = store.get_message_in(42, 1).unwrap().unwrap();
        assert_eq!(stored.read_time, Some(read_at));
        assert!(stored.deleted);
        assert_eq!(stored.text.as_deref(), Some("hi"));
        assert!(store.get_message(99).unwrap().is_none());
        assert!(store.get_message(100).unwrap().is_none());
    }

    #[tokio::test]
    async fn events_from_channels_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut live = reconciler(tmp.path());
        let mut source = FakeSource::default();
        let news = DialogInfo {
            id: 5,
            name: "News".into(),
            is_channel: true,
            archived: false,
        };
        live.dispatch(
            &mut source,
            SourceEvent::NewMessage {
                dialog: news,
                message: msg(1, "breaking"),
            },
        )
        .await;
        assert!(live.archiver().store().get_message(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn dialog_rename_is_saved_on_event() {
        let tmp = tempfile::tempdir().unwrap();
        let mut live = reconciler(tmp.path());
        let mut source = FakeSource::default();
        live.dispatch(
            &mut source,
            SourceEvent::NewMessage {
                dialog: alice(),
                message: msg(1, "hi"),
            },
        )
        .await;
        let renamed = DialogInfo {
            name: "Alice W".into(),
            ..alice()
        };
        live.dispatch(
            &mut source,
            SourceEvent::NewMessage {
                dialog: renamed,
                message: msg(2, "again"),
            },
        )
        .await;
        let mut store = live.into_archiver().into_store();
        let entry = &store.list_dialogs().unwrap()[&42];
        assert_eq!(entry.name, "Alice W");
        assert_eq!(entry.folder, "alice");
    }

    #[tokio::test]
    async fn listen_once_reports_disconnect() {
        let tmp = tempfile::tempdir().unwrap();
        let mut live = reconciler(tmp.path());
        let mut source = FakeSource::default();
        source.sessions.push_back(vec![SourceEvent::NewMessage {
            dialog: alice(),
            message: msg(1, "hi"),
        }]);
        let err = live.listen_once(&mut source).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::Disconnected)
        ));
        assert_eq!(source.catch_ups, 1);
        assert!(live.archiver().store().get_message_in(42, 1).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_retries_after_failures_and_drops() {
        let tmp = tempfile::tempdir().unwrap();
        let mut live = reconciler(tmp.path());
        let mut source = FakeSource::default();
        source.fail_connects = 1;
        source.sessions.push_back(vec![SourceEvent::NewMessage {
            dialog: alice(),
            message: msg(1, "hi"),
        }]);

        let started = tokio::time::Instant::now();
        let run = tokio::time::timeout(Duration::from_secs(300), live.run_forever(&mut source));
        assert!(run.await.is_err());
        assert!(started.elapsed() >= Duration::from_secs(300));

        // failed connect, one dropped session, then a standing subscription
        assert_eq!(source.connects, 3);
        assert_eq!(source.catch_ups, 2);
        assert!(source.live.is_some());
        assert!(live.archiver().store().get_message_in(42, 1).unwrap().is_some());
    }
}
