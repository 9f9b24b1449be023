use crate::error::ArchiveError;
use crate::hasher::{self, ContentDigest};
use crate::model::{Message, MediaObject, AUX_TTL};
use crate::source::MessageSource;
use crate::store::Store;
use anyhow::{Context, Result};
use bridge_api::{MediaDescriptor, MediaKind, SourceMessage};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, info, warn};

/// How a media reference was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOutcome {
    /// The message already had a media path; nothing was downloaded.
    Reused,
    /// Same content was already archived under another path.
    Deduplicated,
    /// The hash was known but its file had vanished; it was written again.
    Healed,
    /// New content stored under a new path.
    Stored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMedia {
    pub path: String,
    /// Content identity; `None` when a previous resolution was reused.
    pub object: Option<MediaObject>,
    pub ttl_seconds: Option<i64>,
    pub outcome: MediaOutcome,
}

impl ResolvedMedia {
    /// Record the media reference on `msg`.
    pub fn apply(&self, msg: &mut Message) {
        match &self.object {
            Some(object) => msg.set_media(object),
            None => msg.media = Some(self.path.clone()),
        }
        if let Some(ttl) = self.ttl_seconds.filter(|t| *t > 0) {
            msg.aux.insert(AUX_TTL.into(), Value::from(ttl));
        }
    }
}

/// Media kinds that are never downloaded.
pub fn is_skipped_kind(kind: &MediaKind) -> bool {
    matches!(kind, MediaKind::WebPage | MediaKind::Geo | MediaKind::GeoLive)
}

/// Deterministic file name for a piece of media.
///
/// Album members share a timestamp, so they get the media id appended.
pub fn media_file_name(
    media: &MediaDescriptor,
    date: OffsetDateTime,
    grouped: bool,
) -> Option<String> {
    let (stem, extension) = match &media.kind {
        MediaKind::Photo => (None, ".jpg".to_string()),
        MediaKind::Contact { first_name } => {
            (Some(first_name.clone()).filter(|n| !n.is_empty()), ".vcard".to_string())
        }
        MediaKind::Document {
            file_name: Some(name),
            ..
        } if !name.is_empty() => {
            let path = Path::new(name);
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            (Some(stem).filter(|s| !s.is_empty()), ext)
        }
        MediaKind::Document { extension, .. } => (
            None,
            extension
                .as_deref()
                .map(|e| format!(".{}", e.trim_start_matches('.')))
                .unwrap_or_default(),
        ),
        MediaKind::WebPage | MediaKind::Geo | MediaKind::GeoLive | MediaKind::Unsupported => {
            return None
        }
    };
    let kind = match &media.kind {
        MediaKind::Photo => "photo",
        MediaKind::Contact { .. } => "contact",
        MediaKind::Document { subtype, .. } => subtype.as_deref().unwrap_or("document"),
        _ => "media",
    };
    let stamp = format!(
        "{}-{:02}-{:02}_{:02}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day(),
        date.hour(),
        date.minute(),
        date.second()
    );
    let mut name = match stem {
        Some(stem) => format!("{}_{stamp}", clean_component(&stem)),
        None => format!("{}_{stamp}", clean_component(kind)),
    };
    if grouped {
        if let Some(id) = media.id {
            name.push_str(&format!("_{id}"));
        }
    }
    name.push_str(&clean_component(&extension));
    Some(name)
}

fn clean_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches("..")
        .to_string()
}

enum Candidate {
    /// Nothing lives at the path yet.
    Free(String),
    /// The path already holds the same content.
    Taken(String),
}

/// Turns message media into files under the archive root, one file per
/// distinct content hash.
pub struct MediaMaterializer {
    root: PathBuf,
    save_self_destructing: bool,
}

impl MediaMaterializer {
    pub fn new<P: Into<PathBuf>>(root: P, save_self_destructing: bool) -> Self {
        Self {
            root: root.into(),
            save_self_destructing,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the media of `src` to a path relative to the root.
    ///
    /// `Ok(None)` means the message should be stored without media.
    pub async fn materialize<S: MessageSource + ?Sized>(
        &self,
        store: &Store,
        source: &mut S,
        folder: &str,
        src: &SourceMessage,
        prior: Option<&Message>,
    ) -> Result<Option<ResolvedMedia>> {
        let Some(media) = src.media.as_ref() else {
            return Ok(None);
        };
        let ttl_seconds = media.ttl_seconds;
        if let Some(path) = prior.and_then(|p| p.media.clone()) {
            debug!(id = src.id, %path, "media already resolved");
            return Ok(Some(ResolvedMedia {
                path,
                object: None,
                ttl_seconds,
                outcome: MediaOutcome::Reused,
            }));
        }
        if is_skipped_kind(&media.kind) {
            return Ok(None);
        }
        let Some(date) = src.date else {
            debug!("{}", ArchiveError::MissingTimestamp(src.id));
            return Ok(None);
        };
        let Some(file_name) = media_file_name(media, date, src.grouped_id.is_some()) else {
            warn!(kind = ?media.kind, "{}", ArchiveError::UnsupportedMedia(src.id));
            return Ok(None);
        };

        fs::create_dir_all(&self.root).await?;
        // removed when dropped, whichever branch below is taken
        let download = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.root)
            .context("creating download file")?;
        if !source.download_media(src, download.path()).await? {
            warn!(id = src.id, "media no longer available");
            return Ok(None);
        }
        let digest = hasher::hash_file(download.path()).await?;

        let known = store.lookup_media_by_hash(&digest.hash)?;
        let on_disk = known
            .iter()
            .find(|p| self.root.join(p.as_str()).is_file())
            .cloned();
        let (path, outcome) = match (on_disk, known.into_iter().next()) {
            (Some(existing), _) => {
                debug!(id = src.id, %existing, "duplicate media");
                (existing, MediaOutcome::Deduplicated)
            }
            (None, Some(recorded)) => {
                warn!(%recorded, "archived media missing on disk, restoring");
                self.place(download.path(), &self.root.join(&recorded), date)
                    .await?;
                (recorded, MediaOutcome::Healed)
            }
            (None, None) => match self.free_path(folder, &file_name, &digest).await? {
                Candidate::Taken(path) => {
                    debug!(id = src.id, %path, "media already on disk");
                    (path, MediaOutcome::Deduplicated)
                }
                Candidate::Free(path) => {
                    self.place(download.path(), &self.root.join(&path), date)
                        .await?;
                    info!(id = src.id, %path, "media saved");
                    (path, MediaOutcome::Stored)
                }
            },
        };
        drop(download);

        if outcome == MediaOutcome::Stored && ttl_seconds.unwrap_or(0) > 0 {
            if self.save_self_destructing {
                info!(id = src.id, "forwarding self-destructing media to own chat");
                if let Err(err) = source.send_to_self(&self.root.join(&path)).await {
                    warn!(id = src.id, "could not forward self-destructing media: {err:#}");
                }
            }
        }

        Ok(Some(ResolvedMedia {
            object: Some(MediaObject {
                hash: digest.hash,
                size: digest.size,
                path: path.clone(),
            }),
            path,
            ttl_seconds,
            outcome,
        }))
    }

    /// Path for new content. A file already holding the same bytes is
    /// reused; a name taken by other content gets the hash prefix appended.
    async fn free_path(
        &self,
        folder: &str,
        file_name: &str,
        digest: &ContentDigest,
    ) -> Result<Candidate> {
        let candidate = format!("{folder}/media/{file_name}");
        if !self.root.join(&candidate).exists() {
            return Ok(Candidate::Free(candidate));
        }
        if self.holds(&candidate, digest).await? {
            return Ok(Candidate::Taken(candidate));
        }
        let name = Path::new(file_name);
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = name
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let suffixed = format!("{folder}/media/{stem}_{}{ext}", &digest.hash[..8]);
        if self.holds(&suffixed, digest).await? {
            return Ok(Candidate::Taken(suffixed));
        }
        Ok(Candidate::Free(suffixed))
    }

    async fn holds(&self, path: &str, digest: &ContentDigest) -> Result<bool> {
        let full = self.root.join(path);
        if !full.is_file() {
            return Ok(false);
        }
        Ok(hasher::hash_file(&full).await?.hash == digest.hash)
    }

    async fn place(&self, from: &Path, to: &Path, date: OffsetDateTime) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(from, to)
            .await
            .with_context(|| format!("failed to copy media to {}", to.display()))?;
        if let Err(err) = set_mtime(to, date.into()) {
            warn!(path = %to.display(), "could not set modification time: {err}");
        }
        Ok(())
    }
}

fn set_mtime(path: &Path, when: SystemTime) -> std::io::Result<()> {
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(when)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fake::FakeSource;
    use time::macros::datetime;

    fn photo_message(id: i64, ttl: Option<i64>) -> SourceMessage {
        SourceMessage {
            id,
            dialog_id: 42,
            date: Some(datetime!(2023-05-01 12:00:00 UTC)),
            text: None,
            sender_id: Some(7),
            out: false,
            media: Some(MediaDescriptor {
                id: Some(1000 + id),
                kind: MediaKind::Photo,
                ttl_seconds: ttl,
            }),
            silent: false,
            from_scheduled: false,
            edit_date: None,
            grouped_id: None,
        }
    }

    fn leftover_downloads(root: &Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".download-"))
            .count()
    }

    #[test]
    fn names_follow_kind_and_date() {
        let date = datetime!(2023-05-01 09:08:07 UTC);
        let photo = MediaDescriptor {
            id: Some(5),
            kind: MediaKind::Photo,
            ttl_seconds: None,
        };
        assert_eq!(
            media_file_name(&photo, date, false).unwrap(),
            "photo_2023-05-01_09-08-07.jpg"
        );
        assert_eq!(
            media_file_name(&photo, date, true).unwrap(),
            "photo_2023-05-01_09-08-07_5.jpg"
        );
        let doc = MediaDescriptor {
            id: None,
            kind: MediaKind::Document {
                file_name: Some("report.final.pdf".into()),
                extension: None,
                subtype: None,
            },
            ttl_seconds: None,
        };
        assert_eq!(
            media_file_name(&doc, date, false).unwrap(),
            "report.final_2023-05-01_09-08-07.pdf"
        );
        let voice = MediaDescriptor {
            id: None,
            kind: MediaKind::Document {
                file_name: None,
                extension: Some("ogg".into()),
                subtype: Some("voice".into()),
            },
            ttl_seconds: None,
        };
        assert_eq!(
            media_file_name(&voice, date, false).unwrap(),
            "voice_2023-05-01_09-08-07.ogg"
        );
        let contact = MediaDescriptor {
            id: None,
            kind: MediaKind::Contact {
                first_name: "Bob".into(),
            },
            ttl_seconds: None,
        };
        assert_eq!(
            media_file_name(&contact, date, false).unwrap(),
            "Bob_2023-05-01_09-08-07.vcard"
        );
        let geo = MediaDescriptor {
            id: None,
            kind: MediaKind::Geo,
            ttl_seconds: None,
        };
        assert!(media_file_name(&geo, date, false).is_none());
    }

    #[tokio::test]
    async fn same_content_is_stored_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), false);
        let mut source = FakeSource::default();
        source.media.insert(1, b"same bytes".to_vec());
        source.media.insert(2, b"same bytes".to_vec());

        let first_src = photo_message(1, None);
        let first = mat
            .materialize(&store, &mut source, "alice", &first_src, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.outcome, MediaOutcome::Stored);
        let mut msg = Message::from_source(&first_src);
        first.apply(&mut msg);
        store.upsert_message(42, &msg).unwrap();

        let mut second_src = photo_message(2, None);
        second_src.date = Some(datetime!(2023-05-01 13:00:00 UTC));
        let second = mat
            .materialize(&store, &mut source, "alice", &second_src, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.outcome, MediaOutcome::Deduplicated);
        assert_eq!(second.path, first.path);

        let media_dir = tmp.path().join("alice/media");
        assert_eq!(std::fs::read_dir(media_dir).unwrap().count(), 1);
        assert_eq!(leftover_downloads(tmp.path()), 0);
    }

    #[tokio::test]
    async fn unrecorded_copy_on_disk_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), true);
        let mut source = FakeSource::default();
        source.media.insert(1, b"interrupted".to_vec());
        let src = photo_message(1, Some(10));

        // first run wrote the file but never committed the message
        let lost = Store::open_in_memory().unwrap();
        let first = mat
            .materialize(&lost, &mut source, "alice", &src, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.outcome, MediaOutcome::Stored);
        drop(lost);

        let store = Store::open_in_memory().unwrap();
        let again = mat
            .materialize(&store, &mut source, "alice", &src, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.outcome, MediaOutcome::Deduplicated);
        assert_eq!(again.path, first.path);
        assert_eq!(again.object.as_ref().unwrap().hash, first.object.unwrap().hash);
        assert_eq!(std::fs::read_dir(tmp.path().join("alice/media")).unwrap().count(), 1);
        assert_eq!(source.sent_to_self.len(), 1);
    }

    #[tokio::test]
    async fn taken_name_with_other_content_gets_hash_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), false);
        let mut source = FakeSource::default();
        source.media.insert(1, b"new".to_vec());
        let media_dir = tmp.path().join("alice/media");
        std::fs::create_dir_all(&media_dir).unwrap();
        std::fs::write(media_dir.join("photo_2023-05-01_12-00-00.jpg"), b"old").unwrap();

        let resolved = mat
            .materialize(&store, &mut source, "alice", &photo_message(1, None), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.outcome, MediaOutcome::Stored);
        let hash = &resolved.object.as_ref().unwrap().hash;
        assert_eq!(
            resolved.path,
            format!("alice/media/photo_2023-05-01_12-00-00_{}.jpg", &hash[..8])
        );
        assert_eq!(
            std::fs::read(media_dir.join("photo_2023-05-01_12-00-00.jpg")).unwrap(),
            b"old"
        );
    }

    #[tokio::test]
    async fn any_surviving_recorded_copy_is_preferred_over_restoring() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), false);
        let mut source = FakeSource::default();
        source.media.insert(3, b"shared".to_vec());

        let media_dir = tmp.path().join("bob/media");
        std::fs::create_dir_all(&media_dir).unwrap();
        let kept = media_dir.join("kept.jpg");
        std::fs::write(&kept, b"shared").unwrap();
        let digest = hasher::hash_file(&kept).await.unwrap();
        for (id, path) in [(1, "alice/media/gone.jpg"), (2, "bob/media/kept.jpg")] {
            let mut msg = Message::from_source(&photo_message(id, None));
            msg.set_media(&MediaObject {
                hash: digest.hash.clone(),
                size: digest.size,
                path: path.into(),
            });
            store.upsert_message(42, &msg).unwrap();
        }

        let resolved = mat
            .materialize(&store, &mut source, "alice", &photo_message(3, None), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.outcome, MediaOutcome::Deduplicated);
        assert_eq!(resolved.path, "bob/media/kept.jpg");
        assert!(!tmp.path().join("alice/media/gone.jpg").exists());
        assert!(!tmp.path().join("alice").exists());
    }

    #[tokio::test]
    async fn missing_file_is_restored_under_recorded_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), false);
        let mut source = FakeSource::default();
        source.media.insert(1, b"bytes".to_vec());
        source.media.insert(2, b"bytes".to_vec());

        let src = photo_message(1, None);
        let first = mat
            .materialize(&store, &mut source, "alice", &src, None)
            .await
            .unwrap()
            .unwrap();
        let mut msg = Message::from_source(&src);
        first.apply(&mut msg);
        store.upsert_message(42, &msg).unwrap();
        std::fs::remove_file(tmp.path().join(&first.path)).unwrap();

        let healed = mat
            .materialize(&store, &mut source, "bob", &photo_message(2, None), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(healed.outcome, MediaOutcome::Healed);
        assert_eq!(healed.path, first.path);
        assert!(tmp.path().join(&first.path).is_file());
    }

    #[tokio::test]
    async fn known_path_is_reused_without_download() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), false);
        let mut source = FakeSource::default();
        let prior = Message {
            id: 1,
            media: Some("alice/media/photo.jpg".into()),
            ..Default::default()
        };
        let res = mat
            .materialize(&store, &mut source, "alice", &photo_message(1, None), Some(&prior))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.outcome, MediaOutcome::Reused);
        assert_eq!(res.path, "alice/media/photo.jpg");
        assert_eq!(source.downloads, 0);
    }

    #[tokio::test]
    async fn expired_media_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), false);
        let mut source = FakeSource::default();
        let res = mat
            .materialize(&store, &mut source, "alice", &photo_message(1, None), None)
            .await
            .unwrap();
        assert!(res.is_none());
        assert_eq!(leftover_downloads(tmp.path()), 0);
    }

    #[tokio::test]
    async fn self_destructing_media_is_forwarded_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let mut source = FakeSource::default();
        source.media.insert(1, b"secret".to_vec());
        let mat = MediaMaterializer::new(tmp.path(), true);
        let res = mat
            .materialize(&store, &mut source, "alice", &photo_message(1, Some(10)), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source.sent_to_self.len(), 1);
        let mut msg = Message::default();
        res.apply(&mut msg);
        assert_eq!(msg.aux.get(AUX_TTL), Some(&Value::from(10)));

        let mut quiet = FakeSource::default();
        quiet.media.insert(2, b"other secret".to_vec());
        let mat = MediaMaterializer::new(tmp.path(), false);
        mat.materialize(&store, &mut quiet, "alice", &photo_message(2, Some(10)), None)
            .await
            .unwrap()
            .unwrap();
        assert!(quiet.sent_to_self.is_empty());
    }

    #[tokio::test]
    async fn file_mtime_follows_message_date() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let mat = MediaMaterializer::new(tmp.path(), false);
        let mut source = FakeSource::default();
        source.media.insert(1, b"x".to_vec());
        let res = mat
            .materialize(&store, &mut source, "alice", &photo_message(1, None), None)
            .await
            .unwrap()
            .unwrap();
        let modified = std::fs::metadata(tmp.path().join(&res.path))
            .unwrap()
            .modified()
            .unwrap();
        let expected: SystemTime = datetime!(2023-05-01 12:00:00 UTC).into();
        assert_eq!(modified, expected);
    }
}
