use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::hasher;
use crate::model::{AUX_HASH, AUX_SIZE};
use crate::store::Store;

/// What a consolidation pass found, and did when committing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Messages with a media reference.
    pub checked: usize,
    /// References whose hash or size was filled from disk.
    pub hashed: usize,
    /// References repointed to a path that exists.
    pub relinked: usize,
    /// References moved onto the first-seen copy of the same content.
    pub duplicates: usize,
    pub missing: Vec<String>,
    /// Media files no message points at.
    pub stale: Vec<PathBuf>,
    /// Folders of dialogs without messages.
    pub empty_dialogs: Vec<PathBuf>,
    /// Messages written back to the store.
    pub written: usize,
}

/// Bring media references and media files back in line.
///
/// Nothing is written or deleted unless `commit` is set; a dry run only
/// reports what would change.
pub async fn consolidate_media(
    store: &mut Store,
    root: &Path,
    commit: bool,
) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();
    let mut dialogs: Vec<(i64, String)> = store
        .list_dialogs()?
        .iter()
        .map(|(id, entry)| (*id, entry.folder.clone()))
        .collect();
    dialogs.sort();

    let mut canonical: HashMap<String, String> = HashMap::new();
    let mut referenced: HashSet<PathBuf> = HashSet::new();
    let mut media_dirs = Vec::new();

    for (dialog_id, folder) in &dialogs {
        let messages = store.list_messages(*dialog_id)?;
        let dir = root.join(folder);
        if messages.is_empty() {
            if dir.is_dir() {
                info!(path = %dir.display(), "dialog has no messages");
                if commit {
                    std::fs::remove_dir_all(&dir)
                        .with_context(|| format!("failed to remove {}", dir.display()))?;
                }
                report.empty_dialogs.push(dir);
            }
            continue;
        }
        media_dirs.push(dir.join("media"));

        for (_, mut msg) in messages {
            let Some(mut path) = msg.media.clone() else {
                continue;
            };
            report.checked += 1;
            let mut changed = false;

            if !root.join(&path).is_file() {
                if let Some(fixed) = repair_path(root, &path) {
                    debug!(from = %path, to = %fixed, "repairing media path");
                    path = fixed;
                    msg.media = Some(path.clone());
                    report.relinked += 1;
                    changed = true;
                }
            }
            let full = root.join(&path);
            if !full.is_file() {
                error!(%path, "media not found");
                report.missing.push(path);
                continue;
            }

            if msg.hash().is_none() || msg.size().is_none() {
                let digest = hasher::hash_file(&full).await?;
                msg.aux
                    .entry(AUX_HASH.into())
                    .or_insert_with(|| Value::from(digest.hash));
                msg.aux
                    .entry(AUX_SIZE.into())
                    .or_insert_with(|| Value::from(digest.size));
                report.hashed += 1;
                changed = true;
            }

            let hash = msg.hash().unwrap_or_default().to_string();
            match canonical.get(&hash) {
                Some(known) if *known != path && root.join(known).is_file() => {
                    info!(%path, %known, "duplicate media, pointing at the first copy");
                    msg.media = Some(known.clone());
                    report.duplicates += 1;
                    changed = true;
                }
                Some(_) => {}
                None => {
                    canonical.insert(hash, path.clone());
                }
            }
            if let Some(media) = &msg.media {
                referenced.insert(root.join(media));
            }

            if changed {
                debug!(dialog = dialog_id, id = msg.id, "media reference updated");
                if commit {
                    store.upsert_message(*dialog_id, &msg)?;
                    report.written += 1;
                }
            }
        }
    }
    if commit {
        store.flush()?;
    }

    report.stale = scan_unreferenced(&media_dirs, &referenced);
    for stale in &report.stale {
        if commit {
            info!(path = %stale.display(), "deleting stale media");
            std::fs::remove_file(stale)
                .with_context(|| format!("failed to remove {}", stale.display()))?;
        } else {
            debug!(path = %stale.display(), "stale media");
        }
    }
    info!(
        checked = report.checked,
        duplicates = report.duplicates,
        missing = report.missing.len(),
        stale = report.stale.len(),
        commit,
        "media consolidated"
    );
    Ok(report)
}

/// Older archives stored paths with the root directory prefixed.
fn repair_path(root: &Path, path: &str) -> Option<String> {
    let stripped = path.strip_prefix("store/")?;
    root.join(stripped).is_file().then(|| stripped.to_string())
}

/// Files under the media folders that no reference points at.
fn scan_unreferenced(media_dirs: &[PathBuf], referenced: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut stale: Vec<PathBuf> = media_dirs
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| !referenced.contains(p))
        .collect();
    stale.sort();
    stale
}
