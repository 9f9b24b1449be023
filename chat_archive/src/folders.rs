use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::model::DialogEntry;

/// Sanitize a display name into a folder-friendly slug.
pub fn sanitize_slug(input: &str) -> String {
    let mut slug = String::new();
    let mut prev_dash = false;
    for c in input.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            prev_dash = false;
        } else if !prev_dash {
            slug.push('-');
            prev_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Pick the folder for a dialog seen for the first time. Falls back to the
/// id for names with no usable characters and adds the id when another
/// dialog already owns the slug.
pub fn assign_folder(id: i64, name: &str, known: &HashMap<i64, DialogEntry>) -> String {
    let slug = sanitize_slug(name);
    if slug.is_empty() {
        return id.to_string();
    }
    let taken = known
        .iter()
        .any(|(other, entry)| *other != id && entry.folder == slug);
    if taken {
        format!("{slug}-{id}")
    } else {
        slug
    }
}

/// Create the dialog folder, moving a legacy folder named by the bare
/// dialog id if one is lying around.
pub fn prepare_dialog_dir(root: &Path, id: i64, folder: &str) -> Result<()> {
    let target = root.join(folder);
    let legacy = root.join(id.to_string());
    if folder != id.to_string() && legacy.is_dir() && !target.exists() {
        info!(from = %legacy.display(), to = %target.display(), "moving legacy dialog folder");
        std::fs::rename(&legacy, &target)
            .with_context(|| format!("failed to move {}", legacy.display()))?;
    }
    let media = target.join("media");
    std::fs::create_dir_all(&media)
        .with_context(|| format!("failed to create {}", media.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert_eq!(sanitize_slug("Alice"), "alice");
        assert_eq!(sanitize_slug("  Family & Friends!! "), "family-friends");
        assert_eq!(sanitize_slug("Ёлка"), "");
    }

    #[test]
    fn folder_collisions_and_fallback() {
        let mut known = HashMap::new();
        assert_eq!(assign_folder(42, "Alice", &known), "alice");
        known.insert(
            42,
            DialogEntry {
                name: "Alice".into(),
                folder: "alice".into(),
            },
        );
        assert_eq!(assign_folder(43, "alice", &known), "alice-43");
        assert_eq!(assign_folder(42, "Alice", &known), "alice");
        assert_eq!(assign_folder(44, "Ёлка", &known), "44");
    }

    #[test]
    fn legacy_folder_is_moved() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("42")).unwrap();
        std::fs::write(tmp.path().join("42/note.txt"), b"x").unwrap();
        prepare_dialog_dir(tmp.path(), 42, "alice").unwrap();
        assert!(!tmp.path().join("42").exists());
        assert!(tmp.path().join("alice/note.txt").is_file());
        assert!(tmp.path().join("alice/media").is_dir());
    }
}
