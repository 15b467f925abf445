//! C9 — Snapshot manager.
//!
//! Per-run capture of pre-edit file content under a session-scoped
//! directory, so a run can be reverted (spec.md §4.9). Grounded on the
//! teacher's `config.rs` atomic-write idiom (temp file + `fs::rename`) for
//! `metadata.json`, and its directory-listing retention pattern (reused here
//! for the same 10-snapshot cap as C8's debug-log retention).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::StreamEvent;
use crate::provider::FileAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: String,
    pub timestamp: u64,
    pub label: String,
    pub changes: Vec<ChangeRecord>,
}

/// Owns one run's pre-mutation capture directory. Only constructed in code
/// mode (spec.md §4.9).
pub struct SnapshotManager {
    dir: PathBuf,
    metadata: SnapshotMetadata,
    saved_paths: HashSet<String>,
}

impl SnapshotManager {
    /// Create `<project_root>/.agent/snapshots/<8-char-id>/`, derive a label
    /// from the last user message, write the initial `metadata.json`, cap
    /// retained snapshots, and return the manager plus the
    /// `snapshot_created` event to emit.
    pub fn init(
        project_root: &Path,
        last_user_message: &str,
        now_unix_ms: u64,
        max_snapshots: usize,
    ) -> anyhow::Result<(Self, StreamEvent)> {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let snapshots_root = project_root.join(".agent").join("snapshots");
        let dir = snapshots_root.join(&id);
        fs::create_dir_all(&dir)?;

        let label = derive_label(last_user_message);
        let metadata = SnapshotMetadata {
            id: id.clone(),
            timestamp: now_unix_ms,
            label: label.clone(),
            changes: Vec::new(),
        };

        let manager = SnapshotManager { dir, metadata, saved_paths: HashSet::new() };
        manager.write_metadata()?;
        enforce_retention(&snapshots_root, max_snapshots)?;

        let event = StreamEvent::Custom {
            name: "snapshot_created".to_string(),
            data: serde_json::json!({
                "id": id,
                "label": label,
                "timestamp": now_unix_ms,
                "changes": [],
            }),
        };
        Ok((manager, event))
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn has_changes(&self) -> bool {
        !self.metadata.changes.is_empty()
    }

    /// Capture `path`'s pre-change content exactly once per run. For
    /// `edit`/`delete`, the content is mirrored under the snapshot
    /// directory; `create` has no pre-content to capture. Always appends a
    /// `{path, action}` entry to `metadata.json`.
    pub fn capture(
        &mut self,
        path: &str,
        action: FileAction,
        before_content: Option<&str>,
    ) -> anyhow::Result<()> {
        if self.saved_paths.insert(path.to_string()) {
            if let (FileAction::Edit | FileAction::Delete, Some(content)) = (action, before_content) {
                let dest = self.dir.join(path);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(dest, content)?;
            }
        }
        self.metadata.changes.push(ChangeRecord { path: path.to_string(), action: action.as_str().to_string() });
        self.write_metadata()
    }

    /// Whether `path` already has a captured pre-change snapshot this run.
    pub fn already_captured(&self, path: &str) -> bool {
        self.saved_paths.contains(path)
    }

    /// Delete the snapshot directory if the run produced zero file changes.
    pub fn cleanup_if_empty(&self) -> anyhow::Result<()> {
        if !self.has_changes() && self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    fn write_metadata(&self) -> anyhow::Result<()> {
        let path = self.dir.join("metadata.json");
        let tmp_path = self.dir.join(".metadata.json.tmp");
        let content = serde_json::to_string_pretty(&self.metadata)?;
        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

fn derive_label(last_user_message: &str) -> String {
    let trimmed = last_user_message.trim();
    let truncated: String = trimmed.chars().take(50).collect();
    if trimmed.chars().count() > 50 {
        format!("{truncated}…")
    } else {
        truncated
    }
}

/// Cap retained snapshots per project to `keep`; oldest by `timestamp` in
/// their `metadata.json` are deleted.
fn enforce_retention(snapshots_root: &Path, keep: usize) -> anyhow::Result<()> {
    if !snapshots_root.exists() {
        return Ok(());
    }
    let mut entries: Vec<(u64, PathBuf)> = fs::read_dir(snapshots_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let meta_path = e.path().join("metadata.json");
            let content = fs::read_to_string(&meta_path).ok()?;
            let meta: SnapshotMetadata = serde_json::from_str(&content).ok()?;
            Some((meta.timestamp, e.path()))
        })
        .collect();

    entries.sort_by_key(|(ts, _)| *ts);
    if entries.len() > keep {
        for (_, path) in &entries[..entries.len() - keep] {
            let _ = fs::remove_dir_all(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_label_truncates_and_ellipsizes() {
        let long = "x".repeat(80);
        let label = derive_label(&long);
        assert_eq!(label.chars().count(), 51); // 50 chars + ellipsis
        assert!(label.ends_with('…'));
    }

    #[test]
    fn derive_label_keeps_short_message_untouched() {
        assert_eq!(derive_label("fix the bug"), "fix the bug");
    }

    #[test]
    fn init_writes_metadata_and_emits_event() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, event) = SnapshotManager::init(tmp.path(), "fix the thing", 1_000, 10).unwrap();
        assert!(tmp.path().join(".agent/snapshots").join(mgr.id()).join("metadata.json").exists());
        match event {
            StreamEvent::Custom { name, .. } => assert_eq!(name, "snapshot_created"),
            _ => panic!("expected Custom event"),
        }
    }

    #[test]
    fn capture_is_idempotent_per_path() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut mgr, _) = SnapshotManager::init(tmp.path(), "go", 1_000, 10).unwrap();
        mgr.capture("src/a.rs", FileAction::Edit, Some("original")).unwrap();
        assert!(mgr.already_captured("src/a.rs"));
        let mirrored = tmp.path().join(".agent/snapshots").join(mgr.id()).join("src/a.rs");
        assert_eq!(fs::read_to_string(&mirrored).unwrap(), "original");

        // Second capture of the same path must not overwrite the mirrored
        // pre-change content, even though a new change entry is appended.
        mgr.capture("src/a.rs", FileAction::Edit, Some("second version, should not be saved")).unwrap();
        assert_eq!(fs::read_to_string(&mirrored).unwrap(), "original");
        assert_eq!(mgr.metadata.changes.len(), 2);
    }

    #[test]
    fn create_action_has_no_precontent_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut mgr, _) = SnapshotManager::init(tmp.path(), "go", 1_000, 10).unwrap();
        mgr.capture("new.rs", FileAction::Create, None).unwrap();
        let mirrored = tmp.path().join(".agent/snapshots").join(mgr.id()).join("new.rs");
        assert!(!mirrored.exists());
        assert!(mgr.has_changes());
    }

    #[test]
    fn cleanup_if_empty_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _) = SnapshotManager::init(tmp.path(), "go", 1_000, 10).unwrap();
        let dir = tmp.path().join(".agent/snapshots").join(mgr.id());
        assert!(dir.exists());
        mgr.cleanup_if_empty().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn cleanup_if_empty_keeps_directory_with_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut mgr, _) = SnapshotManager::init(tmp.path(), "go", 1_000, 10).unwrap();
        mgr.capture("a.rs", FileAction::Create, None).unwrap();
        let dir = tmp.path().join(".agent/snapshots").join(mgr.id());
        mgr.cleanup_if_empty().unwrap();
        assert!(dir.exists());
    }

    #[test]
    fn retention_caps_to_newest_by_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        for ts in [100u64, 200, 300] {
            let (mgr, _) = SnapshotManager::init(tmp.path(), "go", ts, 2).unwrap();
            // force a non-empty changes list so we can tell surviving dirs apart later
            let _ = mgr;
        }
        let root = tmp.path().join(".agent/snapshots");
        let remaining: Vec<_> = fs::read_dir(&root).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(remaining.len(), 2);
    }
}
