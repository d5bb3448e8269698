//! Sync/Index Coordinator (§4.6): content-addressed workspace snapshots
//! and diffs, used to detect out-of-band file changes between sessions.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::types::{Snapshot, SnapshotDiff};

/// Directory names never walked when building a snapshot.
const DEFAULT_IGNORE: &[&str] = &[".git", "target", "node_modules", ".worktrees"];

/// Walk `root`, hash every eligible file with SHA-256, and return a
/// snapshot whose `digest` is a content-address over the sorted file list.
pub fn snapshot(workspace_id: &str, root: impl AsRef<Path>) -> CoreResult<Snapshot> {
    let root = root.as_ref();
    let mut files: BTreeMap<String, String> = BTreeMap::new();

    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
    {
        let entry = entry.map_err(|e| CoreError::Internal {
            event_id: uuid::Uuid::new_v4(),
            message: format!("walk error: {e}"),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = std::fs::read(entry.path()).map_err(|e| CoreError::Internal {
            event_id: uuid::Uuid::new_v4(),
            message: format!("read {rel}: {e}"),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("{:x}", hasher.finalize());
        files.insert(rel, hash);
    }

    let files: Vec<(String, String)> = files.into_iter().collect();
    let digest = content_digest(&files);

    Ok(Snapshot {
        workspace_id: workspace_id.to_string(),
        files,
        digest,
        taken_at: chrono::Utc::now(),
    })
}

fn is_ignored(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| DEFAULT_IGNORE.contains(&name))
        .unwrap_or(false)
}

fn content_digest(files: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    for (path, hash) in files {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Compare two snapshots of the same workspace and report added, modified,
/// and removed files.
pub fn diff(old: &Snapshot, new: &Snapshot) -> SnapshotDiff {
    let old_map: BTreeMap<&str, &str> = old
        .files
        .iter()
        .map(|(p, h)| (p.as_str(), h.as_str()))
        .collect();
    let new_map: BTreeMap<&str, &str> = new
        .files
        .iter()
        .map(|(p, h)| (p.as_str(), h.as_str()))
        .collect();

    let mut result = SnapshotDiff::default();
    for (path, hash) in &new_map {
        match old_map.get(path) {
            None => result.added.push(path.to_string()),
            Some(old_hash) if old_hash != hash => result.modified.push(path.to_string()),
            Some(_) => {}
        }
    }
    for path in old_map.keys() {
        if !new_map.contains_key(path) {
            result.removed.push(path.to_string());
        }
    }
    result
}

/// Persist a snapshot atomically: write to a temp file in the same
/// directory, `fsync`, then rename over the destination.
pub fn write_snapshot_atomic(snapshot_dir: impl AsRef<Path>, snapshot: &Snapshot) -> CoreResult<PathBuf> {
    let dir = snapshot_dir.as_ref();
    std::fs::create_dir_all(dir).map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    let dest = dir.join(format!("{}.json", snapshot.digest));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    let json = serde_json::to_vec_pretty(snapshot).expect("serialize snapshot");
    tmp.write_all(&json)
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    tmp.persist(&dest)
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    Ok(dest)
}
