//! Discovery of saved sessions on disk

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::logger::{EVENTS_FILE, STATE_FILE};
use crate::state::{SaveMeta, SessionMeta};

/// Every save under `root`, searched recursively.
///
/// A save is a directory holding both a snapshot and an event log. Unreadable
/// directories and snapshots are skipped with a warning.
pub fn find_saves(root: &Path) -> Vec<SaveMeta> {
    let mut saves = Vec::new();
    walk(root, &mut saves);
    saves
}

fn walk(dir: &Path, saves: &mut Vec<SaveMeta>) {
    let state_path = dir.join(STATE_FILE);
    let event_path = dir.join(EVENTS_FILE);
    if state_path.is_file() && event_path.is_file() {
        match read_meta(&state_path) {
            Ok(meta) => saves.push(SaveMeta {
                meta,
                grouping_prefix: grouping_prefix(dir),
                state_path,
                event_path,
            }),
            Err(e) => warn!(path = %state_path.display(), error = %e, "Skipping unreadable save"),
        }
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Cannot list directory");
            return;
        }
    };
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            walk(&entry.path(), saves);
        }
    }
}

fn read_meta(path: &Path) -> io::Result<SessionMeta> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn grouping_prefix(dir: &Path) -> Vec<String> {
    dir.parent()
        .map(|parent| {
            parent
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use crate::state::SessionSnapshot;
    use tempfile::TempDir;

    fn write_save(dir: &Path, id: &str) {
        fs::create_dir_all(dir).unwrap();
        let snapshot = SessionSnapshot {
            meta: SessionMeta {
                id: SessionId::from(id),
                title: Some(format!("save {}", id)),
                last_modified: 2.0,
                n_events: 7,
            },
            state: vec![],
        };
        fs::write(dir.join(STATE_FILE), serde_json::to_vec(&snapshot).unwrap()).unwrap();
        fs::write(dir.join(EVENTS_FILE), "").unwrap();
    }

    #[test]
    fn test_finds_nested_saves() {
        let tmp = TempDir::new().unwrap();
        write_save(&tmp.path().join("a"), "a");
        write_save(&tmp.path().join("group").join("b"), "b");
        // snapshot without a log is not a save
        fs::create_dir_all(tmp.path().join("c")).unwrap();
        fs::write(tmp.path().join("c").join(STATE_FILE), "{}").unwrap();

        let mut saves = find_saves(tmp.path());
        saves.sort_by(|x, y| x.meta.id.cmp(&y.meta.id));

        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0].meta.n_events, 7);
        assert_eq!(saves[1].grouping_prefix.last().map(String::as_str), Some("group"));
        assert_eq!(saves[1].event_path, tmp.path().join("group").join("b").join(EVENTS_FILE));
    }

    #[test]
    fn test_bad_snapshot_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(STATE_FILE), "not json").unwrap();
        fs::write(dir.join(EVENTS_FILE), "").unwrap();
        write_save(&tmp.path().join("fine"), "fine");

        let saves = find_saves(tmp.path());
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].meta.id.as_str(), "fine");
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        assert!(find_saves(&tmp.path().join("nope")).is_empty());
    }
}
