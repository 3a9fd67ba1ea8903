//! Durable, crash-safe on-disk persistence for list state.
//!
//! Every list lives in its own directory under the store root. The
//! authoritative document is `config.json`, written through a
//! temp-file-then-rename so a crash mid-write never corrupts the
//! previous good copy. `config.json.last` is the previous good copy,
//! kept for operator recovery; `config.safety` is written only when a
//! read of `config.json` itself fails, preserving the broken bytes for
//! post-mortem instead of silently discarding them.
//!
//! `request.json` and `pending.json` are derived, read-only views of
//! the pending-request table embedded in the list document: the list
//! itself remains the single source of truth (so a crash can never
//! leave the two out of sync), and these files are resynced on every
//! `save` for operators and tooling that expect the original layout.

use std::fs;
use std::path::{Path, PathBuf};

use mailman_types::{HeldMessage, List};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("list {0} has no readable state: config.json, config.json.last, and config.safety all failed")]
    Unrecoverable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io { path: path.to_path_buf(), source }
}

/// Writes `content` to `path` via a sibling temp file and an atomic
/// rename, so a crash mid-write leaves the previous `path` untouched.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).map_err(|e| io_err(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Persistence root for every list's state directory.
#[derive(Debug, Clone)]
pub struct MessageStore {
    root: PathBuf,
}

impl MessageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn list_dir(&self, list_name: &str) -> PathBuf {
        self.root.join(list_name)
    }

    fn config_path(&self, list_name: &str) -> PathBuf {
        self.list_dir(list_name).join("config.json")
    }

    fn last_path(&self, list_name: &str) -> PathBuf {
        self.list_dir(list_name).join("config.json.last")
    }

    fn safety_path(&self, list_name: &str) -> PathBuf {
        self.list_dir(list_name).join("config.safety")
    }

    fn request_path(&self, list_name: &str) -> PathBuf {
        self.list_dir(list_name).join("request.json")
    }

    fn pending_path(&self, list_name: &str) -> PathBuf {
        self.list_dir(list_name).join("pending.json")
    }

    /// Save `list`, rotating the previous `config.json` to
    /// `config.json.last` first, then resyncing the derived
    /// `request.json`/`pending.json` views.
    pub fn save(&self, list: &List) -> Result<()> {
        let config_path = self.config_path(list.name());
        let last_path = self.last_path(list.name());

        if config_path.exists() {
            fs::copy(&config_path, &last_path).map_err(|e| io_err(&last_path, e))?;
        }

        let json = serde_json::to_vec_pretty(list)
            .map_err(|e| StoreError::Parse { path: config_path.clone(), source: e })?;
        atomic_write(&config_path, &json)?;

        self.sync_derived_views(list)?;
        Ok(())
    }

    /// Load a list's state, falling back `config.json` ->
    /// `config.json.last` -> `config.safety` on read/parse failure,
    /// exactly the recovery chain the spec's layout names.
    pub fn load(&self, list_name: &str) -> Result<List> {
        let config_path = self.config_path(list_name);
        match self.read_one(&config_path) {
            Ok(list) => return Ok(list),
            Err(_) => {
                if let Ok(bytes) = fs::read(&config_path) {
                    let safety_path = self.safety_path(list_name);
                    let _ = atomic_write(&safety_path, &bytes);
                }
            }
        }

        let last_path = self.last_path(list_name);
        if let Ok(list) = self.read_one(&last_path) {
            return Ok(list);
        }

        let safety_path = self.safety_path(list_name);
        if let Ok(list) = self.read_one(&safety_path) {
            return Ok(list);
        }

        Err(StoreError::Unrecoverable(list_name.to_string()))
    }

    fn read_one(&self, path: &Path) -> Result<List> {
        let content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Parse { path: path.to_path_buf(), source: e })
    }

    pub fn exists(&self, list_name: &str) -> bool {
        self.config_path(list_name).exists()
    }

    fn sync_derived_views(&self, list: &List) -> Result<()> {
        let requests_json = serde_json::to_vec_pretty(list.pending_requests())
            .map_err(|e| StoreError::Parse { path: self.request_path(list.name()), source: e })?;
        atomic_write(&self.request_path(list.name()), &requests_json)?;

        let cookie_map: std::collections::BTreeMap<&str, u64> =
            list.pending_requests().iter().map(|r| (r.cookie.as_str(), r.id)).collect();
        let pending_json = serde_json::to_vec_pretty(&cookie_map)
            .map_err(|e| StoreError::Parse { path: self.pending_path(list.name()), source: e })?;
        atomic_write(&self.pending_path(list.name()), &pending_json)?;

        Ok(())
    }

    // -- held-message artifacts --------------------------------------------

    pub fn held_message_path(&self, list_name: &str, id: u64) -> PathBuf {
        self.root.join(format!("heldmsg-{list_name}-{id}.json"))
    }

    /// Write a held message's raw artifact to its own file, out of
    /// band from `config.json`, so a large held post does not bloat
    /// every save of the list.
    pub fn write_held_message(&self, list_name: &str, message: &HeldMessage) -> Result<()> {
        let path = self.held_message_path(list_name, message.id);
        let json = serde_json::to_vec_pretty(message)
            .map_err(|e| StoreError::Parse { path: path.clone(), source: e })?;
        atomic_write(&path, &json)
    }

    pub fn load_held_message(&self, list_name: &str, id: u64) -> Result<HeldMessage> {
        let path = self.held_message_path(list_name, id);
        let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Parse { path, source: e })
    }

    /// Remove a held message's artifact after a terminal disposition.
    /// Absent-already is not an error: the sweep may be retried.
    pub fn remove_held_message(&self, list_name: &str, id: u64) -> Result<()> {
        let path = self.held_message_path(list_name, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use mailman_types::{PendingRequestKind, Subscriber};
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn save_then_load_round_trips() {
        let td = tempdir().unwrap();
        let store = MessageStore::new(td.path());

        let mut list = List::new("projects", "example.com");
        list.add_subscriber(Subscriber::new("bob@example.com"));

        store.save(&list).unwrap();
        let loaded = store.load("projects").unwrap();

        assert_eq!(loaded.name(), "projects");
        assert_eq!(loaded.subscriber_count(), 1);
    }

    #[test]
    fn second_save_keeps_previous_as_last() {
        let td = tempdir().unwrap();
        let store = MessageStore::new(td.path());

        let mut list = List::new("projects", "example.com");
        store.save(&list).unwrap();
        assert!(!store.last_path("projects").exists());

        list.add_subscriber(Subscriber::new("carol@example.com"));
        store.save(&list).unwrap();
        assert!(store.last_path("projects").exists());

        let last_content = fs::read_to_string(store.last_path("projects")).unwrap();
        let last_list: List = serde_json::from_str(&last_content).unwrap();
        assert_eq!(last_list.subscriber_count(), 0);
    }

    #[test]
    fn load_falls_back_to_last_when_config_is_corrupt() {
        let td = tempdir().unwrap();
        let store = MessageStore::new(td.path());

        let list = List::new("projects", "example.com");
        store.save(&list).unwrap();
        // second save rotates the good copy into config.json.last
        store.save(&list).unwrap();

        fs::write(store.config_path("projects"), b"{not valid json").unwrap();

        let loaded = store.load("projects").unwrap();
        assert_eq!(loaded.name(), "projects");
        assert!(store.safety_path("projects").exists());
    }

    #[test]
    fn load_falls_back_to_safety_when_nothing_else_readable() {
        let td = tempdir().unwrap();
        let store = MessageStore::new(td.path());
        let list = List::new("projects", "example.com");

        fs::create_dir_all(store.list_dir("projects")).unwrap();
        let json = serde_json::to_vec_pretty(&list).unwrap();
        fs::write(store.safety_path("projects"), json).unwrap();

        let loaded = store.load("projects").unwrap();
        assert_eq!(loaded.name(), "projects");
    }

    #[test]
    fn load_unrecoverable_when_all_copies_missing() {
        let td = tempdir().unwrap();
        let store = MessageStore::new(td.path());
        let err = store.load("nosuchlist").unwrap_err();
        assert!(matches!(err, StoreError::Unrecoverable(_)));
    }

    #[test]
    fn derived_views_reflect_pending_requests() {
        let td = tempdir().unwrap();
        let store = MessageStore::new(td.path());

        let mut list = List::new("projects", "example.com");
        list.new_pending_request(
            PendingRequestKind::Subscription,
            now(),
            14,
            "cookie-abc".to_string(),
            serde_json::json!({"address": "new@example.com"}),
        );
        store.save(&list).unwrap();

        let pending_content = fs::read_to_string(store.pending_path("projects")).unwrap();
        let cookie_map: std::collections::BTreeMap<String, u64> =
            serde_json::from_str(&pending_content).unwrap();
        assert_eq!(cookie_map.get("cookie-abc"), Some(&1));
    }

    #[test]
    fn held_message_artifact_lifecycle() {
        let td = tempdir().unwrap();
        let store = MessageStore::new(td.path());
        let mut list = List::new("projects", "example.com");
        let id = list.hold_message("eve@example.com", "hi", "non-member post", now(), b"raw body".to_vec());
        let held = list.held_message_mut(id).unwrap().clone();

        store.write_held_message("projects", &held).unwrap();
        assert!(store.held_message_path("projects", id).exists());

        let loaded = store.load_held_message("projects", id).unwrap();
        assert_eq!(loaded.sender, "eve@example.com");

        store.remove_held_message("projects", id).unwrap();
        assert!(!store.held_message_path("projects", id).exists());

        // removing again is not an error
        store.remove_held_message("projects", id).unwrap();
    }
}
