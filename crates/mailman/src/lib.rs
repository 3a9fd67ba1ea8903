//! # Mailman
//!
//! Core library for the mail-processing engine at the heart of a
//! mailing-list manager: the distributed file lock, the directory-backed
//! message queues, on-disk list state, the runner/handler-chain
//! abstraction, the OS-process master supervisor, and the three
//! wall-clock maintenance engines (moderation, bounce, periodic).
//!
//! This crate is a thin facade over the workspace's microcrates,
//! mirroring how the teacher workspace's `shipper` crate re-exports
//! `shipper-retry` as `retry`: each concern below lives in its own
//! independently-testable crate; `mailman` wires them together and adds
//! the handful of cross-cutting helpers (list enumeration, runner
//! naming) that every entry point needs.
//!
//! ## Modules
//!
//! - [`types`] — domain types: `List`, `Subscriber`, `BounceInfo`,
//!   `HeldMessage`, `QueueEntry`, and friends.
//! - [`lock`] — `FileLock`, the five-step lease protocol.
//! - [`queue`] — `Switchboard`, the directory-backed FIFO-ish queue.
//! - [`store`] — `MessageStore`, crash-safe list-state persistence.
//! - [`retry`] — backoff strategies for transient failures.
//! - [`config`] — `Config`, loaded once and threaded by value.
//! - [`runner`] — `Runner`/`Handler`/`Decision`, the concrete runners,
//!   and `Reporter`, the logging seam used everywhere in this crate.
//! - [`master`] — the OS-process supervisor.
//! - [`moderation`] — held-message lifecycle and admin notices.
//! - [`bounce`] — the daily bounce-score sweep.
//! - [`periodic`] — digest dispatch, password reminders, NNTP gating,
//!   volume bump.
//!
//! ## CLI usage
//!
//! For command-line usage, see the `mailman-cli` crate (`mailmanctl`
//! and `qrunner` binaries).

pub use mailman_bounce as bounce;
pub use mailman_config as config;
pub use mailman_lock as lock;
pub use mailman_master as master;
pub use mailman_moderation as moderation;
pub use mailman_periodic as periodic;
pub use mailman_queue as queue;
pub use mailman_retry as retry;
pub use mailman_runner as runner;
pub use mailman_store as store;
pub use mailman_types as types;

use anyhow::{Context, Result};
use mailman_config::Config;

/// Every concrete runner name the supervisor and `qrunner --runner=All`
/// know how to expand to, in the order spec.md §4.3 tables them.
pub const RUNNER_NAMES: &[&str] =
    &["Incoming", "Pipeline", "Outgoing", "Bounce", "Virgin", "Command", "News", "Retry", "Archive"];

/// Every list name with a state directory under `<prefix>/lists`.
///
/// Used wherever an entry point needs to act on "every list" — the
/// periodic tasks' list loop, and `qrunner`/`mailmanctl`'s own
/// bookkeeping. A list directory is recognized by the presence of
/// `config.json` or `config.json.last` (a freshly-created, not-yet-saved
/// directory is not yet a list).
pub fn list_names(config: &Config) -> Result<Vec<String>> {
    let lists_dir = config.prefix.join("lists");
    if !lists_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&lists_dir).with_context(|| format!("failed to read {}", lists_dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let has_config =
            entry.path().join("config.json").exists() || entry.path().join("config.json.last").exists();
        if has_config {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// The shared `MessageStore` root for runners that dispatch across
/// many lists (`Incoming`, `Pipeline`, `Bounce`, `Command`): rooted one
/// level above any single list's directory, per `MessageStore`'s own
/// "persistence root for every list's state directory" contract.
pub fn shared_store(config: &Config) -> mailman_store::MessageStore {
    mailman_store::MessageStore::new(config.prefix.join("lists"))
}
