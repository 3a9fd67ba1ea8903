//! One-shot periodic maintenance tasks, each started by an external
//! cron-equivalent: digest dispatch, password reminders, NNTP gating,
//! and digest-volume bumps.
//!
//! Every task iterates a set of lists and, per the source's own
//! `cron/*` scripts, must not let one broken list starve the others —
//! grounded on `shipper::engine_parallel::publish_package`'s per-item
//! try/catch-and-continue loop, applied here per list name.

use anyhow::Result;
use chrono::NaiveDate;
use mailman_config::Config;
use mailman_runner::{QueueName, Reporter, with_locked_list};
use mailman_store::MessageStore;
use mailman_types::{Message, QueueMetadata, meta_keys};
use std::collections::BTreeMap;

fn store_for(config: &Config, list_name: &str) -> MessageStore {
    MessageStore::new(config.list_data_dir(list_name))
}

fn been_there(raw: &[u8], list_address: &str) -> bool {
    let Ok(text) = std::str::from_utf8(raw) else { return false };
    text.lines()
        .find_map(|line| line.to_lowercase().strip_prefix("x-beenthere:").map(str::to_string))
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(list_address))
}

// ---------------------------------------------------------------------
// DigestDispatch
// ---------------------------------------------------------------------

/// For every list with periodic digest enabled, send the current
/// digest and bump its issue number.
pub struct DigestDispatch {
    config: Config,
}

impl DigestDispatch {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn run(&self, list_names: &[String], reporter: &mut dyn Reporter) {
        for list_name in list_names {
            if let Err(err) = self.dispatch_one(list_name, reporter) {
                reporter.error(&format!("digest dispatch failed for {list_name}: {err:#}"));
            }
        }
    }

    fn dispatch_one(&self, list_name: &str, reporter: &mut dyn Reporter) -> Result<()> {
        let store = store_for(&self.config, list_name);
        let issue = with_locked_list(&self.config, &store, list_name, |list| {
            if !list.digest.enabled {
                return Ok(None);
            }
            let issue = list.digest.issue;
            list.digest.issue += 1;
            Ok(Some(issue))
        })?;

        let Some(issue) = issue else { return Ok(()) };
        let mut meta = QueueMetadata::new();
        meta.set(meta_keys::LISTNAME, list_name.to_string());
        let body = format!("{list_name} Digest, Vol, Issue {issue}\n");
        QueueName::Virgin.open(&self.config)?.enqueue(Message::new(body.into_bytes()), meta)?;
        reporter.info(&format!("{list_name}: dispatched digest issue {issue}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// QueueVolumeBump
// ---------------------------------------------------------------------

/// Scheduled (typically monthly) bump of every enabled list's digest
/// volume number, resetting the issue counter.
pub struct QueueVolumeBump {
    config: Config,
}

impl QueueVolumeBump {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn run(&self, list_names: &[String], reporter: &mut dyn Reporter) {
        for list_name in list_names {
            if let Err(err) = self.bump_one(list_name) {
                reporter.error(&format!("volume bump failed for {list_name}: {err:#}"));
                continue;
            }
            reporter.info(&format!("{list_name}: bumped digest volume"));
        }
    }

    fn bump_one(&self, list_name: &str) -> Result<()> {
        let store = store_for(&self.config, list_name);
        with_locked_list(&self.config, &store, list_name, |list| {
            if list.digest.enabled {
                list.digest.volume += 1;
                list.digest.issue = 1;
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------
// PasswordReminders
// ---------------------------------------------------------------------

/// For each virtual host, reminds every subscriber (once, even if
/// subscribed to several lists on that host) of their list
/// password(s), unless they've set `suppress_password_reminder`.
pub struct PasswordReminders {
    config: Config,
}

impl PasswordReminders {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// `host_groups` maps a virtual host to the list names served on
    /// it; the host itself is only used for logging since delivery
    /// addressing is the `Deliverer`'s concern.
    pub fn run(&self, host_groups: &[(String, Vec<String>)], reporter: &mut dyn Reporter) {
        for (host, list_names) in host_groups {
            if let Err(err) = self.remind_host(host, list_names, reporter) {
                reporter.error(&format!("password reminders failed for host {host}: {err:#}"));
            }
        }
    }

    fn remind_host(&self, host: &str, list_names: &[String], reporter: &mut dyn Reporter) -> Result<()> {
        let mut by_address: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();

        for list_name in list_names {
            let store = store_for(&self.config, list_name);
            let Ok(list) = store.load(list_name) else {
                reporter.warn(&format!("{list_name}: skipped in reminders, no readable state"));
                continue;
            };
            for subscriber in list.subscribers() {
                if subscriber.flags.suppress_password_reminder {
                    continue;
                }
                by_address
                    .entry(subscriber.key())
                    .or_default()
                    .push((list_name.clone(), subscriber.password.clone()));
            }
        }

        for (address, memberships) in &by_address {
            let mut body = format!("Auto-Submitted: auto-generated\nYour password reminder for {host}:\n\n");
            for (list_name, password) in memberships {
                body.push_str(&format!("  {list_name}: {password}\n"));
            }

            let mut meta = QueueMetadata::new();
            meta.set(meta_keys::LISTNAME, self.config.site_list.clone());
            meta.set("recipient", address.clone());
            QueueName::Virgin.open(&self.config)?.enqueue(Message::new(body.into_bytes()), meta)?;
        }
        reporter.info(&format!("{host}: sent {} password reminder(s)", by_address.len()));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// NNTPGate
// ---------------------------------------------------------------------

/// Narrow seam over an NNTP connection; actual network I/O is
/// explicitly out of scope for the core, same framing as `Deliverer`
/// and `Archiver` in `mailman-runner`.
pub trait NntpSource {
    /// Fetch every article numbered strictly after `watermark` on
    /// `server`, returning `(article_number, raw_bytes)` pairs.
    fn fetch(&mut self, server: &str, watermark: u64) -> Result<Vec<(u64, Vec<u8>)>>;
}

/// Pulls new articles from USENET into the `incoming` queue,
/// rejecting anything that has already looped through this list.
pub struct NntpGate {
    config: Config,
}

impl NntpGate {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn gate_list(
        &self,
        list_name: &str,
        server: &str,
        source: &mut dyn NntpSource,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let store = store_for(&self.config, list_name);
        let accepted = with_locked_list(&self.config, &store, list_name, |list| {
            let watermark = list.usenet_watermark.unwrap_or(0);
            let list_address = list.list_address();
            let fetched = source.fetch(server, watermark)?;

            let mut accepted = Vec::new();
            let mut max_seen = watermark;
            for (number, raw) in fetched {
                max_seen = max_seen.max(number);
                if been_there(&raw, &list_address) {
                    continue;
                }
                accepted.push(raw);
            }
            list.usenet_watermark = Some(max_seen);
            Ok(accepted)
        })?;

        let accepted_count = accepted.len();
        for raw in accepted {
            let mut meta = QueueMetadata::new();
            meta.set(meta_keys::LISTNAME, list_name.to_string());
            QueueName::Incoming.open(&self.config)?.enqueue(Message::new(raw), meta)?;
        }
        reporter.info(&format!("{list_name}: gated {accepted_count} article(s) from {server}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailman_runner::NullReporter;
    use mailman_types::{List, Subscriber};
    use tempfile::tempdir;

    fn test_config(root: &std::path::Path) -> Config {
        Config { prefix: root.to_path_buf(), ..Config::default() }
    }

    #[test]
    fn digest_dispatch_skips_lists_without_digest_enabled() {
        let td = tempdir().unwrap();
        let config = test_config(td.path());
        let store = store_for(&config, "projects");
        store.save(&List::new("projects", "example.com")).unwrap();

        let dispatch = DigestDispatch::new(config.clone());
        let mut reporter = NullReporter;
        dispatch.run(&["projects".to_string()], &mut reporter);

        let virgin_q = QueueName::Virgin.open(&config).unwrap();
        assert!(virgin_q.is_empty().unwrap());
    }

    #[test]
    fn digest_dispatch_sends_and_bumps_issue() {
        let td = tempdir().unwrap();
        let config = test_config(td.path());
        let store = store_for(&config, "projects");
        let mut list = List::new("projects", "example.com");
        list.digest.enabled = true;
        store.save(&list).unwrap();

        let dispatch = DigestDispatch::new(config.clone());
        let mut reporter = NullReporter;
        dispatch.run(&["projects".to_string()], &mut reporter);

        let loaded = store.load("projects").unwrap();
        assert_eq!(loaded.digest.issue, 2);

        let virgin_q = QueueName::Virgin.open(&config).unwrap();
        assert_eq!(virgin_q.all_files().unwrap().len(), 1);
    }

    #[test]
    fn digest_dispatch_continues_past_a_missing_list() {
        let td = tempdir().unwrap();
        let config = test_config(td.path());
        let store = store_for(&config, "real");
        let mut list = List::new("real", "example.com");
        list.digest.enabled = true;
        store.save(&list).unwrap();

        let dispatch = DigestDispatch::new(config.clone());
        let mut reporter = NullReporter;
        // "ghost" has no saved state; dispatch must still process "real".
        dispatch.run(&["ghost".to_string(), "real".to_string()], &mut reporter);

        let loaded = store.load("real").unwrap();
        assert_eq!(loaded.digest.issue, 2);
    }

    #[test]
    fn volume_bump_resets_issue_counter() {
        let td = tempdir().unwrap();
        let config = test_config(td.path());
        let store = store_for(&config, "projects");
        let mut list = List::new("projects", "example.com");
        list.digest.enabled = true;
        list.digest.issue = 9;
        store.save(&list).unwrap();

        let bump = QueueVolumeBump::new(config);
        let mut reporter = NullReporter;
        bump.run(&["projects".to_string()], &mut reporter);

        let loaded = store.load("projects").unwrap();
        assert_eq!(loaded.digest.volume, 2);
        assert_eq!(loaded.digest.issue, 1);
    }

    #[test]
    fn password_reminders_honors_suppress_flag_and_dedupes_per_address() {
        let td = tempdir().unwrap();
        let config = test_config(td.path());

        let mut projects = List::new("projects", "example.com");
        let mut bob = Subscriber::new("bob@example.com");
        bob.password = "s3kret".to_string();
        projects.add_subscriber(bob);
        let mut carol = Subscriber::new("carol@example.com");
        carol.flags.suppress_password_reminder = true;
        projects.add_subscriber(carol);
        store_for(&config, "projects").save(&projects).unwrap();

        let mut social = List::new("social", "example.com");
        let mut bob2 = Subscriber::new("bob@example.com");
        bob2.password = "otherpass".to_string();
        social.add_subscriber(bob2);
        store_for(&config, "social").save(&social).unwrap();

        let reminders = PasswordReminders::new(config.clone());
        let mut reporter = NullReporter;
        reminders.run(&[("example.com".to_string(), vec!["projects".to_string(), "social".to_string()])], &mut reporter);

        let virgin_q = QueueName::Virgin.open(&config).unwrap();
        // exactly one reminder for bob, none for carol
        assert_eq!(virgin_q.all_files().unwrap().len(), 1);
    }

    struct FixedNntp {
        articles: Vec<(u64, Vec<u8>)>,
    }
    impl NntpSource for FixedNntp {
        fn fetch(&mut self, _server: &str, watermark: u64) -> Result<Vec<(u64, Vec<u8>)>> {
            Ok(self.articles.iter().filter(|(n, _)| *n > watermark).cloned().collect())
        }
    }

    #[test]
    fn nntp_gate_advances_watermark_and_rejects_looped_article() {
        let td = tempdir().unwrap();
        let config = test_config(td.path());
        let store = store_for(&config, "projects");
        store.save(&List::new("projects", "example.com")).unwrap();

        let mut source = FixedNntp {
            articles: vec![
                (1, b"Subject: fresh\r\n\r\nbody".to_vec()),
                (2, b"X-BeenThere: projects@example.com\r\n\r\nlooped".to_vec()),
            ],
        };

        let gate = NntpGate::new(config.clone());
        let mut reporter = NullReporter;
        gate.gate_list("projects", "news.example.com", &mut source, &mut reporter).unwrap();

        let loaded = store.load("projects").unwrap();
        assert_eq!(loaded.usenet_watermark, Some(2));

        let incoming_q = QueueName::Incoming.open(&config).unwrap();
        assert_eq!(incoming_q.all_files().unwrap().len(), 1);
    }
}
