//! Daily per-list bounce sweep.
//!
//! Scoring itself happens in `mailman-runner`'s `Bounce` runner as
//! each DSN arrives; this crate is the wall-clock housekeeper that
//! acts on the accumulated scores — stale-record recovery, threshold
//! disable, the warning ladder, and eventual auto-unsubscribe. Every
//! mutation happens under the list lock via
//! `mailman_runner::with_locked_list`, same as `mailman-moderation`.

use anyhow::Result;
use chrono::NaiveDate;
use mailman_config::Config;
use mailman_runner::{QueueName, Reporter, with_locked_list};
use mailman_store::MessageStore;
use mailman_types::{DeliveryStatus, Message, QueueMetadata, meta_keys, new_cookie};

pub struct BounceEngine {
    config: Config,
    store: MessageStore,
}

struct SweepActions {
    warned: Vec<String>,
    unsubscribed: Vec<String>,
}

impl BounceEngine {
    pub fn new(config: Config, store: MessageStore) -> Self {
        Self { config, store }
    }

    /// One daily pass over a single list.
    pub fn sweep_list(&self, list_name: &str, today: NaiveDate, reporter: &mut dyn Reporter) -> Result<()> {
        let threshold = self.config.bounce.threshold;
        let stale_after_days = self.config.bounce.stale_after_days;
        let warn_interval_days = (self.config.bounce.warn_interval.as_secs() / (24 * 3600)).max(1) as i64;
        let max_warnings = self.config.bounce.max_warnings;

        let actions = with_locked_list(&self.config, &self.store, list_name, |list| {
            // Stale-data recovery: BYBOUNCE with no matching record can
            // only be the result of a prior crash or manual edit.
            let orphaned: Vec<String> = list
                .subscribers()
                .filter(|s| s.delivery_status == DeliveryStatus::ByBounce && list.bounce_info(s.address()).is_none())
                .map(|s| s.key())
                .collect();
            for key in &orphaned {
                list.set_delivery_status(key, DeliveryStatus::Enabled);
                reporter.info(&format!("{list_name}: re-enabled {key}, BYBOUNCE with no bounce record"));
            }

            // Reset stale records, or transition over-threshold
            // subscribers still enabled into BYBOUNCE.
            let keys: Vec<String> = list.bounce_records().map(|(k, _)| k.clone()).collect();
            for key in &keys {
                let Some(info) = list.bounce_info(key) else { continue };
                if info.is_stale(today, stale_after_days) {
                    if let Some(info) = list.bounce_info_mut(key) {
                        info.score = 0.0;
                        info.first_bounce_date = today;
                        info.notice_count = 0;
                        info.last_notice_date = None;
                    }
                    reporter.info(&format!("{list_name}: reset stale bounce record for {key}"));
                    continue;
                }
                if info.score >= threshold {
                    let enabled = list.get_subscriber(key).map(|s| s.delivery_status) == Some(DeliveryStatus::Enabled);
                    if enabled {
                        list.set_delivery_status(key, DeliveryStatus::ByBounce);
                        if let Some(info) = list.bounce_info_mut(key) {
                            info.first_bounce_date = today;
                            info.notice_count = 0;
                        }
                        reporter.warn(&format!("{list_name}: disabled {key}, bounce score over threshold"));
                    }
                }
            }

            // Warning ladder: every BYBOUNCE subscriber due for a
            // notice gets one, minted with a fresh re-enable cookie;
            // anyone who has exhausted max_warnings is unsubscribed.
            let bybounce: Vec<String> = list
                .subscribers()
                .filter(|s| s.delivery_status == DeliveryStatus::ByBounce)
                .map(|s| s.key())
                .collect();

            let mut warned = Vec::new();
            let mut unsubscribed = Vec::new();
            for key in bybounce {
                let Some(info) = list.bounce_info(&key) else { continue };
                let next_due = match info.last_notice_date {
                    Some(last) => last + chrono::Duration::days(warn_interval_days),
                    None => info.first_bounce_date,
                };
                if today < next_due {
                    continue;
                }
                if info.notice_count >= max_warnings {
                    list.remove_subscriber(&key);
                    unsubscribed.push(key);
                    continue;
                }
                let cookie = new_cookie();
                if let Some(info) = list.bounce_info_mut(&key) {
                    info.cookie = cookie;
                    info.last_notice_date = Some(today);
                    info.notice_count += 1;
                }
                warned.push(key);
            }

            Ok(SweepActions { warned, unsubscribed })
        })?;

        for address in &actions.warned {
            self.send_notice(
                list_name,
                address,
                &format!("Your subscription to {list_name} has been disabled due to bounces from your address."),
            )?;
            reporter.info(&format!("{list_name}: sent disable warning to {address}"));
        }
        for address in &actions.unsubscribed {
            self.send_notice(
                list_name,
                address,
                &format!("You have been unsubscribed from {list_name} after repeated bounce warnings."),
            )?;
            reporter.warn(&format!("{list_name}: auto-unsubscribed {address} after exhausting bounce warnings"));
        }
        Ok(())
    }

    fn send_notice(&self, list_name: &str, address: &str, body: &str) -> Result<()> {
        let mut meta = QueueMetadata::new();
        meta.set(meta_keys::LISTNAME, list_name.to_string());
        meta.set("recipient", address.to_string());
        QueueName::Virgin.open(&self.config)?.enqueue(Message::new(body.as_bytes().to_vec()), meta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailman_runner::NullReporter;
    use mailman_types::{BounceInfo, List, Subscriber};
    use tempfile::tempdir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    fn test_engine(root: &std::path::Path) -> (BounceEngine, MessageStore, Config) {
        let config = Config { prefix: root.to_path_buf(), ..Config::default() };
        let store = MessageStore::new(config.list_data_dir("projects"));
        (BounceEngine::new(config.clone(), store.clone()), store, config)
    }

    #[test]
    fn orphaned_bybounce_is_re_enabled() {
        let td = tempdir().unwrap();
        let (engine, store, _config) = test_engine(td.path());
        let mut list = List::new("projects", "example.com");
        let mut sub = Subscriber::new("bob@example.com");
        sub.delivery_status = DeliveryStatus::ByBounce;
        list.add_subscriber(sub);
        store.save(&list).unwrap();

        let mut reporter = NullReporter;
        engine.sweep_list("projects", today(), &mut reporter).unwrap();

        let loaded = store.load("projects").unwrap();
        assert_eq!(loaded.get_subscriber("bob@example.com").unwrap().delivery_status, DeliveryStatus::Enabled);
    }

    #[test]
    fn stale_bounce_record_is_reset() {
        let td = tempdir().unwrap();
        let (engine, store, config) = test_engine(td.path());
        let mut list = List::new("projects", "example.com");
        list.add_subscriber(Subscriber::new("bob@example.com"));
        let mut info = BounceInfo::new(today() - chrono::Duration::days(30), "c".to_string());
        info.score = 9.0;
        list.set_bounce_info("bob@example.com", info);
        store.save(&list).unwrap();
        assert_eq!(config.bounce.stale_after_days, 7);

        let mut reporter = NullReporter;
        engine.sweep_list("projects", today(), &mut reporter).unwrap();

        let loaded = store.load("projects").unwrap();
        let info = loaded.bounce_info("bob@example.com").unwrap();
        assert_eq!(info.score, 0.0);
    }

    #[test]
    fn over_threshold_score_transitions_to_bybounce() {
        let td = tempdir().unwrap();
        let (engine, store, config) = test_engine(td.path());
        let mut list = List::new("projects", "example.com");
        list.add_subscriber(Subscriber::new("bob@example.com"));
        let mut info = BounceInfo::new(today(), "c".to_string());
        info.score = config.bounce.threshold;
        list.set_bounce_info("bob@example.com", info);
        store.save(&list).unwrap();

        let mut reporter = NullReporter;
        engine.sweep_list("projects", today(), &mut reporter).unwrap();

        let loaded = store.load("projects").unwrap();
        assert_eq!(loaded.get_subscriber("bob@example.com").unwrap().delivery_status, DeliveryStatus::ByBounce);
    }

    #[test]
    fn due_warning_is_sent_and_notice_count_increments() {
        let td = tempdir().unwrap();
        let (engine, store, config) = test_engine(td.path());
        let mut list = List::new("projects", "example.com");
        let mut sub = Subscriber::new("bob@example.com");
        sub.delivery_status = DeliveryStatus::ByBounce;
        list.add_subscriber(sub);
        list.set_bounce_info("bob@example.com", BounceInfo::new(today(), "c".to_string()));
        store.save(&list).unwrap();

        let mut reporter = NullReporter;
        engine.sweep_list("projects", today(), &mut reporter).unwrap();

        let loaded = store.load("projects").unwrap();
        let info = loaded.bounce_info("bob@example.com").unwrap();
        assert_eq!(info.notice_count, 1);
        assert_eq!(info.last_notice_date, Some(today()));

        let virgin_q = QueueName::Virgin.open(&config).unwrap();
        assert_eq!(virgin_q.all_files().unwrap().len(), 1);
    }

    #[test]
    fn exhausted_warnings_unsubscribes_address() {
        let td = tempdir().unwrap();
        let (engine, store, config) = test_engine(td.path());
        let mut list = List::new("projects", "example.com");
        let mut sub = Subscriber::new("bob@example.com");
        sub.delivery_status = DeliveryStatus::ByBounce;
        list.add_subscriber(sub);
        let mut info = BounceInfo::new(today() - chrono::Duration::days(1), "c".to_string());
        info.notice_count = config.bounce.max_warnings;
        list.set_bounce_info("bob@example.com", info);
        store.save(&list).unwrap();

        let mut reporter = NullReporter;
        engine.sweep_list("projects", today(), &mut reporter).unwrap();

        let loaded = store.load("projects").unwrap();
        assert!(loaded.get_subscriber("bob@example.com").is_none());

        let virgin_q = QueueName::Virgin.open(&config).unwrap();
        assert_eq!(virgin_q.all_files().unwrap().len(), 1);
    }

    #[test]
    fn not_yet_due_warning_is_skipped() {
        let td = tempdir().unwrap();
        let (engine, store, config) = test_engine(td.path());
        let mut list = List::new("projects", "example.com");
        let mut sub = Subscriber::new("bob@example.com");
        sub.delivery_status = DeliveryStatus::ByBounce;
        list.add_subscriber(sub);
        let mut info = BounceInfo::new(today(), "c".to_string());
        info.last_notice_date = Some(today());
        list.set_bounce_info("bob@example.com", info);
        store.save(&list).unwrap();

        let mut reporter = NullReporter;
        engine.sweep_list("projects", today(), &mut reporter).unwrap();

        let virgin_q = QueueName::Virgin.open(&config).unwrap();
        assert!(virgin_q.is_empty().unwrap());
    }
}
