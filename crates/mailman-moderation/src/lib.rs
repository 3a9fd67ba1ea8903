//! Held-message lifecycle, pending-request auto-discard, and
//! administrator notification — the periodic sweep described as
//! `ModerationEngine` alongside the per-action disposition path an
//! admin UI (out of scope here) would call directly.
//!
//! Every mutation happens under the list's lock via
//! `mailman_runner::with_locked_list`, matching the shared-resource
//! policy every other list-mutating component in this workspace
//! follows. Disposition side effects (enqueueing onto `pipeline` or
//! `virgin`, removing a held-message artifact) happen after the lock
//! is released, the same sequencing `Incoming` uses for its own
//! post-lock enqueue.

use anyhow::Result;
use chrono::{DateTime, Utc};
use mailman_config::Config;
use mailman_runner::{QueueName, Reporter, with_locked_list};
use mailman_store::MessageStore;
use mailman_types::{
    HeldMessage, HeldMessageDisposition, Message, PendingRequest, PendingRequestKind, QueueMetadata, meta_keys,
};

pub struct ModerationEngine {
    config: Config,
    store: MessageStore,
}

struct SweepOutcome {
    expired: Vec<PendingRequest>,
    terminal: Vec<HeldMessage>,
    open_subscriptions: usize,
    open_unsubscriptions: usize,
    open_held: Vec<(String, String, String, DateTime<Utc>)>,
}

impl ModerationEngine {
    pub fn new(config: Config, store: MessageStore) -> Self {
        Self { config, store }
    }

    /// One pass over a single list: auto-discard expired pending
    /// requests, evict stale autoresponse counters, finalize any
    /// held message left in a terminal disposition by a prior
    /// `decide_held_message` call (or recovered after a crash before
    /// finalization ran), and send an admin summary if anything
    /// remains open.
    pub fn sweep_list(&self, list_name: &str, now: DateTime<Utc>, reporter: &mut dyn Reporter) -> Result<()> {
        let today = now.date_naive();

        let outcome = with_locked_list(&self.config, &self.store, list_name, |list| {
            let expired = list.expire_pending_requests(now);
            list.evict_stale_autoresponses(today);

            let terminal_ids: Vec<u64> =
                list.held_messages().iter().filter(|m| m.is_terminal()).map(|m| m.id).collect();
            let mut terminal = Vec::new();
            for id in terminal_ids {
                if let Some(message) = list.take_held_message(id) {
                    terminal.push(message);
                }
            }

            let open_held = list
                .held_messages()
                .iter()
                .filter(|m| m.disposition == HeldMessageDisposition::Held)
                .map(|m| (m.sender.clone(), m.subject.clone(), m.reason.clone(), m.received_at))
                .collect();

            Ok(SweepOutcome {
                expired,
                terminal,
                open_subscriptions: list.pending_count_by_kind(PendingRequestKind::Subscription),
                open_unsubscriptions: list.pending_count_by_kind(PendingRequestKind::Unsubscription),
                open_held,
            })
        })?;

        if !outcome.expired.is_empty() {
            reporter.info(&format!(
                "{list_name}: auto-discarded {} expired pending request(s)",
                outcome.expired.len()
            ));
        }

        for message in &outcome.terminal {
            self.finalize_held_message(list_name, message, reporter)?;
        }

        let remaining = outcome.open_subscriptions + outcome.open_unsubscriptions + outcome.open_held.len();
        if remaining > 0 {
            self.notify_admin(
                list_name,
                outcome.open_subscriptions,
                outcome.open_unsubscriptions,
                &outcome.open_held,
                reporter,
            )?;
        }
        Ok(())
    }

    /// Apply an administrator's disposition to a held message. Non-
    /// terminal dispositions (`Deferred`) just record the choice;
    /// terminal ones (`Approved`/`Rejected`/`Discarded`) additionally
    /// remove the message from the list and finalize it immediately
    /// rather than waiting for the next sweep.
    pub fn decide_held_message(
        &self,
        list_name: &str,
        id: u64,
        disposition: HeldMessageDisposition,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let taken = with_locked_list(&self.config, &self.store, list_name, |list| {
            let message = list
                .held_message_mut(id)
                .ok_or_else(|| anyhow::anyhow!("no held message {id} on {list_name}"))?;
            message.disposition = disposition;
            if message.is_terminal() { Ok(list.take_held_message(id)) } else { Ok(None) }
        })?;

        if let Some(message) = taken {
            self.finalize_held_message(list_name, &message, reporter)?;
        }
        Ok(())
    }

    /// `HELD -> APPROVED` enqueues the original post onto `pipeline`
    /// and unlinks the artifact; `REJECTED` enqueues a rejection
    /// notice onto `virgin` and unlinks; `DISCARDED` only unlinks.
    /// `Held`/`Deferred` never reach here (not terminal).
    fn finalize_held_message(&self, list_name: &str, message: &HeldMessage, reporter: &mut dyn Reporter) -> Result<()> {
        match message.disposition {
            HeldMessageDisposition::Approved => {
                let mut meta = QueueMetadata::new();
                meta.set(meta_keys::LISTNAME, list_name.to_string());
                meta.set(meta_keys::WHICHQ, QueueName::Pipeline.dir_name());
                QueueName::Pipeline.open(&self.config)?.enqueue(Message::new(message.raw.clone()), meta)?;
                reporter.info(&format!("{list_name}: approved held message {} from {}", message.id, message.sender));
            }
            HeldMessageDisposition::Rejected => {
                let body = format!(
                    "Your message \"{}\" to {list_name} was rejected by the moderator: {}\n",
                    message.subject, message.reason
                );
                let mut meta = QueueMetadata::new();
                meta.set(meta_keys::LISTNAME, list_name.to_string());
                QueueName::Virgin.open(&self.config)?.enqueue(Message::new(body.into_bytes()), meta)?;
                reporter.info(&format!("{list_name}: rejected held message {} from {}", message.id, message.sender));
            }
            HeldMessageDisposition::Discarded => {
                reporter.info(&format!("{list_name}: discarded held message {}", message.id));
            }
            HeldMessageDisposition::Held | HeldMessageDisposition::Deferred => return Ok(()),
        }
        self.store.remove_held_message(list_name, message.id)?;
        Ok(())
    }

    fn notify_admin(
        &self,
        list_name: &str,
        open_subscriptions: usize,
        open_unsubscriptions: usize,
        held_items: &[(String, String, String, DateTime<Utc>)],
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let mut body = format!(
            "Pending requests for {list_name}:\n\n{open_subscriptions} subscription request(s)\n{open_unsubscriptions} unsubscription request(s)\n\nHeld messages:\n"
        );
        for (sender, subject, reason, received_at) in held_items {
            body.push_str(&format!("- {sender} / {subject} / {reason} / {}\n", received_at.to_rfc3339()));
        }

        let mut meta = QueueMetadata::new();
        meta.set(meta_keys::LISTNAME, list_name.to_string());
        QueueName::Virgin.open(&self.config)?.enqueue(Message::new(body.into_bytes()), meta)?;
        reporter.info(&format!(
            "{list_name}: sent moderation summary ({open_subscriptions} sub, {open_unsubscriptions} unsub, {} held)",
            held_items.len()
        ));
        Ok(())
    }
}
