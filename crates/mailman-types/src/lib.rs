//! Domain types for the mailing-list engine.
//!
//! Every persisted document carries a `schema_version` tag following
//! `mailman.<kind>.vN`, the same convention the state-store crate uses
//! for its own receipts. There is no in-band class identity the way a
//! pickled object carries one — callers decode the tag and pick the
//! matching struct, forward-compatibly.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for list documents.
pub const LIST_SCHEMA_VERSION: u32 = 1;
/// Current schema version for queue entries.
pub const QUEUE_SCHEMA_VERSION: u32 = 1;
/// Current schema version for held-message documents.
pub const HELD_SCHEMA_VERSION: u32 = 1;

/// Mint an opaque cookie for a pending request, re-enable notice, or
/// confirmation link. Random rather than timestamp-derived, so a
/// cookie can't be guessed by anyone who only knows roughly when it
/// was issued.
pub fn new_cookie() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------
// Subscriber / delivery status
// ---------------------------------------------------------------------

/// Delivery status of a subscriber. Exhausts the observable states a
/// subscriber may persist through a save/load round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Enabled,
    ByBounce,
    ByAdmin,
    ByUser,
    Unknown,
}

/// Per-subscriber option flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberFlags {
    #[serde(default)]
    pub digest: bool,
    #[serde(default)]
    pub plain_digest: bool,
    #[serde(default)]
    pub no_mail: bool,
    #[serde(default)]
    pub ack_posts: bool,
    #[serde(default)]
    pub suppress_password_reminder: bool,
    #[serde(default)]
    pub hide_address: bool,
}

/// A mailing-list subscriber.
///
/// The address is stored case-preserved for display; callers must key
/// maps of subscribers on [`Subscriber::key`], not on `address`
/// directly, to satisfy the case-normalization invariant of spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    address: String,
    pub full_name: Option<String>,
    pub password: String,
    pub language: String,
    pub delivery_status: DeliveryStatus,
    pub flags: SubscriberFlags,
    pub bounce_score: f64,
}

impl Subscriber {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            full_name: None,
            password: String::new(),
            language: "en".to_string(),
            delivery_status: DeliveryStatus::Enabled,
            flags: SubscriberFlags::default(),
            bounce_score: 0.0,
        }
    }

    /// The case-preserved address, as it should be displayed.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The normalized lookup key: lowercase of [`Subscriber::address`].
    pub fn key(&self) -> String {
        self.address.to_lowercase()
    }
}

// ---------------------------------------------------------------------
// Bounce scoring
// ---------------------------------------------------------------------

/// Per-bouncer scoring and notification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BounceInfo {
    pub score: f64,
    pub first_bounce_date: NaiveDate,
    pub cookie: String,
    pub notice_count: u32,
    pub last_notice_date: Option<NaiveDate>,
}

impl BounceInfo {
    pub fn new(today: NaiveDate, cookie: String) -> Self {
        Self {
            score: 0.0,
            first_bounce_date: today,
            cookie,
            notice_count: 0,
            last_notice_date: None,
        }
    }

    /// Has the record gone stale relative to `today`, given
    /// `stale_after` days?
    pub fn is_stale(&self, today: NaiveDate, stale_after_days: i64) -> bool {
        self.first_bounce_date + chrono::Duration::days(stale_after_days) < today
    }
}

// ---------------------------------------------------------------------
// Pending requests
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingRequestKind {
    Subscription,
    Unsubscription,
    ChangeOfAddress,
    HeldMessage,
    ReEnable,
}

/// A request awaiting administrator or confirmation-link action.
///
/// Identified by both a monotonically-assigned `id` (per list) and an
/// opaque `cookie` suitable for embedding in a confirmation URL — the
/// two are intentionally distinct so a leaked id cannot be used to
/// act on the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: u64,
    pub cookie: String,
    pub kind: PendingRequestKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl PendingRequest {
    /// Inclusive: a request expires exactly at `expires_at`, matching
    /// spec §8's boundary behavior for auto-discard at the hold limit.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------
// Held messages
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeldMessageDisposition {
    Held,
    Approved,
    Rejected,
    Discarded,
    Deferred,
}

/// A moderated post awaiting administrator disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeldMessage {
    #[serde(default = "default_held_schema_version")]
    pub schema_version: u32,
    pub id: u64,
    pub sender: String,
    pub subject: String,
    pub reason: String,
    pub received_at: DateTime<Utc>,
    pub raw: Vec<u8>,
    pub disposition: HeldMessageDisposition,
}

fn default_held_schema_version() -> u32 {
    HELD_SCHEMA_VERSION
}

impl HeldMessage {
    /// Terminal dispositions delete the underlying message artifact;
    /// `Deferred` and `Held` keep it around for a later sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.disposition,
            HeldMessageDisposition::Approved
                | HeldMessageDisposition::Rejected
                | HeldMessageDisposition::Discarded
        )
    }
}

// ---------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------

/// The well-known metadata keys every queue entry carries at minimum.
pub mod meta_keys {
    pub const LISTNAME: &str = "listname";
    pub const RECEIVED_TIME: &str = "received_time";
    pub const WHICHQ: &str = "whichq";
    pub const PARSEMSG: &str = "_parsemsg";
}

/// A raw message as carried through the queues. Bodies are kept as
/// bytes; header decoding (and any Latin-1/UTF-8 fallback) is left to
/// the handler that actually needs the text form, per the encoding
/// policy resolved in the expanded spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub raw: Vec<u8>,
}

impl Message {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }
}

/// Per-entry metadata map. Keyed freely by handlers; the keys in
/// [`meta_keys`] are the ones the Switchboard and `Incoming` runner
/// guarantee are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadata(pub std::collections::BTreeMap<String, serde_json::Value>);

impl QueueMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn listname(&self) -> Option<&str> {
        self.get(meta_keys::LISTNAME).and_then(|v| v.as_str())
    }

    pub fn whichq(&self) -> Option<&str> {
        self.get(meta_keys::WHICHQ).and_then(|v| v.as_str())
    }
}

/// One entry dequeued from a Switchboard: the message plus its
/// metadata, addressed by its filebase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(default = "default_queue_schema_version")]
    pub schema_version: u32,
    pub filebase: String,
    pub message: Message,
    pub metadata: QueueMetadata,
}

fn default_queue_schema_version() -> u32 {
    QUEUE_SCHEMA_VERSION
}

impl QueueEntry {
    pub fn new(filebase: String, message: Message, metadata: QueueMetadata) -> Self {
        Self { schema_version: QUEUE_SCHEMA_VERSION, filebase, message, metadata }
    }
}

// ---------------------------------------------------------------------
// List configuration
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPolicy {
    Open,
    ConfirmRequired,
    ModeratorApproval,
    ConfirmThenModerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationDefault {
    Accept,
    Hold,
    Reject,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestConfig {
    pub enabled: bool,
    pub volume: u32,
    pub issue: u32,
    #[serde(with = "humantime_serde_duration")]
    pub send_period: std::time::Duration,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            volume: 1,
            issue: 1,
            send_period: std::time::Duration::from_secs(24 * 3600),
        }
    }
}

/// A mailing list's full configuration and owned state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    name: String,
    pub host: String,
    pub display_name: String,
    pub owners: Vec<String>,
    pub moderators: Vec<String>,
    pub admin_password_hash: String,
    pub moderator_password_hash: String,
    pub preferred_language: String,
    pub subscription_policy: SubscriptionPolicy,
    pub moderation_default: ModerationDefault,
    pub digest: DigestConfig,
    pub bounce_threshold: f64,
    pub bounce_stale_after_days: i64,
    pub max_days_to_hold: i64,
    pub usenet_watermark: Option<u64>,

    subscribers: HashMap<String, Subscriber>,
    pending_requests: Vec<PendingRequest>,
    held_messages: Vec<HeldMessage>,
    bounce_info: HashMap<String, BounceInfo>,
    /// sender (lowercase) -> (date of last auto-reply, count today)
    autoresponse_counters: HashMap<String, (NaiveDate, u32)>,
    next_request_id: u64,
    next_held_id: u64,
}

fn default_schema_version() -> u32 {
    LIST_SCHEMA_VERSION
}

impl List {
    pub fn new(name: &str, host: &str) -> Self {
        Self {
            schema_version: LIST_SCHEMA_VERSION,
            name: name.to_lowercase(),
            host: host.to_string(),
            display_name: name.to_string(),
            owners: Vec::new(),
            moderators: Vec::new(),
            admin_password_hash: String::new(),
            moderator_password_hash: String::new(),
            preferred_language: "en".to_string(),
            subscription_policy: SubscriptionPolicy::ConfirmRequired,
            moderation_default: ModerationDefault::Hold,
            digest: DigestConfig::default(),
            bounce_threshold: 5.0,
            bounce_stale_after_days: 7,
            max_days_to_hold: 14,
            usenet_watermark: None,
            subscribers: HashMap::new(),
            pending_requests: Vec::new(),
            held_messages: Vec::new(),
            bounce_info: HashMap::new(),
            autoresponse_counters: HashMap::new(),
            next_request_id: 1,
            next_held_id: 1,
        }
    }

    /// The lowercase list name, used as the store key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<name>@<host>`.
    pub fn list_address(&self) -> String {
        format!("{}@{}", self.name, self.host)
    }

    // -- subscribers ----------------------------------------------------

    pub fn add_subscriber(&mut self, subscriber: Subscriber) {
        self.subscribers.insert(subscriber.key(), subscriber);
    }

    pub fn get_subscriber(&self, address: &str) -> Option<&Subscriber> {
        self.subscribers.get(&address.to_lowercase())
    }

    pub fn get_subscriber_mut(&mut self, address: &str) -> Option<&mut Subscriber> {
        self.subscribers.get_mut(&address.to_lowercase())
    }

    pub fn remove_subscriber(&mut self, address: &str) -> Option<Subscriber> {
        let key = address.to_lowercase();
        self.bounce_info.remove(&key);
        self.subscribers.remove(&key)
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Subscriber> {
        self.subscribers.values()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Set a subscriber's delivery status, maintaining the invariant
    /// that `ByBounce` always has a matching [`BounceInfo`] record:
    /// transitioning into `ByBounce` without one is a logic error the
    /// bounce engine must not trigger; transitioning away from it
    /// clears the record.
    pub fn set_delivery_status(
        &mut self,
        address: &str,
        status: DeliveryStatus,
    ) -> Option<()> {
        let key = address.to_lowercase();
        if status == DeliveryStatus::ByBounce && !self.bounce_info.contains_key(&key) {
            return None;
        }
        if status != DeliveryStatus::ByBounce {
            self.bounce_info.remove(&key);
        }
        let subscriber = self.subscribers.get_mut(&key)?;
        subscriber.delivery_status = status;
        Some(())
    }

    // -- bounce info ------------------------------------------------------

    pub fn bounce_info(&self, address: &str) -> Option<&BounceInfo> {
        self.bounce_info.get(&address.to_lowercase())
    }

    pub fn bounce_info_mut(&mut self, address: &str) -> Option<&mut BounceInfo> {
        self.bounce_info.get_mut(&address.to_lowercase())
    }

    pub fn set_bounce_info(&mut self, address: &str, info: BounceInfo) {
        self.bounce_info.insert(address.to_lowercase(), info);
    }

    pub fn clear_bounce_info(&mut self, address: &str) {
        self.bounce_info.remove(&address.to_lowercase());
    }

    pub fn bounce_records(&self) -> impl Iterator<Item = (&String, &BounceInfo)> {
        self.bounce_info.iter()
    }

    // -- pending requests -------------------------------------------------

    /// Create a new pending request, returning its freshly-assigned id
    /// and cookie.
    pub fn new_pending_request(
        &mut self,
        kind: PendingRequestKind,
        created_at: DateTime<Utc>,
        hold_days: i64,
        cookie: String,
        payload: serde_json::Value,
    ) -> (u64, String) {
        let id = self.next_request_id;
        self.next_request_id += 1;
        let expires_at = created_at + chrono::Duration::days(hold_days);
        self.pending_requests.push(PendingRequest {
            id,
            cookie: cookie.clone(),
            kind,
            created_at,
            expires_at,
            payload,
        });
        (id, cookie)
    }

    pub fn pending_requests(&self) -> &[PendingRequest] {
        &self.pending_requests
    }

    pub fn find_pending_by_cookie(&self, cookie: &str) -> Option<&PendingRequest> {
        self.pending_requests.iter().find(|r| r.cookie == cookie)
    }

    pub fn remove_pending(&mut self, id: u64) -> Option<PendingRequest> {
        let idx = self.pending_requests.iter().position(|r| r.id == id)?;
        Some(self.pending_requests.remove(idx))
    }

    /// Discard (and return) every pending request expired as of `now`.
    /// Matches spec §8: expiry at exactly `expires_at` counts.
    pub fn expire_pending_requests(&mut self, now: DateTime<Utc>) -> Vec<PendingRequest> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .pending_requests
            .drain(..)
            .partition(|r| r.is_expired(now));
        self.pending_requests = kept;
        expired
    }

    pub fn pending_count_by_kind(&self, kind: PendingRequestKind) -> usize {
        self.pending_requests.iter().filter(|r| r.kind == kind).count()
    }

    // -- held messages ------------------------------------------------------

    pub fn hold_message(
        &mut self,
        sender: &str,
        subject: &str,
        reason: &str,
        received_at: DateTime<Utc>,
        raw: Vec<u8>,
    ) -> u64 {
        let id = self.next_held_id;
        self.next_held_id += 1;
        self.held_messages.push(HeldMessage {
            schema_version: HELD_SCHEMA_VERSION,
            id,
            sender: sender.to_string(),
            subject: subject.to_string(),
            reason: reason.to_string(),
            received_at,
            raw,
            disposition: HeldMessageDisposition::Held,
        });
        id
    }

    pub fn held_messages(&self) -> &[HeldMessage] {
        &self.held_messages
    }

    pub fn held_message_mut(&mut self, id: u64) -> Option<&mut HeldMessage> {
        self.held_messages.iter_mut().find(|m| m.id == id)
    }

    /// Remove a held message by id, returning it if a terminal
    /// disposition allows deleting the artifact.
    pub fn take_held_message(&mut self, id: u64) -> Option<HeldMessage> {
        let idx = self.held_messages.iter().position(|m| m.id == id)?;
        Some(self.held_messages.remove(idx))
    }

    pub fn held_count(&self) -> usize {
        self.held_messages
            .iter()
            .filter(|m| m.disposition == HeldMessageDisposition::Held)
            .count()
    }

    // -- autoresponse loop prevention --------------------------------------

    /// Record (and cap) an auto-reply to `sender` for `today`. Returns
    /// the count after incrementing.
    pub fn record_autoresponse(&mut self, sender: &str, today: NaiveDate) -> u32 {
        let key = sender.to_lowercase();
        let entry = self
            .autoresponse_counters
            .entry(key)
            .or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        entry.1 += 1;
        entry.1
    }

    /// Evict autoresponse counters older than `today` (a rolling
    /// one-day window).
    pub fn evict_stale_autoresponses(&mut self, today: NaiveDate) -> usize {
        let before = self.autoresponse_counters.len();
        self.autoresponse_counters.retain(|_, (date, _)| *date >= today);
        before - self.autoresponse_counters.len()
    }
}

/// `humantime_serde`-style (de)serializer scoped to a plain
/// `std::time::Duration` field, matching the convention
/// `shipper-retry` uses for its own duration fields.
mod humantime_serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn subscriber_key_is_lowercase() {
        let s = Subscriber::new("Alice@Example.COM");
        assert_eq!(s.address(), "Alice@Example.COM");
        assert_eq!(s.key(), "alice@example.com");
    }

    #[test]
    fn list_address_combines_name_and_host() {
        let list = List::new("Projects", "example.com");
        assert_eq!(list.name(), "projects");
        assert_eq!(list.list_address(), "projects@example.com");
    }

    #[test]
    fn add_and_get_subscriber_is_case_insensitive() {
        let mut list = List::new("projects", "example.com");
        list.add_subscriber(Subscriber::new("Bob@Example.com"));
        assert!(list.get_subscriber("bob@example.com").is_some());
        assert!(list.get_subscriber("BOB@EXAMPLE.COM").is_some());
    }

    #[test]
    fn set_delivery_status_bybounce_requires_bounce_info() {
        let mut list = List::new("projects", "example.com");
        list.add_subscriber(Subscriber::new("bob@example.com"));

        assert!(
            list.set_delivery_status("bob@example.com", DeliveryStatus::ByBounce)
                .is_none()
        );

        list.set_bounce_info(
            "bob@example.com",
            BounceInfo::new(now().date_naive(), "cookie".to_string()),
        );
        assert!(
            list.set_delivery_status("bob@example.com", DeliveryStatus::ByBounce)
                .is_some()
        );
        assert_eq!(
            list.get_subscriber("bob@example.com").unwrap().delivery_status,
            DeliveryStatus::ByBounce
        );
    }

    #[test]
    fn set_delivery_status_away_from_bybounce_clears_record() {
        let mut list = List::new("projects", "example.com");
        list.add_subscriber(Subscriber::new("bob@example.com"));
        list.set_bounce_info(
            "bob@example.com",
            BounceInfo::new(now().date_naive(), "cookie".to_string()),
        );
        list.set_delivery_status("bob@example.com", DeliveryStatus::ByBounce);

        list.set_delivery_status("bob@example.com", DeliveryStatus::Enabled);
        assert!(list.bounce_info("bob@example.com").is_none());
    }

    #[test]
    fn pending_request_expiry_is_inclusive() {
        let mut list = List::new("projects", "example.com");
        let created = now();
        let (id, _cookie) = list.new_pending_request(
            PendingRequestKind::HeldMessage,
            created,
            14,
            "cookie-1".to_string(),
            serde_json::json!({}),
        );

        let at_boundary = created + chrono::Duration::days(14);
        let expired = list.expire_pending_requests(at_boundary);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
        assert!(list.pending_requests().is_empty());
    }

    #[test]
    fn pending_request_not_yet_expired_is_kept() {
        let mut list = List::new("projects", "example.com");
        let created = now();
        list.new_pending_request(
            PendingRequestKind::Subscription,
            created,
            14,
            "cookie-2".to_string(),
            serde_json::json!({}),
        );

        let before_boundary = created + chrono::Duration::days(13);
        let expired = list.expire_pending_requests(before_boundary);
        assert!(expired.is_empty());
        assert_eq!(list.pending_requests().len(), 1);
    }

    #[test]
    fn hold_and_dispose_message() {
        let mut list = List::new("projects", "example.com");
        let id = list.hold_message("eve@example.com", "hello", "non-member post", now(), b"raw".to_vec());
        assert_eq!(list.held_count(), 1);

        let msg = list.held_message_mut(id).unwrap();
        msg.disposition = HeldMessageDisposition::Approved;
        assert!(msg.is_terminal());
        assert_eq!(list.held_count(), 0);

        let taken = list.take_held_message(id).unwrap();
        assert_eq!(taken.sender, "eve@example.com");
    }

    #[test]
    fn autoresponse_counter_resets_on_new_day() {
        let mut list = List::new("projects", "example.com");
        let day1 = now().date_naive();
        let day2 = day1 + chrono::Duration::days(1);

        assert_eq!(list.record_autoresponse("bouncer@example.com", day1), 1);
        assert_eq!(list.record_autoresponse("bouncer@example.com", day1), 2);
        assert_eq!(list.record_autoresponse("bouncer@example.com", day2), 1);
    }

    #[test]
    fn evict_stale_autoresponses_removes_old_entries() {
        let mut list = List::new("projects", "example.com");
        let day1 = now().date_naive();
        let day2 = day1 + chrono::Duration::days(1);
        list.record_autoresponse("a@example.com", day1);

        let evicted = list.evict_stale_autoresponses(day2);
        assert_eq!(evicted, 1);
    }

    #[test]
    fn bounce_info_staleness() {
        let info = BounceInfo::new(now().date_naive(), "c".to_string());
        let just_inside = now().date_naive() + chrono::Duration::days(7);
        let just_outside = now().date_naive() + chrono::Duration::days(8);
        assert!(!info.is_stale(just_inside, 7));
        assert!(info.is_stale(just_outside, 7));
    }

    #[test]
    fn queue_metadata_roundtrips_through_json() {
        let mut meta = QueueMetadata::new();
        meta.set(meta_keys::LISTNAME, "projects@example.com");
        meta.set(meta_keys::WHICHQ, "incoming");

        let json = serde_json::to_string(&meta).unwrap();
        let back: QueueMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.listname(), Some("projects@example.com"));
        assert_eq!(back.whichq(), Some("incoming"));
    }

    #[test]
    fn queue_entry_carries_current_schema_version() {
        let entry = QueueEntry::new("123.abc".to_string(), Message::new(b"hi".to_vec()), QueueMetadata::new());
        assert_eq!(entry.schema_version, QUEUE_SCHEMA_VERSION);

        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schema_version, QUEUE_SCHEMA_VERSION);
    }

    #[test]
    fn queue_entry_missing_schema_version_defaults_on_load() {
        let json = r#"{"filebase":"1.x","message":{"raw":[104,105]},"metadata":{}}"#;
        let entry: QueueEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.schema_version, QUEUE_SCHEMA_VERSION);
    }

    #[test]
    fn held_message_carries_current_schema_version() {
        let mut list = List::new("projects", "example.com");
        let id = list.hold_message("eve@example.com", "hi", "spam", now(), b"raw".to_vec());
        let held = list.held_message_mut(id).unwrap();
        assert_eq!(held.schema_version, HELD_SCHEMA_VERSION);

        let json = serde_json::to_string(held).unwrap();
        let back: HeldMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schema_version, HELD_SCHEMA_VERSION);
    }

    #[test]
    fn list_round_trips_through_json() {
        let mut list = List::new("projects", "example.com");
        list.add_subscriber(Subscriber::new("bob@example.com"));
        list.digest.enabled = true;

        let json = serde_json::to_string(&list).unwrap();
        let back: List = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "projects");
        assert_eq!(back.subscriber_count(), 1);
        assert!(back.digest.enabled);
    }
}
