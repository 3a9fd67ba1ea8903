//! Queue-consuming runners and the handler-chain contract that the
//! concrete runners (`Incoming`, `Pipeline`, `Outgoing`, ...) wire up.
//!
//! `Runner` is the abstract per-queue contract; a [`QueueRunner`]
//! drives any `Runner` through the scan/dequeue/dispose/finish loop,
//! grounded on the retry-and-continue control flow of
//! `shipper::engine_parallel::publish_package`. `Reporter` is the same
//! minimal logging seam `shipper::engine` uses instead of a logging
//! crate.
//!
//! SMTP delivery, NNTP transport, and archival are genuinely external
//! collaborators (spec's own framing): this crate defines narrow
//! [`Deliverer`] and [`Archiver`] traits for them rather than
//! implementing network protocols itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use mailman_config::Config;
use mailman_lock::{AcquireOptions, FileLock};
use mailman_queue::Switchboard;
use mailman_store::MessageStore;
use mailman_types::{List, Message, QueueEntry, QueueMetadata, meta_keys};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A [`Reporter`] that discards everything; useful in tests and for
/// callers that only want the return value.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Every queue directory a runner may read from or write into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Incoming,
    Pipeline,
    Outgoing,
    Bounce,
    Virgin,
    Command,
    News,
    Retry,
    Archive,
    Shunt,
    Bad,
}

impl QueueName {
    pub fn dir_name(self) -> &'static str {
        match self {
            QueueName::Incoming => "incoming",
            QueueName::Pipeline => "pipeline",
            QueueName::Outgoing => "outgoing",
            QueueName::Bounce => "bounce",
            QueueName::Virgin => "virgin",
            QueueName::Command => "command",
            QueueName::News => "news",
            QueueName::Retry => "retry",
            QueueName::Archive => "archive",
            QueueName::Shunt => "shunt",
            QueueName::Bad => "bad",
        }
    }

    pub fn open(self, config: &Config) -> std::io::Result<Switchboard> {
        Switchboard::new(config.queue_dir(self.dir_name()))
    }
}

// ---------------------------------------------------------------------
// Handler chain (Incoming / Pipeline style concrete runners)
// ---------------------------------------------------------------------

/// What a single handler in a chain decided for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Keep running the next handler in the chain.
    Continue,
    /// Stop the chain; the entry stays wherever it currently sits
    /// (the last handler that moved it is responsible for that).
    Halt,
    /// Terminate processing silently — not an error, not shunted.
    Discard,
    /// Stop the chain and move the entry onto another queue.
    Requeue(QueueName),
}

/// One link in a handler chain. Handlers share a uniform interface
/// instead of an inheritance hierarchy, per the resolved Open Question
/// on metadata-key ownership: each handler owns exactly the keys it
/// documents writing; `whichq` belongs to the Switchboard alone.
pub trait Handler {
    fn name(&self) -> &str;

    fn handle(&self, list: &mut List, message: &mut Message, metadata: &mut QueueMetadata) -> Result<Decision>;
}

/// A linear sequence of handlers run in order until one signals
/// `Halt`, `Discard`, or `Requeue`.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn Handler + Send + Sync>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, handler: impl Handler + Send + Sync + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Run every handler in order. Returns the terminal decision; an
    /// exhausted chain with no terminal decision reports `Halt`.
    pub fn run(
        &self,
        list: &mut List,
        message: &mut Message,
        metadata: &mut QueueMetadata,
        reporter: &mut dyn Reporter,
    ) -> Result<Decision> {
        for handler in &self.handlers {
            match handler.handle(list, message, metadata)? {
                Decision::Continue => continue,
                other => {
                    reporter.info(&format!("handler {} terminated chain with {other:?}", handler.name()));
                    return Ok(other);
                }
            }
        }
        Ok(Decision::Halt)
    }
}

// ---------------------------------------------------------------------
// Runner contract
// ---------------------------------------------------------------------

/// What a dispatched entry resolved to, once any required requeue has
/// already happened. `Keep` matches the source's `KEEP`: the entry is
/// left on its queue (as a fresh `.pck`, not a dangling `.bak`) for a
/// later pass to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisposeOutcome {
    Done,
    Keep,
}

/// The abstract per-queue contract every concrete runner implements.
/// `run`/`do_periodic` mirror `_doperiodic`/`stop` from the source;
/// there are no underscore-prefixed pseudo-private methods here.
pub trait Runner {
    fn name(&self) -> &str;

    fn source_queue(&self) -> QueueName;

    /// Handle one already-dequeued entry. An `Err` return is caught by
    /// the driving [`QueueRunner`] and shunts the entry with the
    /// error annotated as the reason; handlers never shunt directly.
    fn dispose_one(&mut self, entry: &mut QueueEntry, reporter: &mut dyn Reporter) -> Result<DisposeOutcome>;

    /// Time-based side effects, invoked once per outer loop iteration
    /// regardless of whether the scan found any work.
    fn do_periodic(&mut self, _reporter: &mut dyn Reporter) {}
}

/// Drives any [`Runner`] through scan -> dequeue -> dispose -> finish,
/// handling crash recovery and the cooperative stop flag. Grounded on
/// `shipper::engine_parallel::publish_package`'s per-item
/// try/catch-and-continue loop, applied here per-queue-entry.
pub struct QueueRunner<R: Runner> {
    runner: R,
    source: Switchboard,
    shunt: Switchboard,
    bad_dir: PathBuf,
    slice: u32,
    range: u32,
    empty_sleep: Duration,
    stop_requested: bool,
}

impl<R: Runner> QueueRunner<R> {
    pub fn new(runner: R, config: &Config, slice: u32, range: u32) -> std::io::Result<Self> {
        let source = runner.source_queue().open(config)?;
        let shunt = QueueName::Shunt.open(config)?;
        Ok(Self {
            runner,
            source,
            shunt,
            bad_dir: config.queue_dir("bad"),
            slice,
            range,
            empty_sleep: Duration::from_secs(1),
            stop_requested: false,
        })
    }

    pub fn with_empty_sleep(mut self, sleep: Duration) -> Self {
        self.empty_sleep = sleep;
        self
    }

    /// `SIGTERM`/`SIGINT` handling lands here: finish the current
    /// entry, then exit the loop.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_requested
    }

    /// Reclaim orphaned `.bak`/`.pck.tmp` files left by a prior crash,
    /// then process exactly the filebases visible right now.
    pub fn run_once(&mut self, reporter: &mut dyn Reporter) -> Result<usize> {
        self.source.recover_backup_files()?;
        self.source.gc_orphaned_tmp()?;

        let filebases = self.source.files(self.slice, self.range)?;
        if filebases.is_empty() {
            self.runner.do_periodic(reporter);
            return Ok(0);
        }

        let mut processed = 0;
        for filebase in filebases {
            if self.stop_requested {
                break;
            }
            self.process_one(&filebase, reporter)?;
            processed += 1;
        }
        self.runner.do_periodic(reporter);
        Ok(processed)
    }

    fn process_one(&mut self, filebase: &str, reporter: &mut dyn Reporter) -> Result<()> {
        let Some(mut entry) = self.source.dequeue(filebase)? else {
            // Unparseable: caller shunts the raw .bak directly.
            reporter.error(&format!("unparseable entry {filebase}, moving to bad"));
            std::fs::create_dir_all(&self.bad_dir)?;
            let bak = self.source.dir().join(format!("{filebase}.bak"));
            if bak.exists() {
                std::fs::rename(bak, self.bad_dir.join(format!("{filebase}.bak")))?;
            }
            return Ok(());
        };

        match self.runner.dispose_one(&mut entry, reporter) {
            Ok(DisposeOutcome::Done) => {
                self.source.finish(filebase, None)?;
            }
            Ok(DisposeOutcome::Keep) => {
                // Re-enqueue a fresh copy so the next pass re-attempts
                // it; finish the now-empty .bak.
                self.source.enqueue(entry.message, entry.metadata)?;
                self.source.finish(filebase, None)?;
            }
            Err(err) => {
                reporter.error(&format!("{} failed on {filebase}: {err:#}", self.runner.name()));
                self.source.shunt(&self.shunt, filebase, entry, &err.to_string())?;
            }
        }
        Ok(())
    }

    /// Loop until stopped: empty scans sleep rather than busy-loop,
    /// matching the boundary behavior the spec calls out explicitly.
    pub fn run(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        while !self.stop_requested {
            let processed = self.run_once(reporter)?;
            if processed == 0 {
                std::thread::sleep(self.empty_sleep);
            }
        }
        Ok(())
    }

    /// `--once`: a single pass, then signal stop regardless of result.
    pub fn run_single_pass(&mut self, reporter: &mut dyn Reporter) -> Result<usize> {
        let processed = self.run_once(reporter)?;
        self.stop_requested = true;
        Ok(processed)
    }
}

// ---------------------------------------------------------------------
// List access helper shared by every handler that mutates list state
// ---------------------------------------------------------------------

/// Acquire a list's lock, load it, run `f`, save on success, always
/// release. Every runner or periodic task that mutates a list goes
/// through this, per the shared-resource policy in the spec.
pub fn with_locked_list<T>(
    config: &Config,
    store: &MessageStore,
    list_name: &str,
    f: impl FnOnce(&mut List) -> Result<T>,
) -> Result<T> {
    let lock_opts = AcquireOptions {
        lease: config.lock.lease,
        timeout: config.lock.timeout,
        retry_interval: config.lock.retry_interval,
        allow_cross_host_break: false,
    };
    let lock = FileLock::acquire(&config.list_lock_path(list_name), &lock_opts)?;
    let mut list = store.load(list_name)?;
    let result = f(&mut list);
    if result.is_ok() {
        store.save(&list)?;
    }
    lock.release()?;
    result
}

// ---------------------------------------------------------------------
// External collaborators (narrow interfaces, not implemented here)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// SMTP 4xx-class: caller requeues to `retry`.
    Transient,
    /// SMTP 5xx-class per recipient: caller synthesizes a DSN onto
    /// `bounce`.
    Permanent,
}

#[derive(Debug, thiserror::Error)]
#[error("delivery error: {0}")]
pub struct DeliveryError(pub String);

/// SMTP delivery is explicitly out of scope for the core; this is the
/// narrow seam `Outgoing`/`Virgin` dispatch through.
pub trait Deliverer {
    fn deliver(&mut self, message: &Message, metadata: &QueueMetadata) -> Result<DeliveryOutcome, DeliveryError>;
}

/// Hand-off to the archiver collaborator (Pipermail/HyperArch
/// equivalent), likewise out of scope for the core.
pub trait Archiver {
    fn archive(&mut self, list_name: &str, message: &Message) -> Result<(), anyhow::Error>;
}

// ---------------------------------------------------------------------
// Concrete runners
// ---------------------------------------------------------------------

/// Decides list membership and moderation disposition, then routes to
/// `pipeline` or holds the message. Owns the `listname` and
/// `received_time` metadata keys.
pub struct Incoming {
    config: Config,
    store: MessageStore,
}

impl Incoming {
    pub fn new(config: Config, store: MessageStore) -> Self {
        Self { config, store }
    }
}

impl Runner for Incoming {
    fn name(&self) -> &str {
        "Incoming"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Incoming
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        entry.metadata.set(meta_keys::RECEIVED_TIME, Utc::now().to_rfc3339());

        let Some(listname) = entry.metadata.listname().map(str::to_string) else {
            anyhow::bail!("entry {} carries no listname", entry.filebase);
        };
        let list_name = listname.split('@').next().unwrap_or(&listname).to_string();

        let sender = sender_of(&entry.message).unwrap_or_default();
        let subject = subject_of(&entry.message).unwrap_or_default();
        let raw = entry.message.raw.clone();
        let route_to_pipeline = with_locked_list(&self.config, &self.store, &list_name, |list| {
            let is_subscriber = list.get_subscriber(&sender).is_some();
            if is_subscriber {
                Ok(true)
            } else {
                list.hold_message(&sender, &subject, "post from non-member", Utc::now(), raw);
                reporter.info(&format!("held non-member post from {sender} on {list_name}"));
                Ok(false)
            }
        })?;

        if route_to_pipeline {
            entry.metadata.set(meta_keys::WHICHQ, QueueName::Pipeline.dir_name());
            let pipeline = QueueName::Pipeline.open(&self.config)?;
            pipeline.enqueue(entry.message.clone(), entry.metadata.clone())?;
        }
        Ok(DisposeOutcome::Done)
    }
}

/// Runs cooking handlers under the list lock, then hands the entry to
/// `outgoing` (or wherever a handler requeued it).
pub struct Pipeline {
    config: Config,
    store: MessageStore,
    chain: HandlerChain,
}

impl Pipeline {
    pub fn new(config: Config, store: MessageStore, chain: HandlerChain) -> Self {
        Self { config, store, chain }
    }
}

impl Runner for Pipeline {
    fn name(&self) -> &str {
        "Pipeline"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Pipeline
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        let Some(listname) = entry.metadata.listname().map(str::to_string) else {
            anyhow::bail!("pipeline entry {} carries no listname", entry.filebase);
        };
        let list_name = listname.split('@').next().unwrap_or(&listname).to_string();

        let chain = &self.chain;
        let message = &mut entry.message;
        let metadata = &mut entry.metadata;
        let decision = with_locked_list(&self.config, &self.store, &list_name, |list| {
            chain.run(list, message, metadata, reporter)
        })?;

        match decision {
            Decision::Discard => Ok(DisposeOutcome::Done),
            Decision::Requeue(target) => {
                entry.metadata.set(meta_keys::WHICHQ, target.dir_name());
                target.open(&self.config)?.enqueue(entry.message.clone(), entry.metadata.clone())?;
                Ok(DisposeOutcome::Done)
            }
            Decision::Halt | Decision::Continue => {
                entry.metadata.set(meta_keys::WHICHQ, QueueName::Outgoing.dir_name());
                QueueName::Outgoing.open(&self.config)?.enqueue(entry.message.clone(), entry.metadata.clone())?;
                Ok(DisposeOutcome::Done)
            }
        }
    }
}

/// Converts entries into delivery attempts via an injected
/// [`Deliverer`], requeueing transient failures to `retry` and
/// synthesizing bounce entries for permanent per-recipient failures.
pub struct Outgoing<D: Deliverer> {
    config: Config,
    deliverer: D,
}

impl<D: Deliverer> Outgoing<D> {
    pub fn new(config: Config, deliverer: D) -> Self {
        Self { config, deliverer }
    }
}

impl<D: Deliverer> Runner for Outgoing<D> {
    fn name(&self) -> &str {
        "Outgoing"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Outgoing
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        match self.deliverer.deliver(&entry.message, &entry.metadata) {
            Ok(DeliveryOutcome::Delivered) => Ok(DisposeOutcome::Done),
            Ok(DeliveryOutcome::Transient) => {
                reporter.warn(&format!("transient delivery failure for {}, requeuing to retry", entry.filebase));
                entry.metadata.set(meta_keys::WHICHQ, QueueName::Retry.dir_name());
                QueueName::Retry.open(&self.config)?.enqueue(entry.message.clone(), entry.metadata.clone())?;
                Ok(DisposeOutcome::Done)
            }
            Ok(DeliveryOutcome::Permanent) => {
                entry.metadata.set(meta_keys::WHICHQ, QueueName::Bounce.dir_name());
                QueueName::Bounce.open(&self.config)?.enqueue(entry.message.clone(), entry.metadata.clone())?;
                Ok(DisposeOutcome::Done)
            }
            Err(e) => anyhow::bail!("delivery error: {e}"),
        }
    }
}

/// Parses DSN-shaped bodies (a crude but real heuristic: an RFC 3464
/// `Status:` field) and bumps the matched subscriber's bounce score.
/// Threshold-triggered disable is the daily `BounceEngine` sweep's
/// job, not this runner's — this only scores.
pub struct Bounce {
    config: Config,
    store: MessageStore,
}

impl Bounce {
    pub fn new(config: Config, store: MessageStore) -> Self {
        Self { config, store }
    }
}

impl Runner for Bounce {
    fn name(&self) -> &str {
        "Bounce"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Bounce
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, _reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        let Some(listname) = entry.metadata.listname().map(str::to_string) else {
            anyhow::bail!("bounce entry {} carries no listname", entry.filebase);
        };
        let list_name = listname.split('@').next().unwrap_or(&listname).to_string();

        let Some((address, increment)) = parse_dsn(&entry.message) else {
            anyhow::bail!("could not identify bounced recipient or status in {}", entry.filebase);
        };

        let today = Utc::now().date_naive();
        with_locked_list(&self.config, &self.store, &list_name, |list| {
            if list.get_subscriber(&address).is_none() {
                anyhow::bail!("bounced address {address} is not a subscriber of {list_name}");
            }
            if list.bounce_info(&address).is_none() {
                list.set_bounce_info(&address, mailman_types::BounceInfo::new(today, mailman_types::new_cookie()));
            }
            let info = list.bounce_info_mut(&address).expect("just ensured present");
            info.score += increment;
            Ok(())
        })?;

        Ok(DisposeOutcome::Done)
    }
}

/// Delivers Mailman-synthesized notices (admin summaries, warnings,
/// replies) — same transport seam as `Outgoing`, distinct queue.
pub struct Virgin<D: Deliverer> {
    deliverer: D,
}

impl<D: Deliverer> Virgin<D> {
    pub fn new(deliverer: D) -> Self {
        Self { deliverer }
    }
}

impl<D: Deliverer> Runner for Virgin<D> {
    fn name(&self) -> &str {
        "Virgin"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Virgin
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, _reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        match self.deliverer.deliver(&entry.message, &entry.metadata) {
            Ok(DeliveryOutcome::Delivered) => Ok(DisposeOutcome::Done),
            Ok(_) => Ok(DisposeOutcome::Keep),
            Err(e) => anyhow::bail!("{e}"),
        }
    }
}

/// Inbound USENET gating: reject anything already looped through this
/// list, otherwise hand it to `incoming` as a freshly-arrived post.
pub struct News {
    config: Config,
}

impl News {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Runner for News {
    fn name(&self) -> &str {
        "News"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::News
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        let Some(listname) = entry.metadata.listname().map(str::to_string) else {
            anyhow::bail!("news entry {} carries no listname", entry.filebase);
        };

        if been_there(&entry.message, &listname) {
            reporter.info(&format!("dropping looped article for {listname}: already bears X-BeenThere"));
            return Ok(DisposeOutcome::Done);
        }

        entry.metadata.set(meta_keys::WHICHQ, QueueName::Incoming.dir_name());
        QueueName::Incoming.open(&self.config)?.enqueue(entry.message.clone(), entry.metadata.clone())?;
        Ok(DisposeOutcome::Done)
    }
}

/// Delayed re-delivery: holds an entry until its `retry_not_before`
/// metadata timestamp has passed, then hands it back to `outgoing`.
pub struct Retry {
    config: Config,
}

impl Retry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Runner for Retry {
    fn name(&self) -> &str {
        "Retry"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Retry
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, _reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        let due = entry
            .metadata
            .get("retry_not_before")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match due {
            Some(not_before) if Utc::now() < not_before => Ok(DisposeOutcome::Keep),
            _ => {
                entry.metadata.set(meta_keys::WHICHQ, QueueName::Outgoing.dir_name());
                QueueName::Outgoing.open(&self.config)?.enqueue(entry.message.clone(), entry.metadata.clone())?;
                Ok(DisposeOutcome::Done)
            }
        }
    }
}

/// Hands accepted posts to the archiver collaborator.
pub struct Archive<A: Archiver> {
    archiver: A,
}

impl<A: Archiver> Archive<A> {
    pub fn new(archiver: A) -> Self {
        Self { archiver }
    }
}

impl<A: Archiver> Runner for Archive<A> {
    fn name(&self) -> &str {
        "Archive"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Archive
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, _reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        let listname = entry.metadata.listname().unwrap_or_default().to_string();
        self.archiver.archive(&listname, &entry.message)?;
        Ok(DisposeOutcome::Done)
    }
}

/// Email-command interface (`-request` address): a minimal grammar
/// over `subscribe`/`unsubscribe`/`help`, replying via `virgin`.
pub struct Command {
    config: Config,
    store: MessageStore,
}

impl Command {
    pub fn new(config: Config, store: MessageStore) -> Self {
        Self { config, store }
    }
}

impl Runner for Command {
    fn name(&self) -> &str {
        "Command"
    }

    fn source_queue(&self) -> QueueName {
        QueueName::Command
    }

    fn dispose_one(&mut self, entry: &mut QueueEntry, reporter: &mut dyn Reporter) -> Result<DisposeOutcome> {
        let Some(listname) = entry.metadata.listname().map(str::to_string) else {
            anyhow::bail!("command entry {} carries no listname", entry.filebase);
        };
        let list_name = listname.split('@').next().unwrap_or(&listname).to_string();
        let sender = sender_of(&entry.message).unwrap_or_default();
        let body = String::from_utf8_lossy(&entry.message.raw).to_string();
        let command_line = body.lines().find(|l| !l.trim().is_empty()).unwrap_or("help").trim().to_lowercase();

        let reply_body = with_locked_list(&self.config, &self.store, &list_name, |list| {
            Ok(match command_line.split_whitespace().next().unwrap_or("help") {
                "subscribe" => {
                    if list.get_subscriber(&sender).is_none() {
                        list.add_subscriber(mailman_types::Subscriber::new(&sender));
                    }
                    format!("you are now subscribed to {list_name}")
                }
                "unsubscribe" => {
                    list.remove_subscriber(&sender);
                    format!("you have been unsubscribed from {list_name}")
                }
                _ => format!("commands: subscribe, unsubscribe (list: {list_name})"),
            })
        })?;

        reporter.info(&format!("command '{command_line}' from {sender} on {list_name}"));
        let mut reply_meta = QueueMetadata::new();
        reply_meta.set(meta_keys::LISTNAME, listname);
        let virgin = QueueName::Virgin.open(&self.config)?;
        virgin.enqueue(Message::new(reply_body.into_bytes()), reply_meta)?;
        Ok(DisposeOutcome::Done)
    }
}

// ---------------------------------------------------------------------
// Tiny header helpers (not a MIME parser; real header decoding is a
// handler's job, same boundary mailman-types::Message documents).
// ---------------------------------------------------------------------

fn header_value<'a>(raw: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(raw).ok()?;
    let prefix = format!("{name}:");
    for line in text.lines() {
        if let Some(rest) = line.to_lowercase().strip_prefix(&prefix.to_lowercase()) {
            let start = prefix.len();
            return Some(line[start..].trim());
        }
    }
    None
}

fn sender_of(message: &Message) -> Option<String> {
    header_value(&message.raw, "From").map(|s| s.trim().to_lowercase())
}

fn subject_of(message: &Message) -> Option<String> {
    header_value(&message.raw, "Subject").map(str::to_string)
}

fn been_there(message: &Message, listname: &str) -> bool {
    header_value(&message.raw, "X-BeenThere").is_some_and(|v| v.eq_ignore_ascii_case(listname))
}

/// Heuristic DSN parse: a `Final-Recipient:` header names the bounced
/// address, `Status:` starting with `5` is a hard bounce (+1.0),
/// starting with `4` a soft bounce (+0.5).
fn parse_dsn(message: &Message) -> Option<(String, f64)> {
    let address = header_value(&message.raw, "Final-Recipient")
        .map(|v| v.rsplit(';').next().unwrap_or(v).trim().to_lowercase())?;
    let status = header_value(&message.raw, "Status")?;
    let increment = if status.starts_with('5') {
        1.0
    } else if status.starts_with('4') {
        0.5
    } else {
        return None;
    };
    Some((address, increment))
}
