//! Switchboard: a durable, directory-backed queue of `(Message,
//! Metadata)` entries with crash recovery and hash-partitioned
//! concurrent readers.
//!
//! Each entry is one file, `<hex_now>+<hash>.pck`, holding a single
//! JSON-serialized [`mailman_types::QueueEntry`]. Dequeue renames the
//! file to `.bak`; finish unlinks it. A crashed reader therefore
//! leaves at most one `.bak` per taken entry, and a crashed writer
//! leaves at most one `.pck.tmp` — both are reclaimed by
//! [`Switchboard::recover_backup_files`] and
//! [`Switchboard::gc_orphaned_tmp`] respectively.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use mailman_types::{Message, QueueEntry, QueueMetadata};

const PCK: &str = "pck";
const BAK: &str = "bak";
const TMP: &str = "pck.tmp";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no such entry: {0}")]
    NotFound(String),
}

/// A durable queue directory.
#[derive(Debug, Clone)]
pub struct Switchboard {
    dir: PathBuf,
}

impl Switchboard {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, filebase: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{filebase}.{ext}"))
    }

    /// Write `(message, metadata)` durably, returning the assigned
    /// filebase. Two-step write: temp file, fsync, atomic rename.
    pub fn enqueue(
        &self,
        message: Message,
        metadata: QueueMetadata,
    ) -> Result<String, QueueError> {
        let filebase = make_filebase(&message, &metadata);
        let entry = QueueEntry::new(filebase.clone(), message, metadata);

        let tmp_path = self.path_for(&filebase, TMP);
        let json = serde_json::to_vec(&entry)?;
        {
            use std::io::Write;
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, self.path_for(&filebase, PCK))?;
        Ok(filebase)
    }

    /// Filebases whose hash falls into `slice` of `range`, partitioning
    /// the queue across `range` cooperating workers without any
    /// coordination between them.
    pub fn files(&self, slice: u32, range: u32) -> Result<Vec<String>, QueueError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(filebase) = name.strip_suffix(&format!(".{PCK}")) else { continue };
            if range == 0 || (filebase_hash(filebase) % range) == slice {
                out.push(filebase.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// All filebases regardless of partition (`files(0, 1)`).
    pub fn all_files(&self) -> Result<Vec<String>, QueueError> {
        self.files(0, 1)
    }

    /// Atomically take ownership of `filebase` by renaming `.pck` to
    /// `.bak`, then parse it. Returns `Ok(None)` on unparseable
    /// content — the caller is expected to shunt in that case; the
    /// `.bak` file is left for the caller to `finish(.., preserve)`.
    pub fn dequeue(&self, filebase: &str) -> Result<Option<QueueEntry>, QueueError> {
        let pck = self.path_for(filebase, PCK);
        let bak = self.path_for(filebase, BAK);
        fs::rename(&pck, &bak)?;

        let bytes = fs::read(&bak)?;
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(_) => Ok(None),
        }
    }

    /// Finish a dequeued entry. On success (`preserve == false`)
    /// unlink the `.bak`. On `preserve`, move it into `bad_dir` instead
    /// of deleting it, for operator postmortem.
    pub fn finish(&self, filebase: &str, preserve: Option<&Path>) -> Result<(), QueueError> {
        let bak = self.path_for(filebase, BAK);
        if let Some(bad_dir) = preserve {
            fs::create_dir_all(bad_dir)?;
            fs::rename(&bak, bad_dir.join(format!("{filebase}.{BAK}")))?;
        } else if bak.exists() {
            fs::remove_file(&bak)?;
        }
        Ok(())
    }

    /// Move a failed entry to `shunt`, annotating its metadata with
    /// `reason`. The entry must currently be a `.bak` (i.e. already
    /// dequeued).
    pub fn shunt(
        &self,
        shunt: &Switchboard,
        filebase: &str,
        mut entry: QueueEntry,
        reason: &str,
    ) -> Result<String, QueueError> {
        entry.metadata.set("shunt_reason", reason);
        entry.metadata.set("shunted_from", self.dir.display().to_string());
        let new_base = shunt.enqueue(entry.message, entry.metadata)?;
        self.finish(filebase, None)?;
        Ok(new_base)
    }

    /// Restore orphaned `.bak` files left by a crashed reader back to
    /// `.pck` so the next `files()` pass picks them up exactly once.
    pub fn recover_backup_files(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(filebase) = name.strip_suffix(&format!(".{BAK}")) {
                let pck = self.path_for(filebase, PCK);
                if !pck.exists() {
                    fs::rename(self.path_for(filebase, BAK), &pck)?;
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    /// Garbage-collect `.pck.tmp` files left by a crashed writer.
    pub fn gc_orphaned_tmp(&self) -> Result<usize, QueueError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.ends_with(&format!(".{TMP}"))) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.all_files()?.is_empty())
    }
}

fn make_filebase(message: &Message, metadata: &QueueMetadata) -> String {
    let hex_now = format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or(0));
    let hash = content_hash(message, metadata);
    format!("{hex_now}+{hash:016x}")
}

/// A simple FNV-1a hash over the message body and listname, used both
/// to avoid filebase collisions and (via [`filebase_hash`]) to
/// partition the queue among workers.
fn content_hash(message: &Message, metadata: &QueueMetadata) -> u64 {
    let mut hasher = Fnv1a::new();
    hasher.write(&message.raw);
    if let Some(listname) = metadata.listname() {
        hasher.write(listname.as_bytes());
    }
    hasher.finish()
}

fn filebase_hash(filebase: &str) -> u32 {
    let mut hasher = Fnv1a::new();
    hasher.write(filebase.as_bytes());
    (hasher.finish() & 0xFFFF_FFFF) as u32
}

struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(0xcbf29ce484222325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}
