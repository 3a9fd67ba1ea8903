//! NFS-safe, lease-based exclusive file lock.
//!
//! The lock never relies on advisory locking (`flock` is not portable
//! across network filesystems). Ownership is established purely
//! through `link()`: a holder writes a uniquely-named temp file, links
//! it onto the lock path, and treats success (or a post-link `stat`
//! matching its own content) as proof of ownership.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body written into the lock file and into the link-candidate temp
/// file; ownership is proven by content equality, not by file
/// identity (NFS may report different inodes for the same link).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub host: String,
    pub pid: u32,
    /// Name (not path) of the temp file that was linked into place.
    /// Kept so a later breaker can find and remove it without
    /// guessing the random suffix.
    pub temp_name: String,
    pub claims: u32,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn same_host(&self) -> bool {
        self.host == local_host()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock at {0}")]
    TimedOut(PathBuf),
    #[error("lock file at {0} is missing or corrupt")]
    NotLocked(PathBuf),
    #[error("lease on {0} expired while held; state must be treated as lost")]
    AlreadyUnlocked(PathBuf),
    #[error("refusing to break lease held by a different host ({0}) without operator assent")]
    CrossHostStale(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Options controlling an [`FileLock::acquire`] attempt.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// How long this holder's lease lasts before it must be refreshed.
    pub lease: Duration,
    /// How long to keep retrying before giving up with `TimedOut`.
    pub timeout: Duration,
    /// Delay between contention retries.
    pub retry_interval: Duration,
    /// Allow breaking a stale lease held by a different host. Maps to
    /// the supervisor's `-s`/`--stale-lock-cleanup` flag; never set
    /// this from wall-clock expiry alone, since clock skew across
    /// hosts is common.
    pub allow_cross_host_break: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(15 * 60),
            timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(50),
            allow_cross_host_break: false,
        }
    }
}

/// A held lease. Dropping it releases the lock best-effort; callers
/// that care about the release outcome should call
/// [`FileLock::release`] explicitly.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    temp_path: PathBuf,
    info: LockInfo,
}

impl FileLock {
    /// Acquire the lock at `path`, retrying contention and breaking
    /// stale leases per `opts` until `opts.timeout` elapses.
    pub fn acquire(path: &Path, opts: &AcquireOptions) -> Result<Self, LockError> {
        let deadline = Instant::now() + opts.timeout;
        loop {
            match Self::try_acquire_once(path, opts.lease) {
                Ok(lock) => return Ok(lock),
                Err(LockError::TimedOut(_)) => {
                    // Contended by a live, non-stale holder.
                }
                Err(other) => return Err(other),
            }

            if let Some(existing) = read_info(path)? {
                if existing.is_expired(Utc::now()) {
                    if existing.same_host() || opts.allow_cross_host_break {
                        break_lease(path, &existing)?;
                        continue;
                    } else {
                        return Err(LockError::CrossHostStale(existing.host));
                    }
                }
            } else if path.exists() {
                // Present but unparseable: treat as breakable corruption.
                let _ = fs::remove_file(path);
                continue;
            }

            if Instant::now() >= deadline {
                return Err(LockError::TimedOut(path.to_path_buf()));
            }
            std::thread::sleep(opts.retry_interval);
        }
    }

    fn try_acquire_once(path: &Path, lease: Duration) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_name = format!(
            "{}.{}.{}.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("lock"),
            local_host(),
            std::process::id(),
            random_suffix(),
        );
        let temp_path = path.with_file_name(&temp_name);

        let info = LockInfo {
            host: local_host(),
            pid: std::process::id(),
            temp_name: temp_name.clone(),
            claims: 1,
            expires_at: Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default(),
        };
        write_info(&temp_path, &info)?;

        match fs::hard_link(&temp_path, path) {
            Ok(()) => Ok(Self { path: path.to_path_buf(), temp_path, info }),
            Err(_) => {
                // Link failed: contention. Post-link stat check isn't
                // meaningful here since the link never landed; verify
                // nothing of ours is left behind and report timeout
                // for the caller's retry loop to interpret.
                let _ = fs::remove_file(&temp_path);
                Err(LockError::TimedOut(path.to_path_buf()))
            }
        }
    }

    /// Extend the lease. On a conventional filesystem this is a
    /// tmp-file-plus-rename rewrite of the lock content; NFS clients
    /// that need a fresh link should call [`FileLock::acquire`] again
    /// after a release.
    pub fn refresh(&mut self, lease: Duration) -> Result<(), LockError> {
        let current = read_info(&self.path)?.ok_or_else(|| LockError::NotLocked(self.path.clone()))?;
        if current != self.info {
            return Err(LockError::AlreadyUnlocked(self.path.clone()));
        }

        self.info.expires_at = Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default();
        write_info(&self.temp_path, &self.info)?;
        let rewrite_tmp = self.path.with_extension("refresh.tmp");
        write_info(&rewrite_tmp, &self.info)?;
        fs::rename(&rewrite_tmp, &self.path)?;
        Ok(())
    }

    /// Increment the reentrant claim count.
    pub fn claim(&mut self) {
        self.info.claims += 1;
    }

    /// Decrement the claim count. Returns `true` once it reaches zero
    /// (i.e. the caller should actually release).
    pub fn unclaim(&mut self) -> bool {
        self.info.claims = self.info.claims.saturating_sub(1);
        self.info.claims == 0
    }

    /// Release the lock, unlinking the lock path only if we still own
    /// it (content match) and always unlinking our own temp file.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if let Some(current) = read_info(&self.path)? {
            if current.pid == self.info.pid
                && current.host == self.info.host
                && current.temp_name == self.info.temp_name
            {
                let _ = fs::remove_file(&self.path);
            }
        }
        let _ = fs::remove_file(&self.temp_path);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

/// Break a stale lease: remove both the lock file and the recorded
/// temp file it was linked from.
fn break_lease(path: &Path, stale: &LockInfo) -> Result<(), LockError> {
    let temp_path = path.with_file_name(&stale.temp_name);
    let _ = fs::remove_file(&temp_path);
    let _ = fs::remove_file(path);
    Ok(())
}

fn read_info(path: &Path) -> Result<Option<LockInfo>, LockError> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(_) => Ok(None),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_info(path: &Path, info: &LockInfo) -> Result<(), LockError> {
    let json = serde_json::to_string_pretty(info)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn local_host() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

fn random_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.r#gen::<u64>())
}

/// Best-effort liveness check for a local pid. Used only when
/// deciding whether a same-host stale lease's owner is truly gone;
/// unsupported platforms conservatively report "alive" so the lease
/// still requires wall-clock expiry (never pid absence alone) to be
/// broken.
#[cfg(target_os = "linux")]
pub fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts() -> AcquireOptions {
        AcquireOptions {
            lease: Duration::from_secs(60),
            timeout: Duration::from_millis(200),
            retry_interval: Duration::from_millis(10),
            allow_cross_host_break: false,
        }
    }

    #[test]
    fn acquire_creates_lock_file() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");
        let lock = FileLock::acquire(&path, &opts()).unwrap();
        assert!(path.exists());
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_times_out() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");
        let _lock = FileLock::acquire(&path, &opts()).unwrap();

        let err = FileLock::acquire(&path, &opts()).unwrap_err();
        assert!(matches!(err, LockError::TimedOut(_)));
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");
        {
            let _lock = FileLock::acquire(&path, &opts()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_same_host_lease_is_broken_automatically() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");

        let stale = LockInfo {
            host: local_host(),
            pid: 999_999,
            temp_name: "lock.somehost.999999.deadbeef".to_string(),
            claims: 1,
            expires_at: Utc::now() - chrono::Duration::seconds(10),
        };
        write_info(&path, &stale).unwrap();

        let lock = FileLock::acquire(&path, &opts()).unwrap();
        assert_eq!(lock.info().pid, std::process::id());
    }

    #[test]
    fn stale_cross_host_lease_requires_assent() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");

        let stale = LockInfo {
            host: "some-other-host".to_string(),
            pid: 999_999,
            temp_name: "lock.some-other-host.999999.deadbeef".to_string(),
            claims: 1,
            expires_at: Utc::now() - chrono::Duration::seconds(10),
        };
        write_info(&path, &stale).unwrap();

        let err = FileLock::acquire(&path, &opts()).unwrap_err();
        assert!(matches!(err, LockError::CrossHostStale(_)));

        let mut forced = opts();
        forced.allow_cross_host_break = true;
        let lock = FileLock::acquire(&path, &forced).unwrap();
        assert_eq!(lock.info().pid, std::process::id());
    }

    #[test]
    fn refresh_extends_lease() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");
        let mut lock = FileLock::acquire(&path, &opts()).unwrap();
        let before = lock.info().expires_at;

        std::thread::sleep(Duration::from_millis(5));
        lock.refresh(Duration::from_secs(120)).unwrap();
        assert!(lock.info().expires_at > before);
    }

    #[test]
    fn corrupt_lock_file_is_breakable() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");
        fs::write(&path, b"not json").unwrap();

        let lock = FileLock::acquire(&path, &opts()).unwrap();
        assert_eq!(lock.info().pid, std::process::id());
    }

    #[test]
    fn claim_and_unclaim_track_reentrancy() {
        let td = tempdir().unwrap();
        let path = td.path().join("lock");
        let mut lock = FileLock::acquire(&path, &opts()).unwrap();
        assert_eq!(lock.info().claims, 1);

        lock.claim();
        assert_eq!(lock.info().claims, 2);
        assert!(!lock.unclaim());
        assert!(lock.unclaim());
    }
}
