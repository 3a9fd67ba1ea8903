//! Master runner supervisor: holds the global lease, forks one OS
//! child process per configured runner slot, monitors them, and
//! reacts to their exit status by a fixed restart policy.
//!
//! Child lifecycle polling is grounded on `shipper::process`'s
//! `Command`/`Stdio`/`try_wait` loop; the teacher never forks
//! long-lived children or traps Unix signals, so `signal-hook` (to
//! receive `SIGTERM`/`SIGINT`/`SIGHUP`) and `libc` (to forward them to
//! children, which `std::process::Child` cannot send on its own) are
//! the two dependencies this crate adds beyond the teacher's stack.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use mailman_config::Config;
use mailman_lock::{AcquireOptions, FileLock};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

#[derive(Debug, Default)]
pub struct NullReporter;
impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("lock error: {0}")]
    Lock(#[from] mailman_lock::LockError),
    #[error("site list {0} does not exist")]
    NoSiteList(String),
    #[error("effective uid/gid does not match the configured mailman user/group")]
    PrivilegeMismatch,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One `(runnerClass, slice, range)` configuration the supervisor
/// forks a child for. `program` is the `qrunner` binary path.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub runner_name: String,
    pub program: PathBuf,
    pub slice: u32,
    pub range: u32,
    pub extra_args: Vec<String>,
}

impl RunnerSpec {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![format!("--runner={}:{}:{}", self.runner_name, self.slice, self.range), "--subproc".to_string()];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Exit-status classification the master's restart policy is built
/// on, exactly as spec.md §4.4 tables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// `0`, or killed outright by a signal (the supervisor's own
    /// broadcast doing its job) — do not restart.
    NoRestart,
    /// Exit code 130 (`SIGINT`, by the runner's own convention of
    /// translating the signal into an exit code): a graceful restart
    /// request — re-fork the same spec.
    Restart,
    /// Any other non-zero: abnormal; re-fork up to `MAX_RESTARTS`.
    AbnormalRestart,
}

pub fn classify_exit(status: ExitStatus) -> RestartDecision {
    if status.signal().is_some() {
        return RestartDecision::NoRestart;
    }
    match status.code() {
        Some(0) => RestartDecision::NoRestart,
        Some(130) => RestartDecision::Restart,
        _ => RestartDecision::AbnormalRestart,
    }
}

struct Slot {
    spec: RunnerSpec,
    child: Option<Child>,
    restart_count: u32,
    exhausted: bool,
}

/// The supervisor itself. Holds the master lease for its entire
/// lifetime; dropping it (or calling [`Master::shutdown`]) releases
/// the lease.
pub struct Master {
    config: Config,
    specs: Vec<RunnerSpec>,
    slots: Vec<Slot>,
    lock: Option<FileLock>,
    signals: Option<Signals>,
    stop_requested: Arc<AtomicBool>,
}

impl Master {
    pub fn new(config: Config, specs: Vec<RunnerSpec>) -> Self {
        let slots = specs
            .iter()
            .cloned()
            .map(|spec| Slot { spec, child: None, restart_count: 0, exhausted: false })
            .collect();
        Self { config, specs, slots, lock: None, signals: None, stop_requested: Arc::new(AtomicBool::new(false)) }
    }

    /// Verify the site list exists before doing anything else that
    /// assumes it (site-wide notifications are addressed `From` it).
    pub fn check_site_list_exists(&self, exists: bool) -> Result<(), MasterError> {
        if exists {
            Ok(())
        } else {
            Err(MasterError::NoSiteList(self.config.site_list.clone()))
        }
    }

    /// Acquire the exclusive master lease. `allow_stale_cleanup` maps
    /// to the supervisor's `-s`/`--stale-lock-cleanup` flag: without
    /// it, a lease held by a different host is never broken.
    pub fn acquire_lock(&mut self, allow_stale_cleanup: bool) -> Result<(), MasterError> {
        let opts = AcquireOptions {
            lease: self.config.lock.lease,
            timeout: self.config.lock.timeout,
            retry_interval: self.config.lock.retry_interval,
            allow_cross_host_break: allow_stale_cleanup,
        };
        let lock = FileLock::acquire(&self.config.master_lock_path(), &opts)?;
        self.lock = Some(lock);
        Ok(())
    }

    /// Write the decimal PID, newline-terminated, to the well-known
    /// PID file path.
    pub fn write_pid_file(&self) -> Result<(), MasterError> {
        let path = self.config.master_pid_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(())
    }

    /// Install `SIGTERM`/`SIGINT`/`SIGHUP` handling. Must be called
    /// before [`Master::poll_signals`].
    pub fn install_signal_handlers(&mut self) -> Result<()> {
        self.signals = Some(Signals::new([SIGTERM, SIGINT, SIGHUP]).context("failed to register signal handlers")?);
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Fork every slot that isn't currently running a child.
    pub fn spawn_missing(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        for slot in &mut self.slots {
            if slot.child.is_some() || slot.exhausted {
                continue;
            }
            let child = spawn_one(&slot.spec)?;
            reporter.info(&format!("forked {} (slice {}/{}), pid {}", slot.spec.runner_name, slot.spec.slice, slot.spec.range, child.id()));
            slot.child = Some(child);
        }
        Ok(())
    }

    /// Non-blocking reap of every slot; applies the restart policy to
    /// any child that has exited.
    pub fn reap_once(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let max_restarts = self.config.master.max_restarts;
        for slot in &mut self.slots {
            let Some(child) = slot.child.as_mut() else { continue };
            match child.try_wait().context("failed to poll child status")? {
                None => continue,
                Some(status) => {
                    slot.child = None;
                    match classify_exit(status) {
                        RestartDecision::NoRestart => {
                            reporter.info(&format!("{} exited cleanly, not restarting", slot.spec.runner_name));
                        }
                        RestartDecision::Restart => {
                            slot.restart_count += 1;
                            reporter.info(&format!("{} requested restart (count={})", slot.spec.runner_name, slot.restart_count));
                            slot.child = Some(spawn_one(&slot.spec)?);
                        }
                        RestartDecision::AbnormalRestart => {
                            slot.restart_count += 1;
                            if slot.restart_count >= max_restarts {
                                slot.exhausted = true;
                                reporter.error(&format!(
                                    "{} crash-looped {} times, leaving slot empty",
                                    slot.spec.runner_name, slot.restart_count
                                ));
                            } else {
                                reporter.warn(&format!(
                                    "{} exited abnormally (restart {}/{})",
                                    slot.spec.runner_name, slot.restart_count, max_restarts
                                ));
                                slot.child = Some(spawn_one(&slot.spec)?);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drain pending signals and react: `SIGTERM` broadcasts
    /// `SIGTERM` then marks the supervisor stopped; `SIGINT`
    /// broadcasts `SIGINT` (triggering each child's own graceful
    /// restart); `SIGHUP` broadcasts `SIGHUP` and reopens the
    /// supervisor's own logs.
    pub fn poll_signals(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let Some(signals) = self.signals.as_mut() else { return Ok(()) };
        let pending: Vec<i32> = signals.pending().collect();
        for signal in pending {
            match signal {
                SIGTERM => {
                    reporter.info("received SIGTERM, broadcasting to children and stopping");
                    self.broadcast(libc::SIGTERM);
                    self.stop_requested.store(true, Ordering::SeqCst);
                }
                SIGINT => {
                    reporter.info("received SIGINT, broadcasting to children for graceful restart");
                    self.broadcast(libc::SIGINT);
                }
                SIGHUP => {
                    reporter.info("received SIGHUP, broadcasting to children to reopen logs");
                    self.broadcast(libc::SIGHUP);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn broadcast(&self, signal: i32) {
        for slot in &self.slots {
            if let Some(child) = &slot.child {
                unsafe {
                    libc::kill(child.id() as libc::pid_t, signal);
                }
            }
        }
    }

    /// Reap every child and remove the PID file and master lease.
    pub fn shutdown(mut self, reporter: &mut dyn Reporter) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(child) = slot.child.as_mut() {
                let _ = child.wait();
            }
        }
        let _ = std::fs::remove_file(self.config.master_pid_path());
        if let Some(lock) = self.lock.take() {
            lock.release().context("failed to release master lease")?;
        }
        reporter.info("supervisor shut down");
        Ok(())
    }

    /// Drive the supervise loop until stopped: spawn missing slots,
    /// reap exited children, poll signals, sleep briefly.
    pub fn run(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        while !self.is_stopped() {
            self.spawn_missing(reporter)?;
            self.reap_once(reporter)?;
            self.poll_signals(reporter)?;
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }

    pub fn specs(&self) -> &[RunnerSpec] {
        &self.specs
    }
}

fn spawn_one(spec: &RunnerSpec) -> Result<Child> {
    Command::new(&spec.program)
        .args(spec.args())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn runner {}", spec.runner_name))
}

/// The calling process's effective uid, for [`check_privileges`]. A
/// thin wrapper so callers outside this crate (the CLI) never need
/// their own `unsafe` block just to ask who they're running as.
pub fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Send a raw signal to a pid read from the master PID file — used by
/// `mailmanctl stop`/`restart`/`reopen`, which act on an already-running
/// supervisor from a separate process invocation and so can't go
/// through [`Master::broadcast`].
pub fn signal_pid(pid: i32, signal: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 { Ok(()) } else { Err(std::io::Error::last_os_error()) }
}

/// Read the decimal PID written by [`Master::write_pid_file`].
pub fn read_pid_file(config: &Config) -> Result<i32> {
    let content = std::fs::read_to_string(config.master_pid_path())?;
    content.trim().parse::<i32>().context("master PID file does not contain a valid integer")
}

/// Startup uid/gid check. Real uid/gid resolution is platform and
/// deployment-specific (the configured mailman user/group); this
/// takes the already-resolved expectation so it stays unit-testable.
pub fn check_privileges(effective_uid: u32, expected_uid: u32, allow_override: bool) -> Result<(), MasterError> {
    if allow_override || effective_uid == expected_uid {
        Ok(())
    } else {
        Err(MasterError::PrivilegeMismatch)
    }
}

fn program_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
