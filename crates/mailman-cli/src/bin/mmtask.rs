//! One-shot maintenance-task CLI: the cron-equivalent entry point for
//! the three wall-clock engines (`mailman-moderation`, `mailman-bounce`,
//! `mailman-periodic`) that spec §4.7 describes as started by an
//! external scheduler rather than supervised by `mailmanctl`. Mirrors
//! `qrunner.rs`'s load-config-then-dispatch shape, but each subcommand
//! runs once and exits rather than looping.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mailman_bounce::BounceEngine;
use mailman_moderation::ModerationEngine;
use mailman_periodic::{DigestDispatch, NntpGate, NntpSource, PasswordReminders, QueueVolumeBump};
use mailman_runner::Reporter;
use mailman_store::MessageStore;
use mailman_types::List;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mmtask", version)]
#[command(about = "Runs one Mailman maintenance sweep, then exits")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit info-level progress, not just warnings and errors.
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand, Debug)]
enum Task {
    /// Expire pending requests and finalize terminal held messages.
    Moderation {
        /// Only sweep this list; every list otherwise.
        #[arg(long)]
        list: Option<String>,
    },
    /// Bounce-score housekeeping and the warning ladder.
    Bounce {
        #[arg(long)]
        list: Option<String>,
    },
    /// Dispatch due digests and bump issue numbers.
    Digest {
        #[arg(long)]
        list: Option<String>,
    },
    /// Bump digest volume numbers and reset issue counters.
    VolumeBump {
        #[arg(long)]
        list: Option<String>,
    },
    /// Send each subscriber one password reminder per virtual host.
    PasswordReminders,
    /// Pull new articles from a USENET server into `incoming`.
    Nntp {
        #[arg(long)]
        list: String,
        #[arg(long)]
        server: String,
    },
}

struct CliReporter {
    verbose: bool,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if self.verbose {
            eprintln!("[info] {msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Real NNTP transport is out of scope (spec §1's Non-goals); this
/// reports no new articles so `nntp` remains a runnable no-op until a
/// deployment supplies its own `NntpSource`.
struct NoopNntpSource;

impl NntpSource for NoopNntpSource {
    fn fetch(&mut self, _server: &str, _watermark: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        Ok(Vec::new())
    }
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[error] failed to load configuration: {e:#}");
            return 1;
        }
    };
    let mut reporter = CliReporter { verbose: cli.verbose };

    let result = match &cli.task {
        Task::Moderation { list } => {
            let engine_for = |name: &str| ModerationEngine::new(config.clone(), store_for(&config, name));
            run_per_list(&config, list.as_deref(), |name| {
                engine_for(name).sweep_list(name, chrono::Utc::now(), &mut reporter)
            })
        }
        Task::Bounce { list } => run_per_list(&config, list.as_deref(), |name| {
            BounceEngine::new(config.clone(), store_for(&config, name)).sweep_list(
                name,
                chrono::Utc::now().date_naive(),
                &mut reporter,
            )
        }),
        Task::Digest { list } => {
            let names = match resolve_list_names(&config, list.as_deref()) {
                Ok(n) => n,
                Err(e) => return report_and_fail(&mut reporter, &e),
            };
            DigestDispatch::new(config.clone()).run(&names, &mut reporter);
            Ok(())
        }
        Task::VolumeBump { list } => {
            let names = match resolve_list_names(&config, list.as_deref()) {
                Ok(n) => n,
                Err(e) => return report_and_fail(&mut reporter, &e),
            };
            QueueVolumeBump::new(config.clone()).run(&names, &mut reporter);
            Ok(())
        }
        Task::PasswordReminders => match host_groups(&config) {
            Ok(groups) => {
                PasswordReminders::new(config.clone()).run(&groups, &mut reporter);
                Ok(())
            }
            Err(e) => Err(e),
        },
        Task::Nntp { list, server } => {
            let mut source = NoopNntpSource;
            NntpGate::new(config.clone()).gate_list(list, server, &mut source, &mut reporter)
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            reporter.error(&format!("{e:#}"));
            1
        }
    }
}

fn report_and_fail(reporter: &mut dyn Reporter, e: &anyhow::Error) -> i32 {
    reporter.error(&format!("{e:#}"));
    1
}

fn load_config(path: &Option<PathBuf>) -> Result<mailman_config::Config> {
    match path {
        Some(p) => mailman_config::Config::load(p),
        None => Ok(mailman_config::Config::from_env()),
    }
}

fn store_for(config: &mailman_config::Config, list_name: &str) -> MessageStore {
    MessageStore::new(config.list_data_dir(list_name))
}

/// `--list NAME` sweeps just that list; omitted, every list under the
/// prefix, continuing past a single list's failure the way
/// `mailman-periodic`'s own per-item loops do.
fn run_per_list(
    config: &mailman_config::Config,
    list: Option<&str>,
    mut sweep: impl FnMut(&str) -> Result<()>,
) -> Result<()> {
    let names = resolve_list_names(config, list)?;
    let mut had_error = false;
    for name in &names {
        if let Err(e) = sweep(name) {
            eprintln!("[error] {name}: {e:#}");
            had_error = true;
        }
    }
    if had_error {
        anyhow::bail!("one or more lists failed their sweep");
    }
    Ok(())
}

fn resolve_list_names(config: &mailman_config::Config, list: Option<&str>) -> Result<Vec<String>> {
    match list {
        Some(name) => Ok(vec![name.to_string()]),
        None => mailman::list_names(config),
    }
}

/// Groups every list by its configured host, for
/// `PasswordReminders::run`'s `(host, list_names)` shape.
fn host_groups(config: &mailman_config::Config) -> Result<Vec<(String, Vec<String>)>> {
    let names = mailman::list_names(config)?;
    let mut by_host: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in names {
        let list: List = store_for(config, &name).load(&name)?;
        by_host.entry(list.host.clone()).or_default().push(name);
    }
    Ok(by_host.into_iter().collect())
}
