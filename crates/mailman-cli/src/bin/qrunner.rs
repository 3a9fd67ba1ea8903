//! Queue-runner CLI: drives exactly one configured `(runner, slice,
//! range)` triple through scan -> dequeue -> dispose -> finish. Mirrors
//! `shipper-cli/src/main.rs`'s `Parser` style. `--subproc` marks an
//! invocation forked by `mailmanctl` rather than run interactively by
//! an operator (it only changes the startup banner).

use anyhow::{Context, Result, bail};
use clap::Parser;
use mailman_config::Config;
use mailman_runner::{
    Archive, Archiver, Bounce, Command, DeliveryError, DeliveryOutcome, Deliverer, HandlerChain, Incoming, News,
    Pipeline, QueueRunner, Reporter, Retry, Virgin,
};
use mailman_types::{Message, QueueMetadata};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "qrunner", version)]
#[command(about = "Drives a single Mailman queue runner to completion or in a loop")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single pass then exit, instead of looping until signaled.
    #[arg(long)]
    once: bool,

    /// Print the known runner names and exit.
    #[arg(long)]
    list: bool,

    /// Emit info-level progress, not just warnings and errors.
    #[arg(long)]
    verbose: bool,

    /// This process was forked by mailmanctl (suppresses the startup banner).
    #[arg(long)]
    subproc: bool,

    /// `NAME[:slice:range]`, or `All` to run one of each configured runner.
    #[arg(long)]
    runner: Option<String>,
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

/// Outbound SMTP delivery and message archiving are external
/// collaborators out of scope for this engine (spec §1's Non-goals);
/// this stands in for both so the binary links and runs end to end.
/// A real deployment replaces these two with the MTA/archiver adapter.
struct LoggingTransport;

impl Deliverer for LoggingTransport {
    fn deliver(&mut self, message: &Message, metadata: &QueueMetadata) -> Result<DeliveryOutcome, DeliveryError> {
        eprintln!("[deliver] {} bytes, metadata={:?}", message.raw.len(), metadata);
        Ok(DeliveryOutcome::Delivered)
    }
}

impl Archiver for LoggingTransport {
    fn archive(&mut self, list_name: &str, message: &Message) -> Result<(), anyhow::Error> {
        eprintln!("[archive] {list_name}: {} bytes", message.raw.len());
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();
    let code = run(&cli);
    std::process::exit(code);
}

fn run(cli: &Cli) -> i32 {
    if cli.list {
        for name in mailman::RUNNER_NAMES {
            println!("{name}");
        }
        return 0;
    }

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[error] failed to load configuration: {e:#}");
            return 1;
        }
    };

    let mut reporter = CliReporter { verbose: cli.verbose };
    if !cli.subproc {
        reporter.info("qrunner starting interactively");
    }

    let Some(spec) = cli.runner.as_deref() else {
        eprintln!("[error] --runner=NAME[:slice:range] is required unless --list is given");
        return 1;
    };

    let (name, slice, range) = match parse_runner_spec(spec) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("[error] {e}");
            return 1;
        }
    };

    // "All" can only mean a single-process sequential sweep: one
    // process is always exactly one runner (spec §5's scheduling
    // model). mailmanctl never forks a child with --runner=All; it
    // expands the name into one spec per configured runner first.
    if name.eq_ignore_ascii_case("all") {
        let mut had_error = false;
        for &runner_name in mailman::RUNNER_NAMES {
            if let Err(e) = dispatch(runner_name, 0, 1, true, &config, &mut reporter) {
                reporter.error(&format!("{runner_name} failed: {e:#}"));
                had_error = true;
            }
        }
        return if had_error { 1 } else { 0 };
    }

    match dispatch(&name, slice, range, cli.once, &config, &mut reporter) {
        Ok(()) => 0,
        Err(e) => {
            reporter.error(&format!("{name} failed: {e:#}"));
            1
        }
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::load(p),
        None => Ok(Config::from_env()),
    }
}

/// `NAME[:slice:range]`; slice/range default to `0`/`1` (single worker).
fn parse_runner_spec(spec: &str) -> Result<(String, u32, u32)> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().filter(|s| !s.is_empty()).context("runner name must not be empty")?.to_string();
    let slice = match parts.next() {
        Some(s) => s.parse::<u32>().context("slice must be an integer")?,
        None => 0,
    };
    let range = match parts.next() {
        Some(s) => s.parse::<u32>().context("range must be an integer")?,
        None => 1,
    };
    if range == 0 {
        bail!("range must be at least 1");
    }
    Ok((name, slice, range))
}

fn dispatch(
    name: &str,
    slice: u32,
    range: u32,
    once: bool,
    config: &Config,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let store = mailman::shared_store(config);
    macro_rules! drive {
        ($runner:expr) => {{
            let mut qr = QueueRunner::new($runner, config, slice, range)?;
            if once {
                qr.run_single_pass(reporter)?;
            } else {
                qr.run(reporter)?;
            }
            Ok(())
        }};
    }

    match name {
        "Incoming" => drive!(Incoming::new(config.clone(), store)),
        "Pipeline" => drive!(Pipeline::new(config.clone(), store, HandlerChain::new())),
        "Outgoing" => drive!(mailman_runner::Outgoing::new(config.clone(), LoggingTransport)),
        "Bounce" => drive!(Bounce::new(config.clone(), store)),
        "Virgin" => drive!(Virgin::new(LoggingTransport)),
        "Command" => drive!(Command::new(config.clone(), store)),
        "News" => drive!(News::new(config.clone())),
        "Retry" => drive!(Retry::new(config.clone())),
        "Archive" => drive!(Archive::new(LoggingTransport)),
        other => bail!("unknown runner {other:?}; use --list to see the known names"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_runner_spec_defaults_slice_and_range() {
        assert_eq!(parse_runner_spec("Incoming").unwrap(), ("Incoming".to_string(), 0, 1));
    }

    #[test]
    fn parse_runner_spec_parses_slice_and_range() {
        assert_eq!(parse_runner_spec("Outgoing:2:4").unwrap(), ("Outgoing".to_string(), 2, 4));
    }

    #[test]
    fn parse_runner_spec_rejects_empty_name() {
        assert!(parse_runner_spec("").is_err());
    }

    #[test]
    fn parse_runner_spec_rejects_zero_range() {
        assert!(parse_runner_spec("Incoming:0:0").is_err());
    }

    #[test]
    fn dispatch_rejects_unknown_runner_name() {
        let td = tempfile::tempdir().unwrap();
        let config = Config { prefix: td.path().to_path_buf(), ..Config::default() };
        let mut reporter = CliReporter { verbose: false };
        assert!(dispatch("Nonsense", 0, 1, true, &config, &mut reporter).is_err());
    }

    #[test]
    fn dispatch_runs_a_single_pass_over_an_empty_queue() {
        let td = tempfile::tempdir().unwrap();
        let config = Config { prefix: td.path().to_path_buf(), ..Config::default() };
        let mut reporter = CliReporter { verbose: false };
        dispatch("Incoming", 0, 1, true, &config, &mut reporter).unwrap();
    }
}
