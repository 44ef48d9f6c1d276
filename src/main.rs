//! `qp`: offline tooling for recorded op streams.
//!
//! Input files hold one JSON-encoded sequenced op per line.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quorum_protocol::protocol::{NullSubmitter, ProcessOutcome, ProtocolOpHandler, SequencedMessage, SummaryTree};
use quorum_protocol::session::{Checker, History, SessionConfig};

#[derive(Parser)]
#[command(name = "qp")]
#[command(about = "Replay, summarize, and verify quorum protocol op streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session config file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply an op stream and print the final protocol state
    Replay {
        /// Op stream, one JSON op per line
        ops: PathBuf,

        /// Start from a summary instead of an empty session
        #[arg(long, value_name = "PATH")]
        from_summary: Option<PathBuf>,
    },

    /// Apply an op stream and write the resulting summary
    Summarize {
        ops: PathBuf,

        #[arg(long, value_name = "PATH")]
        from_summary: Option<PathBuf>,

        /// Output file; prints to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Apply an op stream and check the agreement invariants over the run
    Verify {
        ops: PathBuf,

        #[arg(long, value_name = "PATH")]
        from_summary: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match SessionConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("qp: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => SessionConfig::default(),
    };
    init_tracing(&config, cli.verbose);

    match run(cli.command, &config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("qp: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &SessionConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands, config: &SessionConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Commands::Replay { ops, from_summary } => {
            let mut handler = open_handler(config, from_summary.as_deref())?;
            let halted = replay(&mut handler, &read_ops(&ops)?, None);
            println!("{}", serde_json::to_string_pretty(&handler.get_protocol_state())?);
            Ok(exit_code(halted))
        }

        Commands::Summarize {
            ops,
            from_summary,
            output,
        } => {
            let mut handler = open_handler(config, from_summary.as_deref())?;
            let halted = replay(&mut handler, &read_ops(&ops)?, None);

            let summary = handler.capture_summary()?;
            let bytes = summary.to_bytes()?;
            match output {
                Some(path) => fs::write(&path, &bytes)?,
                None => println!("{}", String::from_utf8(bytes)?),
            }
            eprintln!("fingerprint {}", summary.fingerprint()?);
            Ok(exit_code(halted))
        }

        Commands::Verify { ops, from_summary } => {
            let ops = read_ops(&ops)?;
            let mut handler = open_handler(config, from_summary.as_deref())?;
            let checker = Checker::starting_from(handler.get_protocol_state());
            let mut history = History::new();
            let halted = replay(&mut handler, &ops, Some(&mut history));

            // A second replica fed the same stream must produce the same summary.
            let mut replica = open_handler(config, from_summary.as_deref())?;
            replay(&mut replica, &ops, None);
            let summary = handler.capture_summary()?;
            let deterministic = summary.fingerprint()? == replica.capture_summary()?.fingerprint()?;
            if !deterministic {
                warn!("replicas diverged on the same op stream");
            }

            let reloaded = ProtocolOpHandler::from_summary(&summary, Box::new(NullSubmitter::new()))?;
            let round_trip = reloaded.get_protocol_state() == handler.get_protocol_state();
            if !round_trip {
                warn!("summary did not reload to the same state");
            }

            let result = checker.verify(&history);
            for violation in &result.violations {
                warn!(kind = ?violation.kind, entries = ?violation.related_entries, "{}", violation.description);
            }
            println!(
                "ops={} applied={} dropped={} approved={} rejected={} members={} values={}",
                result.stats.total_operations,
                result.stats.applied_operations,
                result.stats.dropped_operations,
                result.stats.approved_proposals,
                result.stats.rejected_proposals,
                result.stats.final_members,
                result.stats.final_values,
            );
            let passed = result.passed && deterministic && round_trip;
            println!("{}", if passed { "PASSED" } else { "FAILED" });
            Ok(exit_code(halted || !passed))
        }
    }
}

fn open_handler(config: &SessionConfig, summary: Option<&Path>) -> Result<ProtocolOpHandler, Box<dyn std::error::Error>> {
    let submitter = Box::new(NullSubmitter::new());
    match summary {
        Some(path) => {
            let tree = SummaryTree::from_bytes(&fs::read(path)?)?;
            let handler = ProtocolOpHandler::from_summary(&tree, submitter)?;
            info!(
                branch = %handler.branch_id(),
                sequence_number = handler.sequence_number(),
                "loaded summary"
            );
            Ok(handler)
        }
        None => Ok(ProtocolOpHandler::new(config.branch_id.clone(), submitter)),
    }
}

fn read_ops(path: &Path) -> Result<Vec<SequencedMessage>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut ops = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        ops.push(message);
    }
    Ok(ops)
}

/// Apply `ops` in order. Returns true if the handler halted.
fn replay(handler: &mut ProtocolOpHandler, ops: &[SequencedMessage], mut history: Option<&mut History>) -> bool {
    let mut dropped = 0usize;
    for message in ops {
        match handler.process_message(message, false) {
            Ok(ProcessOutcome::Applied { .. }) => {}
            Ok(ProcessOutcome::Dropped { .. }) => dropped += 1,
            Err(e) => {
                eprintln!("qp: halted at op {}: {}", message.sequence_number, e);
                return true;
            }
        }
        if let Some(history) = history.as_deref_mut() {
            history.record(message.clone(), handler.get_protocol_state());
        }
    }
    info!(
        ops = ops.len(),
        dropped,
        sequence_number = handler.sequence_number(),
        minimum_sequence_number = handler.minimum_sequence_number(),
        "replay finished"
    );
    false
}

fn exit_code(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
