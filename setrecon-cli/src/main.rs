//! setrecon: reconcile two element files between two in-process peers.
//!
//! Usage:
//!   setrecon left.txt right.txt --op union --mode added
//!   setrecon left.txt right.txt --op intersection --async --json
//!
//! Each file holds one element per line. The left peer initiates.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use setrecon_cli::{load_config, read_elements, run_async, run_sync, Job, PeerReport, Report};
use setrecon_service::{OperationOptions, ResultMode, ResultStatus, ServiceConfig};
use setrecon_types::OperationType;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Op {
    Union,
    Intersection,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Full,
    Added,
    Removed,
    Symmetric,
}

#[derive(Parser, Debug)]
#[command(name = "setrecon")]
#[command(about = "Reconcile two sets of elements between two in-process peers")]
struct Args {
    /// Elements of the initiating peer, one per line
    left: PathBuf,

    /// Elements of the accepting peer, one per line
    right: PathBuf,

    /// Set operation to run
    #[arg(long, value_enum, default_value = "union")]
    op: Op,

    /// Which results each peer reports
    #[arg(long, value_enum, default_value = "added")]
    mode: Mode,

    /// JSON service config; missing fields use the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run on async nodes over byte streams instead of the in-memory pump
    #[arg(long = "async")]
    use_async: bool,

    /// Always send the full set (union)
    #[arg(long, conflicts_with = "force_delta")]
    force_full: bool,

    /// Never fall back to the full set (union)
    #[arg(long)]
    force_delta: bool,

    /// Async run timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };
    let job = Job {
        op_type: match args.op {
            Op::Union => OperationType::Union,
            Op::Intersection => OperationType::Intersection,
        },
        mode: match args.mode {
            Mode::Full => ResultMode::Full,
            Mode::Added => ResultMode::Added,
            Mode::Removed => ResultMode::Removed,
            Mode::Symmetric => ResultMode::Symmetric,
        },
        options: OperationOptions {
            force_full: args.force_full,
            force_delta: args.force_delta,
            ..Default::default()
        },
        config,
        left: read_elements(&args.left)?,
        right: read_elements(&args.right)?,
        timeout: Duration::from_secs(args.timeout),
    };
    info!(
        op = %job.op_type,
        left = job.left.len(),
        right = job.right.len(),
        "starting"
    );

    let report = if args.use_async {
        run_async(&job).await?
    } else {
        run_sync(&job)?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.left.status != ResultStatus::Done || report.right.status != ResultStatus::Done {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &Report) {
    print_peer("left", &report.left);
    print_peer("right", &report.right);
    if let (Some(frames), Some(bytes)) = (report.frames, report.bytes) {
        println!("\n{frames} frames, {bytes} bytes");
    }
}

fn print_peer(name: &str, peer: &PeerReport) {
    println!("{name}: {:?} ({} results)", peer.status, peer.results.len());
    for status in [
        ResultStatus::Added,
        ResultStatus::RemovedLocal,
        ResultStatus::AddedRemote,
    ] {
        for element in peer.elements(status) {
            println!("  {status:?}\t{element}");
        }
    }
}
