//! Migration fuzz runner for the `holo_oracle` exactly-once checks.
//!
//! Loads a step script, replays it against the simulated sharded cluster while
//! a background relocation runs, verifies every retryable write, and writes a
//! JSON report describing the run.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_oracle::oracle::{OracleConfig, RunLog, RunStats, Script, StepDriver, VerifyReport};
use holo_oracle::sim::{FaultRecord, RelocationOptions, SimCluster, SimOptions};
use rand::Rng;
use tracing_subscriber::EnvFilter;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-fuzz")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one step script and verify exactly-once retries.
    Run(RunArgs),
}

/// CLI options for a single fuzz run.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// JSON step script (`{"phase_boundary": N, "steps": [...]}`).
    #[arg(long, env = "HOLO_FUZZ_SCRIPT")]
    script: PathBuf,

    /// Number of simulated shards.
    #[arg(long, env = "HOLO_FUZZ_SHARDS", default_value_t = 2)]
    shards: usize,

    /// Random seed for placement and relocation (0 picks a random seed).
    #[arg(long, env = "HOLO_FUZZ_SEED", default_value_t = 0)]
    seed: u64,

    /// Skip post-boundary find-and-modify replays during verification.
    #[arg(long, env = "HOLO_FUZZ_RELAX_FIND_AND_MODIFY", default_value_t = false)]
    relax_find_and_modify: bool,

    /// Track majority-committed snapshots for failover steps.
    #[arg(long, env = "HOLO_FUZZ_FAILOVER_REPLAY", default_value_t = false)]
    failover_replay: bool,

    /// Drop retry history for documents that move during relocation.
    #[arg(long, env = "HOLO_FUZZ_DROP_HISTORY", default_value_t = false)]
    drop_pre_boundary_history: bool,

    /// Re-apply writes on retry instead of answering from history.
    #[arg(long, env = "HOLO_FUZZ_FAULTY_REPLAYS", default_value_t = false)]
    faulty_replays: bool,

    /// Capture the relocation boundary after this many routed commands.
    #[arg(long, env = "HOLO_FUZZ_CAPTURE_AFTER_OPS")]
    capture_after_ops: Option<u64>,

    /// Capture the relocation boundary this long after it starts.
    #[arg(long, env = "HOLO_FUZZ_CAPTURE_DELAY")]
    capture_delay: Option<humantime::Duration>,

    /// Write the JSON run report to this path.
    #[arg(long, env = "HOLO_FUZZ_OUT", default_value = ".tmp/fuzz/report.json")]
    out: PathBuf,
}

/// Parameters embedded in the report for reproducibility.
#[derive(serde::Serialize, Debug, Clone)]
struct ReportMeta {
    script: String,
    steps: usize,
    phase_boundary: usize,
    shards: usize,
    seed: u64,
    relax_find_and_modify: bool,
    failover_replay: bool,
    drop_pre_boundary_history: bool,
    faulty_replays: bool,
    capture_after_ops: Option<u64>,
    capture_delay_ms: Option<u64>,
}

#[derive(serde::Serialize, Debug, Clone)]
struct Report {
    meta: ReportMeta,
    stats: RunStats,
    verify: VerifyReport,
    faults: Vec<FaultRecord>,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("holo_fuzz=info,holo_oracle=info,warn")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => {
            let report = run(args.clone()).await?;
            write_report(&args.out, &report).context("write report")?;
            tracing::info!(
                out = %args.out.display(),
                records = report.verify.records,
                "fuzz run verified"
            );
            Ok(())
        }
    }
}

/// Replay the script against a fresh simulated cluster and verify it.
async fn run(args: RunArgs) -> anyhow::Result<Report> {
    anyhow::ensure!(args.shards > 0, "--shards must be > 0");
    let script = Script::load(&args.script)
        .with_context(|| format!("load script {}", args.script.display()))?;

    let mut config = OracleConfig::from_env()?;
    config.relax_find_and_modify |= args.relax_find_and_modify;
    config.failover_replay |= args.failover_replay;

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let cluster = SimCluster::new(SimOptions {
        shards: args.shards,
        seed,
        drop_pre_boundary_history: args.drop_pre_boundary_history,
        faulty_replays: args.faulty_replays,
        scratch_namespace: config.scratch_namespace.clone(),
    });
    let relocation = Arc::new(cluster.relocation(RelocationOptions {
        capture_after_ops: args.capture_after_ops,
        capture_delay: args.capture_delay.map(Into::into),
    }));

    let log = RunLog::new(format!("fuzz-{seed}"));
    tracing::info!(
        run = %log,
        script = %args.script.display(),
        steps = script.steps.len(),
        phase_boundary = script.phase_boundary,
        shards = args.shards,
        "starting fuzz run"
    );
    let relax = config.relax_find_and_modify;
    let meta = ReportMeta {
        script: args.script.display().to_string(),
        steps: script.steps.len(),
        phase_boundary: script.phase_boundary,
        shards: args.shards,
        seed,
        relax_find_and_modify: relax,
        failover_replay: config.failover_replay,
        drop_pre_boundary_history: args.drop_pre_boundary_history,
        faulty_replays: args.faulty_replays,
        capture_after_ops: args.capture_after_ops,
        capture_delay_ms: args
            .capture_delay
            .map(|d| std::time::Duration::from(d).as_millis() as u64),
    };

    let mut driver = StepDriver::new(Arc::new(cluster.clone()), relocation, config, log);
    let stats = driver
        .run_script(&script.steps, script.phase_boundary)
        .await?;
    let verify = driver.verify_exactly_once(args.relax_find_and_modify).await?;

    Ok(Report {
        meta,
        stats,
        verify,
        faults: cluster.faults(),
    })
}

/// Serialize and write the run report JSON.
fn write_report(path: &Path, report: &Report) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
