//! tunnelcheck
//!
//! Runs fault-injection scenarios against xfrm IPsec tunnels carrying
//! storage I/O and records how each one ended.
//!
//! - `run` — scenarios from a TOML batch file
//! - `matrix` — every mode × cipher preset × selected fault
//! - `exhaust` — fill the SA table until the kernel refuses
//! - `checksum` — SHA-256 of a workload target
//!
//! `--dry-run` logs every host command instead of executing it.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use tunnelcheck_common::exec::{CommandExecutor, DryRunExecutor, NamespacedExecutor, RealExecutor};
use tunnelcheck_common::models::{Mode, ScenarioResult, Subnet, TrafficSelectors, WorkloadSpec};
use tunnelcheck_harness::checksum;
use tunnelcheck_harness::config::{
    matrix_scenarios, BatchConfig, ExhaustionConfigInput, HostConfig, ScenarioDefaults,
};
use tunnelcheck_harness::exhaustion::exhaust;
use tunnelcheck_harness::orchestrator::{BatchSummary, Orchestrator};
use tunnelcheck_harness::scenario::{FaultSpec, ScenarioSpec};
use tunnelcheck_harness::sink::{CsvSink, JsonLinesSink, MultiSink};
use tunnelcheck_harness::xfrm::{hex_spi, AssociationStore};

/// Fault-injection scenarios for xfrm IPsec tunnels.
#[derive(Parser, Debug)]
#[command(name = "tunnelcheck", about = "IPsec tunnel fault-injection harness")]
struct Cli {
    /// Log host commands instead of executing them.
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,

    /// Run every host command inside this network namespace.
    #[arg(long, global = true)]
    netns: Option<String>,

    /// Append results to this CSV file.
    #[arg(long, global = true)]
    csv: Option<PathBuf>,

    /// Append results as JSON lines to this file.
    #[arg(long, global = true)]
    json: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scenarios of a TOML batch file.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run every mode × cipher preset for the selected faults.
    Matrix(MatrixArgs),
    /// Install SA pairs until the limit or the first refusal.
    Exhaust(ExhaustArgs),
    /// Print the SHA-256 of a file.
    Checksum { path: PathBuf },
}

#[derive(Args, Debug)]
struct HostArgs {
    #[arg(long)]
    local: IpAddr,

    #[arg(long)]
    remote: IpAddr,

    /// Interface shaped by impairment faults.
    #[arg(long, default_value = "eth0")]
    interface: String,

    /// Local protected subnet (required for tunnel mode).
    #[arg(long)]
    local_subnet: Option<Subnet>,

    /// Remote protected subnet (required for tunnel mode).
    #[arg(long)]
    remote_subnet: Option<Subnet>,
}

impl HostArgs {
    fn resolve(&self, netns: Option<String>) -> anyhow::Result<HostConfig> {
        let selectors = match (self.local_subnet, self.remote_subnet) {
            (Some(local), Some(remote)) => Some(TrafficSelectors { local, remote }),
            (None, None) => None,
            _ => anyhow::bail!("--local-subnet and --remote-subnet go together"),
        };
        Ok(HostConfig {
            local: self.local,
            remote: self.remote,
            interface: self.interface.clone(),
            selectors,
            mount: None,
            netns,
        })
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FaultKind {
    Rekey,
    KeyMismatch,
    Impairment,
    DeleteActive,
}

#[derive(Args, Debug)]
struct MatrixArgs {
    #[command(flatten)]
    host: HostArgs,

    /// Faults to run, comma separated.
    #[arg(long, value_enum, value_delimiter = ',', default_value = "rekey,key-mismatch,impairment")]
    faults: Vec<FaultKind>,

    /// Workload file or device.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Workload runtime in seconds.
    #[arg(long, default_value_t = 30)]
    runtime_s: u64,

    /// Seconds between workload start and the fault.
    #[arg(long)]
    settle_s: Option<u64>,

    /// Seconds to wait for recovery.
    #[arg(long)]
    recovery_timeout_s: Option<u64>,

    /// Capture ESP per scenario into this directory.
    #[arg(long)]
    capture_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExhaustArgs {
    #[command(flatten)]
    host: HostArgs,

    #[arg(long, default_value = "transport")]
    mode: Mode,

    #[arg(long, default_value = "AES-GCM-128")]
    cipher: String,

    #[arg(long, value_parser = parse_u32)]
    spi_base: Option<u32>,

    #[arg(long, value_parser = parse_u32)]
    reqid_base: Option<u32>,

    /// Number of pairs to install.
    #[arg(long)]
    count: Option<u32>,

    /// Keep going until the kernel refuses.
    #[arg(long, default_value_t = false)]
    until_fail: bool,

    /// Upper bound for --until-fail.
    #[arg(long)]
    cap: Option<u32>,

    /// Install in/out policies per pair (needs --reqid-base).
    #[arg(long, default_value_t = false)]
    with_policy: bool,

    /// Hex key template, varied per SA (AUTH,ENC for split ciphers).
    #[arg(long)]
    key_template: Option<String>,

    /// Sample state/policy counts every N pairs.
    #[arg(long)]
    progress_every: Option<u32>,

    /// Flush everything afterwards.
    #[arg(long, default_value_t = false)]
    cleanup: bool,
}

fn parse_u32(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("{text}: {e}"))
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Command::Checksum { path } = &cli.command {
        let digest = checksum::sha256_file(path)
            .with_context(|| format!("hashing {}", path.display()))?;
        println!("{digest}  {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    // SAFETY: geteuid has no preconditions and cannot fail.
    if !cli.dry_run && unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("tunnelcheck changes xfrm and tc state and must run as root (or with --dry-run)");
    }

    match &cli.command {
        Command::Run { config } => {
            let cfg = BatchConfig::from_file(config)?;
            let netns = cli.netns.clone().or_else(|| cfg.host.netns.clone());
            let executor = build_executor(cli.dry_run, netns.as_deref());
            tracing::info!(
                config = %config.display(),
                scenarios = cfg.scenarios.len(),
                dry_run = cli.dry_run,
                "batch starting"
            );
            run_batch(&cli, executor, &cfg.scenarios)
        }
        Command::Matrix(args) => {
            let host = args.host.resolve(cli.netns.clone())?;
            let executor = build_executor(cli.dry_run, cli.netns.as_deref());
            let base = ScenarioDefaults::default();
            let defaults = ScenarioDefaults {
                settle: args.settle_s.map(Duration::from_secs).unwrap_or(base.settle),
                recovery_timeout: args
                    .recovery_timeout_s
                    .map(Duration::from_secs)
                    .unwrap_or(base.recovery_timeout),
                ..base
            };
            let mut workload = WorkloadSpec {
                runtime: Duration::from_secs(args.runtime_s.max(1)),
                ..WorkloadSpec::default()
            };
            if let Some(target) = &args.target {
                workload.target = target.clone();
            }
            let faults: Vec<FaultSpec> = args
                .faults
                .iter()
                .map(|kind| match kind {
                    FaultKind::Rekey => FaultSpec::Rekey,
                    FaultKind::KeyMismatch => FaultSpec::KeyMismatch,
                    FaultKind::Impairment => FaultSpec::Impairment {
                        profile: host.default_impairment(),
                        hold: Duration::from_secs(20),
                    },
                    FaultKind::DeleteActive => FaultSpec::DeleteActive,
                })
                .collect();
            let specs = matrix_scenarios(&host, &defaults, &workload, &faults, args.capture_dir.as_ref());
            tracing::info!(scenarios = specs.len(), dry_run = cli.dry_run, "matrix starting");
            run_batch(&cli, executor, &specs)
        }
        Command::Exhaust(args) => {
            let host = args.host.resolve(cli.netns.clone())?;
            let executor = build_executor(cli.dry_run, cli.netns.as_deref());
            run_exhaustion(args, &host, executor)
        }
        Command::Checksum { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn build_executor(dry_run: bool, netns: Option<&str>) -> Arc<dyn CommandExecutor> {
    let base: Arc<dyn CommandExecutor> = if dry_run {
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(RealExecutor)
    };
    match netns {
        Some(ns) => Arc::new(NamespacedExecutor::new(base, ns)),
        None => base,
    }
}

fn run_batch(cli: &Cli, executor: Arc<dyn CommandExecutor>, specs: &[ScenarioSpec]) -> anyhow::Result<ExitCode> {
    let mut sink = MultiSink::new();
    if let Some(path) = &cli.csv {
        sink.push(Box::new(
            CsvSink::open(path).with_context(|| format!("opening {}", path.display()))?,
        ));
    }
    if let Some(path) = &cli.json {
        sink.push(Box::new(
            JsonLinesSink::open(path).with_context(|| format!("opening {}", path.display()))?,
        ));
    }

    let mut orchestrator = Orchestrator::new(executor);
    let summary = orchestrator.run_batch(specs, &mut sink);
    print_summary(&summary);

    Ok(if summary.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_summary(summary: &BatchSummary) {
    for r in &summary.results {
        let recovery = r
            .elapsed_recovery_secs()
            .map(|s| format!("{s:.1}s"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<15} {:<40} {} -> {}  {}  {}",
            r.outcome.to_string(),
            r.scenario,
            ScenarioResult::identifiers_label(&r.pre_identifiers),
            ScenarioResult::identifiers_label(&r.post_identifiers),
            recovery,
            r.notes_text()
        );
    }
    println!(
        "{} scenarios: {} passed, {} failed, {} errors",
        summary.results.len(),
        summary.passed(),
        summary.failed(),
        summary.errored()
    );
}

fn run_exhaustion(
    args: &ExhaustArgs,
    host: &HostConfig,
    executor: Arc<dyn CommandExecutor>,
) -> anyhow::Result<ExitCode> {
    let cipher = tunnelcheck_common::ciphers::CipherSuite::lookup(&args.cipher)
        .with_context(|| format!("unknown cipher preset {}", args.cipher))?;
    let input = ExhaustionConfigInput {
        spi_base: args.spi_base,
        reqid_base: args.reqid_base,
        max_pairs: args.count,
        until_failure: args.until_fail,
        cap: args.cap,
        with_policy: args.with_policy,
        key_template: args.key_template.clone(),
        progress_every: args.progress_every,
    };
    let spec = input.resolve(host, args.mode, cipher)?;

    let mut store = AssociationStore::new(executor);
    spec.validate(store.is_dry_run())?;
    let before = store.counts()?;
    let report = exhaust(&mut store, &spec)?;
    let after = store.counts()?;

    println!("base {}  mode {}  cipher {}", hex_spi(spec.spi_base), spec.mode, spec.cipher);
    println!("before: {} states, {} policies", before.0, before.1);
    for sample in &report.samples {
        println!(
            "  {:>8} pairs: {} states, {} policies",
            sample.pairs, sample.states, sample.policies
        );
    }
    println!("created {} pairs", report.created);
    if let Some(e) = &report.last_error {
        println!("stopped: {e}");
    }
    println!("after: {} states, {} policies", after.0, after.1);

    if args.cleanup {
        store.flush_all();
        println!("flushed");
    }
    Ok(ExitCode::SUCCESS)
}
