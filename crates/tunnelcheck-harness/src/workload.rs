//! Storage workload driver built on `fio`.
//!
//! Background runs are watched by a monitor thread that polls the process
//! and hands the parsed result back over a bounded channel, the same shape
//! as any other worker in the harness: the caller owns a [`WorkloadHandle`]
//! and decides how long to wait.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Deserialize;
use tunnelcheck_common::error::WorkloadError;
use tunnelcheck_common::exec::{BackgroundProcess, CommandExecutor, CommandLine, CommandOutput};
use tunnelcheck_common::models::{IoStats, WorkloadResult, WorkloadSpec};

use crate::checksum;

const MONITOR_POLL: Duration = Duration::from_millis(50);
/// How long an interrupted fio gets before SIGKILL.
const KILL_AFTER: Duration = Duration::from_secs(2);

// ── fio report ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FioReport {
    #[serde(default)]
    jobs: Vec<FioJob>,
}

#[derive(Debug, Deserialize)]
struct FioJob {
    #[serde(default)]
    jobname: String,
    #[serde(default)]
    error: i64,
    #[serde(default)]
    read: FioDirection,
    #[serde(default)]
    write: FioDirection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FioDirection {
    io_bytes: u64,
    bw: u64,
    iops: f64,
    clat_ns: FioLatency,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FioLatency {
    percentile: BTreeMap<String, f64>,
}

impl FioDirection {
    fn stats(&self) -> Option<IoStats> {
        if self.io_bytes == 0 && self.bw == 0 {
            return None;
        }
        let percentile_us = |key: &str| self.clat_ns.percentile.get(key).map(|ns| ns / 1000.0);
        Some(IoStats {
            bandwidth_kib: self.bw,
            iops: self.iops,
            p99_latency_us: percentile_us("99.000000"),
            p999_latency_us: percentile_us("99.900000"),
        })
    }
}

fn looks_like_verify_failure(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("verify") || lower.contains("bad magic") || lower.contains("crc32c")
}

/// Turn a finished fio invocation into a result. Checksums are taken here
/// so the digest reflects the target at completion time.
fn complete(
    spec: &WorkloadSpec,
    output: CommandOutput,
    elapsed: Duration,
    dry_run: bool,
) -> Result<WorkloadResult, WorkloadError> {
    if !output.success() {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        if spec.verify && looks_like_verify_failure(&detail) {
            return Err(WorkloadError::Verification(detail));
        }
        return Err(WorkloadError::ToolFailed {
            status: output.status,
            stderr: detail,
        });
    }

    let Some(start) = output.stdout.find('{') else {
        if dry_run {
            return Ok(WorkloadResult {
                job: spec.name.clone(),
                status: output.status,
                verified: false,
                read: None,
                write: None,
                checksum: None,
                elapsed,
            });
        }
        return Err(WorkloadError::Report("no JSON object in fio output".into()));
    };
    let report: FioReport = serde_json::from_str(&output.stdout[start..])
        .map_err(|e| WorkloadError::Report(e.to_string()))?;
    let job = report
        .jobs
        .into_iter()
        .next()
        .ok_or_else(|| WorkloadError::Report("fio report has no jobs".into()))?;
    if job.error != 0 {
        let msg = format!("fio job {} reported error {}", job.jobname, job.error);
        return Err(if spec.verify {
            WorkloadError::Verification(msg)
        } else {
            WorkloadError::ToolFailed {
                status: job.error as i32,
                stderr: msg,
            }
        });
    }

    let checksum = if spec.verify && is_regular_file(&spec.target) {
        Some(digest(&spec.target)?)
    } else {
        None
    };

    Ok(WorkloadResult {
        job: if job.jobname.is_empty() {
            spec.name.clone()
        } else {
            job.jobname
        },
        status: output.status,
        verified: spec.verify,
        read: job.read.stats(),
        write: job.write.stats(),
        checksum,
        elapsed,
    })
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file())
}

fn digest(path: &Path) -> Result<String, WorkloadError> {
    checksum::sha256_file(path).map_err(|e| WorkloadError::Checksum {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

// ── Driver ──────────────────────────────────────────────────────────

pub enum JoinOutcome {
    Finished(Result<WorkloadResult, WorkloadError>),
    TimedOut,
}

pub struct WorkloadDriver {
    executor: Arc<dyn CommandExecutor>,
}

impl WorkloadDriver {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// The fio invocation for `spec`. JSON goes to stdout.
    pub fn command(spec: &WorkloadSpec) -> CommandLine {
        let mut cmd = CommandLine::new("fio")
            .arg(format!("--name={}", spec.name))
            .arg(format!("--filename={}", spec.target.display()))
            .arg(format!("--rw={}", spec.pattern.fio_rw()));
        if let Some(mix) = spec.pattern.read_mix() {
            cmd = cmd.arg(format!("--rwmixread={mix}"));
        }
        cmd = cmd
            .arg(format!("--bs={}", spec.block_size))
            .arg(format!("--size={}", spec.size))
            .arg(format!("--iodepth={}", spec.queue_depth))
            .arg(format!("--numjobs={}", spec.jobs))
            .arg(format!("--runtime={}s", spec.runtime.as_secs().max(1)))
            .arg("--time_based")
            .arg(format!("--ioengine={}", spec.ioengine))
            .arg(format!("--direct={}", u8::from(spec.direct)))
            .arg("--group_reporting")
            .arg("--output-format=json");
        if spec.verify {
            cmd = cmd.args(["--verify=crc32c", "--verify_fatal=1", "--do_verify=1"]);
        }
        cmd
    }

    fn prefill_command(spec: &WorkloadSpec) -> CommandLine {
        CommandLine::new("fio")
            .arg(format!("--name={}-prefill", spec.name))
            .arg(format!("--filename={}", spec.target.display()))
            .arg("--rw=write")
            .arg("--bs=1M")
            .arg(format!("--size={}", spec.size))
            .arg(format!("--ioengine={}", spec.ioengine))
            .arg(format!("--direct={}", u8::from(spec.direct)))
            .arg("--output-format=json")
    }

    /// Read patterns need data to read; write it first when the target file
    /// does not exist yet. Block devices are left alone.
    fn prefill(&self, spec: &WorkloadSpec) -> Result<(), WorkloadError> {
        let is_device = spec.target.starts_with("/dev");
        if !spec.prefill || !spec.pattern.reads() || is_device || spec.target.exists() {
            return Ok(());
        }
        tracing::info!(target = %spec.target.display(), size = %spec.size, "prefilling workload target");
        self.executor
            .run_checked(&Self::prefill_command(spec))
            .map(|_| ())
            .map_err(|e| WorkloadError::Start(format!("prefill failed: {}", e.diagnostic())))
    }

    /// Run to completion on the calling thread.
    pub fn run_foreground(&self, spec: &WorkloadSpec) -> Result<WorkloadResult, WorkloadError> {
        self.prefill(spec)?;
        let started = Instant::now();
        let output = self
            .executor
            .run(&Self::command(spec))
            .map_err(|e| WorkloadError::Start(e.diagnostic()))?;
        complete(spec, output, started.elapsed(), self.executor.is_dry_run())
    }

    /// Start fio and return immediately.
    pub fn run_background(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, WorkloadError> {
        self.prefill(spec)?;
        let process = self
            .executor
            .spawn(&Self::command(spec))
            .map_err(|e| WorkloadError::Start(e.diagnostic()))?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = MonitorContext {
            spec: spec.clone(),
            dry_run: self.executor.is_dry_run(),
            running: running.clone(),
            stop: stop.clone(),
        };
        let monitor = std::thread::Builder::new()
            .name(format!("fio-{}", spec.name))
            .spawn(move || {
                let result = ctx.watch(process);
                ctx.running.store(false, Ordering::SeqCst);
                let _ = tx.send(result);
            })
            .map_err(|e| WorkloadError::Start(format!("monitor thread: {e}")))?;

        tracing::info!(job = %spec.name, pattern = %spec.pattern.fio_rw(), "workload started");
        Ok(WorkloadHandle {
            job: spec.name.clone(),
            rx,
            running,
            stop,
            monitor: Some(monitor),
            outcome: None,
        })
    }

    /// Wait up to `timeout` for a background run. Once finished, repeated
    /// joins return the same result.
    pub fn join(&self, handle: &mut WorkloadHandle, timeout: Duration) -> JoinOutcome {
        handle.join(timeout)
    }

    pub fn is_running(&self, handle: &WorkloadHandle) -> bool {
        handle.running.load(Ordering::SeqCst)
    }

    /// Interrupt, wait `grace`, and kill if needed. `None` when the monitor
    /// did not report back in time.
    pub fn stop(
        &self,
        handle: &mut WorkloadHandle,
        grace: Duration,
    ) -> Option<Result<WorkloadResult, WorkloadError>> {
        handle.stop.store(true, Ordering::SeqCst);
        match handle.join(grace + KILL_AFTER + MONITOR_POLL * 2) {
            JoinOutcome::Finished(result) => Some(result),
            JoinOutcome::TimedOut => {
                tracing::warn!(job = %handle.job, "workload did not stop");
                None
            }
        }
    }

    /// Re-hash the target and compare with the digest taken at completion.
    pub fn verify_checksum(&self, spec: &WorkloadSpec, result: &WorkloadResult) -> Result<(), WorkloadError> {
        let Some(before) = &result.checksum else {
            return Ok(());
        };
        let after = digest(&spec.target)?;
        if *before != after {
            return Err(WorkloadError::ChecksumDrift {
                path: spec.target.display().to_string(),
                before: before.clone(),
                after,
            });
        }
        Ok(())
    }
}

struct MonitorContext {
    spec: WorkloadSpec,
    dry_run: bool,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl MonitorContext {
    fn watch(&self, mut process: Box<dyn BackgroundProcess>) -> Result<WorkloadResult, WorkloadError> {
        let started = Instant::now();
        let mut interrupted_at: Option<Instant> = None;
        let mut killed = false;
        loop {
            if self.stop.load(Ordering::SeqCst) && interrupted_at.is_none() {
                process.interrupt();
                interrupted_at = Some(Instant::now());
            }
            if let Some(at) = interrupted_at {
                if !killed && at.elapsed() >= KILL_AFTER {
                    process.kill();
                    killed = true;
                }
            }
            match process.try_finish() {
                Ok(Some(output)) => {
                    let elapsed = started.elapsed();
                    let result = complete(&self.spec, output, elapsed, self.dry_run);
                    match &result {
                        Ok(r) => tracing::info!(job = %r.job, ?elapsed, "workload finished"),
                        Err(e) => tracing::warn!(job = %self.spec.name, error = %e, "workload failed"),
                    }
                    return result;
                }
                Ok(None) => std::thread::sleep(MONITOR_POLL),
                Err(e) => {
                    return Err(WorkloadError::ToolFailed {
                        status: -1,
                        stderr: e.diagnostic(),
                    })
                }
            }
        }
    }
}

/// A background fio run. Dropping it asks the process to stop.
pub struct WorkloadHandle {
    job: String,
    rx: Receiver<Result<WorkloadResult, WorkloadError>>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
    outcome: Option<Result<WorkloadResult, WorkloadError>>,
}

impl WorkloadHandle {
    pub fn job(&self) -> &str {
        &self.job
    }

    fn join(&mut self, timeout: Duration) -> JoinOutcome {
        if let Some(outcome) = &self.outcome {
            return JoinOutcome::Finished(outcome.clone());
        }
        let result = match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => return JoinOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Err(WorkloadError::ToolFailed {
                status: -1,
                stderr: "workload monitor exited without a result".into(),
            }),
        };
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        self.outcome = Some(result.clone());
        JoinOutcome::Finished(result)
    }
}

impl Drop for WorkloadHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
