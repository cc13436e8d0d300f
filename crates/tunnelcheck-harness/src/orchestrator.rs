//! Scenario orchestration.
//!
//! ```text
//! Setup ─▶ Workload ─▶ Baseline ─▶ Fault ─▶ Recovery ─▶ Verify ─▶ Teardown
//! ```
//!
//! Everything acquired after Setup is owned by a [`TeardownScope`], which
//! releases it in a fixed order (impairment, workload, associations,
//! capture) on every exit path, unwinding included.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tunnelcheck_common::error::{ConfigError, HarnessError, TimeoutError, WorkloadError};
use tunnelcheck_common::exec::CommandExecutor;
use tunnelcheck_common::models::{Outcome, Phase, SaPair, ScenarioResult, WorkloadResult};
use tunnelcheck_netem::impairment::ImpairmentController;

use crate::capture::PacketCapture;
use crate::exhaustion::exhaust;
use crate::recovery::{wait_until, Clock, Recovery, SystemClock};
use crate::scenario::{FaultSpec, RecoveryProbe, ScenarioSpec};
use crate::sink::ResultSink;
use crate::workload::{JoinOutcome, WorkloadDriver, WorkloadHandle};
use crate::xfrm::{AssociationStore, IdentityFilter};

const STOP_GRACE: Duration = Duration::from_secs(5);

// ── Observation & classification ────────────────────────────────────

/// What a scenario saw, independent of how it is judged.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub pre: Vec<u32>,
    pub post: Vec<u32>,
    pub probe: Option<RecoveryProbe>,
    pub recovery: Option<Recovery>,
    /// Post-fault tables hold a complete pair for the scenario's endpoints.
    pub valid_pair: bool,
    pub workload: Option<WorkloadResult>,
    pub workload_failure: Option<WorkloadError>,
    pub notes: Vec<String>,
}

/// First matching rule wins:
///
/// 1. recovery probe never held: `Fail`
/// 2. workload failed or verification failed: `Fail`
/// 3. same non-empty identifiers before and after: `PassPersistent`
/// 4. identifiers changed and a complete pair exists: `PassGraceful`
/// 5. nothing was linked to the scenario but the workload probe held: `Pass`
/// 6. otherwise `Fail`
///
/// The probe only decides whether recovery happened; identifiers decide
/// how it passed.
pub fn classify(obs: &Observation) -> (Outcome, Option<String>) {
    let Some(recovery) = obs.recovery else {
        return (Outcome::Error, Some("scenario ended before recovery".into()));
    };
    if !recovery.succeeded {
        let probe = obs.probe.unwrap_or(RecoveryProbe::AssociationPresent);
        let err = TimeoutError {
            what: probe.to_string(),
            waited: recovery.elapsed,
        };
        return (Outcome::Fail, Some(err.to_string()));
    }
    if let Some(e) = &obs.workload_failure {
        return (Outcome::Fail, Some(e.to_string()));
    }
    if !obs.pre.is_empty() && obs.pre == obs.post {
        return (Outcome::PassPersistent, None);
    }
    if obs.pre != obs.post && obs.valid_pair {
        return (Outcome::PassGraceful, None);
    }
    let association_probe = matches!(obs.probe, None | Some(RecoveryProbe::AssociationPresent));
    if obs.pre.is_empty() && obs.post.is_empty() && !association_probe {
        return (Outcome::Pass, None);
    }
    (
        Outcome::Fail,
        Some(format!(
            "identifiers went from {} to {} without a complete pair",
            ScenarioResult::identifiers_label(&obs.pre),
            ScenarioResult::identifiers_label(&obs.post)
        )),
    )
}

// ── Teardown ────────────────────────────────────────────────────────

struct TeardownScope<'a> {
    store: &'a mut AssociationStore,
    netem: &'a mut ImpairmentController,
    driver: &'a WorkloadDriver,
    interface: &'a str,
    shaped: bool,
    join_grace: Duration,
    workload: Option<WorkloadHandle>,
    capture: Option<PacketCapture>,
    notes: Vec<String>,
    released: bool,
}

impl TeardownScope<'_> {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut interfaces = self.netem.active_interfaces();
        if self.shaped && !interfaces.iter().any(|i| i == self.interface) {
            interfaces.push(self.interface.to_string());
        }
        for interface in interfaces {
            if let Err(e) = self.netem.clear(&interface) {
                tracing::warn!(%interface, error = %e, "impairment not cleared");
                self.notes.push(e.to_string());
            }
        }

        if let Some(mut handle) = self.workload.take() {
            if self.driver.is_running(&handle) {
                if let JoinOutcome::TimedOut = self.driver.join(&mut handle, self.join_grace) {
                    self.notes.push(format!("workload {} stopped at teardown", handle.job()));
                    let _ = self.driver.stop(&mut handle, STOP_GRACE);
                }
            }
        }

        self.store.flush_all();

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }
}

impl Drop for TeardownScope<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    executor: Arc<dyn CommandExecutor>,
    clock: Arc<dyn Clock>,
    store: AssociationStore,
    netem: ImpairmentController,
    driver: WorkloadDriver,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self::with_clock(executor, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(executor: Arc<dyn CommandExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: AssociationStore::new(executor.clone()),
            netem: ImpairmentController::new(executor.clone()),
            driver: WorkloadDriver::new(executor.clone()),
            executor,
            clock,
        }
    }

    pub fn store(&self) -> &AssociationStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut AssociationStore {
        &mut self.store
    }

    pub fn netem(&self) -> &ImpairmentController {
        &self.netem
    }

    /// Run one scenario to a classified result. Only an invalid scenario is
    /// an `Err`; every failure after validation becomes an outcome.
    pub fn run_scenario(&mut self, spec: &ScenarioSpec) -> Result<ScenarioResult, ConfigError> {
        spec.validate(self.executor.is_dry_run())?;
        let timestamp = Utc::now();
        tracing::info!(
            scenario = %spec.name,
            mode = %spec.tunnel.mode,
            cipher = %spec.tunnel.cipher,
            fault = %spec.fault,
            "scenario starting"
        );

        let mut obs = Observation::default();
        let mut phases = Vec::new();
        let (driven, teardown_notes) = {
            let mut scope = TeardownScope {
                store: &mut self.store,
                netem: &mut self.netem,
                driver: &self.driver,
                interface: &spec.interface,
                shaped: matches!(spec.fault, FaultSpec::Impairment { .. }),
                join_grace: spec.join_grace,
                workload: None,
                capture: None,
                notes: Vec::new(),
                released: false,
            };
            let driven = drive(
                &mut scope,
                &self.executor,
                self.clock.as_ref(),
                spec,
                &mut obs,
                &mut phases,
            );
            scope.release();
            (driven, std::mem::take(&mut scope.notes))
        };
        phases.push(Phase::Teardown);

        let (outcome, verdict) = match driven {
            Ok(()) => classify(&obs),
            Err(e) => {
                tracing::error!(scenario = %spec.name, error = %e, "scenario aborted");
                (Outcome::Error, Some(e.to_string()))
            }
        };
        let mut notes: Vec<String> = verdict.into_iter().collect();
        notes.append(&mut obs.notes);
        notes.extend(teardown_notes);

        let result = ScenarioResult {
            timestamp,
            scenario: spec.name.clone(),
            mode: spec.tunnel.mode,
            cipher: spec.tunnel.cipher.name.to_string(),
            target: spec.workload.target.display().to_string(),
            outcome,
            pre_identifiers: obs.pre,
            post_identifiers: obs.post,
            elapsed_recovery: obs.recovery.filter(|r| r.succeeded).map(|r| r.elapsed),
            notes,
            phases,
            workload: obs.workload,
        };
        tracing::info!(
            scenario = %result.scenario,
            outcome = %result.outcome,
            recovery_s = ?result.elapsed_recovery_secs(),
            "scenario finished"
        );
        Ok(result)
    }

    /// Run every scenario in order. Invalid or panicking scenarios are
    /// recorded as `Error` and the batch goes on.
    pub fn run_batch(&mut self, specs: &[ScenarioSpec], sink: &mut dyn ResultSink) -> BatchSummary {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let attempt = panic::catch_unwind(AssertUnwindSafe(|| self.run_scenario(spec)));
            let result = match attempt {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    tracing::error!(scenario = %spec.name, error = %e, "invalid scenario");
                    error_result(spec, e.to_string())
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    tracing::error!(scenario = %spec.name, panic = %msg, "scenario panicked");
                    self.store.flush_all();
                    error_result(spec, format!("scenario panicked: {msg}"))
                }
            };
            if let Err(e) = sink.record(&result) {
                tracing::warn!(scenario = %spec.name, error = %e, "result not recorded");
            }
            results.push(result);
        }
        BatchSummary { results }
    }
}

fn drive(
    scope: &mut TeardownScope<'_>,
    executor: &Arc<dyn CommandExecutor>,
    clock: &dyn Clock,
    spec: &ScenarioSpec,
    obs: &mut Observation,
    phases: &mut Vec<Phase>,
) -> Result<(), HarnessError> {
    phases.push(Phase::Setup);
    scope.store.flush_all();
    let pair = scope.store.bring_up(&spec.tunnel)?;
    let filter = match spec.fault {
        // Whatever re-establishes the tunnel may pick its own reqid.
        FaultSpec::External { .. } => IdentityFilter {
            reqid: None,
            ..IdentityFilter::for_pair(&pair)
        },
        _ => IdentityFilter::for_pair(&pair),
    };
    if let Some(capture) = &spec.capture {
        scope.capture = PacketCapture::start(executor, capture);
    }

    phases.push(Phase::Workload);
    scope.workload = Some(scope.driver.run_background(&spec.workload)?);
    clock.sleep(spec.settle);

    phases.push(Phase::Baseline);
    obs.pre = scope.store.snapshot()?.identifiers(&filter);
    tracing::info!(pre = %ScenarioResult::identifiers_label(&obs.pre), "baseline");

    phases.push(Phase::Fault);
    inject(scope, executor, clock, spec, &pair, obs)?;

    phases.push(Phase::Recovery);
    let probe = spec.probe();
    obs.probe = Some(probe);
    let recovery = {
        let store = &*scope.store;
        let driver = scope.driver;
        let workload = scope.workload.as_ref();
        wait_until(
            clock,
            || {
                let running = workload.is_some_and(|h| driver.is_running(h));
                probe.evaluate(
                    || {
                        store
                            .snapshot()
                            .map(|s| s.has_valid_pair(&filter))
                            .unwrap_or(false)
                    },
                    running,
                )
            },
            spec.recovery_timeout,
            spec.poll_interval,
        )
    };
    obs.recovery = Some(recovery);
    match scope.store.snapshot() {
        Ok(snapshot) => {
            obs.post = snapshot.identifiers(&filter);
            obs.valid_pair = snapshot.has_valid_pair(&filter);
            obs.notes.extend(snapshot.defects());
        }
        Err(e) => obs.notes.push(format!("post-fault snapshot failed: {e}")),
    }
    tracing::info!(
        post = %ScenarioResult::identifiers_label(&obs.post),
        recovered = recovery.succeeded,
        elapsed = ?recovery.elapsed,
        "recovery"
    );

    phases.push(Phase::Verify);
    if let Some(handle) = scope.workload.as_mut() {
        match scope.driver.join(handle, spec.workload.runtime + spec.join_grace) {
            JoinOutcome::Finished(Ok(result)) => {
                if let Err(e) = scope.driver.verify_checksum(&spec.workload, &result) {
                    obs.workload_failure = Some(e);
                }
                obs.workload = Some(result);
            }
            JoinOutcome::Finished(Err(e)) => obs.workload_failure = Some(e),
            JoinOutcome::TimedOut => obs.notes.push(format!(
                "workload {} did not finish within its runtime plus {:?}",
                handle.job(),
                spec.join_grace
            )),
        }
    }
    Ok(())
}

fn inject(
    scope: &mut TeardownScope<'_>,
    executor: &Arc<dyn CommandExecutor>,
    clock: &dyn Clock,
    spec: &ScenarioSpec,
    pair: &SaPair,
    obs: &mut Observation,
) -> Result<(), HarnessError> {
    tracing::info!(fault = %spec.fault, "injecting fault");
    match &spec.fault {
        FaultSpec::Rekey => {
            scope.store.rekey(pair)?;
        }
        FaultSpec::KeyMismatch => {
            scope.store.replace_with_mismatched_keys(pair)?;
        }
        FaultSpec::Impairment { profile, hold } => {
            scope.netem.apply(scope.interface, profile)?;
            clock.sleep(*hold);
            scope.netem.clear(scope.interface)?;
        }
        FaultSpec::Exhaustion(exhaustion) => {
            let report = exhaust(scope.store, exhaustion)?;
            obs.notes.push(format!("exhaustion installed {} pairs", report.created));
            if let Some(e) = report.last_error {
                obs.notes.push(format!("exhaustion stopped: {e}"));
            }
        }
        FaultSpec::DeleteActive => scope.store.delete_pair(pair)?,
        FaultSpec::External { command } => {
            executor.run_checked(command)?;
        }
    }
    Ok(())
}

/// The row recorded for a scenario that never produced a result.
pub fn error_result(spec: &ScenarioSpec, note: String) -> ScenarioResult {
    ScenarioResult {
        timestamp: Utc::now(),
        scenario: spec.name.clone(),
        mode: spec.tunnel.mode,
        cipher: spec.tunnel.cipher.name.to_string(),
        target: spec.workload.target.display().to_string(),
        outcome: Outcome::Error,
        pre_identifiers: Vec::new(),
        post_identifiers: Vec::new(),
        elapsed_recovery: None,
        notes: vec![note],
        phases: Vec::new(),
        workload: None,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub results: Vec<ScenarioResult>,
}

impl BatchSummary {
    fn count(&self, pred: impl Fn(Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(r.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Outcome::is_pass)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| o == Outcome::Fail)
    }

    pub fn errored(&self) -> usize {
        self.count(|o| o == Outcome::Error)
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.results.len()
    }
}
