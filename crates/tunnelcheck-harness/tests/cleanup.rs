//! Whatever a scenario does, the host ends up with no SAs, no policies,
//! no shaping and no stray processes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tunnelcheck_common::ciphers::{AES_CBC_HMAC_SHA256, AES_GCM_128};
use tunnelcheck_common::error::ExecError;
use tunnelcheck_common::exec::{BackgroundProcess, CommandExecutor, CommandLine, CommandOutput};
use tunnelcheck_common::fault::{DeterministicFaultExecutor, FaultResponse, FaultRule};
use tunnelcheck_common::models::{
    ImpairmentProfile, Mode, Outcome, Phase, TrafficSelectors, WorkloadSpec,
};
use tunnelcheck_common::test_util::FakeHost;
use tunnelcheck_harness::capture::CaptureSpec;
use tunnelcheck_harness::exhaustion::ExhaustionSpec;
use tunnelcheck_harness::orchestrator::Orchestrator;
use tunnelcheck_harness::recovery::ManualClock;
use tunnelcheck_harness::scenario::{FaultSpec, ScenarioSpec};
use tunnelcheck_harness::sink::MemorySink;
use tunnelcheck_harness::xfrm::TunnelSpec;

fn local() -> IpAddr {
    "10.0.0.1".parse().unwrap()
}

fn remote() -> IpAddr {
    "10.0.0.2".parse().unwrap()
}

fn subnets() -> TrafficSelectors {
    TrafficSelectors {
        local: "10.1.0.0/16".parse().unwrap(),
        remote: "10.2.0.0/16".parse().unwrap(),
    }
}

fn scenario(name: &str, mode: Mode, fault: FaultSpec, dir: &tempfile::TempDir) -> ScenarioSpec {
    let mut tunnel = TunnelSpec::new(mode, &AES_GCM_128, local(), remote());
    if mode == Mode::Tunnel {
        tunnel = tunnel.with_selectors(subnets());
    }
    ScenarioSpec::builder(name, tunnel, fault)
        .interface("eth0")
        .workload(WorkloadSpec {
            target: dir.path().join(format!("{name}.bin")),
            runtime: Duration::from_secs(1),
            ..WorkloadSpec::default()
        })
        .recovery(Duration::from_secs(10), Duration::from_secs(1))
        .join_grace(Duration::from_secs(5))
        .build()
}

fn assert_clean(host: &FakeHost) {
    assert!(host.states().is_empty(), "states left: {:?}", host.states());
    assert!(host.policies().is_empty(), "policies left: {:?}", host.policies());
    assert_eq!(host.shaping_rules("eth0"), 0);
    assert_eq!(host.live_processes(), 0);
}

fn every_fault(mode: Mode) -> Vec<FaultSpec> {
    let mut exhaustion = ExhaustionSpec::new(mode, &AES_CBC_HMAC_SHA256, local(), remote());
    exhaustion.limit = tunnelcheck_harness::exhaustion::ExhaustionLimit::MaxPairs(8);
    exhaustion.reqid_base = Some(0x9000);
    if mode == Mode::Tunnel {
        exhaustion.selectors = Some(subnets());
    }
    vec![
        FaultSpec::Rekey,
        FaultSpec::KeyMismatch,
        FaultSpec::Impairment {
            profile: ImpairmentProfile::peer(remote(), 5.0, 50, 0.0),
            hold: Duration::from_secs(20),
        },
        FaultSpec::Impairment {
            profile: ImpairmentProfile::global(1.0, 20, 0.0),
            hold: Duration::from_secs(5),
        },
        FaultSpec::Exhaustion(exhaustion),
        FaultSpec::DeleteActive,
        FaultSpec::External {
            command: CommandLine::new("systemctl").args(["restart", "nvmf-target"]),
        },
    ]
}

#[test]
fn every_fault_kind_leaves_the_host_clean() {
    let dir = tempfile::tempdir().unwrap();
    for mode in [Mode::Transport, Mode::Tunnel] {
        for fault in every_fault(mode) {
            let host = Arc::new(FakeHost::new());
            let mut orch = Orchestrator::with_clock(host.clone(), Arc::new(ManualClock::new()));
            let spec = scenario(fault.name(), mode, fault, &dir);

            let result = orch.run_scenario(&spec).unwrap();

            assert_ne!(result.outcome, Outcome::Error, "{}: {:?}", spec.name, result.notes);
            assert_eq!(result.phases.last(), Some(&Phase::Teardown));
            assert_clean(&host);
            assert_eq!(orch.store().registered().count(), 0);
        }
    }
}

#[test]
fn capture_is_stopped_at_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeHost::new());
    let mut orch = Orchestrator::with_clock(host.clone(), Arc::new(ManualClock::new()));
    let mut spec = scenario("rekey", Mode::Transport, FaultSpec::Rekey, &dir);
    spec.capture = Some(CaptureSpec::esp("eth0", dir.path().join("rekey.pcap")));

    let result = orch.run_scenario(&spec).unwrap();

    assert_eq!(result.outcome, Outcome::PassGraceful);
    assert_eq!(host.count_matching("tcpdump -i eth0 -w"), 1);
    assert_clean(&host);
}

#[test]
fn bring_up_failure_is_an_error_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeHost::new());
    // The outbound SA goes in, the inbound one is refused.
    let faulty = DeterministicFaultExecutor::new(host.clone(), 7).with_rule(
        FaultRule::new(
            "xfrm state add",
            FaultResponse::exit(2, "RTNETLINK answers: File exists"),
        )
        .after(1)
        .times(1),
    );
    let mut orch = Orchestrator::with_clock(Arc::new(faulty), Arc::new(ManualClock::new()));

    let result = orch
        .run_scenario(&scenario("rekey", Mode::Transport, FaultSpec::Rekey, &dir))
        .unwrap();

    assert_eq!(result.outcome, Outcome::Error);
    assert!(result.notes_text().contains("File exists"), "{:?}", result.notes);
    assert!(result.workload.is_none());
    assert_eq!(host.count_matching("fio"), 0);
    assert_clean(&host);
}

#[test]
fn refused_impairment_is_an_error_and_leaves_no_shaping() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeHost::new());
    let faulty = DeterministicFaultExecutor::new(host.clone(), 3).with_rule(FaultRule::new(
        "netem",
        FaultResponse::exit(2, "Error: Specified qdisc kind is unknown."),
    ));
    let mut orch = Orchestrator::with_clock(Arc::new(faulty), Arc::new(ManualClock::new()));
    let fault = FaultSpec::Impairment {
        profile: ImpairmentProfile::peer(remote(), 2.0, 10, 10.0),
        hold: Duration::from_secs(20),
    };

    let result = orch
        .run_scenario(&scenario("lossy", Mode::Transport, fault, &dir))
        .unwrap();

    assert_eq!(result.outcome, Outcome::Error);
    assert!(
        result.notes_text().contains("shaping on eth0 failed: Error: Specified qdisc kind is unknown."),
        "{:?}",
        result.notes
    );
    assert_eq!(result.phases.last(), Some(&Phase::Teardown));
    assert_clean(&host);
}

#[test]
fn workload_outliving_its_join_is_stopped_at_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeHost::new().with_workload_duration(Duration::from_secs(600)));
    let mut orch = Orchestrator::with_clock(host.clone(), Arc::new(ManualClock::new()));
    let spec = ScenarioSpec {
        join_grace: Duration::from_millis(200),
        ..scenario("rekey", Mode::Transport, FaultSpec::Rekey, &dir)
    };

    let result = orch.run_scenario(&spec).unwrap();

    assert_eq!(result.outcome, Outcome::PassGraceful, "{:?}", result.notes);
    assert!(result.workload.is_none());
    assert!(result.notes_text().contains("did not finish"), "{:?}", result.notes);
    assert!(result.notes_text().contains("stopped at teardown"), "{:?}", result.notes);
    assert_clean(&host);
}

/// Delegates to a [`FakeHost`] but panics on any command mentioning `boom`.
struct PanickingExecutor {
    inner: Arc<FakeHost>,
}

impl CommandExecutor for PanickingExecutor {
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        if cmd.to_string().contains("boom") {
            panic!("executor blew up on `{cmd}`");
        }
        self.inner.run(cmd)
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn BackgroundProcess>, ExecError> {
        self.inner.spawn(cmd)
    }
}

#[test]
fn batch_survives_a_panicking_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeHost::new());
    let executor = Arc::new(PanickingExecutor { inner: host.clone() });
    let mut orch = Orchestrator::with_clock(executor, Arc::new(ManualClock::new()));

    let mut invalid = scenario("bad-poll", Mode::Transport, FaultSpec::Rekey, &dir);
    invalid.poll_interval = Duration::ZERO;
    let specs = vec![
        scenario(
            "external-panic",
            Mode::Transport,
            FaultSpec::External {
                command: CommandLine::new("/usr/local/bin/boom"),
            },
            &dir,
        ),
        invalid,
        scenario("rekey", Mode::Transport, FaultSpec::Rekey, &dir),
    ];
    let mut sink = MemorySink::new();

    let summary = orch.run_batch(&specs, &mut sink);

    assert_eq!(summary.results.len(), 3);
    assert_eq!(sink.results().len(), 3);
    assert_eq!(summary.results[0].outcome, Outcome::Error);
    assert!(summary.results[0].notes_text().contains("scenario panicked"));
    assert_eq!(summary.results[1].outcome, Outcome::Error);
    assert!(summary.results[1].notes_text().contains("poll interval"));
    assert_eq!(summary.results[2].outcome, Outcome::PassGraceful);
    assert_eq!(summary.errored(), 2);
    assert_eq!(summary.passed(), 1);
    assert!(!summary.all_passed());
    assert_clean(&host);
}
