//! Scenario descriptions: what to bring up, what to break, and how to tell
//! that the tunnel came back.

use std::fmt;
use std::time::Duration;

use tunnelcheck_common::error::ConfigError;
use tunnelcheck_common::exec::CommandLine;
use tunnelcheck_common::models::{ImpairmentProfile, WorkloadSpec};

use crate::capture::CaptureSpec;
use crate::exhaustion::ExhaustionSpec;
use crate::xfrm::TunnelSpec;

pub const DEFAULT_SETTLE: Duration = Duration::from_secs(12);
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub enum FaultSpec {
    /// Replace the live pair with successor SPIs and fresh keys.
    Rekey,
    /// Same SPIs, keys the peer does not have.
    KeyMismatch,
    /// Shape traffic for `hold`, then clear.
    Impairment {
        profile: ImpairmentProfile,
        hold: Duration,
    },
    /// Fill the SA table alongside the live pair.
    Exhaustion(ExhaustionSpec),
    /// Remove the live pair without replacement.
    DeleteActive,
    /// Run an arbitrary command, e.g. restarting a daemon.
    External { command: CommandLine },
}

impl FaultSpec {
    pub fn name(&self) -> &'static str {
        match self {
            FaultSpec::Rekey => "rekey",
            FaultSpec::KeyMismatch => "key-mismatch",
            FaultSpec::Impairment { .. } => "impairment",
            FaultSpec::Exhaustion(_) => "exhaustion",
            FaultSpec::DeleteActive => "delete-active",
            FaultSpec::External { .. } => "external",
        }
    }

    pub fn default_probe(&self) -> RecoveryProbe {
        match self {
            FaultSpec::External { .. } => RecoveryProbe::Either,
            _ => RecoveryProbe::AssociationPresent,
        }
    }
}

impl fmt::Display for FaultSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What "recovered" means after the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryProbe {
    /// A complete SA pair with both policies for the scenario's endpoints.
    AssociationPresent,
    WorkloadRunning,
    Either,
}

impl RecoveryProbe {
    pub fn evaluate(self, association_present: impl FnOnce() -> bool, workload_running: bool) -> bool {
        match self {
            RecoveryProbe::AssociationPresent => association_present(),
            RecoveryProbe::WorkloadRunning => workload_running,
            RecoveryProbe::Either => workload_running || association_present(),
        }
    }
}

impl fmt::Display for RecoveryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecoveryProbe::AssociationPresent => "SA pair present",
            RecoveryProbe::WorkloadRunning => "workload running",
            RecoveryProbe::Either => "SA pair present or workload running",
        })
    }
}

impl std::str::FromStr for RecoveryProbe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "association_present" | "sa" => Ok(RecoveryProbe::AssociationPresent),
            "workload_running" | "workload" => Ok(RecoveryProbe::WorkloadRunning),
            "either" => Ok(RecoveryProbe::Either),
            other => Err(format!("unknown recovery probe: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub name: String,
    pub tunnel: TunnelSpec,
    /// Interface shaped by impairment faults.
    pub interface: String,
    pub workload: WorkloadSpec,
    pub fault: FaultSpec,
    /// Wait between starting the workload and the baseline snapshot.
    pub settle: Duration,
    pub recovery_timeout: Duration,
    pub poll_interval: Duration,
    pub probe: Option<RecoveryProbe>,
    /// Extra time given to the workload beyond its runtime.
    pub join_grace: Duration,
    pub capture: Option<CaptureSpec>,
}

impl ScenarioSpec {
    pub fn builder(name: impl Into<String>, tunnel: TunnelSpec, fault: FaultSpec) -> ScenarioBuilder {
        ScenarioBuilder {
            spec: ScenarioSpec {
                name: name.into(),
                tunnel,
                interface: "eth0".into(),
                workload: WorkloadSpec::default(),
                fault,
                settle: DEFAULT_SETTLE,
                recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
                poll_interval: DEFAULT_POLL_INTERVAL,
                probe: None,
                join_grace: DEFAULT_JOIN_GRACE,
                capture: None,
            },
        }
    }

    pub fn probe(&self) -> RecoveryProbe {
        self.probe.unwrap_or_else(|| self.fault.default_probe())
    }

    pub fn validate(&self, dry_run: bool) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::new("scenario name is empty"));
        }
        let scoped = |e: ConfigError| ConfigError::new(format!("{}: {}", self.name, e.0));
        self.tunnel.validate().map_err(scoped)?;
        self.workload.validate().map_err(scoped)?;
        if self.poll_interval.is_zero() {
            return Err(scoped(ConfigError::new("poll interval must be positive")));
        }
        match &self.fault {
            FaultSpec::Impairment { profile, .. } => {
                if self.interface.trim().is_empty() {
                    return Err(scoped(ConfigError::new("impairment needs an interface")));
                }
                profile
                    .validate()
                    .map_err(|e| scoped(ConfigError::new(format!("impairment: {e}"))))?;
            }
            FaultSpec::Exhaustion(ex) => ex.validate(dry_run).map_err(scoped)?,
            FaultSpec::External { command } if command.program().is_empty() => {
                return Err(scoped(ConfigError::new("external fault has no command")));
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct ScenarioBuilder {
    spec: ScenarioSpec,
}

impl ScenarioBuilder {
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.spec.interface = interface.into();
        self
    }

    pub fn workload(mut self, workload: WorkloadSpec) -> Self {
        self.spec.workload = workload;
        self
    }

    pub fn settle(mut self, settle: Duration) -> Self {
        self.spec.settle = settle;
        self
    }

    pub fn recovery(mut self, timeout: Duration, poll: Duration) -> Self {
        self.spec.recovery_timeout = timeout;
        self.spec.poll_interval = poll;
        self
    }

    pub fn probe(mut self, probe: RecoveryProbe) -> Self {
        self.spec.probe = Some(probe);
        self
    }

    pub fn join_grace(mut self, grace: Duration) -> Self {
        self.spec.join_grace = grace;
        self
    }

    pub fn capture(mut self, capture: CaptureSpec) -> Self {
        self.spec.capture = Some(capture);
        self
    }

    pub fn build(self) -> ScenarioSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelcheck_common::ciphers::AES_GCM_128;
    use tunnelcheck_common::models::Mode;

    fn tunnel() -> TunnelSpec {
        TunnelSpec::new(
            Mode::Transport,
            &AES_GCM_128,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        )
    }

    #[test]
    fn default_probes() {
        assert_eq!(FaultSpec::Rekey.default_probe(), RecoveryProbe::AssociationPresent);
        let external = FaultSpec::External {
            command: CommandLine::new("systemctl").args(["restart", "strongswan"]),
        };
        assert_eq!(external.default_probe(), RecoveryProbe::Either);
        let spec = ScenarioSpec::builder("x", tunnel(), external)
            .probe(RecoveryProbe::WorkloadRunning)
            .build();
        assert_eq!(spec.probe(), RecoveryProbe::WorkloadRunning);
    }

    #[test]
    fn probe_evaluation() {
        assert!(RecoveryProbe::Either.evaluate(|| false, true));
        assert!(!RecoveryProbe::AssociationPresent.evaluate(|| false, true));
        assert!(RecoveryProbe::WorkloadRunning.evaluate(|| unreachable!(), true));
        assert_eq!("workload-running".parse::<RecoveryProbe>(), Ok(RecoveryProbe::WorkloadRunning));
    }

    #[test]
    fn invalid_impairment_is_a_config_error() {
        let fault = FaultSpec::Impairment {
            profile: ImpairmentProfile::global(150.0, 10, 0.0),
            hold: Duration::from_secs(1),
        };
        let err = ScenarioSpec::builder("bad-loss", tunnel(), fault)
            .build()
            .validate(false)
            .unwrap_err();
        assert!(err.0.starts_with("bad-loss: impairment"));
    }

    #[test]
    fn builder_overrides() {
        let spec = ScenarioSpec::builder("rekey", tunnel(), FaultSpec::Rekey)
            .interface("veth0")
            .settle(Duration::ZERO)
            .recovery(Duration::from_secs(5), Duration::from_millis(200))
            .build();
        assert_eq!(spec.interface, "veth0");
        assert_eq!(spec.recovery_timeout, Duration::from_secs(5));
        assert!(spec.validate(false).is_ok());
        assert_eq!(spec.fault.to_string(), "rekey");
    }
}
