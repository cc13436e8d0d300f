use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tunnelcheck_common::ciphers::{CipherSuite, CIPHER_SUITES};
use tunnelcheck_common::error::ConfigError;
use tunnelcheck_common::exec::CommandLine;
use tunnelcheck_common::models::{
    AccessPattern, ImpairmentProfile, ImpairmentScope, Mode, Subnet, TrafficSelectors, WorkloadSpec,
};

use crate::capture::CaptureSpec;
use crate::exhaustion::{ExhaustionLimit, ExhaustionSpec, KeyStrategy, DEFAULT_SPI_BASE};
use crate::scenario::{
    FaultSpec, ScenarioSpec, DEFAULT_JOIN_GRACE, DEFAULT_POLL_INTERVAL, DEFAULT_RECOVERY_TIMEOUT,
    DEFAULT_SETTLE,
};
use crate::xfrm::TunnelSpec;

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_IMPAIRMENT_HOLD: Duration = Duration::from_secs(20);

// ── Input (as written in TOML) ──────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchConfigInput {
    pub version: u32,
    pub host: HostConfigInput,
    pub defaults: DefaultsConfigInput,
    pub workload: WorkloadConfigInput,
    pub capture: CaptureConfigInput,
    pub scenario: Vec<ScenarioConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfigInput {
    pub local: Option<String>,
    pub remote: Option<String>,
    pub interface: Option<String>,
    pub local_subnet: Option<String>,
    pub remote_subnet: Option<String>,
    /// Directory holding the workload file when no target is given.
    pub mount: Option<String>,
    pub netns: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsConfigInput {
    pub settle_s: Option<u64>,
    pub recovery_timeout_s: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub join_grace_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkloadConfigInput {
    pub target: Option<String>,
    pub pattern: Option<String>,
    pub block_size: Option<String>,
    pub size: Option<String>,
    pub queue_depth: Option<u32>,
    pub jobs: Option<u32>,
    pub runtime_s: Option<u64>,
    pub ioengine: Option<String>,
    pub direct: Option<bool>,
    pub verify: Option<bool>,
    pub prefill: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaptureConfigInput {
    /// Capture ESP per scenario into `<dir>/<scenario>.pcap`.
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScenarioConfigInput {
    pub name: String,
    pub mode: Option<String>,
    pub cipher: Option<String>,
    pub fault: String,
    pub spi_base: Option<u32>,
    pub reqid: Option<u32>,
    pub probe: Option<String>,
    pub pattern: Option<String>,
    pub settle_s: Option<u64>,
    pub recovery_timeout_s: Option<u64>,
    pub impairment: Option<ImpairmentConfigInput>,
    pub external: Option<ExternalConfigInput>,
    pub exhaustion: Option<ExhaustionConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImpairmentConfigInput {
    pub loss_percent: f32,
    pub delay_ms: u32,
    pub reorder_percent: f32,
    pub jitter_ms: Option<u32>,
    pub duplicate_percent: Option<f32>,
    pub corrupt_percent: Option<f32>,
    pub rate_kbit: Option<u64>,
    /// Peer to impair; defaults to the remote endpoint.
    pub target: Option<String>,
    pub global: bool,
    pub hold_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExternalConfigInput {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExhaustionConfigInput {
    pub spi_base: Option<u32>,
    pub reqid_base: Option<u32>,
    pub max_pairs: Option<u32>,
    pub until_failure: bool,
    pub cap: Option<u32>,
    pub with_policy: bool,
    pub key_template: Option<String>,
    pub progress_every: Option<u32>,
}

// ── Resolved ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub local: IpAddr,
    pub remote: IpAddr,
    pub interface: String,
    pub selectors: Option<TrafficSelectors>,
    pub mount: Option<PathBuf>,
    pub netns: Option<String>,
}

impl HostConfig {
    pub fn tunnel(&self, mode: Mode, cipher: &'static CipherSuite) -> TunnelSpec {
        let tunnel = TunnelSpec::new(mode, cipher, self.local, self.remote);
        match self.selectors {
            Some(selectors) => tunnel.with_selectors(selectors),
            None => tunnel,
        }
    }

    /// Scoped 2% loss, 10 ms delay, 10% reorder towards the remote.
    pub fn default_impairment(&self) -> ImpairmentProfile {
        ImpairmentProfile::peer(self.remote, 2.0, 10, 10.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioDefaults {
    pub settle: Duration,
    pub recovery_timeout: Duration,
    pub poll_interval: Duration,
    pub join_grace: Duration,
}

impl Default for ScenarioDefaults {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_grace: DEFAULT_JOIN_GRACE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub version: u32,
    pub host: HostConfig,
    pub defaults: ScenarioDefaults,
    pub workload: WorkloadSpec,
    pub capture_dir: Option<PathBuf>,
    pub scenarios: Vec<ScenarioSpec>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_addr(field: &str, value: Option<String>) -> Result<IpAddr, ConfigError> {
    let value = non_empty(value).ok_or_else(|| ConfigError::new(format!("{field} is required")))?;
    value
        .parse()
        .map_err(|_| ConfigError::new(format!("{field}: invalid address {value}")))
}

fn parse_cipher(name: Option<&str>) -> Result<&'static CipherSuite, ConfigError> {
    match name {
        None => Ok(CIPHER_SUITES[0]),
        Some(name) => CipherSuite::lookup(name)
            .ok_or_else(|| ConfigError::new(format!("unknown cipher preset {name}"))),
    }
}

impl HostConfigInput {
    fn resolve(self) -> Result<HostConfig, ConfigError> {
        let local = parse_addr("host.local", self.local)?;
        let remote = parse_addr("host.remote", self.remote)?;
        let selectors = match (non_empty(self.local_subnet), non_empty(self.remote_subnet)) {
            (Some(l), Some(r)) => Some(TrafficSelectors {
                local: l.parse::<Subnet>()?,
                remote: r.parse::<Subnet>()?,
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::new(
                    "host.local_subnet and host.remote_subnet go together",
                ))
            }
        };
        Ok(HostConfig {
            local,
            remote,
            interface: non_empty(self.interface).unwrap_or_else(|| "eth0".into()),
            selectors,
            mount: non_empty(self.mount).map(PathBuf::from),
            netns: non_empty(self.netns),
        })
    }
}

impl DefaultsConfigInput {
    fn resolve(self) -> ScenarioDefaults {
        let base = ScenarioDefaults::default();
        ScenarioDefaults {
            settle: self.settle_s.map(Duration::from_secs).unwrap_or(base.settle),
            recovery_timeout: self
                .recovery_timeout_s
                .map(Duration::from_secs)
                .unwrap_or(base.recovery_timeout),
            poll_interval: self
                .poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(10)))
                .unwrap_or(base.poll_interval),
            join_grace: self.join_grace_s.map(Duration::from_secs).unwrap_or(base.join_grace),
        }
    }
}

impl WorkloadConfigInput {
    fn resolve(self, mount: Option<&PathBuf>) -> Result<WorkloadSpec, ConfigError> {
        let base = WorkloadSpec::default();
        let target = match (non_empty(self.target), mount) {
            (Some(t), _) => PathBuf::from(t),
            (None, Some(m)) => m.join(&base.target),
            (None, None) => base.target.clone(),
        };
        let pattern = match non_empty(self.pattern) {
            Some(p) => p.parse::<AccessPattern>().map_err(ConfigError::new)?,
            None => base.pattern,
        };
        let spec = WorkloadSpec {
            target,
            pattern,
            block_size: non_empty(self.block_size).unwrap_or(base.block_size),
            size: non_empty(self.size).unwrap_or(base.size),
            queue_depth: self.queue_depth.unwrap_or(base.queue_depth),
            jobs: self.jobs.unwrap_or(base.jobs),
            runtime: self.runtime_s.map(Duration::from_secs).unwrap_or(base.runtime),
            ioengine: non_empty(self.ioengine).unwrap_or(base.ioengine),
            direct: self.direct.unwrap_or(base.direct),
            verify: self.verify.unwrap_or(base.verify),
            prefill: self.prefill.unwrap_or(base.prefill),
            name: base.name,
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl ImpairmentConfigInput {
    fn resolve(self, host: &HostConfig) -> Result<FaultSpec, ConfigError> {
        let scope = if self.global {
            ImpairmentScope::Global
        } else {
            let target = match non_empty(self.target) {
                Some(t) => t
                    .parse()
                    .map_err(|_| ConfigError::new(format!("impairment target {t} is not an address")))?,
                None => host.remote,
            };
            ImpairmentScope::Peer(target)
        };
        let profile = ImpairmentProfile {
            loss_percent: self.loss_percent,
            delay_ms: self.delay_ms,
            reorder_percent: self.reorder_percent,
            jitter_ms: self.jitter_ms,
            duplicate_percent: self.duplicate_percent,
            corrupt_percent: self.corrupt_percent,
            rate_kbit: self.rate_kbit,
            scope,
        };
        profile.validate().map_err(ConfigError::new)?;
        Ok(FaultSpec::Impairment {
            profile,
            hold: self
                .hold_s
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IMPAIRMENT_HOLD),
        })
    }
}

impl ExhaustionConfigInput {
    pub fn resolve(
        self,
        host: &HostConfig,
        mode: Mode,
        cipher: &'static CipherSuite,
    ) -> Result<ExhaustionSpec, ConfigError> {
        let mut spec = ExhaustionSpec::new(mode, cipher, host.local, host.remote);
        spec.selectors = host.selectors;
        spec.spi_base = self.spi_base.unwrap_or(DEFAULT_SPI_BASE);
        spec.reqid_base = self.reqid_base;
        spec.with_policy = self.with_policy;
        spec.progress_every = self.progress_every;
        spec.limit = if self.until_failure {
            ExhaustionLimit::UntilFailure { cap: self.cap }
        } else {
            ExhaustionLimit::MaxPairs(self.max_pairs.unwrap_or(1000))
        };
        if let Some(template) = non_empty(self.key_template) {
            spec.keys = KeyStrategy::Template(cipher.parse_keys(&template)?);
        }
        Ok(spec)
    }
}

impl ScenarioConfigInput {
    fn resolve(
        self,
        host: &HostConfig,
        defaults: &ScenarioDefaults,
        workload: &WorkloadSpec,
        capture_dir: Option<&PathBuf>,
    ) -> Result<ScenarioSpec, ConfigError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::new("scenario without a name"));
        }
        let scoped = |e: ConfigError| ConfigError::new(format!("scenario {name}: {}", e.0));

        let mode = match non_empty(self.mode) {
            Some(m) => m.parse::<Mode>().map_err(|e| scoped(ConfigError::new(e)))?,
            None => Mode::Tunnel,
        };
        let cipher = parse_cipher(self.cipher.as_deref()).map_err(scoped)?;

        let fault = match self.fault.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "rekey" => FaultSpec::Rekey,
            "key-mismatch" => FaultSpec::KeyMismatch,
            "delete-active" => FaultSpec::DeleteActive,
            "impairment" => self
                .impairment
                .ok_or_else(|| ConfigError::new("impairment fault needs an [scenario.impairment] table"))
                .and_then(|i| i.resolve(host))
                .map_err(scoped)?,
            "exhaustion" => FaultSpec::Exhaustion(
                self.exhaustion
                    .unwrap_or_default()
                    .resolve(host, mode, cipher)
                    .map_err(scoped)?,
            ),
            "external" => {
                let argv = self.external.map(|e| e.command).unwrap_or_default();
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| scoped(ConfigError::new("external fault needs a command")))?;
                FaultSpec::External {
                    command: CommandLine::new(program.as_str()).args(args.iter().cloned()),
                }
            }
            other => return Err(scoped(ConfigError::new(format!("unknown fault {other:?}")))),
        };

        let mut tunnel = host.tunnel(mode, cipher);
        if let Some(base) = self.spi_base {
            tunnel = tunnel.with_spi_base(base);
        }
        if let Some(reqid) = self.reqid {
            tunnel = tunnel.with_reqid(reqid);
        }

        let mut workload = WorkloadSpec {
            name: job_name(&name),
            ..workload.clone()
        };
        if let Some(pattern) = non_empty(self.pattern) {
            workload.pattern = pattern
                .parse()
                .map_err(|e: String| scoped(ConfigError::new(e)))?;
        }

        let mut builder = ScenarioSpec::builder(name.clone(), tunnel, fault)
            .interface(host.interface.clone())
            .workload(workload)
            .settle(self.settle_s.map(Duration::from_secs).unwrap_or(defaults.settle))
            .recovery(
                self.recovery_timeout_s
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.recovery_timeout),
                defaults.poll_interval,
            )
            .join_grace(defaults.join_grace);
        if let Some(probe) = non_empty(self.probe) {
            builder = builder.probe(probe.parse().map_err(|e: String| scoped(ConfigError::new(e)))?);
        }
        if let Some(dir) = capture_dir {
            builder = builder.capture(CaptureSpec::esp(
                host.interface.clone(),
                dir.join(format!("{}.pcap", job_name(&name))),
            ));
        }
        Ok(builder.build())
    }
}

/// Scenario names as fio job and file names.
pub fn job_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

impl BatchConfigInput {
    pub fn resolve(self) -> Result<BatchConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::new(format!("unsupported config version {version}")));
        }

        let host = self.host.resolve()?;
        let defaults = self.defaults.resolve();
        let workload = self.workload.resolve(host.mount.as_ref())?;
        let capture_dir = non_empty(self.capture.dir).map(PathBuf::from);

        let mut scenarios = Vec::with_capacity(self.scenario.len());
        for input in self.scenario {
            let spec = input.resolve(&host, &defaults, &workload, capture_dir.as_ref())?;
            if scenarios.iter().any(|s: &ScenarioSpec| s.name == spec.name) {
                return Err(ConfigError::new(format!("duplicate scenario name {}", spec.name)));
            }
            scenarios.push(spec);
        }

        Ok(BatchConfig {
            version,
            host,
            defaults,
            workload,
            capture_dir,
            scenarios,
        })
    }
}

impl BatchConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let parsed: BatchConfigInput = toml::from_str(input)
            .map_err(|e| ConfigError::new(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

/// Every mode × cipher preset × fault, named `fault/mode/cipher`.
pub fn matrix_scenarios(
    host: &HostConfig,
    defaults: &ScenarioDefaults,
    workload: &WorkloadSpec,
    faults: &[FaultSpec],
    capture_dir: Option<&PathBuf>,
) -> Vec<ScenarioSpec> {
    let mut specs = Vec::new();
    for fault in faults {
        for mode in [Mode::Tunnel, Mode::Transport] {
            for cipher in CIPHER_SUITES {
                let name = format!("{fault}/{mode}/{}", cipher.name);
                let mut builder = ScenarioSpec::builder(name.clone(), host.tunnel(mode, cipher), fault.clone())
                    .interface(host.interface.clone())
                    .workload(WorkloadSpec {
                        name: job_name(&name),
                        ..workload.clone()
                    })
                    .settle(defaults.settle)
                    .recovery(defaults.recovery_timeout, defaults.poll_interval)
                    .join_grace(defaults.join_grace);
                if let Some(dir) = capture_dir {
                    builder = builder.capture(CaptureSpec::esp(
                        host.interface.clone(),
                        dir.join(format!("{}.pcap", job_name(&name))),
                    ));
                }
                specs.push(builder.build());
            }
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelcheck_common::ciphers::AES_CBC_HMAC_SHA256;

    const BATCH: &str = r#"
        version = 1

        [host]
        local = "10.0.0.1"
        remote = "10.0.0.2"
        interface = "eth1"
        local_subnet = "10.1.0.0/16"
        remote_subnet = "10.2.0.0/16"
        mount = "/mnt/nvme"

        [defaults]
        settle_s = 5
        poll_interval_ms = 500

        [workload]
        pattern = "randrw:70"
        runtime_s = 20

        [[scenario]]
        name = "rekey gcm"
        fault = "rekey"
        spi_base = 0x2000

        [[scenario]]
        name = "lossy"
        mode = "transport"
        cipher = "cbc"
        fault = "impairment"
        [scenario.impairment]
        loss_percent = 2.0
        delay_ms = 10
        reorder_percent = 10.0
        hold_s = 3

        [[scenario]]
        name = "daemon-restart"
        fault = "external"
        probe = "either"
        [scenario.external]
        command = ["systemctl", "restart", "strongswan"]

        [[scenario]]
        name = "fill"
        fault = "exhaustion"
        [scenario.exhaustion]
        until_failure = true
        cap = 5000
        progress_every = 100
    "#;

    #[test]
    fn parse_batch() {
        let cfg = BatchConfig::from_toml_str(BATCH).unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.host.interface, "eth1");
        assert!(cfg.host.selectors.is_some());
        assert_eq!(cfg.defaults.settle, Duration::from_secs(5));
        assert_eq!(cfg.defaults.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.defaults.recovery_timeout, DEFAULT_RECOVERY_TIMEOUT);
        assert_eq!(cfg.workload.target, PathBuf::from("/mnt/nvme/tunnelcheck.bin"));
        assert_eq!(cfg.workload.pattern, AccessPattern::RandMixed { read_percent: 70 });
        assert_eq!(cfg.scenarios.len(), 4);

        let rekey = &cfg.scenarios[0];
        assert!(matches!(rekey.fault, FaultSpec::Rekey));
        assert_eq!(rekey.tunnel.spi_base(), 0x2000);
        assert_eq!(rekey.tunnel.mode, Mode::Tunnel);
        assert_eq!(rekey.workload.name, "rekey-gcm");
        assert_eq!(rekey.interface, "eth1");

        let lossy = &cfg.scenarios[1];
        assert_eq!(lossy.tunnel.cipher, &AES_CBC_HMAC_SHA256);
        match &lossy.fault {
            FaultSpec::Impairment { profile, hold } => {
                assert_eq!(profile.scope, ImpairmentScope::Peer(cfg.host.remote));
                assert_eq!(*hold, Duration::from_secs(3));
            }
            other => panic!("unexpected fault {other:?}"),
        }

        match &cfg.scenarios[2].fault {
            FaultSpec::External { command } => {
                assert_eq!(command.to_string(), "systemctl restart strongswan");
            }
            other => panic!("unexpected fault {other:?}"),
        }

        match &cfg.scenarios[3].fault {
            FaultSpec::Exhaustion(ex) => {
                assert_eq!(ex.limit, ExhaustionLimit::UntilFailure { cap: Some(5000) });
                assert_eq!(ex.spi_base, DEFAULT_SPI_BASE);
            }
            other => panic!("unexpected fault {other:?}"),
        }
        assert!(cfg.scenarios.iter().all(|s| s.validate(false).is_ok()));
    }

    #[test]
    fn missing_host_is_rejected() {
        let err = BatchConfig::from_toml_str("").unwrap_err();
        assert_eq!(err.0, "host.local is required");
    }

    #[test]
    fn unsupported_version() {
        let err = BatchConfig::from_toml_str("version = 7").unwrap_err();
        assert!(err.0.contains("unsupported config version 7"));
    }

    #[test]
    fn bad_values_name_the_scenario() {
        let toml = r#"
            [host]
            local = "10.0.0.1"
            remote = "10.0.0.2"
            [[scenario]]
            name = "x"
            fault = "meltdown"
        "#;
        let err = BatchConfig::from_toml_str(toml).unwrap_err();
        assert!(err.0.starts_with("scenario x: unknown fault"));

        let toml = r#"
            [host]
            local = "10.0.0.1"
            remote = "10.0.0.2"
            [[scenario]]
            name = "y"
            fault = "impairment"
            [scenario.impairment]
            loss_percent = 200.0
        "#;
        assert!(BatchConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let toml = r#"
            [host]
            local = "10.0.0.1"
            remote = "10.0.0.2"
            [[scenario]]
            name = "a"
            fault = "rekey"
            [[scenario]]
            name = "a"
            fault = "rekey"
        "#;
        assert!(BatchConfig::from_toml_str(toml).unwrap_err().0.contains("duplicate"));
    }

    #[test]
    fn half_a_subnet_pair_is_rejected() {
        let toml = r#"
            [host]
            local = "10.0.0.1"
            remote = "10.0.0.2"
            local_subnet = "10.1.0.0/16"
        "#;
        assert!(BatchConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn matrix_covers_modes_and_ciphers() {
        let cfg = BatchConfig::from_toml_str(BATCH).unwrap();
        let specs = matrix_scenarios(
            &cfg.host,
            &cfg.defaults,
            &cfg.workload,
            &[FaultSpec::Rekey, FaultSpec::KeyMismatch],
            None,
        );
        assert_eq!(specs.len(), 12);
        assert_eq!(specs[0].name, "rekey/tunnel/AES-GCM-128");
        assert_eq!(specs[0].workload.name, "rekey-tunnel-AES-GCM-128");
        let mut bases: Vec<u32> = specs[..6].iter().map(|s| s.tunnel.spi_base()).collect();
        bases.dedup();
        assert_eq!(bases.len(), 6);
    }
}
