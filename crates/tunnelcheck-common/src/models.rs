//! Data model shared by the association store, impairment controller,
//! workload driver and orchestrator.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ciphers::{CipherSuite, KeyMaterial};
use crate::error::ConfigError;

// ── Modes and directions ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Tunnel,
    Transport,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Tunnel => write!(f, "tunnel"),
            Mode::Transport => write!(f, "transport"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tunnel" => Ok(Mode::Tunnel),
            "transport" => Ok(Mode::Transport),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// The `dir` keyword of `ip xfrm policy`.
    pub fn policy_keyword(self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

// ── Selectors ───────────────────────────────────────────────────────

/// An address prefix. A bare address parses as a host prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    addr: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(ConfigError::new(format!("prefix /{prefix} too long for {addr}")));
        }
        Ok(Self { addr, prefix })
    }

    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            prefix: if addr.is_ipv4() { 32 } else { 128 },
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl std::str::FromStr for Subnet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|e| ConfigError::new(format!("bad subnet {s}: {e}")))?;
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|e| ConfigError::new(format!("bad prefix in {s}: {e}")))?;
                Subnet::new(addr, prefix)
            }
            None => s
                .parse::<IpAddr>()
                .map(Subnet::host)
                .map_err(|e| ConfigError::new(format!("bad address {s}: {e}"))),
        }
    }
}

impl TryFrom<String> for Subnet {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(value: Subnet) -> Self {
        value.to_string()
    }
}

/// Traffic protected by a policy pair, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSelectors {
    pub local: Subnet,
    pub remote: Subnet,
}

impl TrafficSelectors {
    pub fn hosts(local: IpAddr, remote: IpAddr) -> Self {
        Self {
            local: Subnet::host(local),
            remote: Subnet::host(remote),
        }
    }
}

// ── Associations ────────────────────────────────────────────────────

/// One directional ESP security association.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityAssociation {
    pub spi: u32,
    pub direction: Direction,
    pub mode: Mode,
    pub cipher: &'static CipherSuite,
    #[serde(skip)]
    pub keys: KeyMaterial,
    pub reqid: Option<u32>,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub created_at: DateTime<Utc>,
}

/// Outbound plus inbound SA sharing a reqid and selectors.
#[derive(Debug, Clone, Serialize)]
pub struct SaPair {
    pub outbound: SecurityAssociation,
    pub inbound: SecurityAssociation,
    pub selectors: TrafficSelectors,
    pub spi_base: u32,
}

impl SaPair {
    pub fn spis(&self) -> Vec<u32> {
        let mut spis = vec![self.outbound.spi, self.inbound.spi];
        spis.sort_unstable();
        spis
    }

    pub fn reqid(&self) -> Option<u32> {
        self.outbound.reqid
    }

    pub fn mode(&self) -> Mode {
        self.outbound.mode
    }

    pub fn cipher(&self) -> &'static CipherSuite {
        self.outbound.cipher
    }
}

/// An installed `ip xfrm policy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicySelector {
    pub src: Subnet,
    pub dst: Subnet,
    pub direction: Direction,
    pub reqid: Option<u32>,
    pub mode: Mode,
    pub tmpl_src: IpAddr,
    pub tmpl_dst: IpAddr,
}

// ── Impairment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpairmentScope {
    /// Every packet leaving the interface.
    Global,
    /// Only traffic to or from this peer.
    Peer(IpAddr),
}

/// Parameters for one netem discipline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentProfile {
    pub loss_percent: f32,
    pub delay_ms: u32,
    pub reorder_percent: f32,
    #[serde(default)]
    pub jitter_ms: Option<u32>,
    #[serde(default)]
    pub duplicate_percent: Option<f32>,
    #[serde(default)]
    pub corrupt_percent: Option<f32>,
    #[serde(default)]
    pub rate_kbit: Option<u64>,
    pub scope: ImpairmentScope,
}

impl ImpairmentProfile {
    pub fn peer(target: IpAddr, loss_percent: f32, delay_ms: u32, reorder_percent: f32) -> Self {
        Self {
            loss_percent,
            delay_ms,
            reorder_percent,
            jitter_ms: None,
            duplicate_percent: None,
            corrupt_percent: None,
            rate_kbit: None,
            scope: ImpairmentScope::Peer(target),
        }
    }

    pub fn global(loss_percent: f32, delay_ms: u32, reorder_percent: f32) -> Self {
        Self {
            scope: ImpairmentScope::Global,
            ..Self::peer(IpAddr::from([0, 0, 0, 0]), loss_percent, delay_ms, reorder_percent)
        }
    }

    /// Percentages must lie in `[0, 100)`; netem only reorders delayed
    /// packets, so reordering needs a non-zero delay.
    pub fn validate(&self) -> Result<(), String> {
        let percent = |name: &str, v: f32| {
            if v.is_finite() && (0.0..100.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{name} {v}% outside [0, 100)"))
            }
        };
        percent("loss", self.loss_percent)?;
        percent("reorder", self.reorder_percent)?;
        if let Some(d) = self.duplicate_percent {
            percent("duplicate", d)?;
        }
        if let Some(c) = self.corrupt_percent {
            percent("corrupt", c)?;
        }
        if self.reorder_percent > 0.0 && self.delay_ms == 0 {
            return Err("reorder requires a non-zero delay".into());
        }
        if self.rate_kbit == Some(0) {
            return Err("rate must be positive".into());
        }
        Ok(())
    }
}

// ── Workload ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPattern {
    SeqRead,
    SeqWrite,
    RandRead,
    RandWrite,
    SeqMixed { read_percent: u8 },
    RandMixed { read_percent: u8 },
}

impl AccessPattern {
    /// fio `--rw` value.
    pub fn fio_rw(self) -> &'static str {
        match self {
            AccessPattern::SeqRead => "read",
            AccessPattern::SeqWrite => "write",
            AccessPattern::RandRead => "randread",
            AccessPattern::RandWrite => "randwrite",
            AccessPattern::SeqMixed { .. } => "readwrite",
            AccessPattern::RandMixed { .. } => "randrw",
        }
    }

    pub fn read_mix(self) -> Option<u8> {
        match self {
            AccessPattern::SeqMixed { read_percent } | AccessPattern::RandMixed { read_percent } => {
                Some(read_percent)
            }
            _ => None,
        }
    }

    /// Whether the pattern needs existing data to read.
    pub fn reads(self) -> bool {
        !matches!(self, AccessPattern::SeqWrite | AccessPattern::RandWrite)
    }
}

impl std::str::FromStr for AccessPattern {
    type Err = String;

    /// fio names; mixed patterns take an optional `:READ%` suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, mix) = match s.split_once(':') {
            Some((name, mix)) => {
                let pct: u8 = mix
                    .parse()
                    .map_err(|_| format!("bad read percentage in {s}"))?;
                if pct > 100 {
                    return Err(format!("read percentage {pct} above 100"));
                }
                (name, Some(pct))
            }
            None => (s, None),
        };
        let read_percent = mix.unwrap_or(50);
        match (name, mix) {
            ("read", None) => Ok(AccessPattern::SeqRead),
            ("write", None) => Ok(AccessPattern::SeqWrite),
            ("randread", None) => Ok(AccessPattern::RandRead),
            ("randwrite", None) => Ok(AccessPattern::RandWrite),
            ("readwrite" | "rw", _) => Ok(AccessPattern::SeqMixed { read_percent }),
            ("randrw", _) => Ok(AccessPattern::RandMixed { read_percent }),
            _ => Err(format!("unknown access pattern: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub target: PathBuf,
    pub pattern: AccessPattern,
    pub block_size: String,
    pub size: String,
    pub queue_depth: u32,
    pub jobs: u32,
    pub runtime: Duration,
    pub ioengine: String,
    pub direct: bool,
    pub verify: bool,
    /// Lay out the target with a write pass before a read pattern when it
    /// does not exist yet.
    pub prefill: bool,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            name: "tunnelcheck".into(),
            target: PathBuf::from("tunnelcheck.bin"),
            pattern: AccessPattern::RandWrite,
            block_size: "4k".into(),
            size: "256M".into(),
            queue_depth: 32,
            jobs: 4,
            runtime: Duration::from_secs(30),
            ioengine: "libaio".into(),
            direct: true,
            verify: true,
            prefill: true,
        }
    }
}

impl WorkloadSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::new("workload name is empty"));
        }
        if self.queue_depth == 0 || self.jobs == 0 {
            return Err(ConfigError::new("queue depth and job count must be positive"));
        }
        if self.runtime.is_zero() {
            return Err(ConfigError::new("workload runtime must be positive"));
        }
        if self.block_size.is_empty() || self.size.is_empty() {
            return Err(ConfigError::new("block size and size are required"));
        }
        if self.pattern.read_mix().is_some_and(|p| p > 100) {
            return Err(ConfigError::new("read mix above 100%"));
        }
        Ok(())
    }
}

/// Throughput and latency for one I/O direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    pub bandwidth_kib: u64,
    pub iops: f64,
    pub p99_latency_us: Option<f64>,
    pub p999_latency_us: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub job: String,
    pub status: i32,
    pub verified: bool,
    pub read: Option<IoStats>,
    pub write: Option<IoStats>,
    /// SHA-256 of the target after completion, when verification ran
    /// against a regular file.
    pub checksum: Option<String>,
    pub elapsed: Duration,
}

// ── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Outcome {
    Pass,
    PassPersistent,
    PassGraceful,
    Fail,
    Error,
}

impl Outcome {
    pub fn is_pass(self) -> bool {
        matches!(
            self,
            Outcome::Pass | Outcome::PassPersistent | Outcome::PassGraceful
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::PassPersistent => write!(f, "PASS-PERSISTENT"),
            Outcome::PassGraceful => write!(f, "PASS-GRACEFUL"),
            Outcome::Fail => write!(f, "FAIL"),
            Outcome::Error => write!(f, "ERROR"),
        }
    }
}

/// Orchestration phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Baseline,
    Workload,
    Fault,
    Recovery,
    Verify,
    Teardown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::Baseline => "baseline",
            Phase::Workload => "workload",
            Phase::Fault => "fault",
            Phase::Recovery => "recovery",
            Phase::Verify => "verify",
            Phase::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub timestamp: DateTime<Utc>,
    pub scenario: String,
    pub mode: Mode,
    pub cipher: String,
    pub target: String,
    pub outcome: Outcome,
    pub pre_identifiers: Vec<u32>,
    pub post_identifiers: Vec<u32>,
    pub elapsed_recovery: Option<Duration>,
    pub notes: Vec<String>,
    pub phases: Vec<Phase>,
    pub workload: Option<WorkloadResult>,
}

impl ScenarioResult {
    /// `0x00002000;0x00002001`, or `none` when empty.
    pub fn identifiers_label(ids: &[u32]) -> String {
        if ids.is_empty() {
            return "none".into();
        }
        ids.iter()
            .map(|spi| format!("0x{spi:08x}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn notes_text(&self) -> String {
        self.notes.join("; ")
    }

    pub fn elapsed_recovery_secs(&self) -> Option<f64> {
        self.elapsed_recovery.map(|d| d.as_secs_f64())
    }
}
