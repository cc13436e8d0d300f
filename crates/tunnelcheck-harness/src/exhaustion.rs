//! Drive the kernel SA table towards its capacity.

use std::net::IpAddr;

use tunnelcheck_common::ciphers::{CipherSuite, KeyMaterial};
use tunnelcheck_common::error::{AssociationError, AssociationOp, ConfigError};
use tunnelcheck_common::models::{Mode, TrafficSelectors};

use crate::xfrm::{hex_spi, AssociationStore, PairRequest};

pub const DEFAULT_SPI_BASE: u32 = 0x10000;

/// Template keys carry a 16-bit per-SA suffix, two SAs per pair.
pub const TEMPLATE_MAX_PAIRS: u32 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Fresh random keys for every SA.
    Random,
    /// One template, varied per SA so no two keys are equal. The suffix is
    /// 16 bits wide, so runs are capped at [`TEMPLATE_MAX_PAIRS`].
    Template(KeyMaterial),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionLimit {
    MaxPairs(u32),
    /// Keep going until the kernel refuses; `cap` bounds runaway loops.
    UntilFailure { cap: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct ExhaustionSpec {
    pub mode: Mode,
    pub cipher: &'static CipherSuite,
    pub local: IpAddr,
    pub remote: IpAddr,
    pub selectors: Option<TrafficSelectors>,
    pub spi_base: u32,
    /// Per-pair reqids start here; `None` installs SAs without one.
    pub reqid_base: Option<u32>,
    pub keys: KeyStrategy,
    pub with_policy: bool,
    pub limit: ExhaustionLimit,
    /// Sample table sizes every N pairs.
    pub progress_every: Option<u32>,
}

impl ExhaustionSpec {
    pub fn new(mode: Mode, cipher: &'static CipherSuite, local: IpAddr, remote: IpAddr) -> Self {
        Self {
            mode,
            cipher,
            local,
            remote,
            selectors: None,
            spi_base: DEFAULT_SPI_BASE,
            reqid_base: None,
            keys: KeyStrategy::Random,
            with_policy: false,
            limit: ExhaustionLimit::MaxPairs(1000),
            progress_every: None,
        }
    }

    /// Checked before any command is issued.
    pub fn validate(&self, dry_run: bool) -> Result<(), ConfigError> {
        if self.local == self.remote {
            return Err(ConfigError::new("local and remote endpoints are identical"));
        }
        if self.mode == Mode::Tunnel && self.with_policy && self.selectors.is_none() {
            return Err(ConfigError::new(
                "tunnel-mode exhaustion with policies requires local and remote subnets",
            ));
        }
        if self.with_policy && self.reqid_base.is_none() {
            return Err(ConfigError::new("policies need a reqid base to bind to"));
        }
        match self.limit {
            ExhaustionLimit::MaxPairs(0) => {
                return Err(ConfigError::new("max pairs must be positive"));
            }
            ExhaustionLimit::UntilFailure { cap: None } if dry_run => {
                return Err(ConfigError::new(
                    "until-failure needs a cap in dry-run, nothing will ever fail",
                ));
            }
            _ => {}
        }
        if let KeyStrategy::Template(keys) = &self.keys {
            self.cipher.xfrm_args(keys)?;
            if self.max_pairs().map_or(true, |n| n > TEMPLATE_MAX_PAIRS) {
                return Err(ConfigError::new(format!(
                    "template keys repeat beyond {TEMPLATE_MAX_PAIRS} pairs; set a cap at or below it"
                )));
            }
        }
        if self.spi_base < 0x100 {
            return Err(ConfigError::new("spi base is in the reserved range"));
        }
        Ok(())
    }

    fn max_pairs(&self) -> Option<u32> {
        match self.limit {
            ExhaustionLimit::MaxPairs(n) => Some(n),
            ExhaustionLimit::UntilFailure { cap } => cap,
        }
    }

    fn keys_for(&self, spi_offset: u32) -> KeyMaterial {
        match &self.keys {
            KeyStrategy::Random => self.cipher.generate_keys(),
            KeyStrategy::Template(template) => template.varied(spi_offset as u16),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub pairs: u32,
    pub states: usize,
    pub policies: usize,
}

#[derive(Debug, Clone)]
pub struct ExhaustionReport {
    pub created: u32,
    /// The refusal that ended the run, if any.
    pub last_error: Option<AssociationError>,
    pub samples: Vec<ProgressSample>,
}

/// Install pair `i` at `spi_base + 2i` / `spi_base + 2i + 1` until the limit
/// or the first failure. Nothing is removed afterwards.
pub fn exhaust(store: &mut AssociationStore, spec: &ExhaustionSpec) -> Result<ExhaustionReport, ConfigError> {
    spec.validate(store.is_dry_run())?;
    let selectors = spec
        .selectors
        .unwrap_or_else(|| TrafficSelectors::hosts(spec.local, spec.remote));
    let max = spec.max_pairs();

    tracing::info!(
        mode = %spec.mode,
        cipher = %spec.cipher,
        base = %hex_spi(spec.spi_base),
        max = ?max,
        "exhaustion starting"
    );

    let mut report = ExhaustionReport {
        created: 0,
        last_error: None,
        samples: Vec::new(),
    };
    let mut i: u32 = 0;
    while max.map_or(true, |m| i < m) {
        let spis = i
            .checked_mul(2)
            .and_then(|off| spec.spi_base.checked_add(off))
            .filter(|out| out.checked_add(1).is_some());
        let Some(outbound_spi) = spis else {
            report.last_error = Some(AssociationError::new(
                AssociationOp::AddState,
                None,
                "SPI space exhausted",
            ));
            break;
        };
        let request = PairRequest {
            mode: spec.mode,
            cipher: spec.cipher,
            local: spec.local,
            remote: spec.remote,
            selectors,
            spi_base: spec.spi_base,
            outbound_spi,
            inbound_spi: outbound_spi + 1,
            reqid: spec.reqid_base.map(|base| base.wrapping_add(i)),
            outbound_keys: spec.keys_for(2 * i),
            inbound_keys: spec.keys_for(2 * i + 1),
            with_policy: spec.with_policy,
        };
        if let Err(e) = store.install_pair(request) {
            tracing::warn!(created = report.created, error = %e, "exhaustion stopped");
            report.last_error = Some(e);
            break;
        }
        report.created += 1;
        i += 1;

        if spec.progress_every.is_some_and(|n| n > 0 && report.created % n == 0) {
            match store.counts() {
                Ok((states, policies)) => {
                    tracing::info!(pairs = report.created, states, policies, "exhaustion progress");
                    report.samples.push(ProgressSample {
                        pairs: report.created,
                        states,
                        policies,
                    });
                }
                Err(e) => tracing::debug!(error = %e, "progress sample skipped"),
            }
        }
    }

    tracing::info!(created = report.created, "exhaustion finished");
    Ok(report)
}
