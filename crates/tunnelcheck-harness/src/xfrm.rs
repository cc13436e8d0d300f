//! Association store: the only code that touches the kernel SA and policy
//! tables.
//!
//! SPIs are allocated deterministically per base: pair `k` uses
//! `base + 2k` outbound and `base + 2k + 1` inbound, with `k` increasing for
//! the lifetime of the store. Keys are fresh per SA.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tunnelcheck_common::ciphers::{CipherSuite, KeyMaterial};
use tunnelcheck_common::error::{AssociationError, AssociationOp, ConfigError};
use tunnelcheck_common::exec::{CommandExecutor, CommandLine};
use tunnelcheck_common::models::{
    Direction, Mode, PolicySelector, SaPair, SecurityAssociation, TrafficSelectors,
};

/// SPIs below this are reserved by RFC 4303.
const MIN_SPI: u32 = 0x100;
const TRANSPORT_SPI_OFFSET: u32 = 0x4000;
const CIPHER_SPI_STRIDE: u32 = 0x400;

// ── Tunnel description ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub mode: Mode,
    pub cipher: &'static CipherSuite,
    pub local: IpAddr,
    pub remote: IpAddr,
    /// Required in tunnel mode; transport mode protects the two hosts.
    pub selectors: Option<TrafficSelectors>,
    pub spi_base: Option<u32>,
    pub reqid: Option<u32>,
    pub with_policy: bool,
}

impl TunnelSpec {
    pub fn new(mode: Mode, cipher: &'static CipherSuite, local: IpAddr, remote: IpAddr) -> Self {
        Self {
            mode,
            cipher,
            local,
            remote,
            selectors: None,
            spi_base: None,
            reqid: None,
            with_policy: true,
        }
    }

    pub fn with_selectors(mut self, selectors: TrafficSelectors) -> Self {
        self.selectors = Some(selectors);
        self
    }

    pub fn with_spi_base(mut self, base: u32) -> Self {
        self.spi_base = Some(base);
        self
    }

    pub fn with_reqid(mut self, reqid: u32) -> Self {
        self.reqid = Some(reqid);
        self
    }

    /// Disjoint per mode and cipher preset, so a matrix never reuses SPIs.
    pub fn default_spi_base(mode: Mode, cipher: &CipherSuite) -> u32 {
        let mode_offset = match mode {
            Mode::Tunnel => 0,
            Mode::Transport => TRANSPORT_SPI_OFFSET,
        };
        0x2000 + mode_offset + CIPHER_SPI_STRIDE * cipher.index() as u32
    }

    pub fn spi_base(&self) -> u32 {
        self.spi_base
            .unwrap_or_else(|| Self::default_spi_base(self.mode, self.cipher))
    }

    /// Defaults to the SPI base.
    pub fn reqid(&self) -> u32 {
        self.reqid.unwrap_or_else(|| self.spi_base())
    }

    pub fn selectors(&self) -> TrafficSelectors {
        self.selectors
            .unwrap_or_else(|| TrafficSelectors::hosts(self.local, self.remote))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local == self.remote {
            return Err(ConfigError::new("local and remote endpoints are identical"));
        }
        if self.local.is_ipv4() != self.remote.is_ipv4() {
            return Err(ConfigError::new("local and remote address families differ"));
        }
        if self.mode == Mode::Tunnel && self.selectors.is_none() {
            return Err(ConfigError::new(
                "tunnel mode requires local and remote subnets",
            ));
        }
        if self.spi_base() < MIN_SPI {
            return Err(ConfigError::new(format!(
                "spi base 0x{:x} is in the reserved range",
                self.spi_base()
            )));
        }
        Ok(())
    }
}

/// Everything needed to install one SA pair with explicit SPIs.
#[derive(Debug, Clone)]
pub struct PairRequest {
    pub mode: Mode,
    pub cipher: &'static CipherSuite,
    pub local: IpAddr,
    pub remote: IpAddr,
    pub selectors: TrafficSelectors,
    pub spi_base: u32,
    pub outbound_spi: u32,
    pub inbound_spi: u32,
    pub reqid: Option<u32>,
    pub outbound_keys: KeyMaterial,
    pub inbound_keys: KeyMaterial,
    pub with_policy: bool,
}

// ── Store ───────────────────────────────────────────────────────────

pub struct AssociationStore {
    executor: Arc<dyn CommandExecutor>,
    registry: BTreeMap<u32, SecurityAssociation>,
    policies: Vec<PolicySelector>,
    next_pair: HashMap<u32, u32>,
}

impl AssociationStore {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            registry: BTreeMap::new(),
            policies: Vec::new(),
            next_pair: HashMap::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.executor.is_dry_run()
    }

    /// SAs installed through this store and not yet removed.
    pub fn registered(&self) -> impl Iterator<Item = &SecurityAssociation> {
        self.registry.values()
    }

    pub fn registered_policies(&self) -> &[PolicySelector] {
        &self.policies
    }

    /// Next free `(outbound, inbound)` SPIs for `base`.
    fn allocate(&mut self, base: u32) -> Result<(u32, u32), AssociationError> {
        let k = self.next_pair.entry(base).or_insert(0);
        loop {
            let outbound = k
                .checked_mul(2)
                .and_then(|off| base.checked_add(off))
                .filter(|spi| spi.checked_add(1).is_some())
                .ok_or_else(|| {
                    AssociationError::new(AssociationOp::AddState, None, "SPI space exhausted")
                })?;
            *k += 1;
            let inbound = outbound + 1;
            if !self.registry.contains_key(&outbound) && !self.registry.contains_key(&inbound) {
                return Ok((outbound, inbound));
            }
        }
    }

    /// Install a fresh SA pair (and its policies) for `spec`.
    pub fn bring_up(&mut self, spec: &TunnelSpec) -> Result<SaPair, AssociationError> {
        let base = spec.spi_base();
        let (outbound_spi, inbound_spi) = self.allocate(base)?;
        let pair = self.install_pair(PairRequest {
            mode: spec.mode,
            cipher: spec.cipher,
            local: spec.local,
            remote: spec.remote,
            selectors: spec.selectors(),
            spi_base: base,
            outbound_spi,
            inbound_spi,
            reqid: Some(spec.reqid()),
            outbound_keys: spec.cipher.generate_keys(),
            inbound_keys: spec.cipher.generate_keys(),
            with_policy: spec.with_policy,
        })?;
        tracing::info!(
            mode = %spec.mode,
            cipher = %spec.cipher,
            out_spi = %hex_spi(pair.outbound.spi),
            in_spi = %hex_spi(pair.inbound.spi),
            reqid = spec.reqid(),
            "tunnel up"
        );
        Ok(pair)
    }

    /// Install both SAs and, if requested, the in/out policies. A failure
    /// part-way removes whatever this call already installed.
    pub fn install_pair(&mut self, req: PairRequest) -> Result<SaPair, AssociationError> {
        let policies = req.with_policy.then(|| policy_pair(&req));
        let now = Utc::now();
        let outbound = SecurityAssociation {
            spi: req.outbound_spi,
            direction: Direction::Outbound,
            mode: req.mode,
            cipher: req.cipher,
            keys: req.outbound_keys,
            reqid: req.reqid,
            src: req.local,
            dst: req.remote,
            created_at: now,
        };
        let inbound = SecurityAssociation {
            spi: req.inbound_spi,
            direction: Direction::Inbound,
            mode: req.mode,
            cipher: req.cipher,
            keys: req.inbound_keys,
            reqid: req.reqid,
            src: req.remote,
            dst: req.local,
            created_at: now,
        };

        self.add_state(&outbound)?;
        if let Err(e) = self.add_state(&inbound) {
            let _ = self.delete(outbound.spi);
            return Err(e);
        }

        if let Some(policies) = &policies {
            for (idx, policy) in policies.iter().enumerate() {
                if let Err(e) = self.add_policy(policy) {
                    for added in &policies[..idx] {
                        let _ = self.delete_policy(added);
                    }
                    let _ = self.delete(inbound.spi);
                    let _ = self.delete(outbound.spi);
                    return Err(e);
                }
            }
        }

        Ok(SaPair {
            outbound,
            inbound,
            selectors: req.selectors,
            spi_base: req.spi_base,
        })
    }

    /// Replace `pair` with successor SPIs and fresh keys. reqid, selectors
    /// and policies carry over.
    pub fn rekey(&mut self, pair: &SaPair) -> Result<SaPair, AssociationError> {
        let (outbound_spi, inbound_spi) = self.allocate(pair.spi_base)?;
        self.delete(pair.outbound.spi)?;
        self.delete(pair.inbound.spi)?;
        let cipher = pair.cipher();
        let next = self.install_pair(PairRequest {
            mode: pair.mode(),
            cipher,
            local: pair.outbound.src,
            remote: pair.outbound.dst,
            selectors: pair.selectors,
            spi_base: pair.spi_base,
            outbound_spi,
            inbound_spi,
            reqid: pair.reqid(),
            outbound_keys: cipher.generate_keys(),
            inbound_keys: cipher.generate_keys(),
            with_policy: false,
        })?;
        tracing::info!(
            old = ?pair.spis().iter().map(|s| hex_spi(*s)).collect::<Vec<_>>(),
            new = ?next.spis().iter().map(|s| hex_spi(*s)).collect::<Vec<_>>(),
            "rekeyed"
        );
        Ok(next)
    }

    /// Reinstall the same SPIs with new random keys, so the local side no
    /// longer agrees with its peer.
    pub fn replace_with_mismatched_keys(&mut self, pair: &SaPair) -> Result<SaPair, AssociationError> {
        self.delete(pair.outbound.spi)?;
        self.delete(pair.inbound.spi)?;
        let cipher = pair.cipher();
        let next = self.install_pair(PairRequest {
            mode: pair.mode(),
            cipher,
            local: pair.outbound.src,
            remote: pair.outbound.dst,
            selectors: pair.selectors,
            spi_base: pair.spi_base,
            outbound_spi: pair.outbound.spi,
            inbound_spi: pair.inbound.spi,
            reqid: pair.reqid(),
            outbound_keys: cipher.generate_keys(),
            inbound_keys: cipher.generate_keys(),
            with_policy: false,
        })?;
        tracing::warn!(spis = ?pair.spis(), "keys replaced with mismatched material");
        Ok(next)
    }

    /// Delete one SA by SPI. Endpoints come from the registry or, for SAs
    /// this store did not create, from the kernel listing.
    pub fn delete(&mut self, spi: u32) -> Result<(), AssociationError> {
        let (src, dst) = match self.registry.get(&spi) {
            Some(sa) => (sa.src.to_string(), sa.dst.to_string()),
            None => {
                let snapshot = self.snapshot()?;
                let state = snapshot
                    .states
                    .iter()
                    .find(|s| s.spi == spi)
                    .ok_or_else(|| {
                        AssociationError::new(AssociationOp::DeleteState, Some(spi), "no such SA")
                    })?;
                (state.src.to_string(), state.dst.to_string())
            }
        };

        let cmd = ip(&[
            "xfrm", "state", "delete", "src", &src, "dst", &dst, "proto", "esp", "spi",
            &hex_spi(spi),
        ]);
        self.executor
            .run_checked(&cmd)
            .map_err(|e| AssociationError::from_exec(AssociationOp::DeleteState, Some(spi), &e))?;
        self.registry.remove(&spi);
        tracing::debug!(spi = %hex_spi(spi), "SA deleted");
        Ok(())
    }

    /// Remove both SAs of `pair`, leaving its policies in place (an expiry
    /// without replacement).
    pub fn delete_pair(&mut self, pair: &SaPair) -> Result<(), AssociationError> {
        self.delete(pair.outbound.spi)?;
        self.delete(pair.inbound.spi)
    }

    /// Flush every SA and policy. Failures are logged, never returned.
    pub fn flush_all(&mut self) {
        for table in ["state", "policy"] {
            let cmd = ip(&["xfrm", table, "flush"]);
            match self.executor.run_checked(&cmd) {
                Ok(_) => tracing::debug!(table, "xfrm flushed"),
                Err(e) => {
                    let err = AssociationError::from_exec(AssociationOp::Flush, None, &e);
                    tracing::warn!(table, error = %err, "xfrm flush failed");
                }
            }
        }
        self.registry.clear();
        self.policies.clear();
    }

    /// Current kernel SA and policy tables. In dry-run the store's own
    /// records stand in for the kernel.
    pub fn snapshot(&self) -> Result<XfrmSnapshot, AssociationError> {
        if self.executor.is_dry_run() {
            return Ok(self.registry_snapshot());
        }
        let query = |table: &str| {
            self.executor
                .run_checked(&ip(&["xfrm", table, "show"]))
                .map(|out| out.stdout)
                .map_err(|e| AssociationError::from_exec(AssociationOp::Query, None, &e))
        };
        let states = query("state")?;
        let policies = query("policy")?;
        Ok(XfrmSnapshot::parse(&states, &policies))
    }

    /// `(states, policies)` currently installed.
    pub fn counts(&self) -> Result<(usize, usize), AssociationError> {
        let snapshot = self.snapshot()?;
        Ok((snapshot.states.len(), snapshot.policies.len()))
    }

    fn registry_snapshot(&self) -> XfrmSnapshot {
        XfrmSnapshot {
            states: self
                .registry
                .values()
                .map(|sa| StateEntry {
                    src: sa.src,
                    dst: sa.dst,
                    spi: sa.spi,
                    reqid: sa.reqid.unwrap_or(0),
                    mode: Some(sa.mode),
                })
                .collect(),
            policies: self
                .policies
                .iter()
                .map(|p| PolicyEntry {
                    src: p.src.to_string(),
                    dst: p.dst.to_string(),
                    dir: p.direction.policy_keyword().to_string(),
                    reqid: p.reqid.unwrap_or(0),
                })
                .collect(),
        }
    }

    fn add_state(&mut self, sa: &SecurityAssociation) -> Result<(), AssociationError> {
        let algo = sa
            .cipher
            .xfrm_args(&sa.keys)
            .map_err(|e| AssociationError::new(AssociationOp::AddState, Some(sa.spi), e.0))?;
        let mut cmd = ip(&[
            "xfrm",
            "state",
            "add",
            "src",
            &sa.src.to_string(),
            "dst",
            &sa.dst.to_string(),
            "proto",
            "esp",
            "spi",
            &hex_spi(sa.spi),
        ]);
        if let Some(reqid) = sa.reqid {
            cmd = cmd.args(["reqid".to_string(), reqid.to_string()]);
        }
        cmd = cmd.args(["mode".to_string(), sa.mode.to_string()]).args(algo);

        self.executor
            .run_checked(&cmd)
            .map_err(|e| AssociationError::from_exec(AssociationOp::AddState, Some(sa.spi), &e))?;
        self.registry.insert(sa.spi, sa.clone());
        Ok(())
    }

    fn add_policy(&mut self, policy: &PolicySelector) -> Result<(), AssociationError> {
        let mut cmd = ip(&[
            "xfrm",
            "policy",
            "add",
            "src",
            &policy.src.to_string(),
            "dst",
            &policy.dst.to_string(),
            "dir",
            policy.direction.policy_keyword(),
            "tmpl",
            "src",
            &policy.tmpl_src.to_string(),
            "dst",
            &policy.tmpl_dst.to_string(),
            "proto",
            "esp",
        ]);
        if let Some(reqid) = policy.reqid {
            cmd = cmd.args(["reqid".to_string(), reqid.to_string()]);
        }
        cmd = cmd.args(["mode".to_string(), policy.mode.to_string()]);

        self.executor
            .run_checked(&cmd)
            .map_err(|e| AssociationError::from_exec(AssociationOp::AddPolicy, None, &e))?;
        self.policies.push(policy.clone());
        Ok(())
    }

    fn delete_policy(&mut self, policy: &PolicySelector) -> Result<(), AssociationError> {
        let cmd = ip(&[
            "xfrm",
            "policy",
            "delete",
            "src",
            &policy.src.to_string(),
            "dst",
            &policy.dst.to_string(),
            "dir",
            policy.direction.policy_keyword(),
        ]);
        self.executor
            .run_checked(&cmd)
            .map_err(|e| AssociationError::from_exec(AssociationOp::DeletePolicy, None, &e))?;
        self.policies.retain(|p| p != policy);
        Ok(())
    }
}

fn policy_pair(req: &PairRequest) -> [PolicySelector; 2] {
    [
        PolicySelector {
            src: req.selectors.local,
            dst: req.selectors.remote,
            direction: Direction::Outbound,
            reqid: req.reqid,
            mode: req.mode,
            tmpl_src: req.local,
            tmpl_dst: req.remote,
        },
        PolicySelector {
            src: req.selectors.remote,
            dst: req.selectors.local,
            direction: Direction::Inbound,
            reqid: req.reqid,
            mode: req.mode,
            tmpl_src: req.remote,
            tmpl_dst: req.local,
        },
    ]
}

fn ip(args: &[&str]) -> CommandLine {
    CommandLine::new("ip").args(args.iter().copied())
}

pub fn hex_spi(spi: u32) -> String {
    format!("0x{spi:08x}")
}

// ── Snapshots ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub spi: u32,
    pub reqid: u32,
    pub mode: Option<Mode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub src: String,
    pub dst: String,
    pub dir: String,
    pub reqid: u32,
}

/// Which entries of a snapshot belong to one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityFilter {
    pub local: IpAddr,
    pub remote: IpAddr,
    /// `None` matches any reqid between the two endpoints.
    pub reqid: Option<u32>,
}

impl IdentityFilter {
    pub fn for_pair(pair: &SaPair) -> Self {
        Self {
            local: pair.outbound.src,
            remote: pair.outbound.dst,
            reqid: pair.reqid(),
        }
    }

    fn matches_state(&self, s: &StateEntry) -> bool {
        let endpoints = (s.src == self.local && s.dst == self.remote)
            || (s.src == self.remote && s.dst == self.local);
        endpoints && self.reqid.map_or(true, |r| r == s.reqid)
    }
}

/// Parsed `ip xfrm state show` and `ip xfrm policy show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XfrmSnapshot {
    pub states: Vec<StateEntry>,
    pub policies: Vec<PolicyEntry>,
}

impl XfrmSnapshot {
    pub fn parse(states: &str, policies: &str) -> Self {
        let states = entries(states)
            .filter_map(|tokens| {
                Some(StateEntry {
                    src: first_value(&tokens, "src")?.parse().ok()?,
                    dst: first_value(&tokens, "dst")?.parse().ok()?,
                    spi: parse_number(first_value(&tokens, "spi")?)?,
                    reqid: first_value(&tokens, "reqid")
                        .and_then(parse_number)
                        .unwrap_or(0),
                    mode: first_value(&tokens, "mode").and_then(|m| m.parse().ok()),
                })
            })
            .collect();
        let policies = entries(policies)
            .filter_map(|tokens| {
                Some(PolicyEntry {
                    src: first_value(&tokens, "src")?.to_string(),
                    dst: first_value(&tokens, "dst")?.to_string(),
                    dir: first_value(&tokens, "dir")?.to_string(),
                    reqid: first_value(&tokens, "reqid")
                        .and_then(parse_number)
                        .unwrap_or(0),
                })
            })
            .collect();
        Self { states, policies }
    }

    /// SPIs of the tunnel's SAs, ascending.
    pub fn identifiers(&self, filter: &IdentityFilter) -> Vec<u32> {
        let mut spis: Vec<u32> = self
            .states
            .iter()
            .filter(|s| filter.matches_state(s))
            .map(|s| s.spi)
            .collect();
        spis.sort_unstable();
        spis
    }

    /// An outbound and an inbound SA plus an `out` and an `in` policy, all
    /// sharing one reqid.
    pub fn has_valid_pair(&self, filter: &IdentityFilter) -> bool {
        let candidates: BTreeSet<u32> = match filter.reqid {
            Some(r) => BTreeSet::from([r]),
            None => self
                .states
                .iter()
                .filter(|s| filter.matches_state(s))
                .map(|s| s.reqid)
                .collect(),
        };
        candidates.into_iter().any(|reqid| {
            let state = |src: IpAddr, dst: IpAddr| {
                self.states
                    .iter()
                    .any(|s| s.reqid == reqid && s.src == src && s.dst == dst)
            };
            let policy = |dir: &str| self.policies.iter().any(|p| p.reqid == reqid && p.dir == dir);
            state(filter.local, filter.remote)
                && state(filter.remote, filter.local)
                && policy("out")
                && policy("in")
        })
    }

    /// Partial pairs and policies whose reqid has no SA behind it.
    pub fn defects(&self) -> Vec<String> {
        let mut defects = Vec::new();
        let live: BTreeSet<u32> = self.states.iter().map(|s| s.reqid).collect();
        for p in &self.policies {
            if p.reqid != 0 && !live.contains(&p.reqid) && matches!(p.dir.as_str(), "in" | "out") {
                defects.push(format!(
                    "dangling {} policy {} -> {} (reqid {})",
                    p.dir, p.src, p.dst, p.reqid
                ));
            }
        }
        for reqid in live.iter().filter(|r| **r != 0) {
            let count = self.states.iter().filter(|s| s.reqid == *reqid).count();
            if count % 2 == 1 {
                defects.push(format!("partial SA pair for reqid {reqid}"));
            }
        }
        defects
    }
}

/// Split an iproute2 listing into per-entry token lists. An entry starts at
/// a line without leading whitespace.
fn entries(listing: &str) -> impl Iterator<Item = Vec<&str>> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in listing.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) || blocks.is_empty() {
            blocks.push(Vec::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.extend(line.split_whitespace());
        }
    }
    blocks.into_iter()
}

fn first_value<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

fn parse_number(text: &str) -> Option<u32> {
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelcheck_common::ciphers::{AES_CBC_HMAC_SHA256, AES_GCM_128, CHACHA20_POLY1305};
    use tunnelcheck_common::exec::DryRunExecutor;
    use tunnelcheck_common::fault::{DeterministicFaultExecutor, FaultResponse, FaultRule};
    use tunnelcheck_common::test_util::FakeHost;

    fn local() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn remote() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    fn transport(base: u32) -> TunnelSpec {
        TunnelSpec::new(Mode::Transport, &AES_GCM_128, local(), remote()).with_spi_base(base)
    }

    #[test]
    fn bring_up_allocates_base_pair_and_policies() {
        let host = Arc::new(FakeHost::new());
        let mut store = AssociationStore::new(host.clone());
        let pair = store.bring_up(&transport(0x2000)).unwrap();

        assert_eq!(pair.outbound.spi, 0x2000);
        assert_eq!(pair.inbound.spi, 0x2001);
        assert_eq!(host.spis(), vec![0x2000, 0x2001]);
        assert_eq!(host.policies().len(), 2);

        let snap = store.snapshot().unwrap();
        let filter = IdentityFilter::for_pair(&pair);
        assert_eq!(snap.identifiers(&filter), vec![0x2000, 0x2001]);
        assert!(snap.has_valid_pair(&filter));
        assert!(snap.defects().is_empty());
    }

    #[test]
    fn rekey_uses_successor_spis_and_keeps_policies() {
        let host = Arc::new(FakeHost::new());
        let mut store = AssociationStore::new(host.clone());
        let pair = store.bring_up(&transport(0x2000)).unwrap();
        let next = store.rekey(&pair).unwrap();

        assert_eq!(next.spis(), vec![0x2002, 0x2003]);
        assert_eq!(next.reqid(), pair.reqid());
        assert_eq!(host.spis(), vec![0x2002, 0x2003]);
        assert_eq!(host.policies().len(), 2);
        assert_ne!(next.outbound.keys, pair.outbound.keys);
        assert!(store.snapshot().unwrap().has_valid_pair(&IdentityFilter::for_pair(&next)));
    }

    #[test]
    fn mismatched_keys_keep_spis() {
        let host = Arc::new(FakeHost::new());
        let mut store = AssociationStore::new(host.clone());
        let pair = store.bring_up(&transport(0x3000)).unwrap();
        let next = store.replace_with_mismatched_keys(&pair).unwrap();
        assert_eq!(next.spis(), pair.spis());
        assert_ne!(next.inbound.keys, pair.inbound.keys);
        assert_eq!(host.spis(), vec![0x3000, 0x3001]);
    }

    #[test]
    fn default_bases_are_disjoint() {
        let mut bases = Vec::new();
        for mode in [Mode::Tunnel, Mode::Transport] {
            for cipher in [&AES_GCM_128, &AES_CBC_HMAC_SHA256, &CHACHA20_POLY1305] {
                bases.push(TunnelSpec::default_spi_base(mode, cipher));
            }
        }
        assert_eq!(bases[0], 0x2000);
        bases.sort_unstable();
        assert!(bases.windows(2).all(|w| w[1] - w[0] >= CIPHER_SPI_STRIDE));
    }

    #[test]
    fn tunnel_mode_requires_subnets() {
        let spec = TunnelSpec::new(Mode::Tunnel, &AES_GCM_128, local(), remote());
        assert!(spec.validate().is_err());
        let spec = spec.with_selectors(TrafficSelectors {
            local: "10.1.0.0/16".parse().unwrap(),
            remote: "10.2.0.0/16".parse().unwrap(),
        });
        assert!(spec.validate().is_ok());
        assert!(transport(0x10).validate().is_err());
    }

    #[test]
    fn failed_inbound_rolls_back_outbound() {
        let host = Arc::new(FakeHost::new());
        let faulty = DeterministicFaultExecutor::new(host.clone(), 0).with_rule(
            FaultRule::new("spi 0x00002001", FaultResponse::exit(2, "RTNETLINK answers: Invalid argument")),
        );
        let mut store = AssociationStore::new(Arc::new(faulty));
        let err = store.bring_up(&transport(0x2000)).unwrap_err();
        assert_eq!(err.op, AssociationOp::AddState);
        assert_eq!(err.spi, Some(0x2001));
        assert!(err.diagnostic.contains("Invalid argument"));
        assert!(host.spis().is_empty());
        assert_eq!(store.registered().count(), 0);
    }

    #[test]
    fn allocation_skips_live_spis() {
        let host = Arc::new(FakeHost::new());
        let mut store = AssociationStore::new(host);
        let cipher = &AES_GCM_128;
        store
            .install_pair(PairRequest {
                mode: Mode::Transport,
                cipher,
                local: local(),
                remote: remote(),
                selectors: TrafficSelectors::hosts(local(), remote()),
                spi_base: 0x2000,
                outbound_spi: 0x2000,
                inbound_spi: 0x2001,
                reqid: None,
                outbound_keys: cipher.generate_keys(),
                inbound_keys: cipher.generate_keys(),
                with_policy: false,
            })
            .unwrap();
        let pair = store.bring_up(&transport(0x2000)).unwrap();
        assert_eq!(pair.spis(), vec![0x2002, 0x2003]);
    }

    #[test]
    fn install_pair_keeps_given_keys_and_unwinds_failed_policy() {
        let host = Arc::new(FakeHost::new());
        let faulty = DeterministicFaultExecutor::new(host.clone(), 0).with_rule(
            FaultRule::new("dir in", FaultResponse::exit(2, "RTNETLINK answers: File exists")).after(1),
        );
        let mut store = AssociationStore::new(Arc::new(faulty));
        let cipher = &AES_GCM_128;
        let request = |out_spi: u32| PairRequest {
            mode: Mode::Transport,
            cipher,
            local: local(),
            remote: remote(),
            selectors: TrafficSelectors::hosts(local(), remote()),
            spi_base: 0x2000,
            outbound_spi: out_spi,
            inbound_spi: out_spi + 1,
            reqid: Some(0x2000),
            outbound_keys: cipher.parse_keys("0x0101010101010101010101010101010101010101").unwrap(),
            inbound_keys: cipher.parse_keys("0x0202020202020202020202020202020202020202").unwrap(),
            with_policy: true,
        };

        let pair = store.install_pair(request(0x2000)).unwrap();
        assert!(pair.outbound.keys == cipher.parse_keys("0x0101010101010101010101010101010101010101").unwrap());
        assert!(pair.inbound.keys == cipher.parse_keys("0x0202020202020202020202020202020202020202").unwrap());
        assert_eq!(host.policies().len(), 2);

        // The second install's inbound policy is refused; its SAs and
        // outbound policy go away again.
        store.flush_all();
        let err = store.install_pair(request(0x2000)).unwrap_err();
        assert_eq!(err.op, AssociationOp::AddPolicy);
        assert!(host.spis().is_empty());
        assert!(host.policies().is_empty());
    }

    #[test]
    fn delete_unknown_spi_reports_error() {
        let mut store = AssociationStore::new(Arc::new(FakeHost::new()));
        let err = store.delete(0xdead).unwrap_err();
        assert_eq!(err.op, AssociationOp::DeleteState);
        assert_eq!(err.spi, Some(0xdead));
    }

    #[test]
    fn flush_all_clears_everything_and_swallows_failures() {
        let host = Arc::new(FakeHost::new());
        let mut store = AssociationStore::new(host.clone());
        store.bring_up(&transport(0x2000)).unwrap();
        store.flush_all();
        assert!(host.states().is_empty());
        assert!(host.policies().is_empty());

        let broken = DeterministicFaultExecutor::new(Arc::new(FakeHost::new()), 0)
            .with_rule(FaultRule::new("flush", FaultResponse::Reject("netlink gone".into())));
        AssociationStore::new(Arc::new(broken)).flush_all();
    }

    #[test]
    fn dry_run_snapshot_uses_registry() {
        let dry = Arc::new(DryRunExecutor::new());
        let mut store = AssociationStore::new(dry.clone());
        let pair = store.bring_up(&transport(0x2000)).unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.identifiers(&IdentityFilter::for_pair(&pair)), vec![0x2000, 0x2001]);
        assert!(snap.has_valid_pair(&IdentityFilter::for_pair(&pair)));
        assert!(dry.history().iter().all(|c| !c.to_string().contains("show")));
    }

    #[test]
    fn parses_iproute_listing() {
        let states = "\
src 10.0.0.1 dst 10.0.0.2
\tproto esp spi 0x00002000 reqid 8192 mode tunnel
\treplay-window 0 flag af-unspec
\taead rfc4106(gcm(aes)) 0x0011 128
\tsel src 0.0.0.0/0 dst 0.0.0.0/0
src 10.0.0.2 dst 10.0.0.1
\tproto esp spi 0x00002001 reqid 8192 mode tunnel
\treplay-window 0 flag af-unspec
";
        let policies = "\
src 10.1.0.0/16 dst 10.2.0.0/16
\tdir out priority 0
\ttmpl src 10.0.0.1 dst 10.0.0.2
\t\tproto esp reqid 8192 mode tunnel
src 10.2.0.0/16 dst 10.1.0.0/16
\tdir in priority 0
\ttmpl src 10.0.0.2 dst 10.0.0.1
\t\tproto esp reqid 8192 mode tunnel
src 0.0.0.0/0 dst 0.0.0.0/0
\tsocket in priority 0
";
        let snap = XfrmSnapshot::parse(states, policies);
        assert_eq!(snap.states.len(), 2);
        assert_eq!(snap.states[0].mode, Some(Mode::Tunnel));
        assert_eq!(snap.policies.len(), 2);

        let any = IdentityFilter {
            local: local(),
            remote: remote(),
            reqid: None,
        };
        assert!(snap.has_valid_pair(&any));
        let other = IdentityFilter {
            reqid: Some(1),
            ..any
        };
        assert!(!snap.has_valid_pair(&other));
        assert!(snap.identifiers(&other).is_empty());
    }

    #[test]
    fn defects_flag_dangling_policies_and_half_pairs() {
        let snap = XfrmSnapshot {
            states: vec![StateEntry {
                src: local(),
                dst: remote(),
                spi: 0x2000,
                reqid: 7,
                mode: Some(Mode::Transport),
            }],
            policies: vec![PolicyEntry {
                src: "10.0.0.1/32".into(),
                dst: "10.0.0.2/32".into(),
                dir: "out".into(),
                reqid: 9,
            }],
        };
        let defects = snap.defects();
        assert_eq!(defects.len(), 2);
        assert!(defects.iter().any(|d| d.contains("dangling out policy")));
        assert!(defects.iter().any(|d| d.contains("partial SA pair for reqid 7")));
    }
}
