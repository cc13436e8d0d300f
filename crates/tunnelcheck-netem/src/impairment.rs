use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tunnelcheck_common::error::ImpairmentError;
use tunnelcheck_common::exec::{CommandExecutor, CommandLine, CommandOutput};
use tunnelcheck_common::models::{ImpairmentProfile, ImpairmentScope};

/// Root handle of the priority tree used for peer-scoped impairment.
const PRIO_HANDLE: &str = "1:";
/// Band that the peer filters steer into; bands 1:1 and 1:2 stay clean.
const IMPAIRED_BAND: &str = "1:3";
const NETEM_HANDLE: &str = "30:";
/// Every TOS class goes to band 1:2, so only the peer filters reach 1:3.
const UNFILTERED_PRIOMAP: [&str; 19] = [
    "bands", "3", "priomap", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1", "1",
];

/// Qdisc kinds the kernel installs by itself. Not counted as shaping.
const DEFAULT_QDISCS: &[&str] = &["noqueue", "noop", "pfifo_fast", "fq_codel", "mq", "fq", "pfifo"];

/// Owns every `tc` change made to the host's interfaces.
///
/// At most one profile is active per interface; applying a profile always
/// clears whatever was installed before.
pub struct ImpairmentController {
    executor: Arc<dyn CommandExecutor>,
    active: HashMap<String, ImpairmentProfile>,
}

impl ImpairmentController {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            active: HashMap::new(),
        }
    }

    /// Apply `profile` according to its scope.
    pub fn apply(&mut self, interface: &str, profile: &ImpairmentProfile) -> Result<(), ImpairmentError> {
        match profile.scope {
            ImpairmentScope::Global => self.apply_global(interface, profile),
            ImpairmentScope::Peer(target) => self.apply_scoped(interface, target, profile),
        }
    }

    /// Impair only traffic to or from `target`: a `prio` root, netem on the
    /// third band, and u32 filters on both directions steering `target` there.
    pub fn apply_scoped(
        &mut self,
        interface: &str,
        target: IpAddr,
        profile: &ImpairmentProfile,
    ) -> Result<(), ImpairmentError> {
        profile.validate().map_err(ImpairmentError::InvalidProfile)?;
        self.clear(interface)?;

        let (protocol, matcher) = if target.is_ipv4() { ("ip", "ip") } else { ("ipv6", "ip6") };
        let target_text = target.to_string();

        let mut steps = vec![
            tc(["qdisc", "add", "dev", interface, "root", "handle", PRIO_HANDLE, "prio"]).args(UNFILTERED_PRIOMAP),
            tc(["qdisc", "add", "dev", interface, "parent", IMPAIRED_BAND, "handle", NETEM_HANDLE, "netem"])
                .args(netem_params(profile)),
        ];
        for side in ["dst", "src"] {
            steps.push(tc([
                "filter", "add", "dev", interface, "protocol", protocol, "parent", PRIO_HANDLE,
                "prio", "1", "u32", "match", matcher, side, target_text.as_str(), "flowid", IMPAIRED_BAND,
            ]));
        }

        if let Err(e) = self.run_all(interface, &steps) {
            // Never leave half a tree behind.
            let _ = self.clear(interface);
            return Err(e);
        }

        tracing::info!(
            interface,
            target = %target,
            loss = profile.loss_percent,
            delay_ms = profile.delay_ms,
            reorder = profile.reorder_percent,
            "scoped impairment applied"
        );
        self.active.insert(interface.to_string(), profile.clone());
        Ok(())
    }

    /// Impair everything leaving `interface` with a root netem qdisc.
    pub fn apply_global(&mut self, interface: &str, profile: &ImpairmentProfile) -> Result<(), ImpairmentError> {
        profile.validate().map_err(ImpairmentError::InvalidProfile)?;
        self.clear(interface)?;

        let cmd = tc(["qdisc", "add", "dev", interface, "root", "netem"]).args(netem_params(profile));
        self.run_all(interface, &[cmd])?;

        tracing::info!(
            interface,
            loss = profile.loss_percent,
            delay_ms = profile.delay_ms,
            reorder = profile.reorder_percent,
            "global impairment applied"
        );
        self.active.insert(interface.to_string(), profile.clone());
        Ok(())
    }

    /// Remove the root qdisc (and with it every child and filter).
    /// Succeeds when there is nothing to remove.
    pub fn clear(&mut self, interface: &str) -> Result<(), ImpairmentError> {
        self.active.remove(interface);
        let cmd = tc(["qdisc", "del", "dev", interface, "root"]);
        let out = self.run(interface, &cmd)?;
        if out.success() || nothing_installed(&out) {
            tracing::debug!(interface, "impairment cleared");
            return Ok(());
        }
        Err(ImpairmentError::Command {
            interface: interface.to_string(),
            diagnostic: out.stderr.trim().to_string(),
        })
    }

    pub fn active(&self, interface: &str) -> Option<&ImpairmentProfile> {
        self.active.get(interface)
    }

    /// Interfaces with a profile applied through this controller.
    pub fn active_interfaces(&self) -> Vec<String> {
        let mut ifaces: Vec<String> = self.active.keys().cloned().collect();
        ifaces.sort();
        ifaces
    }

    /// Non-default qdiscs plus classifier filters currently on `interface`.
    pub fn shaping_rules(&self, interface: &str) -> Result<usize, ImpairmentError> {
        let qdiscs = self.run_checked(interface, &tc(["qdisc", "show", "dev", interface]))?;
        let filters = self.run_checked(interface, &tc(["filter", "show", "dev", interface]))?;

        let shaped = qdiscs
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("qdisc "))
            .filter(|rest| {
                let kind = rest.split_whitespace().next().unwrap_or_default();
                !DEFAULT_QDISCS.contains(&kind)
            })
            .count();
        let classified = filters
            .stdout
            .lines()
            .filter(|line| line.starts_with("filter") && line.contains("flowid"))
            .count();
        Ok(shaped + classified)
    }

    fn run(&self, interface: &str, cmd: &CommandLine) -> Result<CommandOutput, ImpairmentError> {
        self.executor.run(cmd).map_err(|e| ImpairmentError::Command {
            interface: interface.to_string(),
            diagnostic: e.diagnostic(),
        })
    }

    fn run_checked(&self, interface: &str, cmd: &CommandLine) -> Result<CommandOutput, ImpairmentError> {
        self.executor.run_checked(cmd).map_err(|e| ImpairmentError::Command {
            interface: interface.to_string(),
            diagnostic: e.diagnostic(),
        })
    }

    fn run_all(&self, interface: &str, cmds: &[CommandLine]) -> Result<(), ImpairmentError> {
        for cmd in cmds {
            self.run_checked(interface, cmd)?;
        }
        Ok(())
    }
}

fn tc<'a>(args: impl IntoIterator<Item = &'a str>) -> CommandLine {
    CommandLine::new("tc").args(args)
}

/// `tc qdisc del` on an interface without a root qdisc fails; that is the
/// already-clear case, not an error.
fn nothing_installed(out: &CommandOutput) -> bool {
    let stderr = out.stderr.as_str();
    stderr.contains("handle of zero")
        || stderr.contains("No such file or directory")
        || stderr.contains("Cannot find specified qdisc")
}

/// netem parameters for `profile`, in the order tc expects them.
fn netem_params(profile: &ImpairmentProfile) -> Vec<String> {
    let mut args = Vec::new();

    if profile.delay_ms > 0 || profile.reorder_percent > 0.0 {
        args.push("delay".into());
        args.push(format!("{}ms", profile.delay_ms));
        if let Some(jitter) = profile.jitter_ms.filter(|j| *j > 0) {
            args.push(format!("{jitter}ms"));
        }
    }

    if profile.loss_percent > 0.0 {
        args.push("loss".into());
        args.push(format!("{}%", profile.loss_percent));
    }

    if let Some(dup) = profile.duplicate_percent {
        args.push("duplicate".into());
        args.push(format!("{dup}%"));
    }

    if profile.reorder_percent > 0.0 {
        args.push("reorder".into());
        args.push(format!("{}%", profile.reorder_percent));
    }

    if let Some(corrupt) = profile.corrupt_percent {
        args.push("corrupt".into());
        args.push(format!("{corrupt}%"));
    }

    if let Some(rate) = profile.rate_kbit {
        args.push("rate".into());
        args.push(format!("{rate}kbit"));
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelcheck_common::exec::DryRunExecutor;
    use tunnelcheck_common::fault::{DeterministicFaultExecutor, FaultResponse, FaultRule};
    use tunnelcheck_common::test_util::FakeHost;

    fn target() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    #[test]
    fn scoped_profile_builds_prio_tree() {
        let host = Arc::new(FakeHost::new());
        let mut netem = ImpairmentController::new(host.clone());
        let profile = ImpairmentProfile::peer(target(), 2.0, 10, 10.0);

        netem.apply_scoped("eth0", target(), &profile).unwrap();

        let issued: Vec<String> = host.history().iter().map(|c| c.to_string()).collect();
        assert_eq!(issued[0], "tc qdisc del dev eth0 root");
        assert_eq!(
            issued[1],
            "tc qdisc add dev eth0 root handle 1: prio bands 3 priomap 1 1 1 1 1 1 1 1 1 1 1 1 1 1 1 1"
        );
        assert_eq!(
            issued[2],
            "tc qdisc add dev eth0 parent 1:3 handle 30: netem delay 10ms loss 2% reorder 10%"
        );
        assert!(issued[3].ends_with("match ip dst 10.0.0.2 flowid 1:3"));
        assert!(issued[4].ends_with("match ip src 10.0.0.2 flowid 1:3"));

        assert_eq!(netem.shaping_rules("eth0").unwrap(), 4);
        assert_eq!(netem.active("eth0"), Some(&profile));
    }

    #[test]
    fn unfiltered_traffic_never_lands_in_netem_band() {
        let host = Arc::new(FakeHost::new());
        let mut netem = ImpairmentController::new(host.clone());
        netem
            .apply_scoped("eth0", target(), &ImpairmentProfile::peer(target(), 2.0, 10, 10.0))
            .unwrap();

        let root = host
            .history()
            .into_iter()
            .find(|c| c.argv().iter().any(|a| a == "prio") && c.argv().iter().any(|a| a == "root"))
            .unwrap();
        let argv = root.argv();
        let map_at = argv.iter().position(|a| a == "priomap").unwrap();
        let map = &argv[map_at + 1..];
        assert_eq!(map.len(), 16);
        // Band index 2 is 1:3.
        assert!(map.iter().all(|band| band != "2"));
    }

    #[test]
    fn clear_leaves_no_rules_and_is_idempotent() {
        let host = Arc::new(FakeHost::new());
        let mut netem = ImpairmentController::new(host.clone());
        netem
            .apply("eth0", &ImpairmentProfile::peer(target(), 2.0, 10, 10.0))
            .unwrap();

        netem.clear("eth0").unwrap();
        assert_eq!(netem.shaping_rules("eth0").unwrap(), 0);
        assert_eq!(host.shaping_rules("eth0"), 0);
        netem.clear("eth0").unwrap();
        netem.clear("eth0").unwrap();
        assert!(netem.active("eth0").is_none());
    }

    #[test]
    fn reapply_replaces_previous_profile() {
        let host = Arc::new(FakeHost::new());
        let mut netem = ImpairmentController::new(host.clone());
        netem
            .apply("eth0", &ImpairmentProfile::global(1.0, 5, 0.0))
            .unwrap();
        netem
            .apply("eth0", &ImpairmentProfile::peer(target(), 2.0, 10, 10.0))
            .unwrap();
        assert_eq!(host.shaping_rules("eth0"), 4);
        assert_eq!(netem.active_interfaces(), vec!["eth0".to_string()]);
    }

    #[test]
    fn invalid_profile_issues_nothing() {
        let host = Arc::new(FakeHost::new());
        let mut netem = ImpairmentController::new(host.clone());
        let err = netem
            .apply("eth0", &ImpairmentProfile::global(120.0, 0, 0.0))
            .unwrap_err();
        assert!(matches!(err, ImpairmentError::InvalidProfile(_)));
        assert!(host.history().is_empty());
    }

    #[test]
    fn failed_filter_rolls_back_tree() {
        let host = Arc::new(FakeHost::new());
        let faulty = DeterministicFaultExecutor::new(host.clone(), 0).with_rule(FaultRule::new(
            "filter add",
            FaultResponse::exit(2, "RTNETLINK answers: Operation not supported"),
        ));
        let mut netem = ImpairmentController::new(Arc::new(faulty));
        let err = netem
            .apply("eth0", &ImpairmentProfile::peer(target(), 2.0, 10, 0.0))
            .unwrap_err();
        match err {
            ImpairmentError::Command { interface, diagnostic } => {
                assert_eq!(interface, "eth0");
                assert!(diagnostic.contains("Operation not supported"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(host.shaping_rules("eth0"), 0);
        assert!(netem.active("eth0").is_none());
    }

    #[test]
    fn global_profile_carries_optional_params() {
        let dry = Arc::new(DryRunExecutor::new());
        let mut netem = ImpairmentController::new(dry.clone());
        let profile = ImpairmentProfile {
            jitter_ms: Some(3),
            duplicate_percent: Some(1.0),
            corrupt_percent: Some(0.5),
            rate_kbit: Some(5000),
            ..ImpairmentProfile::global(0.0, 20, 0.0)
        };
        netem.apply_global("veth0", &profile).unwrap();
        assert_eq!(
            dry.history()[1].to_string(),
            "tc qdisc add dev veth0 root netem delay 20ms 3ms duplicate 1% corrupt 0.5% rate 5000kbit"
        );
    }

    #[test]
    fn ipv6_peer_uses_ip6_match() {
        let dry = Arc::new(DryRunExecutor::new());
        let mut netem = ImpairmentController::new(dry.clone());
        let peer: IpAddr = "fd00::2".parse().unwrap();
        netem
            .apply_scoped("eth0", peer, &ImpairmentProfile::peer(peer, 1.0, 0, 0.0))
            .unwrap();
        let filter = dry.history()[3].to_string();
        assert!(filter.contains("protocol ipv6"));
        assert!(filter.contains("match ip6 dst fd00::2"));
    }
}
