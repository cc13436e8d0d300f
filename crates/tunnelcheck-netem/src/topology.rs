use std::sync::Arc;

use tunnelcheck_common::error::ExecError;
use tunnelcheck_common::exec::{CommandExecutor, CommandLine, CommandOutput, NamespacedExecutor};

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, brings up loopback, and deletes
/// the namespace on drop.
pub struct Namespace {
    pub name: String,
    executor: Arc<dyn CommandExecutor>,
}

impl Namespace {
    pub fn new(executor: Arc<dyn CommandExecutor>, name: &str) -> Result<Self, ExecError> {
        // leftovers from an earlier run
        let _ = executor.run(&ip(["netns", "del", name]));
        executor.run_checked(&ip(["netns", "add", name]))?;

        let ns = Self {
            name: name.to_string(),
            executor,
        };
        let _ = ns.exec(&ip(["link", "set", "lo", "up"]));
        tracing::debug!(netns = %ns.name, "namespace created");
        Ok(ns)
    }

    /// Run `cmd` inside the namespace.
    pub fn exec(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        self.executor.run(&cmd.in_netns(&self.name))
    }

    /// An executor that runs everything inside this namespace.
    pub fn executor(&self) -> NamespacedExecutor {
        NamespacedExecutor::new(Arc::clone(&self.executor), self.name.clone())
    }

    /// Create a veth pair between `self` and `other` and address both ends.
    pub fn add_veth_link(
        &self,
        other: &Namespace,
        local_if: &str,
        peer_if: &str,
        local_addr: &str,
        peer_addr: &str,
    ) -> Result<(), ExecError> {
        let _ = self.executor.run(&ip(["link", "del", local_if]));

        let host = &self.executor;
        host.run_checked(&ip(["link", "add", local_if, "type", "veth", "peer", "name", peer_if]))?;
        host.run_checked(&ip(["link", "set", local_if, "netns", self.name.as_str()]))?;
        host.run_checked(&ip(["link", "set", peer_if, "netns", other.name.as_str()]))?;

        for (ns, iface, addr) in [(self, local_if, local_addr), (other, peer_if, peer_addr)] {
            let cmd = ip(["addr", "add", addr, "dev", iface]).in_netns(&ns.name);
            ns.executor.run_checked(&cmd)?;
            let cmd = ip(["link", "set", iface, "up"]).in_netns(&ns.name);
            ns.executor.run_checked(&cmd)?;
        }

        tracing::debug!(local = %self.name, peer = %other.name, local_if, peer_if, "veth link up");
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = self.executor.run(&ip(["netns", "del", self.name.as_str()]));
    }
}

fn ip<'a>(args: impl IntoIterator<Item = &'a str>) -> CommandLine {
    CommandLine::new("ip").args(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelcheck_common::exec::DryRunExecutor;

    #[test]
    fn lifecycle_commands() {
        let dry = Arc::new(DryRunExecutor::new());
        {
            let left = Namespace::new(dry.clone(), "tc_left").unwrap();
            let right = Namespace::new(dry.clone(), "tc_right").unwrap();
            left.add_veth_link(&right, "veth_l", "veth_r", "10.201.1.1/24", "10.201.1.2/24")
                .unwrap();
        }
        let issued: Vec<String> = dry.history().iter().map(|c| c.to_string()).collect();
        assert_eq!(issued[0], "ip netns del tc_left");
        assert_eq!(issued[1], "ip netns add tc_left");
        assert_eq!(issued[2], "ip netns exec tc_left ip link set lo up");
        assert!(issued.contains(&"ip netns exec tc_right ip addr add 10.201.1.2/24 dev veth_r".to_string()));
        // Drop order: right first, then left.
        let tail = &issued[issued.len() - 2..];
        assert_eq!(tail, ["ip netns del tc_right", "ip netns del tc_left"]);
    }

    #[test]
    fn namespaced_executor_targets_namespace() {
        let dry = Arc::new(DryRunExecutor::new());
        let ns = Namespace::new(dry.clone(), "tc_exec").unwrap();
        ns.executor()
            .run(&CommandLine::new("tc").args(["qdisc", "show"]))
            .unwrap();
        assert_eq!(
            dry.history().last().map(|c| c.to_string()).as_deref(),
            Some("ip netns exec tc_exec tc qdisc show")
        );
    }
}
