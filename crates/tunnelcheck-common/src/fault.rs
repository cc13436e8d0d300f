//! Deterministic fault injection.
//!
//! [`DeterministicFaultExecutor`] wraps another executor and answers
//! selected commands with a scripted failure or output. Rules fire with a
//! fixed probability drawn from a seeded [`StdRng`], so the same seed and
//! command sequence always produce the same faults.

use std::sync::{Arc, Mutex, PoisonError};

use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::ExecError;
use crate::exec::{BackgroundProcess, CommandExecutor, CommandLine, CommandOutput, CompletedProcess};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultResponse {
    /// The command cannot be executed at all.
    Reject(String),
    /// The command "ran" and produced this output.
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

impl FaultResponse {
    pub fn exit(status: i32, stderr: impl Into<String>) -> Self {
        FaultResponse::Exit {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn output(stdout: impl Into<String>) -> Self {
        FaultResponse::Exit {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Matches commands whose rendered form contains `pattern`.
#[derive(Debug, Clone)]
pub struct FaultRule {
    pattern: String,
    probability: f64,
    skip: usize,
    limit: Option<usize>,
    response: FaultResponse,
}

impl FaultRule {
    pub fn new(pattern: impl Into<String>, response: FaultResponse) -> Self {
        Self {
            pattern: pattern.into(),
            probability: 1.0,
            skip: 0,
            limit: None,
            response,
        }
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Let the first `n` matching commands through untouched.
    pub fn after(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Fire at most `n` times.
    pub fn times(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFault {
    pub rule: usize,
    pub command: String,
}

struct FaultState {
    rng: StdRng,
    matched: Vec<usize>,
    fired: Vec<usize>,
    log: Vec<InjectedFault>,
}

pub struct DeterministicFaultExecutor {
    inner: Arc<dyn CommandExecutor>,
    rules: Vec<FaultRule>,
    state: Mutex<FaultState>,
}

impl DeterministicFaultExecutor {
    pub fn new(inner: Arc<dyn CommandExecutor>, seed: u64) -> Self {
        Self {
            inner,
            rules: Vec::new(),
            state: Mutex::new(FaultState {
                rng: StdRng::seed_from_u64(seed),
                matched: Vec::new(),
                fired: Vec::new(),
                log: Vec::new(),
            }),
        }
    }

    pub fn with_rule(mut self, rule: FaultRule) -> Self {
        self.rules.push(rule);
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.matched.push(0);
        state.fired.push(0);
        self
    }

    /// Every fault injected so far, in order.
    pub fn injected(&self) -> Vec<InjectedFault> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .clone()
    }

    fn decide(&self, cmd: &CommandLine) -> Option<FaultResponse> {
        let rendered = cmd.to_string();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (idx, rule) in self.rules.iter().enumerate() {
            if !rendered.contains(&rule.pattern) {
                continue;
            }
            state.matched[idx] += 1;
            if state.matched[idx] <= rule.skip {
                continue;
            }
            if rule.limit.is_some_and(|limit| state.fired[idx] >= limit) {
                continue;
            }
            let roll = state.rng.random::<f64>();
            if roll >= rule.probability {
                continue;
            }
            state.fired[idx] += 1;
            state.log.push(InjectedFault {
                rule: idx,
                command: rendered.clone(),
            });
            tracing::warn!(rule = idx, command = %rendered, "injecting fault");
            return Some(rule.response.clone());
        }
        None
    }
}

impl CommandExecutor for DeterministicFaultExecutor {
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        match self.decide(cmd) {
            Some(FaultResponse::Reject(message)) => Err(ExecError::Injected {
                command: cmd.to_string(),
                message,
            }),
            Some(FaultResponse::Exit {
                status,
                stdout,
                stderr,
            }) => Ok(CommandOutput {
                status,
                stdout,
                stderr,
            }),
            None => self.inner.run(cmd),
        }
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn BackgroundProcess>, ExecError> {
        match self.decide(cmd) {
            Some(FaultResponse::Reject(message)) => Err(ExecError::Injected {
                command: cmd.to_string(),
                message,
            }),
            Some(FaultResponse::Exit {
                status,
                stdout,
                stderr,
            }) => Ok(Box::new(CompletedProcess::new(CommandOutput {
                status,
                stdout,
                stderr,
            }))),
            None => self.inner.spawn(cmd),
        }
    }

    fn is_dry_run(&self) -> bool {
        self.inner.is_dry_run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::DryRunExecutor;

    fn xfrm_add(spi: u32) -> CommandLine {
        CommandLine::new("ip")
            .args(["xfrm", "state", "add", "spi"])
            .arg(format!("0x{spi:08x}"))
    }

    #[test]
    fn rule_skips_then_fires_limited_times() {
        let exec = DeterministicFaultExecutor::new(Arc::new(DryRunExecutor::new()), 7).with_rule(
            FaultRule::new("xfrm state add", FaultResponse::exit(2, "No buffer space available"))
                .after(2)
                .times(1),
        );

        let statuses: Vec<i32> = (0..5)
            .map(|i| exec.run(&xfrm_add(0x100 + i)).unwrap().status)
            .collect();
        assert_eq!(statuses, vec![0, 0, 2, 0, 0]);
        assert_eq!(exec.injected().len(), 1);
        assert!(exec.injected()[0].command.contains("0x00000102"));
    }

    #[test]
    fn reject_fails_spawn() {
        let exec = DeterministicFaultExecutor::new(Arc::new(DryRunExecutor::new()), 1)
            .with_rule(FaultRule::new("fio", FaultResponse::Reject("no such binary".into())));
        let err = exec.spawn(&CommandLine::new("fio").arg("--name=x")).err().unwrap();
        assert!(matches!(err, ExecError::Injected { .. }));
    }

    #[test]
    fn same_seed_same_faults() {
        let pattern = |seed| {
            let exec = DeterministicFaultExecutor::new(Arc::new(DryRunExecutor::new()), seed)
                .with_rule(
                    FaultRule::new("xfrm", FaultResponse::exit(1, "flaky")).with_probability(0.5),
                );
            (0..32)
                .map(|i| exec.run(&xfrm_add(i)).unwrap().success())
                .collect::<Vec<_>>()
        };
        assert_eq!(pattern(42), pattern(42));
        assert!(pattern(42).iter().any(|ok| !ok));
    }

    #[test]
    fn unmatched_commands_reach_inner() {
        let dry = Arc::new(DryRunExecutor::new());
        let exec = DeterministicFaultExecutor::new(dry.clone(), 3)
            .with_rule(FaultRule::new("tcpdump", FaultResponse::Reject("nope".into())));
        exec.run(&CommandLine::new("tc").args(["qdisc", "show"])).unwrap();
        assert_eq!(dry.history().len(), 1);
        assert!(exec.is_dry_run());
    }
}
