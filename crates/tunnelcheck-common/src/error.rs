//! Error taxonomy.
//!
//! Each component reports failures through its own type so the orchestrator
//! can decide per phase whether a failure means `Error` (the harness broke),
//! `Fail` (the system under test misbehaved) or nothing at all (teardown).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ── Executor ────────────────────────────────────────────────────────

/// Failure to execute a host command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {reason}")]
    Spawn { program: String, reason: String },
    #[error("`{command}` exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("`{command}` rejected by fault injection: {message}")]
    Injected { command: String, message: String },
    #[error("lost track of `{command}`: {reason}")]
    Wait { command: String, reason: String },
}

impl ExecError {
    /// The most specific diagnostic text available, for result notes.
    pub fn diagnostic(&self) -> String {
        match self {
            ExecError::Failed { stderr, .. } if !stderr.trim().is_empty() => {
                stderr.trim().to_string()
            }
            ExecError::Injected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Invalid scenario or exhaustion parameters. Raised before anything is
/// created on the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

// ── Association store ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationOp {
    AddState,
    DeleteState,
    AddPolicy,
    DeletePolicy,
    Flush,
    Query,
}

impl fmt::Display for AssociationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssociationOp::AddState => write!(f, "state add"),
            AssociationOp::DeleteState => write!(f, "state delete"),
            AssociationOp::AddPolicy => write!(f, "policy add"),
            AssociationOp::DeletePolicy => write!(f, "policy delete"),
            AssociationOp::Flush => write!(f, "flush"),
            AssociationOp::Query => write!(f, "query"),
        }
    }
}

/// An association create/delete/flush/query failure, carrying the SPI that
/// was being worked on and the underlying diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationError {
    pub op: AssociationOp,
    pub spi: Option<u32>,
    pub diagnostic: String,
}

impl AssociationError {
    pub fn new(op: AssociationOp, spi: Option<u32>, diagnostic: impl Into<String>) -> Self {
        Self {
            op,
            spi,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn from_exec(op: AssociationOp, spi: Option<u32>, err: &ExecError) -> Self {
        Self::new(op, spi, err.diagnostic())
    }
}

impl fmt::Display for AssociationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.spi {
            Some(spi) => write!(
                f,
                "xfrm {} failed for spi 0x{:08x}: {}",
                self.op, spi, self.diagnostic
            ),
            None => write!(f, "xfrm {} failed: {}", self.op, self.diagnostic),
        }
    }
}

impl std::error::Error for AssociationError {}

// ── Impairment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImpairmentError {
    #[error("invalid impairment profile: {0}")]
    InvalidProfile(String),
    #[error("shaping on {interface} failed: {diagnostic}")]
    Command {
        interface: String,
        diagnostic: String,
    },
}

// ── Workload ────────────────────────────────────────────────────────

/// Workload failures never abort orchestration; they turn into a `Fail`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    #[error("workload could not start: {0}")]
    Start(String),
    #[error("workload tool exited with status {status}: {stderr}")]
    ToolFailed { status: i32, stderr: String },
    #[error("workload verification failed: {0}")]
    Verification(String),
    #[error("unreadable workload report: {0}")]
    Report(String),
    #[error("checksum of {path} changed after completion ({before} -> {after})")]
    ChecksumDrift {
        path: String,
        before: String,
        after: String,
    },
    #[error("checksum of {path} unavailable: {reason}")]
    Checksum { path: String, reason: String },
}

// ── Recovery ────────────────────────────────────────────────────────

/// A recovery predicate that never held. Recorded as `Fail`, not `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{what} not satisfied within {waited:?}")]
pub struct TimeoutError {
    pub what: String,
    pub waited: Duration,
}

// ── Umbrella ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Association(#[from] AssociationError),
    #[error(transparent)]
    Impairment(#[from] ImpairmentError),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_error_names_spi_in_hex() {
        let err = AssociationError::new(AssociationOp::AddState, Some(0x2000), "File exists");
        assert_eq!(
            err.to_string(),
            "xfrm state add failed for spi 0x00002000: File exists"
        );
    }

    #[test]
    fn exec_diagnostic_prefers_stderr() {
        let err = ExecError::Failed {
            command: "ip xfrm state add".into(),
            status: 2,
            stderr: "RTNETLINK answers: No buffer space available\n".into(),
        };
        assert_eq!(
            err.diagnostic(),
            "RTNETLINK answers: No buffer space available"
        );

        let quiet = ExecError::Failed {
            command: "tc qdisc add".into(),
            status: 1,
            stderr: String::new(),
        };
        assert!(quiet.diagnostic().contains("exited with status 1"));
    }
}
