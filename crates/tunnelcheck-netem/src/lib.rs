//! Network impairment toolkit.
//!
//! Applies and removes `tc netem` disciplines (globally or scoped to one
//! peer) and manages Linux network namespaces for privileged tests. All
//! host interaction goes through a [`CommandExecutor`], so the same code
//! runs for real, in dry-run and against an in-memory host.
//!
//! [`CommandExecutor`]: tunnelcheck_common::exec::CommandExecutor

pub mod impairment;
pub mod topology;

pub mod test_util;
