//! Shared types for the tunnelcheck harness.
//!
//! This crate contains:
//! - **Data model** — modes, selectors, security associations, impairment
//!   profiles, workload specs and scenario results
//! - **Cipher presets** — ESP suites and their key-material shapes
//! - **Command executors** — real, dry-run, namespaced and deterministic
//!   fault-injecting execution of host commands
//! - **Error taxonomy** — one error type per component
//! - **Test support** — [`test_util::FakeHost`], an in-memory host model

pub mod ciphers;
pub mod error;
pub mod exec;
pub mod fault;
pub mod models;

pub mod test_util;
