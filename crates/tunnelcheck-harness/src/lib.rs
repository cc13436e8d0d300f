//! Fault-injection harness for IPsec (xfrm) tunnels carrying storage I/O.
//!
//! A scenario brings up an ESP association pair, runs an `fio` workload
//! across it, injects one fault — a rekey, mismatched keys, network
//! impairment, SA-table exhaustion, deletion, or an operator command —
//! and classifies whether the tunnel and the I/O survived.
//!
//! - [`xfrm`] — association store (SA/policy lifecycle, snapshots)
//! - [`workload`] — fio driver with background monitoring
//! - [`recovery`] — bounded polling with an injectable clock
//! - [`orchestrator`] — phase sequencing, teardown, classification
//! - [`exhaustion`] — SA-table capacity probing
//! - [`sink`] — CSV / JSON-lines result output
//! - [`config`] — TOML batch files

pub mod capture;
pub mod checksum;
pub mod config;
pub mod exhaustion;
pub mod orchestrator;
pub mod recovery;
pub mod scenario;
pub mod sink;
pub mod workload;
pub mod xfrm;
