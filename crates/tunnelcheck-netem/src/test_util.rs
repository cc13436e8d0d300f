use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Whether this environment can create network namespaces and shape
/// traffic: `ip netns` works and we are root.
pub fn check_privileges() -> bool {
    // SAFETY: geteuid has no preconditions.
    let root = unsafe { libc::geteuid() } == 0;
    root && matches!(Command::new("ip").arg("netns").output(), Ok(o) if o.status.success())
}

/// A namespace name unique to this process and call, at most 15 characters.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}_{:x}_{}", prefix, std::process::id() % 0xFFFF, seq);
    name.chars().take(15).collect()
}
