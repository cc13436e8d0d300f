//! In-memory stand-in for a Linux host.
//!
//! [`FakeHost`] interprets the subset of `ip xfrm`, `tc`, `fio` and
//! `tcpdump` invocations the harness issues, keeps the resulting kernel
//! state in memory and renders listings the way iproute2 does, so the whole
//! orchestrator can be exercised without privileges.
//!
//! Namespaced commands (`ip netns exec NS ...`) are unwrapped and applied to
//! the same single host.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::error::ExecError;
use crate::exec::{BackgroundProcess, CommandExecutor, CommandLine, CommandOutput, CompletedProcess};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeState {
    pub src: String,
    pub dst: String,
    pub spi: u32,
    pub reqid: u32,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakePolicy {
    pub src: String,
    pub dst: String,
    pub dir: String,
    pub reqid: u32,
    pub mode: String,
    pub tmpl_src: String,
    pub tmpl_dst: String,
}

#[derive(Debug, Clone)]
struct FakeQdisc {
    parent: Option<String>,
    handle: String,
    kind: String,
    params: Vec<String>,
}

#[derive(Default)]
struct HostState {
    states: Vec<FakeState>,
    policies: Vec<FakePolicy>,
    qdiscs: BTreeMap<String, Vec<FakeQdisc>>,
    filters: BTreeMap<String, Vec<String>>,
    history: Vec<CommandLine>,
}

pub struct FakeHost {
    host: Mutex<HostState>,
    state_limit: Option<usize>,
    workload_duration: Duration,
    live: Arc<AtomicUsize>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            host: Mutex::new(HostState::default()),
            state_limit: None,
            workload_duration: Duration::from_millis(50),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse state installs beyond `limit` with `No buffer space available`.
    pub fn with_state_limit(mut self, limit: usize) -> Self {
        self.state_limit = Some(limit);
        self
    }

    /// How long a spawned `fio` keeps running (wall clock).
    pub fn with_workload_duration(mut self, duration: Duration) -> Self {
        self.workload_duration = duration;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn states(&self) -> Vec<FakeState> {
        self.lock().states.clone()
    }

    pub fn policies(&self) -> Vec<FakePolicy> {
        self.lock().policies.clone()
    }

    /// Installed SPIs, ascending.
    pub fn spis(&self) -> Vec<u32> {
        let mut spis: Vec<u32> = self.lock().states.iter().map(|s| s.spi).collect();
        spis.sort_unstable();
        spis
    }

    /// Qdiscs plus filters on `dev`.
    pub fn shaping_rules(&self, dev: &str) -> usize {
        let host = self.lock();
        host.qdiscs.get(dev).map_or(0, Vec::len) + host.filters.get(dev).map_or(0, Vec::len)
    }

    pub fn history(&self) -> Vec<CommandLine> {
        self.lock().history.clone()
    }

    /// Number of issued commands whose rendered form contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|c| c.to_string().contains(needle))
            .count()
    }

    /// Spawned processes that have neither exited nor been stopped.
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl CommandExecutor for FakeHost {
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        let (program, argv) = strip_netns(cmd);
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut host = self.lock();
        host.history.push(cmd.clone());
        let out = match (program, args.as_slice()) {
            ("ip", ["xfrm", "state", rest @ ..]) => host.xfrm_state(rest, self.state_limit),
            ("ip", ["xfrm", "policy", rest @ ..]) => host.xfrm_policy(rest),
            ("tc", ["qdisc", rest @ ..]) => host.qdisc(rest),
            ("tc", ["filter", rest @ ..]) => host.filter(rest),
            ("fio", _) => CommandOutput::ok(fio_report(&args)),
            _ => CommandOutput::default(),
        };
        Ok(out)
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn BackgroundProcess>, ExecError> {
        let (program, argv) = strip_netns(cmd);
        let deadline = match program {
            "fio" => Some(Instant::now() + self.workload_duration),
            "tcpdump" => None,
            _ => {
                let out = self.run(cmd)?;
                return Ok(Box::new(CompletedProcess::new(out)));
            }
        };
        let output = if program == "fio" {
            let args: Vec<&str> = argv.iter().map(String::as_str).collect();
            CommandOutput::ok(fio_report(&args))
        } else {
            CommandOutput::default()
        };
        self.lock().history.push(cmd.clone());
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            deadline,
            output,
            stopped: false,
            live: Some(Arc::clone(&self.live)),
        }))
    }
}

fn strip_netns(cmd: &CommandLine) -> (&str, &[String]) {
    let argv = cmd.argv();
    if cmd.program() == "ip" && argv.len() >= 4 && argv[0] == "netns" && argv[1] == "exec" {
        (argv[3].as_str(), &argv[4..])
    } else {
        (cmd.program(), argv)
    }
}

// ── xfrm ────────────────────────────────────────────────────────────

fn value<'a>(args: &[&'a str], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == key)
        .and_then(|i| args.get(i + 1))
        .copied()
}

fn parse_number(text: &str) -> Option<u32> {
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl HostState {
    fn xfrm_state(&mut self, args: &[&str], limit: Option<usize>) -> CommandOutput {
        match args.first().copied() {
            Some("add") => {
                let (Some(src), Some(dst), Some(spi)) = (
                    value(args, "src"),
                    value(args, "dst"),
                    value(args, "spi").and_then(parse_number),
                ) else {
                    return CommandOutput::failed(255, "Error: argument missing");
                };
                if self.states.iter().any(|s| s.spi == spi && s.dst == dst) {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists\n");
                }
                if limit.is_some_and(|l| self.states.len() >= l) {
                    return CommandOutput::failed(2, "RTNETLINK answers: No buffer space available\n");
                }
                self.states.push(FakeState {
                    src: src.to_string(),
                    dst: dst.to_string(),
                    spi,
                    reqid: value(args, "reqid").and_then(parse_number).unwrap_or(0),
                    mode: value(args, "mode").unwrap_or("transport").to_string(),
                });
                CommandOutput::default()
            }
            Some("delete") | Some("del") => {
                let spi = value(args, "spi").and_then(parse_number);
                let dst = value(args, "dst");
                let found = self
                    .states
                    .iter()
                    .position(|s| Some(s.spi) == spi && dst.is_none_or(|d| s.dst == d));
                match found {
                    Some(idx) => {
                        self.states.remove(idx);
                        CommandOutput::default()
                    }
                    None => CommandOutput::failed(2, "RTNETLINK answers: No such process\n"),
                }
            }
            Some("flush") => {
                self.states.clear();
                CommandOutput::default()
            }
            None | Some("show") | Some("list") => {
                let mut out = String::new();
                for s in &self.states {
                    out.push_str(&format!(
                        "src {} dst {}\n\tproto esp spi 0x{:08x} reqid {} mode {}\n\treplay-window 0 flag af-unspec\n",
                        s.src, s.dst, s.spi, s.reqid, s.mode
                    ));
                }
                CommandOutput::ok(out)
            }
            Some(other) => CommandOutput::failed(255, format!("Command \"{other}\" is unknown")),
        }
    }

    fn xfrm_policy(&mut self, args: &[&str]) -> CommandOutput {
        match args.first().copied() {
            Some("add") => {
                let (Some(src), Some(dst), Some(dir)) =
                    (value(args, "src"), value(args, "dst"), value(args, "dir"))
                else {
                    return CommandOutput::failed(255, "Error: argument missing");
                };
                if self
                    .policies
                    .iter()
                    .any(|p| p.src == src && p.dst == dst && p.dir == dir)
                {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists\n");
                }
                let tmpl: &[&str] = args
                    .iter()
                    .position(|a| *a == "tmpl")
                    .map_or(&[], |i| &args[i..]);
                self.policies.push(FakePolicy {
                    src: src.to_string(),
                    dst: dst.to_string(),
                    dir: dir.to_string(),
                    reqid: value(tmpl, "reqid").and_then(parse_number).unwrap_or(0),
                    mode: value(tmpl, "mode").unwrap_or("transport").to_string(),
                    tmpl_src: value(tmpl, "src").unwrap_or_default().to_string(),
                    tmpl_dst: value(tmpl, "dst").unwrap_or_default().to_string(),
                });
                CommandOutput::default()
            }
            Some("delete") | Some("del") => {
                let found = self.policies.iter().position(|p| {
                    Some(p.src.as_str()) == value(args, "src")
                        && Some(p.dst.as_str()) == value(args, "dst")
                        && Some(p.dir.as_str()) == value(args, "dir")
                });
                match found {
                    Some(idx) => {
                        self.policies.remove(idx);
                        CommandOutput::default()
                    }
                    None => CommandOutput::failed(2, "RTNETLINK answers: No such file or directory\n"),
                }
            }
            Some("flush") => {
                self.policies.clear();
                CommandOutput::default()
            }
            None | Some("show") | Some("list") => {
                let mut out = String::new();
                for p in &self.policies {
                    out.push_str(&format!(
                        "src {} dst {} \n\tdir {} priority 0 \n\ttmpl src {} dst {}\n\t\tproto esp reqid {} mode {}\n",
                        p.src, p.dst, p.dir, p.tmpl_src, p.tmpl_dst, p.reqid, p.mode
                    ));
                }
                CommandOutput::ok(out)
            }
            Some(other) => CommandOutput::failed(255, format!("Command \"{other}\" is unknown")),
        }
    }

    // ── tc ──────────────────────────────────────────────────────────

    fn qdisc(&mut self, args: &[&str]) -> CommandOutput {
        let dev = value(args, "dev").unwrap_or("lo").to_string();
        match args.first().copied() {
            Some("del") | Some("delete") => {
                let qdiscs = self.qdiscs.entry(dev.clone()).or_default();
                if qdiscs.is_empty() {
                    return CommandOutput::failed(
                        2,
                        "Error: Cannot delete qdisc with handle of zero.\n",
                    );
                }
                qdiscs.clear();
                self.filters.remove(&dev);
                CommandOutput::default()
            }
            Some("add") => {
                let Some(kind_idx) = args
                    .iter()
                    .position(|a| matches!(*a, "netem" | "prio" | "htb" | "tbf"))
                else {
                    return CommandOutput::failed(1, "Unknown qdisc, see tc help\n");
                };
                let handle = value(args, "handle").unwrap_or("8001:").to_string();
                let parent = value(args, "parent").map(str::to_string);
                let qdiscs = self.qdiscs.entry(dev).or_default();
                if args.contains(&"root") {
                    if qdiscs.iter().any(|q| q.parent.is_none()) {
                        return CommandOutput::failed(
                            2,
                            "Error: Exclusivity flag on, cannot modify.\n",
                        );
                    }
                } else if let Some(parent) = &parent {
                    let major = parent.split(':').next().unwrap_or_default();
                    if !qdiscs
                        .iter()
                        .any(|q| q.handle.trim_end_matches(':') == major)
                    {
                        return CommandOutput::failed(2, "Error: Failed to find specified qdisc.\n");
                    }
                }
                qdiscs.push(FakeQdisc {
                    parent,
                    handle,
                    kind: args[kind_idx].to_string(),
                    params: args[kind_idx + 1..].iter().map(|a| a.to_string()).collect(),
                });
                CommandOutput::default()
            }
            None | Some("show") | Some("list") => {
                let qdiscs = self.qdiscs.get(&dev).map(Vec::as_slice).unwrap_or_default();
                if qdiscs.is_empty() {
                    return CommandOutput::ok("qdisc noqueue 0: root refcnt 2 \n");
                }
                let mut out = String::new();
                for q in qdiscs {
                    let attach = match &q.parent {
                        Some(p) => format!("parent {p}"),
                        None => "root refcnt 2".to_string(),
                    };
                    out.push_str(&format!(
                        "qdisc {} {} {} {}\n",
                        q.kind,
                        q.handle,
                        attach,
                        q.params.join(" ")
                    ));
                }
                CommandOutput::ok(out)
            }
            Some(other) => CommandOutput::failed(255, format!("Command \"{other}\" is unknown")),
        }
    }

    fn filter(&mut self, args: &[&str]) -> CommandOutput {
        let dev = value(args, "dev").unwrap_or("lo").to_string();
        match args.first().copied() {
            Some("add") => {
                let major = value(args, "parent")
                    .and_then(|p| p.split(':').next())
                    .unwrap_or_default();
                let attached = self
                    .qdiscs
                    .get(&dev)
                    .is_some_and(|qs| qs.iter().any(|q| q.handle.trim_end_matches(':') == major));
                if !attached {
                    return CommandOutput::failed(2, "Error: Parent Qdisc doesn't exists.\n");
                }
                let flowid = value(args, "flowid").unwrap_or("1:1");
                let filters = self.filters.entry(dev).or_default();
                let n = filters.len();
                filters.push(format!(
                    "filter parent {major}: protocol ip pref 1 u32 chain 0 fh 800::{:x} order {} key ht 800 bkt 0 flowid {flowid}",
                    0x800 + n,
                    0x800 + n
                ));
                CommandOutput::default()
            }
            Some("del") | Some("delete") => {
                self.filters.remove(&dev);
                CommandOutput::default()
            }
            None | Some("show") | Some("list") => {
                let lines = self.filters.get(&dev).cloned().unwrap_or_default();
                let mut out = lines.join(" \n");
                if !out.is_empty() {
                    out.push_str(" \n");
                }
                CommandOutput::ok(out)
            }
            Some(other) => CommandOutput::failed(255, format!("Command \"{other}\" is unknown")),
        }
    }
}

// ── fio / tcpdump ───────────────────────────────────────────────────

fn flag<'a>(args: &[&'a str], name: &str) -> Option<&'a str> {
    let prefix = format!("--{name}=");
    args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

/// A plausible `fio --output-format=json` report for the given arguments.
pub fn fio_report(args: &[&str]) -> String {
    let job = flag(args, "name").unwrap_or("fake");
    let rw = flag(args, "rw").unwrap_or("randwrite");
    let reads = !matches!(rw, "write" | "randwrite");
    let writes = !matches!(rw, "read" | "randread");
    let direction = |active: bool, bw: u64, iops: f64| {
        if active {
            json!({
                "io_bytes": bw * 1024 * 30,
                "bw": bw,
                "iops": iops,
                "clat_ns": {
                    "percentile": {
                        "50.000000": 250_000,
                        "99.000000": 1_234_000,
                        "99.900000": 2_345_000
                    }
                }
            })
        } else {
            json!({ "io_bytes": 0, "bw": 0, "iops": 0.0, "clat_ns": {} })
        }
    };
    let report = json!({
        "fio version": "fio-3.36",
        "jobs": [{
            "jobname": job,
            "error": 0,
            "read": direction(reads, 81_920, 20_480.0),
            "write": direction(writes, 40_960, 10_240.0)
        }]
    });
    report.to_string()
}

struct FakeProcess {
    deadline: Option<Instant>,
    output: CommandOutput,
    stopped: bool,
    live: Option<Arc<AtomicUsize>>,
}

impl FakeProcess {
    fn settle(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl BackgroundProcess for FakeProcess {
    fn try_finish(&mut self) -> Result<Option<CommandOutput>, ExecError> {
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        if self.stopped || expired {
            self.settle();
            Ok(Some(self.output.clone()))
        } else {
            Ok(None)
        }
    }

    fn interrupt(&mut self) {
        self.stopped = true;
    }

    fn kill(&mut self) {
        self.stopped = true;
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.settle();
    }
}
