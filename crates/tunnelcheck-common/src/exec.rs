//! Host command execution.
//!
//! Every interaction with the host (`ip xfrm`, `tc`, `fio`, `tcpdump`) goes
//! through a [`CommandExecutor`], so real, dry-run, namespaced and
//! fault-injecting execution can be swapped without touching call sites.

use std::fmt;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::error::ExecError;

// ── Command line ────────────────────────────────────────────────────

/// A program plus its arguments. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// The same command, run inside network namespace `ns`.
    pub fn in_netns(&self, ns: &str) -> CommandLine {
        CommandLine::new("ip")
            .args(["netns", "exec", ns])
            .arg(self.program.clone())
            .args(self.args.iter().cloned())
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || "()'\"".contains(c)) {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

// ── Output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into [`ExecError::Failed`].
    pub fn into_result(self, cmd: &CommandLine) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::Failed {
                command: cmd.to_string(),
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

// ── Traits ──────────────────────────────────────────────────────────

/// A process started with [`CommandExecutor::spawn`].
pub trait BackgroundProcess: Send {
    /// Non-blocking. Returns the final output once the process has exited;
    /// repeated calls after exit keep returning it.
    fn try_finish(&mut self) -> Result<Option<CommandOutput>, ExecError>;

    /// Ask the process to stop (SIGINT), letting it flush its output.
    fn interrupt(&mut self);

    /// Stop the process unconditionally.
    fn kill(&mut self);
}

pub trait CommandExecutor: Send + Sync {
    /// Run to completion. `Err` only when the command could not be executed;
    /// a non-zero exit comes back as a [`CommandOutput`].
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError>;

    /// Start a long-running command without waiting for it.
    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn BackgroundProcess>, ExecError>;

    /// Whether commands are only logged. Callers that read host state
    /// consult their own records instead.
    fn is_dry_run(&self) -> bool {
        false
    }

    /// Like [`run`](Self::run) but a non-zero exit is an error.
    fn run_checked(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        self.run(cmd)?.into_result(cmd)
    }
}

// ── Real execution ──────────────────────────────────────────────────

/// Executes commands on the local host.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealExecutor;

impl CommandExecutor for RealExecutor {
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        tracing::debug!(command = %cmd, "exec");
        let output = Command::new(cmd.program())
            .args(cmd.argv())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ExecError::Spawn {
                program: cmd.program().to_string(),
                reason: e.to_string(),
            })?;
        let out = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !out.success() {
            tracing::debug!(command = %cmd, status = out.status, stderr = %out.stderr.trim(), "non-zero exit");
        }
        Ok(out)
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn BackgroundProcess>, ExecError> {
        tracing::debug!(command = %cmd, "spawn");
        let mut child = Command::new(cmd.program())
            .args(cmd.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::Spawn {
                program: cmd.program().to_string(),
                reason: e.to_string(),
            })?;

        // Pipes are drained continuously so a chatty child never blocks on a
        // full pipe buffer.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        Ok(Box::new(ChildProcess {
            command: cmd.to_string(),
            child,
            stdout,
            stderr,
            finished: None,
        }))
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

struct ChildProcess {
    command: String,
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
    finished: Option<CommandOutput>,
}

impl ChildProcess {
    fn collect(&mut self, status: i32) -> CommandOutput {
        let join = |h: Option<JoinHandle<String>>| h.and_then(|h| h.join().ok()).unwrap_or_default();
        CommandOutput {
            status,
            stdout: join(self.stdout.take()),
            stderr: join(self.stderr.take()),
        }
    }
}

impl BackgroundProcess for ChildProcess {
    fn try_finish(&mut self) -> Result<Option<CommandOutput>, ExecError> {
        if let Some(out) = &self.finished {
            return Ok(Some(out.clone()));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let out = self.collect(status.code().unwrap_or(-1));
                self.finished = Some(out.clone());
                Ok(Some(out))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ExecError::Wait {
                command: self.command.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn interrupt(&mut self) {
        if self.finished.is_some() {
            return;
        }
        #[cfg(unix)]
        {
            // SAFETY: sending a signal to a child PID we own. A stale PID is
            // impossible while `self.child` has not been reaped.
            unsafe {
                libc::kill(self.child.id() as libc::pid_t, libc::SIGINT);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }

    fn kill(&mut self) {
        if self.finished.is_none() {
            let _ = self.child.kill();
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.finished.is_none() {
            if let Ok(None) = self.child.try_wait() {
                tracing::warn!(command = %self.command, "killing abandoned background process");
                let _ = self.child.kill();
            }
            let _ = self.child.wait();
        }
    }
}

/// A background process that has already exited with a known output.
#[derive(Debug, Clone)]
pub struct CompletedProcess {
    output: CommandOutput,
}

impl CompletedProcess {
    pub fn new(output: CommandOutput) -> Self {
        Self { output }
    }
}

impl BackgroundProcess for CompletedProcess {
    fn try_finish(&mut self) -> Result<Option<CommandOutput>, ExecError> {
        Ok(Some(self.output.clone()))
    }

    fn interrupt(&mut self) {}

    fn kill(&mut self) {}
}

// ── Dry run ─────────────────────────────────────────────────────────

/// Logs each command instead of executing it and reports success with
/// empty output.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    history: Mutex<Vec<CommandLine>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<CommandLine> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, cmd: &CommandLine) {
        tracing::info!("[DRY] {cmd}");
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cmd.clone());
    }
}

impl CommandExecutor for DryRunExecutor {
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        self.record(cmd);
        Ok(CommandOutput::default())
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn BackgroundProcess>, ExecError> {
        self.record(cmd);
        Ok(Box::new(CompletedProcess::new(CommandOutput::default())))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

// ── Namespaces ──────────────────────────────────────────────────────

/// Runs every command inside a named network namespace via `ip netns exec`.
pub struct NamespacedExecutor {
    inner: Arc<dyn CommandExecutor>,
    netns: String,
}

impl NamespacedExecutor {
    pub fn new(inner: Arc<dyn CommandExecutor>, netns: impl Into<String>) -> Self {
        Self {
            inner,
            netns: netns.into(),
        }
    }

    pub fn netns(&self) -> &str {
        &self.netns
    }
}

impl CommandExecutor for NamespacedExecutor {
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ExecError> {
        self.inner.run(&cmd.in_netns(&self.netns))
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn BackgroundProcess>, ExecError> {
        self.inner.spawn(&cmd.in_netns(&self.netns))
    }

    fn is_dry_run(&self) -> bool {
        self.inner.is_dry_run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_algorithm_names() {
        let cmd = CommandLine::new("ip")
            .args(["xfrm", "state", "add", "aead"])
            .arg("rfc4106(gcm(aes))");
        assert_eq!(cmd.to_string(), "ip xfrm state add aead 'rfc4106(gcm(aes))'");
    }

    #[test]
    fn dry_run_records_and_succeeds() {
        let exec = DryRunExecutor::new();
        let cmd = CommandLine::new("tc").args(["qdisc", "show", "dev", "eth0"]);
        let out = exec.run_checked(&cmd).unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
        assert_eq!(exec.history(), vec![cmd]);
        assert!(exec.is_dry_run());
    }

    #[test]
    fn namespaced_executor_prefixes_netns() {
        let dry = Arc::new(DryRunExecutor::new());
        let ns = NamespacedExecutor::new(dry.clone(), "tc_left");
        ns.run(&CommandLine::new("ip").args(["xfrm", "state", "flush"]))
            .unwrap();
        assert_eq!(
            dry.history()[0].to_string(),
            "ip netns exec tc_left ip xfrm state flush"
        );
        assert!(ns.is_dry_run());
    }

    #[test]
    fn run_checked_maps_nonzero_exit() {
        let cmd = CommandLine::new("false");
        let err = CommandOutput::failed(1, "boom").into_result(&cmd).unwrap_err();
        assert!(matches!(err, ExecError::Failed { status: 1, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn real_executor_captures_output() {
        let out = RealExecutor
            .run(&CommandLine::new("sh").args(["-c", "echo hi; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn real_spawn_interrupt_stops_process() {
        let mut proc = RealExecutor
            .spawn(&CommandLine::new("sleep").arg("30"))
            .unwrap();
        assert!(proc.try_finish().unwrap().is_none());
        proc.interrupt();
        let mut done = None;
        for _ in 0..100 {
            if let Some(out) = proc.try_finish().unwrap() {
                done = Some(out);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(done.is_some(), "sleep should exit on SIGINT");
    }
}
