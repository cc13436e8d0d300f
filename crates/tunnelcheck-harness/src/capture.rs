//! Best-effort ESP packet capture around a scenario.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tunnelcheck_common::exec::{BackgroundProcess, CommandExecutor, CommandLine};

const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub interface: String,
    pub output: PathBuf,
    /// pcap filter expression.
    pub filter: String,
}

impl CaptureSpec {
    pub fn esp(interface: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            interface: interface.into(),
            output: output.into(),
            filter: "esp".into(),
        }
    }

    pub fn command(&self) -> CommandLine {
        CommandLine::new("tcpdump")
            .args(["-i", self.interface.as_str(), "-w"])
            .arg(self.output.display().to_string())
            .arg(&self.filter)
    }
}

/// A running tcpdump. Failing to start is logged and yields `None`; the
/// scenario goes on without a capture.
pub struct PacketCapture {
    output: PathBuf,
    process: Option<Box<dyn BackgroundProcess>>,
}

impl PacketCapture {
    pub fn start(executor: &Arc<dyn CommandExecutor>, spec: &CaptureSpec) -> Option<Self> {
        match executor.spawn(&spec.command()) {
            Ok(process) => {
                tracing::info!(interface = %spec.interface, output = %spec.output.display(), "capture started");
                Some(Self {
                    output: spec.output.clone(),
                    process: Some(process),
                })
            }
            Err(e) => {
                tracing::warn!(interface = %spec.interface, error = %e, "capture unavailable");
                None
            }
        }
    }

    /// SIGINT so tcpdump flushes the file, then kill after a grace period.
    pub fn stop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        process.interrupt();
        let deadline = Instant::now() + STOP_GRACE;
        loop {
            match process.try_finish() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(None) | Err(_) => {
                    process.kill();
                    break;
                }
            }
        }
        tracing::info!(output = %self.output.display(), "capture stopped");
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
