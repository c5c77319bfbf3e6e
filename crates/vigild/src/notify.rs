//! Outbound alert notifications.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("no alert destination configured")]
    NoDestination,
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
    #[error("notification failed: {0}")]
    Failed(String),
    #[error("notification command: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivers one alert message. Called from a blocking thread, so
/// implementations may block.
pub trait NotificationSink: Send + Sync {
    fn send_alert(&self, destination: &str, message: &str) -> Result<(), NotificationError>;
}

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn send_alert(&self, destination: &str, message: &str) -> Result<(), NotificationError> {
        tracing::warn!(destination, message, "ALERT");
        Ok(())
    }
}

/// Default limit on one alert command run.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `program [args..] <destination> <message>` per alert. A non-zero
/// exit status is a failed delivery. A command still running after the
/// timeout is killed and reaped.
#[derive(Debug, Clone)]
pub struct CommandSink {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSink {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Split a whitespace-separated command line into program and args.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl CommandSink {
    fn wait_with_deadline(&self, child: &mut Child) -> Result<ExitStatus, NotificationError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    tracing::warn!(program = %self.program, error = %e, "failed to kill alert command");
                }
                let _ = child.wait();
                tracing::warn!(program = %self.program, timeout = ?self.timeout, "alert command killed");
                return Err(NotificationError::Timeout(self.timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl NotificationSink for CommandSink {
    fn send_alert(&self, destination: &str, message: &str) -> Result<(), NotificationError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(destination)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let status = self.wait_with_deadline(&mut child)?;
        if status.success() {
            tracing::debug!(program = %self.program, destination, "alert command succeeded");
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        Err(NotificationError::Failed(format!(
            "{} exited with {}: {}",
            self.program,
            status,
            stderr.trim()
        )))
    }
}
