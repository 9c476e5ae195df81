//! Shell command step.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::step::WorkflowStep;
use crate::domain::{MessageLevel, StepContext};
use crate::{Error, Result};

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Runs a shell command and streams its output into the step log.
pub struct CommandStep {
    name: String,
    command: String,
    timeout: Option<Duration>,
    /// Added to the job counters when the command succeeds.
    counters: BTreeMap<String, i64>,
}

impl CommandStep {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: None,
            counters: BTreeMap::new(),
        }
    }

    /// Kill the command after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_counter(mut self, name: impl Into<String>, delta: i64) -> Self {
        self.counters.insert(name.into(), delta);
        self
    }

    /// Job variables exported to the command environment.
    ///
    /// Values never become part of the command text; `sh` expands `${name}`
    /// from the environment. Names that are not shell identifiers are skipped.
    fn environment(vars: BTreeMap<String, String>) -> Vec<(String, String)> {
        vars.into_iter()
            .filter(|(name, _)| is_shell_identifier(name))
            .collect()
    }

    fn forward_lines<R>(reader: R, level: MessageLevel, tx: mpsc::UnboundedSender<(MessageLevel, String)>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((level, line)).is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl WorkflowStep for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let command = self.command.as_str();
        debug!(job_id = %ctx.job_id(), step = %self.name, command = %command, "Executing command");
        ctx.info(format!("Running: {command}"));

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command])
            .envs(Self::environment(ctx.variables()))
            .current_dir(ctx.workspace().local)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to spawn command: {e}")))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            Self::forward_lines(stdout, MessageLevel::Info, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::forward_lines(stderr, MessageLevel::Warn, tx.clone());
        }
        drop(tx);

        let outcome = {
            let wait = child.wait();
            tokio::pin!(wait);
            let deadline = tokio::time::sleep(self.timeout.unwrap_or_default());
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    Some((level, line)) = rx.recv() => ctx.log(level, line),
                    status = &mut wait => break Outcome::Exited(status),
                    _ = ctx.cancellation_token().cancelled() => break Outcome::Cancelled,
                    _ = &mut deadline, if self.timeout.is_some() => break Outcome::TimedOut,
                }
            }
        };

        match outcome {
            Outcome::Exited(status) => {
                let status =
                    status.map_err(|e| Error::Other(format!("Failed to wait for command: {e}")))?;
                while let Some((level, line)) = rx.recv().await {
                    ctx.log(level, line);
                }

                if !status.success() {
                    let code = status.code().unwrap_or(-1);
                    warn!(job_id = %ctx.job_id(), step = %self.name, code, "Command failed");
                    ctx.error(format!("Command failed with exit code: {code}"));
                    return Ok(false);
                }

                for (name, delta) in &self.counters {
                    ctx.increment_counter(name, *delta);
                }
                Ok(true)
            }
            Outcome::Cancelled => {
                let _ = child.kill().await;
                ctx.warn("Command cancelled.");
                Ok(false)
            }
            Outcome::TimedOut => {
                let _ = child.kill().await;
                let secs = self.timeout.unwrap_or_default().as_secs();
                Err(Error::Other(format!("Command timed out after {secs}s")))
            }
        }
    }
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
