/// Local helper processes (the prober shells out to `ping`)
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Exit status and trimmed stderr of a finished process
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub stderr: String,
}

pub struct CommandBuilder {
    command: Command,
    context_msg: Option<String>,
    deadline: Option<Duration>,
}

impl CommandBuilder {
    /// Stdout is discarded; the child is killed if the future is dropped
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut command = Command::new(program);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Self {
            command,
            context_msg: None,
            deadline: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// Kill the process and fail if it runs longer than `deadline`
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn output(mut self) -> Result<CommandOutput> {
        let ctx = self
            .context_msg
            .take()
            .unwrap_or_else(|| "Failed to run command".to_string());
        let run = self.command.output();
        let output = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, run)
                .await
                .with_context(|| format!("{ctx}: no exit after {}s", deadline.as_secs()))?,
            None => run.await,
        }
        .context(ctx)?;

        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
