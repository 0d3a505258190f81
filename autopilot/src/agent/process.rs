//! Local command-line worker: one child process per invocation.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument, warn};

use super::{AgentError, AgentHandle, ExecOptions, ExecOutput};
use crate::io::process::{CommandError, RunOptions, run_command};

/// Worker reached by spawning `command` in `workdir` with the prompt on stdin.
#[derive(Debug)]
pub struct ProcessAgent {
    name: String,
    command: Vec<String>,
    workdir: PathBuf,
    resume_flag: Option<String>,
    output_limit_bytes: usize,
    released: AtomicBool,
}

impl ProcessAgent {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            workdir: workdir.into(),
            resume_flag: None,
            output_limit_bytes,
            released: AtomicBool::new(false),
        }
    }

    pub fn with_resume_flag(mut self, flag: Option<String>) -> Self {
        self.resume_flag = flag;
        self
    }

    fn build_command(&self, options: &ExecOptions) -> Result<Command, AgentError> {
        let (program, args) = self.command.split_first().ok_or_else(|| AgentError::Spawn {
            worker: self.name.clone(),
            message: "empty command".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        if let (Some(flag), Some(id)) = (&self.resume_flag, &options.resume_id) {
            cmd.arg(flag).arg(id);
        }
        Ok(cmd)
    }
}

impl AgentHandle for ProcessAgent {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(worker = %self.name, timeout_secs = options.timeout.as_secs()))]
    fn execute(&self, prompt: &str, options: &ExecOptions) -> Result<ExecOutput, AgentError> {
        if !self.is_alive() {
            return Err(AgentError::Released {
                worker: self.name.clone(),
            });
        }
        info!(workdir = %self.workdir.display(), "invoking process worker");
        let cmd = self.build_command(options)?;
        let output = run_command(
            cmd,
            &RunOptions {
                stdin: Some(prompt.as_bytes()),
                timeout: options.timeout,
                output_limit_bytes: self.output_limit_bytes,
                stream_path: options.stream_path.clone(),
            },
        )
        .map_err(|err| match err {
            CommandError::Spawn { program, source } => AgentError::Spawn {
                worker: self.name.clone(),
                message: format!("{program}: {source}"),
            },
            CommandError::Io(err) => AgentError::Other(err),
        })?;

        if output.timed_out {
            warn!("process worker timed out");
            return Err(AgentError::Timeout {
                worker: self.name.clone(),
                timeout: options.timeout,
            });
        }
        debug!(exit_code = ?output.status.code(), "process worker finished");
        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
        })
    }

    fn kill(&self) -> anyhow::Result<()> {
        // Invocations are one-shot children; an in-flight one finishes or times out on its own.
        self.released.store(true, Ordering::SeqCst);
        debug!(worker = %self.name, "process worker released");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }
}
