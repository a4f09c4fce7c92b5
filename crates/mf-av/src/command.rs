//! External tool invocation.
//!
//! [`ToolCommand`] covers the two ways mediaforge runs a tool: ffprobe is
//! run to completion with its output captured ([`ToolCommand::execute`]),
//! ffmpeg is spawned with stderr piped so progress can be read while it runs
//! ([`ToolCommand::spawn_with_stderr`]).

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured result of a finished run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Upper bound on the run. [`execute`](Self::execute) enforces it;
    /// streamed runs read it back with [`get_timeout`](Self::get_timeout).
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// `ffmpeg` for `/usr/bin/ffmpeg`; used as the tool name in errors.
    pub fn program_name(&self) -> String {
        match self.program.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.program.to_string_lossy().into_owned(),
        }
    }

    fn command(&self, stdout: Stdio) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> mf_core::Error {
        mf_core::Error::tool(self.program_name(), format!("failed to spawn: {e}"))
    }

    /// Run to completion and capture both streams.
    ///
    /// A non-zero exit, a timeout or a spawn failure is a
    /// [`mf_core::Error::Tool`]; the exit error carries trimmed stderr.
    pub async fn execute(&self) -> mf_core::Result<ToolOutput> {
        let child = self
            .command(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Dropping the wait future on timeout kills the child (kill_on_drop).
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                mf_core::Error::tool(
                    self.program_name(),
                    format!("timed out after {:?}", self.timeout),
                )
            })?
            .map_err(|e| {
                mf_core::Error::tool(self.program_name(), format!("wait failed: {e}"))
            })?;

        let result = ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.status.success() {
            return Err(mf_core::Error::tool(
                self.program_name(),
                format!("exited with status {}: {}", result.status, result.stderr.trim()),
            ));
        }
        Ok(result)
    }

    /// Spawn with stdout discarded and stderr piped. The caller owns the
    /// child and its timeout.
    pub fn spawn_with_stderr(&self) -> mf_core::Result<Child> {
        self.command(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))
    }
}
