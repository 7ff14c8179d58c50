//! Running external build and version-control tools.
//!
//! The [`ToolRunner`] trait decouples the kernel pipeline and image
//! preparation from real subprocesses. Tests use a recording runner that
//! returns scripted outcomes without spawning anything.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::{ProvisionError, Result};

/// A fully described tool run: program, arguments, working directory and
/// extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Kill the tool after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the matching `std::process::Command` (stdio left at defaults).
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Abstraction over running a tool to completion.
pub trait ToolRunner {
    /// Run the tool. A non-zero exit must surface as
    /// [`ProvisionError::ExternalTool`].
    fn run(&self, invocation: &ToolInvocation) -> Result<()>;
}

/// Runner that spawns real processes with inherited stdio so build output
/// streams straight to the operator's terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    #[instrument(skip_all, fields(program = %invocation.program))]
    fn run(&self, invocation: &ToolInvocation) -> Result<()> {
        info!(command = %invocation, cwd = ?invocation.cwd, "running tool");
        let mut cmd = invocation.to_command();
        cmd.stdin(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(source) => {
                error!(err = %source, "failed to spawn tool");
                return Err(ProvisionError::Spawn {
                    program: invocation.program.clone(),
                    source,
                });
            }
        };

        let status = match invocation.timeout {
            None => child.wait()?,
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => status,
                None => {
                    warn!(timeout_secs = timeout.as_secs(), "tool timed out, killing");
                    child.kill()?;
                    child.wait()?;
                    return Err(ProvisionError::ExternalTool {
                        command: invocation.to_string(),
                        status: format!("timed out after {timeout:?}"),
                    });
                }
            },
        };

        debug!(exit_code = ?status.code(), "tool finished");
        if !status.success() {
            return Err(ProvisionError::ExternalTool {
                command: invocation.to_string(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}
