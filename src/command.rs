//! External command execution
//!
//! The volume backend and the settle gate never spawn processes directly;
//! they go through [`CommandRunner`] so tests can substitute a scripted fake.

use std::process::Command;
use std::sync::Arc;

use crate::error::{ProvisionError, ProvisionResult};

/// Result of running an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// True when the exit code is zero
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, as a shell would show them
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text.trim_end().to_string()
    }
}

/// Capability to run external commands
pub trait CommandRunner {
    /// Run `program` with `args`, capturing output.
    ///
    /// Fails only when the process cannot be started; a non-zero exit is
    /// reported through [`CommandOutput::code`].
    fn run(&self, program: &str, args: &[String]) -> ProvisionResult<CommandOutput>;

    /// Run and turn a non-zero exit into [`ProvisionError::CommandFailed`]
    fn run_checked(&self, program: &str, args: &[String]) -> ProvisionResult<CommandOutput> {
        let command = render(program, args);
        log::info!("{}", command);

        let output = self.run(program, args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(ProvisionError::CommandFailed {
                command,
                code: output.code,
                output: output.combined(),
            })
        }
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(&self, program: &str, args: &[String]) -> ProvisionResult<CommandOutput> {
        (**self).run(program, args)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[String]) -> ProvisionResult<CommandOutput> {
        (**self).run(program, args)
    }
}

/// Runner that spawns real processes on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> ProvisionResult<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ProvisionError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Command line as it would be typed, for logs and error messages
pub fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
