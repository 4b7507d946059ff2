//! Command execution abstraction.
//!
//! Every interaction with the operating system (cryptsetup, mount, mkfs, ...)
//! goes through an [`ExecutionContext`]. The context wraps commands with
//! `chroot` when the configuration names a chroot, pipes secrets over stdin,
//! and keeps secrets out of the log. The actual process spawning sits behind
//! the [`CommandRunner`] trait so the reconciler can be driven by a simulated
//! system in tests.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

/// Description of one command invocation.
#[derive(Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    chroot: bool,
    skip_log: bool,
    exit_on_error: bool,
}

impl Invocation {
    /// Creates an invocation that runs inside the configured chroot.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            chroot: true,
            skip_log: false,
            exit_on_error: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    /// Pipes `content` into the command's standard input.
    pub fn stdin(mut self, content: impl Into<String>) -> Self {
        self.stdin = Some(content.into());
        self
    }

    /// Runs the command on the host instead of inside the chroot.
    pub fn without_chroot(mut self) -> Self {
        self.chroot = false;
        self
    }

    /// Suppresses logging of the arguments and stdin.
    pub fn skip_log(mut self) -> Self {
        self.skip_log = true;
        self
    }

    /// Turns an unsuccessful exit status into a fatal error.
    pub fn exit_on_error(mut self) -> Self {
        self.exit_on_error = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn input(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn is_chrooted(&self) -> bool {
        self.chroot
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skip_log {
            return write!(f, "{} <arguments hidden>", self.program);
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print stdin, it may carry a passphrase
        write!(f, "Invocation({self})")
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    /// Best human-readable explanation of a failure.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Spawns processes for an [`ExecutionContext`].
pub trait CommandRunner {
    /// Runs the invocation, inside `chroot` when given.
    ///
    /// An `Err` means the process could not be run at all; a non-zero exit
    /// status is reported through [`CommandOutput::success`].
    fn run(&self, invocation: &Invocation, chroot: Option<&Path>) -> Result<CommandOutput>;
}

/// Runner that executes real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation, chroot: Option<&Path>) -> Result<CommandOutput> {
        let mut command = match chroot {
            Some(root) => {
                let mut wrapper = Command::new("chroot");
                wrapper.arg(root).arg(invocation.program());
                wrapper
            }
            None => Command::new(invocation.program()),
        };
        command
            .args(invocation.args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if invocation.input().is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn().command_context(invocation.program())?;

        let mut written = Ok(());
        if let Some(input) = invocation.input()
            && let Some(mut stdin) = child.stdin.take()
        {
            written = stdin.write_all(input.as_bytes());
            // dropping stdin closes the pipe so the child sees EOF
        }

        // reap the child even if it stopped reading its input
        let output = child
            .wait_with_output()
            .command_context(invocation.program())?;
        written.command_context(invocation.program())?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }
}

/// Execution context for running system commands.
pub struct ExecutionContext {
    chroot: Option<PathBuf>,
    runner: Box<dyn CommandRunner>,
}

impl ExecutionContext {
    /// Creates a context executing real processes.
    pub fn new(chroot: &Path) -> Self {
        Self::with_runner(chroot, Box::new(SystemRunner))
    }

    /// Creates a context with a custom runner.
    pub fn with_runner(chroot: &Path, runner: Box<dyn CommandRunner>) -> Self {
        let chroot = (chroot != Path::new("/")).then(|| chroot.to_path_buf());
        Self { chroot, runner }
    }

    /// Runs a command and captures its output.
    pub fn run(&self, invocation: Invocation) -> Result<CommandOutput> {
        debug!("exec({invocation})");

        let chroot = if invocation.is_chrooted() {
            self.chroot.as_deref()
        } else {
            None
        };
        let output = self.runner.run(&invocation, chroot)?;

        if !output.success {
            let diagnostic = if invocation.skip_log {
                "<output hidden>".to_string()
            } else {
                output.diagnostic()
            };
            if invocation.exit_on_error {
                return Err(Error::CommandExit {
                    command: invocation.to_string(),
                    stderr: diagnostic,
                });
            }
            debug!("exec({invocation}) failed: {diagnostic}");
        }

        Ok(output)
    }
}
