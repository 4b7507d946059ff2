//! Everything a component needs to act on the system.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::executor::{CommandRunner, ExecutionContext};

/// Read-only configuration plus the command execution context.
///
/// Passed explicitly into every operation; there is no global state.
pub struct Context {
    pub config: Config,
    pub exec: ExecutionContext,
}

impl Context {
    /// Creates a context that runs real commands inside the configured chroot.
    pub fn new(config: Config) -> Self {
        let exec = ExecutionContext::new(config.chroot());
        Self { config, exec }
    }

    /// Creates a context with a custom command runner.
    pub fn with_runner(config: Config, runner: Box<dyn CommandRunner>) -> Self {
        let exec = ExecutionContext::with_runner(config.chroot(), runner);
        Self { config, exec }
    }

    /// See [`Config::host_path`].
    pub fn host_path(&self, path: &Path) -> PathBuf {
        self.config.host_path(path)
    }
}
