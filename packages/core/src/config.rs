//! Configuration file model.
//!
//! The configuration is loaded once at startup and then shared read-only with
//! every component. Nothing in the core looks it up globally.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt, ensure};

use crate::error::{
    ConfigInvalidSnafu, ConfigParseSnafu, ConfigReadSnafu, DriveGlobSnafu, Result,
};

/// Parsed content of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Root directory of the host system; all commands run chrooted into it.
    #[serde(rename = "chroot", default)]
    pub chroot_path: Option<PathBuf>,
    /// Glob patterns (inside the chroot) matching the raw drives to manage.
    #[serde(rename = "drives")]
    pub drive_globs: Vec<String>,
    /// Candidate passphrases, in order of precedence.
    #[serde(default)]
    pub keys: Vec<Key>,
    /// Identities that may be handed out to drives without a swift-id marker.
    #[serde(default)]
    pub swift_id_pool: Vec<String>,
    /// Polling and tick intervals for the event source.
    #[serde(default)]
    pub intervals: Intervals,
}

/// One passphrase for LUKS containers.
#[derive(Clone, Deserialize)]
pub struct Key {
    pub secret: String,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key").field("secret", &"<redacted>").finish()
    }
}

/// Event source intervals, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Intervals {
    pub consistency_check: u64,
    pub device_scan: u64,
    pub quarantine_scan: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            consistency_check: 30,
            device_scan: 5,
            quarantine_scan: 5,
        }
    }
}

impl Intervals {
    pub fn consistency_check(&self) -> Duration {
        Duration::from_secs(self.consistency_check)
    }

    pub fn device_scan(&self) -> Duration {
        Duration::from_secs(self.device_scan)
    }

    pub fn quarantine_scan(&self) -> Duration {
        Duration::from_secs(self.quarantine_scan)
    }
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        let config: Config = serde_yaml::from_str(&content).context(ConfigParseSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.drive_globs.is_empty(),
            ConfigInvalidSnafu {
                message: "no drive globs configured (key \"drives\")",
            }
        );
        for pattern in &self.drive_globs {
            glob::Pattern::new(pattern).context(DriveGlobSnafu { pattern })?;
        }
        ensure!(
            self.keys.iter().all(|k| !k.secret.is_empty()),
            ConfigInvalidSnafu {
                message: "keys must not have an empty secret",
            }
        );

        let mut seen = BTreeSet::new();
        for id in &self.swift_id_pool {
            ensure!(
                !id.is_empty() && !id.contains('/'),
                ConfigInvalidSnafu {
                    message: format!("swift-id-pool entry \"{id}\" is not a valid directory name"),
                }
            );
            ensure!(
                seen.insert(id.as_str()),
                ConfigInvalidSnafu {
                    message: format!("swift-id-pool contains \"{id}\" more than once"),
                }
            );
        }

        let Intervals {
            consistency_check,
            device_scan,
            quarantine_scan,
        } = self.intervals;
        ensure!(
            consistency_check > 0 && device_scan > 0 && quarantine_scan > 0,
            ConfigInvalidSnafu {
                message: "intervals must be at least one second",
            }
        );
        Ok(())
    }

    /// Root directory the commands are chrooted into ("/" when unset).
    pub fn chroot(&self) -> &Path {
        self.chroot_path.as_deref().unwrap_or(Path::new("/"))
    }

    /// Translates an absolute path inside the chroot to the host path.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.chroot().join(relative)
    }
}
