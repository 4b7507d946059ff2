//! Unified error types for the swift-drive-autopilot core library.
//!
//! Built on SNAFU context selectors, so every `std::io::Error` carries the
//! command or path it happened on.
//!
//! Errors fall into the classes the reconciler cares about: fatal errors end
//! the process, everything else is logged and isolated to one drive or one pass.
//! See [`Error::is_fatal`].

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// A command that must not fail returned an unsuccessful exit status.
    #[snafu(display("command '{command}' failed: {stderr}"))]
    CommandExit { command: String, stderr: String },

    /// Configuration file could not be read.
    #[snafu(display("read configuration file {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid YAML for our schema.
    #[snafu(display("parse configuration {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Configuration parsed but is semantically unusable.
    #[snafu(display("invalid configuration: {message}"))]
    ConfigInvalid { message: String },

    /// A drive glob pattern from the configuration is malformed.
    #[snafu(display("invalid drive glob '{pattern}'"))]
    DriveGlob {
        pattern: String,
        source: glob::PatternError,
    },

    /// The kernel lists a crypt mapping whose backing device cannot be found.
    #[snafu(display("cannot find backing device for /dev/mapper/{mapping}"))]
    MappingWithoutBackingDevice { mapping: String },

    /// The content of a device could not be inspected.
    #[snafu(display("exec(file -bLs {}) failed: {stderr}", device.display()))]
    Classify { device: PathBuf, stderr: String },

    /// Formatting was requested while no keys are configured.
    #[snafu(display("refusing to create a LUKS container on {}: no keys specified", device.display()))]
    NoKeysConfigured { device: PathBuf },

    /// None of the configured keys opened the container.
    #[snafu(display(
        "exec(cryptsetup luksOpen {} {mapping}) failed: none of the configured keys was accepted",
        device.display()
    ))]
    KeysRejected { device: PathBuf, mapping: String },

    /// `cryptsetup luksFormat` failed.
    #[snafu(display("exec(cryptsetup luksFormat {}) failed: {stderr}", device.display()))]
    LuksFormat { device: PathBuf, stderr: String },

    /// `cryptsetup close` failed; the mapping is left as-is for a later retry.
    #[snafu(display("exec(cryptsetup close {mapping}) failed: {stderr}"))]
    LuksClose { mapping: String, stderr: String },

    /// Our belief about an open mapping contradicts the kernel.
    #[snafu(display("LUKS container in {} {message}", device.display()))]
    LuksInconsistent { device: PathBuf, message: String },

    /// `mkfs.xfs` failed.
    #[snafu(display("exec(mkfs.xfs {}) failed: {stderr}", device.display()))]
    Mkfs { device: PathBuf, stderr: String },

    /// Device has no recognizable content but was not blank when first seen.
    #[snafu(display(
        "{} contains no filesystem, but was not empty when first observed; refusing to run mkfs.xfs",
        device.display()
    ))]
    RefuseMkfs { device: PathBuf },

    /// Mount operation failed.
    #[snafu(display("mount {} to {} failed: {stderr}", device.display(), target.display()))]
    Mount {
        device: PathBuf,
        target: PathBuf,
        stderr: String,
    },

    /// A mount of the device was found to be read-only.
    #[snafu(display(
        "{} is mounted read-only at {}, which usually indicates a disk fault",
        device.display(),
        mount_path.display()
    ))]
    ReadOnlyMount {
        device: PathBuf,
        mount_path: PathBuf,
    },

    /// Unmount operation failed.
    #[snafu(display("umount {} failed: {stderr}", path.display()))]
    Unmount { path: PathBuf, stderr: String },

    /// Some other device already occupies a final mount point.
    #[snafu(display(
        "cannot mount {} on {}: already occupied by {}",
        device.display(),
        target.display(),
        occupant.display()
    ))]
    MountConflict {
        device: PathBuf,
        target: PathBuf,
        occupant: PathBuf,
    },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The readiness marker could not be touched.
    #[snafu(display("touch {}: {stderr}", path.display()))]
    Touch { path: PathBuf, stderr: String },

    /// Identity marker file could not be read or written.
    #[snafu(display("access swift-id marker at {}", path.display()))]
    SwiftIdMarker {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Two drives claim the same swift-id.
    #[snafu(display("swift-id \"{id}\" is claimed by multiple drives: {devices}"))]
    SwiftIdCollision { id: String, devices: String },

    /// The swift-id pool has no identity left for this drive.
    #[snafu(display("no swift-id left in the pool for {}", device.display()))]
    SwiftIdPoolExhausted { device: PathBuf },

    /// A drive fault that has already been logged and led to quarantine.
    #[snafu(display("{} has been quarantined: {source}", device.display()))]
    Quarantined {
        device: PathBuf,
        source: Box<Error>,
    },

    /// A marker symlink (quarantine or unmount propagation) could not be written.
    #[snafu(display("write marker symlink at {}", path.display()))]
    Marker {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// Returns true when the error means the model of the system can no longer
    /// be trusted and the process has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CommandExit { .. }
                | Error::ConfigRead { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigInvalid { .. }
                | Error::DriveGlob { .. }
                | Error::MappingWithoutBackingDevice { .. }
                | Error::NoKeysConfigured { .. }
        )
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for swift-id marker errors.
    fn swift_id_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for marker symlink errors.
    fn marker_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn swift_id_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(SwiftIdMarkerSnafu { path: path.into() })
    }

    fn marker_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MarkerSnafu { path: path.into() })
    }
}
