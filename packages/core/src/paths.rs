//! Canonical locations inside the chroot.
//!
//! These make up the fixed target layout the object-storage service expects.

use std::path::PathBuf;

/// Root of all scratch mounts and bookkeeping.
pub const STORAGE_ROOT: &str = "/run/swift-storage";

/// Directory holding the final mounts, one per swift-id.
pub const FINAL_MOUNT_ROOT: &str = "/srv/node";

/// Touched after every pass to signal that `/srv/node` is usable.
pub const READY_MARKER: &str = "/srv/node/ready";

/// Name of the identity marker file in a drive's mount root.
pub const SWIFT_ID_FILE: &str = "swift-id";

/// Directory of the dm-crypt device nodes.
pub const MAPPER_DIR: &str = "/dev/mapper";

/// Scratch mount location of the drive with the given token.
pub fn scratch_mount_path(token: &str) -> PathBuf {
    PathBuf::from(STORAGE_ROOT).join(token)
}

/// Directory containing one symlink per quarantined drive.
pub fn quarantine_dir() -> PathBuf {
    PathBuf::from(STORAGE_ROOT).join("broken")
}

/// Quarantine symlink of the drive with the given token.
pub fn quarantine_link(token: &str) -> PathBuf {
    quarantine_dir().join(token)
}

/// Symlink recording which device last held `swift_id`.
pub fn propagation_marker(swift_id: &str) -> PathBuf {
    PathBuf::from(STORAGE_ROOT)
        .join("state/unmount-propagation")
        .join(swift_id)
}

/// Final mount location for `swift_id`.
pub fn final_mount_path(swift_id: &str) -> PathBuf {
    PathBuf::from(FINAL_MOUNT_ROOT).join(swift_id)
}

/// Device node of an open mapping.
pub fn mapper_path(mapping: &str) -> PathBuf {
    PathBuf::from(MAPPER_DIR).join(mapping)
}
