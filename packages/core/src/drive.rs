//! Drive entities and content classification.
//!
//! A [`Drive`] is created the first time its device path shows up in the
//! enumeration and lives for the rest of the process. Its state is the
//! autopilot's belief about the device; every pass reconciles that belief
//! against the kernel.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{ClassifySnafu, Result};
use crate::executor::Invocation;
use crate::paths;

/// What a device contains, as far as the autopilot cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// No recognizable signature; a candidate for formatting.
    Unknown,
    /// A LUKS header.
    Luks,
    /// A filesystem (or anything else we must not overwrite).
    Filesystem,
}

impl DeviceKind {
    /// Interprets the output of `file -bLs`.
    pub fn from_file_output(output: &str) -> Self {
        let output = output.trim();
        if output == "data" {
            DeviceKind::Unknown
        } else if output.starts_with("LUKS encrypted file") {
            DeviceKind::Luks
        } else {
            DeviceKind::Filesystem
        }
    }
}

/// Cached classification of the drive's effective device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Classification {
    /// Must be (re)inspected before use.
    #[default]
    Unclassified,
    Classified(DeviceKind),
}

impl Classification {
    pub fn kind(&self) -> Option<DeviceKind> {
        match self {
            Classification::Unclassified => None,
            Classification::Classified(kind) => Some(*kind),
        }
    }

    /// Forces a fresh inspection, e.g. after the bytes behind the path changed.
    pub fn invalidate(&mut self) {
        *self = Classification::Unclassified;
    }
}

/// Scratch mount bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryMount {
    /// Stable per-drive token; also used as the mapping name.
    pub name: String,
    pub path: PathBuf,
    pub active: bool,
}

/// One managed block device.
#[derive(Debug, Clone)]
pub struct Drive {
    /// Raw device path inside the chroot.
    pub device_path: PathBuf,
    /// Open dm-crypt mapping, if any.
    pub mapped_device_path: Option<PathBuf>,
    pub classification: Classification,
    /// Quarantined; no pipeline stage touches the drive until reinstated.
    pub broken: bool,
    pub temporary_mount: TemporaryMount,
    pub swift_id: Option<String>,
    /// The raw device was blank when first observed, so creating a
    /// filesystem on it cannot destroy data.
    pub started_out_empty: bool,
    first_classified: bool,
}

impl Drive {
    /// Registers a newly discovered device.
    ///
    /// A drive whose quarantine symlink already exists starts out broken.
    pub fn new(device_path: PathBuf, ctx: &Context) -> Self {
        let token = identifying_token(&device_path, ctx);
        let broken = ctx
            .host_path(&paths::quarantine_link(&token))
            .symlink_metadata()
            .is_ok();
        if broken {
            debug!(
                "{} is still quarantined at {}",
                device_path.display(),
                paths::quarantine_link(&token).display()
            );
        }

        Self::with_token(device_path, token, broken)
    }

    pub(crate) fn with_token(device_path: PathBuf, token: String, broken: bool) -> Self {
        Self {
            device_path,
            mapped_device_path: None,
            classification: Classification::Unclassified,
            broken,
            temporary_mount: TemporaryMount {
                path: paths::scratch_mount_path(&token),
                name: token,
                active: false,
            },
            swift_id: None,
            started_out_empty: false,
            first_classified: false,
        }
    }

    /// The identifying token (serial number or fallback).
    pub fn token(&self) -> &str {
        &self.temporary_mount.name
    }

    /// The device that actually carries the filesystem: the mapping when a
    /// LUKS container is open, the raw device otherwise.
    pub fn effective_device(&self) -> &Path {
        self.mapped_device_path
            .as_deref()
            .unwrap_or(&self.device_path)
    }

    /// Inspects the effective device, caching the result until invalidated.
    pub fn classify(&mut self, ctx: &Context) -> Result<DeviceKind> {
        if let Some(kind) = self.classification.kind() {
            return Ok(kind);
        }

        let device = self.effective_device().to_path_buf();
        let output = ctx
            .exec
            .run(Invocation::new("file").arg("-bLs").path_arg(&device))?;
        if !output.success {
            return ClassifySnafu {
                device,
                stderr: output.diagnostic(),
            }
            .fail();
        }

        let kind = DeviceKind::from_file_output(&output.stdout);
        if !self.first_classified {
            self.first_classified = true;
            self.started_out_empty =
                kind == DeviceKind::Unknown && self.mapped_device_path.is_none();
        }
        debug!("{} classified as {kind:?}", device.display());
        self.classification = Classification::Classified(kind);
        Ok(kind)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    #[serde(default)]
    serial: Option<String>,
}

/// Extracts the serial number from `lsblk --json` output.
fn parse_serial(stdout: &str) -> Option<String> {
    let output: LsblkOutput = serde_json::from_str(stdout).ok()?;
    output
        .blockdevices
        .into_iter()
        .next()?
        .serial
        .map(|s| sanitize_token(s.trim()))
        .filter(|s| !s.is_empty())
}

/// Replaces characters that are not safe in mapping and directory names.
fn sanitize_token(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derives a token from the device path alone.
fn fallback_token(device_path: &Path) -> String {
    let digest = Sha256::digest(device_path.as_os_str().as_encoded_bytes());
    hex::encode(&digest[..16])
}

/// Determines the stable token naming the drive's mapping, scratch mount and
/// quarantine symlink: the hardware serial number when available.
pub fn identifying_token(device_path: &Path, ctx: &Context) -> String {
    let serial = ctx
        .exec
        .run(
            Invocation::new("lsblk")
                .arg("--json")
                .arg("--nodeps")
                .arg("--output")
                .arg("SERIAL")
                .path_arg(device_path),
        )
        .ok()
        .filter(|output| output.success)
        .and_then(|output| parse_serial(&output.stdout));

    match serial {
        Some(serial) => serial,
        None => {
            let token = fallback_token(device_path);
            warn!(
                "cannot determine serial number for {}, will use device ID {token} instead",
                device_path.display()
            );
            token
        }
    }
}
