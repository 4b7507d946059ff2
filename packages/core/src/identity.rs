//! Swift-id assignment.
//!
//! Every drive carries its identity in a `swift-id` file in the root of its
//! filesystem. Drives without one receive the first free entry of the
//! configured pool.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::context::Context;
use crate::drive::Drive;
use crate::error::{Error, IoResultExt, Result};
use crate::mount::Placement;
use crate::paths;

/// Outcome of one identity scan.
#[derive(Debug, Default)]
pub struct IdentityScan {
    /// swift-id -> raw device path, only for identities without collision.
    pub assignments: BTreeMap<String, PathBuf>,
    /// Something went wrong for at least one drive (already logged).
    pub failed: bool,
}

/// Reads or assigns the swift-id of every drive in `candidates`.
///
/// Candidates are expected in device-path order; that order decides which
/// drive receives which pool entry. Problems are logged and reported through
/// [`IdentityScan::failed`]; they never stop the scan.
pub fn scan_swift_ids(ctx: &Context, candidates: &[(&Drive, &Placement)]) -> IdentityScan {
    let mut scan = IdentityScan::default();
    let mut claims: BTreeMap<String, Vec<&Drive>> = BTreeMap::new();
    let mut unassigned: Vec<(&Drive, &Path)> = Vec::new();

    for &(drive, placement) in candidates {
        match placement {
            Placement::Final { swift_id } => {
                claims.entry(swift_id.clone()).or_default().push(drive);
            }
            Placement::Scratch { path, .. } => match read_swift_id(ctx, path) {
                Ok(Some(swift_id)) => claims.entry(swift_id).or_default().push(drive),
                Ok(None) => unassigned.push((drive, path.as_path())),
                Err(err) => {
                    error!("{err}");
                    scan.failed = true;
                }
            },
        }
    }

    for (swift_id, claimants) in &claims {
        if let [drive] = claimants.as_slice() {
            scan.assignments
                .insert(swift_id.clone(), drive.device_path.clone());
            continue;
        }
        let devices = claimants
            .iter()
            .map(|d| d.effective_device().display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        error!(
            "{}",
            Error::SwiftIdCollision {
                id: swift_id.clone(),
                devices,
            }
        );
        scan.failed = true;
    }

    let mut taken: BTreeSet<&str> = claims.keys().map(String::as_str).collect();
    for (drive, mount_path) in unassigned {
        let device = drive.effective_device();
        let Some(swift_id) = ctx
            .config
            .swift_id_pool
            .iter()
            .find(|id| !taken.contains(id.as_str()))
        else {
            error!(
                "{}",
                Error::SwiftIdPoolExhausted {
                    device: device.to_path_buf(),
                }
            );
            scan.failed = true;
            continue;
        };

        if let Err(err) = write_swift_id(ctx, mount_path, swift_id) {
            error!("{err}");
            scan.failed = true;
            continue;
        }
        info!("assigned swift-id \"{swift_id}\" to {}", device.display());
        taken.insert(swift_id.as_str());
        scan.assignments
            .insert(swift_id.clone(), drive.device_path.clone());
    }

    scan
}

fn marker_path(ctx: &Context, mount_path: &Path) -> PathBuf {
    ctx.host_path(&mount_path.join(paths::SWIFT_ID_FILE))
}

fn read_swift_id(ctx: &Context, mount_path: &Path) -> Result<Option<String>> {
    let path = marker_path(ctx, mount_path);
    match fs::read_to_string(&path) {
        Ok(content) => {
            let swift_id = content.trim();
            Ok((!swift_id.is_empty()).then(|| swift_id.to_string()))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).swift_id_context(path),
    }
}

fn write_swift_id(ctx: &Context, mount_path: &Path, swift_id: &str) -> Result<()> {
    let path = marker_path(ctx, mount_path);
    fs::write(&path, format!("{swift_id}\n")).swift_id_context(path)
}
