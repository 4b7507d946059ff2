//! Drive registry and reconciliation pass.
//!
//! One pass walks every known drive through the pipeline
//!
//! ```text
//! check LUKS -> format LUKS -> open LUKS -> scratch mount -> swift-id -> final mount
//! ```
//!
//! A fault on one drive is logged and isolated to that drive; only fatal
//! errors (see [`Error::is_fatal`]) end the pass early.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::context::Context;
use crate::drive::Drive;
use crate::error::{Error, IoResultExt, Result};
use crate::events::{Event, enumerate_drives};
use crate::executor::Invocation;
use crate::identity::scan_swift_ids;
use crate::luks::scan_luks_mappings;
use crate::mount::{MountOutcome, Placement};
use crate::mounts::MountTable;
use crate::paths;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// At least one error was logged during the pass.
    pub failed: bool,
}

/// Owns every drive seen since startup.
pub struct Reconciler {
    ctx: Context,
    drives: BTreeMap<PathBuf, Drive>,
}

impl Reconciler {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            drives: BTreeMap::new(),
        }
    }

    pub fn drive(&self, device_path: &Path) -> Option<&Drive> {
        self.drives.get(device_path)
    }

    pub fn drives(&self) -> impl Iterator<Item = &Drive> {
        self.drives.values()
    }

    /// Handles one event with exactly one reconciliation pass.
    pub fn handle(&mut self, event: &Event) -> Result<PassReport> {
        info!("event received: {event}");
        if let Event::DriveReinstated(device_path) = event {
            match self.drives.get_mut(device_path) {
                Some(drive) => drive.reinstate(),
                None => debug!("{} is not a known drive", device_path.display()),
            }
        }
        self.run_pass()
    }

    /// Runs one full pass over all drives.
    ///
    /// Returns `Err` only for fatal errors; everything else is logged and
    /// reflected in [`PassReport::failed`].
    pub fn run_pass(&mut self) -> Result<PassReport> {
        let ctx = &self.ctx;
        let mut failed = false;

        let device_paths = enumerate_drives(&ctx.config)?;
        for path in &device_paths {
            if !self.drives.contains_key(path) {
                debug!("registering {}", path.display());
                self.drives.insert(path.clone(), Drive::new(path.clone(), ctx));
            }
        }

        let active_mappings = scan_luks_mappings(ctx)?;
        let mut mounts = MountTable::scan(ctx)?;

        let mut placements = BTreeMap::new();
        let mut scratch_changed = false;
        for path in &device_paths {
            let Some(drive) = self.drives.get_mut(path) else {
                continue;
            };
            if drive.broken {
                continue;
            }

            if !settle(&mut failed, drive.check_luks(ctx, &active_mappings))? {
                continue;
            }
            if !ctx.config.keys.is_empty()
                && !settle(&mut failed, drive.format_luks_if_required(ctx))?
            {
                continue;
            }
            if !settle(&mut failed, drive.open_luks(ctx))? || drive.broken {
                continue;
            }

            match drive.mount_device(ctx, &mounts) {
                Ok(placement) => {
                    if let Placement::Scratch {
                        newly_mounted: true,
                        ..
                    } = placement
                    {
                        scratch_changed = true;
                    }
                    placements.insert(path.clone(), placement);
                }
                Err(err) => {
                    settle(&mut failed, Err(err))?;
                }
            }
        }

        if scratch_changed {
            mounts = MountTable::scan(ctx)?;
        }

        let candidates: Vec<(&Drive, &Placement)> = placements
            .iter()
            .filter_map(|(path, placement)| Some((self.drives.get(path)?, placement)))
            .collect();
        let scan = scan_swift_ids(ctx, &candidates);
        failed |= scan.failed;

        for (swift_id, path) in &scan.assignments {
            let Some(drive) = self.drives.get_mut(path) else {
                continue;
            };
            if drive.broken {
                continue;
            }
            match drive.execute_final_mount(ctx, swift_id, &mounts) {
                Ok(MountOutcome::Mounted) => info!(
                    "{} is mounted on {}",
                    drive.effective_device().display(),
                    paths::final_mount_path(swift_id).display()
                ),
                Ok(MountOutcome::AlreadyMounted) => {}
                Err(err) => {
                    settle(&mut failed, Err(err))?;
                }
            }
        }

        if let Err(err) = touch_ready_marker(ctx) {
            error!("{err}");
            failed = true;
        }

        if failed {
            info!("completed with errors, see above");
        }
        Ok(PassReport { failed })
    }
}

/// Sorts the outcome of one pipeline stage: fatal errors propagate, all other
/// errors are logged (unless the quarantine already did) and mark the pass
/// as failed. Returns whether the stage succeeded.
fn settle(failed: &mut bool, result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            if !matches!(err, Error::Quarantined { .. }) {
                error!("{err}");
            }
            *failed = true;
            Ok(false)
        }
    }
}

/// Tells the storage service that `/srv/node` is usable.
fn touch_ready_marker(ctx: &Context) -> Result<()> {
    let root = ctx.host_path(Path::new(paths::FINAL_MOUNT_ROOT));
    fs::create_dir_all(&root).mount_point_context(paths::FINAL_MOUNT_ROOT)?;

    let output = ctx
        .exec
        .run(Invocation::new("touch").arg(paths::READY_MARKER))?;
    if !output.success {
        return Err(Error::Touch {
            path: PathBuf::from(paths::READY_MARKER),
            stderr: output.diagnostic(),
        });
    }
    Ok(())
}
