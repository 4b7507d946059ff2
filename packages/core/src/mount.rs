//! Mount operations module.
//!
//! Drives go through two stages: a scratch mount below `/run/swift-storage`
//! (where the identity marker is read or written) and the final mount at
//! `/srv/node/<swift-id>`. Both stages re-verify the health of every existing
//! mount of the drive on each pass, since a disk can fail long after it was
//! mounted.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::context::Context;
use crate::drive::{DeviceKind, Drive};
use crate::error::{Error, IoResultExt, Result};
use crate::executor::Invocation;
use crate::mounts::MountTable;
use crate::paths;

/// Where a drive ended up after the scratch-mount stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Mounted below the storage root, waiting for its identity.
    Scratch { path: PathBuf, newly_mounted: bool },
    /// Already serving at its final mount point.
    Final { swift_id: String },
}

/// Result of [`Drive::execute_final_mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    AlreadyMounted,
    Mounted,
}

impl Drive {
    /// Mounts the effective device at its scratch location unless it is
    /// already mounted there or at its final location.
    ///
    /// A read-only mount anywhere, or a failing `mount`, quarantines the
    /// drive. Blank media receives an XFS filesystem first.
    pub fn mount_device(&mut self, ctx: &Context, mounts: &MountTable) -> Result<Placement> {
        let device = self.effective_device().to_path_buf();
        let existing: Vec<PathBuf> = mounts
            .mounts_of(&device)
            .map(|r| r.mount_path.clone())
            .collect();

        let read_only = mounts
            .mounts_of(&device)
            .find(|r| r.read_only)
            .map(|r| r.mount_path.clone());
        if let Some(mount_path) = read_only {
            let err = Error::ReadOnlyMount { device, mount_path };
            return Err(self.quarantine(ctx, err));
        }

        let scratch = self.temporary_mount.path.clone();
        self.temporary_mount.active = existing.contains(&scratch);

        if let Some(swift_id) = existing.iter().find_map(|p| final_swift_id(p)) {
            self.swift_id = Some(swift_id.clone());
            return Ok(Placement::Final { swift_id });
        }
        if self.temporary_mount.active {
            return Ok(Placement::Scratch {
                path: scratch,
                newly_mounted: false,
            });
        }

        self.ensure_filesystem(ctx)?;

        create_mount_point(ctx, &scratch)?;
        let output = ctx.exec.run(
            Invocation::new("mount")
                .path_arg(&device)
                .path_arg(&scratch),
        )?;
        if !output.success {
            let err = Error::Mount {
                device,
                target: scratch,
                stderr: output.diagnostic(),
            };
            return Err(self.quarantine(ctx, err));
        }

        info!("mounted {} to {}", device.display(), scratch.display());
        self.temporary_mount.active = true;
        Ok(Placement::Scratch {
            path: scratch,
            newly_mounted: true,
        })
    }

    /// Creates an XFS filesystem if the effective device is blank and the
    /// drive was blank from the start.
    fn ensure_filesystem(&mut self, ctx: &Context) -> Result<()> {
        if self.classify(ctx)? != DeviceKind::Unknown {
            return Ok(());
        }

        let device = self.effective_device().to_path_buf();
        if !self.started_out_empty {
            return Err(Error::RefuseMkfs { device });
        }

        let output = ctx
            .exec
            .run(Invocation::new("mkfs.xfs").path_arg(&device))?;
        if !output.success {
            let err = Error::Mkfs {
                device,
                stderr: output.diagnostic(),
            };
            return Err(self.quarantine(ctx, err));
        }

        info!("created XFS filesystem on {}", device.display());
        self.classification.invalidate();
        Ok(())
    }

    /// Moves the drive from its scratch mount to `/srv/node/<swift_id>`.
    ///
    /// The final mount is established before the scratch mount goes away.
    pub fn execute_final_mount(
        &mut self,
        ctx: &Context,
        swift_id: &str,
        mounts: &MountTable,
    ) -> Result<MountOutcome> {
        let device = self.effective_device().to_path_buf();
        let target = paths::final_mount_path(swift_id);

        if mounts.is_mounted(&device, &target) {
            self.swift_id = Some(swift_id.to_string());
            self.release_scratch_mount(ctx, mounts)?;
            self.write_propagation_marker(ctx, swift_id)?;
            return Ok(MountOutcome::AlreadyMounted);
        }

        if let Some(occupant) = mounts.at(&target) {
            return Err(Error::MountConflict {
                device,
                target,
                occupant: occupant.device_path.clone(),
            });
        }

        create_mount_point(ctx, &target)?;
        let output = ctx.exec.run(
            Invocation::new("mount")
                .path_arg(&device)
                .path_arg(&target),
        )?;
        if !output.success {
            let err = Error::Mount {
                device,
                target,
                stderr: output.diagnostic(),
            };
            return Err(self.quarantine(ctx, err));
        }
        self.swift_id = Some(swift_id.to_string());

        let marker = self.write_propagation_marker(ctx, swift_id);
        self.release_scratch_mount(ctx, mounts)?;
        marker?;
        Ok(MountOutcome::Mounted)
    }

    fn release_scratch_mount(&mut self, ctx: &Context, mounts: &MountTable) -> Result<()> {
        let scratch = &self.temporary_mount.path;
        if mounts.is_mounted(self.effective_device(), scratch) {
            unmount(ctx, scratch)?;
        }
        self.temporary_mount.active = false;
        Ok(())
    }

    /// Records which device holds `swift_id`, for attributing a later
    /// unmount of the final mount point.
    fn write_propagation_marker(&self, ctx: &Context, swift_id: &str) -> Result<()> {
        let link = ctx.host_path(&paths::propagation_marker(swift_id));
        if fs::read_link(&link).is_ok_and(|target| target == self.device_path) {
            return Ok(());
        }

        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).marker_context(parent)?;
        }
        match fs::remove_file(&link) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                return Err(err).marker_context(&link);
            }
            _ => {}
        }
        unix_fs::symlink(&self.device_path, &link).marker_context(&link)?;
        debug!(
            "recorded {} as holder of {swift_id}",
            self.device_path.display()
        );
        Ok(())
    }
}

/// Creates a mount point directory (inside the chroot) if it doesn't exist.
pub fn create_mount_point(ctx: &Context, path: &Path) -> Result<()> {
    let host_path = ctx.host_path(path);
    if !host_path.exists() {
        fs::create_dir_all(&host_path).mount_point_context(path)?;
    }
    Ok(())
}

/// Unmounts whatever is mounted at `mount_point`.
pub fn unmount(ctx: &Context, mount_point: &Path) -> Result<()> {
    let output = ctx
        .exec
        .run(Invocation::new("umount").path_arg(mount_point))?;

    if !output.success {
        return Err(Error::Unmount {
            path: mount_point.to_path_buf(),
            stderr: output.diagnostic(),
        });
    }

    debug!("unmounted {}", mount_point.display());
    Ok(())
}

/// Extracts the swift-id from a final mount path (`/srv/node/<id>`).
fn final_swift_id(mount_path: &Path) -> Option<String> {
    if mount_path.parent()? != Path::new(paths::FINAL_MOUNT_ROOT) {
        return None;
    }
    mount_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
