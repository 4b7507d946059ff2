//! Broken-drive quarantine and reinstatement.
//!
//! A quarantined drive is represented on disk by a symlink
//! `/run/swift-storage/broken/<token>` pointing at the raw device. The
//! operator deletes the symlink once the drive has been fixed; the event
//! source notices and the drive is reinstated.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs as unix_fs;
use std::path::PathBuf;

use tracing::{error, info};

use crate::config::Config;
use crate::context::Context;
use crate::drive::Drive;
use crate::error::{Error, IoResultExt, Result};
use crate::luks::scan_luks_mappings;
use crate::mount::unmount;
use crate::mounts::MountTable;
use crate::paths;

impl Drive {
    /// Takes the drive out of service: unmounts it everywhere, closes its
    /// LUKS container and records the quarantine symlink. Idempotent.
    ///
    /// Cleanup targets the mapping the kernel actually holds for the raw
    /// device, which may differ from what this drive believed. Cleanup
    /// failures are logged; the drive stays broken regardless.
    pub fn mark_as_broken(&mut self, ctx: &Context) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        self.broken = true;

        let active = scan_luks_mappings(ctx)?;
        let live = active.get(&self.device_path).map(|name| paths::mapper_path(name));
        if live != self.mapped_device_path {
            self.mapped_device_path = live;
            self.classification.invalidate();
        }

        let device = self.effective_device().to_path_buf();
        let mounts = MountTable::scan(ctx)?;
        let mount_paths: Vec<PathBuf> = mounts
            .mounts_of(&device)
            .map(|r| r.mount_path.clone())
            .collect();
        for path in mount_paths.iter().rev() {
            if let Err(err) = unmount(ctx, path) {
                error!("{err}");
            }
        }
        self.temporary_mount.active = false;
        self.swift_id = None;

        if let Err(err) = self.close_luks(ctx) {
            error!("{err}");
        }

        let link = paths::quarantine_link(self.token());
        let host_link = ctx.host_path(&link);
        if host_link.symlink_metadata().is_err() {
            let host_dir = ctx.host_path(&paths::quarantine_dir());
            fs::create_dir_all(&host_dir).marker_context(&host_dir)?;
            unix_fs::symlink(&self.device_path, &host_link).marker_context(&host_link)?;
        }

        error!(
            "{} has been quarantined; to reinstate it into the cluster, delete the symlink at {}",
            self.device_path.display(),
            link.display()
        );
        Ok(())
    }

    /// Puts a quarantined drive back into the pipeline as if it had just
    /// been discovered.
    pub fn reinstate(&mut self) {
        if !self.broken {
            return;
        }
        self.broken = false;
        // forget everything observed before the fault; the next pass
        // rediscovers mapping and mounts from the kernel
        self.mapped_device_path = None;
        self.temporary_mount.active = false;
        self.swift_id = None;
        self.classification.invalidate();
        info!("{} has been reinstated", self.device_path.display());
    }

    /// Logs a drive fault, quarantines the drive and returns the error the
    /// caller should report for this drive.
    pub(crate) fn quarantine(&mut self, ctx: &Context, cause: Error) -> Error {
        error!("{cause}");
        if let Err(err) = self.mark_as_broken(ctx) {
            if err.is_fatal() {
                return err;
            }
            error!("{err}");
        }
        Error::Quarantined {
            device: self.device_path.clone(),
            source: Box::new(cause),
        }
    }
}

/// Current quarantine symlinks: token -> raw device path.
pub fn list_quarantine(config: &Config) -> Result<BTreeMap<String, PathBuf>> {
    let dir = config.host_path(&paths::quarantine_dir());
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err).marker_context(&dir),
    };

    let mut links = BTreeMap::new();
    for entry in entries {
        let entry = entry.marker_context(&dir)?;
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        links.insert(entry.file_name().to_string_lossy().into_owned(), target);
    }
    Ok(links)
}
