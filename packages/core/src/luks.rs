//! LUKS container handling via `cryptsetup` and `dmsetup`.
//!
//! Per drive, the container is either closed, open (mapped) or the drive is
//! quarantined. Passphrases are only ever handed to `cryptsetup` over stdin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::context::Context;
use crate::drive::{Classification, DeviceKind, Drive};
use crate::error::{Error, Result};
use crate::executor::Invocation;
use crate::paths;

/// Active mappings as reported by the kernel: backing device -> mapping name.
pub type ActiveMappings = BTreeMap<PathBuf, String>;

impl Drive {
    /// Opens the LUKS container on this drive, trying the configured keys in
    /// order. Does nothing unless the drive holds a closed LUKS container.
    pub fn open_luks(&mut self, ctx: &Context) -> Result<()> {
        if self.broken || self.mapped_device_path.is_some() {
            return Ok(());
        }
        if self.classify(ctx)? != DeviceKind::Luks {
            return Ok(());
        }

        let mapper_name = self.token().to_string();
        let mut opened = false;
        for (idx, key) in ctx.config.keys.iter().enumerate() {
            debug!(
                "trying to luksOpen {} as {mapper_name} with key {idx}...",
                self.device_path.display()
            );
            let output = ctx.exec.run(
                Invocation::new("cryptsetup")
                    .arg("luksOpen")
                    .path_arg(&self.device_path)
                    .arg(mapper_name.as_str())
                    .stdin(format!("{}\n", key.secret))
                    .skip_log(),
            )?;
            if output.success {
                opened = true;
                break;
            }
        }

        if !opened {
            let err = Error::KeysRejected {
                device: self.device_path.clone(),
                mapping: mapper_name,
            };
            return Err(self.quarantine(ctx, err));
        }

        let mapped = paths::mapper_path(&mapper_name);
        info!(
            "LUKS container at {} opened as {}",
            self.device_path.display(),
            mapped.display()
        );
        self.mapped_device_path = Some(mapped);
        // the classification now has to describe the decrypted content
        self.classification.invalidate();
        Ok(())
    }

    /// Closes the open LUKS container, if any. On failure the state is left
    /// untouched so a later pass can retry.
    pub fn close_luks(&mut self, ctx: &Context) -> Result<()> {
        let Some(mapped) = self.mapped_device_path.clone() else {
            return Ok(());
        };
        let mapper_name = mapping_name(&mapped);

        let output = ctx.exec.run(
            Invocation::new("cryptsetup")
                .arg("close")
                .arg(mapper_name.as_str()),
        )?;
        if !output.success {
            return Err(Error::LuksClose {
                mapping: mapper_name,
                stderr: output.diagnostic(),
            });
        }

        info!("LUKS container {} closed", mapped.display());
        self.mapped_device_path = None;
        self.classification.invalidate();
        Ok(())
    }

    /// Reconciles the believed mapping against the kernel's active mappings.
    pub fn check_luks(&mut self, ctx: &Context, active: &ActiveMappings) -> Result<()> {
        if self.broken {
            return Ok(());
        }

        let Some(actual_name) = active.get(&self.device_path) else {
            if let Some(believed) = &self.mapped_device_path {
                let err = Error::LuksInconsistent {
                    device: self.device_path.clone(),
                    message: format!("should be open at {}, but is not", believed.display()),
                };
                return Err(self.quarantine(ctx, err));
            }
            return Ok(());
        };

        let actual = paths::mapper_path(actual_name);
        match &self.mapped_device_path {
            None => {
                info!(
                    "discovered {} to be mapped to {} already",
                    self.device_path.display(),
                    actual.display()
                );
                self.mapped_device_path = Some(actual);
                self.classification.invalidate();
                // a live container proves the device was never blank
                self.started_out_empty = false;
                Ok(())
            }
            Some(believed) if *believed == actual => Ok(()),
            Some(believed) => {
                let err = Error::LuksInconsistent {
                    device: self.device_path.clone(),
                    message: format!(
                        "should be open at {}, but is actually open at {}",
                        believed.display(),
                        actual.display()
                    ),
                };
                Err(self.quarantine(ctx, err))
            }
        }
    }

    /// Creates a LUKS container with the first configured key, but only if
    /// the device is blank.
    pub fn format_luks_if_required(&mut self, ctx: &Context) -> Result<()> {
        if self.broken || self.mapped_device_path.is_some() {
            return Ok(());
        }
        let Some(key) = ctx.config.keys.first() else {
            return Err(Error::NoKeysConfigured {
                device: self.device_path.clone(),
            });
        };

        // never format over a filesystem or an existing LUKS header
        if self.classify(ctx)? != DeviceKind::Unknown {
            return Ok(());
        }

        debug!(
            "running cryptsetup luksFormat {} with key 0...",
            self.device_path.display()
        );
        let output = ctx.exec.run(
            Invocation::new("cryptsetup")
                .arg("luksFormat")
                .path_arg(&self.device_path)
                .stdin(format!("{}\n", key.secret)),
        )?;
        if !output.success {
            let err = Error::LuksFormat {
                device: self.device_path.clone(),
                stderr: output.diagnostic(),
            };
            return Err(self.quarantine(ctx, err));
        }

        info!("formatted {} as LUKS container", self.device_path.display());
        self.classification = Classification::Classified(DeviceKind::Luks);
        Ok(())
    }
}

/// Lists all open dm-crypt mappings together with their backing devices.
pub fn scan_luks_mappings(ctx: &Context) -> Result<ActiveMappings> {
    let mut result = ActiveMappings::new();
    let output = ctx.exec.run(
        Invocation::new("dmsetup")
            .arg("ls")
            .arg("--target=crypt")
            .exit_on_error(),
    )?;

    if output.stdout.trim() == "No devices found" {
        return Ok(result);
    }

    // each line looks like "mapname\t(253, 0)"
    for mapping in output.stdout.lines().filter_map(|l| l.split_whitespace().next()) {
        let backing = backing_device(ctx, mapping)?;
        result.insert(backing, mapping.to_string());
    }
    Ok(result)
}

/// Asks cryptsetup for the device backing an open mapping.
fn backing_device(ctx: &Context, mapping: &str) -> Result<PathBuf> {
    let output = ctx.exec.run(
        Invocation::new("cryptsetup")
            .arg("status")
            .arg(mapping)
            .exit_on_error(),
    )?;
    parse_backing_device(&output.stdout).ok_or_else(|| Error::MappingWithoutBackingDevice {
        mapping: mapping.to_string(),
    })
}

static BACKING_DEVICE_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*device:\s*(\S+)\s*$").expect("valid regex"));

/// Finds the `device: <path>` line in `cryptsetup status` output.
fn parse_backing_device(status: &str) -> Option<PathBuf> {
    BACKING_DEVICE_RX
        .captures(status)
        .map(|caps| PathBuf::from(&caps[1]))
}

fn mapping_name(mapped: &Path) -> String {
    mapped
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
