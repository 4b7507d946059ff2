//! Triggers for reconciliation passes.
//!
//! Three polling threads feed one channel: a device watcher expanding the
//! drive globs, a consistency-check ticker and a watcher for removed
//! quarantine symlinks. The consumer handles one event at a time, so passes
//! are serialized in arrival order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use snafu::ResultExt;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{DriveGlobSnafu, Result};
use crate::quarantine::list_quarantine;

/// Something that warrants a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Device paths that matched the drive globs for the first time.
    DrivesAdded(Vec<PathBuf>),
    /// Periodic re-verification of all drives.
    ConsistencyCheck,
    /// The quarantine symlink of this raw device was removed.
    DriveReinstated(PathBuf),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::DrivesAdded(paths) => {
                let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                write!(f, "new drives: {}", paths.join(", "))
            }
            Event::ConsistencyCheck => f.write_str("scheduled consistency check"),
            Event::DriveReinstated(path) => write!(f, "drive reinstated: {}", path.display()),
        }
    }
}

/// Expands the configured drive globs inside the chroot.
///
/// Returns sorted, deduplicated device paths as seen from inside the chroot.
pub fn enumerate_drives(config: &Config) -> Result<Vec<PathBuf>> {
    let chroot = config.chroot();
    let prefix = glob::Pattern::escape(&chroot.to_string_lossy());
    let mut drives = BTreeSet::new();

    for pattern in &config.drive_globs {
        let host_pattern = if chroot == Path::new("/") {
            pattern.clone()
        } else {
            format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                pattern.trim_start_matches('/')
            )
        };

        let entries = glob::glob(&host_pattern).context(DriveGlobSnafu { pattern })?;
        for entry in entries {
            match entry {
                Ok(host_path) => {
                    let relative = host_path.strip_prefix(chroot).unwrap_or(&host_path);
                    drives.insert(Path::new("/").join(relative));
                }
                Err(err) => debug!("skipping unreadable path: {err}"),
            }
        }
    }

    Ok(drives.into_iter().collect())
}

/// Receiving end of the event threads.
pub struct EventSource {
    receiver: Receiver<Event>,
}

impl EventSource {
    /// Starts the polling threads. They stop on their own once the
    /// `EventSource` has been dropped.
    pub fn spawn(config: Arc<Config>) -> Self {
        let (sender, receiver) = mpsc::channel();

        let (cfg, tx) = (Arc::clone(&config), sender.clone());
        thread::spawn(move || watch_devices(&cfg, &tx));

        let (interval, tx) = (config.intervals.consistency_check(), sender.clone());
        thread::spawn(move || tick(interval, &tx));

        thread::spawn(move || watch_quarantine(&config, &sender));

        Self { receiver }
    }

    /// Waits up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

fn watch_devices(config: &Config, tx: &Sender<Event>) {
    let mut known = BTreeSet::new();
    loop {
        match enumerate_drives(config) {
            Ok(current) => {
                let added = new_paths(&mut known, current);
                if !added.is_empty() && tx.send(Event::DrivesAdded(added)).is_err() {
                    return;
                }
            }
            Err(err) => error!("{err}"),
        }
        thread::sleep(config.intervals.device_scan());
    }
}

fn tick(interval: Duration, tx: &Sender<Event>) {
    loop {
        thread::sleep(interval);
        if tx.send(Event::ConsistencyCheck).is_err() {
            return;
        }
    }
}

fn watch_quarantine(config: &Config, tx: &Sender<Event>) {
    let mut previous = BTreeMap::new();
    loop {
        match list_quarantine(config) {
            Ok(current) => {
                for device in removed_links(&previous, &current) {
                    if tx.send(Event::DriveReinstated(device)).is_err() {
                        return;
                    }
                }
                previous = current;
            }
            Err(err) => error!("{err}"),
        }
        thread::sleep(config.intervals.quarantine_scan());
    }
}

/// Records `current` in `known` and returns the paths not seen before.
fn new_paths(known: &mut BTreeSet<PathBuf>, current: Vec<PathBuf>) -> Vec<PathBuf> {
    current
        .into_iter()
        .filter(|path| known.insert(path.clone()))
        .collect()
}

/// Devices whose quarantine symlink existed in `previous` but is gone now.
fn removed_links(
    previous: &BTreeMap<String, PathBuf>,
    current: &BTreeMap<String, PathBuf>,
) -> Vec<PathBuf> {
    previous
        .iter()
        .filter(|(token, _)| !current.contains_key(*token))
        .map(|(_, device)| device.clone())
        .collect()
}
