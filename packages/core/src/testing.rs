//! In-memory simulation of the storage node for tests.
//!
//! [`FakeSystem`] answers the commands the autopilot issues (`file`, `lsblk`,
//! `cryptsetup`, `dmsetup`, `mkfs.xfs`, `mount`, `umount`, `cat
//! /proc/self/mounts`, `touch`) from a simulated set of block devices. Mount
//! points and marker files live in a temporary directory that acts as the
//! chroot, so the code under test touches a real file system.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::TempDir;

use crate::config::{Config, Intervals, Key};
use crate::context::Context;
use crate::error::Result;
use crate::executor::{CommandOutput, CommandRunner, Invocation};
use crate::paths;

#[derive(Debug, Clone, Default)]
struct Volume {
    content: Content,
    swift_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
enum Content {
    #[default]
    Blank,
    Xfs,
    Luks {
        key: String,
        inner: Box<Volume>,
    },
}

#[derive(Debug, Clone)]
struct RawDevice {
    serial: Option<String>,
    volume: Volume,
}

#[derive(Debug, Clone)]
struct FakeMount {
    device: PathBuf,
    path: PathBuf,
    read_only: bool,
}

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<PathBuf, RawDevice>,
    /// mapping name -> backing device (None for a mapping without backing device)
    mappings: BTreeMap<String, Option<PathBuf>>,
    mounts: Vec<FakeMount>,
    /// (program, argument) pairs whose invocations fail
    failures: BTreeSet<(String, String)>,
    attempted_keys: BTreeMap<PathBuf, Vec<String>>,
    history: Vec<String>,
}

/// Simulated storage node; clones share the same state.
#[derive(Clone)]
pub struct FakeSystem {
    root: Arc<TempDir>,
    keys: Vec<String>,
    state: Arc<Mutex<State>>,
}

impl FakeSystem {
    /// Creates an empty node whose configuration holds `keys` and a
    /// three-slot swift-id pool.
    pub fn new(keys: &[&str]) -> Self {
        let root = TempDir::new().expect("create fake chroot");
        fs::create_dir_all(root.path().join("dev")).expect("create fake /dev");
        Self {
            root: Arc::new(root),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            chroot_path: Some(self.root.path().to_path_buf()),
            drive_globs: vec!["/dev/sd*".to_string()],
            keys: self
                .keys
                .iter()
                .map(|secret| Key {
                    secret: secret.clone(),
                })
                .collect(),
            swift_id_pool: vec![
                "swift1".to_string(),
                "swift2".to_string(),
                "swift3".to_string(),
            ],
            intervals: Intervals::default(),
        }
    }

    pub fn context(&self) -> Context {
        self.context_with(self.config())
    }

    pub fn context_with(&self, config: Config) -> Context {
        Context::with_runner(config, Box::new(self.clone()))
    }

    /// Host path of `path` inside the fake chroot.
    pub fn host(&self, path: &str) -> PathBuf {
        self.root.path().join(path.trim_start_matches('/'))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake system state poisoned")
    }

    fn add_device(&self, path: &str, serial: &str, volume: Volume) {
        fs::write(self.host(path), b"").expect("create fake device node");
        let serial = (!serial.is_empty()).then(|| serial.to_string());
        self.state()
            .devices
            .insert(PathBuf::from(path), RawDevice { serial, volume });
    }

    /// Adds virgin media.
    pub fn add_blank_device(&self, path: &str, serial: &str) {
        self.add_device(path, serial, Volume::default());
    }

    /// Adds an unencrypted device carrying an XFS filesystem.
    pub fn add_xfs_device(&self, path: &str, serial: &str) {
        let volume = Volume {
            content: Content::Xfs,
            swift_id: None,
        };
        self.add_device(path, serial, volume);
    }

    /// Adds a LUKS container holding an XFS filesystem.
    pub fn add_luks_device(&self, path: &str, serial: &str, key: &str) {
        let inner = Volume {
            content: Content::Xfs,
            swift_id: None,
        };
        let volume = Volume {
            content: Content::Luks {
                key: key.to_string(),
                inner: Box::new(inner),
            },
            swift_id: None,
        };
        self.add_device(path, serial, volume);
    }

    /// Stores a swift-id marker on the filesystem of `device` (the innermost
    /// volume for LUKS devices).
    pub fn set_swift_id(&self, device: &str, id: &str) {
        let mut state = self.state();
        if let Some(raw) = state.devices.get_mut(Path::new(device)) {
            innermost(&mut raw.volume).swift_id = Some(id.to_string());
        }
    }

    /// Opens a mapping behind the autopilot's back.
    pub fn open_mapping(&self, device: &str, name: &str) {
        self.state()
            .mappings
            .insert(name.to_string(), Some(PathBuf::from(device)));
    }

    /// Registers a mapping for which `cryptsetup status` reports no device.
    pub fn add_orphan_mapping(&self, name: &str) {
        self.state().mappings.insert(name.to_string(), None);
    }

    /// Makes every `program` invocation mentioning `arg` fail.
    pub fn fail_on(&self, program: &str, arg: &str) {
        self.state()
            .failures
            .insert((program.to_string(), arg.to_string()));
    }

    pub fn remount_read_only(&self, path: &str) {
        let mut state = self.state();
        for mount in state.mounts.iter_mut().filter(|m| m.path == Path::new(path)) {
            mount.read_only = true;
        }
    }

    /// Passphrases offered to `cryptsetup luksOpen` for `device`, in order.
    pub fn attempted_keys(&self, device: &str) -> Vec<String> {
        self.state()
            .attempted_keys
            .get(Path::new(device))
            .cloned()
            .unwrap_or_default()
    }

    /// Passphrase of the LUKS header on `device`, if it has one.
    pub fn luks_key(&self, device: &str) -> Option<String> {
        match &self.state().devices.get(Path::new(device))?.volume.content {
            Content::Luks { key, .. } => Some(key.clone()),
            _ => None,
        }
    }

    pub fn is_mapped(&self, device: &str) -> bool {
        self.state()
            .mappings
            .values()
            .any(|backing| backing.as_deref() == Some(Path::new(device)))
    }

    /// Device mounted at `path`, if any.
    pub fn mounted_at(&self, path: &str) -> Option<PathBuf> {
        self.state()
            .mounts
            .iter()
            .find(|m| m.path == Path::new(path))
            .map(|m| m.device.clone())
    }

    pub fn mount_count(&self) -> usize {
        self.state().mounts.len()
    }

    pub fn quarantine_link_exists(&self, token: &str) -> bool {
        self.host(&paths::quarantine_link(token).to_string_lossy())
            .symlink_metadata()
            .is_ok()
    }

    /// Commands that changed the simulated system, e.g. `mount /dev/sdb /x`.
    pub fn mutations(&self) -> Vec<String> {
        self.state().history.clone()
    }

    fn execute(&self, invocation: &Invocation) -> CommandOutput {
        let program = invocation.program();
        let args = invocation.args();
        let fails = self
            .state()
            .failures
            .iter()
            .any(|(p, a)| p == program && args.iter().any(|arg| arg == a));
        if fails {
            return failure("injected failure");
        }

        match (program, args.first().map(String::as_str)) {
            ("file", _) => self.file(last(args)),
            ("lsblk", _) => self.lsblk(last(args)),
            ("cryptsetup", Some("luksOpen")) => {
                self.luks_open(&args[1], &args[2], invocation.input().unwrap_or_default())
            }
            ("cryptsetup", Some("luksFormat")) => {
                self.luks_format(&args[1], invocation.input().unwrap_or_default())
            }
            ("cryptsetup", Some("close")) => self.luks_close(&args[1]),
            ("cryptsetup", Some("status")) => self.luks_status(&args[1]),
            ("dmsetup", _) => self.dmsetup_ls(),
            ("mkfs.xfs", _) => self.mkfs(last(args)),
            ("mount", _) => self.mount(&args[0], &args[1]),
            ("umount", _) => self.umount(&args[0]),
            ("cat", Some("/proc/self/mounts")) => self.mount_table(),
            ("touch", _) => {
                let _ = fs::write(self.host(last(args)), b"");
                success("")
            }
            _ => failure(&format!("{program}: command not simulated")),
        }
    }

    fn file(&self, device: &str) -> CommandOutput {
        let mut state = self.state();
        match volume_mut(&mut state, device) {
            Some(volume) => success(match volume.content {
                Content::Blank => "data\n",
                Content::Xfs => "SGI XFS filesystem data (blksz 4096, inosz 512, v2 dirs)\n",
                Content::Luks { .. } => {
                    "LUKS encrypted file, ver 2 [, , sha256] UUID: 0c5e8d6a-8a1d-4e70\n"
                }
            }),
            None => failure(&format!("cannot open `{device}'")),
        }
    }

    fn lsblk(&self, device: &str) -> CommandOutput {
        let state = self.state();
        match state.devices.get(Path::new(device)) {
            Some(raw) => {
                let serial = match &raw.serial {
                    Some(serial) => format!("\"{serial}\""),
                    None => "null".to_string(),
                };
                success(&format!("{{\"blockdevices\": [{{\"serial\": {serial}}}]}}"))
            }
            None => failure(&format!("lsblk: {device}: not a block device")),
        }
    }

    fn luks_open(&self, device: &str, name: &str, input: &str) -> CommandOutput {
        let offered = input.trim_end_matches('\n').to_string();
        let mut state = self.state();
        state
            .attempted_keys
            .entry(PathBuf::from(device))
            .or_default()
            .push(offered.clone());

        let accepted = match state.devices.get(Path::new(device)) {
            Some(raw) => matches!(&raw.volume.content, Content::Luks { key, .. } if *key == offered),
            None => false,
        };
        if !accepted || state.mappings.contains_key(name) {
            return failure("No key available with this passphrase.");
        }
        state
            .mappings
            .insert(name.to_string(), Some(PathBuf::from(device)));
        state.history.push(format!("cryptsetup luksOpen {device} {name}"));
        success("")
    }

    fn luks_format(&self, device: &str, input: &str) -> CommandOutput {
        let mut state = self.state();
        let Some(raw) = state.devices.get_mut(Path::new(device)) else {
            return failure(&format!("Device {device} does not exist."));
        };
        raw.volume = Volume {
            content: Content::Luks {
                key: input.trim_end_matches('\n').to_string(),
                inner: Box::default(),
            },
            swift_id: None,
        };
        state.history.push(format!("cryptsetup luksFormat {device}"));
        success("")
    }

    fn luks_close(&self, name: &str) -> CommandOutput {
        let mut state = self.state();
        let mapped = paths::mapper_path(name);
        if state.mounts.iter().any(|m| m.device == mapped) {
            return failure(&format!("Device {name} is still in use."));
        }
        if state.mappings.remove(name).is_none() {
            return failure(&format!("Device {name} is not active."));
        }
        state.history.push(format!("cryptsetup close {name}"));
        success("")
    }

    fn luks_status(&self, name: &str) -> CommandOutput {
        let state = self.state();
        match state.mappings.get(name) {
            Some(Some(backing)) => success(&format!(
                "/dev/mapper/{name} is active.\n  type:    LUKS2\n  cipher:  aes-xts-plain64\n  device:  {}\n  mode:    read/write\n",
                backing.display()
            )),
            Some(None) => success(&format!("/dev/mapper/{name} is active.\n  type:    n/a\n")),
            None => failure(&format!("/dev/mapper/{name} is inactive.")),
        }
    }

    fn dmsetup_ls(&self) -> CommandOutput {
        let state = self.state();
        if state.mappings.is_empty() {
            return success("No devices found\n");
        }
        let listing: String = state
            .mappings
            .keys()
            .enumerate()
            .map(|(idx, name)| format!("{name}\t(253:{idx})\n"))
            .collect();
        success(&listing)
    }

    fn mkfs(&self, device: &str) -> CommandOutput {
        let mut state = self.state();
        let Some(volume) = volume_mut(&mut state, device) else {
            return failure(&format!("cannot open {device}"));
        };
        *volume = Volume {
            content: Content::Xfs,
            swift_id: None,
        };
        state.history.push(format!("mkfs.xfs {device}"));
        success("")
    }

    fn mount(&self, device: &str, path: &str) -> CommandOutput {
        if !self.host(path).is_dir() {
            return failure(&format!("mount point {path} does not exist"));
        }
        {
            let mut state = self.state();
            match volume_mut(&mut state, device) {
                Some(volume) if matches!(volume.content, Content::Xfs) => {}
                _ => return failure(&format!("wrong fs type, bad superblock on {device}")),
            }
            state.mounts.push(FakeMount {
                device: PathBuf::from(device),
                path: PathBuf::from(path),
                read_only: false,
            });
            state.history.push(format!("mount {device} {path}"));
        }
        self.sync_markers(Path::new(device));
        success("")
    }

    fn umount(&self, path: &str) -> CommandOutput {
        let device = match self.mounted_at(path) {
            Some(device) => device,
            None => return failure(&format!("umount: {path}: not mounted.")),
        };
        self.sync_markers(&device);
        let marker = self.host(path).join(paths::SWIFT_ID_FILE);
        let _ = fs::remove_file(marker);

        let mut state = self.state();
        if let Some(idx) = state.mounts.iter().position(|m| m.path == Path::new(path)) {
            state.mounts.remove(idx);
        }
        state.history.push(format!("umount {path}"));
        success("")
    }

    /// Keeps the swift-id marker consistent between the simulated volume and
    /// every directory the volume is mounted on.
    fn sync_markers(&self, device: &Path) {
        let mut state = self.state();
        let mount_dirs: Vec<PathBuf> = state
            .mounts
            .iter()
            .filter(|m| m.device == device)
            .map(|m| self.host(&m.path.to_string_lossy()))
            .collect();
        let device = device.to_string_lossy().into_owned();
        let Some(volume) = volume_mut(&mut state, &device) else {
            return;
        };
        for dir in &mount_dirs {
            if let Ok(content) = fs::read_to_string(dir.join(paths::SWIFT_ID_FILE)) {
                volume.swift_id = Some(content.trim().to_string());
            }
        }
        if let Some(id) = &volume.swift_id {
            for dir in &mount_dirs {
                let _ = fs::write(dir.join(paths::SWIFT_ID_FILE), format!("{id}\n"));
            }
        }
    }

    fn mount_table(&self) -> CommandOutput {
        let state = self.state();
        let mut table = String::from("proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0\n");
        for mount in &state.mounts {
            let options = if mount.read_only { "ro,relatime" } else { "rw,relatime" };
            table.push_str(&format!(
                "{} {} xfs {options},attr2,inode64,noquota 0 0\n",
                mount.device.display(),
                mount.path.display()
            ));
        }
        success(&table)
    }
}

impl CommandRunner for FakeSystem {
    fn run(&self, invocation: &Invocation, chroot: Option<&Path>) -> Result<CommandOutput> {
        assert_eq!(chroot, Some(self.root.path()), "{invocation} escaped the chroot");
        Ok(self.execute(invocation))
    }
}

fn innermost(volume: &mut Volume) -> &mut Volume {
    if !matches!(volume.content, Content::Luks { .. }) {
        return volume;
    }
    match &mut volume.content {
        Content::Luks { inner, .. } => innermost(inner),
        _ => unreachable!("checked above"),
    }
}

/// Resolves a raw device or `/dev/mapper/<name>` path to its volume.
fn volume_mut<'a>(state: &'a mut State, device: &str) -> Option<&'a mut Volume> {
    let raw_path = match device.strip_prefix("/dev/mapper/") {
        Some(name) => state.mappings.get(name)?.clone()?,
        None => PathBuf::from(device),
    };
    let volume = &mut state.devices.get_mut(&raw_path)?.volume;
    if device.starts_with("/dev/mapper/") {
        match &mut volume.content {
            Content::Luks { inner, .. } => Some(inner),
            _ => None,
        }
    } else {
        Some(volume)
    }
}

fn last(args: &[String]) -> &str {
    args.last().map(String::as_str).unwrap_or_default()
}

fn success(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        success: true,
    }
}

fn failure(stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        success: false,
    }
}
