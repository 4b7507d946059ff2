//! Snapshot of the kernel mount table.

use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::error::Result;
use crate::executor::Invocation;

/// One line of `/proc/self/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub device_path: PathBuf,
    pub mount_path: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
    pub read_only: bool,
}

/// Immutable snapshot; superseded by the next [`MountTable::scan`].
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    records: Vec<MountRecord>,
}

impl MountTable {
    /// Reads the mount table as seen from inside the chroot.
    ///
    /// Not being able to read it at all leaves nothing to reconcile against,
    /// so this is fatal.
    pub fn scan(ctx: &Context) -> Result<Self> {
        let output = ctx.exec.run(
            Invocation::new("cat")
                .arg("/proc/self/mounts")
                .exit_on_error(),
        )?;
        Ok(Self::parse(&output.stdout))
    }

    pub fn parse(content: &str) -> Self {
        let records = content.lines().filter_map(parse_line).collect();
        Self { records }
    }

    pub fn records(&self) -> &[MountRecord] {
        &self.records
    }

    /// All mounts of `device`.
    pub fn mounts_of<'a>(&'a self, device: &'a Path) -> impl Iterator<Item = &'a MountRecord> {
        self.records.iter().filter(move |r| r.device_path == device)
    }

    /// The topmost mount at `path`, if any.
    pub fn at(&self, path: &Path) -> Option<&MountRecord> {
        self.records.iter().rev().find(|r| r.mount_path == path)
    }

    pub fn is_mounted(&self, device: &Path, path: &Path) -> bool {
        self.mounts_of(device).any(|r| r.mount_path == path)
    }
}

fn parse_line(line: &str) -> Option<MountRecord> {
    let mut fields = line.split_whitespace();
    let device = fields.next()?;
    let mount_path = fields.next()?;
    let fs_type = fields.next()?;
    let options: Vec<String> = fields.next()?.split(',').map(str::to_string).collect();

    let read_only = options.iter().any(|o| o == "ro");
    Some(MountRecord {
        device_path: PathBuf::from(unescape(device)),
        mount_path: PathBuf::from(unescape(mount_path)),
        fs_type: fs_type.to_string(),
        options,
        read_only,
    })
}

/// Decodes the octal escapes (`\040` etc.) the kernel uses for whitespace.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes
            .get(i + 1..i + 4)
            .filter(|digits| bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b)))
            .map(|digits| digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0')))
            .and_then(|code| u8::try_from(code).ok());
        if let Some(byte) = escaped {
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
