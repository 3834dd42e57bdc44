//! File metadata handling for archive entries.
//!
//! Captures what a header needs (mode, ownership, mtime, device numbers) and
//! restores it on extraction.

use serde::{Deserialize, Serialize};
use nix::sys::time::TimeVal;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

/// Metadata recorded for one archive entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub kind: FileKind,

    /// File size in bytes (0 for anything but regular files)
    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    pub mtime: u64,

    /// Permission bits including setuid/setgid/sticky
    pub mode: u32,

    pub uid: u64,
    pub gid: u64,

    /// Owner names, empty when the id has no passwd/group entry
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub gname: String,

    #[serde(default)]
    pub dev_major: u64,
    #[serde(default)]
    pub dev_minor: u64,
}

impl EntryMetadata {
    /// Extract metadata without following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self::from_std(&metadata))
    }

    pub fn from_std(metadata: &fs::Metadata) -> Self {
        use std::os::unix::fs::FileTypeExt;

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Dir
        } else if file_type.is_file() {
            FileKind::File
        } else if file_type.is_char_device() {
            FileKind::CharDevice
        } else if file_type.is_block_device() {
            FileKind::BlockDevice
        } else if file_type.is_fifo() {
            FileKind::Fifo
        } else if file_type.is_socket() {
            FileKind::Socket
        } else {
            FileKind::Unknown
        };

        let (dev_major, dev_minor) = match kind {
            FileKind::CharDevice | FileKind::BlockDevice => {
                let rdev = metadata.rdev();
                (nix::sys::stat::major(rdev), nix::sys::stat::minor(rdev))
            }
            _ => (0, 0),
        };

        let uid = metadata.uid();
        let gid = metadata.gid();

        Self {
            kind,
            size: if kind == FileKind::File { metadata.len() } else { 0 },
            mtime: metadata.mtime().max(0) as u64,
            mode: metadata.mode() & 0o7777,
            uid: uid as u64,
            gid: gid as u64,
            uname: user_name(uid),
            gname: group_name(gid),
            dev_major,
            dev_minor,
        }
    }

    /// Metadata for an in-memory blob written as a regular file
    pub fn for_data(size: u64, mtime: u64) -> Self {
        Self {
            kind: FileKind::File,
            size,
            mtime,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: String::new(),
            gname: String::new(),
            dev_major: 0,
            dev_minor: 0,
        }
    }

    /// Apply mode and modification time. Ownership is only attempted when
    /// running as root; failures there are logged, not returned. Symlinks get
    /// their own ownership and mtime; they have no mode of their own.
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        let is_link = self.kind == FileKind::Symlink;

        if nix::unistd::geteuid().is_root() {
            let result = if is_link {
                std::os::unix::fs::lchown(path, Some(self.uid as u32), Some(self.gid as u32))
            } else {
                std::os::unix::fs::chown(path, Some(self.uid as u32), Some(self.gid as u32))
            };
            if let Err(e) = result {
                tracing::debug!("Could not chown {}: {}", path.display(), e);
            }
        }

        if is_link {
            return set_link_mtime(path, self.mtime);
        }
        set_mtime(path, self.mtime)?;
        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))
    }
}

fn time_pair(mtime: u64) -> (TimeVal, TimeVal) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(mtime);
    (
        TimeVal::new(now as nix::libc::time_t, 0),
        TimeVal::new(mtime as nix::libc::time_t, 0),
    )
}

/// Set the modification time of a path without opening it (FIFOs would block).
pub fn set_mtime(path: &Path, mtime: u64) -> std::io::Result<()> {
    let (atime, mtime) = time_pair(mtime);
    nix::sys::stat::utimes(path, &atime, &mtime).map_err(std::io::Error::from)
}

/// Set the modification time of a symlink itself.
pub fn set_link_mtime(path: &Path, mtime: u64) -> std::io::Result<()> {
    let (atime, mtime) = time_pair(mtime);
    nix::sys::stat::lutimes(path, &atime, &mtime).map_err(std::io::Error::from)
}

fn user_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default()
}

fn group_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_default()
}
