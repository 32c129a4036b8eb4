//! The filesystem platform layer.
//!
//! Thin, kind-classified wrappers around `std::fs` used by every crate that
//! touches the disk. Nothing here logs above `trace` and nothing re-throws;
//! callers decide what a failure means.

use crate::error::{Error, Result};
use getset::{CopyGetters, Getters};
use log::trace;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use strum::Display;

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// The kind of a walked directory entry.
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

#[derive(Clone, CopyGetters, Debug, Getters)]
/// One entry produced by [`walk`].
pub struct WalkEntry {
    #[get = "pub"]
    /// Absolute path of the entry.
    abs_path: PathBuf,

    #[get = "pub"]
    /// Path of the entry relative to the walk root.
    sub_path: PathBuf,

    #[get_copy = "pub"]
    /// Entry kind, taken from the symlink metadata (links are not followed).
    kind: FileKind,
}

/// Recursively enumerate `root`, depth first, directories before their
/// contents, names sorted within each directory. Symlinks are reported but
/// never followed.
pub fn walk(root: &Path) -> Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();
    walk_into(root, Path::new(""), &mut entries)?;
    trace!("Walked {} ({} entries)", root.display(), entries.len());
    Ok(entries)
}

fn walk_into(abs: &Path, sub: &Path, out: &mut Vec<WalkEntry>) -> Result<()> {
    let mut names = fs::read_dir(abs)
        .map_err(|e| Error::from_io(format!("read dir {}", abs.display()), e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::from_io(format!("read dir entry in {}", abs.display()), e))?
        .into_iter()
        .map(|e| e.file_name())
        .collect::<Vec<_>>();
    names.sort();

    for name in names {
        let abs_path = abs.join(&name);
        let sub_path = sub.join(&name);
        let metadata = fs::symlink_metadata(&abs_path)
            .map_err(|e| Error::from_io(format!("stat {}", abs_path.display()), e))?;
        let file_type = metadata.file_type();

        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Unknown
        };

        out.push(WalkEntry {
            abs_path: abs_path.clone(),
            sub_path: sub_path.clone(),
            kind,
        });

        if kind == FileKind::Directory {
            walk_into(&abs_path, &sub_path, out)?;
        }
    }
    Ok(())
}

/// Join `sub` onto `base`, normalising any forward/backslash mix in `sub` and
/// dropping empty and `.` segments. `..` segments are kept verbatim; rejecting
/// them is a policy decision of the caller.
pub fn path_join<B: AsRef<Path>, S: AsRef<str>>(base: B, sub: S) -> PathBuf {
    let normalized = sub.as_ref().replace('\\', "/");
    let mut out = base.as_ref().to_path_buf();
    for part in normalized.split('/').filter(|p| !p.is_empty() && *p != ".") {
        out.push(part);
    }
    out
}

/// Create `path` and any missing parents. Succeeds when the directory already
/// exists.
pub fn mkdir_p(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::from_io(format!("mkdir {}", path.display()), e))
}

/// Create or replace `path` with `contents`, then flush and sync to disk.
pub fn write_text_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = fs::File::create(path)
        .map_err(|e| Error::from_io(format!("create {}", path.display()), e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| Error::from_io(format!("write {}", path.display()), e))?;
    file.flush()
        .map_err(|e| Error::from_io(format!("flush {}", path.display()), e))?;
    file.sync_all()
        .map_err(|e| Error::from_io(format!("sync {}", path.display()), e))
}

/// Read the target of a symlink.
pub fn read_link(path: &Path) -> Result<PathBuf> {
    fs::read_link(path).map_err(|e| Error::from_io(format!("readlink {}", path.display()), e))
}

#[cfg(unix)]
/// Create a symlink at `link` pointing at `target` (taken verbatim).
pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| Error::from_io(format!("symlink {}", link.display()), e))
}

#[cfg(windows)]
/// Create a symlink at `link` pointing at `target` (taken verbatim).
pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target, link)
        .map_err(|e| Error::from_io(format!("symlink {}", link.display()), e))
}

/// Copy a single file, returning the number of bytes copied.
pub fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    fs::copy(from, to).map_err(|e| {
        Error::from_io(
            format!("copy {} to {}", from.display(), to.display()),
            e,
        )
    })
}

#[cfg(unix)]
/// Set the Unix mode bits of `path`.
pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::from_io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
/// No Unix modes on this platform.
pub fn chmod(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Remove a directory tree, tolerating its absence.
pub fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from_io(format!("remove {}", path.display()), e)),
    }
}
