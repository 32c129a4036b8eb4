//! OCI bundle preparation.
//!
//! Computes and populates `<runtime>/oci-bundle/{rootfs,config.json}` for a
//! container. All functions return an error kind and leave partially written
//! state in place; the engine removes the runtime dir on teardown.

use common::{
    fs::{self, FileKind},
    Error, Result,
};
use getset::Getters;
use log::trace;
use std::path::{Path, PathBuf};

/// The canonical Linux standard mountpoints created inside every rootfs.
pub const STANDARD_MOUNTPOINTS: [&str; 7] = [
    "/proc",
    "/sys",
    "/sys/fs/cgroup",
    "/dev",
    "/dev/pts",
    "/dev/shm",
    "/dev/mqueue",
];

#[derive(Clone, Debug, Getters)]
/// Resolved on-disk locations of one bundle.
pub struct BundlePaths {
    #[get = "pub"]
    /// The bundle directory itself.
    bundle_dir: PathBuf,

    #[get = "pub"]
    /// The root filesystem directory below the bundle.
    rootfs_dir: PathBuf,

    #[get = "pub"]
    /// The `config.json` location below the bundle.
    config_path: PathBuf,
}

/// Deterministically derive the bundle paths below `runtime_dir`. Allocates
/// only; nothing is written to the filesystem.
pub fn get_paths(runtime_dir: &Path) -> BundlePaths {
    let bundle_dir = runtime_dir.join("oci-bundle");
    let rootfs_dir = bundle_dir.join("rootfs");
    let config_path = bundle_dir.join("config.json");
    BundlePaths {
        bundle_dir,
        rootfs_dir,
        config_path,
    }
}

/// Populate the bundle rootfs. When `source_rootfs` is provided its tree is
/// copied best-effort: directories first, then files, symlinks re-created
/// with their target taken verbatim. Entries whose readlink or copy fails are
/// skipped. Without a source only the empty rootfs directory is created.
pub fn prepare_rootfs(paths: &BundlePaths, source_rootfs: Option<&Path>) -> Result<()> {
    fs::mkdir_p(paths.rootfs_dir())?;

    let source = match source_rootfs {
        Some(source) => source,
        None => return Ok(()),
    };

    for entry in fs::walk(source)? {
        let target = paths.rootfs_dir().join(entry.sub_path());
        match entry.kind() {
            FileKind::Directory => {
                fs::mkdir_p(&target)?;
            }
            FileKind::File => {
                if let Err(e) = fs::copy_file(entry.abs_path(), &target) {
                    trace!("Skipping {}: {}", entry.abs_path().display(), e);
                }
            }
            FileKind::Symlink => match fs::read_link(entry.abs_path()) {
                Ok(link_target) => {
                    if let Err(e) = fs::symlink(&link_target, &target) {
                        trace!("Skipping link {}: {}", target.display(), e);
                    }
                }
                Err(e) => trace!("Skipping link {}: {}", entry.abs_path().display(), e),
            },
            FileKind::Unknown => {
                trace!("Skipping special file {}", entry.abs_path().display());
            }
        }
    }
    Ok(())
}

/// Create the standard Linux mountpoints below the rootfs, mode 0755.
pub fn prepare_rootfs_mountpoints(paths: &BundlePaths) -> Result<()> {
    for mountpoint in STANDARD_MOUNTPOINTS {
        let target = fs::path_join(paths.rootfs_dir(), mountpoint);
        fs::mkdir_p(&target)?;
        fs::chmod(&target, 0o755)?;
    }
    Ok(())
}

/// Create one directory below the rootfs from a Linux-style path, rejecting
/// any `..` segment, then apply `mode`.
pub fn prepare_rootfs_dir(paths: &BundlePaths, linux_path: &str, mode: u32) -> Result<()> {
    let normalized = linux_path.replace('\\', "/");
    if normalized.split('/').any(|segment| segment == "..") {
        return Err(Error::invalid(format!(
            "path {} escapes the rootfs",
            linux_path
        )));
    }

    let target = fs::path_join(paths.rootfs_dir(), &normalized);
    fs::mkdir_p(&target)?;
    fs::chmod(&target, mode)
}

/// Emit `/etc/{hosts,hostname,resolv.conf}` below the rootfs. An empty
/// hostname falls back to `localhost`; `dns_csv` accepts `;`, `,` and
/// whitespace separators and an empty string yields an empty resolv.conf.
pub fn prepare_rootfs_standard_files(
    paths: &BundlePaths,
    hostname: &str,
    dns_csv: &str,
) -> Result<()> {
    standard_files_into(paths.rootfs_dir(), hostname, dns_csv)
}

/// Same as [`prepare_rootfs_standard_files`], against a bare rootfs
/// directory outside any bundle layout.
pub fn standard_files_into(rootfs_dir: &Path, hostname: &str, dns_csv: &str) -> Result<()> {
    let host = if hostname.is_empty() {
        "localhost"
    } else {
        hostname
    };

    let etc = rootfs_dir.join("etc");
    fs::mkdir_p(&etc)?;

    let hosts = format!("127.0.0.1\tlocalhost\n127.0.1.1\t{}\n", host);
    let hosts_path = etc.join("hosts");
    fs::write_text_file(&hosts_path, &hosts)?;
    fs::chmod(&hosts_path, 0o644)?;

    let hostname_path = etc.join("hostname");
    fs::write_text_file(&hostname_path, &format!("{}\n", host))?;
    fs::chmod(&hostname_path, 0o644)?;

    let resolv = dns_csv
        .split(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|server| format!("nameserver {}\n", server))
        .collect::<String>();
    let resolv_path = etc.join("resolv.conf");
    fs::write_text_file(&resolv_path, &resolv)?;
    fs::chmod(&resolv_path, 0o644)
}

/// Write `config.json`, creating the bundle directory when missing. The text
/// is stored as UTF-8 without trailing whitespace.
pub fn write_config(paths: &BundlePaths, json_text: &str) -> Result<()> {
    fs::mkdir_p(paths.bundle_dir())?;
    fs::write_text_file(paths.config_path(), json_text.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use common::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn paths_are_deterministic() {
        let paths = get_paths(Path::new("/tmp/containerv-abc"));
        assert_eq!(
            paths.bundle_dir(),
            Path::new("/tmp/containerv-abc/oci-bundle")
        );
        assert_eq!(
            paths.rootfs_dir(),
            Path::new("/tmp/containerv-abc/oci-bundle/rootfs")
        );
        assert_eq!(
            paths.config_path(),
            Path::new("/tmp/containerv-abc/oci-bundle/config.json")
        );
    }

    #[test]
    fn rootfs_without_source() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = get_paths(dir.path());
        prepare_rootfs(&paths, None)?;
        assert!(paths.rootfs_dir().is_dir());
        assert_eq!(std::fs::read_dir(paths.rootfs_dir())?.count(), 0);
        Ok(())
    }

    #[test]
    fn rootfs_copies_source() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("bin"))?;
        std::fs::write(source.join("bin/sh"), "#!")?;

        let runtime = dir.path().join("runtime");
        let paths = get_paths(&runtime);
        prepare_rootfs(&paths, Some(&source))?;

        assert!(paths.rootfs_dir().join("bin/sh").is_file());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn rootfs_recreates_symlinks() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("source");
        std::fs::create_dir_all(&source)?;
        std::fs::write(source.join("file"), "x")?;
        common::fs::symlink(Path::new("file"), &source.join("link"))?;

        let paths = get_paths(&dir.path().join("runtime"));
        prepare_rootfs(&paths, Some(&source))?;

        let copied = paths.rootfs_dir().join("link");
        assert_eq!(std::fs::read_link(&copied)?, Path::new("file"));
        Ok(())
    }

    #[test]
    fn mountpoints_created() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = get_paths(dir.path());
        prepare_rootfs(&paths, None)?;
        prepare_rootfs_mountpoints(&paths)?;

        for mountpoint in STANDARD_MOUNTPOINTS {
            assert!(
                common::fs::path_join(paths.rootfs_dir(), mountpoint).is_dir(),
                "missing {}",
                mountpoint
            );
        }
        Ok(())
    }

    #[test]
    fn rootfs_dir_rejects_escapes() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = get_paths(dir.path());
        prepare_rootfs(&paths, None)?;

        let err = prepare_rootfs_dir(&paths, "/chef/../../etc", 0o755).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        prepare_rootfs_dir(&paths, "/chef/staging", 0o755)?;
        assert!(paths.rootfs_dir().join("chef/staging").is_dir());
        Ok(())
    }

    #[test]
    fn standard_files_contents() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = get_paths(dir.path());
        prepare_rootfs(&paths, None)?;
        prepare_rootfs_standard_files(&paths, "builder", "1.1.1.1, 8.8.8.8; 9.9.9.9")?;

        let etc = paths.rootfs_dir().join("etc");
        assert_eq!(
            std::fs::read_to_string(etc.join("hosts"))?,
            "127.0.0.1\tlocalhost\n127.0.1.1\tbuilder\n"
        );
        assert_eq!(std::fs::read_to_string(etc.join("hostname"))?, "builder\n");
        assert_eq!(
            std::fs::read_to_string(etc.join("resolv.conf"))?,
            "nameserver 1.1.1.1\nnameserver 8.8.8.8\nnameserver 9.9.9.9\n"
        );
        Ok(())
    }

    #[test]
    fn standard_files_hostname_default() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = get_paths(dir.path());
        prepare_rootfs(&paths, None)?;
        prepare_rootfs_standard_files(&paths, "", "")?;

        let etc = paths.rootfs_dir().join("etc");
        assert!(std::fs::read_to_string(etc.join("hosts"))?.contains("127.0.1.1\tlocalhost\n"));
        assert_eq!(
            std::fs::read_to_string(etc.join("hostname"))?,
            "localhost\n"
        );
        assert_eq!(std::fs::read_to_string(etc.join("resolv.conf"))?, "");
        Ok(())
    }

    #[test]
    fn config_written_without_trailing_whitespace() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = get_paths(dir.path());
        write_config(&paths, "{\"ociVersion\":\"1.0.2\"}\n")?;

        assert_eq!(
            std::fs::read_to_string(paths.config_path())?,
            "{\"ociVersion\":\"1.0.2\"}"
        );
        Ok(())
    }
}
