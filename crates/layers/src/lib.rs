//! The declared rootfs layer stack.
//!
//! A container's root filesystem is composed from an ordered sequence of
//! layers: the first is the base, later layers are overlaid on top. Host
//! directories are bind-mounted, archives are expanded once into a scratch
//! directory and then treated like host directories, tmpfs layers are
//! realised by the backend at mount time.

use common::{fs, Error, Result};
use flate2::read::GzDecoder;
use log::{debug, trace};
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};
use strum::{AsRefStr, Display};

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Discriminant of a [`Layer`].
pub enum LayerKind {
    HostDir,
    Archive,
    Tmpfs,
}

#[derive(Clone, Debug)]
/// One contribution to the container rootfs.
pub enum Layer {
    /// Bind a host directory to a destination inside the rootfs.
    HostDir {
        source: PathBuf,
        destination: String,
        readonly: bool,
    },
    /// Expand an archive and bind the expansion.
    Archive {
        source: PathBuf,
        destination: String,
    },
    /// Mount a fresh tmpfs at the destination.
    Tmpfs {
        destination: String,
        size_bytes: u64,
        mode: u32,
    },
}

impl Layer {
    /// The discriminant of this layer.
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::HostDir { .. } => LayerKind::HostDir,
            Layer::Archive { .. } => LayerKind::Archive,
            Layer::Tmpfs { .. } => LayerKind::Tmpfs,
        }
    }

    /// The destination of this layer inside the rootfs.
    pub fn destination(&self) -> &str {
        match self {
            Layer::HostDir { destination, .. }
            | Layer::Archive { destination, .. }
            | Layer::Tmpfs { destination, .. } => destination,
        }
    }
}

#[derive(Debug)]
/// The ordered layer stack of one container.
pub struct LayerStack {
    layers: Vec<Layer>,
    scratch_dir: PathBuf,
    expanded: Vec<Option<PathBuf>>,
}

impl LayerStack {
    /// Create an empty stack whose archive expansions live below
    /// `scratch_dir`.
    pub fn new<P: Into<PathBuf>>(scratch_dir: P) -> Self {
        Self {
            layers: Vec::new(),
            scratch_dir: scratch_dir.into(),
            expanded: Vec::new(),
        }
    }

    /// Append a layer. Order is meaningful: the first pushed layer is the
    /// base rootfs.
    pub fn push(&mut self, layer: Layer) {
        trace!("Declaring {} layer at {}", layer.kind(), layer.destination());
        self.layers.push(layer);
        self.expanded.push(None);
    }

    /// Number of declared layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterate over the layers of one variant in declaration order. The
    /// iterator is finite and, once consumed, cannot be rewound.
    pub fn iter_kind(&self, kind: LayerKind) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter(move |l| l.kind() == kind)
    }

    /// The host path of the topmost writable layer: a writable host
    /// directory, or the expansion of an archive (expansions are always
    /// writable). Tmpfs layers have no host-visible path.
    pub fn get_rootfs(&mut self) -> Result<PathBuf> {
        for index in (0..self.layers.len()).rev() {
            match &self.layers[index] {
                Layer::HostDir {
                    source, readonly, ..
                } => {
                    if !readonly {
                        return Ok(source.clone());
                    }
                }
                Layer::Archive { .. } => return self.expand(index),
                Layer::Tmpfs { .. } => continue,
            }
        }
        Err(Error::invalid("layer stack has no writable layer"))
    }

    /// The host paths of every host-backed layer (host dirs and expanded
    /// archives) in declaration order.
    pub fn host_paths(&mut self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for index in 0..self.layers.len() {
            match &self.layers[index] {
                Layer::HostDir { source, .. } => paths.push(source.clone()),
                Layer::Archive { .. } => paths.push(self.expand(index)?),
                Layer::Tmpfs { .. } => {}
            }
        }
        Ok(paths)
    }

    /// The overlay lower dirs in declaration order: root host directories
    /// and expanded archives. Host directories bound at an inner
    /// destination are mounts, not overlay contributions.
    pub fn overlay_lower_dirs(&mut self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for index in 0..self.layers.len() {
            match &self.layers[index] {
                Layer::HostDir {
                    source,
                    destination,
                    ..
                } if destination == "/" => paths.push(source.clone()),
                Layer::Archive { .. } => paths.push(self.expand(index)?),
                _ => {}
            }
        }
        Ok(paths)
    }

    /// Expand the archive layer at `index` into the scratch directory,
    /// caching the result for subsequent calls.
    fn expand(&mut self, index: usize) -> Result<PathBuf> {
        if let Some(path) = &self.expanded[index] {
            return Ok(path.clone());
        }

        let source = match &self.layers[index] {
            Layer::Archive { source, .. } => source.clone(),
            _ => return Err(Error::invalid("layer is not an archive")),
        };

        let target = self.scratch_dir.join(format!("layer-{}", index));
        fs::mkdir_p(&target)?;
        debug!(
            "Expanding archive {} into {}",
            source.display(),
            target.display()
        );
        unpack_archive(&source, &target)?;

        self.expanded[index] = Some(target.clone());
        Ok(target)
    }
}

/// Unpack a tar archive, transparently handling gzip compression sniffed
/// from the leading magic bytes.
fn unpack_archive(source: &Path, target: &Path) -> Result<()> {
    let mut magic = [0u8; 2];
    let mut probe =
        File::open(source).map_err(|e| Error::from_io(format!("open {}", source.display()), e))?;
    let gzip = match probe.read(&mut magic) {
        Ok(n) => n == 2 && magic == [0x1f, 0x8b],
        Err(e) => return Err(Error::from_io(format!("read {}", source.display()), e)),
    };

    let file =
        File::open(source).map_err(|e| Error::from_io(format!("open {}", source.display()), e))?;
    let result = if gzip {
        tar::Archive::new(GzDecoder::new(file)).unpack(target)
    } else {
        tar::Archive::new(file).unpack(target)
    };
    result.map_err(|e| Error::from_io(format!("unpack {}", source.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_with_file(path: &Path, name: &str, contents: &[u8]) -> Result<()> {
        let file = File::create(path)?;
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents)?;
        builder.into_inner()?;
        Ok(())
    }

    #[test]
    fn rootfs_is_topmost_writable() -> Result<()> {
        let dir = TempDir::new()?;
        let mut stack = LayerStack::new(dir.path().join("scratch"));
        stack.push(Layer::HostDir {
            source: "/base".into(),
            destination: "/".into(),
            readonly: true,
        });
        stack.push(Layer::HostDir {
            source: "/upper".into(),
            destination: "/".into(),
            readonly: false,
        });
        stack.push(Layer::Tmpfs {
            destination: "/tmp".into(),
            size_bytes: 1 << 20,
            mode: 0o1777,
        });

        assert_eq!(stack.get_rootfs()?, PathBuf::from("/upper"));
        Ok(())
    }

    #[test]
    fn no_writable_layer_is_invalid() -> Result<()> {
        let dir = TempDir::new()?;
        let mut stack = LayerStack::new(dir.path());
        stack.push(Layer::HostDir {
            source: "/base".into(),
            destination: "/".into(),
            readonly: true,
        });

        let err = stack.get_rootfs().unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Invalid);
        Ok(())
    }

    #[test]
    fn iter_kind_preserves_order() -> Result<()> {
        let dir = TempDir::new()?;
        let mut stack = LayerStack::new(dir.path());
        stack.push(Layer::HostDir {
            source: "/a".into(),
            destination: "/a".into(),
            readonly: false,
        });
        stack.push(Layer::Tmpfs {
            destination: "/tmp".into(),
            size_bytes: 0,
            mode: 0o755,
        });
        stack.push(Layer::HostDir {
            source: "/b".into(),
            destination: "/b".into(),
            readonly: false,
        });

        let dirs = stack
            .iter_kind(LayerKind::HostDir)
            .map(|l| l.destination().to_string())
            .collect::<Vec<_>>();
        assert_eq!(dirs, vec!["/a", "/b"]);
        assert_eq!(stack.iter_kind(LayerKind::Archive).count(), 0);
        Ok(())
    }

    #[test]
    fn overlay_lowers_exclude_inner_binds() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("layer.tar");
        tar_with_file(&archive, "bin/tool", b"x")?;

        let mut stack = LayerStack::new(dir.path().join("scratch"));
        stack.push(Layer::HostDir {
            source: "/base".into(),
            destination: "/".into(),
            readonly: true,
        });
        stack.push(Layer::Archive {
            source: archive,
            destination: "/".into(),
        });
        stack.push(Layer::HostDir {
            source: "/cache".into(),
            destination: "/var/cache".into(),
            readonly: false,
        });

        let lowers = stack.overlay_lower_dirs()?;
        assert_eq!(lowers.len(), 2);
        assert_eq!(lowers[0], PathBuf::from("/base"));
        assert!(lowers[1].starts_with(dir.path().join("scratch")));
        Ok(())
    }

    #[test]
    fn archive_expands_once() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("layer.tar");
        tar_with_file(&archive, "etc/motd", b"hello")?;

        let mut stack = LayerStack::new(dir.path().join("scratch"));
        stack.push(Layer::Archive {
            source: archive,
            destination: "/".into(),
        });

        let rootfs = stack.get_rootfs()?;
        assert_eq!(std::fs::read(rootfs.join("etc/motd"))?, b"hello");

        // A marker in the expansion survives a second lookup.
        std::fs::write(rootfs.join("marker"), "x")?;
        let again = stack.get_rootfs()?;
        assert_eq!(again, rootfs);
        assert!(again.join("marker").is_file());
        Ok(())
    }

    #[test]
    fn gzip_archive_sniffed() -> Result<()> {
        let dir = TempDir::new()?;
        let tar_path = dir.path().join("layer.tar");
        tar_with_file(&tar_path, "file", b"data")?;

        let gz_path = dir.path().join("layer.tar.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            File::create(&gz_path)?,
            flate2::Compression::default(),
        );
        encoder.write_all(&std::fs::read(&tar_path)?)?;
        encoder.finish()?;

        let mut stack = LayerStack::new(dir.path().join("scratch"));
        stack.push(Layer::Archive {
            source: gz_path,
            destination: "/".into(),
        });

        let rootfs = stack.get_rootfs()?;
        assert_eq!(std::fs::read(rootfs.join("file"))?, b"data");
        Ok(())
    }
}
