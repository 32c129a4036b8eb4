//! cgroup v2 management.
//!
//! Each container owns a user-accessible subtree at
//! `<cgroup_root>/containerv/<id>`. Limits are written as plain control
//! files, so everything here is testable against any directory root.

use crate::container::ResourceLimits;
use common::{fs, Error, Result};
use getset::Getters;
use log::{debug, trace};
use std::path::{Path, PathBuf};

/// The default cgroup v2 mount point.
pub const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

/// One CPU scheduling period in microseconds.
const CPU_PERIOD_USEC: u64 = 100_000;

#[derive(Debug, Getters)]
/// One container's cgroup subtree.
pub struct Cgroup {
    #[get = "pub"]
    /// Absolute path of the subtree.
    path: PathBuf,
}

impl Cgroup {
    /// Create the subtree for `id` under `root` and apply `limits`.
    pub fn create(root: &Path, id: &str, limits: &ResourceLimits) -> Result<Self> {
        let path = root.join("containerv").join(id);
        fs::mkdir_p(&path)?;
        debug!("Created cgroup {}", path.display());

        if let Some(bytes) = limits.memory_max() {
            Self::write_control(&path, "memory.max", &bytes.to_string())?;
        }
        if let Some(percent) = limits.cpu_percent() {
            if !(1..=100).contains(&percent) {
                return Err(Error::invalid(format!(
                    "cpu percent {} is outside 1..=100",
                    percent
                )));
            }
            let quota = CPU_PERIOD_USEC * u64::from(percent) / 100;
            Self::write_control(&path, "cpu.max", &format!("{} {}", quota, CPU_PERIOD_USEC))?;
        }
        if let Some(count) = limits.process_max() {
            Self::write_control(&path, "pids.max", &count.to_string())?;
        }
        Ok(Self { path })
    }

    /// The `cgroup.procs` file processes are assigned through.
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// Remove the subtree. The kernel only allows this once the cgroup has
    /// no more members; absence is tolerated.
    pub fn destroy(&self) -> Result<()> {
        trace!("Removing cgroup {}", self.path.display());
        match std::fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(
                format!("remove cgroup {}", self.path.display()),
                e,
            )),
        }
    }

    fn write_control(path: &Path, control: &str, value: &str) -> Result<()> {
        trace!("cgroup {} <- {}", control, value);
        std::fs::write(path.join(control), value)
            .map_err(|e| Error::from_io(format!("write cgroup control {}", control), e))
    }
}
