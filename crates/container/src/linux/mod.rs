//! The Linux namespace backend.
//!
//! Realisation assembles an overlay rootfs from the layer stack, creates the
//! container cgroup and clones an init child into fresh namespaces. The init
//! child performs the guest-side setup (hostname, pivot_root, standard
//! mounts, device nodes, masked paths, policy) and then parks as pid 1 of
//! the container; later spawns join its namespaces.

pub mod cgroup;
pub mod network;

use crate::{container::ResourceLimits, policy::SecurityPolicy};
use common::{fs, Error, Result};
use getset::Getters;
use layers::{Layer, LayerStack};
use log::{debug, warn};
use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{clone, CloneFlags},
    sys::{
        signal::{kill, Signal},
        stat::{makedev, mknod, Mode, SFlag},
        wait::{waitpid, WaitPidFlag},
    },
    unistd::{chdir, pause, pivot_root, sethostname, Pid},
};
use oci::{spec, BindMount};
use std::path::{Path, PathBuf};

/// Stack size handed to the cloned init child.
const INIT_STACK_SIZE: usize = 1024 * 1024;

/// Inputs to [`realize`].
pub struct RealizeParams<'a> {
    pub id: &'a str,
    pub runtime_dir: &'a Path,
    pub hostname: &'a str,
    pub rootfs: Option<&'a Path>,
    pub extra_layers: &'a [Layer],
    pub dns_csv: &'a str,
    pub mounts: &'a [BindMount],
    pub limits: &'a ResourceLimits,
    pub policy: &'a SecurityPolicy,
    pub enable_network: bool,
}

#[derive(Debug, Getters)]
/// Realised backend state of a native Linux container.
pub struct LinuxState {
    #[get = "pub"]
    /// The merged overlay mount that is the container rootfs.
    rootfs: PathBuf,

    cgroup: Option<cgroup::Cgroup>,
    init_pid: Option<u32>,
    network: Option<network::NetworkAttachment>,
    mounted: bool,
}

impl LinuxState {
    /// The `cgroup.procs` file of the container cgroup.
    pub fn cgroup_procs(&self) -> Option<PathBuf> {
        self.cgroup.as_ref().map(|c| c.procs_path())
    }

    /// Pid of the container init child.
    pub fn init_pid(&self) -> Option<u32> {
        self.init_pid
    }
}

/// Realise a container with namespaces, cgroups and an overlay rootfs.
pub async fn realize(params: RealizeParams<'_>) -> Result<LinuxState> {
    let mut stack = LayerStack::new(params.runtime_dir.join("layers"));
    if let Some(base) = params.rootfs {
        stack.push(Layer::HostDir {
            source: base.to_path_buf(),
            destination: "/".to_string(),
            readonly: true,
        });
    }
    for layer in params.extra_layers {
        stack.push(layer.clone());
    }

    let lower_dirs = stack.overlay_lower_dirs()?;
    if lower_dirs.is_empty() {
        return Err(Error::invalid("a Linux container needs at least one layer"));
    }
    for dir in &lower_dirs {
        if !dir.is_dir() {
            return Err(Error::not_found(format!(
                "layer source {} does not exist",
                dir.display()
            )));
        }
    }

    let overlay = params.runtime_dir.join("overlay");
    let upper = overlay.join("upper");
    let work = overlay.join("work");
    let merged = overlay.join("merged");
    fs::mkdir_p(&upper)?;
    fs::mkdir_p(&work)?;
    fs::mkdir_p(&merged)?;

    mount_overlay(&lower_dirs, &upper, &work, &merged)?;
    let mut state = LinuxState {
        rootfs: merged.clone(),
        cgroup: None,
        init_pid: None,
        network: None,
        mounted: true,
    };

    if let Err(e) = realize_inner(&mut state, &merged, &params).await {
        teardown(&mut state).await;
        return Err(e);
    }
    Ok(state)
}

async fn realize_inner(
    state: &mut LinuxState,
    merged: &Path,
    params: &RealizeParams<'_>,
) -> Result<()> {
    // Non-root layers become mounts inside the merged tree, prepared on the
    // host side so the init child inherits them with its mount namespace.
    for layer in params.extra_layers {
        mount_layer(merged, layer)?;
    }
    for bind in params.mounts {
        if bind.source().is_empty() || bind.destination().is_empty() {
            continue;
        }
        bind_into(
            merged,
            Path::new(bind.source()),
            bind.destination(),
            *bind.readonly(),
        )?;
    }

    oci::bundle::standard_files_into(merged, params.hostname, params.dns_csv)?;

    state.cgroup = Some(cgroup::Cgroup::create(
        Path::new(cgroup::DEFAULT_ROOT),
        params.id,
        params.limits,
    )?);

    let init_pid = clone_init(merged, params.hostname, params.policy)?;
    state.init_pid = Some(init_pid);

    if let Some(cgroup) = state.cgroup.as_ref() {
        std::fs::write(cgroup.procs_path(), init_pid.to_string()).map_err(|e| {
            Error::from_io(format!("assign init pid {} to cgroup", init_pid), e)
        })?;
    }

    if params.enable_network {
        state.network = Some(network::attach(params.id, init_pid).await?);
    }
    Ok(())
}

/// Best-effort teardown of everything [`realize`] set up.
pub async fn teardown(state: &mut LinuxState) {
    if let Some(pid) = state.init_pid.take() {
        let pid = Pid::from_raw(pid as i32);
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            debug!("Init kill during teardown: {}", e);
        }
        if let Err(e) = waitpid(pid, Some(WaitPidFlag::empty())) {
            debug!("Init reap during teardown: {}", e);
        }
    }

    if let Some(attachment) = state.network.take() {
        network::detach(attachment).await;
    }

    if state.mounted {
        if let Err(e) = umount2(&state.rootfs, MntFlags::MNT_DETACH) {
            warn!("Overlay unmount during teardown: {}", e);
        }
        state.mounted = false;
    }

    if let Some(cgroup) = state.cgroup.take() {
        if let Err(e) = cgroup.destroy() {
            warn!("Cgroup removal during teardown: {}", e);
        }
    }
}

/// Mount the overlay for the container rootfs.
fn mount_overlay(lower: &[PathBuf], upper: &Path, work: &Path, merged: &Path) -> Result<()> {
    let options = overlay_options(lower, upper, work);
    debug!("Mounting overlay: {}", options);
    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| Error::io(format!("mount overlay at {}: {}", merged.display(), e)))
}

/// The overlay mount option string; lower dirs are stacked so that the last
/// declared layer wins, which overlayfs expresses as the first lowerdir.
fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lowerdir = lower
        .iter()
        .rev()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        work.display()
    )
}

/// Realise one non-root layer inside the merged tree.
fn mount_layer(merged: &Path, layer: &Layer) -> Result<()> {
    match layer {
        Layer::HostDir {
            source,
            destination,
            readonly,
        } if destination != "/" => {
            bind_into(merged, source, destination, *readonly)
        }
        Layer::Tmpfs {
            destination,
            size_bytes,
            mode,
        } => {
            let target = fs::path_join(merged, destination);
            fs::mkdir_p(&target)?;
            let options = format!("size={},mode={:o}", size_bytes, mode);
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some(options.as_str()),
            )
            .map_err(|e| Error::io(format!("mount tmpfs at {}: {}", target.display(), e)))
        }
        // Root host dirs and archives are already part of the overlay.
        _ => Ok(()),
    }
}

/// Bind-mount a host path to a destination below the merged tree.
fn bind_into(merged: &Path, source: &Path, destination: &str, readonly: bool) -> Result<()> {
    let target = fs::path_join(merged, destination);
    fs::mkdir_p(&target)?;
    mount(
        Some(source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::io(format!("bind {} at {}: {}", source.display(), target.display(), e)))?;

    if readonly {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::io(format!("remount {} read-only: {}", target.display(), e)))?;
    }
    Ok(())
}

/// Clone the container init child into fresh namespaces.
fn clone_init(merged: &Path, hostname: &str, policy: &SecurityPolicy) -> Result<u32> {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET;
    if policy.user_namespace() {
        flags |= CloneFlags::CLONE_NEWUSER;
    }

    let mut stack = vec![0u8; INIT_STACK_SIZE];
    let merged = merged.to_path_buf();
    let hostname = hostname.to_string();
    let policy = policy.clone();

    let pid = clone(
        Box::new(move || match init_child(&merged, &hostname, &policy) {
            Ok(()) => {
                // Park as pid 1 of the container until the engine kills us.
                loop {
                    pause();
                }
            }
            Err(e) => {
                eprintln!("container init setup failed: {}", e);
                1
            }
        }),
        &mut stack,
        flags,
        Some(libc::SIGCHLD),
    )
    .map_err(|e| Error::io(format!("clone container init: {}", e)))?;

    debug!("Container init clone returned pid {}", pid);
    Ok(pid.as_raw() as u32)
}

/// Guest-side setup, executed as pid 1 inside the fresh namespaces.
fn init_child(merged: &Path, hostname: &str, policy: &SecurityPolicy) -> Result<()> {
    sethostname(hostname).map_err(|e| Error::io(format!("sethostname: {}", e)))?;

    // Decouple mount propagation from the host before touching anything.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::io(format!("make / private: {}", e)))?;

    // pivot_root needs the new root to be a mount point.
    mount(
        Some(merged),
        merged,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::io(format!("self-bind new root: {}", e)))?;

    let old_root = merged.join(".pivot-old");
    fs::mkdir_p(&old_root)?;
    pivot_root(merged, &old_root).map_err(|e| Error::io(format!("pivot_root: {}", e)))?;
    chdir("/").map_err(|e| Error::io(format!("chdir /: {}", e)))?;
    umount2("/.pivot-old", MntFlags::MNT_DETACH)
        .map_err(|e| Error::io(format!("unmount old root: {}", e)))?;
    let _ = std::fs::remove_dir("/.pivot-old");

    mount_standard_filesystems()?;
    create_device_nodes()?;
    apply_masked_paths();
    apply_readonly_paths();
    apply_process_policy(policy)?;
    Ok(())
}

/// Mount the fixed filesystem set with the same options the runtime-spec
/// emitter declares.
fn mount_standard_filesystems() -> Result<()> {
    for (destination, fstype, source, options) in spec::STANDARD_MOUNTS {
        let target = Path::new(destination);
        fs::mkdir_p(target)?;

        let (flags, data) = split_mount_options(options);
        // The cgroup table entry is realised as the v2 hierarchy.
        let fstype = if fstype == "cgroup" { "cgroup2" } else { fstype };
        mount(
            Some(source),
            target,
            Some(fstype),
            flags,
            if data.is_empty() {
                None
            } else {
                Some(data.as_str())
            },
        )
        .map_err(|e| Error::io(format!("mount {} at {}: {}", fstype, destination, e)))?;
    }
    Ok(())
}

/// Split an fstab-style option list into mount flags and data options.
fn split_mount_options(options: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options.split(',') {
        match option {
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

/// Create the fixed device node set below /dev.
fn create_device_nodes() -> Result<()> {
    for (name, major, minor) in spec::STANDARD_DEVICES {
        let path = format!("/dev/{}", name);
        mknod(
            path.as_str(),
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(major as u64, minor as u64),
        )
        .map_err(|e| Error::io(format!("mknod {}: {}", path, e)))?;
    }
    Ok(())
}

/// Hide the masked kernel surfaces. Absent paths are skipped, and a
/// masking failure only degrades (the mount table is already private).
fn apply_masked_paths() {
    for path in spec::MASKED_PATHS {
        let target = Path::new(path);
        if !target.exists() {
            continue;
        }
        let result = if target.is_dir() {
            mount(
                Some("tmpfs"),
                target,
                Some("tmpfs"),
                MsFlags::MS_RDONLY,
                Some("size=0k"),
            )
        } else {
            mount(
                Some("/dev/null"),
                target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
        };
        if let Err(e) = result {
            warn!("Masking {} failed: {}", path, e);
        }
    }
}

/// Remount the fixed read-only path set.
fn apply_readonly_paths() {
    for path in spec::READONLY_PATHS {
        let target = Path::new(path);
        if !target.exists() {
            continue;
        }
        let bound = mount(
            Some(target),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        );
        let result = bound.and_then(|_| {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
        });
        if let Err(e) = result {
            warn!("Read-only remount of {} failed: {}", path, e);
        }
    }
}

/// Drop capabilities outside the policy set and apply no-new-privileges.
fn apply_process_policy(policy: &SecurityPolicy) -> Result<()> {
    let allowed = policy
        .capabilities()
        .iter()
        .filter_map(|capability| capability.to_string().parse::<caps::Capability>().ok())
        .collect::<std::collections::HashSet<_>>();

    for capability in caps::all() {
        if !allowed.contains(&capability) {
            caps::drop(None, caps::CapSet::Bounding, capability)
                .map_err(|e| Error::denied(format!("drop {}: {}", capability, e)))?;
        }
    }

    if policy.no_new_privs() {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(Error::denied("set no_new_privs"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn overlay_option_order() {
        let lower = vec![PathBuf::from("/base"), PathBuf::from("/extra")];
        let options = overlay_options(&lower, Path::new("/u"), Path::new("/w"));
        assert_eq!(options, "lowerdir=/extra:/base,upperdir=/u,workdir=/w");
    }

    #[test]
    fn mount_option_split() {
        let (flags, data) = split_mount_options("nosuid,noexec,nodev");
        assert_eq!(
            flags,
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV
        );
        assert!(data.is_empty());

        let (flags, data) = split_mount_options("nosuid,strictatime,mode=755,size=65536k");
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_STRICTATIME));
        assert_eq!(data, "mode=755,size=65536k");

        let (flags, data) =
            split_mount_options("nosuid,noexec,newinstance,ptmxmode=0666,mode=0620,gid=5");
        assert!(flags.contains(MsFlags::MS_NOEXEC));
        assert_eq!(data, "newinstance,ptmxmode=0666,mode=0620,gid=5");
    }

    #[tokio::test]
    async fn realize_rejects_empty_stack() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let err = realize(RealizeParams {
            id: "deadbeef0000",
            runtime_dir: dir.path(),
            hostname: "h",
            rootfs: None,
            extra_layers: &[],
            dns_csv: "",
            mounts: &[],
            limits: &ResourceLimits::default(),
            policy: &SecurityPolicy::default(),
            enable_network: false,
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Invalid);
        Ok(())
    }

    #[tokio::test]
    async fn realize_rejects_missing_layer_source() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let err = realize(RealizeParams {
            id: "deadbeef0001",
            runtime_dir: dir.path(),
            hostname: "h",
            rootfs: Some(Path::new("/definitely/not/here")),
            extra_layers: &[],
            dns_csv: "",
            mounts: &[],
            limits: &ResourceLimits::default(),
            policy: &SecurityPolicy::default(),
            enable_network: false,
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);
        Ok(())
    }
}
