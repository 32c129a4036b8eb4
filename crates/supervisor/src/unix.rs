//! Linux/Unix side of the supervisor service.
//!
//! Children are placed into their own session so the whole process group can
//! be terminated with one killpg. Resource limits fall back to rlimits only
//! when no cgroup has been provided for the child.

use crate::{forward_signal_to_tracked, SpawnOptions, State};
use common::{Error, Result};
use log::trace;
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use std::{
    io,
    sync::{Arc, Mutex},
};
use tokio::{
    process::{Child, Command},
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};

pub(crate) struct PlatformService {
    forwarder: JoinHandle<()>,
}

impl PlatformService {
    /// Reap leftover orphans, then install the SIGTERM/SIGINT forwarder
    /// over the tracked set.
    pub(crate) fn init(state: Arc<Mutex<State>>) -> Result<Self> {
        reap_orphans();

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::from_io("install SIGTERM handler", e))?;
        let mut int = signal(SignalKind::interrupt())
            .map_err(|e| Error::from_io("install SIGINT handler", e))?;

        let forwarder = tokio::spawn(async move {
            loop {
                let signum = tokio::select! {
                    _ = term.recv() => libc::SIGTERM,
                    _ = int.recv() => libc::SIGINT,
                };
                trace!("Forwarding signal {} to the tracked set", signum);
                forward_signal_to_tracked(&state, signum);
            }
        });
        Ok(Self { forwarder })
    }

    pub(crate) fn teardown(self) {
        self.forwarder.abort();
    }
}

/// Configure uid/gid, a fresh session and fallback rlimits on the command.
pub(crate) fn prepare_command(command: &mut Command, options: &SpawnOptions) {
    if let Some(uid) = options.uid() {
        command.uid(uid);
    }
    if let Some(gid) = options.gid() {
        command.gid(gid);
    }

    let memory_limit = options.memory_limit();
    let process_limit = options.process_limit();
    let use_rlimits = options.cgroup_procs().is_none();
    let setns_pid = options.setns_pid();

    unsafe {
        command.pre_exec(move || {
            // A new session makes the child the leader of its own process
            // group; kill_tree relies on that.
            nix::unistd::setsid().map_err(io_error)?;
            if let Some(pid) = setns_pid {
                join_namespaces(pid)?;
            }
            if use_rlimits {
                use nix::sys::resource::{setrlimit, Resource};
                if let Some(limit) = memory_limit {
                    setrlimit(Resource::RLIMIT_AS, limit, limit).map_err(io_error)?;
                }
                if let Some(limit) = process_limit {
                    setrlimit(Resource::RLIMIT_NPROC, limit, limit).map_err(io_error)?;
                }
            }
            Ok(())
        });
    }
}

fn io_error(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Enter the namespaces of `pid`, user namespace first so the others are
/// joinable without privileges inside it. Namespace files that do not exist
/// are skipped.
fn join_namespaces(pid: u32) -> io::Result<()> {
    use nix::sched::{setns, CloneFlags};
    use std::os::unix::io::AsRawFd;

    for name in ["user", "mnt", "net", "uts", "ipc", "pid"] {
        let path = format!("/proc/{}/ns/{}", pid, name);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        setns(file.as_raw_fd(), CloneFlags::empty()).map_err(io_error)?;
    }
    nix::unistd::chdir("/").map_err(io_error)?;
    Ok(())
}

/// Collect zombies reparented to this process. Only an init process owns
/// every child in its pid namespace; anywhere else a wide waitpid would
/// steal children that belong to other code in the process.
fn reap_orphans() {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    if std::process::id() != 1 {
        return;
    }
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => trace!("Reaped orphan: {:?}", status),
        }
    }
}

/// Nothing to register on Unix; the process group is the kill-on-close
/// mechanism.
pub(crate) fn register_with_service(_state: &Arc<Mutex<State>>, _child: &Child) -> Result<()> {
    Ok(())
}

/// SIGKILL the child's whole process group, falling back to the single pid
/// when the group is already gone.
pub(crate) fn kill_tree(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    if killpg(pid, Signal::SIGKILL).is_err() {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

/// Deliver one forwarded signal to a child's process group, or to the
/// child alone while it is still between fork and setsid.
pub(crate) fn forward_signal(pid: u32, signum: i32) {
    if let Ok(signal) = Signal::try_from(signum) {
        let pid = Pid::from_raw(pid as i32);
        if killpg(pid, signal).is_err() {
            let _ = kill(pid, signal);
        }
    }
}
