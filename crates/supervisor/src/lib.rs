//! The process-wide PID-1 style supervisor.
//!
//! One supervisor exists per process, reference counted per container. The
//! first acquisition initialises the platform service (signal forwarding on
//! Linux, a kill-on-close Job Object on Windows), the last release tears it
//! down after terminating every still-tracked child. Internal bookkeeping is
//! guarded by a single mutex which is never held across blocking I/O.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use common::{Error, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use log::{debug, trace};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
};
use tokio::process::{Child, Command};

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option), build_fn(error = "common::Error"))]
/// Options describing one child process to spawn and track.
pub struct SpawnOptions {
    #[get = "pub"]
    /// Executable path.
    path: PathBuf,

    #[get = "pub"]
    /// Arguments, not including the executable itself.
    argv: Vec<String>,

    #[get = "pub"]
    /// `KEY=VALUE` environment entries; the parent environment is not
    /// inherited when any are given.
    envv: Vec<String>,

    #[get_copy = "pub"]
    /// Block inside `spawn` until the child exits.
    wait_for_exit: bool,

    #[get = "pub"]
    /// Working directory of the child.
    working_directory: Option<PathBuf>,

    #[get_copy = "pub"]
    /// Address-space limit in bytes, applied when no cgroup handles it.
    memory_limit: Option<u64>,

    #[get_copy = "pub"]
    /// Percent of one CPU period, 1 to 100. Enforced by the container
    /// cgroup; carried here so callers have a single options type.
    cpu_percent: Option<u32>,

    #[get_copy = "pub"]
    /// Maximum number of processes, applied when no cgroup handles it.
    process_limit: Option<u64>,

    #[get_copy = "pub"]
    /// Forward SIGTERM/SIGINT received by the supervisor to this child.
    forward_signals: bool,

    #[get_copy = "pub"]
    /// Run as this user id.
    uid: Option<u32>,

    #[get_copy = "pub"]
    /// Run as this group id.
    gid: Option<u32>,

    #[get_copy = "pub"]
    /// Let the child share the supervisor's stdio instead of piping to null.
    inherit_stdio: bool,

    #[get = "pub"]
    /// `cgroup.procs` file the child pid is written into after the spawn.
    cgroup_procs: Option<PathBuf>,

    #[get_copy = "pub"]
    /// Join the namespaces of this pid before the exec. The pid namespace
    /// applies to children spawned after entry.
    setns_pid: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
/// Opaque handle naming one tracked process.
pub struct ProcessHandle(u64);

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process-{}", self.0)
    }
}

struct Tracked {
    pid: u32,
    child: Option<Child>,
    exit_code: Option<i32>,
    forward_signals: bool,
}

#[derive(Default)]
struct State {
    holders: HashSet<String>,
    tracked: HashMap<u64, Tracked>,
    next_handle: u64,
    service: Option<PlatformService>,
}

#[cfg(unix)]
use unix::PlatformService;
#[cfg(windows)]
use windows::PlatformService;

/// The process-wide supervisor.
pub struct Supervisor {
    state: Arc<Mutex<State>>,
}

lazy_static! {
    static ref SUPERVISOR: Supervisor = Supervisor {
        state: Arc::new(Mutex::new(State::default())),
    };
}

/// Access the process-wide supervisor.
pub fn supervisor() -> &'static Supervisor {
    &SUPERVISOR
}

impl Supervisor {
    /// Acquire the supervisor for a container. Idempotent per container id;
    /// the platform service is initialised on the first holder.
    pub fn acquire(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        if !state.holders.insert(container_id.to_string()) {
            return Ok(());
        }
        if state.service.is_none() {
            debug!("Initialising supervisor service");
            state.service = Some(PlatformService::init(Arc::clone(&self.state))?);
        }
        Ok(())
    }

    /// Release the supervisor for a container. When the last holder is gone
    /// every still-tracked child is terminated and the platform service is
    /// torn down.
    pub async fn release(&self, container_id: &str) -> Result<()> {
        let (service, orphans) = {
            let mut state = self.lock()?;
            if !state.holders.remove(container_id) {
                return Ok(());
            }
            if !state.holders.is_empty() {
                return Ok(());
            }
            debug!("Last holder released, tearing the supervisor down");
            let orphans = state.tracked.drain().collect::<Vec<_>>();
            (state.service.take(), orphans)
        };

        for (handle, mut tracked) in orphans {
            trace!("Terminating leftover process {} (pid {})", handle, tracked.pid);
            if tracked.exit_code.is_none() {
                kill_tree(tracked.pid);
                if let Some(child) = tracked.child.as_mut() {
                    let _ = child.wait().await;
                }
            }
        }

        if let Some(service) = service {
            service.teardown();
        }
        Ok(())
    }

    /// Whether the container currently holds the supervisor.
    pub fn is_acquired(&self, container_id: &str) -> bool {
        self.lock()
            .map(|state| state.holders.contains(container_id))
            .unwrap_or(false)
    }

    /// Spawn a child and register it. The child is tracked before the handle
    /// is returned, so a concurrent teardown always sees it.
    pub async fn spawn(&self, options: &SpawnOptions) -> Result<ProcessHandle> {
        let mut command = Command::new(options.path());
        command.args(options.argv());
        if !options.envv().is_empty() {
            command.env_clear();
            for entry in options.envv() {
                if let Some((key, value)) = entry.split_once('=') {
                    command.env(key, value);
                }
            }
        }
        if let Some(dir) = options.working_directory() {
            command.current_dir(dir);
        }
        if options.inherit_stdio() {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        prepare_command(&mut command, options);

        let mut child = command
            .spawn()
            .map_err(|e| Error::from_io(format!("spawn {}", options.path().display()), e))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::io("spawned child has no pid"))?;

        if let Some(procs) = options.cgroup_procs() {
            if let Err(e) = std::fs::write(procs, pid.to_string()) {
                kill_tree(pid);
                let _ = child.wait().await;
                return Err(Error::from_io(
                    format!("assign pid {} to {}", pid, procs.display()),
                    e,
                ));
            }
        }

        register_with_service(&self.state, &child)?;

        let handle = {
            let mut state = self.lock()?;
            state.next_handle += 1;
            let handle = ProcessHandle(state.next_handle);
            state.tracked.insert(
                handle.0,
                Tracked {
                    pid,
                    child: Some(child),
                    exit_code: None,
                    forward_signals: options.forward_signals(),
                },
            );
            handle
        };
        trace!("Tracking {} (pid {})", handle, pid);

        if options.wait_for_exit() {
            let code = self.wait(handle).await?;
            let mut state = self.lock()?;
            state.tracked.insert(
                handle.0,
                Tracked {
                    pid,
                    child: None,
                    exit_code: Some(code),
                    forward_signals: false,
                },
            );
        }
        Ok(handle)
    }

    /// Block until the tracked child exits and return its exit code. At most
    /// one waiter may exist per handle; the entry is removed afterwards.
    pub async fn wait(&self, handle: ProcessHandle) -> Result<i32> {
        let mut child = {
            let mut state = self.lock()?;
            let tracked = state
                .tracked
                .get_mut(&handle.0)
                .ok_or_else(|| Error::not_found(format!("{} is not tracked", handle)))?;
            if let Some(code) = tracked.exit_code {
                state.tracked.remove(&handle.0);
                return Ok(code);
            }
            tracked
                .child
                .take()
                .ok_or_else(|| Error::invalid(format!("{} already has a waiter", handle)))?
        };

        let status = child.wait().await;
        let mut state = self.lock()?;
        state.tracked.remove(&handle.0);
        let status =
            status.map_err(|e| Error::from_io(format!("wait for {}", handle), e))?;
        Ok(exit_code_of(status))
    }

    /// Terminate the tracked child with SIGKILL (`TerminateProcess` on
    /// Windows). The entry stays tracked until waited or untracked.
    pub fn kill(&self, handle: ProcessHandle) -> Result<()> {
        let pid = {
            let state = self.lock()?;
            let tracked = state
                .tracked
                .get(&handle.0)
                .ok_or_else(|| Error::not_found(format!("{} is not tracked", handle)))?;
            if tracked.exit_code.is_some() {
                return Ok(());
            }
            tracked.pid
        };
        debug!("Killing {} (pid {})", handle, pid);
        kill_tree(pid);
        Ok(())
    }

    /// Drop the bookkeeping for a child without terminating it.
    pub fn untrack(&self, handle: ProcessHandle) -> Result<()> {
        let mut state = self.lock()?;
        state
            .tracked
            .remove(&handle.0)
            .ok_or_else(|| Error::not_found(format!("{} is not tracked", handle)))?;
        Ok(())
    }

    /// Number of currently tracked processes.
    pub fn tracked_count(&self) -> usize {
        self.lock().map(|state| state.tracked.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::io("supervisor state is poisoned"))
    }
}

/// Forward a termination request to every tracked child that opted in.
/// Invoked by the platform service when the supervisor process receives
/// SIGTERM or SIGINT.
fn forward_signal_to_tracked(state: &Arc<Mutex<State>>, signal: i32) {
    let pids = match state.lock() {
        Ok(state) => state
            .tracked
            .values()
            .filter(|t| t.forward_signals && t.exit_code.is_none())
            .map(|t| t.pid)
            .collect::<Vec<_>>(),
        Err(_) => return,
    };
    for pid in pids {
        trace!("Forwarding signal {} to pid {}", signal, pid);
        forward_signal(pid, signal);
    }
}

#[cfg(unix)]
use unix::{forward_signal, kill_tree, prepare_command, register_with_service};
#[cfg(windows)]
use windows::{forward_signal, kill_tree, prepare_command, register_with_service};

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use anyhow::Result;

    fn options(path: &str, argv: &[&str]) -> SpawnOptions {
        SpawnOptionsBuilder::default()
            .path(path)
            .argv(argv.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn spawn_wait_exit_code() -> Result<()> {
        let supervisor = supervisor();
        supervisor.acquire("test-spawn")?;

        let handle = supervisor
            .spawn(&options("sh", &["-c", "exit 7"]))
            .await?;
        assert_eq!(supervisor.wait(handle).await?, 7);

        supervisor.release("test-spawn").await?;
        Ok(())
    }

    #[tokio::test]
    async fn acquire_is_idempotent() -> Result<()> {
        let supervisor = supervisor();
        supervisor.acquire("test-idem")?;
        supervisor.acquire("test-idem")?;
        assert!(supervisor.is_acquired("test-idem"));

        supervisor.release("test-idem").await?;
        assert!(!supervisor.is_acquired("test-idem"));
        Ok(())
    }

    #[tokio::test]
    async fn kill_terminates() -> Result<()> {
        let supervisor = supervisor();
        supervisor.acquire("test-kill")?;

        let handle = supervisor.spawn(&options("sleep", &["30"])).await?;
        supervisor.kill(handle)?;
        let code = supervisor.wait(handle).await?;
        assert_eq!(code, 128 + libc::SIGKILL);

        supervisor.release("test-kill").await?;
        Ok(())
    }

    #[tokio::test]
    async fn single_waiter_enforced() -> Result<()> {
        let supervisor = supervisor();
        supervisor.acquire("test-waiter")?;

        let handle = supervisor.spawn(&options("sleep", &["5"])).await?;

        // Steal the child like a first waiter would, then observe the
        // second waiter being rejected.
        let first = {
            let mut state = supervisor.lock()?;
            state.tracked.get_mut(&handle.0).unwrap().child.take()
        };
        assert!(first.is_some());
        let err = supervisor.wait(handle).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Invalid);

        // Put it back so cleanup can terminate it.
        {
            let mut state = supervisor.lock()?;
            state.tracked.get_mut(&handle.0).unwrap().child = first;
        }
        supervisor.kill(handle)?;
        supervisor.wait(handle).await?;
        supervisor.release("test-waiter").await?;
        Ok(())
    }

    #[tokio::test]
    async fn wait_for_exit_records_code() -> Result<()> {
        let supervisor = supervisor();
        supervisor.acquire("test-wfe")?;

        let handle = supervisor
            .spawn(
                &SpawnOptionsBuilder::default()
                    .path("sh")
                    .argv(vec!["-c".to_string(), "exit 5".to_string()])
                    .wait_for_exit(true)
                    .build()?,
            )
            .await?;
        assert_eq!(supervisor.wait(handle).await?, 5);

        supervisor.release("test-wfe").await?;
        Ok(())
    }

    #[tokio::test]
    async fn forwarded_signal_reaches_opted_in_children() -> Result<()> {
        let supervisor = supervisor();
        supervisor.acquire("test-forward")?;

        let opted_in = supervisor
            .spawn(
                &SpawnOptionsBuilder::default()
                    .path("sleep")
                    .argv(vec!["30".to_string()])
                    .forward_signals(true)
                    .build()?,
            )
            .await?;
        let opted_out = supervisor.spawn(&options("sleep", &["1"])).await?;

        forward_signal_to_tracked(&supervisor.state, libc::SIGTERM);

        assert_eq!(supervisor.wait(opted_in).await?, 128 + libc::SIGTERM);
        assert_eq!(supervisor.wait(opted_out).await?, 0);

        supervisor.release("test-forward").await?;
        Ok(())
    }

    #[tokio::test]
    async fn untrack_forgets_without_killing() -> Result<()> {
        let supervisor = supervisor();
        supervisor.acquire("test-untrack")?;

        let handle = supervisor.spawn(&options("sleep", &["1"])).await?;
        let before = supervisor.tracked_count();
        supervisor.untrack(handle)?;
        assert_eq!(supervisor.tracked_count(), before - 1);

        let err = supervisor.wait(handle).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);

        supervisor.release("test-untrack").await?;
        Ok(())
    }
}
