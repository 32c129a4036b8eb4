//! Container lifecycle.
//!
//! The state machine is `Created → Running → Destroying → Destroyed`;
//! `destroy` may be entered from any live state and is idempotent. All
//! processes belonging to a container are terminated before `destroy`
//! returns; teardown sub-steps are best-effort and never surface secondary
//! failures.

use crate::{hcs, policy::SecurityPolicy};
use agent::{AgentSession, Transport};
use common::{fs, Error, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use layers::Layer;
use log::{debug, error, info, warn};
use oci::{bundle, BindMount};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use strum::{AsRefStr, Display};
use supervisor::{supervisor, ProcessHandle, SpawnOptionsBuilder};

/// Chunk size for agent-mediated file transfers.
const TRANSFER_CHUNK: u64 = 1 << 20;

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// Lifecycle state of a container.
pub enum ContainerState {
    Created,
    Running,
    Destroying,
    Destroyed,
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// The isolation backend realising a container.
pub enum BackendKind {
    /// Native Linux namespaces and cgroups.
    Linux,
    /// Windows containers on Windows through HCS.
    Wcow,
    /// Linux containers on Windows inside a utility VM.
    Lcow,
}

impl Default for BackendKind {
    fn default() -> Self {
        #[cfg(windows)]
        {
            BackendKind::Wcow
        }
        #[cfg(not(windows))]
        {
            BackendKind::Linux
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Opaque handle to a process running in a container. Host-side processes
/// are tracked by the supervisor, guest-side ones by the agent.
pub enum ProcessToken {
    Host(ProcessHandle),
    Guest(u64),
}

#[derive(Builder, Clone, Copy, Debug, Default, CopyGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option), build_fn(error = "common::Error"))]
/// Resource limits applied to a container.
pub struct ResourceLimits {
    #[get_copy = "pub"]
    /// Memory ceiling in bytes.
    memory_max: Option<u64>,

    #[get_copy = "pub"]
    /// Percent of one CPU period, 1 to 100.
    cpu_percent: Option<u32>,

    #[get_copy = "pub"]
    /// Maximum number of processes.
    process_max: Option<u64>,
}

#[derive(Builder, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option), build_fn(error = "common::Error"))]
/// Options for [`Container::create`].
pub struct CreateOptions {
    #[get_copy = "pub"]
    /// The isolation backend; defaults to the platform-native one.
    backend: BackendKind,

    #[get = "pub"]
    /// Source rootfs: a directory for Linux/LCOW, the `windowsfilter`
    /// layer folder for WCOW. Optional for LCOW (utility VM only).
    rootfs: Option<PathBuf>,

    #[get = "pub"]
    /// Additional layers stacked on top of the rootfs.
    layers: Vec<Layer>,

    #[get = "pub"]
    /// Guest hostname; the container id when unset.
    hostname: Option<String>,

    #[get = "pub"]
    /// DNS servers as one string, separated by `;`, `,` or whitespace.
    dns_csv: String,

    #[get = "pub"]
    /// Custom bind mounts into the container.
    mounts: Vec<BindMount>,

    #[get = "pub"]
    /// Resource limits enforced by the backend.
    limits: ResourceLimits,

    #[get = "pub"]
    /// The owned security policy.
    policy: SecurityPolicy,

    #[get_copy = "pub"]
    /// Request Hyper-V isolation for WCOW.
    hyperv_isolation: bool,

    #[get = "pub"]
    /// Utility VM image path for LCOW.
    uvm_image_path: Option<PathBuf>,

    #[get_copy = "pub"]
    /// Attach bridge/endpoint networking.
    enable_network: bool,
}

/// Backend-specific realisation state.
#[derive(Debug)]
pub(crate) enum Backend {
    #[cfg(target_os = "linux")]
    Linux(crate::linux::LinuxState),
    Wcow(hcs::WcowState),
    Lcow(hcs::LcowState),
}

impl Backend {
    fn is_vm_backed(&self) -> bool {
        matches!(self, Backend::Lcow(_))
    }
}

lazy_static! {
    /// Ids issued during this process lifetime; creation never reuses one.
    static ref ISSUED_IDS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Generate a fresh 12 character lowercase hex container id, unique within
/// the process lifetime.
fn generate_id() -> String {
    loop {
        let full = uuid::Uuid::new_v4().to_simple().to_string();
        let id = full[..12].to_string();
        if let Ok(mut issued) = ISSUED_IDS.lock() {
            if issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

#[derive(Debug, Getters, CopyGetters)]
/// One isolated execution environment.
pub struct Container {
    #[get = "pub"]
    /// Unique identifier, 12 lowercase hex characters.
    id: String,

    #[get = "pub"]
    /// Private workspace; exists while the state is created or running.
    runtime_dir: PathBuf,

    #[get = "pub"]
    /// Host-visible rootfs path.
    rootfs: PathBuf,

    #[get = "pub"]
    /// Guest hostname.
    hostname: String,

    #[get_copy = "pub"]
    /// Whether the guest runs Windows.
    guest_is_windows: bool,

    #[get_copy = "pub"]
    /// Current lifecycle state.
    state: ContainerState,

    #[get = "pub"]
    /// Bundle paths; always populated for LCOW.
    bundle: Option<bundle::BundlePaths>,

    #[get = "pub"]
    /// The owned security policy.
    policy: SecurityPolicy,

    #[get = "pub"]
    /// Resource limits bound at creation.
    limits: ResourceLimits,

    backend: Backend,
    processes: Vec<ProcessToken>,
    supervisor_acquired: bool,
    agent: Option<Arc<AgentSession>>,
}

impl Container {
    /// Create a container. On success the container is in the `created`
    /// state with its runtime dir on disk and the supervisor acquired.
    pub async fn create(options: CreateOptions) -> Result<Self> {
        let id = generate_id();
        let runtime_dir = std::env::temp_dir().join(format!("containerv-{}", id));
        fs::mkdir_p(&runtime_dir)?;
        let hostname = options
            .hostname()
            .clone()
            .unwrap_or_else(|| id.clone());

        info!("Creating container {} ({} backend)", id, options.backend());

        supervisor().acquire(&id)?;

        let realized = Self::realize(&id, &runtime_dir, &hostname, &options).await;
        let (backend, rootfs, bundle) = match realized {
            Ok(parts) => parts,
            Err(e) => {
                error!("Creation of container {} failed: {}", id, e);
                let _ = supervisor().release(&id).await;
                let _ = fs::remove_dir_all(&runtime_dir);
                return Err(e);
            }
        };

        Ok(Self {
            guest_is_windows: matches!(options.backend(), BackendKind::Wcow),
            id,
            runtime_dir,
            rootfs,
            hostname,
            state: ContainerState::Created,
            bundle,
            policy: options.policy().clone(),
            limits: *options.limits(),
            backend,
            processes: Vec::new(),
            supervisor_acquired: true,
            agent: None,
        })
    }

    async fn realize(
        id: &str,
        runtime_dir: &Path,
        hostname: &str,
        options: &CreateOptions,
    ) -> Result<(Backend, PathBuf, Option<bundle::BundlePaths>)> {
        match options.backend() {
            BackendKind::Linux => {
                #[cfg(target_os = "linux")]
                {
                    let state = crate::linux::realize(crate::linux::RealizeParams {
                        id,
                        runtime_dir,
                        hostname,
                        rootfs: options.rootfs().as_deref(),
                        extra_layers: options.layers(),
                        dns_csv: options.dns_csv(),
                        mounts: options.mounts(),
                        limits: options.limits(),
                        policy: options.policy(),
                        enable_network: options.enable_network(),
                    })
                    .await?;
                    let rootfs = state.rootfs().clone();
                    Ok((Backend::Linux(state), rootfs, None))
                }
                #[cfg(not(target_os = "linux"))]
                {
                    Err(Error::invalid(
                        "the Linux namespace backend requires a Linux host",
                    ))
                }
            }
            BackendKind::Wcow => {
                let layer_folder = options
                    .rootfs()
                    .clone()
                    .ok_or_else(|| Error::invalid("WCOW requires a windowsfilter layer folder"))?;
                let state = hcs::realize_wcow(
                    id,
                    &layer_folder,
                    options.hyperv_isolation(),
                    options.enable_network(),
                )
                .await?;
                Ok((Backend::Wcow(state), layer_folder, None))
            }
            BackendKind::Lcow => {
                let image = options
                    .uvm_image_path()
                    .clone()
                    .ok_or_else(|| Error::invalid("LCOW requires a utility VM image path"))?;

                let paths = bundle::get_paths(runtime_dir);
                bundle::prepare_rootfs(&paths, options.rootfs().as_deref())?;
                bundle::prepare_rootfs_mountpoints(&paths)?;
                bundle::prepare_rootfs_standard_files(&paths, hostname, options.dns_csv())?;
                bundle::prepare_rootfs_dir(&paths, "/chef/staging", 0o755)?;

                let staging = runtime_dir.join("staging");
                fs::mkdir_p(&staging)?;

                let mut mounts = vec![BindMount::new(
                    staging.display().to_string(),
                    "/chef/staging",
                    false,
                )];
                mounts.extend(options.mounts().iter().cloned());

                let params = oci::SpecParamsBuilder::default()
                    .root_path(paths.rootfs_dir().display().to_string())
                    .hostname(hostname)
                    .mounts(mounts)
                    .dns_servers(
                        options
                            .dns_csv()
                            .split(|c: char| c == ';' || c == ',' || c.is_whitespace())
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect::<Vec<_>>(),
                    )
                    .build()?;
                bundle::write_config(&paths, &params.emit()?)?;

                let state =
                    hcs::realize_lcow(id, &paths, &image, options.enable_network()).await?;
                let rootfs = paths.rootfs_dir().clone();
                Ok((Backend::Lcow(state), rootfs, Some(paths)))
            }
        }
    }

    /// Spawn a process in the container and return an opaque token.
    pub async fn spawn(
        &mut self,
        path: &str,
        args: &[String],
        env: &[String],
    ) -> Result<ProcessToken> {
        if !matches!(
            self.state,
            ContainerState::Created | ContainerState::Running
        ) {
            return Err(Error::invalid(format!(
                "cannot spawn in state {}",
                self.state
            )));
        }

        let token = if self.backend.is_vm_backed() {
            let session = self.ensure_agent().await?;
            let id = match session.spawn(path, args, env, false).await {
                Ok(id) => id,
                Err(e) if session.is_dead() => {
                    // One transparent re-establishment per call.
                    debug!("Agent session died ({}), re-establishing once", e);
                    self.agent = None;
                    let session = self.ensure_agent().await?;
                    session.spawn(path, args, env, false).await?
                }
                Err(e) => return Err(e),
            };
            ProcessToken::Guest(id)
        } else {
            let mut builder = SpawnOptionsBuilder::default()
                .path(path)
                .argv(args.to_vec())
                .envv(env.to_vec())
                .forward_signals(true);
            #[cfg(target_os = "linux")]
            if let Backend::Linux(state) = &self.backend {
                if let Some(procs) = state.cgroup_procs() {
                    builder = builder.cgroup_procs(procs);
                }
                if let Some(pid) = state.init_pid() {
                    builder = builder.setns_pid(pid);
                }
            }
            let handle = supervisor().spawn(&builder.build()?).await.map_err(|e| {
                error!("Spawn of {} in container {} failed: {}", path, self.id, e);
                e
            })?;
            ProcessToken::Host(handle)
        };

        self.processes.push(token);
        self.state = ContainerState::Running;
        Ok(token)
    }

    /// Block until the process behind `token` exits and return its exit
    /// code.
    pub async fn wait(&mut self, token: ProcessToken) -> Result<i32> {
        let code = match token {
            ProcessToken::Host(handle) => supervisor().wait(handle).await?,
            ProcessToken::Guest(id) => {
                let session = self.ensure_agent().await?;
                session.wait(id).await?
            }
        };
        self.processes.retain(|t| *t != token);
        Ok(code)
    }

    /// Terminate the process behind `token`.
    pub async fn kill(&mut self, token: ProcessToken) -> Result<()> {
        match token {
            ProcessToken::Host(handle) => supervisor().kill(handle),
            ProcessToken::Guest(id) => {
                let session = self.ensure_agent().await?;
                session.kill(id, false).await
            }
        }
    }

    /// Copy a host file into the container.
    pub async fn upload(&mut self, host_path: &Path, guest_path: &str) -> Result<()> {
        if self.backend.is_vm_backed() {
            let bytes = std::fs::read(host_path)
                .map_err(|e| Error::from_io(format!("read {}", host_path.display()), e))?;
            let session = self.ensure_agent().await?;
            let mut offset = 0usize;
            while offset < bytes.len() || bytes.is_empty() {
                let end = (offset + TRANSFER_CHUNK as usize).min(bytes.len());
                session
                    .file_write(guest_path, &bytes[offset..end], offset > 0, true)
                    .await?;
                if end == bytes.len() {
                    break;
                }
                offset = end;
            }
            return Ok(());
        }

        let target = self.guest_path_on_host(guest_path)?;
        if let Some(parent) = target.parent() {
            fs::mkdir_p(parent)?;
        }
        fs::copy_file(host_path, &target).map(|_| ())
    }

    /// Copy a file out of the container onto the host.
    pub async fn download(&mut self, guest_path: &str, host_path: &Path) -> Result<()> {
        if self.backend.is_vm_backed() {
            let session = self.ensure_agent().await?;
            let mut bytes = Vec::new();
            loop {
                let (chunk, eof) = session
                    .file_read(guest_path, bytes.len() as u64, TRANSFER_CHUNK)
                    .await?;
                bytes.extend_from_slice(&chunk);
                if eof || chunk.is_empty() {
                    break;
                }
            }
            return std::fs::write(host_path, bytes)
                .map_err(|e| Error::from_io(format!("write {}", host_path.display()), e));
        }

        let source = self.guest_path_on_host(guest_path)?;
        fs::copy_file(&source, host_path).map(|_| ())
    }

    /// Tear the container down. Idempotent; every tracked process is
    /// terminated before this returns and sub-step failures are recorded
    /// but not surfaced.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.state == ContainerState::Destroyed {
            return Ok(());
        }
        info!("Destroying container {}", self.id);
        self.state = ContainerState::Destroying;

        for token in std::mem::take(&mut self.processes) {
            match token {
                ProcessToken::Host(handle) => {
                    if let Err(e) = supervisor().kill(handle) {
                        debug!("Kill of {} during teardown: {}", handle, e);
                    }
                    if let Err(e) = supervisor().wait(handle).await {
                        debug!("Wait for {} during teardown: {}", handle, e);
                    }
                }
                ProcessToken::Guest(id) => {
                    if let Some(session) = self.agent.as_ref() {
                        if !session.is_dead() {
                            if let Err(e) = session.kill(id, true).await {
                                debug!("Guest kill of job {} during teardown: {}", id, e);
                            }
                        }
                    }
                }
            }
        }
        self.agent = None;

        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Linux(state) => crate::linux::teardown(state).await,
            Backend::Wcow(state) => hcs::teardown(state.common_mut()).await,
            Backend::Lcow(state) => hcs::teardown(state.common_mut()).await,
        }

        if self.supervisor_acquired {
            if let Err(e) = supervisor().release(&self.id).await {
                warn!("Supervisor release for {} failed: {}", self.id, e);
            }
            self.supervisor_acquired = false;
        }

        if let Err(e) = fs::remove_dir_all(&self.runtime_dir) {
            warn!("Runtime dir removal for {} failed: {}", self.id, e);
        }

        self.state = ContainerState::Destroyed;
        Ok(())
    }

    /// Resolve a guest path against the host view of the rootfs.
    fn guest_path_on_host(&self, guest_path: &str) -> Result<PathBuf> {
        let normalized = guest_path.replace('\\', "/");
        if normalized.split('/').any(|segment| segment == "..") {
            return Err(Error::invalid(format!(
                "guest path {} escapes the rootfs",
                guest_path
            )));
        }
        Ok(fs::path_join(&self.rootfs, &normalized))
    }

    /// Lazily establish the agent session for a VM-backed container.
    async fn ensure_agent(&mut self) -> Result<Arc<AgentSession>> {
        if let Some(session) = self.agent.as_ref() {
            if !session.is_dead() {
                return Ok(Arc::clone(session));
            }
            self.agent = None;
        }

        let transport: Box<dyn Transport> = match &mut self.backend {
            Backend::Lcow(state) => hcs::start_agent(state).await?,
            _ => {
                return Err(Error::invalid(
                    "only VM-backed containers carry an agent session",
                ))
            }
        };
        let session = Arc::new(AgentSession::start(transport).await?);
        self.agent = Some(Arc::clone(&session));
        Ok(session)
    }
}
