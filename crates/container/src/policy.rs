//! The owned security policy of a container.
//!
//! One value describes both worlds: the Linux capability set plus
//! no-new-privileges bit, and the Windows integrity/app-container surface.
//! Backends consume the parts that apply to them.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use std::{collections::HashSet, ops::Deref, string::ToString};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

#[derive(Clone, Debug, Eq, PartialEq)]
/// A set of capabilities.
pub struct Capabilities(HashSet<Capability>);

impl Capabilities {
    /// Get all capabilities.
    pub fn all() -> Self {
        Self(Capability::iter().collect())
    }

    /// The empty set.
    pub fn none() -> Self {
        Self(HashSet::new())
    }

    /// Build a set from explicit members.
    pub fn from_members<I: IntoIterator<Item = Capability>>(members: I) -> Self {
        Self(members.into_iter().collect())
    }
}

impl Deref for Capabilities {
    type Target = HashSet<Capability>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        DEFAULT_CAPABILITIES.clone()
    }
}

impl From<&Capabilities> for Vec<String> {
    fn from(capabilities: &Capabilities) -> Self {
        capabilities.iter().map(ToString::to_string).collect()
    }
}

lazy_static! {
    static ref DEFAULT_CAPABILITIES: Capabilities = {
        let mut s = HashSet::new();
        s.insert(Capability::CapChown);
        s.insert(Capability::CapDacOverride);
        s.insert(Capability::CapFsetid);
        s.insert(Capability::CapFowner);
        s.insert(Capability::CapSetgid);
        s.insert(Capability::CapSetuid);
        s.insert(Capability::CapSetpcap);
        s.insert(Capability::CapNetBindService);
        s.insert(Capability::CapKill);
        Capabilities(s)
    };
}

#[derive(
    AsRefStr, IntoStaticStr, Copy, Clone, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq,
)]
#[strum(serialize_all = "shouty_snake_case")]
/// All available Linux capabilities.
pub enum Capability {
    // Override the restriction of changing file ownership and group ownership.
    CapChown,

    // Override all discretionary access control checks.
    CapDacOverride,

    // Override DAC restrictions on read and search of files and directories.
    CapDacReadSearch,

    // Override operations restricted to the file owner.
    CapFowner,

    // Override S_ISUID/S_ISGID restrictions on chmod and chown.
    CapFsetid,

    // Send signals to processes of other users.
    CapKill,

    // setgid(2) and setgroups(2) manipulation.
    CapSetgid,

    // set*uid(2) manipulation (including fsuid).
    CapSetuid,

    // Transfer and drop capabilities; modify securebits.
    CapSetpcap,

    // Modify S_IMMUTABLE and S_APPEND file attributes.
    CapLinuxImmutable,

    // Bind to TCP/UDP sockets below 1024.
    CapNetBindService,

    // Broadcasting and multicast listening.
    CapNetBroadcast,

    // Interface configuration, routing tables, firewalling.
    CapNetAdmin,

    // Raw and packet sockets.
    CapNetRaw,

    // Lock memory segments and shared memory.
    CapIpcLock,

    // Bypass System V IPC ownership checks.
    CapIpcOwner,

    // Load and unload kernel modules.
    CapSysModule,

    // ioperm/iopl and raw device access.
    CapSysRawio,

    // chroot(2).
    CapSysChroot,

    // ptrace(2) arbitrary processes.
    CapSysPtrace,

    // Configure process accounting.
    CapSysPacct,

    // Wide system administration surface, incl. mount and quotas.
    CapSysAdmin,

    // reboot(2) and kexec.
    CapSysBoot,

    // Scheduling priority manipulation for arbitrary processes.
    CapSysNice,

    // Override resource and quota limits.
    CapSysResource,

    // Set the system clock.
    CapSysTime,

    // Configure tty devices and vhangup(2).
    CapSysTtyConfig,

    // mknod(2) of device special files.
    CapMknod,

    // Establish leases on files.
    CapLease,

    // Write entries to the kernel audit log.
    CapAuditWrite,

    // Configure kernel audit.
    CapAuditControl,

    // Set arbitrary file capabilities.
    CapSetfcap,

    // Override mandatory access control.
    CapMacOverride,

    // Configure mandatory access control.
    CapMacAdmin,

    // Configure syslog.
    CapSyslog,

    // Trigger wakeups of the system.
    CapWakeAlarm,

    // Block system suspend.
    CapBlockSuspend,

    // Read the kernel audit log.
    CapAuditRead,

    // Privileged performance and observability operations via perf_events
    // and related kernel subsystems.
    CapPerfmon,

    // Create BPF maps and load BPF programs; CAP_PERFMON and CAP_NET_ADMIN
    // extend what the loaded programs may do.
    CapBpf,

    // Checkpoint/restore related operations. Introduced in kernel 5.9.
    CapCheckpointRestore,
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// Windows mandatory integrity level of the container processes.
pub enum IntegrityLevel {
    Untrusted,
    Low,
    Medium,
    High,
    System,
}

impl IntegrityLevel {
    /// The mandatory-integrity SID for this level.
    pub fn sid(&self) -> &'static str {
        match self {
            IntegrityLevel::Untrusted => "S-1-16-0",
            IntegrityLevel::Low => "S-1-16-4096",
            IntegrityLevel::Medium => "S-1-16-8192",
            IntegrityLevel::High => "S-1-16-12288",
            IntegrityLevel::System => "S-1-16-16384",
        }
    }
}

impl Default for IntegrityLevel {
    fn default() -> Self {
        IntegrityLevel::Medium
    }
}

#[derive(Builder, Clone, Debug, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into), build_fn(error = "common::Error"))]
/// The security policy owned by one container.
pub struct SecurityPolicy {
    #[get = "pub"]
    /// Capabilities retained inside the container.
    capabilities: Capabilities,

    #[get_copy = "pub"]
    /// Mandatory integrity level applied on Windows.
    integrity_level: IntegrityLevel,

    #[get = "pub"]
    /// Explicit mandatory-integrity label; derived from the level when
    /// unset.
    mandatory_label: Option<String>,

    #[get_copy = "pub"]
    /// Run inside an AppContainer profile on Windows.
    app_container: bool,

    #[get = "pub"]
    /// Additional SIDs attached to the container token.
    sids: Vec<String>,

    #[get_copy = "pub"]
    /// Whether a user namespace is part of the isolation set.
    user_namespace: bool,

    #[get_copy = "pub"]
    /// Set the no-new-privileges bit for container processes.
    no_new_privs: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::default(),
            integrity_level: IntegrityLevel::default(),
            mandatory_label: None,
            app_container: false,
            sids: Vec::new(),
            user_namespace: false,
            no_new_privs: true,
        }
    }
}

impl SecurityPolicy {
    /// The effective mandatory-integrity label.
    pub fn effective_label(&self) -> String {
        self.mandatory_label
            .clone()
            .unwrap_or_else(|| self.integrity_level.sid().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::str::FromStr;

    #[test]
    fn capability_names() {
        assert_eq!(&Capability::CapChown.to_string(), "CAP_CHOWN");
        assert_eq!(
            &Capability::CapNetBindService.to_string(),
            "CAP_NET_BIND_SERVICE"
        );
        assert_eq!(
            Capability::from_str("CAP_SYS_ADMIN").unwrap(),
            Capability::CapSysAdmin
        );
        assert_eq!(
            Capability::from_str("CAP_CHECKPOINT_RESTORE").unwrap(),
            Capability::CapCheckpointRestore
        );
    }

    #[test]
    fn all_capabilities_present() {
        assert_eq!(Capability::iter().count(), 41);
        assert_eq!(Capabilities::all().len(), 41);
        let all = Capabilities::all();
        assert!(all.contains(&Capability::CapPerfmon));
        assert!(all.contains(&Capability::CapBpf));
        assert!(all.contains(&Capability::CapCheckpointRestore));
    }

    #[test]
    fn default_set_is_conservative() {
        let defaults = Capabilities::default();
        assert!(defaults.contains(&Capability::CapChown));
        assert!(!defaults.contains(&Capability::CapSysAdmin));
        assert!(defaults.len() < Capabilities::all().len());
    }

    #[test]
    fn policy_label_derivation() -> Result<()> {
        let policy = SecurityPolicyBuilder::default().build()?;
        assert_eq!(policy.effective_label(), "S-1-16-8192");

        let policy = SecurityPolicyBuilder::default()
            .integrity_level(IntegrityLevel::Low)
            .build()?;
        assert_eq!(policy.effective_label(), "S-1-16-4096");

        let policy = SecurityPolicyBuilder::default()
            .mandatory_label(Some("S-1-16-1".to_string()))
            .build()?;
        assert_eq!(policy.effective_label(), "S-1-16-1");
        Ok(())
    }

    #[test]
    fn policy_defaults() -> Result<()> {
        let policy = SecurityPolicyBuilder::default().build()?;
        assert!(!policy.user_namespace());
        assert!(policy.no_new_privs());
        assert!(!policy.app_container());
        Ok(())
    }
}
