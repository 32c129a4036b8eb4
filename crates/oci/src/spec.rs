//! OCI runtime-spec emission.
//!
//! Takes a [`SpecParams`] value and produces the compact `config.json`
//! document. Callers never concatenate JSON themselves; every field decision
//! lives here.

use crate::runtime::{
    Linux, LinuxDevice, LinuxDeviceCgroup, LinuxNamespace, LinuxResources, Mount, Process, Root,
    Spec, User,
};
use common::{Error, Result};
use derive_builder::Builder;
use getset::Getters;
use std::collections::HashMap;

/// The `PATH` injected when the caller's environment has none.
pub const DEFAULT_PATH: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// destination, type, source, options for the fixed mount set.
pub const STANDARD_MOUNTS: [(&str, &str, &str, &str); 7] = [
    ("/proc", "proc", "proc", "nosuid,noexec,nodev"),
    ("/sys", "sysfs", "sysfs", "nosuid,noexec,nodev,ro"),
    (
        "/sys/fs/cgroup",
        "cgroup",
        "cgroup",
        "nosuid,noexec,nodev,relatime",
    ),
    ("/dev", "tmpfs", "tmpfs", "nosuid,strictatime,mode=755,size=65536k"),
    (
        "/dev/pts",
        "devpts",
        "devpts",
        "nosuid,noexec,newinstance,ptmxmode=0666,mode=0620,gid=5",
    ),
    (
        "/dev/shm",
        "tmpfs",
        "shm",
        "nosuid,noexec,nodev,mode=1777,size=65536k",
    ),
    ("/dev/mqueue", "mqueue", "mqueue", "nosuid,noexec,nodev"),
];

/// name, major, minor for the fixed device set; all are char devices with
/// mode 0666 owned by root.
pub const STANDARD_DEVICES: [(&str, i64, i64); 6] = [
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

pub const MASKED_PATHS: [&str; 6] = [
    "/proc/kcore",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

pub const READONLY_PATHS: [&str; 6] = [
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

const NAMESPACES: [&str; 5] = ["pid", "ipc", "uts", "mount", "network"];

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into), build_fn(error = "common::Error"))]
/// One custom bind mount requested by the caller.
pub struct BindMount {
    #[get = "pub"]
    /// Host path.
    source: String,

    #[get = "pub"]
    /// Path inside the container.
    destination: String,

    #[get = "pub"]
    /// Mount read-only.
    readonly: bool,
}

impl BindMount {
    /// Shorthand for a writable bind mount.
    pub fn new<S: Into<String>, D: Into<String>>(source: S, destination: D, readonly: bool) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            readonly,
        }
    }
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into), build_fn(error = "common::Error"))]
/// Inputs to the spec emitter.
pub struct SpecParams {
    #[get = "pub"]
    /// Host path of the container root filesystem. Required.
    root_path: String,

    #[get = "pub"]
    /// JSON array string naming the process argv; empty means `[]`.
    args_json: String,

    #[get = "pub"]
    /// Ordered `KEY=VALUE` environment entries.
    envv: Vec<String>,

    #[get = "pub"]
    /// Working directory of the process; `/` when unset.
    cwd: Option<String>,

    #[get = "pub"]
    /// Guest hostname; emitted only when non-empty.
    hostname: String,

    #[get = "pub"]
    /// Custom bind mounts appended after the standard set.
    mounts: Vec<BindMount>,

    #[get = "pub"]
    /// DNS servers carried alongside the document for resolv.conf
    /// synthesis.
    dns_servers: Vec<String>,
}

impl SpecParams {
    /// Build the typed spec document.
    pub fn to_spec(&self) -> Result<Spec> {
        if self.root_path.is_empty() {
            return Err(Error::invalid("root path must not be empty"));
        }

        let args: Vec<String> = if self.args_json.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&self.args_json)
                .map_err(|e| Error::invalid(format!("args is not a JSON array: {}", e)))?
        };

        let mut env = Vec::with_capacity(self.envv.len() + 1);
        if !has_path(&self.envv) {
            env.push(DEFAULT_PATH.to_string());
        }
        env.extend(self.envv.iter().cloned());

        let mut mounts = STANDARD_MOUNTS
            .iter()
            .map(|(destination, mount_type, source, options)| Mount {
                destination: destination.to_string(),
                mount_type: Some(mount_type.to_string()),
                source: Some(source.to_string()),
                options: Some(options.split(',').map(str::to_string).collect()),
            })
            .collect::<Vec<_>>();
        for bind in &self.mounts {
            if bind.source().is_empty() || bind.destination().is_empty() {
                continue;
            }
            let mode = if *bind.readonly() { "ro" } else { "rw" };
            mounts.push(Mount {
                destination: bind.destination().clone(),
                mount_type: Some("bind".to_string()),
                source: Some(bind.source().clone()),
                options: Some(vec![
                    "rbind".to_string(),
                    "rprivate".to_string(),
                    mode.to_string(),
                ]),
            });
        }

        let devices = STANDARD_DEVICES
            .iter()
            .map(|(name, major, minor)| LinuxDevice {
                path: format!("/dev/{}", name),
                device_type: "c".to_string(),
                major: *major,
                minor: *minor,
                file_mode: 0o666,
                uid: 0,
                gid: 0,
            })
            .collect::<Vec<_>>();
        let device_cgroups = STANDARD_DEVICES
            .iter()
            .map(|(_, major, minor)| LinuxDeviceCgroup {
                allow: true,
                device_type: Some("c".to_string()),
                major: Some(*major),
                minor: Some(*minor),
                access: Some("rwm".to_string()),
            })
            .collect::<Vec<_>>();

        let mut annotations = HashMap::new();
        annotations.insert("com.chef.lcow".to_string(), "true".to_string());
        annotations.insert("com.chef.gcs".to_string(), "true".to_string());
        annotations.insert("com.chef.rootfs".to_string(), self.root_path.clone());

        Ok(Spec {
            oci_version: "1.0.2".to_string(),
            process: Some(Process {
                terminal: false,
                user: User { uid: 0, gid: 0 },
                args,
                env,
                cwd: self.cwd.clone().unwrap_or_else(|| "/".to_string()),
            }),
            root: Some(Root {
                path: self.root_path.clone(),
                readonly: false,
            }),
            hostname: if self.hostname.is_empty() {
                None
            } else {
                Some(self.hostname.clone())
            },
            mounts: Some(mounts),
            annotations: Some(annotations),
            linux: Some(Linux {
                namespaces: Some(
                    NAMESPACES
                        .iter()
                        .map(|n| LinuxNamespace {
                            namespace_type: n.to_string(),
                        })
                        .collect(),
                ),
                devices: Some(devices),
                resources: Some(LinuxResources {
                    devices: Some(device_cgroups),
                    memory: None,
                    cpu: None,
                    pids: None,
                }),
                masked_paths: Some(MASKED_PATHS.iter().map(|p| p.to_string()).collect()),
                readonly_paths: Some(READONLY_PATHS.iter().map(|p| p.to_string()).collect()),
            }),
        })
    }

    /// Emit the compact `config.json` text.
    pub fn emit(&self) -> Result<String> {
        let spec = self.to_spec()?;
        serde_json::to_string(&spec).map_err(|e| Error::invalid(format!("serialize spec: {}", e)))
    }
}

/// Whether the environment carries a `PATH` entry, matched case-insensitively
/// against the key part.
fn has_path(envv: &[String]) -> bool {
    envv.iter().any(|entry| {
        entry
            .split_once('=')
            .map(|(key, _)| key.eq_ignore_ascii_case("PATH"))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn minimal() -> SpecParams {
        SpecParamsBuilder::default()
            .root_path("/c/rootfs")
            .args_json("[\"/bin/sh\"]")
            .hostname("h")
            .build()
            .unwrap()
    }

    #[test]
    fn minimal_document() -> Result<()> {
        let text = minimal().emit()?;
        let spec: Spec = serde_json::from_str(&text)?;

        assert_eq!(spec.oci_version, "1.0.2");
        assert_eq!(spec.hostname.as_deref(), Some("h"));

        let process = spec.process.unwrap();
        assert_eq!(process.args, vec!["/bin/sh"]);
        assert!(process.env[0].starts_with("PATH="));
        assert_eq!(process.cwd, "/");
        assert!(!process.terminal);
        assert_eq!(process.user.uid, 0);

        let namespaces = spec.linux.unwrap().namespaces.unwrap();
        assert_eq!(namespaces.len(), 5);
        Ok(())
    }

    #[test]
    fn env_with_path_is_verbatim() -> Result<()> {
        let params = SpecParamsBuilder::default()
            .root_path("/c/rootfs")
            .envv(vec!["PATH=/x".to_string(), "FOO=1".to_string()])
            .build()?;
        let spec = params.to_spec()?;

        assert_eq!(spec.process.unwrap().env, vec!["PATH=/x", "FOO=1"]);
        Ok(())
    }

    #[test]
    fn env_path_match_is_case_insensitive() -> Result<()> {
        let params = SpecParamsBuilder::default()
            .root_path("/c/rootfs")
            .envv(vec!["path=/y".to_string()])
            .build()?;
        let spec = params.to_spec()?;

        assert_eq!(spec.process.unwrap().env, vec!["path=/y"]);
        Ok(())
    }

    #[test]
    fn standard_mounts_exactly_once_and_ordered() -> Result<()> {
        let params = SpecParamsBuilder::default()
            .root_path("/c/rootfs")
            .mounts(vec![
                BindMount::new("/host/a", "/a", false),
                BindMount::new("/host/b", "/b", true),
            ])
            .build()?;
        let spec = params.to_spec()?;
        let mounts = spec.mounts.unwrap();

        for (destination, _, _, _) in STANDARD_MOUNTS {
            assert_eq!(
                mounts.iter().filter(|m| m.destination == destination).count(),
                1,
                "{} must appear exactly once",
                destination
            );
        }

        let customs = &mounts[STANDARD_MOUNTS.len()..];
        assert_eq!(customs[0].destination, "/a");
        assert_eq!(
            customs[0].options.as_ref().unwrap(),
            &vec!["rbind".to_string(), "rprivate".to_string(), "rw".to_string()]
        );
        assert_eq!(customs[1].destination, "/b");
        assert_eq!(
            customs[1].options.as_ref().unwrap(),
            &vec!["rbind".to_string(), "rprivate".to_string(), "ro".to_string()]
        );
        Ok(())
    }

    #[test]
    fn empty_bind_entries_skipped() -> Result<()> {
        let params = SpecParamsBuilder::default()
            .root_path("/c/rootfs")
            .mounts(vec![
                BindMount::new("", "/a", false),
                BindMount::new("/host", "", false),
            ])
            .build()?;
        let spec = params.to_spec()?;

        assert_eq!(spec.mounts.unwrap().len(), STANDARD_MOUNTS.len());
        Ok(())
    }

    #[test]
    fn empty_root_path_is_invalid() {
        let err = SpecParamsBuilder::default()
            .build()
            .unwrap()
            .to_spec()
            .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Invalid);
    }

    #[test]
    fn malformed_args_is_invalid() {
        let err = SpecParamsBuilder::default()
            .root_path("/c/rootfs")
            .args_json("not json")
            .build()
            .unwrap()
            .to_spec()
            .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Invalid);
    }

    #[test]
    fn devices_and_paths() -> Result<()> {
        let spec = minimal().to_spec()?;
        let linux = spec.linux.unwrap();

        let devices = linux.devices.unwrap();
        assert_eq!(devices.len(), 6);
        assert!(devices.iter().all(|d| d.device_type == "c"));
        assert!(devices.iter().any(|d| d.path == "/dev/urandom"));

        let allowed = linux.resources.unwrap().devices.unwrap();
        assert_eq!(allowed.len(), devices.len());
        assert!(allowed.iter().all(|d| d.allow));

        assert_eq!(linux.masked_paths.unwrap().len(), 6);
        assert_eq!(linux.readonly_paths.unwrap().len(), 6);
        Ok(())
    }

    #[test]
    fn annotations_present() -> Result<()> {
        let spec = minimal().to_spec()?;
        let annotations = spec.annotations.unwrap();
        assert_eq!(annotations.get("com.chef.lcow").map(String::as_str), Some("true"));
        assert_eq!(annotations.get("com.chef.gcs").map(String::as_str), Some("true"));
        assert_eq!(
            annotations.get("com.chef.rootfs").map(String::as_str),
            Some("/c/rootfs")
        );
        Ok(())
    }

    #[test]
    fn output_is_compact() -> Result<()> {
        let text = minimal().emit()?;
        assert!(!text.contains(": "));
        assert!(!text.contains('\n'));
        Ok(())
    }
}
