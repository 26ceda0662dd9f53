//! Minimal OCI runtime-spec `config.json` serialization: only the fields
//! this crate's own bundles ever need are modeled, not the full spec.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub(crate) struct OciConfig {
    #[serde(rename = "ociVersion")]
    pub oci_version: &'static str,
    pub root: Root,
    pub mounts: Vec<Mount>,
    pub process: Process,
    pub hostname: String,
    pub linux: Linux,
}

#[derive(Debug, Serialize)]
pub(crate) struct Root {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct Mount {
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub options: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Process {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: Capabilities,
    pub rlimits: Vec<Rlimit>,
    #[serde(rename = "noNewPrivileges")]
    pub no_new_privileges: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct User {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Serialize)]
pub(crate) struct Capabilities {
    pub bounding: Vec<&'static str>,
    pub effective: Vec<&'static str>,
    pub inheritable: Vec<&'static str>,
    pub permitted: Vec<&'static str>,
    pub ambient: Vec<&'static str>,
}

impl Default for Capabilities {
    fn default() -> Self {
        let granted = vec!["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"];
        Self {
            bounding: granted.clone(),
            effective: granted.clone(),
            inheritable: granted.clone(),
            permitted: granted,
            ambient: vec!["CAP_NET_BIND_SERVICE"],
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Rlimit {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub hard: u64,
    pub soft: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct Linux {
    pub namespaces: Vec<Namespace>,
    #[serde(rename = "uidMappings")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(rename = "gidMappings")]
    pub gid_mappings: Vec<IdMapping>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Namespace {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct IdMapping {
    #[serde(rename = "hostID")]
    pub host_id: u32,
    #[serde(rename = "containerID")]
    pub container_id: u32,
    pub size: u32,
}

/// Standard Linux system mounts every bundle gets regardless of caller
/// input, in the order the runtime expects them.
pub(crate) fn system_mounts() -> Vec<Mount> {
    vec![
        Mount {
            destination: "/proc".into(),
            source: Some("proc".into()),
            fs_type: "proc".into(),
            options: vec![],
        },
        Mount {
            destination: "/dev".into(),
            source: Some("tmpfs".into()),
            fs_type: "tmpfs".into(),
            options: vec!["nosuid".into(), "strictatime".into(), "mode=755".into(), "size=65536k".into()],
        },
        Mount {
            destination: "/dev/pts".into(),
            source: Some("devpts".into()),
            fs_type: "devpts".into(),
            options: vec![
                "nosuid".into(),
                "noexec".into(),
                "newinstance".into(),
                "ptmxmode=0666".into(),
                "mode=0620".into(),
            ],
        },
        Mount {
            destination: "/dev/shm".into(),
            source: Some("shm".into()),
            fs_type: "tmpfs".into(),
            options: vec!["nosuid".into(), "noexec".into(), "nodev".into(), "mode=1777".into(), "size=65536k".into()],
        },
        Mount {
            destination: "/dev/mqueue".into(),
            source: Some("mqueue".into()),
            fs_type: "mqueue".into(),
            options: vec!["nosuid".into(), "noexec".into(), "nodev".into()],
        },
        Mount {
            destination: "/sys".into(),
            source: Some("/sys".into()),
            fs_type: "none".into(),
            options: vec!["rbind".into(), "nosuid".into(), "noexec".into(), "nodev".into(), "ro".into()],
        },
        Mount {
            destination: "/sys/fs/cgroup".into(),
            source: Some("cgroup".into()),
            fs_type: "cgroup".into(),
            options: vec!["nosuid".into(), "noexec".into(), "nodev".into(), "relatime".into(), "ro".into()],
        },
    ]
}

/// Serialize `env` deterministically, `KEY=value` per the spec's wire
/// format, sorted so bundle output is stable across runs.
pub(crate) fn env_lines(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}
