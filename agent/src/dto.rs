//! Core data model: VM records, specs, resource snapshots, and the
//! built-in template table.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a VM.
///
/// `Paused` is observed-only (never set by an agent operation); `Error` is
/// terminal until an operator intervenes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Running,
    Stopped,
    Paused,
    Error,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Paused => "paused",
            VmState::Error => "error",
        }
    }
}

/// A managed VM as persisted in the registry.
///
/// The id is the caller-chosen name and doubles as the libvirt domain name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub vcpu: u32,
    pub ram_gib: u32,
    pub disk_gib: u32,
    pub template: String,
    pub disk_path: PathBuf,
    pub state: VmState,
    /// Empty until a DHCP lease is observed.
    pub ip: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the hypervisor needs to define and launch a domain.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub vcpu: u32,
    pub ram_gib: u32,
    pub disk_gib: u32,
    pub template: String,
    pub disk_path: PathBuf,
}

/// Owned copy of the resource ledger counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub total_cpu: u32,
    pub available_cpu: u32,
    pub reserved_cpu: u32,
    pub total_ram_gib: u32,
    pub available_ram_gib: u32,
    pub reserved_ram_gib: u32,
    pub total_disk_gib: u32,
    pub available_disk_gib: u32,
    pub reserved_disk_gib: u32,
}

impl ResourceSnapshot {
    pub fn can_fit(&self, vcpu: u32, ram_gib: u32, disk_gib: u32) -> bool {
        self.available_cpu >= vcpu
            && self.available_ram_gib >= ram_gib
            && self.available_disk_gib >= disk_gib
    }
}

/// Detailed per-VM status as returned by the status operation.
///
/// Utilization counters are reported as zero until the hypervisor counters
/// are wired up.
#[derive(Debug, Clone)]
pub struct VmStatusReport {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub vcpu: u32,
    pub ram_gib: u32,
    pub disk_gib: u32,
    pub ip: String,
    pub uptime_seconds: i64,
    pub cpu_usage_percent: f32,
    pub ram_usage_percent: f32,
}

/// Summary entry returned by the list operation.
#[derive(Debug, Clone)]
pub struct VmListEntry {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub ip: String,
    pub vcpu: u32,
    pub ram_gib: u32,
}

/// Built-in template table. Template resolution is not runtime
/// configuration: an agent build knows exactly which images it can serve.
pub const TEMPLATES: &[(&str, &str)] = &[
    (
        "ubuntu-22.04",
        "https://cloud-images.ubuntu.com/releases/22.04/release/ubuntu-22.04-server-cloudimg-amd64.img",
    ),
    (
        "ubuntu-20.04",
        "https://cloud-images.ubuntu.com/releases/20.04/release/ubuntu-20.04-server-cloudimg-amd64.img",
    ),
    (
        "debian-12",
        "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
    ),
    (
        "debian-11",
        "https://cloud.debian.org/images/cloud/bullseye/latest/debian-11-generic-amd64.qcow2",
    ),
];

/// Resolve a template tag to its download URL.
pub fn template_url(template: &str) -> Option<&'static str> {
    TEMPLATES
        .iter()
        .find(|(name, _)| *name == template)
        .map(|(_, url)| *url)
}
