//! Libvirt hypervisor backend.
//!
//! Wraps one libvirt connection. The library serializes mutations itself
//! only per-call, so all mutating operations go through the write half of
//! one RwLock and reads share the read half.

use tokio::sync::RwLock;
use tracing::{info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::dto::{VmSpec, VmState};
use crate::error::AgentError;

use super::interface::{DomainSummary, Hypervisor};

pub struct LibvirtHypervisor {
    conn: RwLock<Connect>,
}

impl LibvirtHypervisor {
    /// Open the libvirt connection. Failure here is fatal at startup.
    pub fn connect(uri: &str) -> Result<Self, AgentError> {
        info!(uri, "connecting to libvirt");
        let conn = Connect::open(Some(uri))
            .map_err(|e| AgentError::Hypervisor(format!("connect to libvirt at {uri}: {e}")))?;
        Ok(Self {
            conn: RwLock::new(conn),
        })
    }

    pub async fn close(&self) {
        let mut conn = self.conn.write().await;
        if let Err(e) = conn.close() {
            warn!(error = %e, "closing libvirt connection failed");
        }
    }

    /// Only an actual missing domain is `NotFound`; a broken connection or
    /// permission failure must surface as a hypervisor error so the
    /// breaker and the engine's crash-recovery paths see it as unhealthy.
    fn lookup(conn: &Connect, id: &str) -> Result<Domain, AgentError> {
        Domain::lookup_by_name(conn, id).map_err(|e| {
            if e.to_string().contains("Domain not found") {
                AgentError::NotFound(format!("domain {id}: {e}"))
            } else {
                AgentError::Hypervisor(format!("lookup domain {id}: {e}"))
            }
        })
    }

    fn map_state(state: sys::virDomainState) -> VmState {
        match state {
            sys::VIR_DOMAIN_RUNNING => VmState::Running,
            sys::VIR_DOMAIN_SHUTOFF => VmState::Stopped,
            sys::VIR_DOMAIN_PAUSED => VmState::Paused,
            _ => VmState::Error,
        }
    }
}

impl Hypervisor for LibvirtHypervisor {
    async fn define_and_launch(&self, spec: &VmSpec) -> Result<(), AgentError> {
        let conn = self.conn.write().await;
        let xml = domain_xml(spec);

        let domain = Domain::define_xml(&conn, &xml)
            .map_err(|e| AgentError::Hypervisor(format!("define domain {}: {e}", spec.name)))?;

        if let Err(e) = domain.create() {
            // Do not leave a defined-but-never-started domain behind.
            if let Err(undef) = domain.undefine() {
                warn!(
                    domain = %spec.name,
                    error = %undef,
                    "undefine after failed start also failed"
                );
            }
            return Err(AgentError::Hypervisor(format!(
                "start domain {}: {e}",
                spec.name
            )));
        }

        info!(domain = %spec.name, "domain defined and launched");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        let conn = self.conn.write().await;
        let domain = Self::lookup(&conn, id)?;

        let (state, _) = domain
            .get_state()
            .map_err(|e| AgentError::Hypervisor(format!("domain {id} state: {e}")))?;
        if state == sys::VIR_DOMAIN_RUNNING {
            return Ok(());
        }

        domain
            .create()
            .map_err(|e| AgentError::Hypervisor(format!("start domain {id}: {e}")))?;
        Ok(())
    }

    async fn stop(&self, id: &str, force: bool) -> Result<(), AgentError> {
        let conn = self.conn.write().await;
        let domain = Self::lookup(&conn, id)?;

        if force {
            domain
                .destroy()
                .map_err(|e| AgentError::Hypervisor(format!("destroy domain {id}: {e}")))?;
        } else {
            domain
                .shutdown()
                .map_err(|e| AgentError::Hypervisor(format!("shutdown domain {id}: {e}")))?;
        }
        Ok(())
    }

    async fn undefine(&self, id: &str) -> Result<(), AgentError> {
        let conn = self.conn.write().await;
        let domain = Self::lookup(&conn, id)?;
        domain
            .undefine()
            .map_err(|e| AgentError::Hypervisor(format!("undefine domain {id}: {e}")))?;
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<VmState, AgentError> {
        let conn = self.conn.read().await;
        let domain = Self::lookup(&conn, id)?;
        let (state, _) = domain
            .get_state()
            .map_err(|e| AgentError::Hypervisor(format!("domain {id} state: {e}")))?;
        Ok(Self::map_state(state))
    }

    async fn list(&self) -> Result<Vec<DomainSummary>, AgentError> {
        let conn = self.conn.read().await;
        let domains = conn
            .list_all_domains(
                sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE,
            )
            .map_err(|e| AgentError::Hypervisor(format!("list domains: {e}")))?;

        let mut summaries = Vec::with_capacity(domains.len());
        for domain in domains {
            let id = domain
                .get_name()
                .map_err(|e| AgentError::Hypervisor(format!("domain name: {e}")))?;
            let state = match domain.get_state() {
                Ok((state, _)) => Self::map_state(state),
                Err(e) => {
                    warn!(domain = %id, error = %e, "domain state unreadable");
                    VmState::Error
                }
            };
            summaries.push(DomainSummary { id, state });
        }
        Ok(summaries)
    }

    async fn lease_ip(&self, id: &str) -> Result<String, AgentError> {
        let conn = self.conn.read().await;
        let domain = Self::lookup(&conn, id)?;

        let interfaces = domain
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(|e| AgentError::Network(format!("domain {id} interfaces: {e}")))?;

        interfaces
            .iter()
            .flat_map(|iface| iface.addrs.iter())
            .map(|addr| addr.addr.clone())
            .next()
            .ok_or_else(|| AgentError::Network(format!("no DHCP lease for domain {id}")))
    }

    async fn ping(&self) -> Result<(), AgentError> {
        let conn = self.conn.read().await;
        conn.get_lib_version()
            .map(|_| ())
            .map_err(|e| AgentError::Hypervisor(format!("libvirt connection is down: {e}")))
    }
}

/// Domain XML for a KVM guest: qcow2 virtio disk, one virtio NIC on the
/// default NAT network, pty console.
fn domain_xml(spec: &VmSpec) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='GiB'>{ram_gib}</memory>
  <vcpu>{vcpu}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk_path}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'/>
  </devices>
</domain>
"#,
        name = spec.name,
        ram_gib = spec.ram_gib,
        vcpu = spec.vcpu,
        disk_path = spec.disk_path.display(),
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn domain_xml_carries_spec_fields() {
        let spec = VmSpec {
            name: "vm-a".into(),
            vcpu: 2,
            ram_gib: 4,
            disk_gib: 50,
            template: "ubuntu-22.04".into(),
            disk_path: PathBuf::from("/var/lib/ghost/images/disks/vm-a.qcow2"),
        };
        let xml = domain_xml(&spec);
        assert!(xml.contains("<name>vm-a</name>"));
        assert!(xml.contains("<memory unit='GiB'>4</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("file='/var/lib/ghost/images/disks/vm-a.qcow2'"));
        assert!(xml.contains("<source network='default'/>"));
    }
}
