//! VM lifecycle engine.
//!
//! Composes the ledger, image cache, disk provisioner, hypervisor,
//! lease watcher, and registry into the create / delete / start / stop /
//! status / list operations. Create is a forward sequence with
//! prefix-rollback: each completed step pushes an undo onto a stack, and
//! any later failure runs the stack in reverse, best-effort and logged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::disks::OverlayStore;
use crate::dto::{template_url, VmListEntry, VmRecord, VmSpec, VmState, VmStatusReport};
use crate::error::AgentError;
use crate::hypervisor::Hypervisor;
use crate::images::{ImageCache, ImageFetcher};
use crate::ledger::ResourceLedger;
use crate::network::LeaseWatcher;
use crate::registry::VmRegistry;

const LEASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of a successful create.
#[derive(Debug, Clone)]
pub struct CreatedVm {
    pub id: String,
    pub ip: String,
    pub state: VmState,
}

/// Compensation for one completed create step.
enum Undo {
    ReleaseLedger {
        vcpu: u32,
        ram_gib: u32,
        disk_gib: u32,
    },
    RemoveOverlay {
        vm_id: String,
    },
}

pub struct Engine<H: Hypervisor, S: OverlayStore, F: ImageFetcher> {
    ledger: Arc<ResourceLedger>,
    registry: Arc<VmRegistry>,
    images: ImageCache<F>,
    disks: S,
    hypervisor: Arc<H>,
    network: LeaseWatcher<H>,
    lease_timeout: Duration,
}

impl<H: Hypervisor, S: OverlayStore, F: ImageFetcher> Engine<H, S, F> {
    pub fn new(
        ledger: Arc<ResourceLedger>,
        registry: Arc<VmRegistry>,
        images: ImageCache<F>,
        disks: S,
        hypervisor: Arc<H>,
    ) -> Self {
        let network = LeaseWatcher::new(hypervisor.clone());
        Self {
            ledger,
            registry,
            images,
            disks,
            hypervisor,
            network,
            lease_timeout: LEASE_TIMEOUT,
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    /// Re-admit records loaded from disk into the ledger so the sum
    /// invariant holds across restarts. Error-state records carry no
    /// allocation.
    pub fn readmit_existing(&self) {
        for record in self.registry.find_all() {
            if record.state == VmState::Error {
                continue;
            }
            if let Err(e) =
                self.ledger
                    .try_allocate(record.vcpu, record.ram_gib, record.disk_gib)
            {
                error!(
                    vm_id = %record.id,
                    error = %e,
                    "persisted record does not fit the ledger"
                );
            }
        }
    }

    #[instrument(skip(self), fields(vm_id = %name))]
    pub async fn create(
        &self,
        name: &str,
        vcpu: u32,
        ram_gib: u32,
        disk_gib: u32,
        template: &str,
    ) -> Result<CreatedVm, AgentError> {
        // 1. Validate.
        validate_request(name, vcpu, ram_gib, disk_gib, template)?;

        // 2. Uniqueness.
        if self.registry.exists(name) {
            return Err(AgentError::Conflict(format!("vm {name} already exists")));
        }

        // 3. Admission. Every failure past this point must release.
        self.ledger.try_allocate(vcpu, ram_gib, disk_gib)?;
        let mut undo = vec![Undo::ReleaseLedger {
            vcpu,
            ram_gib,
            disk_gib,
        }];

        // 4. Base image.
        let base = match self.images.acquire(template).await {
            Ok(path) => path,
            Err(e) => {
                self.rollback(undo).await;
                return Err(e);
            }
        };

        // 5. Overlay disk.
        let disk_path = match self.disks.create_overlay(name, &base, disk_gib).await {
            Ok(path) => path,
            Err(e) => {
                self.rollback(undo).await;
                return Err(AgentError::Storage(e.message().to_string()));
            }
        };
        undo.push(Undo::RemoveOverlay {
            vm_id: name.to_string(),
        });

        // 6. Define and launch the domain.
        let spec = VmSpec {
            name: name.to_string(),
            vcpu,
            ram_gib,
            disk_gib,
            template: template.to_string(),
            disk_path: disk_path.clone(),
        };
        if let Err(e) = self.hypervisor.define_and_launch(&spec).await {
            self.rollback(undo).await;
            return Err(e);
        }

        // 7. DHCP lease. A timeout is non-fatal; the VM runs without a
        // known IP until a later status call observes one.
        let ip = match self.network.wait_for_lease(name, self.lease_timeout).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "proceeding without an IP");
                String::new()
            }
        };

        // 8. Persist. The VM exists either way; a persist failure is
        // logged and surfaces through the next reconciliation.
        let now = Utc::now();
        let record = VmRecord {
            id: name.to_string(),
            name: name.to_string(),
            vcpu,
            ram_gib,
            disk_gib,
            template: template.to_string(),
            disk_path,
            state: VmState::Running,
            ip: ip.clone(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.registry.save(record) {
            error!(error = %e, "registry persist failed, record will reappear via reconciliation");
        }

        info!(ip = %ip, "vm created");
        Ok(CreatedVm {
            id: name.to_string(),
            ip,
            state: VmState::Running,
        })
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn delete(&self, id: &str) -> Result<(), AgentError> {
        let record = self
            .registry
            .find_by_id(id)
            .ok_or_else(|| AgentError::NotFound(format!("vm {id}")))?;

        // Tear down the domain. A hypervisor that has never heard of it is
        // the crash-recovery case and counts as success.
        match self.hypervisor.state(id).await {
            Ok(VmState::Running) | Ok(VmState::Paused) => {
                match self.hypervisor.stop(id, true).await {
                    Ok(()) | Err(AgentError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(_) | Err(AgentError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.hypervisor.undefine(id).await {
            Ok(()) | Err(AgentError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // An orphan overlay is acceptable; the ledger entry still clears.
        if let Err(e) = self.disks.delete_overlay(id).await {
            warn!(error = %e, "overlay left behind");
        }

        if let Err(e) = self.registry.delete(id) {
            error!(error = %e, "registry delete failed, next reconciliation retries");
        }

        // Error-state records released their footprint when they were
        // marked; everything else releases here.
        if record.state != VmState::Error {
            self.ledger
                .release(record.vcpu, record.ram_gib, record.disk_gib);
        }

        info!("vm deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn start(&self, id: &str) -> Result<VmState, AgentError> {
        self.hypervisor.start(id).await?;
        if self.registry.exists(id) {
            if let Err(e) = self.registry.update_state(id, VmState::Running, None) {
                warn!(error = %e, "state not persisted");
            }
        }
        info!("vm started");
        Ok(VmState::Running)
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn stop(&self, id: &str, force: bool) -> Result<VmState, AgentError> {
        self.hypervisor.stop(id, force).await?;
        if self.registry.exists(id) {
            if let Err(e) = self.registry.update_state(id, VmState::Stopped, None) {
                warn!(error = %e, "state not persisted");
            }
        }
        info!(force, "vm stopped");
        Ok(VmState::Stopped)
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn status(&self, id: &str) -> Result<VmStatusReport, AgentError> {
        let record = self
            .registry
            .find_by_id(id)
            .ok_or_else(|| AgentError::NotFound(format!("vm {id}")))?;

        // The hypervisor is the source of truth for state; the registry
        // catches up here.
        let live = match self.hypervisor.state(id).await {
            Ok(state) => state,
            Err(AgentError::NotFound(_)) => VmState::Error,
            Err(e) => return Err(e),
        };
        if live == VmState::Error {
            self.mark_error(&record);
        } else if live != record.state {
            if let Err(e) = self.registry.update_state(id, live.clone(), None) {
                warn!(error = %e, "observed state not persisted");
            }
        }

        let ip = match self.network.current_ip(id).await {
            Ok(ip) => ip,
            Err(_) => record.ip.clone(),
        };

        Ok(VmStatusReport {
            id: record.id,
            name: record.name,
            state: live,
            vcpu: record.vcpu,
            ram_gib: record.ram_gib,
            disk_gib: record.disk_gib,
            ip,
            // Hypervisor counters are not wired up yet; explicitly unknown.
            uptime_seconds: 0,
            cpu_usage_percent: 0.0,
            ram_usage_percent: 0.0,
        })
    }

    /// Union of hypervisor-known and registry-known VMs. Divergence is not
    /// an error: untracked domains are reported bare, and records without
    /// a backing domain are marked `error`.
    pub async fn list(&self) -> Result<Vec<VmListEntry>, AgentError> {
        let domains = self.hypervisor.list().await?;
        let records: HashMap<String, VmRecord> = self
            .registry
            .find_all()
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for domain in domains {
            seen.insert(domain.id.clone());
            match records.get(&domain.id) {
                Some(record) => {
                    if domain.state == VmState::Error {
                        self.mark_error(record);
                    } else if domain.state != record.state {
                        if let Err(e) =
                            self.registry
                                .update_state(&record.id, domain.state.clone(), None)
                        {
                            warn!(vm_id = %record.id, error = %e, "observed state not persisted");
                        }
                    }
                    entries.push(VmListEntry {
                        id: record.id.clone(),
                        name: record.name.clone(),
                        state: domain.state,
                        ip: record.ip.clone(),
                        vcpu: record.vcpu,
                        ram_gib: record.ram_gib,
                    });
                }
                None => {
                    warn!(domain = %domain.id, "domain is not tracked in the registry");
                    entries.push(VmListEntry {
                        id: domain.id.clone(),
                        name: domain.id,
                        state: domain.state,
                        ip: String::new(),
                        vcpu: 0,
                        ram_gib: 0,
                    });
                }
            }
        }

        for record in records.values() {
            if seen.contains(&record.id) {
                continue;
            }
            warn!(vm_id = %record.id, "registry record has no backing domain");
            self.mark_error(record);
            entries.push(VmListEntry {
                id: record.id.clone(),
                name: record.name.clone(),
                state: VmState::Error,
                ip: record.ip.clone(),
                vcpu: record.vcpu,
                ram_gib: record.ram_gib,
            });
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Transition a record to `error`, releasing its footprint exactly
    /// once. Error is terminal until an operator deletes the VM.
    fn mark_error(&self, record: &VmRecord) {
        if record.state == VmState::Error {
            return;
        }
        if let Err(e) = self.registry.update_state(&record.id, VmState::Error, None) {
            warn!(vm_id = %record.id, error = %e, "error state not persisted");
        }
        self.ledger
            .release(record.vcpu, record.ram_gib, record.disk_gib);
    }

    /// Run compensations for completed steps in reverse order. Each undo
    /// is best-effort; failures are logged, never silent.
    async fn rollback(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::ReleaseLedger {
                    vcpu,
                    ram_gib,
                    disk_gib,
                } => {
                    self.ledger.release(vcpu, ram_gib, disk_gib);
                }
                Undo::RemoveOverlay { vm_id } => {
                    if let Err(e) = self.disks.delete_overlay(&vm_id).await {
                        error!(vm_id = %vm_id, error = %e, "rollback could not remove overlay");
                    }
                }
            }
        }
    }
}

fn validate_request(
    name: &str,
    vcpu: u32,
    ram_gib: u32,
    disk_gib: u32,
    template: &str,
) -> Result<(), AgentError> {
    validate_name(name)?;
    if !(1..=32).contains(&vcpu) {
        return Err(AgentError::Validation(format!(
            "vcpu must be between 1 and 32, got {vcpu}"
        )));
    }
    if !(1..=128).contains(&ram_gib) {
        return Err(AgentError::Validation(format!(
            "ram must be between 1 and 128 GiB, got {ram_gib}"
        )));
    }
    if !(10..=1000).contains(&disk_gib) {
        return Err(AgentError::Validation(format!(
            "disk must be between 10 and 1000 GiB, got {disk_gib}"
        )));
    }
    if template_url(template).is_none() {
        return Err(AgentError::Validation(format!(
            "unknown template {template:?}"
        )));
    }
    Ok(())
}

/// Hostname syntax: 3-63 characters, ASCII letters, digits, and hyphens,
/// starting and ending alphanumeric.
fn validate_name(name: &str) -> Result<(), AgentError> {
    if name.len() < 3 || name.len() > 63 {
        return Err(AgentError::Validation(format!(
            "name must be 3-63 characters, got {}",
            name.len()
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(AgentError::Validation(
            "name may only contain letters, digits, and hyphens".into(),
        ));
    }
    let first = name.chars().next().unwrap();
    let last = name.chars().last().unwrap();
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(AgentError::Validation(
            "name must start and end with a letter or digit".into(),
        ));
    }
    Ok(())
}
