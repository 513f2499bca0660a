//! Crash/restart behavior over the public surface: records persisted by
//! one engine instance are reloaded and re-admitted by the next, and the
//! first inventory after restart matches the last persisted state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agent::disks::OverlayStore;
use agent::dto::{VmSpec, VmState};
use agent::engine::Engine;
use agent::error::AgentError;
use agent::hypervisor::{DomainSummary, Hypervisor};
use agent::images::{FetchedImage, ImageCache, ImageFetcher};
use agent::ledger::ResourceLedger;
use agent::registry::VmRegistry;

/// Hypervisor stub: domains in a shared map, every domain holding a lease.
#[derive(Clone, Default)]
struct StubHypervisor {
    domains: Arc<Mutex<HashMap<String, VmState>>>,
}

impl Hypervisor for StubHypervisor {
    async fn define_and_launch(&self, spec: &VmSpec) -> Result<(), AgentError> {
        self.domains
            .lock()
            .unwrap()
            .insert(spec.name.clone(), VmState::Running);
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        self.domains
            .lock()
            .unwrap()
            .insert(id.to_string(), VmState::Running);
        Ok(())
    }

    async fn stop(&self, id: &str, _force: bool) -> Result<(), AgentError> {
        self.domains
            .lock()
            .unwrap()
            .insert(id.to_string(), VmState::Stopped);
        Ok(())
    }

    async fn undefine(&self, id: &str) -> Result<(), AgentError> {
        self.domains.lock().unwrap().remove(id);
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<VmState, AgentError> {
        self.domains
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("domain {id}")))
    }

    async fn list(&self) -> Result<Vec<DomainSummary>, AgentError> {
        Ok(self
            .domains
            .lock()
            .unwrap()
            .iter()
            .map(|(id, state)| DomainSummary {
                id: id.clone(),
                state: state.clone(),
            })
            .collect())
    }

    async fn lease_ip(&self, _id: &str) -> Result<String, AgentError> {
        Ok("192.168.122.77".into())
    }

    async fn ping(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

struct StubOverlays(PathBuf);

impl OverlayStore for StubOverlays {
    async fn create_overlay(
        &self,
        vm_id: &str,
        _base: &Path,
        _size_gib: u32,
    ) -> Result<PathBuf, AgentError> {
        Ok(self.overlay_path(vm_id))
    }

    async fn delete_overlay(&self, _vm_id: &str) -> Result<(), AgentError> {
        Ok(())
    }

    fn overlay_path(&self, vm_id: &str) -> PathBuf {
        self.0.join(format!("{vm_id}.qcow2"))
    }
}

#[derive(Clone)]
struct StubFetcher;

impl ImageFetcher for StubFetcher {
    async fn fetch(&self, _url: &str, dest: &Path) -> Result<FetchedImage, AgentError> {
        use sha2::Digest;
        let bytes = b"image";
        tokio::fs::write(dest, bytes).await?;
        Ok(FetchedImage {
            size_bytes: bytes.len() as u64,
            sha256: format!("{:x}", sha2::Sha256::digest(bytes)),
        })
    }
}

fn build_engine(
    data_dir: &Path,
    hypervisor: StubHypervisor,
) -> Engine<StubHypervisor, StubOverlays, StubFetcher> {
    let ledger = Arc::new(ResourceLedger::with_totals(8, 16, 200, 0, 0, 0));
    let registry = Arc::new(VmRegistry::load(data_dir).expect("registry loads"));
    let images = ImageCache::new(data_dir.join("images"), StubFetcher);
    let disks = StubOverlays(data_dir.join("disks"));
    Engine::new(ledger, registry, images, disks, Arc::new(hypervisor))
}

#[tokio::test]
async fn restart_reloads_inventory_and_readmits_footprint() {
    let tmp = tempfile::tempdir().unwrap();
    let hypervisor = StubHypervisor::default();

    // First process lifetime: create a VM, then "crash" (drop everything).
    {
        let engine = build_engine(tmp.path(), hypervisor.clone());
        let created = engine
            .create("vm-a", 2, 4, 50, "ubuntu-22.04")
            .await
            .unwrap();
        assert_eq!(created.ip, "192.168.122.77");
    }

    // Second process lifetime over the same data directory.
    let engine = build_engine(tmp.path(), hypervisor.clone());
    engine.readmit_existing();

    // The record survived in its last persisted state.
    let record = engine.registry().find_by_id("vm-a").expect("vm-a reloaded");
    assert_eq!(record.state, VmState::Running);
    assert_eq!(record.ip, "192.168.122.77");

    // The ledger reflects the reloaded footprint, so a request that no
    // longer fits is refused.
    let snap = engine.ledger().snapshot();
    assert_eq!(snap.available_cpu, 6);
    assert_eq!(snap.available_ram_gib, 12);
    assert_eq!(snap.available_disk_gib, 150);

    // The first post-restart inventory carries vm-a.
    let inventory = engine.registry().find_all();
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].id, "vm-a");

    // And the VM remains fully operable: delete releases everything.
    engine.delete("vm-a").await.unwrap();
    let snap = engine.ledger().snapshot();
    assert_eq!(snap.available_disk_gib, 200);
    assert!(engine.registry().find_all().is_empty());
}

#[tokio::test]
async fn records_not_persisted_do_not_reappear() {
    let tmp = tempfile::tempdir().unwrap();
    let hypervisor = StubHypervisor::default();

    {
        let engine = build_engine(tmp.path(), hypervisor.clone());
        engine
            .create("vm-kept", 1, 2, 20, "ubuntu-22.04")
            .await
            .unwrap();
    }

    // A domain launched by hand (never persisted) must not turn into a
    // registry record on restart.
    hypervisor
        .domains
        .lock()
        .unwrap()
        .insert("vm-manual".into(), VmState::Running);

    let engine = build_engine(tmp.path(), hypervisor);
    engine.readmit_existing();

    assert!(engine.registry().exists("vm-kept"));
    assert!(!engine.registry().exists("vm-manual"));

    // List still surfaces the untracked domain, without inventing metadata.
    let entries = engine.list().await.unwrap();
    let manual = entries.iter().find(|e| e.id == "vm-manual").unwrap();
    assert_eq!(manual.state, VmState::Running);
    assert_eq!(manual.vcpu, 0);
}
