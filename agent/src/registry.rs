//! Durable VM registry: one JSON document mapping VM id to record.
//!
//! The in-memory map is the working copy; every mutation rewrites the file
//! through a temp-file + atomic rename inside the exclusive section, so
//! disk and memory are never observed out of sync. A corrupt file on load
//! is fatal: the operator must intervene rather than silently lose
//! inventory.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use tracing::info;

use crate::dto::{VmRecord, VmState};
use crate::error::AgentError;

const REGISTRY_FILE: &str = "vms.json";

#[derive(Debug)]
pub struct VmRegistry {
    records: RwLock<HashMap<String, VmRecord>>,
    file_path: PathBuf,
}

impl VmRegistry {
    /// Load the registry from `<data_dir>/vms.json`. A missing file is an
    /// empty registry; an unparseable one is an error.
    pub fn load(data_dir: &Path) -> Result<Self, AgentError> {
        std::fs::create_dir_all(data_dir)?;
        let file_path = data_dir.join(REGISTRY_FILE);

        let records: HashMap<String, VmRecord> = match std::fs::read(&file_path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                AgentError::Corrupted(format!(
                    "registry file {} is corrupt: {e}",
                    file_path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %file_path.display(), vms = records.len(), "registry loaded");
        Ok(Self {
            records: RwLock::new(records),
            file_path,
        })
    }

    /// Insert or replace a record, stamping `updated_at`.
    pub fn save(&self, mut record: VmRecord) -> Result<(), AgentError> {
        let mut records = self.records.write().unwrap();
        record.updated_at = Utc::now();
        records.insert(record.id.clone(), record);
        self.persist(&records)
    }

    /// Update only the state (and optionally ip) of an existing record.
    pub fn update_state(
        &self,
        id: &str,
        state: VmState,
        ip: Option<String>,
    ) -> Result<(), AgentError> {
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(format!("vm {id}")))?;
        record.state = state;
        if let Some(ip) = ip {
            record.ip = ip;
        }
        record.updated_at = Utc::now();
        self.persist(&records)
    }

    /// Remove a record. Removing an absent id is a no-op.
    pub fn delete(&self, id: &str) -> Result<(), AgentError> {
        let mut records = self.records.write().unwrap();
        if records.remove(id).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Option<VmRecord> {
        self.records.read().unwrap().get(id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<VmRecord> {
        self.records
            .read()
            .unwrap()
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn find_all(&self) -> Vec<VmRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.records.read().unwrap().contains_key(id)
    }

    /// Serialize to `<path>.tmp`, fsync, rename over the live file. Called
    /// with the write lock held so readers never see a half-applied
    /// mutation.
    fn persist(&self, records: &HashMap<String, VmRecord>) -> Result<(), AgentError> {
        let data = serde_json::to_vec_pretty(records)?;
        let tmp_path = self.file_path.with_extension("json.tmp");

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.file_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn record(id: &str) -> VmRecord {
        VmRecord {
            id: id.to_string(),
            name: id.to_string(),
            vcpu: 2,
            ram_gib: 4,
            disk_gib: 50,
            template: "ubuntu-22.04".into(),
            disk_path: PathBuf::from(format!("/tmp/disks/{id}.qcow2")),
            state: VmState::Running,
            ip: "192.168.122.50".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn on_disk(dir: &Path) -> HashMap<String, VmRecord> {
        let raw = std::fs::read(dir.join(REGISTRY_FILE)).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::load(dir.path()).unwrap();
        assert!(registry.find_all().is_empty());
    }

    #[test]
    fn disk_matches_memory_after_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::load(dir.path()).unwrap();

        registry.save(record("vm-a")).unwrap();
        assert_eq!(on_disk(dir.path()).len(), 1);
        assert!(on_disk(dir.path()).contains_key("vm-a"));

        registry.save(record("vm-b")).unwrap();
        assert_eq!(on_disk(dir.path()).len(), 2);

        registry
            .update_state("vm-a", VmState::Stopped, None)
            .unwrap();
        assert_eq!(on_disk(dir.path())["vm-a"].state, VmState::Stopped);

        registry.delete("vm-a").unwrap();
        let disk = on_disk(dir.path());
        assert_eq!(disk.len(), 1);
        assert!(!disk.contains_key("vm-a"));
    }

    #[test]
    fn restart_reloads_persisted_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = VmRegistry::load(dir.path()).unwrap();
            registry.save(record("vm-a")).unwrap();
        }
        let reloaded = VmRegistry::load(dir.path()).unwrap();
        let vm = reloaded.find_by_id("vm-a").expect("record survives restart");
        assert_eq!(vm.vcpu, 2);
        assert_eq!(vm.ip, "192.168.122.50");
        assert!(reloaded.exists("vm-a"));
        assert!(!reloaded.exists("vm-b"));
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(REGISTRY_FILE), b"{ not json").unwrap();
        let err = VmRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, AgentError::Corrupted(_)));
    }

    #[test]
    fn find_by_name_and_id_agree() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::load(dir.path()).unwrap();
        registry.save(record("vm-a")).unwrap();

        assert_eq!(registry.find_by_name("vm-a").unwrap().id, "vm-a");
        assert!(registry.find_by_name("vm-z").is_none());
        assert!(registry.find_by_id("vm-z").is_none());
    }

    #[test]
    fn deleting_absent_record_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::load(dir.path()).unwrap();
        registry.delete("ghost").unwrap();
        assert!(registry.find_all().is_empty());
    }

    #[test]
    fn update_state_of_missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::load(dir.path()).unwrap();
        let err = registry
            .update_state("vm-a", VmState::Stopped, None)
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
