//! Mock hypervisor for unit tests.
//!
//! Tracks every call through shared atomic counters and injects failures
//! per operation via [`MockConfig`]. Domain state lives in an in-memory
//! map so lifecycle sequences behave like a real hypervisor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::dto::{VmSpec, VmState};
use crate::error::AgentError;

use super::interface::{DomainSummary, Hypervisor};

/// Which operations should fail, and the lease behavior. All default to
/// success / no lease.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub define_error: Option<String>,
    pub start_error: Option<String>,
    pub stop_error: Option<String>,
    pub undefine_error: Option<String>,
    pub state_error: Option<String>,
    pub list_error: Option<String>,
    pub ping_error: Option<String>,
    /// IP handed out by `lease_ip`; `None` means no lease yet.
    pub lease_ip: Option<String>,
}

/// Shared counters, cloneable into assertions.
#[derive(Debug, Clone, Default)]
pub struct CallTracker {
    pub defines: Arc<AtomicUsize>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub undefines: Arc<AtomicUsize>,
    pub lease_queries: Arc<AtomicUsize>,
    pub pings: Arc<AtomicUsize>,
}

impl CallTracker {
    pub fn define_count(&self) -> usize {
        self.defines.load(Ordering::Relaxed)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn undefine_count(&self) -> usize {
        self.undefines.load(Ordering::Relaxed)
    }

    pub fn lease_query_count(&self) -> usize {
        self.lease_queries.load(Ordering::Relaxed)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::Relaxed)
    }
}

pub struct MockHypervisor {
    config: Mutex<MockConfig>,
    tracker: CallTracker,
    domains: Mutex<HashMap<String, VmState>>,
}

impl MockHypervisor {
    pub fn new() -> (Self, CallTracker) {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> (Self, CallTracker) {
        let tracker = CallTracker::default();
        (
            Self {
                config: Mutex::new(config),
                tracker: tracker.clone(),
                domains: Mutex::new(HashMap::new()),
            },
            tracker,
        )
    }

    /// Swap the failure script mid-test.
    pub fn set_config(&self, config: MockConfig) {
        *self.config.lock().unwrap() = config;
    }

    /// Plant a domain without going through `define_and_launch`.
    pub fn set_domain_state(&self, id: &str, state: VmState) {
        self.domains.lock().unwrap().insert(id.to_string(), state);
    }

    pub fn remove_domain(&self, id: &str) {
        self.domains.lock().unwrap().remove(id);
    }

    pub fn domain_state(&self, id: &str) -> Option<VmState> {
        self.domains.lock().unwrap().get(id).cloned()
    }

    pub fn domain_count(&self) -> usize {
        self.domains.lock().unwrap().len()
    }

    fn config(&self) -> MockConfig {
        self.config.lock().unwrap().clone()
    }
}

impl Hypervisor for MockHypervisor {
    async fn define_and_launch(&self, spec: &VmSpec) -> Result<(), AgentError> {
        self.tracker.defines.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.config().define_error {
            return Err(AgentError::Hypervisor(e));
        }
        self.domains
            .lock()
            .unwrap()
            .insert(spec.name.clone(), VmState::Running);
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        self.tracker.starts.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.config().start_error {
            return Err(AgentError::Hypervisor(e));
        }
        let mut domains = self.domains.lock().unwrap();
        match domains.get_mut(id) {
            Some(state) => {
                *state = VmState::Running;
                Ok(())
            }
            None => Err(AgentError::NotFound(format!("domain {id}"))),
        }
    }

    async fn stop(&self, id: &str, _force: bool) -> Result<(), AgentError> {
        self.tracker.stops.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.config().stop_error {
            return Err(AgentError::Hypervisor(e));
        }
        let mut domains = self.domains.lock().unwrap();
        match domains.get_mut(id) {
            Some(state) => {
                *state = VmState::Stopped;
                Ok(())
            }
            None => Err(AgentError::NotFound(format!("domain {id}"))),
        }
    }

    async fn undefine(&self, id: &str) -> Result<(), AgentError> {
        self.tracker.undefines.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.config().undefine_error {
            return Err(AgentError::Hypervisor(e));
        }
        match self.domains.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(AgentError::NotFound(format!("domain {id}"))),
        }
    }

    async fn state(&self, id: &str) -> Result<VmState, AgentError> {
        if let Some(e) = self.config().state_error {
            return Err(AgentError::Hypervisor(e));
        }
        self.domains
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("domain {id}")))
    }

    async fn list(&self) -> Result<Vec<DomainSummary>, AgentError> {
        if let Some(e) = self.config().list_error {
            return Err(AgentError::Hypervisor(e));
        }
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

    async fn lease_ip(&self, id: &str) -> Result<String, AgentError> {
        self.tracker.lease_queries.fetch_add(1, Ordering::Relaxed);
        if !self.domains.lock().unwrap().contains_key(id) {
            return Err(AgentError::NotFound(format!("domain {id}")));
        }
        match self.config().lease_ip {
            Some(ip) => Ok(ip),
            None => Err(AgentError::Network(format!("no DHCP lease for domain {id}"))),
        }
    }

    async fn ping(&self) -> Result<(), AgentError> {
        self.tracker.pings.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.config().ping_error {
            return Err(AgentError::Hypervisor(e));
        }
        Ok(())
    }
}
