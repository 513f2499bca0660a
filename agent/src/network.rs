//! DHCP lease lookups against the hypervisor's NAT network.
//!
//! In flat NAT mode addresses come from the hypervisor's DHCP server, so
//! the only work is waiting for a lease to appear and reading it back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::AgentError;
use crate::hypervisor::Hypervisor;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct LeaseWatcher<H> {
    hypervisor: Arc<H>,
    poll_interval: Duration,
}

impl<H: Hypervisor> LeaseWatcher<H> {
    pub fn new(hypervisor: Arc<H>) -> Self {
        Self {
            hypervisor,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Block until the domain holds a lease, polling until `timeout`.
    pub async fn wait_for_lease(&self, vm_id: &str, timeout: Duration) -> Result<String, AgentError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.hypervisor.lease_ip(vm_id).await {
                Ok(ip) if !ip.is_empty() => return Ok(ip),
                Ok(_) | Err(AgentError::Network(_)) => {
                    debug!(vm_id, "no DHCP lease yet");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(AgentError::Network(format!(
                    "timed out waiting for DHCP lease for {vm_id}"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Single non-blocking lease query.
    pub async fn current_ip(&self, vm_id: &str) -> Result<String, AgentError> {
        self.hypervisor.lease_ip(vm_id).await
    }
}
