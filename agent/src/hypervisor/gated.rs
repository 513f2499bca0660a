//! Circuit-breaker gate in front of any hypervisor backend.
//!
//! Every call passes the breaker before touching the backend (and before
//! the backend takes its connection lock); the outcome feeds the breaker's
//! window. A `NotFound` is a healthy response from the hypervisor and does
//! not count as a failure.

use crate::dto::{VmSpec, VmState};
use crate::error::AgentError;

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::interface::{DomainSummary, Hypervisor};

pub struct GatedHypervisor<H> {
    inner: H,
    breaker: CircuitBreaker,
}

impl<H: Hypervisor> GatedHypervisor<H> {
    pub fn new(inner: H) -> Self {
        Self::with_config(inner, BreakerConfig::default())
    }

    pub fn with_config(inner: H, config: BreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }

    /// The wrapped backend, for lifecycle concerns the gate does not cover
    /// (closing the connection at shutdown).
    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn settle<T>(&self, result: Result<T, AgentError>) -> Result<T, AgentError> {
        self.breaker
            .record(matches!(&result, Ok(_) | Err(AgentError::NotFound(_))));
        result
    }
}

impl<H: Hypervisor> Hypervisor for GatedHypervisor<H> {
    async fn define_and_launch(&self, spec: &VmSpec) -> Result<(), AgentError> {
        self.breaker.check()?;
        let result = self.inner.define_and_launch(spec).await;
        self.settle(result)
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        self.breaker.check()?;
        let result = self.inner.start(id).await;
        self.settle(result)
    }

    async fn stop(&self, id: &str, force: bool) -> Result<(), AgentError> {
        self.breaker.check()?;
        let result = self.inner.stop(id, force).await;
        self.settle(result)
    }

    async fn undefine(&self, id: &str) -> Result<(), AgentError> {
        self.breaker.check()?;
        let result = self.inner.undefine(id).await;
        self.settle(result)
    }

    async fn state(&self, id: &str) -> Result<VmState, AgentError> {
        self.breaker.check()?;
        let result = self.inner.state(id).await;
        self.settle(result)
    }

    async fn list(&self) -> Result<Vec<DomainSummary>, AgentError> {
        self.breaker.check()?;
        let result = self.inner.list().await;
        self.settle(result)
    }

    async fn lease_ip(&self, id: &str) -> Result<String, AgentError> {
        self.breaker.check()?;
        let result = self.inner.lease_ip(id).await;
        // A missing lease is a healthy hypervisor answering "not yet".
        self.breaker
            .record(matches!(
                &result,
                Ok(_) | Err(AgentError::NotFound(_)) | Err(AgentError::Network(_))
            ));
        result
    }

    async fn ping(&self) -> Result<(), AgentError> {
        self.breaker.check()?;
        let result = self.inner.ping().await;
        self.settle(result)
    }
}
