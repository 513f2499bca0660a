//! Hypervisor abstraction.
//!
//! One trait defines everything the engine needs from the host
//! virtualization layer. Production is libvirt ([`LibvirtHypervisor`]
//! (super::libvirt::LibvirtHypervisor)); tests use a mock that tracks
//! calls and injects failures. Every production call is routed through the
//! circuit breaker by [`GatedHypervisor`](super::gated::GatedHypervisor).

use std::future::Future;

use crate::dto::{VmSpec, VmState};
use crate::error::AgentError;

/// A domain as the hypervisor sees it.
#[derive(Debug, Clone)]
pub struct DomainSummary {
    pub id: String,
    pub state: VmState,
}

pub trait Hypervisor: Send + Sync + 'static {
    /// Define a new domain from `spec` and start it. If the start fails,
    /// the just-defined domain is undefined before the error returns.
    fn define_and_launch(
        &self,
        spec: &VmSpec,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// Start an existing stopped domain. Starting a running domain is
    /// accepted and is a no-op.
    fn start(&self, id: &str) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// Stop a domain. `force` is an immediate power-off; otherwise a
    /// guest-OS shutdown request. Neither waits for completion.
    fn stop(&self, id: &str, force: bool)
        -> impl Future<Output = Result<(), AgentError>> + Send;

    /// Remove the domain definition. The domain must be stopped.
    fn undefine(&self, id: &str) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// Observed lifecycle state of a domain.
    fn state(&self, id: &str) -> impl Future<Output = Result<VmState, AgentError>> + Send;

    /// All domains known to the hypervisor, active and defined-but-stopped.
    fn list(&self) -> impl Future<Output = Result<Vec<DomainSummary>, AgentError>> + Send;

    /// First DHCP-leased address of the domain, or `Network` if none.
    fn lease_ip(&self, id: &str) -> impl Future<Output = Result<String, AgentError>> + Send;

    /// Liveness of the hypervisor connection.
    fn ping(&self) -> impl Future<Output = Result<(), AgentError>> + Send;
}
