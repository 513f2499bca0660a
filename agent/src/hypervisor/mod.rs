pub mod breaker;
mod gated;
mod interface;
pub mod libvirt;
#[cfg(test)]
pub mod mock;

pub use gated::GatedHypervisor;
pub use interface::{DomainSummary, Hypervisor};
pub use libvirt::LibvirtHypervisor;
