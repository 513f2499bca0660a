//! Resource ledger: in-memory accounting of CPU, RAM, and disk.
//!
//! `try_allocate` and `release` are the only mutators; both run under one
//! mutex so admission is linearized. Releasing more than was allocated is a
//! programming bug and panics.

use std::sync::Mutex;

use crate::dto::ResourceSnapshot;
use crate::error::AgentError;

/// Host totals for RAM and disk are fixed constants until real host
/// probing lands; CPU is probed from the host.
pub const TOTAL_RAM_GIB: u32 = 32;
pub const TOTAL_DISK_GIB: u32 = 500;

#[derive(Debug)]
struct Counters {
    total_cpu: u32,
    available_cpu: u32,
    reserved_cpu: u32,
    total_ram_gib: u32,
    available_ram_gib: u32,
    reserved_ram_gib: u32,
    total_disk_gib: u32,
    available_disk_gib: u32,
    reserved_disk_gib: u32,
}

pub struct ResourceLedger {
    counters: Mutex<Counters>,
}

impl ResourceLedger {
    /// Build a ledger from host CPU count, fixed RAM/disk totals, and
    /// operator reservations. Reservations are clamped to the totals.
    pub fn new(reserved_cpu: u32, reserved_ram_gib: u32, reserved_disk_gib: u32) -> Self {
        let total_cpu = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::with_totals(
            total_cpu,
            TOTAL_RAM_GIB,
            TOTAL_DISK_GIB,
            reserved_cpu,
            reserved_ram_gib,
            reserved_disk_gib,
        )
    }

    pub fn with_totals(
        total_cpu: u32,
        total_ram_gib: u32,
        total_disk_gib: u32,
        reserved_cpu: u32,
        reserved_ram_gib: u32,
        reserved_disk_gib: u32,
    ) -> Self {
        let reserved_cpu = reserved_cpu.min(total_cpu);
        let reserved_ram_gib = reserved_ram_gib.min(total_ram_gib);
        let reserved_disk_gib = reserved_disk_gib.min(total_disk_gib);
        Self {
            counters: Mutex::new(Counters {
                total_cpu,
                available_cpu: total_cpu - reserved_cpu,
                reserved_cpu,
                total_ram_gib,
                available_ram_gib: total_ram_gib - reserved_ram_gib,
                reserved_ram_gib,
                total_disk_gib,
                available_disk_gib: total_disk_gib - reserved_disk_gib,
                reserved_disk_gib,
            }),
        }
    }

    /// Owned copy of the current counters.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let c = self.counters.lock().unwrap();
        ResourceSnapshot {
            total_cpu: c.total_cpu,
            available_cpu: c.available_cpu,
            reserved_cpu: c.reserved_cpu,
            total_ram_gib: c.total_ram_gib,
            available_ram_gib: c.available_ram_gib,
            reserved_ram_gib: c.reserved_ram_gib,
            total_disk_gib: c.total_disk_gib,
            available_disk_gib: c.available_disk_gib,
            reserved_disk_gib: c.reserved_disk_gib,
        }
    }

    /// Atomically check and decrement the available counters.
    pub fn try_allocate(
        &self,
        vcpu: u32,
        ram_gib: u32,
        disk_gib: u32,
    ) -> Result<(), AgentError> {
        let mut c = self.counters.lock().unwrap();
        if c.available_cpu < vcpu || c.available_ram_gib < ram_gib || c.available_disk_gib < disk_gib
        {
            return Err(AgentError::ResourceExhausted(format!(
                "requested {vcpu} vcpu / {ram_gib} GiB ram / {disk_gib} GiB disk, \
                 available {} / {} / {}",
                c.available_cpu, c.available_ram_gib, c.available_disk_gib
            )));
        }
        c.available_cpu -= vcpu;
        c.available_ram_gib -= ram_gib;
        c.available_disk_gib -= disk_gib;
        Ok(())
    }

    /// Atomically increment the available counters.
    ///
    /// Panics if the release would push availability past
    /// `total - reserved` — the engine must only release what it allocated.
    pub fn release(&self, vcpu: u32, ram_gib: u32, disk_gib: u32) {
        let mut c = self.counters.lock().unwrap();
        let cpu = c.available_cpu + vcpu;
        let ram = c.available_ram_gib + ram_gib;
        let disk = c.available_disk_gib + disk_gib;
        assert!(
            cpu <= c.total_cpu - c.reserved_cpu
                && ram <= c.total_ram_gib - c.reserved_ram_gib
                && disk <= c.total_disk_gib - c.reserved_disk_gib,
            "ledger release of unallocated resources: {vcpu} vcpu / {ram_gib} GiB ram / {disk_gib} GiB disk"
        );
        c.available_cpu = cpu;
        c.available_ram_gib = ram;
        c.available_disk_gib = disk;
    }
}
