//! Per-CPU state.
//!
//! One block per CPU, allocated once and published read-only; each CPU
//! reaches its own block through the architecture's per-CPU pointer and
//! other CPUs' blocks by logical id. Cross-CPU mutation goes through the
//! atomics and the per-core queue lock, never through the current-CPU
//! shortcut.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::boot::CpuDescriptor;
use crate::mm::numa::NumaId;
use crate::sched::queue::LocalScheduler;
use crate::smp::topology::SchedDomain;

/// CPU lifecycle states.
pub const STATUS_ASLEEP: u8 = 1;
pub const STATUS_WAKEUP_INITIATED: u8 = 2;
pub const STATUS_ONLINE: u8 = 3;
pub const STATUS_GAVE_UP: u8 = 4;

pub struct PerCpu {
    pub apic_id: u32,
    pub acpi_id: u32,
    pub logical_id: u32,
    pub numa_id: NumaId,
    pub status: AtomicU8,
    /// Stack tops for the interrupt and scheduler stacks (virtual).
    pub interrupt_stack_top: AtomicUsize,
    pub scheduler_stack_top: AtomicUsize,
    /// TSC ticks per microsecond, measured at boot.
    pub tsc_freq: AtomicU64,
    pub sched: LocalScheduler,
    /// Leaf scheduling domain of this CPU's chain.
    pub domain: AtomicPtr<SchedDomain>,
    /// Root of the chain, where balancing starts.
    pub root_domain: AtomicPtr<SchedDomain>,
}

impl PerCpu {
    pub fn new(desc: &CpuDescriptor) -> Self {
        PerCpu {
            apic_id: desc.apic_id,
            acpi_id: desc.acpi_id,
            logical_id: desc.logical_id,
            numa_id: desc.numa_id,
            status: AtomicU8::new(STATUS_ASLEEP),
            interrupt_stack_top: AtomicUsize::new(0),
            scheduler_stack_top: AtomicUsize::new(0),
            tsc_freq: AtomicU64::new(1000),
            sched: LocalScheduler::new(),
            domain: AtomicPtr::new(core::ptr::null_mut()),
            root_domain: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }
}

static CPUS: spin::Once<&'static [PerCpu]> = spin::Once::new();

/// Build and publish the per-CPU array from the ACPI enumeration. The
/// entries land in logical-id order; logical ids must be dense.
pub fn init(descriptors: &[CpuDescriptor]) -> &'static [PerCpu] {
    CPUS.call_once(|| {
        let mut blocks: Vec<PerCpu> = descriptors.iter().map(PerCpu::new).collect();
        blocks.sort_by_key(|c| c.logical_id);
        for (i, cpu) in blocks.iter().enumerate() {
            assert_eq!(cpu.logical_id as usize, i, "logical ids must be dense");
        }
        crate::info!("smp", "{} CPU block(s) allocated", blocks.len());
        Box::leak(blocks.into_boxed_slice())
    })
}

/// The published array. Panics before [`init`].
pub fn cpus() -> &'static [PerCpu] {
    CPUS.get().expect("per-CPU blocks not initialized")
}

pub fn try_cpus() -> Option<&'static [PerCpu]> {
    CPUS.get().copied()
}

pub fn cpu(logical_id: u32) -> &'static PerCpu {
    &cpus()[logical_id as usize]
}

/// Bind the calling CPU to its block; from here on [`current`] works on
/// this CPU.
pub fn make_current(cpu: &'static PerCpu) {
    crate::arch::set_percpu_ptr(cpu as *const PerCpu as *mut u8);
}

/// The calling CPU's block.
pub fn current() -> &'static PerCpu {
    try_current().expect("per-CPU pointer not set on this CPU")
}

pub fn try_current() -> Option<&'static PerCpu> {
    let ptr = crate::arch::percpu_ptr() as *const PerCpu;
    if ptr.is_null() {
        None
    } else {
        // SAFETY: set_percpu_ptr only ever publishes blocks from the
        // leaked CPUS array.
        Some(unsafe { &*ptr })
    }
}

/// Hosted-test helper: publish `n` fake CPUs on node 0 with a flat
/// topology and bind the caller to CPU 0. Idempotent; later calls reuse
/// the first array.
#[cfg(test)]
pub fn init_for_tests(n: usize) -> &'static [PerCpu] {
    static TEST_TOPOLOGY: spin::Once<()> = spin::Once::new();
    let descs: Vec<CpuDescriptor> = (0..n as u32)
        .map(|i| CpuDescriptor {
            apic_id: i,
            acpi_id: i,
            logical_id: i,
            numa_id: 0,
        })
        .collect();
    let cpus = init(&descs);
    TEST_TOPOLOGY.call_once(|| crate::smp::topology::build_flat(cpus));
    make_current(&cpus[0]);
    cpus
}

/// Hosted-test helper: serializes tests that mutate the shared CPU array
/// (queues, task counts, domain counts).
#[cfg(test)]
pub fn exclusive() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_points_at_bound_block() {
        let cpus = init_for_tests(4);
        assert!(cpus.len() >= 1);
        make_current(&cpus[0]);
        assert_eq!(current().logical_id, 0);
        assert_eq!(cpu(0).apic_id, cpus[0].apic_id);
    }
}
