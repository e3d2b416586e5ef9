//! AP bring-up interface.
//!
//! The real-mode trampoline is external; it reads an [`ApBootBlock`] from
//! a fixed physical address, switches each application processor to long
//! mode and jumps to the entry point with the AP's logical id. This module
//! writes the block and hosts the Rust side of the landing.

use crate::boot::ApBootBlock;
use crate::mm::{PhysAddr, PhysWindow};
use crate::smp::percpu::{self, PerCpu, STATUS_WAKEUP_INITIATED};

/// Publish the boot block where the trampoline expects it.
///
/// # Safety
///
/// `block_addr` must be the trampoline's agreed physical slot, identity
/// mapped for the APs and covered by `window` for us.
pub unsafe fn install_boot_block(window: PhysWindow, block_addr: PhysAddr, block: ApBootBlock) {
    (window.translate(block_addr) as *mut ApBootBlock).write(block);
}

/// Build the boot block for the current per-CPU layout.
pub fn boot_block(cr3: PhysAddr, percpu_phys_base: PhysAddr, entry: usize) -> ApBootBlock {
    let cpus = percpu::cpus();
    ApBootBlock {
        cr3: cr3 as u64,
        percpu_base: percpu_phys_base as u64,
        percpu_stride: core::mem::size_of::<PerCpu>() as u64,
        cpu_count: cpus.len() as u64,
        entry: entry as u64,
    }
}

/// Mark every sleeping CPU as wake-up-initiated before the startup IPIs
/// go out, so a stuck core is distinguishable from one never prodded.
pub fn mark_wakeups_initiated() {
    for cpu in percpu::cpus() {
        if cpu.status() == percpu::STATUS_ASLEEP {
            cpu.set_status(STATUS_WAKEUP_INITIATED);
        }
    }
}

/// Rust-side landing for a woken AP: bind the per-CPU block, go online,
/// and enter the scheduler. Never returns.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn ap_main(logical_id: u32) -> ! {
    let cpu = percpu::cpu(logical_id);
    percpu::make_current(cpu);
    crate::sched::localsched::init_current();
    cpu.set_status(percpu::STATUS_ONLINE);
    crate::info!("smp", "CPU {} online", logical_id);
    crate::sched::localsched::bootstrap()
}
