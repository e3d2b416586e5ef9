//! Bare-metal x86-64 implementations.

use core::arch::asm;

use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr3, Cr4, Cr4Flags};
use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::VirtAddr;

/// Raise the interrupt level: disable interrupts, report whether they were
/// enabled before.
#[inline]
pub fn interrupts_disable() -> bool {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    enabled
}

/// Restore the interrupt level saved by [`interrupts_disable`].
#[inline]
pub fn interrupts_restore(was_enabled: bool) {
    if was_enabled {
        interrupts::enable();
    }
}

/// Spin-wait hint.
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Sleep until the next interrupt, with interrupts transiently enabled so
/// the wake-up IPI can land. Returns with interrupts disabled again.
#[inline]
pub fn wait_for_interrupt() {
    interrupts::enable_and_hlt();
    interrupts::disable();
}

/// Timestamp counter.
#[inline]
pub fn tsc_read() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Publish the current CPU's per-CPU block address through GS. The kernel
/// GS base is zeroed so `swapgs` never leaks the pointer to userspace.
pub fn set_percpu_ptr(ptr: *mut u8) {
    GsBase::write(VirtAddr::new(ptr as u64));
    KernelGsBase::write(VirtAddr::new(0));
}

/// Read back the per-CPU block address. Null before [`set_percpu_ptr`].
#[inline]
pub fn percpu_ptr() -> *mut u8 {
    GsBase::read().as_u64() as *mut u8
}

/// Current CR3 (page-table root), physical.
#[inline]
pub fn read_cr3() -> usize {
    Cr3::read().0.start_address().as_u64() as usize
}

/// Load a new page-table root. Flushes the non-global TLB.
///
/// # Safety
///
/// `root` must be the physical address of a valid top-level page table
/// mapping the currently executing code.
#[inline]
pub unsafe fn write_cr3(root: usize) {
    asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
}

/// True when the CPU was booted with 5-level paging (LA57).
pub fn five_level_paging() -> bool {
    Cr4::read().contains(Cr4Flags::L5_PAGING)
}

/// True when the CPU supports 1-GiB pages.
pub fn gib_pages_supported() -> bool {
    raw_cpuid::CpuId::new()
        .get_extended_processor_and_feature_identifiers()
        .map(|f| f.has_1gib_pages())
        .unwrap_or(false)
}

/// Trigger the scheduler-stack call gate. The handler for
/// `config::SCHED_CALL_VECTOR` reads the callback and context back out of
/// the trapped frame's `rdi`/`rsi`.
///
/// # Safety
///
/// The sched-call vector must be installed and must switch to the per-CPU
/// scheduler stack via the IST mechanism.
#[inline]
pub unsafe fn sched_call_trigger(callback: usize, ctx: usize) {
    // The handler saves and restores the full register frame; from this
    // side the trap behaves like a plain call.
    asm!("int 0x57", in("rdi") callback, in("rsi") ctx);
}

/// Park a CPU forever. Used by the panic path.
pub fn halt_forever() -> ! {
    loop {
        interrupts::disable();
        x86_64::instructions::hlt();
    }
}
