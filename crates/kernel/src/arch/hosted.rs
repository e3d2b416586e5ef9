//! Hosted stand-ins.
//!
//! These keep the kernel compiling and unit-testing on a development host.
//! They model the architectural state just enough for the lock and
//! scheduler bookkeeping to hold together; nothing here touches real
//! privileged state.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

static INT_ENABLED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(true);
static PERCPU: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());
static FAKE_TSC: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn interrupts_disable() -> bool {
    INT_ENABLED.swap(false, Ordering::Relaxed)
}

#[inline]
pub fn interrupts_restore(was_enabled: bool) {
    INT_ENABLED.store(was_enabled, Ordering::Relaxed);
}

#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

#[inline]
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// Monotonic stand-in for the timestamp counter.
#[inline]
pub fn tsc_read() -> u64 {
    FAKE_TSC.fetch_add(1, Ordering::Relaxed)
}

pub fn set_percpu_ptr(ptr: *mut u8) {
    PERCPU.store(ptr, Ordering::Release);
}

#[inline]
pub fn percpu_ptr() -> *mut u8 {
    PERCPU.load(Ordering::Acquire)
}

#[inline]
pub fn read_cr3() -> usize {
    0
}

/// # Safety
///
/// No-op on hosted builds.
#[inline]
pub unsafe fn write_cr3(_root: usize) {}

pub fn five_level_paging() -> bool {
    false
}

pub fn gib_pages_supported() -> bool {
    false
}

/// # Safety
///
/// Never callable on hosted builds; there is no scheduler stack.
pub unsafe fn sched_call_trigger(_callback: usize, _ctx: usize) {
    unreachable!("sched-stack calls require a bare-metal build");
}

pub fn halt_forever() -> ! {
    panic!("halt_forever on a hosted build");
}
