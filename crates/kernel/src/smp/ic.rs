//! Interrupt-controller seam.
//!
//! The LAPIC programming itself lives outside this crate; the scheduler
//! only needs these three operations. The platform installs its controller
//! at boot. Before that (and on hosted builds) the operations are inert,
//! which is harmless: with one CPU and no timer there is nobody to signal.

use core::sync::atomic::{AtomicPtr, Ordering};

pub trait InterruptController: Sync {
    /// Fire-and-forget IPI to the CPU with the given APIC id.
    fn send_ipi(&self, apic_id: u32, vector: u8);
    /// Arm the one-shot timer on the current CPU.
    fn timer_one_shot(&self, microseconds: u64);
    /// Acknowledge the current timer interrupt.
    fn timer_ack(&self);
}

struct ControllerSlot(&'static dyn InterruptController);

static CONTROLLER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn set_controller(controller: &'static dyn InterruptController) {
    let slot = alloc::boxed::Box::leak(alloc::boxed::Box::new(ControllerSlot(controller)));
    CONTROLLER.store(slot as *mut ControllerSlot as *mut (), Ordering::Release);
}

pub fn controller() -> Option<&'static dyn InterruptController> {
    let ptr = CONTROLLER.load(Ordering::Acquire) as *const ControllerSlot;
    if ptr.is_null() {
        return None;
    }
    // Slots are leaked, never freed.
    Some(unsafe { (*ptr).0 })
}

pub fn send_ipi(apic_id: u32, vector: u8) {
    if let Some(ic) = controller() {
        ic.send_ipi(apic_id, vector);
    }
}

pub fn timer_one_shot(microseconds: u64) {
    if let Some(ic) = controller() {
        ic.timer_one_shot(microseconds);
    }
}

pub fn timer_ack() {
    if let Some(ic) = controller() {
        ic.timer_ack();
    }
}
