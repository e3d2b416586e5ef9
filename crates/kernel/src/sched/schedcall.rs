//! Scheduler-stack calls.
//!
//! Preemption, yield, suspension and termination all need to manipulate
//! the current task's saved state while not running on its stack. The
//! sched-call vector (0x57) switches to the per-CPU scheduler stack via
//! the IST mechanism and invokes a callback taken from the trapped frame's
//! `rdi`/`rsi`, which makes all of them the same code path as an ordinary
//! preemption tick. The vector installation itself belongs to the
//! external interrupt layer; it routes the trap to [`handle`].

use crate::arch::InterruptFrame;

/// Callback invoked on the scheduler stack with the trapped frame.
pub type SchedCallback = extern "C" fn(&mut InterruptFrame, *mut ());

/// Trigger a scheduler-stack call. Returns when the calling task is next
/// dispatched (which for termination is never).
pub fn sched_call(callback: SchedCallback, ctx: *mut ()) {
    // SAFETY: the sched-call vector is installed during bring-up, before
    // the first task can run.
    unsafe { crate::arch::sched_call_trigger(callback as usize, ctx as usize) };
}

/// Vector-0x57 handler body: recover the callback and context from the
/// frame and run them.
///
/// # Safety
///
/// `frame` must be a trap frame produced by the sched-call vector, so that
/// `rdi`/`rsi` really carry a [`SchedCallback`] and its context.
pub unsafe fn handle(frame: &mut InterruptFrame) {
    let callback: SchedCallback = core::mem::transmute(frame.rdi as usize);
    let ctx = frame.rsi as usize as *mut ();
    callback(frame, ctx);
}
