//! Per-core scheduler.
//!
//! Task selection is unfairness-driven: the pairing heap yields the task
//! that has consumed the fewest cycles. The idle-unfairness counter runs
//! while the core executes anything, and is credited to tasks when they
//! wake so a long sleeper cannot monopolize the CPU afterwards. Every
//! context switch (tick, yield, suspend, terminate) runs on the
//! scheduler stack via the sched-call vector.

use core::ptr::NonNull;

use crate::arch::{self, InterruptFrame};
use crate::config::{TIMESLICE_DEFAULT_US, TIMESLICE_MIN_US};
use crate::sched::queue::RunQueue;
use crate::sched::schedcall::sched_call;
use crate::sched::task::Task;
use crate::smp::percpu::{self, PerCpu};
use crate::smp::{ic, topology};
use crate::sync::RawTicketLock;

/// The task executing on this CPU. Only meaningful from task context.
pub fn current_task() -> NonNull<Task> {
    percpu::current()
        .sched
        .current()
        .expect("no task on this CPU")
}

/// Timeslice in microseconds for a task with `current_unfairness`, given
/// the most deserving alternative. A much less deserving alternative buys
/// the incoming task a longer slice; heavy contention cuts it to the
/// floor.
pub fn pick_timeslice(next_unfairness: Option<u64>, current_unfairness: u64, tsc_freq: u64) -> u64 {
    match next_unfairness {
        None => TIMESLICE_DEFAULT_US,
        Some(next) => {
            let diff = next.saturating_sub(current_unfairness);
            let us = diff / tsc_freq.max(1);
            us.clamp(TIMESLICE_MIN_US, TIMESLICE_DEFAULT_US)
        }
    }
}

/// Reset this core's scheduler state and mark it online. Runs on each CPU
/// before it enters the dispatch loop.
pub fn init_current() {
    let cpu = percpu::current();
    cpu.sched.set_current(None);
    cpu.sched.set_idle(false);
    cpu.set_status(percpu::STATUS_ONLINE);
}

/// Account the cycles `task` just spent on `cpu`.
fn update_unfairness(cpu: &PerCpu, queue: &mut RunQueue, task: &mut Task) {
    let diff = arch::tsc_read().wrapping_sub(task.timestamp);
    task.unfairness += diff;
    let count = cpu.sched.tasks_count.load(core::sync::atomic::Ordering::Acquire).max(1);
    queue.idle_unfairness += diff / count as u64;
}

/// Load `task` into the trap frame; it runs when the handler returns.
fn dispatch(cpu: &PerCpu, frame: &mut InterruptFrame, task: NonNull<Task>) {
    // SAFETY: the task is owned by this core now; nobody else touches it.
    let t = unsafe { &mut *task.as_ptr() };
    *frame = t.frame;
    t.timestamp = arch::tsc_read();
    cpu.sched.set_current(Some(task));
}

/// Dequeue the next task, sleeping through `hlt` when the queue is empty.
/// Returns the task and whether the core passed through idle, in which
/// case the caller must arm a fresh timeslice.
fn dequeue_blocking(cpu: &PerCpu) -> (NonNull<Task>, bool) {
    if let Some(task) = cpu.sched.lock_queue().try_dequeue() {
        return (task, false);
    }
    cpu.sched.set_idle(true);
    if let Some(tlb) = crate::mm::invtlb::global() {
        tlb.idle_enter(cpu.logical_id as usize);
    }
    let task = loop {
        arch::wait_for_interrupt();
        if let Some(task) = cpu.sched.lock_queue().try_dequeue() {
            break task;
        }
    };
    if let Some(tlb) = crate::mm::invtlb::global() {
        tlb.idle_exit(cpu.logical_id as usize);
    }
    cpu.sched.set_idle(false);
    (task, true)
}

/// Hand the CPU to the next task after the previous one left the run
/// queue. Arms a fresh timeslice when the core came out of idle (the
/// previous timer died with nobody to preempt).
fn take_next(cpu: &PerCpu, frame: &mut InterruptFrame) {
    let (next, exited_idle) = dequeue_blocking(cpu);
    if exited_idle {
        let tsc_freq = cpu.tsc_freq.load(core::sync::atomic::Ordering::Relaxed);
        let next_unfairness = cpu.sched.lock_queue().min_unfairness();
        // SAFETY: next was just dequeued; this core owns it.
        let us = pick_timeslice(next_unfairness, unsafe { next.as_ref().unfairness }, tsc_freq);
        ic::timer_one_shot(us);
    }
    dispatch(cpu, frame, next);
}

/// Timer-tick entry, called by the interrupt layer with the trap frame.
pub fn on_timer_interrupt(frame: &mut InterruptFrame) {
    let cpu = percpu::current();
    let old = cpu.sched.current().expect("timer tick without a task");
    // SAFETY: old is this core's current task; only we touch it.
    let old_ref = unsafe { &mut *old.as_ptr() };
    old_ref.frame = *frame;
    let tsc_freq = cpu.tsc_freq.load(core::sync::atomic::Ordering::Relaxed);
    let mut queue = cpu.sched.lock_queue();
    update_unfairness(cpu, &mut queue, old_ref);
    queue.enqueue(old);
    let new = queue
        .try_dequeue()
        .expect("queue cannot be empty, current was just requeued");
    // SAFETY: new was just dequeued; this core owns it.
    let us = pick_timeslice(queue.min_unfairness(), unsafe { new.as_ref().unfairness }, tsc_freq);
    drop(queue);
    ic::timer_one_shot(us);
    dispatch(cpu, frame, new);
    ic::timer_ack();
}

/// Wake-up IPI entry: nothing to do, the interrupt itself broke `hlt`.
pub fn on_wakeup_ipi(_frame: &mut InterruptFrame) {}

enum LeaveMode {
    /// Task stays runnable (yield, preemption).
    Requeue,
    /// Task parks; snapshot idle unfairness for the wake-up credit.
    Park,
}

/// Move the current task off the CPU. For `Park`, `release` (when
/// non-null) is ungrabbed after the task is off the queue and the queue
/// lock is dropped: the atomic park-and-release handoff.
fn leave_current(
    cpu: &PerCpu,
    frame: &mut InterruptFrame,
    mode: LeaveMode,
    release: *const RawTicketLock,
) {
    let old = cpu.sched.current().expect("leaving without a task");
    // SAFETY: old is this core's current task.
    let old_ref = unsafe { &mut *old.as_ptr() };
    old_ref.frame = *frame;
    let mut queue = cpu.sched.lock_queue();
    update_unfairness(cpu, &mut queue, old_ref);
    match mode {
        LeaveMode::Requeue => queue.enqueue(old),
        LeaveMode::Park => {
            old_ref.acc_unfairness_idle = queue.idle_unfairness;
            cpu.sched
                .tasks_count
                .fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
            topology::update_on_remove(cpu);
        }
    }
    cpu.sched.set_current(None);
    drop(queue);
    if !release.is_null() {
        // SAFETY: the parked task's lock() frame keeps the lock alive
        // until it is woken, which cannot happen before this release.
        unsafe { (*release).ungrab() };
    }
    take_next(cpu, frame);
}

extern "C" fn yield_handler(frame: &mut InterruptFrame, _ctx: *mut ()) {
    leave_current(percpu::current(), frame, LeaveMode::Requeue, core::ptr::null());
}

extern "C" fn suspend_handler(frame: &mut InterruptFrame, ctx: *mut ()) {
    leave_current(
        percpu::current(),
        frame,
        LeaveMode::Park,
        ctx as *const RawTicketLock,
    );
}

extern "C" fn terminate_handler(frame: &mut InterruptFrame, _ctx: *mut ()) {
    let cpu = percpu::current();
    let old = cpu.sched.current().expect("terminating without a task");
    {
        let mut queue = cpu.sched.lock_queue();
        // SAFETY: old is this core's current task.
        update_unfairness(cpu, &mut queue, unsafe { &mut *old.as_ptr() });
    }
    cpu.sched
        .tasks_count
        .fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
    topology::update_on_remove(cpu);
    cpu.sched.set_current(None);
    // SAFETY: the task is off every queue and we are on the scheduler
    // stack, not its stack.
    unsafe { Task::dispose(old) };
    take_next(cpu, frame);
}

extern "C" fn bootstrap_handler(frame: &mut InterruptFrame, _ctx: *mut ()) {
    let cpu = percpu::current();
    let (task, _) = dequeue_blocking(cpu);
    let tsc_freq = cpu.tsc_freq.load(core::sync::atomic::Ordering::Relaxed);
    let next_unfairness = cpu.sched.lock_queue().min_unfairness();
    // SAFETY: task was just dequeued; this core owns it.
    let us = pick_timeslice(next_unfairness, unsafe { task.as_ref().unfairness }, tsc_freq);
    ic::timer_one_shot(us);
    dispatch(cpu, frame, task);
}

/// Give up the CPU but stay runnable.
pub fn yield_current() {
    sched_call(yield_handler, core::ptr::null_mut());
}

/// Park the current task. When `release` is given, it is ungrabbed after
/// the task is off the run queue; the caller typically defused a guard
/// and hands over its raw lock, making park-and-unlock atomic against
/// wake-ups.
///
/// # Safety
///
/// `release`, if present, must be held by the caller and must stay valid
/// until this task is next dispatched.
pub unsafe fn suspend_current(release: Option<&RawTicketLock>) {
    let ptr = release.map_or(core::ptr::null(), |l| l as *const RawTicketLock);
    sched_call(suspend_handler, ptr as *mut ());
}

/// End the current task. Its storage is reclaimed on the scheduler stack.
pub fn terminate() -> ! {
    sched_call(terminate_handler, core::ptr::null_mut());
    unreachable!("terminated task was dispatched again");
}

/// Enter the dispatch loop on a freshly initialized core. Never returns.
pub fn bootstrap() -> ! {
    sched_call(bootstrap_handler, core::ptr::null_mut());
    unreachable!("bootstrap sched-call returned");
}

/// Make `task` runnable on its core. Credits the idle unfairness accrued
/// since the task parked, so it does not preempt everything on arrival.
///
/// # Safety
///
/// `task` must be parked (off every queue) and its `core_id` valid.
pub unsafe fn wake_up(task: NonNull<Task>) {
    // SAFETY: per the contract the task is off-queue, so this thread
    // owns it.
    let t = &mut *task.as_ptr();
    let cpu = percpu::cpu(t.core_id);
    {
        let mut queue = cpu.sched.lock_queue();
        t.unfairness += queue.idle_unfairness - t.acc_unfairness_idle;
        cpu.sched
            .tasks_count
            .fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        queue.enqueue(task);
    }
    topology::update_on_insert(cpu);
    if cpu.sched.is_idle() {
        ic::send_ipi(cpu.apic_id, crate::config::WAKEUP_IPI_VECTOR);
    }
}

/// Bind `task` to `logical_id` and make it runnable there for the first
/// time. Zeroing both unfairness fields makes the wake-up credit land the
/// task exactly at the core's current idle unfairness.
pub fn associate(logical_id: u32, task: NonNull<Task>) {
    // SAFETY: the task was just created; nothing else references it.
    unsafe {
        let t = &mut *task.as_ptr();
        t.unfairness = 0;
        t.acc_unfairness_idle = 0;
        t.core_id = logical_id;
        wake_up(task);
    }
}
