//! Load balancer.
//!
//! Placement for newly runnable tasks: from the requesting CPU's root
//! domain, pick the group with the fewest tasks (one circular walk), then
//! the least-loaded CPU inside it, and wake the task there. The domain
//! counts are bumped by the wake-up path, so concurrent placements see
//! each other with at most one-ring staleness.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::error::Result;
use crate::sched::{localsched, task::Task};
use crate::smp::percpu::{self, PerCpu};
use crate::smp::topology::SchedGroup;

/// Least-loaded CPU in `group` by local task count.
fn least_busy_cpu(cpus: &[PerCpu], group: &SchedGroup) -> u32 {
    debug_assert!(!group.cpus.is_empty(), "scheduling group without CPUs");
    let mut best = group.cpus[0];
    let mut best_load = usize::MAX;
    for &id in &group.cpus {
        let load = cpus[id as usize].sched.tasks_count.load(Ordering::Acquire);
        if load < best_load {
            best = id;
            best_load = load;
        }
    }
    best
}

/// Least-loaded group in the ring rooted at `from`'s root domain.
fn least_busy_group(from: &PerCpu) -> &'static SchedGroup {
    let root = from.root_domain.load(Ordering::Acquire);
    assert!(!root.is_null(), "balancing before topology build");
    // SAFETY: domains are leaked statics once built.
    let start = unsafe { &*root }.group();
    let mut best = start;
    let mut best_load = start.tasks_count.load(Ordering::Acquire);
    let mut current = start.next();
    while !core::ptr::eq(current, start) {
        let load = current.tasks_count.load(Ordering::Acquire);
        if load < best_load {
            best = current;
            best_load = load;
        }
        current = current.next();
    }
    best
}

/// Place `task` on the least-loaded core visible from `from`.
pub fn allocate_to_any(cpus: &'static [PerCpu], from: &PerCpu, task: NonNull<Task>) {
    let group = least_busy_group(from);
    let cpu_id = least_busy_cpu(cpus, group);
    localsched::associate(cpu_id, task);
}

/// Create a task entering `entry(arg)` and hand it to the balancer from
/// the current CPU.
pub fn spawn(entry: extern "C" fn(usize) -> !, arg: usize) -> Result<NonNull<Task>> {
    let task = Task::create(entry, arg)?;
    allocate_to_any(percpu::cpus(), percpu::current(), task);
    Ok(task)
}
