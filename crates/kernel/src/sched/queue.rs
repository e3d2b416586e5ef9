//! Per-core run queue.
//!
//! A pairing heap keyed by unfairness under a per-core ticket lock, plus
//! the idle flag and task count the balancer and wake-up path read
//! without taking it. Enqueueing, the idle-credit arithmetic and the
//! wake-up IPI to idle cores all live in `localsched`, which does them
//! under a single lock acquisition.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::collections::PairingHeap;
use crate::sched::task::Task;
use crate::sync::{SpinGuard, SpinLock};

/// Heap entry: unfairness snapshot plus the task. The snapshot is taken at
/// insertion; a task's unfairness only changes while it is off the heap.
struct QueuedTask {
    key: u64,
    task: NonNull<Task>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

pub struct RunQueue {
    heap: PairingHeap<QueuedTask>,
    /// Accumulated while this core runs any task; credits woken sleepers.
    pub idle_unfairness: u64,
}

// SAFETY: task pointers are only dereferenced under the queue lock or by
// the core that dequeued them.
unsafe impl Send for RunQueue {}

impl RunQueue {
    pub fn enqueue(&mut self, task: NonNull<Task>) {
        // SAFETY: caller hands over ownership; the task is off-CPU.
        let key = unsafe { task.as_ref().unfairness };
        self.heap.push(QueuedTask { key, task });
    }

    pub fn try_dequeue(&mut self) -> Option<NonNull<Task>> {
        self.heap.pop_min().map(|q| q.task)
    }

    /// Unfairness of the most deserving queued task.
    pub fn min_unfairness(&self) -> Option<u64> {
        self.heap.peek_min().map(|q| q.key)
    }
}

pub struct LocalScheduler {
    queue: SpinLock<RunQueue>,
    /// True while the core sits in the dispatch loop with nothing to run.
    idle: AtomicBool,
    /// Tasks owned by this core (runnable or current). Read lock-free by
    /// the balancer.
    pub tasks_count: AtomicUsize,
    /// Task currently on the CPU, null when idle. Written only by the
    /// owning core.
    current: AtomicPtr<Task>,
}

impl LocalScheduler {
    pub const fn new() -> Self {
        LocalScheduler {
            queue: SpinLock::new(RunQueue {
                heap: PairingHeap::new(),
                idle_unfairness: 0,
            }),
            idle: AtomicBool::new(false),
            tasks_count: AtomicUsize::new(0),
            current: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn lock_queue(&self) -> SpinGuard<'_, RunQueue> {
        self.queue.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    pub fn current(&self) -> Option<NonNull<Task>> {
        NonNull::new(self.current.load(Ordering::Acquire))
    }

    pub fn set_current(&self, task: Option<NonNull<Task>>) {
        let ptr = task.map(NonNull::as_ptr).unwrap_or(core::ptr::null_mut());
        self.current.store(ptr, Ordering::Release);
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Task;

    extern "C" fn never(_: usize) -> ! {
        unreachable!();
    }

    fn task_with_unfairness(unfairness: u64) -> NonNull<Task> {
        let task = Task::create(never, 0).unwrap();
        unsafe { (*task.as_ptr()).unfairness = unfairness };
        task
    }

    #[test]
    fn dequeue_prefers_least_unfairness() {
        let sched = LocalScheduler::new();
        let t_high = task_with_unfairness(500);
        let t_low = task_with_unfairness(10);
        let t_mid = task_with_unfairness(100);
        {
            let mut q = sched.lock_queue();
            q.enqueue(t_high);
            q.enqueue(t_low);
            q.enqueue(t_mid);
            assert_eq!(q.min_unfairness(), Some(10));
            assert_eq!(q.try_dequeue(), Some(t_low));
            assert_eq!(q.try_dequeue(), Some(t_mid));
            assert_eq!(q.try_dequeue(), Some(t_high));
            assert_eq!(q.try_dequeue(), None);
        }
        for t in [t_high, t_low, t_mid] {
            unsafe { Task::dispose(t) };
        }
    }

    #[test]
    fn current_slot_round_trips() {
        let sched = LocalScheduler::new();
        assert!(sched.current().is_none());
        let t = task_with_unfairness(1);
        sched.set_current(Some(t));
        assert_eq!(sched.current(), Some(t));
        sched.set_current(None);
        assert!(sched.current().is_none());
        unsafe { Task::dispose(t) };
    }
}
