//! Task objects.

use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::arch::InterruptFrame;
use crate::config::TASK_STACK_SIZE;
use crate::error::{Error, Result};
use crate::mm::paging::Mapper;

/// Flat-GDT selectors; the descriptor tables themselves are installed by
/// the external arch layer, this is the agreed layout.
pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_SS: u64 = 0x10;

pub struct Task {
    /// Saved register state, loaded on dispatch.
    pub frame: InterruptFrame,
    /// Cycles consumed while running; the scheduler's priority key.
    pub unfairness: u64,
    /// Core idle-unfairness snapshot taken when the task was suspended,
    /// consumed as a credit on wake-up.
    pub acc_unfairness_idle: u64,
    /// TSC at last dispatch.
    pub timestamp: u64,
    /// Core the task currently belongs to.
    pub core_id: u32,
    /// Pre-zeroed page cache for page-table walks.
    pub mapper: Mapper,
    /// Owned kernel stack; the frame's rsp starts at its top.
    stack: Option<Box<[u8]>>,
}

impl Task {
    /// Build a runnable task entering `entry(arg)`. The task is returned
    /// as a raw pointer because ownership migrates between run queues,
    /// sleep queues and the current-task slot; `dispose` reclaims it.
    pub fn create(entry: extern "C" fn(usize) -> !, arg: usize) -> Result<NonNull<Task>> {
        let stack = alloc::vec![0u8; TASK_STACK_SIZE].into_boxed_slice();
        let stack_top = stack.as_ptr() as u64 + TASK_STACK_SIZE as u64;
        let levels = if crate::arch::five_level_paging() { 5 } else { 4 };
        let node = crate::smp::percpu::try_current()
            .map(|cpu| cpu.numa_id)
            .unwrap_or(0);
        let mut frame = InterruptFrame::default();
        frame.rip = entry as usize as u64;
        frame.rdi = arg as u64;
        frame.rsp = stack_top;
        frame.cs = KERNEL_CS;
        frame.ss = KERNEL_SS;
        frame.rflags = InterruptFrame::RFLAGS_IF;
        let task = Box::new(Task {
            frame,
            unfairness: 0,
            acc_unfairness_idle: 0,
            timestamp: 0,
            core_id: 0,
            mapper: Mapper::new(levels, node),
            stack: Some(stack),
        });
        NonNull::new(Box::into_raw(task)).ok_or(Error::OutOfMemory)
    }

    /// Wrap an already-running context (the boot CPU's initial thread)
    /// into a task so it can suspend and be rescheduled like any other.
    pub fn adopt_current() -> Result<NonNull<Task>> {
        let levels = if crate::arch::five_level_paging() { 5 } else { 4 };
        let node = crate::smp::percpu::try_current()
            .map(|cpu| cpu.numa_id)
            .unwrap_or(0);
        let task = Box::new(Task {
            frame: InterruptFrame::default(),
            unfairness: 0,
            acc_unfairness_idle: 0,
            timestamp: 0,
            core_id: 0,
            mapper: Mapper::new(levels, node),
            stack: None,
        });
        NonNull::new(Box::into_raw(task)).ok_or(Error::OutOfMemory)
    }

    /// Reclaim a task that is off every queue.
    ///
    /// # Safety
    ///
    /// `task` must have come from `create`/`adopt_current` and must not be
    /// referenced by any queue or CPU afterwards.
    pub unsafe fn dispose(task: NonNull<Task>) {
        let mut task = Box::from_raw(task.as_ptr());
        task.mapper.dispose(crate::mm::numa_registry());
        // Stack and task storage drop here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn idle_entry(_: usize) -> ! {
        unreachable!("test tasks never run");
    }

    #[test]
    fn created_task_frame_enters_at_entry() {
        let task = Task::create(idle_entry, 0x1234).unwrap();
        let t = unsafe { task.as_ref() };
        assert_eq!(t.frame.rip, idle_entry as usize as u64);
        assert_eq!(t.frame.rdi, 0x1234);
        assert_eq!(t.frame.rflags & InterruptFrame::RFLAGS_IF, InterruptFrame::RFLAGS_IF);
        assert_eq!(t.frame.rsp % 16, 0);
        assert_eq!(t.unfairness, 0);
        unsafe { Task::dispose(task) };
    }
}
