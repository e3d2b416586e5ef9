//! Scheduling topology.
//!
//! Groups form a circular ring per domain level; every CPU owns a chain of
//! domains from its leaf group upward. The initial topology is flat: each
//! CPU is a group of one, and a single shared domain ring spans the
//! machine. The balancer only ever walks rings and chains, so deeper
//! topologies (node, socket, machine) slot in without touching it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::smp::percpu::PerCpu;

pub struct SchedGroup {
    /// Next group in the circular ring.
    next: AtomicPtr<SchedGroup>,
    /// Tasks currently counted into this group. A task is counted once in
    /// every domain containing its core.
    pub tasks_count: AtomicUsize,
    /// Logical ids of member CPUs.
    pub cpus: Vec<u32>,
}

impl SchedGroup {
    pub fn next(&self) -> &'static SchedGroup {
        // SAFETY: rings are built once from leaked boxes and never torn
        // down.
        unsafe { &*self.next.load(Ordering::Acquire) }
    }
}

pub struct SchedDomain {
    /// Parent domain, null at the root.
    parent: AtomicPtr<SchedDomain>,
    /// The group this CPU belongs to at this level.
    group: AtomicPtr<SchedGroup>,
    pub last_rebalance_tsc: AtomicU64,
}

impl SchedDomain {
    pub fn group(&self) -> &'static SchedGroup {
        // SAFETY: as for SchedGroup::next.
        unsafe { &*self.group.load(Ordering::Acquire) }
    }

    pub fn parent(&self) -> Option<&'static SchedDomain> {
        let p = self.parent.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            // SAFETY: as above.
            Some(unsafe { &*p })
        }
    }
}

/// Build the flat topology over `cpus` and attach the domain chains.
pub fn build_flat(cpus: &'static [PerCpu]) {
    // One single-CPU group per core, linked into a ring.
    let mut groups: Vec<&'static SchedGroup> = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        let group: &'static SchedGroup = Box::leak(Box::new(SchedGroup {
            next: AtomicPtr::new(core::ptr::null_mut()),
            tasks_count: AtomicUsize::new(0),
            cpus: alloc::vec![cpu.logical_id],
        }));
        groups.push(group);
    }
    for i in 0..groups.len() {
        let next = groups[(i + 1) % groups.len()];
        groups[i].next.store(
            next as *const SchedGroup as *mut SchedGroup,
            Ordering::Release,
        );
    }
    // One domain per CPU, all pointing into the shared ring at the CPU's
    // own group. Flat: leaf and root coincide.
    for (i, cpu) in cpus.iter().enumerate() {
        let domain: &'static SchedDomain = Box::leak(Box::new(SchedDomain {
            parent: AtomicPtr::new(core::ptr::null_mut()),
            group: AtomicPtr::new(groups[i] as *const SchedGroup as *mut SchedGroup),
            last_rebalance_tsc: AtomicU64::new(0),
        }));
        let ptr = domain as *const SchedDomain as *mut SchedDomain;
        cpu.domain.store(ptr, Ordering::Release);
        cpu.root_domain.store(ptr, Ordering::Release);
    }
    crate::success!("smp/topology", "flat topology over {} CPU(s)", cpus.len());
}

/// Account a task inserted on `cpu`: bump every domain on its chain.
pub fn update_on_insert(cpu: &PerCpu) {
    let mut domain = domain_of(cpu);
    while let Some(d) = domain {
        d.group().tasks_count.fetch_add(1, Ordering::AcqRel);
        domain = d.parent();
    }
}

/// Account a task removed from `cpu`.
pub fn update_on_remove(cpu: &PerCpu) {
    let mut domain = domain_of(cpu);
    while let Some(d) = domain {
        d.group().tasks_count.fetch_sub(1, Ordering::AcqRel);
        domain = d.parent();
    }
}

fn domain_of(cpu: &PerCpu) -> Option<&'static SchedDomain> {
    let ptr = cpu.domain.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: domains are leaked statics once built.
        Some(unsafe { &*ptr })
    }
}
