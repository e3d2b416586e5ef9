//! Physical memory allocator.
//!
//! Each memory range owns a slub: buddy-style per-order free lists fed by
//! a bump (`brk`) frontier. Splitting halves blocks down to the requested
//! order; freed blocks re-enter their list and are never coalesced, which
//! trades external fragmentation for constant-time free. The NUMA-aware
//! wrapper walks the requesting node's neighbor list closest-first and
//! records the owning range per page so free can route blocks back.

use crate::config::{PAGE_SHIFT, PAGE_SIZE, PHYS_ORDER_COUNT};
use crate::error::{Error, Result};
use crate::mm::numa::{Numa, NumaId, NumaState, RangeId};
use crate::mm::{align_up, PhysAddr, PhysWindow, PHYS_NULL};

/// Per-range buddy-style allocator. Free-list links live inside the free
/// blocks themselves, reached through the physical window.
pub struct PhysSlub {
    base: PhysAddr,
    length: usize,
    /// Bytes handed out by the bump frontier.
    brk_bytes: usize,
    free_lists: [PhysAddr; PHYS_ORDER_COUNT],
    /// Highest order with a non-empty free list.
    max_freed_order: usize,
    window: PhysWindow,
}

/// Order of the smallest power of two holding `size`, clamped to the page
/// order. `PHYS_ORDER_COUNT` means the request is too large to serve.
fn order_for(size: usize) -> usize {
    let mut current = PAGE_SIZE;
    let mut order = PAGE_SHIFT;
    while order < PHYS_ORDER_COUNT {
        if size <= current {
            return order;
        }
        current *= 2;
        order += 1;
    }
    PHYS_ORDER_COUNT
}

impl PhysSlub {
    pub fn new(base: PhysAddr, length: usize, window: PhysWindow) -> Self {
        PhysSlub {
            base,
            length,
            brk_bytes: 0,
            free_lists: [PHYS_NULL; PHYS_ORDER_COUNT],
            max_freed_order: 0,
            window,
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn length(&self) -> usize {
        self.length
    }

    fn enqueue(&mut self, order: usize, block: PhysAddr) {
        if self.max_freed_order < order {
            self.max_freed_order = order;
        }
        // SAFETY: block is a free block inside this range; the window maps
        // it. Its first word becomes the list link.
        unsafe {
            *(self.window.translate(block) as *mut PhysAddr) = self.free_lists[order];
        }
        self.free_lists[order] = block;
    }

    fn dequeue(&mut self, order: usize) -> PhysAddr {
        let block = self.free_lists[order];
        debug_assert_ne!(block, PHYS_NULL);
        // SAFETY: block heads the free list, so its first word is a link.
        let next = unsafe { *(self.window.translate(block) as *const PhysAddr) };
        self.free_lists[order] = next;
        if next == PHYS_NULL && self.max_freed_order == order {
            // Walk down to the next non-empty list.
            let mut new_max = 0;
            for i in (0..order).rev() {
                if self.free_lists[i] != PHYS_NULL {
                    new_max = i;
                    break;
                }
            }
            self.max_freed_order = new_max;
        }
        block
    }

    /// Halve a block of `order` repeatedly, parking each upper half on the
    /// matching list, until `target` is reached.
    fn split_until(&mut self, base: PhysAddr, order: usize, target: usize) {
        let mut order = order;
        while order > target {
            order -= 1;
            self.enqueue(order, base + (1 << order));
        }
    }

    /// Allocate `size` bytes (page-granular). Returns `PHYS_NULL` when the
    /// range cannot satisfy the request.
    pub fn alloc(&mut self, size: usize) -> PhysAddr {
        debug_assert_eq!(size % PAGE_SIZE, 0, "non-granular phys allocation");
        let order = order_for(size);
        if order == PHYS_ORDER_COUNT {
            return PHYS_NULL;
        }
        // First fit from the requested order upward; split the remainder
        // back down. The block is returned on every path.
        let mut i = order;
        while i <= self.max_freed_order {
            if self.free_lists[i] != PHYS_NULL {
                let block = self.dequeue(i);
                self.split_until(block, i, order);
                return block;
            }
            i += 1;
        }
        // No free list can help; advance the frontier.
        let block_size = 1usize << order;
        let new_brk = self.brk_bytes + block_size;
        if new_brk <= self.length {
            let block = self.base + self.brk_bytes;
            self.brk_bytes = new_brk;
            return block;
        }
        PHYS_NULL
    }

    /// Return a block. Enqueued at its order; blocks never merge back.
    pub fn free(&mut self, addr: PhysAddr, size: usize) {
        let order = order_for(size);
        debug_assert!(order < PHYS_ORDER_COUNT);
        debug_assert!(addr >= self.base && addr + (1 << order) <= self.base + self.length);
        self.enqueue(order, addr);
    }
}

/// Metadata for one allocated physical block.
#[derive(Clone, Copy)]
pub struct PhysObjectData {
    pub range: RangeId,
    pub size: usize,
}

/// Flat table indexed by page number, covering all of physical space.
/// Allocated from the physical allocator itself during init and accessed
/// only under the NUMA lock.
pub struct PhysMetaTable {
    table: *mut PhysObjectData,
    pages: usize,
}

// SAFETY: the table pointer is only dereferenced under the NUMA lock.
unsafe impl Send for PhysMetaTable {}

impl PhysMetaTable {
    fn record(&mut self, addr: PhysAddr, data: PhysObjectData) {
        let index = addr >> PAGE_SHIFT;
        debug_assert!(index < self.pages);
        // SAFETY: index bounds-checked against the table extent.
        unsafe { self.table.add(index).write(data) };
    }

    fn lookup(&self, addr: PhysAddr) -> PhysObjectData {
        let index = addr >> PAGE_SHIFT;
        debug_assert!(index < self.pages);
        // SAFETY: index bounds-checked against the table extent.
        unsafe { self.table.add(index).read() }
    }
}

/// Allocate without touching metadata. Walks the node's neighbor list in
/// distance order; within a neighbor, permanent ranges in registration
/// order. Returns the block and the owning range.
pub fn alloc_on_behalf_nometa(
    st: &mut NumaState,
    node_id: NumaId,
    size: usize,
) -> Result<(PhysAddr, RangeId)> {
    let neighbors = st
        .node(node_id)
        .ok_or(Error::InvalidHandle)?
        .neighbors
        .clone();
    for neighbor_id in neighbors {
        let range_ids = match st.node(neighbor_id) {
            Some(node) => node.permanent_ranges.clone(),
            None => continue,
        };
        for range_id in range_ids {
            let range = st.ranges.get_mut(range_id).expect("dangling range id");
            let addr = range.slub.alloc(size);
            if addr != PHYS_NULL {
                return Ok((addr, range_id));
            }
        }
    }
    Err(Error::OutOfMemory)
}

/// Allocate on behalf of `node_id` with metadata recorded, on an already
/// locked registry. The heap's refill path calls this mid-allocation.
pub fn alloc_on_behalf_locked(
    st: &mut NumaState,
    node_id: NumaId,
    size: usize,
) -> Result<(PhysAddr, RangeId)> {
    let (addr, range_id) = alloc_on_behalf_nometa(st, node_id, size)?;
    let meta = st.meta.as_mut().expect("physical allocator not initialized");
    meta.record(
        addr,
        PhysObjectData {
            range: range_id,
            size,
        },
    );
    Ok((addr, range_id))
}

/// NUMA-aware allocation entry point.
pub fn alloc_on_behalf(numa: &Numa, node_id: NumaId, size: usize) -> Result<PhysAddr> {
    let mut st = numa.lock();
    alloc_on_behalf_locked(&mut st, node_id, size).map(|(addr, _)| addr)
}

/// Free a block returned by [`alloc_on_behalf`].
pub fn free(numa: &Numa, addr: PhysAddr) {
    let mut st = numa.lock();
    free_locked(&mut st, addr);
}

pub fn free_locked(st: &mut NumaState, addr: PhysAddr) {
    let data = st
        .meta
        .as_ref()
        .expect("physical allocator not initialized")
        .lookup(addr);
    let range = st.ranges.get_mut(data.range).expect("dangling range id");
    range.slub.free(addr, data.size);
}

/// Owning NUMA node of an allocated block.
pub fn owner_of(st: &NumaState, addr: PhysAddr) -> NumaId {
    let data = st
        .meta
        .as_ref()
        .expect("physical allocator not initialized")
        .lookup(addr);
    st.ranges.get(data.range).expect("dangling range id").node
}

/// Self-host the metadata table: size it for `phys_space_size` bytes of
/// physical space and allocate it from the allocator it will describe, on
/// the boot node's locality.
pub fn init_metadata(numa: &Numa, phys_space_size: usize) -> Result<()> {
    let mut st = numa.lock();
    assert!(st.meta.is_none(), "physical allocator initialized twice");
    let pages = align_up(phys_space_size, PAGE_SIZE) >> PAGE_SHIFT;
    let table_bytes = align_up(pages * core::mem::size_of::<PhysObjectData>(), PAGE_SIZE);
    let boot_node = st.boot_node;
    let (addr, _) = alloc_on_behalf_nometa(&mut st, boot_node, table_bytes)?;
    let table = st.window.translate(addr) as *mut PhysObjectData;
    st.meta = Some(PhysMetaTable { table, pages });
    crate::info!(
        "mem/phys",
        "metadata table for {} pages at {:#x}",
        pages,
        addr
    );
    Ok(())
}
