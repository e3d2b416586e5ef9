//! Kernel heap.
//!
//! Size-classed slub allocator: 64-KiB slubs carved into power-of-two
//! blocks (16 bytes up to 2 KiB), with free lists per NUMA node so
//! allocations stay local. Requests of a page and up bypass straight to
//! the physical allocator. The slub header at each 64-KiB boundary names
//! the owning node, so free is a mask away from the right list.
//!
//! Because physical allocations only guarantee page alignment, slubs are
//! taken in 64-slub chunks and the misaligned edges are leaked. The chunk
//! may land on a different node than requested; its slubs are credited to
//! the node that actually backs them.

use core::ptr::NonNull;

use crate::config::{HEAP_CHUNK_SLUBS, HEAP_MIN_ORDER, HEAP_ORDER_COUNT, HEAP_SLUB_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::mm::numa::{Numa, NumaId};
use crate::mm::phys;
use crate::mm::{align_down, align_up};

/// Per-node heap state, guarded by the NUMA registry lock. Links are
/// virtual addresses written into the free blocks and slub headers
/// themselves; zero terminates a list.
pub struct HeapNodeState {
    free_lists: [usize; HEAP_ORDER_COUNT],
    /// Not-yet-carved slubs.
    empty_slubs: usize,
}

impl HeapNodeState {
    pub const fn new() -> Self {
        HeapNodeState {
            free_lists: [0; HEAP_ORDER_COUNT],
            empty_slubs: 0,
        }
    }
}

impl Default for HeapNodeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Header at the base of every 64-KiB slub.
#[repr(C)]
struct SlubHeader {
    owner: NumaId,
    /// Link in the owning node's empty-slub list while uncarved.
    next_free: usize,
}

/// Size class order: `HEAP_MIN_ORDER..HEAP_ORDER_COUNT`, or
/// `HEAP_ORDER_COUNT` for requests that must bypass to the physical
/// allocator.
fn size_order(size: usize) -> usize {
    let size = size.max(1 << HEAP_MIN_ORDER);
    let mut order = HEAP_MIN_ORDER;
    let mut current = 1usize << HEAP_MIN_ORDER;
    while size > current {
        order += 1;
        if order == HEAP_ORDER_COUNT {
            return HEAP_ORDER_COUNT;
        }
        current *= 2;
    }
    order
}

/// Allocate `size` bytes on behalf of `node_id`. Small sizes come from the
/// node's slub lists (or the nearest node with memory); large ones from
/// the physical allocator through the higher-half window. The block is
/// aligned to the size class.
pub fn alloc(numa: &Numa, node_id: NumaId, size: usize) -> Result<NonNull<u8>> {
    let order = size_order(size);
    if order == HEAP_ORDER_COUNT {
        let mut st = numa.lock();
        let window = st.window;
        let (addr, _) = phys::alloc_on_behalf_locked(&mut st, node_id, align_up(size, PAGE_SIZE))?;
        return NonNull::new(window.translate(addr)).ok_or(Error::OutOfMemory);
    }

    let mut st = numa.lock();
    // Fast path: the node's own free list.
    {
        let node = st.node_mut(node_id).ok_or(Error::InvalidHandle)?;
        if let Some(block) = pop_block(&mut node.heap, order) {
            return Ok(block);
        }
        // Carve one of the node's empty slubs.
        if node.heap.empty_slubs != 0 {
            carve_slub(&mut node.heap, order);
            let block = pop_block(&mut node.heap, order).expect("freshly carved slub is empty");
            return Ok(block);
        }
    }
    // Ask the physical allocator for a chunk of slubs. It may place the
    // chunk on a different node; the slubs belong to that node, and so
    // does the block handed back.
    let real_node = refill_chunk(&mut st, node_id)?;
    let node = st.node_mut(real_node).expect("refill returned a dead node");
    if node.heap.empty_slubs == 0 {
        // The chunk was entirely consumed by alignment; treat as OOM.
        return Err(Error::OutOfMemory);
    }
    carve_slub(&mut node.heap, order);
    let block = pop_block(&mut node.heap, order).expect("freshly carved slub is empty");
    Ok(block)
}

/// Free a block of `size` bytes returned by [`alloc`]. Small blocks go
/// back to the free list of the node named in their slub header, which is
/// not necessarily the node they were requested for.
pub fn free(numa: &Numa, ptr: NonNull<u8>, size: usize) {
    let order = size_order(size);
    if order == HEAP_ORDER_COUNT {
        let mut st = numa.lock();
        let addr = st.window.untranslate(ptr.as_ptr());
        phys::free_locked(&mut st, addr);
        return;
    }
    let mut st = numa.lock();
    let header_addr = align_down(ptr.as_ptr() as usize, HEAP_SLUB_SIZE);
    // SAFETY: every small block lives inside a slub whose header sits at
    // the enclosing 64-KiB boundary.
    let owner = unsafe { (*(header_addr as *const SlubHeader)).owner };
    let node = st.node_mut(owner).expect("slub owned by unknown node");
    let addr = ptr.as_ptr() as usize;
    // SAFETY: the block is no longer referenced; its first word becomes
    // the list link.
    unsafe { *(addr as *mut usize) = node.heap.free_lists[order] };
    node.heap.free_lists[order] = addr;
}

fn pop_block(heap: &mut HeapNodeState, order: usize) -> Option<NonNull<u8>> {
    let head = heap.free_lists[order];
    if head == 0 {
        return None;
    }
    // SAFETY: list links are written by free/carve into live blocks.
    heap.free_lists[order] = unsafe { *(head as *const usize) };
    NonNull::new(head as *mut u8)
}

/// Take one empty slub and shatter it into `order`-class blocks, pushed
/// onto the node's free list. The first block starts past the header,
/// aligned to the class size.
fn carve_slub(heap: &mut HeapNodeState, order: usize) {
    debug_assert_ne!(heap.empty_slubs, 0);
    let slub = heap.empty_slubs;
    // SAFETY: slub heads the empty list; its header is initialized.
    heap.empty_slubs = unsafe { (*(slub as *const SlubHeader)).next_free };
    let block_size = 1usize << order;
    let start = align_up(slub + core::mem::size_of::<SlubHeader>(), block_size);
    let end = slub + HEAP_SLUB_SIZE;
    let mut addr = start;
    while addr + block_size <= end {
        // SAFETY: carving a region this allocator owns exclusively.
        unsafe { *(addr as *mut usize) = heap.free_lists[order] };
        heap.free_lists[order] = addr;
        addr += block_size;
    }
}

/// Allocate a chunk of slubs and thread them onto the empty-slub list of
/// whichever node actually backed the chunk. Returns that node.
fn refill_chunk(st: &mut crate::mm::numa::NumaState, node_id: NumaId) -> Result<NumaId> {
    let chunk_size = HEAP_CHUNK_SLUBS * HEAP_SLUB_SIZE;
    let (addr, range_id) = phys::alloc_on_behalf_locked(st, node_id, chunk_size)?;
    let real_node = st.ranges.get(range_id).expect("dangling range id").node;
    let window = st.window;
    let begin = align_up(addr, HEAP_SLUB_SIZE);
    let end = align_down(addr + chunk_size, HEAP_SLUB_SIZE);
    let node = st.node_mut(real_node).expect("range owned by unknown node");
    let mut phys_addr = begin;
    while phys_addr < end {
        let va = window.translate(phys_addr) as usize;
        // SAFETY: fresh slub memory, exclusively ours.
        unsafe {
            (*(va as *mut SlubHeader)).owner = real_node;
            (*(va as *mut SlubHeader)).next_free = node.heap.empty_slubs;
        }
        node.heap.empty_slubs = va;
        phys_addr += HEAP_SLUB_SIZE;
    }
    crate::debug!(
        "mem/heap",
        "chunk {:#x}..{:#x} credited to node {}",
        begin,
        end,
        real_node
    );
    Ok(real_node)
}

/// Global allocator adapter: routes Rust's `alloc`/`dealloc` through the
/// heap on behalf of the current CPU's node, making `Box` and `Vec`
/// NUMA-aware kernel-wide.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod global {
    use core::alloc::{GlobalAlloc, Layout};

    use super::{alloc, free};
    use crate::mm::numa_registry;

    pub struct KernelAllocator;

    fn effective_size(layout: Layout) -> usize {
        // Size classes are power-of-two aligned, so serving
        // max(size, align) guarantees the requested alignment.
        layout.size().max(layout.align())
    }

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let numa = numa_registry();
            let node = crate::smp::percpu::try_current()
                .map(|cpu| cpu.numa_id)
                .unwrap_or_else(|| numa.lock().first_node_id());
            match alloc(numa, node, effective_size(layout)) {
                Ok(ptr) => ptr.as_ptr(),
                Err(_) => core::ptr::null_mut(),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if let Some(ptr) = core::ptr::NonNull::new(ptr) {
                free(numa_registry(), ptr, effective_size(layout));
            }
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}
