//! Page-table maintenance.
//!
//! One root per paging hierarchy, guarded by its own spinlock. Walk state
//! never allocates under the lock: each task carries a mapper stocked with
//! pre-zeroed pages for the intermediate levels, refilled from the
//! physical allocator between operations. Unmapping and permission
//! tightening schedule a global TLB shootdown; mapping a previously absent
//! entry does not, since no TLB can hold a stale translation for it.

use bitflags::bitflags;

use crate::config::{PAGE_SIZE, PAGE_SHIFT};
use crate::error::{Error, Result};
use crate::mm::invtlb::TlbCoordinator;
use crate::mm::numa::{Numa, NumaId};
use crate::mm::phys;
use crate::mm::{PhysAddr, PhysWindow, PHYS_NULL};
use crate::sync::SpinLock;

bitflags! {
    /// Leaf mapping permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const WRITABLE = 1 << 0;
        const EXECUTABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

const ENTRY_PRESENT: u64 = 1;
const ENTRY_WRITABLE: u64 = 1 << 1;
const ENTRY_USER: u64 = 1 << 2;
const ENTRY_NOEXEC: u64 = 1 << 63;
/// Bits that are not part of the physical frame address.
const ENTRY_FLAGS_MASK: u64 = 0o777 | ENTRY_NOEXEC;

const ENTRIES_PER_TABLE: usize = 512;

struct RootState {
    cr3: PhysAddr,
}

/// One paging hierarchy: a CR3 value plus the lock serializing walks.
pub struct PagingRoot {
    state: SpinLock<RootState>,
    window: PhysWindow,
    /// 5 with LA57, otherwise 4.
    levels: u8,
}

/// Task-local cache of zeroed pages for intermediate levels: up to 4 for
/// 5-level paging, 3 for 4-level. Refilled outside the root lock.
pub struct Mapper {
    zeroed_pages: [PhysAddr; 4],
    levels: u8,
    /// Locality the cache refills from.
    node: NumaId,
}

impl Mapper {
    /// An empty mapper; the first map operation fills it.
    pub fn new(levels: u8, node: NumaId) -> Self {
        Mapper {
            zeroed_pages: [PHYS_NULL; 4],
            levels,
            node,
        }
    }

    fn cache_slots(&self) -> usize {
        (self.levels - 1) as usize
    }

    /// Top up the cache from the physical allocator.
    pub fn refill(&mut self, numa: &Numa) -> Result<()> {
        for i in 0..self.cache_slots() {
            if self.zeroed_pages[i] == PHYS_NULL {
                self.zeroed_pages[i] = alloc_zeroed_page(numa, self.node)?;
            }
        }
        Ok(())
    }

    /// Release cached pages (task teardown).
    pub fn dispose(&mut self, numa: &Numa) {
        for slot in &mut self.zeroed_pages[..(self.levels - 1) as usize] {
            if *slot != PHYS_NULL {
                phys::free(numa, *slot);
                *slot = PHYS_NULL;
            }
        }
    }

    fn take(&mut self) -> PhysAddr {
        for slot in &mut self.zeroed_pages[..(self.levels - 1) as usize] {
            if *slot != PHYS_NULL {
                return core::mem::replace(slot, PHYS_NULL);
            }
        }
        PHYS_NULL
    }
}

fn alloc_zeroed_page(numa: &Numa, node: NumaId) -> Result<PhysAddr> {
    let window = numa.lock().window;
    let addr = phys::alloc_on_behalf(numa, node, PAGE_SIZE)?;
    // SAFETY: freshly allocated page, mapped through the window.
    unsafe { core::ptr::write_bytes(window.translate(addr), 0, PAGE_SIZE) };
    Ok(addr)
}

/// Table index of `vaddr` at `level` (leaf is level 1).
fn level_index(vaddr: usize, level: u8) -> usize {
    (vaddr >> (9 * (level as usize - 1) + PAGE_SHIFT)) & 0o777
}

impl PagingRoot {
    /// Build a fresh hierarchy. The new top-level table's upper half is
    /// copied from `upper_template` (the running kernel's root) so every
    /// hierarchy shares the kernel mappings.
    pub fn new(
        numa: &Numa,
        node: NumaId,
        levels: u8,
        upper_template: Option<PhysAddr>,
    ) -> Result<Self> {
        let window = numa.lock().window;
        let cr3 = alloc_zeroed_page(numa, node)?;
        if let Some(template) = upper_template {
            let src = window.translate(template) as *const u64;
            let dst = window.translate(cr3) as *mut u64;
            for i in ENTRIES_PER_TABLE / 2..ENTRIES_PER_TABLE {
                // SAFETY: both tables are live page-size tables in the
                // window.
                unsafe { dst.add(i).write(src.add(i).read()) };
            }
        }
        Ok(PagingRoot {
            state: SpinLock::new(RootState { cr3 }),
            window,
            levels,
        })
    }

    pub fn cr3(&self) -> PhysAddr {
        self.state.lock().cr3
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    fn entry_ptr(&self, table: PhysAddr, index: usize) -> *mut u64 {
        // SAFETY: table is a live page table inside the window.
        unsafe { (self.window.translate(table) as *mut u64).add(index) }
    }

    /// Map the 4-KiB page at `vaddr` to `paddr`. Missing intermediate
    /// levels are installed from the mapper's cache; the mapper is
    /// refilled before the lock is taken.
    pub fn map_at(
        &self,
        numa: &Numa,
        mapper: &mut Mapper,
        vaddr: usize,
        paddr: PhysAddr,
        flags: MapFlags,
    ) -> Result<()> {
        debug_assert_eq!(vaddr % PAGE_SIZE, 0);
        debug_assert_eq!(paddr % PAGE_SIZE, 0);
        debug_assert!(vaddr < self.window.base(), "mapping into the window");
        mapper.refill(numa)?;

        let state = self.state.lock();
        let mut table = state.cr3;
        for level in (2..=self.levels).rev() {
            let entry = self.entry_ptr(table, level_index(vaddr, level));
            // SAFETY: entry points into a live table; the root lock is
            // held.
            let value = unsafe { entry.read() };
            if value == 0 {
                let fresh = mapper.take();
                if fresh == PHYS_NULL {
                    return Err(Error::OutOfMemory);
                }
                // Intermediate entries are maximally permissive; the leaf
                // decides.
                let interm = fresh as u64 | ENTRY_PRESENT | ENTRY_WRITABLE | ENTRY_USER;
                // SAFETY: as above.
                unsafe { entry.write(interm) };
                table = fresh;
            } else {
                table = (value & !ENTRY_FLAGS_MASK) as PhysAddr;
            }
        }

        let mut leaf = paddr as u64 | ENTRY_PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            leaf |= ENTRY_WRITABLE;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            leaf |= ENTRY_NOEXEC;
        }
        if flags.contains(MapFlags::USER) {
            leaf |= ENTRY_USER;
        }
        let entry = self.entry_ptr(table, level_index(vaddr, 1));
        // SAFETY: leaf entry of a live table, root lock held.
        unsafe { entry.write(leaf) };
        Ok(())
    }

    /// Remove the mapping at `vaddr` and schedule a global shootdown.
    /// Returns the physical address that was mapped, or `PHYS_NULL`.
    pub fn unmap_at(&self, tlb: &TlbCoordinator, requesting_core: usize, vaddr: usize) -> PhysAddr {
        debug_assert_eq!(vaddr % PAGE_SIZE, 0);
        let state = self.state.lock();
        let mut table = state.cr3;
        for level in (2..=self.levels).rev() {
            let entry = self.entry_ptr(table, level_index(vaddr, level));
            // SAFETY: entry points into a live table; the root lock is
            // held.
            let value = unsafe { entry.read() };
            if value == 0 {
                return PHYS_NULL;
            }
            table = (value & !ENTRY_FLAGS_MASK) as PhysAddr;
        }
        let entry = self.entry_ptr(table, level_index(vaddr, 1));
        // SAFETY: as above.
        let old = unsafe { entry.read() };
        // SAFETY: as above.
        unsafe { entry.write(0) };
        drop(state);
        if old & ENTRY_PRESENT != 0 {
            tlb.request(requesting_core);
        }
        (old & !ENTRY_FLAGS_MASK) as PhysAddr
    }

    /// Translate `vaddr` through the hierarchy (diagnostics and tests).
    pub fn lookup(&self, vaddr: usize) -> Option<(PhysAddr, MapFlags)> {
        let state = self.state.lock();
        let mut table = state.cr3;
        for level in (2..=self.levels).rev() {
            let entry = self.entry_ptr(table, level_index(vaddr, level));
            // SAFETY: entry points into a live table; the root lock is
            // held.
            let value = unsafe { entry.read() };
            if value == 0 {
                return None;
            }
            table = (value & !ENTRY_FLAGS_MASK) as PhysAddr;
        }
        let entry = self.entry_ptr(table, level_index(vaddr, 1));
        // SAFETY: as above.
        let value = unsafe { entry.read() };
        if value & ENTRY_PRESENT == 0 {
            return None;
        }
        let mut flags = MapFlags::empty();
        if value & ENTRY_WRITABLE != 0 {
            flags |= MapFlags::WRITABLE;
        }
        if value & ENTRY_NOEXEC == 0 {
            flags |= MapFlags::EXECUTABLE;
        }
        if value & ENTRY_USER != 0 {
            flags |= MapFlags::USER;
        }
        Some(((value & !ENTRY_FLAGS_MASK) as PhysAddr, flags))
    }

    /// Tear the hierarchy down, returning every table page. Only the lower
    /// half of the top level is walked: the upper half aliases the shared
    /// kernel tables. Leaf frames belong to whoever mapped them.
    pub fn dispose(self, numa: &Numa) {
        let cr3 = self.state.lock().cr3;
        for i in 0..ENTRIES_PER_TABLE / 2 {
            let entry = self.entry_ptr(cr3, i);
            // SAFETY: live table during teardown; nothing else holds the
            // root.
            let value = unsafe { entry.read() };
            if value != 0 {
                self.dispose_level(numa, (value & !ENTRY_FLAGS_MASK) as PhysAddr, self.levels - 1);
            }
        }
        phys::free(numa, cr3);
    }

    fn dispose_level(&self, numa: &Numa, table: PhysAddr, level: u8) {
        if level > 1 {
            for i in 0..ENTRIES_PER_TABLE {
                let entry = self.entry_ptr(table, i);
                // SAFETY: live table during teardown; nothing else holds
                // the root.
                let value = unsafe { entry.read() };
                if value != 0 {
                    self.dispose_level(numa, (value & !ENTRY_FLAGS_MASK) as PhysAddr, level - 1);
                }
            }
        }
        phys::free(numa, table);
    }

    /// Load this hierarchy on the current CPU.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn switch_to(&self) {
        // SAFETY: the root maps the kernel's upper half by construction.
        unsafe { crate::arch::write_cr3(self.cr3()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::NumaTopology;
    use crate::mm::PhysWindow;

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        numa: Box<Numa>,
        _backing: Vec<u8>,
    }

    fn fixture() -> Fixture {
        let space = 16 * MIB;
        let mut backing = vec![0u8; space];
        let window = PhysWindow::new(backing.as_mut_ptr() as usize);
        let mut topo = NumaTopology::new(&[0], 0);
        topo.set_distance(0, 0, 10);
        let numa = Box::new(Numa::new());
        numa.init_nodes(&topo, window);
        numa.lock().register_range(0, 0, space, false).unwrap();
        phys::init_metadata(&numa, space).unwrap();
        Fixture {
            numa,
            _backing: backing,
        }
    }

    #[test]
    fn map_lookup_unmap_4level() {
        let f = fixture();
        let root = PagingRoot::new(&f.numa, 0, 4, None).unwrap();
        let mut mapper = Mapper::new(4, 0);
        let tlb = TlbCoordinator::new(1);

        let vaddr = 0x4000_2000;
        root.map_at(&f.numa, &mut mapper, vaddr, 0x8000, MapFlags::WRITABLE)
            .unwrap();
        let (paddr, flags) = root.lookup(vaddr).unwrap();
        assert_eq!(paddr, 0x8000);
        assert!(flags.contains(MapFlags::WRITABLE));
        assert!(!flags.contains(MapFlags::EXECUTABLE));

        let old = root.unmap_at(&tlb, 0, vaddr);
        assert_eq!(old, 0x8000);
        assert!(root.lookup(vaddr).is_none());
        // Single online core: the shootdown round completed inline.
        assert!(!tlb.round_pending());
        root.dispose(&f.numa);
    }

    #[test]
    fn intermediate_tables_are_shared_between_neighbors() {
        let f = fixture();
        let root = PagingRoot::new(&f.numa, 0, 4, None).unwrap();
        let mut mapper = Mapper::new(4, 0);

        root.map_at(&f.numa, &mut mapper, 0x1000, 0x2000, MapFlags::empty())
            .unwrap();
        // Second mapping reuses the already-installed intermediate tables.
        root.map_at(&f.numa, &mut mapper, 0x2000, 0x3000, MapFlags::EXECUTABLE)
            .unwrap();
        assert_eq!(root.lookup(0x1000).unwrap().0, 0x2000);
        let (p, fl) = root.lookup(0x2000).unwrap();
        assert_eq!(p, 0x3000);
        assert!(fl.contains(MapFlags::EXECUTABLE));
        root.dispose(&f.numa);
    }

    #[test]
    fn unmap_of_absent_mapping_is_null_and_quiet() {
        let f = fixture();
        let root = PagingRoot::new(&f.numa, 0, 4, None).unwrap();
        let tlb = TlbCoordinator::new(2);
        assert_eq!(root.unmap_at(&tlb, 0, 0x7000_0000_0000), PHYS_NULL);
        // No present entry was removed, so no shootdown was requested.
        assert!(!tlb.round_pending());
        root.dispose(&f.numa);
    }

    #[test]
    fn unmap_requests_shootdown_across_cores() {
        let f = fixture();
        let root = PagingRoot::new(&f.numa, 0, 4, None).unwrap();
        let mut mapper = Mapper::new(4, 0);
        let tlb = TlbCoordinator::new(2);
        root.map_at(&f.numa, &mut mapper, 0x5000, 0x6000, MapFlags::empty())
            .unwrap();
        root.unmap_at(&tlb, 0, 0x5000);
        // The second core has not acked yet.
        assert!(tlb.round_pending());
        assert_eq!(
            tlb.ack(1),
            crate::mm::invtlb::AckAction::GenerationUpdatePending
        );
        tlb.complete_round();
        root.dispose(&f.numa);
    }

    #[test]
    fn five_level_walk() {
        let f = fixture();
        let root = PagingRoot::new(&f.numa, 0, 5, None).unwrap();
        let mut mapper = Mapper::new(5, 0);
        let vaddr = 0x0100_0000_3000;
        root.map_at(&f.numa, &mut mapper, vaddr, 0x9000, MapFlags::WRITABLE)
            .unwrap();
        assert_eq!(root.lookup(vaddr).unwrap().0, 0x9000);
        root.dispose(&f.numa);
    }

    #[test]
    fn upper_half_template_is_copied() {
        let f = fixture();
        let template = PagingRoot::new(&f.numa, 0, 4, None).unwrap();
        // Plant a recognizable upper-half entry by hand.
        let cr3 = template.cr3();
        let marker_index = 300;
        unsafe {
            (f.numa.lock().window.translate(cr3) as *mut u64)
                .add(marker_index)
                .write(0xdead_b000 | 1);
        }
        let child = PagingRoot::new(&f.numa, 0, 4, Some(cr3)).unwrap();
        let copied = unsafe {
            (f.numa.lock().window.translate(child.cr3()) as *const u64)
                .add(marker_index)
                .read()
        };
        assert_eq!(copied, 0xdead_b000 | 1);
        // Disposal only walks the lower half, so the shared upper-half
        // entries are left alone on both hierarchies.
        child.dispose(&f.numa);
        template.dispose(&f.numa);
    }
}
