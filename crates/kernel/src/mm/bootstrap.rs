//! Bootstrap bump allocator.
//!
//! Serves the earliest initgraph targets straight out of the boot memory
//! map, before the physical allocator exists. One frontier, one current
//! map entry, no free. `terminate` freezes the allocator and reports where
//! permanent allocations end so the physical allocator can start past them.

use crate::boot::MemoryMapEntry;
use crate::config::{BOOTSTRAP_ALIGN, PAGE_SIZE, PHYS_LOW};
use crate::mm::{align_up, PhysAddr, PhysWindow};

pub struct BootstrapAllocator<'a> {
    memory_map: &'a [MemoryMapEntry],
    window: PhysWindow,
    /// Physical frontier; memory below it is never handed out. Starts at
    /// the low watermark so low physical memory stays untouched.
    border: PhysAddr,
    entry_index: usize,
    usable: bool,
}

impl<'a> BootstrapAllocator<'a> {
    pub fn new(memory_map: &'a [MemoryMapEntry], window: PhysWindow) -> Self {
        BootstrapAllocator {
            memory_map,
            window,
            border: PHYS_LOW,
            entry_index: 0,
            usable: true,
        }
    }

    /// Allocate `size` bytes, rounded up to 16, returning a higher-half
    /// pointer. Panics when no memory map entry can satisfy the request:
    /// nothing this early is optional.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if !self.usable {
            panic!("bootstrap: allocation after terminate");
        }
        let real_size = align_up(size, BOOTSTRAP_ALIGN);
        while self.entry_index < self.memory_map.len() {
            let entry = &self.memory_map[self.entry_index];
            if !entry.is_usable() {
                self.entry_index += 1;
                continue;
            }
            let entry_end = entry.end();
            if self.border >= entry_end {
                self.entry_index += 1;
                continue;
            }
            if self.border < entry.base {
                self.border = align_up(entry.base, BOOTSTRAP_ALIGN);
            }
            if entry_end - self.border >= real_size {
                let result = self.window.translate(self.border);
                self.border += real_size;
                return result;
            }
            self.entry_index += 1;
        }
        panic!("bootstrap: failed to allocate {} more bytes", size);
    }

    /// Freeze the allocator. Returns the page-aligned physical address
    /// past which no bootstrap allocation lives.
    pub fn terminate(&mut self) -> PhysAddr {
        self.usable = false;
        align_up(self.border, PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::MemoryKind;

    fn map(entries: &[(usize, usize, MemoryKind)]) -> Vec<MemoryMapEntry> {
        entries
            .iter()
            .map(|&(base, length, kind)| MemoryMapEntry { base, length, kind })
            .collect()
    }

    // The tests run the allocator over a plain buffer: physical addresses
    // are offsets, the window base is the buffer address.
    fn window_over(buf: &mut Vec<u8>) -> PhysWindow {
        PhysWindow::new(buf.as_mut_ptr() as usize)
    }

    #[test]
    fn skips_low_memory_and_rounds_sizes() {
        let mut buf = vec![0u8; 6 * 1024 * 1024];
        let win = window_over(&mut buf);
        let entries = map(&[(0, 6 * 1024 * 1024, MemoryKind::Usable)]);
        let mut alloc = BootstrapAllocator::new(&entries, win);

        let a = alloc.alloc(10);
        assert_eq!(win.untranslate(a), PHYS_LOW);
        let b = alloc.alloc(1);
        // 10 rounded to 16.
        assert_eq!(win.untranslate(b), PHYS_LOW + 16);
    }

    #[test]
    fn skips_unusable_and_exhausted_entries() {
        let mut buf = vec![0u8; 4 * 1024 * 1024 + 64];
        let win = window_over(&mut buf);
        let base2 = 4 * 1024 * 1024;
        let entries = map(&[
            (0, 4096, MemoryKind::Usable), // below the watermark
            (2 * 1024 * 1024, 4096, MemoryKind::Reserved),
            (base2, 64, MemoryKind::Usable),
        ]);
        let mut alloc = BootstrapAllocator::new(&entries, win);
        let a = alloc.alloc(32);
        assert_eq!(win.untranslate(a), base2);
    }

    #[test]
    fn terminate_reports_page_aligned_border() {
        let mut buf = vec![0u8; 4 * 1024 * 1024];
        let win = window_over(&mut buf);
        let entries = map(&[(0, 4 * 1024 * 1024, MemoryKind::Usable)]);
        let mut alloc = BootstrapAllocator::new(&entries, win);
        alloc.alloc(100);
        let end = alloc.terminate();
        assert_eq!(end % PAGE_SIZE, 0);
        assert!(end >= PHYS_LOW + 100);
    }

    #[test]
    #[should_panic(expected = "after terminate")]
    fn alloc_after_terminate_panics() {
        let mut buf = vec![0u8; 4 * 1024 * 1024];
        let win = window_over(&mut buf);
        let entries = map(&[(0, 4 * 1024 * 1024, MemoryKind::Usable)]);
        let mut alloc = BootstrapAllocator::new(&entries, win);
        alloc.terminate();
        alloc.alloc(16);
    }

    #[test]
    #[should_panic(expected = "failed to allocate")]
    fn exhaustion_panics() {
        let mut buf = vec![0u8; 2 * 1024 * 1024 + 32];
        let win = window_over(&mut buf);
        let entries = map(&[(2 * 1024 * 1024, 32, MemoryKind::Usable)]);
        let mut alloc = BootstrapAllocator::new(&entries, win);
        alloc.alloc(64);
    }
}
