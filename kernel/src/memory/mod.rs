//! Memory Management Subsystem
//!
//! Physical frame allocation, the LRU page tracker and demand paging with
//! swap. Layout follows the classic teaching-kernel map: allocatable
//! frames live in `[kernel_end, PHYS_TOP)` and all of physical memory is
//! reachable through a direct map registered at boot.
//!
//! None of the entry points here may be called from interrupt context;
//! the spinlocks in this subsystem are not interrupt-safe.

pub mod frame;
pub mod lru;
pub mod paging;
pub mod swap;

#[cfg(test)]
pub(crate) mod testenv;

use core::sync::atomic::{AtomicUsize, Ordering};

pub use frame::{alloc_frame, enable_locking, frame_range_free, free_frame};
pub use lru::{lru_insert, lru_remove};
pub use swap::page_fault;

/// Page / frame size (4 KiB)
pub const PAGE_SIZE: u32 = 4096;
/// log2 of the page size
pub const PAGE_SHIFT: u32 = 12;
/// Top of managed physical memory (224 MiB)
pub const PHYS_TOP: u32 = 0xE00_0000;
/// Number of physical frames below `PHYS_TOP`
pub const NFRAMES: usize = (PHYS_TOP / PAGE_SIZE) as usize;
/// Disk block size
pub const BLOCK_SIZE: u32 = 512;
/// Disk blocks backing one page
pub const BLOCKS_PER_PAGE: u32 = PAGE_SIZE / BLOCK_SIZE;

/// Base virtual address of the physical direct map (set during init)
static PHYS_MAP_BASE: AtomicUsize = AtomicUsize::new(0);

/// Register the direct map. `base` must map physical address 0 and cover
/// at least `phys_top` bytes.
pub fn set_phys_map(base: usize) {
    PHYS_MAP_BASE.store(base, Ordering::SeqCst);
}

/// Convert a physical address to a pointer through the direct map.
pub fn phys_to_virt(pa: u32) -> *mut u8 {
    (PHYS_MAP_BASE.load(Ordering::Relaxed) + pa as usize) as *mut u8
}

/// Round `addr` up to the next page boundary.
pub const fn page_round_up(addr: u32) -> u32 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round `addr` down to a page boundary.
pub const fn page_round_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// First init phase: register the direct map and prepare the frame
/// allocator and the LRU tracker. The caller then seeds the allocator with
/// [`frame::frame_range_free`] and, once every other CPU can reach the
/// allocator, flips [`frame::enable_locking`]. Swap is armed separately
/// via [`swap::init`].
pub fn init(phys_map_base: usize, kernel_end: u32, phys_top: u32) {
    set_phys_map(phys_map_base);
    frame::init(kernel_end, phys_top);
    lru::init();
    crate::log!("memory: managing {:#010x}..{:#010x}", kernel_end, phys_top);
}

/// Counters for the `swap_stat` system call: `(free_frames, lru_pages)`.
pub fn swap_stat() -> (usize, usize) {
    (frame::free_frames(), lru::lru_len())
}

/// Memory statistics
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub free_frames: usize,
    pub lru_pages: usize,
    pub swap_slots_total: usize,
    pub swap_slots_used: usize,
}

/// Snapshot of the subsystem counters.
pub fn stats() -> MemoryStats {
    MemoryStats {
        free_frames: frame::free_frames(),
        lru_pages: lru::lru_len(),
        swap_slots_total: swap::total_slots(),
        swap_slots_used: swap::used_slots(),
    }
}
