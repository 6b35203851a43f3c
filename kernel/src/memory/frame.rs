//! Physical Frame Allocator (Free List)
//!
//! Hands out 4 KiB physical frames for user pages, page-table pages and
//! kernel buffers. Free frames form an intrusive LIFO list threaded
//! through the first word of each free page; the only bookkeeping besides
//! the list head is a bit per frame marking list membership, which turns a
//! double free into a deterministic panic instead of silent list
//! corruption.
//!
//! Initialization happens in two phases. During early boot only the boot
//! CPU runs, so the allocator is usable before the locking transition;
//! [`enable_locking`] flips the one-way `EarlyBoot -> Running` switch once
//! the other CPUs are online.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use spin::Mutex;

use crate::memory::{self, swap, NFRAMES, PAGE_SIZE};

/// Poison byte written over freed frames to surface dangling references
const POISON: u8 = 0x01;

/// Bound on reclaim retries when other CPUs race us for the freed frame
const MAX_RETRY: usize = 4;

const PHASE_UNINIT: u8 = 0;
const PHASE_EARLY_BOOT: u8 = 1;
const PHASE_RUNNING: u8 = 2;

/// One-way boot phase: Uninit -> EarlyBoot -> Running
static PHASE: AtomicU8 = AtomicU8::new(PHASE_UNINIT);

/// First allocatable physical address (end of the kernel image)
static KERNEL_END: AtomicU32 = AtomicU32::new(0);
/// One past the last allocatable physical address
static PHYS_LIMIT: AtomicU32 = AtomicU32::new(0);

const MAP_WORDS: usize = NFRAMES / 64;

struct Kmem {
    /// Physical address of the list head frame; 0 = empty
    freelist: u32,
    free_count: usize,
    /// Bit set = frame is on the free list
    free_map: [u64; MAP_WORDS],
}

static KMEM: Mutex<Kmem> = Mutex::new(Kmem {
    freelist: 0,
    free_count: 0,
    free_map: [0; MAP_WORDS],
});

/// Prepare the allocator for `[kernel_end, phys_top)`. Call once, before
/// any [`frame_range_free`].
pub fn init(kernel_end: u32, phys_top: u32) {
    assert!(kernel_end >= PAGE_SIZE, "frame: kernel_end below first frame");
    assert!(phys_top <= memory::PHYS_TOP, "frame: phys_top above PHYS_TOP");
    assert!(kernel_end <= phys_top, "frame: empty physical range");
    if PHASE.load(Ordering::Acquire) != PHASE_UNINIT {
        panic!("frame: init called twice");
    }
    KERNEL_END.store(kernel_end, Ordering::SeqCst);
    PHYS_LIMIT.store(phys_top, Ordering::SeqCst);
    {
        let mut kmem = KMEM.lock();
        kmem.freelist = 0;
        kmem.free_count = 0;
        kmem.free_map = [0; MAP_WORDS];
    }
    PHASE.store(PHASE_EARLY_BOOT, Ordering::Release);
}

/// Push every page in `[start, end)` onto the free list.
pub fn frame_range_free(start: u32, end: u32) {
    let mut pa = memory::page_round_up(start);
    while pa + PAGE_SIZE <= end {
        free_frame(pa);
        pa += PAGE_SIZE;
    }
}

/// One-way transition to locked operation, once all CPUs other than the
/// boot CPU can reach the allocator. Panics if called twice or before
/// [`init`].
pub fn enable_locking() {
    if PHASE
        .compare_exchange(
            PHASE_EARLY_BOOT,
            PHASE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        panic!("frame: enable_locking outside EarlyBoot phase");
    }
}

/// Free the frame at physical address `pa`, which normally should have
/// been returned by [`alloc_frame`] (the exception is seeding via
/// [`frame_range_free`]). Misaligned, out-of-range and double frees are
/// fatal.
pub fn free_frame(pa: u32) {
    if PHASE.load(Ordering::Acquire) == PHASE_UNINIT {
        panic!("free_frame: allocator not initialized");
    }
    let kernel_end = KERNEL_END.load(Ordering::Relaxed);
    let limit = PHYS_LIMIT.load(Ordering::Relaxed);
    if pa % PAGE_SIZE != 0 || pa < kernel_end || pa >= limit {
        panic!("free_frame: bad frame {:#010x}", pa);
    }

    // Fill with junk to catch dangling refs
    unsafe {
        core::ptr::write_bytes(memory::phys_to_virt(pa), POISON, PAGE_SIZE as usize);
    }

    let idx = (pa / PAGE_SIZE) as usize;
    let mut kmem = KMEM.lock();
    if kmem.free_map[idx / 64] & (1 << (idx % 64)) != 0 {
        panic!("free_frame: double free of {:#010x}", pa);
    }
    kmem.free_map[idx / 64] |= 1 << (idx % 64);
    unsafe {
        (memory::phys_to_virt(pa) as *mut u32).write(kmem.freelist);
    }
    kmem.freelist = pa;
    kmem.free_count += 1;
}

/// Allocate one 4 KiB frame and return its physical address, or `None`
/// when memory is exhausted. When the free list is empty the allocator
/// drops its lock, tries to reclaim a user page to swap, and retries.
pub fn alloc_frame() -> Option<u32> {
    if PHASE.load(Ordering::Acquire) == PHASE_UNINIT {
        panic!("alloc_frame: allocator not initialized");
    }
    let mut attempts = 0;
    loop {
        if let Some(pa) = pop_free() {
            return Some(pa);
        }
        if attempts >= MAX_RETRY {
            crate::log_warn!("alloc_frame: reclaimed frames kept vanishing, giving up");
            return None;
        }
        attempts += 1;
        if swap::reclaim().is_err() {
            crate::log_error!("alloc_frame: out of memory");
            return None;
        }
    }
}

/// Pop the head of the free list, or `None` when it is empty.
fn pop_free() -> Option<u32> {
    let mut kmem = KMEM.lock();
    let pa = kmem.freelist;
    if pa == 0 {
        return None;
    }
    let next = unsafe { (memory::phys_to_virt(pa) as *const u32).read() };
    kmem.freelist = next;
    let idx = (pa / PAGE_SIZE) as usize;
    kmem.free_map[idx / 64] &= !(1 << (idx % 64));
    kmem.free_count -= 1;
    Some(pa)
}

/// Current length of the free list.
pub fn free_frames() -> usize {
    KMEM.lock().free_count
}

#[cfg(test)]
pub(crate) fn reset() {
    PHASE.store(PHASE_UNINIT, Ordering::SeqCst);
    KERNEL_END.store(0, Ordering::SeqCst);
    PHYS_LIMIT.store(0, Ordering::SeqCst);
    let mut kmem = KMEM.lock();
    kmem.freelist = 0;
    kmem.free_count = 0;
    kmem.free_map = [0; MAP_WORDS];
}
