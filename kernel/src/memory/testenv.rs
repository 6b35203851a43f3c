//! Test fixture: a heap-allocated arena plays the role of physical
//! memory, registered as the direct map. The subsystem keeps its state in
//! globals the way the kernel does, so tests serialize on one lock and
//! reset every module before running.

use spin::{Mutex, MutexGuard};

use super::{frame, lru, paging, swap, BLOCKS_PER_PAGE, PAGE_SIZE};

static TEST_LOCK: Mutex<()> = Mutex::new(());

#[repr(C, align(4096))]
#[derive(Clone)]
struct ArenaBlock([u8; PAGE_SIZE as usize]);

/// Grab the test lock and wind every module back to its boot state.
pub(crate) fn lock_and_reset() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock();
    frame::reset();
    lru::reset();
    swap::reset();
    paging::activate(0);
    guard
}

/// Leak a [`swap::RamSwapDevice`] backed by `bytes` of storage.
pub(crate) fn leak_ram_device(bytes: usize) -> &'static swap::RamSwapDevice {
    let storage: &'static mut [u8] = Box::leak(vec![0u8; bytes].into_boxed_slice());
    Box::leak(Box::new(swap::RamSwapDevice::new(storage)))
}

/// A booted memory subsystem over `total_frames` frames of simulated
/// physical memory. Frame 0 stays below `kernel_end` (reserved), the rest
/// go on the free list. With `swap_blocks > 0` the swap subsystem is
/// armed over a leaked RAM device sized to match.
pub(crate) struct TestEnv {
    _guard: MutexGuard<'static, ()>,
    arena: Vec<ArenaBlock>,
}

impl TestEnv {
    pub(crate) fn new(total_frames: usize, swap_blocks: usize) -> Self {
        assert!(total_frames >= 2, "arena too small");
        let guard = lock_and_reset();

        let arena = vec![ArenaBlock([0u8; PAGE_SIZE as usize]); total_frames];
        let phys_top = (total_frames as u32) * PAGE_SIZE;
        super::init(arena.as_ptr() as usize, PAGE_SIZE, phys_top);
        frame::frame_range_free(PAGE_SIZE, phys_top);
        frame::enable_locking();

        if swap_blocks > 0 {
            let slots = swap_blocks / BLOCKS_PER_PAGE as usize;
            let device = leak_ram_device(slots * PAGE_SIZE as usize);
            swap::init(device, swap_blocks);
        }

        TestEnv {
            _guard: guard,
            arena,
        }
    }

    /// One past the highest managed physical address.
    pub(crate) fn phys_top(&self) -> u32 {
        (self.arena.len() as u32) * PAGE_SIZE
    }
}
