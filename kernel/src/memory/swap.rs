//! Swap Subsystem
//!
//! Evicts user pages to a swap device when physical memory runs out and
//! pages them back in from the page-fault path. Slot accounting is a flat
//! bitmap (bit set = slot occupied) stored in a single frame allocated at
//! init; slot 0 is reserved so a swapped-out PTE always carries a nonzero
//! slot index.
//!
//! Lock order is `lru` before `bitmap`, and neither is ever held across a
//! device transfer.

use spin::Mutex;

use crate::memory::{self, frame, lru, paging, BLOCKS_PER_PAGE, PAGE_SIZE};

/// Bitmap capacity: one frame of bits
pub const MAX_SWAP_SLOTS: usize = (PAGE_SIZE as usize) * 8;

/// Block transfer boundary between the swap code and the disk driver.
/// Implementations move exactly one page per call and may sleep.
pub trait SwapDevice: Sync {
    fn write(&self, slot: usize, page: &[u8]) -> Result<(), &'static str>;
    fn read(&self, slot: usize, page: &mut [u8]) -> Result<(), &'static str>;
}

struct SwapState {
    /// Physical address of the bitmap frame; 0 = swap disabled
    bitmap: u32,
    total_slots: usize,
    used_slots: usize,
    device: Option<&'static dyn SwapDevice>,
}

static SWAP: Mutex<SwapState> = Mutex::new(SwapState {
    bitmap: 0,
    total_slots: 0,
    used_slots: 0,
    device: None,
});

fn bitmap_words(bitmap_pa: u32) -> &'static mut [u32] {
    unsafe {
        core::slice::from_raw_parts_mut(
            memory::phys_to_virt(bitmap_pa) as *mut u32,
            PAGE_SIZE as usize / 4,
        )
    }
}

/// Arm the swap subsystem over `swap_blocks` disk blocks of `device`.
/// Failure to allocate the bitmap frame is fatal.
pub fn init(device: &'static dyn SwapDevice, swap_blocks: usize) {
    let slots = (swap_blocks / BLOCKS_PER_PAGE as usize).min(MAX_SWAP_SLOTS);
    assert!(slots >= 2, "swap: area smaller than two slots");

    let pa = match frame::alloc_frame() {
        Some(pa) => pa,
        None => panic!("swap: failed to allocate slot bitmap"),
    };
    unsafe {
        core::ptr::write_bytes(memory::phys_to_virt(pa), 0, PAGE_SIZE as usize);
    }

    let mut swap = SWAP.lock();
    swap.bitmap = pa;
    swap.total_slots = slots;
    swap.used_slots = 0;
    swap.device = Some(device);
    // Reserve slot 0.
    bitmap_words(pa)[0] |= 1;
    drop(swap);

    crate::log!("swap: {} slots ({} KiB), slot 0 reserved", slots, slots * 4);
}

/// Claim the lowest free slot, or `None` when the swap area is full (or
/// swap is disabled). The whole scan-and-set runs under the bitmap lock.
pub fn slot_alloc() -> Option<usize> {
    let mut swap = SWAP.lock();
    if swap.bitmap == 0 {
        return None;
    }
    let words = bitmap_words(swap.bitmap);
    let nwords = (swap.total_slots + 31) / 32;
    for wi in 0..nwords {
        let word = words[wi];
        if word == u32::MAX {
            continue;
        }
        let bit = (!word).trailing_zeros() as usize;
        let slot = wi * 32 + bit;
        // The last word may cover bits past the slot cap; never hand
        // those out.
        if slot >= swap.total_slots {
            break;
        }
        words[wi] |= 1 << bit;
        swap.used_slots += 1;
        return Some(slot);
    }
    None
}

/// Release `slot`. Freeing a slot that is not allocated is fatal.
pub fn slot_free(slot: usize) {
    let mut swap = SWAP.lock();
    if swap.bitmap == 0 || slot == 0 || slot >= swap.total_slots {
        panic!("slot_free: bad slot {}", slot);
    }
    let words = bitmap_words(swap.bitmap);
    if words[slot / 32] & (1 << (slot % 32)) == 0 {
        panic!("slot_free: slot {} is not allocated", slot);
    }
    words[slot / 32] &= !(1 << (slot % 32));
    swap.used_slots -= 1;
}

/// Number of slots handed out and not yet freed.
pub fn used_slots() -> usize {
    SWAP.lock().used_slots
}

/// Slot capacity of the swap area (0 while swap is disabled).
pub fn total_slots() -> usize {
    SWAP.lock().total_slots
}

fn device() -> Option<&'static dyn SwapDevice> {
    SWAP.lock().device
}

/// Evict one user page: pick a victim, write it out, return its frame to
/// the free list and rewrite its PTE to the swapped form. `Err` means no
/// progress was made (nothing evictable, or the swap area is full) and
/// the LRU list is unchanged apart from scan side effects.
pub fn reclaim() -> Result<(), &'static str> {
    let mut guard = lru::lock();
    let victim = match lru::select_victim(&mut guard) {
        Some(v) => v,
        None => return Err("reclaim: no victim"),
    };
    let pte = match paging::walk(victim.pgdir, victim.vaddr, false) {
        Some(pte) => pte,
        None => return Err("reclaim: victim mapping vanished"),
    };
    // Claim the slot before touching the victim so a full swap area
    // leaves it linked and mapped.
    let slot = match slot_alloc() {
        Some(s) => s,
        None => return Err("reclaim: swap area full"),
    };
    lru::detach(&mut guard, victim.idx);
    drop(guard);

    let pa = pte.frame_addr();
    let dev = match device() {
        Some(d) => d,
        None => return Err("reclaim: swap device not registered"),
    };
    let src = unsafe {
        core::slice::from_raw_parts(memory::phys_to_virt(pa), PAGE_SIZE as usize)
    };
    if let Err(err) = dev.write(slot, src) {
        // Undo: the page stays resident and tracked.
        slot_free(slot);
        lru::lru_insert(victim.pgdir, victim.vaddr);
        crate::log_error!("reclaim: swap write failed: {}", err);
        return Err("reclaim: swap write failed");
    }

    pte.set_swapped(slot);
    frame::free_frame(pa);
    crate::log_debug!(
        "swap: evicted pgdir={:#010x} va={:#010x} -> slot {}",
        victim.pgdir,
        victim.vaddr,
        slot
    );
    Ok(())
}

/// Handle a fault at `va` in the current address space. Returns `true`
/// when the page was swapped back in; `false` leaves the fault to the
/// caller (not a swapped page). A swap-in that cannot get a frame is
/// fatal: reclaim already ran inside `alloc_frame`.
pub fn page_fault(va: u32) -> bool {
    let pgdir = paging::current_pgdir();
    if pgdir == 0 {
        return false;
    }
    let pte = match paging::walk(pgdir, va, false) {
        Some(pte) => pte,
        None => return false,
    };
    if pte.is_present() || !pte.is_swapped() {
        return false;
    }
    let slot = pte.slot();

    let pa = match frame::alloc_frame() {
        Some(pa) => pa,
        None => panic!("swap_in: out of memory"),
    };
    let dev = match device() {
        Some(d) => d,
        None => panic!("swap_in: swap device not registered"),
    };
    let dst = unsafe {
        core::slice::from_raw_parts_mut(memory::phys_to_virt(pa), PAGE_SIZE as usize)
    };
    if let Err(err) = dev.read(slot, dst) {
        panic!("swap_in: read from slot {} failed: {}", slot, err);
    }
    // Only release the slot once its contents are safely in the new
    // frame; a reclaim triggered by our own allocation above must not be
    // able to reuse it midway.
    slot_free(slot);

    pte.set_present(pa);
    lru::lru_insert(pgdir, memory::page_round_down(va));
    crate::log_debug!("swap: paged in va={:#010x} <- slot {}", va, slot);
    true
}

/// Memory-backed swap device over a caller-provided buffer. Stands in for
/// a disk partition on machines without a block driver, and carries the
/// test suite.
pub struct RamSwapDevice {
    storage: Mutex<&'static mut [u8]>,
}

impl RamSwapDevice {
    pub fn new(storage: &'static mut [u8]) -> Self {
        Self {
            storage: Mutex::new(storage),
        }
    }
}

impl SwapDevice for RamSwapDevice {
    fn write(&self, slot: usize, page: &[u8]) -> Result<(), &'static str> {
        let mut storage = self.storage.lock();
        let off = slot * PAGE_SIZE as usize;
        if off + page.len() > storage.len() {
            return Err("ram swap: slot out of range");
        }
        storage[off..off + page.len()].copy_from_slice(page);
        Ok(())
    }

    fn read(&self, slot: usize, page: &mut [u8]) -> Result<(), &'static str> {
        let storage = self.storage.lock();
        let off = slot * PAGE_SIZE as usize;
        if off + page.len() > storage.len() {
            return Err("ram swap: slot out of range");
        }
        page.copy_from_slice(&storage[off..off + page.len()]);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn reset() {
    let mut swap = SWAP.lock();
    swap.bitmap = 0;
    swap.total_slots = 0;
    swap.used_slots = 0;
    swap.device = None;
}

/// Occupied-slot count straight from the bitmap, excluding the reserved
/// slot 0, for invariant checks.
#[cfg(test)]
pub(crate) fn bitmap_popcount() -> usize {
    let swap = SWAP.lock();
    if swap.bitmap == 0 {
        return 0;
    }
    let words = bitmap_words(swap.bitmap);
    let nwords = (swap.total_slots + 31) / 32;
    let mut count = 0usize;
    for wi in 0..nwords {
        count += words[wi].count_ones() as usize;
    }
    count - 1
}
