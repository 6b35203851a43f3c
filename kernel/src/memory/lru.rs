//! LRU Page Tracker
//!
//! One descriptor per physical frame, in a static arena indexed by frame
//! number. User-resident frames are linked into a circular doubly-linked
//! list through their descriptors, with a sentinel in the extra arena
//! slot past the last frame. New residents enter at the head (MRU); the
//! second-chance victim scan walks from the head and demotes recently
//! used pages to the tail, so the tail holds the oldest candidates.
//!
//! Index 0 doubles as the null link: frame 0 sits below `kernel_end` and
//! never carries a user page.

use spin::{Mutex, MutexGuard};

use crate::memory::{self, paging, NFRAMES, PAGE_SIZE};

const NIL: u32 = 0;
const SENTINEL: u32 = NFRAMES as u32;

/// Per-frame descriptor: owning address space and virtual address are
/// meaningful only while the frame is user-resident.
#[derive(Clone, Copy)]
struct FrameDesc {
    pgdir: u32,
    vaddr: u32,
    prev: u32,
    next: u32,
}

impl FrameDesc {
    const EMPTY: FrameDesc = FrameDesc {
        pgdir: 0,
        vaddr: 0,
        prev: NIL,
        next: NIL,
    };
}

pub(crate) struct LruState {
    nodes: [FrameDesc; NFRAMES + 1],
    count: usize,
}

static LRU: Mutex<LruState> = Mutex::new(LruState {
    nodes: [FrameDesc::EMPTY; NFRAMES + 1],
    count: 0,
});

impl LruState {
    fn is_linked(&self, idx: u32) -> bool {
        self.nodes[idx as usize].prev != NIL || self.nodes[idx as usize].next != NIL
    }

    fn link_front(&mut self, idx: u32) {
        let head = self.nodes[SENTINEL as usize].next;
        self.nodes[idx as usize].prev = SENTINEL;
        self.nodes[idx as usize].next = head;
        self.nodes[head as usize].prev = idx;
        self.nodes[SENTINEL as usize].next = idx;
    }

    fn link_back(&mut self, idx: u32) {
        let tail = self.nodes[SENTINEL as usize].prev;
        self.nodes[idx as usize].next = SENTINEL;
        self.nodes[idx as usize].prev = tail;
        self.nodes[tail as usize].next = idx;
        self.nodes[SENTINEL as usize].prev = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let prev = self.nodes[idx as usize].prev;
        let next = self.nodes[idx as usize].next;
        if self.nodes[prev as usize].next != idx || self.nodes[next as usize].prev != idx {
            panic!("lru: corrupt link at frame {}", idx);
        }
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;
        self.nodes[idx as usize].prev = NIL;
        self.nodes[idx as usize].next = NIL;
    }

    fn move_to_tail(&mut self, idx: u32) {
        self.unlink(idx);
        self.link_back(idx);
    }

    fn clear_desc(&mut self, idx: u32) {
        self.nodes[idx as usize].pgdir = 0;
        self.nodes[idx as usize].vaddr = 0;
    }
}

/// Set up the sentinel. Called once from [`memory::init`].
pub fn init() {
    let mut lru = LRU.lock();
    lru.nodes[SENTINEL as usize].prev = SENTINEL;
    lru.nodes[SENTINEL as usize].next = SENTINEL;
    lru.count = 0;
}

/// Number of user-resident pages on the list.
pub fn lru_len() -> usize {
    LRU.lock().count
}

pub(crate) fn lock() -> MutexGuard<'static, LruState> {
    LRU.lock()
}

/// Start tracking the user page mapped at `(pgdir, va)` for eviction.
/// The mapping must be present; the caller serializes calls for the same
/// frame (normally via the address-space lock).
pub fn lru_insert(pgdir: u32, va: u32) {
    let va = memory::page_round_down(va);
    let pte = match paging::walk(pgdir, va, false) {
        Some(pte) => pte,
        None => panic!("lru_insert: no mapping at {:#010x}", va),
    };
    if !pte.is_present() {
        panic!("lru_insert: page at {:#010x} not present", va);
    }
    let idx = pte.frame_addr() / PAGE_SIZE;

    let mut lru = LRU.lock();
    if lru.is_linked(idx) {
        panic!("lru: corrupt link (double insert of frame {})", idx);
    }
    lru.nodes[idx as usize].pgdir = pgdir;
    lru.nodes[idx as usize].vaddr = va;
    lru.link_front(idx);
    lru.count += 1;
}

/// Stop tracking the page at `(pgdir, va)`. A page that is not on the
/// list (already evicted, never inserted) is a no-op.
pub fn lru_remove(pgdir: u32, va: u32) {
    let va = memory::page_round_down(va);
    let pte = match paging::walk(pgdir, va, false) {
        Some(pte) => pte,
        None => return,
    };
    if !pte.is_present() {
        return;
    }
    let idx = pte.frame_addr() / PAGE_SIZE;

    let mut lru = LRU.lock();
    if !lru.is_linked(idx) {
        return;
    }
    lru.unlink(idx);
    lru.clear_desc(idx);
    lru.count -= 1;
}

/// A victim chosen by [`select_victim`], still linked on the list.
pub(crate) struct Victim {
    pub idx: u32,
    pub pgdir: u32,
    pub vaddr: u32,
}

/// Second-chance scan. Walks from the node after the sentinel; stale
/// nodes (mapping gone or no longer user-accessible) are dropped on the
/// way, accessed pages lose their `ACCESSED` bit and move to the tail.
/// Returns the first unaccessed page, still linked, or `None` after
/// `2 * count` visits so a pathological load cannot spin the scan
/// forever.
pub(crate) fn select_victim(lru: &mut LruState) -> Option<Victim> {
    if lru.nodes[SENTINEL as usize].next == SENTINEL {
        return None;
    }
    let mut budget = 2 * lru.count;
    let mut idx = lru.nodes[SENTINEL as usize].next;
    while budget > 0 {
        if idx == SENTINEL {
            if lru.nodes[SENTINEL as usize].next == SENTINEL {
                return None;
            }
            idx = lru.nodes[SENTINEL as usize].next;
            continue;
        }
        budget -= 1;
        let next = lru.nodes[idx as usize].next;
        let pgdir = lru.nodes[idx as usize].pgdir;
        let vaddr = lru.nodes[idx as usize].vaddr;
        match paging::walk(pgdir, vaddr, false) {
            Some(pte) if pte.is_present() && pte.is_user() => {
                if !pte.is_accessed() {
                    return Some(Victim { idx, pgdir, vaddr });
                }
                pte.clear_accessed();
                lru.move_to_tail(idx);
            }
            _ => {
                // Mapping vanished behind our back; drop the node.
                lru.unlink(idx);
                lru.clear_desc(idx);
                lru.count -= 1;
            }
        }
        idx = next;
    }
    None
}

/// Unlink a victim and wipe its descriptor. Caller holds the list lock.
pub(crate) fn detach(lru: &mut LruState, idx: u32) {
    lru.unlink(idx);
    lru.clear_desc(idx);
    lru.count -= 1;
}

#[cfg(test)]
pub(crate) fn reset() {
    let mut lru = LRU.lock();
    for node in lru.nodes.iter_mut() {
        *node = FrameDesc::EMPTY;
    }
    lru.count = 0;
}

/// Frame numbers from head (MRU) to tail, for tests.
#[cfg(test)]
pub(crate) fn frames_in_order() -> std::vec::Vec<u32> {
    let lru = LRU.lock();
    let mut out = std::vec::Vec::new();
    let mut idx = lru.nodes[SENTINEL as usize].next;
    while idx != SENTINEL {
        out.push(idx);
        idx = lru.nodes[idx as usize].next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::{create_pgdir, map_page, walk, PageFlags};
    use crate::memory::testenv::TestEnv;
    use crate::memory::frame::alloc_frame;

    const VA: u32 = 0x0080_0000;

    fn map_user_page(pgdir: u32, va: u32) -> u32 {
        let pa = alloc_frame().unwrap();
        map_page(pgdir, va, pa, PageFlags::USER_DATA).unwrap();
        pa
    }

    #[test]
    fn insert_remove_restores_state() {
        let _env = TestEnv::new(16, 0);
        let pgdir = create_pgdir().unwrap();
        map_user_page(pgdir, VA);
        assert_eq!(lru_len(), 0);
        lru_insert(pgdir, VA);
        assert_eq!(lru_len(), 1);
        lru_remove(pgdir, VA);
        assert_eq!(lru_len(), 0);
        // Removing again is a safe no-op.
        lru_remove(pgdir, VA);
        assert_eq!(lru_len(), 0);
        // And the descriptor is reusable.
        lru_insert(pgdir, VA);
        assert_eq!(lru_len(), 1);
    }

    #[test]
    fn remove_of_untracked_page_is_noop() {
        let _env = TestEnv::new(16, 0);
        let pgdir = create_pgdir().unwrap();
        map_user_page(pgdir, VA);
        lru_remove(pgdir, VA);
        lru_remove(pgdir, VA + 0x1000);
        assert_eq!(lru_len(), 0);
    }

    #[test]
    fn insert_links_at_head() {
        let _env = TestEnv::new(16, 0);
        let pgdir = create_pgdir().unwrap();
        let mut frames = std::vec::Vec::new();
        for i in 0..3u32 {
            let va = VA + i * 0x1000;
            let pa = map_user_page(pgdir, va);
            lru_insert(pgdir, va);
            frames.push(pa / PAGE_SIZE);
        }
        frames.reverse();
        assert_eq!(frames_in_order(), frames);
    }

    #[test]
    fn empty_scan_returns_no_victim() {
        let _env = TestEnv::new(8, 0);
        let mut guard = lock();
        assert!(select_victim(&mut guard).is_none());
    }

    #[test]
    fn scan_skips_accessed_and_demotes() {
        let _env = TestEnv::new(16, 0);
        let pgdir = create_pgdir().unwrap();
        for i in 0..3u32 {
            let va = VA + i * 0x1000;
            map_user_page(pgdir, va);
            lru_insert(pgdir, va);
        }
        // Head (VA+0x2000) was touched; the middle one was not.
        walk(pgdir, VA + 0x2000, false).unwrap().set_accessed();
        let mut guard = lock();
        let victim = select_victim(&mut guard).expect("victim expected");
        assert_eq!(victim.vaddr, VA + 0x1000);
        drop(guard);
        // The touched page lost its accessed bit and moved to the tail.
        assert!(!walk(pgdir, VA + 0x2000, false).unwrap().is_accessed());
        let order = frames_in_order();
        let tail = *order.last().unwrap();
        let touched = walk(pgdir, VA + 0x2000, false).unwrap().frame_addr() / PAGE_SIZE;
        assert_eq!(tail, touched);
    }

    #[test]
    fn scan_drops_stale_nodes() {
        let _env = TestEnv::new(16, 0);
        let pgdir = create_pgdir().unwrap();
        map_user_page(pgdir, VA);
        lru_insert(pgdir, VA);
        // Externally revoke user access.
        let pte = walk(pgdir, VA, false).unwrap();
        let pa = pte.frame_addr();
        pte.set_mapping(pa, PageFlags::new(PageFlags::PRESENT | PageFlags::WRITABLE));
        let mut guard = lock();
        assert!(select_victim(&mut guard).is_none());
        drop(guard);
        assert_eq!(lru_len(), 0, "stale node must be dropped");
    }

    #[test]
    #[should_panic(expected = "no mapping")]
    fn insert_of_unmapped_page_panics() {
        let _env = TestEnv::new(16, 0);
        let pgdir = create_pgdir().unwrap();
        lru_insert(pgdir, VA);
    }

    #[test]
    #[should_panic(expected = "double insert")]
    fn double_insert_panics() {
        let _env = TestEnv::new(16, 0);
        let pgdir = create_pgdir().unwrap();
        map_user_page(pgdir, VA);
        lru_insert(pgdir, VA);
        lru_insert(pgdir, VA);
    }
}
