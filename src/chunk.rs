// The bitmap-chunk engine. Each chunk carries exactly 64 cells and one
// machine-word bitmap of free bits; chunks are classified young or old
// wholesale and minor scans range-check every cell of the young ring.
// Same contract as the pool engine, kept for benchmark comparison.

use bit_field::BitField;
use libc::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::RootEngine;
use crate::pages;
use crate::ring;
use crate::ring::RingNode;
use crate::runtime;
use crate::runtime::{HostHooks, Root, ScanAction, Value};
use crate::stats::Stats;

pub const CHUNK_LOG_SIZE: usize = 10;
pub const CHUNK_SIZE: usize = 1 << CHUNK_LOG_SIZE; // 1k, header + cells
pub const CHUNK_SLOTS: usize = 64;

const ALL_FREE: u64 = !0u64; // every cell free

#[repr(C)]
pub struct Chunk {
    prev: *mut Chunk,
    next: *mut Chunk,
    free: AtomicU64, // bit set means cell free; cells always hold payloads verbatim
    young: bool,
    slots: [Value; CHUNK_SLOTS],
}

impl RingNode for Chunk {
    unsafe fn prev(p: *mut Chunk) -> *mut Chunk {
        (*p).prev
    }
    unsafe fn next(p: *mut Chunk) -> *mut Chunk {
        (*p).next
    }
    unsafe fn set_prev(p: *mut Chunk, q: *mut Chunk) {
        (*p).prev = q;
    }
    unsafe fn set_next(p: *mut Chunk, q: *mut Chunk) {
        (*p).next = q;
    }
}

impl Chunk {
    // Recover the owning chunk from a cell address by masking the low bits.
    #[inline(always)]
    pub unsafe fn of_slot(r: Root) -> *mut Chunk {
        pages::base_of(r, CHUNK_SIZE) as *mut Chunk
    }

    #[inline(always)]
    unsafe fn slot_index(c: *mut Chunk, r: Root) -> usize {
        let i = (r as usize - (*c).slots.as_ptr() as usize) / mem::size_of::<Value>();
        debug_assert!(i < CHUNK_SLOTS, "cell address outside its chunk");
        i
    }

    unsafe fn create(h: &HostHooks, young: bool) -> *mut Chunk {
        let mem_ = pages::alloc_aligned(h, CHUNK_SIZE, CHUNK_SIZE);
        if mem_.is_null() {
            return ptr::null_mut();
        }
        let c = mem_ as *mut Chunk;
        ring::init(c);
        (*c).free = AtomicU64::new(ALL_FREE);
        (*c).young = young;
        c
    }
}

pub struct ChunkEngine {
    young: *mut Chunk,
    old: *mut Chunk,
    hooks: HostHooks,
    pub stats: Stats,
}

impl ChunkEngine {
    pub fn new(hooks: HostHooks) -> ChunkEngine {
        ChunkEngine {
            young: ptr::null_mut(),
            old: ptr::null_mut(),
            hooks: hooks,
            stats: Stats::new(),
        }
    }

    #[inline(never)]
    unsafe fn find_chunk(&mut self, young: bool) -> *mut Chunk {
        // the proper ring first; available chunks cluster toward the head
        {
            let head = if young { self.young } else { self.old };
            if !head.is_null() {
                let mut c = head;
                loop {
                    if (*c).free.load(Ordering::Relaxed) != 0 {
                        return c;
                    }
                    c = Chunk::next(c);
                    if c == head {
                        break;
                    }
                }
            }
        }
        if young {
            // repurpose an old chunk with room rather than growing
            let head = self.old;
            if !head.is_null() {
                let mut c = head;
                loop {
                    if (*c).free.load(Ordering::Relaxed) != 0 {
                        ring::remove(&mut self.old, c);
                        (*c).young = true;
                        ring::push_head(&mut self.young, c);
                        self.stats.ring_moves += 1;
                        return c;
                    }
                    c = Chunk::next(c);
                    if c == head {
                        break;
                    }
                }
            }
        }
        let c = Chunk::create(&self.hooks, young);
        if !c.is_null() {
            self.stats.note_pool_alloc();
            if young {
                ring::push_head(&mut self.young, c);
            } else {
                ring::push_head(&mut self.old, c);
            }
        }
        c
    }

    unsafe fn scan_chunk(
        &mut self,
        c: *mut Chunk,
        action: ScanAction,
        data: *mut c_void,
        young_only: bool,
    ) {
        let mask = (*c).free.load(Ordering::Relaxed);
        for i in 0..CHUNK_SLOTS {
            self.stats.slots_visited += 1;
            if mask.get_bit(i) {
                continue; // free
            }
            let cell = (*c).slots.as_mut_ptr().add(i);
            let w = *cell;
            if !young_only || runtime::is_young_block(&self.hooks, w) {
                action(data, w, cell);
                self.stats.useful_scan_work += 1;
            }
        }
    }

    // Hand empty chunks back after a major collection, keeping one.
    unsafe fn reclaim_empty_chunks(&mut self) {
        let mut kept = false;
        for c in ring::nodes(self.young)
            .into_iter()
            .chain(ring::nodes(self.old).into_iter())
        {
            if (*c).free.load(Ordering::Relaxed) != ALL_FREE {
                continue;
            }
            if !kept {
                kept = true;
                continue;
            }
            {
                let head = if (*c).young { &mut self.young } else { &mut self.old };
                ring::remove(head, c);
            }
            pages::free_aligned(&self.hooks, c as *mut u8, CHUNK_SIZE);
            self.stats.note_pool_free();
        }
    }

    unsafe fn count_full(&mut self, c: *mut Chunk) -> usize {
        let mask = (*c).free.load(Ordering::Relaxed);
        let mut n = 0;
        for i in 0..CHUNK_SLOTS {
            self.stats.slots_visited += 1;
            if !mask.get_bit(i) {
                n += 1;
            }
        }
        n
    }
}

impl RootEngine for ChunkEngine {
    fn hooks(&self) -> &HostHooks {
        &self.hooks
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    fn live_pools(&self) -> usize {
        self.stats.live_pools as usize
    }

    #[inline(always)]
    unsafe fn take_slot(&mut self, young: bool) -> (*mut Value, bool) {
        let c = self.find_chunk(young);
        if c.is_null() {
            return (ptr::null_mut(), false);
        }
        let mask = (*c).free.load(Ordering::Relaxed);
        debug_assert_ne!(mask, 0, "find_chunk returned a full chunk");
        let idx = mask.trailing_zeros() as usize;
        let slot = (*c).slots.as_mut_ptr().add(idx);
        let now = (*c).free.fetch_xor(1u64 << idx, Ordering::Relaxed) ^ (1u64 << idx);
        if now == 0 {
            // the chunk filled up: park it at the tail so allocation skips it
            {
                let head = if (*c).young { &mut self.young } else { &mut self.old };
                ring::remove(head, c);
                ring::push_tail(head, c);
            }
            self.stats.ring_moves += 1;
        }
        self.stats.created += 1;
        self.stats.live += 1;
        (slot, false)
    }

    #[inline(always)]
    unsafe fn release_root(&mut self, r: Root) {
        let c = Chunk::of_slot(r);
        let idx = Chunk::slot_index(c, r);
        let bit = 1u64 << idx;
        let was = (*c).free.fetch_xor(bit, Ordering::Relaxed);
        debug_assert!(!was.get_bit(idx), "double delete of a chunk cell");
        let now = was | bit;
        // full-to-available and available-to-empty transitions pull the
        // chunk back toward the head of its ring, unless it already leads
        if was == 0 || now == ALL_FREE {
            let at_head = if (*c).young { self.young == c } else { self.old == c };
            if !at_head {
                {
                    let head = if (*c).young { &mut self.young } else { &mut self.old };
                    ring::remove(head, c);
                    ring::push_head(head, c);
                }
                self.stats.ring_moves += 1;
            }
        }
        self.stats.deleted += 1;
        self.stats.live -= 1;
    }

    #[inline(always)]
    unsafe fn modify_root(&mut self, r: &mut Root, v: Value) {
        let s = *r;
        *s = v;
        let c = Chunk::of_slot(s);
        if self.classify_young(v) && !(*c).young {
            // no remembered set to lean on in this engine; the whole chunk
            // becomes young so the next minor scan sees the cell
            ring::remove(&mut self.old, c);
            (*c).young = true;
            ring::push_head(&mut self.young, c);
            self.stats.ring_moves += 1;
        }
        self.stats.modified += 1;
    }

    unsafe fn scan(&mut self, action: ScanAction, minor: bool, data: *mut c_void) {
        if minor {
            for c in ring::nodes(self.young) {
                self.scan_chunk(c, action, data, true);
            }
            // the nursery is evacuated: yesterday's young ring is old now
            for c in ring::nodes(self.young) {
                (*c).young = false;
            }
            ring::splice_tail(&mut self.old, &mut self.young);
        } else {
            for c in ring::nodes(self.young)
                .into_iter()
                .chain(ring::nodes(self.old).into_iter())
            {
                self.scan_chunk(c, action, data, false);
            }
            self.reclaim_empty_chunks();
        }
    }

    unsafe fn teardown(&mut self) {
        for c in ring::nodes(self.young)
            .into_iter()
            .chain(ring::nodes(self.old).into_iter())
        {
            pages::free_aligned(&self.hooks, c as *mut u8, CHUNK_SIZE);
            self.stats.note_pool_free();
        }
        self.young = ptr::null_mut();
        self.old = ptr::null_mut();
    }

    unsafe fn validate(&mut self) {
        let saved = self.stats;
        let mut live = 0i64;
        let mut chunks = 0u64;
        for c in ring::nodes(self.young) {
            assert!((*c).young, "old-marked chunk on the young ring");
            assert!(!ring::contains(self.old, c), "chunk reachable from both rings");
            live += self.count_full(c) as i64;
            chunks += 1;
        }
        for c in ring::nodes(self.old) {
            assert!(!(*c).young, "young-marked chunk on the old ring");
            live += self.count_full(c) as i64;
            chunks += 1;
        }
        assert_eq!(live, self.stats.live, "bitmap census disagrees with stats");
        assert_eq!(chunks, self.stats.live_pools, "ring census disagrees with stats");
        self.stats = saved;
    }
}
