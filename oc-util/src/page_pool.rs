// Copyright (c) Facebook, Inc. and its affiliates.

//! A growable pool of individually allocated, physically backed pages.
//!
//! The pool is grown by a single controller thread and touched concurrently
//! by any number of worker threads without locking. Page handles live in a
//! fixed capacity slot table which is allocated zeroed up front so that its
//! backing memory is only committed as slots get used. The number of valid
//! slots is published with release ordering after the new pages have been
//! filled, so a reader which bounds its index by `len()` only ever sees
//! fully initialized pages. Pages are never freed while the pool is alive.
use anyhow::{bail, Result};
use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

/// How much of each new page is written with pseudo-random data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillPolicy {
    /// A single byte, just enough to fault in a physical page.
    None,
    /// Almost half of the page, compresses roughly 2:1.
    Half,
    /// The whole page, effectively incompressible.
    Full,
}

impl FillPolicy {
    pub fn fill_len(&self, page_size: usize) -> usize {
        match self {
            FillPolicy::None => 1,
            FillPolicy::Half => (page_size / 2).saturating_sub(64).max(1),
            FillPolicy::Full => page_size,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            FillPolicy::None => {
                "Allocated pages zero-filled (except 1 byte to force physical page allocation)"
            }
            FillPolicy::Half => "Allocated pages half-filled with random numbers",
            FillPolicy::Full => "Allocated pages filled with random numbers",
        }
    }
}

impl Default for FillPolicy {
    fn default() -> Self {
        FillPolicy::Half
    }
}

impl std::str::FromStr for FillPolicy {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input {
            "none" => FillPolicy::None,
            "half" => FillPolicy::Half,
            "full" => FillPolicy::Full,
            _ => bail!("unknown fill policy {:?}, expected none, half or full", input),
        })
    }
}

pub struct PagePool {
    page_size: usize,
    layout: Layout,
    slots: Box<[AtomicPtr<u8>]>,
    len: AtomicUsize,
    template: Vec<u8>,
    grow_lock: Mutex<()>,
}

impl PagePool {
    fn alloc_slots(capacity: usize) -> Result<Box<[AtomicPtr<u8>]>> {
        if capacity == 0 {
            return Ok(Vec::new().into_boxed_slice());
        }
        let layout = Layout::array::<AtomicPtr<u8>>(capacity)?;
        // A null AtomicPtr is all zero bytes.
        unsafe {
            let base = alloc_zeroed(layout) as *mut AtomicPtr<u8>;
            if base.is_null() {
                bail!("Failed to allocate slot table for {} pages", capacity);
            }
            Ok(Box::from_raw(ptr::slice_from_raw_parts_mut(base, capacity)))
        }
    }

    /// Create an empty pool which can hold up to `capacity` pages of
    /// `page_size` bytes. Each new page is initialized from a template page
    /// prepared according to `fill`.
    pub fn new(page_size: usize, capacity: usize, fill: FillPolicy) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            bail!("Invalid page size {}", page_size);
        }
        let layout = Layout::from_size_align(page_size, page_size)?;

        let mut rng = SmallRng::from_entropy();
        let fill_len = fill.fill_len(page_size);
        let mut template = vec![0u8; page_size];
        match fill {
            FillPolicy::None => template[0] = 1,
            _ => rng.fill(&mut template[..fill_len]),
        }

        debug!(
            "page_pool: page_size={} capacity={} fill={:?} fill_len={}",
            page_size, capacity, fill, fill_len
        );

        Ok(Self {
            page_size,
            layout,
            slots: Self::alloc_slots(capacity)?,
            len: AtomicUsize::new(0),
            template,
            grow_lock: Mutex::new(()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages which can currently be touched. Always re-read this
    /// before picking an index as the pool grows underneath the readers.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Number of whole pages `bytes` covers.
    pub fn pages_for(&self, bytes: usize) -> usize {
        bytes / self.page_size
    }

    /// Allocate and fault in `bytes / page_size` pages and append them to
    /// the pool. Returns the number of pages appended which is less than
    /// requested if either the allocator or the slot table ran out.
    pub fn alloc_pages(&self, bytes: usize) -> usize {
        let _guard = self.grow_lock.lock().unwrap();
        let nr_pages = self.pages_for(bytes);
        let start = self.len.load(Ordering::Relaxed);
        let mut nr_done = 0;

        while nr_done < nr_pages {
            let idx = start + nr_done;
            if idx >= self.slots.len() {
                warn!(
                    "page_pool: slot table full at {} pages, {} of {} allocated",
                    idx, nr_done, nr_pages
                );
                break;
            }
            let page = unsafe { alloc(self.layout) };
            if page.is_null() {
                warn!(
                    "page_pool: allocation failed at page {}, {} of {} allocated",
                    idx, nr_done, nr_pages
                );
                break;
            }
            // The whole page is written so nothing stale from the heap
            // survives past the filled part.
            unsafe {
                ptr::copy_nonoverlapping(self.template.as_ptr(), page, self.page_size);
            }
            self.slots[idx].store(page, Ordering::Relaxed);
            nr_done += 1;
        }

        self.len.store(start + nr_done, Ordering::Release);
        nr_done
    }

    /// Write `val` to the first byte of page `idx`. Returns false if `idx`
    /// isn't a valid page yet.
    pub fn touch(&self, idx: usize, val: u8) -> bool {
        if idx >= self.len() {
            return false;
        }
        let page = self.slots[idx].load(Ordering::Relaxed);
        // Concurrent touchers may hit the same page, go through an atomic
        // byte to keep the stores well-defined.
        unsafe { (*(page as *const AtomicU8)).store(val, Ordering::Relaxed) };
        true
    }

    /// Read the first byte of page `idx`.
    pub fn peek(&self, idx: usize) -> Option<u8> {
        if idx >= self.len() {
            return None;
        }
        let page = self.slots[idx].load(Ordering::Relaxed);
        Some(unsafe { (*(page as *const AtomicU8)).load(Ordering::Relaxed) })
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let len = *self.len.get_mut();
        for slot in self.slots[..len].iter_mut() {
            let page = *slot.get_mut();
            if !page.is_null() {
                unsafe { dealloc(page, self.layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FillPolicy, PagePool};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    const PG: usize = 4096;

    fn page_contents(pool: &PagePool, idx: usize) -> Vec<u8> {
        assert!(idx < pool.len());
        let page = pool.slots[idx].load(Ordering::Relaxed);
        unsafe { std::slice::from_raw_parts(page, PG).to_vec() }
    }

    #[test]
    fn test_alloc_floor_and_count() {
        let pool = PagePool::new(PG, 1024, FillPolicy::None).unwrap();
        assert_eq!(pool.alloc_pages(10 * PG + PG - 1), 10);
        assert_eq!(pool.len(), 10);
        assert_eq!(pool.alloc_pages(PG - 1), 0);
        assert_eq!(pool.len(), 10);
        assert_eq!(pool.alloc_pages(3 * PG), 3);
        assert_eq!(pool.len(), 13);
    }

    #[test]
    fn test_alloc_partial() {
        let pool = PagePool::new(PG, 16, FillPolicy::None).unwrap();
        assert_eq!(pool.alloc_pages(12 * PG), 12);
        // Runs out at page 4 of the second batch.
        assert_eq!(pool.alloc_pages(10 * PG), 4);
        assert_eq!(pool.len(), 16);
        for idx in 0..16 {
            assert_eq!(pool.peek(idx), Some(1));
        }
        assert_eq!(pool.alloc_pages(PG), 0);
        assert_eq!(pool.len(), 16);
    }

    #[test]
    fn test_fill_policies() {
        for fill in &[FillPolicy::None, FillPolicy::Half, FillPolicy::Full] {
            let pool = PagePool::new(PG, 4, *fill).unwrap();
            assert_eq!(pool.alloc_pages(2 * PG), 2);
            let fill_len = fill.fill_len(PG);
            let first = page_contents(&pool, 0);
            assert_eq!(first, page_contents(&pool, 1));
            assert_eq!(first, pool.template);
            assert!(first[fill_len..].iter().all(|b| *b == 0));
            if *fill == FillPolicy::None {
                assert_eq!(first[0], 1);
            }
        }
        assert_eq!(FillPolicy::Half.fill_len(PG), PG / 2 - 64);
        assert_eq!(FillPolicy::Full.fill_len(PG), PG);
        assert_eq!("full".parse::<FillPolicy>().unwrap(), FillPolicy::Full);
        assert!("most".parse::<FillPolicy>().is_err());
    }

    #[test]
    fn test_fill_tail_zeroed_on_reused_memory() {
        // Leave random pages behind in the allocator so that new pages are
        // likely to land on dirty memory.
        {
            let dirty = PagePool::new(PG, 64, FillPolicy::Full).unwrap();
            assert_eq!(dirty.alloc_pages(64 * PG), 64);
        }
        let pool = PagePool::new(PG, 64, FillPolicy::None).unwrap();
        assert_eq!(pool.alloc_pages(64 * PG), 64);
        for idx in 0..64 {
            let page = page_contents(&pool, idx);
            assert_eq!(page[0], 1);
            assert!(page[1..].iter().all(|b| *b == 0), "page {} has stale bytes", idx);
        }

        let pool = PagePool::new(PG, 4, FillPolicy::Half).unwrap();
        assert_eq!(pool.alloc_pages(4 * PG), 4);
        let half = FillPolicy::Half.fill_len(PG);
        for idx in 0..4 {
            assert!(page_contents(&pool, idx)[half..].iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_touch_bounds() {
        let pool = PagePool::new(PG, 8, FillPolicy::None).unwrap();
        assert!(!pool.touch(0, 7));
        pool.alloc_pages(2 * PG);
        assert!(pool.touch(1, 7));
        assert_eq!(pool.peek(1), Some(7));
        assert!(!pool.touch(2, 7));
        assert_eq!(pool.peek(2), None);
        assert!(PagePool::new(3000, 8, FillPolicy::None).is_err());
    }

    #[test]
    fn test_concurrent_touch_while_growing() {
        let pool = Arc::new(PagePool::new(PG, 4096, FillPolicy::None).unwrap());
        pool.alloc_pages(PG);

        let mut jhs = vec![];
        for t in 0..4u8 {
            let pool = pool.clone();
            jhs.push(thread::spawn(move || {
                let mut nr = 0;
                for i in 0..100_000usize {
                    let len = pool.len();
                    assert!(pool.touch(i % len, t));
                    nr += 1;
                }
                nr
            }));
        }
        for _ in 0..64 {
            assert_eq!(pool.alloc_pages(32 * PG), 32);
        }
        for jh in jhs {
            assert_eq!(jh.join().unwrap(), 100_000);
        }
        assert_eq!(pool.len(), 1 + 64 * 32);
    }
}
