//! Per-sequence KV cache (C2) and the batched, read-only view over many
//! sequence caches handed to the Model Executor each step (C3).

use std::sync::Arc;

use ember_backend::BatchedCacheView;
use ember_common::Result;

use crate::page::{Page, PagePool};

/// Geometrically-growing `u64` buffer, mirroring the original `GrowableTensor`:
/// logical length and backing capacity are tracked separately so the
/// pointer table only needs reallocating on power-of-two boundaries.
#[derive(Debug, Default)]
struct PtrBuffer {
    buf: Vec<u64>,
    len: usize,
}

impl PtrBuffer {
    fn view(&self) -> &[u64] {
        &self.buf[..self.len]
    }

    fn push(&mut self, v: u64) {
        self.maybe_grow(self.len + 1);
        if self.buf.len() <= self.len {
            self.buf.push(v);
        } else {
            self.buf[self.len] = v;
        }
        self.len += 1;
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn maybe_grow(&mut self, capacity: usize) {
        if self.buf.len() >= capacity {
            return;
        }
        let new_capacity = capacity.next_power_of_two().max(1);
        self.buf.resize(new_capacity, 0);
    }
}

/// Ordered list of pages plus logical token length for one request.
pub struct SequenceCache {
    pool: Arc<PagePool>,
    pages: Vec<Page>,
    seqlen: usize,
    ptrs: PtrBuffer,
}

impl SequenceCache {
    /// Allocates `ceil(init_len / page_len)` pages up front. `init_len == 0`
    /// allocates nothing; the first `acquire_one()` call allocates the
    /// first page (the §8 boundary behavior for an empty sequence).
    pub fn new(pool: Arc<PagePool>, init_len: usize) -> Result<Self> {
        let page_len = pool.page_shape().page_len;
        let npages = if init_len == 0 {
            0
        } else {
            (init_len + page_len - 1) / page_len
        };
        let mut pages = Vec::with_capacity(npages);
        let mut ptrs = PtrBuffer::default();
        for _ in 0..npages {
            let page = pool.alloc_page()?;
            ptrs.push(page.addr());
            pages.push(page);
        }
        Ok(Self {
            pool,
            pages,
            seqlen: init_len,
            ptrs,
        })
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn seqlen(&self) -> usize {
        self.seqlen
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn ptrs(&self) -> &[u64] {
        self.ptrs.view()
    }

    /// `((seqlen - 1) mod page_len) + 1`. At `seqlen == 0` this evaluates as
    /// if the (nonexistent) last page were full, which is exactly what makes
    /// the first `acquire_one()` allocate a page.
    pub fn last_page_offset(&self) -> usize {
        let page_len = self.pool.page_shape().page_len;
        if self.seqlen == 0 {
            page_len
        } else {
            (self.seqlen - 1) % page_len + 1
        }
    }

    /// Reserves space for one more token, allocating a new page only when
    /// the current last page is full (or the cache is empty).
    pub fn acquire_one(&mut self) -> Result<()> {
        if self.last_page_offset() == self.pool.page_shape().page_len {
            let page = self.pool.alloc_page()?;
            self.ptrs.push(page.addr());
            self.pages.push(page);
        }
        self.seqlen += 1;
        Ok(())
    }

    /// Returns every page to the pool and clears local state.
    pub fn release(&mut self) -> Result<()> {
        for page in self.pages.drain(..) {
            self.pool.free_page(page)?;
        }
        self.ptrs.clear();
        self.seqlen = 0;
        Ok(())
    }
}

/// Builds a read-only [`BatchedCacheView`] over an ordered, non-empty slice
/// of sequence caches that all share one pool. The view owns no pages; it is
/// a flattened snapshot good for exactly one model step.
pub fn build_batched_view(caches: &[&SequenceCache]) -> BatchedCacheView {
    assert!(!caches.is_empty(), "batched cache view requires >=1 sequence");
    let pool = caches[0].pool();
    let mut ptrs = Vec::new();
    let mut indptr = vec![0i32];
    let mut last_page_offset = Vec::with_capacity(caches.len());
    for cache in caches {
        assert!(
            Arc::ptr_eq(cache.pool(), pool),
            "all sequences in a batched view must share one pool"
        );
        assert!(cache.num_pages() > 0, "a batched sequence must own >=1 page");
        ptrs.extend_from_slice(cache.ptrs());
        let last = *indptr.last().unwrap();
        indptr.push(last + cache.num_pages() as i32);
        last_page_offset.push(cache.last_page_offset() as i32);
    }
    BatchedCacheView {
        ptrs,
        indptr,
        last_page_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageShape;

    fn pool(capacity: usize) -> Arc<PagePool> {
        PagePool::new(
            PageShape {
                num_layers: 2,
                num_heads: 2,
                page_len: 16,
                head_dim: 8,
            },
            capacity,
        )
    }

    #[test]
    fn new_zero_len_allocates_nothing() {
        let cache = SequenceCache::new(pool(8), 0).unwrap();
        assert_eq!(cache.num_pages(), 0);
        assert_eq!(cache.seqlen(), 0);
    }

    #[test]
    fn new_computes_ceil_pages() {
        let cache = SequenceCache::new(pool(8), 17).unwrap();
        assert_eq!(cache.num_pages(), 2); // ceil(17/16)
    }

    #[test]
    fn acquire_one_from_empty_allocates_first_page() {
        let mut cache = SequenceCache::new(pool(8), 0).unwrap();
        cache.acquire_one().unwrap();
        assert_eq!(cache.seqlen(), 1);
        assert_eq!(cache.num_pages(), 1);
    }

    #[test]
    fn acquire_one_at_page_boundary_allocates_exactly_one_new_page() {
        let mut cache = SequenceCache::new(pool(8), 16).unwrap();
        assert_eq!(cache.num_pages(), 1);
        cache.acquire_one().unwrap();
        assert_eq!(cache.num_pages(), 2);
        assert_eq!(cache.seqlen(), 17);
    }

    #[test]
    fn acquire_one_mid_page_does_not_allocate() {
        let mut cache = SequenceCache::new(pool(8), 5).unwrap();
        assert_eq!(cache.num_pages(), 1);
        cache.acquire_one().unwrap();
        assert_eq!(cache.num_pages(), 1);
        assert_eq!(cache.seqlen(), 6);
    }

    #[test]
    fn release_frees_all_pages_for_reuse() {
        let p = pool(2);
        let mut cache = SequenceCache::new(p.clone(), 20).unwrap();
        assert_eq!(cache.num_pages(), 2);
        cache.release().unwrap();
        assert_eq!(p.num_pages(), 0);
        assert_eq!(cache.seqlen(), 0);
    }

    #[test]
    fn batched_view_concatenates_ptrs_and_builds_indptr() {
        let p = pool(8);
        let a = SequenceCache::new(p.clone(), 20).unwrap(); // 2 pages
        let b = SequenceCache::new(p.clone(), 5).unwrap(); // 1 page
        let view = build_batched_view(&[&a, &b]);
        assert_eq!(view.indptr, vec![0, 2, 3]);
        assert_eq!(view.ptrs.len(), 3);
        assert_eq!(view.last_page_offset, vec![(20 - 1) % 16 + 1, 5]);
    }
}
