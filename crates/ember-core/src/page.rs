//! Fixed-shape KV page allocator over device memory (C1).
//!
//! There is no real accelerator in this workspace; a page's backing store is
//! a boxed, fixed-size `f32` slab and its identity is the slab's raw address,
//! exactly as the executor contract expects ("use the raw device address as
//! page identity").

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ember_common::{EmberError, Result};

/// Shape of every page in a pool: `(num_layers, 2, num_heads, page_len, head_dim)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageShape {
    pub num_layers: usize,
    pub num_heads: usize,
    pub page_len: usize,
    pub head_dim: usize,
}

impl PageShape {
    pub fn element_count(&self) -> usize {
        self.num_layers * 2 * self.num_heads * self.page_len * self.head_dim
    }
}

/// A single page of KV storage. Exclusively owned by one [`super::kv::SequenceCache`]
/// while allocated; returned to the pool on release.
pub struct Page {
    addr: u64,
    // Backing storage kept alive for the page's lifetime; its heap address
    // is stable across moves of this struct, which is what `addr` captures.
    _storage: Box<[f32]>,
}

impl Page {
    fn new(shape: PageShape) -> Self {
        let storage: Box<[f32]> = vec![0.0f32; shape.element_count()].into_boxed_slice();
        let addr = storage.as_ptr() as u64;
        Self {
            addr,
            _storage: storage,
        }
    }

    /// The raw device address identifying this page. Stable for the page's
    /// lifetime; reused addresses are possible once a page is freed and its
    /// slab handed back out by the pool.
    pub fn addr(&self) -> u64 {
        self.addr
    }
}

/// A set of pages tied to one shape, with a bounded capacity. Pages are
/// never freed to the OS until the pool itself is dropped; freed pages go
/// onto an internal free list for reuse.
pub struct PagePool {
    shape: PageShape,
    capacity_pages: usize,
    free: Mutex<Vec<Page>>,
    outstanding: Mutex<HashSet<u64>>,
    created: Mutex<usize>,
}

impl PagePool {
    pub fn new(shape: PageShape, capacity_pages: usize) -> Arc<Self> {
        Arc::new(Self {
            shape,
            capacity_pages,
            free: Mutex::new(Vec::new()),
            outstanding: Mutex::new(HashSet::new()),
            created: Mutex::new(0),
        })
    }

    pub fn page_shape(&self) -> PageShape {
        self.shape
    }

    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    /// Number of pages currently checked out to sequence caches.
    pub fn num_pages(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }

    pub fn alloc_page(&self) -> Result<Page> {
        let mut free = self.free.lock().unwrap();
        let page = if let Some(p) = free.pop() {
            p
        } else {
            let mut created = self.created.lock().unwrap();
            if *created >= self.capacity_pages {
                return Err(EmberError::PoolExhausted);
            }
            *created += 1;
            Page::new(self.shape)
        };
        self.outstanding.lock().unwrap().insert(page.addr());
        Ok(page)
    }

    /// Must be called at most once per page. An unknown or already-freed
    /// address fails with `InvalidPage` — a diagnostic for programming
    /// errors, never user-visible.
    pub fn free_page(&self, page: Page) -> Result<()> {
        let removed = self.outstanding.lock().unwrap().remove(&page.addr());
        if !removed {
            return Err(EmberError::InvalidPage);
        }
        self.free.lock().unwrap().push(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> PageShape {
        PageShape {
            num_layers: 2,
            num_heads: 4,
            page_len: 16,
            head_dim: 8,
        }
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let pool = PagePool::new(shape(), 4);
        let p = pool.alloc_page().unwrap();
        assert_eq!(pool.num_pages(), 1);
        pool.free_page(p).unwrap();
        assert_eq!(pool.num_pages(), 0);
    }

    #[test]
    fn exhaustion_when_capacity_reached() {
        let pool = PagePool::new(shape(), 2);
        let _a = pool.alloc_page().unwrap();
        let _b = pool.alloc_page().unwrap();
        match pool.alloc_page() {
            Err(EmberError::PoolExhausted) => {}
            other => panic!("expected PoolExhausted, got {other:?}"),
        }
    }

    #[test]
    fn freed_pages_are_reused_not_returned_to_os() {
        let pool = PagePool::new(shape(), 1);
        let p = pool.alloc_page().unwrap();
        let addr = p.addr();
        pool.free_page(p).unwrap();
        let p2 = pool.alloc_page().unwrap();
        assert_eq!(p2.addr(), addr);
    }

    #[test]
    fn double_free_is_invalid_page() {
        let pool = PagePool::new(shape(), 2);
        let a = pool.alloc_page().unwrap();
        let addr = a.addr();
        pool.free_page(a).unwrap();
        // Reconstruct a "stale" page value with the same address to model a
        // caller holding onto a page after freeing it once already.
        let bogus = Page {
            addr,
            _storage: vec![0.0f32; 1].into_boxed_slice(),
        };
        match pool.free_page(bogus) {
            Err(EmberError::InvalidPage) => {}
            other => panic!("expected InvalidPage, got {other:?}"),
        }
    }
}
