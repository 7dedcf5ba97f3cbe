//! LoRA adapter registry (C4): loading, rank padding, LRU eviction, and
//! step-scoped pinning so an adapter can't be evicted out from under a
//! batch that is actively using it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ember_common::{AdapterId, EmberError, Result};

/// The seven projections an adapter carries low-rank deltas for, matching
/// the fused grouped-GEMM application order.
pub const PROJECTIONS: [&str; 7] = ["q", "k", "v", "o", "gate", "up", "down"];

/// One projection's `(A, B)` pair, stored column-major (`A` is `hidden x
/// rank`, `B` is `rank x hidden`, both flattened column-major) to match the
/// layout the grouped-GEMM kernel expects.
#[derive(Debug, Clone)]
pub struct LoraWeight {
    pub a: Vec<f32>,
    pub b: Vec<f32>,
}

/// A fully loaded adapter: one [`LoraWeight`] per projection, all padded to
/// this adapter's `padded_rank`.
#[derive(Debug, Clone)]
pub struct AdapterWeights {
    pub raw_rank: usize,
    pub padded_rank: usize,
    pub hidden_size: usize,
    pub weights: HashMap<&'static str, LoraWeight>,
}

/// Pads `raw_rank < r0` up to `2 * raw_rank`, zero-extending the `A`/`B`
/// matrices on the new rank rows/columns. Ranks already `>= r0` are left
/// unpadded: padding exists only to keep very low ranks out of a
/// pathologically narrow GEMM tile, not to equalize every adapter's rank.
fn padded_rank(raw_rank: usize, r0: usize) -> usize {
    if raw_rank < r0 {
        raw_rank * 2
    } else {
        raw_rank
    }
}

fn pad_weight(w: &LoraWeight, hidden_size: usize, raw_rank: usize, padded: usize) -> LoraWeight {
    if padded == raw_rank {
        return w.clone();
    }
    let mut a = vec![0.0f32; hidden_size * padded];
    let mut b = vec![0.0f32; padded * hidden_size];
    // column-major: column j occupies a[j*hidden_size .. (j+1)*hidden_size]
    for j in 0..raw_rank {
        let src = &w.a[j * hidden_size..(j + 1) * hidden_size];
        a[j * hidden_size..(j + 1) * hidden_size].copy_from_slice(src);
    }
    for i in 0..raw_rank {
        let src = &w.b[i * hidden_size..(i + 1) * hidden_size];
        b[i * hidden_size..(i + 1) * hidden_size].copy_from_slice(src);
    }
    LoraWeight { a, b }
}

/// LRU-evicting, capacity-bounded adapter store. `r0` is the configured
/// default rank used both as the padding threshold and as the `rank` field
/// reported on every [`ember_backend::AdapterRunBatch`] this registry's
/// adapters appear in.
pub struct AdapterRegistry {
    r0: usize,
    capacity: usize,
    loaded: HashMap<AdapterId, Arc<AdapterWeights>>,
    // front = least recently used
    lru: VecDeque<AdapterId>,
    pinned: HashSet<AdapterId>,
}

impl AdapterRegistry {
    /// The reserved `empty` id is seeded as a permanently resident,
    /// zero-weight entry: it never occupies the LRU list and can never be
    /// evicted, so it doesn't compete with real adapters for capacity.
    pub fn new(r0: usize, capacity: usize) -> Self {
        let mut loaded = HashMap::new();
        loaded.insert(
            ember_common::empty_adapter_id(),
            Arc::new(AdapterWeights {
                raw_rank: 0,
                padded_rank: 0,
                hidden_size: 0,
                weights: HashMap::new(),
            }),
        );
        Self {
            r0,
            capacity,
            loaded,
            lru: VecDeque::new(),
            pinned: HashSet::new(),
        }
    }

    pub fn default_rank(&self) -> usize {
        self.r0
    }

    pub fn is_loaded(&self, id: &AdapterId) -> bool {
        self.loaded.contains_key(id)
    }

    /// All ids currently resident, including the reserved `empty` id.
    pub fn loaded_ids(&self) -> Vec<AdapterId> {
        self.loaded.keys().cloned().collect()
    }

    /// `(raw_rank, padded_rank)` for a resident adapter, if loaded.
    pub fn status(&self, id: &AdapterId) -> Option<(usize, usize)> {
        self.loaded.get(id).map(|w| (w.raw_rank, w.padded_rank))
    }

    /// Unloads an adapter. The reserved `empty` id can never be removed.
    /// Safe to call between steps only: pins are always cleared by the time
    /// admin commands are drained (see [`crate::engine::Engine::step`]).
    pub fn remove(&mut self, id: &AdapterId) -> Result<()> {
        if id == &ember_common::empty_adapter_id() {
            return Err(EmberError::AdapterNotFound(id.clone()));
        }
        if self.loaded.remove(id).is_none() {
            return Err(EmberError::AdapterNotFound(id.clone()));
        }
        self.remove_from_lru(id);
        self.pinned.remove(id);
        Ok(())
    }

    /// Loads an adapter's raw (unpadded) weights, evicting the
    /// least-recently-used unpinned adapter if at capacity. Re-loading an
    /// id already present replaces its weights and refreshes recency.
    pub fn load(
        &mut self,
        id: AdapterId,
        raw_rank: usize,
        hidden_size: usize,
        raw: HashMap<&'static str, LoraWeight>,
    ) -> Result<()> {
        for proj in PROJECTIONS {
            if !raw.contains_key(proj) {
                return Err(EmberError::AdapterShapeMismatch {
                    expected_rank: raw_rank,
                    actual_rank: 0,
                });
            }
        }
        let padded = padded_rank(raw_rank, self.r0);
        let mut weights = HashMap::with_capacity(PROJECTIONS.len());
        for proj in PROJECTIONS {
            let w = &raw[proj];
            weights.insert(proj, pad_weight(w, hidden_size, raw_rank, padded));
        }
        let entry = Arc::new(AdapterWeights {
            raw_rank,
            padded_rank: padded,
            hidden_size,
            weights,
        });

        let already_resident = self.lru.iter().any(|x| x == &id);
        if !already_resident && self.lru.len() >= self.capacity {
            self.evict_one()?;
        }
        self.remove_from_lru(&id);
        self.lru.push_back(id.clone());
        self.loaded.insert(id, entry);
        Ok(())
    }

    /// Looks up an adapter, refreshing its recency. Fails if the adapter
    /// was never loaded.
    pub fn get(&mut self, id: &AdapterId) -> Result<Arc<AdapterWeights>> {
        let weights = self
            .loaded
            .get(id)
            .cloned()
            .ok_or_else(|| EmberError::AdapterNotFound(id.clone()))?;
        self.remove_from_lru(id);
        self.lru.push_back(id.clone());
        Ok(weights)
    }

    /// Marks an adapter as in-use for the in-flight step; pinned adapters
    /// are exempt from eviction until [`Self::unpin`] is called.
    pub fn pin(&mut self, id: &AdapterId) {
        self.pinned.insert(id.clone());
    }

    pub fn unpin(&mut self, id: &AdapterId) {
        self.pinned.remove(id);
    }

    pub fn unpin_all(&mut self) {
        self.pinned.clear();
    }

    fn remove_from_lru(&mut self, id: &AdapterId) {
        if let Some(pos) = self.lru.iter().position(|x| x == id) {
            self.lru.remove(pos);
        }
    }

    fn evict_one(&mut self) -> Result<()> {
        let victim = self
            .lru
            .iter()
            .position(|id| !self.pinned.contains(id))
            .ok_or(EmberError::Backpressure)?;
        let id = self.lru.remove(victim).unwrap();
        self.loaded.remove(&id);
        Ok(())
    }
}
