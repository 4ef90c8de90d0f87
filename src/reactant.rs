//! Indexed populations of current pattern matches, one list per rule and
//! reactant slot.
//!
//! Mapping sets live in a pool and are addressed by a stable id, so the
//! membership back-references stored on molecules survive internal
//! reorganization. The pick index array tolerates holes: removal is O(1),
//! uniform picking rejects holes and redraws, and a compaction pass keeps the
//! hole fraction bounded.

use rand::rngs::StdRng;
use rand::Rng;

use crate::pattern::MappingSet;

/// Fraction of holes in the index array that triggers compaction.
const DEFAULT_COMPACT_RATIO: f64 = 0.5;
const COMPACT_MIN_SLOTS: usize = 16;

/// The indexed population of mapping sets for one reactant slot.
#[derive(Clone, Debug)]
pub struct ReactantList {
    /// Mapping-set pool addressed by stable id.
    pool: Vec<Option<MappingSet>>,
    pool_free: Vec<usize>,
    /// Pick index: position -> mapping-set id, with holes.
    slots: Vec<Option<usize>>,
    /// Back reference: mapping-set id -> position in `slots`.
    pos_of: Vec<usize>,
    holes: usize,
    len: usize,
    total_weight: f64,
    compact_ratio: f64,
}

impl Default for ReactantList {
    fn default() -> Self {
        ReactantList {
            pool: Vec::new(),
            pool_free: Vec::new(),
            slots: Vec::new(),
            pos_of: Vec::new(),
            holes: 0,
            len: 0,
            total_weight: 0.0,
            compact_ratio: DEFAULT_COMPACT_RATIO,
        }
    }
}

impl ReactantList {
    pub fn new() -> Self {
        ReactantList::default()
    }

    /// Adjust the hole fraction that triggers compaction.
    pub fn set_compact_ratio(&mut self, ratio: f64) {
        self.compact_ratio = ratio.clamp(0.1, 0.9);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of the per-match weights of everything stored.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Number of pool entries currently claimed. Equals `len()` unless
    /// mapping sets leaked.
    pub fn claimed(&self) -> usize {
        self.pool.iter().filter(|p| p.is_some()).count()
    }

    /// Store a mapping set, returning its stable id.
    pub fn insert(&mut self, ms: MappingSet) -> usize {
        self.total_weight += ms.weight;
        let id = match self.pool_free.pop() {
            Some(id) => {
                self.pool[id] = Some(ms);
                id
            }
            None => {
                self.pool.push(Some(ms));
                self.pos_of.push(0);
                self.pool.len() - 1
            }
        };
        self.slots.push(Some(id));
        self.pos_of[id] = self.slots.len() - 1;
        self.len += 1;
        id
    }

    /// Remove a mapping set by id, leaving a hole in the pick index.
    pub fn remove(&mut self, id: usize) -> Option<MappingSet> {
        let ms = self.pool[id].take()?;
        self.total_weight -= ms.weight;
        self.pool_free.push(id);
        self.slots[self.pos_of[id]] = None;
        self.holes += 1;
        self.len -= 1;
        if self.slots.len() >= COMPACT_MIN_SLOTS
            && (self.holes as f64) > self.compact_ratio * (self.slots.len() as f64)
        {
            self.compact();
        }
        Some(ms)
    }

    pub fn get(&self, id: usize) -> Option<&MappingSet> {
        self.pool.get(id).and_then(|p| p.as_ref())
    }

    /// Uniform pick over stored ids: draw a position, reject holes, redraw.
    pub fn pick_uniform(&self, rng: &mut StdRng) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        loop {
            let pos = rng.gen_range(0..self.slots.len());
            if let Some(id) = self.slots[pos] {
                return Some(id);
            }
        }
    }

    /// Weight-proportional pick: `u` in [0,1) selects id `i` with probability
    /// `w_i / total_weight`.
    pub fn pick_weighted(&self, u: f64) -> Option<usize> {
        if self.len == 0 || self.total_weight <= 0.0 {
            return None;
        }
        let target = u * self.total_weight;
        let mut cumsum = 0.0;
        let mut last = None;
        for id in self.slots.iter().flatten() {
            let ms = self.pool[*id].as_ref()?;
            cumsum += ms.weight;
            last = Some(*id);
            if target <= cumsum {
                return last;
            }
        }
        // floating-point shortfall lands on the final entry
        last
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &MappingSet)> {
        self.slots
            .iter()
            .flatten()
            .filter_map(move |&id| self.pool[id].as_ref().map(|ms| (id, ms)))
    }

    pub fn clear(&mut self) {
        self.pool.clear();
        self.pool_free.clear();
        self.slots.clear();
        self.pos_of.clear();
        self.holes = 0;
        self.len = 0;
        self.total_weight = 0.0;
    }

    /// Rebuild the pick index densely and re-sum weights against drift.
    fn compact(&mut self) {
        let ids: Vec<usize> = self.slots.iter().flatten().copied().collect();
        self.slots.clear();
        self.total_weight = 0.0;
        for id in ids {
            self.slots.push(Some(id));
            self.pos_of[id] = self.slots.len() - 1;
            if let Some(ms) = &self.pool[id] {
                self.total_weight += ms.weight;
            }
        }
        self.holes = 0;
    }
}
