use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::distance::{l2_normalize, unit_distance};
use crate::error::VecError;
use crate::index::{AnnIndex, Neighbor};

/// Highest layer a node may be assigned to.
pub(crate) const MAX_LEVEL: usize = 31;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// HnswConfig configures a new HNSW index.
///
/// Larger `m`, `ef_construction` and `ef_search` raise recall at the cost
/// of memory, build time and query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Vector dimension. Required; must be positive.
    pub dim: usize,
    /// Max links per node per layer (layer 0 allows 2*m). Default: 16.
    pub m: usize,
    /// Candidate list width while inserting. Default: 200.
    pub ef_construction: usize,
    /// Candidate list width while searching. Default: 64.
    pub ef_search: usize,
    /// Seed for level assignment. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: None,
        }
    }
}

impl HnswConfig {
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub(crate) fn set_defaults(&mut self) {
        if self.m < 2 {
            self.m = 16;
        }
        if self.ef_construction == 0 {
            self.ef_construction = 200;
        }
        if self.ef_search == 0 {
            self.ef_search = 64;
        }
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 { self.m * 2 } else { self.m }
    }
}

// ---------------------------------------------------------------------------
// Heap entries
// ---------------------------------------------------------------------------

/// Min-heap entry: closest on top.
#[derive(Clone, Copy)]
struct Near {
    slot: u32,
    dist: f32,
}

impl Ord for Near {
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist.total_cmp(&self.dist).then(other.slot.cmp(&self.slot))
    }
}
impl PartialOrd for Near {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Near {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Near {}

/// Max-heap entry: farthest on top.
#[derive(Clone, Copy)]
struct Far {
    slot: u32,
    dist: f32,
}

impl Ord for Far {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.total_cmp(&other.dist).then(self.slot.cmp(&other.slot))
    }
}
impl PartialOrd for Far {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Far {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Far {}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

pub(crate) struct Node {
    pub(crate) id: String,
    pub(crate) vector: Vec<f32>,
    /// links[layer] = neighbor slots; the node lives on layers 0..links.len().
    pub(crate) links: Vec<Vec<u32>>,
}

impl Node {
    pub(crate) fn level(&self) -> usize {
        self.links.len() - 1
    }
}

pub(crate) struct Graph {
    pub(crate) cfg: HnswConfig,
    pub(crate) slots: Vec<Option<Node>>,
    pub(crate) by_id: HashMap<String, u32>,
    pub(crate) entry: Option<u32>,
    pub(crate) top_level: usize,
    pub(crate) free: Vec<u32>,
    level_mul: f64,
    rng: StdRng,
}

impl Graph {
    pub(crate) fn new(cfg: HnswConfig) -> Self {
        Self::from_slots(cfg, Vec::new())
    }

    /// Rebuild derived state (id map, entry point, free list) from slots.
    pub(crate) fn from_slots(cfg: HnswConfig, slots: Vec<Option<Node>>) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut g = Self {
            level_mul: 1.0 / (cfg.m as f64).ln(),
            cfg,
            slots,
            by_id: HashMap::new(),
            entry: None,
            top_level: 0,
            free: Vec::new(),
            rng,
        };
        for (i, slot) in g.slots.iter().enumerate() {
            match slot {
                None => g.free.push(i as u32),
                Some(nd) => {
                    g.by_id.insert(nd.id.clone(), i as u32);
                }
            }
        }
        g.pick_entry();
        g
    }

    fn node(&self, slot: u32) -> Option<&Node> {
        self.slots.get(slot as usize).and_then(|s| s.as_ref())
    }

    fn dist_to(&self, query: &[f32], slot: u32) -> f32 {
        match self.node(slot) {
            Some(nd) => unit_distance(query, &nd.vector),
            None => f32::INFINITY,
        }
    }

    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
        ((-r.ln() * self.level_mul) as usize).min(MAX_LEVEL)
    }

    fn pick_entry(&mut self) {
        let mut best: Option<(u32, usize)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(nd) = slot {
                if best.is_none_or(|(_, lvl)| nd.level() > lvl) {
                    best = Some((i as u32, nd.level()));
                }
            }
        }
        match best {
            Some((slot, level)) => {
                self.entry = Some(slot);
                self.top_level = level;
            }
            None => {
                self.entry = None;
                self.top_level = 0;
            }
        }
    }

    /// Greedy walk from `start` down to (and excluding) layer `stop`.
    fn descend(&self, query: &[f32], start: u32, from: usize, stop: usize) -> u32 {
        let mut cur = start;
        let mut cur_dist = self.dist_to(query, cur);
        let mut layer = from;
        while layer > stop {
            let mut changed = true;
            while changed {
                changed = false;
                let Some(nd) = self.node(cur) else { break };
                if let Some(links) = nd.links.get(layer) {
                    for &f in links {
                        let d = self.dist_to(query, f);
                        if d < cur_dist {
                            cur = f;
                            cur_dist = d;
                            changed = true;
                        }
                    }
                }
            }
            layer -= 1;
        }
        cur
    }

    /// Beam search on one layer. Returns (slot, distance) ascending.
    fn search_layer(&self, query: &[f32], entries: &[u32], ef: usize, layer: usize) -> Vec<(u32, f32)> {
        let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 2);
        let mut candidates: BinaryHeap<Near> = BinaryHeap::new();
        let mut results: BinaryHeap<Far> = BinaryHeap::new();

        for &ep in entries {
            if self.node(ep).is_some() && visited.insert(ep) {
                let d = self.dist_to(query, ep);
                candidates.push(Near { slot: ep, dist: d });
                results.push(Far { slot: ep, dist: d });
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(closest) = candidates.pop() {
            if results.len() >= ef {
                if let Some(far) = results.peek() {
                    if closest.dist > far.dist {
                        break;
                    }
                }
            }
            let Some(nd) = self.node(closest.slot) else { continue };
            let Some(links) = nd.links.get(layer) else { continue };
            for &f in links {
                if !visited.insert(f) || self.node(f).is_none() {
                    continue;
                }
                let d = self.dist_to(query, f);
                let admit = results.len() < ef || results.peek().is_none_or(|far| d < far.dist);
                if admit {
                    candidates.push(Near { slot: f, dist: d });
                    results.push(Far { slot: f, dist: d });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results.into_iter().map(|f| (f.slot, f.dist)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    /// Keep the `max` candidates closest to `base`.
    fn closest_of(&self, base: &[f32], candidates: impl IntoIterator<Item = u32>, max: usize) -> Vec<u32> {
        let mut items: Vec<(u32, f32)> = candidates
            .into_iter()
            .filter(|&c| self.node(c).is_some())
            .map(|c| (c, self.dist_to(base, c)))
            .collect();
        items.sort_by(|a, b| a.1.total_cmp(&b.1));
        items.dedup_by_key(|(c, _)| *c);
        items.truncate(max);
        items.into_iter().map(|(c, _)| c).collect()
    }

    pub(crate) fn insert(&mut self, id: &str, vector: Vec<f32>) {
        if let Some(&old) = self.by_id.get(id) {
            self.remove_slot(old);
        }

        let slot = match self.free.pop() {
            Some(s) => s,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };

        let level = self.random_level();
        self.slots[slot as usize] = Some(Node {
            id: id.to_string(),
            vector: vector.clone(),
            links: vec![Vec::new(); level + 1],
        });
        self.by_id.insert(id.to_string(), slot);

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            self.top_level = level;
            return;
        };

        let top = self.top_level;
        let start = if top > level {
            self.descend(&vector, entry, top, level)
        } else {
            entry
        };

        let mut eps = vec![start];
        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(&vector, &eps, self.cfg.ef_construction, layer);
            let max = self.cfg.max_links(layer);
            let chosen = self.closest_of(&vector, found.iter().map(|(s, _)| *s), max);

            if let Some(nd) = self.slots[slot as usize].as_mut() {
                nd.links[layer] = chosen.clone();
            }

            for &n in &chosen {
                let overflow = match self.slots[n as usize].as_mut() {
                    Some(nn) if layer < nn.links.len() => {
                        nn.links[layer].push(slot);
                        nn.links[layer].len() > max
                    }
                    _ => false,
                };
                if overflow {
                    self.prune(n, layer, max);
                }
            }

            eps = found.into_iter().map(|(s, _)| s).collect();
        }

        if level > self.top_level {
            self.entry = Some(slot);
            self.top_level = level;
        }
    }

    fn prune(&mut self, slot: u32, layer: usize, max: usize) {
        let Some(nd) = self.node(slot) else { return };
        let base = nd.vector.clone();
        let current = nd.links[layer].clone();
        let kept = self.closest_of(&base, current, max);
        if let Some(nd) = self.slots[slot as usize].as_mut() {
            nd.links[layer] = kept;
        }
    }

    /// Unlink a node and re-link its former neighbors among themselves.
    pub(crate) fn remove_slot(&mut self, slot: u32) {
        let Some(removed) = self.slots[slot as usize].take() else { return };
        self.by_id.remove(&removed.id);
        self.free.push(slot);

        // Drop every incoming link, including one-directional ones left by pruning.
        for nd in self.slots.iter_mut().flatten() {
            for links in nd.links.iter_mut() {
                links.retain(|&x| x != slot);
            }
        }

        // Repair: each former neighbor picks its best links among its own
        // remaining links plus the removed node's neighborhood.
        for (layer, orphaned) in removed.links.iter().enumerate() {
            let max = self.cfg.max_links(layer);
            for &n in orphaned {
                let Some(nd) = self.node(n) else { continue };
                if layer >= nd.links.len() {
                    continue;
                }
                let base = nd.vector.clone();
                let pool: Vec<u32> = nd.links[layer]
                    .iter()
                    .chain(orphaned.iter())
                    .copied()
                    .filter(|&c| c != n)
                    .filter(|&c| self.node(c).is_some_and(|cn| layer < cn.links.len()))
                    .collect();
                let relinked = self.closest_of(&base, pool, max);
                for &r in &relinked {
                    if let Some(rn) = self.slots[r as usize].as_mut() {
                        if !rn.links[layer].contains(&n) && rn.links[layer].len() < max {
                            rn.links[layer].push(n);
                        }
                    }
                }
                if let Some(nd) = self.slots[n as usize].as_mut() {
                    nd.links[layer] = relinked;
                }
            }
        }

        if self.entry == Some(slot) {
            self.pick_entry();
        } else if self.by_id.is_empty() {
            self.entry = None;
            self.top_level = 0;
        }
    }

    /// k nearest with candidate width `ef`. Returns (slot, distance) ascending.
    fn knn(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        let Some(entry) = self.entry else { return Vec::new() };
        let start = self.descend(query, entry, self.top_level, 0);
        let mut found = self.search_layer(query, &[start], ef.max(k), 0);
        found.truncate(k);
        found
    }

    fn to_neighbors(&self, found: Vec<(u32, f32)>) -> Vec<Neighbor> {
        found
            .into_iter()
            .filter_map(|(s, d)| {
                self.node(s).map(|nd| Neighbor {
                    id: nd.id.clone(),
                    distance: d,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// HnswIndex
// ---------------------------------------------------------------------------

/// HnswIndex is a Hierarchical Navigable Small World graph implementing
/// [`AnnIndex`].
///
/// Safe for concurrent use: searches share a read lock, mutations take the
/// write lock for the duration of one insert or removal.
pub struct HnswIndex {
    graph: RwLock<Graph>,
}

impl HnswIndex {
    /// Create an empty index. Panics if `cfg.dim` is zero.
    pub fn new(mut cfg: HnswConfig) -> Self {
        assert!(cfg.dim > 0, "vecstore: HnswConfig.dim must be positive");
        cfg.set_defaults();
        Self {
            graph: RwLock::new(Graph::new(cfg)),
        }
    }

    pub(crate) fn from_graph(graph: Graph) -> Self {
        Self {
            graph: RwLock::new(graph),
        }
    }

    pub(crate) fn graph(&self) -> parking_lot::RwLockReadGuard<'_, Graph> {
        self.graph.read()
    }

    pub fn config(&self) -> HnswConfig {
        self.graph.read().cfg.clone()
    }

    /// Adjust the search-time candidate list width.
    pub fn set_ef_search(&self, ef: usize) {
        self.graph.write().cfg.ef_search = ef.max(1);
    }

    fn prepare(&self, id: &str, vector: &[f32], dim: usize) -> Result<Vec<f32>, VecError> {
        if vector.len() != dim {
            return Err(VecError::DimensionMismatch {
                got: vector.len(),
                want: dim,
            });
        }
        let mut v = vector.to_vec();
        if !l2_normalize(&mut v) {
            return Err(VecError::ZeroVector(id.to_string()));
        }
        Ok(v)
    }
}

impl AnnIndex for HnswIndex {
    fn insert(&self, id: &str, vector: &[f32]) -> Result<(), VecError> {
        let dim = self.graph.read().cfg.dim;
        let v = self.prepare(id, vector, dim)?;
        self.graph.write().insert(id, v);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, VecError> {
        let mut g = self.graph.write();
        match g.by_id.get(id).copied() {
            Some(slot) => {
                g.remove_slot(slot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VecError> {
        let g = self.graph.read();
        let q = self.prepare("<query>", query, g.cfg.dim)?;
        if k == 0 || g.by_id.is_empty() {
            return Ok(Vec::new());
        }
        let found = g.knn(&q, k, g.cfg.ef_search);
        Ok(g.to_neighbors(found))
    }

    fn search_within(
        &self,
        query: &[f32],
        max_distance: f32,
        limit: usize,
    ) -> Result<Vec<Neighbor>, VecError> {
        let g = self.graph.read();
        let q = self.prepare("<query>", query, g.cfg.dim)?;
        let total = g.by_id.len();
        if limit == 0 || total == 0 {
            return Ok(Vec::new());
        }

        // Widen the beam until the farthest hit falls outside the bound,
        // the limit is met, or the whole graph has been considered.
        let mut width = g.cfg.ef_search.max(limit);
        loop {
            let found = g.knn(&q, width, width);
            let within = found.iter().take_while(|(_, d)| *d <= max_distance).count();
            if within < found.len() || within >= limit || width >= total {
                let mut hits: Vec<(u32, f32)> = found.into_iter().take(within).collect();
                hits.truncate(limit);
                return Ok(g.to_neighbors(hits));
            }
            width = (width * 2).min(total);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.graph.read().by_id.contains_key(id)
    }

    fn len(&self) -> usize {
        self.graph.read().by_id.len()
    }

    fn ids(&self) -> Vec<String> {
        self.graph.read().by_id.keys().cloned().collect()
    }

    fn clear(&self) {
        let mut g = self.graph.write();
        let cfg = g.cfg.clone();
        *g = Graph::new(cfg);
    }

    fn dim(&self) -> usize {
        self.graph.read().cfg.dim
    }
}
