//! Combination enumerator
//!
//! A [`ChainChoice`] fixes, per server, which optional transformations the
//! chain formula will carry and which single hop (at most one) normalizes.
//! Two generation modes share one counting rule:
//!
//! - **Exhaustive**: deterministic lexicographic order — per-server subsets
//!   ordered by size then index, the transformation assignment as the outer
//!   odometer and the normalize configuration innermost. Reproducibility of
//!   result ordering across runs hangs off this order.
//! - **Random without replacement**: a seeded `StdRng` proposes choices; a
//!   rejection sampler over the canonical choice hash (blake3 of the sorted
//!   per-server transformation names plus the normalize flag) drops
//!   revisits. Termination: the explored set reaching the exhaustive count.
//!
//! Invariants for every generated choice: `selected[i]` is a subset of
//! server `i`'s optional ∪ essential pool with at most `max_transforms`
//! entries, and at most one normalize flag is set.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::server::Server;
use crate::transform::Transformation;

/// Default cap on transformations selected per server.
pub const DEFAULT_MAX_TRANSFORMS: usize = 2;

// ============================================================================
// ChainChoice
// ============================================================================

/// One selection of per-server transformation subsets plus at most one
/// normalization flag.
#[derive(Debug, Clone)]
pub struct ChainChoice {
    /// Per-server chosen transformations, in application order.
    pub selected: Vec<Vec<Transformation>>,
    /// Per-server normalize flag; at most one entry is true.
    pub normalize: Vec<bool>,
}

impl ChainChoice {
    /// Index of the normalizing hop, if any.
    pub fn normalize_index(&self) -> Option<usize> {
        self.normalize.iter().position(|&b| b)
    }

    /// Canonical content hash: per server, the sorted transformation names
    /// and the normalize flag. Two choices selecting the same sets hash
    /// identically regardless of generation order.
    pub fn canonical_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (selected, flag) in self.selected.iter().zip(&self.normalize) {
            let mut names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
            names.sort_unstable();
            for name in names {
                hasher.update(name.as_bytes());
                hasher.update(&[0x00]);
            }
            hasher.update(if *flag { &[0x01] } else { &[0x02] });
        }
        *hasher.finalize().as_bytes()
    }

    /// Human-readable description for logs and the run summary.
    pub fn describe(&self, servers: &[Server]) -> String {
        let mut parts = Vec::with_capacity(servers.len());
        for (i, server) in servers.iter().enumerate() {
            let names: Vec<&str> =
                self.selected[i].iter().map(|t| t.name.as_str()).collect();
            let norm = if self.normalize[i] { "+norm" } else { "" };
            parts.push(format!("{}:[{}]{}", server.name, names.join(", "), norm));
        }
        parts.join(" | ")
    }

    /// Whether this choice satisfies the generation invariants for `servers`.
    pub fn is_valid_for(&self, servers: &[Server], max_transforms: usize) -> bool {
        if self.selected.len() != servers.len() || self.normalize.len() != servers.len() {
            return false;
        }
        if self.normalize.iter().filter(|&&b| b).count() > 1 {
            return false;
        }
        for (i, server) in servers.iter().enumerate() {
            if self.normalize[i] && !server.is_normalize() {
                return false;
            }
            if self.selected[i].len() > max_transforms {
                return false;
            }
            let pool = selection_pool(server);
            if !self.selected[i].iter().all(|t| pool.iter().any(|p| p == t)) {
                return false;
            }
        }
        true
    }
}

fn selection_pool(server: &Server) -> Vec<Transformation> {
    let mut pool = server.transformations.clone();
    pool.extend(server.essential_transformations.iter().cloned());
    pool
}

// ============================================================================
// Counting
// ============================================================================

fn binomial(n: u128, k: u128) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc = 1u128;
    for i in 0..k {
        acc = acc * (n - i) / (i + 1);
    }
    acc
}

/// Exact number of distinct choices:
/// `∏_i Σ_{k=0..max} C(|pool_i|, k)  ×  (normalize-capable + 1)`.
pub fn combination_count(servers: &[Server], max_transforms: usize) -> u128 {
    let mut total = 1u128;
    for server in servers {
        let pool = selection_pool(server).len() as u128;
        let per_server: u128 =
            (0..=max_transforms as u128).map(|k| binomial(pool, k)).sum();
        total *= per_server;
    }
    let norm_capable = servers.iter().filter(|s| s.is_normalize()).count() as u128;
    total * (norm_capable + 1)
}

// ============================================================================
// Strategies
// ============================================================================

/// How choices are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Deterministic lexicographic enumeration.
    Exhaustive,
    /// Seeded random sampling without replacement.
    Random {
        /// PRNG seed; recorded in the run summary for reproducibility.
        seed: u64,
    },
}

/// Enumerate chain choices for `servers` under the given strategy.
pub fn choices(servers: &[Server], max_transforms: usize, strategy: Strategy) -> ChoiceIter {
    match strategy {
        Strategy::Exhaustive => {
            ChoiceIter::Exhaustive(ExhaustiveChoices::new(servers, max_transforms))
        }
        Strategy::Random { seed } => {
            ChoiceIter::Random(RandomChoices::new(servers, max_transforms, seed))
        }
    }
}

/// Either enumeration mode behind one iterator type.
pub enum ChoiceIter {
    /// Lexicographic enumeration.
    Exhaustive(ExhaustiveChoices),
    /// Seeded rejection sampling.
    Random(RandomChoices),
}

impl Iterator for ChoiceIter {
    type Item = ChainChoice;
    fn next(&mut self) -> Option<ChainChoice> {
        match self {
            ChoiceIter::Exhaustive(it) => it.next(),
            ChoiceIter::Random(it) => it.next(),
        }
    }
}

// ------------------------------------------------------------------
// Exhaustive
// ------------------------------------------------------------------

/// Lexicographic enumeration of all chain choices.
pub struct ExhaustiveChoices {
    subsets: Vec<Vec<Vec<Transformation>>>,
    norm_configs: Vec<Vec<bool>>,
    cursor: Vec<usize>,
    done: bool,
}

impl ExhaustiveChoices {
    fn new(servers: &[Server], max_transforms: usize) -> Self {
        let subsets: Vec<Vec<Vec<Transformation>>> = servers
            .iter()
            .map(|s| subsets_up_to(&selection_pool(s), max_transforms))
            .collect();

        let mut norm_configs = vec![vec![false; servers.len()]];
        for (i, server) in servers.iter().enumerate() {
            if server.is_normalize() {
                let mut config = vec![false; servers.len()];
                config[i] = true;
                norm_configs.push(config);
            }
        }

        let cursor = vec![0usize; servers.len() + 1];
        Self { subsets, norm_configs, cursor, done: false }
    }
}

impl Iterator for ExhaustiveChoices {
    type Item = ChainChoice;

    fn next(&mut self) -> Option<ChainChoice> {
        if self.done {
            return None;
        }
        let n = self.subsets.len();
        let choice = ChainChoice {
            selected: (0..n).map(|i| self.subsets[i][self.cursor[i]].clone()).collect(),
            normalize: self.norm_configs[self.cursor[n]].clone(),
        };

        // Odometer with the normalize config as the fastest digit.
        let mut pos = n as isize;
        loop {
            if pos < 0 {
                self.done = true;
                break;
            }
            let limit = if pos as usize == n {
                self.norm_configs.len()
            } else {
                self.subsets[pos as usize].len()
            };
            self.cursor[pos as usize] += 1;
            if self.cursor[pos as usize] < limit {
                break;
            }
            self.cursor[pos as usize] = 0;
            pos -= 1;
        }
        Some(choice)
    }
}

/// All index-lexicographic subsets of `pool` of size `0..=max`, smallest
/// sizes first.
fn subsets_up_to(pool: &[Transformation], max: usize) -> Vec<Vec<Transformation>> {
    let mut out = Vec::new();
    for k in 0..=max.min(pool.len()) {
        k_combinations(pool, k, &mut out);
    }
    out
}

/// Append every size-`k` index combination of `pool`, lexicographically.
fn k_combinations(pool: &[Transformation], k: usize, out: &mut Vec<Vec<Transformation>>) {
    if k == 0 {
        out.push(Vec::new());
        return;
    }
    let n = pool.len();
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        out.push(indices.iter().map(|&i| pool[i].clone()).collect());
        // Rightmost index that can still advance.
        let mut i = k as isize - 1;
        while i >= 0 && indices[i as usize] == i as usize + n - k {
            i -= 1;
        }
        if i < 0 {
            return;
        }
        let i = i as usize;
        indices[i] += 1;
        for j in i + 1..k {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

// ------------------------------------------------------------------
// Random without replacement
// ------------------------------------------------------------------

/// Seeded random choice generation with canonical-hash rejection.
pub struct RandomChoices {
    pools: Vec<Vec<Transformation>>,
    norm_candidates: Vec<usize>,
    n_servers: usize,
    max_transforms: usize,
    rng: StdRng,
    seen: HashSet<[u8; 32]>,
    total: u128,
}

impl RandomChoices {
    fn new(servers: &[Server], max_transforms: usize, seed: u64) -> Self {
        Self {
            pools: servers.iter().map(selection_pool).collect(),
            norm_candidates: servers
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_normalize())
                .map(|(i, _)| i)
                .collect(),
            n_servers: servers.len(),
            max_transforms,
            rng: StdRng::seed_from_u64(seed),
            seen: HashSet::new(),
            total: combination_count(servers, max_transforms),
        }
    }
}

impl Iterator for RandomChoices {
    type Item = ChainChoice;

    fn next(&mut self) -> Option<ChainChoice> {
        loop {
            if self.seen.len() as u128 >= self.total {
                return None;
            }

            let mut selected = Vec::with_capacity(self.n_servers);
            for pool in &self.pools {
                let size = self.rng.gen_range(0..=self.max_transforms.min(pool.len()));
                let mut picked: Vec<Transformation> =
                    rand::seq::index::sample(&mut self.rng, pool.len(), size)
                        .into_iter()
                        .map(|i| pool[i].clone())
                        .collect();
                picked.sort_by(|a, b| a.name.cmp(&b.name));
                selected.push(picked);
            }

            let mut normalize = vec![false; self.n_servers];
            if !self.norm_candidates.is_empty() {
                let pick = self.rng.gen_range(0..=self.norm_candidates.len());
                if pick < self.norm_candidates.len() {
                    normalize[self.norm_candidates[pick]] = true;
                }
            }

            let choice = ChainChoice { selected, normalize };
            if self.seen.insert(choice.canonical_hash()) {
                return Some(choice);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
