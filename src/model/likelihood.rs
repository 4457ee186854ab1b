// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Chen's sum-product over the demography: partial likelihoods of the
//! observed leaf configuration are propagated from the leaves towards
//! the root along the event tree, and the expected number of mutated
//! sites showing the configuration accumulates population by
//! population.
//!
//! Every population `v` has a `bottom` table (likelihood of the data
//! beneath `v` given `a` ancestral and `d` derived lineages at the
//! recent end of its size history) and a `top` table (same at the
//! ancient end, after coalescence through the history). Merge-only
//! demographies factorize completely and the engine carries one scalar
//! table per population; the two parents of a pulse stay coupled, so
//! their cluster shares a joint table until their lineages reunite.

use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use rayon::prelude::*;

use crate::errors::{Error, Result};
use crate::model::demography::{binom_f64, hypergeom_split, Demography, EventKind};
use crate::model::history::{KernelCache, Quadrature};
use crate::model::kernels::log_urn_prob;
use crate::model::SiteConfig;
use crate::utils::KahanSum;

/// Expected number of segregating sites showing `config` under `demo`.
pub fn compute_sfs(demo: &Demography, config: &SiteConfig) -> Result<f64> {
    SumProduct::new(demo).evaluate(config)
}

/// Batch variant of `compute_sfs`. Configurations are distributed over
/// the rayon pool; every worker owns its engine (and thereby its
/// caches), so a demography is never evaluated concurrently through
/// shared mutable state.
pub fn compute_sfs_batch(demo: &Demography, configs: &[SiteConfig]) -> Result<Vec<f64>> {
    configs
        .par_iter()
        .map_init(|| SumProduct::new(demo), |engine, config| engine.evaluate(config))
        .collect()
}

/// A joint partial-likelihood table over the populations of one event
/// cluster. `states` maps per-population `(ancestral, derived)`
/// assignments (aligned with `pops`) to the likelihood of the observed
/// data beneath the cluster.
#[derive(Debug, Clone)]
struct Table {
    pops: Vec<NodeIndex>,
    states: HashMap<Vec<(u32, u32)>, f64>,
}

impl Table {
    fn position(&self, pop: NodeIndex) -> usize {
        self.pops
            .iter()
            .position(|&p| p == pop)
            .expect("bug: population missing from its cluster table")
    }

    /// Sum of entries with `pop` fixed to `(a, d)` and zero derived
    /// lineages everywhere else (ancestral counts marginalized). For a
    /// singleton cluster this is just the table itself.
    fn ancestral_slice(&self, pop: NodeIndex) -> HashMap<(u32, u32), f64> {
        let idx = self.position(pop);
        let mut ret = HashMap::new();
        for (state, &val) in &self.states {
            if state
                .iter()
                .enumerate()
                .any(|(j, &(_, d))| j != idx && d > 0)
            {
                continue;
            }
            *ret.entry(state[idx]).or_insert(0.0) += val;
        }
        ret
    }
}

fn pack(pop: NodeIndex, a: u32, d: u32) -> u64 {
    debug_assert!(a < 1 << 16 && d < 1 << 16);
    (pop.index() as u64) << 32 | u64::from(a) << 16 | u64::from(d)
}

/// The memoizing sum-product evaluator. Owns all per-demography caches;
/// kernel tables survive across configurations, partial-likelihood
/// tables are rebuilt per configuration.
pub struct SumProduct<'a> {
    demo: &'a Demography,
    quad: Quadrature,
    kernels: Vec<KernelCache>,
    n_derived_subtended: Vec<u32>,
    total_derived: u32,
    bottom: HashMap<u64, f64>,
    top: HashMap<u64, f64>,
    joint_sfs: f64,
}

impl<'a> SumProduct<'a> {
    pub fn new(demo: &'a Demography) -> Self {
        Self::with_quadrature(demo, Quadrature::default())
    }

    pub fn with_quadrature(demo: &'a Demography, quad: Quadrature) -> Self {
        SumProduct {
            demo,
            quad,
            kernels: vec![KernelCache::default(); demo.node_count()],
            n_derived_subtended: Vec::new(),
            total_derived: 0,
            bottom: HashMap::new(),
            top: HashMap::new(),
            joint_sfs: 0.0,
        }
    }

    /// Likelihood of the data beneath `v` given `a` ancestral and `d`
    /// derived lineages at the bottom of `v`'s size history (for
    /// populations coupled through a pulse: with every other coexisting
    /// population carrying ancestral lineages only). Valid after
    /// `evaluate`.
    pub fn partial_likelihood_bottom(&self, v: NodeIndex, a: u32, d: u32) -> f64 {
        self.bottom.get(&pack(v, a, d)).copied().unwrap_or(0.0)
    }

    /// As `partial_likelihood_bottom`, at the top of `v`'s history.
    pub fn partial_likelihood_top(&self, v: NodeIndex, a: u32, d: u32) -> f64 {
        self.top.get(&pack(v, a, d)).copied().unwrap_or(0.0)
    }

    /// The result of the last `evaluate`: the expected number of sites
    /// whose mutation produces the observed configuration, summed over
    /// all populations of the demography.
    pub fn joint_sfs(&self) -> f64 {
        self.joint_sfs
    }

    /// Number of derived alleles of the last loaded configuration that
    /// were sampled beneath `v`.
    pub fn n_derived_subtended_by(&self, v: NodeIndex) -> u32 {
        self.n_derived_subtended[v.index()]
    }

    pub fn evaluate(&mut self, config: &SiteConfig) -> Result<f64> {
        self.load_config(config)?;

        let mut tables: HashMap<usize, Table> = HashMap::new();
        let mut cluster_of: HashMap<NodeIndex, usize> = HashMap::new();
        let mut next_cluster = 0usize;
        let mut sfs = KahanSum::new();

        let leaf_pos: HashMap<NodeIndex, usize> = self
            .demo
            .leaves()
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i))
            .collect();

        for event in self.demo.events() {
            match *event.kind() {
                EventKind::Leaf(v) => {
                    let (a, d) = config.counts()[leaf_pos[&v]];
                    let mut states = HashMap::new();
                    states.insert(vec![(a, d)], 1.0);
                    tables.insert(next_cluster, Table { pops: vec![v], states });
                    cluster_of.insert(v, next_cluster);
                    next_cluster += 1;
                }
                EventKind::Merge { parent, children } => {
                    for &child in &children {
                        let table = &tables[&cluster_of[&child]];
                        self.record_bottom(table, child, &mut sfs)?;
                    }
                    for &child in &children {
                        let id = cluster_of[&child];
                        let table = tables.remove(&id).unwrap();
                        let table = self.transport(table, child)?;
                        self.record_top(&table, child);
                        tables.insert(id, table);
                    }
                    let (id1, id2) = (cluster_of[&children[0]], cluster_of[&children[1]]);
                    let joined = if id1 == id2 {
                        tables.remove(&id1).unwrap()
                    } else {
                        let left = tables.remove(&id1).unwrap();
                        let right = tables.remove(&id2).unwrap();
                        join(left, right)
                    };
                    let merged = merge_pops(joined, children, parent);
                    for &pop in &merged.pops {
                        cluster_of.insert(pop, next_cluster);
                    }
                    for &child in &children {
                        cluster_of.remove(&child);
                    }
                    tables.insert(next_cluster, merged);
                    next_cluster += 1;
                }
                EventKind::Pulse { parents, child } => {
                    let id = cluster_of[&child];
                    self.record_bottom(&tables[&id], child, &mut sfs)?;
                    let table = tables.remove(&id).unwrap();
                    let table = self.transport(table, child)?;
                    self.record_top(&table, child);
                    let probs = self
                        .demo
                        .split_probs(child)
                        .expect("bug: pulse child without split probabilities");
                    let pulsed = pulse_pop(table, child, parents, probs);
                    for &pop in &pulsed.pops {
                        cluster_of.insert(pop, next_cluster);
                    }
                    cluster_of.remove(&child);
                    tables.insert(next_cluster, pulsed);
                    next_cluster += 1;
                }
            }
        }

        debug_assert_eq!(tables.len(), 1);
        let root_table = tables.into_iter().next().unwrap().1;
        debug_assert_eq!(root_table.pops, vec![self.demo.root()]);
        self.record_bottom(&root_table, self.demo.root(), &mut sfs)?;

        let total = sfs.sum();
        if !total.is_finite() {
            return Err(Error::Precision {
                context: "joint SFS",
            });
        }
        debug!(
            "evaluated configuration against {}: joint sfs = {}",
            self.demo, total
        );
        self.joint_sfs = total;
        Ok(total)
    }

    fn load_config(&mut self, config: &SiteConfig) -> Result<()> {
        let leaves = self.demo.leaves();
        if config.counts().len() != leaves.len() {
            return Err(Error::ConfigLength {
                expected: leaves.len(),
                got: config.counts().len(),
            });
        }
        self.bottom.clear();
        self.top.clear();
        self.joint_sfs = 0.0;

        let leaf_derived: HashMap<NodeIndex, u32> = leaves
            .iter()
            .zip(config.counts())
            .map(|(&v, &(_, d))| (v, d))
            .collect();
        let n_nodes = self.demo.node_count();
        self.n_derived_subtended = (0..n_nodes)
            .map(|i| {
                self.demo
                    .leaves_subtended_by(NodeIndex::new(i))
                    .iter()
                    .map(|leaf| leaf_derived[leaf])
                    .sum()
            })
            .collect();
        self.total_derived = leaves.iter().map(|leaf| leaf_derived[leaf]).sum();
        Ok(())
    }

    /// Store the bottom table of `pop` and add its population term of
    /// the joint SFS: mutations arising while `pop` existed can explain
    /// the configuration only if every derived allele was sampled
    /// beneath `pop`.
    fn record_bottom(&mut self, table: &Table, pop: NodeIndex, sfs: &mut KahanSum) -> Result<()> {
        let slice = table.ancestral_slice(pop);
        for (&(a, d), &val) in &slice {
            self.bottom.insert(pack(pop, a, d), val);
        }
        if self.n_derived_subtended[pop.index()] != self.total_derived {
            return Ok(());
        }
        let history = self.demo.size_history(pop);
        let cache = &mut self.kernels[pop.index()];
        for (&(a, d), &val) in &slice {
            if d == 0 || val == 0.0 {
                continue;
            }
            let n_bottom = a + d;
            // Impossible endpoints (g(n_bottom, n_top) = 0, e.g. over a
            // zero-length epoch) contribute nothing: ES_i is 0 there.
            for n_top in 1..=n_bottom - d + 1 {
                sfs.add(val * history.es(cache, &self.quad, d, n_bottom, n_top)?);
            }
        }
        Ok(())
    }

    fn record_top(&mut self, table: &Table, pop: NodeIndex) {
        for (&(a, d), &val) in &table.ancestral_slice(pop) {
            self.top.insert(pack(pop, a, d), val);
        }
    }

    /// Propagate `pop`'s axis from the bottom to the top of its size
    /// history: `g` collapses the lineage count, the urn weight
    /// distributes the derived alleles exchangeably over the survivors.
    /// A derived lineage cannot vanish, so `d_top = 0` is unreachable
    /// from `d_bottom > 0`.
    fn transport(&mut self, table: Table, pop: NodeIndex) -> Result<Table> {
        let idx = table.position(pop);
        let history = self.demo.size_history(pop);
        let cache = &mut self.kernels[pop.index()];
        let mut states: HashMap<Vec<(u32, u32)>, f64> = HashMap::new();
        for (state, &val) in &table.states {
            if val == 0.0 {
                continue;
            }
            let (a_bottom, d_bottom) = state[idx];
            let n_bottom = a_bottom + d_bottom;
            if n_bottom == 0 {
                *states.entry(state.clone()).or_insert(0.0) += val;
                continue;
            }
            for n_top in 1..=n_bottom {
                let g = history.g(cache, n_bottom, n_top)?;
                if g == 0.0 {
                    continue;
                }
                let d_range = if d_bottom == 0 {
                    0..=0
                } else {
                    1..=d_bottom.min(n_top)
                };
                for d_top in d_range {
                    let a_top = n_top - d_top;
                    let mut weight = val * g;
                    if d_bottom > 0 {
                        let urn = log_urn_prob(d_top, a_top, d_bottom, a_bottom).exp();
                        if urn == 0.0 {
                            continue;
                        }
                        weight *= urn;
                    }
                    let mut next = state.clone();
                    next[idx] = (a_top, d_top);
                    *states.entry(next).or_insert(0.0) += weight;
                }
            }
        }
        Ok(Table {
            pops: table.pops,
            states,
        })
    }
}

/// Outer product of two disjoint cluster tables.
fn join(left: Table, right: Table) -> Table {
    let mut pops = left.pops.clone();
    pops.extend(right.pops.iter().copied());
    let mut states = HashMap::new();
    for (ls, &lv) in &left.states {
        if lv == 0.0 {
            continue;
        }
        for (rs, &rv) in &right.states {
            let mut state = ls.clone();
            state.extend(rs.iter().copied());
            states.insert(state, lv * rv);
        }
    }
    Table { pops, states }
}

/// Combine the top states of two merging populations into the bottom
/// state of their parent. The split weight
/// `C(a, a_l) C(d, d_l) / C(a + d, a_l + d_l)` is the exchangeable
/// probability of the observed allocation of lineages to the two
/// children.
fn merge_pops(table: Table, children: [NodeIndex; 2], parent: NodeIndex) -> Table {
    let il = table.position(children[0]);
    let ir = table.position(children[1]);
    let mut pops: Vec<NodeIndex> = table
        .pops
        .iter()
        .copied()
        .filter(|&p| p != children[0] && p != children[1])
        .collect();
    pops.push(parent);
    let mut states = HashMap::new();
    for (state, &val) in &table.states {
        if val == 0.0 {
            continue;
        }
        let (a_l, d_l) = state[il];
        let (a_r, d_r) = state[ir];
        let (a, d) = (a_l + a_r, d_l + d_r);
        let weight = binom_f64(a as usize, a_l as usize) * binom_f64(d as usize, d_l as usize)
            / binom_f64((a + d) as usize, (a_l + d_l) as usize);
        let mut next: Vec<(u32, u32)> = state
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != il && j != ir)
            .map(|(_, &s)| s)
            .collect();
        next.push((a, d));
        *states.entry(next).or_insert(0.0) += weight * val;
    }
    Table { pops, states }
}

/// Distribute the pulse child's lineages over its two parents: a
/// binomial allocation of lineages with the child's mixture proportion,
/// and a hypergeometric split of the derived alleles within it.
fn pulse_pop(
    table: Table,
    child: NodeIndex,
    parents: [NodeIndex; 2],
    probs: &[(NodeIndex, f64); 2],
) -> Table {
    let idx = table.position(child);
    // orient the mixture proportion towards `parents[0]`
    let q = if probs[0].0 == parents[0] {
        probs[0].1
    } else {
        probs[1].1
    };
    let mut pops: Vec<NodeIndex> = table
        .pops
        .iter()
        .copied()
        .filter(|&p| p != child)
        .collect();
    pops.push(parents[0]);
    pops.push(parents[1]);
    let mut states = HashMap::new();
    for (state, &val) in &table.states {
        if val == 0.0 {
            continue;
        }
        let (a, d) = state[idx];
        let n = a + d;
        for n_from_1 in 0..=n {
            let pmf = binom_f64(n as usize, n_from_1 as usize)
                * q.powi(n_from_1 as i32)
                * (1.0 - q).powi((n - n_from_1) as i32);
            if pmf == 0.0 {
                continue;
            }
            for d_1 in 0..=d.min(n_from_1) {
                let split = hypergeom_split(d, a, n_from_1, d_1);
                if split == 0.0 {
                    continue;
                }
                let a_1 = n_from_1 - d_1;
                let mut next: Vec<(u32, u32)> = state
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != idx)
                    .map(|(_, &s)| s)
                    .collect();
                next.push((a_1, d_1));
                next.push((a - a_1, d - d_1));
                *states.entry(next).or_insert(0.0) += pmf * split * val;
            }
        }
    }
    Table { pops, states }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Params;

    fn single_pop(n: u32) -> Demography {
        Demography::from_cmd(&format!("-d 10000 -n {}", n), &Params::default()).unwrap()
    }

    #[test]
    fn test_leaf_clamp() {
        let demo = single_pop(3);
        let config = SiteConfig::from_derived(&demo, &[1]).unwrap();
        let mut engine = SumProduct::new(&demo);
        engine.evaluate(&config).unwrap();
        let leaf = demo.leaves()[0];
        assert_relative_eq!(engine.partial_likelihood_bottom(leaf, 2, 1), 1.0);
        assert_relative_eq!(engine.partial_likelihood_bottom(leaf, 1, 1), 0.0);
        assert_relative_eq!(engine.partial_likelihood_bottom(leaf, 2, 0), 0.0);
        assert_relative_eq!(engine.partial_likelihood_bottom(leaf, 1, 2), 0.0);
    }

    #[test]
    fn test_single_pop_pair_expectation() {
        // One population of diploid size 10000 with two samples: the
        // expected singleton count is the total pairwise branch length
        // 2 E[T2] = 2 N.
        let demo = single_pop(2);
        let config = SiteConfig::from_derived(&demo, &[1]).unwrap();
        let sfs = compute_sfs(&demo, &config).unwrap();
        assert_relative_eq!(sfs, 20_000.0, max_relative = 1e-6);
    }

    #[test]
    fn test_two_pop_split_hand_computed() {
        // Two demes with one sample each, merging t generations ago. A
        // derived singleton in deme 0 requires the mutation on deme 0's
        // private branch: expected length t + 2 E[T2]/2 = t + N.
        let demo =
            Demography::from_cmd("-d 10000 -n 1 1 -J 1000 1 0", &Params::default()).unwrap();
        let config = SiteConfig::from_derived(&demo, &[1, 0]).unwrap();
        let sfs = compute_sfs(&demo, &config).unwrap();
        assert_relative_eq!(sfs, 1_000.0 + 10_000.0, max_relative = 1e-6);
    }

    #[test]
    fn test_doubleton_vs_singleton_ratio() {
        // Standard neutral SFS for a panmictic population: xi_d is
        // proportional to 1/d.
        let demo = single_pop(4);
        let mut engine = SumProduct::new(&demo);
        let xi: Vec<f64> = (1..4)
            .map(|d| {
                engine
                    .evaluate(&SiteConfig::from_derived(&demo, &[d]).unwrap())
                    .unwrap()
            })
            .collect();
        assert_relative_eq!(xi[0] / xi[1], 2.0, max_relative = 1e-6);
        assert_relative_eq!(xi[0] / xi[2], 3.0, max_relative = 1e-6);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let demo =
            Demography::from_cmd("-d 10000 -n 2 2 -J 1000 1 0", &Params::default()).unwrap();
        let configs: Vec<SiteConfig> = vec![
            SiteConfig::from_derived(&demo, &[1, 0]).unwrap(),
            SiteConfig::from_derived(&demo, &[0, 2]).unwrap(),
            SiteConfig::from_derived(&demo, &[2, 2]).unwrap(),
        ];
        let batch = compute_sfs_batch(&demo, &configs).unwrap();
        for (config, &expected) in configs.iter().zip(&batch) {
            assert_relative_eq!(compute_sfs(&demo, config).unwrap(), expected);
        }
    }

    #[test]
    fn test_sibling_swap_symmetry() {
        let left =
            Demography::from_cmd("-d 10000 -n 3 2 -J 1000 1 0", &Params::default()).unwrap();
        let right =
            Demography::from_cmd("-d 10000 -n 2 3 -J 1000 0 1", &Params::default()).unwrap();
        let lc = SiteConfig::from_derived(&left, &[2, 1]).unwrap();
        let rc = SiteConfig::from_derived(&right, &[1, 2]).unwrap();
        assert_relative_eq!(
            compute_sfs(&left, &lc).unwrap(),
            compute_sfs(&right, &rc).unwrap(),
            max_relative = 1e-10
        );
    }

    #[test]
    fn test_rejects_monomorphic_config() {
        let demo = single_pop(3);
        assert_eq!(
            SiteConfig::from_derived(&demo, &[0]).unwrap_err(),
            Error::ConfigNoDerived
        );
    }
}
