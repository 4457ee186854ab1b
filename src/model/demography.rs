// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The demography: a rooted DAG of populations related by merge and
//! pulse (admixture) events, each population carrying a size history,
//! plus the derived event tree (junction tree) that orders the
//! sum-product traversal.
//!
//! Edges point parent -> child in backwards time: the successors of a
//! merge population are the two populations that coalesced into it.

use std::collections::HashMap;
use std::fmt;

use ndarray::{Array3, Array4};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;

use crate::errors::{Error, Result};
use crate::model::history::SizeHistory;
use crate::model::kernels::binom_exact;

/// One population of the DAG.
#[derive(Debug, Clone)]
pub struct Population {
    /// command-string label; populations created by merges carry none
    pub(crate) label: Option<usize>,
    /// number of sampled lineages, for leaf populations
    pub(crate) lineages: Option<u32>,
    /// time (generations ago) at which this population begins
    pub(crate) t_bottom: f64,
    pub(crate) history: SizeHistory,
    /// for a pulse child: the two parent populations with their mixture
    /// proportions, summing to one
    pub(crate) split_probs: Option<[(NodeIndex, f64); 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// a leaf population coming into existence at its sampling time
    Leaf(NodeIndex),
    /// two child populations merging into one parent, backwards in time
    Merge {
        parent: NodeIndex,
        children: [NodeIndex; 2],
    },
    /// one child population drawing its lineages from two parents
    Pulse {
        parents: [NodeIndex; 2],
        child: NodeIndex,
    },
}

/// A node of the event tree. `subpops` are the populations coexisting
/// immediately above (i.e. right after, backwards in time) the event.
#[derive(Debug, Clone, Getters)]
#[get = "pub"]
pub struct Event {
    kind: EventKind,
    t: f64,
    subpops: Vec<NodeIndex>,
    parent_pops: Vec<NodeIndex>,
    /// populations terminated by this event, with the event that created
    /// each of them
    child_pops: Vec<(NodeIndex, usize)>,
    /// child events in the event tree
    children: Vec<usize>,
}

/// Raw event list handed over by the command-string parser, in time
/// order.
#[derive(Debug, Clone)]
pub(crate) struct EventRecord {
    pub(crate) t: f64,
    pub(crate) kind: EventKind,
}

#[derive(Debug, Clone)]
pub struct Demography {
    graph: DiGraph<Population, ()>,
    root: NodeIndex,
    leaves: Vec<NodeIndex>,
    events: Vec<Event>,
    event_root: usize,
    subtended: Vec<Vec<NodeIndex>>,
    n_subtended: Vec<u32>,
    default_n: f64,
    cmd: String,
}

impl Demography {
    /// Parse a demography from the extended command-string format.
    pub fn from_cmd(cmd: &str, params: &crate::grammar::Params) -> Result<Self> {
        crate::grammar::parse(cmd, params)
    }

    /// Parse an ms-style command line (`-I ...`), with times and sizes
    /// in units of `2 * n_ref`.
    pub fn from_ms(n_ref: f64, ms_cmd: &str, params: &crate::grammar::Params) -> Result<Self> {
        crate::grammar::parse_ms(n_ref, ms_cmd, params)
    }

    pub(crate) fn assemble(
        graph: DiGraph<Population, ()>,
        records: Vec<EventRecord>,
        default_n: f64,
        cmd: String,
    ) -> Result<Self> {
        let roots: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&v| graph.neighbors_directed(v, Direction::Incoming).count() == 0)
            .collect();
        if roots.len() != 1 {
            return Err(Error::MultipleRoots { n: roots.len() });
        }
        let root = roots[0];
        graph[root].history.validate_closed()?;

        let mut leaves: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&v| graph.neighbors_directed(v, Direction::Outgoing).count() == 0)
            .collect();
        leaves.sort_by_key(|&v| graph[v].label);

        // leaves subtended by each population, via forward reachability
        let mut subtended = vec![Vec::new(); graph.node_count()];
        let mut n_subtended = vec![0; graph.node_count()];
        for v in graph.node_indices() {
            let mut dfs = Dfs::new(&graph, v);
            let mut below = Vec::new();
            while let Some(u) = dfs.next(&graph) {
                if graph[u].lineages.is_some() {
                    below.push(u);
                }
            }
            below.sort_by_key(|&u| graph[u].label);
            n_subtended[v.index()] = below.iter().map(|&u| graph[u].lineages.unwrap()).sum();
            subtended[v.index()] = below;
        }

        let (events, event_root) = Self::build_event_tree(&graph, &leaves, &records)?;

        info!(
            "assembled demography: {} populations, {} leaves, {} events",
            graph.node_count(),
            leaves.len(),
            records.len()
        );

        Ok(Demography {
            graph,
            root,
            leaves,
            events,
            event_root,
            subtended,
            n_subtended,
            default_n,
            cmd,
        })
    }

    // Junction-tree construction: every leaf starts as its own event;
    // each merge or pulse event swallows the events of its child
    // populations and exposes subpops = (union of child subpops)
    // - child_pops + parent_pops.
    fn build_event_tree(
        graph: &DiGraph<Population, ()>,
        leaves: &[NodeIndex],
        records: &[EventRecord],
    ) -> Result<(Vec<Event>, usize)> {
        let mut events = Vec::with_capacity(leaves.len() + records.len());
        let mut current: HashMap<NodeIndex, usize> = HashMap::new();
        for &leaf in leaves {
            current.insert(leaf, events.len());
            events.push(Event {
                kind: EventKind::Leaf(leaf),
                t: graph[leaf].t_bottom,
                subpops: vec![leaf],
                parent_pops: vec![leaf],
                child_pops: vec![],
                children: vec![],
            });
        }

        let mut prev_t = 0.0;
        for record in records {
            debug_assert!(record.t >= prev_t);
            prev_t = record.t;

            let (parent_pops, terminated): (Vec<NodeIndex>, Vec<NodeIndex>) = match record.kind {
                EventKind::Merge { parent, children } => (vec![parent], children.to_vec()),
                EventKind::Pulse { parents, child } => (parents.to_vec(), vec![child]),
                EventKind::Leaf(_) => unreachable!("leaf records are not emitted by the parser"),
            };

            let mut child_events: Vec<usize> = terminated
                .iter()
                .map(|pop| current.get(pop).copied())
                .collect::<Option<_>>()
                .expect("bug: event terminates a population with no current event");
            child_events.sort_unstable();
            child_events.dedup();

            let mut subpops: Vec<NodeIndex> = child_events
                .iter()
                .flat_map(|&e| events[e].subpops.iter().copied())
                .collect();
            subpops.retain(|pop| !terminated.contains(pop));
            subpops.extend(parent_pops.iter().copied());
            subpops.sort_unstable();
            subpops.dedup();

            let child_pops = terminated.iter().map(|&pop| (pop, current[&pop])).collect();

            let idx = events.len();
            for &pop in &subpops {
                current.insert(pop, idx);
            }
            for pop in &terminated {
                current.remove(pop);
            }
            events.push(Event {
                kind: record.kind.clone(),
                t: record.t,
                subpops,
                parent_pops,
                child_pops,
                children: child_events,
            });
        }

        let mut live: Vec<usize> = current.values().copied().collect();
        live.sort_unstable();
        live.dedup();
        if live.len() != 1 {
            return Err(Error::MultipleRoots { n: live.len() });
        }
        let event_root = live[0];
        debug_assert_eq!(events[event_root].parent_pops.len(), 1);
        Ok((events, event_root))
    }

    /// The root (most ancient) population.
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Leaf populations in label order.
    pub fn leaves(&self) -> &[NodeIndex] {
        &self.leaves
    }

    /// The event tree, leaves first, in time order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Root of the event tree; its single parent population is the
    /// demography root.
    pub fn event_root(&self) -> usize {
        self.event_root
    }

    pub fn is_leaf(&self, v: NodeIndex) -> bool {
        self.graph[v].lineages.is_some()
    }

    /// Number of lineages sampled in a leaf population.
    pub fn lineages(&self, v: NodeIndex) -> u32 {
        self.graph[v].lineages.unwrap_or(0)
    }

    /// The populations that merged into `v`, forward in time.
    pub fn children(&self, v: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(v, Direction::Outgoing).collect()
    }

    /// The one or two (for a pulse child) populations above `v`.
    pub fn parents(&self, v: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(v, Direction::Incoming).collect()
    }

    pub fn size_history(&self, v: NodeIndex) -> &SizeHistory {
        &self.graph[v].history
    }

    pub fn split_probs(&self, v: NodeIndex) -> Option<&[(NodeIndex, f64); 2]> {
        self.graph[v].split_probs.as_ref()
    }

    /// Leaves reachable from `v` forward in time, in label order.
    pub fn leaves_subtended_by(&self, v: NodeIndex) -> &[NodeIndex] {
        &self.subtended[v.index()]
    }

    pub fn n_lineages_subtended_by(&self, v: NodeIndex) -> u32 {
        self.n_subtended[v.index()]
    }

    /// Total number of population nodes in the DAG.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn default_n(&self) -> f64 {
        self.default_n
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Conditional pulse tensor of shape `[n+1, n+1, n+1]`: given `d`
    /// derived among the `n` lineages subtended by the pulse child, the
    /// probability that `d1` of them trace into the first parent and
    /// `d2 = d - d1` into the second, marginalized over the binomial
    /// allocation of lineages.
    pub fn admixture_prob(&self, child: NodeIndex) -> Result<Array3<f64>> {
        let &[(_, q1), _] = self.graph[child].split_probs.as_ref().ok_or_else(|| {
            Error::UnknownPopulation {
                pop: format!("{:?}", child),
                t: self.graph[child].t_bottom,
            }
        })?;
        let n = self.n_lineages_subtended_by(child) as usize;
        let der = der_in_admixture_node(n);
        let mut ret = Array3::zeros((n + 1, n + 1, n + 1));
        for n_from_1 in 0..=n {
            let pmf = binom_f64(n, n_from_1)
                * q1.powi(n_from_1 as i32)
                * (1.0 - q1).powi((n - n_from_1) as i32);
            if pmf == 0.0 {
                continue;
            }
            for d_child in 0..=n {
                for d1 in 0..=d_child {
                    ret[[d_child, d1, d_child - d1]] +=
                        pmf * der[[n_from_1, d_child, d1, d_child - d1]];
                }
            }
        }
        Ok(ret)
    }
}

impl fmt::Display for Demography {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Demography('{}')", self.cmd)
    }
}

pub(crate) fn binom_f64(n: usize, k: usize) -> f64 {
    binom_exact(n as i64, k as i64).to_f64()
}

/// Probability that drawing `draw` of the `pool_der + pool_anc` pool
/// lineages picks up exactly `draw_der` derived ones.
pub(crate) fn hypergeom_split(pool_der: u32, pool_anc: u32, draw: u32, draw_der: u32) -> f64 {
    if draw_der > draw || draw_der > pool_der || draw - draw_der > pool_anc {
        return 0.0;
    }
    let pool = pool_der + pool_anc;
    binom_f64(pool_der as usize, draw_der as usize)
        * binom_f64(pool_anc as usize, (draw - draw_der) as usize)
        / binom_f64(pool as usize, draw as usize)
}

/// 4-tensor `[n_from_parent1, der_in_child, der_in_parent1,
/// der_in_parent2]` underlying `Demography::admixture_prob`: the
/// hypergeometric split of derived lineages given how many lineages
/// moved to the first parent.
pub(crate) fn der_in_admixture_node(n: usize) -> Array4<f64> {
    let mut ret = Array4::zeros((n + 1, n + 1, n + 1, n + 1));
    for n_from_1 in 0..=n {
        for d_child in 0..=n {
            for d1 in 0..=d_child.min(n_from_1) {
                let d2 = d_child - d1;
                if d2 > n - n_from_1 {
                    continue;
                }
                ret[[n_from_1, d_child, d1, d2]] = hypergeom_split(
                    d_child as u32,
                    (n - d_child) as u32,
                    n_from_1 as u32,
                    d1 as u32,
                );
            }
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Params;

    #[test]
    fn test_event_tree_two_pop_split() {
        let demo =
            Demography::from_cmd("-d 10000 -n 2 2 -J 1000 1 0", &Params::default()).unwrap();
        assert_eq!(demo.leaves().len(), 2);
        assert_eq!(demo.events().len(), 3);
        let root_event = &demo.events()[demo.event_root()];
        assert_eq!(root_event.parent_pops(), &vec![demo.root()]);
        assert_eq!(root_event.children().len(), 2);
        assert_relative_eq!(*root_event.t(), 1000.0);
        assert_eq!(demo.n_lineages_subtended_by(demo.root()), 4);
        for &leaf in demo.leaves() {
            assert_eq!(demo.n_lineages_subtended_by(leaf), 2);
            assert!(demo.is_leaf(leaf));
        }
        assert_eq!(demo.children(demo.root()).len(), 2);
    }

    #[test]
    fn test_event_tree_pulse_keeps_parents_coexisting() {
        let demo = Demography::from_cmd(
            "-d 10000 -n 2 -S 500 0 0.3 -J 2000 1 0",
            &Params::default(),
        )
        .unwrap();
        // leaf, pulse, merge
        assert_eq!(demo.events().len(), 3);
        let pulse = &demo.events()[1];
        assert_eq!(pulse.parent_pops().len(), 2);
        assert_eq!(pulse.subpops().len(), 2);
        let child = pulse.child_pops()[0].0;
        let probs = demo.split_probs(child).unwrap();
        assert_relative_eq!(probs[0].1 + probs[1].1, 1.0);
        assert_relative_eq!(probs[0].1, 0.3);
    }

    #[test]
    fn test_single_root_enforced() {
        let err = Demography::from_cmd("-d 10000 -n 2 2", &Params::default()).unwrap_err();
        assert_eq!(err, Error::MultipleRoots { n: 2 });
    }

    #[test]
    fn test_admixture_prob_rows_are_distributions() {
        let demo = Demography::from_cmd(
            "-d 10000 -n 3 -S 500 0 0.3 -J 2000 1 0",
            &Params::default(),
        )
        .unwrap();
        let pulse_child = demo.events()[1].child_pops()[0].0;
        let tensor = demo.admixture_prob(pulse_child).unwrap();
        let n = demo.n_lineages_subtended_by(pulse_child) as usize;
        assert_eq!(tensor.shape(), &[n + 1, n + 1, n + 1]);
        for d_child in 0..=n {
            let total: f64 = tensor
                .slice(ndarray::s![d_child, .., ..])
                .iter()
                .sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_hypergeom_split() {
        // Drawing 2 of 4 lineages of which 2 are derived: both derived
        // with probability C(2,2)/C(4,2).
        assert_relative_eq!(hypergeom_split(2, 2, 2, 2), 1.0 / 6.0);
        let total: f64 = (0..=2).map(|d| hypergeom_split(2, 2, 2, d)).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-14);
        assert_relative_eq!(hypergeom_split(1, 1, 1, 2), 0.0);
    }
}
