// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Incremental construction of the population DAG from a tokenized
//! command string. Leaves are created by `-n`; every event finalizes
//! the size histories of the populations it terminates, so epochs are
//! closed exactly when their population stops existing (backwards in
//! time). The single surviving root is closed with an infinite epoch.

use std::collections::HashMap;

use itertools::Itertools;
use ordered_float::NotNan;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::errors::{Error, Result};
use crate::grammar::{Flag, Params};
use crate::model::demography::{Demography, EventKind, EventRecord, Population};
use crate::model::history::SizeHistory;

/// One pending epoch boundary of a population: absent size or growth
/// rate is inherited from the running state, an explicit `growth: None`
/// stops exponential growth.
#[derive(Debug, Clone)]
struct SizeChange {
    t: f64,
    n: Option<f64>,
    growth: Option<f64>,
}

pub(crate) fn build(flags: &[Flag], params: &Params) -> Result<Demography> {
    validate_flags(flags)?;

    flags[0].expect_arity(1)?;
    let default_n = params.resolve(&flags[0].args[0])?;
    if !(default_n > 0.0) || !default_n.is_finite() {
        return Err(Error::EventOutOfOrder { pop: 0 });
    }
    let lineages = flags[1]
        .args
        .iter()
        .map(|tok| sample_size(params, tok))
        .collect::<Result<Vec<u32>>>()?;
    if lineages.is_empty() {
        return Err(Error::InvalidFlagArity {
            flag: "n".into(),
            expected: 1,
            got: 0,
        });
    }

    // the k-th -S flag, in string order, creates population D + k - 1
    let mut npops = lineages.len();
    let mut events = Vec::new();
    for flag in &flags[2..] {
        if !is_event(flag) {
            continue;
        }
        flag.expect_arity(3)?;
        let t = params.resolve(&flag.args[0])?;
        if t < 0.0 {
            return Err(Error::EventOutOfOrder { pop: 0 });
        }
        let new_label = if flag.name == "S" {
            npops += 1;
            Some(npops - 1)
        } else {
            None
        };
        events.push((flag, t, new_label));
    }
    events.sort_by_key(|&(_, t, _)| NotNan::new(t).unwrap());

    let mut builder = GraphBuilder::new(default_n);
    builder.leaves(&lineages);
    for flag in &flags[2..] {
        if flag.name == "a" {
            flag.expect_arity(2)?;
            let t = params.resolve(&flag.args[0])?;
            let label = pop_label(&flag.args[1])?;
            builder.archaic(t, label)?;
        }
    }
    for &(flag, t, new_label) in &events {
        match flag.name.as_str() {
            "G" => {
                let rate = params.resolve(&flag.args[2])?;
                builder.for_targets(&flag.args[1], |b, label| b.growth(t, label, rate))?;
                builder.push_cmd(format!("-G {} {} {}", t, flag.args[1], rate));
            }
            "N" => {
                let n = params.resolve(&flag.args[2])?;
                builder.for_targets(&flag.args[1], |b, label| b.resize(t, label, n))?;
                builder.push_cmd(format!("-N {} {} {}", t, flag.args[1], n));
            }
            "J" => {
                let i = pop_label(&flag.args[1])?;
                let j = pop_label(&flag.args[2])?;
                builder.join(t, i, j)?;
                builder.push_cmd(format!("-J {} {} {}", t, i, j));
            }
            "S" => {
                let i = pop_label(&flag.args[1])?;
                let p = params.resolve(&flag.args[2])?;
                builder.pulse(t, i, p, new_label.unwrap())?;
                builder.push_cmd(format!("-S {} {} {}", t, i, p));
            }
            _ => unreachable!(),
        }
    }
    builder.close()
}

fn validate_flags(flags: &[Flag]) -> Result<()> {
    if flags.len() < 2 || flags[0].name != "d" || flags[1].name != "n" {
        return Err(Error::MissingPreamble);
    }
    if flags[2..].iter().any(|f| f.name == "d" || f.name == "n") {
        return Err(Error::MissingPreamble);
    }
    for flag in flags {
        match flag.name.as_str() {
            "d" | "n" | "a" | "G" | "N" | "J" | "S" => {}
            "m" | "em" | "ma" | "eM" | "I" => {
                return Err(Error::MigrationNotImplemented {
                    flag: flag.name.clone(),
                })
            }
            _ => {
                return Err(Error::InvalidFlag {
                    flag: flag.name.clone(),
                })
            }
        }
    }
    if let Some(first_event) = flags.iter().position(is_event) {
        if flags[first_event..].iter().any(|f| f.name == "a") {
            return Err(Error::ArchaicAfterEvent);
        }
    }
    Ok(())
}

fn is_event(flag: &Flag) -> bool {
    matches!(flag.name.as_str(), "G" | "N" | "J" | "S")
}

fn pop_label(token: &str) -> Result<usize> {
    token.parse::<usize>().map_err(|_| Error::InvalidLiteral {
        literal: token.to_owned(),
    })
}

fn sample_size(params: &Params, token: &str) -> Result<u32> {
    let value = params.resolve(token)?;
    if value < 1.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(Error::InvalidLiteral {
            literal: token.to_owned(),
        });
    }
    Ok(value as u32)
}

struct GraphBuilder {
    default_n: f64,
    graph: DiGraph<Population, ()>,
    /// command-string label -> currently live root of that lineage
    roots: HashMap<usize, Option<NodeIndex>>,
    size_changes: HashMap<NodeIndex, Vec<SizeChange>>,
    records: Vec<EventRecord>,
    cmd: Vec<String>,
}

impl GraphBuilder {
    fn new(default_n: f64) -> Self {
        GraphBuilder {
            default_n,
            graph: DiGraph::new(),
            roots: HashMap::new(),
            size_changes: HashMap::new(),
            records: Vec::new(),
            cmd: vec![format!("-d {}", default_n)],
        }
    }

    fn push_cmd(&mut self, piece: String) {
        self.cmd.push(piece);
    }

    fn leaves(&mut self, lineages: &[u32]) {
        for (label, &n) in lineages.iter().enumerate() {
            let v = self.graph.add_node(Population {
                label: Some(label),
                lineages: Some(n),
                t_bottom: 0.0,
                history: SizeHistory::constant(0.0, self.default_n),
                split_probs: None,
            });
            self.size_changes.insert(
                v,
                vec![SizeChange {
                    t: 0.0,
                    n: Some(self.default_n),
                    growth: None,
                }],
            );
            self.roots.insert(label, Some(v));
        }
        self.push_cmd(format!("-n {}", lineages.iter().join(" ")));
    }

    fn live_root(&self, label: usize, t: f64) -> Result<NodeIndex> {
        self.roots
            .get(&label)
            .copied()
            .flatten()
            .ok_or_else(|| Error::UnknownPopulation {
                pop: label.to_string(),
                t,
            })
    }

    /// Apply an op to one population or, for the `*` wildcard, to every
    /// currently live one.
    fn for_targets<F>(&mut self, target: &str, mut op: F) -> Result<()>
    where
        F: FnMut(&mut Self, usize) -> Result<()>,
    {
        if target == "*" {
            let labels: Vec<usize> = self
                .roots
                .iter()
                .filter(|&(_, v)| v.is_some())
                .map(|(&label, _)| label)
                .sorted()
                .collect();
            for label in labels {
                op(self, label)?;
            }
            Ok(())
        } else {
            op(self, pop_label(target)?)
        }
    }

    fn archaic(&mut self, t: f64, label: usize) -> Result<()> {
        let v = self.live_root(label, t)?;
        if t < 0.0 {
            return Err(Error::EventOutOfOrder { pop: label });
        }
        let changes = self.size_changes.get_mut(&v).unwrap();
        debug_assert_eq!(changes.len(), 1);
        changes[0].t = t;
        self.push_cmd(format!("-a {} {}", t, label));
        Ok(())
    }

    fn growth(&mut self, t: f64, label: usize, rate: f64) -> Result<()> {
        let v = self.live_root(label, t)?;
        let growth = if rate == 0.0 { None } else { Some(rate) };
        self.size_changes
            .get_mut(&v)
            .unwrap()
            .push(SizeChange { t, n: None, growth });
        Ok(())
    }

    fn resize(&mut self, t: f64, label: usize, n: f64) -> Result<()> {
        let v = self.live_root(label, t)?;
        if !(n > 0.0) {
            return Err(Error::EventOutOfOrder { pop: label });
        }
        self.size_changes.get_mut(&v).unwrap().push(SizeChange {
            t,
            n: Some(n),
            growth: None,
        });
        Ok(())
    }

    /// `-J t i j`: population `i` merges into `j`; the merged population
    /// continues with `j`'s size and growth.
    fn join(&mut self, t: f64, i: usize, j: usize) -> Result<()> {
        if i == j {
            return Err(Error::UnknownPopulation {
                pop: i.to_string(),
                t,
            });
        }
        let ci = self.live_root(i, t)?;
        let cj = self.live_root(j, t)?;
        self.finalize(ci, t)?;
        let (n_top, growth) = self.finalize(cj, t)?;
        let parent = self.graph.add_node(Population {
            label: None,
            lineages: None,
            t_bottom: t,
            history: SizeHistory::constant(0.0, self.default_n),
            split_probs: None,
        });
        self.size_changes.insert(
            parent,
            vec![SizeChange {
                t,
                n: Some(n_top),
                growth,
            }],
        );
        self.graph.add_edge(parent, ci, ());
        self.graph.add_edge(parent, cj, ());
        self.records.push(EventRecord {
            t,
            kind: EventKind::Merge {
                parent,
                children: [ci, cj],
            },
        });
        self.roots.insert(j, Some(parent));
        self.roots.insert(i, None);
        Ok(())
    }

    /// `-S t i p`: each lineage of `i` stays with probability `p` and
    /// moves to the freshly created population `new_label` with
    /// probability `1 - p`.
    fn pulse(&mut self, t: f64, i: usize, p: f64, new_label: usize) -> Result<()> {
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::InvalidPulseProbability { p });
        }
        let child = self.live_root(i, t)?;
        let (n_top, growth) = self.finalize(child, t)?;
        let stay = self.graph.add_node(Population {
            label: None,
            lineages: None,
            t_bottom: t,
            history: SizeHistory::constant(0.0, self.default_n),
            split_probs: None,
        });
        self.size_changes.insert(
            stay,
            vec![SizeChange {
                t,
                n: Some(n_top),
                growth,
            }],
        );
        let new = self.graph.add_node(Population {
            label: Some(new_label),
            lineages: None,
            t_bottom: t,
            history: SizeHistory::constant(0.0, self.default_n),
            split_probs: None,
        });
        self.size_changes.insert(
            new,
            vec![SizeChange {
                t,
                n: Some(self.default_n),
                growth: None,
            }],
        );
        self.graph[child].split_probs = Some([(stay, p), (new, 1.0 - p)]);
        self.graph.add_edge(stay, child, ());
        self.graph.add_edge(new, child, ());
        self.records.push(EventRecord {
            t,
            kind: EventKind::Pulse {
                parents: [stay, new],
                child,
            },
        });
        self.roots.insert(i, Some(stay));
        debug_assert!(self.roots.get(&new_label).is_none());
        self.roots.insert(new_label, Some(new));
        Ok(())
    }

    /// Close the epoch sequence of `v` at `end_time` and turn it into a
    /// size history. Returns the top size and growth rate of the final
    /// epoch, which a newly created parent population inherits.
    fn finalize(&mut self, v: NodeIndex, end_time: f64) -> Result<(f64, Option<f64>)> {
        let changes = self
            .size_changes
            .remove(&v)
            .expect("bug: population finalized twice");
        let pop_id = self.graph[v].label.unwrap_or_else(|| v.index());
        let mut pieces = Vec::with_capacity(changes.len());
        let mut running_n = changes[0].n.unwrap();
        let mut last_growth = None;
        for (w, change) in changes.iter().enumerate() {
            let t_next = changes.get(w + 1).map_or(end_time, |c| c.t);
            let tau = t_next - change.t;
            let n = change.n.unwrap_or(running_n);
            if tau < 0.0 || !(n > 0.0) {
                return Err(Error::EventOutOfOrder { pop: pop_id });
            }
            let piece = match change.growth {
                Some(rate) => SizeHistory::exponential(tau, rate, n),
                None => SizeHistory::constant(tau, n),
            };
            running_n = piece.n_top();
            last_growth = change.growth;
            pieces.push(piece);
        }
        self.graph[v].t_bottom = changes[0].t;
        self.graph[v].history = SizeHistory::piecewise(pieces);
        Ok((running_n, last_growth))
    }

    fn close(mut self) -> Result<Demography> {
        let live: Vec<NodeIndex> = self
            .roots
            .values()
            .filter_map(|&v| v)
            .sorted()
            .dedup()
            .collect();
        if live.len() != 1 {
            return Err(Error::MultipleRoots { n: live.len() });
        }
        self.finalize(live[0], f64::INFINITY)?;
        let cmd = self.cmd.join(" ");
        Demography::assemble(self.graph, self.records, self.default_n, cmd)
    }
}
