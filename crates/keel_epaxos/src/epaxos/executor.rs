//! Deterministic execution ordering for committed instances.
//!
//! The executor accepts `(instance, seq, deps)` triples as instances commit
//! and emits instances in an order that is identical on every replica fed
//! the same decisions: dependencies run before dependents, interference
//! cycles collapse into one component, and members of a component run in
//! `(seq, instance)` order.

use std::collections::{BTreeMap, BTreeSet};

use super::graph::DepGraph;
use super::types::{fatal, Instance};

pub struct Executor {
    graph: DepGraph,
    /// Committed but not yet emitted.
    committed: BTreeSet<Instance>,
    /// Already emitted; dependencies on these are dropped at insertion.
    executed: BTreeSet<Instance>,
    seqs: BTreeMap<Instance, i32>,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            graph: DepGraph::new(),
            committed: BTreeSet::new(),
            executed: BTreeSet::new(),
            seqs: BTreeMap::new(),
        }
    }

    /// Register a decision and return every instance that became safe to
    /// apply, in execution order. Replayed commits return nothing.
    pub fn commit(&mut self, key: Instance, seq: i32, deps: &BTreeSet<Instance>) -> Vec<Instance> {
        if self.committed.contains(&key) || self.executed.contains(&key) {
            return Vec::new();
        }
        self.committed.insert(key);
        self.seqs.insert(key, seq);
        self.graph.add_vertex(key);
        for dep in deps {
            if self.executed.contains(dep) {
                continue;
            }
            self.graph.add_vertex(*dep);
            self.graph.add_edge(key, *dep);
        }
        self.drain()
    }

    pub fn is_executed(&self, key: Instance) -> bool {
        self.executed.contains(&key)
    }

    pub fn graph_len(&self) -> usize {
        self.graph.len()
    }

    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    pub fn executed_len(&self) -> usize {
        self.executed.len()
    }

    fn drain(&mut self) -> Vec<Instance> {
        let eligible = self.graph.eligible(&self.committed);
        if eligible.is_empty() {
            return Vec::new();
        }

        let mut components = self.graph.sccs(&eligible);
        for component in components.iter_mut() {
            component.sort_by_key(|m| (self.seq_of(*m), *m));
        }
        let order = self
            .graph
            .condensation_order(&components, |ci| {
                let first = components[ci][0];
                (self.seq_of(first), first)
            });

        let mut emitted = Vec::with_capacity(eligible.len());
        for ci in order {
            emitted.extend(components[ci].iter().copied());
        }
        for key in &emitted {
            self.graph.remove_vertex(*key);
            self.committed.remove(key);
            self.seqs.remove(key);
            self.executed.insert(*key);
        }
        emitted
    }

    fn seq_of(&self, key: Instance) -> i32 {
        match self.seqs.get(&key) {
            Some(seq) => *seq,
            None => fatal!("eligible instance {:?} has no sequence number", key),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new()
    }
}
