//! Purpose-built dependency graph for the executor.
//!
//! The executor needs exactly four operations: add vertices/edges as commits
//! arrive, find the vertices whose full reachable closure is committed,
//! split that closure into strongly connected components, and order the
//! component condensation dependencies-first. Everything iterates over
//! `BTree` containers so the result is a pure function of the graph,
//! identical on every replica.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{fatal, Instance};

/// Directed graph with an edge `u → v` when `u` depends on `v`.
pub(crate) struct DepGraph {
    out: BTreeMap<Instance, BTreeSet<Instance>>,
    rev: BTreeMap<Instance, BTreeSet<Instance>>,
}

impl DepGraph {
    pub(crate) fn new() -> Self {
        DepGraph {
            out: BTreeMap::new(),
            rev: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.out.len()
    }

    pub(crate) fn add_vertex(&mut self, v: Instance) {
        self.out.entry(v).or_default();
        self.rev.entry(v).or_default();
    }

    pub(crate) fn add_edge(&mut self, from: Instance, to: Instance) {
        self.out.entry(from).or_default().insert(to);
        self.rev.entry(to).or_default().insert(from);
    }

    pub(crate) fn remove_vertex(&mut self, v: Instance) {
        if let Some(succs) = self.out.remove(&v) {
            for s in succs {
                if let Some(preds) = self.rev.get_mut(&s) {
                    preds.remove(&v);
                }
            }
        }
        if let Some(preds) = self.rev.remove(&v) {
            for p in preds {
                if let Some(succs) = self.out.get_mut(&p) {
                    succs.remove(&v);
                }
            }
        }
    }

    /// Vertices whose entire reachable closure is committed.
    ///
    /// Taint spreads backwards from every non-committed vertex; whatever can
    /// reach a tainted vertex is not yet safe to execute. The result is
    /// closed under reachability, so the SCC pass can stay inside it.
    pub(crate) fn eligible(&self, committed: &BTreeSet<Instance>) -> BTreeSet<Instance> {
        let mut tainted: BTreeSet<Instance> = self
            .out
            .keys()
            .copied()
            .filter(|v| !committed.contains(v))
            .collect();
        let mut pending: Vec<Instance> = tainted.iter().copied().collect();
        while let Some(v) = pending.pop() {
            let Some(preds) = self.rev.get(&v) else {
                continue;
            };
            for &p in preds {
                if tainted.insert(p) {
                    pending.push(p);
                }
            }
        }
        self.out
            .keys()
            .copied()
            .filter(|v| committed.contains(v) && !tainted.contains(v))
            .collect()
    }

    /// Tarjan's algorithm restricted to `within`, iterative to keep deep
    /// dependency chains off the call stack.
    pub(crate) fn sccs(&self, within: &BTreeSet<Instance>) -> Vec<Vec<Instance>> {
        struct Frame {
            v: Instance,
            succs: Vec<Instance>,
            cursor: usize,
        }

        let mut index = BTreeMap::<Instance, usize>::new();
        let mut low = BTreeMap::<Instance, usize>::new();
        let mut on_stack = BTreeSet::<Instance>::new();
        let mut stack = Vec::<Instance>::new();
        let mut frames = Vec::<Frame>::new();
        let mut next_index = 0usize;
        let mut components = Vec::<Vec<Instance>>::new();

        let successors = |v: Instance| -> Vec<Instance> {
            self.out
                .get(&v)
                .map(|s| s.iter().copied().filter(|w| within.contains(w)).collect())
                .unwrap_or_default()
        };

        for &root in within {
            if index.contains_key(&root) {
                continue;
            }
            index.insert(root, next_index);
            low.insert(root, next_index);
            next_index += 1;
            stack.push(root);
            on_stack.insert(root);
            frames.push(Frame {
                v: root,
                succs: successors(root),
                cursor: 0,
            });

            loop {
                let (v, next) = {
                    let Some(frame) = frames.last_mut() else {
                        break;
                    };
                    if frame.cursor < frame.succs.len() {
                        let w = frame.succs[frame.cursor];
                        frame.cursor += 1;
                        (frame.v, Some(w))
                    } else {
                        (frame.v, None)
                    }
                };

                match next {
                    Some(w) => {
                        if !index.contains_key(&w) {
                            index.insert(w, next_index);
                            low.insert(w, next_index);
                            next_index += 1;
                            stack.push(w);
                            on_stack.insert(w);
                            frames.push(Frame {
                                v: w,
                                succs: successors(w),
                                cursor: 0,
                            });
                        } else if on_stack.contains(&w) {
                            let reach = index[&w];
                            if reach < low[&v] {
                                low.insert(v, reach);
                            }
                        }
                    }
                    None => {
                        frames.pop();
                        if let Some(parent) = frames.last() {
                            let child_low = low[&v];
                            if child_low < low[&parent.v] {
                                low.insert(parent.v, child_low);
                            }
                        }
                        if low[&v] == index[&v] {
                            let mut component = Vec::new();
                            loop {
                                let w = stack.pop().expect("tarjan stack underflow");
                                on_stack.remove(&w);
                                component.push(w);
                                if w == v {
                                    break;
                                }
                            }
                            components.push(component);
                        }
                    }
                }
            }
        }

        components
    }

    /// Kahn order over the reversed condensation of `components`:
    /// dependencies first, ties broken by `component_key` so the order is
    /// canonical. A cycle surviving condensation is impossible and aborts.
    pub(crate) fn condensation_order(
        &self,
        components: &[Vec<Instance>],
        component_key: impl Fn(usize) -> (i32, Instance),
    ) -> Vec<usize> {
        let mut component_of = BTreeMap::<Instance, usize>::new();
        for (ci, members) in components.iter().enumerate() {
            for m in members {
                component_of.insert(*m, ci);
            }
        }

        // Reversed edges: the component a member depends on must run first.
        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        let mut blockers = vec![0usize; components.len()];
        for (ci, members) in components.iter().enumerate() {
            for m in members {
                let Some(succs) = self.out.get(m) else {
                    continue;
                };
                for s in succs {
                    let Some(&cj) = component_of.get(s) else {
                        fatal!("dependency {:?} escaped the eligible closure", s);
                    };
                    if cj != ci && dependents[cj].insert(ci) {
                        blockers[ci] += 1;
                    }
                }
            }
        }

        let mut ready = BTreeSet::<((i32, Instance), usize)>::new();
        for ci in 0..components.len() {
            if blockers[ci] == 0 {
                ready.insert((component_key(ci), ci));
            }
        }

        let mut order = Vec::with_capacity(components.len());
        while let Some(&(key, ci)) = ready.iter().next() {
            ready.remove(&(key, ci));
            order.push(ci);
            for &cj in &dependents[ci] {
                blockers[cj] -= 1;
                if blockers[cj] == 0 {
                    ready.insert((component_key(cj), cj));
                }
            }
        }

        if order.len() != components.len() {
            fatal!(
                "condensation is cyclic: ordered {} of {} components",
                order.len(),
                components.len()
            );
        }
        order
    }
}
