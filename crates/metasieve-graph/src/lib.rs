//! # metasieve-graph
//!
//! Dependency graph construction for capability units: cycle detection and a
//! deterministic topological execution order.
//!
//! The registry rebuilds the graph on every mutation (initial scan, hot
//! reload, unregister). [`build`] takes the declared dependency sets and
//! returns:
//!
//! - `topo_order`: a total order consistent with every dependency edge among
//!   orderable units. Ties between units with no dependency relationship are
//!   broken by ascending unit name, so dispatch order is reproducible.
//! - `cycle_members`: every unit on a dependency cycle (strongly connected
//!   component of size > 1, or a self-loop). Cyclic units are excluded from
//!   `topo_order` and reported, never silently dropped.
//!
//! Dependencies naming units absent from the input are ignored for ordering;
//! the dispatcher signals them as failed upstreams at run time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Result of a graph build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphBuild {
    /// Execution order over orderable (non-cyclic) units
    pub topo_order: Vec<String>,
    /// Units excluded because they participate in a cycle
    pub cycle_members: BTreeSet<String>,
}

impl GraphBuild {
    /// Position of a unit in the execution order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.topo_order.iter().position(|n| n == name)
    }
}

/// Build the dependency graph over the given units.
///
/// `nodes` maps each unit name to its declared dependency names.
pub fn build(nodes: &BTreeMap<String, BTreeSet<String>>) -> GraphBuild {
    let names: Vec<&str> = nodes.keys().map(String::as_str).collect();
    let name_set: BTreeSet<&str> = names.iter().copied().collect();

    // Adjacency restricted to known units, neighbor order name-ascending for
    // deterministic traversal.
    let adj: HashMap<&str, Vec<&str>> = nodes
        .iter()
        .map(|(name, deps)| {
            let edges: Vec<&str> = deps
                .iter()
                .map(String::as_str)
                .filter(|d| name_set.contains(d))
                .collect();
            (name.as_str(), edges)
        })
        .collect();

    let cycle_members = find_cycle_members(&names, &adj, nodes);
    let topo_order = kahn_order(nodes, &name_set, &cycle_members);

    if !cycle_members.is_empty() {
        debug!(
            cyclic = cycle_members.len(),
            ordered = topo_order.len(),
            "dependency graph built with cycles"
        );
    }

    GraphBuild {
        topo_order,
        cycle_members,
    }
}

/// Tarjan's strongly connected components, iteratively.
///
/// A unit is a cycle member when its SCC has more than one node, or when it
/// declares itself as a dependency.
fn find_cycle_members(
    names: &[&str],
    adj: &HashMap<&str, Vec<&str>>,
    nodes: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut lowlink: HashMap<&str, usize> = HashMap::new();
    let mut on_stack: BTreeSet<&str> = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut counter = 0usize;
    let mut cyclic: BTreeSet<String> = BTreeSet::new();

    for &root in names {
        if index.contains_key(root) {
            continue;
        }

        // Explicit call stack: (node, next neighbor offset).
        let mut frames: Vec<(&str, usize)> = vec![(root, 0)];
        index.insert(root, counter);
        lowlink.insert(root, counter);
        counter += 1;
        stack.push(root);
        on_stack.insert(root);

        loop {
            // Advance the top frame; release the borrow before mutating the
            // frame stack.
            let (v, advanced) = {
                let Some(frame) = frames.last_mut() else { break };
                let v = frame.0;
                let neighbors = &adj[v];
                if frame.1 < neighbors.len() {
                    let w = neighbors[frame.1];
                    frame.1 += 1;
                    (v, Some(w))
                } else {
                    (v, None)
                }
            };

            if let Some(w) = advanced {
                if !index.contains_key(w) {
                    index.insert(w, counter);
                    lowlink.insert(w, counter);
                    counter += 1;
                    stack.push(w);
                    on_stack.insert(w);
                    frames.push((w, 0));
                } else if on_stack.contains(w) {
                    let low = lowlink[v].min(index[w]);
                    lowlink.insert(v, low);
                }
            } else {
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    let low = lowlink[parent].min(lowlink[v]);
                    lowlink.insert(parent, low);
                }
                if lowlink[v] == index[v] {
                    let mut component: Vec<&str> = Vec::new();
                    loop {
                        let w = stack.pop().expect("tarjan stack underflow");
                        on_stack.remove(w);
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    let self_loop =
                        component.len() == 1 && nodes[component[0]].contains(component[0]);
                    if component.len() > 1 || self_loop {
                        cyclic.extend(component.into_iter().map(str::to_string));
                    }
                }
            }
        }
    }

    cyclic
}

/// Kahn's algorithm over the orderable units, popping the smallest ready name
/// first so the resulting total order is stable across runs.
fn kahn_order(
    nodes: &BTreeMap<String, BTreeSet<String>>,
    name_set: &BTreeSet<&str>,
    cyclic: &BTreeSet<String>,
) -> Vec<String> {
    let orderable: BTreeSet<&str> = name_set
        .iter()
        .copied()
        .filter(|n| !cyclic.contains(*n))
        .collect();

    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for &name in &orderable {
        let mut count = 0;
        for dep in &nodes[name] {
            if orderable.contains(dep.as_str()) {
                count += 1;
                dependents.entry(dep.as_str()).or_default().push(name);
            }
        }
        indegree.insert(name, count);
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&n, _)| n)
        .collect();

    let mut order = Vec::with_capacity(orderable.len());
    while let Some(&name) = ready.iter().next() {
        ready.remove(name);
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            for &d in deps {
                let deg = indegree.get_mut(d).expect("dependent missing indegree");
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(d);
                }
            }
        }
    }

    // Every orderable unit is reachable by construction: cyclic units were
    // removed and their edges dropped.
    debug_assert_eq!(order.len(), orderable.len());
    order
}
