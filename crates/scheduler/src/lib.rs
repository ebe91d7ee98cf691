#![forbid(unsafe_code)]

//! # Hive Scheduler
//!
//! Least-loaded placement with constraints: a pure function over
//! `{nodes, runs, constraints, now}`. Returning no node is a normal outcome
//! (nothing placeable right now), not an error; the dispatch tick simply
//! retries on its next pass.

use chrono::{DateTime, Utc};
use hive_types::deployment::PlacementConstraints;
use hive_types::node::Node;
use hive_types::run::{Run, RunStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Load diagnostics for one node, as exposed by [`node_load`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLoad {
    /// Declared slot capacity.
    pub total_slots: u32,
    /// Runs counted against the node (reported or observed, whichever is
    /// larger).
    pub active_runs: u32,
    /// Remaining free slots.
    pub available_slots: u32,
    /// `active_runs / total_slots`; 1.0 when the node declares no slots.
    pub load_pct: f64,
    /// Whether at least one slot is free.
    pub has_capacity: bool,
}

fn observed_active_runs(node_id: &str, runs: &[Run]) -> u32 {
    runs.iter()
        .filter(|r| {
            matches!(r.status, RunStatus::Assigned | RunStatus::Running)
                && r.node_id.as_deref() == Some(node_id)
        })
        .count() as u32
}

fn load_of(node: &Node, runs: &[Run]) -> NodeLoad {
    let total_slots = node.capacity.slots;
    // The node's own heartbeat count can lag behind what the control plane
    // just assigned; the larger of the two is the safe estimate.
    let active_runs = node.status.active_runs.max(observed_active_runs(&node.id, runs));
    let available_slots = total_slots.saturating_sub(active_runs);
    let load_pct = if total_slots == 0 {
        1.0
    } else {
        f64::from(active_runs) / f64::from(total_slots)
    };
    NodeLoad {
        total_slots,
        active_runs,
        available_slots,
        load_pct,
        has_capacity: available_slots > 0,
    }
}

fn satisfies_constraints(node: &Node, constraints: &PlacementConstraints) -> bool {
    constraints.iter().all(|(key, constraint)| {
        node.metadata
            .get(key)
            .map(|value| constraint.matches(value))
            .unwrap_or(false)
    })
}

/// Selects the placement target for a pending run.
///
/// Filters to active, heartbeat-fresh nodes that satisfy every constraint
/// and have spare capacity, then orders by ascending load percentage, ties
/// broken by descending available slots, then lexicographic node id.
pub fn select_node(
    nodes: &[Node],
    runs: &[Run],
    constraints: &PlacementConstraints,
    now: DateTime<Utc>,
) -> Option<String> {
    let mut candidates: Vec<(&Node, NodeLoad)> = nodes
        .iter()
        .filter(|n| n.is_placeable(now))
        .filter(|n| satisfies_constraints(n, constraints))
        .map(|n| (n, load_of(n, runs)))
        .filter(|(_, load)| load.has_capacity)
        .collect();

    candidates.sort_by(|(a, la), (b, lb)| {
        la.load_pct
            .total_cmp(&lb.load_pct)
            .then(lb.available_slots.cmp(&la.available_slots))
            .then(a.id.cmp(&b.id))
    });

    candidates.first().map(|(n, _)| n.id.clone())
}

/// Computes the load table for every known node, placeable or not. Used for
/// diagnostics and the metrics gauges.
pub fn node_load(nodes: &[Node], runs: &[Run]) -> BTreeMap<String, NodeLoad> {
    nodes
        .iter()
        .map(|n| (n.id.clone(), load_of(n, runs)))
        .collect()
}
