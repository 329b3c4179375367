use std::collections::{BTreeSet, HashMap};

use sluice_core::error::{Result, SluiceError};
use sluice_core::validation::ValidationReport;
use sluice_core::workflow::Workflow;

/// Sort key for ready nodes: `order`, then id.
type Rank = (i64, String);

fn rank_of(workflow: &Workflow, id: &str) -> Rank {
    let order = workflow.node(id).map(|n| n.order).unwrap_or(i64::MAX);
    (order, id.to_string())
}

fn cycle_error(remaining: Vec<String>) -> SluiceError {
    SluiceError::Validation(ValidationReport {
        errors: vec![format!("cycle detected among nodes: {}", remaining.join(", "))],
        warnings: vec![],
    })
}

/// Dependency-counted ready queue over a workflow graph.
///
/// Nodes become ready once every predecessor has been marked complete. Ready
/// nodes are handed out by ascending `order`, then id.
#[derive(Debug, Clone)]
pub struct ReadyQueue {
    pending: HashMap<String, usize>,
    successors: HashMap<String, Vec<String>>,
    ranks: HashMap<String, Rank>,
    ready: BTreeSet<Rank>,
}

impl ReadyQueue {
    pub fn new(workflow: &Workflow) -> Self {
        let mut pending: HashMap<String, usize> = workflow.nodes.iter().map(|n| (n.id.clone(), 0)).collect();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &workflow.edges {
            if !pending.contains_key(&edge.source) {
                continue;
            }
            if let Some(count) = pending.get_mut(&edge.target) {
                *count += 1;
                successors.entry(edge.source.clone()).or_default().push(edge.target.clone());
            }
        }
        let ranks: HashMap<String, Rank> = pending.keys().map(|id| (id.clone(), rank_of(workflow, id))).collect();
        let ready = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .filter_map(|(id, _)| ranks.get(id).cloned())
            .collect();
        Self {
            pending,
            successors,
            ranks,
            ready,
        }
    }

    /// Take the next ready node, if any.
    pub fn pop(&mut self) -> Option<String> {
        let first = self.ready.iter().next().cloned()?;
        self.ready.remove(&first);
        self.pending.remove(&first.1);
        Some(first.1)
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Mark `id` complete, releasing successors whose predecessors are all done.
    pub fn complete(&mut self, id: &str) {
        let Some(next) = self.successors.get(id) else {
            return;
        };
        for target in next {
            if let Some(count) = self.pending.get_mut(target) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    if let Some(rank) = self.ranks.get(target) {
                        self.ready.insert(rank.clone());
                    }
                }
            }
        }
    }

    /// Nodes never handed out.
    pub fn remaining(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Kahn topological order with ties broken by `order`, then id.
///
/// Fails with a `Validation` error when the graph has a cycle.
pub fn topological_order(workflow: &Workflow) -> Result<Vec<String>> {
    let mut queue = ReadyQueue::new(workflow);
    let mut order = Vec::with_capacity(workflow.nodes.len());
    while let Some(id) = queue.pop() {
        queue.complete(&id);
        order.push(id);
    }
    if order.len() != workflow.nodes.len() {
        return Err(cycle_error(queue.remaining()));
    }
    Ok(order)
}
