use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::workflow::{NodeType, Workflow};

/// Outcome of [`validate`]. Errors block execution; warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errors.is_empty() {
            return f.write_str("no errors");
        }
        f.write_str(&self.errors.join("; "))
    }
}

/// Check a workflow's structural invariants.
///
/// Unreachable nodes are reported as warnings; everything else is an error.
pub fn validate(workflow: &Workflow) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            report.error(format!("duplicate node id: {}", node.id));
        }
    }

    check_anchor(workflow, NodeType::Start, &mut report);
    check_anchor(workflow, NodeType::End, &mut report);
    check_order(workflow, &mut report);

    for edge in &workflow.edges {
        for id in [&edge.source, &edge.target] {
            if !seen.contains(id.as_str()) {
                report.error(format!(
                    "edge {} -> {} references unknown node: {}",
                    edge.source, edge.target, id
                ));
            }
        }
    }

    for node in &workflow.nodes {
        for problem in node.config.problems() {
            report.error(format!("node {} ({}): {}", node.id, node.node_type(), problem));
        }
    }

    let adjacency = adjacency(workflow, &seen);
    if let Some(cycle_at) = find_cycle(workflow, &adjacency) {
        report.error(format!("cycle detected at node: {}", cycle_at));
    }

    let starts: Vec<&str> = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type() == NodeType::Start)
        .map(|n| n.id.as_str())
        .collect();
    if let [start] = starts.as_slice() {
        let reachable = reachable_from(start, &adjacency);
        for node in &workflow.nodes {
            if !node.node_type().is_anchor() && !reachable.contains(node.id.as_str()) {
                report.warn(format!("node {} is not reachable from start", node.id));
            }
        }
    }

    report
}

fn check_anchor(workflow: &Workflow, kind: NodeType, report: &mut ValidationReport) {
    let count = workflow.nodes.iter().filter(|n| n.node_type() == kind).count();
    match count {
        0 => report.error(format!("missing {} node", kind)),
        1 => {}
        n => report.error(format!("duplicate {} node: found {}", kind, n)),
    }
}

fn check_order(workflow: &Workflow, report: &mut ValidationReport) {
    let mut orders = BTreeSet::new();
    for node in &workflow.nodes {
        if !orders.insert(node.order) {
            report.error(format!("duplicate order value {} (node {})", node.order, node.id));
        }
    }
    if let (Some(&min), Some(&max)) = (orders.first(), orders.last()) {
        // Widened so extreme i64 orders cannot overflow.
        let span = i128::from(max) - i128::from(min) + 1;
        if span != orders.len() as i128 {
            report.error(format!(
                "order values are not contiguous: {} distinct values span {}..={}",
                orders.len(),
                min,
                max
            ));
        }
    }
}

fn adjacency<'a>(workflow: &'a Workflow, known: &HashSet<&str>) -> HashMap<&'a str, Vec<&'a str>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &workflow.edges {
        if known.contains(edge.source.as_str()) && known.contains(edge.target.as_str()) {
            adj.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
        }
    }
    adj
}

/// Depth-first search with an explicit recursion stack. Returns a node that was
/// revisited while still on the stack.
fn find_cycle<'a>(workflow: &'a Workflow, adj: &HashMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        OnStack,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for root in workflow.nodes.iter().map(|n| n.id.as_str()) {
        if marks.contains_key(root) {
            continue;
        }
        // (node, index of next child to visit)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::OnStack);
        while let Some((node, idx)) = stack.last().copied() {
            let children = adj.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if idx < children.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let child = children[idx];
                match marks.get(child) {
                    Some(Mark::OnStack) => return Some(child),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::OnStack);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }
    None
}

fn reachable_from<'a>(start: &'a str, adj: &HashMap<&'a str, Vec<&'a str>>) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = vec![start];
    while let Some(node) = queue.pop() {
        for &next in adj.get(node).into_iter().flatten() {
            if seen.insert(next) {
                queue.push(next);
            }
        }
    }
    seen
}
