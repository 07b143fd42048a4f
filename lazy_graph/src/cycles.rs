use tracing::debug;

use crate::graph::{Graph, Link, NodeId};

/// Chooses which link of a cycle gets cut.
pub trait CycleBreakPolicy {
    /// `cycle` lists the links in traversal order; the last one closes the cycle.
    /// Must return one of them.
    fn choose_link(&self, graph: &Graph, cycle: &[Link]) -> Link;
}

/// Cuts the link that closed the cycle during depth-first traversal.
#[derive(Clone, Copy, Debug, Default)]
pub struct CutClosingLink;

/// Cuts the cycle's link entering the given node, the closing link if the node is not on the cycle.
#[derive(Clone, Copy, Debug)]
pub struct CutLinkIntoNode(pub NodeId);

impl CycleBreakPolicy for CutClosingLink {
    fn choose_link(&self, _graph: &Graph, cycle: &[Link]) -> Link {
        *cycle.last().expect("Cycle without links")
    }
}

impl CycleBreakPolicy for CutLinkIntoNode {
    fn choose_link(&self, graph: &Graph, cycle: &[Link]) -> Link {
        cycle
            .iter()
            .find(|link| link.to.node == self.0)
            .copied()
            .unwrap_or_else(|| CutClosingLink.choose_link(graph, cycle))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    Visiting,
    Done,
}

impl Graph {
    /// Returns the links of some cycle, or `None` if the graph is acyclic.
    pub fn find_cycle(&self) -> Option<Vec<Link>> {
        let outgoing: Vec<Vec<Link>> = self
            .nodes()
            .iter()
            .map(|node| {
                node.outputs
                    .iter()
                    .flat_map(|output| {
                        output.targets.iter().map(|&to| Link {
                            from: output.id,
                            to,
                        })
                    })
                    .collect()
            })
            .collect();

        let mut states = vec![VisitState::Unvisited; self.node_count()];
        // path[i] is the link leading to stack[i + 1]
        let mut path: Vec<Link> = Vec::new();
        let mut stack: Vec<(NodeId, usize)> = Vec::new();

        for start in self.nodes().iter().map(|node| node.id) {
            if states[start.index()] != VisitState::Unvisited {
                continue;
            }
            states[start.index()] = VisitState::Visiting;
            stack.push((start, 0));

            while let Some(top) = stack.len().checked_sub(1) {
                let (node, cursor) = stack[top];
                let Some(&link) = outgoing[node.index()].get(cursor) else {
                    states[node.index()] = VisitState::Done;
                    stack.pop();
                    path.pop();
                    continue;
                };
                stack[top].1 += 1;

                let next = link.to.node;
                match states[next.index()] {
                    VisitState::Visiting => {
                        let begin = stack
                            .iter()
                            .position(|(id, _)| *id == next)
                            .expect("Visiting node must be on the stack");
                        let mut cycle = path[begin..].to_vec();
                        cycle.push(link);
                        return Some(cycle);
                    }
                    VisitState::Unvisited => {
                        states[next.index()] = VisitState::Visiting;
                        path.push(link);
                        stack.push((next, 0));
                    }
                    VisitState::Done => {}
                }
            }
        }

        None
    }

    /// Cuts links chosen by `policy` until no cycle is left. Returns the removed links.
    pub fn break_cycles(&mut self, policy: &dyn CycleBreakPolicy) -> Vec<Link> {
        let mut removed = Vec::new();

        while let Some(cycle) = self.find_cycle() {
            let link = policy.choose_link(self, &cycle);
            assert!(cycle.contains(&link), "Policy chose a link outside the cycle");

            debug!(
                "Breaking cycle of {} links at {:?} -> {:?}",
                cycle.len(),
                link.from,
                link.to
            );
            self.remove_link(link.to);
            removed.push(link);
        }

        removed
    }
}
