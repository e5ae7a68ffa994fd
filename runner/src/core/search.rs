//! Deterministic selection and terminal-marking policy for the search tree.
//!
//! Everything here is pure: given the same tree and limits the same node is
//! selected. Ties on UCT are broken by ascending node id.

use tracing::debug;

use crate::core::types::Stage;
use crate::core::uct::{ScoreRange, UctParams, root_exploration_constant, uct_value};
use crate::tree::{NodeId, ROOT_ID, SearchTree};

/// Branching and depth caps for expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionLimits {
    pub initial_root_children: usize,
    pub max_debug_children: usize,
    pub max_evolve_children: usize,
    pub max_debug_depth: u32,
}

/// Snapshot of run-level facts the policy needs besides the tree itself.
#[derive(Debug, Clone, Copy)]
pub struct PolicyView<'a> {
    pub limits: ExpansionLimits,
    /// Tools in priority order.
    pub available_tools: &'a [String],
    /// True while some available tool has not been used by any node.
    pub has_unused_tool: bool,
}

impl PolicyView<'_> {
    fn tool_priority(&self, tool: Option<&str>) -> Option<usize> {
        let tool = tool?;
        self.available_tools.iter().position(|t| t == tool)
    }
}

/// Whether `id` may receive no further children.
pub fn is_fully_expanded(tree: &SearchTree, id: NodeId, view: &PolicyView<'_>) -> bool {
    let Some(node) = tree.get(id) else {
        return true;
    };
    let children = node.children.len();
    match node.stage {
        Stage::Root => children >= view.limits.initial_root_children || !view.has_unused_tool,
        Stage::Debug => node.is_debug_successful || children >= view.limits.max_debug_children,
        Stage::Evolve => children >= view.limits.max_evolve_children,
    }
}

/// Descend from the root to the node that should be expanded next.
///
/// Internal nodes whose children are all terminal are marked terminal on the
/// way and the descent restarts from the root. Returns `None` once the root
/// itself is terminal.
pub fn select_node(
    tree: &mut SearchTree,
    view: &PolicyView<'_>,
    params: &UctParams,
    range: ScoreRange,
) -> Option<NodeId> {
    'descent: loop {
        if tree.root().is_terminal {
            return None;
        }
        let mut current = ROOT_ID;
        loop {
            if !is_fully_expanded(tree, current, view) {
                return Some(current);
            }
            match best_child(tree, current, view, params, range) {
                Some(child) => current = child,
                None => {
                    debug!(node = current, "all children terminal");
                    mark_terminal(tree, current, view);
                    continue 'descent;
                }
            }
        }
    }
}

/// Non-terminal child of `id` with the highest UCT, lowest id on ties.
pub fn best_child(
    tree: &SearchTree,
    id: NodeId,
    view: &PolicyView<'_>,
    params: &UctParams,
    range: ScoreRange,
) -> Option<NodeId> {
    let node = tree.get(id)?;
    let parent_visits = node.stats().visits;
    let mut best: Option<(NodeId, f64)> = None;
    for child_id in &node.children {
        let Some(child) = tree.get(*child_id) else {
            continue;
        };
        if child.is_terminal {
            continue;
        }
        let c = if node.is_root() {
            root_exploration_constant(
                params.exploration_constant,
                view.tool_priority(child.tool_used.as_deref()),
            )
        } else {
            params.exploration_constant
        };
        let value = uct_value(&child.stats(), parent_visits, range, params, c);
        let better = match best {
            None => true,
            Some((_, best_value)) => value > best_value,
        };
        if better {
            best = Some((*child_id, value));
        }
    }
    best.map(|(id, _)| id)
}

/// Mark `id` and its whole subtree terminal, then close every ancestor that is
/// fully expanded with only terminal children.
pub fn mark_terminal(tree: &mut SearchTree, id: NodeId, view: &PolicyView<'_>) {
    for node_id in tree.subtree(id) {
        if let Some(node) = tree.get_mut(node_id) {
            node.is_terminal = true;
        }
    }
    propagate_terminal_upward(tree, id, view);
}

/// Walk upward from `id`'s parent closing exhausted ancestors.
pub fn propagate_terminal_upward(tree: &mut SearchTree, id: NodeId, view: &PolicyView<'_>) {
    let mut cursor = tree.get(id).and_then(|node| node.parent);
    while let Some(current) = cursor {
        let exhausted = {
            let Some(node) = tree.get(current) else {
                return;
            };
            if node.is_terminal {
                return;
            }
            !node.children.is_empty()
                && is_fully_expanded(tree, current, view)
                && node
                    .children
                    .iter()
                    .all(|child| tree.get(*child).is_some_and(|c| c.is_terminal))
        };
        if !exhausted {
            return;
        }
        debug!(node = current, "closing exhausted ancestor");
        if let Some(node) = tree.get_mut(current) {
            node.is_terminal = true;
        }
        cursor = tree.get(current).and_then(|node| node.parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ExpansionLimits {
        ExpansionLimits {
            initial_root_children: 3,
            max_debug_children: 2,
            max_evolve_children: 2,
            max_debug_depth: 3,
        }
    }

    fn params() -> UctParams {
        UctParams {
            exploration_constant: 1.414,
            failure_offset: 0.0,
            failure_penalty_weight: 0.0,
        }
    }

    fn tools() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    #[test]
    fn root_is_selected_until_fully_expanded() {
        let mut tree = SearchTree::new();
        let tools = tools();
        let view = PolicyView {
            limits: limits(),
            available_tools: &tools,
            has_unused_tool: true,
        };
        assert_eq!(select_node(&mut tree, &view, &params(), ScoreRange::default()), Some(ROOT_ID));
    }

    #[test]
    fn unvisited_child_is_preferred_over_visited_sibling() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, Some("A".into())).expect("a");
        let b = tree.add_child(ROOT_ID, Stage::Evolve, Some("B".into())).expect("b");
        tree.backpropagate(a, Some(1.0), true, false);
        let tools = tools();
        let view = PolicyView {
            limits: ExpansionLimits {
                initial_root_children: 2,
                ..limits()
            },
            available_tools: &tools,
            has_unused_tool: false,
        };
        let range = ScoreRange {
            best: Some(1.0),
            worst: Some(1.0),
        };
        assert_eq!(best_child(&tree, ROOT_ID, &view, &params(), range), Some(b));
    }

    #[test]
    fn tool_priority_breaks_exploitation_ties() {
        let mut tree = SearchTree::new();
        let tools = tools();
        let ids: Vec<NodeId> = tools
            .iter()
            .rev()
            .map(|t| tree.add_child(ROOT_ID, Stage::Evolve, Some(t.clone())).expect("child"))
            .collect();
        for id in &ids {
            tree.backpropagate(*id, None, false, true);
        }
        let view = PolicyView {
            limits: limits(),
            available_tools: &tools,
            has_unused_tool: false,
        };
        // Children were created C, B, A; the highest-priority tool A wins.
        let chosen = best_child(&tree, ROOT_ID, &view, &params(), ScoreRange::default()).expect("child");
        assert_eq!(tree.node(chosen).expect("node").tool_used.as_deref(), Some("A"));
    }

    #[test]
    fn selection_is_stable_on_unchanged_tree() {
        let mut tree = SearchTree::new();
        for tool in tools() {
            let id = tree.add_child(ROOT_ID, Stage::Evolve, Some(tool)).expect("child");
            tree.backpropagate(id, None, false, true);
        }
        let tools = vec!["X".to_string()];
        let view = PolicyView {
            limits: limits(),
            available_tools: &tools,
            has_unused_tool: false,
        };
        let first = select_node(&mut tree, &view, &params(), ScoreRange::default());
        let second = select_node(&mut tree, &view, &params(), ScoreRange::default());
        assert_eq!(first, second);
        assert_eq!(first, Some(0));
    }

    #[test]
    fn only_terminal_children_close_the_root() {
        let mut tree = SearchTree::new();
        let tools = tools();
        for tool in &tools {
            let id = tree.add_child(ROOT_ID, Stage::Evolve, Some(tool.clone())).expect("child");
            tree.get_mut(id).expect("child").is_terminal = true;
        }
        let view = PolicyView {
            limits: limits(),
            available_tools: &tools,
            has_unused_tool: false,
        };
        assert_eq!(select_node(&mut tree, &view, &params(), ScoreRange::default()), None);
        assert!(tree.root().is_terminal);
    }

    #[test]
    fn marking_terminal_closes_exhausted_ancestors_only() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, Some("A".into())).expect("a");
        let b = tree.add_child(ROOT_ID, Stage::Evolve, Some("B".into())).expect("b");
        let d1 = tree.add_child(a, Stage::Debug, Some("A".into())).expect("d1");
        let d2 = tree.add_child(a, Stage::Debug, Some("A".into())).expect("d2");
        let tools = vec!["A".to_string(), "B".to_string()];
        let view = PolicyView {
            limits: ExpansionLimits {
                initial_root_children: 2,
                ..limits()
            },
            available_tools: &tools,
            has_unused_tool: false,
        };

        mark_terminal(&mut tree, d1, &view);
        assert!(!tree.node(a).expect("a").is_terminal);

        mark_terminal(&mut tree, d2, &view);
        assert!(tree.node(a).expect("a").is_terminal, "a is fully expanded with terminal children");
        assert!(!tree.root().is_terminal, "b is still open");

        mark_terminal(&mut tree, b, &view);
        assert!(tree.root().is_terminal);
        assert!(tree.validate().is_empty());
    }

    #[test]
    fn marking_terminal_covers_the_subtree() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, None).expect("a");
        let b = tree.add_child(a, Stage::Debug, None).expect("b");
        let c = tree.add_child(b, Stage::Debug, None).expect("c");
        let tools: Vec<String> = Vec::new();
        let view = PolicyView {
            limits: limits(),
            available_tools: &tools,
            has_unused_tool: false,
        };
        mark_terminal(&mut tree, a, &view);
        assert!(tree.node(b).expect("b").is_terminal);
        assert!(tree.node(c).expect("c").is_terminal);
    }
}
