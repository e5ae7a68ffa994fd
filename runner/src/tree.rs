//! Search tree arena.
//!
//! Nodes live in an id-keyed map owned by [`SearchTree`]; parent and child
//! links are ids, so re-parenting is a detach-and-attach on two sets. Ids are
//! the controller's time steps: the root is `-1` and every new node takes the
//! next integer, which also orders the artifact directories.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use serde::Serialize;

use crate::core::types::Stage;

pub type NodeId = i64;

pub const ROOT_ID: NodeId = -1;

/// Visit statistics, updated during backpropagation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NodeStats {
    pub visits: u32,
    pub validated_visits: u32,
    pub unvalidated_visits: u32,
    pub failure_visits: u32,
    /// Sum of raw validation scores over validated visits.
    pub validated_reward: f64,
}

/// Write-once artifacts produced while working on a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeArtifacts {
    pub user_input: String,
    pub python_code: String,
    pub bash_script: String,
    pub tutorial_retrieval: String,
    pub tutorial_prompt: String,
    pub stdout: String,
    pub stderr: String,
    pub error_message: String,
    pub error_analysis: String,
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub depth: u32,
    pub stage: Stage,
    pub tool_used: Option<String>,
    pub parent: Option<NodeId>,
    pub children: BTreeSet<NodeId>,
    pub artifacts: NodeArtifacts,
    /// Higher is better.
    pub validation_score: Option<f64>,
    pub is_successful: bool,
    /// Sticky: a debug descendant succeeded and was moved out of this subtree.
    pub is_debug_successful: bool,
    pub is_terminal: bool,
    pub debug_attempts: u32,
    stats: Mutex<NodeStats>,
}

impl Node {
    fn new(id: NodeId, depth: u32, stage: Stage, tool_used: Option<String>, parent: Option<NodeId>) -> Self {
        Self {
            id,
            depth,
            stage,
            tool_used,
            parent,
            children: BTreeSet::new(),
            artifacts: NodeArtifacts::default(),
            validation_score: None,
            is_successful: false,
            is_debug_successful: false,
            is_terminal: false,
            debug_attempts: 0,
            stats: Mutex::new(NodeStats::default()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.stage == Stage::Root
    }

    pub fn stats(&self) -> NodeStats {
        *self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one visit.
    ///
    /// Failure wins over validation; a validated visit without a reward
    /// counts as unvalidated.
    pub fn update(&self, reward: Option<f64>, is_validated: bool, is_failure: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.visits += 1;
        if is_failure {
            stats.failure_visits += 1;
        } else if let (true, Some(reward)) = (is_validated, reward) {
            stats.validated_visits += 1;
            stats.validated_reward += reward;
        } else {
            stats.unvalidated_visits += 1;
        }
    }
}

/// Arena holding the whole search tree.
#[derive(Debug)]
pub struct SearchTree {
    nodes: BTreeMap<NodeId, Node>,
    next_id: NodeId,
}

impl Default for SearchTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_ID, Node::new(ROOT_ID, 0, Stage::Root, None, None));
        Self { nodes, next_id: 0 }
    }

    pub fn root(&self) -> &Node {
        &self.nodes[&ROOT_ID]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| anyhow!("node {id} not found"))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| anyhow!("node {id} not found"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in id (creation) order, root first.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Create a child of `parent` with the next time step as its id.
    pub fn add_child(&mut self, parent: NodeId, stage: Stage, tool: Option<String>) -> Result<NodeId> {
        let id = self.next_id;
        let parent_node = self.node_mut(parent)?;
        let depth = parent_node.depth + 1;
        parent_node.children.insert(id);
        self.nodes.insert(id, Node::new(id, depth, stage, tool, Some(parent)));
        self.next_id += 1;
        Ok(id)
    }

    /// Detach `id` from its parent and attach it under `new_parent`,
    /// refreshing depths of the moved subtree.
    pub fn reparent(&mut self, id: NodeId, new_parent: NodeId) -> Result<()> {
        if id == ROOT_ID {
            return Err(anyhow!("cannot re-parent the root"));
        }
        if self.is_ancestor(id, new_parent) {
            return Err(anyhow!("cannot move node {id} under its own descendant {new_parent}"));
        }
        let old_parent = self.node(id)?.parent;
        let depth = self.node(new_parent)?.depth + 1;
        if let Some(old) = old_parent {
            self.node_mut(old)?.children.remove(&id);
        }
        self.node_mut(new_parent)?.children.insert(id);
        self.node_mut(id)?.parent = Some(new_parent);
        self.set_depth(id, depth)
    }

    fn set_depth(&mut self, id: NodeId, depth: u32) -> Result<()> {
        let node = self.node_mut(id)?;
        node.depth = depth;
        let children: Vec<NodeId> = node.children.iter().copied().collect();
        for child in children {
            self.set_depth(child, depth + 1)?;
        }
        Ok(())
    }

    /// True when `ancestor` lies on the path from `id` to the root (inclusive).
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).and_then(|node| node.parent);
        }
        false
    }

    /// Path from `id` up to the root, `id` first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            path.push(current);
            cursor = self.get(current).and_then(|node| node.parent);
        }
        path
    }

    /// `id` and every node below it, in depth-first id order.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get(current) {
                out.push(current);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Replay a simulation outcome on `id` and all of its ancestors.
    pub fn backpropagate(&self, id: NodeId, reward: Option<f64>, is_validated: bool, is_failure: bool) {
        for ancestor in self.ancestors(id) {
            if let Some(node) = self.get(ancestor) {
                node.update(reward, is_validated, is_failure);
            }
        }
    }

    fn has_score_in_subtree(&self, id: NodeId) -> bool {
        self.subtree(id)
            .iter()
            .any(|node| self.get(*node).is_some_and(|n| n.validation_score.is_some()))
    }

    /// Check the structural invariants; returns one message per violation.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for node in self.nodes.values() {
            let stats = node.stats();
            if stats.visits != stats.validated_visits + stats.unvalidated_visits + stats.failure_visits {
                errors.push(format!("node {}: visit counters do not add up", node.id));
            }
            // Ancestors inherit validated visits, so a score anywhere in the
            // subtree satisfies the check.
            if stats.validated_visits > 0 && !self.has_score_in_subtree(node.id) {
                errors.push(format!("node {}: validated visits without a score", node.id));
            }
            if node.is_terminal {
                let open_child = node
                    .children
                    .iter()
                    .find(|child| self.get(**child).is_some_and(|c| !c.is_terminal));
                if let Some(child) = open_child {
                    errors.push(format!("node {}: terminal with open child {}", node.id, child));
                }
            }
            if let Some(parent) = node.parent {
                match self.nodes.get(&parent) {
                    Some(parent_node) => {
                        if parent_node.depth + 1 != node.depth {
                            errors.push(format!("node {}: depth does not follow parent", node.id));
                        }
                        if !parent_node.children.contains(&node.id) {
                            errors.push(format!("node {}: missing from parent's children", node.id));
                        }
                    }
                    None => errors.push(format!("node {}: dangling parent {}", node.id, parent)),
                }
            } else if node.id != ROOT_ID {
                errors.push(format!("node {}: detached from the tree", node.id));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_fixed_identity() {
        let tree = SearchTree::new();
        let root = tree.root();
        assert_eq!(root.id, ROOT_ID);
        assert_eq!(root.depth, 0);
        assert_eq!(root.stage, Stage::Root);
        assert!(root.parent.is_none());
    }

    #[test]
    fn children_take_increasing_ids_and_parent_depth_plus_one() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, Some("a".into())).expect("a");
        let b = tree.add_child(a, Stage::Debug, Some("a".into())).expect("b");
        assert_eq!((a, b), (0, 1));
        assert_eq!(tree.node(b).expect("b").depth, 2);
        assert!(tree.root().children.contains(&a));
        assert_eq!(tree.ancestors(b), vec![b, a, ROOT_ID]);
    }

    #[test]
    fn update_keeps_visit_counters_consistent() {
        let tree = SearchTree::new();
        let root = tree.root();
        root.update(Some(0.4), true, false);
        root.update(None, true, false);
        root.update(Some(0.9), true, true);
        root.update(None, false, false);
        let stats = root.stats();
        assert_eq!(stats.visits, 4);
        assert_eq!(stats.validated_visits, 1);
        assert_eq!(stats.unvalidated_visits, 2);
        assert_eq!(stats.failure_visits, 1);
        assert!((stats.validated_reward - 0.4).abs() < 1e-12);
    }

    #[test]
    fn reparent_moves_subtree_and_fixes_depths() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, None).expect("a");
        let b = tree.add_child(a, Stage::Debug, None).expect("b");
        let c = tree.add_child(b, Stage::Debug, None).expect("c");
        let d = tree.add_child(c, Stage::Evolve, None).expect("d");

        tree.reparent(c, ROOT_ID).expect("reparent");
        assert_eq!(tree.node(c).expect("c").parent, Some(ROOT_ID));
        assert_eq!(tree.node(c).expect("c").depth, 1);
        assert_eq!(tree.node(d).expect("d").depth, 2);
        assert!(!tree.node(b).expect("b").children.contains(&c));
        assert!(tree.validate().is_empty(), "{:?}", tree.validate());
    }

    #[test]
    fn reparent_refuses_cycles() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, None).expect("a");
        let b = tree.add_child(a, Stage::Debug, None).expect("b");
        assert!(tree.reparent(a, b).is_err());
    }

    #[test]
    fn backpropagate_touches_every_ancestor_once() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, None).expect("a");
        let b = tree.add_child(a, Stage::Evolve, None).expect("b");
        let _sibling = tree.add_child(ROOT_ID, Stage::Evolve, None).expect("sibling");
        tree.backpropagate(b, None, false, true);
        assert_eq!(tree.node(b).expect("b").stats().failure_visits, 1);
        assert_eq!(tree.node(a).expect("a").stats().failure_visits, 1);
        assert_eq!(tree.root().stats().visits, 1);
        assert_eq!(tree.node(2).expect("sibling").stats().visits, 0);
    }

    #[test]
    fn subtree_lists_descendants_in_id_order() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, None).expect("a");
        let b = tree.add_child(a, Stage::Evolve, None).expect("b");
        let c = tree.add_child(a, Stage::Evolve, None).expect("c");
        let d = tree.add_child(b, Stage::Evolve, None).expect("d");
        assert_eq!(tree.subtree(a), vec![a, b, d, c]);
    }
}
