//! End-of-run report written next to the promoted node.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::Stage;
use crate::state::SessionState;
use crate::tree::{Node, NodeId, SearchTree};

const SUMMARY_TEMPLATE: &str = include_str!("summary.md");

/// Flat view of one node, also persisted per node as `states/node.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub depth: u32,
    pub stage: Stage,
    pub tool: Option<String>,
    pub status: &'static str,
    pub validation_score: Option<f64>,
    pub visits: u32,
    pub debug_attempts: u32,
    pub is_terminal: bool,
    pub is_debug_successful: bool,
}

impl NodeRecord {
    pub fn from_node(node: &Node) -> Self {
        let visits = node.stats().visits;
        let status = if node.is_successful {
            "success"
        } else if visits == 0 {
            "pending"
        } else {
            "failed"
        };
        Self {
            id: node.id,
            parent: node.parent,
            depth: node.depth,
            stage: node.stage,
            tool: node.tool_used.clone(),
            status,
            validation_score: node.validation_score,
            visits,
            debug_attempts: node.debug_attempts,
            is_terminal: node.is_terminal,
            is_debug_successful: node.is_debug_successful,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolUse {
    pub name: String,
    pub used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub target: Option<NodeId>,
    pub best_score: Option<f64>,
    pub iterations: u32,
    pub stop: String,
    pub tools: Vec<ToolUse>,
    pub nodes: Vec<NodeRecord>,
}

impl RunSummary {
    pub fn collect(tree: &SearchTree, session: &SessionState, iterations: u32, stop: &str) -> Self {
        let target = session.promotion_target();
        let best_score = target
            .and_then(|id| tree.get(id))
            .and_then(|node| node.validation_score);
        let tools = session
            .available_tools
            .iter()
            .map(|name| ToolUse {
                name: name.clone(),
                used: session.used_tools.contains(name),
            })
            .collect();
        let nodes = tree
            .iter()
            .filter(|node| !node.is_root())
            .map(NodeRecord::from_node)
            .collect();
        Self {
            target,
            best_score,
            iterations,
            stop: stop.to_string(),
            tools,
            nodes,
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("summary", SUMMARY_TEMPLATE)
            .context("load summary template")?;
        let rendered = env
            .get_template("summary")?
            .render(context! {
                target => self.target,
                best_score => self.best_score,
                iterations => self.iterations,
                stop => self.stop,
                tools => self.tools,
                nodes => self.nodes,
            })
            .context("render run summary")?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ROOT_ID;

    #[test]
    fn summary_lists_nodes_and_tool_usage() {
        let mut tree = SearchTree::new();
        let a = tree.add_child(ROOT_ID, Stage::Evolve, Some("A".into())).expect("a");
        let b = tree.add_child(ROOT_ID, Stage::Evolve, Some("B".into())).expect("b");
        tree.backpropagate(a, Some(0.7), true, false);
        tree.backpropagate(b, None, false, true);
        {
            let node = tree.node_mut(a).expect("a");
            node.is_successful = true;
            node.validation_score = Some(0.7);
        }
        let mut session = SessionState {
            available_tools: vec!["A".into(), "B".into(), "C".into()],
            ..SessionState::default()
        };
        session.mark_tool_used("A");
        session.mark_tool_used("B");
        session.record_score(a, 0.7);

        let summary = RunSummary::collect(&tree, &session, 2, "max iterations");
        assert_eq!(summary.target, Some(a));
        assert_eq!(summary.nodes.len(), 2);
        assert_eq!(summary.nodes[1].status, "failed");

        let text = summary.render().expect("render");
        assert!(text.contains("Best run: node 0 (validation score 0.7)"));
        assert!(text.contains("- C: not used"));
        assert!(text.contains("| 1 | -1 | evolve | B | failed | - | 1 | no |"));
    }

    #[test]
    fn summary_without_success_says_so() {
        let tree = SearchTree::new();
        let text = RunSummary::collect(&tree, &SessionState::default(), 0, "cancelled")
            .render()
            .expect("render");
        assert!(text.contains("No node succeeded."));
    }
}
