//! Non-owning index of the agent tree
//!
//! The hierarchy records who spawned whom but never keeps an agent alive.
//! Whoever holds the in-flight task (or the delegation capability that spawned
//! a helper) owns it; once the last strong reference goes, the agent simply
//! stops showing up here.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::agent::Agent;
use crate::ids::AgentId;

#[derive(Debug, Clone)]
struct HierarchyNode {
    agent: Weak<Agent>,
    parent: Option<AgentId>,
    children: Vec<AgentId>,
    depth: usize,
}

/// Session-owned registry: agent id to weak handle, plus parent/child links
#[derive(Debug, Default)]
pub struct AgentHierarchy {
    nodes: HashMap<AgentId, HierarchyNode>,
    /// Registration order, for deterministic walks
    order: Vec<AgentId>,
    root: Option<AgentId>,
}

impl AgentHierarchy {
    /// Create an empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its parent
    pub fn add_agent(&mut self, agent: &Arc<Agent>) {
        let id = agent.id;
        let parent = agent.parent_id();

        if parent.is_none() {
            self.root = Some(id);
        }

        if let Some(pid) = &parent {
            if let Some(node) = self.nodes.get_mut(pid) {
                if !node.children.contains(&id) {
                    node.children.push(id);
                }
            }
        }

        let node = HierarchyNode {
            agent: Arc::downgrade(agent),
            parent,
            children: Vec::new(),
            depth: agent.depth,
        };
        if self.nodes.insert(id, node).is_none() {
            self.order.push(id);
        }
    }

    /// Remove an agent from the index
    pub fn remove_agent(&mut self, agent_id: &AgentId) -> bool {
        let Some(node) = self.nodes.remove(agent_id) else {
            return false;
        };
        if let Some(pid) = &node.parent {
            if let Some(parent) = self.nodes.get_mut(pid) {
                parent.children.retain(|id| id != agent_id);
            }
        }
        self.order.retain(|id| id != agent_id);
        if self.root == Some(*agent_id) {
            self.root = None;
        }
        true
    }

    /// The most recently registered agent without a parent
    pub fn root(&self) -> Option<AgentId> {
        self.root
    }

    /// Strong handle to a registered agent, if it is still alive
    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<Agent>> {
        self.nodes.get(agent_id).and_then(|n| n.agent.upgrade())
    }

    /// Whether the agent is registered and still referenced somewhere
    pub fn is_alive(&self, agent_id: &AgentId) -> bool {
        self.nodes
            .get(agent_id)
            .is_some_and(|n| n.agent.strong_count() > 0)
    }

    /// Parent of an agent, `None` for the root or an unknown id
    pub fn parent(&self, agent_id: &AgentId) -> Option<AgentId> {
        self.nodes.get(agent_id).and_then(|n| n.parent)
    }

    /// Direct children of an agent, in registration order
    pub fn children(&self, agent_id: &AgentId) -> Vec<AgentId> {
        self.nodes.get(agent_id).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Recorded depth; 0 for unknown ids
    pub fn depth(&self, agent_id: &AgentId) -> usize {
        self.nodes.get(agent_id).map(|n| n.depth).unwrap_or(0)
    }

    /// All registered agents at a depth
    pub fn agents_at_depth(&self, depth: usize) -> Vec<AgentId> {
        self.order
            .iter()
            .filter(|id| self.depth(id) == depth)
            .copied()
            .collect()
    }

    /// Every live agent, parents before children.
    ///
    /// Walks depth-first from the root in registration order, then appends any
    /// live agent the walk could not reach.
    pub fn live_agents(&self) -> Vec<Arc<Agent>> {
        let mut visited = Vec::with_capacity(self.order.len());
        if let Some(root) = self.root {
            self.walk(root, &mut visited);
        }
        for id in &self.order {
            if !visited.contains(id) {
                self.walk(*id, &mut visited);
            }
        }
        visited.iter().filter_map(|id| self.get(id)).collect()
    }

    fn walk(&self, id: AgentId, visited: &mut Vec<AgentId>) {
        if visited.contains(&id) {
            return;
        }
        visited.push(id);
        if let Some(node) = self.nodes.get(&id) {
            for child in &node.children {
                self.walk(*child, visited);
            }
        }
    }

    /// Drop index entries whose agents are gone
    pub fn prune(&mut self) -> usize {
        let dead: Vec<AgentId> = self
            .order
            .iter()
            .filter(|id| !self.is_alive(id))
            .copied()
            .collect();
        for id in &dead {
            self.remove_agent(id);
        }
        dead.len()
    }

    /// Total registered agents, live or not
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no agent is registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, AgentFixture};

    #[tokio::test]
    async fn test_root_registration() {
        let ctx = test_context();
        let root = AgentFixture::root(&ctx).build().await;
        let mut hierarchy = AgentHierarchy::new();

        hierarchy.add_agent(&root);

        assert_eq!(hierarchy.len(), 1);
        assert_eq!(hierarchy.root(), Some(root.id));
        assert_eq!(hierarchy.depth(&root.id), 0);
        assert!(hierarchy.parent(&root.id).is_none());
    }

    #[tokio::test]
    async fn test_children_and_depths() {
        let ctx = test_context();
        let root = AgentFixture::root(&ctx).build().await;
        let lead = AgentFixture::child(&ctx, &root, "alpha").build().await;
        let worker = AgentFixture::child(&ctx, &lead, "beta").build().await;
        let mut hierarchy = AgentHierarchy::new();

        hierarchy.add_agent(&root);
        hierarchy.add_agent(&lead);
        hierarchy.add_agent(&worker);

        assert_eq!(hierarchy.children(&root.id), vec![lead.id]);
        assert_eq!(hierarchy.children(&lead.id), vec![worker.id]);
        assert_eq!(hierarchy.parent(&worker.id), Some(lead.id));
        assert_eq!(hierarchy.depth(&worker.id), 2);
        assert_eq!(hierarchy.agents_at_depth(1), vec![lead.id]);
        assert!(hierarchy.agents_at_depth(5).is_empty());
    }

    #[tokio::test]
    async fn test_index_does_not_keep_agents_alive() {
        let ctx = test_context();
        let root = AgentFixture::root(&ctx).build().await;
        let child = AgentFixture::child(&ctx, &root, "alpha").build().await;
        let child_id = child.id;
        let mut hierarchy = AgentHierarchy::new();
        hierarchy.add_agent(&root);
        hierarchy.add_agent(&child);

        assert!(hierarchy.is_alive(&child_id));
        drop(child);

        assert!(!hierarchy.is_alive(&child_id));
        assert!(hierarchy.get(&child_id).is_none());
        assert_eq!(hierarchy.live_agents().len(), 1);
        assert_eq!(hierarchy.prune(), 1);
        assert!(hierarchy.children(&root.id).is_empty());
    }

    #[tokio::test]
    async fn test_live_agents_parents_first() {
        let ctx = test_context();
        let root = AgentFixture::root(&ctx).build().await;
        let a = AgentFixture::child(&ctx, &root, "alpha").build().await;
        let b = AgentFixture::child(&ctx, &root, "beta").build().await;
        let a1 = AgentFixture::child(&ctx, &a, "gamma").build().await;
        let mut hierarchy = AgentHierarchy::new();
        for agent in [&root, &a, &b, &a1] {
            hierarchy.add_agent(agent);
        }

        let ids: Vec<AgentId> = hierarchy.live_agents().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![root.id, a.id, a1.id, b.id]);
    }

    #[tokio::test]
    async fn test_remove_agent() {
        let ctx = test_context();
        let root = AgentFixture::root(&ctx).build().await;
        let child = AgentFixture::child(&ctx, &root, "alpha").build().await;
        let mut hierarchy = AgentHierarchy::new();
        hierarchy.add_agent(&root);
        hierarchy.add_agent(&child);

        assert!(hierarchy.remove_agent(&child.id));
        assert!(!hierarchy.remove_agent(&child.id));
        assert!(hierarchy.children(&root.id).is_empty());

        assert!(hierarchy.remove_agent(&root.id));
        assert!(hierarchy.root().is_none());
        assert!(hierarchy.is_empty());
    }
}
