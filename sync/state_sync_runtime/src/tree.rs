//! Server-side state tree.
//!
//! Nodes live in an arena keyed by [`NodeId`]; parent and child links are ids.
//! Mutations mark nodes dirty and [`StateTree::flush`] turns the dirty set into
//! an ordered [`ChangeBatch`].

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::change::{ChangeBatch, ChangeEntry};
use crate::error::StateError;
use crate::node::{FeatureKind, NodeFeature, NodeId, NodeStatus, StateNode};

/// A node joined or left the attached tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Attached(NodeId),
    Detached(NodeId),
}

#[derive(Debug, Clone)]
pub struct StateTree {
    nodes: BTreeMap<NodeId, StateNode>,
    next_id: u32,
    dirty: BTreeSet<NodeId>,
    detached: BTreeSet<NodeId>,
    lifecycle: Vec<Lifecycle>,
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTree {
    pub fn new() -> Self {
        let mut root = StateNode::new(NodeId::ROOT, NodeStatus::Attached);
        // The client mirror starts out with the root registered.
        root.mark_announced();

        let mut nodes = BTreeMap::new();
        nodes.insert(NodeId::ROOT, root);

        Self {
            nodes,
            next_id: NodeId::ROOT.get() + 1,
            dirty: BTreeSet::new(),
            detached: BTreeSet::new(),
            lifecycle: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Allocates an unattached node. Ids are never reused.
    pub fn create_node(&mut self) -> NodeId {
        let id = NodeId::new(self.next_id);
        self.next_id += 1;
        self.nodes
            .insert(id, StateNode::new(id, NodeStatus::Unattached));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&StateNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(StateNode::is_attached)
    }

    /// Fails for unknown and detached nodes, like every mutation does.
    pub fn ensure_live(&self, id: NodeId) -> Result<(), StateError> {
        self.live_node(id).map(|_node| ())
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.detached.is_empty()
    }

    pub fn feature(
        &self,
        id: NodeId,
        kind: FeatureKind,
    ) -> Result<Option<&NodeFeature>, StateError> {
        Ok(self.live_node(id)?.feature(kind))
    }

    /// Mutable access to a feature, creating it on first use. The node is
    /// marked dirty since the caller may change it.
    pub fn get_or_create_feature(
        &mut self,
        id: NodeId,
        kind: FeatureKind,
    ) -> Result<&mut NodeFeature, StateError> {
        self.live_node(id)?;
        self.mark_dirty(id);
        let node = self.live_node_mut(id)?;
        Ok(node.feature_mut(kind))
    }

    pub fn property(&self, id: NodeId, key: &str) -> Result<Option<&Value>, StateError> {
        Ok(self.live_node(id)?.property(key))
    }

    pub fn set_property(
        &mut self,
        id: NodeId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), StateError> {
        let changed = self.live_node_mut(id)?.properties_mut().set(key, value);
        if changed {
            self.mark_dirty(id);
        }
        Ok(())
    }

    pub fn remove_property(&mut self, id: NodeId, key: &str) -> Result<(), StateError> {
        let node = self.live_node_mut(id)?;
        if node.property(key).is_none() {
            return Ok(());
        }

        if node.properties_mut().remove(key) {
            self.mark_dirty(id);
        }
        Ok(())
    }

    /// Applies a property value reported by the client. The client already
    /// has it, so no change is recorded for it.
    pub fn sync_property(
        &mut self,
        id: NodeId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), StateError> {
        self.live_node_mut(id)?
            .properties_mut()
            .accept_client_value(key, value);
        self.mark_dirty(id);
        Ok(())
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId], StateError> {
        Ok(self.live_node(id)?.children())
    }

    pub fn attach_child(
        &mut self,
        parent: NodeId,
        index: usize,
        child: NodeId,
    ) -> Result<(), StateError> {
        let parent_node = self.live_node(parent)?;
        let len = parent_node.children().len();
        let parent_attached = parent_node.is_attached();

        let child_node = self.live_node(child)?;
        if child_node.status() == NodeStatus::Attached || child_node.parent().is_some() {
            return Err(StateError::AlreadyAttached(child));
        }

        if self.is_ancestor_or_self(child, parent) {
            return Err(StateError::Cycle { parent, child });
        }

        if index > len {
            return Err(StateError::IndexOutOfBounds { parent, index, len });
        }

        self.live_node_mut(parent)?
            .children_mut()
            .insert(index, child);
        self.live_node_mut(child)?.set_parent(Some(parent));
        self.mark_dirty(parent);

        if parent_attached {
            let subtree = self.subtree(child);
            for id in &subtree {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.set_status(NodeStatus::Attached);
                }
                self.dirty.insert(*id);
            }
            // Descendants before ancestors.
            self.lifecycle
                .extend(subtree.into_iter().rev().map(Lifecycle::Attached));
        }

        Ok(())
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StateError> {
        let len = self.children(parent)?.len();
        self.attach_child(parent, len, child)
    }

    /// Removes `child` from `parent` and retires its whole subtree. The ids
    /// are released at the next flush.
    pub fn detach_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StateError> {
        let removed = self
            .live_node(parent)?
            .feature(FeatureKind::Children)
            .and_then(NodeFeature::as_children)
            .and_then(|list| list.position(child))
            .is_some();

        if !removed {
            return Err(StateError::NotAChild { parent, child });
        }

        self.live_node_mut(parent)?.children_mut().remove(child);
        self.mark_dirty(parent);

        let subtree = self.subtree(child);
        let mut left = Vec::new();
        for id in &subtree {
            if let Some(node) = self.nodes.get_mut(id) {
                if node.is_attached() {
                    left.push(*id);
                }
                node.set_status(NodeStatus::Detached);
                node.set_parent(None);
            }
            self.dirty.remove(id);
            self.detached.insert(*id);
        }
        self.lifecycle
            .extend(left.into_iter().rev().map(Lifecycle::Detached));

        Ok(())
    }

    pub fn add_event_listener(&mut self, id: NodeId, event: &str) -> Result<(), StateError> {
        if self.live_node_mut(id)?.listeners_mut().add(event) {
            self.mark_dirty(id);
        }
        Ok(())
    }

    pub fn remove_event_listener(&mut self, id: NodeId, event: &str) -> Result<(), StateError> {
        let node = self.live_node_mut(id)?;
        if !node.has_listener(event) {
            return Ok(());
        }

        if node.listeners_mut().remove(event) {
            self.mark_dirty(id);
        }
        Ok(())
    }

    /// Attach and detach notifications queued since the last call, in the
    /// order they happened.
    pub fn take_lifecycle(&mut self) -> Vec<Lifecycle> {
        std::mem::take(&mut self.lifecycle)
    }

    /// Only attached nodes are tracked; unattached ones are sent in full
    /// when they get attached.
    pub fn mark_dirty(&mut self, id: NodeId) {
        if self.is_attached(id) {
            self.dirty.insert(id);
        }
    }

    /// Preview of what the next [`flush`](Self::flush) returns.
    pub fn collect_changes(&self) -> Vec<ChangeEntry> {
        let mut out = Vec::new();
        let visit: BTreeSet<NodeId> = self.dirty.union(&self.detached).copied().collect();

        for id in visit {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };

            match node.status() {
                NodeStatus::Attached if !node.is_announced() => node.generate_from_empty(&mut out),
                NodeStatus::Attached => node.collect_changes(&mut out),
                NodeStatus::Detached if node.is_announced() => out.push(ChangeEntry::detach(id)),
                NodeStatus::Detached | NodeStatus::Unattached => {}
            }
        }

        out
    }

    pub fn flush(&mut self) -> ChangeBatch {
        let entries = self.collect_changes();

        for id in std::mem::take(&mut self.dirty) {
            if let Some(node) = self.nodes.get_mut(&id) {
                if node.is_attached() {
                    node.clear_changes();
                    node.mark_announced();
                }
            }
        }

        for id in std::mem::take(&mut self.detached) {
            self.nodes.remove(&id);
        }

        if !entries.is_empty() {
            tracing::trace!(entries = entries.len(), "flushed state tree changes");
        }

        ChangeBatch::new(entries)
    }

    /// Every attached node from empty, ascending by id. Pending changes are
    /// left untouched.
    pub fn snapshot(&self) -> Vec<ChangeEntry> {
        let mut out = Vec::new();
        for (id, node) in &self.nodes {
            if !node.is_attached() {
                continue;
            }

            if *id == NodeId::ROOT {
                for feature in FeatureKind::ALL {
                    if let Some(feature) = node.feature(feature) {
                        feature.generate_from_empty(*id, &mut out);
                    }
                }
            } else {
                node.generate_from_empty(&mut out);
            }
        }
        out
    }

    /// Pre-order walk of `root` and its descendants.
    pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut visited = Vec::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            visited.push(id);
            stack.extend(node.children().iter().rev().copied());
        }

        visited
    }

    fn is_ancestor_or_self(&self, candidate: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == candidate {
                return true;
            }
            match self.nodes.get(&node).and_then(StateNode::parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    fn live_node(&self, id: NodeId) -> Result<&StateNode, StateError> {
        let node = self.nodes.get(&id).ok_or(StateError::UnknownNode(id))?;
        if node.status() == NodeStatus::Detached {
            return Err(StateError::DetachedNode(id));
        }
        Ok(node)
    }

    fn live_node_mut(&mut self, id: NodeId) -> Result<&mut StateNode, StateError> {
        let node = self.nodes.get_mut(&id).ok_or(StateError::UnknownNode(id))?;
        if node.status() == NodeStatus::Detached {
            return Err(StateError::DetachedNode(id));
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeOp;
    use serde_json::json;

    fn attached_child(tree: &mut StateTree) -> NodeId {
        let child = tree.create_node();
        tree.append_child(tree.root(), child).expect("attach child");
        child
    }

    #[test]
    fn root_is_attached_and_announced() {
        let tree = StateTree::new();
        assert!(tree.is_attached(NodeId::ROOT));
        assert!(tree.collect_changes().is_empty());
    }

    #[test]
    fn client_reported_property_is_not_echoed() {
        let mut tree = StateTree::new();
        let input = attached_child(&mut tree);
        tree.set_property(input, "value", json!("a")).expect("set");
        tree.flush();

        tree.sync_property(input, "value", json!("typed"))
            .expect("sync");
        assert!(tree.flush().is_empty());
        assert_eq!(tree.property(input, "value"), Ok(Some(&json!("typed"))));

        tree.sync_property(input, "value", json!("typed again"))
            .expect("sync");
        tree.set_property(input, "value", json!("server"))
            .expect("set");
        let entries = tree.flush().into_entries();
        assert_eq!(
            entries,
            vec![ChangeEntry::put(input, "value", json!("server"))]
        );
    }

    #[test]
    fn ids_are_strictly_increasing_and_not_reused() {
        let mut tree = StateTree::new();
        let first = attached_child(&mut tree);
        tree.flush();
        tree.detach_child(tree.root(), first).expect("detach");
        tree.flush();

        let second = tree.create_node();
        assert!(second > first);
        assert!(!tree.contains(first));
    }

    #[test]
    fn coalesces_writes_to_single_put() {
        let mut tree = StateTree::new();
        let node = attached_child(&mut tree);
        tree.flush();

        tree.set_property(node, "value", json!("a")).expect("set a");
        tree.set_property(node, "value", json!("b")).expect("set b");

        let batch = tree.flush();
        assert_eq!(batch.entries(), &[ChangeEntry::put(node, "value", json!("b"))]);
        assert!(tree.flush().is_empty());
    }

    #[test]
    fn unchanged_write_records_nothing() {
        let mut tree = StateTree::new();
        let node = attached_child(&mut tree);
        tree.set_property(node, "value", json!("a")).expect("set");
        tree.flush();

        tree.set_property(node, "value", json!("a")).expect("set again");
        assert!(!tree.has_pending_changes());
    }

    #[test]
    fn newly_attached_node_is_sent_from_empty() {
        let mut tree = StateTree::new();
        let node = tree.create_node();
        tree.set_property(node, "tag", json!("div")).expect("set");
        tree.add_event_listener(node, "click").expect("listen");
        tree.append_child(tree.root(), node).expect("attach");

        let batch = tree.flush();
        assert_eq!(
            batch.entries(),
            &[
                ChangeEntry::attach_child(NodeId::ROOT, 0, node),
                ChangeEntry::attach(node),
                ChangeEntry::put(node, "tag", json!("div")),
                ChangeEntry::listener_add(node, "click"),
            ]
        );
    }

    #[test]
    fn attach_then_detach_in_one_window_cancels() {
        let mut tree = StateTree::new();
        let node = tree.create_node();
        tree.append_child(tree.root(), node).expect("attach");
        tree.set_property(node, "value", json!(1)).expect("set");
        tree.detach_child(tree.root(), node).expect("detach");

        assert!(tree.flush().is_empty());
        assert!(!tree.contains(node));
    }

    #[test]
    fn detaching_announced_subtree_unregisters_every_node() {
        let mut tree = StateTree::new();
        let child = attached_child(&mut tree);
        let grandchild = tree.create_node();
        tree.append_child(child, grandchild).expect("attach grandchild");
        tree.flush();

        tree.detach_child(tree.root(), child).expect("detach");
        let ops: Vec<_> = tree
            .flush()
            .into_entries()
            .into_iter()
            .map(|entry| (entry.node, entry.op))
            .collect();

        assert_eq!(
            ops,
            vec![
                (NodeId::ROOT, ChangeOp::DetachChild { child }),
                (child, ChangeOp::Detach),
                (grandchild, ChangeOp::Detach),
            ]
        );
        assert!(!tree.contains(grandchild));
    }

    #[test]
    fn lifecycle_is_reported_bottom_up_for_attached_nodes_only() {
        let mut tree = StateTree::new();
        let panel = tree.create_node();
        let label = tree.create_node();
        tree.append_child(panel, label).expect("attach label");
        assert!(tree.take_lifecycle().is_empty());

        tree.append_child(tree.root(), panel).expect("attach panel");
        assert_eq!(
            tree.take_lifecycle(),
            vec![Lifecycle::Attached(label), Lifecycle::Attached(panel)]
        );

        let loose = tree.create_node();
        let loose_child = tree.create_node();
        tree.append_child(loose, loose_child).expect("attach loose");
        tree.detach_child(loose, loose_child).expect("detach loose");
        tree.detach_child(tree.root(), panel).expect("detach panel");
        assert_eq!(
            tree.take_lifecycle(),
            vec![Lifecycle::Detached(label), Lifecycle::Detached(panel)]
        );
    }

    #[test]
    fn mutating_detached_node_fails() {
        let mut tree = StateTree::new();
        let node = attached_child(&mut tree);
        tree.detach_child(tree.root(), node).expect("detach");

        assert_eq!(
            tree.set_property(node, "value", json!(1)),
            Err(StateError::DetachedNode(node))
        );

        tree.flush();
        assert_eq!(
            tree.set_property(node, "value", json!(1)),
            Err(StateError::UnknownNode(node))
        );
    }

    #[test]
    fn attach_rejects_cycles_and_double_attach() {
        let mut tree = StateTree::new();
        let parent = tree.create_node();
        let child = tree.create_node();
        tree.append_child(parent, child).expect("attach");

        assert_eq!(
            tree.append_child(child, parent),
            Err(StateError::Cycle { parent: child, child: parent })
        );
        assert_eq!(
            tree.append_child(tree.root(), child),
            Err(StateError::AlreadyAttached(child))
        );
        assert_eq!(
            tree.append_child(tree.root(), tree.root()),
            Err(StateError::AlreadyAttached(NodeId::ROOT))
        );
        let extra = tree.create_node();
        assert_eq!(
            tree.attach_child(parent, 5, extra),
            Err(StateError::IndexOutOfBounds {
                parent,
                index: 5,
                len: 1
            })
        );
    }

    #[test]
    fn flush_visits_nodes_in_ascending_id_order() {
        let mut tree = StateTree::new();
        let a = attached_child(&mut tree);
        let b = attached_child(&mut tree);
        tree.flush();

        tree.set_property(b, "x", json!(1)).expect("set b");
        tree.set_property(a, "x", json!(2)).expect("set a");

        let nodes: Vec<_> = tree.flush().entries().iter().map(|entry| entry.node).collect();
        assert_eq!(nodes, vec![a, b]);
    }

    #[test]
    fn unattached_mutations_stay_out_of_the_dirty_set() {
        let mut tree = StateTree::new();
        let node = tree.create_node();
        tree.set_property(node, "value", json!(1)).expect("set");
        assert!(!tree.has_pending_changes());
    }

    #[test]
    fn snapshot_covers_only_attached_nodes() {
        let mut tree = StateTree::new();
        tree.set_property(tree.root(), "title", json!("home")).expect("set root");
        let child = attached_child(&mut tree);
        let _loose = tree.create_node();

        let snapshot = tree.snapshot();
        assert_eq!(
            snapshot,
            vec![
                ChangeEntry::put(NodeId::ROOT, "title", json!("home")),
                ChangeEntry::attach_child(NodeId::ROOT, 0, child),
                ChangeEntry::attach(child),
            ]
        );
    }

    #[test]
    fn get_or_create_feature_is_lazy() {
        let mut tree = StateTree::new();
        let node = attached_child(&mut tree);
        assert!(tree.feature(node, FeatureKind::Listeners).expect("live").is_none());

        let feature = tree
            .get_or_create_feature(node, FeatureKind::Properties)
            .expect("feature");
        if let Some(map) = feature.as_properties_mut() {
            map.set("value", json!("x"));
        }
        assert_eq!(tree.property(node, "value").expect("live"), Some(&json!("x")));
    }
}
