//! Client-side mirror of the state tree, built only from applied changes.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value, json};

use crate::change::{ChangeEntry, ChangeOp};
use crate::error::ProtocolError;
use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub properties: BTreeMap<String, Value>,
    pub children: Vec<NodeId>,
    pub listeners: BTreeSet<String>,
}

impl MirrorNode {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            properties: BTreeMap::new(),
            children: Vec::new(),
            listeners: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorTree {
    nodes: BTreeMap<NodeId, MirrorNode>,
}

impl Default for MirrorTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(NodeId::ROOT, MirrorNode::new(NodeId::ROOT));
        Self { nodes }
    }

    pub fn node(&self, id: NodeId) -> Option<&MirrorNode> {
        self.nodes.get(&id)
    }

    pub fn property(&self, id: NodeId, key: &str) -> Option<&Value> {
        self.node(id).and_then(|node| node.properties.get(key))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Back to a lone root, ready for a snapshot.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Applies one message worth of changes and returns the nodes touched.
    ///
    /// Node registrations are processed first and unregistrations last, so
    /// the entries of a batch may reference nodes introduced later in it.
    /// A failed batch leaves the tree partially updated; callers resync.
    pub fn apply(
        &mut self,
        changes: &[ChangeEntry],
    ) -> Result<BTreeSet<NodeId>, ProtocolError> {
        let mut updated = BTreeSet::new();

        for entry in changes {
            if entry.op == ChangeOp::Attach {
                if self.nodes.contains_key(&entry.node) {
                    return Err(ProtocolError::DuplicateNode { node: entry.node });
                }
                self.nodes.insert(entry.node, MirrorNode::new(entry.node));
                updated.insert(entry.node);
            }
        }

        for entry in changes {
            match &entry.op {
                ChangeOp::Attach | ChangeOp::Detach => continue,
                ChangeOp::AttachChild { index, child } => {
                    self.attach_child(entry.node, *index, *child)?;
                }
                ChangeOp::DetachChild { child } => {
                    self.detach_child(entry.node, *child)?;
                }
                op => {
                    let node = self
                        .nodes
                        .get_mut(&entry.node)
                        .ok_or(ProtocolError::UnknownNode { node: entry.node })?;
                    apply_feature_op(node, op);
                }
            }
            updated.insert(entry.node);
        }

        for entry in changes {
            if entry.op == ChangeOp::Detach {
                if self.nodes.remove(&entry.node).is_none() {
                    return Err(ProtocolError::UnknownNode { node: entry.node });
                }
                updated.remove(&entry.node);
            }
        }

        Ok(updated)
    }

    /// Nested JSON rendering of the attached tree, for logs and tests.
    pub fn debug_json(&self) -> Value {
        self.node_json(NodeId::ROOT)
    }

    fn node_json(&self, id: NodeId) -> Value {
        let Some(node) = self.nodes.get(&id) else {
            return Value::Null;
        };

        let properties: Map<String, Value> = node
            .properties
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let children: Vec<Value> = node
            .children
            .iter()
            .map(|child| self.node_json(*child))
            .collect();

        json!({
            "id": id,
            "properties": properties,
            "listeners": node.listeners,
            "children": children,
        })
    }

    fn attach_child(
        &mut self,
        parent: NodeId,
        index: usize,
        child: NodeId,
    ) -> Result<(), ProtocolError> {
        if !self.nodes.contains_key(&parent) {
            return Err(ProtocolError::UnknownParent { parent, child });
        }

        let child_node = self
            .nodes
            .get_mut(&child)
            .ok_or(ProtocolError::UnknownNode { node: child })?;
        if let Some(existing) = child_node.parent {
            return Err(ProtocolError::AlreadyChild {
                parent: existing,
                child,
            });
        }
        child_node.parent = Some(parent);

        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(ProtocolError::UnknownParent { parent, child })?;
        let len = parent_node.children.len();
        if index > len {
            return Err(ProtocolError::ChildIndex { parent, index, len });
        }
        parent_node.children.insert(index, child);
        Ok(())
    }

    fn detach_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), ProtocolError> {
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(ProtocolError::UnknownParent { parent, child })?;
        let index = parent_node
            .children
            .iter()
            .position(|candidate| *candidate == child)
            .ok_or(ProtocolError::MissingChild { parent, child })?;
        parent_node.children.remove(index);

        if let Some(child_node) = self.nodes.get_mut(&child) {
            child_node.parent = None;
        }
        Ok(())
    }
}

fn apply_feature_op(node: &mut MirrorNode, op: &ChangeOp) {
    match op {
        ChangeOp::Put { key, value } => {
            node.properties.insert(key.clone(), value.clone());
        }
        ChangeOp::Remove { key } => {
            node.properties.remove(key);
        }
        ChangeOp::ListenerAdd { event } => {
            node.listeners.insert(event.clone());
        }
        ChangeOp::ListenerRemove { event } => {
            node.listeners.remove(event);
        }
        ChangeOp::Attach
        | ChangeOp::Detach
        | ChangeOp::AttachChild { .. }
        | ChangeOp::DetachChild { .. } => {}
    }
}
