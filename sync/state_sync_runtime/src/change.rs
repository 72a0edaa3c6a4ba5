use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::{FeatureKind, NodeId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    Attach,
    Detach,
    Put { key: String, value: Value },
    Remove { key: String },
    AttachChild { index: usize, child: NodeId },
    DetachChild { child: NodeId },
    ListenerAdd { event: String },
    ListenerRemove { event: String },
}

impl ChangeOp {
    pub fn feature(&self) -> Option<FeatureKind> {
        match self {
            ChangeOp::Attach | ChangeOp::Detach => None,
            ChangeOp::Put { .. } | ChangeOp::Remove { .. } => Some(FeatureKind::Properties),
            ChangeOp::AttachChild { .. } | ChangeOp::DetachChild { .. } => {
                Some(FeatureKind::Children)
            }
            ChangeOp::ListenerAdd { .. } | ChangeOp::ListenerRemove { .. } => {
                Some(FeatureKind::Listeners)
            }
        }
    }
}

/// One pending mutation as it travels on the wire:
/// `{"node":5,"feature":"properties","op":"put","key":"value","value":"b"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub node: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<FeatureKind>,
    #[serde(flatten)]
    pub op: ChangeOp,
}

impl ChangeEntry {
    pub fn new(node: NodeId, op: ChangeOp) -> Self {
        Self {
            node,
            feature: op.feature(),
            op,
        }
    }

    pub fn attach(node: NodeId) -> Self {
        Self::new(node, ChangeOp::Attach)
    }

    pub fn detach(node: NodeId) -> Self {
        Self::new(node, ChangeOp::Detach)
    }

    pub fn put(node: NodeId, key: impl Into<String>, value: Value) -> Self {
        Self::new(
            node,
            ChangeOp::Put {
                key: key.into(),
                value,
            },
        )
    }

    pub fn remove(node: NodeId, key: impl Into<String>) -> Self {
        Self::new(node, ChangeOp::Remove { key: key.into() })
    }

    pub fn attach_child(node: NodeId, index: usize, child: NodeId) -> Self {
        Self::new(node, ChangeOp::AttachChild { index, child })
    }

    pub fn detach_child(node: NodeId, child: NodeId) -> Self {
        Self::new(node, ChangeOp::DetachChild { child })
    }

    pub fn listener_add(node: NodeId, event: impl Into<String>) -> Self {
        Self::new(
            node,
            ChangeOp::ListenerAdd {
                event: event.into(),
            },
        )
    }

    pub fn listener_remove(node: NodeId, event: impl Into<String>) -> Self {
        Self::new(
            node,
            ChangeOp::ListenerRemove {
                event: event.into(),
            },
        )
    }
}

/// Output of one flush: entries grouped by node in ascending id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    entries: Vec<ChangeEntry>,
}

impl ChangeBatch {
    pub fn new(entries: Vec<ChangeEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ChangeEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.entries.iter().map(|entry| entry.node).collect()
    }

    pub fn for_node(&self, node: NodeId) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(move |entry| entry.node == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_entry_wire_shape() {
        let entry = ChangeEntry::put(NodeId::new(5), "value", json!("b"));
        let value = serde_json::to_value(&entry).expect("encode entry");
        assert_eq!(
            value,
            json!({"node": 5, "feature": "properties", "op": "put", "key": "value", "value": "b"})
        );
    }

    #[test]
    fn lifecycle_entries_have_no_feature() {
        let value = serde_json::to_value(ChangeEntry::attach(NodeId::new(7))).expect("encode");
        assert_eq!(value, json!({"node": 7, "op": "attach"}));
    }

    #[test]
    fn decodes_attach_child_entry() {
        let raw = br#"{"node":1,"feature":"children","op":"attach_child","index":0,"child":4}"#;
        let entry: ChangeEntry = serde_json::from_slice(raw).expect("decode entry");
        assert_eq!(entry, ChangeEntry::attach_child(NodeId::ROOT, 0, NodeId::new(4)));
    }
}
