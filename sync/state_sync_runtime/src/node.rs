//! State nodes and their features.
//!
//! A node owns at most one instance of each [`FeatureKind`]. Features keep
//! their current value together with whatever is needed to describe the
//! difference from what the client last saw.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::ChangeEntry;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(1);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Properties,
    Children,
    Listeners,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 3] = [
        FeatureKind::Properties,
        FeatureKind::Children,
        FeatureKind::Listeners,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unattached,
    Attached,
    Detached,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeFeature {
    Properties(PropertyMap),
    Children(ChildList),
    Listeners(ListenerSet),
}

impl NodeFeature {
    pub fn new(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Properties => NodeFeature::Properties(PropertyMap::default()),
            FeatureKind::Children => NodeFeature::Children(ChildList::default()),
            FeatureKind::Listeners => NodeFeature::Listeners(ListenerSet::default()),
        }
    }

    pub fn kind(&self) -> FeatureKind {
        match self {
            NodeFeature::Properties(_) => FeatureKind::Properties,
            NodeFeature::Children(_) => FeatureKind::Children,
            NodeFeature::Listeners(_) => FeatureKind::Listeners,
        }
    }

    pub fn as_properties(&self) -> Option<&PropertyMap> {
        match self {
            NodeFeature::Properties(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_properties_mut(&mut self) -> Option<&mut PropertyMap> {
        match self {
            NodeFeature::Properties(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_children(&self) -> Option<&ChildList> {
        match self {
            NodeFeature::Children(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_listeners(&self) -> Option<&ListenerSet> {
        match self {
            NodeFeature::Listeners(set) => Some(set),
            _ => None,
        }
    }

    pub(crate) fn collect_changes(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        match self {
            NodeFeature::Properties(map) => map.collect_changes(node, out),
            NodeFeature::Children(list) => list.collect_changes(node, out),
            NodeFeature::Listeners(set) => set.collect_changes(node, out),
        }
    }

    pub(crate) fn generate_from_empty(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        match self {
            NodeFeature::Properties(map) => map.generate_from_empty(node, out),
            NodeFeature::Children(list) => list.generate_from_empty(node, out),
            NodeFeature::Listeners(set) => set.generate_from_empty(node, out),
        }
    }

    pub(crate) fn clear_changes(&mut self) {
        match self {
            NodeFeature::Properties(map) => map.pending.clear(),
            NodeFeature::Children(list) => list.known = None,
            NodeFeature::Listeners(set) => set.pending.clear(),
        }
    }
}

/// Element properties. Pending entries hold the value each key had when it
/// was first touched in the current flush window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    values: BTreeMap<String, Value>,
    pending: BTreeMap<String, Option<Value>>,
}

impl PropertyMap {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns `false` when the stored value already equals `value`.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if self.values.get(&key) == Some(&value) {
            return false;
        }

        let previous = self.values.insert(key.clone(), value);
        self.pending.entry(key).or_insert(previous);
        true
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(previous) = self.values.remove(key) else {
            return false;
        };

        self.pending
            .entry(key.to_string())
            .or_insert(Some(previous));
        true
    }

    /// Stores a value the client reported itself, so it is not echoed back.
    pub(crate) fn accept_client_value(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.pending.insert(key.clone(), Some(value.clone()));
        self.values.insert(key, value);
    }

    fn collect_changes(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        for (key, original) in &self.pending {
            let current = self.values.get(key);
            if current == original.as_ref() {
                continue;
            }

            match current {
                Some(value) => out.push(ChangeEntry::put(node, key.clone(), value.clone())),
                None => out.push(ChangeEntry::remove(node, key.clone())),
            }
        }
    }

    fn generate_from_empty(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        for (key, value) in &self.values {
            out.push(ChangeEntry::put(node, key.clone(), value.clone()));
        }
    }
}

/// Ordered children. `known` is the list as the client saw it at the start
/// of the flush window, captured on the first structural change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildList {
    children: Vec<NodeId>,
    known: Option<Vec<NodeId>>,
}

impl ChildList {
    pub fn get(&self, index: usize) -> Option<NodeId> {
        self.children.get(index).copied()
    }

    pub fn position(&self, child: NodeId) -> Option<usize> {
        self.children.iter().position(|candidate| *candidate == child)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn insert(&mut self, index: usize, child: NodeId) {
        self.capture_known();
        self.children.insert(index, child);
    }

    pub(crate) fn remove(&mut self, child: NodeId) -> Option<usize> {
        let index = self.position(child)?;
        self.capture_known();
        self.children.remove(index);
        Some(index)
    }

    fn capture_known(&mut self) {
        if self.known.is_none() {
            self.known = Some(self.children.clone());
        }
    }

    // Children are never moved while attached, so retained children keep
    // their relative order and removals followed by ordered insertions
    // reproduce the current list exactly.
    fn collect_changes(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        let Some(known) = &self.known else {
            return;
        };

        for child in known {
            if !self.children.contains(child) {
                out.push(ChangeEntry::detach_child(node, *child));
            }
        }

        for (index, child) in self.children.iter().enumerate() {
            if !known.contains(child) {
                out.push(ChangeEntry::attach_child(node, index, *child));
            }
        }
    }

    fn generate_from_empty(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        for (index, child) in self.children.iter().enumerate() {
            out.push(ChangeEntry::attach_child(node, index, *child));
        }
    }
}

/// Event types the client must report for a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListenerSet {
    events: BTreeSet<String>,
    pending: BTreeMap<String, bool>,
}

impl ListenerSet {
    pub fn contains(&self, event: &str) -> bool {
        self.events.contains(event)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.events.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn add(&mut self, event: &str) -> bool {
        if !self.events.insert(event.to_string()) {
            return false;
        }
        self.pending.entry(event.to_string()).or_insert(false);
        true
    }

    pub(crate) fn remove(&mut self, event: &str) -> bool {
        if !self.events.remove(event) {
            return false;
        }
        self.pending.entry(event.to_string()).or_insert(true);
        true
    }

    fn collect_changes(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        for (event, was_present) in &self.pending {
            let present = self.events.contains(event);
            if present == *was_present {
                continue;
            }

            if present {
                out.push(ChangeEntry::listener_add(node, event.clone()));
            } else {
                out.push(ChangeEntry::listener_remove(node, event.clone()));
            }
        }
    }

    fn generate_from_empty(&self, node: NodeId, out: &mut Vec<ChangeEntry>) {
        for event in &self.events {
            out.push(ChangeEntry::listener_add(node, event.clone()));
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateNode {
    id: NodeId,
    parent: Option<NodeId>,
    status: NodeStatus,
    announced: bool,
    features: BTreeMap<FeatureKind, NodeFeature>,
}

impl StateNode {
    pub(crate) fn new(id: NodeId, status: NodeStatus) -> Self {
        Self {
            id,
            parent: None,
            status,
            announced: false,
            features: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn is_attached(&self) -> bool {
        self.status == NodeStatus::Attached
    }

    pub fn feature(&self, kind: FeatureKind) -> Option<&NodeFeature> {
        self.features.get(&kind)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.feature(FeatureKind::Properties)
            .and_then(NodeFeature::as_properties)
            .and_then(|map| map.get(key))
    }

    pub fn children(&self) -> &[NodeId] {
        match self.feature(FeatureKind::Children) {
            Some(NodeFeature::Children(list)) => &list.children,
            _ => &[],
        }
    }

    pub fn has_listener(&self, event: &str) -> bool {
        self.feature(FeatureKind::Listeners)
            .and_then(NodeFeature::as_listeners)
            .is_some_and(|set| set.contains(event))
    }

    pub(crate) fn feature_mut(&mut self, kind: FeatureKind) -> &mut NodeFeature {
        self.features
            .entry(kind)
            .or_insert_with(|| NodeFeature::new(kind))
    }

    pub(crate) fn properties_mut(&mut self) -> &mut PropertyMap {
        match self.feature_mut(FeatureKind::Properties) {
            NodeFeature::Properties(map) => map,
            _ => unreachable!("properties slot holds another feature"),
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut ChildList {
        match self.feature_mut(FeatureKind::Children) {
            NodeFeature::Children(list) => list,
            _ => unreachable!("children slot holds another feature"),
        }
    }

    pub(crate) fn listeners_mut(&mut self) -> &mut ListenerSet {
        match self.feature_mut(FeatureKind::Listeners) {
            NodeFeature::Listeners(set) => set,
            _ => unreachable!("listeners slot holds another feature"),
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<NodeId>) {
        self.parent = parent;
    }

    pub(crate) fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub(crate) fn is_announced(&self) -> bool {
        self.announced
    }

    pub(crate) fn mark_announced(&mut self) {
        self.announced = true;
    }

    pub(crate) fn collect_changes(&self, out: &mut Vec<ChangeEntry>) {
        for feature in self.features.values() {
            feature.collect_changes(self.id, out);
        }
    }

    pub(crate) fn generate_from_empty(&self, out: &mut Vec<ChangeEntry>) {
        out.push(ChangeEntry::attach(self.id));
        for feature in self.features.values() {
            feature.generate_from_empty(self.id, out);
        }
    }

    pub(crate) fn clear_changes(&mut self) {
        for feature in self.features.values_mut() {
            feature.clear_changes();
        }
    }
}
