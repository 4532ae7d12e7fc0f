use std::sync::Arc;
use yrs::types::{Change, Event, PathSegment};
use yrs::TransactionMut;

/// One step from the root children sequence down to the changed type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Key(Arc<str>),
    Index(u32),
}

impl From<&PathSegment> for PathStep {
    fn from(segment: &PathSegment) -> Self {
        match segment {
            PathSegment::Key(key) => PathStep::Key(key.clone()),
            PathSegment::Index(index) => PathStep::Index(*index),
        }
    }
}

/// A child sequence change. Inserted maps are read back from the sequence
/// when the event is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildDelta {
    Retain(u32),
    Delete(u32),
    Insert(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaChange {
    /// Keys of a node map or its props map changed.
    Props { changed_keys: usize },
    Text,
    Children(Vec<ChildDelta>),
    Unsupported,
}

/// Owned copy of a replica change notification, kept until the next
/// replica to local pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaEvent {
    pub path: Vec<PathStep>,
    pub change: ReplicaChange,
    /// Set for changes of the reserved root props map.
    pub root_props: bool,
}

impl ReplicaEvent {
    pub(crate) fn capture(txn: &TransactionMut, event: &Event) -> Self {
        let path = event.path().iter().map(PathStep::from).collect();
        let change = match event {
            Event::Text(_) => ReplicaChange::Text,
            Event::Map(e) => ReplicaChange::Props { changed_keys: e.keys(txn).len() },
            Event::Array(e) => ReplicaChange::Children(
                e.delta(txn)
                    .iter()
                    .map(|change| match change {
                        Change::Added(values) => ChildDelta::Insert(values.len() as u32),
                        Change::Removed(len) => ChildDelta::Delete(*len),
                        Change::Retain(len) => ChildDelta::Retain(*len),
                    })
                    .collect(),
            ),
            _ => ReplicaChange::Unsupported,
        };
        Self { path, change, root_props: false }
    }

    pub(crate) fn root_props(changed_keys: usize) -> Self {
        Self {
            path: Vec::new(),
            change: ReplicaChange::Props { changed_keys },
            root_props: true,
        }
    }
}
