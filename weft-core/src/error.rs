use crate::node::{NodeCategory, NodeKey};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("node {0} not found")]
    NodeNotFound(NodeKey),

    #[error("node {key} is not a {expected} node")]
    WrongKind { key: NodeKey, expected: NodeCategory },

    #[error("node type '{0}' is not registered")]
    UnknownType(String),

    #[error("node type '{node_type}' is registered as {registered}, not {requested}")]
    CategoryMismatch {
        node_type: String,
        registered: NodeCategory,
        requested: NodeCategory,
    },

    #[error("node {0} is already attached to a parent")]
    AlreadyAttached(NodeKey),

    #[error("the root node cannot be detached")]
    RootDetach,

    #[error("tree integrity violated at {key}: {reason}")]
    Integrity { key: NodeKey, reason: String },
}
