//! Synchronization between the local editor tree and a `yrs` document.
//!
//! Every local node is paired with a shadow node that owns handles to its
//! replica map. Local updates are diffed into the replica through
//! [`Binding::sync_local_update`]; replica changes observed from peers are
//! replayed onto the editor with [`Binding::sync_replica_to_local`].

mod binding;
mod cursor;
mod events;
mod from_replica;
mod props;
mod shadow;
pub mod text_merge;
mod to_replica;

pub use binding::{Binding, BindingConfig};
pub use cursor::{ReplicaCursor, ReplicaPoint, SelectionRecovery};
pub use events::{ChildDelta, PathStep, ReplicaChange, ReplicaEvent};
pub use from_replica::ReplicaPassStats;
pub use shadow::{ShadowId, ShadowKind, ShadowNode};
pub use text_merge::{diff, TextEdit};

use crate::error::CoreError;
use thiserror::Error;

// Reserved top-level replica types.
pub const ROOT_MAP: &str = "root";
pub const ROOT_PROPS: &str = "root.props";
pub const ROOT_CHILDREN: &str = "root.children";

// Node map keys.
pub(crate) const KEY_TYPE: &str = "type";
pub(crate) const KEY_CATEGORY: &str = "category";
pub(crate) const KEY_UID: &str = "uid";
pub(crate) const KEY_PROPS: &str = "props";
pub(crate) const KEY_CHILDREN: &str = "children";
pub(crate) const KEY_TEXT: &str = "text";
pub(crate) const KEY_AUTHOR: &str = "author";

pub(crate) const ROOT_UID: &str = "root";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("unexpected replica event: {0}")]
    UnexpectedEvent(String),

    #[error("replica node map is missing '{0}'")]
    MissingAttribute(&'static str),

    #[error("unknown node category '{0}'")]
    UnknownCategory(String),

    #[error("failed to decode replica update: {0}")]
    Decode(String),

    #[error("failed to apply replica update: {0}")]
    Apply(String),

    #[error("binding diverged from the editor after an earlier failure; a full resync is required")]
    ResyncRequired,
}

#[cfg(test)]
mod tests;
