//! Local editor tree and its synchronization with a replicated CRDT document.

pub mod collab;
pub mod editor;
pub mod error;
pub mod node;
pub mod offset;
pub mod selection;
pub mod state;

pub use editor::{DirtySet, Editor, EditorUpdate, UpdateRecord, COLLABORATION_TAG, HISTORIC_TAG};
pub use error::CoreError;
pub use node::{Node, NodeCategory, NodeKey, NodeKind, NodeTypes, Props};
pub use offset::OffsetView;
pub use selection::{end_of_document, select_end, Point, PointKind, RangeSelection};
pub use state::EditorState;
