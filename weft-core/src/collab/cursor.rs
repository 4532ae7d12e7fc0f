use super::binding::Binding;
use crate::editor::EditorUpdate;
use crate::node::NodeKind;
use crate::offset::OffsetView;
use crate::selection::{select_end, Point, RangeSelection};
use crate::state::EditorState;
use serde::{Deserialize, Serialize};

/// A selection point expressed through replica identity, so it can be
/// shared with peers and survive local key changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaPoint {
    pub uid: String,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCursor {
    pub anchor: ReplicaPoint,
    pub focus: ReplicaPoint,
}

/// How the selection was handled after a replica to local pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionRecovery {
    NoSelection,
    Valid,
    Remapped,
    FromCursor,
    DocumentEnd,
}

impl Binding {
    /// The last cursor captured for this session.
    pub fn cursor(&self) -> Option<&ReplicaCursor> {
        self.cursor.as_ref()
    }

    pub fn set_cursor(&mut self, cursor: Option<ReplicaCursor>) {
        self.cursor = cursor;
    }

    /// Stores the selection as a replica cursor. Points on nodes without a
    /// shadow clear the cursor.
    pub fn capture_cursor(&mut self, selection: Option<&RangeSelection>) {
        self.cursor = selection.and_then(|s| {
            Some(ReplicaCursor { anchor: self.replica_point(&s.anchor)?, focus: self.replica_point(&s.focus)? })
        });
    }

    fn replica_point(&self, point: &Point) -> Option<ReplicaPoint> {
        let uid = self.uid_of(point.key)?;
        Some(ReplicaPoint { uid: uid.to_string(), offset: point.offset as u32 })
    }

    /// Resolves a replica point against a local state.
    pub fn resolve_point(&self, state: &EditorState, point: &ReplicaPoint) -> Option<Point> {
        let key = self.key_of(&point.uid)?;
        let node = state.get(key)?;
        let offset = point.offset as usize;
        let resolved = match node.kind {
            NodeKind::Text { .. } => Point::text(key, offset),
            NodeKind::Element { .. } => Point::element(key, offset),
            NodeKind::LineBreak | NodeKind::Decorator => return None,
        };
        resolved.is_valid_in(state).then_some(resolved)
    }

    pub fn resolve_cursor(&self, state: &EditorState, cursor: &ReplicaCursor) -> Option<RangeSelection> {
        Some(RangeSelection::new(
            self.resolve_point(state, &cursor.anchor)?,
            self.resolve_point(state, &cursor.focus)?,
        ))
    }

    /// Repairs a selection left pointing at removed or shortened nodes.
    ///
    /// The previous selection is carried through document offsets first,
    /// then the last captured cursor is tried, and finally the caret goes
    /// to the end of the document.
    pub fn recover_selection(&mut self, update: &mut EditorUpdate<'_>) -> SelectionRecovery {
        let Some(selection) = update.selection().copied() else {
            return SelectionRecovery::NoSelection;
        };
        if !selection.needs_recovery(update.state()) {
            self.capture_cursor(Some(&selection));
            return SelectionRecovery::Valid;
        }

        let remapped = update.prev_state().selection().and_then(|prev| {
            let (anchor, focus) = OffsetView::new(update.prev_state()).offsets_from_selection(prev)?;
            OffsetView::new(update.state()).selection_from_offsets(anchor, focus)
        });

        let outcome = match remapped {
            Some(next) if !next.needs_recovery(update.state()) => {
                update.set_selection(Some(next));
                SelectionRecovery::Remapped
            }
            _ => match self.cursor.as_ref().and_then(|c| self.resolve_cursor(update.state(), c)) {
                Some(next) => {
                    update.set_selection(Some(next));
                    SelectionRecovery::FromCursor
                }
                None => {
                    log::debug!("selection could not be mapped, moving caret to the document end");
                    update.set_selection(Some(select_end(update.state())));
                    SelectionRecovery::DocumentEnd
                }
            },
        };
        let selection = update.selection().copied();
        self.capture_cursor(selection.as_ref());
        outcome
    }
}
