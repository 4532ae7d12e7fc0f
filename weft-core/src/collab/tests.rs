use super::*;
use crate::editor::{Editor, EditorUpdate, COLLABORATION_TAG};
use crate::error::CoreError;
use crate::node::{NodeCategory, NodeKey, NodeTypes};
use crate::selection::{Point, RangeSelection};
use serde_json::json;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Transact, Update};

struct Peer {
    editor: Editor,
    binding: Binding,
}

impl Peer {
    fn new() -> Self {
        Self::with_types(NodeTypes::default())
    }

    fn with_types(types: NodeTypes) -> Self {
        let config = BindingConfig::default();
        let doc = config.create_doc();
        Self { editor: Editor::with_types(types), binding: Binding::new(doc, config).unwrap() }
    }

    fn edit<R>(&mut self, f: impl FnOnce(&mut EditorUpdate<'_>) -> Result<R, CoreError>) -> (R, Option<Vec<u8>>) {
        let (value, record) = self.editor.update(&[], f).unwrap();
        let update = self.binding.sync_local_update(&record).unwrap();
        (value, update)
    }

    fn receive(&mut self, update: &[u8]) -> Result<(SelectionRecovery, Option<Vec<u8>>), SyncError> {
        let events = self.binding.apply_update(update)?;
        let binding = &mut self.binding;
        let ((_, recovery), record) = self
            .editor
            .update(&[COLLABORATION_TAG], |u| binding.sync_replica_to_local(u, &events))?;
        let cleanup = self.binding.sync_local_update(&record)?;
        Ok((recovery, cleanup))
    }

    /// Everything this peer has that `other` lacks.
    fn diff_for(&self, other: &Peer) -> Vec<u8> {
        self.binding.encode_diff(&other.binding.encode_state_vector()).unwrap()
    }

    fn json(&self) -> serde_json::Value {
        self.editor.state().to_json()
    }
}

fn paragraph(u: &mut EditorUpdate<'_>, text: &str) -> Result<(NodeKey, NodeKey), CoreError> {
    let p = u.create_element("paragraph")?;
    let t = u.create_text(text)?;
    u.append(p, t)?;
    u.append(NodeKey::ROOT, p)?;
    Ok((p, t))
}

fn assert_converged(a: &Peer, b: &Peer) {
    assert_eq!(a.json(), b.json());
    assert_eq!(a.binding.doc_json(), b.binding.doc_json());
    a.binding.verify(a.editor.state()).unwrap();
    b.binding.verify(b.editor.state()).unwrap();
}

#[test]
fn test_local_insert_reaches_peer() {
    let mut a = Peer::new();
    let mut b = Peer::new();

    let (_, update) = a.edit(|u| paragraph(u, "Hello"));
    b.receive(&update.unwrap()).unwrap();

    assert_converged(&a, &b);
    assert_eq!(b.editor.state().text_content(NodeKey::ROOT), "Hello");
}

#[test]
fn test_unchanged_update_writes_nothing() {
    let mut a = Peer::new();
    a.edit(|u| paragraph(u, "Hello"));
    let (_, update) = a.edit(|u| {
        u.set_selection(None);
        Ok(())
    });
    assert!(update.is_none());
}

#[test]
fn test_text_edit_keeps_identity() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let ((p, t), update) = a.edit(|u| paragraph(u, "Hello world"));
    b.receive(&update.unwrap()).unwrap();

    let uid = a.binding.uid_of(t).unwrap().to_string();
    let remote_key = b.binding.key_of(&uid).unwrap();

    let (_, update) = a.edit(|u| u.splice_text(t, 6, 5, "metaverse"));
    b.receive(&update.unwrap()).unwrap();

    assert_converged(&a, &b);
    assert_eq!(a.binding.uid_of(t), Some(uid.as_str()));
    assert!(a.binding.uid_of(p).is_some());
    assert_eq!(b.binding.key_of(&uid), Some(remote_key));
    assert_eq!(b.editor.state().node(remote_key).unwrap().text(), Some("Hello metaverse"));
}

#[test]
fn test_reorder_and_remove_children() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let (keys, update) = a.edit(|u| {
        let mut keys = Vec::new();
        for text in ["one", "two", "three"] {
            keys.push(paragraph(u, text)?.0);
        }
        Ok(keys)
    });
    b.receive(&update.unwrap()).unwrap();

    let (_, update) = a.edit(|u| {
        u.detach(keys[2])?;
        u.link_after(NodeKey::ROOT, None, keys[2])?;
        u.remove(keys[1])
    });
    b.receive(&update.unwrap()).unwrap();

    assert_converged(&a, &b);
    assert_eq!(b.editor.state().text_content(NodeKey::ROOT), "three\n\none");
}

#[test]
fn test_property_changes() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let ((p, _), update) = a.edit(|u| paragraph(u, "x"));
    b.receive(&update.unwrap()).unwrap();

    let (_, update) = a.edit(|u| u.set_prop(p, "indent", json!(2)));
    b.receive(&update.unwrap()).unwrap();
    assert_converged(&a, &b);
    assert_eq!(b.json()["children"][0]["indent"], json!(2));

    let (_, update) = a.edit(|u| {
        let mut props = u.node(p)?.props.clone();
        props.remove("indent");
        u.set_props(p, props)
    });
    b.receive(&update.unwrap()).unwrap();
    assert_converged(&a, &b);
    assert!(b.json()["children"][0].get("indent").is_none());
}

#[test]
fn test_root_props() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let (_, update) = a.edit(|u| u.set_prop(NodeKey::ROOT, "direction", json!("ltr")));
    b.receive(&update.unwrap()).unwrap();
    assert_eq!(b.json()["direction"], json!("ltr"));
    assert_converged(&a, &b);
}

#[test]
fn test_decorator_round_trip_and_remote_props() {
    let mut types = NodeTypes::default();
    types.register("image", NodeCategory::Decorator);
    let mut a = Peer::with_types(types.clone());
    let mut b = Peer::with_types(types);

    let (image, update) = a.edit(|u| {
        let (p, _) = paragraph(u, "see ")?;
        let image = u.create_decorator("image")?;
        u.set_prop(image, "src", json!("cat.png"))?;
        u.append(p, image)?;
        Ok(image)
    });
    b.receive(&update.unwrap()).unwrap();
    assert_converged(&a, &b);

    let uid = a.binding.uid_of(image).unwrap().to_string();
    let remote_image = b.binding.key_of(&uid).unwrap();
    let node = b.editor.state().node(remote_image).unwrap();
    assert_eq!(node.category(), NodeCategory::Decorator);
    assert_eq!(node.props.get("src"), Some(&json!("cat.png")));

    let (_, update) = b.edit(|u| u.set_prop(remote_image, "width", json!(320)));
    a.receive(&update.unwrap()).unwrap();
    assert_converged(&a, &b);
    assert_eq!(a.editor.state().node(image).unwrap().props.get("width"), Some(&json!(320)));
    assert_eq!(a.binding.uid_of(image), Some(uid.as_str()));

    // A late joiner hydrates the decorator from the replica.
    let mut c = Peer::with_types(a.editor.types().clone());
    c.receive(&a.diff_for(&c)).unwrap();
    assert_converged(&a, &c);
}

#[test]
fn test_concurrent_identical_inserts_merge() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let ((p, _), update) = a.edit(|u| {
        let p = u.create_element("paragraph")?;
        u.append(NodeKey::ROOT, p)?;
        Ok((p, ()))
    });
    b.receive(&update.unwrap()).unwrap();
    let remote_p = b.binding.key_of(a.binding.uid_of(p).unwrap()).unwrap();

    // Both type the same text while disconnected.
    a.edit(|u| {
        let t = u.create_text("Hello world")?;
        u.append(p, t)
    });
    b.edit(|u| {
        let t = u.create_text("Hello world")?;
        u.append(remote_p, t)
    });

    // Each side takes what it missed. Only the session that created the
    // later of the two nodes merges them and sends the merge out.
    let missed = b.diff_for(&a);
    let own = a.diff_for(&b);
    let (_, from_a) = a.receive(&missed).unwrap();
    let (_, from_b) = b.receive(&own).unwrap();
    assert!(from_a.is_some() != from_b.is_some());
    if let Some(cleanup) = from_a {
        assert!(b.receive(&cleanup).unwrap().1.is_none());
    }
    if let Some(cleanup) = from_b {
        assert!(a.receive(&cleanup).unwrap().1.is_none());
    }

    assert_converged(&a, &b);
    assert_eq!(a.editor.state().text_content(NodeKey::ROOT), "Hello worldHello world");
    assert_eq!(a.editor.state().node(p).unwrap().child_count(), 1);
    assert_eq!(b.editor.state().node(remote_p).unwrap().child_count(), 1);
}

#[test]
fn test_edit_inside_concurrently_removed_node() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let ((p, t), update) = a.edit(|u| paragraph(u, "Hello world"));
    b.receive(&update.unwrap()).unwrap();
    let remote_t = b.binding.key_of(a.binding.uid_of(t).unwrap()).unwrap();

    a.edit(|u| u.remove(t));
    b.edit(|u| u.splice_text(remote_t, 11, 0, "!"));

    let missed = b.diff_for(&a);
    let own = a.diff_for(&b);
    a.receive(&missed).unwrap();
    b.receive(&own).unwrap();

    assert_converged(&a, &b);
    assert_eq!(a.editor.state().node(p).unwrap().child_count(), 0);
}

#[test]
fn test_selection_remapped_through_offsets() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let ((p, t), update) = a.edit(|u| paragraph(u, "Hello world"));
    b.receive(&update.unwrap()).unwrap();
    let remote_t = b.binding.key_of(a.binding.uid_of(t).unwrap()).unwrap();
    b.edit(|u| {
        u.set_selection(Some(RangeSelection::collapsed(Point::text(remote_t, 5))));
        Ok(())
    });

    // Replace the text node with an equal one.
    let (_, update) = a.edit(|u| {
        u.remove(t)?;
        let fresh = u.create_text("Hello world")?;
        u.append(p, fresh)
    });
    let (recovery, _) = b.receive(&update.unwrap()).unwrap();

    assert_eq!(recovery, SelectionRecovery::Remapped);
    let selection = b.editor.state().selection().copied().unwrap();
    assert_ne!(selection.anchor.key, remote_t);
    assert_eq!(selection.anchor.offset, 5);
    assert!(!selection.needs_recovery(b.editor.state()));
}

#[test]
fn test_selection_falls_back_to_document_end() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let ((p, t), update) = a.edit(|u| paragraph(u, "abc"));
    b.receive(&update.unwrap()).unwrap();
    let remote_t = b.binding.key_of(a.binding.uid_of(t).unwrap()).unwrap();
    b.edit(|u| {
        u.set_selection(Some(RangeSelection::collapsed(Point::text(remote_t, 3))));
        Ok(())
    });

    let (_, update) = a.edit(|u| u.remove(p));
    let (recovery, _) = b.receive(&update.unwrap()).unwrap();

    assert_eq!(recovery, SelectionRecovery::DocumentEnd);
    assert_eq!(
        b.editor.state().selection().copied(),
        Some(RangeSelection::collapsed(Point::element(NodeKey::ROOT, 0)))
    );
}

#[test]
fn test_valid_selection_is_left_alone() {
    let mut a = Peer::new();
    let mut b = Peer::new();
    let ((_, t), update) = a.edit(|u| paragraph(u, "abc"));
    b.receive(&update.unwrap()).unwrap();
    let remote_t = b.binding.key_of(a.binding.uid_of(t).unwrap()).unwrap();
    let caret = RangeSelection::collapsed(Point::text(remote_t, 1));
    b.edit(|u| {
        u.set_selection(Some(caret));
        Ok(())
    });

    let (_, update) = a.edit(|u| u.splice_text(t, 3, 0, "def"));
    let (recovery, _) = b.receive(&update.unwrap()).unwrap();
    assert_eq!(recovery, SelectionRecovery::Valid);
    assert_eq!(b.editor.state().selection().copied(), Some(caret));
    assert_eq!(b.binding.cursor().map(|c| c.anchor.offset), Some(1));
}

#[test]
fn test_hydrate_from_existing_document() {
    let mut a = Peer::new();
    a.edit(|u| {
        paragraph(u, "first")?;
        let h = u.create_element("heading")?;
        u.set_prop(h, "tag", json!("h1"))?;
        let t = u.create_text("title")?;
        let br = u.create_line_break()?;
        let bold = u.create_text("bold")?;
        u.set_prop(bold, "format", json!(1))?;
        u.append(h, t)?;
        u.append(h, br)?;
        u.append(h, bold)?;
        u.append(NodeKey::ROOT, h)
    });

    let config = BindingConfig::default();
    let doc = config.create_doc();
    {
        let state = a.binding.encode_diff(&yrs::StateVector::default().encode_v1()).unwrap();
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(&state).unwrap()).unwrap();
    }
    let mut binding = Binding::new(doc, config).unwrap();
    let mut editor = Editor::new();
    let (_, record) = editor
        .update(&[COLLABORATION_TAG], |u| binding.hydrate(u))
        .unwrap();
    assert!(binding.sync_local_update(&record).unwrap().is_none());

    assert_eq!(editor.state().to_json(), a.json());
    binding.verify(editor.state()).unwrap();
}

#[test]
fn test_full_push_into_empty_replica() {
    let mut editor = Editor::new();
    editor
        .update(&[], |u| paragraph(u, "seed").map(|_| ()))
        .unwrap();
    let config = BindingConfig::default();
    let mut binding = Binding::new(config.create_doc(), config).unwrap();
    let update = binding.sync_full_to_replica(editor.state()).unwrap().unwrap();
    binding.verify(editor.state()).unwrap();

    let mut b = Peer::new();
    b.receive(&update).unwrap();
    assert_eq!(b.json(), editor.state().to_json());
    assert!(matches!(binding.sync_full_to_replica(editor.state()), Err(SyncError::Invariant(_))));
}

#[test]
fn test_unknown_type_requires_resync() {
    let mut a = Peer::new();
    let mut types = NodeTypes::empty();
    types.register("text", NodeCategory::Text);
    let mut b = Peer::with_types(types);

    let (_, update) = a.edit(|u| paragraph(u, "x"));
    let err = b.receive(&update.unwrap()).unwrap_err();
    assert!(matches!(err, SyncError::Core(CoreError::UnknownType(_))));
    assert!(b.binding.needs_resync());
    assert!(b.editor.state().is_empty());

    let (_, update) = a.edit(|u| u.set_prop(NodeKey::ROOT, "dir", json!("rtl")));
    assert!(matches!(b.receive(&update.unwrap()), Err(SyncError::ResyncRequired)));
}
