//! Integration tests for the diff engine
//!
//! Peers are simulated in-process: a changeset produced by one peer is
//! serialized, delivered to the others in a single global order, and any
//! corrective renames are delivered in turn.

use std::collections::VecDeque;

use mixer_proxy::*;

struct Peer {
    context: SessionContext,
    doc: Document,
}

impl Peer {
    fn new() -> Self {
        Self {
            context: SessionContext::new("studio"),
            doc: Document::new(),
        }
    }

    fn local(&mut self) -> Changeset {
        self.context.collect_local_changes(&mut self.doc)
    }

    fn receive(&mut self, changeset: &Changeset) -> Vec<Rename> {
        let bytes = bincode::serialize(changeset).unwrap();
        let received: Changeset = bincode::deserialize(&bytes).unwrap();
        self.context.submit_changeset(received, &mut self.doc)
    }

    fn handle(&self, uuid: NodeUuid) -> LiveHandle {
        self.context.state().handle_of(uuid).unwrap()
    }

    fn name_of(&self, uuid: NodeUuid) -> String {
        self.doc.get(self.handle(uuid)).unwrap().name().to_string()
    }
}

/// Deliver changesets in order to every peer but their sender, until no
/// corrective renames are left
fn deliver(peers: &mut [Peer], outgoing: Vec<(usize, Changeset)>) {
    let mut queue: VecDeque<(usize, Changeset)> = outgoing.into();
    let mut steps = 0;
    while let Some((sender, changeset)) = queue.pop_front() {
        steps += 1;
        assert!(steps < 100, "delivery does not terminate");
        for (index, peer) in peers.iter_mut().enumerate() {
            if index == sender {
                continue;
            }
            let corrective = peer.receive(&changeset);
            if !corrective.is_empty() {
                let mut reply = Changeset::new();
                reply.renames = corrective;
                queue.push_back((index, reply));
            }
        }
    }
}

fn populated() -> (Peer, NodeUuid, NodeUuid, NodeUuid) {
    let mut peer = Peer::new();
    let material = peer
        .doc
        .insert_node(LiveNode::new(NodeKind::Material, "Steel").with_attribute("roughness", 0.4));
    let mesh = peer.doc.insert_node(
        LiveNode::new(NodeKind::Mesh, "CubeMesh")
            .with_attribute("materials", Value::List(vec![Value::Node(material)]))
            .with_buffer("vertices", SoaBuffer::from_f32(3, &[0.0; 24 * 3])),
    );
    let object = peer.doc.insert_node(
        LiveNode::new(NodeKind::Object, "Cube")
            .with_attribute("data", mesh)
            .with_attribute("location", [0.0, 0.0, 0.0]),
    );
    peer.local();
    let uuid = |h| peer.doc.uuid_of(h).unwrap();
    let (material, mesh, object) = (uuid(material), uuid(mesh), uuid(object));
    (peer, material, mesh, object)
}

#[test]
fn invariant_round_trip_identity() {
    let (mut origin, _, mesh, object) = populated();
    assert!(origin.local().is_empty());

    let handle = origin.handle(object);
    {
        let node = origin.doc.get_mut(handle).unwrap();
        node.attributes.insert("location".into(), Value::from([1.0, 2.0, 3.0]));
        node.attributes.insert(
            "display".into(),
            Value::Struct([("wire".to_string(), Value::Bool(true))].into_iter().collect()),
        );
    }
    let mesh_handle = origin.handle(mesh);
    origin
        .doc
        .get_mut(mesh_handle)
        .unwrap()
        .buffers
        .insert("vertices".into(), SoaBuffer::from_f32(3, &[1.0; 24 * 3]));

    let changeset = origin.local();
    assert_eq!(changeset.updates.len(), 2);
    assert!(origin.local().is_empty());

    let proxy = origin.context.state().get(object).unwrap();
    let live = origin.doc.get(handle).unwrap();
    assert_eq!(proxy.attributes["location"], live.attributes["location"]);
    assert_eq!(proxy.attributes["display"], live.attributes["display"]);
}

#[test]
fn invariant_late_joiner_materializes_identical_nodes() {
    let (origin, material, mesh, object) = populated();
    let mut joiner = Peer::new();

    let mut initial = Changeset::new();
    for uuid in [object, mesh, material] {
        let mut proxy = origin.context.state().get(uuid).unwrap().clone();
        proxy.has_live_node = false;
        initial.creations.push(proxy);
    }
    assert!(joiner.receive(&initial).is_empty());

    for uuid in [material, mesh, object] {
        assert_eq!(joiner.name_of(uuid), origin.name_of(uuid));
        assert_eq!(joiner.doc.uuid_of(joiner.handle(uuid)), Some(uuid));
    }
    let data = &joiner.doc.get(joiner.handle(object)).unwrap().attributes["data"];
    assert_eq!(data, &Value::Node(joiner.handle(mesh)));
    assert!(joiner.context.state().unresolved().is_empty());
    assert!(joiner.local().is_empty());
    assert!(joiner.context.state().sanity_check(&joiner.doc).is_clean());
}

#[test]
fn invariant_removal_safety() {
    let (origin, material, mesh, object) = populated();
    let mut peer = Peer::new();
    let mut initial = Changeset::new();
    for uuid in [material, mesh, object] {
        initial.creations.push(origin.context.state().get(uuid).unwrap().clone());
    }
    peer.receive(&initial);

    let mut removal = Changeset::new();
    for (uuid, kind) in [(material, NodeKind::Material), (mesh, NodeKind::Mesh), (object, NodeKind::Object)] {
        removal.removals.push(Removal {
            uuid,
            kind,
            name: origin.name_of(uuid),
        });
    }

    let report = peer.context.state_mut().apply_changeset(&removal, &mut peer.doc);
    assert_eq!(report.removed, 3);
    assert_eq!(report.skipped, 0);
    assert!(peer.doc.is_empty());
    assert!(peer.context.state().is_empty());

    // Removing only the referenced datablock detaches its owners
    let (mut other, _, mesh_only, object_only) = populated();
    let mut partial = Changeset::new();
    partial.removals.push(Removal {
        uuid: mesh_only,
        kind: NodeKind::Mesh,
        name: "CubeMesh".into(),
    });
    let report = other.context.state_mut().apply_changeset(&partial, &mut other.doc);
    assert_eq!(report.skipped, 0);
    let object_handle = other.handle(object_only);
    assert!(other.doc.get(object_handle).unwrap().attributes["data"].is_null());
    assert!(other.local().is_empty());
}

#[test]
fn invariant_rename_convergence() {
    let mut a = Peer::new();
    a.doc.create_node(NodeKind::Object, "Cube");
    let creation = a.local();
    let uuid = creation.creations[0].uuid;

    let mut peers = vec![a, Peer::new(), Peer::new()];
    deliver(&mut peers, vec![(0, creation)]);
    for peer in &peers {
        assert_eq!(peer.name_of(uuid), "Cube");
    }

    let handle = peers[0].handle(uuid);
    peers[0].doc.rename(handle, "Box").unwrap();
    let from_a = peers[0].local();
    let handle = peers[1].handle(uuid);
    peers[1].doc.rename(handle, "Crate").unwrap();
    let from_b = peers[1].local();

    deliver(&mut peers, vec![(0, from_a), (1, from_b)]);

    let expected = fallback_name(NodeKind::Object, uuid);
    for peer in peers.iter_mut() {
        assert_eq!(peer.name_of(uuid), expected);
        assert!(peer.doc.find_by_name(NodeKind::Object, "Cube").is_none());
        assert!(peer.local().is_empty());
    }
}

#[test]
fn invariant_undo_is_not_delete_create() {
    let (mut origin, _, _, object) = populated();
    let mut peer = Peer::new();
    let mut initial = Changeset::new();
    for proxy in origin.context.state().proxies() {
        initial.creations.push(proxy.clone());
    }
    peer.receive(&initial);

    origin.doc.push_undo_step();
    let handle = origin.handle(object);
    origin.doc.rename(handle, "Moved").unwrap();
    origin
        .doc
        .get_mut(handle)
        .unwrap()
        .attributes
        .insert("location".into(), Value::from([5.0, 0.0, 0.0]));
    let edit = origin.local();
    assert_eq!(edit.renames.len(), 1);
    peer.receive(&edit);

    let snapshot = UndoSnapshot::capture(&origin.doc);
    origin.doc.undo().unwrap();
    let report = origin.context.state_mut().reconcile_undo(&snapshot, &mut origin.doc);
    assert_eq!(report.rebound.len(), 3);
    assert_eq!(report.renamed, vec![(object, "Moved".to_string(), "Cube".to_string())]);

    let revert = origin.local();
    assert!(revert.creations.is_empty());
    assert!(revert.removals.is_empty());
    assert_eq!(revert.renames.len(), 1);
    assert_eq!(revert.updates.len(), 1);

    peer.receive(&revert);
    assert_eq!(peer.name_of(object), "Cube");
    let location = &peer.doc.get(peer.handle(object)).unwrap().attributes["location"];
    assert_eq!(location, &Value::from([0.0, 0.0, 0.0]));
}

#[test]
fn invariant_deferred_operations_keep_arrival_order() {
    let mut origin = Peer::new();
    let handle = origin.doc.create_node(NodeKind::Light, "Lamp");
    let creation = origin.local();
    let uuid = creation.creations[0].uuid;
    origin.doc.rename(handle, "Sun").unwrap();
    origin
        .doc
        .get_mut(handle)
        .unwrap()
        .attributes
        .insert("energy".into(), Value::Float(3.0));
    let edit = origin.local();

    let mut peer = Peer::new();
    peer.context.set_mode(InteractionMode::Edit, &mut peer.doc);
    peer.receive(&creation);
    peer.receive(&edit);
    assert!(peer.doc.is_empty());
    assert_eq!(peer.context.deferred_len(), 3);

    let corrective = peer.context.set_mode(InteractionMode::Object, &mut peer.doc);
    assert!(corrective.is_empty());
    assert_eq!(peer.name_of(uuid), "Sun");
    let energy = &peer.doc.get(peer.handle(uuid)).unwrap().attributes["energy"];
    assert_eq!(energy, &Value::Float(3.0));
    assert_eq!(peer.context.deferred_len(), 0);
}

#[test]
fn test_duplicated_node_sent_as_creation() {
    let (mut origin, _, mesh, object) = populated();
    let handle = origin.handle(object);
    let copy = origin.doc.get(handle).unwrap().clone();
    let duplicate = origin.doc.insert_node(copy);

    let changeset = origin.local();
    assert_eq!(changeset.creations.len(), 1);
    let created = &changeset.creations[0];
    assert_ne!(created.uuid, object);
    assert_eq!(origin.doc.uuid_of(duplicate), Some(created.uuid));
    assert_eq!(created.attributes["data"], Value::Ref(mesh));
    assert_eq!(origin.context.state().owners_of(mesh).len(), 2);
}
