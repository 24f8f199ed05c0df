//! Integration tests for document synchronization
//!
//! The in-process room below stands in for the broadcast server: it keeps
//! the room log, replays it to joiners and relays every command to the other
//! members in one global order. The last test runs the real server over
//! loopback TCP.

use std::collections::VecDeque;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mixer_client::*;
use mixer_protocol::{codec, Command, JoinRoomRequest, MessageType};
use mixer_proxy::{fallback_name, Document, InteractionMode, LiveNode, NodeKind, NodeUuid, SoaBuffer, Value};
use mixer_server::{Connection, Room, RoomPolicy, Server, ServerConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Member {
    session: SyncSession,
    doc: Document,
}

struct LocalRoom {
    name: String,
    log: Vec<Command>,
    members: Vec<Member>,
}

impl LocalRoom {
    /// Create the room from `doc`, the way the server asks its creator
    fn create(name: &str, doc: Document) -> Self {
        let mut creator = Member {
            session: SyncSession::new(name),
            doc,
        };
        let ack = Command::new(MessageType::JoinRoom, codec::encode_string(name));
        assert!(creator.session.process_command(&ack, &mut creator.doc).unwrap().is_empty());
        let content = creator
            .session
            .process_command(&Command::empty(MessageType::Content), &mut creator.doc)
            .unwrap();
        assert_eq!(content.last().map(|c| c.message_type), Some(MessageType::Content));

        let log = content.into_iter().filter(|c| c.message_type.is_room_command()).collect();
        Self {
            name: name.to_string(),
            log,
            members: vec![creator],
        }
    }

    /// Replay the log to a new member. Returns its index.
    fn join(&mut self, doc: Document) -> usize {
        let mut member = Member {
            session: SyncSession::new(self.name.clone()),
            doc,
        };
        let room_size: usize = self.log.iter().map(Command::byte_size).sum();

        let mut replies = Vec::new();
        let clear = Command::empty(MessageType::ClearContent);
        replies.extend(member.session.process_command(&clear, &mut member.doc).unwrap());
        member.session.set_room_byte_size(room_size as u64);
        for command in &self.log {
            replies.extend(member.session.process_command(&transmit(command), &mut member.doc).unwrap());
        }
        assert_eq!(member.session.joining_progress(), Some(1.0));
        let ack = Command::new(MessageType::JoinRoom, codec::encode_string(&self.name));
        replies.extend(member.session.process_command(&ack, &mut member.doc).unwrap());
        assert!(!member.session.is_joining());

        self.members.push(member);
        let index = self.members.len() - 1;
        self.broadcast(vec![(index, replies)]);
        index
    }

    /// Diff a member's document and relay its changes
    fn publish(&mut self, index: usize) -> Vec<MessageType> {
        let member = &mut self.members[index];
        let commands = member.session.on_local_changes(&mut member.doc).unwrap();
        let types = commands.iter().map(|c| c.message_type).collect();
        self.broadcast(vec![(index, commands)]);
        types
    }

    /// Log and relay commands to every member but their sender, then the
    /// replies they trigger, until none is left
    fn broadcast(&mut self, outgoing: Vec<(usize, Vec<Command>)>) {
        let mut queue: VecDeque<(usize, Command)> = outgoing
            .into_iter()
            .flat_map(|(sender, commands)| commands.into_iter().map(move |c| (sender, c)))
            .collect();
        let mut steps = 0;
        while let Some((sender, command)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 1000, "relay does not terminate");
            self.log.push(command.clone());
            for (index, member) in self.members.iter_mut().enumerate() {
                if index == sender {
                    continue;
                }
                let replies = member.session.process_command(&transmit(&command), &mut member.doc).unwrap();
                queue.extend(replies.into_iter().map(|c| (index, c)));
            }
        }
    }

    fn doc(&self, index: usize) -> &Document {
        &self.members[index].doc
    }
}

/// Send a command through its wire representation
fn transmit(command: &Command) -> Command {
    Command::read_from(&mut Cursor::new(command.to_bytes())).unwrap()
}

fn scene() -> Document {
    let mut doc = Document::new();
    let material = doc.insert_node(LiveNode::new(NodeKind::Material, "Steel").with_attribute("roughness", 0.4));
    let mesh = doc.insert_node(
        LiveNode::new(NodeKind::Mesh, "CubeMesh")
            .with_attribute("materials", Value::List(vec![Value::Node(material)]))
            .with_buffer("vertices", SoaBuffer::from_f32(3, &[0.5; 8 * 3])),
    );
    doc.insert_node(
        LiveNode::new(NodeKind::Object, "Cube")
            .with_attribute("data", mesh)
            .with_attribute("location", [0.0, 0.0, 0.0])
            .with_attribute("rotation", [1.0, 0.0, 0.0, 0.0])
            .with_attribute("scale", [1.0, 1.0, 1.0]),
    );
    doc
}

fn uuids(doc: &Document) -> Vec<NodeUuid> {
    let mut uuids: Vec<NodeUuid> = doc.uuid_index().into_keys().collect();
    uuids.sort();
    uuids
}

fn names(doc: &Document) -> Vec<String> {
    let mut names: Vec<String> = doc
        .iter()
        .map(|(_, node)| format!("{:?}:{}", node.kind, node.name()))
        .collect();
    names.sort();
    names
}

fn node_by_name<'a>(doc: &'a Document, kind: NodeKind, name: &str) -> &'a LiveNode {
    let handle = doc.find_by_name(kind, name).unwrap();
    doc.get(handle).unwrap()
}

#[test]
fn test_late_joiner_replays_room_log() {
    let mut room = LocalRoom::create("studio", scene());
    let bob = room.join(Document::new());

    assert_eq!(names(room.doc(bob)), names(room.doc(0)));
    assert_eq!(uuids(room.doc(bob)), uuids(room.doc(0)));

    let object = node_by_name(room.doc(bob), NodeKind::Object, "Cube");
    let mesh = match object.attributes.get("data") {
        Some(Value::Node(handle)) => *handle,
        other => panic!("unexpected data attribute {:?}", other),
    };
    let mesh_uuid = room.doc(bob).uuid_of(mesh).unwrap();
    let origin_mesh = room.doc(0).find_by_name(NodeKind::Mesh, "CubeMesh").unwrap();
    assert_eq!(Some(mesh_uuid), room.doc(0).uuid_of(origin_mesh));

    let member = &mut room.members[bob];
    assert!(member.session.on_local_changes(&mut member.doc).unwrap().is_empty());
}

#[test]
fn test_joining_discards_local_content() {
    let mut room = LocalRoom::create("studio", scene());
    let mut stale = Document::new();
    stale.create_node(NodeKind::Light, "Stale");

    let bob = room.join(stale);
    assert!(room.doc(bob).find_by_name(NodeKind::Light, "Stale").is_none());
    assert_eq!(room.doc(bob).len(), 3);
}

#[test]
fn test_transform_travels_as_mergeable_command() {
    let mut room = LocalRoom::create("studio", scene());
    let bob = room.join(Document::new());

    let cube = room.doc(0).find_by_name(NodeKind::Object, "Cube").unwrap();
    let moved = Value::Vector(vec![0.1, 0.2, -3.0]);
    room.members[0]
        .doc
        .get_mut(cube)
        .unwrap()
        .attributes
        .insert("location".into(), moved.clone());

    let types = room.publish(0);
    assert_eq!(types, vec![MessageType::Transform]);
    assert!(MessageType::Transform.is_mergeable());

    let object = node_by_name(room.doc(bob), NodeKind::Object, "Cube");
    assert_eq!(object.attributes.get("location"), Some(&moved));
    assert_eq!(object.attributes.get("rotation"), Some(&Value::Vector(vec![1.0, 0.0, 0.0, 0.0])));

    let member = &mut room.members[bob];
    assert!(member.session.on_local_changes(&mut member.doc).unwrap().is_empty());

    let carol = room.join(Document::new());
    let object = node_by_name(room.doc(carol), NodeKind::Object, "Cube");
    assert_eq!(object.attributes.get("location"), Some(&moved));
}

#[test]
fn test_room_keeps_latest_transform_only() {
    let mut doc = scene();
    let mut session = SyncSession::new("studio");
    let (creator, _rx) = Connection::new("127.0.0.1:7000".parse().unwrap());
    let room = Room::new(&creator, &JoinRoomRequest::new("studio", "3.0"), RoomPolicy::default());

    let content = session.initial_content(&mut doc).unwrap();
    for command in content.into_iter().filter(|c| c.message_type.is_room_command()) {
        room.add_command(Arc::new(command), creator.id());
    }
    let logged = room.command_count();

    let cube = doc.find_by_name(NodeKind::Object, "Cube").unwrap();
    for step in 1..=5 {
        let location = Value::Vector(vec![f64::from(step), 0.1, 0.0]);
        doc.get_mut(cube).unwrap().attributes.insert("location".into(), location);
        for command in session.on_local_changes(&mut doc).unwrap() {
            room.add_command(Arc::new(command), creator.id());
        }
    }

    assert_eq!(room.command_count(), logged + 1);
    let commands = room.commands();
    let last = commands.last().unwrap();
    assert_eq!(last.message_type, MessageType::Transform);
    match wire::decode_command(last).unwrap() {
        mixer_proxy::RemoteOp::Update(change) => assert_eq!(
            change.attributes.updated["location"],
            mixer_proxy::ValueDelta::Replace(Value::Vector(vec![5.0, 0.1, 0.0]))
        ),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_concurrent_renames_converge() {
    let mut doc = Document::new();
    doc.create_node(NodeKind::Light, "Lamp");
    let mut room = LocalRoom::create("studio", doc);
    let bob = room.join(Document::new());
    let uuid = uuids(room.doc(0))[0];

    let lamp = room.doc(0).find_by_name(NodeKind::Light, "Lamp").unwrap();
    room.members[0].doc.rename(lamp, "Key").unwrap();
    let lamp = room.doc(bob).find_by_name(NodeKind::Light, "Lamp").unwrap();
    room.members[bob].doc.rename(lamp, "Fill").unwrap();

    let mut outgoing = Vec::new();
    for index in [0, bob] {
        let member = &mut room.members[index];
        outgoing.push((index, member.session.on_local_changes(&mut member.doc).unwrap()));
    }
    room.broadcast(outgoing);

    let expected = fallback_name(NodeKind::Light, uuid);
    for index in [0, bob] {
        let handle = room.doc(index).find_by_uuid(uuid).unwrap();
        assert_eq!(room.doc(index).get(handle).unwrap().name(), expected);
    }
    assert!(room.members[bob].session.stats().corrective_renames >= 1);
}

#[test]
fn test_remote_changes_wait_for_safe_mode() {
    let mut room = LocalRoom::create("studio", scene());
    let bob = room.join(Document::new());

    {
        let member = &mut room.members[bob];
        let replies = member
            .session
            .set_mode(InteractionMode::Edit, &mut member.doc)
            .unwrap();
        assert!(replies.is_empty());
    }

    room.members[0].doc.create_node(NodeKind::Camera, "Camera");
    room.publish(0);
    assert!(room.doc(bob).find_by_name(NodeKind::Camera, "Camera").is_none());
    assert_eq!(room.members[bob].session.context().deferred_len(), 1);

    let member = &mut room.members[bob];
    member
        .session
        .set_mode(InteractionMode::Object, &mut member.doc)
        .unwrap();
    assert!(member.doc.find_by_name(NodeKind::Camera, "Camera").is_some());
    assert_eq!(member.session.context().deferred_len(), 0);
}

fn client_config(address: SocketAddr) -> ClientConfig {
    ClientConfig::new(address.ip().to_string(), address.port()).with_engine_version("3.0")
}

/// Retry until the creator has published its content
fn join_when_ready(client: &mut Client, room: &str) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        client.join_room(room).unwrap();
        match client.wait_for(MessageType::JoinRoom, TIMEOUT) {
            Ok(()) => return,
            Err(ClientError::Server(message)) => {
                assert!(Instant::now() < deadline, "{}", message);
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("join failed: {}", e),
        }
    }
}

#[test]
fn test_sync_through_server() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = Server::new(ServerConfig::local_ephemeral());
    let (address, _handle) = server.spawn().unwrap();

    let mut alice = Client::connect(client_config(address)).unwrap();
    alice.wait_for(MessageType::ClientId, TIMEOUT).unwrap();
    assert!(alice.client_id().is_some());
    alice.join_room("studio").unwrap();
    alice.wait_for(MessageType::Content, TIMEOUT).unwrap();

    let mut alice_doc = scene();
    let mut alice_session = SyncSession::new("studio");
    alice_session.run_network_step(&mut alice, &mut alice_doc).unwrap();
    assert_eq!(alice.current_room(), Some("studio"));

    let mut bob = Client::connect(client_config(address)).unwrap();
    join_when_ready(&mut bob, "studio");
    let mut bob_doc = Document::new();
    let mut bob_session = SyncSession::new("studio");
    bob_session.run_network_step(&mut bob, &mut bob_doc).unwrap();

    assert_eq!(names(&bob_doc), names(&alice_doc));
    assert_eq!(uuids(&bob_doc), uuids(&alice_doc));
    assert!(!bob_session.is_joining());

    let cube = alice_doc.find_by_name(NodeKind::Object, "Cube").unwrap();
    alice_doc
        .get_mut(cube)
        .unwrap()
        .attributes
        .insert("location".into(), Value::Vector(vec![0.0, 4.0, 0.5]));
    alice_session.run_network_step(&mut alice, &mut alice_doc).unwrap();

    let expected = Value::Vector(vec![0.0, 4.0, 0.5]);
    let deadline = Instant::now() + TIMEOUT;
    loop {
        bob_session.run_network_step(&mut bob, &mut bob_doc).unwrap();
        let object = node_by_name(&bob_doc, NodeKind::Object, "Cube");
        if object.attributes.get("location") == Some(&expected) {
            break;
        }
        assert!(Instant::now() < deadline, "transform never arrived");
    }

    bob.list_rooms().unwrap();
    bob.wait_for(MessageType::ListRooms, TIMEOUT).unwrap();
    assert!(bob.rooms_attributes().contains_key("studio"));

    bob.disconnect();
    alice.disconnect();
    server.shutdown();
}
