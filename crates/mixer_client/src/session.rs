//! Synchronization session
//!
//! [`SyncSession`] connects a live [`Document`] to a room. It is transport
//! independent: it turns local changes into commands and received commands
//! into document mutations, and [`SyncSession::run_network_step`] glues it
//! to a [`Client`].
//!
//! ## Joining
//!
//! The server answers a join with `CLEAR_CONTENT`, replays the room log and
//! ends with `JOIN_ROOM`. In between, local state is discarded, received
//! bytes are counted for [`SyncSession::joining_progress`] and no local
//! change is emitted.
//!
//! When this peer creates the room, the server asks for the initial content
//! with `CONTENT`; the session sends a creation for every datablock and
//! answers `CONTENT`.

use std::time::Instant;

use mixer_protocol::{Command, MessageType};
use mixer_proxy::{Document, InteractionMode, Rename, SessionContext, UndoReport, UndoSnapshot};

use crate::client::Client;
use crate::error::ClientResult;
use crate::wire;

/// Bytes received while catching up with a room
#[derive(Debug, Clone, Copy, Default)]
struct JoinProgress {
    received_bytes: u64,
    expected_bytes: Option<u64>,
}

/// Counters
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Remote datablock commands applied
    pub applied: u64,
    /// Remote datablock commands skipped after an error
    pub failed: u64,
    /// Command groups received
    pub groups: u64,
    /// Corrective renames emitted
    pub corrective_renames: u64,
}

/// Document synchronization for one room
#[derive(Debug)]
pub struct SyncSession {
    context: SessionContext,
    joining: Option<JoinProgress>,
    group_started: Option<Instant>,
    undo_snapshot: Option<UndoSnapshot>,
    stats: SessionStats,
}

impl SyncSession {
    /// Create the session of a room
    pub fn new(room: impl Into<String>) -> Self {
        Self::with_context(SessionContext::new(room))
    }

    /// Create a session around an existing context
    pub fn with_context(context: SessionContext) -> Self {
        Self {
            context,
            joining: None,
            group_started: None,
            undo_snapshot: None,
            stats: SessionStats::default(),
        }
    }

    /// Room name
    pub fn room(&self) -> &str {
        self.context.room()
    }

    /// Proxy state and deferred queue
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Mutable context
    pub fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    /// Counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Whether the room log is being replayed
    pub fn is_joining(&self) -> bool {
        self.joining.is_some()
    }

    /// Fraction of the room log received, while joining and once the room
    /// size is known
    pub fn joining_progress(&self) -> Option<f32> {
        let progress = self.joining?;
        let expected = progress.expected_bytes.filter(|b| *b > 0)?;
        Some((progress.received_bytes as f64 / expected as f64).min(1.0) as f32)
    }

    /// Record the size of the room log being replayed
    pub fn set_room_byte_size(&mut self, bytes: u64) {
        if let Some(progress) = self.joining.as_mut() {
            progress.expected_bytes = Some(bytes);
        }
    }

    /// Diff the document and encode its changes
    pub fn on_local_changes(&mut self, doc: &mut Document) -> ClientResult<Vec<Command>> {
        if self.joining.is_some() {
            return Ok(Vec::new());
        }
        let changeset = self.context.collect_local_changes(doc);
        wire::encode_changeset(&changeset, self.context.state())
    }

    /// Encode the whole document as the initial content of a new room,
    /// followed by `CONTENT`
    pub fn initial_content(&mut self, doc: &mut Document) -> ClientResult<Vec<Command>> {
        self.context.state_mut().clear();
        let changeset = self.context.collect_local_changes(doc);
        log::info!(
            "Sending initial content of room '{}': {} datablocks",
            self.room(),
            changeset.creations.len()
        );
        let mut commands = wire::encode_changeset(&changeset, self.context.state())?;
        commands.push(Command::empty(MessageType::Content));
        Ok(commands)
    }

    /// Handle a received command. Returns the commands to send in reply.
    pub fn process_command(&mut self, command: &Command, doc: &mut Document) -> ClientResult<Vec<Command>> {
        if let Some(progress) = self.joining.as_mut() {
            progress.received_bytes += command.byte_size() as u64;
        }

        match command.message_type {
            MessageType::Content => self.initial_content(doc),
            MessageType::ClearContent => {
                log::info!("Clearing content before joining '{}'", self.room());
                self.context.clear(doc);
                self.joining = Some(JoinProgress::default());
                Ok(Vec::new())
            }
            MessageType::JoinRoom => {
                if let Some(progress) = self.joining.take() {
                    log::info!(
                        "Caught up with room '{}': {} bytes, {} datablocks",
                        self.room(),
                        progress.received_bytes,
                        self.context.state().len()
                    );
                }
                Ok(Vec::new())
            }
            MessageType::GroupBegin => {
                self.group_started = Some(Instant::now());
                Ok(Vec::new())
            }
            MessageType::GroupEnd => {
                self.stats.groups += 1;
                if let Some(started) = self.group_started.take() {
                    log::debug!("Group processed in {:?}", started.elapsed());
                }
                if self.joining.is_none() {
                    self.context.state().sanity_check(doc);
                }
                Ok(Vec::new())
            }
            t if wire::is_datablock_command(t) => self.apply_remote(command, doc),
            other => {
                log::trace!("Ignoring {}", other);
                Ok(Vec::new())
            }
        }
    }

    fn apply_remote(&mut self, command: &Command, doc: &mut Document) -> ClientResult<Vec<Command>> {
        let op = match wire::decode_command(command) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("Skipping {}: {}", command.message_type, e);
                self.stats.failed += 1;
                return Ok(Vec::new());
            }
        };
        match self.context.submit(op, doc) {
            Ok(corrective) => {
                self.stats.applied += 1;
                self.encode_corrective(corrective)
            }
            Err(e) => {
                log::warn!("Skipping {}: {}", command.message_type, e);
                self.stats.failed += 1;
                Ok(Vec::new())
            }
        }
    }

    fn encode_corrective(&mut self, renames: Vec<Rename>) -> ClientResult<Vec<Command>> {
        self.stats.corrective_renames += renames.len() as u64;
        Ok(wire::encode_renames(&renames)?.into_iter().collect())
    }

    /// Switch the editor mode, applying deferred remote changes when back
    /// in a safe mode
    pub fn set_mode(&mut self, mode: InteractionMode, doc: &mut Document) -> ClientResult<Vec<Command>> {
        let corrective = self.context.set_mode(mode, doc);
        self.encode_corrective(corrective)
    }

    /// Call right before a local undo or redo
    pub fn begin_undo(&mut self, doc: &Document) {
        self.undo_snapshot = Some(UndoSnapshot::capture(doc));
    }

    /// Call right after a local undo or redo, before the next diff
    pub fn end_undo(&mut self, doc: &mut Document) -> Option<UndoReport> {
        let snapshot = self.undo_snapshot.take()?;
        Some(self.context.state_mut().reconcile_undo(&snapshot, doc))
    }

    /// Fetch and apply received commands, then send local changes.
    ///
    /// Returns the number of commands received.
    pub fn run_network_step(&mut self, client: &mut Client, doc: &mut Document) -> ClientResult<usize> {
        let commands = client.fetch_commands()?;
        for command in &commands {
            if self.joining.is_some() {
                if let Some(bytes) = client.room_byte_size(self.room()) {
                    self.set_room_byte_size(bytes);
                }
            }
            for reply in self.process_command(command, doc)? {
                client.add_command(reply);
            }
        }
        for command in self.on_local_changes(doc)? {
            client.add_command(command);
        }
        client.send_pending()?;
        Ok(commands.len())
    }
}
