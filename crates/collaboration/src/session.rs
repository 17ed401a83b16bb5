/// Client-side document session: optimistic apply, undo/redo and the
/// outgoing command buffer.
use beatmap::{Annotation, AnnotationId, Document, Entity, EntityId, FieldValue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::{
    decode_batch, encode_batch, Change, ClientMessage, Command, CommandContext, HistoryEntry,
    Result, SessionId, SyncConfig, Transaction, UndoRedoLog, VersionedCommand,
};

pub struct DocumentSession {
    document: Document,
    session_id: Option<SessionId>,
    next_version: u64,
    history: UndoRedoLog,
    outgoing: Vec<VersionedCommand>,
    changes: mpsc::UnboundedSender<Change>,
    max_batch_bytes: u64,
}

impl DocumentSession {
    /// Create a session over `document`. The receiver yields every visible
    /// change, local or remote, in apply order.
    pub fn new(
        document: Document,
        config: &SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Change>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            document,
            session_id: None,
            next_version: 1,
            history: UndoRedoLog::new(config.history_capacity, config.merge_window()),
            outgoing: Vec::new(),
            changes: tx,
            max_batch_bytes: config.max_batch_bytes,
        };
        (session, rx)
    }

    /// Create a session from the room's join reply.
    pub fn from_room_state(
        session_id: SessionId,
        snapshot: &[u8],
        config: &SyncConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Change>)> {
        let document = Document::from_snapshot(snapshot)?;
        let (mut session, rx) = Self::new(document, config);
        session.attach(session_id);
        Ok((session, rx))
    }

    /// Bind to the id the room assigned; echoes are recognised by it.
    pub fn attach(&mut self, session_id: SessionId) {
        debug!(session = %session_id, document = %self.document.id, "session attached");
        self.session_id = Some(session_id);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn history(&self) -> &UndoRedoLog {
        &self.history
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Apply a user edit, recording its inverse for undo.
    pub fn submit(&mut self, command: Command) -> Option<Change> {
        let inverse = command.create_undo(&self.document);
        self.submit_mutation(command, inverse)
    }

    /// Apply a user edit with a caller-computed inverse.
    ///
    /// Ignorable commands are dropped here: not applied, recorded or sent.
    pub fn submit_mutation(&mut self, command: Command, inverse: Option<Command>) -> Option<Change> {
        if command.can_be_ignored(&self.document) {
            trace!(tag = ?command.tag(), "ignoring no-op command");
            return None;
        }
        let change = self.apply_local(command.clone());
        if let Some(inverse) = inverse {
            self.history.record(command, inverse);
        }
        change
    }

    pub fn create_entity(&mut self, entity: Entity) -> Option<Change> {
        self.submit(Command::create_entity(entity))
    }

    pub fn delete_entity(&mut self, id: EntityId) -> Option<Change> {
        self.submit(Command::delete_entity(id))
    }

    pub fn update_entity<K, V>(
        &mut self,
        id: EntityId,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Option<Change>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        self.submit(Command::update_entity(id, fields))
    }

    pub fn create_annotation(&mut self, annotation: Annotation) -> Option<Change> {
        self.submit(Command::create_annotation(annotation))
    }

    pub fn remove_annotation(&mut self, id: AnnotationId) -> Option<Change> {
        self.submit(Command::remove_annotation(id))
    }

    /// Close the current edit burst into one undo step.
    pub fn commit(&mut self) -> bool {
        self.history.commit()
    }

    /// Revert the newest undo step. Returns `false` if there was none.
    pub fn undo(&mut self) -> bool {
        let Some(transaction) = self.history.take_undo() else {
            return false;
        };

        let mut redo = Vec::with_capacity(transaction.len());
        for entry in transaction.into_entries().into_iter().rev() {
            let command = entry
                .inverse
                .create_undo(&self.document)
                .unwrap_or(entry.command);
            if !entry.inverse.can_be_ignored(&self.document) {
                self.apply_local(entry.inverse.clone());
            }
            redo.push(HistoryEntry::new(command, entry.inverse));
        }
        redo.reverse();
        self.history.push_redo(Transaction::new(redo));
        true
    }

    /// Re-apply the newest undone step. Returns `false` if there was none.
    pub fn redo(&mut self) -> bool {
        let Some(transaction) = self.history.take_redo() else {
            return false;
        };

        let mut undo = Vec::with_capacity(transaction.len());
        for entry in transaction.into_entries() {
            let inverse = entry
                .command
                .create_undo(&self.document)
                .unwrap_or(entry.inverse);
            if !entry.command.can_be_ignored(&self.document) {
                self.apply_local(entry.command.clone());
            }
            undo.push(HistoryEntry::new(entry.command, inverse));
        }
        self.history.push_undo(Transaction::new(undo));
        true
    }

    /// Apply a batch broadcast by the room on behalf of `origin`.
    pub fn receive(&mut self, origin: SessionId, payload: &[u8]) -> Result<usize> {
        let commands = decode_batch(payload, self.max_batch_bytes)?;
        let count = commands.len();
        for versioned in commands {
            self.apply_incoming(origin, &versioned);
        }
        Ok(count)
    }

    /// Apply one command from the room: an echo if `origin` is this session,
    /// otherwise another session's edit.
    pub fn apply_incoming(&mut self, origin: SessionId, versioned: &VersionedCommand) -> Option<Change> {
        let own = self.session_id == Some(origin);
        let mut ctx = if own {
            CommandContext::own_echo(&mut self.document, versioned.version)
        } else {
            CommandContext::remote(&mut self.document, versioned.version)
        };
        let change = versioned.command.apply(&mut ctx);
        self.emit(change.clone());
        change
    }

    /// Drain the outgoing buffer into one encoded batch.
    pub fn take_outgoing(&mut self) -> Result<Option<Vec<u8>>> {
        if self.outgoing.is_empty() {
            return Ok(None);
        }
        let batch = std::mem::take(&mut self.outgoing);
        encode_batch(&batch, self.max_batch_bytes).map(Some)
    }

    fn apply_local(&mut self, command: Command) -> Option<Change> {
        let version = self.next_version;
        self.next_version += 1;

        let change = command.apply(&mut CommandContext::local(&mut self.document, version));
        self.emit(change.clone());
        self.enqueue(VersionedCommand::new(version, command));
        change
    }

    fn enqueue(&mut self, versioned: VersionedCommand) {
        if let Some(tail) = self.outgoing.last_mut() {
            if let Some(merged) = tail.command.merge(&versioned.command) {
                // The tail's version is never sent; its pending entries must
                // wait for the merged command's echo instead.
                if let Some((id, fields)) = tail.command.written_fields() {
                    if let Some(entity) = self.document.get_mut(id) {
                        for field in fields {
                            entity
                                .pending_mut()
                                .retarget(field, tail.version, versioned.version);
                        }
                    }
                }
                *tail = VersionedCommand::new(versioned.version, merged);
                return;
            }
        }
        self.outgoing.push(versioned);
    }

    fn emit(&self, change: Option<Change>) {
        if let Some(change) = change {
            // Nobody listening is fine
            let _ = self.changes.send(change);
        }
    }
}

/// Send a shared session's buffered edits every `flush_interval`, one
/// `Commands` message per tick with anything in it. The task ends once the
/// transport drops its end of `sink`.
pub fn spawn_outgoing_flush(
    session: Arc<parking_lot::Mutex<DocumentSession>>,
    config: &SyncConfig,
    sink: mpsc::UnboundedSender<ClientMessage>,
) -> JoinHandle<()> {
    let period = config.flush_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if sink.is_closed() {
                break;
            }
            let batch = session.lock().take_outgoing();
            match batch {
                Ok(Some(payload)) => {
                    if sink.send(ClientMessage::Commands { payload }).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("dropping outgoing batch: {}", e),
            }
        }
        debug!("outgoing flush stopped");
    })
}
