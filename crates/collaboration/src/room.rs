/// Authoritative per-document room.
///
/// The room's mutex is the document's serialization point: every batch is
/// applied and fanned out while holding it, so all sessions observe commands
/// in one total order. Access checks, decoding and snapshot writes happen
/// outside it; fan-out is a non-blocking channel send.
use beatmap::{Document, DocumentId};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{
    decode_batch, encode_batch, AccessGate, AccessLevel, CollaborationError, CommandContext,
    LeaveReason, Presence, Result, ServerMessage, SessionId, SessionInfo, SnapshotStore,
    SyncConfig, UserId,
};

/// Per-session queue of messages waiting for the transport. Bounded: a
/// session that stops reading is dropped once it fills up.
pub type Outbound = mpsc::Sender<ServerMessage>;

struct Member {
    info: SessionInfo,
    tx: Outbound,
    next_sequence: u64,
}

impl Member {
    /// Returns `false` only when the queue is full. A closed receiver means
    /// the connection is already going away and its leave will follow.
    fn send(&self, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                trace!(session = %self.info.session_id, "dropping message for closed session");
                true
            }
            Err(TrySendError::Full(_)) => false,
        }
    }

    fn send_commands(&mut self, origin: SessionId, payload: Vec<u8>) -> bool {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.send(ServerMessage::Commands {
            origin,
            sequence,
            payload,
        })
    }
}

struct RoomState {
    document_id: DocumentId,
    document: Document,
    members: BTreeMap<SessionId, Member>,
    next_session_id: u32,
    dirty: bool,
    /// A snapshot taken from `document` is being written
    saving: bool,
    closed: bool,
}

impl RoomState {
    fn broadcast(&mut self, message: &ServerMessage, exclude: Option<SessionId>) {
        let lagging: Vec<SessionId> = self
            .members
            .iter()
            .filter(|(session_id, _)| Some(**session_id) != exclude)
            .filter(|(_, member)| !member.send(message.clone()))
            .map(|(session_id, _)| *session_id)
            .collect();
        self.drop_lagging(lagging);
    }

    fn drop_lagging(&mut self, lagging: Vec<SessionId>) {
        for session_id in lagging {
            if let Some(member) = self.remove_member(session_id, LeaveReason::Lagging) {
                warn!(
                    document = %self.document_id,
                    session = %session_id,
                    user = %member.info.user_id,
                    "outbound queue full, session dropped"
                );
            }
        }
    }

    fn remove_member(&mut self, session_id: SessionId, reason: LeaveReason) -> Option<Member> {
        let member = self.members.remove(&session_id)?;
        let message = ServerMessage::UserLeft {
            session_id,
            user_id: member.info.user_id,
            reason,
        };
        self.broadcast(&message, None);
        Some(member)
    }
}

pub struct Room {
    document_id: DocumentId,
    gate: Arc<dyn AccessGate>,
    store: Arc<dyn SnapshotStore>,
    max_batch_bytes: u64,
    outbound_queue: usize,
    state: Mutex<RoomState>,
    /// Held for the whole of `flush`, so saves never overlap and a caller
    /// that flushes waits for a save already under way
    save_lock: Mutex<()>,
    persistence_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub fn new(
        document: Document,
        gate: Arc<dyn AccessGate>,
        store: Arc<dyn SnapshotStore>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            document_id: document.id,
            gate,
            store,
            max_batch_bytes: config.max_batch_bytes,
            outbound_queue: config.outbound_queue.max(1),
            state: Mutex::new(RoomState {
                document_id: document.id,
                document,
                members: BTreeMap::new(),
                next_session_id: 1,
                dirty: false,
                saving: false,
                closed: false,
            }),
            save_lock: Mutex::new(()),
            persistence_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Admit an authenticated user. The joiner gets `RoomState` first; the
    /// other members get `UserJoined`.
    pub async fn join(
        &self,
        user_id: UserId,
        access: AccessLevel,
    ) -> Result<(SessionId, mpsc::Receiver<ServerMessage>)> {
        if access == AccessLevel::None {
            warn!(
                target: "collaboration::security",
                document = %self.document_id,
                user = %user_id,
                "join rejected: no access"
            );
            return Err(CollaborationError::PermissionDenied(format!(
                "user {} has no access to {}",
                user_id, self.document_id
            )));
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(CollaborationError::RoomClosed(self.document_id));
        }

        let session_id = SessionId(state.next_session_id);
        state.next_session_id += 1;

        let (tx, rx) = mpsc::channel(self.outbound_queue);
        let info = SessionInfo {
            session_id,
            user_id,
            access,
            joined_at: Utc::now(),
            presence: Presence::default(),
        };
        let users = state.members.values().map(|m| m.info.clone()).collect();
        let snapshot = state.document.to_snapshot()?;

        let member = Member {
            info: info.clone(),
            tx,
            next_sequence: 0,
        };
        // Fresh queue with room for at least one message
        member.send(ServerMessage::RoomState {
            session_id,
            snapshot,
            users,
        });
        state.broadcast(&ServerMessage::UserJoined { user: info }, None);
        state.members.insert(session_id, member);

        info!(
            document = %self.document_id,
            session = %session_id,
            user = %user_id,
            access = %access,
            "session joined"
        );
        Ok((session_id, rx))
    }

    /// Remove a session. Returns `true` when the room is left empty.
    pub async fn leave(&self, session_id: SessionId) -> bool {
        let mut state = self.state.lock().await;
        if let Some(member) = state.remove_member(session_id, LeaveReason::Left) {
            info!(
                document = %self.document_id,
                session = %session_id,
                user = %member.info.user_id,
                "session left"
            );
        }
        state.members.is_empty()
    }

    /// Validate, apply and fan out one inbound batch.
    ///
    /// Returns the number of commands applied. Rejected or undecodable batches
    /// are dropped without touching the document; the session stays joined
    /// unless its access dropped to `None`.
    pub async fn handle_commands(&self, session_id: SessionId, payload: &[u8]) -> Result<usize> {
        let access = self.check_access(session_id).await?;
        if !access.can_edit() {
            warn!(
                target: "collaboration::security",
                document = %self.document_id,
                session = %session_id,
                access = %access,
                "dropping command batch: edit access required"
            );
            return Err(CollaborationError::PermissionDenied(format!(
                "session {} has {} access",
                session_id, access
            )));
        }

        let commands = decode_batch(payload, self.max_batch_bytes).map_err(|e| {
            warn!(
                document = %self.document_id,
                session = %session_id,
                "dropping malformed batch: {}",
                e
            );
            e
        })?;
        if commands.is_empty() {
            return Ok(0);
        }
        let outbound = encode_batch(&commands, self.max_batch_bytes)?;

        let mut state = self.state.lock().await;
        if !state.members.contains_key(&session_id) {
            return Err(CollaborationError::SessionNotFound(session_id));
        }

        let mut changed = false;
        for versioned in &commands {
            let mut ctx = CommandContext::remote(&mut state.document, versioned.version);
            changed |= versioned.command.apply(&mut ctx).is_some();
        }
        if changed {
            state.dirty = true;
        }

        let lagging: Vec<SessionId> = state
            .members
            .iter_mut()
            .filter_map(|(id, member)| {
                (!member.send_commands(session_id, outbound.clone())).then_some(*id)
            })
            .collect();
        state.drop_lagging(lagging);

        debug!(
            document = %self.document_id,
            session = %session_id,
            commands = commands.len(),
            changed,
            "batch applied"
        );
        Ok(commands.len())
    }

    /// Replace a session's presence and relay it to the other members.
    /// Any access level may do this.
    pub async fn set_presence(&self, session_id: SessionId, presence: Presence) -> Result<()> {
        let mut state = self.state.lock().await;
        let member = state
            .members
            .get_mut(&session_id)
            .ok_or(CollaborationError::SessionNotFound(session_id))?;
        if member.info.presence == presence {
            return Ok(());
        }
        member.info.presence = presence.clone();
        state.broadcast(
            &ServerMessage::UserActivity {
                session_id,
                presence,
            },
            Some(session_id),
        );
        trace!(document = %self.document_id, session = %session_id, "presence updated");
        Ok(())
    }

    /// Remove every session of `user_id` on behalf of an owner session.
    ///
    /// Each kicked session is sent `Kicked` before its queue is closed. The
    /// user may join again; the gate decides. Returns the number of sessions
    /// removed.
    pub async fn kick_user(
        &self,
        by: SessionId,
        user_id: UserId,
        reason: impl Into<String>,
    ) -> Result<usize> {
        let access = self.check_access(by).await?;
        if access != AccessLevel::Owner {
            warn!(
                target: "collaboration::security",
                document = %self.document_id,
                session = %by,
                user = %user_id,
                access = %access,
                "kick rejected: owner access required"
            );
            return Err(CollaborationError::PermissionDenied(format!(
                "session {} has {} access",
                by, access
            )));
        }

        let reason = reason.into();
        let mut state = self.state.lock().await;
        let targets: Vec<SessionId> = state
            .members
            .iter()
            .filter(|(_, member)| member.info.user_id == user_id)
            .map(|(session_id, _)| *session_id)
            .collect();
        for session_id in &targets {
            if let Some(member) = state.members.get(session_id) {
                // Removed right below, full queue or not
                let _ = member.send(ServerMessage::Kicked {
                    reason: reason.clone(),
                });
            }
            state.remove_member(*session_id, LeaveReason::Kicked);
        }

        info!(
            document = %self.document_id,
            by = %by,
            user = %user_id,
            sessions = targets.len(),
            reason = %reason,
            "user kicked"
        );
        Ok(targets.len())
    }

    /// Ask the gate for the session's current level and report changes.
    async fn check_access(&self, session_id: SessionId) -> Result<AccessLevel> {
        let (user_id, known) = {
            let state = self.state.lock().await;
            let member = state
                .members
                .get(&session_id)
                .ok_or(CollaborationError::SessionNotFound(session_id))?;
            (member.info.user_id, member.info.access)
        };

        let access = self.gate.access_level(&self.document_id, &user_id);
        if access == known {
            return Ok(access);
        }

        let mut state = self.state.lock().await;
        let delivered = match state.members.get_mut(&session_id) {
            Some(member) => {
                member.info.access = access;
                member.send(ServerMessage::AccessChanged { access })
            }
            None => true,
        };
        info!(
            document = %self.document_id,
            session = %session_id,
            from = %known,
            to = %access,
            "access level changed"
        );
        if access == AccessLevel::None {
            state.remove_member(session_id, LeaveReason::AccessRevoked);
            warn!(
                target: "collaboration::security",
                document = %self.document_id,
                session = %session_id,
                user = %user_id,
                "session removed: access revoked"
            );
        } else if !delivered {
            state.drop_lagging(vec![session_id]);
        }
        Ok(access)
    }

    /// Persist the canonical document if it changed since the last save.
    ///
    /// Returns `Ok(true)` when a snapshot was written. On failure the room
    /// stays dirty so the next tick retries. While the write is in flight the
    /// room counts as saving and `close_if_idle` refuses to close it.
    pub async fn flush(&self) -> Result<bool> {
        let _save = self.save_lock.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(false);
            }
            let snapshot = state.document.to_snapshot()?;
            state.dirty = false;
            state.saving = true;
            snapshot
        };

        let saved = self.store.save_snapshot(&self.document_id, snapshot).await;

        let mut state = self.state.lock().await;
        state.saving = false;
        if let Err(e) = saved {
            state.dirty = true;
            warn!(document = %self.document_id, "snapshot save failed, will retry: {}", e);
            return Err(e);
        }
        debug!(document = %self.document_id, "room persisted");
        Ok(true)
    }

    /// Start the periodic persistence tick. The task holds only a weak
    /// reference and ends once the room is dropped or closed.
    pub fn spawn_persistence(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Room> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(room) = weak.upgrade() else {
                    break;
                };
                if room.is_closed().await {
                    break;
                }
                // Failures are logged by flush and retried next tick
                let _ = room.flush().await;
            }
        });

        if let Some(previous) = self.persistence_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop accepting sessions and stop the persistence tick. Remaining
    /// members are dropped, which closes their outbound channels.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.members.clear();
        }
        if let Some(handle) = self.persistence_task.lock().take() {
            handle.abort();
        }
        info!(document = %self.document_id, "room closed");
    }

    /// Close the room only if it has no members and nothing left to persist,
    /// including a save still being written. Checked and applied under the
    /// room lock so a concurrent join either lands first (and the room stays
    /// open) or sees `RoomClosed`.
    pub async fn close_if_idle(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if !state.members.is_empty() || state.dirty || state.saving || state.closed {
                return false;
            }
            state.closed = true;
        }
        // Nothing dirty or saving, so the tick has nothing left to write
        if let Some(handle) = self.persistence_task.lock().take() {
            handle.abort();
        }
        info!(document = %self.document_id, "room closed");
        true
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.members.is_empty()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn is_saving(&self) -> bool {
        self.state.lock().await.saving
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.lock().await;
        state.members.values().map(|m| m.info.clone()).collect()
    }

    /// Copy of the canonical document
    pub async fn document(&self) -> Document {
        self.state.lock().await.document.clone()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(handle) = self.persistence_task.get_mut().take() {
            handle.abort();
        }
    }
}
