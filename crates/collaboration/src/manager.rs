/// Server-side registry of live rooms
use beatmap::{Document, DocumentId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{
    AccessGate, AccessLevel, CollaborationError, Result, Room, ServerMessage, SessionId,
    SnapshotStore, SyncConfig, UserId,
};

/// A session admitted to a room
pub struct Joined {
    pub room: Arc<Room>,
    pub session_id: SessionId,
    pub access: AccessLevel,
    pub outbound: mpsc::Receiver<ServerMessage>,
}

pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<DocumentId, Arc<Room>>>>,
    gate: Arc<dyn AccessGate>,
    store: Arc<dyn SnapshotStore>,
    config: SyncConfig,
}

impl RoomManager {
    pub fn new(gate: Arc<dyn AccessGate>, store: Arc<dyn SnapshotStore>, config: SyncConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            gate,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn room(&self, document_id: &DocumentId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Return the live room for a document, creating it from the stored
    /// snapshot on first access.
    pub async fn open(&self, document_id: DocumentId) -> Result<Arc<Room>> {
        if let Some(room) = self.room(&document_id).await {
            return Ok(room);
        }

        // Load outside the registry lock; a racing open for the same
        // document simply discards its copy.
        let document = match self.store.load_snapshot(&document_id).await? {
            Some(bytes) => {
                let mut document = Document::from_snapshot(&bytes)?;
                document.id = document_id;
                document
            }
            None => Document::new(document_id),
        };

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&document_id) {
            return Ok(room.clone());
        }
        let room = Arc::new(Room::new(
            document,
            self.gate.clone(),
            self.store.clone(),
            &self.config,
        ));
        room.spawn_persistence(self.config.persist_interval());
        rooms.insert(document_id, room.clone());
        info!(document = %document_id, "room opened");
        Ok(room)
    }

    /// Look up the user's access and join them to the document's room.
    pub async fn join(&self, document_id: DocumentId, user_id: UserId) -> Result<Joined> {
        let access = self.gate.access_level(&document_id, &user_id);
        if access == AccessLevel::None {
            warn!(
                target: "collaboration::security",
                document = %document_id,
                user = %user_id,
                "join rejected: no access"
            );
            return Err(CollaborationError::PermissionDenied(format!(
                "user {} has no access to {}",
                user_id, document_id
            )));
        }

        // A room closed by a concurrent teardown is replaced once
        for _ in 0..2 {
            let room = self.open(document_id).await?;
            match room.join(user_id, access).await {
                Ok((session_id, outbound)) => {
                    return Ok(Joined {
                        room,
                        session_id,
                        access,
                        outbound,
                    })
                }
                Err(CollaborationError::RoomClosed(_)) => {
                    self.forget(&room).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CollaborationError::RoomClosed(document_id))
    }

    /// Remove a session and tear the room down if it was the last one.
    pub async fn leave(&self, document_id: DocumentId, session_id: SessionId) -> Result<()> {
        let room = self
            .room(&document_id)
            .await
            .ok_or(CollaborationError::SessionNotFound(session_id))?;
        if room.leave(session_id).await {
            self.teardown(&room).await;
        }
        Ok(())
    }

    /// Flush and discard an empty room. Returns `false` if the room was kept:
    /// someone joined meanwhile, or the final save failed and the persistence
    /// tick will retry it. A save already started by the tick is awaited
    /// inside `flush` before the room can close.
    pub async fn teardown(&self, room: &Arc<Room>) -> bool {
        if !room.is_empty().await {
            return false;
        }
        if let Err(e) = room.flush().await {
            warn!(document = %room.document_id(), "keeping room after failed final save: {}", e);
            return false;
        }
        if !room.close_if_idle().await {
            debug!(document = %room.document_id(), "room busy again, teardown skipped");
            return false;
        }
        self.forget(room).await;
        true
    }

    /// Retry teardown of rooms left behind by a failed final save.
    pub async fn sweep(&self) -> usize {
        let rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut removed = 0;
        for room in rooms {
            if self.teardown(&room).await {
                removed += 1;
            }
        }
        removed
    }

    /// Flush and close every room.
    pub async fn shutdown(&self) {
        let rooms: Vec<_> = self.rooms.write().await.drain().map(|(_, r)| r).collect();
        for room in rooms {
            if let Err(e) = room.flush().await {
                warn!(document = %room.document_id(), "final save failed on shutdown: {}", e);
            }
            room.close().await;
        }
    }

    async fn forget(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(&room.document_id())
            .map_or(false, |current| Arc::ptr_eq(current, room))
        {
            rooms.remove(&room.document_id());
            info!(document = %room.document_id(), "room removed");
        }
    }
}
