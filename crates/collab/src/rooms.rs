//! Per-document rooms and the registry that owns them.
//!
//! A room is the fan-out set for one document: every connection that joined
//! that document id, each reachable through an unbounded sender its
//! connection task drains. The registry keeps the room map and the reverse
//! connection-to-document index consistent under one lock, so join, leave and
//! the empty-room prune are a pure function of registry state.

use std::collections::HashMap;
use std::sync::Arc;

use document::{ConnectionId, DocumentId};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::ServerMessage;

/// Outbound handle for one connected client.
pub type MemberSender = mpsc::UnboundedSender<ServerMessage>;

/// Whether a room member currently takes part in live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantMode {
    /// Editing the current document; relays and saves apply.
    Live,
    /// Inspecting a historical version; read-only until rejoin or restore.
    ViewingHistory,
}

struct Member {
    tx: MemberSender,
    mode: ParticipantMode,
}

/// Fan-out set for one document.
pub struct Room {
    document_id: DocumentId,
    members: RwLock<HashMap<ConnectionId, Member>>,
    /// Serializes relay and versioning work for this document; separate
    /// documents proceed independently.
    pub dispatch: Mutex<()>,
}

impl Room {
    fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            members: RwLock::new(HashMap::new()),
            dispatch: Mutex::new(()),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_member(&self, id: ConnectionId) -> bool {
        self.members.read().contains_key(&id)
    }

    pub fn mode(&self, id: ConnectionId) -> Option<ParticipantMode> {
        self.members.read().get(&id).map(|m| m.mode)
    }

    /// Flip a member between live and history view. No-op for non-members.
    pub fn set_mode(&self, id: ConnectionId, mode: ParticipantMode) {
        if let Some(member) = self.members.write().get_mut(&id) {
            member.mode = mode;
        }
    }

    /// Relay an incremental change to every live member except the origin.
    /// Fire and forget: a closed channel just skips that member. Returns how
    /// many members the change was handed to.
    pub fn relay(&self, origin: ConnectionId, change: &serde_json::Value) -> usize {
        let members = self.members.read();
        let mut delivered = 0;
        for (id, member) in members.iter() {
            if *id == origin || member.mode != ParticipantMode::Live {
                continue;
            }
            let msg = ServerMessage::ChangeReceived {
                change: change.clone(),
            };
            if member.tx.send(msg).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send to every member regardless of mode.
    pub fn broadcast(&self, msg: &ServerMessage) -> usize {
        let members = self.members.read();
        let mut delivered = 0;
        for member in members.values() {
            if member.tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn insert_member(&self, id: ConnectionId, tx: MemberSender) {
        self.members.write().insert(
            id,
            Member {
                tx,
                mode: ParticipantMode::Live,
            },
        );
    }

    fn remove_member(&self, id: ConnectionId) -> bool {
        self.members.write().remove(&id).is_some()
    }
}

/// All live rooms plus the connection-to-document index.
///
/// A room exists exactly while it has members; `leave` prunes on the way out.
pub struct RoomRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<DocumentId, Arc<Room>>,
    memberships: HashMap<ConnectionId, DocumentId>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Join `conn` to the room for `document_id`, creating the room on first
    /// join. A connection already in another room is moved there; rejoining
    /// the same room refreshes the sender and resets the member to live.
    pub fn join(
        &self,
        document_id: DocumentId,
        conn: ConnectionId,
        tx: MemberSender,
    ) -> Arc<Room> {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.memberships.get(&conn).cloned() {
            if previous != document_id {
                Self::remove_from_room(&mut inner, conn, &previous);
            }
        }
        let room = inner
            .rooms
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(Room::new(document_id.clone())))
            .clone();
        room.insert_member(conn, tx);
        inner.memberships.insert(conn, document_id);
        room
    }

    /// Remove `conn` from whatever room it is in. Idempotent; unknown
    /// connections are a no-op. Returns the document that was left, if any.
    pub fn leave(&self, conn: ConnectionId) -> Option<DocumentId> {
        let mut inner = self.inner.write();
        let document_id = inner.memberships.remove(&conn)?;
        Self::remove_from_room(&mut inner, conn, &document_id);
        Some(document_id)
    }

    fn remove_from_room(inner: &mut RegistryInner, conn: ConnectionId, document_id: &DocumentId) {
        if let Some(room) = inner.rooms.get(document_id) {
            room.remove_member(conn);
            if room.member_count() == 0 {
                debug!("room {} is empty, removing", document_id);
                inner.rooms.remove(document_id);
            }
        }
    }

    /// Room for a document, if anyone is currently in it.
    pub fn room(&self, document_id: &DocumentId) -> Option<Arc<Room>> {
        self.inner.read().rooms.get(document_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
