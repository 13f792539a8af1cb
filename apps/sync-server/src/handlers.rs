//! Message dispatch and the document operations behind it.
//!
//! Every incoming frame funnels through [`dispatch`]: parse, handle, and on
//! any failure send a single operation-failed back to the requester. Work
//! that touches one document's state runs under that room's dispatch gate,
//! so saves, restores and relays for a document never interleave while
//! separate documents proceed concurrently.

use std::sync::Arc;

use anyhow::Result;
use collab::{
    parse_client_message, ClientMessage, CollabError, MemberSender, ParticipantMode, Room,
    RoomRegistry, ServerMessage,
};
use docstore::DocumentDb;
use document::{ConnectionId, DocumentId, ParticipantId};
use tracing::{debug, error, info};

/// How many version summaries ride along with a join reply.
const VERSION_LIST_LIMIT: i64 = 50;

const AUTO_SAVE_DESCRIPTION: &str = "Auto-save";
const MANUAL_SAVE_DESCRIPTION: &str = "Manual save";

/// Shared server state handed to every connection task.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub db: DocumentDb,
}

/// Mutable per-connection session context.
pub struct ConnState {
    pub id: ConnectionId,
    pub tx: MemberSender,
    /// Set by identify; best-effort author attribution.
    pub participant: Option<ParticipantId>,
    /// Document this connection has joined, if any.
    pub document: Option<DocumentId>,
}

impl ConnState {
    pub fn new(tx: MemberSender) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            participant: None,
            document: None,
        }
    }

    fn send(&self, msg: ServerMessage) {
        // A closed receiver means the connection is tearing down
        let _ = self.tx.send(msg);
    }
}

/// Parse and handle one incoming text frame. Any failure becomes a single
/// operation-failed to this connection; the rest of the room never sees it.
pub async fn dispatch(state: &AppState, conn: &mut ConnState, text: &str) {
    let result = match parse_client_message(text) {
        Ok(msg) => handle_message(state, conn, msg).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        error!("Error handling message: {}", e);
        conn.send(ServerMessage::OperationFailed {
            message: e.to_string(),
        });
    }
}

async fn handle_message(state: &AppState, conn: &mut ConnState, msg: ClientMessage) -> Result<()> {
    match msg {
        ClientMessage::Identify { participant } => {
            debug!("Connection {} identified as {}", conn.id, participant);
            conn.participant = Some(participant);
            Ok(())
        }

        ClientMessage::JoinDocument { document_id } => join_document(state, conn, document_id).await,

        ClientMessage::SubmitChange { change } => submit_change(state, conn, change).await,

        ClientMessage::SaveDocument { content } => {
            save_snapshot(state, conn, content, AUTO_SAVE_DESCRIPTION.to_string()).await
        }

        ClientMessage::SaveVersion {
            content,
            description,
        } => {
            let description = match description {
                Some(d) if !d.trim().is_empty() => d,
                _ => MANUAL_SAVE_DESCRIPTION.to_string(),
            };
            save_snapshot(state, conn, content, description).await
        }

        ClientMessage::GetVersion {
            document_id,
            version_number,
        } => get_version(state, conn, document_id, version_number).await,

        ClientMessage::RestoreVersion {
            document_id,
            version_number,
        } => restore_version(state, conn, document_id, version_number).await,
    }
}

/// Join puts the connection in the room first, the way the rest of the
/// pipeline expects: relays that land between membership and the content
/// reply are deltas on top of the content the reply carries.
async fn join_document(
    state: &AppState,
    conn: &mut ConnState,
    document_id: DocumentId,
) -> Result<()> {
    info!("Connection {} joining document {}", conn.id, document_id);

    state
        .registry
        .join(document_id.clone(), conn.id, conn.tx.clone());
    conn.document = Some(document_id.clone());

    let content = state
        .db
        .load_or_create_document(&document_id, conn.participant.as_ref())
        .await?;
    conn.send(ServerMessage::DocumentLoaded { content });

    let versions = state
        .db
        .list_versions(&document_id, VERSION_LIST_LIMIT)
        .await?;
    conn.send(ServerMessage::VersionList { versions });

    Ok(())
}

async fn submit_change(
    state: &AppState,
    conn: &ConnState,
    change: serde_json::Value,
) -> Result<()> {
    let (document_id, room) = joined_room(state, conn)?;

    if room.mode(conn.id) != Some(ParticipantMode::Live) {
        debug!("Dropping change from {} while viewing history", conn.id);
        return Ok(());
    }

    let _turn = room.dispatch.lock().await;
    let delivered = room.relay(conn.id, &change);
    debug!(
        "Relayed change in {} to {} members",
        document_id, delivered
    );
    Ok(())
}

/// Both save triggers: persist canonical content, then append a version and
/// tell the whole room about it. Only the requester hears about failures.
async fn save_snapshot(
    state: &AppState,
    conn: &ConnState,
    content: serde_json::Value,
    description: String,
) -> Result<()> {
    let (document_id, room) = joined_room(state, conn)?;

    if room.mode(conn.id) != Some(ParticipantMode::Live) {
        debug!("Ignoring save from {} while viewing history", conn.id);
        return Ok(());
    }

    let _turn = room.dispatch.lock().await;
    state.db.save_document(&document_id, &content).await?;
    let version = state
        .db
        .create_version(&document_id, &content, conn.participant.as_ref(), &description)
        .await?;
    info!(
        "Saved version {} of {} ({})",
        version.version_number, document_id, version.description
    );
    room.broadcast(&ServerMessage::VersionCreated { version });
    Ok(())
}

async fn get_version(
    state: &AppState,
    conn: &ConnState,
    document_id: DocumentId,
    version_number: i64,
) -> Result<()> {
    let content = state.db.version_content(&document_id, version_number).await?;
    conn.send(ServerMessage::VersionLoaded { content });

    // Viewing a version of the joined document parks this member in history
    // view until it rejoins or restores; reads of other documents change
    // nothing
    if conn.document.as_ref() == Some(&document_id) {
        if let Some(room) = state.registry.room(&document_id) {
            room.set_mode(conn.id, ParticipantMode::ViewingHistory);
        }
    }
    Ok(())
}

/// Roll a document back to a prior snapshot: fetch it, write it as canonical
/// content, record a provenance version, then push the new state to the
/// whole room before confirming to the requester.
async fn restore_version(
    state: &AppState,
    conn: &ConnState,
    document_id: DocumentId,
    version_number: i64,
) -> Result<()> {
    let room = state.registry.room(&document_id);
    let _turn = match room.as_ref() {
        Some(room) => Some(room.dispatch.lock().await),
        None => None,
    };

    let content = state.db.version_content(&document_id, version_number).await?;
    state.db.save_document(&document_id, &content).await?;

    let description = format!("Document restored from version {}", version_number);
    let version = state
        .db
        .create_version(&document_id, &content, conn.participant.as_ref(), &description)
        .await?;
    let new_number = version.version_number;
    info!(
        "Document {} restored from version {} as version {}",
        document_id, version_number, new_number
    );

    if let Some(room) = room.as_ref() {
        room.broadcast(&ServerMessage::VersionCreated { version });
        room.broadcast(&ServerMessage::DocumentLoaded { content });
        // The requester is editing the restored state from here on
        room.set_mode(conn.id, ParticipantMode::Live);
    }

    conn.send(ServerMessage::RestoreConfirmed {
        success: true,
        version_number: new_number,
    });
    Ok(())
}

fn joined_room(state: &AppState, conn: &ConnState) -> Result<(DocumentId, Arc<Room>)> {
    let document_id = conn.document.clone().ok_or(CollabError::NotJoined)?;
    let room = state
        .registry
        .room(&document_id)
        .ok_or(CollabError::NotJoined)?;
    Ok((document_id, room))
}
