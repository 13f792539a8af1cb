//! Message types exchanged between client and server.
//!
//! Both directions are closed tagged enums: an incoming frame either parses
//! into a known variant or is rejected at the boundary, and dispatch is an
//! exhaustive match. Change records and document content stay opaque
//! `serde_json::Value`s; the server relays and stores them, never merges.

use document::{DocumentId, ParticipantId, VersionSummary};
use serde::{Deserialize, Serialize};

use crate::{CollabError, Result};

/// Parse one incoming text frame into a typed message. Anything outside the
/// closed vocabulary is a protocol error, not a transport failure.
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    serde_json::from_str(text).map_err(|e| CollabError::Protocol(e.to_string()))
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    // Session management
    #[serde(rename = "join-document")]
    JoinDocument { document_id: DocumentId },

    /// Best-effort author identity for version attribution; unauthenticated.
    #[serde(rename = "identify")]
    Identify { participant: ParticipantId },

    // Live editing
    #[serde(rename = "submit-change")]
    SubmitChange { change: serde_json::Value },

    // Persistence triggers
    #[serde(rename = "save-document")]
    SaveDocument { content: serde_json::Value },

    #[serde(rename = "save-version")]
    SaveVersion {
        content: serde_json::Value,
        #[serde(default)]
        description: Option<String>,
    },

    // Version history
    #[serde(rename = "get-version")]
    GetVersion {
        document_id: DocumentId,
        version_number: i64,
    },

    #[serde(rename = "restore-version")]
    RestoreVersion {
        document_id: DocumentId,
        version_number: i64,
    },
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    // Join replies; document-loaded is also rebroadcast after a restore
    #[serde(rename = "document-loaded")]
    DocumentLoaded { content: serde_json::Value },

    #[serde(rename = "version-list")]
    VersionList { versions: Vec<VersionSummary> },

    // Live editing
    #[serde(rename = "change-received")]
    ChangeReceived { change: serde_json::Value },

    // Version history
    #[serde(rename = "version-created")]
    VersionCreated { version: VersionSummary },

    #[serde(rename = "version-loaded")]
    VersionLoaded { content: serde_json::Value },

    #[serde(rename = "restore-confirmed")]
    RestoreConfirmed { success: bool, version_number: i64 },

    // Error handling
    #[serde(rename = "operation-failed")]
    OperationFailed { message: String },
}
