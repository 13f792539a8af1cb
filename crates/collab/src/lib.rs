//! Realtime collaboration layer: the wire protocol spoken over the websocket
//! channel and the registry of per-document rooms it fans out through.

use thiserror::Error;

mod protocol;
pub use protocol::*;

mod rooms;
pub use rooms::*;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("connection has not joined a document")]
    NotJoined,

    #[error("malformed message: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;
