//! State synchronization between the controller and its router peers.
//!
//! Two subsystems live here. The [`StateSync`] engine maintains an
//! eventually-consistent view of each peer's state by exchanging hash-set
//! manifests over heartbeats and pulling changed entries on demand. The
//! [`BackboneLinkManager`] keeps exactly one transport session open per
//! reachable manage-kind access point and fans session lifecycle out to
//! subscribers.

mod engine;
mod links;

pub use engine::{PeerEvents, StateSync, SyncConfig};
pub use links::{BackboneLinkManager, LinkObserver, SessionConnector};

use thiserror::Error;

/// Errors surfaced by the sync subsystems.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] vanfab_transport::TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] vanfab_protocol::ProtocolError),

    #[error("Database error: {0}")]
    Db(#[from] vanfab_db::DbError),

    /// No session is registered for the requested connection key
    #[error("No connection for {0}")]
    NoConnection(String),

    /// The embedding's event handler failed
    #[error("Peer event handler error: {0}")]
    Events(String),
}

pub type SyncResult<T> = Result<T, SyncError>;
