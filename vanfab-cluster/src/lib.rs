//! Cluster collaborator interface.
//!
//! The controller creates, reads, and watches cluster objects (certificates,
//! issuers, secrets, config maps) through the small [`ClusterPlatform`]
//! trait. The production implementation wraps the cluster's object watcher
//! and CRUD helper and lives outside this workspace; the in-memory
//! [`MemoryPlatform`] here backs tests and standalone operation.

mod annotations;
mod memory;
mod object;
mod platform;

pub use annotations::*;
pub use memory::MemoryPlatform;
pub use object::*;
pub use platform::{ClusterPlatform, WatchAction, WatchEvent};

use thiserror::Error;

/// Errors surfaced by a cluster platform.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The platform rejected a malformed object
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Transport or API-server failure
    #[error("Cluster API error: {0}")]
    Api(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
