//! Application compose engine.
//!
//! Applications are declarative compositions of typed library blocks wired
//! by polarity-constrained bindings. Building an application instantiates
//! the block graph from the library; deploying expands each allocated
//! instance's templates per matching member site and stores the result in
//! the site-data table.

mod engine;
mod graph;
mod library;

pub use engine::{BuiltApplication, ComposeEngine, DeploySummary};
pub use graph::{build_graph, AppGraph, Binding, IfaceState, Instance};
pub use library::{
    Allocation, BlockBody, BlockType, BodyTemplate, CompositeBody, CompositeBinding, Endpoint,
    InterfaceDecl, Library, LibraryBlock, Polarity,
};

use thiserror::Error;

/// Errors raised while building or deploying applications.
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Database error: {0}")]
    Db(#[from] vanfab_db::DbError),

    /// A library block's stored spec did not parse
    #[error("Bad library block '{block}': {message}")]
    BadBlock { block: String, message: String },

    /// A referenced block is not in the library
    #[error("Unknown library block '{0}'")]
    UnknownBlock(String),

    /// A binding endpoint did not resolve
    #[error("Bad binding endpoint {path}:{interface}: {message}")]
    BadEndpoint {
        path: String,
        interface: String,
        message: String,
    },

    /// Polarity, role, or budget violation
    #[error("Binding rejected: {0}")]
    BindingRejected(String),

    #[error("Template error: {0}")]
    Template(#[from] vanfab_manifest::ManifestError),
}

impl From<sqlx::Error> for ComposeError {
    fn from(e: sqlx::Error) -> Self {
        ComposeError::Db(vanfab_db::DbError::from(e))
    }
}

pub type ComposeResult<T> = Result<T, ComposeError>;
