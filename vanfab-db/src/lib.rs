//! Relational state store for the VAN fabric management controller.
//!
//! Every managed entity — backbones, interior sites, access points, tenant
//! networks, invitations, member sites, credentials — lives in a Postgres
//! table described here. All mutations that touch more than one row run
//! inside a transaction obtained from [`Database::begin`]; dropping the
//! transaction on an error path rolls it back.

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::info;

mod error;
mod rows;
mod schema;
mod types;

pub use error::{DbError, DbResult};
pub use rows::*;
pub use types::*;

/// Handle on the controller database.
///
/// Cheap to clone; all clones share one connection pool. Handlers check a
/// connection out per invocation and release it on every exit path.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database and size the pool for the reconciler fleet.
    pub async fn connect(url: &str) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        info!("connected to controller database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema DDL. Idempotent; runs at process startup.
    pub async fn ensure_schema(&self) -> DbResult<()> {
        schema::ensure_schema(&self.pool).await
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> DbResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Direct pool access for single-statement reads.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
