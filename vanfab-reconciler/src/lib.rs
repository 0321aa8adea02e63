//! Lifecycle reconcilers.
//!
//! One queue-draining loop per managed entity kind turns `new` rows into
//! certificate requests; the request loop turns requests into cluster
//! certificate objects; the finalization watches turn arriving secrets into
//! `tls_certificates` rows and `ready` entities. Pruning sweeps collect
//! cluster objects and credential rows whose owners vanished. The
//! deployment-state evaluator also lives here since every trigger fires
//! inside a reconciler or admin transaction.

pub mod evaluator;
mod finalize;
mod loops;
mod prune;
mod request;

pub use finalize::{finalize_secret, run_certificate_watch, run_secret_watch};
pub use loops::CertificateReconciler;
pub use prune::{run_prune_loop, sweep_certificate_rows, sweep_cluster_objects};
pub use request::{certificate_name, run_request_loop, step_request, ROOT_ISSUER_NAME};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Errors raised inside reconciler steps. A failed step rolls back its
/// transaction and the loop retries after back-off.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Database error: {0}")]
    Db(#[from] vanfab_db::DbError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] vanfab_cluster::ClusterError),

    /// A cluster object was missing a field finalization requires
    #[error("Malformed cluster object: {0}")]
    Malformed(String),
}

impl From<sqlx::Error> for ReconcileError {
    fn from(e: sqlx::Error) -> Self {
        ReconcileError::Db(vanfab_db::DbError::from(e))
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Post-commit notifications for the bridge and the claim server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerEvent {
    /// An interior site's client credential finalized
    SiteCertificateChanged { site: Uuid },
    /// An access point's server credential finalized
    AccessCertificateChanged { access_point: Uuid },
    /// A member site's credential finalized; claim completion may fire
    MemberReady { member: Uuid },
}

pub type EventSender = mpsc::UnboundedSender<ReconcilerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ReconcilerEvent>;

/// Create the reconciler event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
