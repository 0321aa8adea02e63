//! Per-kind certificate reconciler loops.
//!
//! Each loop claims one `new` row that satisfies its kind's predicate,
//! queues a certificate request, and advances the row to `skx_cr_created`,
//! all in one transaction. An empty select sleeps 2 seconds; a transaction
//! error rolls back and sleeps 10.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{Postgres, Row, Transaction};
use tokio::sync::Notify;
use tracing::{debug, error, info};
use uuid::Uuid;

use vanfab_db::{Database, EntityKind, Lifecycle};

use crate::ReconcileResult;

const IDLE_SLEEP: Duration = Duration::from_secs(2);
const ERROR_SLEEP: Duration = Duration::from_secs(10);

/// The table owning each entity kind.
pub(crate) fn entity_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::ManagementController => "management_controllers",
        EntityKind::Backbone => "backbones",
        EntityKind::AccessPoint => "backbone_access_points",
        EntityKind::ApplicationNetwork => "application_networks",
        EntityKind::InteriorSite => "interior_sites",
        EntityKind::NetworkCredential => "network_credentials",
        EntityKind::MemberInvitation => "member_invitations",
        EntityKind::MemberSite => "member_sites",
    }
}

/// A claimed candidate row: the target entity and the credential that will
/// sign its certificate (None for the external root issuer).
struct Candidate {
    target: Uuid,
    issuer: Option<Uuid>,
}

/// Drives all eight per-kind loops.
pub struct CertificateReconciler {
    db: Database,
    shutdown: Arc<Notify>,
}

impl CertificateReconciler {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn one loop per managed kind.
    pub fn spawn_all(self: Arc<Self>) {
        for kind in [
            EntityKind::ManagementController,
            EntityKind::Backbone,
            EntityKind::InteriorSite,
            EntityKind::AccessPoint,
            EntityKind::ApplicationNetwork,
            EntityKind::NetworkCredential,
            EntityKind::MemberInvitation,
            EntityKind::MemberSite,
        ] {
            let reconciler = Arc::clone(&self);
            tokio::spawn(async move {
                reconciler.run_kind(kind).await;
            });
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    async fn run_kind(&self, kind: EntityKind) {
        info!(kind = %kind, "certificate reconciler started");
        loop {
            let delay = match self.step(kind).await {
                Ok(true) => continue,
                Ok(false) => IDLE_SLEEP,
                Err(e) => {
                    error!(kind = %kind, "reconciler step failed: {e}");
                    ERROR_SLEEP
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => {
                    info!(kind = %kind, "certificate reconciler stopped");
                    return;
                }
            }
        }
    }

    /// One reconcile step; Ok(true) when a row was claimed.
    pub async fn step(&self, kind: EntityKind) -> ReconcileResult<bool> {
        let mut tx = self.db.begin().await?;
        let Some(candidate) = select_candidate(&mut tx, kind).await? else {
            return Ok(false);
        };

        sqlx::query(
            "INSERT INTO certificate_requests
                 (id, kind, target, issuer, duration_days, request_time, lifecycle, created_at)
             VALUES ($1, $2, $3, $4, $5, now(), $6, now())",
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(candidate.target)
        .bind(candidate.issuer)
        .bind(kind.default_duration_days())
        .bind(Lifecycle::New.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "UPDATE {} SET lifecycle = $2 WHERE id = $1",
            entity_table(kind)
        ))
        .bind(candidate.target)
        .bind(Lifecycle::SkxCrCreated.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        debug!(kind = %kind, target = %candidate.target, "certificate request queued");
        Ok(true)
    }
}

/// Select one row satisfying the kind's `new` predicate, along with its
/// issuing credential.
async fn select_candidate(
    tx: &mut Transaction<'static, Postgres>,
    kind: EntityKind,
) -> ReconcileResult<Option<Candidate>> {
    let query = match kind {
        // Root-issued credentials: the controller's client cert and each
        // backbone's CA.
        EntityKind::ManagementController => {
            "SELECT id AS target, NULL::uuid AS issuer
             FROM management_controllers WHERE lifecycle = 'new' LIMIT 1"
        }
        EntityKind::Backbone => {
            "SELECT id AS target, NULL::uuid AS issuer
             FROM backbones WHERE lifecycle = 'new' LIMIT 1"
        }
        // Backbone-issued credentials require the backbone CA to be ready.
        EntityKind::InteriorSite => {
            "SELECT s.id AS target, b.certificate AS issuer
             FROM interior_sites s
             JOIN backbones b ON s.backbone = b.id
             WHERE s.lifecycle = 'new' AND b.lifecycle = 'ready' LIMIT 1"
        }
        EntityKind::AccessPoint => {
            "SELECT ap.id AS target, b.certificate AS issuer
             FROM backbone_access_points ap
             JOIN interior_sites s ON ap.interior_site = s.id
             JOIN backbones b ON s.backbone = b.id
             WHERE ap.lifecycle = 'new' AND b.lifecycle = 'ready' LIMIT 1"
        }
        EntityKind::ApplicationNetwork => {
            "SELECT v.id AS target, b.certificate AS issuer
             FROM application_networks v
             JOIN backbones b ON v.backbone = b.id
             WHERE v.lifecycle = 'new' AND b.lifecycle = 'ready' LIMIT 1"
        }
        // VAN-issued credentials require the VAN CA to be ready.
        EntityKind::NetworkCredential => {
            "SELECT c.id AS target, v.certificate AS issuer
             FROM network_credentials c
             JOIN application_networks v ON c.van = v.id
             WHERE c.lifecycle = 'new' AND v.lifecycle = 'ready' LIMIT 1"
        }
        EntityKind::MemberInvitation => {
            "SELECT i.id AS target, v.certificate AS issuer
             FROM member_invitations i
             JOIN application_networks v ON i.van = v.id
             WHERE i.lifecycle = 'new' AND v.lifecycle = 'ready' LIMIT 1"
        }
        EntityKind::MemberSite => {
            "SELECT m.id AS target, v.certificate AS issuer
             FROM member_sites m
             JOIN application_networks v ON m.van = v.id
             WHERE m.lifecycle = 'new' AND v.lifecycle = 'ready' LIMIT 1"
        }
    };

    let row = sqlx::query(query).fetch_optional(&mut **tx).await?;
    Ok(match row {
        Some(row) => Some(Candidate {
            target: row.try_get("target")?,
            issuer: row.try_get("issuer")?,
        }),
        None => None,
    })
}
