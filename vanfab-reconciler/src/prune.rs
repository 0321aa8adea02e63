//! Pruning sweeps.
//!
//! Two collectors run periodically. The first deletes controlled cluster
//! issuers, certificates, and secrets whose database reference vanished.
//! The second deletes `tls_certificates` rows no managed entity references,
//! depth-first so leaf credentials free before the CAs that signed them.

use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;
use tokio::sync::Notify;
use tracing::{error, info};
use uuid::Uuid;

use vanfab_cluster::{annotation, object_name, ClusterPlatform, ANNOTATION_CONTROLLED, ANNOTATION_DBLINK};
use vanfab_db::Database;

use crate::ReconcileResult;

const PRUNE_PERIOD: Duration = Duration::from_secs(60);

/// Tables whose `certificate` column keeps a credential alive.
const REFERENCING_TABLES: &[&str] = &[
    "management_controllers",
    "backbones",
    "interior_sites",
    "backbone_access_points",
    "application_networks",
    "network_credentials",
    "member_invitations",
    "member_sites",
];

/// Delete controlled cluster objects whose backing rows are gone.
pub async fn sweep_cluster_objects(
    db: &Database,
    platform: &dyn ClusterPlatform,
) -> ReconcileResult<usize> {
    let mut removed = 0;
    for kind in ["Issuer", "Certificate", "Secret"] {
        for object in platform.list_objects(kind).await? {
            if annotation(&object, ANNOTATION_CONTROLLED) != Some("true") {
                continue;
            }
            let Some(name) = object_name(&object) else {
                continue;
            };

            let referenced = sqlx::query("SELECT 1 FROM tls_certificates WHERE name = $1 LIMIT 1")
                .bind(name)
                .fetch_optional(db.pool())
                .await?
                .is_some();
            if referenced {
                continue;
            }

            // A certificate object can precede its tls_certificates row:
            // the request is still in flight. Leave those alone.
            if let Some(dblink) = annotation(&object, ANNOTATION_DBLINK) {
                if let Ok(request_id) = Uuid::parse_str(dblink) {
                    let pending =
                        sqlx::query("SELECT 1 FROM certificate_requests WHERE id = $1 LIMIT 1")
                            .bind(request_id)
                            .fetch_optional(db.pool())
                            .await?
                            .is_some();
                    if pending {
                        continue;
                    }
                }
            }

            platform.delete_object(kind, name).await?;
            info!(kind, name, "orphaned cluster object pruned");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Delete unreferenced credential rows depth-first. Each pass removes rows
/// referenced neither by a managed entity, a pending request, nor as the
/// signer of a surviving credential; repeating to fixpoint frees leaf CAs
/// last.
pub async fn sweep_certificate_rows(
    db: &Database,
    platform: &dyn ClusterPlatform,
) -> ReconcileResult<usize> {
    let mut removed = 0;
    loop {
        let entity_refs = REFERENCING_TABLES
            .iter()
            .map(|table| format!("SELECT certificate FROM {table} WHERE certificate IS NOT NULL"))
            .collect::<Vec<_>>()
            .join(" UNION ");
        let query = format!(
            "SELECT id, name FROM tls_certificates c
             WHERE c.id NOT IN ({entity_refs})
               AND NOT EXISTS (SELECT 1 FROM tls_certificates child WHERE child.signed_by = c.id)
               AND NOT EXISTS (SELECT 1 FROM certificate_requests r WHERE r.issuer = c.id)"
        );
        let rows = sqlx::query(&query).fetch_all(db.pool()).await?;
        if rows.is_empty() {
            return Ok(removed);
        }
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            sqlx::query("DELETE FROM tls_certificates WHERE id = $1")
                .bind(id)
                .execute(db.pool())
                .await?;
            for kind in ["Issuer", "Certificate", "Secret"] {
                platform.delete_object(kind, &name).await?;
            }
            info!(certificate = %name, "unreferenced credential pruned");
            removed += 1;
        }
    }
}

/// Run both sweeps until shutdown.
pub async fn run_prune_loop(
    db: Database,
    platform: Arc<dyn ClusterPlatform>,
    shutdown: Arc<Notify>,
) {
    info!("prune loop started");
    loop {
        if let Err(e) = sweep_cluster_objects(&db, platform.as_ref()).await {
            error!("cluster object sweep failed: {e}");
        }
        if let Err(e) = sweep_certificate_rows(&db, platform.as_ref()).await {
            error!("credential row sweep failed: {e}");
        }
        tokio::select! {
            _ = tokio::time::sleep(PRUNE_PERIOD) => {}
            _ = shutdown.notified() => {
                info!("prune loop stopped");
                return;
            }
        }
    }
}
