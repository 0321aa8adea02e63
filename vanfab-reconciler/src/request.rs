//! The certificate request loop.
//!
//! Pops the oldest `new` request whose not-before time has passed,
//! synthesizes the cluster certificate object for its kind, and advances
//! the request to `cm_cert_created`. The certificate authority acts on the
//! object; finalization picks up the resulting secret.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::Row;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use uuid::Uuid;

use vanfab_cluster::{
    new_object, set_annotation, ClusterPlatform, ANNOTATION_DBLINK, ANNOTATION_ISSUERLINK,
    ISSUER_ROOT,
};
use vanfab_db::{Database, EntityKind, Lifecycle};

use crate::ReconcileResult;

const IDLE_SLEEP: Duration = Duration::from_secs(2);
const ERROR_SLEEP: Duration = Duration::from_secs(10);

/// Name of the externally provisioned root issuer.
pub const ROOT_ISSUER_NAME: &str = "skx-root-issuer";

/// Cluster object name for a request's certificate and secret.
pub fn certificate_name(kind: EntityKind, target: Uuid) -> String {
    format!("skx-{}-{}", kind.as_str(), target)
}

/// One pass over the request queue; Ok(true) when a request was handled.
pub async fn step_request(
    db: &Database,
    platform: &dyn ClusterPlatform,
) -> ReconcileResult<bool> {
    let mut tx = db.begin().await?;
    let row = sqlx::query(
        "SELECT r.id, r.kind, r.target, r.issuer, r.duration_days, c.name AS issuer_name
         FROM certificate_requests r
         LEFT JOIN tls_certificates c ON r.issuer = c.id
         WHERE r.lifecycle = 'new' AND r.request_time <= now()
         ORDER BY r.created_at
         LIMIT 1",
    )
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        return Ok(false);
    };

    let request_id: Uuid = row.try_get("id")?;
    let kind = EntityKind::parse(row.try_get::<String, _>("kind")?.as_str())
        .map_err(vanfab_db::DbError::from)?;
    let target: Uuid = row.try_get("target")?;
    let issuer: Option<Uuid> = row.try_get("issuer")?;
    let duration_days: i64 = row.try_get("duration_days")?;
    let issuer_name: Option<String> = row.try_get("issuer_name")?;

    let object = build_certificate_object(
        db,
        request_id,
        kind,
        target,
        issuer,
        issuer_name.as_deref(),
        duration_days,
    )
    .await?;

    platform.apply_object(object).await?;

    sqlx::query("UPDATE certificate_requests SET lifecycle = $2 WHERE id = $1")
        .bind(request_id)
        .bind(Lifecycle::CmCertCreated.as_str())
        .execute(&mut *tx)
        .await?;
    tx.commit().await.map_err(vanfab_db::DbError::from)?;

    debug!(request = %request_id, kind = %kind, "certificate object created");
    Ok(true)
}

async fn build_certificate_object(
    db: &Database,
    request_id: Uuid,
    kind: EntityKind,
    target: Uuid,
    issuer: Option<Uuid>,
    issuer_name: Option<&str>,
    duration_days: i64,
) -> ReconcileResult<serde_json::Value> {
    let name = certificate_name(kind, target);
    let mut object = new_object("cert-manager.io/v1", "Certificate", &name);

    set_annotation(&mut object, ANNOTATION_DBLINK, &request_id.to_string());
    let issuer_link = issuer
        .map(|id| id.to_string())
        .unwrap_or_else(|| ISSUER_ROOT.to_string());
    set_annotation(&mut object, ANNOTATION_ISSUERLINK, &issuer_link);

    let mut spec = json!({
        "secretName": name,
        "commonName": name,
        "duration": format!("{}h", duration_days * 24),
        "issuerRef": {
            "name": issuer_name.unwrap_or(ROOT_ISSUER_NAME),
            "kind": "Issuer"
        }
    });
    if kind.issues_ca() {
        spec["isCA"] = json!(true);
    }
    // Server certificates carry the ingress hostname.
    if kind == EntityKind::AccessPoint {
        let row = sqlx::query("SELECT hostname FROM backbone_access_points WHERE id = $1")
            .bind(target)
            .fetch_optional(db.pool())
            .await?;
        if let Some(row) = row {
            if let Some(hostname) = row.try_get::<Option<String>, _>("hostname")? {
                spec["dnsNames"] = json!([hostname]);
            }
        }
    }
    object["spec"] = spec;
    Ok(object)
}

/// Run the request loop until shutdown.
pub async fn run_request_loop(
    db: Database,
    platform: Arc<dyn ClusterPlatform>,
    shutdown: Arc<Notify>,
) {
    info!("certificate request loop started");
    loop {
        let delay = match step_request(&db, platform.as_ref()).await {
            Ok(true) => continue,
            Ok(false) => IDLE_SLEEP,
            Err(e) => {
                error!("request loop step failed: {e}");
                ERROR_SLEEP
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.notified() => {
                info!("certificate request loop stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_names_embed_kind_and_target() {
        let id = Uuid::new_v4();
        assert_eq!(
            certificate_name(EntityKind::InteriorSite, id),
            format!("skx-interiorsite-{id}")
        );
        assert_eq!(
            certificate_name(EntityKind::Backbone, id),
            format!("skx-backbone-{id}")
        );
    }
}
