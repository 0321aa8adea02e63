//! Event-driven finalization.
//!
//! The secret watch resolves certificate requests: a secret annotated with
//! the owning request id yields a `tls_certificates` row, advances the
//! owning entity to `ready`, and deletes the request — one transaction.
//! The certificate watch refreshes expiration and renewal times as the
//! certificate authority rotates material.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::Row;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vanfab_cluster::{
    annotation, new_object, object_name, ClusterPlatform, WatchEvent, ANNOTATION_DBLINK,
    ANNOTATION_ISSUERLINK, ISSUER_ROOT,
};
use vanfab_db::{Database, EntityKind, Lifecycle};

use crate::evaluator;
use crate::loops::entity_table;
use crate::{EventSender, ReconcileError, ReconcileResult, ReconcilerEvent};

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Resolve one arriving secret against the request queue. Returns the
/// post-commit event to publish, or None when the secret resolves nothing.
pub async fn finalize_secret(
    db: &Database,
    platform: &dyn ClusterPlatform,
    secret: &serde_json::Value,
) -> ReconcileResult<Option<ReconcilerEvent>> {
    let Some(dblink) = annotation(secret, ANNOTATION_DBLINK) else {
        return Ok(None);
    };
    let Ok(request_id) = Uuid::parse_str(dblink) else {
        warn!(dblink, "secret carries an unparsable request link");
        return Ok(None);
    };
    let name = object_name(secret)
        .ok_or_else(|| ReconcileError::Malformed("secret without a name".into()))?
        .to_string();

    let mut tx = db.begin().await?;
    let row = sqlx::query("SELECT kind, target FROM certificate_requests WHERE id = $1")
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        // Already resolved; rotation updates come through the cert watch.
        return Ok(None);
    };
    let kind = EntityKind::parse(row.try_get::<String, _>("kind")?.as_str())
        .map_err(vanfab_db::DbError::from)?;
    let target: Uuid = row.try_get("target")?;

    // Expiration and renewal come from the certificate object's status.
    let certificate = platform.load_certificate(&name).await?;
    let (expiration, renewal_time) = match &certificate {
        Some(cert) => (
            parse_time(cert.pointer("/status/notAfter").and_then(|v| v.as_str())),
            parse_time(cert.pointer("/status/renewalTime").and_then(|v| v.as_str())),
        ),
        None => (None, None),
    };

    let signed_by = match annotation(secret, ANNOTATION_ISSUERLINK) {
        Some(link) if link == ISSUER_ROOT => None,
        Some(link) => match Uuid::parse_str(link) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(link, "unparsable issuer link; treating as root");
                None
            }
        },
        None => None,
    };

    let cert_id = Uuid::new_v4();
    let is_ca = kind.issues_ca();
    sqlx::query(
        "INSERT INTO tls_certificates (id, name, is_ca, signed_by, expiration, renewal_time)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(cert_id)
    .bind(&name)
    .bind(is_ca)
    .bind(signed_by)
    .bind(expiration)
    .bind(renewal_time)
    .execute(&mut *tx)
    .await?;

    sqlx::query(&format!(
        "UPDATE {} SET lifecycle = $2, certificate = $3 WHERE id = $1",
        entity_table(kind)
    ))
    .bind(target)
    .bind(Lifecycle::Ready.as_str())
    .bind(cert_id)
    .execute(&mut *tx)
    .await?;

    // Readiness may change the site's deployability; same transaction.
    if kind == EntityKind::InteriorSite {
        evaluator::site_lifecycle_changed(&mut tx, target).await?;
    }

    sqlx::query("DELETE FROM certificate_requests WHERE id = $1")
        .bind(request_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await.map_err(vanfab_db::DbError::from)?;
    info!(kind = %kind, target = %target, certificate = %name, "credential finalized");

    // CA credentials become issuers for their subtree.
    if is_ca {
        let mut issuer = new_object("cert-manager.io/v1", "Issuer", &name);
        issuer["spec"] = json!({"ca": {"secretName": name}});
        platform.apply_object(issuer).await?;
    }

    Ok(match kind {
        EntityKind::InteriorSite => Some(ReconcilerEvent::SiteCertificateChanged { site: target }),
        EntityKind::AccessPoint => Some(ReconcilerEvent::AccessCertificateChanged {
            access_point: target,
        }),
        EntityKind::MemberSite => Some(ReconcilerEvent::MemberReady { member: target }),
        _ => None,
    })
}

/// Consume the secret watch until the channel closes.
pub async fn run_secret_watch(
    db: Database,
    platform: Arc<dyn ClusterPlatform>,
    events: EventSender,
    mut watch: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
) {
    info!("secret watch started");
    while let Some(event) = watch.recv().await {
        match finalize_secret(&db, platform.as_ref(), &event.object).await {
            Ok(Some(reconciler_event)) => {
                if events.send(reconciler_event).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => error!("secret finalization failed: {e}"),
        }
    }
}

/// Refresh stored expiration/renewal times as certificates rotate.
pub async fn run_certificate_watch(
    db: Database,
    mut watch: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
) {
    info!("certificate watch started");
    while let Some(event) = watch.recv().await {
        let Some(name) = object_name(&event.object).map(str::to_string) else {
            continue;
        };
        let expiration = parse_time(
            event
                .object
                .pointer("/status/notAfter")
                .and_then(|v| v.as_str()),
        );
        let renewal_time = parse_time(
            event
                .object
                .pointer("/status/renewalTime")
                .and_then(|v| v.as_str()),
        );
        if expiration.is_none() && renewal_time.is_none() {
            continue;
        }
        let result = sqlx::query(
            "UPDATE tls_certificates SET expiration = COALESCE($2, expiration),
                 renewal_time = COALESCE($3, renewal_time)
             WHERE name = $1",
        )
        .bind(&name)
        .bind(expiration)
        .bind(renewal_time)
        .execute(db.pool())
        .await;
        match result {
            Ok(done) if done.rows_affected() > 0 => {
                debug!(certificate = %name, "rotation times refreshed")
            }
            Ok(_) => {}
            Err(e) => error!(certificate = %name, "rotation refresh failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_times_parse() {
        let t = parse_time(Some("2026-08-01T00:00:00Z")).unwrap();
        assert_eq!(t.timezone(), Utc);
        assert!(parse_time(Some("not a time")).is_none());
        assert!(parse_time(None).is_none());
    }
}
