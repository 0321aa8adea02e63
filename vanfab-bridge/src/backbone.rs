//! Backbone-peer handlers.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use vanfab_db::{BackboneAccessPoint, InterRouterLink, InteriorSite, Lifecycle};
use vanfab_manifest::{hash_of_object_no_children, StateKey};
use vanfab_reconciler::evaluator;
use vanfab_sync::{SyncError, SyncResult};

use crate::SyncBridge;

impl SyncBridge {
    /// Initial manifests for an interior router that just appeared.
    ///
    /// `local_state` advertises the site's client credential, each ready
    /// access point's server credential, every access point descriptor, and
    /// every ready outgoing link. `remote_state` expects the runtime
    /// `accessstatus` reports the router discovers.
    pub(crate) async fn new_backbone_peer(
        &self,
        site: Uuid,
    ) -> SyncResult<(HashMap<String, String>, HashMap<String, String>)> {
        let row: Option<InteriorSite> =
            sqlx::query_as("SELECT * FROM interior_sites WHERE id = $1")
                .bind(site)
                .fetch_optional(self.db().pool())
                .await
                .map_err(vanfab_db::DbError::from)?;
        let Some(row) = row else {
            return Err(SyncError::Events(format!("no interior site {site}")));
        };

        let mut local_state = HashMap::new();
        let mut remote_state = HashMap::new();

        if let Ok((hash, _)) = self.credential_secret(row.certificate).await {
            local_state.insert(StateKey::TlsSite(site).to_string(), hash);
        }

        let access_points: Vec<BackboneAccessPoint> =
            sqlx::query_as("SELECT * FROM backbone_access_points WHERE interior_site = $1")
                .bind(site)
                .fetch_all(self.db().pool())
                .await
                .map_err(vanfab_db::DbError::from)?;
        for ap in &access_points {
            let ready = ap.lifecycle()? == Lifecycle::Ready;
            if ready {
                if let Ok((hash, _)) = self.credential_secret(ap.certificate).await {
                    local_state.insert(StateKey::TlsServer(ap.id).to_string(), hash);
                }
                remote_state.insert(StateKey::AccessStatus(ap.id).to_string(), String::new());
            }
            local_state.insert(
                StateKey::Access(ap.id).to_string(),
                access_descriptor_hash(ap),
            );
        }

        let links: Vec<InterRouterLink> = sqlx::query_as(
            "SELECT l.* FROM inter_router_links l
             JOIN backbone_access_points ap ON l.access_point = ap.id
             WHERE l.connecting_interior_site = $1 AND ap.lifecycle = 'ready'",
        )
        .bind(site)
        .fetch_all(self.db().pool())
        .await
        .map_err(vanfab_db::DbError::from)?;
        for link in &links {
            if let Ok((hash, _)) = self.link_descriptor(link.id).await {
                local_state.insert(StateKey::Link(link.id).to_string(), hash);
            }
        }

        // First contact from a ready router activates it.
        let mut tx = self.db().begin().await?;
        if row.lifecycle()? == Lifecycle::Ready {
            sqlx::query(
                "UPDATE interior_sites
                 SET lifecycle = $2, first_active_time = $3, last_heartbeat = $3
                 WHERE id = $1",
            )
            .bind(site)
            .bind(Lifecycle::Active.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(vanfab_db::DbError::from)?;
            evaluator::site_lifecycle_changed(&mut tx, site).await?;
            info!(site = %site, "interior site active");
        } else {
            sqlx::query("UPDATE interior_sites SET last_heartbeat = $2 WHERE id = $1")
                .bind(site)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(vanfab_db::DbError::from)?;
        }
        tx.commit().await.map_err(vanfab_db::DbError::from)?;

        Ok((local_state, remote_state))
    }

    /// Pulled `accessstatus` reports promote partial access points to `new`
    /// once the router has discovered their host and port. Everything else
    /// is advisory.
    pub(crate) async fn backbone_state_change(
        &self,
        key: &str,
        hash: Option<&str>,
        data: Option<Value>,
    ) -> SyncResult<()> {
        let Some(StateKey::AccessStatus(ap_id)) = StateKey::parse(key) else {
            debug!(key, "advisory state key");
            return Ok(());
        };
        if hash.is_none() {
            return Ok(()); // deletion of a status report carries nothing
        }
        let Some(data) = data else {
            return Ok(());
        };
        let host = data.get("host").and_then(Value::as_str);
        let port = data.get("port").and_then(Value::as_str);
        let (Some(host), Some(port)) = (host, port) else {
            debug!(key, "accessstatus without host/port ignored");
            return Ok(());
        };

        let mut tx = self.db().begin().await?;
        let updated = sqlx::query(
            "UPDATE backbone_access_points
             SET hostname = $2, port = $3, lifecycle = $4
             WHERE id = $1 AND lifecycle = $5",
        )
        .bind(ap_id)
        .bind(host)
        .bind(port)
        .bind(Lifecycle::New.as_str())
        .bind(Lifecycle::Partial.as_str())
        .execute(&mut *tx)
        .await
        .map_err(vanfab_db::DbError::from)?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;

        if updated.rows_affected() > 0 {
            info!(access_point = %ap_id, host, port, "access point ingress reported");
        }
        Ok(())
    }

    /// Serve one of the keys this site's manifest advertises.
    pub(crate) async fn backbone_state_request(
        &self,
        peer_id: &str,
        key: &str,
    ) -> SyncResult<(String, Value)> {
        match StateKey::parse(key) {
            Some(StateKey::TlsSite(site)) => {
                let row = sqlx::query("SELECT certificate FROM interior_sites WHERE id = $1")
                    .bind(site)
                    .fetch_optional(self.db().pool())
                    .await
                    .map_err(vanfab_db::DbError::from)?
                    .ok_or_else(|| SyncError::Events(format!("no interior site {site}")))?;
                let certificate: Option<Uuid> =
                    row.try_get("certificate").map_err(vanfab_db::DbError::from)?;
                let (hash, data) = self.credential_secret(certificate).await?;
                Ok((hash, Value::Object(data)))
            }
            Some(StateKey::TlsServer(ap)) => {
                let row =
                    sqlx::query("SELECT certificate FROM backbone_access_points WHERE id = $1")
                        .bind(ap)
                        .fetch_optional(self.db().pool())
                        .await
                        .map_err(vanfab_db::DbError::from)?
                        .ok_or_else(|| SyncError::Events(format!("no access point {ap}")))?;
                let certificate: Option<Uuid> =
                    row.try_get("certificate").map_err(vanfab_db::DbError::from)?;
                let (hash, data) = self.credential_secret(certificate).await?;
                Ok((hash, Value::Object(data)))
            }
            Some(StateKey::Access(ap)) => {
                let row: Option<BackboneAccessPoint> =
                    sqlx::query_as("SELECT * FROM backbone_access_points WHERE id = $1")
                        .bind(ap)
                        .fetch_optional(self.db().pool())
                        .await
                        .map_err(vanfab_db::DbError::from)?;
                let row = row.ok_or_else(|| SyncError::Events(format!("no access point {ap}")))?;
                let data = access_descriptor(&row);
                let hash = hash_of_object_no_children(data.as_object().unwrap());
                Ok((hash, data))
            }
            Some(StateKey::Link(link)) => self.link_descriptor(link).await,
            _ => Err(SyncError::Events(format!(
                "peer {peer_id} requested unknown key {key}"
            ))),
        }
    }

    /// `{host, port, cost}` of an inter-router link, fetched through its
    /// target access point.
    pub(crate) async fn link_descriptor(&self, link: Uuid) -> SyncResult<(String, Value)> {
        let row = sqlx::query(
            "SELECT l.cost, ap.hostname, ap.port
             FROM inter_router_links l
             JOIN backbone_access_points ap ON l.access_point = ap.id
             WHERE l.id = $1",
        )
        .bind(link)
        .fetch_optional(self.db().pool())
        .await
        .map_err(vanfab_db::DbError::from)?
        .ok_or_else(|| SyncError::Events(format!("no inter-router link {link}")))?;
        let cost: i32 = row.try_get("cost").map_err(vanfab_db::DbError::from)?;
        let hostname: Option<String> = row.try_get("hostname").map_err(vanfab_db::DbError::from)?;
        let port: Option<String> = row.try_get("port").map_err(vanfab_db::DbError::from)?;
        let data = json!({
            "host": hostname.unwrap_or_default(),
            "port": port.unwrap_or_default(),
            "cost": cost.to_string(),
        });
        let hash = hash_of_object_no_children(data.as_object().unwrap());
        Ok((hash, data))
    }
}

/// Access-point descriptor served over `access-*` keys.
pub(crate) fn access_descriptor(ap: &BackboneAccessPoint) -> Value {
    let mut data = serde_json::Map::new();
    data.insert("kind".into(), json!(ap.kind));
    if let Some(bind_host) = &ap.bind_host {
        data.insert("bindhost".into(), json!(bind_host));
    }
    Value::Object(data)
}

pub(crate) fn access_descriptor_hash(ap: &BackboneAccessPoint) -> String {
    hash_of_object_no_children(access_descriptor(ap).as_object().unwrap())
}
