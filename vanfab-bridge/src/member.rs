//! Member-peer handlers.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use vanfab_db::{Lifecycle, MemberSite};
use vanfab_manifest::StateKey;
use vanfab_sync::{SyncError, SyncResult};

use crate::SyncBridge;

impl SyncBridge {
    /// Initial manifests for a member site: its client credential, each
    /// ready edge link of its invitation, and the compose engine's
    /// application-state hashes. Members advertise nothing back.
    pub(crate) async fn new_member_peer(
        &self,
        member: Uuid,
    ) -> SyncResult<(HashMap<String, String>, HashMap<String, String>)> {
        let row: Option<MemberSite> = sqlx::query_as("SELECT * FROM member_sites WHERE id = $1")
            .bind(member)
            .fetch_optional(self.db().pool())
            .await
            .map_err(vanfab_db::DbError::from)?;
        let Some(row) = row else {
            return Err(SyncError::Events(format!("no member site {member}")));
        };

        let mut local_state = HashMap::new();
        if let Ok((hash, _)) = self.credential_secret(row.certificate).await {
            local_state.insert(StateKey::TlsSite(member).to_string(), hash);
        }

        let edge_links = sqlx::query(
            "SELECT e.id FROM edge_links e
             JOIN backbone_access_points ap ON e.access_point = ap.id
             WHERE e.invitation = $1 AND ap.lifecycle = 'ready'",
        )
        .bind(row.invitation)
        .fetch_all(self.db().pool())
        .await
        .map_err(vanfab_db::DbError::from)?;
        for link_row in edge_links {
            let link: Uuid = link_row.try_get("id").map_err(vanfab_db::DbError::from)?;
            if let Ok((hash, _)) = self.edge_link_descriptor(link).await {
                local_state.insert(StateKey::Link(link).to_string(), hash);
            }
        }

        // Application state computed at deploy time.
        for (key, hash) in self.compose().member_app_hashes(member) {
            local_state.insert(key, hash);
        }

        let mut tx = self.db().begin().await?;
        if row.lifecycle()? == Lifecycle::Ready {
            sqlx::query(
                "UPDATE member_sites
                 SET lifecycle = $2, first_active_time = $3, last_heartbeat = $3
                 WHERE id = $1",
            )
            .bind(member)
            .bind(Lifecycle::Active.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(vanfab_db::DbError::from)?;
            info!(member = %member, "member site active");
        } else {
            sqlx::query("UPDATE member_sites SET last_heartbeat = $2 WHERE id = $1")
                .bind(member)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(vanfab_db::DbError::from)?;
        }
        tx.commit().await.map_err(vanfab_db::DbError::from)?;

        Ok((local_state, HashMap::new()))
    }

    /// Serve a member's keys; unknown keys fall through to the compose
    /// engine's cached application state.
    pub(crate) async fn member_state_request(
        &self,
        peer_id: &str,
        key: &str,
    ) -> SyncResult<(String, Value)> {
        let member = Uuid::parse_str(peer_id)
            .map_err(|_| SyncError::Events(format!("bad member peer id {peer_id}")))?;
        match StateKey::parse(key) {
            Some(StateKey::TlsSite(site)) => {
                let row = sqlx::query("SELECT certificate FROM member_sites WHERE id = $1")
                    .bind(site)
                    .fetch_optional(self.db().pool())
                    .await
                    .map_err(vanfab_db::DbError::from)?
                    .ok_or_else(|| SyncError::Events(format!("no member site {site}")))?;
                let certificate: Option<Uuid> =
                    row.try_get("certificate").map_err(vanfab_db::DbError::from)?;
                let (hash, data) = self.credential_secret(certificate).await?;
                Ok((hash, Value::Object(data)))
            }
            Some(StateKey::Link(link)) => self.edge_link_descriptor(link).await,
            Some(StateKey::Component(_)) | Some(StateKey::Interface { .. }) => {
                self.app_state_payload(member, key)
            }
            // Anything else falls through to the same cache.
            _ => self.app_state_payload(member, key),
        }
    }

    fn app_state_payload(&self, member: Uuid, key: &str) -> SyncResult<(String, Value)> {
        self.compose()
            .member_app_payload(member, key)
            .ok_or_else(|| SyncError::Events(format!("unknown member key {key}")))
    }

    /// `{host, port, cost}` of an edge link; edge links always cost 1.
    pub(crate) async fn edge_link_descriptor(&self, link: Uuid) -> SyncResult<(String, Value)> {
        let row = sqlx::query(
            "SELECT ap.hostname, ap.port
             FROM edge_links e
             JOIN backbone_access_points ap ON e.access_point = ap.id
             WHERE e.id = $1",
        )
        .bind(link)
        .fetch_optional(self.db().pool())
        .await
        .map_err(vanfab_db::DbError::from)?
        .ok_or_else(|| SyncError::Events(format!("no edge link {link}")))?;
        let hostname: Option<String> = row.try_get("hostname").map_err(vanfab_db::DbError::from)?;
        let port: Option<String> = row.try_get("port").map_err(vanfab_db::DbError::from)?;
        let data = json!({
            "host": hostname.unwrap_or_default(),
            "port": port.unwrap_or_default(),
            "cost": "1",
        });
        let hash = vanfab_manifest::hash_of_object_no_children(data.as_object().unwrap());
        Ok((hash, data))
    }
}
