//! The sync bridge.
//!
//! Binds the state-sync engine to database rows: heartbeats become liveness
//! updates and lifecycle transitions, state requests become row and secret
//! fetches, and database mutations push recomputed hashes back through the
//! engine to force heartbeats. Handlers dispatch on the peer's class;
//! backbone and member peers see different manifests.

mod backbone;
mod member;
mod push;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use vanfab_cluster::{secret_data, ClusterPlatform};
use vanfab_compose::ComposeEngine;
use vanfab_db::{Database, PeerClass};
use vanfab_manifest::hash_of_data;
use vanfab_sync::{PeerEvents, StateSync, SyncError, SyncResult};

pub struct SyncBridge {
    db: Database,
    platform: Arc<dyn ClusterPlatform>,
    compose: Arc<ComposeEngine>,
    sync: StateSync,
    /// Classes observed in on_new_peer, consulted by later dispatches
    peer_classes: DashMap<String, PeerClass>,
}

impl SyncBridge {
    pub fn new(
        db: Database,
        platform: Arc<dyn ClusterPlatform>,
        compose: Arc<ComposeEngine>,
        sync: StateSync,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            platform,
            compose,
            sync,
            peer_classes: DashMap::new(),
        })
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn compose(&self) -> &ComposeEngine {
        &self.compose
    }

    pub(crate) fn sync(&self) -> &StateSync {
        &self.sync
    }

    fn class_of(&self, peer_id: &str) -> Option<PeerClass> {
        self.peer_classes.get(peer_id).map(|e| *e.value())
    }

    fn parse_peer(peer_id: &str) -> SyncResult<Uuid> {
        Uuid::parse_str(peer_id)
            .map_err(|_| SyncError::Events(format!("peer id '{peer_id}' is not a site id")))
    }

    /// Hash and payload of the secret behind a credential reference.
    pub(crate) async fn credential_secret(
        &self,
        certificate: Option<Uuid>,
    ) -> SyncResult<(String, Map<String, Value>)> {
        let certificate = certificate
            .ok_or_else(|| SyncError::Events("entity has no credential yet".into()))?;
        let row = sqlx::query("SELECT name FROM tls_certificates WHERE id = $1")
            .bind(certificate)
            .fetch_optional(self.db.pool())
            .await
            .map_err(vanfab_db::DbError::from)?
            .ok_or_else(|| SyncError::Events(format!("credential {certificate} not found")))?;
        let name: String = row.try_get("name").map_err(vanfab_db::DbError::from)?;
        let secret = self
            .platform
            .load_secret(&name)
            .await
            .map_err(|e| SyncError::Events(e.to_string()))?
            .ok_or_else(|| SyncError::Events(format!("secret {name} not found")))?;
        let data = secret_data(&secret).cloned().unwrap_or_default();
        Ok((hash_of_data(&data), data))
    }
}

#[async_trait]
impl PeerEvents for SyncBridge {
    async fn on_new_peer(
        &self,
        peer_id: &str,
        class: PeerClass,
    ) -> SyncResult<(HashMap<String, String>, HashMap<String, String>)> {
        self.peer_classes.insert(peer_id.to_string(), class);
        let site = Self::parse_peer(peer_id)?;
        match class {
            PeerClass::Backbone => self.new_backbone_peer(site).await,
            PeerClass::Member => self.new_member_peer(site).await,
            PeerClass::Management => {
                // The controller does not peer with itself.
                Err(SyncError::Events("management peers are not tracked".into()))
            }
        }
    }

    async fn on_ping(&self, peer_id: &str) {
        let Ok(site) = Self::parse_peer(peer_id) else {
            return;
        };
        let table = match self.class_of(peer_id) {
            Some(PeerClass::Backbone) => "interior_sites",
            Some(PeerClass::Member) => "member_sites",
            _ => return,
        };
        let result = sqlx::query(&format!(
            "UPDATE {table} SET last_heartbeat = $2 WHERE id = $1"
        ))
        .bind(site)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await;
        if let Err(e) = result {
            warn!(peer = peer_id, "heartbeat timestamp update failed: {e}");
        }
    }

    async fn on_state_change(
        &self,
        peer_id: &str,
        key: &str,
        hash: Option<&str>,
        data: Option<Value>,
    ) {
        // Only backbone peers report actionable state, and only for
        // access points still awaiting their ingress.
        if self.class_of(peer_id) != Some(PeerClass::Backbone) {
            debug!(peer = peer_id, key, "advisory state change ignored");
            return;
        }
        if let Err(e) = self.backbone_state_change(key, hash, data).await {
            warn!(peer = peer_id, key, "state change handling failed: {e}");
        }
    }

    async fn on_state_request(&self, peer_id: &str, key: &str) -> SyncResult<(String, Value)> {
        let class = self
            .class_of(peer_id)
            .ok_or_else(|| SyncError::Events(format!("state request from unknown peer {peer_id}")))?;
        match class {
            PeerClass::Backbone => self.backbone_state_request(peer_id, key).await,
            PeerClass::Member => self.member_state_request(peer_id, key).await,
            PeerClass::Management => {
                Err(SyncError::Events("management peers hold no state".into()))
            }
        }
    }
}
