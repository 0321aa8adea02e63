//! Backbone link management.
//!
//! Owns the `backbone -> session` map. A reconcile pass every 30 seconds
//! (10 after a failed pass) compares the set of ready manage-kind access
//! points on ready backbones against the open sessions, opening and closing
//! sessions to match. Subscribers observe session add/delete, and a newly
//! registered subscriber is immediately told about every session already
//! open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use vanfab_db::{Database, Lifecycle};
use vanfab_transport::Session;

use crate::SyncResult;

const RECONCILE_PERIOD: Duration = Duration::from_secs(30);
const RECONCILE_RETRY: Duration = Duration::from_secs(10);
const BOOTSTRAP_POLL: Duration = Duration::from_secs(10);

/// Observer of backbone session lifecycle.
#[async_trait]
pub trait LinkObserver: Send + Sync {
    async fn on_link_added(&self, backbone: Uuid, session: &Session);
    async fn on_link_deleted(&self, backbone: Uuid);
}

/// Opens a transport session to a manage access point. The production
/// connector dials TLS with the management controller's client credential;
/// tests substitute loopback pairs.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, backbone: Uuid, host: &str, port: &str) -> SyncResult<Session>;
}

/// One reachable manage access point, one row per backbone.
#[derive(Debug, Clone, PartialEq)]
struct ManageTarget {
    backbone: Uuid,
    host: String,
    port: String,
}

pub struct BackboneLinkManager {
    db: Database,
    controller_name: String,
    connector: Arc<dyn SessionConnector>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    observers: Mutex<Vec<Arc<dyn LinkObserver>>>,
    shutdown: Notify,
}

impl BackboneLinkManager {
    pub fn new(
        db: Database,
        controller_name: &str,
        connector: Arc<dyn SessionConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            controller_name: controller_name.to_string(),
            connector,
            sessions: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        })
    }

    /// Register an observer; it is called synchronously for every session
    /// already open.
    pub async fn register(&self, observer: Arc<dyn LinkObserver>) {
        let snapshot: Vec<(Uuid, Session)> = {
            let sessions = self.sessions.lock().await;
            sessions.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        for (backbone, session) in &snapshot {
            observer.on_link_added(*backbone, session).await;
        }
        self.observers.lock().await.push(observer);
    }

    /// Run bootstrap then the reconcile loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.bootstrap().await {
            error!("link manager bootstrap failed: {e}");
            return;
        }
        loop {
            let delay = match self.reconcile().await {
                Ok(()) => RECONCILE_PERIOD,
                Err(e) => {
                    error!("backbone link reconcile failed: {e}");
                    RECONCILE_RETRY
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return,
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Wait until the configured controller row is ready, inserting it if
    /// missing.
    async fn bootstrap(&self) -> SyncResult<()> {
        loop {
            let row = sqlx::query(
                "SELECT lifecycle FROM management_controllers WHERE name = $1",
            )
            .bind(&self.controller_name)
            .fetch_optional(self.db.pool())
            .await
            .map_err(vanfab_db::DbError::from)?;

            match row {
                Some(row) => {
                    let lifecycle: String = row.try_get("lifecycle").map_err(vanfab_db::DbError::from)?;
                    if lifecycle == Lifecycle::Ready.as_str() {
                        info!(name = %self.controller_name, "management controller ready");
                        return Ok(());
                    }
                }
                None => {
                    sqlx::query(
                        "INSERT INTO management_controllers (id, name, lifecycle)
                         VALUES ($1, $2, $3) ON CONFLICT (name) DO NOTHING",
                    )
                    .bind(Uuid::new_v4())
                    .bind(&self.controller_name)
                    .bind(Lifecycle::New.as_str())
                    .execute(self.db.pool())
                    .await
                    .map_err(vanfab_db::DbError::from)?;
                    info!(name = %self.controller_name, "management controller row inserted");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(BOOTSTRAP_POLL) => {}
                _ = self.shutdown.notified() => return Ok(()),
            }
        }
    }

    /// One reconcile pass: diff desired targets against open sessions.
    pub async fn reconcile(&self) -> SyncResult<()> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (b.id) b.id AS backbone, ap.hostname, ap.port
             FROM backbone_access_points ap
             JOIN interior_sites s ON ap.interior_site = s.id
             JOIN backbones b ON s.backbone = b.id
             WHERE ap.kind = 'manage'
               AND ap.lifecycle = 'ready'
               AND b.lifecycle = 'ready'
               AND ap.hostname IS NOT NULL
               AND ap.port IS NOT NULL
             ORDER BY b.id, ap.id",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(vanfab_db::DbError::from)?;

        let mut desired = HashMap::new();
        for row in rows {
            let target = ManageTarget {
                backbone: row.try_get("backbone").map_err(vanfab_db::DbError::from)?,
                host: row.try_get("hostname").map_err(vanfab_db::DbError::from)?,
                port: row.try_get("port").map_err(vanfab_db::DbError::from)?,
            };
            desired.insert(target.backbone, target);
        }

        let current: Vec<Uuid> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().copied().collect()
        };

        // Sessions with no remaining target close.
        for backbone in &current {
            if !desired.contains_key(backbone) {
                let session = self.sessions.lock().await.remove(backbone);
                if let Some(session) = session {
                    session.close();
                    info!(%backbone, "backbone session closed");
                    self.notify_deleted(*backbone).await;
                }
            }
        }

        // New targets open a session.
        for (backbone, target) in &desired {
            if current.contains(backbone) {
                continue;
            }
            match self
                .connector
                .connect(*backbone, &target.host, &target.port)
                .await
            {
                Ok(session) => {
                    info!(%backbone, host = %target.host, port = %target.port,
                          "backbone session opened");
                    self.sessions
                        .lock()
                        .await
                        .insert(*backbone, session.clone());
                    self.notify_added(*backbone, &session).await;
                }
                Err(e) => {
                    // Retried on the next reconcile pass.
                    warn!(%backbone, "backbone session connect failed: {e}");
                }
            }
        }

        Ok(())
    }

    async fn notify_added(&self, backbone: Uuid, session: &Session) {
        let observers: Vec<Arc<dyn LinkObserver>> =
            self.observers.lock().await.iter().cloned().collect();
        for observer in observers {
            observer.on_link_added(backbone, session).await;
        }
    }

    async fn notify_deleted(&self, backbone: Uuid) {
        let observers: Vec<Arc<dyn LinkObserver>> =
            self.observers.lock().await.iter().cloned().collect();
        for observer in observers {
            observer.on_link_deleted(backbone).await;
        }
    }

    /// Session for one backbone, if open.
    pub async fn session(&self, backbone: Uuid) -> Option<Session> {
        self.sessions.lock().await.get(&backbone).cloned()
    }

    /// Number of open sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
