//! Orchestration core.
//!
//! `VanFabric` wires every subsystem: the database, the cluster platform,
//! the certificate reconcilers and their watches, the state-sync engine and
//! bridge, the backbone-link manager, and the claim server. Startup runs in
//! dependency order; shutdown reverses it.

mod admin;
mod config;

pub use admin::{AdminError, AdminResult, AdminService};
pub use config::FabricConfig;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vanfab_bridge::SyncBridge;
use vanfab_claim::ClaimServer;
use vanfab_cluster::ClusterPlatform;
use vanfab_compose::ComposeEngine;
use vanfab_db::{Database, PeerClass};
use vanfab_protocol::MGMT_CONTROLLER_ADDRESS;
use vanfab_reconciler::{
    event_channel, run_certificate_watch, run_prune_loop, run_request_loop, run_secret_watch,
    CertificateReconciler, EventReceiver, ReconcilerEvent,
};
use vanfab_sync::{
    BackboneLinkManager, LinkObserver, SessionConnector, StateSync, SyncConfig, SyncResult,
};
use vanfab_transport::Session;

/// Production connector: plain TCP to the manage access point. TLS with the
/// controller's client credential is terminated by the cluster's ingress in
/// this deployment shape.
struct TcpConnector;

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(&self, _backbone: Uuid, host: &str, port: &str) -> SyncResult<Session> {
        Ok(Session::connect(&format!("{host}:{port}")).await?)
    }
}

/// Fans backbone sessions out to the sync engine and the claim server.
struct FabricLinkObserver {
    sync: StateSync,
    claim: Arc<ClaimServer>,
}

#[async_trait]
impl LinkObserver for FabricLinkObserver {
    async fn on_link_added(&self, backbone: Uuid, session: &Session) {
        self.sync.add_connection(Some(backbone), session);
        self.claim.clone().attach(session);
    }

    async fn on_link_deleted(&self, backbone: Uuid) {
        self.sync.delete_connection(Some(backbone));
    }
}

/// The assembled management controller.
pub struct VanFabric {
    config: FabricConfig,
    db: Database,
    platform: Arc<dyn ClusterPlatform>,
    compose: Arc<ComposeEngine>,
    sync: StateSync,
    bridge: Arc<SyncBridge>,
    claim: Arc<ClaimServer>,
    links: Arc<BackboneLinkManager>,
    reconciler: Arc<CertificateReconciler>,
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl VanFabric {
    /// Connect the database, bootstrap the schema, and assemble every
    /// subsystem. Nothing runs until [`start`](Self::start).
    pub async fn new(
        config: FabricConfig,
        platform: Arc<dyn ClusterPlatform>,
    ) -> Result<VanFabric> {
        info!(controller = %config.controller_name, standalone = config.standalone,
              "initializing fabric controller");

        let db = Database::connect(&config.database_url).await?;
        db.ensure_schema().await?;

        let compose = ComposeEngine::new(db.clone());

        let mut sync_config =
            SyncConfig::new(PeerClass::Management, config.controller_name.clone());
        sync_config.receive_address = Some(MGMT_CONTROLLER_ADDRESS.to_string());
        let sync = StateSync::new(sync_config);

        let bridge = SyncBridge::new(
            db.clone(),
            platform.clone(),
            compose.clone(),
            sync.clone(),
        );
        sync.set_events(bridge.clone());

        let claim = ClaimServer::new(db.clone(), platform.clone());
        let links = BackboneLinkManager::new(
            db.clone(),
            &config.controller_name,
            Arc::new(TcpConnector),
        );
        let reconciler = Arc::new(CertificateReconciler::new(db.clone()));

        Ok(VanFabric {
            config,
            db,
            platform,
            compose,
            sync,
            bridge,
            claim,
            links,
            reconciler,
            shutdown: Arc::new(Notify::new()),
            tasks: Vec::new(),
        })
    }

    /// Start every worker: reconciler loops, the request loop, finalization
    /// watches, pruning, the link manager, and the sync engine.
    pub async fn start(&mut self) -> Result<()> {
        info!("starting fabric controller");

        self.reconciler.clone().spawn_all();
        self.tasks.push(tokio::spawn(run_request_loop(
            self.db.clone(),
            self.platform.clone(),
            self.shutdown.clone(),
        )));

        let (events_tx, events_rx) = event_channel();
        self.tasks.push(tokio::spawn(run_secret_watch(
            self.db.clone(),
            self.platform.clone(),
            events_tx,
            self.platform.watch_secrets(),
        )));
        self.tasks.push(tokio::spawn(run_certificate_watch(
            self.db.clone(),
            self.platform.watch_certificates(),
        )));
        self.tasks.push(tokio::spawn(run_prune_loop(
            self.db.clone(),
            self.platform.clone(),
            self.shutdown.clone(),
        )));
        self.tasks
            .push(tokio::spawn(Self::route_events(
                events_rx,
                self.bridge.clone(),
                self.claim.clone(),
            )));

        self.links
            .register(Arc::new(FabricLinkObserver {
                sync: self.sync.clone(),
                claim: self.claim.clone(),
            }))
            .await;
        self.tasks.push(tokio::spawn(self.links.clone().run()));

        self.sync.start();
        info!("fabric controller started");
        Ok(())
    }

    /// Route post-commit reconciler events to the bridge and the claim
    /// server.
    async fn route_events(
        mut events: EventReceiver,
        bridge: Arc<SyncBridge>,
        claim: Arc<ClaimServer>,
    ) {
        while let Some(event) = events.recv().await {
            debug!(?event, "reconciler event");
            match event {
                ReconcilerEvent::SiteCertificateChanged { site } => {
                    bridge.site_certificate_changed(site).await;
                }
                ReconcilerEvent::AccessCertificateChanged { access_point } => {
                    bridge.access_certificate_changed(access_point).await;
                }
                ReconcilerEvent::MemberReady { member } => {
                    // The claim handler may be blocked on this member.
                    if let Err(e) = claim.complete_member(member).await {
                        warn!(member = %member, "member completion failed: {e}");
                    }
                    bridge.site_certificate_changed(member).await;
                }
            }
        }
    }

    /// Stop subsystems in reverse dependency order.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping fabric controller");
        self.sync.stop();
        self.links.stop();
        self.reconciler.stop();
        self.shutdown.notify_waiters();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("fabric controller stopped");
        Ok(())
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn database(&self) -> Database {
        self.db.clone()
    }

    pub fn compose_engine(&self) -> Arc<ComposeEngine> {
        self.compose.clone()
    }

    /// Admin surface bound to this controller's database and bridge.
    pub fn admin(&self) -> AdminService {
        AdminService::new(self.db.clone(), self.bridge.clone(), self.platform.clone())
    }
}
