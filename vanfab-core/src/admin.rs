//! Admin operation layer.
//!
//! Transactional mutations the external HTTP collaborator calls. Every
//! operation validates before writing, rolls back on every error path, and
//! notifies the bridge after commit so affected peers heartbeat promptly.

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::Row;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use vanfab_bridge::SyncBridge;
use vanfab_cluster::{secret_data, ClusterPlatform};
use vanfab_db::{
    AccessPointKind, Backbone, BackboneAccessPoint, Database, DeploymentState, InteriorSite,
    Lifecycle, MemberSite,
};
use vanfab_manifest::{
    hash_of_data, site_bundle, BundleAccessPoint, BundleLink, BundleSecret, RouterMode, SiteBundle,
    SiteRole, StateKey,
};
use vanfab_reconciler::evaluator;

/// Error taxonomy mapped to API status codes by the HTTP collaborator.
#[derive(Error, Debug)]
pub enum AdminError {
    /// Bad identifier or malformed field -> 400; never mutates state
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing row -> 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rule violation -> 400
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Db(#[from] vanfab_db::DbError),
}

impl From<sqlx::Error> for AdminError {
    fn from(e: sqlx::Error) -> Self {
        AdminError::Db(vanfab_db::DbError::from(e))
    }
}

impl AdminError {
    /// HTTP status the API boundary reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            AdminError::Validation(_) | AdminError::Conflict(_) => 400,
            AdminError::NotFound(_) => 404,
            AdminError::Db(_) => 500,
        }
    }
}

pub type AdminResult<T> = Result<T, AdminError>;

fn validate_name(name: &str) -> AdminResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(AdminError::Validation("name must be 1-128 characters".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(AdminError::Validation(format!(
            "name '{name}' may only contain alphanumerics, '-', and '.'"
        )));
    }
    Ok(())
}

pub struct AdminService {
    db: Database,
    bridge: Arc<SyncBridge>,
    platform: Arc<dyn ClusterPlatform>,
}

impl AdminService {
    pub fn new(db: Database, bridge: Arc<SyncBridge>, platform: Arc<dyn ClusterPlatform>) -> Self {
        Self {
            db,
            bridge,
            platform,
        }
    }

    // ----- backbones -----

    pub async fn create_backbone(&self, name: &str, management: bool) -> AdminResult<Uuid> {
        validate_name(name)?;
        let mut tx = self.db.begin().await?;
        if management {
            let existing = sqlx::query("SELECT 1 FROM backbones WHERE management LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
            if existing.is_some() {
                return Err(AdminError::Conflict(
                    "a management backbone already exists".into(),
                ));
            }
        }
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO backbones (id, name, lifecycle, management) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(name)
        .bind(Lifecycle::New.as_str())
        .bind(management)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        info!(backbone = %id, name, "backbone created");
        Ok(id)
    }

    pub async fn list_backbones(&self) -> AdminResult<Vec<Backbone>> {
        Ok(sqlx::query_as("SELECT * FROM backbones ORDER BY name")
            .fetch_all(self.db.pool())
            .await?)
    }

    pub async fn delete_backbone(&self, backbone: Uuid) -> AdminResult<()> {
        let mut tx = self.db.begin().await?;
        let sites = sqlx::query("SELECT 1 FROM interior_sites WHERE backbone = $1 LIMIT 1")
            .bind(backbone)
            .fetch_optional(&mut *tx)
            .await?;
        if sites.is_some() {
            return Err(AdminError::Conflict(
                "backbone still has interior sites".into(),
            ));
        }
        let deleted = sqlx::query("DELETE FROM backbones WHERE id = $1")
            .bind(backbone)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(AdminError::NotFound(format!("backbone {backbone}")));
        }
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        Ok(())
    }

    // ----- interior sites -----

    pub async fn create_interior_site(
        &self,
        backbone: Uuid,
        name: &str,
        platform: Option<&str>,
    ) -> AdminResult<Uuid> {
        validate_name(name)?;
        let mut tx = self.db.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM backbones WHERE id = $1")
            .bind(backbone)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AdminError::NotFound(format!("backbone {backbone}")));
        }
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO interior_sites (id, name, backbone, lifecycle, deployment_state, platform)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(name)
        .bind(backbone)
        .bind(Lifecycle::New.as_str())
        .bind(vanfab_db::DeploymentState::NotReady.as_str())
        .bind(platform)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        info!(site = %id, name, "interior site created");
        Ok(id)
    }

    pub async fn list_interior_sites(&self, backbone: Uuid) -> AdminResult<Vec<InteriorSite>> {
        Ok(
            sqlx::query_as("SELECT * FROM interior_sites WHERE backbone = $1 ORDER BY name")
                .bind(backbone)
                .fetch_all(self.db.pool())
                .await?,
        )
    }

    // ----- access points -----

    pub async fn create_access_point(
        &self,
        site: Uuid,
        kind: &str,
        name: &str,
        bind_host: Option<&str>,
    ) -> AdminResult<Uuid> {
        validate_name(name)?;
        let kind = AccessPointKind::parse(kind)
            .map_err(|_| AdminError::Validation(format!("unknown access point kind '{kind}'")))?;
        let mut tx = self.db.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM interior_sites WHERE id = $1")
            .bind(site)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AdminError::NotFound(format!("interior site {site}")));
        }
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO backbone_access_points
                 (id, name, interior_site, kind, lifecycle, bind_host)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(name)
        .bind(site)
        .bind(kind.as_str())
        .bind(Lifecycle::Partial.as_str())
        .bind(bind_host)
        .execute(&mut *tx)
        .await?;
        if kind == AccessPointKind::Manage {
            evaluator::manage_access_changed(&mut tx, site).await?;
        }
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        info!(access_point = %id, site = %site, kind = %kind, "access point created");
        Ok(id)
    }

    pub async fn delete_access_point(&self, access_point: Uuid) -> AdminResult<()> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query(
            "SELECT interior_site, kind FROM backbone_access_points WHERE id = $1",
        )
        .bind(access_point)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(AdminError::NotFound(format!("access point {access_point}")));
        };
        let site: Uuid = row.try_get("interior_site")?;
        let kind: String = row.try_get("kind")?;

        let linked = sqlx::query("SELECT 1 FROM inter_router_links WHERE access_point = $1 LIMIT 1")
            .bind(access_point)
            .fetch_optional(&mut *tx)
            .await?;
        if linked.is_some() {
            return Err(AdminError::Conflict(
                "access point still has inter-router links".into(),
            ));
        }

        sqlx::query("DELETE FROM backbone_access_points WHERE id = $1")
            .bind(access_point)
            .execute(&mut *tx)
            .await?;
        if kind == AccessPointKind::Manage.as_str() {
            evaluator::manage_access_changed(&mut tx, site).await?;
        }
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        // The backbone-link manager drops its session on the next pass.
        self.bridge.site_ingress_changed(site, access_point).await;
        Ok(())
    }

    /// Supply host/port for a site's partial access points. Each promoted
    /// access point moves to `new`, queuing certificate issuance.
    pub async fn set_site_ingress(
        &self,
        site: Uuid,
        ingress: &Value,
    ) -> AdminResult<Vec<Uuid>> {
        let map = ingress
            .as_object()
            .ok_or_else(|| AdminError::Validation("ingress must be an object".into()))?;

        let mut promoted = Vec::new();
        let mut tx = self.db.begin().await?;
        for (ap_id, spec) in map {
            let ap_id = Uuid::parse_str(ap_id)
                .map_err(|_| AdminError::Validation(format!("bad access point id '{ap_id}'")))?;
            let host = spec.get("host").and_then(Value::as_str).ok_or_else(|| {
                AdminError::Validation(format!("ingress for {ap_id} is missing host"))
            })?;
            let port = spec.get("port").and_then(Value::as_str).ok_or_else(|| {
                AdminError::Validation(format!("ingress for {ap_id} is missing port"))
            })?;
            let updated = sqlx::query(
                "UPDATE backbone_access_points
                 SET hostname = $2, port = $3, lifecycle = $4
                 WHERE id = $1 AND interior_site = $5 AND lifecycle = $6",
            )
            .bind(ap_id)
            .bind(host)
            .bind(port)
            .bind(Lifecycle::New.as_str())
            .bind(site)
            .bind(Lifecycle::Partial.as_str())
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() > 0 {
                promoted.push(ap_id);
            }
        }
        tx.commit().await.map_err(vanfab_db::DbError::from)?;

        for ap in &promoted {
            self.bridge.site_ingress_changed(site, *ap).await;
        }
        Ok(promoted)
    }

    // ----- inter-router links -----

    pub async fn create_inter_router_link(
        &self,
        connecting_site: Uuid,
        access_point: Uuid,
        cost: i32,
    ) -> AdminResult<Uuid> {
        if cost < 1 {
            return Err(AdminError::Validation("link cost must be positive".into()));
        }
        let mut tx = self.db.begin().await?;
        let row = sqlx::query(
            "SELECT ap.kind, s.backbone AS target_backbone
             FROM backbone_access_points ap
             JOIN interior_sites s ON ap.interior_site = s.id
             WHERE ap.id = $1",
        )
        .bind(access_point)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(AdminError::NotFound(format!("access point {access_point}")));
        };
        let kind: String = row.try_get("kind")?;
        if kind != AccessPointKind::Peer.as_str() {
            return Err(AdminError::Conflict(
                "inter-router links must target a peer access point".into(),
            ));
        }
        let target_backbone: Uuid = row.try_get("target_backbone")?;

        let connecting = sqlx::query("SELECT backbone FROM interior_sites WHERE id = $1")
            .bind(connecting_site)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(connecting) = connecting else {
            return Err(AdminError::NotFound(format!(
                "interior site {connecting_site}"
            )));
        };
        let connecting_backbone: Uuid = connecting.try_get("backbone")?;
        if connecting_backbone != target_backbone {
            return Err(AdminError::Conflict(
                "link endpoints must share a backbone".into(),
            ));
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO inter_router_links (id, connecting_interior_site, access_point, cost)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(connecting_site)
        .bind(access_point)
        .bind(cost)
        .execute(&mut *tx)
        .await?;
        evaluator::link_changed(&mut tx, connecting_site).await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        self.bridge.link_changed(connecting_site, id).await;
        Ok(id)
    }

    pub async fn delete_inter_router_link(&self, link: Uuid) -> AdminResult<()> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query(
            "SELECT connecting_interior_site FROM inter_router_links WHERE id = $1",
        )
        .bind(link)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(AdminError::NotFound(format!("inter-router link {link}")));
        };
        let connecting_site: Uuid = row.try_get("connecting_interior_site")?;
        sqlx::query("DELETE FROM inter_router_links WHERE id = $1")
            .bind(link)
            .execute(&mut *tx)
            .await?;
        evaluator::link_changed(&mut tx, connecting_site).await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        self.bridge.link_changed(connecting_site, link).await;
        Ok(())
    }

    // ----- application networks -----

    pub async fn create_van(&self, backbone: Uuid, name: &str) -> AdminResult<Uuid> {
        validate_name(name)?;
        let mut tx = self.db.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM backbones WHERE id = $1")
            .bind(backbone)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AdminError::NotFound(format!("backbone {backbone}")));
        }
        let id = Uuid::new_v4();
        let van_id = format!("van-{}", &id.simple().to_string()[..12]);
        sqlx::query(
            "INSERT INTO application_networks (id, name, backbone, van_id, lifecycle, start_time)
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(id)
        .bind(name)
        .bind(backbone)
        .bind(&van_id)
        .bind(Lifecycle::New.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        info!(van = %id, name, "application network created");
        Ok(id)
    }

    // ----- invitations -----

    #[allow(clippy::too_many_arguments)]
    pub async fn create_invitation(
        &self,
        van: Uuid,
        name: &str,
        claim_access: Uuid,
        primary_access: Uuid,
        join_deadline: Option<chrono::DateTime<chrono::Utc>>,
        instance_limit: Option<i32>,
        member_classes: Vec<String>,
    ) -> AdminResult<Uuid> {
        validate_name(name)?;
        let mut tx = self.db.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM application_networks WHERE id = $1")
            .bind(van)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AdminError::NotFound(format!("application network {van}")));
        }
        self.require_kind(&mut tx, claim_access, AccessPointKind::Claim)
            .await?;
        self.require_kind(&mut tx, primary_access, AccessPointKind::Member)
            .await?;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO member_invitations
                 (id, name, van, lifecycle, claim_access, join_deadline,
                  member_classes, instance_limit)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(id)
        .bind(name)
        .bind(van)
        .bind(Lifecycle::New.as_str())
        .bind(claim_access)
        .bind(join_deadline)
        .bind(json!(member_classes))
        .bind(instance_limit)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO edge_links (id, invitation, access_point, priority)
             VALUES ($1, $2, $3, 4)",
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(primary_access)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        info!(invitation = %id, name, "member invitation created");
        Ok(id)
    }

    pub async fn create_network_credential(&self, van: Uuid, name: &str) -> AdminResult<Uuid> {
        validate_name(name)?;
        let mut tx = self.db.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM application_networks WHERE id = $1")
            .bind(van)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AdminError::NotFound(format!("application network {van}")));
        }
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO network_credentials (id, name, van, lifecycle) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(name)
        .bind(van)
        .bind(Lifecycle::New.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        Ok(id)
    }

    pub async fn list_member_sites(&self, van: Uuid) -> AdminResult<Vec<MemberSite>> {
        Ok(
            sqlx::query_as("SELECT * FROM member_sites WHERE van = $1 ORDER BY name")
                .bind(van)
                .fetch_all(self.db.pool())
                .await?,
        )
    }

    // ----- site download bundles -----

    /// Render an interior site's deployable bundle: every YAML document the
    /// site needs, in the fixed download order. `ready-bootstrap` sites also
    /// receive their access-point server secrets.
    pub async fn interior_site_bundle(&self, site: Uuid) -> AdminResult<String> {
        let row: Option<InteriorSite> = sqlx::query_as("SELECT * FROM interior_sites WHERE id = $1")
            .bind(site)
            .fetch_optional(self.db.pool())
            .await?;
        let Some(row) = row else {
            return Err(AdminError::NotFound(format!("interior site {site}")));
        };
        let deployment_state = row.deployment_state()?;

        let site_secret = self
            .bundle_secret(
                row.certificate,
                &StateKey::TlsSite(site).to_string(),
                Some("site"),
            )
            .await?
            .ok_or_else(|| AdminError::Conflict("site credential is not issued yet".into()))?;

        let access_points: Vec<BackboneAccessPoint> =
            sqlx::query_as("SELECT * FROM backbone_access_points WHERE interior_site = $1")
                .bind(site)
                .fetch_all(self.db.pool())
                .await?;
        let mut bundle_aps = Vec::new();
        let mut access_secrets = Vec::new();
        for ap in &access_points {
            bundle_aps.push(BundleAccessPoint {
                id: ap.id,
                kind: ap.kind.clone(),
                bind_host: ap.bind_host.clone(),
            });
            if deployment_state == DeploymentState::ReadyBootstrap
                && ap.lifecycle()? == Lifecycle::Ready
            {
                if let Some(secret) = self
                    .bundle_secret(
                        ap.certificate,
                        &StateKey::TlsServer(ap.id).to_string(),
                        Some("accesspoint"),
                    )
                    .await?
                {
                    access_secrets.push(secret);
                }
            }
        }

        let link_rows = sqlx::query(
            "SELECT l.id, l.cost, ap.hostname, ap.port
             FROM inter_router_links l
             JOIN backbone_access_points ap ON l.access_point = ap.id
             WHERE l.connecting_interior_site = $1 AND ap.lifecycle = 'ready'",
        )
        .bind(site)
        .fetch_all(self.db.pool())
        .await?;
        let mut links = Vec::new();
        for link in link_rows {
            let cost: i32 = link.try_get("cost")?;
            links.push(BundleLink {
                id: link.try_get("id")?,
                host: link
                    .try_get::<Option<String>, _>("hostname")?
                    .unwrap_or_default(),
                port: link.try_get::<Option<String>, _>("port")?.unwrap_or_default(),
                cost: cost.to_string(),
            });
        }

        let bundle = SiteBundle {
            site_name: row.name.clone(),
            site_id: site,
            platform: row.platform.clone().unwrap_or_else(|| "kube".to_string()),
            mode: RouterMode::Interior,
            role: SiteRole::Backbone,
            network_id: None,
            tenant_id: None,
            site_secret,
            links,
            access_points: bundle_aps,
            access_secrets,
        };
        site_bundle(&bundle)
            .map_err(|e| AdminError::Validation(format!("bundle rendering failed: {e}")))
    }

    async fn bundle_secret(
        &self,
        certificate: Option<Uuid>,
        state_key: &str,
        inject: Option<&str>,
    ) -> AdminResult<Option<BundleSecret>> {
        let Some(certificate) = certificate else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT name FROM tls_certificates WHERE id = $1")
            .bind(certificate)
            .fetch_optional(self.db.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let name: String = row.try_get("name")?;
        let Some(secret) = self
            .platform
            .load_secret(&name)
            .await
            .map_err(|e| AdminError::Validation(e.to_string()))?
        else {
            return Ok(None);
        };
        let data = secret_data(&secret).cloned().unwrap_or_default();
        let hash = hash_of_data(&data);
        Ok(Some(BundleSecret {
            name,
            data,
            state_key: state_key.to_string(),
            hash,
            inject: inject.map(str::to_string),
        }))
    }

    async fn require_kind(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        access_point: Uuid,
        expected: AccessPointKind,
    ) -> AdminResult<()> {
        let row = sqlx::query("SELECT kind FROM backbone_access_points WHERE id = $1")
            .bind(access_point)
            .fetch_optional(&mut **tx)
            .await?;
        let Some(row) = row else {
            return Err(AdminError::NotFound(format!("access point {access_point}")));
        };
        let kind: String = row.try_get("kind")?;
        if kind != expected.as_str() {
            return Err(AdminError::Validation(format!(
                "access point {access_point} is '{kind}', expected '{expected}'"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(validate_name("bb1").is_ok());
        assert!(validate_name("site-1.east").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("no spaces").is_err());
        assert!(validate_name(&"x".repeat(200)).is_err());
    }

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        assert_eq!(AdminError::Validation("x".into()).http_status(), 400);
        assert_eq!(AdminError::Conflict("x".into()).http_status(), 400);
        assert_eq!(AdminError::NotFound("x".into()).http_status(), 404);
    }
}
