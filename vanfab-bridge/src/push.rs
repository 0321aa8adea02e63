//! Push paths.
//!
//! Database mutations — finalized credentials, supplied ingress, changed
//! links — call back in here. Each path recomputes the one affected hash
//! and updates the peer's local manifest, which forces an immediate
//! heartbeat so the router pulls the fresh bytes.

use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use vanfab_manifest::StateKey;
use vanfab_sync::SyncResult;

use crate::backbone::access_descriptor_hash;
use crate::SyncBridge;

impl SyncBridge {
    /// An interior or member site's client credential was finalized or
    /// rotated.
    pub async fn site_certificate_changed(&self, site: Uuid) {
        let peer = site.to_string();
        let certificate = match self.site_certificate(site).await {
            Ok(certificate) => certificate,
            Err(e) => {
                warn!(site = %site, "site certificate lookup failed: {e}");
                return;
            }
        };
        match self.credential_secret(certificate).await {
            Ok((hash, _)) => {
                self.sync()
                    .update_local_state(&peer, &StateKey::TlsSite(site).to_string(), Some(&hash))
                    .await;
            }
            Err(e) => debug!(site = %site, "site credential not yet loadable: {e}"),
        }
    }

    /// An access point's server credential was finalized or rotated.
    pub async fn access_certificate_changed(&self, access_point: Uuid) {
        let row = sqlx::query(
            "SELECT interior_site, certificate FROM backbone_access_points WHERE id = $1",
        )
        .bind(access_point)
        .fetch_optional(self.db().pool())
        .await;
        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                warn!(access_point = %access_point, "access point lookup failed: {e}");
                return;
            }
        };
        let site: Uuid = match row.try_get("interior_site") {
            Ok(site) => site,
            Err(_) => return,
        };
        let certificate: Option<Uuid> = row.try_get("certificate").ok().flatten();
        match self.credential_secret(certificate).await {
            Ok((hash, _)) => {
                self.sync()
                    .update_local_state(
                        &site.to_string(),
                        &StateKey::TlsServer(access_point).to_string(),
                        Some(&hash),
                    )
                    .await;
            }
            Err(e) => debug!(access_point = %access_point, "server credential not loadable: {e}"),
        }
    }

    /// An access point's descriptor (kind/bind host) changed.
    pub async fn site_ingress_changed(&self, site: Uuid, access_point: Uuid) {
        let row: Result<Option<vanfab_db::BackboneAccessPoint>, _> =
            sqlx::query_as("SELECT * FROM backbone_access_points WHERE id = $1")
                .bind(access_point)
                .fetch_optional(self.db().pool())
                .await;
        match row {
            Ok(Some(ap)) => {
                let hash = access_descriptor_hash(&ap);
                self.sync()
                    .update_local_state(
                        &site.to_string(),
                        &StateKey::Access(access_point).to_string(),
                        Some(&hash),
                    )
                    .await;
            }
            Ok(None) => {
                self.sync()
                    .update_local_state(
                        &site.to_string(),
                        &StateKey::Access(access_point).to_string(),
                        None,
                    )
                    .await;
            }
            Err(e) => warn!(access_point = %access_point, "ingress lookup failed: {e}"),
        }
    }

    /// An inter-router link was added, changed, or deleted.
    pub async fn link_changed(&self, connecting_site: Uuid, link: Uuid) {
        let peer = connecting_site.to_string();
        let key = StateKey::Link(link).to_string();
        match self.link_descriptor(link).await {
            Ok((hash, _)) => {
                self.sync()
                    .update_local_state(&peer, &key, Some(&hash))
                    .await;
            }
            Err(_) => {
                // Row gone: advertise the deletion.
                self.sync().update_local_state(&peer, &key, None).await;
            }
        }
    }

    /// Hook for newly available ingress fan-out.
    ///
    /// TODO: recompute the affected sites' hash sets once the set of active
    /// backbone sites is tracked here; the upstream module this derives
    /// from references that recomputation without defining it.
    pub async fn new_ingress_available(&self) {}

    async fn site_certificate(&self, site: Uuid) -> SyncResult<Option<Uuid>> {
        // The site may be interior or member; try both tables.
        let row = sqlx::query("SELECT certificate FROM interior_sites WHERE id = $1")
            .bind(site)
            .fetch_optional(self.db().pool())
            .await
            .map_err(vanfab_db::DbError::from)?;
        if let Some(row) = row {
            return Ok(row.try_get("certificate").map_err(vanfab_db::DbError::from)?);
        }
        let row = sqlx::query("SELECT certificate FROM member_sites WHERE id = $1")
            .bind(site)
            .fetch_optional(self.db().pool())
            .await
            .map_err(vanfab_db::DbError::from)?;
        match row {
            Some(row) => Ok(row.try_get("certificate").map_err(vanfab_db::DbError::from)?),
            None => Ok(None),
        }
    }
}
