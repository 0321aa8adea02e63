//! Row types for every table the controller owns.
//!
//! Enumerated columns are carried as text and surfaced through typed
//! accessors; timestamps are UTC throughout. The structs derive
//! `sqlx::FromRow` so `query_as` can hydrate them directly.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DbResult;
use crate::types::{AccessPointKind, DeploymentState, EntityKind, Lifecycle};

/// The management controller's own row. Exactly one row carries the
/// configured controller name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ManagementController {
    pub id: Uuid,
    pub name: String,
    pub lifecycle: String,
    pub certificate: Option<Uuid>,
    pub failure: Option<String>,
}

impl ManagementController {
    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }
}

/// Administrative grouping of interior router sites.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Backbone {
    pub id: Uuid,
    pub name: String,
    pub lifecycle: String,
    /// CA credential for everything issued under this backbone
    pub certificate: Option<Uuid>,
    /// True for the single backbone the controller itself joins
    pub management: bool,
    pub failure: Option<String>,
}

impl Backbone {
    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }
}

/// A router participating in a backbone.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InteriorSite {
    pub id: Uuid,
    pub name: String,
    pub backbone: Uuid,
    pub lifecycle: String,
    pub certificate: Option<Uuid>,
    pub deployment_state: String,
    /// Target platform tag ("kube", "podman", ...)
    pub platform: Option<String>,
    pub first_active_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl InteriorSite {
    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }

    pub fn deployment_state(&self) -> DbResult<DeploymentState> {
        DeploymentState::parse(&self.deployment_state)
    }
}

/// An ingress on an interior site.
///
/// Created `partial` when host and port are not yet known; promoted to `new`
/// the moment both are supplied, which queues certificate issuance.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BackboneAccessPoint {
    pub id: Uuid,
    pub name: String,
    pub interior_site: Uuid,
    pub kind: String,
    pub lifecycle: String,
    pub certificate: Option<Uuid>,
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub bind_host: Option<String>,
    pub failure: Option<String>,
}

impl BackboneAccessPoint {
    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }

    pub fn kind(&self) -> DbResult<AccessPointKind> {
        AccessPointKind::parse(&self.kind)
    }
}

/// Directed edge from a connecting interior site to a peer-kind access point.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InterRouterLink {
    pub id: Uuid,
    pub connecting_interior_site: Uuid,
    pub access_point: Uuid,
    pub cost: i32,
}

/// A tenant application network layered over one backbone.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApplicationNetwork {
    pub id: Uuid,
    pub name: String,
    pub backbone: Uuid,
    /// Human-facing VAN identifier
    pub van_id: String,
    pub lifecycle: String,
    pub certificate: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Maintained by observation of router addresses
    pub connected: bool,
    pub failure: Option<String>,
}

impl ApplicationNetwork {
    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }
}

/// Client credential a VAN uses to join the management backbone.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NetworkCredential {
    pub id: Uuid,
    pub name: String,
    pub van: Uuid,
    pub lifecycle: String,
    pub certificate: Option<Uuid>,
    pub failure: Option<String>,
}

/// Claim token for onboarding member sites.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberInvitation {
    pub id: Uuid,
    pub name: String,
    pub van: Uuid,
    pub lifecycle: String,
    /// Claim credential handed to prospective members
    pub certificate: Option<Uuid>,
    /// The claim-kind access point through which this invitation is redeemed
    pub claim_access: Uuid,
    pub join_deadline: Option<DateTime<Utc>>,
    /// JSON array of site classes granted to members
    pub member_classes: Value,
    pub instance_limit: Option<i32>,
    pub instance_count: i32,
    pub fetch_count: i32,
    pub member_name_prefix: Option<String>,
    pub failure: Option<String>,
}

impl MemberInvitation {
    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }
}

/// Association of an invitation with a member-kind access point.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EdgeLink {
    pub id: Uuid,
    pub invitation: Uuid,
    pub access_point: Uuid,
    pub priority: i32,
}

/// A site that redeemed an invitation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberSite {
    pub id: Uuid,
    pub name: String,
    pub van: Uuid,
    pub invitation: Uuid,
    pub lifecycle: String,
    pub certificate: Option<Uuid>,
    /// JSON array of site classes, copied from the invitation at claim time
    pub site_classes: Value,
    pub metadata: Option<Value>,
    pub first_active_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl MemberSite {
    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }

    /// Site classes as strings; tolerates non-string entries by skipping them.
    pub fn site_class_list(&self) -> Vec<String> {
        self.site_classes
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Opaque credential record. `signed_by` forms a trust forest rooted at NULL,
/// the external root issuer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TlsCertificate {
    pub id: Uuid,
    /// Name of the cluster-side secret/certificate object
    pub name: String,
    pub is_ca: bool,
    pub signed_by: Option<Uuid>,
    pub expiration: Option<DateTime<Utc>>,
    pub renewal_time: Option<DateTime<Utc>>,
}

/// Queued certificate issuance job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CertificateRequest {
    pub id: Uuid,
    pub kind: String,
    /// The entity row this request will credential
    pub target: Uuid,
    /// Issuing TlsCertificate, NULL for the external root issuer
    pub issuer: Option<Uuid>,
    pub duration_days: i64,
    /// Not-before gate for the request loop
    pub request_time: DateTime<Utc>,
    pub lifecycle: String,
    pub created_at: DateTime<Utc>,
}

impl CertificateRequest {
    pub fn kind(&self) -> DbResult<EntityKind> {
        EntityKind::parse(&self.kind)
    }

    pub fn lifecycle(&self) -> DbResult<Lifecycle> {
        Lifecycle::parse(&self.lifecycle)
    }
}

/// One revision of a named library block.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LibraryBlockRow {
    pub id: Uuid,
    pub name: String,
    pub revision: i32,
    pub block_type: String,
    /// Interfaces, body, and config defaults as structured JSON
    pub spec: Value,
    pub created_at: DateTime<Utc>,
}

/// A declarative application composition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApplicationRow {
    pub id: Uuid,
    pub name: String,
    pub root_block: String,
    pub lifecycle: String,
    pub build_log: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Instantiation of a library block within an application.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceBlockRow {
    pub id: Uuid,
    pub application: Uuid,
    pub library_block: Uuid,
    /// `/`-separated instance path from the root block
    pub path: String,
    pub config: Option<Value>,
    pub allocate_to_site: bool,
    pub site_classes: Option<Value>,
}

/// Record of an application deployed to a VAN.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeployedApplication {
    pub id: Uuid,
    pub application: Uuid,
    pub van: Uuid,
    pub deploy_log: Option<Value>,
    pub deployed_at: DateTime<Utc>,
}

/// Per-member-site configuration produced by the compose engine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SiteDataRow {
    pub id: Uuid,
    pub member_site: Uuid,
    pub application: Uuid,
    pub data: String,
    pub updated_at: DateTime<Utc>,
}
