//! Enumerations shared by every table and subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DbError;

/// Lifecycle of a managed entity.
///
/// Entities progress `partial (optional) -> new -> skx_cr_created ->
/// cm_cert_created -> ready -> active (sites only)`, with `expired` and
/// `failed` as terminal states. The reconciler owning the entity performs
/// each step; the sync bridge owns the `ready -> active` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created but missing required attributes (access points without ingress)
    Partial,
    /// Eligible for certificate issuance
    New,
    /// A certificate request row has been queued
    SkxCrCreated,
    /// The cluster certificate object has been created
    CmCertCreated,
    /// Credential finalized; entity is usable
    Ready,
    /// First heartbeat received (sites only)
    Active,
    /// Validity interval elapsed
    Expired,
    /// Unrecoverable failure; see the row's failure column
    Failed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Partial => "partial",
            Lifecycle::New => "new",
            Lifecycle::SkxCrCreated => "skx_cr_created",
            Lifecycle::CmCertCreated => "cm_cert_created",
            Lifecycle::Ready => "ready",
            Lifecycle::Active => "active",
            Lifecycle::Expired => "expired",
            Lifecycle::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DbError> {
        match value {
            "partial" => Ok(Lifecycle::Partial),
            "new" => Ok(Lifecycle::New),
            "skx_cr_created" => Ok(Lifecycle::SkxCrCreated),
            "cm_cert_created" => Ok(Lifecycle::CmCertCreated),
            "ready" => Ok(Lifecycle::Ready),
            "active" => Ok(Lifecycle::Active),
            "expired" => Ok(Lifecycle::Expired),
            "failed" => Ok(Lifecycle::Failed),
            other => Err(DbError::InvalidEnum {
                column: "lifecycle".into(),
                value: other.into(),
            }),
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of ingress an access point provides on an interior router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPointKind {
    /// Redeems member invitations
    Claim,
    /// Accepts inter-router links from other backbone sites
    Peer,
    /// Accepts edge links from member sites
    Member,
    /// Accepts the management controller itself
    Manage,
    /// Accepts external tenant networks
    Van,
}

impl AccessPointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPointKind::Claim => "claim",
            AccessPointKind::Peer => "peer",
            AccessPointKind::Member => "member",
            AccessPointKind::Manage => "manage",
            AccessPointKind::Van => "van",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DbError> {
        match value {
            "claim" => Ok(AccessPointKind::Claim),
            "peer" => Ok(AccessPointKind::Peer),
            "member" => Ok(AccessPointKind::Member),
            "manage" => Ok(AccessPointKind::Manage),
            "van" => Ok(AccessPointKind::Van),
            other => Err(DbError::InvalidEnum {
                column: "kind".into(),
                value: other.into(),
            }),
        }
    }
}

impl fmt::Display for AccessPointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployability of an interior site, derived from the site/link/access graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    /// Credentials not yet issued
    NotReady,
    /// Ready and carries a manage access point; deploy by hand
    ReadyBootstrap,
    /// Ready and linked into an already-deployed site
    ReadyAutomatic,
    /// The router has connected at least once
    Deployed,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::NotReady => "not-ready",
            DeploymentState::ReadyBootstrap => "ready-bootstrap",
            DeploymentState::ReadyAutomatic => "ready-automatic",
            DeploymentState::Deployed => "deployed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DbError> {
        match value {
            "not-ready" => Ok(DeploymentState::NotReady),
            "ready-bootstrap" => Ok(DeploymentState::ReadyBootstrap),
            "ready-automatic" => Ok(DeploymentState::ReadyAutomatic),
            "deployed" => Ok(DeploymentState::Deployed),
            other => Err(DbError::InvalidEnum {
                column: "deployment_state".into(),
                value: other.into(),
            }),
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of a peer tracked by the state-sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerClass {
    Management,
    Backbone,
    Member,
}

impl PeerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerClass::Management => "management",
            PeerClass::Backbone => "backbone",
            PeerClass::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DbError> {
        match value {
            "management" => Ok(PeerClass::Management),
            "backbone" => Ok(PeerClass::Backbone),
            "member" => Ok(PeerClass::Member),
            other => Err(DbError::InvalidEnum {
                column: "class".into(),
                value: other.into(),
            }),
        }
    }
}

impl fmt::Display for PeerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entity a certificate request was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    ManagementController,
    Backbone,
    AccessPoint,
    ApplicationNetwork,
    InteriorSite,
    NetworkCredential,
    MemberInvitation,
    MemberSite,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ManagementController => "controller",
            EntityKind::Backbone => "backbone",
            EntityKind::AccessPoint => "accesspoint",
            EntityKind::ApplicationNetwork => "van",
            EntityKind::InteriorSite => "interiorsite",
            EntityKind::NetworkCredential => "networkcredential",
            EntityKind::MemberInvitation => "invitation",
            EntityKind::MemberSite => "membersite",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DbError> {
        match value {
            "controller" => Ok(EntityKind::ManagementController),
            "backbone" => Ok(EntityKind::Backbone),
            "accesspoint" => Ok(EntityKind::AccessPoint),
            "van" => Ok(EntityKind::ApplicationNetwork),
            "interiorsite" => Ok(EntityKind::InteriorSite),
            "networkcredential" => Ok(EntityKind::NetworkCredential),
            "invitation" => Ok(EntityKind::MemberInvitation),
            "membersite" => Ok(EntityKind::MemberSite),
            other => Err(DbError::InvalidEnum {
                column: "kind".into(),
                value: other.into(),
            }),
        }
    }

    /// Entities whose issued credential is itself a certificate authority.
    pub fn issues_ca(&self) -> bool {
        matches!(
            self,
            EntityKind::Backbone | EntityKind::ApplicationNetwork
        )
    }

    /// Default requested certificate duration, in days.
    pub fn default_duration_days(&self) -> i64 {
        match self {
            EntityKind::Backbone | EntityKind::ApplicationNetwork => 3650,
            EntityKind::MemberInvitation => 90,
            _ => 365,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_round_trips_through_strings() {
        for lc in [
            Lifecycle::Partial,
            Lifecycle::New,
            Lifecycle::SkxCrCreated,
            Lifecycle::CmCertCreated,
            Lifecycle::Ready,
            Lifecycle::Active,
            Lifecycle::Expired,
            Lifecycle::Failed,
        ] {
            assert_eq!(Lifecycle::parse(lc.as_str()).unwrap(), lc);
        }
        assert!(Lifecycle::parse("bogus").is_err());
    }

    #[test]
    fn access_point_kind_rejects_unknown() {
        assert_eq!(AccessPointKind::parse("manage").unwrap(), AccessPointKind::Manage);
        assert!(AccessPointKind::parse("ssh").is_err());
    }

    #[test]
    fn ca_kinds_are_the_two_network_roots() {
        assert!(EntityKind::Backbone.issues_ca());
        assert!(EntityKind::ApplicationNetwork.issues_ca());
        assert!(!EntityKind::InteriorSite.issues_ca());
        assert!(!EntityKind::MemberSite.issues_ca());
    }
}
