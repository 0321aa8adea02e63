//! The claim server.
//!
//! A receiver on the fixed claim address of every live backbone session
//! completes member onboarding: validate the invitation, allocate the
//! member-site row, block until the certificate reconciler mints the
//! member's credential, and reply with the deployable bundle.

mod completion;

pub use completion::CompletionTable;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vanfab_cluster::{secret_data, ClusterPlatform};
use vanfab_db::{Database, Lifecycle, MemberInvitation};
use vanfab_manifest::{annotated_secret, hash_of_data, hash_of_object_no_children, StateKey};
use vanfab_protocol::{decode, ClaimReply, Message, CLAIM_ADDRESS};
use vanfab_transport::Session;

/// How long a claim handler waits for the member credential.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum ClaimError {
    #[error("Database error: {0}")]
    Db(#[from] vanfab_db::DbError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] vanfab_cluster::ClusterError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for ClaimError {
    fn from(e: sqlx::Error) -> Self {
        ClaimError::Db(vanfab_db::DbError::from(e))
    }
}

pub type ClaimResult<T> = Result<T, ClaimError>;

pub struct ClaimServer {
    db: Database,
    platform: Arc<dyn ClusterPlatform>,
    completions: CompletionTable,
}

impl ClaimServer {
    pub fn new(db: Database, platform: Arc<dyn ClusterPlatform>) -> Arc<Self> {
        Arc::new(Self {
            db,
            platform,
            completions: CompletionTable::new(),
        })
    }

    /// Open the claim receiver on a backbone session. The pump task ends
    /// when the session closes.
    pub fn attach(self: Arc<Self>, session: &Session) {
        let (_, mut rx) = session.open_receiver(Some(CLAIM_ADDRESS));
        let server = self;
        let responder = session.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let reply = match decode(&delivery.body) {
                    Ok(Message::AssertClaim(claim)) => {
                        server.handle_claim(&claim.claim, &claim.name).await
                    }
                    Ok(other) => {
                        warn!(op = other.op(), "non-claim message on the claim address");
                        ClaimReply::error(400, "expected a claim assertion")
                    }
                    Err(e) => ClaimReply::error(400, format!("bad claim message: {e}")),
                };
                let body = match serde_json::to_value(&reply) {
                    Ok(body) => body,
                    Err(_) => continue,
                };
                if let Err(e) = responder.respond(&delivery, body, Value::Null) {
                    debug!("claim reply send failed: {e}");
                }
            }
        });
    }

    /// Full claim flow; every failure path becomes a status-coded reply.
    pub async fn handle_claim(&self, claim: &str, name: &str) -> ClaimReply {
        let Ok(invitation_id) = Uuid::parse_str(claim) else {
            return ClaimReply::error(400, "malformed claim identifier");
        };
        let member = match self.allocate_member(invitation_id, name).await {
            Ok(Ok(member)) => member,
            Ok(Err(reply)) => return reply,
            Err(e) => {
                error!(invitation = %invitation_id, "claim allocation failed: {e}");
                return ClaimReply::error(500, "claim processing failed");
            }
        };

        // Block until the reconciler mints the member credential.
        match self.completions.wait(member, COMPLETION_TIMEOUT).await {
            Some(reply) => reply,
            None => {
                warn!(member = %member, "claim completion timed out");
                ClaimReply::error(500, "member credential was not issued in time")
            }
        }
    }

    /// Transaction: validate the invitation, bump its counters, insert the
    /// member row, and register the completion slot. Returns Err(reply) for
    /// rule rejections.
    async fn allocate_member(
        &self,
        invitation_id: Uuid,
        name: &str,
    ) -> ClaimResult<Result<Uuid, ClaimReply>> {
        let mut tx = self.db.begin().await?;
        let invitation: Option<MemberInvitation> =
            sqlx::query_as("SELECT * FROM member_invitations WHERE id = $1 FOR UPDATE")
                .bind(invitation_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(invitation) = invitation else {
            return Ok(Err(ClaimReply::error(404, "no such invitation")));
        };

        if invitation.lifecycle()? != Lifecycle::Ready {
            return Ok(Err(ClaimReply::error(400, "invitation is not ready")));
        }
        if let Some(deadline) = invitation.join_deadline {
            if deadline < Utc::now() {
                return Ok(Err(ClaimReply::error(400, "invitation expired")));
            }
        }
        if let Some(limit) = invitation.instance_limit {
            if invitation.instance_count >= limit {
                return Ok(Err(ClaimReply::error(400, "instance limit reached")));
            }
        }

        sqlx::query(
            "UPDATE member_invitations
             SET instance_count = instance_count + 1, fetch_count = fetch_count + 1
             WHERE id = $1",
        )
        .bind(invitation_id)
        .execute(&mut *tx)
        .await?;

        let member = Uuid::new_v4();
        let full_name = match &invitation.member_name_prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        };
        sqlx::query(
            "INSERT INTO member_sites
                 (id, name, van, invitation, lifecycle, site_classes, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(member)
        .bind(&full_name)
        .bind(invitation.van)
        .bind(invitation_id)
        .bind(Lifecycle::New.as_str())
        .bind(&invitation.member_classes)
        .bind(json!({"claimedAt": Utc::now().to_rfc3339()}))
        .execute(&mut *tx)
        .await?;

        // The slot must exist before commit: finalization can race the
        // handler to the wait.
        self.completions.register(member);
        tx.commit().await.map_err(vanfab_db::DbError::from)?;
        info!(member = %member, name = %full_name, invitation = %invitation_id,
              "member site allocated");
        Ok(Ok(member))
    }

    /// Called after the member's credential finalizes: assemble the reply
    /// and release the blocked handler.
    pub async fn complete_member(&self, member: Uuid) -> ClaimResult<()> {
        let reply = match self.build_completion(member).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(member = %member, "claim completion assembly failed: {e}");
                ClaimReply::error(500, "member credential could not be loaded")
            }
        };
        self.completions.complete(member, reply);
        Ok(())
    }

    async fn build_completion(&self, member: Uuid) -> ClaimResult<ClaimReply> {
        let row = sqlx::query(
            "SELECT m.invitation, c.name AS secret_name
             FROM member_sites m
             JOIN tls_certificates c ON m.certificate = c.id
             WHERE m.id = $1",
        )
        .bind(member)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| ClaimError::NotFound(format!("member {member} has no credential")))?;
        let invitation: Uuid = row.try_get("invitation").map_err(vanfab_db::DbError::from)?;
        let secret_name: String = row.try_get("secret_name").map_err(vanfab_db::DbError::from)?;

        let secret = self
            .platform
            .load_secret(&secret_name)
            .await?
            .ok_or_else(|| ClaimError::NotFound(format!("secret {secret_name}")))?;
        let data = secret_data(&secret).cloned().unwrap_or_default();
        let state_key = StateKey::TlsSite(member).to_string();
        let site_client = annotated_secret(
            &secret_name,
            &data,
            &state_key,
            &hash_of_data(&data),
            Some("site"),
        );

        // One outgoing link per edge link, highest priority first.
        let links = sqlx::query(
            "SELECT e.id, ap.hostname, ap.port
             FROM edge_links e
             JOIN backbone_access_points ap ON e.access_point = ap.id
             WHERE e.invitation = $1
             ORDER BY e.priority",
        )
        .bind(invitation)
        .fetch_all(self.db.pool())
        .await?;
        let mut outgoing_links = Vec::new();
        for link in links {
            let link_id: Uuid = link.try_get("id").map_err(vanfab_db::DbError::from)?;
            let hostname: Option<String> =
                link.try_get("hostname").map_err(vanfab_db::DbError::from)?;
            let port: Option<String> = link.try_get("port").map_err(vanfab_db::DbError::from)?;
            let mut entry = json!({
                "host": hostname.unwrap_or_default(),
                "port": port.unwrap_or_default(),
                "cost": "1",
            });
            let hash = hash_of_object_no_children(entry.as_object().unwrap());
            let map = entry.as_object_mut().unwrap();
            map.insert("state-key".into(), json!(StateKey::Link(link_id).to_string()));
            map.insert("state-hash".into(), json!(hash));
            outgoing_links.push(entry);
        }

        Ok(ClaimReply::success(
            member.to_string(),
            outgoing_links,
            site_client,
        ))
    }
}
