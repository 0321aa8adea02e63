//! Deployment-state evaluation.
//!
//! Decides when a site is deployable and how. Rules, in order:
//!
//! 1. `active` sites are `deployed`.
//! 2. `ready` sites with a link into an already-deployed site are
//!    `ready-automatic`.
//! 3. `ready` sites carrying a manage access point are `ready-bootstrap`.
//! 4. Everything else is `not-ready`.
//!
//! All triggers run inside the caller's transaction; a site reaching
//! `deployed` cascades into every site linking into it. No-op writes are
//! suppressed.

use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use vanfab_db::{DbError, DbResult, DeploymentState, Lifecycle};

/// The facts the rules consume, separated from the queries for testability.
#[derive(Debug, Clone)]
pub struct SiteSnapshot {
    pub lifecycle: Lifecycle,
    pub has_deployed_successor: bool,
    pub has_manage_access: bool,
}

/// Pure rule evaluation.
pub fn compute_deployment_state(site: &SiteSnapshot) -> DeploymentState {
    if site.lifecycle == Lifecycle::Active {
        return DeploymentState::Deployed;
    }
    if site.lifecycle == Lifecycle::Ready {
        if site.has_deployed_successor {
            return DeploymentState::ReadyAutomatic;
        }
        if site.has_manage_access {
            return DeploymentState::ReadyBootstrap;
        }
    }
    DeploymentState::NotReady
}

async fn snapshot(
    tx: &mut Transaction<'static, Postgres>,
    site: Uuid,
) -> DbResult<Option<(SiteSnapshot, DeploymentState)>> {
    let row = sqlx::query(
        "SELECT lifecycle, deployment_state FROM interior_sites WHERE id = $1",
    )
    .bind(site)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let lifecycle = Lifecycle::parse(row.try_get::<String, _>("lifecycle")?.as_str())?;
    let current = DeploymentState::parse(row.try_get::<String, _>("deployment_state")?.as_str())?;

    let has_deployed_successor = sqlx::query(
        "SELECT 1 FROM inter_router_links l
         JOIN backbone_access_points ap ON l.access_point = ap.id
         JOIN interior_sites target ON ap.interior_site = target.id
         WHERE l.connecting_interior_site = $1
           AND target.deployment_state = 'deployed'
         LIMIT 1",
    )
    .bind(site)
    .fetch_optional(&mut **tx)
    .await?
    .is_some();

    let has_manage_access = sqlx::query(
        "SELECT 1 FROM backbone_access_points
         WHERE interior_site = $1 AND kind = 'manage'
         LIMIT 1",
    )
    .bind(site)
    .fetch_optional(&mut **tx)
    .await?
    .is_some();

    Ok(Some((
        SiteSnapshot {
            lifecycle,
            has_deployed_successor,
            has_manage_access,
        },
        current,
    )))
}

/// Re-evaluate one site, cascading into predecessors when it reaches
/// `deployed`.
async fn evaluate(
    tx: &mut Transaction<'static, Postgres>,
    site: Uuid,
) -> DbResult<()> {
    let mut worklist = vec![site];
    let mut visited = Vec::new();

    while let Some(current_site) = worklist.pop() {
        if visited.contains(&current_site) {
            continue;
        }
        visited.push(current_site);

        let Some((snapshot, current_state)) = snapshot(tx, current_site).await? else {
            continue;
        };
        let next_state = compute_deployment_state(&snapshot);
        if next_state == current_state {
            continue;
        }

        sqlx::query("UPDATE interior_sites SET deployment_state = $2 WHERE id = $1")
            .bind(current_site)
            .bind(next_state.as_str())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        debug!(site = %current_site, state = %next_state, "deployment state updated");

        // A newly deployed site may unlock automatic readiness upstream.
        if next_state == DeploymentState::Deployed {
            let predecessors = sqlx::query(
                "SELECT l.connecting_interior_site AS site
                 FROM inter_router_links l
                 JOIN backbone_access_points ap ON l.access_point = ap.id
                 WHERE ap.interior_site = $1",
            )
            .bind(current_site)
            .fetch_all(&mut **tx)
            .await?;
            for row in predecessors {
                worklist.push(row.try_get("site")?);
            }
        }
    }
    Ok(())
}

/// Trigger: the site's lifecycle column changed.
pub async fn site_lifecycle_changed(
    tx: &mut Transaction<'static, Postgres>,
    site: Uuid,
) -> DbResult<()> {
    evaluate(tx, site).await
}

/// Trigger: an inter-router link from this site was added or deleted.
pub async fn link_changed(
    tx: &mut Transaction<'static, Postgres>,
    connecting_site: Uuid,
) -> DbResult<()> {
    evaluate(tx, connecting_site).await
}

/// Trigger: a manage access point on this site was added or deleted.
pub async fn manage_access_changed(
    tx: &mut Transaction<'static, Postgres>,
    site: Uuid,
) -> DbResult<()> {
    evaluate(tx, site).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        lifecycle: Lifecycle,
        has_deployed_successor: bool,
        has_manage_access: bool,
    ) -> SiteSnapshot {
        SiteSnapshot {
            lifecycle,
            has_deployed_successor,
            has_manage_access,
        }
    }

    #[test]
    fn active_site_is_deployed() {
        assert_eq!(
            compute_deployment_state(&snapshot(Lifecycle::Active, false, false)),
            DeploymentState::Deployed
        );
    }

    #[test]
    fn ready_site_with_deployed_successor_is_automatic() {
        assert_eq!(
            compute_deployment_state(&snapshot(Lifecycle::Ready, true, true)),
            DeploymentState::ReadyAutomatic
        );
    }

    #[test]
    fn ready_site_with_manage_access_is_bootstrap() {
        assert_eq!(
            compute_deployment_state(&snapshot(Lifecycle::Ready, false, true)),
            DeploymentState::ReadyBootstrap
        );
    }

    #[test]
    fn ready_site_with_neither_is_not_ready() {
        assert_eq!(
            compute_deployment_state(&snapshot(Lifecycle::Ready, false, false)),
            DeploymentState::NotReady
        );
    }

    #[test]
    fn new_site_is_not_ready_regardless_of_graph() {
        assert_eq!(
            compute_deployment_state(&snapshot(Lifecycle::New, true, true)),
            DeploymentState::NotReady
        );
    }
}
