//! Schema bootstrap.
//!
//! The DDL mirrors the authoritative SQL schema; `ensure_schema` is
//! idempotent so a fresh database becomes usable at first startup without
//! external migration tooling.

use sqlx::PgPool;
use tracing::debug;

use crate::error::DbResult;

const TABLES: &[(&str, &str)] = &[
    (
        "tls_certificates",
        "CREATE TABLE IF NOT EXISTS tls_certificates (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            is_ca BOOLEAN NOT NULL DEFAULT FALSE,
            signed_by UUID REFERENCES tls_certificates(id),
            expiration TIMESTAMPTZ,
            renewal_time TIMESTAMPTZ
        )",
    ),
    (
        "management_controllers",
        "CREATE TABLE IF NOT EXISTS management_controllers (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            lifecycle TEXT NOT NULL DEFAULT 'new',
            certificate UUID REFERENCES tls_certificates(id),
            failure TEXT
        )",
    ),
    (
        "backbones",
        "CREATE TABLE IF NOT EXISTS backbones (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            lifecycle TEXT NOT NULL DEFAULT 'new',
            certificate UUID REFERENCES tls_certificates(id),
            management BOOLEAN NOT NULL DEFAULT FALSE,
            failure TEXT
        )",
    ),
    (
        "interior_sites",
        "CREATE TABLE IF NOT EXISTS interior_sites (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            backbone UUID NOT NULL REFERENCES backbones(id),
            lifecycle TEXT NOT NULL DEFAULT 'new',
            certificate UUID REFERENCES tls_certificates(id),
            deployment_state TEXT NOT NULL DEFAULT 'not-ready',
            platform TEXT,
            first_active_time TIMESTAMPTZ,
            last_heartbeat TIMESTAMPTZ,
            failure TEXT
        )",
    ),
    (
        "backbone_access_points",
        "CREATE TABLE IF NOT EXISTS backbone_access_points (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            interior_site UUID NOT NULL REFERENCES interior_sites(id),
            kind TEXT NOT NULL,
            lifecycle TEXT NOT NULL DEFAULT 'partial',
            certificate UUID REFERENCES tls_certificates(id),
            hostname TEXT,
            port TEXT,
            bind_host TEXT,
            failure TEXT
        )",
    ),
    (
        "inter_router_links",
        "CREATE TABLE IF NOT EXISTS inter_router_links (
            id UUID PRIMARY KEY,
            connecting_interior_site UUID NOT NULL REFERENCES interior_sites(id),
            access_point UUID NOT NULL REFERENCES backbone_access_points(id),
            cost INTEGER NOT NULL DEFAULT 1
        )",
    ),
    (
        "application_networks",
        "CREATE TABLE IF NOT EXISTS application_networks (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            backbone UUID NOT NULL REFERENCES backbones(id),
            van_id TEXT NOT NULL,
            lifecycle TEXT NOT NULL DEFAULT 'new',
            certificate UUID REFERENCES tls_certificates(id),
            start_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            end_time TIMESTAMPTZ,
            connected BOOLEAN NOT NULL DEFAULT FALSE,
            failure TEXT
        )",
    ),
    (
        "network_credentials",
        "CREATE TABLE IF NOT EXISTS network_credentials (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            van UUID NOT NULL REFERENCES application_networks(id),
            lifecycle TEXT NOT NULL DEFAULT 'new',
            certificate UUID REFERENCES tls_certificates(id),
            failure TEXT
        )",
    ),
    (
        "member_invitations",
        "CREATE TABLE IF NOT EXISTS member_invitations (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            van UUID NOT NULL REFERENCES application_networks(id),
            lifecycle TEXT NOT NULL DEFAULT 'new',
            certificate UUID REFERENCES tls_certificates(id),
            claim_access UUID NOT NULL REFERENCES backbone_access_points(id),
            join_deadline TIMESTAMPTZ,
            member_classes JSONB NOT NULL DEFAULT '[]',
            instance_limit INTEGER,
            instance_count INTEGER NOT NULL DEFAULT 0,
            fetch_count INTEGER NOT NULL DEFAULT 0,
            member_name_prefix TEXT,
            failure TEXT
        )",
    ),
    (
        "edge_links",
        "CREATE TABLE IF NOT EXISTS edge_links (
            id UUID PRIMARY KEY,
            invitation UUID NOT NULL REFERENCES member_invitations(id),
            access_point UUID NOT NULL REFERENCES backbone_access_points(id),
            priority INTEGER NOT NULL DEFAULT 4
        )",
    ),
    (
        "member_sites",
        "CREATE TABLE IF NOT EXISTS member_sites (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            van UUID NOT NULL REFERENCES application_networks(id),
            invitation UUID NOT NULL REFERENCES member_invitations(id),
            lifecycle TEXT NOT NULL DEFAULT 'new',
            certificate UUID REFERENCES tls_certificates(id),
            site_classes JSONB NOT NULL DEFAULT '[]',
            metadata JSONB,
            first_active_time TIMESTAMPTZ,
            last_heartbeat TIMESTAMPTZ,
            failure TEXT
        )",
    ),
    (
        "certificate_requests",
        "CREATE TABLE IF NOT EXISTS certificate_requests (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            target UUID NOT NULL,
            issuer UUID REFERENCES tls_certificates(id),
            duration_days BIGINT NOT NULL,
            request_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            lifecycle TEXT NOT NULL DEFAULT 'new',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ),
    (
        "configuration",
        "CREATE TABLE IF NOT EXISTS configuration (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    ),
    (
        "target_platforms",
        "CREATE TABLE IF NOT EXISTS target_platforms (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        )",
    ),
    (
        "block_types",
        "CREATE TABLE IF NOT EXISTS block_types (
            name TEXT PRIMARY KEY,
            allow_north BOOLEAN NOT NULL,
            allow_south BOOLEAN NOT NULL,
            allocation TEXT NOT NULL
        )",
    ),
    (
        "interface_roles",
        "CREATE TABLE IF NOT EXISTS interface_roles (
            name TEXT PRIMARY KEY,
            description TEXT
        )",
    ),
    (
        "library_blocks",
        "CREATE TABLE IF NOT EXISTS library_blocks (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            block_type TEXT NOT NULL,
            spec JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (name, revision)
        )",
    ),
    (
        "applications",
        "CREATE TABLE IF NOT EXISTS applications (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            root_block TEXT NOT NULL,
            lifecycle TEXT NOT NULL DEFAULT 'new',
            build_log JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ),
    (
        "instance_blocks",
        "CREATE TABLE IF NOT EXISTS instance_blocks (
            id UUID PRIMARY KEY,
            application UUID NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
            library_block UUID NOT NULL REFERENCES library_blocks(id),
            path TEXT NOT NULL,
            config JSONB,
            allocate_to_site BOOLEAN NOT NULL DEFAULT FALSE,
            site_classes JSONB
        )",
    ),
    (
        "bindings",
        "CREATE TABLE IF NOT EXISTS bindings (
            id UUID PRIMARY KEY,
            application UUID NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
            north_path TEXT NOT NULL,
            north_interface TEXT NOT NULL,
            south_path TEXT NOT NULL,
            south_interface TEXT NOT NULL
        )",
    ),
    (
        "deployed_applications",
        "CREATE TABLE IF NOT EXISTS deployed_applications (
            id UUID PRIMARY KEY,
            application UUID NOT NULL REFERENCES applications(id),
            van UUID NOT NULL REFERENCES application_networks(id),
            deploy_log JSONB,
            deployed_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ),
    (
        "site_data",
        "CREATE TABLE IF NOT EXISTS site_data (
            id UUID PRIMARY KEY,
            member_site UUID NOT NULL REFERENCES member_sites(id) ON DELETE CASCADE,
            application UUID NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
            data TEXT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (member_site, application)
        )",
    ),
];

/// Apply every table's DDL in dependency order.
pub async fn ensure_schema(pool: &PgPool) -> DbResult<()> {
    for (name, ddl) in TABLES {
        sqlx::query(ddl).execute(pool).await?;
        debug!(table = name, "schema ensured");
    }
    Ok(())
}
