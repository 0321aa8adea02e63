//! Configuration from the environment.

use std::env;

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Name of this controller's `management_controllers` row, from
    /// `SKX_CONTROLLER_NAME`, falling back to `HOSTNAME`.
    pub controller_name: String,
    /// Postgres DSN, from `VANFAB_DATABASE_URL`.
    pub database_url: String,
    /// Cluster namespace for applied objects.
    pub namespace: String,
    /// Set when `SKX_STANDALONE_NAMESPACE` is present: run outside the
    /// cluster, namespace taken from the variable.
    pub standalone: bool,
}

impl FabricConfig {
    pub fn from_env() -> FabricConfig {
        let standalone_namespace = env::var("SKX_STANDALONE_NAMESPACE").ok();
        let controller_name = env::var("SKX_CONTROLLER_NAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| "vanfab-controller".to_string());
        let database_url = env::var("VANFAB_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://vanfab@localhost/vanfab".to_string());
        match standalone_namespace {
            Some(namespace) => FabricConfig {
                controller_name,
                database_url,
                namespace,
                standalone: true,
            },
            None => FabricConfig {
                controller_name,
                database_url,
                namespace: "vanfab".to_string(),
                standalone: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        // Not exercising real env mutation here; just the default shape.
        let config = FabricConfig {
            controller_name: "vanfab-controller".into(),
            database_url: "postgres://vanfab@localhost/vanfab".into(),
            namespace: "vanfab".into(),
            standalone: false,
        };
        assert!(!config.standalone);
        assert_eq!(config.namespace, "vanfab");
    }
}
