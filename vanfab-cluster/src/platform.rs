//! The platform trait the core consumes.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ClusterResult;

/// Action reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Added,
    Modified,
}

/// One watch delivery.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub object: Value,
}

/// Cluster CRUD and watch surface.
///
/// Implementations are expected to be resilient: benign watch disconnects
/// reconnect silently, and sustained error bursts are logged at most once
/// per minute. Watch receivers obtained before the first apply observe every
/// subsequent `ADDED`/`MODIFIED` delivery.
#[async_trait]
pub trait ClusterPlatform: Send + Sync {
    /// Upsert an object. The implementation annotates it `controlled=true`
    /// and places it in the controller's namespace before writing.
    async fn apply_object(&self, obj: Value) -> ClusterResult<()>;

    /// Load a secret by name, or None if absent.
    async fn load_secret(&self, name: &str) -> ClusterResult<Option<Value>>;

    /// Load a certificate object by name, or None if absent.
    async fn load_certificate(&self, name: &str) -> ClusterResult<Option<Value>>;

    /// Delete an object by kind and name. Deleting an absent object is not
    /// an error.
    async fn delete_object(&self, kind: &str, name: &str) -> ClusterResult<()>;

    /// List all objects of one kind (used by the pruning sweeps).
    async fn list_objects(&self, kind: &str) -> ClusterResult<Vec<Value>>;

    /// Subscribe to secret ADDED/MODIFIED events.
    fn watch_secrets(&self) -> mpsc::UnboundedReceiver<WatchEvent>;

    /// Subscribe to certificate ADDED/MODIFIED events.
    fn watch_certificates(&self) -> mpsc::UnboundedReceiver<WatchEvent>;
}
