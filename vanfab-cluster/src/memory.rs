//! In-memory platform for tests and standalone operation.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::annotations::ANNOTATION_CONTROLLED;
use crate::object::{object_kind, object_name, set_annotation, set_namespace};
use crate::platform::{ClusterPlatform, WatchAction, WatchEvent};
use crate::{ClusterError, ClusterResult};

/// Holds objects keyed by `(kind, name)` and fans watch events out to every
/// subscriber. Dropped receivers are pruned on the next delivery.
pub struct MemoryPlatform {
    namespace: String,
    objects: DashMap<(String, String), Value>,
    secret_watchers: Mutex<Vec<mpsc::UnboundedSender<WatchEvent>>>,
    certificate_watchers: Mutex<Vec<mpsc::UnboundedSender<WatchEvent>>>,
}

impl MemoryPlatform {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            objects: DashMap::new(),
            secret_watchers: Mutex::new(Vec::new()),
            certificate_watchers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, kind: &str, action: WatchAction, object: &Value) {
        let watchers = match kind {
            "Secret" => &self.secret_watchers,
            "Certificate" => &self.certificate_watchers,
            _ => return,
        };
        let event = WatchEvent {
            action,
            object: object.clone(),
        };
        watchers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Test hook: place an object without the controlled annotation, as an
    /// out-of-band actor (cert-manager) would.
    pub fn inject(&self, obj: Value) {
        let kind = object_kind(&obj).unwrap_or_default().to_string();
        let name = object_name(&obj).unwrap_or_default().to_string();
        let action = if self.objects.contains_key(&(kind.clone(), name.clone())) {
            WatchAction::Modified
        } else {
            WatchAction::Added
        };
        self.objects.insert((kind.clone(), name), obj.clone());
        self.notify(&kind, action, &obj);
    }

    /// Number of stored objects of one kind (test helper).
    pub fn count(&self, kind: &str) -> usize {
        self.objects.iter().filter(|e| e.key().0 == kind).count()
    }
}

#[async_trait]
impl ClusterPlatform for MemoryPlatform {
    async fn apply_object(&self, mut obj: Value) -> ClusterResult<()> {
        let kind = object_kind(&obj)
            .ok_or_else(|| ClusterError::InvalidObject("missing kind".into()))?
            .to_string();
        let name = object_name(&obj)
            .ok_or_else(|| ClusterError::InvalidObject("missing metadata.name".into()))?
            .to_string();
        set_annotation(&mut obj, ANNOTATION_CONTROLLED, "true");
        set_namespace(&mut obj, &self.namespace);

        let key = (kind.clone(), name.clone());
        let action = if self.objects.contains_key(&key) {
            WatchAction::Modified
        } else {
            WatchAction::Added
        };
        self.objects.insert(key, obj.clone());
        debug!(kind = %kind, name = %name, "object applied");
        self.notify(&kind, action, &obj);
        Ok(())
    }

    async fn load_secret(&self, name: &str) -> ClusterResult<Option<Value>> {
        Ok(self
            .objects
            .get(&("Secret".to_string(), name.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn load_certificate(&self, name: &str) -> ClusterResult<Option<Value>> {
        Ok(self
            .objects
            .get(&("Certificate".to_string(), name.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn delete_object(&self, kind: &str, name: &str) -> ClusterResult<()> {
        self.objects.remove(&(kind.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_objects(&self, kind: &str) -> ClusterResult<Vec<Value>> {
        Ok(self
            .objects
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| e.value().clone())
            .collect())
    }

    fn watch_secrets(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.secret_watchers.lock().push(tx);
        rx
    }

    fn watch_certificates(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.certificate_watchers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::ANNOTATION_DBLINK;
    use crate::object::{annotation, new_object};

    #[tokio::test]
    async fn apply_marks_controlled_and_namespaces() {
        let platform = MemoryPlatform::new("fabric");
        platform
            .apply_object(new_object("v1", "Secret", "s1"))
            .await
            .unwrap();
        let stored = platform.load_secret("s1").await.unwrap().unwrap();
        assert_eq!(annotation(&stored, ANNOTATION_CONTROLLED), Some("true"));
        assert_eq!(stored.pointer("/metadata/namespace").unwrap(), "fabric");
    }

    #[tokio::test]
    async fn watchers_see_added_then_modified() {
        let platform = MemoryPlatform::new("fabric");
        let mut rx = platform.watch_secrets();

        platform
            .apply_object(new_object("v1", "Secret", "s1"))
            .await
            .unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.action, WatchAction::Added);

        let mut again = new_object("v1", "Secret", "s1");
        set_annotation(&mut again, ANNOTATION_DBLINK, "req-1");
        platform.apply_object(again).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.action, WatchAction::Modified);
        assert_eq!(annotation(&ev.object, ANNOTATION_DBLINK), Some("req-1"));
    }

    #[tokio::test]
    async fn inject_reports_like_an_external_writer() {
        let platform = MemoryPlatform::new("fabric");
        let mut rx = platform.watch_certificates();
        platform.inject(new_object("cert-manager.io/v1", "Certificate", "c1"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.action, WatchAction::Added);
        // inject leaves the object unannotated
        assert_eq!(annotation(&ev.object, ANNOTATION_CONTROLLED), None);
    }
}
