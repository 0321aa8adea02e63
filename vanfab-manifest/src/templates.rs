//! Deterministic YAML templates for the cluster resources a site deploys.
//!
//! Pure functions from row data to resource objects; the bridge and the
//! bundle builder decide which resources a given site needs. Field order is
//! fixed by construction so rendered documents are byte-stable for hashing.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{ManifestError, ManifestResult};

/// Router operating mode carried in the site config map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    /// Backbone transit router
    Interior,
    /// Member-site router
    Edge,
}

impl RouterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterMode::Interior => "interior",
            RouterMode::Edge => "edge",
        }
    }
}

/// Role flavor for the site's RBAC objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRole {
    Backbone,
    Member,
}

/// Render a resource object as one YAML document.
pub fn to_yaml(resource: &Value) -> ManifestResult<String> {
    serde_yaml::to_string(resource).map_err(|e| ManifestError::Yaml(e.to_string()))
}

pub fn service_account(site_name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": format!("{site_name}-router")
        }
    })
}

pub fn role(flavor: SiteRole) -> Value {
    let (name, verbs) = match flavor {
        SiteRole::Backbone => (
            "vanfab-backbone-router",
            json!(["get", "list", "watch", "create", "update", "delete"]),
        ),
        SiteRole::Member => ("vanfab-member-router", json!(["get", "list", "watch"])),
    };
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": {
            "name": name
        },
        "rules": [
            {
                "apiGroups": [""],
                "resources": ["secrets", "configmaps"],
                "verbs": verbs
            }
        ]
    })
}

pub fn role_binding(site_name: &str, flavor: SiteRole) -> Value {
    let role_name = match flavor {
        SiteRole::Backbone => "vanfab-backbone-router",
        SiteRole::Member => "vanfab-member-router",
    };
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": {
            "name": format!("{site_name}-router")
        },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Role",
            "name": role_name
        },
        "subjects": [
            {
                "kind": "ServiceAccount",
                "name": format!("{site_name}-router")
            }
        ]
    })
}

/// The router's own configuration, serialized as JSON inside the config map.
pub fn router_config_map(
    site_id: Uuid,
    mode: RouterMode,
    network_id: Option<&str>,
    tenant_id: Option<&str>,
) -> Value {
    let mut router = Map::new();
    router.insert("mode".into(), json!(mode.as_str()));
    router.insert("id".into(), json!(site_id.to_string()));
    if let Some(network) = network_id {
        router.insert("networkId".into(), json!(network));
    }
    if let Some(tenant) = tenant_id {
        router.insert("tenantId".into(), json!(tenant));
    }
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "vanfab-router-config"
        },
        "data": {
            "router.json": Value::Object(router).to_string()
        }
    })
}

/// The site deployment. The dataplane sidecar is platform-dependent:
/// single-process platforms run the router alone.
pub fn deployment(site_name: &str, site_id: Uuid, platform: &str) -> Value {
    let mut containers = vec![json!({
        "name": "router",
        "image": "quay.io/vanfab/router:latest",
        "env": [
            {"name": "VANFAB_SITE_ID", "value": site_id.to_string()}
        ],
        "volumeMounts": [
            {"name": "router-config", "mountPath": "/etc/vanfab/router"}
        ]
    })];
    if platform_has_dataplane(platform) {
        containers.push(json!({
            "name": "dataplane",
            "image": "quay.io/vanfab/dataplane:latest"
        }));
    }
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": format!("{site_name}-router")
        },
        "spec": {
            "replicas": 1,
            "selector": {
                "matchLabels": {"app": format!("{site_name}-router")}
            },
            "template": {
                "metadata": {
                    "labels": {"app": format!("{site_name}-router")}
                },
                "spec": {
                    "serviceAccountName": format!("{site_name}-router"),
                    "containers": containers,
                    "volumes": [
                        {
                            "name": "router-config",
                            "configMap": {"name": "vanfab-router-config"}
                        }
                    ]
                }
            }
        }
    })
}

pub fn platform_has_dataplane(platform: &str) -> bool {
    platform == "kube"
}

/// Site-api service; emitted for kube platforms only.
pub fn site_api_service(site_name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": format!("{site_name}-site-api")
        },
        "spec": {
            "selector": {"app": format!("{site_name}-router")},
            "ports": [
                {"name": "site-api", "port": 8086, "targetPort": 8086}
            ]
        }
    })
}

/// A secret annotated with its sync-protocol identity so the router can
/// advertise it back by state key.
pub fn annotated_secret(
    name: &str,
    data: &Map<String, Value>,
    state_key: &str,
    hash: &str,
    inject: Option<&str>,
) -> Value {
    let mut annotations = Map::new();
    annotations.insert("state-dir".into(), json!("remote"));
    annotations.insert("state-key".into(), json!(state_key));
    annotations.insert("state-hash".into(), json!(hash));
    if let Some(target) = inject {
        annotations.insert("tls-inject".into(), json!(target));
    }
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": name,
            "annotations": Value::Object(annotations)
        },
        "type": "kubernetes.io/tls",
        "data": Value::Object(data.clone())
    })
}

/// Config map describing one outgoing link.
pub fn link_config_map(link_id: Uuid, host: &str, port: &str, cost: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": format!("vanfab-link-{link_id}"),
            "annotations": {
                "state-type": "link",
                "state-id": link_id.to_string()
            }
        },
        "data": {
            "host": host,
            "port": port,
            "cost": cost
        }
    })
}

/// Config map describing one access point the router must open.
pub fn access_point_config_map(ap_id: Uuid, kind: &str, bind_host: Option<&str>) -> Value {
    let mut data = Map::new();
    data.insert("kind".into(), json!(kind));
    if let Some(bind) = bind_host {
        data.insert("bindhost".into(), json!(bind));
    }
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": format!("vanfab-access-{ap_id}"),
            "annotations": {
                "state-type": "accesspoint",
                "state-id": ap_id.to_string()
            }
        },
        "data": Value::Object(data)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deployment_has_two_containers_on_kube() {
        let dep = deployment("s1", Uuid::new_v4(), "kube");
        let containers = dep
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(containers.len(), 2);
    }

    #[test]
    fn deployment_is_single_container_elsewhere() {
        let dep = deployment("s1", Uuid::new_v4(), "podman");
        let containers = dep
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(containers.len(), 1);
    }

    #[test]
    fn secret_carries_state_annotations() {
        let mut data = Map::new();
        data.insert("tls.crt".into(), json!("Y2VydA=="));
        let secret = annotated_secret("s", &data, "tls-site-x", "abc", Some("site"));
        assert_eq!(
            secret.pointer("/metadata/annotations/state-key").unwrap(),
            "tls-site-x"
        );
        assert_eq!(
            secret.pointer("/metadata/annotations/tls-inject").unwrap(),
            "site"
        );
        assert_eq!(
            secret.pointer("/metadata/annotations/state-dir").unwrap(),
            "remote"
        );
    }

    #[test]
    fn router_config_includes_tenant_only_when_given() {
        let with = router_config_map(Uuid::new_v4(), RouterMode::Edge, Some("n1"), Some("t1"));
        let parsed: Value =
            serde_json::from_str(with.pointer("/data/router.json").unwrap().as_str().unwrap())
                .unwrap();
        assert_eq!(parsed["mode"], "edge");
        assert_eq!(parsed["tenantId"], "t1");

        let without = router_config_map(Uuid::new_v4(), RouterMode::Interior, None, None);
        let parsed: Value = serde_json::from_str(
            without
                .pointer("/data/router.json")
                .unwrap()
                .as_str()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(parsed["mode"], "interior");
        assert!(parsed.get("tenantId").is_none());
    }

    #[test]
    fn yaml_rendering_is_stable() {
        let sa = service_account("s1");
        assert_eq!(to_yaml(&sa).unwrap(), to_yaml(&sa).unwrap());
    }
}
