//! Site download bundles.
//!
//! A bundle is the concatenation of every YAML document a site needs to
//! deploy, in a fixed order: service account, role, role binding, router
//! config map, deployment, site-api service (kube only), the site secret,
//! link config maps, access-point config maps, and — for bootstrap
//! deployments — the access-point server secrets.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::templates::{
    access_point_config_map, annotated_secret, deployment, link_config_map, role, role_binding,
    router_config_map, service_account, site_api_service, to_yaml, RouterMode, SiteRole,
};
use crate::ManifestResult;

/// One secret to embed, with its sync-protocol identity.
#[derive(Debug, Clone)]
pub struct BundleSecret {
    pub name: String,
    pub data: Map<String, Value>,
    pub state_key: String,
    pub hash: String,
    pub inject: Option<String>,
}

/// One outgoing link to configure.
#[derive(Debug, Clone)]
pub struct BundleLink {
    pub id: Uuid,
    pub host: String,
    pub port: String,
    pub cost: String,
}

/// One access point the router must open.
#[derive(Debug, Clone)]
pub struct BundleAccessPoint {
    pub id: Uuid,
    pub kind: String,
    pub bind_host: Option<String>,
}

/// Everything needed to render one site's bundle.
#[derive(Debug, Clone)]
pub struct SiteBundle {
    pub site_name: String,
    pub site_id: Uuid,
    pub platform: String,
    pub mode: RouterMode,
    pub role: SiteRole,
    pub network_id: Option<String>,
    pub tenant_id: Option<String>,
    pub site_secret: BundleSecret,
    pub links: Vec<BundleLink>,
    pub access_points: Vec<BundleAccessPoint>,
    /// Server secrets included only for `ready-bootstrap` sites
    pub access_secrets: Vec<BundleSecret>,
}

fn push_doc(out: &mut Vec<String>, resource: &Value) -> ManifestResult<()> {
    out.push(to_yaml(resource)?);
    Ok(())
}

/// Render the bundle as one multi-document YAML string.
pub fn site_bundle(bundle: &SiteBundle) -> ManifestResult<String> {
    let mut docs = Vec::new();

    push_doc(&mut docs, &service_account(&bundle.site_name))?;
    push_doc(&mut docs, &role(bundle.role))?;
    push_doc(&mut docs, &role_binding(&bundle.site_name, bundle.role))?;
    push_doc(
        &mut docs,
        &router_config_map(
            bundle.site_id,
            bundle.mode,
            bundle.network_id.as_deref(),
            bundle.tenant_id.as_deref(),
        ),
    )?;
    push_doc(
        &mut docs,
        &deployment(&bundle.site_name, bundle.site_id, &bundle.platform),
    )?;
    if bundle.platform == "kube" {
        push_doc(&mut docs, &site_api_service(&bundle.site_name))?;
    }
    push_doc(
        &mut docs,
        &annotated_secret(
            &bundle.site_secret.name,
            &bundle.site_secret.data,
            &bundle.site_secret.state_key,
            &bundle.site_secret.hash,
            bundle.site_secret.inject.as_deref(),
        ),
    )?;
    for link in &bundle.links {
        push_doc(
            &mut docs,
            &link_config_map(link.id, &link.host, &link.port, &link.cost),
        )?;
    }
    for ap in &bundle.access_points {
        push_doc(
            &mut docs,
            &access_point_config_map(ap.id, &ap.kind, ap.bind_host.as_deref()),
        )?;
    }
    for secret in &bundle.access_secrets {
        push_doc(
            &mut docs,
            &annotated_secret(
                &secret.name,
                &secret.data,
                &secret.state_key,
                &secret.hash,
                secret.inject.as_deref(),
            ),
        )?;
    }

    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(name: &str, key: &str) -> BundleSecret {
        let mut data = Map::new();
        data.insert("tls.crt".into(), json!("Y2VydA=="));
        BundleSecret {
            name: name.into(),
            data,
            state_key: key.into(),
            hash: "h".into(),
            inject: Some("site".into()),
        }
    }

    fn bundle() -> SiteBundle {
        let site_id = Uuid::new_v4();
        SiteBundle {
            site_name: "s1".into(),
            site_id,
            platform: "kube".into(),
            mode: RouterMode::Interior,
            role: SiteRole::Backbone,
            network_id: None,
            tenant_id: None,
            site_secret: secret("skx-site-s1", &format!("tls-site-{site_id}")),
            links: vec![],
            access_points: vec![BundleAccessPoint {
                id: Uuid::new_v4(),
                kind: "manage".into(),
                bind_host: None,
            }],
            access_secrets: vec![secret("skx-ap-1", "tls-server-x")],
        }
    }

    #[test]
    fn kube_bundle_orders_documents() {
        let rendered = site_bundle(&bundle()).unwrap();
        let kinds: Vec<&str> = rendered
            .split("---\n")
            .map(|doc| {
                doc.lines()
                    .find_map(|l| l.strip_prefix("kind: "))
                    .unwrap_or("?")
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "ServiceAccount",
                "Role",
                "RoleBinding",
                "ConfigMap",
                "Deployment",
                "Service",
                "Secret",
                "ConfigMap",
                "Secret"
            ]
        );
    }

    #[test]
    fn non_kube_bundle_skips_the_service() {
        let mut b = bundle();
        b.platform = "podman".into();
        let rendered = site_bundle(&b).unwrap();
        assert!(!rendered.contains("kind: Service\n"));
    }

    #[test]
    fn exactly_one_deployment_and_role_binding() {
        let rendered = site_bundle(&bundle()).unwrap();
        assert_eq!(rendered.matches("kind: Deployment").count(), 1);
        assert_eq!(rendered.matches("kind: RoleBinding").count(), 1);
    }
}
