//! The database-facing compose engine: build, deploy, and the per-member
//! application-state cache the sync bridge serves from.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use vanfab_db::{Database, LibraryBlockRow, MemberSite};
use vanfab_manifest::{expand, hash_of_object_no_children, hash_of_text, StateKey};

use crate::graph::{build_graph, AppGraph, Instance};
use crate::library::{BlockBody, Library, LibraryBlock};
use crate::{ComposeError, ComposeResult};

/// A built application, cached copy-on-build; never mutated after
/// publication.
pub struct BuiltApplication {
    pub id: Uuid,
    pub name: String,
    pub root: String,
    pub graph: AppGraph,
    /// instance path -> persisted instance row id
    pub instance_ids: HashMap<String, Uuid>,
    /// one id per graph binding, aligned by index
    pub binding_ids: Vec<Uuid>,
}

/// Outcome of one deploy pass.
#[derive(Debug, Clone, Default)]
pub struct DeploySummary {
    pub sites_matched: usize,
    pub documents: usize,
    pub warnings: Vec<String>,
}

pub struct ComposeEngine {
    db: Database,
    cache: DashMap<Uuid, Arc<BuiltApplication>>,
    /// member site id -> app-state key -> (hash, payload)
    member_state: DashMap<Uuid, HashMap<String, (String, Value)>>,
}

impl ComposeEngine {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache: DashMap::new(),
            member_state: DashMap::new(),
        })
    }

    /// Drop a cached application (deletion path). The next deploy rebuilds.
    pub fn invalidate(&self, application: Uuid) {
        self.cache.remove(&application);
    }

    /// App-state manifest for one member: key -> hash.
    pub fn member_app_hashes(&self, member: Uuid) -> HashMap<String, String> {
        self.member_state
            .get(&member)
            .map(|entry| {
                entry
                    .iter()
                    .map(|(k, (hash, _))| (k.clone(), hash.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Payload behind one app-state key for one member.
    pub fn member_app_payload(&self, member: Uuid, key: &str) -> Option<(String, Value)> {
        self.member_state
            .get(&member)
            .and_then(|entry| entry.get(key).cloned())
    }

    async fn load_library(&self) -> ComposeResult<(Library, HashMap<String, Uuid>)> {
        let rows: Vec<LibraryBlockRow> = sqlx::query_as(
            "SELECT id, name, revision, block_type, spec, created_at FROM library_blocks",
        )
        .fetch_all(self.db.pool())
        .await?;
        let mut library = Library::new();
        let mut best: HashMap<String, (i32, Uuid)> = HashMap::new();
        for row in &rows {
            library.insert(LibraryBlock::from_row(row)?);
            match best.get(&row.name) {
                Some((revision, _)) if *revision >= row.revision => {}
                _ => {
                    best.insert(row.name.clone(), (row.revision, row.id));
                }
            }
        }
        let row_ids = best.into_iter().map(|(name, (_, id))| (name, id)).collect();
        Ok((library, row_ids))
    }

    /// Build an application: instantiate its graph, persist the instance
    /// rows, and cache the result.
    pub async fn build(&self, application: Uuid) -> ComposeResult<Arc<BuiltApplication>> {
        let app_row = sqlx::query("SELECT name, root_block FROM applications WHERE id = $1")
            .bind(application)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| {
                ComposeError::Db(vanfab_db::DbError::not_found(format!(
                    "application {application}"
                )))
            })?;
        let name: String = app_row.try_get("name")?;
        let root: String = app_row.try_get("root_block")?;

        let (library, row_ids) = self.load_library().await?;

        let binding_rows = sqlx::query(
            "SELECT north_path, north_interface, south_path, south_interface
             FROM bindings WHERE application = $1",
        )
        .bind(application)
        .fetch_all(self.db.pool())
        .await?;
        let mut app_bindings = Vec::new();
        for row in binding_rows {
            app_bindings.push((
                row.try_get("north_path")?,
                row.try_get("north_interface")?,
                row.try_get("south_path")?,
                row.try_get("south_interface")?,
            ));
        }

        let graph = match build_graph(&library, &root, &app_bindings) {
            Ok(graph) => graph,
            Err(e) => {
                self.record_build_failure(application, &e).await?;
                return Err(e);
            }
        };

        // Persist the instance rows the build derived.
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM instance_blocks WHERE application = $1")
            .bind(application)
            .execute(&mut *tx)
            .await?;
        let mut instance_ids = HashMap::new();
        for (path, instance) in &graph.instances {
            let instance_id = Uuid::new_v4();
            let library_block = row_ids.get(&instance.block.name).copied().ok_or_else(|| {
                ComposeError::UnknownBlock(instance.block.name.clone())
            })?;
            let site_classes = instance.config.get("siteClasses").cloned();
            sqlx::query(
                "INSERT INTO instance_blocks
                     (id, application, library_block, path, config, allocate_to_site, site_classes)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(instance_id)
            .bind(application)
            .bind(library_block)
            .bind(path)
            .bind(Value::Object(instance.config.clone()))
            .bind(instance.allocate_to_site)
            .bind(site_classes)
            .execute(&mut *tx)
            .await?;
            instance_ids.insert(path.clone(), instance_id);
        }

        let lifecycle = if graph.warnings.is_empty() {
            "ready"
        } else {
            "build-warnings"
        };
        sqlx::query("UPDATE applications SET lifecycle = $2, build_log = $3 WHERE id = $1")
            .bind(application)
            .bind(lifecycle)
            .bind(json!(graph.warnings))
            .execute(&mut *tx)
            .await?;
        tx.commit().await.map_err(vanfab_db::DbError::from)?;

        let binding_ids = graph.bindings.iter().map(|_| Uuid::new_v4()).collect();
        let built = Arc::new(BuiltApplication {
            id: application,
            name,
            root,
            graph,
            instance_ids,
            binding_ids,
        });
        self.cache.insert(application, built.clone());
        info!(application = %application, name = %built.name, "application built");
        Ok(built)
    }

    async fn record_build_failure(
        &self,
        application: Uuid,
        error: &ComposeError,
    ) -> ComposeResult<()> {
        sqlx::query("UPDATE applications SET lifecycle = 'build-errors', build_log = $2 WHERE id = $1")
            .bind(application)
            .bind(json!([error.to_string()]))
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Deploy an application to a VAN: expand every allocated instance on
    /// every member site whose classes intersect, one YAML document per
    /// site, stored in `site_data`.
    pub async fn deploy(&self, application: Uuid, van: Uuid) -> ComposeResult<DeploySummary> {
        let built = match self.cache.get(&application) {
            Some(entry) => entry.value().clone(),
            None => self.build(application).await?,
        };

        let members: Vec<MemberSite> = sqlx::query_as(
            "SELECT * FROM member_sites WHERE van = $1",
        )
        .bind(van)
        .fetch_all(self.db.pool())
        .await?;

        let mut summary = DeploySummary::default();
        for member in &members {
            match self.deploy_member(&built, member, &mut summary).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(member = %member.id, "deploy failed: {e}");
                    sqlx::query(
                        "UPDATE applications SET lifecycle = 'deploy-errors', build_log = $2 WHERE id = $1",
                    )
                    .bind(application)
                    .bind(json!([e.to_string()]))
                    .execute(self.db.pool())
                    .await?;
                    return Err(e);
                }
            }
        }

        sqlx::query(
            "INSERT INTO deployed_applications (id, application, van, deploy_log, deployed_at)
             VALUES ($1, $2, $3, $4, now())",
        )
        .bind(Uuid::new_v4())
        .bind(application)
        .bind(van)
        .bind(json!(summary.warnings))
        .execute(self.db.pool())
        .await?;

        info!(application = %application, van = %van,
              sites = summary.sites_matched, "application deployed");
        Ok(summary)
    }

    async fn deploy_member(
        &self,
        built: &BuiltApplication,
        member: &MemberSite,
        summary: &mut DeploySummary,
    ) -> ComposeResult<()> {
        let classes = member.site_class_list();
        let metadata = member
            .metadata
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let platform = metadata.get("platform").and_then(Value::as_str);

        let mut documents = Vec::new();
        let mut app_state: HashMap<String, (String, Value)> = HashMap::new();

        for (path, instance) in &built.graph.instances {
            if !instance.allocate_to_site {
                continue;
            }
            let instance_classes: Vec<String> = instance
                .config
                .get("siteClasses")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if !instance_classes.iter().any(|c| classes.contains(c)) {
                continue;
            }

            let BlockBody::Simple(templates) = &instance.block.body else {
                continue;
            };

            // localConfig: library defaults overlaid with instance config
            // overlaid with site metadata.
            let mut local = instance.config.clone();
            for (key, value) in &metadata {
                local.insert(key.clone(), value.clone());
            }

            let remote = self.remote_scope(built, path, instance, &metadata);

            let mut rendered = Vec::new();
            for template in templates {
                if !template.target_platforms.is_empty() {
                    match platform {
                        Some(p) if template.target_platforms.iter().any(|t| t == p) => {}
                        _ => continue,
                    }
                }
                let mut unresolvable = std::collections::BTreeSet::new();
                let output = expand(&template.template, &local, &remote, &mut unresolvable)?;
                for miss in unresolvable {
                    summary
                        .warnings
                        .push(format!("{}: unresolved {miss}", instance.path));
                }
                rendered.push(output);
            }
            if rendered.is_empty() {
                continue;
            }
            let document = rendered.join("\n---\n");
            if let Some(instance_id) = built.instance_ids.get(path) {
                app_state.insert(
                    StateKey::Component(*instance_id).to_string(),
                    (
                        hash_of_text(&document),
                        json!({"yaml": document.clone()}),
                    ),
                );
            }
            documents.push(document);
        }

        if documents.is_empty() {
            return Ok(());
        }
        summary.sites_matched += 1;
        summary.documents += documents.len();

        // Interface state entries for bindings touching this member's
        // deployed instances.
        for (index, binding) in built.graph.bindings.iter().enumerate() {
            let touches = [binding.north.0.as_str(), binding.south.0.as_str()]
                .iter()
                .any(|p| {
                    built
                        .graph
                        .instance(p)
                        .map(|i| i.allocate_to_site)
                        .unwrap_or(false)
                });
            if !touches {
                continue;
            }
            let role = built
                .graph
                .instance(&binding.north.0)
                .and_then(|i| i.interfaces.get(&binding.north.1))
                .map(|s| s.decl.role.clone())
                .unwrap_or_default();
            let binding_id = built.binding_ids[index];
            let payload = json!({
                "role": role.as_str(),
                "north": format!("{}:{}", binding.north.0, binding.north.1),
                "south": format!("{}:{}", binding.south.0, binding.south.1),
            });
            let hash = hash_of_object_no_children(payload.as_object().unwrap());
            let key = StateKey::Interface {
                role,
                binding: binding_id,
            };
            app_state.insert(key.to_string(), (hash, payload));
        }

        let combined = documents.join("\n---\n");
        sqlx::query(
            "INSERT INTO site_data (id, member_site, application, data, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (member_site, application)
             DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
        )
        .bind(Uuid::new_v4())
        .bind(member.id)
        .bind(built.id)
        .bind(&combined)
        .execute(self.db.pool())
        .await?;

        self.member_state.insert(member.id, app_state);
        Ok(())
    }

    /// Remote scope for template expansion: `site.metadata`, plus the bound
    /// peer through each interface when it is unambiguous.
    fn remote_scope(
        &self,
        built: &BuiltApplication,
        path: &str,
        instance: &Instance,
        metadata: &Map<String, Value>,
    ) -> Value {
        let mut remote = Map::new();
        remote.insert("site".into(), json!({ "metadata": metadata }));

        // peerif/peerblock: the instance's sole bound interface, if any.
        let bound: Vec<&str> = instance
            .interfaces
            .iter()
            .filter(|(_, s)| s.bindings > 0)
            .map(|(name, _)| name.as_str())
            .collect();
        if bound.len() == 1 {
            if let Some((peer_path, peer_iface)) = built.graph.sole_peer(path, bound[0]) {
                self.insert_peer(&mut remote, built, "peerif", "peerblock", &peer_path, &peer_iface);
            }
        }

        // affif/affblock: peers through template affinity interfaces.
        if let BlockBody::Simple(templates) = &instance.block.body {
            for template in templates {
                if let Some(affinity) = &template.affinity {
                    if let Some((peer_path, peer_iface)) = built.graph.sole_peer(path, affinity) {
                        self.insert_peer(
                            &mut remote,
                            built,
                            "affif",
                            "affblock",
                            &peer_path,
                            &peer_iface,
                        );
                    }
                }
            }
        }

        Value::Object(remote)
    }

    fn insert_peer(
        &self,
        remote: &mut Map<String, Value>,
        built: &BuiltApplication,
        iface_key: &str,
        block_key: &str,
        peer_path: &str,
        peer_iface: &str,
    ) {
        if let Some(peer) = built.graph.instance(peer_path) {
            if let Some(iface) = peer.interfaces.get(peer_iface) {
                remote.insert(
                    iface_key.into(),
                    json!({
                        "name": iface.decl.name,
                        "role": iface.decl.role,
                    }),
                );
            }
            remote.insert(
                block_key.into(),
                json!({
                    "path": peer.path,
                    "block": peer.block.name,
                    "config": peer.config,
                }),
            );
        }
    }
}
