//! Instance graph construction and interface pairing.
//!
//! `build_graph` instantiates the block tree from the library, threads
//! composite `super` bindings down to their base interfaces (marking the
//! intermediates bound-through), pairs interfaces with polarity and role
//! checks, and reports unmatched interfaces as warnings.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::library::{Allocation, BlockBody, InterfaceDecl, Library, LibraryBlock, Polarity};
use crate::{ComposeError, ComposeResult};

/// Runtime state of one interface on one instance.
#[derive(Debug, Clone)]
pub struct IfaceState {
    pub decl: InterfaceDecl,
    pub bindings: u32,
    /// True when an outer binding passes through this interface to a base
    /// interface below; bound-through interfaces are never unmatched and
    /// never bind directly.
    pub bound_through: bool,
    pub peers: Vec<(String, String)>,
}

impl IfaceState {
    pub fn can_accept_binding(&self) -> bool {
        if self.bound_through {
            return false;
        }
        match self.decl.max_bindings {
            Some(max) => self.bindings < max,
            None => true,
        }
    }
}

/// One instantiated block.
#[derive(Debug, Clone)]
pub struct Instance {
    pub path: String,
    pub block: Arc<LibraryBlock>,
    /// Library defaults overlaid with the parent's child config
    pub config: Map<String, Value>,
    pub interfaces: BTreeMap<String, IfaceState>,
    /// Set by derivative generation: independent, non-composite instances
    pub allocate_to_site: bool,
}

/// A paired north/south interface reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub north: (String, String),
    pub south: (String, String),
}

/// The built application graph.
#[derive(Debug, Clone)]
pub struct AppGraph {
    pub instances: BTreeMap<String, Instance>,
    pub bindings: Vec<Binding>,
    pub warnings: Vec<String>,
}

impl AppGraph {
    pub fn instance(&self, path: &str) -> Option<&Instance> {
        self.instances.get(path)
    }

    /// The single peer of an interface, if it has exactly one.
    pub fn sole_peer(&self, path: &str, interface: &str) -> Option<(String, String)> {
        let iface = self.instances.get(path)?.interfaces.get(interface)?;
        if iface.peers.len() == 1 {
            Some(iface.peers[0].clone())
        } else {
            None
        }
    }
}

fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn instantiate(
    library: &Library,
    block: Arc<LibraryBlock>,
    path: String,
    overrides: &Map<String, Value>,
    instances: &mut BTreeMap<String, Instance>,
) -> ComposeResult<()> {
    // Reject interfaces whose polarity the block type disallows.
    for decl in &block.interfaces {
        let allowed = match decl.polarity {
            Polarity::North => block.block_type.allow_north(),
            Polarity::South => block.block_type.allow_south(),
        };
        if !allowed {
            return Err(ComposeError::BadBlock {
                block: block.name.clone(),
                message: format!(
                    "interface '{}' declares a polarity its type '{}' disallows",
                    decl.name,
                    block.block_type.as_str()
                ),
            });
        }
    }

    let mut config = block.config.clone();
    for (key, value) in overrides {
        config.insert(key.clone(), value.clone());
    }

    let interfaces = block
        .interfaces
        .iter()
        .map(|decl| {
            (
                decl.name.clone(),
                IfaceState {
                    decl: decl.clone(),
                    bindings: 0,
                    bound_through: false,
                    peers: Vec::new(),
                },
            )
        })
        .collect();

    let children = match &block.body {
        BlockBody::Composite(body) => body.children.clone(),
        BlockBody::Simple(_) => Vec::new(),
    };

    instances.insert(
        path.clone(),
        Instance {
            path: path.clone(),
            block: block.clone(),
            config,
            interfaces,
            allocate_to_site: false,
        },
    );

    for (child_name, block_name, child_config) in children {
        let child_block = library.get(&block_name)?;
        instantiate(
            library,
            child_block,
            child_path(&path, &child_name),
            &child_config,
            instances,
        )?;
    }
    Ok(())
}

/// Walk a reference down through composite `super` delegations to its base
/// interface, marking every intermediate bound-through.
fn resolve_base(
    delegations: &HashMap<(String, String), (String, String)>,
    instances: &mut BTreeMap<String, Instance>,
    mut path: String,
    mut interface: String,
) -> ComposeResult<(String, String)> {
    loop {
        if !instances.contains_key(&path) {
            return Err(ComposeError::BadEndpoint {
                path,
                interface,
                message: "no such instance".into(),
            });
        }
        match delegations.get(&(path.clone(), interface.clone())) {
            Some((next_path, next_interface)) => {
                if let Some(iface) = instances
                    .get_mut(&path)
                    .and_then(|i| i.interfaces.get_mut(&interface))
                {
                    iface.bound_through = true;
                }
                path = next_path.clone();
                interface = next_interface.clone();
            }
            None => {
                if instances
                    .get(&path)
                    .map(|i| !i.interfaces.contains_key(&interface))
                    .unwrap_or(true)
                {
                    return Err(ComposeError::BadEndpoint {
                        path,
                        interface,
                        message: "no such interface".into(),
                    });
                }
                return Ok((path, interface));
            }
        }
    }
}

fn bind(
    instances: &mut BTreeMap<String, Instance>,
    bindings: &mut Vec<Binding>,
    a: (String, String),
    b: (String, String),
) -> ComposeResult<()> {
    let decl_of = |instances: &BTreeMap<String, Instance>, r: &(String, String)| {
        instances
            .get(&r.0)
            .and_then(|i| i.interfaces.get(&r.1))
            .map(|s| (s.decl.clone(), s.can_accept_binding()))
            .ok_or_else(|| ComposeError::BadEndpoint {
                path: r.0.clone(),
                interface: r.1.clone(),
                message: "no such interface".into(),
            })
    };
    let (decl_a, accept_a) = decl_of(instances, &a)?;
    let (decl_b, accept_b) = decl_of(instances, &b)?;

    if decl_a.role != decl_b.role {
        return Err(ComposeError::BindingRejected(format!(
            "role mismatch: {}:{} is '{}', {}:{} is '{}'",
            a.0, a.1, decl_a.role, b.0, b.1, decl_b.role
        )));
    }
    if decl_a.polarity == decl_b.polarity {
        return Err(ComposeError::BindingRejected(format!(
            "polarity conflict: {}:{} and {}:{} are both {:?}",
            a.0, a.1, b.0, b.1, decl_a.polarity
        )));
    }
    if !accept_a || !accept_b {
        return Err(ComposeError::BindingRejected(format!(
            "binding budget exhausted on {}:{} or {}:{}",
            a.0, a.1, b.0, b.1
        )));
    }

    let (north, south) = if decl_a.polarity == Polarity::North {
        (a, b)
    } else {
        (b, a)
    };

    for (this, peer) in [(&north, &south), (&south, &north)] {
        if let Some(iface) = instances
            .get_mut(&this.0)
            .and_then(|i| i.interfaces.get_mut(&this.1))
        {
            iface.bindings += 1;
            iface.peers.push(peer.clone());
        }
    }
    bindings.push(Binding { north, south });
    Ok(())
}

/// Build the full graph: instantiate from the root, apply composite and
/// application-level bindings, flag unmatched interfaces, and run
/// derivative generation.
pub fn build_graph(
    library: &Library,
    root: &str,
    app_bindings: &[(String, String, String, String)],
) -> ComposeResult<AppGraph> {
    let root_block = library.get(root)?;
    let mut instances = BTreeMap::new();
    instantiate(
        library,
        root_block,
        "/".to_string(),
        &Map::new(),
        &mut instances,
    )?;

    // Delegations: composite bindings with a super endpoint do not bind at
    // the composite level; they thread the composite's interface to a child.
    let mut delegations: HashMap<(String, String), (String, String)> = HashMap::new();
    let mut inner: Vec<((String, String), (String, String))> = Vec::new();
    for (path, instance) in &instances {
        let BlockBody::Composite(body) = &instance.block.body else {
            continue;
        };
        for binding in &body.bindings {
            let resolve_endpoint = |endpoint: &crate::library::Endpoint| {
                if endpoint.is_super() {
                    (path.clone(), endpoint.interface.clone())
                } else {
                    (child_path(path, &endpoint.child), endpoint.interface.clone())
                }
            };
            match (binding.north.is_super(), binding.south.is_super()) {
                (true, true) => {
                    return Err(ComposeError::BadBlock {
                        block: instance.block.name.clone(),
                        message: "binding with two super endpoints".into(),
                    });
                }
                (true, false) => {
                    delegations.insert(
                        (path.clone(), binding.north.interface.clone()),
                        resolve_endpoint(&binding.south),
                    );
                }
                (false, true) => {
                    delegations.insert(
                        (path.clone(), binding.south.interface.clone()),
                        resolve_endpoint(&binding.north),
                    );
                }
                (false, false) => {
                    inner.push((
                        resolve_endpoint(&binding.north),
                        resolve_endpoint(&binding.south),
                    ));
                }
            }
        }
    }

    let mut bindings = Vec::new();
    for (north_ref, south_ref) in inner {
        let a = resolve_base(&delegations, &mut instances, north_ref.0, north_ref.1)?;
        let b = resolve_base(&delegations, &mut instances, south_ref.0, south_ref.1)?;
        bind(&mut instances, &mut bindings, a, b)?;
    }
    for (north_path, north_iface, south_path, south_iface) in app_bindings {
        let a = resolve_base(
            &delegations,
            &mut instances,
            north_path.clone(),
            north_iface.clone(),
        )?;
        let b = resolve_base(
            &delegations,
            &mut instances,
            south_path.clone(),
            south_iface.clone(),
        )?;
        bind(&mut instances, &mut bindings, a, b)?;
    }

    // Unmatched interfaces become warnings, not errors.
    let mut warnings = Vec::new();
    for (path, instance) in &instances {
        for (name, iface) in &instance.interfaces {
            if iface.bindings == 0 && !iface.bound_through {
                warnings.push(format!("unmatched interface {path}:{name}"));
            }
        }
    }

    // Derivative generation.
    for instance in instances.values_mut() {
        instance.allocate_to_site = instance.block.block_type.allocation()
            == Allocation::Independent
            && !instance.block.is_composite();
    }

    Ok(AppGraph {
        instances,
        bindings,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::LibraryBlock;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;
    use vanfab_db::LibraryBlockRow;

    fn block(name: &str, block_type: &str, spec: Value) -> LibraryBlock {
        LibraryBlock::from_row(&LibraryBlockRow {
            id: Uuid::new_v4(),
            name: name.into(),
            revision: 1,
            block_type: block_type.into(),
            spec,
            created_at: Utc::now(),
        })
        .unwrap()
    }

    fn web_db_library() -> Library {
        let mut library = Library::new();
        library.insert(block(
            "web",
            "component",
            json!({
                "interfaces": {"down": {"role": "sql", "polarity": "north", "maxBindings": 1}},
                "body": {"simple": [{"template": "web: {{ .port }}"}]},
                "config": {"port": 80}
            }),
        ));
        library.insert(block(
            "db",
            "mixed",
            json!({
                "interfaces": {"up": {"role": "sql", "polarity": "south"}},
                "body": {"simple": [{"template": "db"}]}
            }),
        ));
        library.insert(block(
            "app",
            "toplevel",
            json!({
                "body": {"composite": {
                    "children": {
                        "front": {"block": "web", "config": {"port": 8080}},
                        "store": {"block": "db"}
                    },
                    "bindings": [
                        {"north": {"child": "front", "interface": "down"},
                         "south": {"child": "store", "interface": "up"}}
                    ]
                }}
            }),
        ));
        library
    }

    #[test]
    fn build_instantiates_and_binds() {
        let graph = build_graph(&web_db_library(), "app", &[]).unwrap();
        assert_eq!(graph.instances.len(), 3);
        assert_eq!(graph.bindings.len(), 1);
        assert!(graph.warnings.is_empty());

        let front = graph.instance("/front").unwrap();
        assert_eq!(front.config.get("port"), Some(&json!(8080)));
        assert_eq!(
            graph.sole_peer("/front", "down"),
            Some(("/store".to_string(), "up".to_string()))
        );
    }

    #[test]
    fn derivative_allocates_independent_leaves() {
        let graph = build_graph(&web_db_library(), "app", &[]).unwrap();
        assert!(graph.instance("/front").unwrap().allocate_to_site);
        assert!(graph.instance("/store").unwrap().allocate_to_site);
        assert!(!graph.instance("/").unwrap().allocate_to_site);
    }

    #[test]
    fn same_polarity_is_rejected() {
        let mut library = Library::new();
        library.insert(block(
            "a",
            "component",
            json!({"interfaces": {"i": {"role": "r", "polarity": "north"}}}),
        ));
        library.insert(block(
            "b",
            "component",
            json!({"interfaces": {"i": {"role": "r", "polarity": "north"}}}),
        ));
        library.insert(block(
            "top",
            "toplevel",
            json!({"body": {"composite": {
                "children": {"x": {"block": "a"}, "y": {"block": "b"}},
                "bindings": [
                    {"north": {"child": "x", "interface": "i"},
                     "south": {"child": "y", "interface": "i"}}
                ]
            }}}),
        ));
        assert!(matches!(
            build_graph(&library, "top", &[]),
            Err(ComposeError::BindingRejected(_))
        ));
    }

    #[test]
    fn binding_budget_is_enforced() {
        let mut library = Library::new();
        library.insert(block(
            "one",
            "component",
            json!({"interfaces": {"n": {"role": "r", "polarity": "north", "maxBindings": 1}}}),
        ));
        library.insert(block(
            "many",
            "mixed",
            json!({"interfaces": {"s": {"role": "r", "polarity": "south"}}}),
        ));
        library.insert(block(
            "top",
            "toplevel",
            json!({"body": {"composite": {
                "children": {
                    "a": {"block": "one"},
                    "b": {"block": "many"},
                    "c": {"block": "many"}
                },
                "bindings": [
                    {"north": {"child": "a", "interface": "n"},
                     "south": {"child": "b", "interface": "s"}},
                    {"north": {"child": "a", "interface": "n"},
                     "south": {"child": "c", "interface": "s"}}
                ]
            }}}),
        ));
        assert!(matches!(
            build_graph(&library, "top", &[]),
            Err(ComposeError::BindingRejected(_))
        ));
    }

    #[test]
    fn super_binding_threads_to_base_and_marks_bound_through() {
        let mut library = Library::new();
        library.insert(block(
            "leaf",
            "component",
            json!({"interfaces": {"svc": {"role": "http", "polarity": "north"}}}),
        ));
        library.insert(block(
            "wrapper",
            "mixed",
            json!({
                "interfaces": {"svc": {"role": "http", "polarity": "north"}},
                "body": {"composite": {
                    "children": {"inner": {"block": "leaf"}},
                    "bindings": [
                        {"north": {"child": "super", "interface": "svc"},
                         "south": {"child": "inner", "interface": "svc"}}
                    ]
                }}
            }),
        ));
        library.insert(block(
            "sink",
            "mixed",
            json!({"interfaces": {"svc": {"role": "http", "polarity": "south"}}}),
        ));
        library.insert(block(
            "top",
            "toplevel",
            json!({"body": {"composite": {
                "children": {"w": {"block": "wrapper"}, "s": {"block": "sink"}},
                "bindings": [
                    {"north": {"child": "w", "interface": "svc"},
                     "south": {"child": "s", "interface": "svc"}}
                ]
            }}}),
        ));

        let graph = build_graph(&library, "top", &[]).unwrap();
        // The binding landed on the base interface, not the wrapper's.
        assert_eq!(
            graph.sole_peer("/w/inner", "svc"),
            Some(("/s".to_string(), "svc".to_string()))
        );
        let wrapper_iface = &graph.instance("/w").unwrap().interfaces["svc"];
        assert!(wrapper_iface.bound_through);
        assert_eq!(wrapper_iface.bindings, 0);
        // Bound-through interfaces are not flagged unmatched.
        assert!(graph.warnings.is_empty());
    }

    #[test]
    fn unmatched_interfaces_warn() {
        let mut library = Library::new();
        library.insert(block(
            "lonely",
            "component",
            json!({"interfaces": {"n": {"role": "r", "polarity": "north"}}}),
        ));
        let graph = build_graph(&library, "lonely", &[]).unwrap();
        assert_eq!(graph.warnings, vec!["unmatched interface /:n".to_string()]);
    }

    #[test]
    fn app_level_bindings_apply() {
        let mut library = Library::new();
        library.insert(block(
            "a",
            "component",
            json!({"interfaces": {"n": {"role": "r", "polarity": "north"}}}),
        ));
        library.insert(block(
            "b",
            "mixed",
            json!({"interfaces": {"s": {"role": "r", "polarity": "south"}}}),
        ));
        library.insert(block(
            "top",
            "toplevel",
            json!({"body": {"composite": {
                "children": {"x": {"block": "a"}, "y": {"block": "b"}},
                "bindings": []
            }}}),
        ));
        let app_bindings = vec![(
            "/x".to_string(),
            "n".to_string(),
            "/y".to_string(),
            "s".to_string(),
        )];
        let graph = build_graph(&library, "top", &app_bindings).unwrap();
        assert_eq!(graph.bindings.len(), 1);
        assert!(graph.warnings.is_empty());
    }
}
