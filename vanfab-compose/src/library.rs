//! Library block model and parsing.
//!
//! A library block's spec is stored as JSON:
//!
//! ```json
//! {
//!   "interfaces": {
//!     "api": {"role": "http", "polarity": "north", "maxBindings": 1}
//!   },
//!   "body": {
//!     "simple": [
//!       {"template": "...", "affinity": "api", "targetPlatforms": ["kube"]}
//!     ]
//!   },
//!   "config": {"port": 8080}
//! }
//! ```
//!
//! Composite bodies replace `simple` with a `composite` map of child block
//! references plus intra-child bindings; the child name `super` denotes the
//! composite's own interface.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use vanfab_db::LibraryBlockRow;

use crate::{ComposeError, ComposeResult};

/// Block types, each with fixed polarity allowances and allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Component,
    Connector,
    Toplevel,
    Mixed,
    Ingress,
    Egress,
}

/// How instances of a type land on sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Expanded onto every matching member site
    Independent,
    /// Carried by the peer it binds to
    Attached,
    /// Never allocated (structural blocks)
    None,
}

impl BlockType {
    pub fn parse(value: &str) -> ComposeResult<Self> {
        match value {
            "component" => Ok(BlockType::Component),
            "connector" => Ok(BlockType::Connector),
            "toplevel" => Ok(BlockType::Toplevel),
            "mixed" => Ok(BlockType::Mixed),
            "ingress" => Ok(BlockType::Ingress),
            "egress" => Ok(BlockType::Egress),
            other => Err(ComposeError::BadBlock {
                block: other.to_string(),
                message: "unknown block type".into(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Component => "component",
            BlockType::Connector => "connector",
            BlockType::Toplevel => "toplevel",
            BlockType::Mixed => "mixed",
            BlockType::Ingress => "ingress",
            BlockType::Egress => "egress",
        }
    }

    pub fn allow_north(&self) -> bool {
        !matches!(self, BlockType::Toplevel | BlockType::Ingress)
    }

    pub fn allow_south(&self) -> bool {
        !matches!(self, BlockType::Component | BlockType::Egress)
    }

    pub fn allocation(&self) -> Allocation {
        match self {
            BlockType::Component | BlockType::Mixed | BlockType::Ingress | BlockType::Egress => {
                Allocation::Independent
            }
            BlockType::Connector => Allocation::Attached,
            BlockType::Toplevel => Allocation::None,
        }
    }
}

/// Interface polarity. Bindings pair one north with one south of the same
/// role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    North,
    South,
}

impl Polarity {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "north" => Some(Polarity::North),
            "south" => Some(Polarity::South),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Polarity {
        match self {
            Polarity::North => Polarity::South,
            Polarity::South => Polarity::North,
        }
    }
}

/// One interface declared on a library block.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDecl {
    pub name: String,
    pub role: String,
    pub polarity: Polarity,
    /// None is unlimited
    pub max_bindings: Option<u32>,
}

/// One template in a simple body.
#[derive(Debug, Clone)]
pub struct BodyTemplate {
    pub template: String,
    /// Interface whose peer fills `affif`/`affblock` during expansion
    pub affinity: Option<String>,
    /// Empty means all platforms
    pub target_platforms: Vec<String>,
}

/// One endpoint of a composite binding; `child == "super"` names the
/// composite's own interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub child: String,
    pub interface: String,
}

impl Endpoint {
    pub fn is_super(&self) -> bool {
        self.child == "super"
    }
}

/// Binding between two children (or a child and `super`) inside a
/// composite body.
#[derive(Debug, Clone)]
pub struct CompositeBinding {
    pub north: Endpoint,
    pub south: Endpoint,
}

/// A composite body: named children plus intra-child bindings.
#[derive(Debug, Clone)]
pub struct CompositeBody {
    /// child name -> (block name, config overrides)
    pub children: Vec<(String, String, Map<String, Value>)>,
    pub bindings: Vec<CompositeBinding>,
}

#[derive(Debug, Clone)]
pub enum BlockBody {
    Simple(Vec<BodyTemplate>),
    Composite(CompositeBody),
}

/// One revision of a named library block.
#[derive(Debug, Clone)]
pub struct LibraryBlock {
    pub name: String,
    pub revision: i32,
    pub block_type: BlockType,
    pub interfaces: Vec<InterfaceDecl>,
    pub body: BlockBody,
    pub config: Map<String, Value>,
}

impl LibraryBlock {
    pub fn is_composite(&self) -> bool {
        matches!(self.body, BlockBody::Composite(_))
    }

    /// Parse a stored row's JSON spec.
    pub fn from_row(row: &LibraryBlockRow) -> ComposeResult<LibraryBlock> {
        let bad = |message: &str| ComposeError::BadBlock {
            block: row.name.clone(),
            message: message.to_string(),
        };
        let spec = row.spec.as_object().ok_or_else(|| bad("spec is not an object"))?;

        let mut interfaces = Vec::new();
        if let Some(decls) = spec.get("interfaces").and_then(Value::as_object) {
            for (name, decl) in decls {
                let role = decl
                    .get("role")
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad("interface without role"))?;
                let polarity = decl
                    .get("polarity")
                    .and_then(Value::as_str)
                    .and_then(Polarity::parse)
                    .ok_or_else(|| bad("interface without polarity"))?;
                let max_bindings = decl
                    .get("maxBindings")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32);
                interfaces.push(InterfaceDecl {
                    name: name.clone(),
                    role: role.to_string(),
                    polarity,
                    max_bindings,
                });
            }
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        let body_spec = spec.get("body").and_then(Value::as_object);
        let body = match body_spec {
            Some(body) if body.contains_key("composite") => {
                let composite = body
                    .get("composite")
                    .and_then(Value::as_object)
                    .ok_or_else(|| bad("composite body is not an object"))?;
                let mut children = Vec::new();
                if let Some(decls) = composite.get("children").and_then(Value::as_object) {
                    for (child_name, child) in decls {
                        let block = child
                            .get("block")
                            .and_then(Value::as_str)
                            .ok_or_else(|| bad("child without block reference"))?;
                        let config = child
                            .get("config")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        children.push((child_name.clone(), block.to_string(), config));
                    }
                }
                children.sort_by(|a, b| a.0.cmp(&b.0));
                let mut bindings = Vec::new();
                if let Some(decls) = composite.get("bindings").and_then(Value::as_array) {
                    for decl in decls {
                        bindings.push(CompositeBinding {
                            north: parse_endpoint(decl.get("north"), &row.name)?,
                            south: parse_endpoint(decl.get("south"), &row.name)?,
                        });
                    }
                }
                BlockBody::Composite(CompositeBody { children, bindings })
            }
            Some(body) => {
                let mut templates = Vec::new();
                if let Some(decls) = body.get("simple").and_then(Value::as_array) {
                    for decl in decls {
                        let template = decl
                            .get("template")
                            .and_then(Value::as_str)
                            .ok_or_else(|| bad("body template without template text"))?;
                        let affinity = decl
                            .get("affinity")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        let target_platforms = decl
                            .get("targetPlatforms")
                            .and_then(Value::as_array)
                            .map(|a| {
                                a.iter()
                                    .filter_map(|v| v.as_str().map(str::to_string))
                                    .collect()
                            })
                            .unwrap_or_default();
                        templates.push(BodyTemplate {
                            template: template.to_string(),
                            affinity,
                            target_platforms,
                        });
                    }
                }
                BlockBody::Simple(templates)
            }
            None => BlockBody::Simple(Vec::new()),
        };

        Ok(LibraryBlock {
            name: row.name.clone(),
            revision: row.revision,
            block_type: BlockType::parse(&row.block_type)?,
            interfaces,
            body,
            config: spec
                .get("config")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

fn parse_endpoint(value: Option<&Value>, block: &str) -> ComposeResult<Endpoint> {
    let obj = value.and_then(Value::as_object).ok_or_else(|| ComposeError::BadBlock {
        block: block.to_string(),
        message: "binding endpoint is not an object".into(),
    })?;
    let child = obj
        .get("child")
        .and_then(Value::as_str)
        .ok_or_else(|| ComposeError::BadBlock {
            block: block.to_string(),
            message: "binding endpoint without child".into(),
        })?;
    let interface = obj
        .get("interface")
        .and_then(Value::as_str)
        .ok_or_else(|| ComposeError::BadBlock {
            block: block.to_string(),
            message: "binding endpoint without interface".into(),
        })?;
    Ok(Endpoint {
        child: child.to_string(),
        interface: interface.to_string(),
    })
}

/// A resolved library: the newest revision of each named block.
#[derive(Debug, Default, Clone)]
pub struct Library {
    blocks: HashMap<String, Arc<LibraryBlock>>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block, keeping the higher revision on name collision.
    pub fn insert(&mut self, block: LibraryBlock) {
        match self.blocks.get(&block.name) {
            Some(existing) if existing.revision >= block.revision => {}
            _ => {
                self.blocks.insert(block.name.clone(), Arc::new(block));
            }
        }
    }

    pub fn get(&self, name: &str) -> ComposeResult<Arc<LibraryBlock>> {
        self.blocks
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::UnknownBlock(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn row(name: &str, block_type: &str, spec: Value) -> LibraryBlockRow {
        LibraryBlockRow {
            id: Uuid::new_v4(),
            name: name.into(),
            revision: 1,
            block_type: block_type.into(),
            spec,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn simple_block_parses() {
        let block = LibraryBlock::from_row(&row(
            "web",
            "component",
            json!({
                "interfaces": {"api": {"role": "http", "polarity": "north", "maxBindings": 1}},
                "body": {"simple": [{"template": "kind: Deployment"}]},
                "config": {"port": 8080}
            }),
        ))
        .unwrap();
        assert_eq!(block.block_type, BlockType::Component);
        assert_eq!(block.interfaces.len(), 1);
        assert_eq!(block.interfaces[0].polarity, Polarity::North);
        assert_eq!(block.interfaces[0].max_bindings, Some(1));
        assert!(!block.is_composite());
    }

    #[test]
    fn composite_block_parses() {
        let block = LibraryBlock::from_row(&row(
            "pair",
            "toplevel",
            json!({
                "body": {"composite": {
                    "children": {
                        "front": {"block": "web"},
                        "back": {"block": "db", "config": {"size": "small"}}
                    },
                    "bindings": [
                        {"north": {"child": "front", "interface": "down"},
                         "south": {"child": "back", "interface": "up"}}
                    ]
                }}
            }),
        ))
        .unwrap();
        let BlockBody::Composite(body) = &block.body else {
            panic!("expected composite");
        };
        assert_eq!(body.children.len(), 2);
        assert_eq!(body.bindings.len(), 1);
        assert_eq!(block.block_type.allocation(), Allocation::None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = LibraryBlock::from_row(&row("x", "warp", json!({})));
        assert!(result.is_err());
    }

    #[test]
    fn library_keeps_newest_revision() {
        let mut library = Library::new();
        let mut first = row("web", "component", json!({}));
        first.revision = 1;
        let mut second = row("web", "component", json!({"config": {"v": 2}}));
        second.revision = 2;
        library.insert(LibraryBlock::from_row(&first).unwrap());
        library.insert(LibraryBlock::from_row(&second).unwrap());
        assert_eq!(library.get("web").unwrap().revision, 2);
        // An older revision does not displace a newer one.
        library.insert(LibraryBlock::from_row(&first).unwrap());
        assert_eq!(library.get("web").unwrap().revision, 2);
    }

    #[test]
    fn polarity_allowances_follow_type() {
        assert!(BlockType::Component.allow_north());
        assert!(!BlockType::Component.allow_south());
        assert!(BlockType::Mixed.allow_north() && BlockType::Mixed.allow_south());
        assert!(!BlockType::Toplevel.allow_north());
    }
}
