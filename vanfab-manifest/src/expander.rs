//! The `if/variable` template language.
//!
//! Grammar, informally:
//!
//! ```text
//! {{ .name }}            local-scope variable
//! {{ $a.b.c }}           remote-scope path walk
//! {{ if <var> }} ... {{ else }} ... {{ end }}
//! {{- ... -}}            whitespace trimming toward the tag
//! ```
//!
//! Unresolved local variables render `undefined`; unresolved remote paths
//! render `UNDEFINED[<path>]`. Both are recorded in the caller's
//! `unresolvable` set so the compose engine can report them.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::{ManifestError, ManifestResult};

#[derive(Debug, Clone, PartialEq)]
enum VarRef {
    Local(String),
    Remote(Vec<String>),
}

impl VarRef {
    fn display(&self) -> String {
        match self {
            VarRef::Local(name) => format!(".{name}"),
            VarRef::Remote(path) => format!("${}", path.join(".")),
        }
    }
}

#[derive(Debug)]
enum Item {
    Text(String),
    Var(VarRef),
    If {
        cond: VarRef,
        then_clause: Option<Box<Node>>,
        else_clause: Option<Box<Node>>,
    },
}

/// One parsed node; nodes chain through `next`.
#[derive(Debug)]
struct Node {
    item: Item,
    next: Option<Box<Node>>,
}

/// A parsed template, reusable across expansions.
#[derive(Debug)]
pub struct Template {
    root: Option<Box<Node>>,
}

#[derive(Debug)]
enum Token {
    Text(String),
    Tag(String),
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = text;
    loop {
        match rest.find("{{") {
            None => {
                if !rest.is_empty() {
                    tokens.push(Token::Text(rest.to_string()));
                }
                break;
            }
            Some(open) => {
                let (literal, after) = rest.split_at(open);
                let after = &after[2..];
                let close = after.find("}}").unwrap_or(after.len());
                let (tag, tail) = after.split_at(close);
                let mut literal = literal.to_string();
                let mut tag = tag.trim().to_string();

                // {{- trims the preceding literal's trailing whitespace
                if let Some(stripped) = tag.strip_prefix('-') {
                    tag = stripped.trim_start().to_string();
                    literal.truncate(literal.trim_end().len());
                }
                // -}} trims the following literal's leading whitespace
                let trim_following = if let Some(stripped) = tag.strip_suffix('-') {
                    tag = stripped.trim_end().to_string();
                    true
                } else {
                    false
                };

                if !literal.is_empty() {
                    tokens.push(Token::Text(literal));
                }
                tokens.push(Token::Tag(tag));

                rest = tail.strip_prefix("}}").unwrap_or("");
                if trim_following {
                    rest = rest.trim_start();
                }
            }
        }
    }
    tokens
}

fn parse_var(tag: &str) -> Option<VarRef> {
    if let Some(name) = tag.strip_prefix('.') {
        if !name.is_empty() {
            return Some(VarRef::Local(name.to_string()));
        }
    }
    if let Some(path) = tag.strip_prefix('$') {
        let parts: Vec<String> = path.split('.').map(str::to_string).collect();
        if !parts.is_empty() && parts.iter().all(|p| !p.is_empty()) {
            return Some(VarRef::Remote(parts));
        }
    }
    None
}

/// What terminated a clause parse.
enum Terminator {
    Eof,
    Else,
    End,
}

/// Fold collected items into the next-pointer chain, rear to front.
fn chain(items: Vec<Item>) -> Option<Box<Node>> {
    let mut next = None;
    for item in items.into_iter().rev() {
        next = Some(Box::new(Node { item, next }));
    }
    next
}

fn parse_clause(
    tokens: &[Token],
    mut pos: usize,
    inside_if: bool,
) -> ManifestResult<(Option<Box<Node>>, usize, Terminator)> {
    let mut items = Vec::new();

    while pos < tokens.len() {
        match &tokens[pos] {
            Token::Text(text) => {
                items.push(Item::Text(text.clone()));
                pos += 1;
            }
            Token::Tag(tag) => {
                if tag == "end" {
                    if !inside_if {
                        return Err(ManifestError::UnmatchedEnd);
                    }
                    return Ok((chain(items), pos + 1, Terminator::End));
                }
                if tag == "else" {
                    if !inside_if {
                        return Err(ManifestError::DanglingElse);
                    }
                    return Ok((chain(items), pos + 1, Terminator::Else));
                }
                if let Some(cond_text) = tag.strip_prefix("if ") {
                    let cond = parse_var(cond_text.trim())
                        .ok_or_else(|| ManifestError::BadTag(tag.clone()))?;
                    let (then_clause, next_pos, term) = parse_clause(tokens, pos + 1, true)?;
                    let (else_clause, next_pos) = match term {
                        Terminator::Else => {
                            let (els, after_else, term) = parse_clause(tokens, next_pos, true)?;
                            match term {
                                Terminator::End => (els, after_else),
                                _ => return Err(ManifestError::UnclosedIf),
                            }
                        }
                        Terminator::End => (None, next_pos),
                        Terminator::Eof => return Err(ManifestError::UnclosedIf),
                    };
                    items.push(Item::If {
                        cond,
                        then_clause,
                        else_clause,
                    });
                    pos = next_pos;
                    continue;
                }
                match parse_var(tag) {
                    Some(var) => {
                        items.push(Item::Var(var));
                        pos += 1;
                    }
                    None => return Err(ManifestError::BadTag(tag.clone())),
                }
            }
        }
    }
    if inside_if {
        return Err(ManifestError::UnclosedIf);
    }
    Ok((chain(items), pos, Terminator::Eof))
}

/// Parse a template into its node tree.
pub fn parse_template(text: &str) -> ManifestResult<Template> {
    let tokens = tokenize(text);
    let (root, _, _) = parse_clause(&tokens, 0, false)?;
    Ok(Template { root })
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve<'a>(var: &VarRef, local: &'a Map<String, Value>, remote: &'a Value) -> Option<&'a Value> {
    match var {
        VarRef::Local(name) => local.get(name),
        VarRef::Remote(path) => {
            let mut cursor = remote;
            for part in path {
                cursor = cursor.get(part)?;
            }
            Some(cursor)
        }
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

impl Template {
    /// Render against a local scope and a remote scope.
    pub fn expand(
        &self,
        local: &Map<String, Value>,
        remote: &Value,
        unresolvable: &mut BTreeSet<String>,
    ) -> String {
        let mut out = String::new();
        Self::expand_chain(&self.root, local, remote, unresolvable, &mut out);
        out
    }

    fn expand_chain(
        mut node: &Option<Box<Node>>,
        local: &Map<String, Value>,
        remote: &Value,
        unresolvable: &mut BTreeSet<String>,
        out: &mut String,
    ) {
        while let Some(current) = node {
            match &current.item {
                Item::Text(text) => out.push_str(text),
                Item::Var(var) => match resolve(var, local, remote) {
                    Some(value) => out.push_str(&render_value(value)),
                    None => {
                        unresolvable.insert(var.display());
                        match var {
                            VarRef::Local(_) => out.push_str("undefined"),
                            VarRef::Remote(_) => {
                                out.push_str(&format!("UNDEFINED[{}]", var.display()))
                            }
                        }
                    }
                },
                Item::If {
                    cond,
                    then_clause,
                    else_clause,
                } => {
                    let clause = if truthy(resolve(cond, local, remote)) {
                        then_clause
                    } else {
                        else_clause
                    };
                    Self::expand_chain(clause, local, remote, unresolvable, out);
                }
            }
            node = &current.next;
        }
    }
}

/// Parse and expand in one call.
pub fn expand(
    text: &str,
    local: &Map<String, Value>,
    remote: &Value,
    unresolvable: &mut BTreeSet<String>,
) -> ManifestResult<String> {
    Ok(parse_template(text)?.expand(local, remote, unresolvable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn plain_text_passes_through() {
        let mut u = BTreeSet::new();
        let out = expand("no tags here", &Map::new(), &Value::Null, &mut u).unwrap();
        assert_eq!(out, "no tags here");
        assert!(u.is_empty());
    }

    #[test]
    fn if_else_selects_on_remote_truth() {
        let mut u = BTreeSet::new();
        let out = expand(
            "{{ if $site.prod }}P{{ else }}D{{ end }}-{{ .name }}",
            &local(json!({"name": "svc"})),
            &json!({"site": {"prod": true}}),
            &mut u,
        )
        .unwrap();
        assert_eq!(out, "P-svc");
        assert!(u.is_empty());
    }

    #[test]
    fn false_condition_takes_else() {
        let mut u = BTreeSet::new();
        let out = expand(
            "{{ if $site.prod }}P{{ else }}D{{ end }}",
            &Map::new(),
            &json!({"site": {"prod": false}}),
            &mut u,
        )
        .unwrap();
        assert_eq!(out, "D");
    }

    #[test]
    fn missing_local_renders_undefined_and_is_recorded() {
        let mut u = BTreeSet::new();
        let out = expand("{{ .missing }}", &Map::new(), &json!({}), &mut u).unwrap();
        assert_eq!(out, "undefined");
        assert!(u.contains(".missing"));
    }

    #[test]
    fn missing_remote_path_renders_marker() {
        let mut u = BTreeSet::new();
        let out = expand("{{ $a.b.c }}", &Map::new(), &json!({"a": {}}), &mut u).unwrap();
        assert_eq!(out, "UNDEFINED[$a.b.c]");
        assert!(u.contains("$a.b.c"));
    }

    #[test]
    fn whitespace_trimming() {
        let mut u = BTreeSet::new();
        let out = expand(
            "left   {{- .x -}}   right",
            &local(json!({"x": "X"})),
            &Value::Null,
            &mut u,
        )
        .unwrap();
        assert_eq!(out, "leftXright");
    }

    #[test]
    fn unmatched_end_is_an_error() {
        assert_eq!(
            parse_template("text {{ end }}").unwrap_err(),
            ManifestError::UnmatchedEnd
        );
    }

    #[test]
    fn unclosed_if_is_an_error() {
        assert_eq!(
            parse_template("{{ if .x }}never closed").unwrap_err(),
            ManifestError::UnclosedIf
        );
    }

    #[test]
    fn nested_if_expands() {
        let mut u = BTreeSet::new();
        let out = expand(
            "{{ if .a }}{{ if .b }}both{{ else }}only-a{{ end }}{{ end }}",
            &local(json!({"a": true})),
            &Value::Null,
            &mut u,
        )
        .unwrap();
        assert_eq!(out, "only-a");
    }

    #[test]
    fn numbers_render_bare() {
        let mut u = BTreeSet::new();
        let out = expand(
            "port={{ .port }}",
            &local(json!({"port": 55671})),
            &Value::Null,
            &mut u,
        )
        .unwrap();
        assert_eq!(out, "port=55671");
    }

    #[test]
    fn full_substitution_equals_manual() {
        let mut u = BTreeSet::new();
        let out = expand(
            "{{ .svc }}.{{ .ns }}:{{ $net.port }}",
            &local(json!({"svc": "api", "ns": "prod"})),
            &json!({"net": {"port": "8080"}}),
            &mut u,
        )
        .unwrap();
        assert_eq!(out, "api.prod:8080");
        assert!(u.is_empty());
    }
}
