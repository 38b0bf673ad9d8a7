//! # Environments & Variable Resolution
//!
//! Layered `{{variable}}` resolution over a precedence-ordered scope chain:
//! data-file row, then the active environment, then the collection folder
//! chain (nearest ancestor first), then workspace globals. Script writes are
//! staged into overlays that sit on top of their scope's stored entries and
//! stay visible for the remainder of the run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Whether a variable's value is plain or masked in UIs/exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Default,
    Secret,
}

impl Default for VariableKind {
    fn default() -> Self {
        VariableKind::Default
    }
}

/// A single variable entry. Only enabled entries participate in resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub kind: VariableKind,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl Variable {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            kind: VariableKind::Default,
            enabled: true,
        }
    }
}

/// An environment is a named, ordered set of variables (e.g. dev, prod).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// Variable writes produced by a script. Returned as plain data; the
/// executor decides when to merge them into the live scope chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedUpdates {
    pub environment: HashMap<String, String>,
    pub collection: HashMap<String, String>,
}

impl StagedUpdates {
    pub fn is_empty(&self) -> bool {
        self.environment.is_empty() && self.collection.is_empty()
    }
}

/// Supplies the active environment and workspace globals for a run.
pub trait EnvironmentReader: Send + Sync {
    fn environment(&self, name: &str) -> Option<Environment>;
    fn globals(&self) -> Vec<Variable>;
}

/// Receives staged variable overlays once, at run completion. Persisting per
/// request would amplify writes; staged values are already visible in-memory
/// for the rest of the run.
pub trait VariableWriter: Send + Sync {
    fn persist(
        &self,
        environment: Option<&str>,
        env_overlay: &HashMap<String, String>,
        collection_overlay: &HashMap<String, String>,
    );
}

/// The precedence-ordered variable scopes consulted during resolution.
///
/// Lookup order, highest first: data-file row, staged environment writes,
/// stored environment entries, staged collection writes, collection chain
/// (nearest ancestor first), workspace globals.
#[derive(Debug, Clone, Default)]
pub struct ScopeChain {
    data_row: Option<HashMap<String, String>>,
    env_overlay: HashMap<String, String>,
    environment: Vec<Variable>,
    collection_overlay: HashMap<String, String>,
    collection_chain: Vec<HashMap<String, String>>,
    globals: Vec<Variable>,
}

impl ScopeChain {
    pub fn new(environment: Option<Environment>, globals: Vec<Variable>) -> Self {
        Self {
            environment: environment.map(|env| env.variables).unwrap_or_default(),
            globals,
            ..Self::default()
        }
    }

    /// Bind the current iteration's data row as the highest-precedence scope.
    pub fn set_data_row(&mut self, row: Option<HashMap<String, String>>) {
        self.data_row = row;
    }

    /// Bind the current request's collection variable chain, nearest
    /// ancestor first.
    pub fn set_collection_chain(&mut self, chain: Vec<HashMap<String, String>>) {
        self.collection_chain = chain;
    }

    /// Merge staged script writes into the environment/collection overlays.
    pub fn merge_staged(&mut self, staged: StagedUpdates) {
        self.env_overlay.extend(staged.environment);
        self.collection_overlay.extend(staged.collection);
    }

    pub fn env_overlay(&self) -> &HashMap<String, String> {
        &self.env_overlay
    }

    pub fn collection_overlay(&self) -> &HashMap<String, String> {
        &self.collection_overlay
    }

    /// First enabled definition of `key` in precedence order.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(row) = &self.data_row {
            if let Some(value) = row.get(key) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.env_overlay.get(key) {
            return Some(value.clone());
        }
        if let Some(var) = self
            .environment
            .iter()
            .find(|var| var.enabled && var.key == key)
        {
            return Some(var.value.clone());
        }
        if let Some(value) = self.collection_overlay.get(key) {
            return Some(value.clone());
        }
        for vars in &self.collection_chain {
            if let Some(value) = vars.get(key) {
                return Some(value.clone());
            }
        }
        self.globals
            .iter()
            .find(|var| var.enabled && var.key == key)
            .map(|var| var.value.clone())
    }

    /// Replace every `{{key}}` the chain defines; unmatched tokens are left
    /// verbatim so callers can detect unresolved input.
    pub fn resolve(&self, text: &str) -> String {
        resolve_tokens(text, |key| self.lookup(key))
    }
}

/// Single-pass `{{key}}` substitution against an arbitrary lookup. Pure:
/// substituted values are not re-scanned.
pub fn resolve_tokens(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    for segment in split_tokens(text) {
        match segment {
            Segment::Text(raw) => out.push_str(raw),
            Segment::Token { raw, key } => match lookup(key) {
                Some(value) => out.push_str(&value),
                None => out.push_str(raw),
            },
        }
    }
    out
}

/// The `{{key}}` tokens in `text` that remained after resolution.
pub fn unresolved_tokens(text: &str) -> Vec<String> {
    split_tokens(text)
        .filter_map(|segment| match segment {
            Segment::Token { raw, .. } => Some(raw.to_string()),
            Segment::Text(_) => None,
        })
        .collect()
}

/// Percent-encode `text` for use in a URL query, leaving `{{key}}` tokens
/// untouched: the string is split on tokens, only the non-token segments are
/// encoded, and the pieces are reassembled.
pub fn encode_query_preserving_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for segment in split_tokens(text) {
        match segment {
            Segment::Text(raw) => {
                out.extend(url::form_urlencoded::byte_serialize(raw.as_bytes()));
            }
            Segment::Token { raw, .. } => out.push_str(raw),
        }
    }
    out
}

enum Segment<'a> {
    Text(&'a str),
    Token { raw: &'a str, key: &'a str },
}

/// Split `text` into literal segments and `{{key}}` tokens. A token is the
/// shortest `{{...}}` span with a non-empty body that contains no `}`.
fn split_tokens(text: &str) -> impl Iterator<Item = Segment<'_>> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        if let Some(start) = rest.find("{{") {
            if let Some(len) = rest[start + 2..].find("}}") {
                let body = &rest[start + 2..start + 2 + len];
                if len > 0 && !body.contains('}') && !body.contains('{') {
                    if start > 0 {
                        let text_part = &rest[..start];
                        rest = &rest[start..];
                        return Some(Segment::Text(text_part));
                    }
                    let raw = &rest[..len + 4];
                    rest = &rest[len + 4..];
                    return Some(Segment::Token {
                        raw,
                        key: body.trim(),
                    });
                }
                // Malformed token; emit up to and including the braces as text.
                let text_part = &rest[..start + 2];
                rest = &rest[start + 2..];
                return Some(Segment::Text(text_part));
            }
        }
        let text_part = rest;
        rest = "";
        Some(Segment::Text(text_part))
    })
}
