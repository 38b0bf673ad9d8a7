//! # Collections
//!
//! A collection is a directory tree of saved requests. Folders carry their
//! own variables and nest arbitrarily; a run flattens the tree into a
//! deterministic pre-order request list (a folder's own requests in document
//! order, then each child folder recursively).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::AuthMethod;
use crate::error::ValidationError;
use crate::http::method::HttpMethod;

/// A unique identifier for a collection node.
pub type NodeId = u64;

/// The id of the collection root node.
pub const ROOT_COLLECTION_ID: NodeId = 0;

/// A saved HTTP request within a collection.
///
/// `params` and `headers` use one `key=value` / `Key: Value` entry per line;
/// any field may contain `{{variable}}` tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDefinition {
    #[serde(default)]
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub headers: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub auth: AuthMethod,
    #[serde(default)]
    pub pre_request_script: String,
    #[serde(default)]
    pub test_script: String,
}

/// A folder that can contain requests or sub-folders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    #[serde(default)]
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub items: Vec<CollectionItem>,
}

/// A collection item is either a request or a nested folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectionItem {
    Request(RequestDefinition),
    Folder(Folder),
}

/// Root collection containing all folders and requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub items: Vec<CollectionItem>,
}

/// The tree slice a run executes: a folder's (or the root's) items plus the
/// variable maps inherited from it and its ancestors, nearest first.
#[derive(Debug, Clone)]
pub struct Subtree {
    pub name: String,
    pub items: Vec<CollectionItem>,
    pub inherited: Vec<HashMap<String, String>>,
}

/// One entry of the flattened request list, paired with the collection
/// variable chain in effect at its position (nearest ancestor first).
#[derive(Debug, Clone)]
pub struct FlatRequest {
    pub request: RequestDefinition,
    pub variable_chain: Vec<HashMap<String, String>>,
}

/// Read access to the collection tree. Must tolerate empty folders.
pub trait TreeReader: Send + Sync {
    fn subtree(&self, collection: NodeId, folder: Option<NodeId>)
    -> Result<Subtree, ValidationError>;
}

impl Collection {
    /// Assign pre-order node ids (root is [`ROOT_COLLECTION_ID`]). Called
    /// once at load time so ids are stable for any given document.
    pub fn assign_ids(&mut self) {
        let mut next: NodeId = ROOT_COLLECTION_ID + 1;
        assign_item_ids(&mut self.items, &mut next);
    }

    /// Find a folder id by name anywhere in the tree (document order).
    pub fn find_folder(&self, name: &str) -> Option<NodeId> {
        find_folder_in(&self.items, name)
    }

    /// The subtree rooted at `folder`, or the whole collection when `None`.
    pub fn subtree(&self, folder: Option<NodeId>) -> Option<Subtree> {
        match folder {
            None => Some(Subtree {
                name: self.name.clone(),
                items: self.items.clone(),
                inherited: vec![self.variables.clone()],
            }),
            Some(id) => {
                let (folder, mut inherited) = locate_folder(&self.items, id)?;
                inherited.push(self.variables.clone());
                Some(Subtree {
                    name: folder.name.clone(),
                    items: folder.items.clone(),
                    inherited,
                })
            }
        }
    }
}

fn assign_item_ids(items: &mut [CollectionItem], next: &mut NodeId) {
    for item in items {
        match item {
            CollectionItem::Request(request) => {
                request.id = *next;
                *next += 1;
            }
            CollectionItem::Folder(folder) => {
                folder.id = *next;
                *next += 1;
                assign_item_ids(&mut folder.items, next);
            }
        }
    }
}

fn find_folder_in(items: &[CollectionItem], name: &str) -> Option<NodeId> {
    for item in items {
        if let CollectionItem::Folder(folder) = item {
            if folder.name == name {
                return Some(folder.id);
            }
            if let Some(id) = find_folder_in(&folder.items, name) {
                return Some(id);
            }
        }
    }
    None
}

/// Returns the folder and its variable chain, nearest ancestor first
/// (starting with the folder's own variables).
fn locate_folder(
    items: &[CollectionItem],
    id: NodeId,
) -> Option<(&Folder, Vec<HashMap<String, String>>)> {
    for item in items {
        if let CollectionItem::Folder(folder) = item {
            if folder.id == id {
                return Some((folder, vec![folder.variables.clone()]));
            }
            if let Some((found, mut chain)) = locate_folder(&folder.items, id) {
                chain.push(folder.variables.clone());
                return Some((found, chain));
            }
        }
    }
    None
}

/// Flatten a subtree into the ordered request list of a run: a folder's own
/// requests in document order, then each child folder recursively. Stable
/// and reproducible across calls.
pub fn flatten(subtree: &Subtree) -> Vec<FlatRequest> {
    let mut out = Vec::new();
    walk(&subtree.items, &subtree.inherited, &mut out);
    out
}

fn walk(
    items: &[CollectionItem],
    chain: &[HashMap<String, String>],
    out: &mut Vec<FlatRequest>,
) {
    for item in items {
        if let CollectionItem::Request(request) = item {
            out.push(FlatRequest {
                request: request.clone(),
                variable_chain: chain.to_vec(),
            });
        }
    }
    for item in items {
        if let CollectionItem::Folder(folder) = item {
            let mut child_chain = vec![folder.variables.clone()];
            child_chain.extend_from_slice(chain);
            walk(&folder.items, &child_chain, out);
        }
    }
}
