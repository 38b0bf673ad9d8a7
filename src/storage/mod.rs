//! # Workspace Storage
//!
//! A workspace is a single JSON document holding the collection tree, the
//! named environments, and the workspace globals. [`FileStore`] loads it,
//! serves the read-side traits the runner needs, and writes staged variable
//! overlays back at the end of a run.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collections::{Collection, NodeId, ROOT_COLLECTION_ID, Subtree, TreeReader};
use crate::datafile::{DataFile, DataFileReader};
use crate::environment::{Environment, EnvironmentReader, Variable, VariableWriter};
use crate::error::{StoreError, ValidationError};

/// The on-disk workspace document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDoc {
    #[serde(default)]
    pub name: String,
    pub collection: Collection,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub globals: Vec<Variable>,
}

/// File-backed workspace store. All reads serve from the in-memory document;
/// the file is rewritten only when staged variables are persisted.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    doc: Mutex<WorkspaceDoc>,
    data_files: Mutex<HashMap<String, DataFile>>,
}

impl FileStore {
    /// Load a workspace document and assign stable node ids to its tree.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut doc: WorkspaceDoc =
            serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        doc.collection.assign_ids();
        Ok(Self {
            path: path.to_path_buf(),
            doc: Mutex::new(doc),
            data_files: Mutex::new(HashMap::new()),
        })
    }

    /// Load a data file (a JSON array of flat string maps) and register it
    /// under its path, the id the runner will ask for.
    pub fn attach_data_file(&self, path: &Path) -> Result<(), StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: DataFile = serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Ok(mut files) = self.data_files.lock() {
            files.insert(path.display().to_string(), file);
        }
        Ok(())
    }

    /// Resolve a folder name (anywhere in the tree, document order) to its
    /// node id.
    pub fn find_folder_id(&self, name: &str) -> Option<NodeId> {
        self.doc
            .lock()
            .ok()
            .and_then(|doc| doc.collection.find_folder(name))
    }

    pub fn collection_name(&self) -> String {
        self.doc
            .lock()
            .map(|doc| doc.collection.name.clone())
            .unwrap_or_default()
    }

    fn write_back(&self, doc: &WorkspaceDoc) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(doc).map_err(StoreError::Serialize)?;
        fs::write(&self.path, raw).map_err(|source| StoreError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}

impl TreeReader for FileStore {
    fn subtree(
        &self,
        collection: NodeId,
        folder: Option<NodeId>,
    ) -> Result<Subtree, ValidationError> {
        if collection != ROOT_COLLECTION_ID {
            return Err(ValidationError::CollectionNotFound(collection));
        }
        let doc = self
            .doc
            .lock()
            .map_err(|_| ValidationError::CollectionNotFound(collection))?;
        doc.collection.subtree(folder).ok_or_else(|| {
            ValidationError::FolderNotFound(folder.map(|id| id.to_string()).unwrap_or_default())
        })
    }
}

impl EnvironmentReader for FileStore {
    fn environment(&self, name: &str) -> Option<Environment> {
        self.doc
            .lock()
            .ok()
            .and_then(|doc| doc.environments.iter().find(|env| env.name == name).cloned())
    }

    fn globals(&self) -> Vec<Variable> {
        self.doc
            .lock()
            .map(|doc| doc.globals.clone())
            .unwrap_or_default()
    }
}

impl DataFileReader for FileStore {
    fn data_file(&self, id: &str) -> Option<DataFile> {
        self.data_files
            .lock()
            .ok()
            .and_then(|files| files.get(id).cloned())
    }
}

impl VariableWriter for FileStore {
    fn persist(
        &self,
        environment: Option<&str>,
        env_overlay: &HashMap<String, String>,
        collection_overlay: &HashMap<String, String>,
    ) {
        if env_overlay.is_empty() && collection_overlay.is_empty() {
            return;
        }
        let mut doc = match self.doc.lock() {
            Ok(doc) => doc,
            Err(_) => return,
        };
        if let Some(name) = environment {
            if let Some(env) = doc.environments.iter_mut().find(|env| env.name == name) {
                for (key, value) in env_overlay {
                    apply_variable(&mut env.variables, key, value);
                }
            }
        }
        for (key, value) in collection_overlay {
            doc.collection
                .variables
                .insert(key.clone(), value.clone());
        }
        if let Err(err) = self.write_back(&doc) {
            warn!(error = %err, "failed to persist staged variables");
        }
    }
}

/// Update an existing entry in place or append a new enabled one.
fn apply_variable(variables: &mut Vec<Variable>, key: &str, value: &str) {
    match variables.iter_mut().find(|var| var.key == key) {
        Some(var) => var.value = value.to_string(),
        None => variables.push(Variable::new(key, value)),
    }
}
