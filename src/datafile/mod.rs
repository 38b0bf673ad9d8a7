//! # Data Files
//!
//! A data file is an ordered list of flat string rows for data-driven runs.
//! Row `i` binds as the highest-precedence variable scope of iteration `i`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataFile {
    pub rows: Vec<HashMap<String, String>>,
}

impl DataFile {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, index: usize) -> Option<&HashMap<String, String>> {
        self.rows.get(index)
    }
}

/// Supplies the data file bound to a run, if any.
pub trait DataFileReader: Send + Sync {
    fn data_file(&self, id: &str) -> Option<DataFile>;
}
