#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use ff_columnar::Column;
use ff_types::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("column '{name}' has {column_len} rows but the frame has {frame_len}")]
    LengthMismatch {
        name: String,
        column_len: usize,
        frame_len: usize,
    },
    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
}

/// One discrete time-step's full point dataset: an immutable table of
/// same-length numeric columns keyed by name, plus the step's time key.
///
/// Frames are handed to the engine by value from the storage collaborator
/// and never mutated in place; [`Frame::augmented`] produces a private copy
/// when evaluation needs a transient computed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    time_key: f64,
    names: Vec<String>,
    columns: BTreeMap<String, Column>,
}

impl Frame {
    pub fn new<S: Into<String>>(
        time_key: f64,
        columns: Vec<(S, Vec<f64>)>,
    ) -> Result<Self, FrameError> {
        let mut names = Vec::with_capacity(columns.len());
        let mut map = BTreeMap::new();
        let mut row_count: Option<usize> = None;

        for (name, values) in columns {
            let name = name.into();
            if map.contains_key(&name) {
                return Err(FrameError::DuplicateColumn(name));
            }
            let frame_len = *row_count.get_or_insert(values.len());
            if values.len() != frame_len {
                return Err(FrameError::LengthMismatch {
                    name,
                    column_len: values.len(),
                    frame_len,
                });
            }
            names.push(name.clone());
            map.insert(name, Column::new(values));
        }

        Ok(Self {
            time_key,
            names,
            columns: map,
        })
    }

    #[must_use]
    pub fn time_key(&self) -> f64 {
        self.time_key
    }

    /// Number of point samples (rows).
    #[must_use]
    pub fn len(&self) -> usize {
        self.names
            .first()
            .and_then(|name| self.columns.get(name))
            .map_or(0, Column::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column names in their original (schema) order.
    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_value(&self, name: &str) -> Result<Value, FrameError> {
        self.columns
            .get(name)
            .map(Column::to_value)
            .ok_or_else(|| FrameError::UnknownColumn(name.to_owned()))
    }

    /// Private working copy with one extra column attached. The receiver is
    /// untouched; the copy is dropped when the computation that needed it
    /// finishes.
    pub fn augmented(&self, name: impl Into<String>, values: Vec<f64>) -> Result<Self, FrameError> {
        let name = name.into();
        if self.columns.contains_key(&name) {
            return Err(FrameError::DuplicateColumn(name));
        }
        if values.len() != self.len() {
            return Err(FrameError::LengthMismatch {
                name,
                column_len: values.len(),
                frame_len: self.len(),
            });
        }

        let mut copy = self.clone();
        copy.names.push(name.clone());
        copy.columns.insert(name, Column::new(values));
        Ok(copy)
    }

    /// Copy projected to a subset of columns, preserving schema order.
    pub fn project(&self, keep: &[String]) -> Result<Self, FrameError> {
        for name in keep {
            if !self.columns.contains_key(name) {
                return Err(FrameError::UnknownColumn(name.clone()));
            }
        }
        let names: Vec<String> = self
            .names
            .iter()
            .filter(|name| keep.contains(*name))
            .cloned()
            .collect();
        let columns = names
            .iter()
            .map(|name| (name.clone(), self.columns[name].clone()))
            .collect();
        Ok(Self {
            time_key: self.time_key,
            names,
            columns,
        })
    }
}
