//! Per-cell and per-gene attribute tables

use anyhow::{bail, ensure, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// A typed metadata column, one value per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Categorical or free-text values.
    Str(Vec<String>),
    /// Integer values.
    Int(Vec<i64>),
    /// Floating point values.
    Float(Vec<f64>),
    /// Boolean flags.
    Bool(Vec<bool>),
}

impl Column {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Column::Str(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Bool(v) => v.len(),
        }
    }

    /// True if the column holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// String form of the value in `row`, used as a categorical key.
    pub fn value_str(&self, row: usize) -> Cow<'_, str> {
        match self {
            Column::Str(v) => Cow::Borrowed(v[row].as_str()),
            Column::Int(v) => Cow::Owned(v[row].to_string()),
            Column::Float(v) => Cow::Owned(v[row].to_string()),
            Column::Bool(v) => Cow::Borrowed(if v[row] { "true" } else { "false" }),
        }
    }

    /// Number of distinct values.
    pub fn cardinality(&self) -> usize {
        (0..self.len()).map(|i| self.value_str(i)).unique().count()
    }

    /// Numeric view of the column, if it is numeric.
    pub fn as_f64(&self) -> Option<Vec<f64>> {
        match self {
            Column::Int(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Column::Float(v) => Some(v.clone()),
            Column::Str(_) | Column::Bool(_) => None,
        }
    }

    /// Keep only `rows`, in the given order.
    pub fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Str(v) => Column::Str(rows.iter().map(|&i| v[i].clone()).collect()),
            Column::Int(v) => Column::Int(rows.iter().map(|&i| v[i]).collect()),
            Column::Float(v) => Column::Float(rows.iter().map(|&i| v[i]).collect()),
            Column::Bool(v) => Column::Bool(rows.iter().map(|&i| v[i]).collect()),
        }
    }
}

/// A table of named columns sharing one row count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataTable {
    n_rows: usize,
    columns: BTreeMap<String, Column>,
}

impl MetadataTable {
    /// Create an empty table with `n_rows` rows.
    pub fn new(n_rows: usize) -> Self {
        MetadataTable {
            n_rows,
            columns: BTreeMap::new(),
        }
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Insert or replace a column. The column must have one value per row.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<()> {
        let name = name.into();
        ensure!(
            column.len() == self.n_rows,
            "column '{name}' has {} values but the table has {} rows",
            column.len(),
            self.n_rows
        );
        self.columns.insert(name, column);
        Ok(())
    }

    /// Look up a column.
    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Look up a column that must exist.
    pub fn require(&self, name: &str) -> Result<&Column> {
        match self.columns.get(name) {
            Some(col) => Ok(col),
            None => bail!("attribute '{name}' is not present"),
        }
    }

    /// True if the column exists.
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Remove a column, returning it if present.
    pub fn remove(&mut self, name: &str) -> Option<Column> {
        self.columns.remove(name)
    }

    /// Column names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// A new table holding only `rows`, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> MetadataTable {
        MetadataTable {
            n_rows: rows.len(),
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), v.select(rows)))
                .collect(),
        }
    }
}
