//! Structural compatibility checks between a table and a switch source or
//! destination.

use serde::{Deserialize, Serialize};

/// Column, index and constraint layout of a table or staging area.
///
/// Two structures must match exactly before data can be switched between
/// them as a metadata-only operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableStructure {
    /// Column names and types, in declaration order (`name:type`).
    pub columns: Vec<String>,
    /// Index definitions, aligned with the partition scheme.
    pub indexes: Vec<String>,
    /// Check constraints.
    pub constraints: Vec<String>,
}

impl TableStructure {
    /// Creates a structure with the given columns and no indexes or constraints.
    #[must_use]
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            indexes: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Adds an index definition.
    #[must_use]
    pub fn index(mut self, definition: impl Into<String>) -> Self {
        self.indexes.push(definition.into());
        self
    }

    /// Adds a check constraint.
    #[must_use]
    pub fn constraint(mut self, definition: impl Into<String>) -> Self {
        self.constraints.push(definition.into());
        self
    }
}

/// Validates structural compatibility before a switch.
///
/// # Implementors
///
/// - [`StrictSchemaRegistry`] - exact column, index and constraint equality
pub trait SchemaRegistry: Send + Sync {
    /// Returns true if `source` can be switched into `destination`.
    fn validate_structural_match(&self, source: &TableStructure, destination: &TableStructure)
        -> bool;
}

/// Requires identical columns and indexes. Constraint order is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictSchemaRegistry;

impl StrictSchemaRegistry {
    /// Creates the registry.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SchemaRegistry for StrictSchemaRegistry {
    fn validate_structural_match(
        &self,
        source: &TableStructure,
        destination: &TableStructure,
    ) -> bool {
        if source.columns != destination.columns || source.indexes != destination.indexes {
            return false;
        }
        let mut left = source.constraints.clone();
        let mut right = destination.constraints.clone();
        left.sort();
        right.sort();
        left == right
    }
}
