use crate::catalog::types::ColumnType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema-qualified object name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceOptions {
    pub start: i64,
    pub increment: i64,
    pub min: i64,
    pub max: i64,
    pub cycle: bool,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            start: 1,
            increment: 1,
            min: 1,
            max: i64::MAX,
            cycle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    /// Sequence backing an identity column. Resolves within the same catalog.
    #[serde(default)]
    pub identity: Option<TableName>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            col_type,
            nullable,
            identity: None,
        }
    }
}

/// Link from a child table to its parent in the same group. Column pairs
/// are `(child column, parent column)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinDef {
    pub parent_id: u32,
    pub columns: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDef {
    pub table_id: u32,
    pub name: TableName,
    pub uuid: Uuid,
    /// Version recorded when this snapshot was built; the ledger is
    /// authoritative for staleness checks.
    pub version: u32,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub parent: Option<JoinDef>,
    /// Group tree shared by every table joined under the same root.
    pub tree_name: String,
    /// 1-based position inside the table group.
    pub ordinal: u32,
    #[serde(default)]
    pub memory: bool,
}

impl TableDef {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.col_type).collect()
    }

    /// Positions of the primary key columns, in key order.
    pub fn primary_key_positions(&self) -> Option<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|name| self.column_index(name))
            .collect()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IndexColumn {
    pub table_id: u32,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDef {
    pub index_id: u32,
    pub name: String,
    /// Table the index is declared on. Group indexes also list columns of
    /// other tables in the same group.
    pub table_id: u32,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub tree_name: String,
}

impl IndexDef {
    pub fn is_group_index(&self) -> bool {
        self.columns.iter().any(|c| c.table_id != self.table_id)
    }

    /// Every table the index touches, declaring table first.
    pub fn table_ids(&self) -> Vec<u32> {
        let mut ids = vec![self.table_id];
        for column in &self.columns {
            if !ids.contains(&column.table_id) {
                ids.push(column.table_id);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceDef {
    pub name: TableName,
    pub options: SequenceOptions,
    pub tree_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewDef {
    pub name: TableName,
    pub definition: String,
    #[serde(default)]
    pub references: Vec<TableName>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutineDef {
    pub name: TableName,
    pub language: String,
    pub definition: String,
    #[serde(default)]
    pub jar: Option<TableName>,
    /// Registered by a service at start-up and never persisted.
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JarDef {
    pub name: TableName,
    pub url: String,
}
