use crate::catalog::schema::{SequenceOptions, TableName};
use crate::catalog::types::ColumnType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub identity: Option<SequenceOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub parent: TableName,
    pub columns: Vec<(String, String)>,
}

/// Proposed table definition. Ids, tree names and versions are assigned
/// when the proposal is merged into a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: TableName,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub parent: Option<JoinSpec>,
}

impl TableSpec {
    pub fn new(schema: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: TableName::new(schema, table_name),
            columns: Vec::new(),
            primary_key: Vec::new(),
            parent: None,
        }
    }

    pub fn column(mut self, name: impl Into<String>, col_type: ColumnType, nullable: bool) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            col_type,
            nullable,
            identity: None,
        });
        self
    }

    /// Integer column generated from a sequence created alongside the table.
    pub fn identity_column(mut self, name: impl Into<String>, options: SequenceOptions) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            col_type: ColumnType::Integer,
            nullable: false,
            identity: Some(options),
        });
        self
    }

    pub fn primary_key(mut self, primary_key: &[&str]) -> Self {
        self.primary_key = primary_key.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Joins this table under `parent`. Pairs are `(child column, parent column)`.
    pub fn join(mut self, parent: TableName, columns: &[(&str, &str)]) -> Self {
        self.parent = Some(JoinSpec {
            parent,
            columns: columns
                .iter()
                .map(|(c, p)| ((*c).to_string(), (*p).to_string()))
                .collect(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub table: TableName,
    pub index_name: String,
    /// Column owner and name. Columns of other tables in the same group
    /// make this a group index.
    pub columns: Vec<(TableName, String)>,
    pub unique: bool,
    /// Existing tree to adopt instead of generating a new name.
    #[serde(default)]
    pub tree_name: Option<String>,
}

impl IndexSpec {
    pub fn new(table: TableName, index_name: impl Into<String>, columns: &[&str]) -> Self {
        let owned = columns
            .iter()
            .map(|c| (table.clone(), (*c).to_string()))
            .collect();
        Self {
            table,
            index_name: index_name.into(),
            columns: owned,
            unique: false,
            tree_name: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn group_column(mut self, table: TableName, column: impl Into<String>) -> Self {
        self.columns.push((table, column.into()));
        self
    }

    pub fn tree_name(mut self, tree_name: impl Into<String>) -> Self {
        self.tree_name = Some(tree_name.into());
        self
    }
}

/// One entry of an ALTER TABLE. `definition` replaces the columns, key and
/// join of the table formerly known as `old_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub old_name: TableName,
    pub definition: TableSpec,
}

impl TableChange {
    pub fn new(old_name: TableName, definition: TableSpec) -> Self {
        Self {
            old_name,
            definition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexSpec, TableSpec};
    use crate::catalog::schema::{SequenceOptions, TableName};
    use crate::catalog::types::ColumnType;

    #[test]
    fn table_spec_builds_join_and_identity() {
        let spec = TableSpec::new("s", "orders")
            .identity_column("oid", SequenceOptions::default())
            .column("cid", ColumnType::Integer, false)
            .primary_key(&["oid"])
            .join(TableName::new("s", "customers"), &[("cid", "cid")]);
        assert_eq!(spec.columns.len(), 2);
        assert!(spec.columns[0].identity.is_some());
        let parent = spec.parent.expect("join");
        assert_eq!(parent.columns, vec![("cid".to_string(), "cid".to_string())]);
    }

    #[test]
    fn group_columns_keep_their_owner() {
        let orders = TableName::new("s", "orders");
        let customers = TableName::new("s", "customers");
        let spec = IndexSpec::new(orders.clone(), "by_name", &["oid"])
            .group_column(customers.clone(), "name")
            .unique();
        assert!(spec.unique);
        assert_eq!(spec.columns[0].0, orders);
        assert_eq!(spec.columns[1].0, customers);
    }
}
