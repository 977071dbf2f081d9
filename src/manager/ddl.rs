use crate::catalog::schema::{JarDef, RoutineDef, SequenceOptions, TableName, ViewDef};
use crate::declarative::{IndexSpec, TableChange, TableSpec};
use crate::error::SchemataError;
use crate::manager::SchemaManager;
use crate::session::Session;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DropBehavior {
    #[default]
    Restrict,
    /// Not expanded at this layer; callers pass the full set to `drop_tables`.
    Cascade,
}

/// One DDL statement in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlOperation {
    CreateTable {
        table: TableSpec,
        #[serde(default)]
        if_not_exists: bool,
    },
    RenameTable {
        old: TableName,
        new: TableName,
    },
    AlterTable {
        changes: Vec<TableChange>,
    },
    DropTable {
        name: TableName,
        #[serde(default)]
        behavior: DropBehavior,
        #[serde(default)]
        if_exists: bool,
    },
    DropTables {
        names: Vec<TableName>,
    },
    CreateIndexes {
        indexes: Vec<IndexSpec>,
    },
    DropIndexes {
        table: TableName,
        names: Vec<String>,
    },
    CreateView {
        view: ViewDef,
    },
    DropView {
        name: TableName,
        #[serde(default)]
        if_exists: bool,
    },
    CreateSequence {
        name: TableName,
        #[serde(default)]
        options: SequenceOptions,
    },
    DropSequence {
        name: TableName,
        #[serde(default)]
        if_exists: bool,
    },
    CreateRoutine {
        routine: RoutineDef,
        #[serde(default)]
        replace: bool,
    },
    DropRoutine {
        name: TableName,
    },
    CreateJar {
        jar: JarDef,
    },
    ReplaceJar {
        jar: JarDef,
    },
    DropJar {
        name: TableName,
    },
}

impl DdlOperation {
    pub fn to_payload(&self) -> Result<Vec<u8>, SchemataError> {
        rmp_serde::to_vec_named(self).map_err(|e| SchemataError::Encode(e.to_string()))
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, SchemataError> {
        rmp_serde::from_slice(bytes).map_err(|e| SchemataError::Decode(e.to_string()))
    }

    pub fn verb(&self) -> &'static str {
        match self {
            DdlOperation::CreateTable { .. } => "create_table",
            DdlOperation::RenameTable { .. } => "rename_table",
            DdlOperation::AlterTable { .. } => "alter_table",
            DdlOperation::DropTable { .. } => "drop_table",
            DdlOperation::DropTables { .. } => "drop_tables",
            DdlOperation::CreateIndexes { .. } => "create_indexes",
            DdlOperation::DropIndexes { .. } => "drop_indexes",
            DdlOperation::CreateView { .. } => "create_view",
            DdlOperation::DropView { .. } => "drop_view",
            DdlOperation::CreateSequence { .. } => "create_sequence",
            DdlOperation::DropSequence { .. } => "drop_sequence",
            DdlOperation::CreateRoutine { .. } => "create_routine",
            DdlOperation::DropRoutine { .. } => "drop_routine",
            DdlOperation::CreateJar { .. } => "create_jar",
            DdlOperation::ReplaceJar { .. } => "replace_jar",
            DdlOperation::DropJar { .. } => "drop_jar",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlOutcome {
    /// False when an `if_exists` / `if_not_exists` guard skipped the change.
    pub applied: bool,
    /// Catalog generation published by the operation, or the current one
    /// when nothing was applied.
    pub generation: u64,
}

impl SchemaManager {
    /// Runs one serialized DDL operation.
    pub fn execute(&self, session: &Session, op: DdlOperation) -> Result<DdlOutcome, SchemataError> {
        match op {
            DdlOperation::CreateTable {
                table,
                if_not_exists,
            } => {
                if if_not_exists && self.catalog().table_by_name(&table.name).is_some() {
                    return Ok(self.skipped());
                }
                self.create_table(session, table)?;
            }
            DdlOperation::RenameTable { old, new } => self.rename_table(session, &old, &new)?,
            DdlOperation::AlterTable { changes } => {
                self.alter_table(session, changes)?;
            }
            DdlOperation::DropTable {
                name,
                behavior,
                if_exists,
            } => {
                if if_exists && self.catalog().table_by_name(&name).is_none() {
                    return Ok(self.skipped());
                }
                self.drop_table(session, &name, behavior)?;
            }
            DdlOperation::DropTables { names } => self.drop_tables(session, &names)?,
            DdlOperation::CreateIndexes { indexes } => {
                self.create_indexes(session, indexes)?;
            }
            DdlOperation::DropIndexes { table, names } => self.drop_indexes(session, &table, &names)?,
            DdlOperation::CreateView { view } => self.create_view(session, view)?,
            DdlOperation::DropView { name, if_exists } => {
                if if_exists && self.catalog().view(&name).is_none() {
                    return Ok(self.skipped());
                }
                self.drop_view(session, &name)?;
            }
            DdlOperation::CreateSequence { name, options } => {
                self.create_sequence(session, &name, options)?;
            }
            DdlOperation::DropSequence { name, if_exists } => {
                if if_exists && self.catalog().sequence(&name).is_none() {
                    return Ok(self.skipped());
                }
                self.drop_sequence(session, &name)?;
            }
            DdlOperation::CreateRoutine { routine, replace } => {
                self.create_routine(session, routine, replace)?
            }
            DdlOperation::DropRoutine { name } => self.drop_routine(session, &name)?,
            DdlOperation::CreateJar { jar } => self.create_jar(session, jar)?,
            DdlOperation::ReplaceJar { jar } => self.replace_jar(session, jar)?,
            DdlOperation::DropJar { name } => self.drop_jar(session, &name)?,
        }
        Ok(DdlOutcome {
            applied: true,
            generation: self.catalog().generation(),
        })
    }

    fn skipped(&self) -> DdlOutcome {
        DdlOutcome {
            applied: false,
            generation: self.catalog().generation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DdlOperation, DropBehavior};
    use crate::catalog::schema::TableName;
    use crate::catalog::types::ColumnType;
    use crate::declarative::TableSpec;

    #[test]
    fn payload_roundtrip_keeps_operation() {
        let op = DdlOperation::CreateTable {
            table: TableSpec::new("s", "t")
                .column("id", ColumnType::Integer, false)
                .primary_key(&["id"]),
            if_not_exists: true,
        };
        let bytes = op.to_payload().expect("encode");
        assert_eq!(DdlOperation::from_payload(&bytes).expect("decode"), op);
        assert_eq!(op.verb(), "create_table");
    }

    #[test]
    fn drop_defaults_to_restrict_in_json() {
        let op: DdlOperation = serde_json::from_str(
            r#"{"DropTable":{"name":{"schema":"s","name":"t"}}}"#,
        )
        .expect("json");
        assert_eq!(
            op,
            DdlOperation::DropTable {
                name: TableName::new("s", "t"),
                behavior: DropBehavior::Restrict,
                if_exists: false,
            }
        );
    }
}
