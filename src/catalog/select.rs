use crate::catalog::schema::{IndexDef, JarDef, RoutineDef, SequenceDef, TableDef, TableName, ViewDef};
use std::collections::HashSet;

/// Chooses which objects survive `SchemaCatalog::clone_selected`. Every
/// method defaults to keeping the object.
pub trait CatalogSelector {
    fn select_table(&self, _table: &TableDef) -> bool {
        true
    }

    fn select_index(&self, _index: &IndexDef) -> bool {
        true
    }

    fn select_sequence(&self, _sequence: &SequenceDef) -> bool {
        true
    }

    fn select_view(&self, _view: &ViewDef) -> bool {
        true
    }

    fn select_routine(&self, _routine: &RoutineDef) -> bool {
        true
    }

    fn select_jar(&self, _jar: &JarDef) -> bool {
        true
    }
}

/// Keeps everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectAll;

impl CatalogSelector for SelectAll {}

/// Removes a set of tables together with their identity sequences.
#[derive(Debug, Clone, Default)]
pub struct WithoutTables {
    pub table_ids: HashSet<u32>,
    pub sequences: HashSet<TableName>,
}

impl CatalogSelector for WithoutTables {
    fn select_table(&self, table: &TableDef) -> bool {
        !self.table_ids.contains(&table.table_id)
    }

    fn select_index(&self, index: &IndexDef) -> bool {
        index
            .table_ids()
            .iter()
            .all(|id| !self.table_ids.contains(id))
    }

    fn select_sequence(&self, sequence: &SequenceDef) -> bool {
        !self.sequences.contains(&sequence.name)
    }
}

/// Removes indexes identified by `(table id, index name)`.
#[derive(Debug, Clone, Default)]
pub struct WithoutIndexes {
    pub indexes: HashSet<(u32, String)>,
}

impl CatalogSelector for WithoutIndexes {
    fn select_index(&self, index: &IndexDef) -> bool {
        !self
            .indexes
            .contains(&(index.table_id, index.name.clone()))
    }
}

/// Removes one named view, sequence, routine or jar.
#[derive(Debug, Clone)]
pub enum WithoutNamed {
    View(TableName),
    Sequence(TableName),
    Routine(TableName),
    Jar(TableName),
}

impl CatalogSelector for WithoutNamed {
    fn select_view(&self, view: &ViewDef) -> bool {
        !matches!(self, WithoutNamed::View(name) if *name == view.name)
    }

    fn select_sequence(&self, sequence: &SequenceDef) -> bool {
        !matches!(self, WithoutNamed::Sequence(name) if *name == sequence.name)
    }

    fn select_routine(&self, routine: &RoutineDef) -> bool {
        !matches!(self, WithoutNamed::Routine(name) if *name == routine.name)
    }

    fn select_jar(&self, jar: &JarDef) -> bool {
        !matches!(self, WithoutNamed::Jar(name) if *name == jar.name)
    }
}

/// Drops objects that exist only in memory: introspection tables and
/// system routines. Used before persisting a catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentOnly;

impl CatalogSelector for PersistentOnly {
    fn select_table(&self, table: &TableDef) -> bool {
        !table.memory
    }

    fn select_routine(&self, routine: &RoutineDef) -> bool {
        !routine.system
    }
}
