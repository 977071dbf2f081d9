pub mod names;
pub mod schema;
pub mod select;
pub mod types;

use crate::catalog::names::TreeNameGenerator;
use crate::catalog::schema::{
    ColumnDef, IndexColumn, IndexDef, JarDef, JoinDef, RoutineDef, SequenceDef, SequenceOptions,
    TableDef, TableName, ViewDef,
};
use crate::catalog::select::CatalogSelector;
use crate::catalog::types::ColumnType;
use crate::declarative::{ColumnSpec, IndexSpec, JoinSpec, TableSpec};
use crate::error::{ObjectKind, SchemataError};
use crate::sequence::Sequence;
use im::{HashMap, OrdMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// Schemas whose objects are owned by the server itself.
pub const PROTECTED_SCHEMAS: [&str; 4] = ["information_schema", "security_schema", "sys", "sqlj"];
const MAX_IDENTIFIER_LEN: usize = 128;

pub fn is_protected_schema(schema: &str) -> bool {
    PROTECTED_SCHEMAS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(schema))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Set by server-internal registrations; allows joining protected parents.
    pub internal: bool,
    /// Table has no physical backing and is never persisted.
    pub memory: bool,
    pub version: u32,
}

/// Immutable snapshot of every schema object. Edits return a new catalog
/// and leave `self` untouched; cross references are table ids resolved
/// within the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "CatalogImage", try_from = "CatalogImage")]
pub struct SchemaCatalog {
    generation: u64,
    next_table_id: u32,
    next_index_id: u32,
    tables: OrdMap<u32, TableDef>,
    table_ids: HashMap<TableName, u32>,
    indexes: OrdMap<(u32, String), IndexDef>,
    sequences: OrdMap<TableName, SequenceDef>,
    views: OrdMap<TableName, ViewDef>,
    routines: OrdMap<TableName, RoutineDef>,
    jars: OrdMap<TableName, JarDef>,
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self {
            generation: 0,
            next_table_id: 1,
            next_index_id: 1,
            tables: OrdMap::new(),
            table_ids: HashMap::new(),
            indexes: OrdMap::new(),
            sequences: OrdMap::new(),
            views: OrdMap::new(),
            routines: OrdMap::new(),
            jars: OrdMap::new(),
        }
    }
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn table(&self, table_id: u32) -> Option<&TableDef> {
        self.tables.get(&table_id)
    }

    pub fn table_by_name(&self, name: &TableName) -> Option<&TableDef> {
        self.table_ids.get(name).and_then(|id| self.tables.get(id))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn index(&self, table_id: u32, name: &str) -> Option<&IndexDef> {
        self.indexes.get(&(table_id, name.to_string()))
    }

    pub fn indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.values()
    }

    /// Indexes declared on or touching `table_id`.
    pub fn indexes_touching(&self, table_id: u32) -> Vec<&IndexDef> {
        self.indexes
            .values()
            .filter(|i| i.table_ids().contains(&table_id))
            .collect()
    }

    pub fn sequence(&self, name: &TableName) -> Option<&SequenceDef> {
        self.sequences.get(name)
    }

    pub fn sequences(&self) -> impl Iterator<Item = &SequenceDef> {
        self.sequences.values()
    }

    pub fn view(&self, name: &TableName) -> Option<&ViewDef> {
        self.views.get(name)
    }

    pub fn views(&self) -> impl Iterator<Item = &ViewDef> {
        self.views.values()
    }

    pub fn routine(&self, name: &TableName) -> Option<&RoutineDef> {
        self.routines.get(name)
    }

    pub fn routines(&self) -> impl Iterator<Item = &RoutineDef> {
        self.routines.values()
    }

    pub fn jar(&self, name: &TableName) -> Option<&JarDef> {
        self.jars.get(name)
    }

    pub fn jars(&self) -> impl Iterator<Item = &JarDef> {
        self.jars.values()
    }

    pub fn schemas(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        out.extend(self.tables.values().map(|t| t.name.schema.clone()));
        out.extend(self.sequences.keys().map(|n| n.schema.clone()));
        out.extend(self.views.keys().map(|n| n.schema.clone()));
        out.extend(self.routines.keys().map(|n| n.schema.clone()));
        out.extend(self.jars.keys().map(|n| n.schema.clone()));
        out
    }

    /// Direct children of `table_id`, in ordinal order.
    pub fn children(&self, table_id: u32) -> Vec<&TableDef> {
        let mut out: Vec<&TableDef> = self
            .tables
            .values()
            .filter(|t| t.parent.as_ref().is_some_and(|j| j.parent_id == table_id))
            .collect();
        out.sort_by_key(|t| t.ordinal);
        out
    }

    /// `table_id` followed by every descendant, depth first.
    pub fn descendants_depth_first(&self, table_id: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack = vec![table_id];
        while let Some(id) = stack.pop() {
            if out.contains(&id) {
                continue;
            }
            out.push(id);
            let children = self.children(id);
            stack.extend(children.iter().rev().map(|c| c.table_id));
        }
        out
    }

    pub fn root_of(&self, table_id: u32) -> Option<&TableDef> {
        let mut current = self.tables.get(&table_id)?;
        for _ in 0..=self.tables.len() {
            match &current.parent {
                None => return Some(current),
                Some(join) => current = self.tables.get(&join.parent_id)?,
            }
        }
        None
    }

    /// Every physical tree referenced by this catalog.
    pub fn tree_names(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        out.extend(
            self.tables
                .values()
                .filter(|t| !t.memory && !t.tree_name.is_empty())
                .map(|t| t.tree_name.clone()),
        );
        out.extend(self.indexes.values().map(|i| i.tree_name.clone()));
        out.extend(self.sequences.values().map(|s| s.tree_name.clone()));
        out
    }

    pub fn clone_selected(&self, selector: &dyn CatalogSelector) -> Self {
        let tables: OrdMap<u32, TableDef> = self
            .tables
            .iter()
            .filter(|(_, t)| selector.select_table(t))
            .map(|(id, t)| (*id, t.clone()))
            .collect();
        let table_ids = tables
            .values()
            .map(|t| (t.name.clone(), t.table_id))
            .collect();
        let indexes = self
            .indexes
            .iter()
            .filter(|(_, i)| {
                selector.select_index(i) && i.table_ids().iter().all(|id| tables.contains_key(id))
            })
            .map(|(k, i)| (k.clone(), i.clone()))
            .collect();
        Self {
            generation: self.generation,
            next_table_id: self.next_table_id,
            next_index_id: self.next_index_id,
            tables,
            table_ids,
            indexes,
            sequences: retain_where(&self.sequences, |s| selector.select_sequence(s)),
            views: retain_where(&self.views, |v| selector.select_view(v)),
            routines: retain_where(&self.routines, |r| selector.select_routine(r)),
            jars: retain_where(&self.jars, |j| selector.select_jar(j)),
        }
    }

    /// Adds a table. Returns the new catalog and the assigned table id.
    pub fn merge_table(
        &self,
        spec: &TableSpec,
        options: MergeOptions,
        names: &mut TreeNameGenerator,
    ) -> Result<(Self, u32), SchemataError> {
        validate_identifier(&spec.name.schema, "schema name")?;
        validate_identifier(&spec.name.name, "table name")?;
        self.check_relation_name_free(&spec.name)?;
        validate_columns(spec, options.memory)?;
        let parent = spec
            .parent
            .as_ref()
            .map(|join| self.resolve_join(spec, join, options.internal))
            .transpose()?;

        let mut next = self.clone();
        let table_id = next.next_table_id;
        next.next_table_id = table_id
            .checked_add(1)
            .ok_or_else(|| SchemataError::Validation("table ids exhausted".into()))?;

        let (tree_name, ordinal) = match &parent {
            Some(join) => self.group_placement(join.parent_id)?,
            None if options.memory => (String::new(), 1),
            None => (names.generate(&spec.name.schema, &spec.name.name), 1),
        };
        let columns = next.build_columns(spec, None, names)?;
        let table = TableDef {
            table_id,
            name: spec.name.clone(),
            uuid: Uuid::new_v4(),
            version: options.version,
            columns,
            primary_key: spec.primary_key.clone(),
            parent,
            tree_name,
            ordinal,
            memory: options.memory,
        };
        next.table_ids.insert(table.name.clone(), table_id);
        next.tables.insert(table_id, table);
        Ok((next, table_id))
    }

    /// Replaces the definition of an existing table, keeping its id, uuid
    /// and, unless it moves to another group, its tree.
    pub fn replace_table(
        &self,
        table_id: u32,
        spec: &TableSpec,
        internal: bool,
        names: &mut TreeNameGenerator,
    ) -> Result<Self, SchemataError> {
        let existing = self
            .tables
            .get(&table_id)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, table_id))?;
        if spec.name != existing.name {
            validate_identifier(&spec.name.schema, "schema name")?;
            validate_identifier(&spec.name.name, "table name")?;
            self.check_relation_name_free(&spec.name)?;
        }
        validate_columns(spec, existing.memory)?;
        let parent = spec
            .parent
            .as_ref()
            .map(|join| self.resolve_join(spec, join, internal))
            .transpose()?;
        if let Some(join) = &parent
            && self.descendants_depth_first(table_id).contains(&join.parent_id)
        {
            return Err(SchemataError::Validation(format!(
                "table {} cannot join its own descendant",
                spec.name
            )));
        }

        let old_parent = existing.parent.as_ref().map(|j| j.parent_id);
        let new_parent = parent.as_ref().map(|j| j.parent_id);
        let (tree_name, ordinal) = if old_parent == new_parent {
            (existing.tree_name.clone(), existing.ordinal)
        } else {
            if !self.children(table_id).is_empty() {
                return Err(SchemataError::Validation(format!(
                    "table {} has children and cannot move to another group",
                    existing.name
                )));
            }
            match new_parent {
                Some(parent_id) => self.group_placement(parent_id)?,
                None => (names.generate(&spec.name.schema, &spec.name.name), 1),
            }
        };

        let mut next = self.clone();
        let columns = next.build_columns(spec, Some(existing), names)?;
        for old in &existing.columns {
            let Some(seq) = &old.identity else { continue };
            let kept = columns.iter().any(|c| c.identity.as_ref() == Some(seq));
            if !kept {
                next.sequences.remove(seq);
            }
        }
        for index in self.indexes_touching(table_id) {
            for column in index.columns.iter().filter(|c| c.table_id == table_id) {
                if !columns.iter().any(|c| c.name == column.column) {
                    return Err(SchemataError::Validation(format!(
                        "index {} references dropped column {}",
                        index.name, column.column
                    )));
                }
            }
        }
        for child in self.children(table_id) {
            if let Some(join) = &child.parent {
                for (_, parent_column) in &join.columns {
                    if !columns.iter().any(|c| &c.name == parent_column) {
                        return Err(SchemataError::Validation(format!(
                            "child table {} joins dropped column {parent_column}",
                            child.name
                        )));
                    }
                }
            }
        }

        let table = TableDef {
            table_id,
            name: spec.name.clone(),
            uuid: existing.uuid,
            version: existing.version,
            columns,
            primary_key: spec.primary_key.clone(),
            parent,
            tree_name,
            ordinal,
            memory: existing.memory,
        };
        next.table_ids.remove(&existing.name);
        next.table_ids.insert(table.name.clone(), table_id);
        next.tables.insert(table_id, table);
        Ok(next)
    }

    /// Pure metadata rename. Tree names, ids and versions stay as they are.
    pub fn rename_table(&self, old: &TableName, new: &TableName) -> Result<Self, SchemataError> {
        let table_id = *self
            .table_ids
            .get(old)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, old))?;
        if old == new {
            return Ok(self.clone());
        }
        validate_identifier(&new.schema, "schema name")?;
        validate_identifier(&new.name, "table name")?;
        self.check_relation_name_free(new)?;
        let mut next = self.clone();
        if let Some(table) = next.tables.get_mut(&table_id) {
            table.name = new.clone();
        }
        next.table_ids.remove(old);
        next.table_ids.insert(new.clone(), table_id);
        Ok(next)
    }

    pub fn merge_index(
        &self,
        spec: &IndexSpec,
        names: &mut TreeNameGenerator,
    ) -> Result<(Self, IndexDef), SchemataError> {
        let table = self
            .table_by_name(&spec.table)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, &spec.table))?;
        validate_identifier(&spec.index_name, "index name")?;
        if self.index(table.table_id, &spec.index_name).is_some() {
            return Err(SchemataError::duplicate(
                ObjectKind::Index,
                format!("{}.{}", spec.table, spec.index_name),
            ));
        }
        if spec.columns.is_empty() {
            return Err(SchemataError::Validation(format!(
                "index {} must have at least one column",
                spec.index_name
            )));
        }
        let root = self.root_of(table.table_id).map(|r| r.table_id);
        let mut columns = Vec::with_capacity(spec.columns.len());
        for (owner, column) in &spec.columns {
            let owner_def = self
                .table_by_name(owner)
                .ok_or_else(|| SchemataError::missing(ObjectKind::Table, owner))?;
            if owner_def.column_index(column).is_none() {
                return Err(SchemataError::Validation(format!(
                    "unknown column {column} in table {owner}"
                )));
            }
            if self.root_of(owner_def.table_id).map(|r| r.table_id) != root {
                return Err(SchemataError::Validation(format!(
                    "index {} spans tables outside the group of {}",
                    spec.index_name, spec.table
                )));
            }
            columns.push(IndexColumn {
                table_id: owner_def.table_id,
                column: column.clone(),
            });
        }

        let tree_name = match &spec.tree_name {
            Some(existing) => {
                names.claim(existing);
                existing.clone()
            }
            None => names.generate(
                &table.name.schema,
                &format!("{}.{}", table.name.name, spec.index_name),
            ),
        };
        let mut next = self.clone();
        let index_id = next.next_index_id;
        next.next_index_id = index_id
            .checked_add(1)
            .ok_or_else(|| SchemataError::Validation("index ids exhausted".into()))?;
        let index = IndexDef {
            index_id,
            name: spec.index_name.clone(),
            table_id: table.table_id,
            columns,
            unique: spec.unique,
            tree_name,
        };
        next.indexes
            .insert((index.table_id, index.name.clone()), index.clone());
        Ok((next, index))
    }

    pub fn merge_sequence(
        &self,
        name: &TableName,
        options: SequenceOptions,
        names: &mut TreeNameGenerator,
    ) -> Result<(Self, SequenceDef), SchemataError> {
        validate_identifier(&name.schema, "schema name")?;
        validate_identifier(&name.name, "sequence name")?;
        if self.sequences.contains_key(name) {
            return Err(SchemataError::duplicate(ObjectKind::Sequence, name));
        }
        Sequence::new(name.clone(), options)?;
        let def = SequenceDef {
            name: name.clone(),
            options,
            tree_name: names.generate(&name.schema, &name.name),
        };
        let mut next = self.clone();
        next.sequences.insert(name.clone(), def.clone());
        Ok((next, def))
    }

    pub fn merge_view(&self, view: ViewDef) -> Result<Self, SchemataError> {
        validate_identifier(&view.name.schema, "schema name")?;
        validate_identifier(&view.name.name, "view name")?;
        self.check_relation_name_free(&view.name)?;
        let mut next = self.clone();
        next.views.insert(view.name.clone(), view);
        Ok(next)
    }

    pub fn merge_routine(&self, routine: RoutineDef, replace: bool) -> Result<Self, SchemataError> {
        validate_identifier(&routine.name.schema, "schema name")?;
        validate_identifier(&routine.name.name, "routine name")?;
        if !replace && self.routines.contains_key(&routine.name) {
            return Err(SchemataError::duplicate(ObjectKind::Routine, &routine.name));
        }
        if let Some(jar) = &routine.jar
            && !self.jars.contains_key(jar)
        {
            return Err(SchemataError::missing(ObjectKind::Jar, jar));
        }
        let mut next = self.clone();
        next.routines.insert(routine.name.clone(), routine);
        Ok(next)
    }

    /// Adds a jar, or with `replace` swaps the URL of an existing one.
    pub fn merge_jar(&self, jar: JarDef, replace: bool) -> Result<Self, SchemataError> {
        validate_identifier(&jar.name.schema, "schema name")?;
        validate_identifier(&jar.name.name, "jar name")?;
        let exists = self.jars.contains_key(&jar.name);
        if replace && !exists {
            return Err(SchemataError::missing(ObjectKind::Jar, &jar.name));
        }
        if !replace && exists {
            return Err(SchemataError::duplicate(ObjectKind::Jar, &jar.name));
        }
        let mut next = self.clone();
        next.jars.insert(jar.name.clone(), jar);
        Ok(next)
    }

    pub fn with_table_version(&self, table_id: u32, version: u32) -> Self {
        let mut next = self.clone();
        if let Some(table) = next.tables.get_mut(&table_id) {
            table.version = version;
        }
        next
    }

    /// Checks that every join, index column, identity sequence and jar
    /// reference resolves within this snapshot.
    pub fn validate_references(&self) -> Result<(), SchemataError> {
        if self.table_ids.len() != self.tables.len() {
            return Err(SchemataError::Validation(
                "table name index is out of sync".into(),
            ));
        }
        for table in self.tables.values() {
            if self.table_ids.get(&table.name) != Some(&table.table_id) {
                return Err(SchemataError::Validation(format!(
                    "table {} is not indexed by name",
                    table.name
                )));
            }
            if let Some(join) = &table.parent {
                let Some(parent) = self.tables.get(&join.parent_id) else {
                    return Err(SchemataError::Validation(format!(
                        "table {} joins missing table id {}",
                        table.name, join.parent_id
                    )));
                };
                if self.root_of(table.table_id).is_none() {
                    return Err(SchemataError::Validation(format!(
                        "table {} has a cyclic join",
                        table.name
                    )));
                }
                for (child_col, parent_col) in &join.columns {
                    if table.column_index(child_col).is_none()
                        || parent.column_index(parent_col).is_none()
                    {
                        return Err(SchemataError::Validation(format!(
                            "join of {} to {} names a missing column",
                            table.name, parent.name
                        )));
                    }
                }
            }
            for column in &table.columns {
                if let Some(seq) = &column.identity
                    && !self.sequences.contains_key(seq)
                {
                    return Err(SchemataError::Validation(format!(
                        "column {}.{} references missing sequence {seq}",
                        table.name, column.name
                    )));
                }
            }
        }
        for index in self.indexes.values() {
            for column in &index.columns {
                let known = self
                    .tables
                    .get(&column.table_id)
                    .is_some_and(|t| t.column_index(&column.column).is_some());
                if !known {
                    return Err(SchemataError::Validation(format!(
                        "index {} references missing column {}",
                        index.name, column.column
                    )));
                }
            }
        }
        for routine in self.routines.values() {
            if let Some(jar) = &routine.jar
                && !self.jars.contains_key(jar)
            {
                return Err(SchemataError::Validation(format!(
                    "routine {} references missing jar {jar}",
                    routine.name
                )));
            }
        }
        Ok(())
    }

    fn check_relation_name_free(&self, name: &TableName) -> Result<(), SchemataError> {
        if self.table_ids.contains_key(name) {
            return Err(SchemataError::duplicate(ObjectKind::Table, name));
        }
        if self.views.contains_key(name) {
            return Err(SchemataError::duplicate(ObjectKind::View, name));
        }
        Ok(())
    }

    fn resolve_join(
        &self,
        spec: &TableSpec,
        join: &JoinSpec,
        internal: bool,
    ) -> Result<JoinDef, SchemataError> {
        let parent = self
            .table_by_name(&join.parent)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, &join.parent))?;
        let protected = is_protected_schema(&parent.name.schema);
        if protected && !internal {
            return Err(SchemataError::JoinToProtectedTable {
                child: spec.name.to_string(),
                parent: parent.name.to_string(),
            });
        }
        if internal && !protected {
            return Err(SchemataError::InternalJoinToUserTable {
                child: spec.name.to_string(),
                parent: parent.name.to_string(),
            });
        }
        if parent.memory {
            return Err(SchemataError::Validation(format!(
                "table {} cannot join memory table {}",
                spec.name, parent.name
            )));
        }
        if join.columns.is_empty() {
            return Err(SchemataError::Validation(format!(
                "join of {} to {} has no columns",
                spec.name, parent.name
            )));
        }
        for (child_col, parent_col) in &join.columns {
            if !spec.columns.iter().any(|c| &c.name == child_col) {
                return Err(SchemataError::Validation(format!(
                    "unknown join column {child_col} in table {}",
                    spec.name
                )));
            }
            if parent.column_index(parent_col).is_none() {
                return Err(SchemataError::Validation(format!(
                    "unknown join column {parent_col} in parent {}",
                    parent.name
                )));
            }
        }
        Ok(JoinDef {
            parent_id: parent.table_id,
            columns: join.columns.clone(),
        })
    }

    /// Group tree and next free ordinal for a table joining `parent_id`.
    fn group_placement(&self, parent_id: u32) -> Result<(String, u32), SchemataError> {
        let root = self
            .root_of(parent_id)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, parent_id))?;
        let max_ordinal = self
            .descendants_depth_first(root.table_id)
            .iter()
            .filter_map(|id| self.tables.get(id))
            .map(|t| t.ordinal)
            .max()
            .unwrap_or(0);
        Ok((root.tree_name.clone(), max_ordinal + 1))
    }

    /// Column definitions for `spec`, creating identity sequences that do
    /// not already back a same-named column of `previous`.
    fn build_columns(
        &mut self,
        spec: &TableSpec,
        previous: Option<&TableDef>,
        names: &mut TreeNameGenerator,
    ) -> Result<Vec<ColumnDef>, SchemataError> {
        let mut out = Vec::with_capacity(spec.columns.len());
        for column in &spec.columns {
            let mut def = ColumnDef::new(column.name.clone(), column.col_type, column.nullable);
            if let Some(options) = column.identity {
                let reused = previous
                    .and_then(|p| p.columns.iter().find(|c| c.name == column.name))
                    .and_then(|c| c.identity.clone())
                    .filter(|seq| self.sequences.contains_key(seq));
                let seq_name = match reused {
                    Some(seq_name) => {
                        Sequence::new(seq_name.clone(), options)?;
                        if let Some(existing) = self.sequences.get_mut(&seq_name) {
                            existing.options = options;
                        }
                        seq_name
                    }
                    None => self.add_identity_sequence(spec, column, options, names)?,
                };
                def.identity = Some(seq_name);
            }
            out.push(def);
        }
        Ok(out)
    }

    fn add_identity_sequence(
        &mut self,
        spec: &TableSpec,
        column: &ColumnSpec,
        options: SequenceOptions,
        names: &mut TreeNameGenerator,
    ) -> Result<TableName, SchemataError> {
        let base = format!("{}_{}_seq", spec.name.name, column.name);
        let mut seq_name = TableName::new(spec.name.schema.clone(), base.clone());
        let mut n = 1u32;
        while self.sequences.contains_key(&seq_name) {
            seq_name = TableName::new(spec.name.schema.clone(), format!("{base}{n}"));
            n += 1;
        }
        Sequence::new(seq_name.clone(), options)?;
        let def = SequenceDef {
            name: seq_name.clone(),
            options,
            tree_name: names.generate(&seq_name.schema, &seq_name.name),
        };
        self.sequences.insert(seq_name.clone(), def);
        Ok(seq_name)
    }
}

fn retain_where<V: Clone>(
    map: &OrdMap<TableName, V>,
    keep: impl Fn(&V) -> bool,
) -> OrdMap<TableName, V> {
    map.iter()
        .filter(|(_, v)| keep(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn validate_columns(spec: &TableSpec, memory: bool) -> Result<(), SchemataError> {
    if spec.columns.is_empty() {
        return Err(SchemataError::Validation(format!(
            "table {} must have at least one column",
            spec.name
        )));
    }
    let mut seen = HashSet::new();
    for column in &spec.columns {
        validate_identifier(&column.name, "column name")?;
        if !seen.insert(column.name.as_str()) {
            return Err(SchemataError::Validation(format!(
                "duplicate column {} in table {}",
                column.name, spec.name
            )));
        }
        if column.identity.is_some() && column.col_type != ColumnType::Integer {
            return Err(SchemataError::Validation(format!(
                "identity column {} must be integer",
                column.name
            )));
        }
    }
    if spec.primary_key.is_empty() && !memory {
        return Err(SchemataError::Validation(format!(
            "table {} requires a primary key",
            spec.name
        )));
    }
    let mut pk_seen = HashSet::new();
    for key in &spec.primary_key {
        if !spec.columns.iter().any(|c| &c.name == key) {
            return Err(SchemataError::Validation(format!(
                "primary key column {key} not found in table {}",
                spec.name
            )));
        }
        if !pk_seen.insert(key.as_str()) {
            return Err(SchemataError::Validation(format!(
                "primary key column {key} listed twice"
            )));
        }
    }
    Ok(())
}

fn validate_identifier(value: &str, name: &str) -> Result<(), SchemataError> {
    if value.is_empty() {
        return Err(SchemataError::Validation(format!("{name} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(SchemataError::Validation(format!(
            "{name} must be <= {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SchemataError::Validation(format!(
            "{name} must contain only [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Flat, JSON-friendly form of a catalog. Name indexes are rebuilt and
/// references re-validated on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogImage {
    generation: u64,
    next_table_id: u32,
    next_index_id: u32,
    #[serde(default)]
    tables: Vec<TableDef>,
    #[serde(default)]
    indexes: Vec<IndexDef>,
    #[serde(default)]
    sequences: Vec<SequenceDef>,
    #[serde(default)]
    views: Vec<ViewDef>,
    #[serde(default)]
    routines: Vec<RoutineDef>,
    #[serde(default)]
    jars: Vec<JarDef>,
}

impl From<SchemaCatalog> for CatalogImage {
    fn from(catalog: SchemaCatalog) -> Self {
        Self {
            generation: catalog.generation,
            next_table_id: catalog.next_table_id,
            next_index_id: catalog.next_index_id,
            tables: catalog.tables.values().cloned().collect(),
            indexes: catalog.indexes.values().cloned().collect(),
            sequences: catalog.sequences.values().cloned().collect(),
            views: catalog.views.values().cloned().collect(),
            routines: catalog.routines.values().cloned().collect(),
            jars: catalog.jars.values().cloned().collect(),
        }
    }
}

impl TryFrom<CatalogImage> for SchemaCatalog {
    type Error = SchemataError;

    fn try_from(image: CatalogImage) -> Result<Self, Self::Error> {
        let mut catalog = SchemaCatalog {
            generation: image.generation,
            next_table_id: image.next_table_id,
            next_index_id: image.next_index_id,
            ..SchemaCatalog::default()
        };
        for table in image.tables {
            if table.table_id >= catalog.next_table_id {
                return Err(SchemataError::Decode(format!(
                    "table id {} is not below next id {}",
                    table.table_id, catalog.next_table_id
                )));
            }
            if catalog
                .table_ids
                .insert(table.name.clone(), table.table_id)
                .is_some()
                || catalog.tables.insert(table.table_id, table).is_some()
            {
                return Err(SchemataError::Decode("duplicate table in catalog".into()));
            }
        }
        for index in image.indexes {
            catalog
                .indexes
                .insert((index.table_id, index.name.clone()), index);
        }
        for sequence in image.sequences {
            catalog.sequences.insert(sequence.name.clone(), sequence);
        }
        for view in image.views {
            catalog.views.insert(view.name.clone(), view);
        }
        for routine in image.routines {
            catalog.routines.insert(routine.name.clone(), routine);
        }
        for jar in image.jars {
            catalog.jars.insert(jar.name.clone(), jar);
        }
        catalog.validate_references()?;
        Ok(catalog)
    }
}
