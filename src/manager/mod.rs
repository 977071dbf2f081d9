pub mod ddl;

pub use ddl::{DdlOperation, DdlOutcome, DropBehavior};

use crate::catalog::names::TreeNameGenerator;
use crate::catalog::schema::{
    IndexDef, JarDef, RoutineDef, SequenceDef, SequenceOptions, TableName, ViewDef,
};
use crate::catalog::select::{PersistentOnly, WithoutIndexes, WithoutNamed, WithoutTables};
use crate::catalog::types::Row;
use crate::catalog::{MergeOptions, SchemaCatalog, is_protected_schema};
use crate::config::SchemataConfig;
use crate::declarative::{IndexSpec, TableChange, TableSpec};
use crate::error::{ObjectKind, SchemataError};
use crate::manifest::{CATALOG_KEY, CatalogEnvelope, write_catalog_dump};
use crate::permission::AccessPolicy;
use crate::session::Session;
use crate::snapshot::PublishedCatalog;
use crate::storage::engine::StorageEngine;
use crate::storage::mapping::{StorageMapping, TreeRef};
use crate::version_store::TableVersionLedger;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Row provider behind a memory table. Memory tables have no tree; their
/// rows are produced on demand for each scan.
pub trait MemoryTableFactory: Send + Sync + std::fmt::Debug {
    fn scan(&self, session: &Session) -> Result<Vec<Row>, SchemataError>;
}

#[derive(Debug)]
struct DdlState {
    names: TreeNameGenerator,
}

/// A catalog built by one DDL verb, waiting to be versioned, persisted
/// and published.
struct Staged {
    verb: &'static str,
    schema: String,
    catalog: SchemaCatalog,
    created: Vec<u32>,
    bumped: BTreeSet<u32>,
    persist: bool,
}

impl Staged {
    fn new(verb: &'static str, schema: &str, catalog: SchemaCatalog) -> Self {
        Self {
            verb,
            schema: schema.to_string(),
            catalog,
            created: Vec::new(),
            bumped: BTreeSet::new(),
            persist: true,
        }
    }

    fn created(mut self, table_id: u32) -> Self {
        self.created.push(table_id);
        self
    }

    fn bump<I: IntoIterator<Item = u32>>(mut self, table_ids: I) -> Self {
        self.bumped.extend(table_ids);
        self
    }

    fn memory_only(mut self) -> Self {
        self.persist = false;
        self
    }
}

/// Serializes DDL against the published catalog. Every verb validates
/// against the current snapshot, builds a private successor, persists it
/// in one engine transaction and only then publishes it.
#[derive(Debug)]
pub struct SchemaManager {
    config: SchemataConfig,
    mapping: Arc<StorageMapping>,
    published: PublishedCatalog,
    ledger: TableVersionLedger,
    access: Arc<dyn AccessPolicy>,
    ddl: Mutex<DdlState>,
    memory_factories: RwLock<HashMap<TableName, Arc<dyn MemoryTableFactory>>>,
}

impl SchemaManager {
    /// Loads the persisted catalog from the catalog tree, or starts empty.
    pub fn open(
        config: SchemataConfig,
        engine: Arc<dyn StorageEngine>,
        access: Arc<dyn AccessPolicy>,
    ) -> Result<Self, SchemataError> {
        let mapping = Arc::new(StorageMapping::new(&config, engine)?);
        let handle = mapping.resolve(&config.catalog_schema, &config.catalog_tree_name)?;
        let catalog = match mapping.engine().get(handle.tree(), CATALOG_KEY)? {
            Some(bytes) => CatalogEnvelope::from_bytes(&bytes)?.open()?,
            None => SchemaCatalog::new(),
        };
        let ledger = TableVersionLedger::seeded(catalog.tables().map(|t| (t.table_id, t.version)));
        let mut names = TreeNameGenerator::with_used(catalog.tree_names());
        let trees = physical_trees(&catalog);
        let schemas: HashSet<&str> = trees
            .iter()
            .map(|tree| tree.schema.as_str())
            .chain([config.catalog_schema.as_str(), config.sort_schema.as_str()])
            .collect();
        for existing in mapping.existing_tree_names(schemas)? {
            names.claim(&existing);
        }
        for existing in mapping.engine().tree_names(handle.volume())? {
            names.claim(&existing);
        }
        names.claim(&config.catalog_tree_name);
        info!(
            generation = catalog.generation(),
            tables = catalog.tables().count(),
            sequences = catalog.sequences().count(),
            catalog_schema = %config.catalog_schema,
            catalog_tree = %config.catalog_tree_name,
            "schema manager opened"
        );
        Ok(Self {
            config,
            mapping,
            published: PublishedCatalog::new(catalog),
            ledger,
            access,
            ddl: Mutex::new(DdlState { names }),
            memory_factories: RwLock::new(HashMap::new()),
        })
    }

    /// Current published snapshot. Holders keep it unchanged for as long
    /// as they retain the `Arc`.
    pub fn catalog(&self) -> Arc<SchemaCatalog> {
        self.published.snapshot()
    }

    pub fn mapping(&self) -> &Arc<StorageMapping> {
        &self.mapping
    }

    pub fn ledger(&self) -> &TableVersionLedger {
        &self.ledger
    }

    pub fn config(&self) -> &SchemataConfig {
        &self.config
    }

    /// True when `snapshot` no longer describes the current structure of
    /// `table_id`, including when the table was dropped or created since.
    pub fn has_table_changed(&self, snapshot: &SchemaCatalog, table_id: u32) -> bool {
        match (self.ledger.get(table_id), snapshot.table(table_id)) {
            (Some(version), Some(table)) => version != table.version,
            (None, None) => false,
            _ => true,
        }
    }

    pub fn tree_names(&self) -> BTreeSet<String> {
        self.catalog().tree_names()
    }

    pub fn next_sequence_value(&self, name: &TableName) -> Result<i64, SchemataError> {
        let catalog = self.catalog();
        let sequence = catalog
            .sequence(name)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Sequence, name))?;
        self.mapping.sequence_next_value(sequence)
    }

    pub fn current_sequence_value(&self, name: &TableName) -> Result<i64, SchemataError> {
        let catalog = self.catalog();
        let sequence = catalog
            .sequence(name)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Sequence, name))?;
        self.mapping.sequence_current_value(sequence)
    }

    /// Writes the persistent part of the current catalog as a JSON dump,
    /// signed with the configured key when there is one.
    pub fn write_dump(&self, dir: &Path) -> Result<(), SchemataError> {
        let catalog = self.catalog().clone_selected(&PersistentOnly);
        write_catalog_dump(&catalog, dir, self.config.hmac_key())
    }

    pub fn create_table(&self, session: &Session, spec: TableSpec) -> Result<u32, SchemataError> {
        self.authorize(session, &spec.name.schema)?;
        let mut state = self.ddl.lock();
        let base = self.published.snapshot();
        self.mapping.volume_for(&spec.name.schema)?;
        if let Some(join) = &spec.parent
            && let Some(parent) = base.table_by_name(&join.parent)
        {
            self.require_same_volume(&parent.name.schema, &spec.name.schema)?;
        }
        let options = MergeOptions {
            internal: self.is_internal(session, &spec.name.schema),
            memory: false,
            version: 1,
        };
        let (next, table_id) = base.merge_table(&spec, options, &mut state.names)?;
        let parent = next
            .table(table_id)
            .and_then(|t| t.parent.as_ref())
            .map(|j| j.parent_id);
        let staged = Staged::new("create_table", &spec.name.schema, next)
            .created(table_id)
            .bump(parent);
        self.commit(&base, staged)?;
        Ok(table_id)
    }

    /// Renames a table. Only the name changes: the tree, id and version
    /// stay, so cached plans and rows remain valid.
    pub fn rename_table(
        &self,
        session: &Session,
        old: &TableName,
        new: &TableName,
    ) -> Result<(), SchemataError> {
        self.authorize(session, &old.schema)?;
        self.authorize(session, &new.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        let table = base
            .table_by_name(old)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, old))?;
        if !table.memory {
            self.require_same_volume(&old.schema, &new.schema)?;
        }
        let memory = table.memory;
        let next = base.rename_table(old, new)?;
        let mut staged = Staged::new("rename_table", &new.schema, next);
        if memory {
            staged = staged.memory_only();
        }
        self.commit(&base, staged)?;
        Ok(())
    }

    /// Replaces the definitions of one or more tables in a single catalog
    /// change. Each altered table and every parent it leaves or joins gets
    /// a new version.
    pub fn alter_table(&self, session: &Session, changes: Vec<TableChange>) -> Result<(), SchemataError> {
        if changes.is_empty() {
            return Err(SchemataError::Validation("alter table without changes".into()));
        }
        for change in &changes {
            self.authorize(session, &change.old_name.schema)?;
            self.authorize(session, &change.definition.name.schema)?;
        }
        let mut state = self.ddl.lock();
        let base = self.published.snapshot();
        let mut next = (*base).clone();
        let mut bumped = BTreeSet::new();
        for change in &changes {
            let existing = next
                .table_by_name(&change.old_name)
                .ok_or_else(|| SchemataError::missing(ObjectKind::Table, &change.old_name))?;
            if existing.memory {
                return Err(SchemataError::Unsupported(format!(
                    "memory table {} cannot be altered",
                    existing.name
                )));
            }
            let table_id = existing.table_id;
            let old_parent = existing.parent.as_ref().map(|j| j.parent_id);
            self.require_same_volume(&change.old_name.schema, &change.definition.name.schema)?;
            if let Some(join) = &change.definition.parent
                && let Some(parent) = next.table_by_name(&join.parent)
            {
                self.require_same_volume(&parent.name.schema, &change.definition.name.schema)?;
            }
            let internal = self.is_internal(session, &change.definition.name.schema);
            next = next.replace_table(table_id, &change.definition, internal, &mut state.names)?;
            let new_parent = next
                .table(table_id)
                .and_then(|t| t.parent.as_ref())
                .map(|j| j.parent_id);
            bumped.insert(table_id);
            bumped.extend(old_parent);
            bumped.extend(new_parent);
        }
        let schema = changes[0].definition.name.schema.clone();
        self.commit(&base, Staged::new("alter_table", &schema, next).bump(bumped))?;
        Ok(())
    }

    pub fn drop_table(
        &self,
        session: &Session,
        name: &TableName,
        behavior: DropBehavior,
    ) -> Result<(), SchemataError> {
        if behavior == DropBehavior::Cascade {
            return Err(SchemataError::Unsupported(
                "drop cascade; pass every dependent table to drop_tables".into(),
            ));
        }
        self.drop_tables(session, std::slice::from_ref(name))
    }

    /// Drops a set of tables in one catalog change. The set must contain
    /// every descendant of its members, and no surviving view may
    /// reference them.
    pub fn drop_tables(&self, session: &Session, names: &[TableName]) -> Result<(), SchemataError> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            self.authorize(session, &name.schema)?;
        }
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        let mut dropped = HashSet::new();
        for name in names {
            let table = base
                .table_by_name(name)
                .ok_or_else(|| SchemataError::missing(ObjectKind::Table, name))?;
            if table.memory {
                return Err(SchemataError::Unsupported(format!(
                    "memory table {name} is unregistered, not dropped"
                )));
            }
            dropped.insert(table.table_id);
        }
        for id in &dropped {
            for descendant in base.descendants_depth_first(*id) {
                if dropped.contains(&descendant) {
                    continue;
                }
                let (Some(table), Some(child)) = (base.table(*id), base.table(descendant)) else {
                    continue;
                };
                return Err(SchemataError::ReferencedTable {
                    table: table.name.to_string(),
                    referenced_by: child.name.to_string(),
                });
            }
        }
        let dropped_names: HashSet<&TableName> = dropped
            .iter()
            .filter_map(|id| base.table(*id))
            .map(|t| &t.name)
            .collect();
        for view in base.views() {
            if let Some(target) = view.references.iter().find(|r| dropped_names.contains(r)) {
                return Err(SchemataError::ReferencedTable {
                    table: target.to_string(),
                    referenced_by: view.name.to_string(),
                });
            }
        }

        let mut sequences = HashSet::new();
        let mut bumped = BTreeSet::new();
        for id in &dropped {
            let Some(table) = base.table(*id) else { continue };
            sequences.extend(table.columns.iter().filter_map(|c| c.identity.clone()));
            if let Some(join) = &table.parent
                && !dropped.contains(&join.parent_id)
            {
                bumped.insert(join.parent_id);
            }
            for index in base.indexes_touching(*id) {
                bumped.extend(index.table_ids().into_iter().filter(|t| !dropped.contains(t)));
            }
        }
        let next = base.clone_selected(&WithoutTables {
            table_ids: dropped,
            sequences,
        });
        self.commit(
            &base,
            Staged::new("drop_table", &names[0].schema, next).bump(bumped),
        )?;
        Ok(())
    }

    /// Adds indexes, possibly spanning several tables of one group. Every
    /// table an index touches gets a new version.
    pub fn create_indexes(
        &self,
        session: &Session,
        indexes: Vec<IndexSpec>,
    ) -> Result<Vec<IndexDef>, SchemataError> {
        if indexes.is_empty() {
            return Ok(Vec::new());
        }
        for spec in &indexes {
            self.authorize(session, &spec.table.schema)?;
        }
        let mut state = self.ddl.lock();
        let base = self.published.snapshot();
        let mut next = (*base).clone();
        let mut created = Vec::with_capacity(indexes.len());
        let mut bumped = BTreeSet::new();
        for spec in &indexes {
            if next.table_by_name(&spec.table).is_some_and(|t| t.memory) {
                return Err(SchemataError::Unsupported(format!(
                    "memory table {} cannot be indexed",
                    spec.table
                )));
            }
            let (merged, index) = next.merge_index(spec, &mut state.names)?;
            bumped.extend(index.table_ids());
            created.push(index);
            next = merged;
        }
        self.commit(
            &base,
            Staged::new("create_indexes", &indexes[0].table.schema, next).bump(bumped),
        )?;
        Ok(created)
    }

    pub fn drop_indexes(
        &self,
        session: &Session,
        table: &TableName,
        names: &[String],
    ) -> Result<(), SchemataError> {
        self.authorize(session, &table.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        let table_id = base
            .table_by_name(table)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, table))?
            .table_id;
        let mut selector = WithoutIndexes::default();
        let mut bumped = BTreeSet::new();
        for name in names {
            let index = base
                .index(table_id, name)
                .ok_or_else(|| SchemataError::missing(ObjectKind::Index, format!("{table}.{name}")))?;
            bumped.extend(index.table_ids());
            selector.indexes.insert((table_id, name.clone()));
        }
        let next = base.clone_selected(&selector);
        self.commit(&base, Staged::new("drop_indexes", &table.schema, next).bump(bumped))?;
        Ok(())
    }

    pub fn create_view(&self, session: &Session, view: ViewDef) -> Result<(), SchemataError> {
        self.authorize(session, &view.name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        for reference in &view.references {
            if base.table_by_name(reference).is_none() && base.view(reference).is_none() {
                return Err(SchemataError::missing(ObjectKind::Table, reference));
            }
        }
        let schema = view.name.schema.clone();
        let next = base.merge_view(view)?;
        self.commit(&base, Staged::new("create_view", &schema, next))?;
        Ok(())
    }

    pub fn drop_view(&self, session: &Session, name: &TableName) -> Result<(), SchemataError> {
        self.authorize(session, &name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        if base.view(name).is_none() {
            return Err(SchemataError::missing(ObjectKind::View, name));
        }
        if let Some(dependent) = base
            .views()
            .find(|v| v.name != *name && v.references.contains(name))
        {
            return Err(SchemataError::ReferencedTable {
                table: name.to_string(),
                referenced_by: dependent.name.to_string(),
            });
        }
        let next = base.clone_selected(&WithoutNamed::View(name.clone()));
        self.commit(&base, Staged::new("drop_view", &name.schema, next))?;
        Ok(())
    }

    pub fn create_sequence(
        &self,
        session: &Session,
        name: &TableName,
        options: SequenceOptions,
    ) -> Result<SequenceDef, SchemataError> {
        self.authorize(session, &name.schema)?;
        let mut state = self.ddl.lock();
        let base = self.published.snapshot();
        self.mapping.volume_for(&name.schema)?;
        let (next, sequence) = base.merge_sequence(name, options, &mut state.names)?;
        self.commit(&base, Staged::new("create_sequence", &name.schema, next))?;
        Ok(sequence)
    }

    pub fn drop_sequence(&self, session: &Session, name: &TableName) -> Result<(), SchemataError> {
        self.authorize(session, &name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        if base.sequence(name).is_none() {
            return Err(SchemataError::missing(ObjectKind::Sequence, name));
        }
        for table in base.tables() {
            if let Some(column) = table
                .columns
                .iter()
                .find(|c| c.identity.as_ref() == Some(name))
            {
                return Err(SchemataError::ReferencedSequence {
                    sequence: name.to_string(),
                    column: format!("{}.{}", table.name, column.name),
                });
            }
        }
        let next = base.clone_selected(&WithoutNamed::Sequence(name.clone()));
        self.commit(&base, Staged::new("drop_sequence", &name.schema, next))?;
        Ok(())
    }

    pub fn create_routine(
        &self,
        session: &Session,
        mut routine: RoutineDef,
        replace: bool,
    ) -> Result<(), SchemataError> {
        self.authorize(session, &routine.name.schema)?;
        routine.system = false;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        let schema = routine.name.schema.clone();
        let next = base.merge_routine(routine, replace)?;
        self.commit(&base, Staged::new("create_routine", &schema, next))?;
        Ok(())
    }

    pub fn drop_routine(&self, session: &Session, name: &TableName) -> Result<(), SchemataError> {
        self.authorize(session, &name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        if base.routine(name).is_none() {
            return Err(SchemataError::missing(ObjectKind::Routine, name));
        }
        let next = base.clone_selected(&WithoutNamed::Routine(name.clone()));
        self.commit(&base, Staged::new("drop_routine", &name.schema, next))?;
        Ok(())
    }

    pub fn create_jar(&self, session: &Session, jar: JarDef) -> Result<(), SchemataError> {
        self.merge_jar(session, jar, false)
    }

    pub fn replace_jar(&self, session: &Session, jar: JarDef) -> Result<(), SchemataError> {
        self.merge_jar(session, jar, true)
    }

    pub fn drop_jar(&self, session: &Session, name: &TableName) -> Result<(), SchemataError> {
        self.authorize(session, &name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        if base.jar(name).is_none() {
            return Err(SchemataError::missing(ObjectKind::Jar, name));
        }
        if let Some(routine) = base.routines().find(|r| r.jar.as_ref() == Some(name)) {
            return Err(SchemataError::ReferencedJar {
                jar: name.to_string(),
                routine: routine.name.to_string(),
            });
        }
        let next = base.clone_selected(&WithoutNamed::Jar(name.clone()));
        self.commit(&base, Staged::new("drop_jar", &name.schema, next))?;
        Ok(())
    }

    /// Publishes an introspection table backed by `factory`. The table
    /// lives only in memory and is never written to the catalog tree.
    pub fn register_memory_table(
        &self,
        session: &Session,
        spec: TableSpec,
        factory: Arc<dyn MemoryTableFactory>,
    ) -> Result<u32, SchemataError> {
        self.require_internal(session, &spec.name.schema)?;
        if spec.parent.is_some() {
            return Err(SchemataError::Validation(format!(
                "memory table {} cannot join a group",
                spec.name
            )));
        }
        if spec.columns.iter().any(|c| c.identity.is_some()) {
            return Err(SchemataError::Validation(format!(
                "memory table {} cannot have identity columns",
                spec.name
            )));
        }
        let mut state = self.ddl.lock();
        let base = self.published.snapshot();
        let options = MergeOptions {
            internal: true,
            memory: true,
            version: 1,
        };
        let (next, table_id) = base.merge_table(&spec, options, &mut state.names)?;
        let staged = Staged::new("register_memory_table", &spec.name.schema, next)
            .created(table_id)
            .memory_only();
        self.commit(&base, staged)?;
        self.memory_factories.write().insert(spec.name, factory);
        Ok(table_id)
    }

    pub fn unregister_memory_table(&self, session: &Session, name: &TableName) -> Result<(), SchemataError> {
        self.require_internal(session, &name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        let table = base
            .table_by_name(name)
            .filter(|t| t.memory)
            .ok_or_else(|| SchemataError::missing(ObjectKind::Table, name))?;
        let next = base.clone_selected(&WithoutTables {
            table_ids: [table.table_id].into_iter().collect(),
            sequences: HashSet::new(),
        });
        self.commit(
            &base,
            Staged::new("unregister_memory_table", &name.schema, next).memory_only(),
        )?;
        self.memory_factories.write().remove(name);
        Ok(())
    }

    pub fn memory_table_factory(&self, name: &TableName) -> Option<Arc<dyn MemoryTableFactory>> {
        self.memory_factories.read().get(name).cloned()
    }

    /// Registers a persisted table owned by the server at a fixed version.
    /// Registering the same version again is a no-op that returns the
    /// existing id.
    pub fn register_stored_system_table(
        &self,
        session: &Session,
        spec: TableSpec,
        version: u32,
    ) -> Result<u32, SchemataError> {
        self.require_internal(session, &spec.name.schema)?;
        let mut state = self.ddl.lock();
        let base = self.published.snapshot();
        if let Some(existing) = base.table_by_name(&spec.name) {
            if existing.version == version && !existing.memory {
                return Ok(existing.table_id);
            }
            return Err(SchemataError::TableVersionMismatch {
                table: spec.name.to_string(),
                existing: existing.version,
                requested: version,
            });
        }
        self.mapping.volume_for(&spec.name.schema)?;
        let options = MergeOptions {
            internal: true,
            memory: false,
            version,
        };
        let (next, table_id) = base.merge_table(&spec, options, &mut state.names)?;
        let parent = next
            .table(table_id)
            .and_then(|t| t.parent.as_ref())
            .map(|j| j.parent_id);
        let staged = Staged::new("register_stored_system_table", &spec.name.schema, next)
            .created(table_id)
            .bump(parent);
        self.commit(&base, staged)?;
        Ok(table_id)
    }

    /// Publishes a routine provided by a server component. System routines
    /// are not persisted and must be registered again after every open.
    pub fn register_system_routine(
        &self,
        session: &Session,
        mut routine: RoutineDef,
    ) -> Result<(), SchemataError> {
        self.require_internal(session, &routine.name.schema)?;
        routine.system = true;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        let replace = base.routine(&routine.name).is_some_and(|r| r.system);
        let schema = routine.name.schema.clone();
        let next = base.merge_routine(routine, replace)?;
        self.commit(
            &base,
            Staged::new("register_system_routine", &schema, next).memory_only(),
        )?;
        Ok(())
    }

    pub fn unregister_system_routine(&self, session: &Session, name: &TableName) -> Result<(), SchemataError> {
        self.require_internal(session, &name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        if !base.routine(name).is_some_and(|r| r.system) {
            return Err(SchemataError::missing(ObjectKind::Routine, name));
        }
        let next = base.clone_selected(&WithoutNamed::Routine(name.clone()));
        self.commit(
            &base,
            Staged::new("unregister_system_routine", &name.schema, next).memory_only(),
        )?;
        Ok(())
    }

    fn merge_jar(&self, session: &Session, jar: JarDef, replace: bool) -> Result<(), SchemataError> {
        self.authorize(session, &jar.name.schema)?;
        let _state = self.ddl.lock();
        let base = self.published.snapshot();
        let schema = jar.name.schema.clone();
        let verb = if replace { "replace_jar" } else { "create_jar" };
        let next = base.merge_jar(jar, replace)?;
        self.commit(&base, Staged::new(verb, &schema, next))?;
        Ok(())
    }

    /// Versions, persists and publishes a staged catalog, then reclaims the
    /// trees it no longer references. Must run under the DDL lock.
    fn commit(&self, base: &SchemaCatalog, staged: Staged) -> Result<Arc<SchemaCatalog>, SchemataError> {
        let generation = base.generation() + 1;
        let mut catalog = staged.catalog.with_generation(generation);
        let mut versions = Vec::new();
        for table_id in &staged.created {
            if let Some(table) = catalog.table(*table_id) {
                versions.push((*table_id, None, table.version));
            }
        }
        for table_id in &staged.bumped {
            if staged.created.contains(table_id) || catalog.table(*table_id).is_none() {
                continue;
            }
            let (expected, new) = self.ledger.next_version(*table_id);
            catalog = catalog.with_table_version(*table_id, new);
            versions.push((*table_id, expected, new));
        }

        if staged.persist {
            self.persist(&catalog)?;
        }
        for (table_id, expected, new) in versions {
            self.ledger.advance(table_id, expected, new)?;
        }
        let published = self.published.publish(base.generation(), catalog)?;
        info!(
            generation,
            verb = staged.verb,
            schema = %staged.schema,
            bumped = staged.bumped.len(),
            persisted = staged.persist,
            "published catalog"
        );
        self.reclaim_trees(base, &published);
        Ok(published)
    }

    fn persist(&self, catalog: &SchemaCatalog) -> Result<(), SchemataError> {
        let stored = catalog.clone_selected(&PersistentOnly);
        let bytes = CatalogEnvelope::seal(&stored)?.to_bytes()?;
        let limit = self.config.max_catalog_bytes;
        if limit > 0 && bytes.len() > limit {
            return Err(SchemataError::CatalogTooLarge {
                size: bytes.len(),
                limit,
            });
        }
        let handle = self
            .mapping
            .resolve(&self.config.catalog_schema, &self.config.catalog_tree_name)?;
        let mut tx = self.mapping.engine().begin()?;
        tx.put(handle.tree(), CATALOG_KEY, &bytes);
        tx.commit()
    }

    /// Removes trees referenced by `base` but not by `next`. Failures leave
    /// an orphaned tree behind and are only logged: the catalog change has
    /// already been published.
    fn reclaim_trees(&self, base: &SchemaCatalog, next: &SchemaCatalog) {
        let live = next.tree_names();
        let mut seen = HashSet::new();
        for tree in physical_trees(base) {
            if live.contains(&tree.tree_name) || !seen.insert(tree.tree_name.clone()) {
                continue;
            }
            match self.mapping.remove_tree(&tree) {
                Ok(removed) => debug!(schema = %tree.schema, tree = %tree.tree_name, removed, "reclaimed tree"),
                Err(err) => warn!(
                    schema = %tree.schema,
                    tree = %tree.tree_name,
                    error = %err,
                    "orphaned tree after catalog publication"
                ),
            }
        }
    }

    fn authorize(&self, session: &Session, schema: &str) -> Result<(), SchemataError> {
        let caller = session.caller();
        if caller.is_internal_system() {
            return Ok(());
        }
        if is_protected_schema(schema) {
            return Err(SchemataError::ProtectedSchemaDdl {
                schema: schema.to_string(),
            });
        }
        if !self.access.is_accessible(caller, schema) {
            return Err(SchemataError::AccessDenied {
                schema: schema.to_string(),
                caller: caller.caller_id.clone(),
            });
        }
        Ok(())
    }

    fn require_internal(&self, session: &Session, schema: &str) -> Result<(), SchemataError> {
        if !session.caller().is_internal_system() {
            return Err(SchemataError::ProtectedSchemaDdl {
                schema: schema.to_string(),
            });
        }
        if !is_protected_schema(schema) {
            return Err(SchemataError::Validation(format!(
                "system objects must live in a protected schema, not {schema}"
            )));
        }
        Ok(())
    }

    fn is_internal(&self, session: &Session, schema: &str) -> bool {
        session.caller().is_internal_system() && is_protected_schema(schema)
    }

    /// Tables of one group, and a renamed table, keep using one tree, so
    /// their schemas must resolve to the same volume.
    fn require_same_volume(&self, left: &str, right: &str) -> Result<(), SchemataError> {
        if left == right {
            return Ok(());
        }
        let left_volume = self.mapping.volume_for(left)?;
        let right_volume = self.mapping.volume_for(right)?;
        if left_volume != right_volume {
            return Err(SchemataError::Unsupported(format!(
                "schemas {left} and {right} map to different volumes ({left_volume}, {right_volume})"
            )));
        }
        Ok(())
    }
}

/// Every tree `catalog` references, with the schema used to resolve it.
fn physical_trees(catalog: &SchemaCatalog) -> Vec<TreeRef> {
    let mut out = Vec::new();
    for table in catalog.tables() {
        if !table.memory && !table.tree_name.is_empty() {
            out.push(TreeRef::new(table.name.schema.clone(), table.tree_name.clone()));
        }
    }
    for index in catalog.indexes() {
        if let Some(table) = catalog.table(index.table_id) {
            out.push(TreeRef::new(table.name.schema.clone(), index.tree_name.clone()));
        }
    }
    for sequence in catalog.sequences() {
        out.push(TreeRef::new(
            sequence.name.schema.clone(),
            sequence.tree_name.clone(),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{DropBehavior, MemoryTableFactory, SchemaManager};
    use crate::catalog::schema::{JarDef, RoutineDef, SequenceOptions, TableName, ViewDef};
    use crate::catalog::types::{ColumnType, Row, Value};
    use crate::config::SchemataConfig;
    use crate::declarative::{IndexSpec, TableChange, TableSpec};
    use crate::error::{ErrorCode, SchemataError};
    use crate::permission::{AllowAll, CallerContext, GrantTable, Permission};
    use crate::session::Session;
    use crate::storage::engine::StorageEngine;
    use crate::storage::memory::MemoryEngine;
    use std::sync::Arc;

    fn manager_with(engine: Arc<MemoryEngine>, config: SchemataConfig) -> SchemaManager {
        SchemaManager::open(config, engine, Arc::new(AllowAll)).expect("open")
    }

    fn manager() -> (SchemaManager, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        (manager_with(Arc::clone(&engine), SchemataConfig::default()), engine)
    }

    fn user() -> Session {
        Session::new(CallerContext::new("alice"))
    }

    fn customers() -> TableSpec {
        TableSpec::new("s", "customers")
            .column("cid", ColumnType::Integer, false)
            .column("name", ColumnType::Text, true)
            .primary_key(&["cid"])
    }

    fn orders() -> TableSpec {
        TableSpec::new("s", "orders")
            .column("cid", ColumnType::Integer, false)
            .column("oid", ColumnType::Integer, false)
            .primary_key(&["oid"])
            .join(TableName::new("s", "customers"), &[("cid", "cid")])
    }

    #[derive(Debug)]
    struct Fixed;

    impl MemoryTableFactory for Fixed {
        fn scan(&self, _session: &Session) -> Result<Vec<Row>, SchemataError> {
            Ok(vec![Row::from_values(vec![Value::Integer(1)])])
        }
    }

    #[test]
    fn create_publishes_new_generation_with_version_one() {
        let (manager, _) = manager();
        let before = manager.catalog();
        let id = manager.create_table(&user(), customers()).expect("create");
        let after = manager.catalog();
        assert_eq!(before.generation() + 1, after.generation());
        assert!(before.table(id).is_none());
        assert_eq!(after.table(id).map(|t| t.version), Some(1));
        assert_eq!(manager.ledger().get(id), Some(1));
        assert!(!manager.has_table_changed(&after, id));
        assert!(manager.has_table_changed(&before, id));
    }

    #[test]
    fn joining_a_child_bumps_the_parent() {
        let (manager, _) = manager();
        let session = user();
        let cid = manager.create_table(&session, customers()).expect("customers");
        let snapshot = manager.catalog();
        manager.create_table(&session, orders()).expect("orders");
        assert_eq!(manager.ledger().get(cid), Some(2));
        assert!(manager.has_table_changed(&snapshot, cid));
    }

    #[test]
    fn restrict_drop_with_child_changes_nothing() {
        let (manager, _) = manager();
        let session = user();
        let cid = manager.create_table(&session, customers()).expect("customers");
        let oid = manager.create_table(&session, orders()).expect("orders");
        let before = manager.catalog();
        let err = manager
            .drop_table(&session, &TableName::new("s", "customers"), DropBehavior::Restrict)
            .expect_err("child join");
        assert_eq!(err.code(), ErrorCode::ReferencedTable);
        assert_eq!(manager.catalog().generation(), before.generation());
        assert_eq!(manager.ledger().get(cid), Some(2));
        assert_eq!(manager.ledger().get(oid), Some(1));

        let err = manager
            .drop_table(&session, &TableName::new("s", "customers"), DropBehavior::Cascade)
            .expect_err("cascade");
        assert_eq!(err.code(), ErrorCode::Unsupported);
    }

    #[test]
    fn dropping_the_whole_group_removes_its_tree() {
        let (manager, engine) = manager();
        let session = user();
        manager.create_table(&session, customers()).expect("customers");
        manager.create_table(&session, orders()).expect("orders");
        let catalog = manager.catalog();
        let table = catalog
            .table_by_name(&TableName::new("s", "customers"))
            .expect("table");
        let handle = manager
            .mapping()
            .resolve(&table.name.schema, &table.tree_name)
            .expect("resolve");
        manager
            .drop_tables(
                &session,
                &[TableName::new("s", "orders"), TableName::new("s", "customers")],
            )
            .expect("drop group");
        assert!(manager.tree_names().is_empty());
        assert!(!handle.is_valid());
        assert!(!engine.tree_exists(handle.tree()));
    }

    #[test]
    fn rename_does_not_bump_or_move_storage() {
        let (manager, _) = manager();
        let session = user();
        let id = manager.create_table(&session, customers()).expect("create");
        let trees = manager.tree_names();
        manager
            .rename_table(
                &session,
                &TableName::new("s", "customers"),
                &TableName::new("s", "clients"),
            )
            .expect("rename");
        assert_eq!(manager.ledger().get(id), Some(1));
        assert_eq!(manager.tree_names(), trees);
    }

    #[test]
    fn rename_across_volumes_is_unsupported() {
        let engine = Arc::new(MemoryEngine::new());
        let config = SchemataConfig::default()
            .with_tree_space("a", "a*", "vol_a")
            .with_tree_space("b", "b*", "vol_b");
        let manager = manager_with(engine, config);
        let session = user();
        manager
            .create_table(
                &session,
                TableSpec::new("alpha", "t")
                    .column("id", ColumnType::Integer, false)
                    .primary_key(&["id"]),
            )
            .expect("create");
        let err = manager
            .rename_table(
                &session,
                &TableName::new("alpha", "t"),
                &TableName::new("beta", "t"),
            )
            .expect_err("cross volume");
        assert_eq!(err.code(), ErrorCode::Unsupported);
    }

    #[test]
    fn alter_and_index_changes_bump_versions() {
        let (manager, _) = manager();
        let session = user();
        let cid = manager.create_table(&session, customers()).expect("create");
        manager
            .create_indexes(
                &session,
                vec![IndexSpec::new(TableName::new("s", "customers"), "by_name", &["name"])],
            )
            .expect("index");
        assert_eq!(manager.ledger().get(cid), Some(2));
        manager
            .drop_indexes(&session, &TableName::new("s", "customers"), &["by_name".into()])
            .expect("drop index");
        assert_eq!(manager.ledger().get(cid), Some(3));
        let widened = customers().column("email", ColumnType::Text, true);
        manager
            .alter_table(
                &session,
                vec![TableChange::new(TableName::new("s", "customers"), widened)],
            )
            .expect("alter");
        assert_eq!(manager.ledger().get(cid), Some(4));
        assert_eq!(manager.catalog().table(cid).map(|t| t.columns.len()), Some(3));
        let err = manager
            .drop_indexes(&session, &TableName::new("s", "customers"), &["by_name".into()])
            .expect_err("gone");
        assert_eq!(err.code(), ErrorCode::NoSuchIndex);
    }

    #[test]
    fn protected_schema_and_access_policy_are_checked_first() {
        let engine = Arc::new(MemoryEngine::new());
        let grants = GrantTable::new().grant("alice", Permission::SchemaDdl { schema: "s".into() });
        let manager = SchemaManager::open(SchemataConfig::default(), engine, Arc::new(grants))
            .expect("open");
        let err = manager
            .create_table(
                &user(),
                TableSpec::new("sys", "t")
                    .column("id", ColumnType::Integer, false)
                    .primary_key(&["id"]),
            )
            .expect_err("protected");
        assert_eq!(err.code(), ErrorCode::ProtectedSchemaDdl);
        let err = manager
            .create_table(
                &user(),
                TableSpec::new("other", "t")
                    .column("id", ColumnType::Integer, false)
                    .primary_key(&["id"]),
            )
            .expect_err("denied");
        assert_eq!(err.code(), ErrorCode::AccessDenied);
        manager.create_table(&user(), customers()).expect("granted");
    }

    #[test]
    fn views_sequences_routines_and_jars_guard_their_dependents() {
        let (manager, _) = manager();
        let session = user();
        manager
            .create_table(
                &session,
                TableSpec::new("s", "t")
                    .identity_column("id", SequenceOptions::default())
                    .primary_key(&["id"]),
            )
            .expect("table");
        let err = manager
            .drop_sequence(&session, &TableName::new("s", "t_id_seq"))
            .expect_err("identity");
        assert_eq!(err.code(), ErrorCode::ReferencedSequence);

        let view = ViewDef {
            name: TableName::new("s", "v"),
            definition: "select * from s.t".into(),
            references: vec![TableName::new("s", "t")],
        };
        manager.create_view(&session, view).expect("view");
        let err = manager
            .drop_table(&session, &TableName::new("s", "t"), DropBehavior::Restrict)
            .expect_err("view reference");
        assert_eq!(err.code(), ErrorCode::ReferencedTable);
        manager.drop_view(&session, &TableName::new("s", "v")).expect("drop view");
        manager
            .drop_table(&session, &TableName::new("s", "t"), DropBehavior::Restrict)
            .expect("drop table");
        assert!(manager.catalog().sequence(&TableName::new("s", "t_id_seq")).is_none());

        let jar = JarDef {
            name: TableName::new("s", "j"),
            url: "file:/j.jar".into(),
        };
        manager.create_jar(&session, jar.clone()).expect("jar");
        manager
            .create_routine(
                &session,
                RoutineDef {
                    name: TableName::new("s", "r"),
                    language: "java".into(),
                    definition: "a.B.c".into(),
                    jar: Some(jar.name.clone()),
                    system: true,
                },
                false,
            )
            .expect("routine");
        assert!(
            manager
                .catalog()
                .routine(&TableName::new("s", "r"))
                .is_some_and(|r| !r.system)
        );
        let err = manager.drop_jar(&session, &jar.name).expect_err("referenced");
        assert_eq!(err.code(), ErrorCode::ReferencedJar);
        manager.drop_routine(&session, &TableName::new("s", "r")).expect("drop routine");
        manager
            .replace_jar(
                &session,
                JarDef {
                    url: "file:/j2.jar".into(),
                    ..jar.clone()
                },
            )
            .expect("replace");
        manager.drop_jar(&session, &jar.name).expect("drop jar");
    }

    #[test]
    fn memory_objects_are_published_but_not_persisted() {
        let engine = Arc::new(MemoryEngine::new());
        let manager = manager_with(Arc::clone(&engine), SchemataConfig::default());
        let system = Session::system();
        let spec = TableSpec::new("information_schema", "tables")
            .column("id", ColumnType::Integer, false);
        manager
            .register_memory_table(&system, spec.clone(), Arc::new(Fixed))
            .expect("register");
        manager
            .register_system_routine(
                &system,
                RoutineDef {
                    name: TableName::new("sys", "now"),
                    language: "rust".into(),
                    definition: "now".into(),
                    jar: None,
                    system: false,
                },
            )
            .expect("routine");
        let name = TableName::new("information_schema", "tables");
        let factory = manager.memory_table_factory(&name).expect("factory");
        assert_eq!(factory.scan(&system).expect("scan").len(), 1);
        assert!(manager.catalog().table_by_name(&name).is_some_and(|t| t.memory));

        manager.create_table(&user(), customers()).expect("persisting ddl");
        let reopened = manager_with(engine, SchemataConfig::default());
        assert!(reopened.catalog().table_by_name(&name).is_none());
        assert!(reopened.catalog().routine(&TableName::new("sys", "now")).is_none());
        assert!(
            reopened
                .catalog()
                .table_by_name(&TableName::new("s", "customers"))
                .is_some()
        );

        let err = manager
            .register_memory_table(&user(), spec, Arc::new(Fixed))
            .expect_err("not internal");
        assert_eq!(err.code(), ErrorCode::ProtectedSchemaDdl);
        manager.unregister_memory_table(&system, &name).expect("unregister");
        assert!(manager.memory_table_factory(&name).is_none());
        manager
            .unregister_system_routine(&system, &TableName::new("sys", "now"))
            .expect("unregister routine");
    }

    #[test]
    fn stored_system_table_registration_is_version_checked() {
        let (manager, _) = manager();
        let system = Session::system();
        let spec = TableSpec::new("sys", "jobs")
            .column("id", ColumnType::Integer, false)
            .primary_key(&["id"]);
        let id = manager
            .register_stored_system_table(&system, spec.clone(), 3)
            .expect("register");
        let generation = manager.catalog().generation();
        assert_eq!(
            manager
                .register_stored_system_table(&system, spec.clone(), 3)
                .expect("same version"),
            id
        );
        assert_eq!(manager.catalog().generation(), generation);
        let err = manager
            .register_stored_system_table(&system, spec, 4)
            .expect_err("version mismatch");
        assert_eq!(err.code(), ErrorCode::TableVersionMismatch);
        assert_eq!(manager.ledger().get(id), Some(3));
    }

    #[test]
    fn failed_commit_leaves_catalog_and_ledger_untouched() {
        let (manager, engine) = manager();
        let session = user();
        let before = manager.catalog();
        engine.fail_next_commit();
        let err = manager.create_table(&session, customers()).expect_err("commit");
        assert_eq!(err.code(), ErrorCode::Storage);
        assert_eq!(manager.catalog().generation(), before.generation());
        assert!(manager.ledger().is_empty());
        manager.create_table(&session, customers()).expect("retry succeeds");
    }

    #[test]
    fn catalog_size_cap_rejects_oversized_catalogs() {
        let engine = Arc::new(MemoryEngine::new());
        let config = SchemataConfig {
            max_catalog_bytes: 64,
            ..SchemataConfig::default()
        };
        let manager = manager_with(engine, config);
        let err = manager.create_table(&user(), customers()).expect_err("too large");
        assert_eq!(err.code(), ErrorCode::CatalogTooLarge);
        assert_eq!(manager.catalog().generation(), 0);
    }

    #[test]
    fn sequences_draw_from_engine_counter() {
        let (manager, _) = manager();
        let name = TableName::new("s", "ids");
        let options = SequenceOptions {
            start: 1,
            increment: 1,
            min: 1,
            max: 3,
            cycle: true,
        };
        manager.create_sequence(&user(), &name, options).expect("sequence");
        let values: Vec<i64> = (0..6)
            .map(|_| manager.next_sequence_value(&name).expect("next"))
            .collect();
        assert_eq!(values, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(manager.current_sequence_value(&name).expect("current"), 3);
    }
}
