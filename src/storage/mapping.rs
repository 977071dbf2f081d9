use crate::catalog::schema::{SequenceDef, TableDef};
use crate::config::SchemataConfig;
use crate::error::SchemataError;
use crate::sequence::Sequence;
use crate::session::Session;
use crate::storage::engine::{StorageEngine, TreeId, VolumeId};
use crate::storage::tree_space::TreeSpaceRules;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Anything stored in a named tree of a schema's volume.
pub trait TreeLink {
    fn schema_name(&self) -> &str;
    fn tree_name(&self) -> &str;
}

impl TreeLink for TableDef {
    fn schema_name(&self) -> &str {
        &self.name.schema
    }

    fn tree_name(&self) -> &str {
        &self.tree_name
    }
}

impl TreeLink for SequenceDef {
    fn schema_name(&self) -> &str {
        &self.name.schema
    }

    fn tree_name(&self) -> &str {
        &self.tree_name
    }
}

/// Free-standing link, used for index trees and the catalog tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeRef {
    pub schema: String,
    pub tree_name: String,
}

impl TreeRef {
    pub fn new(schema: impl Into<String>, tree_name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            tree_name: tree_name.into(),
        }
    }
}

impl TreeLink for TreeRef {
    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn tree_name(&self) -> &str {
        &self.tree_name
    }
}

/// Resolved physical location of one tree. Shared by every cursor opened
/// on it; `invalidate` marks all of them stale at once.
#[derive(Debug)]
pub struct TreeHandle {
    schema: String,
    tree_name: String,
    volume: VolumeId,
    tree: TreeId,
    valid: AtomicBool,
}

impl TreeHandle {
    fn new(schema: &str, tree_name: &str, volume: VolumeId, tree: TreeId) -> Self {
        Self {
            schema: schema.to_string(),
            tree_name: tree_name.to_string(),
            volume,
            tree,
            valid: AtomicBool::new(true),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tree_name(&self) -> &str {
        &self.tree_name
    }

    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    pub fn tree(&self) -> TreeId {
        self.tree
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// Session-local position in a tree. Pooled per session and per tree and
/// never shared between sessions.
#[derive(Debug)]
pub struct TreeCursor {
    handle: Arc<TreeHandle>,
    engine: Arc<dyn StorageEngine>,
    key: Vec<u8>,
    value: Vec<u8>,
    positioned: bool,
}

impl TreeCursor {
    fn new(handle: Arc<TreeHandle>, engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            handle,
            engine,
            key: Vec::new(),
            value: Vec::new(),
            positioned: false,
        }
    }

    pub fn handle(&self) -> &Arc<TreeHandle> {
        &self.handle
    }

    pub fn tree(&self) -> TreeId {
        self.handle.tree
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid() && self.engine.tree_exists(self.handle.tree)
    }

    /// Clears position state so the cursor can be pooled.
    pub fn reset(&mut self) {
        self.key.clear();
        self.value.clear();
        self.positioned = false;
    }

    /// Positions on `key` and loads its value. Returns whether it exists.
    pub fn fetch(&mut self, key: &[u8]) -> Result<bool, SchemataError> {
        self.ensure_valid()?;
        self.key.clear();
        self.key.extend_from_slice(key);
        self.value.clear();
        self.positioned = true;
        match self.engine.get(self.handle.tree, key)? {
            Some(value) => {
                self.value = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn store(&mut self, key: &[u8], value: &[u8]) -> Result<(), SchemataError> {
        self.ensure_valid()?;
        self.engine.put(self.handle.tree, key, value)?;
        self.key.clear();
        self.key.extend_from_slice(key);
        self.value.clear();
        self.value.extend_from_slice(value);
        self.positioned = true;
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<bool, SchemataError> {
        self.ensure_valid()?;
        self.engine.remove(self.handle.tree, key)
    }

    pub fn remove_all(&mut self) -> Result<(), SchemataError> {
        self.ensure_valid()?;
        self.reset();
        self.engine.remove_all(self.handle.tree)
    }

    /// Moves to the next key in tree order, starting from the first key
    /// when unpositioned. Returns false at the end.
    pub fn advance(&mut self) -> Result<bool, SchemataError> {
        self.ensure_valid()?;
        let from = if self.positioned {
            Bound::Excluded(self.key.as_slice())
        } else {
            Bound::Unbounded
        };
        match self.engine.next_entry(self.handle.tree, from)? {
            Some((key, value)) => {
                self.key = key;
                self.value = value;
                self.positioned = true;
                Ok(true)
            }
            None => {
                self.reset();
                Ok(false)
            }
        }
    }

    pub fn entry_count(&self) -> Result<usize, SchemataError> {
        self.ensure_valid()?;
        self.engine.entry_count(self.handle.tree)
    }

    fn ensure_valid(&self) -> Result<(), SchemataError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SchemataError::TreeRemoved {
                tree: self.handle.tree_name.clone(),
            })
        }
    }
}

/// A session's private temporary volume. Sorts hold strong references;
/// the volume is closed, and its trees destroyed, when the last one goes.
#[derive(Debug)]
pub struct TempVolume {
    engine: Arc<dyn StorageEngine>,
    volume: VolumeId,
    session_id: u64,
    next_tree: AtomicU64,
}

impl TempVolume {
    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    /// Creates a fresh tree inside the volume.
    pub fn create_tree(&self, prefix: &str) -> Result<Arc<TreeHandle>, SchemataError> {
        let name = format!("{prefix}{}", self.next_tree.fetch_add(1, Ordering::Relaxed));
        let tree = self
            .engine
            .open_tree(self.volume, &name, true)?
            .ok_or_else(|| SchemataError::Storage(format!("could not create temporary tree {name}")))?;
        Ok(Arc::new(TreeHandle::new("", &name, self.volume, tree)))
    }
}

impl Drop for TempVolume {
    fn drop(&mut self) {
        match self.engine.close_volume(self.volume) {
            Ok(()) => info!(
                session = self.session_id,
                volume = self.volume.0,
                "closed temporary volume"
            ),
            Err(err) => warn!(
                session = self.session_id,
                volume = self.volume.0,
                error = %err,
                "failed to close temporary volume"
            ),
        }
    }
}

#[derive(Debug, Default)]
struct VolumeOffsets {
    next: u32,
    by_volume: HashMap<VolumeId, u32>,
}

type HandleKey = (String, String);

/// Maps schema objects onto engine trees. Owns the tree-space rules, the
/// process-wide handle cache and the per-volume table id offsets.
#[derive(Debug)]
pub struct StorageMapping {
    engine: Arc<dyn StorageEngine>,
    rules: RwLock<TreeSpaceRules>,
    handles: Mutex<LruCache<HandleKey, Arc<TreeHandle>>>,
    offsets: Mutex<VolumeOffsets>,
    block_size: u32,
    max_pooled_cursors: usize,
    removal_epoch: AtomicU64,
}

impl StorageMapping {
    pub fn new(config: &SchemataConfig, engine: Arc<dyn StorageEngine>) -> Result<Self, SchemataError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_cached_trees).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            engine,
            rules: RwLock::new(TreeSpaceRules::from_config(config)),
            handles: Mutex::new(LruCache::new(capacity)),
            offsets: Mutex::new(VolumeOffsets::default()),
            block_size: config.max_tables_per_volume,
            max_pooled_cursors: config.max_pooled_cursors_per_tree,
            removal_epoch: AtomicU64::new(0),
        })
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Swaps the rule table and drops every cached handle, since cached
    /// resolutions may no longer hold.
    pub fn replace_rules(&self, rules: TreeSpaceRules) {
        *self.rules.write() = rules;
        self.handles.lock().clear();
    }

    pub fn volume_for(&self, schema: &str) -> Result<String, SchemataError> {
        self.rules.read().volume_for(schema)
    }

    /// Names of the trees present in every volume the rules map `schemas`
    /// or any schema-independent template to.
    pub fn existing_tree_names<'a, I>(&self, schemas: I) -> Result<BTreeSet<String>, SchemataError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let volumes = self.rules.read().known_volumes(schemas);
        let mut names = BTreeSet::new();
        for spec in volumes {
            let volume = self.engine.load_volume(&spec)?;
            names.extend(self.engine.tree_names(volume)?);
        }
        Ok(names)
    }

    /// Resolves `tree_name` in the volume mapped from `schema`, creating the
    /// tree if needed. Repeated calls return the same cached handle.
    pub fn resolve(&self, schema: &str, tree_name: &str) -> Result<Arc<TreeHandle>, SchemataError> {
        if tree_name.is_empty() {
            return Err(SchemataError::Validation(format!(
                "object in schema {schema} has no physical tree"
            )));
        }
        let key = (schema.to_string(), tree_name.to_string());
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&key)
            && handle.is_valid()
        {
            return Ok(Arc::clone(handle));
        }
        let spec = self.volume_for(schema)?;
        let volume = self.engine.load_volume(&spec)?;
        let tree = self
            .engine
            .open_tree(volume, tree_name, true)?
            .ok_or_else(|| SchemataError::Storage(format!("could not open tree {tree_name}")))?;
        let handle = Arc::new(TreeHandle::new(schema, tree_name, volume, tree));
        if let Some((evicted, _)) = handles.push(key.clone(), Arc::clone(&handle))
            && evicted != key
        {
            debug!(schema = %evicted.0, tree = %evicted.1, "evicted tree handle");
        }
        Ok(handle)
    }

    pub fn cached_tree_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn acquire_cursor(
        &self,
        session: &mut Session,
        link: &dyn TreeLink,
    ) -> Result<TreeCursor, SchemataError> {
        let handle = self.resolve(link.schema_name(), link.tree_name())?;
        Ok(self.acquire_handle_cursor(session, &handle))
    }

    /// Pops a pooled cursor for the handle's tree, or opens a new one.
    pub fn acquire_handle_cursor(&self, session: &mut Session, handle: &Arc<TreeHandle>) -> TreeCursor {
        self.purge_removed(session);
        let session_id = session.id();
        if let Some(pool) = session.cursor_pools.get_mut(&handle.tree) {
            while let Some(cursor) = pool.pop() {
                if cursor.is_valid() && Arc::ptr_eq(&cursor.handle, handle) {
                    debug!(session = session_id, tree = %handle.tree_name, "cursor pool hit");
                    return cursor;
                }
            }
        }
        debug!(session = session_id, tree = %handle.tree_name, "cursor pool miss");
        TreeCursor::new(Arc::clone(handle), Arc::clone(&self.engine))
    }

    /// Clears the cursor's position and returns it to the session pool.
    pub fn release_cursor(&self, session: &mut Session, mut cursor: TreeCursor) {
        if !cursor.is_valid() {
            return;
        }
        cursor.reset();
        let pool = session.cursor_pools.entry(cursor.tree()).or_default();
        if pool.len() < self.max_pooled_cursors {
            pool.push(cursor);
        }
    }

    /// Removes the physical tree and invalidates every handle and pooled
    /// cursor bound to it. Returns false when the tree did not exist.
    pub fn remove_tree(&self, link: &dyn TreeLink) -> Result<bool, SchemataError> {
        let schema = link.schema_name();
        let tree_name = link.tree_name();
        let key = (schema.to_string(), tree_name.to_string());
        if let Some(handle) = self.handles.lock().pop(&key) {
            handle.invalidate();
        }
        let spec = self.volume_for(schema)?;
        let volume = self.engine.load_volume(&spec)?;
        let removed = match self.engine.open_tree(volume, tree_name, false)? {
            Some(tree) => {
                self.engine.remove_tree(tree)?;
                true
            }
            None => false,
        };
        self.removal_epoch.fetch_add(1, Ordering::AcqRel);
        Ok(removed)
    }

    /// Removes a tree known only by handle, such as a sort tree.
    pub fn remove_handle_tree(&self, handle: &TreeHandle) -> Result<(), SchemataError> {
        handle.invalidate();
        {
            let mut handles = self.handles.lock();
            let key = (handle.schema.clone(), handle.tree_name.clone());
            if handles
                .peek(&key)
                .is_some_and(|cached| cached.tree == handle.tree)
            {
                handles.pop(&key);
            }
        }
        let result = if self.engine.tree_exists(handle.tree) {
            self.engine.remove_tree(handle.tree)
        } else {
            Ok(())
        };
        self.removal_epoch.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Table id offset for `volume`, allocated on first use in blocks of
    /// `max_tables_per_volume`. Offsets are never reused.
    pub fn id_offset_for(&self, volume: VolumeId) -> Result<u32, SchemataError> {
        let mut offsets = self.offsets.lock();
        if let Some(offset) = offsets.by_volume.get(&volume) {
            return Ok(*offset);
        }
        let offset = offsets.next;
        offsets.next = offset
            .checked_add(self.block_size)
            .ok_or_else(|| SchemataError::Storage("volume id offsets exhausted".into()))?;
        offsets.by_volume.insert(volume, offset);
        info!(volume = volume.0, offset, "allocated volume table id offset");
        Ok(offset)
    }

    /// Catalog table id to the id stored in rows of `volume`.
    pub fn ais_to_store(&self, volume: VolumeId, table_id: u32) -> Result<u32, SchemataError> {
        if table_id >= self.block_size {
            return Err(SchemataError::Validation(format!(
                "table id {table_id} exceeds the {} tables allowed per volume",
                self.block_size
            )));
        }
        Ok(self.id_offset_for(volume)? + table_id)
    }

    /// Stored id back to the catalog table id, if it belongs to `volume`.
    pub fn store_to_ais(&self, volume: VolumeId, stored: u32) -> Result<Option<u32>, SchemataError> {
        let offset = self.id_offset_for(volume)?;
        Ok(stored
            .checked_sub(offset)
            .filter(|id| *id < self.block_size))
    }

    /// Creates, or reuses, the session's temporary volume.
    pub fn temp_volume(&self, session: &mut Session) -> Result<Arc<TempVolume>, SchemataError> {
        if let Some(volume) = session.temp_volume.upgrade() {
            return Ok(volume);
        }
        let volume = self.engine.create_temporary_volume()?;
        info!(session = session.id(), volume = volume.0, "created temporary volume");
        let temp = Arc::new(TempVolume {
            engine: Arc::clone(&self.engine),
            volume,
            session_id: session.id(),
            next_tree: AtomicU64::new(1),
        });
        session.temp_volume = Arc::downgrade(&temp);
        Ok(temp)
    }

    /// Increments the sequence's raw counter and derives its next value.
    /// The counter is not rolled back when the value is out of range.
    pub fn sequence_next_value(&self, sequence: &SequenceDef) -> Result<i64, SchemataError> {
        let generator = Sequence::new(sequence.name.clone(), sequence.options)?;
        let handle = self.resolve(&sequence.name.schema, &sequence.tree_name)?;
        let raw = self.engine.increment_counter(handle.tree, 1)?;
        generator.next_value(raw)
    }

    pub fn sequence_current_value(&self, sequence: &SequenceDef) -> Result<i64, SchemataError> {
        let generator = Sequence::new(sequence.name.clone(), sequence.options)?;
        let handle = self.resolve(&sequence.name.schema, &sequence.tree_name)?;
        let raw = self.engine.counter_value(handle.tree)?;
        generator.current_value(raw)
    }

    fn purge_removed(&self, session: &mut Session) {
        let epoch = self.removal_epoch.load(Ordering::Acquire);
        if session.seen_removal_epoch == epoch {
            return;
        }
        session.cursor_pools.retain(|_, pool| {
            pool.retain(TreeCursor::is_valid);
            !pool.is_empty()
        });
        session.seen_removal_epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::{StorageMapping, TreeRef};
    use crate::catalog::schema::{SequenceDef, SequenceOptions, TableName};
    use crate::config::SchemataConfig;
    use crate::error::ErrorCode;
    use crate::session::Session;
    use crate::storage::engine::{StorageEngine, VolumeId};
    use crate::storage::memory::MemoryEngine;
    use std::sync::Arc;

    fn mapping(config: SchemataConfig) -> (Arc<MemoryEngine>, StorageMapping) {
        let engine = Arc::new(MemoryEngine::new());
        let mapping = StorageMapping::new(&config, engine.clone()).expect("mapping");
        (engine, mapping)
    }

    #[test]
    fn resolve_returns_cached_handle() {
        let (_engine, mapping) = mapping(SchemataConfig::default());
        let a = mapping.resolve("s", "s.t").expect("resolve");
        let b = mapping.resolve("s", "s.t").expect("resolve");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mapping.cached_tree_count(), 1);
    }

    #[test]
    fn handle_cache_is_bounded() {
        let config = SchemataConfig {
            max_cached_trees: 2,
            ..SchemataConfig::default()
        };
        let (_engine, mapping) = mapping(config);
        let first = mapping.resolve("s", "s.a").expect("resolve");
        mapping.resolve("s", "s.b").expect("resolve");
        mapping.resolve("s", "s.c").expect("resolve");
        assert_eq!(mapping.cached_tree_count(), 2);
        let again = mapping.resolve("s", "s.a").expect("resolve");
        assert!(!Arc::ptr_eq(&first, &again));
        assert_eq!(first.tree(), again.tree());
    }

    #[test]
    fn released_cursor_is_reused_with_cleared_state() {
        let (_engine, mapping) = mapping(SchemataConfig::default());
        let mut session = Session::system();
        let link = TreeRef::new("s", "s.t");
        let mut cursor = mapping.acquire_cursor(&mut session, &link).expect("acquire");
        cursor.store(b"k", b"v").expect("store");
        let tree = cursor.tree();
        mapping.release_cursor(&mut session, cursor);
        assert_eq!(session.pooled_cursor_count(tree), 1);
        let cursor = mapping.acquire_cursor(&mut session, &link).expect("acquire");
        assert!(cursor.key().is_empty());
        assert!(cursor.value().is_empty());
        assert_eq!(session.pooled_cursor_count(tree), 0);
    }

    #[test]
    fn pool_drops_cursors_beyond_cap() {
        let config = SchemataConfig {
            max_pooled_cursors_per_tree: 1,
            ..SchemataConfig::default()
        };
        let (_engine, mapping) = mapping(config);
        let mut session = Session::system();
        let link = TreeRef::new("s", "s.t");
        let a = mapping.acquire_cursor(&mut session, &link).expect("acquire");
        let b = mapping.acquire_cursor(&mut session, &link).expect("acquire");
        let tree = a.tree();
        mapping.release_cursor(&mut session, a);
        mapping.release_cursor(&mut session, b);
        assert_eq!(session.pooled_cursor_count(tree), 1);
    }

    #[test]
    fn removing_a_tree_invalidates_cursors_in_every_session() {
        let (_engine, mapping) = mapping(SchemataConfig::default());
        let mut one = Session::system();
        let mut two = Session::system();
        let link = TreeRef::new("s", "s.t");
        let pooled = mapping.acquire_cursor(&mut one, &link).expect("acquire");
        let tree = pooled.tree();
        mapping.release_cursor(&mut one, pooled);
        let mut held = mapping.acquire_cursor(&mut two, &link).expect("acquire");

        assert!(mapping.remove_tree(&link).expect("remove"));
        let err = held.store(b"k", b"v").expect_err("removed");
        assert_eq!(err.code(), ErrorCode::TreeRemoved);

        let fresh = mapping.acquire_cursor(&mut one, &link).expect("acquire");
        assert_ne!(fresh.tree(), tree);
        assert_eq!(one.pooled_cursor_count(tree), 0);
    }

    #[test]
    fn volume_offsets_are_disjoint_and_stable() {
        let (_engine, mapping) = mapping(SchemataConfig::default());
        let a = mapping.id_offset_for(VolumeId(7)).expect("offset");
        let b = mapping.id_offset_for(VolumeId(9)).expect("offset");
        assert_eq!(a, 0);
        assert_eq!(b, 100_000);
        assert_eq!(mapping.id_offset_for(VolumeId(7)).expect("offset"), a);
        let stored = mapping.ais_to_store(VolumeId(9), 12).expect("store id");
        assert_eq!(stored, 100_012);
        assert_eq!(mapping.store_to_ais(VolumeId(9), stored).expect("ais"), Some(12));
        assert_eq!(mapping.store_to_ais(VolumeId(9), 5).expect("ais"), None);
    }

    #[test]
    fn temp_volume_lives_while_referenced() {
        let (engine, mapping) = mapping(SchemataConfig::default());
        let mut session = Session::system();
        let first = mapping.temp_volume(&mut session).expect("temp");
        let second = mapping.temp_volume(&mut session).expect("temp");
        assert!(Arc::ptr_eq(&first, &second));
        let volume = first.volume();
        drop(first);
        assert!(engine.volume_exists(volume));
        drop(second);
        assert!(!engine.volume_exists(volume));
        assert!(!session.has_temp_volume());
    }

    #[test]
    fn sequence_values_come_from_the_engine_counter() {
        let (engine, mapping) = mapping(SchemataConfig::default());
        let seq = SequenceDef {
            name: TableName::new("s", "ids"),
            options: SequenceOptions {
                start: 10,
                increment: 5,
                min: 1,
                max: 20,
                cycle: false,
            },
            tree_name: "s.ids".into(),
        };
        assert_eq!(mapping.sequence_next_value(&seq).expect("next"), 10);
        assert_eq!(mapping.sequence_next_value(&seq).expect("next"), 15);
        assert_eq!(mapping.sequence_current_value(&seq).expect("current"), 15);
        assert_eq!(mapping.sequence_next_value(&seq).expect("next"), 20);
        let err = mapping.sequence_next_value(&seq).expect_err("exhausted");
        assert_eq!(err.code(), ErrorCode::SequenceLimitExceeded);
        let handle = mapping.resolve("s", "s.ids").expect("resolve");
        assert_eq!(engine.counter_value(handle.tree()).expect("counter"), 4);
    }
}
