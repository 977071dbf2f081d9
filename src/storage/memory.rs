use crate::error::SchemataError;
use crate::storage::engine::{Entry, EngineTransaction, StorageEngine, TreeId, VolumeId};
use im::OrdMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[derive(Debug, Clone, Default)]
struct TreeData {
    name: String,
    entries: OrdMap<Vec<u8>, Vec<u8>>,
    counter: i64,
}

#[derive(Debug, Clone, Default)]
struct VolumeData {
    spec: Option<String>,
    trees: HashMap<String, TreeId>,
}

#[derive(Debug, Default)]
struct EngineState {
    next_volume: u64,
    next_tree: u64,
    volumes_by_spec: HashMap<String, VolumeId>,
    volumes: HashMap<VolumeId, VolumeData>,
    trees: HashMap<TreeId, TreeData>,
}

impl EngineState {
    fn tree(&self, tree: TreeId) -> Result<&TreeData, SchemataError> {
        self.trees
            .get(&tree)
            .ok_or_else(|| SchemataError::Storage(format!("tree {tree} does not exist")))
    }

    fn tree_mut(&mut self, tree: TreeId) -> Result<&mut TreeData, SchemataError> {
        self.trees
            .get_mut(&tree)
            .ok_or_else(|| SchemataError::Storage(format!("tree {tree} does not exist")))
    }
}

/// In-process engine. Trees are ordered maps; transactions buffer writes
/// and apply them under one lock on commit.
#[derive(Debug)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    // -1 disables write fault injection.
    puts_before_failure: AtomicI64,
    fail_next_commit: AtomicBool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            puts_before_failure: AtomicI64::new(-1),
            fail_next_commit: AtomicBool::new(false),
        }
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `n` more direct puts succeed, then fails every put until
    /// `clear_faults` is called.
    pub fn fail_puts_after(&self, n: u32) {
        self.puts_before_failure
            .store(i64::from(n), Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.puts_before_failure.store(-1, Ordering::SeqCst);
        self.fail_next_commit.store(false, Ordering::SeqCst);
    }

    pub fn volume_exists(&self, volume: VolumeId) -> bool {
        self.state.lock().volumes.contains_key(&volume)
    }

    pub fn volume_spec(&self, volume: VolumeId) -> Option<String> {
        self.state
            .lock()
            .volumes
            .get(&volume)
            .and_then(|v| v.spec.clone())
    }

    pub fn temporary_volume_count(&self) -> usize {
        self.state
            .lock()
            .volumes
            .values()
            .filter(|v| v.spec.is_none())
            .count()
    }

    fn check_put_fault(&self) -> Result<(), SchemataError> {
        let result = self
            .puts_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                (left > 0).then(|| left - 1)
            });
        match result {
            Err(0) => Err(SchemataError::Storage("injected write failure".into())),
            _ => Ok(()),
        }
    }
}

impl StorageEngine for MemoryEngine {
    fn load_volume(&self, spec: &str) -> Result<VolumeId, SchemataError> {
        if spec.is_empty() {
            return Err(SchemataError::Storage("empty volume specification".into()));
        }
        let mut state = self.state.lock();
        if let Some(id) = state.volumes_by_spec.get(spec) {
            return Ok(*id);
        }
        state.next_volume += 1;
        let id = VolumeId(state.next_volume);
        state.volumes.insert(
            id,
            VolumeData {
                spec: Some(spec.to_string()),
                trees: HashMap::new(),
            },
        );
        state.volumes_by_spec.insert(spec.to_string(), id);
        Ok(id)
    }

    fn create_temporary_volume(&self) -> Result<VolumeId, SchemataError> {
        let mut state = self.state.lock();
        state.next_volume += 1;
        let id = VolumeId(state.next_volume);
        state.volumes.insert(id, VolumeData::default());
        Ok(id)
    }

    fn close_volume(&self, volume: VolumeId) -> Result<(), SchemataError> {
        let mut state = self.state.lock();
        let temporary = match state.volumes.get(&volume) {
            Some(data) => data.spec.is_none(),
            None => return Ok(()),
        };
        if temporary
            && let Some(data) = state.volumes.remove(&volume)
        {
            for tree in data.trees.values() {
                state.trees.remove(tree);
            }
        }
        Ok(())
    }

    fn open_tree(
        &self,
        volume: VolumeId,
        name: &str,
        create: bool,
    ) -> Result<Option<TreeId>, SchemataError> {
        let mut state = self.state.lock();
        let existing = state
            .volumes
            .get(&volume)
            .ok_or_else(|| SchemataError::Storage(format!("volume {} is not open", volume.0)))?
            .trees
            .get(name)
            .copied();
        if existing.is_some() || !create {
            return Ok(existing);
        }
        state.next_tree += 1;
        let tree = TreeId {
            volume,
            id: state.next_tree,
        };
        state.trees.insert(
            tree,
            TreeData {
                name: name.to_string(),
                ..TreeData::default()
            },
        );
        if let Some(data) = state.volumes.get_mut(&volume) {
            data.trees.insert(name.to_string(), tree);
        }
        Ok(Some(tree))
    }

    fn remove_tree(&self, tree: TreeId) -> Result<(), SchemataError> {
        let mut state = self.state.lock();
        let Some(data) = state.trees.remove(&tree) else {
            return Ok(());
        };
        if let Some(volume) = state.volumes.get_mut(&tree.volume) {
            volume.trees.remove(&data.name);
        }
        Ok(())
    }

    fn tree_exists(&self, tree: TreeId) -> bool {
        self.state.lock().trees.contains_key(&tree)
    }

    fn tree_names(&self, volume: VolumeId) -> Result<Vec<String>, SchemataError> {
        let state = self.state.lock();
        let data = state
            .volumes
            .get(&volume)
            .ok_or_else(|| SchemataError::Storage(format!("volume {} is not open", volume.0)))?;
        let mut names: Vec<String> = data.trees.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn get(&self, tree: TreeId, key: &[u8]) -> Result<Option<Vec<u8>>, SchemataError> {
        Ok(self.state.lock().tree(tree)?.entries.get(key).cloned())
    }

    fn put(&self, tree: TreeId, key: &[u8], value: &[u8]) -> Result<(), SchemataError> {
        self.check_put_fault()?;
        self.state
            .lock()
            .tree_mut(tree)?
            .entries
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, tree: TreeId, key: &[u8]) -> Result<bool, SchemataError> {
        Ok(self
            .state
            .lock()
            .tree_mut(tree)?
            .entries
            .remove(key)
            .is_some())
    }

    fn remove_all(&self, tree: TreeId) -> Result<(), SchemataError> {
        self.state.lock().tree_mut(tree)?.entries = OrdMap::new();
        Ok(())
    }

    fn next_entry(&self, tree: TreeId, from: Bound<&[u8]>) -> Result<Option<Entry>, SchemataError> {
        let state = self.state.lock();
        let start = from.map(|k| k.to_vec());
        Ok(state
            .tree(tree)?
            .entries
            .range((start, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn entry_count(&self, tree: TreeId) -> Result<usize, SchemataError> {
        Ok(self.state.lock().tree(tree)?.entries.len())
    }

    fn increment_counter(&self, tree: TreeId, delta: i64) -> Result<i64, SchemataError> {
        let mut state = self.state.lock();
        let data = state.tree_mut(tree)?;
        data.counter = data
            .counter
            .checked_add(delta)
            .ok_or_else(|| SchemataError::Storage(format!("counter overflow on tree {tree}")))?;
        Ok(data.counter)
    }

    fn counter_value(&self, tree: TreeId) -> Result<i64, SchemataError> {
        Ok(self.state.lock().tree(tree)?.counter)
    }

    fn begin(&self) -> Result<Box<dyn EngineTransaction + '_>, SchemataError> {
        Ok(Box::new(MemoryTransaction {
            engine: self,
            writes: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum BufferedWrite {
    Put(TreeId, Vec<u8>, Vec<u8>),
    Remove(TreeId, Vec<u8>),
}

struct MemoryTransaction<'a> {
    engine: &'a MemoryEngine,
    writes: Vec<BufferedWrite>,
}

impl EngineTransaction for MemoryTransaction<'_> {
    fn put(&mut self, tree: TreeId, key: &[u8], value: &[u8]) {
        self.writes
            .push(BufferedWrite::Put(tree, key.to_vec(), value.to_vec()));
    }

    fn remove(&mut self, tree: TreeId, key: &[u8]) {
        self.writes.push(BufferedWrite::Remove(tree, key.to_vec()));
    }

    fn commit(self: Box<Self>) -> Result<(), SchemataError> {
        if self.engine.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(SchemataError::Storage("injected commit failure".into()));
        }
        let mut state = self.engine.state.lock();
        for write in &self.writes {
            let tree = match write {
                BufferedWrite::Put(tree, ..) | BufferedWrite::Remove(tree, _) => *tree,
            };
            state.tree(tree)?;
        }
        for write in self.writes {
            match write {
                BufferedWrite::Put(tree, key, value) => {
                    state.tree_mut(tree)?.entries.insert(key, value);
                }
                BufferedWrite::Remove(tree, key) => {
                    state.tree_mut(tree)?.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}
