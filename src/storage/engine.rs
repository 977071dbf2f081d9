use crate::error::SchemataError;
use serde::{Deserialize, Serialize};
use std::ops::Bound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u64);

/// Engine-assigned identity of one physical tree. Ids are never reused, so
/// a removed tree cannot be confused with a later tree of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId {
    pub volume: VolumeId,
    pub id: u64,
}

impl std::fmt::Display for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.volume.0, self.id)
    }
}

pub type Entry = (Vec<u8>, Vec<u8>);

/// The slice of an embedded B-tree engine this crate relies on. Engines
/// own pages, durability and locking; callers only name volumes and trees
/// and move bytes.
pub trait StorageEngine: Send + Sync + std::fmt::Debug {
    /// Opens, creating if needed, the volume addressed by `spec`.
    fn load_volume(&self, spec: &str) -> Result<VolumeId, SchemataError>;

    /// Creates a private volume that is never shared by name.
    fn create_temporary_volume(&self) -> Result<VolumeId, SchemataError>;

    /// Closes a volume. Temporary volumes are destroyed with their trees.
    fn close_volume(&self, volume: VolumeId) -> Result<(), SchemataError>;

    fn open_tree(
        &self,
        volume: VolumeId,
        name: &str,
        create: bool,
    ) -> Result<Option<TreeId>, SchemataError>;

    fn remove_tree(&self, tree: TreeId) -> Result<(), SchemataError>;

    fn tree_exists(&self, tree: TreeId) -> bool;

    fn tree_names(&self, volume: VolumeId) -> Result<Vec<String>, SchemataError>;

    fn get(&self, tree: TreeId, key: &[u8]) -> Result<Option<Vec<u8>>, SchemataError>;

    fn put(&self, tree: TreeId, key: &[u8], value: &[u8]) -> Result<(), SchemataError>;

    fn remove(&self, tree: TreeId, key: &[u8]) -> Result<bool, SchemataError>;

    fn remove_all(&self, tree: TreeId) -> Result<(), SchemataError>;

    /// First entry strictly after (or at, for `Included`) `from`, in key order.
    fn next_entry(&self, tree: TreeId, from: Bound<&[u8]>) -> Result<Option<Entry>, SchemataError>;

    fn entry_count(&self, tree: TreeId) -> Result<usize, SchemataError>;

    /// Atomically adds `delta` to the tree's counter and returns the result.
    /// Counter updates are not transactional.
    fn increment_counter(&self, tree: TreeId, delta: i64) -> Result<i64, SchemataError>;

    fn counter_value(&self, tree: TreeId) -> Result<i64, SchemataError>;

    fn begin(&self) -> Result<Box<dyn EngineTransaction + '_>, SchemataError>;
}

/// Writes buffered until `commit`, which applies them atomically.
/// Dropping an uncommitted transaction rolls it back.
pub trait EngineTransaction {
    fn put(&mut self, tree: TreeId, key: &[u8], value: &[u8]);

    fn remove(&mut self, tree: TreeId, key: &[u8]);

    fn commit(self: Box<Self>) -> Result<(), SchemataError>;

    fn rollback(self: Box<Self>);
}
