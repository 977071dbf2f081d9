pub mod encoded_key;
pub mod engine;
pub mod mapping;
pub mod memory;
pub mod row_codec;
pub mod tree_space;

pub use encoded_key::{EncodedKey, SortDirection};
pub use engine::{EngineTransaction, StorageEngine, TreeId, VolumeId};
pub use mapping::{StorageMapping, TempVolume, TreeCursor, TreeHandle, TreeLink, TreeRef};
pub use memory::MemoryEngine;
pub use row_codec::RowCodec;
pub use tree_space::{TreeSpaceRule, TreeSpaceRules};
