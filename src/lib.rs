pub mod catalog;
pub mod config;
pub mod declarative;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod permission;
pub mod sequence;
pub mod session;
pub mod snapshot;
pub mod sort;
pub mod storage;
pub mod version_store;

pub use crate::catalog::schema::{
    ColumnDef, IndexDef, JarDef, RoutineDef, SequenceDef, SequenceOptions, TableDef, TableName,
    ViewDef,
};
pub use crate::catalog::types::{ColumnType, Row, Value};
pub use crate::catalog::{SchemaCatalog, is_protected_schema};
pub use crate::config::SchemataConfig;
pub use crate::declarative::{IndexSpec, TableChange, TableSpec};
pub use crate::error::{ErrorClass, ErrorCode, ObjectKind, SchemataError};
pub use crate::manager::{DdlOperation, DdlOutcome, DropBehavior, MemoryTableFactory, SchemaManager};
pub use crate::permission::{AccessPolicy, AllowAll, CallerContext, GrantTable, Permission};
pub use crate::sequence::Sequence;
pub use crate::session::{ExecutionContext, Session};
pub use crate::snapshot::PublishedCatalog;
pub use crate::sort::{ExternalSorter, SortColumn, SortOption, SortState, SortStorage, SortedRows};
pub use crate::storage::{
    EncodedKey, MemoryEngine, RowCodec, SortDirection, StorageEngine, StorageMapping, TreeCursor,
    TreeHandle, TreeRef,
};
pub use crate::version_store::TableVersionLedger;
