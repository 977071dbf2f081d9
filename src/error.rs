use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
    Sequence,
    Routine,
    Jar,
    Index,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Table => write!(f, "table"),
            ObjectKind::View => write!(f, "view"),
            ObjectKind::Sequence => write!(f, "sequence"),
            ObjectKind::Routine => write!(f, "routine"),
            ObjectKind::Jar => write!(f, "jar"),
            ObjectKind::Index => write!(f, "index"),
        }
    }
}

/// Coarse failure taxonomy. Callers branch on this to decide between
/// reporting, retrying the surrounding transaction, or raising a defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Corruption,
    RangeExceeded,
    ResourceExhausted,
    Cancelled,
    InvariantViolation,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    IntegrityError,
    Unsupported,
    DuplicateTable,
    DuplicateView,
    DuplicateSequence,
    DuplicateRoutine,
    DuplicateJar,
    DuplicateIndex,
    NoSuchTable,
    UndefinedView,
    NoSuchSequence,
    NoSuchRoutine,
    NoSuchJar,
    NoSuchIndex,
    ProtectedSchemaDdl,
    AccessDenied,
    JoinToProtectedTable,
    InternalJoinToUserTable,
    ReferencedTable,
    ReferencedJar,
    ReferencedSequence,
    TableVersionMismatch,
    NoVolumeForSchema,
    RowDataCorruption,
    CatalogCorruption,
    SequenceLimitExceeded,
    Storage,
    TreeRemoved,
    CatalogTooLarge,
    QueryCanceled,
    QueryTimeout,
    VersionConflict,
    StaleCatalog,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Io => "io",
            ErrorCode::Encode => "encode",
            ErrorCode::Decode => "decode",
            ErrorCode::Validation => "validation",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::IntegrityError => "integrity_error",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::DuplicateTable => "duplicate_table",
            ErrorCode::DuplicateView => "duplicate_view",
            ErrorCode::DuplicateSequence => "duplicate_sequence",
            ErrorCode::DuplicateRoutine => "duplicate_routine",
            ErrorCode::DuplicateJar => "duplicate_jar",
            ErrorCode::DuplicateIndex => "duplicate_index",
            ErrorCode::NoSuchTable => "no_such_table",
            ErrorCode::UndefinedView => "undefined_view",
            ErrorCode::NoSuchSequence => "no_such_sequence",
            ErrorCode::NoSuchRoutine => "no_such_routine",
            ErrorCode::NoSuchJar => "no_such_jar",
            ErrorCode::NoSuchIndex => "no_such_index",
            ErrorCode::ProtectedSchemaDdl => "protected_schema_ddl",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::JoinToProtectedTable => "join_to_protected_table",
            ErrorCode::InternalJoinToUserTable => "internal_join_to_user_table",
            ErrorCode::ReferencedTable => "referenced_table",
            ErrorCode::ReferencedJar => "referenced_jar",
            ErrorCode::ReferencedSequence => "referenced_sequence",
            ErrorCode::TableVersionMismatch => "table_version_mismatch",
            ErrorCode::NoVolumeForSchema => "no_volume_for_schema",
            ErrorCode::RowDataCorruption => "row_data_corruption",
            ErrorCode::CatalogCorruption => "catalog_corruption",
            ErrorCode::SequenceLimitExceeded => "sequence_limit_exceeded",
            ErrorCode::Storage => "storage",
            ErrorCode::TreeRemoved => "tree_removed",
            ErrorCode::CatalogTooLarge => "catalog_too_large",
            ErrorCode::QueryCanceled => "query_canceled",
            ErrorCode::QueryTimeout => "query_timeout",
            ErrorCode::VersionConflict => "version_conflict",
            ErrorCode::StaleCatalog => "stale_catalog",
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{kind} '{name}' already exists")]
    Duplicate { kind: ObjectKind, name: String },
    #[error("{kind} '{name}' does not exist")]
    Missing { kind: ObjectKind, name: String },
    #[error("DDL on protected schema '{schema}' is not allowed")]
    ProtectedSchemaDdl { schema: String },
    #[error("schema '{schema}' is not accessible to caller '{caller}'")]
    AccessDenied { schema: String, caller: String },
    #[error("table '{child}' cannot join protected table '{parent}'")]
    JoinToProtectedTable { child: String, parent: String },
    #[error("internal table '{child}' cannot join user table '{parent}'")]
    InternalJoinToUserTable { child: String, parent: String },
    #[error("table '{table}' is referenced by '{referenced_by}'")]
    ReferencedTable { table: String, referenced_by: String },
    #[error("jar '{jar}' is referenced by routine '{routine}'")]
    ReferencedJar { jar: String, routine: String },
    #[error("sequence '{sequence}' is referenced by column '{column}'")]
    ReferencedSequence { sequence: String, column: String },
    #[error("system table '{table}' is registered at version {existing}, requested {requested}")]
    TableVersionMismatch {
        table: String,
        existing: u32,
        requested: u32,
    },
    #[error("no tree space maps schema '{schema}' to a volume")]
    NoVolumeForSchema { schema: String },
    #[error("corrupt row data at key {key}: {reason}")]
    RowDataCorruption { key: String, reason: String },
    #[error("catalog corruption: {0}")]
    CatalogCorruption(String),
    #[error("sequence '{sequence}' exceeded its range with value {value}")]
    SequenceLimitExceeded { sequence: String, value: i128 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("tree '{tree}' has been removed")]
    TreeRemoved { tree: String },
    #[error("serialized catalog is {size} bytes, limit is {limit}")]
    CatalogTooLarge { size: usize, limit: usize },
    #[error("query canceled")]
    QueryCanceled,
    #[error("query timeout")]
    QueryTimeout,
    #[error("table {table_id} version ledger expected {expected:?}, found {found:?}")]
    VersionConflict {
        table_id: u32,
        expected: Option<u32>,
        found: Option<u32>,
    },
    #[error("catalog generation {base} was superseded by {current}")]
    StaleCatalog { base: u64, current: u64 },
}

impl SchemataError {
    pub fn duplicate(kind: ObjectKind, name: impl std::fmt::Display) -> Self {
        SchemataError::Duplicate {
            kind,
            name: name.to_string(),
        }
    }

    pub fn missing(kind: ObjectKind, name: impl std::fmt::Display) -> Self {
        SchemataError::Missing {
            kind,
            name: name.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SchemataError::Io(_) => ErrorCode::Io,
            SchemataError::Encode(_) => ErrorCode::Encode,
            SchemataError::Decode(_) => ErrorCode::Decode,
            SchemataError::Validation(_) => ErrorCode::Validation,
            SchemataError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            SchemataError::IntegrityError { .. } => ErrorCode::IntegrityError,
            SchemataError::Unsupported(_) => ErrorCode::Unsupported,
            SchemataError::Duplicate { kind, .. } => match kind {
                ObjectKind::Table => ErrorCode::DuplicateTable,
                ObjectKind::View => ErrorCode::DuplicateView,
                ObjectKind::Sequence => ErrorCode::DuplicateSequence,
                ObjectKind::Routine => ErrorCode::DuplicateRoutine,
                ObjectKind::Jar => ErrorCode::DuplicateJar,
                ObjectKind::Index => ErrorCode::DuplicateIndex,
            },
            SchemataError::Missing { kind, .. } => match kind {
                ObjectKind::Table => ErrorCode::NoSuchTable,
                ObjectKind::View => ErrorCode::UndefinedView,
                ObjectKind::Sequence => ErrorCode::NoSuchSequence,
                ObjectKind::Routine => ErrorCode::NoSuchRoutine,
                ObjectKind::Jar => ErrorCode::NoSuchJar,
                ObjectKind::Index => ErrorCode::NoSuchIndex,
            },
            SchemataError::ProtectedSchemaDdl { .. } => ErrorCode::ProtectedSchemaDdl,
            SchemataError::AccessDenied { .. } => ErrorCode::AccessDenied,
            SchemataError::JoinToProtectedTable { .. } => ErrorCode::JoinToProtectedTable,
            SchemataError::InternalJoinToUserTable { .. } => ErrorCode::InternalJoinToUserTable,
            SchemataError::ReferencedTable { .. } => ErrorCode::ReferencedTable,
            SchemataError::ReferencedJar { .. } => ErrorCode::ReferencedJar,
            SchemataError::ReferencedSequence { .. } => ErrorCode::ReferencedSequence,
            SchemataError::TableVersionMismatch { .. } => ErrorCode::TableVersionMismatch,
            SchemataError::NoVolumeForSchema { .. } => ErrorCode::NoVolumeForSchema,
            SchemataError::RowDataCorruption { .. } => ErrorCode::RowDataCorruption,
            SchemataError::CatalogCorruption(_) => ErrorCode::CatalogCorruption,
            SchemataError::SequenceLimitExceeded { .. } => ErrorCode::SequenceLimitExceeded,
            SchemataError::Storage(_) => ErrorCode::Storage,
            SchemataError::TreeRemoved { .. } => ErrorCode::TreeRemoved,
            SchemataError::CatalogTooLarge { .. } => ErrorCode::CatalogTooLarge,
            SchemataError::QueryCanceled => ErrorCode::QueryCanceled,
            SchemataError::QueryTimeout => ErrorCode::QueryTimeout,
            SchemataError::VersionConflict { .. } => ErrorCode::VersionConflict,
            SchemataError::StaleCatalog { .. } => ErrorCode::StaleCatalog,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SchemataError::Validation(_)
            | SchemataError::Unsupported(_)
            | SchemataError::Duplicate { .. }
            | SchemataError::Missing { .. }
            | SchemataError::ProtectedSchemaDdl { .. }
            | SchemataError::AccessDenied { .. }
            | SchemataError::JoinToProtectedTable { .. }
            | SchemataError::InternalJoinToUserTable { .. }
            | SchemataError::ReferencedTable { .. }
            | SchemataError::ReferencedJar { .. }
            | SchemataError::ReferencedSequence { .. }
            | SchemataError::TableVersionMismatch { .. }
            | SchemataError::NoVolumeForSchema { .. }
            | SchemataError::InvalidConfig { .. } => ErrorClass::Validation,
            SchemataError::RowDataCorruption { .. }
            | SchemataError::CatalogCorruption(_)
            | SchemataError::IntegrityError { .. } => ErrorClass::Corruption,
            SchemataError::SequenceLimitExceeded { .. } => ErrorClass::RangeExceeded,
            SchemataError::Storage(_)
            | SchemataError::TreeRemoved { .. }
            | SchemataError::CatalogTooLarge { .. } => ErrorClass::ResourceExhausted,
            SchemataError::QueryCanceled | SchemataError::QueryTimeout => ErrorClass::Cancelled,
            SchemataError::VersionConflict { .. } | SchemataError::StaleCatalog { .. } => {
                ErrorClass::InvariantViolation
            }
            SchemataError::Io(_) | SchemataError::Encode(_) | SchemataError::Decode(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// True for failures that indicate a bug in DDL serialization rather
    /// than a user-facing condition.
    pub fn is_defect(&self) -> bool {
        self.class() == ErrorClass::InvariantViolation
    }
}
