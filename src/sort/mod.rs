use crate::catalog::schema::ColumnDef;
use crate::catalog::types::Row;
use crate::config::SchemataConfig;
use crate::error::SchemataError;
use crate::session::{ExecutionContext, Session};
use crate::storage::encoded_key::{EncodedKey, SortDirection};
use crate::storage::mapping::{StorageMapping, TempVolume, TreeCursor, TreeHandle};
use crate::storage::row_codec::RowCodec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static NEXT_SORT_TREE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortState {
    Idle,
    Loading,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOption {
    /// Every input row appears in the output.
    PreserveDuplicates,
    /// Rows with equal sort keys collapse to the last one loaded.
    SuppressDuplicates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStorage {
    /// A tree in the session's shared temporary volume.
    TempVolume,
    /// A table-like tree in the sort schema's volume, destroyed on close.
    DedicatedTree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortColumn {
    pub field: usize,
    pub direction: SortDirection,
}

impl SortColumn {
    pub fn asc(field: usize) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: usize) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }
}

/// Disk-backed sort. Rows are written to a storage tree keyed by their
/// encoded sort key and read back in tree order.
#[derive(Debug)]
pub struct ExternalSorter<'m> {
    mapping: &'m StorageMapping,
    fields: Vec<ColumnDef>,
    ordering: Vec<SortColumn>,
    option: SortOption,
    storage: SortStorage,
    sort_schema: String,
    default_timeout: Option<Duration>,
}

impl<'m> ExternalSorter<'m> {
    pub fn new(
        mapping: &'m StorageMapping,
        config: &SchemataConfig,
        fields: Vec<ColumnDef>,
        ordering: Vec<SortColumn>,
        option: SortOption,
    ) -> Result<Self, SchemataError> {
        if ordering.is_empty() {
            return Err(SchemataError::Validation(
                "sort requires at least one ordering column".into(),
            ));
        }
        if let Some(bad) = ordering.iter().find(|c| c.field >= fields.len()) {
            return Err(SchemataError::Validation(format!(
                "sort column {} is outside the {} input fields",
                bad.field,
                fields.len()
            )));
        }
        let storage = if config.sort_in_temp_volume {
            SortStorage::TempVolume
        } else {
            SortStorage::DedicatedTree
        };
        Ok(Self {
            mapping,
            fields,
            ordering,
            option,
            storage,
            sort_schema: config.sort_schema.clone(),
            default_timeout: config.query_timeout,
        })
    }

    pub fn with_storage(mut self, storage: SortStorage) -> Self {
        self.storage = storage;
        self
    }

    /// A configured sorter owns no storage until `sort` runs.
    pub fn state(&self) -> SortState {
        SortState::Idle
    }

    /// Loads every input row, then hands back a cursor over the sorted
    /// tree. A failed or cancelled load leaves no rows behind.
    pub fn sort<I>(
        self,
        session: &mut Session,
        input: I,
        ctx: &ExecutionContext,
    ) -> Result<SortedRows<'m>, SchemataError>
    where
        I: IntoIterator<Item = Result<Row, SchemataError>>,
    {
        let ctx = match (ctx.deadline(), self.default_timeout) {
            (None, Some(timeout)) => ctx.clone().with_deadline(Instant::now() + timeout),
            _ => ctx.clone(),
        };
        let (handle, temp) = self.allocate(session)?;
        let mut rows = SortedRows {
            mapping: self.mapping,
            cursor: self.mapping.acquire_handle_cursor(session, &handle),
            handle,
            temp,
            fields: self.fields,
            state: SortState::Loading,
            loaded: 0,
        };
        if let Err(err) = load(&mut rows, &self.ordering, self.option, input, &ctx) {
            rows.abort();
            return Err(err);
        }
        debug!(rows = rows.loaded, tree = %rows.handle.tree_name(), "sort loaded");
        rows.state = SortState::Draining;
        Ok(rows)
    }

    fn allocate(
        &self,
        session: &mut Session,
    ) -> Result<(Arc<TreeHandle>, Option<Arc<TempVolume>>), SchemataError> {
        let n = NEXT_SORT_TREE.fetch_add(1, Ordering::Relaxed);
        match self.storage {
            SortStorage::TempVolume => {
                let temp = self.mapping.temp_volume(session)?;
                let handle = temp.create_tree("sort.")?;
                Ok((handle, Some(temp)))
            }
            SortStorage::DedicatedTree => {
                let name = format!("{}.#sort.{n}", self.sort_schema);
                let handle = self.mapping.resolve(&self.sort_schema, &name)?;
                Ok((handle, None))
            }
        }
    }
}

fn load<I>(
    rows: &mut SortedRows<'_>,
    ordering: &[SortColumn],
    option: SortOption,
    input: I,
    ctx: &ExecutionContext,
) -> Result<(), SchemataError>
where
    I: IntoIterator<Item = Result<Row, SchemataError>>,
{
    // Tie-breakers follow the first column so the key keeps one direction
    // run where possible.
    let tie_direction = ordering[0].direction;
    let mut counter: u64 = 0;
    for row in input {
        ctx.check()?;
        let row = row?;
        let mut key = EncodedKey::new();
        for column in ordering {
            let value = row.get(column.field).ok_or_else(|| {
                SchemataError::Validation(format!(
                    "row has {} values, sort needs field {}",
                    row.len(),
                    column.field
                ))
            })?;
            key.append(value, column.direction);
        }
        if option == SortOption::PreserveDuplicates {
            counter += 1;
            key.append_counter(counter, tie_direction);
        }
        let bytes = RowCodec::encode_fields(&row, &rows.fields, 0)?;
        rows.cursor.store(key.as_slice(), &bytes)?;
        rows.loaded += 1;
    }
    rows.cursor.reset();
    Ok(())
}

/// Sorted output of an `ExternalSorter`. Reads the sort tree in key order
/// and releases its storage when exhausted, closed or dropped.
#[derive(Debug)]
pub struct SortedRows<'m> {
    mapping: &'m StorageMapping,
    cursor: TreeCursor,
    handle: Arc<TreeHandle>,
    temp: Option<Arc<TempVolume>>,
    fields: Vec<ColumnDef>,
    state: SortState,
    loaded: u64,
}

impl SortedRows<'_> {
    pub fn state(&self) -> SortState {
        self.state
    }

    pub fn rows_loaded(&self) -> u64 {
        self.loaded
    }

    pub fn tree_name(&self) -> &str {
        self.handle.tree_name()
    }

    /// Destroys the sort tree. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), SchemataError> {
        if self.state == SortState::Closed {
            return Ok(());
        }
        self.state = SortState::Closed;
        let result = self.mapping.remove_handle_tree(&self.handle);
        self.temp = None;
        result
    }

    fn abort(&mut self) {
        if let Err(err) = self.cursor.remove_all() {
            warn!(tree = %self.handle.tree_name(), error = %err, "failed to clear sort tree");
        }
        if let Err(err) = self.close() {
            warn!(tree = %self.handle.tree_name(), error = %err, "failed to remove sort tree");
        }
    }
}

impl Iterator for SortedRows<'_> {
    type Item = Result<Row, SchemataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != SortState::Draining {
            return None;
        }
        let step = self.cursor.advance().and_then(|found| {
            if !found {
                return Ok(None);
            }
            RowCodec::decode_fields(self.cursor.key(), self.cursor.value(), &self.fields)
                .map(|(_, row)| Some(row))
        });
        match step {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => match self.close() {
                Ok(()) => None,
                Err(err) => Some(Err(err)),
            },
            Err(err) => {
                self.abort();
                Some(Err(err))
            }
        }
    }
}

impl Drop for SortedRows<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(tree = %self.handle.tree_name(), error = %err, "failed to remove sort tree on drop");
        }
    }
}
