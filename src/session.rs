use crate::error::SchemataError;
use crate::permission::CallerContext;
use crate::storage::engine::TreeId;
use crate::storage::mapping::{TempVolume, TreeCursor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state. Owned by exactly one thread at a time and never
/// shared, so the cursor pools and temp volume slot need no locking.
#[derive(Debug)]
pub struct Session {
    id: u64,
    caller: CallerContext,
    pub(crate) cursor_pools: HashMap<TreeId, Vec<TreeCursor>>,
    pub(crate) temp_volume: Weak<TempVolume>,
    // Last tree-removal epoch this session purged its pools against.
    pub(crate) seen_removal_epoch: u64,
}

impl Session {
    pub fn new(caller: CallerContext) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            caller,
            cursor_pools: HashMap::new(),
            temp_volume: Weak::new(),
            seen_removal_epoch: 0,
        }
    }

    pub fn system() -> Self {
        Self::new(CallerContext::system_internal())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn caller(&self) -> &CallerContext {
        &self.caller
    }

    pub fn pooled_cursor_count(&self, tree: TreeId) -> usize {
        self.cursor_pools.get(&tree).map_or(0, Vec::len)
    }

    /// True while at least one sort of this session holds the temp volume.
    pub fn has_temp_volume(&self) -> bool {
        self.temp_volume.strong_count() > 0
    }
}

/// Deadline and cancellation signal for one statement. Checked
/// cooperatively, once per unit of work.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn check(&self) -> Result<(), SchemataError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SchemataError::QueryCanceled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(SchemataError::QueryTimeout);
        }
        Ok(())
    }
}
