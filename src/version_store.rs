use crate::error::SchemataError;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::error;

/// Per-table structural version, keyed by table id. Outlives individual
/// catalog snapshots. Supports only reads and compare-and-set.
#[derive(Debug, Default)]
pub struct TableVersionLedger {
    versions: RwLock<HashMap<u32, u32>>,
}

impl TableVersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded<I: IntoIterator<Item = (u32, u32)>>(entries: I) -> Self {
        Self {
            versions: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn get(&self, table_id: u32) -> Option<u32> {
        self.versions.read().get(&table_id).copied()
    }

    /// Sets `table_id` to `new` only when its current value is `expected`
    /// (`None` meaning absent). Returns the value observed on failure.
    pub fn compare_and_set(
        &self,
        table_id: u32,
        expected: Option<u32>,
        new: u32,
    ) -> Result<(), Option<u32>> {
        let mut versions = self.versions.write();
        let current = versions.get(&table_id).copied();
        if current != expected {
            return Err(current);
        }
        versions.insert(table_id, new);
        Ok(())
    }

    /// The version a structural change to `table_id` installs, paired with
    /// the value `advance` must observe: `(current, (current ?? 0) + 1)`.
    pub fn next_version(&self, table_id: u32) -> (Option<u32>, u32) {
        let current = self.get(table_id);
        (current, current.unwrap_or(0).wrapping_add(1))
    }

    /// Installs a version computed earlier from `expected`. Any other
    /// observed value is a defect.
    pub fn advance(&self, table_id: u32, expected: Option<u32>, new: u32) -> Result<(), SchemataError> {
        self.compare_and_set(table_id, expected, new)
            .map_err(|found| conflict(table_id, expected, found))
    }

    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }
}

fn conflict(table_id: u32, expected: Option<u32>, found: Option<u32>) -> SchemataError {
    error!(table_id, ?expected, ?found, "table version ledger CAS failed");
    SchemataError::VersionConflict {
        table_id,
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::TableVersionLedger;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn next_version_starts_from_zero_and_is_monotonic() {
        let ledger = TableVersionLedger::new();
        assert_eq!(ledger.next_version(4), (None, 1));
        ledger.advance(4, None, 1).expect("first");
        assert_eq!(ledger.next_version(4), (Some(1), 2));
        ledger.advance(4, Some(1), 2).expect("second");
        assert_eq!(ledger.get(4), Some(2));
    }

    #[test]
    fn advance_over_existing_entry_is_a_defect() {
        let ledger = TableVersionLedger::seeded([(1, 3)]);
        let err = ledger.advance(1, None, 1).expect_err("already present");
        assert!(err.is_defect());
        assert_eq!(ledger.get(1), Some(3));
    }

    #[test]
    fn stale_expectation_fails_cas() {
        let ledger = TableVersionLedger::seeded([(9, 5)]);
        assert_eq!(ledger.compare_and_set(9, Some(4), 6), Err(Some(5)));
        assert_eq!(ledger.compare_and_set(9, Some(5), 6), Ok(()));
    }

    #[test]
    fn concurrent_advances_on_distinct_tables_do_not_interfere() {
        let ledger = Arc::new(TableVersionLedger::new());
        let handles: Vec<_> = (0..8u32)
            .map(|id| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let (expected, new) = ledger.next_version(id);
                        ledger.advance(id, expected, new).expect("advance");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        for id in 0..8u32 {
            assert_eq!(ledger.get(id), Some(100));
        }
    }
}
