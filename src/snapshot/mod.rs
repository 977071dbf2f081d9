use crate::catalog::SchemaCatalog;
use crate::error::SchemataError;
use parking_lot::RwLock;
use std::sync::Arc;

/// Holder of the current catalog. Readers clone the `Arc` and keep a
/// consistent snapshot for as long as they need; publication replaces the
/// pointer in one step.
#[derive(Debug)]
pub struct PublishedCatalog {
    current: RwLock<Arc<SchemaCatalog>>,
}

impl PublishedCatalog {
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    pub fn snapshot(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.current.read())
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation()
    }

    /// Installs `next` provided the published generation is still `base`.
    pub fn publish(&self, base: u64, next: SchemaCatalog) -> Result<Arc<SchemaCatalog>, SchemataError> {
        let mut current = self.current.write();
        if current.generation() != base {
            return Err(SchemataError::StaleCatalog {
                base,
                current: current.generation(),
            });
        }
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::PublishedCatalog;
    use crate::catalog::SchemaCatalog;

    #[test]
    fn readers_keep_their_snapshot_across_publication() {
        let published = PublishedCatalog::new(SchemaCatalog::new());
        let before = published.snapshot();
        published
            .publish(0, SchemaCatalog::new().with_generation(1))
            .expect("publish");
        assert_eq!(before.generation(), 0);
        assert_eq!(published.snapshot().generation(), 1);
    }

    #[test]
    fn publishing_from_a_stale_base_is_an_invariant_violation() {
        let published = PublishedCatalog::new(SchemaCatalog::new().with_generation(3));
        let err = published
            .publish(2, SchemaCatalog::new().with_generation(3))
            .expect_err("stale");
        assert!(err.is_defect());
        assert_eq!(published.generation(), 3);
    }
}
