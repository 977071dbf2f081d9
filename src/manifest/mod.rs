pub mod atomic;
pub mod envelope;

pub use atomic::{load_catalog_dump, write_catalog_dump};
pub use envelope::{CATALOG_KEY, CatalogEnvelope};
