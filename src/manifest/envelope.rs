use crate::catalog::SchemaCatalog;
use crate::error::SchemataError;
use serde::{Deserialize, Serialize};

pub const CATALOG_FORMAT_VERSION: u32 = 1;
/// Key of the envelope inside the catalog tree.
pub const CATALOG_KEY: &[u8] = b"catalog";

/// Persisted form of a catalog snapshot. The payload is the msgpack
/// encoding of the catalog; the checksum is crc32c over the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEnvelope {
    pub format_version: u32,
    pub generation: u64,
    pub checksum: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl CatalogEnvelope {
    pub fn seal(catalog: &SchemaCatalog) -> Result<Self, SchemataError> {
        let payload =
            rmp_serde::to_vec_named(catalog).map_err(|e| SchemataError::Encode(e.to_string()))?;
        Ok(Self {
            format_version: CATALOG_FORMAT_VERSION,
            generation: catalog.generation(),
            checksum: crc32c::crc32c(&payload),
            payload,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SchemataError> {
        rmp_serde::to_vec_named(self).map_err(|e| SchemataError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SchemataError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| SchemataError::CatalogCorruption(format!("unreadable envelope: {e}")))
    }

    /// Verifies the checksum and decodes the catalog it carries.
    pub fn open(&self) -> Result<SchemaCatalog, SchemataError> {
        if self.format_version != CATALOG_FORMAT_VERSION {
            return Err(SchemataError::CatalogCorruption(format!(
                "unsupported catalog format version {}",
                self.format_version
            )));
        }
        if crc32c::crc32c(&self.payload) != self.checksum {
            return Err(SchemataError::CatalogCorruption(
                "catalog checksum mismatch".into(),
            ));
        }
        let catalog: SchemaCatalog = rmp_serde::from_slice(&self.payload)
            .map_err(|e| SchemataError::CatalogCorruption(format!("unreadable catalog: {e}")))?;
        if catalog.generation() != self.generation {
            return Err(SchemataError::CatalogCorruption(format!(
                "envelope generation {} does not match catalog generation {}",
                self.generation,
                catalog.generation()
            )));
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::CatalogEnvelope;
    use crate::catalog::names::TreeNameGenerator;
    use crate::catalog::{MergeOptions, SchemaCatalog};
    use crate::catalog::types::ColumnType;
    use crate::declarative::TableSpec;
    use crate::error::ErrorCode;

    fn catalog() -> SchemaCatalog {
        let spec = TableSpec::new("s", "t")
            .column("id", ColumnType::Integer, false)
            .primary_key(&["id"]);
        let (catalog, _) = SchemaCatalog::new()
            .merge_table(&spec, MergeOptions::default(), &mut TreeNameGenerator::new())
            .expect("merge");
        catalog.with_generation(4)
    }

    #[test]
    fn sealed_envelope_opens_to_same_catalog() {
        let original = catalog();
        let bytes = CatalogEnvelope::seal(&original)
            .expect("seal")
            .to_bytes()
            .expect("bytes");
        let opened = CatalogEnvelope::from_bytes(&bytes)
            .expect("envelope")
            .open()
            .expect("open");
        assert_eq!(opened, original);
    }

    #[test]
    fn tampered_payload_is_catalog_corruption() {
        let mut envelope = CatalogEnvelope::seal(&catalog()).expect("seal");
        let last = envelope.payload.len() - 1;
        envelope.payload[last] ^= 0x01;
        let err = envelope.open().expect_err("tampered");
        assert_eq!(err.code(), ErrorCode::CatalogCorruption);
    }
}
