use crate::catalog::SchemaCatalog;
use crate::error::SchemataError;
use crate::manifest::envelope::CATALOG_FORMAT_VERSION;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const DUMP_PREFIX: &str = "catalog-";
const DUMP_SUFFIX: &str = ".json";
const SIG_SUFFIX: &str = ".hmac";
/// Generations kept on disk: the newest and one fallback.
const KEPT_GENERATIONS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CatalogDump {
    format_version: u32,
    generation: u64,
    catalog: SchemaCatalog,
}

fn dump_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{DUMP_PREFIX}{generation:020}{DUMP_SUFFIX}"))
}

fn sig_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{DUMP_PREFIX}{generation:020}{SIG_SUFFIX}"))
}

/// Generation encoded in a dump or signature file name.
fn generation_of(name: &str, suffix: &str) -> Option<u64> {
    name.strip_prefix(DUMP_PREFIX)?.strip_suffix(suffix)?.parse().ok()
}

/// Writes a JSON dump of `catalog` to `dir` under a name carrying its
/// generation. With a key, the signature file is made durable before the
/// dump appears, so every visible dump is either verifiable or unsigned.
/// Generations older than the newest two are pruned afterwards.
pub fn write_catalog_dump(
    catalog: &SchemaCatalog,
    dir: &Path,
    signing_key: Option<&[u8]>,
) -> Result<(), SchemataError> {
    fs::create_dir_all(dir)?;
    let generation = catalog.generation();
    let dump = CatalogDump {
        format_version: CATALOG_FORMAT_VERSION,
        generation,
        catalog: catalog.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&dump).map_err(|e| SchemataError::Encode(e.to_string()))?;

    let sig = sig_path(dir, generation);
    match signing_key {
        Some(key) => persist_file(dir, &sig, hmac_hex(key, &bytes)?.as_bytes())?,
        None => {
            if let Err(err) = fs::remove_file(&sig)
                && err.kind() != io::ErrorKind::NotFound
            {
                return Err(err.into());
            }
        }
    }
    persist_file(dir, &dump_path(dir, generation), &bytes)?;
    fsync_dir(dir)?;
    debug!(generation, signed = signing_key.is_some(), dir = %dir.display(), "wrote catalog dump");
    prune(dir, generation);
    Ok(())
}

/// Loads the newest dump that decodes and, with a key, verifies. Older
/// generations are tried in turn; if none loads, the newest failure is
/// returned.
pub fn load_catalog_dump(dir: &Path, signing_key: Option<&[u8]>) -> Result<SchemaCatalog, SchemataError> {
    let mut generations = dump_generations(dir)?;
    generations.sort_unstable_by(|a, b| b.cmp(a));
    let mut first_err = None;
    for generation in generations {
        match read_dump(dir, generation, signing_key) {
            Ok(catalog) => return Ok(catalog),
            Err(err) => {
                warn!(generation, error = %err, "skipping unreadable catalog dump");
                first_err.get_or_insert(err);
            }
        }
    }
    Err(first_err.unwrap_or_else(|| {
        SchemataError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no catalog dump in {}", dir.display()),
        ))
    }))
}

fn read_dump(dir: &Path, generation: u64, signing_key: Option<&[u8]>) -> Result<SchemaCatalog, SchemataError> {
    let bytes = fs::read(dump_path(dir, generation))?;
    if let Some(key) = signing_key {
        verify_hmac(&sig_path(dir, generation), key, &bytes)?;
    }
    let dump: CatalogDump =
        serde_json::from_slice(&bytes).map_err(|e| SchemataError::Decode(e.to_string()))?;
    if dump.format_version != CATALOG_FORMAT_VERSION {
        return Err(SchemataError::Decode(format!(
            "unsupported catalog dump version {}",
            dump.format_version
        )));
    }
    if dump.generation != generation || dump.catalog.generation() != generation {
        return Err(SchemataError::Decode(format!(
            "catalog dump file for generation {generation} holds generation {}",
            dump.catalog.generation()
        )));
    }
    Ok(dump.catalog)
}

fn dump_generations(dir: &Path) -> Result<Vec<u64>, SchemataError> {
    let mut generations = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(generation) = name.to_str().and_then(|n| generation_of(n, DUMP_SUFFIX)) {
            generations.push(generation);
        }
    }
    Ok(generations)
}

/// Removes dumps and signatures older than the kept generations. Leftovers
/// are harmless to loading, so failures are only logged.
fn prune(dir: &Path, newest: u64) {
    let mut kept = match dump_generations(dir) {
        Ok(generations) => generations,
        Err(err) => {
            warn!(error = %err, "catalog dump pruning skipped");
            return;
        }
    };
    kept.retain(|g| *g <= newest);
    kept.sort_unstable_by(|a, b| b.cmp(a));
    let Some(&oldest_kept) = kept.get(KEPT_GENERATIONS - 1).or(kept.last()) else {
        return;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let generation = generation_of(name, DUMP_SUFFIX).or_else(|| generation_of(name, SIG_SUFFIX));
        if generation.is_some_and(|g| g < oldest_kept)
            && let Err(err) = fs::remove_file(entry.path())
        {
            warn!(file = name, error = %err, "failed to prune catalog dump");
        }
    }
}

fn persist_file(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), SchemataError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SchemataError::Io(e.error))?;
    Ok(())
}

fn verify_hmac(sig_path: &Path, key: &[u8], bytes: &[u8]) -> Result<(), SchemataError> {
    let expected = fs::read_to_string(sig_path).map_err(|_| SchemataError::IntegrityError {
        message: "catalog dump hmac missing".into(),
    })?;
    let expected = hex::decode(expected.trim()).map_err(|_| SchemataError::IntegrityError {
        message: "catalog dump hmac must be hex".into(),
    })?;
    let mut mac = new_mac(key)?;
    mac.update(bytes);
    mac.verify_slice(&expected)
        .map_err(|_| SchemataError::IntegrityError {
            message: "catalog dump hmac mismatch".into(),
        })
}

fn hmac_hex(key: &[u8], bytes: &[u8]) -> Result<String, SchemataError> {
    let mut mac = new_mac(key)?;
    mac.update(bytes);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn new_mac(key: &[u8]) -> Result<Hmac<Sha256>, SchemataError> {
    Hmac::<Sha256>::new_from_slice(key).map_err(|e| SchemataError::InvalidConfig {
        message: format!("invalid hmac key: {e}"),
    })
}

fn fsync_dir(path: &Path) -> Result<(), SchemataError> {
    let dir = fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{dump_generations, dump_path, load_catalog_dump, sig_path, write_catalog_dump};
    use crate::catalog::names::TreeNameGenerator;
    use crate::catalog::schema::{SequenceOptions, TableName};
    use crate::catalog::{MergeOptions, SchemaCatalog};
    use crate::catalog::types::ColumnType;
    use crate::declarative::TableSpec;
    use crate::error::ErrorCode;
    use std::fs;
    use tempfile::tempdir;

    fn catalog(generation: u64) -> SchemaCatalog {
        let mut names = TreeNameGenerator::new();
        let spec = TableSpec::new("s", "t")
            .column("id", ColumnType::Integer, false)
            .primary_key(&["id"]);
        let (catalog, _) = SchemaCatalog::new()
            .merge_table(&spec, MergeOptions::default(), &mut names)
            .expect("table");
        let (catalog, _) = catalog
            .merge_sequence(&TableName::new("s", "ids"), SequenceOptions::default(), &mut names)
            .expect("sequence");
        catalog.with_generation(generation)
    }

    fn generations(dir: &std::path::Path) -> Vec<u64> {
        let mut found = dump_generations(dir).expect("list");
        found.sort_unstable();
        found
    }

    #[test]
    fn newest_dump_wins_and_older_generation_is_the_fallback() {
        let dir = tempdir().expect("temp");
        write_catalog_dump(&catalog(1), dir.path(), None).expect("write 1");
        write_catalog_dump(&catalog(2), dir.path(), None).expect("write 2");
        assert_eq!(load_catalog_dump(dir.path(), None).expect("load").generation(), 2);

        fs::write(dump_path(dir.path(), 2), b"{broken").expect("corrupt newest");
        let fallback = load_catalog_dump(dir.path(), None).expect("fallback");
        assert_eq!(fallback.generation(), 1);

        write_catalog_dump(&catalog(3), dir.path(), None).expect("write 3");
        assert_eq!(generations(dir.path()), vec![2, 3]);
    }

    #[test]
    fn empty_directory_has_no_dump() {
        let dir = tempdir().expect("temp");
        let err = load_catalog_dump(dir.path(), None).expect_err("nothing written");
        assert_eq!(err.code(), ErrorCode::Io);
    }

    #[test]
    fn signed_dump_rejects_bad_signature() {
        let dir = tempdir().expect("temp");
        let key: &[u8] = b"catalog-signing-key";
        let original = catalog(3);
        write_catalog_dump(&original, dir.path(), Some(key)).expect("write signed");
        let loaded = load_catalog_dump(dir.path(), Some(key)).expect("verify");
        assert_eq!(loaded, original);
        fs::write(sig_path(dir.path(), 3), "bad").expect("corrupt sig");
        let err = load_catalog_dump(dir.path(), Some(key)).expect_err("bad signature");
        assert_eq!(err.code(), ErrorCode::IntegrityError);
        let err = load_catalog_dump(dir.path(), Some(&b"other-key"[..])).expect_err("wrong key");
        assert_eq!(err.code(), ErrorCode::IntegrityError);
    }

    #[test]
    fn interrupted_signed_write_falls_back_to_verifiable_generation() {
        let dir = tempdir().expect("temp");
        let key: &[u8] = b"catalog-signing-key";
        write_catalog_dump(&catalog(1), dir.path(), Some(key)).expect("write 1");
        write_catalog_dump(&catalog(2), dir.path(), Some(key)).expect("write 2");

        // Newest dump paired with the previous generation's signature.
        let old_sig = fs::read(sig_path(dir.path(), 1)).expect("old sig");
        fs::write(sig_path(dir.path(), 2), old_sig).expect("stale sig");
        // Signature made durable for a dump that never landed.
        fs::write(sig_path(dir.path(), 3), "00").expect("orphan sig");

        let loaded = load_catalog_dump(dir.path(), Some(key)).expect("fallback");
        assert_eq!(loaded.generation(), 1);

        write_catalog_dump(&catalog(3), dir.path(), Some(key)).expect("write 3");
        assert_eq!(load_catalog_dump(dir.path(), Some(key)).expect("load").generation(), 3);
    }

    #[test]
    fn unsigned_rewrite_drops_stale_signature() {
        let dir = tempdir().expect("temp");
        let key: &[u8] = b"catalog-signing-key";
        write_catalog_dump(&catalog(4), dir.path(), Some(key)).expect("signed");
        write_catalog_dump(&catalog(4), dir.path(), None).expect("unsigned");
        assert!(!sig_path(dir.path(), 4).exists());
        assert_eq!(load_catalog_dump(dir.path(), None).expect("load").generation(), 4);
        let err = load_catalog_dump(dir.path(), Some(key)).expect_err("unsigned dump");
        assert_eq!(err.code(), ErrorCode::IntegrityError);
    }
}
