//! Persistence of the treasury pool.
//!
//! The service talks to disk through [`TreasuryStore`], so tests can swap in
//! an in-memory store. The file backend writes to a sibling temp file and
//! renames it into place, a torn write never destroys the previous save.

use std::fs;
use std::path::Path;

use treasury_mempool::TreasuryError;
use treasury_mempool::TreasuryMempool;

pub trait TreasuryStore {
    fn load(&self, path: &Path) -> Result<TreasuryMempool, TreasuryError>;
    fn dump(&self, path: &Path, pool: &TreasuryMempool) -> Result<(), TreasuryError>;
}

/// The on-disk backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStore;

impl TreasuryStore for FileStore {
    fn load(&self, path: &Path) -> Result<TreasuryMempool, TreasuryError> {
        let bytes = fs::read(path)?;
        TreasuryMempool::from_file_bytes(&bytes)
    }

    fn dump(&self, path: &Path, pool: &TreasuryMempool) -> Result<(), TreasuryError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        fs::write(&tmp, pool.to_file_bytes())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("treasury-store-{}-{name}.dat", std::process::id()));
        path
    }

    #[test]
    fn test_dump_then_load() {
        let path = scratch_file("round-trip");
        let store = FileStore;

        let mut pool = TreasuryMempool::new();
        pool.last_saved = 1234;

        store.dump(&path, &pool).unwrap();
        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded, pool);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_dump_replaces_previous_save() {
        let path = scratch_file("replace");
        let store = FileStore;

        let mut pool = TreasuryMempool::new();
        store.dump(&path, &pool).unwrap();

        pool.last_saved = 99;
        store.dump(&path, &pool).unwrap();

        assert_eq!(store.load(&path).unwrap().last_saved, 99);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_rejects_garbage() {
        let path = scratch_file("garbage");
        fs::write(&path, b"definitely not a treasury file").unwrap();

        assert!(matches!(
            FileStore.load(&path),
            Err(TreasuryError::CorruptFile)
        ));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let path = scratch_file("missing");
        assert!(matches!(FileStore.load(&path), Err(TreasuryError::Io(_))));
    }
}
