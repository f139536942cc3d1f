use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use shared::domain::CacheKey;

use crate::compute::PersistentTier;

/// Persistent tier storing one file per cache key. Keys are hex digests,
/// so they are safe to use as file names directly.
pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache directory '{}'", root.display()))?;
        Ok(Self { root })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.bin", key.as_str()))
    }
}

impl PersistentTier for DiskTier {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error).context("failed to read cache entry"),
        }
    }

    fn set(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        // Write-then-rename so a crash mid-write never leaves a torn entry.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write cache entry '{}'", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to finalize cache entry '{}'", path.display()))?;
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> Result<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).context("failed to delete cache entry"),
        }
    }

    fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root).context("failed to list cache directory")? {
            let entry = entry.context("failed to read cache directory entry")?;
            if entry.path().extension().map(|ext| ext == "bin") == Some(true) {
                remove_if_present(&entry.path())?;
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to remove '{}'", path.display()))
        }
    }
}
