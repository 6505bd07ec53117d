use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::LocalCache;
use crate::error::{SyncError, SyncResult};

const BLOB_EXTENSION: &str = "json";
const BLOB_TMP_EXTENSION: &str = "json.tmp";

/// One JSON file per key, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating draft cache dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.{BLOB_EXTENSION}"))
    }

    fn write_blob(&self, key: &str, blob: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("ensuring draft cache dir {}", self.dir.display()))?;
        let final_path = self.blob_path(key);
        let tmp_path = final_path.with_extension(BLOB_TMP_EXTENSION);
        fs::write(&tmp_path, blob)
            .with_context(|| format!("writing temporary draft {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("atomically persisting draft {}", final_path.display()))?;
        Ok(())
    }
}

impl LocalCache for FileCache {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let path = self.blob_path(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(unavailable(err, &path)),
        }
    }

    fn set(&self, key: &str, blob: &str) -> SyncResult<()> {
        self.write_blob(key, blob)
            .map_err(|err| SyncError::StorageUnavailable(format!("{err:#}")))
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        let path = self.blob_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(unavailable(err, &path)),
        }
    }
}

fn unavailable(err: io::Error, path: &Path) -> SyncError {
    SyncError::StorageUnavailable(format!("{}: {err}", path.display()))
}
