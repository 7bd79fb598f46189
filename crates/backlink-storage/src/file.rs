//! File-per-key storage backend, the default durable surface.
//!
//! Each key maps to a file below the data directory: `/`-separated key
//! segments become subdirectories and the last segment gets a `.val`
//! suffix, so `cache/users` and `cache` can coexist. Directory segments may
//! not themselves end in `.val` or `.tmp`. Writes go to a sibling
//! temp file first and are renamed into place, so a crash never leaves a
//! half-written value behind. Blocking filesystem calls are dispatched via
//! [`tokio::task::spawn_blocking`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{StorageBackend, StorageError};

const VALUE_SUFFIX: &str = ".val";
const TEMP_SUFFIX: &str = ".tmp";

/// A storage backend that keeps one file per key under a root directory.
///
/// # Examples
///
/// ```no_run
/// # use backlink_storage::FileBackend;
/// let backend = FileBackend::open("/home/ops/.backlink").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: Arc<PathBuf>,
}

impl FileBackend {
    /// Open (and create if missing) a data directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the directory cannot be created or
    /// the path exists but is not a directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !path.is_dir() {
            return Err(StorageError::Open {
                path: path.display().to_string(),
                reason: "not a directory".to_owned(),
            });
        }
        Ok(Self {
            root: Arc::new(path.to_path_buf()),
        })
    }

    /// Return the data directory of this backend.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// Map a storage key onto a file path below `root`.
fn key_path(root: &Path, key: &str) -> Result<PathBuf, StorageError> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };

    if key.is_empty() {
        return Err(invalid("key is empty"));
    }

    let segments: Vec<&str> = key.split('/').collect();
    let mut path = root.to_path_buf();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() || *segment == "." || *segment == ".." {
            return Err(invalid("empty or relative path segment"));
        }
        if segment.contains(['\\', '\0']) {
            return Err(invalid("segment contains a reserved character"));
        }
        if i + 1 == segments.len() {
            path.push(format!("{segment}{VALUE_SUFFIX}"));
        } else if segment.ends_with(VALUE_SUFFIX) || segment.ends_with(TEMP_SUFFIX) {
            // Would share a name with a value or temp file of a sibling key.
            return Err(invalid("directory segment ends with a reserved suffix"));
        } else {
            path.push(segment);
        }
    }
    Ok(path)
}

fn collect_keys(dir: &Path, base: &str, out: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let nested = format!("{base}{name}/");
            collect_keys(&entry.path(), &nested, out)?;
        } else if let Some(stem) = name.strip_suffix(VALUE_SUFFIX) {
            out.push(format!("{base}{stem}"));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    if let Err(e) = fs::set_permissions(path, perms) {
        tracing::warn!(path = %path.display(), error = %e, "failed to restrict file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[async_trait::async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = key_path(&self.root, key)?;
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read {
                key,
                reason: e.to_string(),
            }),
        })
        .await
        .map_err(|e| StorageError::Read {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = key_path(&self.root, key)?;
        let key = key.to_owned();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || {
            let write_err = |e: std::io::Error| StorageError::Write {
                key: key.clone(),
                reason: e.to_string(),
            };

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
            let mut tmp = path.clone().into_os_string();
            tmp.push(TEMP_SUFFIX);
            let tmp = PathBuf::from(tmp);

            fs::write(&tmp, &value).map_err(write_err)?;
            restrict_permissions(&tmp);
            fs::rename(&tmp, &path).map_err(write_err)?;
            tracing::debug!(key = %key, bytes = value.len(), "value written");
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Write {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = key_path(&self.root, key)?;
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Delete {
                key,
                reason: e.to_string(),
            }),
        })
        .await
        .map_err(|e| StorageError::Delete {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = Arc::clone(&self.root);
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            collect_keys(&root, "", &mut keys).map_err(|e| StorageError::List {
                prefix: prefix.clone(),
                reason: e.to_string(),
            })?;
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::List {
            prefix: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}
