//! CLI configuration.
//!
//! Every setting can come from a flag or a `BACKLINK_*` environment variable;
//! flags win. The core library reads no environment itself, so this is the
//! only place defaults are decided.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backlink_storage::{FileBackend, MemoryBackend, StorageBackend};
use clap::{Args, ValueEnum};
use tracing::info;

/// Supported storage backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// One file per key under the data directory.
    File,
    /// In-memory; nothing survives the process.
    Memory,
    /// Single-file redb database in the data directory.
    Redb,
}

/// Global options shared by every command.
#[derive(Debug, Clone, Args)]
pub struct CliConfig {
    /// Directory holding persisted state (default: `$HOME/.backlink`).
    #[arg(long, global = true, env = "BACKLINK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Storage backend.
    #[arg(long, global = true, env = "BACKLINK_STORAGE", value_enum, default_value = "file")]
    pub storage: StorageKind,

    /// Request timeout in seconds.
    #[arg(long, global = true, env = "BACKLINK_HTTP_TIMEOUT", default_value = "10")]
    pub timeout: u64,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, global = true, env = "BACKLINK_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value = "false")]
    pub log_json: bool,
}

impl CliConfig {
    /// Resolved data directory.
    ///
    /// # Errors
    ///
    /// Fails if no directory was given and `HOME` is unset.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let home = std::env::var_os("HOME")
            .context("HOME is not set; pass --data-dir or set BACKLINK_DATA_DIR")?;
        Ok(PathBuf::from(home).join(".backlink"))
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Open the configured storage backend.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be opened, or if `redb` was requested in a
    /// build without the `redb-backend` feature.
    pub fn open_storage(&self) -> Result<Arc<dyn StorageBackend>> {
        let storage: Arc<dyn StorageBackend> = match self.storage {
            StorageKind::Memory => {
                info!("using in-memory storage (data will not persist)");
                Arc::new(MemoryBackend::new())
            }
            StorageKind::File => {
                let dir = self.data_dir()?;
                info!(path = %dir.display(), "using file storage");
                Arc::new(
                    FileBackend::open(&dir)
                        .with_context(|| format!("failed to open data dir {}", dir.display()))?,
                )
            }
            #[cfg(feature = "redb-backend")]
            StorageKind::Redb => {
                let path = self.data_dir()?.join("backlink.redb");
                info!(path = %path.display(), "using redb storage");
                Arc::new(
                    backlink_storage::RedbBackend::open(&path)
                        .context("failed to open redb storage")?,
                )
            }
            #[cfg(not(feature = "redb-backend"))]
            StorageKind::Redb => {
                anyhow::bail!("redb backend requested but feature 'redb-backend' is not enabled");
            }
        };
        Ok(storage)
    }
}
