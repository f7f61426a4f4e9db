//! Persistent metadata store backed by redb.
//!
//! Records are bincode-encoded and keyed by the raw object key. redb calls
//! are blocking, so every operation runs on the blocking pool and is bounded
//! by the configured operation timeout.

use crate::{MetaStore, tables};
use async_trait::async_trait;
use redb::Database;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};
use zstor_common::{Error, MetaStorConfig, Metadata, Result, display_key};

/// Error type for redb plumbing
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Bincode(e) => Self::Serialization(e.to_string()),
            MetaStoreError::Io(e) => Self::Io(e),
            other => Self::meta_store(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = std::result::Result<T, MetaStoreError>;

/// Metadata store persisted in a redb database file
pub struct RedbMetaStore {
    db: Arc<Database>,
    op_timeout: Duration,
    closed: AtomicBool,
}

impl RedbMetaStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>, op_timeout: Duration) -> Result<Self> {
        let db = open_database(path.as_ref())?;
        info!("Opened metadata store at {}", path.as_ref().display());
        Ok(Self {
            db: Arc::new(db),
            op_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Open the database named by the configuration
    pub fn from_config(config: &MetaStorConfig) -> Result<Self> {
        let path = config
            .db_path
            .as_ref()
            .ok_or_else(|| Error::configuration("metastor db_path is not set"))?;
        Self::open(path, config.op_timeout())
    }

    /// Run a blocking database operation within the operation timeout
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> MetaStoreResult<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::meta_store("metadata store is closed"));
        }
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || op(&*db));
        match tokio::time::timeout(self.op_timeout, task).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(e)) => Err(Error::internal(format!("metadata task failed: {e}"))),
            Ok(Ok(result)) => result.map_err(|e| {
                error!("Metadata store operation failed: {}", e);
                e.into()
            }),
        }
    }
}

fn open_database(path: &Path) -> MetaStoreResult<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::create(path)?;

    // Create the table eagerly so later read txns don't fail
    let write_txn = db.begin_write()?;
    {
        let _t = write_txn.open_table(tables::METADATA)?;
    }
    write_txn.commit()?;
    Ok(db)
}

#[async_trait]
impl MetaStore for RedbMetaStore {
    async fn set_metadata(&self, metadata: &Metadata) -> Result<()> {
        if metadata.key.is_empty() {
            return Err(Error::MissingKey);
        }
        let key = metadata.key.clone();
        let bytes = bincode::serialize(metadata).map_err(MetaStoreError::from)?;
        self.run(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(tables::METADATA)?;
                table.insert(key.as_slice(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_metadata(&self, key: &[u8]) -> Result<Metadata> {
        let owned = key.to_vec();
        let bytes = self
            .run(move |db| {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(tables::METADATA)?;
                let value = table.get(owned.as_slice())?.map(|v| v.value().to_vec());
                Ok(value)
            })
            .await?;

        let bytes = bytes.ok_or_else(|| Error::MetadataNotFound {
            key: display_key(key),
        })?;
        bincode::deserialize(&bytes).map_err(|e| MetaStoreError::from(e).into())
    }

    async fn delete_metadata(&self, key: &[u8]) -> Result<()> {
        let key = key.to_vec();
        self.run(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(tables::METADATA)?;
                table.remove(key.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
