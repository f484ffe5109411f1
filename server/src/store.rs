//! Filesystem-backed blob store for runner reports.
//!
//! Each blob goes through an ingest transaction: `open_writer` hands out a
//! temporary file under `ingest/`, and `commit` moves it atomically into
//! `data/` under the caller's reference. Half-written uploads therefore
//! never appear under a committed name.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A blob with this reference has already been committed.
    #[error("ref {0} already exists")]
    AlreadyExists(String),
    /// The store root is not an absolute path.
    #[error("{0} is not an absolute path")]
    NotAbsolute(PathBuf),
    /// The referenced blob does not exist.
    #[error("no such ref {0}")]
    NotFound(String),
    /// Filesystem failure, passed through verbatim.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Content-addressed blob store rooted at a directory.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    data_dir: PathBuf,
    ingest_dir: PathBuf,
    // Serializes commit and delete so exists-then-rename stays atomic.
    lock: Mutex<()>,
    next_ingest: std::sync::atomic::AtomicU64,
}

impl Store {
    /// Create a store rooted at `root`, ensuring `data/` and `ingest/`.
    pub async fn new(root: &Path) -> Result<Self, StoreError> {
        if !root.is_absolute() {
            return Err(StoreError::NotAbsolute(root.to_owned()));
        }

        let data_dir = root.join("data");
        tokio::fs::create_dir_all(&data_dir).await?;
        let ingest_dir = root.join("ingest");
        tokio::fs::create_dir_all(&ingest_dir).await?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                data_dir,
                ingest_dir,
                lock: Mutex::new(()),
                next_ingest: std::sync::atomic::AtomicU64::new(0),
            }),
        })
    }

    /// Start an ingest transaction. Data written to the returned writer
    /// only becomes visible after [`Writer::commit`].
    pub async fn open_writer(&self) -> Result<Writer, StoreError> {
        let seq = self
            .inner
            .next_ingest
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let path = self
            .inner
            .ingest_dir
            .join(format!("ingest-{}-{seq}", std::process::id()));
        let file = File::create(&path).await?;
        Ok(Writer {
            store: self.clone(),
            path,
            file: Some(file),
        })
    }

    /// Open a committed blob, reporting its size.
    pub async fn open_reader(&self, reference: &str) -> Result<Reader, StoreError> {
        let target = self.inner.data_dir.join(reference);
        let metadata = match tokio::fs::metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(reference.to_owned()))
            }
            Err(err) => return Err(err.into()),
        };
        let file = File::open(&target).await?;
        Ok(Reader {
            file,
            size: metadata.len(),
        })
    }

    /// Delete a committed blob. Deleting a missing reference is not an
    /// error.
    pub async fn delete(&self, reference: &str) -> Result<(), StoreError> {
        let _guard = self.inner.lock.lock().await;
        match tokio::fs::remove_file(self.inner.data_dir.join(reference)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// One ingest transaction.
pub struct Writer {
    store: Store,
    path: PathBuf,
    file: Option<File>,
}

impl Writer {
    /// Append data to the transaction.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StoreError> {
        let file = self.file.as_mut().expect("writer already closed");
        file.write_all(data).await?;
        Ok(())
    }

    /// Publish the blob under `reference`.
    ///
    /// The data is fsynced before the rename. Fails with
    /// [`StoreError::AlreadyExists`] when the reference was committed
    /// before; the transaction is discarded either way.
    pub async fn commit(mut self, reference: &str) -> Result<(), StoreError> {
        let file = self.file.take().expect("writer already closed");
        file.sync_all().await?;
        drop(file);

        let _guard = self.store.inner.lock.lock().await;
        let target = self.store.inner.data_dir.join(reference);
        match tokio::fs::metadata(&target).await {
            Ok(_) => {
                self.remove_ingest().await;
                Err(StoreError::AlreadyExists(reference.to_owned()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::rename(&self.path, &target).await?;
                debug!(reference, "committed blob");
                Ok(())
            }
            Err(err) => {
                self.remove_ingest().await;
                Err(err.into())
            }
        }
    }

    /// Abort the transaction, removing the temporary file.
    pub async fn close(mut self) -> Result<(), StoreError> {
        self.file.take();
        self.remove_ingest().await;
        Ok(())
    }

    async fn remove_ingest(&self) {
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), %err, "failed to remove ingest file");
            }
        }
    }
}

/// Reader over one committed blob.
pub struct Reader {
    file: File,
    size: u64,
}

impl Reader {
    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the whole blob.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, StoreError> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl AsyncRead for Reader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.file).poll_read(cx, buf)
    }
}
