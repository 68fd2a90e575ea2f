//! Async facade over [`KvStorage`].
//!
//! SQLite connections stay on one thread: the storage runs on a dedicated
//! worker thread and callers talk to it through an mpsc command channel,
//! awaiting oneshot replies. Dropping the last handle shuts the worker down.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use rusqlite::Connection;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::CacheError;
use crate::model::StorageItem;

use super::KvStorage;

/// Cloneable async handle to a worker-owned [`KvStorage`].
#[derive(Clone)]
pub struct StorageHandle {
    worker: Arc<StorageWorker>,
}

impl StorageHandle {
    /// Move `storage` onto a dedicated worker thread and return the handle.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionError` if the worker thread cannot be
    /// spawned.
    pub fn spawn(storage: KvStorage) -> Result<Self, CacheError> {
        let worker = StorageWorker::spawn(storage)?;
        Ok(Self {
            worker: Arc::new(worker),
        })
    }

    /// Open a store at `root` and spawn its worker in one step.
    ///
    /// This blocks on filesystem and database work; from async code, wrap it
    /// in `spawn_blocking` (as [`crate::disk::DiskCacheBuilder`] does).
    ///
    /// # Errors
    ///
    /// Propagates [`KvStorage::open`] and [`StorageHandle::spawn`] failures.
    pub fn open(root: impl AsRef<std::path::Path>) -> Result<Self, CacheError> {
        Self::spawn(KvStorage::open(root)?)
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker, or a connection error if
    /// the worker is gone.
    pub async fn save(
        &self,
        key: String,
        value: Vec<u8>,
        extended: Option<Vec<u8>>,
        inline_threshold: usize,
    ) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::Save {
                    key,
                    value,
                    extended,
                    inline_threshold,
                    respond_to,
                },
                "storage worker dropped while saving",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn get(&self, key: String) -> Result<Option<StorageItem>, CacheError> {
        self.worker
            .request(
                |respond_to| Command::Get { key, respond_to },
                "storage worker dropped while fetching",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn get_info(&self, key: String) -> Result<Option<StorageItem>, CacheError> {
        self.worker
            .request(
                |respond_to| Command::GetInfo { key, respond_to },
                "storage worker dropped while fetching info",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn get_value(&self, key: String) -> Result<Option<Vec<u8>>, CacheError> {
        self.worker
            .request(
                |respond_to| Command::GetValue { key, respond_to },
                "storage worker dropped while fetching value",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn get_many(
        &self,
        keys: Vec<String>,
        exclude_inline: bool,
    ) -> Result<Vec<StorageItem>, CacheError> {
        self.worker
            .request(
                |respond_to| Command::GetMany {
                    keys,
                    exclude_inline,
                    respond_to,
                },
                "storage worker dropped while fetching batch",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn contains(&self, key: String) -> Result<bool, CacheError> {
        self.worker
            .request(
                |respond_to| Command::Contains { key, respond_to },
                "storage worker dropped while checking key",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn remove(&self, key: String) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::Remove { key, respond_to },
                "storage worker dropped while removing",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn remove_many(&self, keys: Vec<String>) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::RemoveMany { keys, respond_to },
                "storage worker dropped while removing batch",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn remove_larger_than(&self, size: u64) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::RemoveLargerThan { size, respond_to },
                "storage worker dropped while removing by size",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn remove_earlier_than(&self, cutoff_ms: i64) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::RemoveEarlierThan {
                    cutoff_ms,
                    respond_to,
                },
                "storage worker dropped while removing by age",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn trim_to_size(&self, max: u64) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::TrimToSize { max, respond_to },
                "storage worker dropped while trimming by size",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn trim_to_count(&self, max: u64) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::TrimToCount { max, respond_to },
                "storage worker dropped while trimming by count",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.worker
            .request(
                |respond_to| Command::Clear { respond_to },
                "storage worker dropped while clearing",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn item_count(&self) -> Result<u64, CacheError> {
        self.worker
            .request(
                |respond_to| Command::ItemCount { respond_to },
                "storage worker dropped while counting",
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates any `CacheError` from the worker.
    pub async fn total_size(&self) -> Result<u64, CacheError> {
        self.worker
            .request(
                |respond_to| Command::TotalSize { respond_to },
                "storage worker dropped while sizing",
            )
            .await
    }

    /// Run synchronous logic against the worker-owned connection, for
    /// callers that need raw SQL or per-connection engine configuration.
    ///
    /// # Errors
    ///
    /// Propagates any `CacheError` raised by the callback or by worker
    /// communication.
    pub async fn with_connection<F, R>(&self, func: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let callback: BoxedCallback =
            Box::new(move |conn| func(conn).map(|value| Box::new(value) as Box<dyn Any + Send>));
        self.worker.send_command(Command::WithConnection {
            callback,
            respond_to: tx,
        })?;
        match rx.await {
            Ok(Ok(payload)) => payload.downcast::<R>().map(|boxed| *boxed).map_err(|_| {
                CacheError::ConnectionError("storage worker response downcast failure".into())
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CacheError::ConnectionError(
                "storage worker dropped while handling connection callback".into(),
            )),
        }
    }
}

impl fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageHandle").finish_non_exhaustive()
    }
}

struct StorageWorker {
    sender: Sender<Command>,
}

impl StorageWorker {
    fn spawn(storage: KvStorage) -> Result<Self, CacheError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let handle = Handle::try_current().ok();
        thread::Builder::new()
            .name("tiered-kv-storage".into())
            .spawn(move || {
                let runtime_guard = handle.as_ref().map(Handle::enter);
                run_storage_worker(storage, &receiver);
                drop(runtime_guard);
            })
            .map_err(|err| {
                CacheError::ConnectionError(format!("failed to spawn storage worker thread: {err}"))
            })?;
        Ok(Self { sender })
    }

    fn send_command(&self, command: Command) -> Result<(), CacheError> {
        self.sender
            .send(command)
            .map_err(|_| CacheError::ConnectionError("storage worker closed".into()))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CacheError>>) -> Command,
        drop_message: &'static str,
    ) -> Result<T, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.await
            .map_err(|_| CacheError::ConnectionError(drop_message.into()))?
    }
}

impl Drop for StorageWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

type BoxedResponse = Result<Box<dyn Any + Send>, CacheError>;
type BoxedCallback = Box<dyn FnOnce(&Connection) -> BoxedResponse + Send>;

enum Command {
    Save {
        key: String,
        value: Vec<u8>,
        extended: Option<Vec<u8>>,
        inline_threshold: usize,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    Get {
        key: String,
        respond_to: oneshot::Sender<Result<Option<StorageItem>, CacheError>>,
    },
    GetInfo {
        key: String,
        respond_to: oneshot::Sender<Result<Option<StorageItem>, CacheError>>,
    },
    GetValue {
        key: String,
        respond_to: oneshot::Sender<Result<Option<Vec<u8>>, CacheError>>,
    },
    GetMany {
        keys: Vec<String>,
        exclude_inline: bool,
        respond_to: oneshot::Sender<Result<Vec<StorageItem>, CacheError>>,
    },
    Contains {
        key: String,
        respond_to: oneshot::Sender<Result<bool, CacheError>>,
    },
    Remove {
        key: String,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    RemoveMany {
        keys: Vec<String>,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    RemoveLargerThan {
        size: u64,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    RemoveEarlierThan {
        cutoff_ms: i64,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    TrimToSize {
        max: u64,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    TrimToCount {
        max: u64,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    Clear {
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    ItemCount {
        respond_to: oneshot::Sender<Result<u64, CacheError>>,
    },
    TotalSize {
        respond_to: oneshot::Sender<Result<u64, CacheError>>,
    },
    WithConnection {
        callback: BoxedCallback,
        respond_to: oneshot::Sender<BoxedResponse>,
    },
    Shutdown,
}

fn run_storage_worker(mut storage: KvStorage, receiver: &Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Save {
                key,
                value,
                extended,
                inline_threshold,
                respond_to,
            } => {
                let outcome = storage.save(&key, &value, extended.as_deref(), inline_threshold);
                let _ = respond_to.send(outcome);
            }
            Command::Get { key, respond_to } => {
                let _ = respond_to.send(storage.get(&key));
            }
            Command::GetInfo { key, respond_to } => {
                let _ = respond_to.send(storage.get_info(&key));
            }
            Command::GetValue { key, respond_to } => {
                let _ = respond_to.send(storage.get_value(&key));
            }
            Command::GetMany {
                keys,
                exclude_inline,
                respond_to,
            } => {
                let _ = respond_to.send(storage.get_many(&keys, exclude_inline));
            }
            Command::Contains { key, respond_to } => {
                let _ = respond_to.send(storage.contains(&key));
            }
            Command::Remove { key, respond_to } => {
                let _ = respond_to.send(storage.remove(&key));
            }
            Command::RemoveMany { keys, respond_to } => {
                let _ = respond_to.send(storage.remove_many(&keys));
            }
            Command::RemoveLargerThan { size, respond_to } => {
                let _ = respond_to.send(storage.remove_larger_than(size));
            }
            Command::RemoveEarlierThan {
                cutoff_ms,
                respond_to,
            } => {
                let _ = respond_to.send(storage.remove_earlier_than(cutoff_ms));
            }
            Command::TrimToSize { max, respond_to } => {
                let _ = respond_to.send(storage.trim_to_size(max));
            }
            Command::TrimToCount { max, respond_to } => {
                let _ = respond_to.send(storage.trim_to_count(max));
            }
            Command::Clear { respond_to } => {
                let _ = respond_to.send(storage.clear());
            }
            Command::ItemCount { respond_to } => {
                let _ = respond_to.send(storage.item_count());
            }
            Command::TotalSize { respond_to } => {
                let _ = respond_to.send(storage.total_size());
            }
            Command::WithConnection {
                callback,
                respond_to,
            } => {
                let outcome = match storage.connection() {
                    Ok(conn) => callback(conn),
                    Err(err) => Err(err),
                };
                let _ = respond_to.send(outcome);
            }
            Command::Shutdown => break,
        }
    }
}
