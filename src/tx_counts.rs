use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{StoreError, TransactionCountMetrics};

pub const DEFAULT_MAX_TRACKED_BLOCKS: usize = 1024;

/// Receiver of per-block transaction counts observed on the flashblock feed.
pub trait TransactionCountSink: Send + Sync {
    /// Adds `count` transactions to `block_number` and returns the new total.
    fn add(&self, block_number: u64, count: u64) -> u64;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCounts {
    #[serde(default)]
    transaction_counts: BTreeMap<u64, u64>,
}

/// Block number to transaction count map shared between the two feeds.
///
/// Every mutation is written through to an optional JSON file. The file is replaced
/// atomically, and a file that cannot be read or written only costs durability: the index
/// keeps working in memory. Inside a tokio runtime the write runs on the blocking pool, so
/// callers never wait on disk.
pub struct TransactionCountIndex {
    counts: Mutex<BTreeMap<u64, u64>>,
    /// Bumped under the `counts` lock by every mutation.
    version: AtomicU64,
    store: Option<Arc<CountStore>>,
    max_entries: usize,
    metrics: TransactionCountMetrics,
}

/// A snapshot waiting to be written.
struct PendingWrite {
    version: u64,
    counts: BTreeMap<u64, u64>,
}

struct CountStore {
    path: PathBuf,
    /// Version of the snapshot currently on disk.
    written: Mutex<u64>,
    metrics: TransactionCountMetrics,
}

impl CountStore {
    /// Writes `pending` unless a newer snapshot already reached the file.
    fn write(&self, pending: PendingWrite) {
        let mut written = self.written.lock();
        if pending.version <= *written {
            return;
        }
        match persist(&self.path, &pending.counts) {
            Ok(()) => *written = pending.version,
            Err(e) => {
                self.metrics.persist_failures.increment(1);
                warn!(
                    message = "failed to persist transaction counts",
                    path = %self.path.display(),
                    error = %e
                );
            }
        }
    }
}

impl TransactionCountIndex {
    pub fn in_memory(max_entries: usize) -> Self {
        Self::with_counts(BTreeMap::new(), None, max_entries)
    }

    /// Loads the index from `path`. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        let path = path.into();
        let counts = match load(&path) {
            Ok(Some(counts)) => {
                info!(
                    message = "loaded transaction counts",
                    path = %path.display(),
                    blocks = counts.len()
                );
                counts
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(
                    message = "failed to load transaction counts, starting empty",
                    path = %path.display(),
                    error = %e
                );
                BTreeMap::new()
            }
        };
        Self::with_counts(counts, Some(path), max_entries)
    }

    fn with_counts(
        mut counts: BTreeMap<u64, u64>,
        path: Option<PathBuf>,
        max_entries: usize,
    ) -> Self {
        let max_entries = max_entries.max(1);
        while counts.len() > max_entries {
            counts.pop_first();
        }

        let metrics = TransactionCountMetrics::default();
        metrics.tracked_blocks.set(counts.len() as f64);

        let store = path.map(|path| {
            Arc::new(CountStore {
                path,
                written: Mutex::new(0),
                metrics: metrics.clone(),
            })
        });

        Self {
            counts: Mutex::new(counts),
            version: AtomicU64::new(0),
            store,
            max_entries,
            metrics,
        }
    }

    pub fn set(&self, block_number: u64, count: u64) {
        let pending = {
            let mut counts = self.counts.lock();
            debug!(
                message = "setting transaction count",
                block_number,
                count
            );
            counts.insert(block_number, count);
            self.commit(&mut counts)
        };
        self.persist(pending);
    }

    pub fn add(&self, block_number: u64, delta: u64) -> u64 {
        let (total, pending) = {
            let mut counts = self.counts.lock();
            let current = counts.get(&block_number).copied().unwrap_or(0);
            let total = current.saturating_add(delta);
            debug!(
                message = "adding transactions",
                block_number,
                delta,
                from = current,
                to = total
            );
            counts.insert(block_number, total);
            (total, self.commit(&mut counts))
        };
        self.persist(pending);
        total
    }

    pub fn get(&self, block_number: u64) -> Option<u64> {
        self.counts.lock().get(&block_number).copied()
    }

    pub fn clear(&self) {
        let pending = {
            let mut counts = self.counts.lock();
            counts.clear();
            self.commit(&mut counts)
        };
        self.persist(pending);
    }

    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<u64, u64> {
        self.counts.lock().clone()
    }

    /// Writes the current counts on the calling thread.
    pub fn flush(&self) {
        let pending = {
            let counts = self.counts.lock();
            self.version.fetch_add(1, Ordering::SeqCst);
            self.pending(&counts)
        };
        if let (Some(store), Some(pending)) = (&self.store, pending) {
            store.write(pending);
        }
    }

    /// Applies the entry limit and captures the snapshot to persist. Runs under the lock.
    fn commit(&self, counts: &mut BTreeMap<u64, u64>) -> Option<PendingWrite> {
        let mut evicted = 0;
        while counts.len() > self.max_entries {
            counts.pop_first();
            evicted += 1;
        }
        if evicted > 0 {
            self.metrics.evicted_blocks.increment(evicted);
        }
        self.metrics.tracked_blocks.set(counts.len() as f64);

        self.version.fetch_add(1, Ordering::SeqCst);
        self.pending(counts)
    }

    fn pending(&self, counts: &BTreeMap<u64, u64>) -> Option<PendingWrite> {
        self.store.as_ref().map(|_| PendingWrite {
            version: self.version.load(Ordering::SeqCst),
            counts: counts.clone(),
        })
    }

    fn persist(&self, pending: Option<PendingWrite>) {
        let (Some(store), Some(pending)) = (&self.store, pending) else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let store = store.clone();
                handle.spawn_blocking(move || store.write(pending));
            }
            Err(_) => store.write(pending),
        }
    }
}

impl TransactionCountSink for TransactionCountIndex {
    fn add(&self, block_number: u64, count: u64) -> u64 {
        TransactionCountIndex::add(self, block_number, count)
    }
}

fn load(path: &Path) -> Result<Option<BTreeMap<u64, u64>>, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let persisted: PersistedCounts = serde_json::from_str(&contents)?;
    Ok(Some(persisted.transaction_counts))
}

fn persist(path: &Path, counts: &BTreeMap<u64, u64>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let persisted = PersistedCounts {
        transaction_counts: counts.clone(),
    };
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, serde_json::to_vec(&persisted)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
