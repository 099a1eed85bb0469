use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::BackendError;
use crate::model::{LogEntry, LogSearch, PaginationInfo};

/// Initial batch plus the optional live channel. The entries vector is
/// always present (possibly empty); the channel is `Some` exactly when the
/// adapter honored follow semantics.
pub struct EntryBatch {
    pub entries: Vec<LogEntry>,
    pub live: Option<mpsc::Receiver<Vec<LogEntry>>>,
}

impl EntryBatch {
    pub fn empty() -> Self {
        EntryBatch {
            entries: Vec::new(),
            live: None,
        }
    }
}

/// A search in flight. The result exclusively owns its backend session,
/// cursor or query id, and the live channel; closing it cancels in-flight
/// I/O and closes the channel.
///
/// `entries` takes `&mut self`: concurrent calls on one result are not a
/// thing, callers serialize.
#[async_trait]
pub trait LogSearchResult: Send + std::fmt::Debug {
    /// The effective search after context resolution.
    fn search(&self) -> &LogSearch;

    /// Fetch the initial batch and, when following, the live channel.
    async fn entries(&mut self) -> Result<EntryBatch, BackendError>;

    fn pagination(&self) -> Option<PaginationInfo>;

    /// Release backend resources. Returns once in-flight work has stopped.
    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// StreamResult — line-stream backends (local, ssh, docker, k8s)
// ---------------------------------------------------------------------------

/// Result over a producer task that writes entry batches into a channel.
///
/// Non-follow searches drain the channel into a bounded initial batch;
/// follow searches hand the channel to the caller as the live stream.
#[derive(Debug)]
pub struct StreamResult {
    search: LogSearch,
    rx: Option<mpsc::Receiver<Vec<LogEntry>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    follow: bool,
}

impl StreamResult {
    /// Channel capacity for producer tasks. Small on purpose: a slow
    /// consumer blocks the producer, which throttles reads from the
    /// backend instead of buffering unboundedly.
    pub const CHANNEL_CAPACITY: usize = 16;

    /// Create the result plus the sender side for the adapter's producer
    /// task. The producer should select on `cancel` and exit when it fires.
    pub fn channel(
        search: LogSearch,
    ) -> (
        Self,
        mpsc::Sender<Vec<LogEntry>>,
        CancellationToken,
        TaskTracker,
    ) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let follow = search.wants_follow();
        let result = StreamResult {
            search,
            rx: Some(rx),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            follow,
        };
        (result, tx, cancel, tracker)
    }
}

#[async_trait]
impl LogSearchResult for StreamResult {
    fn search(&self) -> &LogSearch {
        &self.search
    }

    async fn entries(&mut self) -> Result<EntryBatch, BackendError> {
        let Some(mut rx) = self.rx.take() else {
            // already drained; callers serialize, so just stay empty
            return Ok(EntryBatch::empty());
        };

        if self.follow {
            return Ok(EntryBatch {
                entries: Vec::new(),
                live: Some(rx),
            });
        }

        let cap = self.search.size;
        let mut entries = Vec::new();
        while let Some(batch) = rx.recv().await {
            entries.extend(batch);
            if cap.is_some_and(|c| entries.len() >= c) {
                break;
            }
        }
        if let Some(c) = cap {
            entries.truncate(c);
        }
        // the producer has nothing left to deliver
        self.cancel.cancel();
        Ok(EntryBatch {
            entries,
            live: None,
        })
    }

    fn pagination(&self) -> Option<PaginationInfo> {
        None
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.rx.take();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

// ---------------------------------------------------------------------------
// MultiSearchResult — fan-out over several contexts
// ---------------------------------------------------------------------------

/// Merged view over child results executed concurrently, one per context.
///
/// Entries keep per-child order only; there is no global timestamp order,
/// callers sort when they need one. Errors are collected per child and
/// partial success still yields data. Pagination is not meaningful across
/// heterogeneous backends.
#[derive(Debug)]
pub struct MultiSearchResult {
    search: LogSearch,
    children: Vec<Box<dyn LogSearchResult>>,
    errors: Vec<BackendError>,
}

impl MultiSearchResult {
    pub fn new(search: LogSearch, children: Vec<Box<dyn LogSearchResult>>) -> Self {
        MultiSearchResult {
            search,
            children,
            errors: Vec::new(),
        }
    }

    /// Errors collected by the last `entries` call, one per failed child.
    pub fn errors(&self) -> &[BackendError] {
        &self.errors
    }
}

#[async_trait]
impl LogSearchResult for MultiSearchResult {
    fn search(&self) -> &LogSearch {
        &self.search
    }

    async fn entries(&mut self) -> Result<EntryBatch, BackendError> {
        let batches = join_all(self.children.iter_mut().map(|c| c.entries())).await;

        let mut entries = Vec::new();
        let mut live_channels = Vec::new();
        self.errors.clear();

        for outcome in batches {
            match outcome {
                Ok(batch) => {
                    entries.extend(batch.entries);
                    if let Some(rx) = batch.live {
                        live_channels.push(rx);
                    }
                }
                Err(err) => self.errors.push(err),
            }
        }

        let live = if live_channels.is_empty() {
            None
        } else {
            // forward every child channel into one merged stream
            let (tx, rx) = mpsc::channel(StreamResult::CHANNEL_CAPACITY);
            for mut child_rx in live_channels {
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(batch) = child_rx.recv().await {
                        if tx.send(batch).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Some(rx)
        };

        Ok(EntryBatch { entries, live })
    }

    fn pagination(&self) -> Option<PaginationInfo> {
        None
    }

    async fn close(&mut self) {
        join_all(self.children.iter_mut().map(|c| c.close())).await;
    }
}
