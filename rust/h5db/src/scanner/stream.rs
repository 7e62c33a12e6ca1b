// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::debug;
use snafu::location;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use h5db_core::{Error, Result};

use super::task::{ScanTask, TaskContext};

/// Counters of a running scan.
///
/// Workers update the counters as they go; reads are snapshots.
#[derive(Debug, Default)]
pub struct ScanStats {
    tasks_run: AtomicU64,
    chunks_scanned: AtomicU64,
    chunks_skipped: AtomicU64,
    runs_skipped: AtomicU64,
    chunk_loads: AtomicU64,
    cache_hits: AtomicU64,
    malformed_chunks_skipped: AtomicU64,
    rows_emitted: AtomicU64,
}

impl ScanStats {
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.load(Ordering::Relaxed)
    }

    /// Dimension-0 chunks of the anchor columns that were considered.
    pub fn chunks_scanned(&self) -> u64 {
        self.chunks_scanned.load(Ordering::Relaxed)
    }

    /// Chunks pruned by statistics or run filters without reading their
    /// remaining columns.
    pub fn chunks_skipped(&self) -> u64 {
        self.chunks_skipped.load(Ordering::Relaxed)
    }

    pub fn runs_skipped(&self) -> u64 {
        self.runs_skipped.load(Ordering::Relaxed)
    }

    /// Chunks this scan decoded itself.
    pub fn chunk_loads(&self) -> u64 {
        self.chunk_loads.load(Ordering::Relaxed)
    }

    /// Chunks this scan found already decoded.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn malformed_chunks_skipped(&self) -> u64 {
        self.malformed_chunks_skipped.load(Ordering::Relaxed)
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted.load(Ordering::Relaxed)
    }

    pub(crate) fn record_task(&self) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_scanned(&self) {
        self.chunks_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_skipped(&self) {
        self.chunks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_runs_skipped(&self, runs: usize) {
        self.runs_skipped.fetch_add(runs as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self, from_cache: bool) {
        if from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.chunk_loads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_malformed_chunk(&self) {
        self.malformed_chunks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rows(&self, rows: usize) {
        self.rows_emitted.fetch_add(rows as u64, Ordering::Relaxed);
    }
}

#[derive(Debug)]
enum Message {
    Batch { seq: usize, batch: RecordBatch },
    TaskDone { seq: usize },
    Error(Error),
}

/// How often a worker blocked on the reorder window checks for cancellation.
const WINDOW_POLL: Duration = Duration::from_millis(20);

/// Bounds how far workers of an ordered scan run ahead of the oldest
/// unfinished task.
///
/// A task may only start once its sequence number is below `frontier +
/// limit`, so at most `limit` tasks are ever buffered for reordering.
#[derive(Debug)]
struct ReorderWindow {
    limit: usize,
    frontier: Mutex<usize>,
    advanced: Condvar,
}

impl ReorderWindow {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            frontier: Mutex::new(0),
            advanced: Condvar::new(),
        }
    }

    /// Every task before `next_seq` has been handed to the consumer.
    fn advance(&self, next_seq: usize) {
        let mut frontier = self.frontier.lock().unwrap_or_else(PoisonError::into_inner);
        if next_seq > *frontier {
            *frontier = next_seq;
            self.advanced.notify_all();
        }
    }

    /// Block until task `seq` may start. False if `stop` fired first.
    fn wait(&self, seq: usize, stop: &CancellationToken) -> bool {
        let mut frontier = self.frontier.lock().unwrap_or_else(PoisonError::into_inner);
        while seq >= *frontier + self.limit {
            if stop.is_cancelled() {
                return false;
            }
            frontier = self
                .advanced
                .wait_timeout(frontier, WINDOW_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Batches received from the workers and not yet handed out.
///
/// In ordered mode batches of a task wait until every earlier task is done.
#[derive(Debug)]
struct Pending {
    /// Set in ordered mode.
    window: Option<Arc<ReorderWindow>>,
    next_seq: usize,
    /// Out-of-order batches, and whether their task is done.
    buffered: BTreeMap<usize, (Vec<RecordBatch>, bool)>,
    ready: VecDeque<Result<RecordBatch>>,
    done: bool,
    cancel: CancellationToken,
}

impl Pending {
    fn new(window: Option<Arc<ReorderWindow>>, cancel: CancellationToken) -> Self {
        Self {
            window,
            next_seq: 0,
            buffered: BTreeMap::new(),
            ready: VecDeque::new(),
            done: false,
            cancel,
        }
    }

    fn accept(&mut self, message: Message) {
        match message {
            Message::Error(err) => self.ready.push_back(Err(err)),
            Message::Batch { seq, batch } => {
                if self.window.is_none() || seq == self.next_seq {
                    self.ready.push_back(Ok(batch));
                } else {
                    self.buffered.entry(seq).or_default().0.push(batch);
                }
            }
            Message::TaskDone { seq } => {
                let Some(window) = self.window.clone() else {
                    return;
                };
                if seq != self.next_seq {
                    self.buffered.entry(seq).or_default().1 = true;
                    return;
                }
                self.next_seq += 1;
                while let Some((batches, done)) = self.buffered.remove(&self.next_seq) {
                    self.ready.extend(batches.into_iter().map(Ok));
                    if !done {
                        break;
                    }
                    self.next_seq += 1;
                }
                window.advance(self.next_seq);
            }
        }
    }

    /// The next item to hand out. The stream ends after an error.
    fn pop(&mut self) -> Option<Result<RecordBatch>> {
        if self.done || self.cancel.is_cancelled() {
            self.done = true;
            return None;
        }
        let item = self.ready.pop_front()?;
        if item.is_err() {
            self.done = true;
            self.cancel.cancel();
        }
        Some(item)
    }

    /// The channel closed: every worker has exited.
    fn close(&mut self) {
        if !self.buffered.is_empty() {
            debug!(
                "Scan ended with {} tasks unfinished",
                self.buffered.len()
            );
        }
        self.done = true;
    }
}

/// The batches of a running scan.
///
/// Iterating blocks the calling thread until the workers produce the next
/// batch; [`ScanStream::into_stream`] adapts it for async consumers.
/// Dropping the stream cancels the scan.
pub struct ScanStream {
    schema: SchemaRef,
    receiver: mpsc::Receiver<Message>,
    pending: Pending,
    stats: Arc<ScanStats>,
    cancel: CancellationToken,
    // Cancels the workers before the pool is dropped.
    _guard: DropGuard,
    _pool: rayon::ThreadPool,
}

impl std::fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStream")
            .field("schema", &self.schema)
            .field("stats", &self.stats)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn run_worker(
    context: &TaskContext,
    queue: &Mutex<VecDeque<ScanTask>>,
    sender: &mpsc::Sender<Message>,
    stop: &CancellationToken,
    window: Option<&ReorderWindow>,
) {
    while !stop.is_cancelled() {
        let task = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(task) = task else {
            return;
        };
        if window.is_some_and(|window| !window.wait(task.seq, stop)) {
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| context.run(&task)))
            .unwrap_or_else(|payload| {
                Err(Error::internal(
                    format!(
                        "scan task {} panicked: {}",
                        task.seq,
                        panic_message(payload.as_ref())
                    ),
                    location!(),
                ))
            });
        match result {
            Ok(batches) => {
                for batch in batches {
                    let message = Message::Batch {
                        seq: task.seq,
                        batch,
                    };
                    if sender.blocking_send(message).is_err() {
                        return;
                    }
                }
                if sender
                    .blocking_send(Message::TaskDone { seq: task.seq })
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                stop.cancel();
                let _ = sender.blocking_send(Message::Error(err));
                return;
            }
        }
    }
}

impl ScanStream {
    /// Start `workers` threads working through `tasks`.
    pub(crate) fn start(
        context: TaskContext,
        tasks: Vec<ScanTask>,
        workers: usize,
        ordered: bool,
    ) -> Result<Self> {
        let workers = workers.clamp(1, tasks.len().max(1));
        debug!("Starting scan of {} tasks on {} workers", tasks.len(), workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("h5db-scan-{index}"))
            .build()
            .map_err(|err| {
                Error::internal(format!("failed to start scan workers: {err}"), location!())
            })?;

        let (sender, receiver) = mpsc::channel(workers * 2);
        // A failing worker stops its peers through the child token; only the
        // consumer cancels the stream itself.
        let cancel = CancellationToken::new();
        let stop_workers = cancel.child_token();
        let schema = context.schema.clone();
        let stats = context.stats.clone();
        let context = Arc::new(context);
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let window = ordered.then(|| Arc::new(ReorderWindow::new(workers * 2)));
        for _ in 0..workers {
            let context = context.clone();
            let queue = queue.clone();
            let sender = sender.clone();
            let stop = stop_workers.clone();
            let window = window.clone();
            pool.spawn(move || {
                run_worker(&context, &queue, &sender, &stop, window.as_deref());
                // Sources must be released before the stream sees the channel close.
                drop(context);
                drop(sender);
            });
        }

        Ok(Self {
            schema,
            receiver,
            pending: Pending::new(window, cancel.clone()),
            stats,
            _guard: cancel.clone().drop_guard(),
            cancel,
            _pool: pool,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn stats(&self) -> Arc<ScanStats> {
        self.stats.clone()
    }

    /// Stop the scan. Workers finish the task they are on and exit; the
    /// stream ends.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume the scan as an async stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<RecordBatch>> {
        let Self {
            receiver,
            pending,
            _guard: guard,
            _pool: pool,
            ..
        } = self;
        let messages = ReceiverStream::new(receiver);
        futures::stream::unfold(
            (messages, pending, guard, pool),
            |(mut messages, mut pending, guard, pool)| async move {
                loop {
                    if let Some(item) = pending.pop() {
                        return Some((item, (messages, pending, guard, pool)));
                    }
                    if pending.done {
                        return None;
                    }
                    match messages.next().await {
                        Some(message) => pending.accept(message),
                        None => pending.close(),
                    }
                }
            },
        )
        .boxed()
    }
}

impl Iterator for ScanStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop() {
                return Some(item);
            }
            if self.pending.done {
                return None;
            }
            match self.receiver.blocking_recv() {
                Some(message) => self.pending.accept(message),
                None => self.pending.close(),
            }
        }
    }
}
