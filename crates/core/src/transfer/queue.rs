//! Bounded-concurrency transfer queue
//!
//! Transfers wait for a slot on a counting semaphore, stream their body,
//! and release the slot before their terminal state is published. The
//! visible list is kept in display order: active work first, then failed
//! and canceled items awaiting retry.
//!
//! Locks are always taken list first, then entry. No entry lock is held
//! while the list lock is acquired.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::traits::{ObjectStore, ProgressFn};

use super::exec;
use super::item::{Direction, TransferId, TransferRequest, TransferSnapshot, TransferState};
use super::ordering;

struct RunState {
    state: TransferState,
    progress: u8,
    bytes_transferred: u64,
    total_bytes: Option<u64>,
    /// Bumped for every scheduled run; updates from older runs are dropped
    generation: u64,
    scheduled: bool,
    token: CancellationToken,
}

struct TransferEntry {
    id: TransferId,
    request: TransferRequest,
    run: Mutex<RunState>,
}

impl TransferEntry {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot_of(&self, run: &RunState) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            direction: self.request.direction,
            bucket: self.request.bucket.clone(),
            key: self.request.key.clone(),
            local_path: self.request.local_path.clone(),
            progress: run.progress,
            state: run.state.clone(),
            bytes_transferred: run.bytes_transferred,
            total_bytes: run.total_bytes,
        }
    }

    fn snapshot(&self) -> TransferSnapshot {
        let run = self.lock();
        self.snapshot_of(&run)
    }
}

struct QueueInner {
    store: Arc<dyn ObjectStore>,
    items: RwLock<Vec<Arc<TransferEntry>>>,
    semaphore: RwLock<Arc<Semaphore>>,
    max_concurrent: AtomicUsize,
    retention: Duration,
    events: EventBus,
    shutdown: CancellationToken,
}

/// Upload/download queue with cancel, retry and display ordering
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    pub fn new(store: Arc<dyn ObjectStore>, config: &TransferConfig, events: EventBus) -> Self {
        let max = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(QueueInner {
                store,
                items: RwLock::new(Vec::new()),
                semaphore: RwLock::new(Arc::new(Semaphore::new(max))),
                max_concurrent: AtomicUsize::new(max),
                retention: config.completed_retention(),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a transfer as `Queued` without starting it
    pub fn enqueue(&self, request: TransferRequest) -> TransferId {
        let entry = Arc::new(TransferEntry {
            id: TransferId::new(),
            request,
            run: Mutex::new(RunState {
                state: TransferState::Queued,
                progress: 0,
                bytes_transferred: 0,
                total_bytes: None,
                generation: 0,
                scheduled: false,
                token: self.inner.shutdown.child_token(),
            }),
        });
        let id = entry.id;

        tracing::info!(
            id = %id,
            direction = %entry.request.direction,
            bucket = %entry.request.bucket,
            key = %entry.request.key,
            "Transfer queued"
        );

        self.inner.write_items().push(Arc::clone(&entry));
        self.inner.publish(&entry);
        id
    }

    /// Start a queued transfer.
    ///
    /// The handle resolves to the terminal state of this run; the run
    /// itself never returns an error.
    pub fn schedule(&self, id: TransferId) -> Result<JoinHandle<TransferState>> {
        let entry = self.inner.find(id)?;
        let (generation, token) = {
            let mut run = entry.lock();
            if run.state != TransferState::Queued || run.scheduled {
                return Err(Error::InvalidState(format!(
                    "transfer {id} cannot be scheduled while {}",
                    run.state
                )));
            }
            run.scheduled = true;
            run.generation += 1;
            (run.generation, run.token.clone())
        };

        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            inner.run(entry, generation, token).await
        }))
    }

    /// Enqueue and schedule in one step
    pub fn submit(&self, request: TransferRequest) -> Result<(TransferId, JoinHandle<TransferState>)> {
        let id = self.enqueue(request);
        let handle = self.schedule(id)?;
        Ok((id, handle))
    }

    /// Request cancellation, returning the state it leaves the transfer in.
    ///
    /// A queued transfer becomes `Canceled` at once and never takes a slot.
    /// A running one shows `Canceling` until it reaches its next I/O
    /// checkpoint. Terminal transfers are left alone.
    pub fn cancel(&self, id: TransferId) -> Result<TransferState> {
        let entry = self.inner.find(id)?;
        let (state, changed) = {
            let mut run = entry.lock();
            match run.state {
                TransferState::Queued => {
                    run.state = TransferState::Canceled;
                    run.token.cancel();
                    (run.state.clone(), true)
                }
                TransferState::Starting
                | TransferState::Uploading
                | TransferState::Downloading => {
                    run.state = TransferState::Canceling;
                    run.token.cancel();
                    (run.state.clone(), true)
                }
                _ => (run.state.clone(), false),
            }
        };

        if changed {
            tracing::info!(id = %id, state = %state, "Transfer cancel requested");
            self.inner.reposition(id);
            self.inner.publish(&entry);
        }
        Ok(state)
    }

    /// Reset a failed or canceled transfer to `Queued` and run it again
    pub fn retry(&self, id: TransferId) -> Result<JoinHandle<TransferState>> {
        let entry = self.inner.find(id)?;
        {
            let mut run = entry.lock();
            if !run.state.is_retryable() {
                return Err(Error::InvalidState(format!(
                    "transfer {id} cannot be retried while {}",
                    run.state
                )));
            }
            run.state = TransferState::Queued;
            run.progress = 0;
            run.bytes_transferred = 0;
            run.total_bytes = None;
            run.scheduled = false;
            run.token = self.inner.shutdown.child_token();
        }

        tracing::info!(id = %id, "Transfer retried");
        self.inner.publish(&entry);
        self.schedule(id)
    }

    /// Install a new limit for transfers that have not taken a slot yet.
    ///
    /// Running transfers keep their slot on the previous semaphore.
    pub fn set_max_concurrent(&self, max: usize) {
        let max = max.max(1);
        *self
            .inner
            .semaphore
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(Semaphore::new(max));
        self.inner.max_concurrent.store(max, Ordering::Release);
        tracing::info!(max_concurrent = max, "Transfer concurrency changed");
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::Acquire)
    }

    /// All visible transfers in display order
    pub fn snapshot(&self) -> Vec<TransferSnapshot> {
        self.inner
            .read_items()
            .iter()
            .map(|entry| entry.snapshot())
            .collect()
    }

    pub fn get(&self, id: TransferId) -> Option<TransferSnapshot> {
        self.inner.find(id).ok().map(|entry| entry.snapshot())
    }

    pub fn len(&self) -> usize {
        self.inner.read_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read_items().is_empty()
    }

    /// Drop a finished transfer from the visible list
    pub fn remove(&self, id: TransferId) -> Result<()> {
        let entry = self.inner.find(id)?;
        {
            let run = entry.lock();
            if !run.state.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "transfer {id} cannot be removed while {}",
                    run.state
                )));
            }
        }
        self.inner.remove_entry(&entry);
        Ok(())
    }

    /// Cancel every transfer and pending removal
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl QueueInner {
    fn read_items(&self) -> RwLockReadGuard<'_, Vec<Arc<TransferEntry>>> {
        self.items.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_items(&self) -> RwLockWriteGuard<'_, Vec<Arc<TransferEntry>>> {
        self.items.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn find(&self, id: TransferId) -> Result<Arc<TransferEntry>> {
        self.read_items()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transfer {id}")))
    }

    fn publish(&self, entry: &TransferEntry) {
        self.events.emit(CoreEvent::TransferUpdated(entry.snapshot()));
    }

    /// Move an entry to its display position under the list write lock
    fn reposition(&self, id: TransferId) {
        let mut items = self.write_items();
        let Some(index) = items.iter().position(|entry| entry.id == id) else {
            return;
        };
        let states: Vec<TransferState> = items.iter().map(|e| e.lock().state.clone()).collect();
        ordering::reposition(&mut items, &states, index);
    }

    fn remove_entry(&self, entry: &Arc<TransferEntry>) {
        let removed = {
            let mut items = self.write_items();
            let before = items.len();
            items.retain(|e| !Arc::ptr_eq(e, entry));
            items.len() != before
        };
        if removed {
            tracing::debug!(id = %entry.id, "Transfer removed from list");
            self.events.emit(CoreEvent::TransferRemoved(entry.id));
        }
    }

    async fn run(
        self: Arc<Self>,
        entry: Arc<TransferEntry>,
        generation: u64,
        token: CancellationToken,
    ) -> TransferState {
        let semaphore = self.current_semaphore();
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            let state = if token.is_cancelled() {
                TransferState::Canceled
            } else {
                TransferState::Failed("transfer queue closed".to_string())
            };
            return self.finish(&entry, generation, state);
        };

        let direction = entry.request.direction;
        if !self.advance(&entry, generation, TransferState::Starting)
            || !self.advance(&entry, generation, TransferState::running(direction))
        {
            drop(permit);
            return self.finish(&entry, generation, TransferState::Canceled);
        }

        tracing::info!(
            id = %entry.id,
            direction = %direction,
            bucket = %entry.request.bucket,
            key = %entry.request.key,
            "Transfer started"
        );

        let progress: ProgressFn = {
            let inner = Arc::clone(&self);
            let entry = Arc::clone(&entry);
            Arc::new(move |done: u64, total: u64| {
                inner.report_progress(&entry, generation, done, total)
            })
        };

        let result = match direction {
            Direction::Upload => {
                exec::upload(self.store.as_ref(), &entry.request, progress, &token).await
            }
            Direction::Download => {
                exec::download(self.store.as_ref(), &entry.request, progress, &token).await
            }
        };

        drop(permit);

        let state = match result {
            Ok(()) => TransferState::Complete,
            Err(e) if e.is_cancelled() || token.is_cancelled() => TransferState::Canceled,
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "Transfer failed");
                TransferState::Failed(e.to_string())
            }
        };
        self.finish(&entry, generation, state)
    }

    /// Step a run forward; false once the run was canceled or superseded
    fn advance(&self, entry: &TransferEntry, generation: u64, next: TransferState) -> bool {
        {
            let mut run = entry.lock();
            if run.generation != generation || run.token.is_cancelled() {
                return false;
            }
            let allowed = matches!(
                (&run.state, &next),
                (TransferState::Queued, TransferState::Starting)
                    | (
                        TransferState::Starting,
                        TransferState::Uploading | TransferState::Downloading
                    )
            );
            if !allowed {
                return false;
            }
            run.state = next;
        }

        self.reposition(entry.id);
        self.publish(entry);
        true
    }

    /// Publish the terminal state of a run
    fn finish(
        self: &Arc<Self>,
        entry: &Arc<TransferEntry>,
        generation: u64,
        state: TransferState,
    ) -> TransferState {
        {
            let mut run = entry.lock();
            if run.generation != generation {
                tracing::debug!(id = %entry.id, generation, "Ignoring stale transfer run");
                return run.state.clone();
            }
            if run.state.is_terminal() {
                return run.state.clone();
            }
            run.state = state.clone();
            if state == TransferState::Complete {
                run.progress = 100;
                if let Some(total) = run.total_bytes {
                    run.bytes_transferred = total;
                }
            }
        }

        tracing::info!(id = %entry.id, state = %state, "Transfer finished");
        self.reposition(entry.id);
        self.publish(entry);

        if state == TransferState::Complete {
            self.schedule_removal(Arc::clone(entry), generation);
        }
        state
    }

    fn report_progress(&self, entry: &TransferEntry, generation: u64, done: u64, total: u64) {
        let percent = if total > 0 {
            (u128::from(done.min(total)) * 100 / u128::from(total)) as u8
        } else {
            0
        };

        let snapshot = {
            let mut run = entry.lock();
            let running = matches!(
                run.state,
                TransferState::Uploading | TransferState::Downloading | TransferState::Canceling
            );
            if run.generation != generation || !running {
                return;
            }
            let more_bytes = done > run.bytes_transferred;
            run.bytes_transferred = run.bytes_transferred.max(done);
            if total > 0 {
                run.total_bytes = Some(total);
            }
            if percent > run.progress {
                run.progress = percent;
            } else if total > 0 || !more_bytes {
                return;
            }
            entry.snapshot_of(&run)
        };

        self.events.emit(CoreEvent::TransferUpdated(snapshot));
    }

    /// Drop a completed entry after the retention delay unless a newer
    /// run or an explicit removal got there first
    fn schedule_removal(self: &Arc<Self>, entry: Arc<TransferEntry>, generation: u64) {
        let inner = Arc::clone(self);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(retention) => {}
            }

            {
                let run = entry.lock();
                if run.generation != generation || run.state != TransferState::Complete {
                    return;
                }
            }
            inner.remove_entry(&entry);
        });
    }
}
