//! High-throughput usage aggregation
//!
//! Producers call [`UsageAggregator::ingest`], which never blocks: events go onto a
//! bounded queue and are dropped when it is full. A fixed pool of workers folds
//! queued events into per-`(tenant, usage type)` buckets, and a ticker flushes the
//! buckets to the [`UsageStore`] on a fixed interval.
//!
//! Locking: the bucket map mutex covers lookup, creation and the flush swap only.
//! Each bucket has its own mutex for the increment. Flush seals every bucket it
//! swapped out, so a worker that raced the swap sees the seal and re-resolves its
//! bucket in the fresh map instead of writing into a batch already in flight.

use meterbook_shared::{BillingPeriod, UsageType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AggregatorConfig;
use crate::error::{BillingError, BillingResult};
use crate::store::{FlushOutcome, UsageStore};
use crate::usage::models::{FlushBatch, UsageEvent, UsageRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub tenant_id: Uuid,
    pub usage_type: UsageType,
}

#[derive(Debug, Default)]
struct BucketState {
    count: i64,
    sealed: bool,
}

#[derive(Debug, Default)]
struct Bucket {
    state: Mutex<BucketState>,
}

type BucketMap = HashMap<BucketKey, Arc<Bucket>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happened to an ingested event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    /// quantity <= 0
    DroppedInvalid,
    /// The queue was full. Load is shed at the producer; the event is lost.
    DroppedQueueFull,
    DroppedShuttingDown,
}

/// Report of one successful flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub batch_id: Uuid,
    pub records: usize,
    pub outcome: FlushOutcome,
}

pub struct UsageAggregator {
    config: AggregatorConfig,
    store: Arc<dyn UsageStore>,
    sender: mpsc::Sender<UsageEvent>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<UsageEvent>>>,
    buckets: Arc<Mutex<BucketMap>>,
    flush_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl UsageAggregator {
    pub fn new(config: AggregatorConfig, store: Arc<dyn UsageStore>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            store,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            buckets: Arc::new(Mutex::new(HashMap::new())),
            flush_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Spawn the worker pool and the periodic flush ticker
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            tracing::warn!("Usage aggregator already started");
            return;
        }

        tracing::info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            flush_interval_secs = self.config.flush_interval.as_secs(),
            "Starting usage aggregator"
        );

        for worker_id in 0..self.config.workers {
            let receiver = Arc::clone(&self.receiver);
            let buckets = Arc::clone(&self.buckets);
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(run_worker(worker_id, receiver, buckets, shutdown)));
        }

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.flush_interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.flush().await {
                            tracing::error!(error = %e, "Periodic usage flush failed");
                        }
                    }
                }
            }
        }));
    }

    /// Queue an event without blocking
    pub fn ingest(&self, event: UsageEvent) -> IngestOutcome {
        if event.quantity <= 0 {
            tracing::warn!(
                tenant_id = %event.tenant_id,
                usage_type = %event.usage_type,
                quantity = event.quantity,
                "Dropping usage event with non-positive quantity"
            );
            return IngestOutcome::DroppedInvalid;
        }
        if self.shutdown.is_cancelled() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::DroppedShuttingDown;
        }

        match self.sender.try_send(event) {
            Ok(()) => IngestOutcome::Queued,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tenant_id = %event.tenant_id,
                    usage_type = %event.usage_type,
                    "Usage queue full, dropping event"
                );
                IngestOutcome::DroppedQueueFull
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::DroppedShuttingDown
            }
        }
    }

    /// Events discarded because the queue was full or the aggregator was stopping
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Quantity buffered in memory for a bucket and not yet flushed
    pub fn pending(&self, key: BucketKey) -> i64 {
        let bucket = lock(&self.buckets).get(&key).cloned();
        bucket.map_or(0, |b| {
            let count = lock(&b.state).count;
            count
        })
    }

    /// Swap out the buckets and persist them.
    ///
    /// Retries with linear backoff. If every attempt fails the data is merged
    /// back into the live buckets so the next flush picks it up.
    pub async fn flush(&self) -> BillingResult<Option<FlushSummary>> {
        let _serial = self.flush_lock.lock().await;

        let drained = std::mem::take(&mut *lock(&self.buckets));
        let period = BillingPeriod::current();
        let records: Vec<UsageRecord> = drained
            .into_iter()
            .filter_map(|(key, bucket)| {
                let count = {
                    let mut state = lock(&bucket.state);
                    state.sealed = true;
                    state.count
                };
                (count > 0).then_some(UsageRecord {
                    tenant_id: key.tenant_id,
                    usage_type: key.usage_type,
                    total_quantity: count,
                    period,
                })
            })
            .collect();

        if records.is_empty() {
            return Ok(None);
        }

        let batch = FlushBatch {
            batch_id: Uuid::new_v4(),
            records,
        };
        let max_attempts = self.config.flush_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.config.flush_timeout, self.store.flush(&batch)).await {
                Ok(Ok(outcome)) => {
                    tracing::info!(
                        batch_id = %batch.batch_id,
                        records = batch.records.len(),
                        ?outcome,
                        attempt,
                        "Flushed usage batch"
                    );
                    return Ok(Some(FlushSummary {
                        batch_id: batch.batch_id,
                        records: batch.records.len(),
                        outcome,
                    }));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("store flush timed out after {:?}", self.config.flush_timeout)
                }
            }

            tracing::warn!(
                batch_id = %batch.batch_id,
                attempt,
                max_attempts,
                error = %last_error,
                "Usage flush attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.config.flush_backoff * attempt).await;
            }
        }

        for record in &batch.records {
            let key = BucketKey {
                tenant_id: record.tenant_id,
                usage_type: record.usage_type,
            };
            add_to_bucket(&self.buckets, key, record.total_quantity);
        }

        tracing::error!(
            batch_id = %batch.batch_id,
            records = batch.records.len(),
            error = %last_error,
            "Usage flush failed, batch merged back for the next flush"
        );
        Err(BillingError::Database(format!(
            "usage flush failed after {max_attempts} attempts: {last_error}"
        )))
    }

    /// Stop the workers after they drain the queue, then flush one last time
    pub async fn stop(&self) -> BillingResult<Option<FlushSummary>> {
        tracing::info!("Stopping usage aggregator");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Usage aggregator task panicked");
            }
        }

        // events that raced past the shutdown check
        drain_queue(&self.receiver, &self.buckets).await;

        self.flush().await
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<UsageEvent>>>,
    buckets: Arc<Mutex<BucketMap>>,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker_id, "Usage worker started");
    loop {
        let event = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                event = rx.recv() => event,
            }
        };
        match event {
            Some(event) => apply_event(&buckets, &event),
            None => break,
        }
    }

    drain_queue(&receiver, &buckets).await;
    tracing::debug!(worker_id, "Usage worker stopped");
}

async fn drain_queue(
    receiver: &tokio::sync::Mutex<mpsc::Receiver<UsageEvent>>,
    buckets: &Mutex<BucketMap>,
) {
    loop {
        let next = receiver.lock().await.try_recv().ok();
        match next {
            Some(event) => apply_event(buckets, &event),
            None => break,
        }
    }
}

fn apply_event(buckets: &Mutex<BucketMap>, event: &UsageEvent) {
    tracing::trace!(event_id = %event.id, tenant_id = %event.tenant_id, "Applying usage event");
    let key = BucketKey {
        tenant_id: event.tenant_id,
        usage_type: event.usage_type,
    };
    add_to_bucket(buckets, key, event.quantity);
}

fn add_to_bucket(buckets: &Mutex<BucketMap>, key: BucketKey, quantity: i64) {
    loop {
        let bucket = Arc::clone(lock(buckets).entry(key).or_default());
        let mut state = lock(&bucket.state);
        if state.sealed {
            // swapped out by a flush between lookup and increment
            continue;
        }
        state.count = state.count.checked_add(quantity).unwrap_or_else(|| {
            tracing::error!(
                tenant_id = %key.tenant_id,
                usage_type = %key.usage_type,
                quantity,
                "Usage bucket overflow, clamping at i64::MAX"
            );
            i64::MAX
        });
        return;
    }
}
