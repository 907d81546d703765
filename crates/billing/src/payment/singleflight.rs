//! Request coalescing keyed by an identifier
//!
//! The first caller for a key becomes the leader and runs the work. Callers that
//! arrive while it is in flight wait for the leader's result instead of running
//! the work again. Once the leader finishes the key is released, so a later call
//! starts a fresh flight.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::error::{BillingError, BillingResult};

type Slot<T> = watch::Receiver<Option<BillingResult<T>>>;

pub struct SingleFlight<K, T> {
    calls: Mutex<HashMap<K, Slot<T>>>,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<K, Slot<T>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.calls().len()
    }

    /// Run `work` for `key`, or join the flight already running for it
    pub async fn run<F, Fut>(&self, key: K, work: F) -> BillingResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let (mut slot, leader) = {
            let mut calls = self.calls();
            match calls.get(&key) {
                Some(slot) => (slot.clone(), None),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.clone(), rx.clone());
                    (rx, Some(tx))
                }
            }
        };

        if let Some(tx) = leader {
            return self.lead(key, tx, work).await;
        }

        let outcome = match slot.wait_for(Option::is_some).await {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| Err(BillingError::Cancelled("in-flight call vanished".into()))),
            Err(_) => Err(BillingError::Cancelled(
                "leading call was dropped before completing".into(),
            )),
        };
        outcome
    }

    async fn lead<F, Fut>(
        &self,
        key: K,
        tx: watch::Sender<Option<BillingResult<T>>>,
        work: F,
    ) -> BillingResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        // releases the key if this future is dropped mid-flight; waiters then
        // see the sender close and report cancellation
        let mut guard = Release {
            flight: self,
            key: Some(key),
        };

        let result = work().await;

        guard.release();
        tx.send_replace(Some(result.clone()));
        result
    }
}

struct Release<'a, K: Eq + Hash, T> {
    flight: &'a SingleFlight<K, T>,
    key: Option<K>,
}

impl<K: Eq + Hash, T> Release<'_, K, T> {
    fn release(&mut self) {
        if let Some(key) = self.key.take() {
            self.flight
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
    }
}

impl<K: Eq + Hash, T> Drop for Release<'_, K, T> {
    fn drop(&mut self) {
        self.release();
    }
}
