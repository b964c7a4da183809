//! Single-flight execution for token renewal.
//!
//! The proactive timer and the reactive interceptor both renew through
//! [`SingleFlight::run`]; whichever arrives while a renewal is in flight
//! awaits that same future instead of issuing a second refresh call.
//!
//! The work runs in its own task. Dropping every waiter does not cancel
//! it, so a refresh the server has already answered is never lost.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;

/// The spawned work panicked or was aborted before producing a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("in-flight task ended without a result: {0}")]
pub struct FlightAborted(String);

type FlightResult<T> = Result<T, FlightAborted>;
type SharedFlight<T> = Shared<BoxFuture<'static, FlightResult<T>>>;
type Slot<T> = Arc<Mutex<Option<SharedFlight<T>>>>;

pub struct SingleFlight<T: Clone> {
    slot: Slot<T>,
}

/// Empties the slot when the spawned task finishes, panics included
struct Release<T: Clone>(Slot<T>);

impl<T: Clone> Drop for Release<T> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight call, or start one with `start`.
    ///
    /// `start` is only invoked when nothing is in flight. Its future is
    /// spawned, so it runs to completion even if every caller goes away.
    /// The slot empties itself as the task ends, so the next caller starts
    /// fresh and nothing the work captured outlives it.
    pub async fn run<F, Fut>(&self, start: F) -> FlightResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let work = start();
                    let release = Release(Arc::clone(&self.slot));
                    let task = tokio::spawn(async move {
                        let _release = release;
                        work.await
                    });
                    let flight = async move {
                        task.await.map_err(|e| FlightAborted(e.to_string()))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}
