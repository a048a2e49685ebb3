//! The deduplicating, throttled request engine.
//!
//! Every submitted [`Request`] goes through a single dispatcher, which decides atomically whether
//!
//! - an identical request is already in flight, in which case the new request waits for its
//!   outcome,
//! - a recent outcome for the request's ID is cached, in which case that is delivered right away,
//! - or the request has to run. It then becomes the *representative* of its ID, waits for a slot
//!   of the throttle and runs.
//!
//! When a representative completes with a cacheable outcome, the outcome is cached and handed to
//! every request that waited for it. Requests that waited for a non-cacheable outcome are admitted
//! again, one after the other, as if they had just been submitted.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::RecencyCache;
use crate::config::{ConfigError, EngineConfig};
use crate::request::{Request, RequestResult};

/// A snapshot of the engine's bookkeeping, see [`Engine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Request IDs whose representative is running or waiting for a throttle slot.
    pub in_flight: usize,
    /// Duplicates waiting for the outcome of an in-flight representative.
    pub waiting: usize,
    /// Outcomes held by the recency cache.
    pub cached: usize,
}

/// Runs [`Request`]s with bounded concurrency, deduplicating identical ones.
///
/// See the [module documentation](self) for how requests are dispatched.
pub struct Engine<R: Request> {
    queue: mpsc::Sender<R>,
    inner: Arc<EngineInner<R>>,
}

struct EngineInner<R: Request> {
    /// The class table and the cache, behind one lock so lookups and updates are atomic.
    state: Mutex<EngineState<R>>,
    throttle: Semaphore,
    concurrency_limit: u32,
    /// Tracks the dispatcher and every task it spawns.
    tasks: TaskTracker,
    stopped: CancellationToken,
}

struct EngineState<R: Request> {
    /// Duplicates waiting on the in-flight representative of each request ID.
    classes: HashMap<String, Vec<R>>,
    cache: RecencyCache<R::Output, R::Error>,
}

impl<R: Request> EngineState<R> {
    fn stats(&self) -> EngineStats {
        EngineStats {
            in_flight: self.classes.len(),
            waiting: self.classes.values().map(Vec::len).sum(),
            cached: self.cache.len(),
        }
    }
}

impl<R: Request> Engine<R> {
    /// Creates an engine caching up to `cache_capacity` outcomes and running at most
    /// `concurrency_limit` requests at a time.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(cache_capacity: usize, concurrency_limit: usize) -> Result<Self, ConfigError> {
        let config = EngineConfig::new(cache_capacity, concurrency_limit)?;
        Ok(Self::from_config(&config))
    }

    /// Creates an engine from its configuration and starts its dispatcher.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &EngineConfig) -> Self {
        let concurrency_limit = config.concurrency_limit.get();
        let state = EngineState {
            classes: HashMap::new(),
            cache: RecencyCache::new(config.cache_capacity),
        };
        let inner = Arc::new(EngineInner {
            state: Mutex::new(state),
            throttle: Semaphore::new(concurrency_limit as usize),
            concurrency_limit,
            tasks: TaskTracker::new(),
            stopped: CancellationToken::new(),
        });

        let (queue, requests) = mpsc::channel(config.queue_size.get());
        inner.tasks.spawn(Arc::clone(&inner).dispatch(requests));

        tracing::debug!(
            cache_capacity = config.cache_capacity.get(),
            concurrency_limit,
            queue_size = config.queue_size.get(),
            "Request engine started"
        );

        Self { queue, inner }
    }

    /// Submits a request.
    ///
    /// This waits while the admission queue is full, but never for the request itself to run.
    /// Requests submitted after [`stop`](Self::stop) was called are dropped.
    pub async fn add_request(&self, request: R) {
        if self.inner.stopped.is_cancelled() {
            drop_request(&request);
            return;
        }

        if let Err(mpsc::error::SendError(request)) = self.queue.send(request).await {
            drop_request(&request);
        }
    }

    /// Stops the engine.
    ///
    /// Requests that were submitted before are still served. This waits until all of them have
    /// completed and all throttle slots are returned. No request is run after this returns.
    pub async fn stop(&self) {
        self.inner.stopped.cancel();
        self.inner.tasks.close();

        tracing::debug!(
            outstanding = self.inner.tasks.len(),
            "Waiting for outstanding requests"
        );
        self.inner.tasks.wait().await;

        // All tasks are done at this point, so this only fails if we were stopped before.
        let permits = self
            .inner
            .throttle
            .acquire_many(self.inner.concurrency_limit)
            .await;
        self.inner.throttle.close();
        drop(permits);

        tracing::debug!("Request engine stopped");
    }

    /// Returns a snapshot of the in-flight and cached requests.
    pub fn stats(&self) -> EngineStats {
        self.inner.state.lock().unwrap().stats()
    }
}

impl<R: Request> fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self
            .inner
            .state
            .try_lock()
            .map(|state| state.stats())
            .unwrap_or_default();
        f.debug_struct("Engine")
            .field("in-flight", &stats.in_flight)
            .field("waiting", &stats.waiting)
            .field("cached", &stats.cached)
            .field("free slots", &self.inner.throttle.available_permits())
            .field("stopped", &self.inner.stopped.is_cancelled())
            .finish()
    }
}

fn drop_request<R: Request>(request: &R) {
    tracing::trace!(id = request.id(), "Dropping request submitted after stop");
    metric!(counter("requests.dropped") += 1);
}

impl<R: Request> EngineInner<R> {
    async fn dispatch(self: Arc<Self>, mut requests: mpsc::Receiver<R>) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.admit(request),
                    // the engine was dropped without being stopped
                    None => return,
                },
                _ = self.stopped.cancelled() => break,
            }
        }

        // Requests that made it into the queue before `stop` are still served.
        requests.close();
        while let Some(request) = requests.recv().await {
            self.admit(request);
        }
    }

    /// Joins `request` to its in-flight class, answers it from the cache, or starts running it.
    fn admit(self: &Arc<Self>, request: R) {
        metric!(counter("requests.admitted") += 1);
        let id = request.id().to_owned();

        let cached = {
            let mut state = self.state.lock().unwrap();

            if let Some(waiting) = state.classes.get_mut(&id) {
                tracing::trace!(id = %id, "Joining in-flight request");
                metric!(counter("requests.deduplicated") += 1);
                waiting.push(request);
                return;
            }

            match state.cache.find(&id) {
                Ok(entry) => Some(Arc::clone(&entry.result)),
                Err(_) => {
                    state.classes.insert(id.clone(), Vec::new());
                    None
                }
            }
        };

        match cached {
            Some(result) => {
                tracing::trace!(id = %id, "Serving request from cache");
                metric!(counter("requests.cache.hit") += 1);
                self.tasks.spawn(async move { deliver(vec![request], &result) });
            }
            None => {
                metric!(counter("requests.cache.miss") += 1);
                self.tasks.spawn(Arc::clone(self).execute(id, request));
            }
        }
    }

    /// Runs a representative and hands its outcome to the requests that waited for it.
    async fn execute(self: Arc<Self>, id: String, request: R) {
        let Ok(permit) = self.throttle.acquire().await else {
            // `stop` only closes the throttle after every task has finished.
            tracing::error!(id = %id, "Throttle closed while a request was waiting for it");
            self.take_class(&id);
            return;
        };
        metric!(
            gauge("requests.in_flight") =
                u64::from(self.concurrency_limit) - self.throttle.available_permits() as u64
        );

        tracing::trace!(id = %id, "Running request");
        let start = Instant::now();
        let Some(result) = run_isolated(&request).await else {
            tracing::error!(id = %id, "Request panicked while running");
            metric!(counter("requests.panicked") += 1);
            drop(request);

            let waiting = self.take_class(&id);
            self.resubmit(waiting);
            drop(permit);
            return;
        };
        metric!(
            timer("requests.run.duration") = start.elapsed(),
            "status" => if result.is_ok() { "ok" } else { "error" },
        );

        let cacheable = panic::catch_unwind(AssertUnwindSafe(|| request.cacheable()))
            .unwrap_or_else(|_| {
                tracing::error!(id = %id, "Request panicked in `cacheable`, not caching it");
                metric!(counter("requests.panicked") += 1);
                false
            });

        let result = Arc::new(result);
        let waiting = {
            let mut state = self.state.lock().unwrap();
            if cacheable {
                state.cache.insert(id.clone(), Arc::clone(&result));
            }
            state.classes.remove(&id).unwrap_or_default()
        };
        tracing::debug!(
            id = %id,
            cacheable,
            waiting = waiting.len(),
            "Request completed"
        );

        if cacheable {
            deliver(waiting, &result);
        } else {
            self.resubmit(waiting);
        }

        drop(permit);
    }

    fn take_class(&self, id: &str) -> Vec<R> {
        let mut state = self.state.lock().unwrap();
        state.classes.remove(id).unwrap_or_default()
    }

    /// Admits requests that waited for an outcome they cannot reuse.
    ///
    /// These bypass the admission queue, so they are served even while the engine stops.
    fn resubmit(self: &Arc<Self>, waiting: Vec<R>) {
        if waiting.is_empty() {
            return;
        }

        metric!(counter("requests.resubmitted") += waiting.len() as i64);
        for request in waiting {
            self.admit(request);
        }
    }
}

/// Runs `request`, returning `None` if it panicked.
///
/// `run` may panic before it returns its future as well as while the future is polled.
async fn run_isolated<R: Request>(request: &R) -> Option<RequestResult<R>> {
    let future = panic::catch_unwind(AssertUnwindSafe(|| request.run())).ok()?;
    AssertUnwindSafe(future).catch_unwind().await.ok()
}

/// Hands a copy of `result` to every request in `waiting`.
///
/// A request panicking while it receives its copy does not keep the others from theirs.
fn deliver<R: Request>(waiting: Vec<R>, result: &RequestResult<R>) {
    for request in waiting {
        let delivered =
            panic::catch_unwind(AssertUnwindSafe(|| request.set_result(result.clone())));
        if delivered.is_err() {
            tracing::error!(id = request.id(), "Request panicked while receiving its result");
            metric!(counter("requests.panicked") += 1);
        }
    }
}
