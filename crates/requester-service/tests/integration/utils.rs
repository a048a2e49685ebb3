use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use requester_service::{Engine, Request, RequestResult};
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
/// Initializes logs so that all console output of the engine is captured by the test runner.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("requester_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request failed: {0}")]
pub struct TestError(pub String);

pub type Outcome = Result<String, TestError>;

/// How a [`TestRequest`] learned about its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The request was run itself.
    Ran(Outcome),
    /// The outcome of another request was handed to it.
    Shared(Outcome),
}

/// Where a [`TestRequest`] panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicAt {
    /// In `run`, before its future is created.
    RunStart,
    /// At the end of the future returned by `run`.
    RunEnd,
    /// In `cacheable`.
    Cacheable,
    /// In `set_result`.
    SetResult,
}

/// Counts the runs of all [`TestRequest`]s sharing it.
#[derive(Debug, Default)]
pub struct Probe {
    runs: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Probe {
    /// How many runs were started.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// The highest number of runs that were in progress at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An instrumented request.
///
/// By default it completes right away with a cacheable `Ok("result of {id}")`.
pub struct TestRequest {
    id: String,
    outcome: Outcome,
    cacheable: bool,
    panic_at: Option<PanicAt>,
    work: Duration,
    gate: Option<Arc<Semaphore>>,
    probe: Arc<Probe>,
    delivery: Mutex<Option<oneshot::Sender<Delivery>>>,
}

impl TestRequest {
    pub fn new(id: &str, probe: &Arc<Probe>) -> Self {
        Self {
            id: id.to_owned(),
            outcome: Ok(format!("result of {id}")),
            cacheable: true,
            panic_at: None,
            work: Duration::ZERO,
            gate: None,
            probe: Arc::clone(probe),
            delivery: Mutex::new(None),
        }
    }

    pub fn returning(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn non_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Keeps the run going until a permit is added to `gate`. Each run consumes one permit.
    pub fn gated(mut self, gate: &Arc<Semaphore>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub fn working_for(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn panicking(mut self, panic_at: PanicAt) -> Self {
        self.panic_at = Some(panic_at);
        self
    }

    fn panic_if(&self, panic_at: PanicAt) {
        if self.panic_at == Some(panic_at) {
            panic!("request {} exploded ({panic_at:?})", self.id);
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let sender = self.delivery.lock().unwrap().take();
        let sender = sender.expect("outcome delivered twice");
        sender.send(delivery).ok();
    }
}

impl Request for TestRequest {
    type Output = String;
    type Error = TestError;

    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self) -> BoxFuture<'_, RequestResult<Self>> {
        self.panic_if(PanicAt::RunStart);

        Box::pin(async move {
            self.probe.enter();
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.probe.exit();

            self.panic_if(PanicAt::RunEnd);

            self.deliver(Delivery::Ran(self.outcome.clone()));
            self.outcome.clone()
        })
    }

    fn cacheable(&self) -> bool {
        self.panic_if(PanicAt::Cacheable);
        self.cacheable
    }

    fn set_result(&self, result: RequestResult<Self>) {
        self.panic_if(PanicAt::SetResult);
        self.deliver(Delivery::Shared(result));
    }
}

/// Submits `request` and returns the receiver of its outcome.
///
/// The receiver errors if the engine dropped the request without an outcome.
pub async fn submit(
    engine: &Engine<TestRequest>,
    request: TestRequest,
) -> oneshot::Receiver<Delivery> {
    let (sender, receiver) = oneshot::channel();
    *request.delivery.lock().unwrap() = Some(sender);
    engine.add_request(request).await;
    receiver
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within 5 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("condition not reached in time");
}
