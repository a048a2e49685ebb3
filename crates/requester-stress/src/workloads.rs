use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use rand::Rng;
use requester_service::{Request, RequestResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        Self::from_reader(file)
    }

    fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Self =
            serde_yaml::from_reader(reader).context("failed to parse workloads YAML")?;
        for (i, workload) in config.workloads.iter().enumerate() {
            anyhow::ensure!(
                (0.0..=1.0).contains(&workload.failure_rate),
                "workload {i}: failure_rate must be between 0 and 1"
            );
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// How many requests of this workload are outstanding at any time.
    pub concurrency: NonZeroUsize,
    /// How many different request IDs the workload draws from.
    pub distinct_ids: NonZeroUsize,
    /// How long running a single request takes.
    #[serde(with = "humantime_serde")]
    pub work: Duration,
    /// Whether request outcomes may be shared and cached.
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    /// The probability of a run failing.
    #[serde(default)]
    pub failure_rate: f64,
}

fn default_cacheable() -> bool {
    true
}

impl Workload {
    /// Creates a request with a random ID out of this workload's ID space.
    ///
    /// `prefix` keeps the IDs of different workloads apart.
    pub fn make_request(
        &self,
        prefix: usize,
        counters: &Arc<Counters>,
    ) -> (SyntheticRequest, oneshot::Receiver<SyntheticResult>) {
        let mut rng = rand::rng();
        let id = format!(
            "workload-{prefix}/{}",
            rng.random_range(0..self.distinct_ids.get())
        );
        let fails = rng.random_bool(self.failure_rate);

        let (sender, receiver) = oneshot::channel();
        let request = SyntheticRequest {
            id,
            work: self.work,
            cacheable: self.cacheable,
            fails,
            counters: Arc::clone(counters),
            done: Mutex::new(Some(sender)),
        };
        (request, receiver)
    }
}

/// Counts how the requests of one workload were served.
#[derive(Debug, Default)]
pub struct Counters {
    /// Requests that were run.
    pub runs: AtomicUsize,
    /// Requests that got the outcome of another request.
    pub shared: AtomicUsize,
    /// Requests whose outcome was a failure.
    pub failures: AtomicUsize,
}

#[derive(Debug, Clone, Error)]
#[error("synthetic failure of {0}")]
pub struct SyntheticError(String);

pub type SyntheticResult = Result<Arc<str>, SyntheticError>;

/// A request that sleeps instead of doing actual work.
pub struct SyntheticRequest {
    id: String,
    work: Duration,
    cacheable: bool,
    fails: bool,
    counters: Arc<Counters>,
    done: Mutex<Option<oneshot::Sender<SyntheticResult>>>,
}

impl SyntheticRequest {
    fn complete(&self, result: SyntheticResult) {
        if result.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(done) = self.done.lock().unwrap().take() {
            done.send(result).ok();
        }
    }
}

impl Request for SyntheticRequest {
    type Output = Arc<str>;
    type Error = SyntheticError;

    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self) -> BoxFuture<'_, RequestResult<Self>> {
        Box::pin(async move {
            tokio::time::sleep(self.work).await;
            self.counters.runs.fetch_add(1, Ordering::Relaxed);

            let result = if self.fails {
                Err(SyntheticError(self.id.clone()))
            } else {
                Ok(Arc::from(self.id.as_str()))
            };
            self.complete(result.clone());
            result
        })
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    fn set_result(&self, result: RequestResult<Self>) {
        self.counters.shared.fetch_add(1, Ordering::Relaxed);
        self.complete(result);
    }
}
