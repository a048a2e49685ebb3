//! An engine that runs asynchronous requests with bounded concurrency.
//!
//! Identical requests submitted while one of them is running share its outcome, and the outcomes
//! of the most recent cacheable requests are kept around so later identical requests do not have
//! to run at all. See [`engine`] for the details.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod engine;
pub mod request;
pub mod ring_buffer;

pub use engine::{Engine, EngineStats};
pub use request::{Request, RequestResult};
