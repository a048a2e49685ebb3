use std::sync::Arc;

use futures::future::BoxFuture;

/// The outcome of running a [`Request`].
pub type RequestResult<R> = Result<<R as Request>::Output, <R as Request>::Error>;

/// A unit of work submitted to the [`Engine`](crate::engine::Engine).
///
/// Requests with equal [`id`](Self::id)s are considered duplicates of the same logical operation.
/// Of a group of duplicates submitted while one of them is executing, only that one is
/// [`run`](Self::run). The others receive its outcome through [`set_result`](Self::set_result),
/// provided the outcome is [`cacheable`](Self::cacheable).
///
/// Duplicates of a request with a non-cacheable outcome are run again, one after the other.
/// Implementations should therefore make non-cacheable requests idempotent.
///
/// Panics in any of these methods are contained. A request that panics in `run` or `set_result`
/// is dropped without an outcome, and one that panics in `cacheable` counts as non-cacheable.
pub trait Request: Send + Sync + 'static {
    /// The value produced by a successful run.
    type Output: Clone + Send + Sync + 'static;
    /// The error produced by a failed run.
    ///
    /// Errors are data to the engine: they are cached and shared just like outputs.
    type Error: Clone + Send + Sync + 'static;

    /// Identifies the logical operation this request performs.
    fn id(&self) -> &str;

    /// Performs the request.
    ///
    /// The request is expected to keep the outcome for itself. The engine never calls
    /// [`set_result`](Self::set_result) on a request it has run.
    fn run(&self) -> BoxFuture<'_, RequestResult<Self>>;

    /// Whether the outcome of [`run`](Self::run) may be reused for duplicates.
    ///
    /// Only called after `run` has completed.
    fn cacheable(&self) -> bool;

    /// Delivers the outcome of an identical request that was run in place of this one.
    fn set_result(&self, result: RequestResult<Self>);
}

impl<R: Request> Request for Arc<R> {
    type Output = R::Output;
    type Error = R::Error;

    fn id(&self) -> &str {
        (**self).id()
    }

    fn run(&self) -> BoxFuture<'_, RequestResult<Self>> {
        (**self).run()
    }

    fn cacheable(&self) -> bool {
        (**self).cacheable()
    }

    fn set_result(&self, result: RequestResult<Self>) {
        (**self).set_result(result)
    }
}
