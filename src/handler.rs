//! Handler trait and type erasure.
//!
//! # How handlers are stored
//!
//! Routes, decorators and middleware all wrap *different* concrete types, but
//! the pipeline needs to hold them uniformly. Each one is hidden behind a
//! trait object (`dyn ErasedHandler`) and passed around as a [`BoxedHandler`]:
//!
//! ```text
//! async fn hello(cx: Context) -> Result<String, Failure> { … }   ← user writes this
//!        ↓ Route::new("GET /", hello)
//! hello.into_boxed_handler()                                     ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                                     ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(cx)  at request time                              ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(cx).await.map(IntoEnvelope::into_envelope) })
//! ```
//!
//! A handler's `Ok` is "returned a value". Its `Err` is "threw": the nearest
//! Invariant Enforcer reshapes it into a failed envelope.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::envelope::{Envelope, IntoEnvelope};
use crate::failure::Failure;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future.
///
/// `Pin<Box<…>>` because the runtime polls it in place; `Send` so tokio may
/// move it across worker threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a single layer produces before enforcement: a value or a thrown
/// failure.
pub type Outcome = Result<Envelope, Failure>;

/// Dispatch interface shared by handlers, decorators and middleware layers.
pub trait ErasedHandler: Send + Sync {
    fn call(&self, cx: Context) -> BoxFuture<'static, Outcome>;
}

/// A type-erased handler shared across concurrent requests.
///
/// `Arc` gives cheap, thread-safe shared ownership: one atomic increment per
/// clone, no copy of the wrapped layer.
pub type BoxedHandler = Arc<dyn ErasedHandler>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is satisfied for any `async fn` with
/// the signature:
///
/// ```text
/// async fn name(cx: Context) -> Result<impl IntoEnvelope, impl Into<Failure>>
/// ```
///
/// The trait is **sealed**: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut, R, E> private::Sealed for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoEnvelope,
    E: Into<Failure>,
{
}

impl<F, Fut, R, E> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoEnvelope,
    E: Into<Failure>,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Bridges a concrete handler `F` to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R, E> ErasedHandler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoEnvelope,
    E: Into<Failure>,
{
    fn call(&self, cx: Context) -> BoxFuture<'static, Outcome> {
        let fut = (self.0)(cx);
        Box::pin(async move {
            fut.await.map(IntoEnvelope::into_envelope).map_err(Into::<Failure>::into)
        })
    }
}

/// Erases a closure that already speaks [`Outcome`]. Used by the pipeline's
/// own wrappers.
pub(crate) fn from_outcome_fn<F, Fut>(f: F) -> BoxedHandler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
