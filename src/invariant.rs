//! The Invariant Enforcer.
//!
//! Wraps one layer and turns whatever it did into a normalized [`Envelope`]:
//!
//! 1. Await the layer. An `Err` or a panic is the *subject* as a failure;
//!    otherwise the returned envelope is.
//! 2. Status: an explicit tag wins; else failed → 500, empty → 204, value → 200.
//! 3. Headers: tags are kept; `content-type` is filled from the payload shape
//!    only if absent; `connection` reflects the [`Shutdown`] state.
//! 4. Return the subject as a value. Never re-throw.
//!
//! An empty payload is coerced to an empty byte buffer, so every enforced
//! envelope carries bytes, a stream, text or a structured value.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::FutureExt;
use http::header::{CONNECTION, CONTENT_TYPE, HeaderValue};
use http::StatusCode;
use tracing::error;

use crate::envelope::{Envelope, Payload};
use crate::failure::Failure;
use crate::handler::{BoxFuture, BoxedHandler, Outcome, from_outcome_fn};
use crate::middleware::Middleware;

// ── Shutdown state ────────────────────────────────────────────────────────────

/// Process-wide draining flag.
///
/// Set once when a shutdown signal arrives; read on every response to decide
/// the `connection` header. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts draining. Idempotent.
    pub fn begin(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Enforcer ──────────────────────────────────────────────────────────────────

/// The enforcer as a middleware, spliced around every layer by the compositor.
#[derive(Clone, Debug)]
pub struct Invariants {
    shutdown: Shutdown,
}

impl Invariants {
    pub fn new(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }
}

impl Middleware for Invariants {
    fn name(&self) -> &str {
        "invariants"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let shutdown = self.shutdown.clone();
        from_outcome_fn(move |cx| {
            let fut = next.call(cx);
            let shutdown = shutdown.clone();
            async move { Ok::<_, Failure>(enforce(fut, &shutdown).await) }
        })
    }
}

/// Awaits `layer` and normalizes its outcome. Never fails, never panics.
pub async fn enforce(layer: BoxFuture<'static, Outcome>, shutdown: &Shutdown) -> Envelope {
    let mut envelope = match AssertUnwindSafe(layer).catch_unwind().await {
        Ok(Ok(envelope)) => envelope,
        Ok(Err(failure)) => Envelope::from_failure(failure),
        Err(panic) => {
            let failure = Failure::from_panic(panic);
            error!(message = failure.message(), "layer panicked");
            Envelope::from_failure(failure)
        }
    };
    normalize(&mut envelope, shutdown);
    envelope
}

fn normalize(envelope: &mut Envelope, shutdown: &Shutdown) {
    if envelope.explicit_status().is_none() {
        let status = if envelope.is_failed() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else if envelope.payload().is_empty_value() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::OK
        };
        envelope.set_status(status);
    }

    if !envelope.has_content_type() {
        let content_type = envelope.default_content_type();
        envelope
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    if !envelope.headers().contains_key(CONNECTION) {
        let connection = if shutdown.is_draining() { "close" } else { "keep-alive" };
        envelope
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static(connection));
    }

    if envelope.payload().is_empty_value() {
        envelope.set_payload(Payload::Bytes(Bytes::new()));
    }
}
