//! Middleware layer.
//!
//! A middleware intercepts a request on its way to the router and the
//! envelope on its way back. It is the right place for cross-cutting
//! concerns: access logging, CORS, CSRF, sessions, database transactions.
//!
//! Two traits, two lifetimes:
//!
//! | Trait | Runs | Produces |
//! |---|---|---|
//! | [`MiddlewareFactory`] | once, at startup, possibly async and fallible | a [`Middleware`] |
//! | [`Middleware`] | once per composition | a wrapped [`BoxedHandler`] |
//!
//! Every `Middleware` is trivially its own factory (the "bare" case). A
//! config struct that needs an async startup step, such as a database
//! connectivity check, implements `MiddlewareFactory` directly, or goes
//! through [`factory`] with a closure (the "factory plus config" case).
//!
//! ```rust,no_run
//! use fulcrum::middleware::{self, Next};
//! use fulcrum::{Context, Failure};
//!
//! let stamp = middleware::from_fn("stamp", |cx: Context, next: Next| async move {
//!     let mut envelope = next.run(cx).await?;
//!     envelope.insert_header("x-stamped", "1");
//!     Ok::<_, Failure>(envelope)
//! });
//! ```
//!
//! The layer never sees a thrown failure from `next`: the compositor places
//! an Invariant Enforcer between every pair of layers, so `next` always
//! resolves to an envelope, possibly a failed one.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::envelope::{BoxError, IntoEnvelope};
use crate::failure::Failure;
use crate::handler::{BoxFuture, BoxedHandler, Outcome, from_outcome_fn};

// ── Middleware ────────────────────────────────────────────────────────────────

/// A built middleware: wraps a continuation into a new handler.
pub trait Middleware: Send + Sync + 'static {
    /// Used by latency diagnostics and route metadata.
    fn name(&self) -> &str;

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler;
}

/// A route-scoped middleware.
///
/// Decorators are composed exactly like middleware but only with an Invariant
/// Enforcer between layers, never latency instrumentation. A decorator may
/// either fail (return `Err`) or return a failed envelope; both normalize the
/// same way.
pub use self::Middleware as Decorator;

// ── Factories ─────────────────────────────────────────────────────────────────

/// Builds a [`Middleware`] at startup. A failed build aborts startup.
#[async_trait]
pub trait MiddlewareFactory: Send + 'static {
    fn name(&self) -> String;

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError>;
}

#[async_trait]
impl<M: Middleware> MiddlewareFactory for M {
    fn name(&self) -> String {
        Middleware::name(self).to_owned()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        Ok(Arc::new(*self))
    }
}

/// A factory closure paired with its configuration.
pub struct Factory<C, F> {
    name: String,
    config: C,
    build: F,
}

/// Pairs an async constructor with the configuration it is called with.
///
/// ```rust,no_run
/// use fulcrum::middleware::{self, Next};
/// use fulcrum::{Context, Failure};
///
/// let greeter = middleware::factory("greeter", String::from("hi"), |greeting: String| async move {
///     Ok::<_, fulcrum::BoxError>(middleware::from_fn("greeter", move |cx: Context, next: Next| {
///         let greeting = greeting.clone();
///         async move {
///             let mut envelope = next.run(cx).await?;
///             envelope.insert_header("x-greeting", &greeting);
///             Ok::<_, Failure>(envelope)
///         }
///     }))
/// });
/// ```
pub fn factory<C, F, Fut, M>(name: impl Into<String>, config: C, build: F) -> Factory<C, F>
where
    C: Send + 'static,
    F: FnOnce(C) -> Fut + Send + 'static,
    Fut: Future<Output = Result<M, BoxError>> + Send + 'static,
    M: Middleware,
{
    Factory { name: name.into(), config, build }
}

#[async_trait]
impl<C, F, Fut, M> MiddlewareFactory for Factory<C, F>
where
    C: Send + 'static,
    F: FnOnce(C) -> Fut + Send + 'static,
    Fut: Future<Output = Result<M, BoxError>> + Send + 'static,
    M: Middleware,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        let Factory { config, build, .. } = *self;
        let middleware = build(config).await?;
        Ok(Arc::new(middleware))
    }
}

// ── Closure middleware ────────────────────────────────────────────────────────

/// The continuation handed to a [`from_fn`] middleware.
#[derive(Clone)]
pub struct Next(BoxedHandler);

impl Next {
    /// Calls the rest of the chain. Resolves to an envelope; a failure from
    /// further in has already been normalized into a failed one.
    pub fn run(&self, cx: Context) -> BoxFuture<'static, Outcome> {
        self.0.call(cx)
    }
}

/// A middleware built from a closure over `(Context, Next)`.
pub struct FnMiddleware<F> {
    name: String,
    f: Arc<F>,
}

/// Builds a [`Middleware`] from an async closure.
pub fn from_fn<F, Fut, R, E>(name: impl Into<String>, f: F) -> FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoEnvelope,
    E: Into<Failure>,
{
    FnMiddleware { name: name.into(), f: Arc::new(f) }
}

impl<F, Fut, R, E> Middleware for FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoEnvelope,
    E: Into<Failure>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let f = Arc::clone(&self.f);
        let next = Next(next);
        from_outcome_fn(move |cx| {
            let fut = f(cx, next.clone());
            async move { fut.await.map(IntoEnvelope::into_envelope).map_err(Into::<Failure>::into) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::testing::context;

    fn terminal() -> BoxedHandler {
        from_outcome_fn(|_cx| async { Ok::<_, Failure>(Envelope::text("inner")) })
    }

    #[tokio::test]
    async fn from_fn_wraps_the_continuation() {
        let mw = from_fn("stamp", |cx: Context, next: Next| async move {
            let mut envelope = next.run(cx).await?;
            envelope.insert_header("x-stamped", "1");
            Ok::<_, Failure>(envelope)
        });
        assert_eq!(Middleware::name(&mw), "stamp");

        let envelope = mw.wrap(terminal()).call(context("GET", "/")).await.unwrap();
        assert_eq!(envelope.header("x-stamped"), Some("1"));
        assert_eq!(envelope.payload().as_text(), Some("inner"));
    }

    #[tokio::test]
    async fn bare_middleware_is_its_own_factory() {
        let mw = from_fn("bare", |cx: Context, next: Next| async move { next.run(cx).await });
        let factory: Box<dyn MiddlewareFactory> = Box::new(mw);
        assert_eq!(factory.name(), "bare");
        let built = factory.build().await.unwrap();
        assert_eq!(built.name(), "bare");
    }

    #[tokio::test]
    async fn factories_receive_their_config() {
        let f = factory("configured", 7u8, |n: u8| async move {
            if n == 0 {
                return Err::<FnMiddleware<_>, BoxError>("zero".into());
            }
            Ok(from_fn("configured", move |_cx: Context, _next: Next| async move {
                Ok::<_, Failure>(format!("{n}"))
            }))
        });
        let built = Box::new(f).build().await.unwrap();
        let envelope = built.wrap(terminal()).call(context("GET", "/")).await.unwrap();
        assert_eq!(envelope.payload().as_text(), Some("7"));
    }
}
