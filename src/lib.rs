//! # fulcrum
//!
//! A small HTTP service kernel: a router, a middleware pipeline that never
//! lets a failure escape as anything but a response, and a set of optional
//! concerns for sessions, CSRF, CORS, health checks, databases and HTML.
//!
//! ## The pipeline
//!
//! ```text
//! request → Context → global middleware → router → route middleware → decorators → handler
//! ```
//!
//! Between every two layers sits an Invariant Enforcer. Whatever the inner
//! layer did (returned a string, returned JSON, returned nothing, returned
//! `Err`, panicked) the outer layer receives an [`Envelope`] with a status,
//! a `content-type` and a `connection` header already decided:
//!
//! | Inner layer | Status | `content-type` |
//! |---|---|---|
//! | `Ok("text")` | 200 | `text/plain; charset=utf-8` |
//! | `Ok(Json(..))` | 200 | `application/json; charset=utf-8` |
//! | `Ok(())` | 204 | `text/plain; charset=utf-8` |
//! | `Err(failure)` | the failure's status, else 500 | `application/json; charset=utf-8` |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use fulcrum::concerns::{log::Log, ping::Ping};
//! use fulcrum::{App, Context, Failure, Json};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fulcrum::Error> {
//!     let app = App::from_env()?
//!         .middleware(Log)
//!         .middleware(Ping)
//!         .route("GET /hello/:name", greeting)
//!         .route("POST /users", create_user);
//!
//!     fulcrum::run(app).await
//! }
//!
//! async fn greeting(cx: Context) -> Result<String, Failure> {
//!     Ok(format!("hello {}", cx.param("name").unwrap_or_default()))
//! }
//!
//! async fn create_user(cx: Context) -> Result<Json<serde_json::Value>, Failure> {
//!     let body = cx.body().await?;
//!     Ok(Json(serde_json::json!({ "created": body["name"] })))
//! }
//! ```

mod accepts;
mod app;
mod compose;
mod context;
mod cookie;
mod envelope;
mod error;
mod failure;
mod handler;
mod invariant;
mod method;
mod route;
mod router;
mod server;

pub mod body;
pub mod concerns;
pub mod config;
pub mod logging;
pub mod middleware;
pub mod testing;

pub use accepts::Accepts;
pub use app::{App, Service};
pub use body::{BodyParser, BodyParserLayer, ContentType};
pub use compose::LatencyThresholds;
pub use config::{RuntimeMode, Settings};
pub use context::Context;
pub use cookie::{Cookie, CookieJar, SameSite};
pub use envelope::{BodyStream, BoxError, Envelope, IntoEnvelope, Json, Payload};
pub use error::Error;
pub use failure::{Failure, FailureKind};
pub use handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler, Outcome};
pub use invariant::Shutdown;
pub use method::Method;
pub use route::Route;
pub use router::{Found, Matcher, RouteMatch, Router, VersionedMatcher};
pub use server::{Server, run};
