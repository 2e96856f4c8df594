//! Cross-origin resource sharing.
//!
//! Checks the request's `Origin` against an allow-list, answers `OPTIONS`
//! preflights with an empty `204` without calling further in, and attaches
//! the three `Access-Control-Allow-*` headers to everything else.
//!
//! ```rust,no_run
//! use fulcrum::concerns::cors::Cors;
//!
//! let cors = Cors::new()
//!     .origins(["https://example.com"])
//!     .methods(["GET", "POST"])
//!     .headers(["content-type"]);
//! ```

use std::sync::Arc;

use http::StatusCode;

use crate::config::{Env, RuntimeMode};
use crate::envelope::Envelope;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::method::Method;
use crate::middleware::Middleware;

const ANY: &str = "*";

/// CORS settings, and the middleware applying them.
#[derive(Clone, Debug, Default)]
pub struct Cors {
    origins: Vec<String>,
    methods: Vec<String>,
    headers: Vec<String>,
}

impl Cors {
    /// Allows nothing until configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `CORS_ALLOW_ORIGINS`, `CORS_ALLOW_METHODS` and
    /// `CORS_ALLOW_HEADERS`. Outside production every origin is allowed.
    pub fn from_env(env: &Env, mode: RuntimeMode) -> Self {
        let origins = if mode.is_development() {
            vec![ANY.to_owned()]
        } else {
            env.list("CORS_ALLOW_ORIGINS")
        };
        Self {
            origins,
            methods: env.list("CORS_ALLOW_METHODS"),
            headers: env.list("CORS_ALLOW_HEADERS"),
        }
    }

    pub fn origins<S: Into<String>>(mut self, origins: impl IntoIterator<Item = S>) -> Self {
        self.origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn methods<S: Into<String>>(mut self, methods: impl IntoIterator<Item = S>) -> Self {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn headers<S: Into<String>>(mut self, headers: impl IntoIterator<Item = S>) -> Self {
        self.headers = headers.into_iter().map(Into::into).collect();
        self
    }

    fn allows_any(&self) -> bool {
        self.origins.iter().any(|o| o == ANY)
    }

    /// The `Access-Control-Allow-Origin` value for `origin`, or `None` when
    /// it is not allowed.
    fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allows_any() {
            return Some(ANY.to_owned());
        }
        let origin = origin?;
        self.origins.iter().any(|o| o == origin).then(|| origin.to_owned())
    }

    fn decorate(&self, envelope: &mut Envelope, allow_origin: &str) {
        envelope.insert_header("access-control-allow-origin", allow_origin);
        envelope.insert_header("access-control-allow-methods", &self.methods.join(","));
        envelope.insert_header("access-control-allow-headers", &self.headers.join(","));
    }
}

impl Middleware for Cors {
    fn name(&self) -> &str {
        "cors"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let cors = Arc::new(self.clone());
        from_outcome_fn(move |cx| {
            let next = next.clone();
            let cors = Arc::clone(&cors);
            async move {
                let Some(allow_origin) = cors.allow_origin(cx.header("origin")) else {
                    return Err(Failure::bad_request("Origin not allowed"));
                };

                let mut envelope = if cx.method() == Method::Options {
                    Envelope::status(StatusCode::NO_CONTENT)
                } else {
                    next.call(cx).await?
                };
                cors.decorate(&mut envelope, &allow_origin);
                Ok::<_, Failure>(envelope)
            }
        })
    }
}
