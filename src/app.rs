//! Application assembly.
//!
//! An [`App`] collects global middleware, routes and body parsers. Building it
//! runs every middleware factory once, composes the pipeline and yields a
//! [`Service`]: the one function the server calls per request.
//!
//! ```rust,no_run
//! use fulcrum::concerns::{log::Log, ping::Ping};
//! use fulcrum::{App, Context, Failure, Settings};
//!
//! async fn greeting(cx: Context) -> Result<String, Failure> {
//!     Ok(format!("hello {}", cx.param("name").unwrap_or_default()))
//! }
//!
//! # async fn run() -> Result<(), fulcrum::Error> {
//! let service = App::new(Settings::default())
//!     .middleware(Log)
//!     .middleware(Ping)
//!     .route("GET /hello/:name", greeting)
//!     .build()
//!     .await?;
//! # Ok(()) }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::body::{BodyParser, BodyParserLayer, build_body_parser, default_parsers};
use crate::compose::{LatencyThresholds, Spacing, build_layers, compose};
use crate::config::Settings;
use crate::context::Context;
use crate::envelope::{BodyStream, Envelope, Payload};
use crate::error::Error;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, Handler};
use crate::invariant::{Shutdown, enforce};
use crate::middleware::MiddlewareFactory;
use crate::route::Route;
use crate::router::Router;

/// The application builder.
pub struct App {
    settings: Settings,
    middleware: Vec<Box<dyn MiddlewareFactory>>,
    router: Router,
    body_parsers: Vec<BodyParserLayer>,
    shutdown: Shutdown,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            middleware: Vec::new(),
            router: Router::new(),
            body_parsers: default_parsers(),
            shutdown: Shutdown::new(),
        }
    }

    /// An app configured from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(Settings::from_env()?))
    }

    /// Appends a global middleware. The first one added is the outermost.
    pub fn middleware(mut self, factory: impl MiddlewareFactory) -> Self {
        self.middleware.push(Box::new(factory));
        self
    }

    /// Replaces the router.
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Registers a route on the current router. `declaration` is `"METHOD /path"`
    /// or a bare path for `GET`.
    pub fn route(self, declaration: &str, handler: impl Handler) -> Self {
        self.declare(Route::new(declaration, handler))
    }

    /// Registers a fully declared route.
    pub fn declare(mut self, route: Route) -> Self {
        self.router = std::mem::take(&mut self.router).route(route);
        self
    }

    /// Replaces the application body parser chain. Routes may still override
    /// it with [`Route::body_parsers`].
    pub fn body_parsers(mut self, layers: Vec<BodyParserLayer>) -> Self {
        self.body_parsers = layers;
        self
    }

    /// Shares an existing shutdown flag instead of a fresh one.
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs every middleware factory, composes the pipeline and builds the
    /// route table. Any factory failure aborts with [`Error::Startup`].
    pub async fn build(self) -> Result<Service, Error> {
        let App { settings, middleware, router, body_parsers, shutdown } = self;
        let development = settings.mode.is_development();
        let latency: Option<LatencyThresholds> = development.then_some(settings.latency);

        let table = Arc::new(router.build(&shutdown, latency).await?);
        let available = table.available();

        let names: Vec<String> = middleware.iter().map(|f| f.name()).collect();
        let layers = build_layers(middleware).await?;
        let spacing = Spacing::middleware(shutdown.clone(), latency);
        let handler = compose(&layers, table.into_handler(), "router", &spacing);

        info!(
            service = %settings.service_name,
            mode = %settings.mode,
            middleware = ?names,
            routes = available.len(),
            "application built"
        );
        for route in &available {
            debug!(route = %route, "available");
        }

        Ok(Service {
            inner: Arc::new(ServiceInner {
                handler,
                body_parser: build_body_parser(&body_parsers),
                shutdown,
                available,
                development,
                secure_cookies: !development,
            }),
        })
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

/// The composed pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    handler: BoxedHandler,
    body_parser: BodyParser,
    shutdown: Shutdown,
    available: Vec<String>,
    development: bool,
    secure_cookies: bool,
}

impl Service {
    /// The shutdown flag every response consults.
    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    /// `"METHOD /pattern"` for every registered route.
    pub fn available(&self) -> &[String] {
        &self.inner.available
    }

    /// Handles one request end to end. Never fails: every failure ends up as
    /// a response.
    pub async fn respond(
        &self,
        req: http::Request<BodyStream>,
        remote: Option<SocketAddr>,
    ) -> http::Response<BodyStream> {
        let inner = &self.inner;
        let Some(cx) = Context::build(req, remote, inner.body_parser.clone(), inner.secure_cookies) else {
            let envelope = enforce(
                Box::pin(async {
                    Err::<Envelope, _>(
                        Failure::new("Method not allowed").with_status(http::StatusCode::METHOD_NOT_ALLOWED),
                    )
                }),
                &inner.shutdown,
            )
            .await;
            return envelope.into_http();
        };

        let mut envelope = enforce(inner.handler.call(cx.clone()), &inner.shutdown).await;

        if inner.development && envelope.is_failed() {
            self.attach_diagnostics(&cx, &mut envelope);
        }
        for cookie in cx.set_cookie_headers() {
            envelope.append_header("set-cookie", &cookie);
        }
        envelope.into_http()
    }

    /// Adds `stack` and `context` to a failed JSON body.
    fn attach_diagnostics(&self, cx: &Context, envelope: &mut Envelope) {
        let Some(stack) = envelope.failure().map(Failure::stack) else {
            return;
        };
        let context = json!({
            "route": cx.route().map(|m| json!({
                "method": m.method.as_str(),
                "pattern": m.pattern,
                "version": m.version,
                "decorators": m.decorators,
                "middleware": m.middleware,
            })),
            "available": self.inner.available,
            "params": cx.params(),
            "query": cx.query(),
        });
        if let Payload::Json(Value::Object(body)) = envelope.payload() {
            let mut body = body.clone();
            body.insert("stack".to_owned(), json!(stack));
            body.insert("context".to_owned(), context);
            envelope.set_payload(Payload::Json(Value::Object(body)));
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("routes", &self.inner.available.len())
            .field("development", &self.inner.development)
            .finish()
    }
}
