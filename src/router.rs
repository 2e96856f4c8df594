//! Radix-tree request router.
//!
//! One tree per method and version, O(path-length) lookup via [`matchit`].
//! The router is the terminal of the global middleware chain: it resolves the
//! route, attaches [`RouteMatch`] metadata to the [`Context`] and calls the
//! route's pre-composed handler.
//!
//! Per-route wrapping happens once, at build time:
//!
//! ```text
//! route middleware ─▶ E ─▶ decorator₁ ─▶ E ─▶ decorator₂ ─▶ E ─▶ handler
//! ```
//!
//! Path syntax: `/users/:id` binds `id`, a trailing `*` binds everything
//! after it under the name `*`. matchit's own `{id}` / `{*rest}` syntax is
//! accepted as-is.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use matchit::Router as MatchitRouter;
use percent_encoding::percent_decode_str;
use tracing::debug;

use crate::body::{BodyParser, build_body_parser};
use crate::compose::{LatencyThresholds, Spacing, build_layers, compose};
use crate::concerns::headers::Vary;
use crate::context::Context;
use crate::error::Error;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, Handler, Outcome, from_outcome_fn};
use crate::invariant::Shutdown;
use crate::method::Method;
use crate::route::Route;

/// Request header selecting a route version.
pub const VERSION_HEADER: &str = "accept-version";

const WILDCARD: &str = "*";
const WILDCARD_SLOT: &str = "__wildcard";

// ── Match metadata ────────────────────────────────────────────────────────────

/// What matched, attached to the [`Context`] before the handler runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteMatch {
    pub method: Method,
    pub pattern: String,
    pub version: Option<String>,
    pub decorators: Vec<String>,
    pub middleware: Vec<String>,
    pub params: BTreeMap<String, String>,
}

// ── Matcher ───────────────────────────────────────────────────────────────────

/// A successful lookup: the route's registration index and its parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Found {
    pub route: usize,
    pub params: BTreeMap<String, String>,
}

/// Route lookup policy.
///
/// The default, [`VersionedMatcher`], prefers a route registered for the
/// exact requested version and falls back to the unversioned one. Swap in
/// another implementation with [`Router::with_matcher`] for semver ranges or
/// stricter precedence.
pub trait Matcher: Send + Sync + 'static {
    /// Registers `route` at `pattern` (already in matchit syntax).
    fn insert(
        &mut self,
        method: Method,
        pattern: &str,
        version: Option<&str>,
        route: usize,
    ) -> Result<(), String>;

    fn find(&self, method: Method, path: &str, version: Option<&str>) -> Option<Found>;
}

/// matchit trees keyed by method and version.
#[derive(Default)]
pub struct VersionedMatcher {
    trees: HashMap<(Method, Option<String>), MatchitRouter<usize>>,
}

impl VersionedMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, method: Method, path: &str, version: Option<&str>) -> Option<Found> {
        let tree = self.trees.get(&(method, version.map(str::to_owned)))?;
        let matched = tree.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| {
                let k = if k == WILDCARD_SLOT { WILDCARD } else { k };
                (k.to_owned(), decode_param(v))
            })
            .collect();
        Some(Found { route: *matched.value, params })
    }
}

impl Matcher for VersionedMatcher {
    fn insert(
        &mut self,
        method: Method,
        pattern: &str,
        version: Option<&str>,
        route: usize,
    ) -> Result<(), String> {
        self.trees
            .entry((method, version.map(str::to_owned)))
            .or_default()
            .insert(pattern, route)
            .map_err(|e| e.to_string())
    }

    fn find(&self, method: Method, path: &str, version: Option<&str>) -> Option<Found> {
        if let Some(version) = version {
            if let Some(found) = self.lookup(method, path, Some(version)) {
                return Some(found);
            }
        }
        self.lookup(method, path, None)
    }
}

/// Percent-decodes a bound value. Bytes that do not decode to UTF-8 leave
/// the value as it arrived.
fn decode_param(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map_or_else(|_| raw.to_owned(), Cow::into_owned)
}

/// `/users/:id/*` → `/users/{id}/{*__wildcard}`.
fn to_matchit(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if segment == WILDCARD {
                format!("{{*{WILDCARD_SLOT}}}")
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

// ── Router ────────────────────────────────────────────────────────────────────

/// The application router.
///
/// Register routes once at startup; hand the router to
/// [`App::router`](crate::App::router). Each call returns `self` so
/// registrations chain naturally.
pub struct Router {
    routes: Vec<Route>,
    matcher: Box<dyn Matcher>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_matcher(VersionedMatcher::new())
    }

    pub fn with_matcher(matcher: impl Matcher) -> Self {
        Self { routes: Vec::new(), matcher: Box::new(matcher) }
    }

    /// Registers a declared route.
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Shorthand for an undecorated route.
    ///
    /// ```rust,no_run
    /// # use fulcrum::{Context, Failure, Method, Router};
    /// # async fn get_user(_: Context) -> Result<(), Failure> { Ok(()) }
    /// # async fn create_user(_: Context) -> Result<(), Failure> { Ok(()) }
    /// Router::new()
    ///     .on(Method::Get,  "/users/:id", get_user)
    ///     .on(Method::Post, "/users",     create_user);
    /// ```
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route(Route::new(path, handler).method(method))
    }

    /// Composes every route and builds the match table.
    pub(crate) async fn build(
        self,
        shutdown: &Shutdown,
        latency: Option<LatencyThresholds>,
    ) -> Result<Table, Error> {
        let Router { routes, mut matcher } = self;
        let mut entries = Vec::with_capacity(routes.len());

        for route in routes {
            let (methods, path) = route.target()?;
            let pattern = to_matchit(&path);
            let Route { version, mut handler, mut middleware, decorators, body_parsers, .. } = route;

            if !decorators.is_empty() {
                handler = compose(&decorators, handler, "handler", &Spacing::decorators(shutdown.clone()));
            }

            if version.is_some() {
                middleware.push(Box::new(Vary::new([VERSION_HEADER])));
            }
            let middleware_names: Vec<String> = middleware.iter().map(|f| f.name()).collect();
            if !middleware.is_empty() {
                let layers = build_layers(middleware).await?;
                let spacing = Spacing::middleware(shutdown.clone(), latency);
                handler = compose(&layers, handler, &path, &spacing);
            }

            let decorator_names: Vec<String> = decorators.iter().map(|d| d.name().to_owned()).collect();
            let body_parser = body_parsers.as_deref().map(build_body_parser);

            for method in methods {
                let index = entries.len();
                matcher
                    .insert(method, &pattern, version.as_deref(), index)
                    .map_err(|reason| Error::InvalidRoute {
                        route: format!("{method} {path}"),
                        reason,
                    })?;
                debug!(%method, %path, version = version.as_deref().unwrap_or("*"), "route registered");
                entries.push(Entry {
                    method,
                    pattern: path.clone(),
                    version: version.clone(),
                    decorators: decorator_names.clone(),
                    middleware: middleware_names.clone(),
                    body_parser: body_parser.clone(),
                    handler: Arc::clone(&handler),
                });
            }
        }

        Ok(Table { matcher, entries })
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

// ── Match table ───────────────────────────────────────────────────────────────

struct Entry {
    method: Method,
    pattern: String,
    version: Option<String>,
    decorators: Vec<String>,
    middleware: Vec<String>,
    body_parser: Option<BodyParser>,
    handler: BoxedHandler,
}

/// The built router: match structure plus pre-composed handlers.
pub(crate) struct Table {
    matcher: Box<dyn Matcher>,
    entries: Vec<Entry>,
}

impl Table {
    /// `"METHOD /pattern"` for every registered route, in registration order.
    pub(crate) fn available(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| match &e.version {
                Some(v) => format!("{} {} (version {v})", e.method, e.pattern),
                None => format!("{} {}", e.method, e.pattern),
            })
            .collect()
    }

    /// The router as the terminal handler of the global chain.
    pub(crate) fn into_handler(self: Arc<Self>) -> BoxedHandler {
        from_outcome_fn(move |cx| {
            let table = Arc::clone(&self);
            async move { table.dispatch(cx).await }
        })
    }

    async fn dispatch(&self, cx: Context) -> Outcome {
        let path = cx.path();
        let Some(found) = self.matcher.find(cx.method(), &path, cx.header(VERSION_HEADER)) else {
            return Err(Failure::not_found(cx.method().as_str(), path));
        };
        let Some(entry) = self.entries.get(found.route) else {
            return Err(Failure::not_found(cx.method().as_str(), path));
        };

        if let Some(parser) = &entry.body_parser {
            cx.set_body_parser(parser.clone());
        }
        cx.set_route(RouteMatch {
            method: entry.method,
            pattern: entry.pattern.clone(),
            version: entry.version.clone(),
            decorators: entry.decorators.clone(),
            middleware: entry.middleware.clone(),
            params: found.params,
        });

        entry.handler.call(cx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::failure::FailureKind;
    use crate::middleware::{Next, from_fn};
    use crate::testing::{context, context_with};

    async fn greeting(cx: Context) -> Result<String, Failure> {
        Ok(format!("hello {}", cx.param("name").unwrap_or_default()))
    }

    async fn table(router: Router) -> Arc<Table> {
        Arc::new(router.build(&Shutdown::new(), None).await.unwrap())
    }

    #[test]
    fn colon_params_translate_to_matchit() {
        assert_eq!(to_matchit("/hello/:name"), "/hello/{name}");
        assert_eq!(to_matchit("/static/*"), "/static/{*__wildcard}");
        assert_eq!(to_matchit("/users/{id}"), "/users/{id}");
    }

    #[tokio::test]
    async fn params_bind_by_name() {
        let handler = table(Router::new().route(Route::new("GET /hello/:name", greeting)))
            .await
            .into_handler();
        let envelope = handler.call(context("GET", "/hello/world")).await.unwrap();
        assert_eq!(envelope.payload().as_text(), Some("hello world"));
    }

    #[tokio::test]
    async fn params_are_percent_decoded() {
        let handler = table(Router::new().route(Route::new("GET /hello/:name", greeting)))
            .await
            .into_handler();
        let envelope = handler.call(context("GET", "/hello/John%20Doe")).await.unwrap();
        assert_eq!(envelope.payload().as_text(), Some("hello John Doe"));

        let envelope = handler.call(context("GET", "/hello/caf%C3%A9")).await.unwrap();
        assert_eq!(envelope.payload().as_text(), Some("hello café"));

        let envelope = handler.call(context("GET", "/hello/%FF%FE")).await.unwrap();
        assert_eq!(envelope.payload().as_text(), Some("hello %FF%FE"));
    }

    #[test]
    fn undecodable_params_stay_raw() {
        assert_eq!(decode_param("a%2Fb"), "a/b");
        assert_eq!(decode_param("plus+sign"), "plus+sign");
        assert_eq!(decode_param("%C3%28"), "%C3%28");
    }

    #[tokio::test]
    async fn wildcard_binds_the_rest() {
        async fn rest(cx: Context) -> Result<String, Failure> {
            Ok(cx.param("*").unwrap_or_default().to_owned())
        }
        let handler = table(Router::new().route(Route::new("GET /files/*", rest))).await.into_handler();
        let envelope = handler.call(context("GET", "/files/a/b.txt")).await.unwrap();
        assert_eq!(envelope.payload().as_text(), Some("a/b.txt"));
    }

    #[tokio::test]
    async fn misses_carry_method_and_path() {
        let handler = table(Router::new().route(Route::new("GET /a", greeting))).await.into_handler();
        let failure = handler.call(context("POST", "/a")).await.unwrap_err();
        assert_eq!(failure.status(), Some(http::StatusCode::NOT_FOUND));
        assert_eq!(failure.message(), "Could not find route for POST /a");
        assert!(matches!(
            failure.kind(),
            FailureKind::NotFound { method, path } if method == "POST" && path == "/a"
        ));
    }

    #[tokio::test]
    async fn metadata_is_attached_before_the_handler_runs() {
        async fn introspect(cx: Context) -> Result<Envelope, Failure> {
            let matched = cx.route().ok_or_else(|| Failure::new("no route"))?;
            Ok(Envelope::json(serde_json::json!({
                "pattern": matched.pattern,
                "decorators": matched.decorators,
                "middleware": matched.middleware,
                "params": matched.params,
            })))
        }
        let passthrough = || from_fn("passthrough", |cx: Context, next: Next| async move { next.run(cx).await });
        let route = Route::new("PUT /things/:id", introspect)
            .decorator(passthrough())
            .middleware(passthrough());
        let handler = table(Router::new().route(route)).await.into_handler();

        let cx = context("PUT", "/things/9");
        let envelope = handler.call(cx.clone()).await.unwrap();
        assert_eq!(
            envelope.payload().as_json(),
            Some(&serde_json::json!({
                "pattern": "/things/:id",
                "decorators": ["passthrough"],
                "middleware": ["passthrough"],
                "params": {"id": "9"},
            }))
        );
        assert_eq!(cx.route().map(|m| m.method), Some(Method::Put));
    }

    #[tokio::test]
    async fn versions_select_routes_and_vary() {
        async fn v1(_: Context) -> Result<&'static str, Failure> { Ok("v1") }
        async fn v2(_: Context) -> Result<&'static str, Failure> { Ok("v2") }
        let handler = table(
            Router::new()
                .route(Route::new("GET /api", v1))
                .route(Route::new("GET /api", v2).version("2.0.0")),
        )
        .await
        .into_handler();

        let plain = handler.call(context("GET", "/api")).await.unwrap();
        assert_eq!(plain.payload().as_text(), Some("v1"));
        assert_eq!(plain.header("vary"), None);

        let versioned = handler
            .call(context_with("GET", "/api", &[(VERSION_HEADER, "2.0.0")], ""))
            .await
            .unwrap();
        assert_eq!(versioned.payload().as_text(), Some("v2"));
        assert_eq!(versioned.header("vary"), Some("accept-version"));

        let unknown = handler
            .call(context_with("GET", "/api", &[(VERSION_HEADER, "9.0.0")], ""))
            .await
            .unwrap();
        assert_eq!(unknown.payload().as_text(), Some("v1"));
    }

    #[tokio::test]
    async fn decorators_wrap_outermost_first_with_enforcement_between() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tag = |name: &'static str| {
            let order = Arc::clone(&order);
            from_fn(name, move |cx: Context, next: Next| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(name);
                    let envelope = next.run(cx).await?;
                    order.lock().push(if envelope.is_failed() { "saw-failed" } else { "saw-ok" });
                    Ok::<_, Failure>(envelope)
                }
            })
        };
        async fn boom(_: Context) -> Result<(), Failure> {
            Err(Failure::bad_request("nope"))
        }
        let route = Route::new("POST /x", boom).decorator(tag("outer")).decorator(tag("inner"));
        let handler = table(Router::new().route(route)).await.into_handler();

        let envelope = handler.call(context("POST", "/x")).await.unwrap();
        assert!(envelope.is_failed());
        assert_eq!(envelope.status_code(), http::StatusCode::BAD_REQUEST);
        assert_eq!(*order.lock(), ["outer", "inner", "saw-failed", "saw-failed"]);
    }

    #[tokio::test]
    async fn conflicting_routes_fail_the_build() {
        let router = Router::new()
            .route(Route::new("GET /a/:x", greeting))
            .route(Route::new("GET /a/:y", greeting));
        let err = router.build(&Shutdown::new(), None).await.err();
        assert!(matches!(err, Some(Error::InvalidRoute { .. })));
    }

    #[tokio::test]
    async fn available_lists_registrations() {
        let table = table(
            Router::new()
                .route(Route::new("/", greeting).methods([Method::Get, Method::Head]))
                .route(Route::new("POST /v", greeting).version("1")),
        )
        .await;
        assert_eq!(table.available(), ["GET /", "HEAD /", "POST /v (version 1)"]);
    }
}
