//! Per-request context.
//!
//! One [`Context`] per inbound request. It wraps the transport-level request
//! and computes derived views lazily, at most once each:
//!
//! | Accessor | Memoized | Invalidated by |
//! |---|---|---|
//! | [`Context::url`] | yes | [`Context::set_url`] |
//! | [`Context::query`] | derived from `url` | - |
//! | [`Context::body`] | yes, including rejections | [`Context::set_body`] |
//! | [`Context::with_cookies`] | yes | - |
//! | [`Context::accepts`] | yes | - |
//!
//! `Context` is a cheap handle (`Arc` inside), so a middleware can keep a
//! clone across `next` and look at the request state afterwards. It is never
//! shared between requests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE, HOST};
use http::{HeaderMap, Uri};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::accepts::Accepts;
use crate::body::{BodyInput, BodyParser, ContentType};
use crate::cookie::CookieJar;
use crate::envelope::{BodyStream, full};
use crate::failure::Failure;
use crate::method::Method;
use crate::router::RouteMatch;

/// Header consulted first for the request id.
pub const TRACE_HEADER: &str = "x-trace-id";
/// Header consulted second for the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The per-request value object.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    start: Instant,
    started_at: SystemTime,
    remote: String,
    host: String,
    method: Method,
    version: http::Version,
    headers: HeaderMap,
    target: Mutex<String>,
    url: Mutex<Option<Uri>>,
    raw_body: Mutex<Option<BodyStream>>,
    body: tokio::sync::Mutex<Option<Result<Value, Failure>>>,
    body_parser: Mutex<BodyParser>,
    cookies: Mutex<Option<CookieJar>>,
    secure_cookies: bool,
    accepts: OnceLock<Accepts>,
    route: OnceLock<RouteMatch>,
    extensions: Mutex<http::Extensions>,
}

impl Context {
    /// Builds a context from a transport-level request.
    ///
    /// Returns `None` for methods outside RFC 9110; the server answers those
    /// with `405` before any pipeline runs.
    pub fn from_request(req: http::Request<BodyStream>, remote: Option<SocketAddr>) -> Option<Self> {
        Self::build(req, remote, BodyParser::default(), true)
    }

    pub(crate) fn build(
        req: http::Request<BodyStream>,
        remote: Option<SocketAddr>,
        body_parser: BodyParser,
        secure_cookies: bool,
    ) -> Option<Self> {
        let (parts, body) = req.into_parts();
        let method = Method::from_http(&parts.method)?;

        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
        let id = header(TRACE_HEADER)
            .or_else(|| header(REQUEST_ID_HEADER))
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.host())
            .map(strip_port)
            .unwrap_or_default()
            .to_owned();

        let remote = remote
            .map(|addr| addr.ip().to_canonical().to_string())
            .unwrap_or_default();

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        Some(Self {
            inner: Arc::new(Inner {
                id,
                start: Instant::now(),
                started_at: SystemTime::now(),
                remote,
                host,
                method,
                version: parts.version,
                headers: parts.headers,
                target: Mutex::new(target),
                url: Mutex::new(None),
                raw_body: Mutex::new(Some(body)),
                body: tokio::sync::Mutex::new(None),
                body_parser: Mutex::new(body_parser),
                cookies: Mutex::new(None),
                secure_cookies,
                accepts: OnceLock::new(),
                route: OnceLock::new(),
                extensions: Mutex::new(http::Extensions::new()),
            }),
        })
    }

    // ── Passthroughs ──────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn method(&self) -> Method {
        self.inner.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn version(&self) -> http::Version {
        self.inner.version
    }

    pub fn start(&self) -> Instant {
        self.inner.start
    }

    pub fn started_at(&self) -> SystemTime {
        self.inner.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.start.elapsed()
    }

    // ── URL ───────────────────────────────────────────────────────────────────

    /// The absolute request URL, parsed once.
    ///
    /// An unusable `Host` falls back to `localhost`; the path and query are
    /// always the request's own.
    pub fn url(&self) -> Uri {
        let mut cached = self.inner.url.lock();
        if let Some(url) = cached.as_ref() {
            return url.clone();
        }
        let target = self.inner.target.lock().clone();
        let absolute = |host: &str| {
            Uri::builder()
                .scheme("http")
                .authority(host)
                .path_and_query(target.as_str())
                .build()
        };
        let host = if self.inner.host.is_empty() { "localhost" } else { &self.inner.host };
        let url = absolute(host)
            .or_else(|_| absolute("localhost"))
            .unwrap_or_else(|_| Uri::from_static("http://localhost/"));
        *cached = Some(url.clone());
        url
    }

    /// Reassigns the request target (`/path?query`) and drops the cached URL.
    pub fn set_url(&self, target: impl Into<String>) {
        *self.inner.target.lock() = target.into();
        *self.inner.url.lock() = None;
    }

    /// The path of the request target, still percent-encoded.
    pub fn path(&self) -> String {
        let target = self.inner.target.lock();
        let path = target.split_once('?').map_or(target.as_str(), |(path, _)| path);
        if path.is_empty() { "/".to_owned() } else { path.to_owned() }
    }

    /// Query parameters. The last occurrence of a key wins.
    pub fn query(&self) -> BTreeMap<String, String> {
        let target = self.inner.target.lock();
        let pairs: Vec<(String, String)> = target
            .split_once('?')
            .and_then(|(_, q)| serde_urlencoded::from_str(q).ok())
            .unwrap_or_default();
        pairs.into_iter().collect()
    }

    // ── Body ──────────────────────────────────────────────────────────────────

    /// The parsed body.
    ///
    /// Runs the Body Parser Chain on first call only. Every later call, from
    /// any layer, gets a clone of the same result, including a rejection.
    pub async fn body(&self) -> Result<Value, Failure> {
        let mut slot = self.inner.body.lock().await;
        if let Some(result) = slot.as_ref() {
            return result.clone();
        }
        let raw = self.inner.raw_body.lock().take().unwrap_or_else(|| full(Bytes::new()));
        let parser = self.inner.body_parser.lock().clone();
        let content_type = ContentType::parse(self.header(CONTENT_TYPE.as_str()));
        let result = parser.parse(BodyInput::new(content_type, raw)).await;
        *slot = Some(result.clone());
        result
    }

    /// Replaces the memoized body, e.g. with a validation rejection.
    pub async fn set_body(&self, body: Result<Value, Failure>) {
        *self.inner.body.lock().await = Some(body);
    }

    pub(crate) fn set_body_parser(&self, parser: BodyParser) {
        *self.inner.body_parser.lock() = parser;
    }

    // ── Cookies & negotiation ─────────────────────────────────────────────────

    /// Runs `f` against the cookie jar, parsing the `Cookie` header on first
    /// use.
    pub fn with_cookies<R>(&self, f: impl FnOnce(&mut CookieJar) -> R) -> R {
        let mut jar = self.inner.cookies.lock();
        let jar = jar.get_or_insert_with(|| {
            CookieJar::parse(self.header(COOKIE.as_str()).unwrap_or_default(), self.inner.secure_cookies)
        });
        f(jar)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.with_cookies(|jar| jar.get(name).map(str::to_owned))
    }

    /// `Set-Cookie` values for the response. Empty when the jar was never
    /// touched.
    pub(crate) fn set_cookie_headers(&self) -> Vec<String> {
        self.inner.cookies.lock().as_ref().map(CookieJar::collect).unwrap_or_default()
    }

    pub(crate) fn secure_cookies(&self) -> bool {
        self.inner.secure_cookies
    }

    pub fn accepts(&self) -> &Accepts {
        self.inner.accepts.get_or_init(|| Accepts::parse(self.header("accept")))
    }

    // ── Route match ───────────────────────────────────────────────────────────

    /// What the router matched. `None` until routing has happened.
    pub fn route(&self) -> Option<&RouteMatch> {
        self.inner.route.get()
    }

    pub(crate) fn set_route(&self, matched: RouteMatch) {
        if self.inner.route.set(matched).is_err() {
            warn!(request_id = %self.id(), "route metadata already attached; keeping the first match");
        }
    }

    /// A named path parameter.
    ///
    /// For a route `/users/:id`, `cx.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.route()?.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> BTreeMap<String, String> {
        self.route().map(|m| m.params.clone()).unwrap_or_default()
    }

    // ── Attached capabilities ─────────────────────────────────────────────────

    /// Attaches a value for inner layers, e.g. a client handle.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.inner.extensions.lock().insert(value);
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.extensions.lock().get::<T>().cloned()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("target", &*self.inner.target.lock())
            .finish()
    }
}

/// `example.com:8080` → `example.com`, `[::1]:5000` → `[::1]`.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or_default()
}
