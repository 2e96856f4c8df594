//! Request-level failures.
//!
//! A [`Failure`] is what a layer "throws": the `Err` side of a handler's
//! `Result`. The Invariant Enforcer never lets one cross a middleware boundary
//! as an `Err`; it reshapes it into a failed [`Envelope`](crate::Envelope)
//! carrying the same status, headers and details.
//!
//! | Kind | Status |
//! |---|---|
//! | [`FailureKind::NotFound`] | 404 |
//! | [`FailureKind::UnsupportedMedia`] | 415 |
//! | [`FailureKind::MalformedBody`] | 422 |
//! | [`FailureKind::Validation`] | 400 |
//! | [`FailureKind::Integrity`] | 403 |
//! | [`FailureKind::BadSession`] | 400 |
//! | anything else | 500 unless tagged |

use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde_json::{Map, Value};

/// Where a failure came from. Carried for diagnostics; the wire status is
/// decided by [`Failure::status`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureKind {
    /// No route matched. Keeps the attempted method and path for display.
    NotFound { method: String, path: String },
    /// No body parser accepted the request's content type.
    UnsupportedMedia,
    /// A body parser accepted the content type but could not decode it.
    MalformedBody,
    /// Input did not match the expected shape.
    Validation,
    /// Bad CSRF token, bad bearer token, disallowed origin.
    Integrity,
    /// A well-formed session cookie carried an invalid identity.
    BadSession,
    /// A layer panicked.
    Panic,
    /// Anything raised by application code.
    Application,
}

/// A thrown request failure.
///
/// Cheap to clone: the context memoizes body-parse rejections and hands the
/// same failure to every reader.
///
/// `Failure` deliberately does not implement [`std::error::Error`], which lets
/// any error convert into it with `?` (unhandled, 500):
///
/// ```rust
/// use fulcrum::{Context, Failure};
///
/// async fn handler(_cx: Context) -> Result<String, Failure> {
///     let n: u32 = "42".parse()?;
///     Ok(format!("{n}"))
/// }
/// ```
#[derive(Clone)]
pub struct Failure {
    status: Option<StatusCode>,
    message: String,
    kind: FailureKind,
    headers: HeaderMap,
    details: Map<String, Value>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Failure {
    /// An application failure. Resolves to 500 unless a status is attached.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            kind: FailureKind::Application,
            headers: HeaderMap::new(),
            details: Map::new(),
            source: None,
            backtrace: None,
        }
    }

    pub fn not_found(method: impl Into<String>, path: impl Into<String>) -> Self {
        let (method, path) = (method.into(), path.into());
        Self::new(format!("Could not find route for {method} {path}"))
            .with_status(StatusCode::NOT_FOUND)
            .with_kind(FailureKind::NotFound { method, path })
    }

    pub fn unsupported_media_type() -> Self {
        Self::new("Cannot parse request body")
            .with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            .with_kind(FailureKind::UnsupportedMedia)
    }

    pub fn malformed_body(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_status(StatusCode::UNPROCESSABLE_ENTITY)
            .with_kind(FailureKind::MalformedBody)
    }

    /// `400 Bad request` carrying structured `errors`.
    pub fn validation(errors: Value) -> Self {
        Self::new("Bad request")
            .with_status(StatusCode::BAD_REQUEST)
            .with_kind(FailureKind::Validation)
            .with_detail("errors", errors)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_status(StatusCode::FORBIDDEN)
            .with_kind(FailureKind::Integrity)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message).with_status(StatusCode::BAD_REQUEST)
    }

    pub fn bad_session() -> Self {
        Self::new("Invalid session cookie")
            .with_status(StatusCode::BAD_REQUEST)
            .with_kind(FailureKind::BadSession)
    }

    /// Wraps any error as an unhandled failure.
    pub fn internal<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let mut failure = Self::new(err.to_string());
        failure.source = Some(Arc::new(err));
        failure.backtrace = Some(Arc::new(Backtrace::capture()));
        failure
    }

    /// Like [`Failure::internal`], for errors that are already boxed.
    pub fn from_boxed(err: Box<dyn StdError + Send + Sync>) -> Self {
        let mut failure = Self::new(err.to_string());
        failure.source = Some(Arc::from(err));
        failure.backtrace = Some(Arc::new(Backtrace::capture()));
        failure
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_owned());
        Self::new(message).with_kind(FailureKind::Panic)
    }

    // ── Builders ──────────────────────────────────────────────────────────────

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a response header. Invalid names or values are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name), HeaderValue::try_from(value))
        {
            self.headers.insert(name, value);
        }
        self
    }

    /// Adds a field to the serialised failure body, next to `message`.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// The explicitly tagged status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn source(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub(crate) fn take_headers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.headers)
    }

    /// The public body: `{"message": …}` plus every detail.
    pub fn to_json(&self) -> Value {
        let mut body = Map::with_capacity(self.details.len() + 1);
        body.insert("message".to_owned(), Value::String(self.message.clone()));
        for (k, v) in &self.details {
            body.insert(k.clone(), v.clone());
        }
        Value::Object(body)
    }

    /// Source chain and captured backtrace, one entry per line. Only ever
    /// shown in development mode.
    pub fn stack(&self) -> Vec<String> {
        let mut lines = vec![self.message.clone()];
        let mut cause: Option<&(dyn StdError + 'static)> =
            self.source.as_deref().map(|e| e as &(dyn StdError + 'static));
        while let Some(err) = cause {
            lines.push(format!("caused by: {err}"));
            cause = err.source();
        }
        if let Some(bt) = self.backtrace.as_deref() {
            if bt.status() == BacktraceStatus::Captured {
                lines.extend(bt.to_string().lines().map(str::to_owned));
            }
        }
        lines
    }
}

impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::internal(err)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("kind", &self.kind)
            .field("details", &self.details)
            .field("source", &self.source.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_method_and_path() {
        let f = Failure::not_found("GET", "/nope");
        assert_eq!(f.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(f.message(), "Could not find route for GET /nope");
        assert_eq!(
            f.kind(),
            &FailureKind::NotFound { method: "GET".into(), path: "/nope".into() }
        );
    }

    #[test]
    fn validation_details_are_merged_into_the_body() {
        let f = Failure::validation(serde_json::json!([{"field": "bar"}]));
        assert_eq!(
            f.to_json(),
            serde_json::json!({"message": "Bad request", "errors": [{"field": "bar"}]})
        );
    }

    #[test]
    fn question_mark_converts_std_errors_without_a_status() {
        fn parse() -> Result<u8, Failure> {
            Ok("nope".parse::<u8>()?)
        }
        let f = parse().unwrap_err();
        assert_eq!(f.status(), None);
        assert!(f.source().is_some());
        assert_eq!(f.kind(), &FailureKind::Application);
    }

    #[test]
    fn invalid_header_values_are_dropped() {
        let f = Failure::new("x").with_header("x-ok", "1").with_header("bad name", "1");
        assert_eq!(f.headers().len(), 1);
    }
}
