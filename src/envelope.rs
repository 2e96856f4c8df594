//! The uniform response shape and the [`IntoEnvelope`] conversion trait.
//!
//! Every layer of the pipeline produces an [`Envelope`]. Handlers rarely build
//! one by hand: return a `String`, a [`Json`], a `StatusCode` or `()` and the
//! Invariant Enforcer fills in status and headers.
//!
//! ```rust
//! use fulcrum::{Envelope, Json};
//! use http::StatusCode;
//!
//! Envelope::text("hello");
//! Envelope::json(serde_json::json!({"id": 1}))
//!     .with_status(StatusCode::CREATED)
//!     .with_header("location", "/users/1");
//! ```

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde_json::Value;

use crate::failure::Failure;

/// Boxed error used by streaming bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A streaming body, both for requests and for streamed responses.
pub type BodyStream = UnsyncBoxBody<Bytes, BoxError>;

pub(crate) const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub(crate) const TEXT_HTML: &str = "text/html; charset=utf-8";
pub(crate) const APPLICATION_JSON: &str = "application/json; charset=utf-8";
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";

// ── Payload ───────────────────────────────────────────────────────────────────

/// The effective body of an envelope. Exactly one variant is ever in effect.
pub enum Payload {
    /// Nothing was returned. The Invariant Enforcer replaces this with an
    /// empty [`Payload::Bytes`], so it never reaches the wire.
    Empty,
    Text(String),
    Bytes(Bytes),
    Stream(BodyStream),
    Json(Value),
}

impl Payload {
    /// "Falsy" payloads resolve to `204 No Content`.
    pub(crate) fn is_empty_value(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Status, headers, payload and a failed flag.
///
/// Before the Invariant Enforcer has seen it, `status` may be unset and the
/// headers may lack a content type. Afterwards both are always present.
#[derive(Debug)]
pub struct Envelope {
    status: Option<StatusCode>,
    headers: HeaderMap,
    payload: Payload,
    failure: Option<Failure>,
    template: Option<String>,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            status: None,
            headers: HeaderMap::new(),
            payload,
            failure: None,
            template: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Payload::Empty)
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Payload::Text(body.into()))
    }

    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self::new(Payload::Bytes(body.into()))
    }

    pub fn json(value: Value) -> Self {
        Self::new(Payload::Json(value))
    }

    pub fn stream(body: BodyStream) -> Self {
        Self::new(Payload::Stream(body))
    }

    /// Status-only envelope with an empty body.
    pub fn status(code: StatusCode) -> Self {
        Self::bytes(Bytes::new()).with_status(code)
    }

    /// A failed envelope built from a failure: `{"message", …details}` body,
    /// the failure's status and headers.
    pub fn from_failure(mut failure: Failure) -> Self {
        let headers = failure.take_headers();
        Self {
            status: failure.status(),
            headers,
            payload: Payload::Json(failure.to_json()),
            failure: Some(failure),
            template: None,
        }
    }

    // ── Builders ──────────────────────────────────────────────────────────────

    pub fn with_status(mut self, code: StatusCode) -> Self {
        self.status = Some(code);
        self
    }

    /// Inserts a header, replacing any previous value. Invalid names or
    /// values are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Marks the payload as the context of the named template.
    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.template = Some(name.into());
        self
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// The resolved status. Before enforcement an untagged envelope reports
    /// `200 OK`.
    pub fn status_code(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn explicit_status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, code: StatusCode) {
        self.status = Some(code);
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn insert_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name), HeaderValue::try_from(value))
        {
            self.headers.insert(name, value);
        }
    }

    pub fn append_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name), HeaderValue::try_from(value))
        {
            self.headers.append(name, value);
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Clears the failed mark, e.g. after a concern rendered an error page.
    pub fn take_failure(&mut self) -> Option<Failure> {
        self.failure.take()
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub(crate) fn take_template(&mut self) -> Option<String> {
        self.template.take()
    }

    /// Converts to the transport-level response. Structured payloads are
    /// serialised to JSON here and nowhere else.
    pub(crate) fn into_http(self) -> http::Response<BodyStream> {
        let status = self.status_code();
        let mut headers = self.headers;
        let bytes = match self.payload {
            Payload::Stream(stream) => {
                let mut response = http::Response::new(stream);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                return response;
            }
            Payload::Empty => Bytes::new(),
            Payload::Text(s) => Bytes::from(s),
            Payload::Bytes(b) => b,
            Payload::Json(v) => serde_json::to_vec(&v)
                .map(Bytes::from)
                .unwrap_or_else(|_| Bytes::from_static(b"null")),
        };
        headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        let body = full(bytes);
        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    pub(crate) fn default_content_type(&self) -> &'static str {
        if self.payload.is_empty_value() {
            return TEXT_PLAIN;
        }
        match &self.payload {
            Payload::Text(_) => TEXT_PLAIN,
            Payload::Stream(_) => OCTET_STREAM,
            _ if self.template.is_some() => TEXT_HTML,
            _ => APPLICATION_JSON,
        }
    }

    pub(crate) fn has_content_type(&self) -> bool {
        self.headers.contains_key(CONTENT_TYPE)
    }
}

/// Wraps bytes as a [`BodyStream`].
pub fn full(bytes: impl Into<Bytes>) -> BodyStream {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

// ── Json ──────────────────────────────────────────────────────────────────────

/// Serialises `T` as the envelope's structured payload.
///
/// ```rust
/// use fulcrum::{Context, Failure, Json};
///
/// #[derive(serde::Serialize)]
/// struct User { id: u32 }
///
/// async fn get_user(_cx: Context) -> Result<Json<User>, Failure> {
///     Ok(Json(User { id: 1 }))
/// }
/// ```
pub struct Json<T>(pub T);

// ── IntoEnvelope ──────────────────────────────────────────────────────────────

/// Conversion of a handler's returned value into an [`Envelope`].
///
/// Implement on your own types to return them directly from handlers.
pub trait IntoEnvelope {
    fn into_envelope(self) -> Envelope;
}

impl IntoEnvelope for Envelope {
    fn into_envelope(self) -> Envelope { self }
}

impl IntoEnvelope for () {
    fn into_envelope(self) -> Envelope { Envelope::empty() }
}

impl IntoEnvelope for &'static str {
    fn into_envelope(self) -> Envelope { Envelope::text(self) }
}

impl IntoEnvelope for String {
    fn into_envelope(self) -> Envelope { Envelope::text(self) }
}

impl IntoEnvelope for Bytes {
    fn into_envelope(self) -> Envelope { Envelope::bytes(self) }
}

impl IntoEnvelope for Vec<u8> {
    fn into_envelope(self) -> Envelope { Envelope::bytes(self) }
}

impl IntoEnvelope for Value {
    fn into_envelope(self) -> Envelope { Envelope::json(self) }
}

/// Return a status directly from a handler: `Ok(StatusCode::ACCEPTED)`.
impl IntoEnvelope for StatusCode {
    fn into_envelope(self) -> Envelope { Envelope::empty().with_status(self) }
}

/// A *returned* failure: normalised exactly like a thrown one.
impl IntoEnvelope for Failure {
    fn into_envelope(self) -> Envelope { Envelope::from_failure(self) }
}

impl<T: IntoEnvelope> IntoEnvelope for Option<T> {
    fn into_envelope(self) -> Envelope {
        self.map_or_else(Envelope::empty, IntoEnvelope::into_envelope)
    }
}

impl<T: Serialize> IntoEnvelope for Json<T> {
    fn into_envelope(self) -> Envelope {
        match serde_json::to_value(&self.0) {
            Ok(value) => Envelope::json(value),
            Err(e) => Envelope::from_failure(Failure::internal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_envelopes_carry_status_headers_and_body() {
        let env = Failure::forbidden("nope")
            .with_header("x-reason", "csrf")
            .into_envelope();
        assert!(env.is_failed());
        assert_eq!(env.explicit_status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(env.header("x-reason"), Some("csrf"));
        assert_eq!(
            env.payload().as_json(),
            Some(&serde_json::json!({"message": "nope"}))
        );
    }

    #[test]
    fn default_content_type_follows_payload_shape() {
        assert_eq!(Envelope::text("hi").default_content_type(), TEXT_PLAIN);
        assert_eq!(Envelope::empty().default_content_type(), TEXT_PLAIN);
        assert_eq!(Envelope::stream(full("x")).default_content_type(), OCTET_STREAM);
        assert_eq!(Envelope::bytes(vec![1u8]).default_content_type(), APPLICATION_JSON);
        assert_eq!(
            Envelope::json(Value::Null).with_template("index.html").default_content_type(),
            TEXT_HTML
        );
    }

    #[test]
    fn headers_are_case_insensitive() {
        let env = Envelope::text("x").with_header("X-Thing", "1");
        assert_eq!(env.header("x-thing"), Some("1"));
    }

    #[test]
    fn none_is_empty() {
        let env = None::<String>.into_envelope();
        assert!(env.payload().is_empty_value());
    }
}
