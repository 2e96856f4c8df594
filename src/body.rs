//! Body Parser Chain.
//!
//! An ordered list of decoders, each given the request body and a
//! continuation. A decoder either consumes the body or hands it to the next
//! decoder. The terminal fallback drains the body and fails with
//! `415 Unsupported Media Type`.
//!
//! ```text
//! content-type parse ─▶ urlencoded ─▶ json ─▶ 415
//! ```
//!
//! The content type is parsed once, up front, into a [`ContentType`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{Map, Value};

use crate::envelope::BodyStream;
use crate::failure::Failure;
use crate::handler::BoxFuture;

// ── ContentType ───────────────────────────────────────────────────────────────

/// A request's negotiated content type.
///
/// `application/vnd.api+json; charset="UTF-8"` parses as type `application`,
/// vnd `vnd.api`, subtype `json`, charset `utf-8`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContentType {
    pub type_: String,
    pub subtype: String,
    pub vnd: String,
    pub charset: String,
    pub params: BTreeMap<String, String>,
}

impl ContentType {
    /// Parses a `Content-Type` header value. A missing header is treated as
    /// `application/octet-stream`; a missing charset as `utf-8`.
    pub fn parse(header: Option<&str>) -> Self {
        let header = header.unwrap_or("application/octet-stream");
        let mut parts = header.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default().to_ascii_lowercase();

        let params: BTreeMap<String, String> = parts
            .filter_map(|attr| {
                let (k, v) = attr.split_once('=')?;
                Some((k.trim().to_ascii_lowercase(), v.trim().to_owned()))
            })
            .collect();

        let charset = params
            .get("charset")
            .map(|c| unquote(c).to_ascii_lowercase())
            .unwrap_or_else(|| "utf-8".to_owned());

        let (type_, full_subtype) = essence.split_once('/').unwrap_or((essence.as_str(), ""));
        let (vnd, subtype) = match full_subtype.rsplit_once('+') {
            Some((vnd, subtype)) => (vnd, subtype),
            None => ("", full_subtype),
        };

        Self {
            type_: type_.to_owned(),
            subtype: subtype.to_owned(),
            vnd: vnd.to_owned(),
            charset,
            params,
        }
    }

    pub fn is(&self, type_: &str, subtype: &str) -> bool {
        self.type_ == type_ && self.subtype == subtype
    }
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(s)
}

// ── BodyInput ─────────────────────────────────────────────────────────────────

/// What every decoder receives: the parsed content type and the unread body.
pub struct BodyInput {
    pub content_type: ContentType,
    body: BodyStream,
}

impl BodyInput {
    pub fn new(content_type: ContentType, body: BodyStream) -> Self {
        Self { content_type, body }
    }

    /// Reads the whole body.
    pub async fn collect(self) -> Result<Bytes, Failure> {
        self.body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| Failure::bad_request(format!("Could not read request body: {e}")))
    }

    /// Reads and discards the body so the connection can be reused.
    pub async fn drain(self) {
        let _ = self.body.collect().await;
    }
}

// ── The chain ─────────────────────────────────────────────────────────────────

type ParseFn = dyn Fn(BodyInput) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync;

/// A composed body parser. Cheap to clone.
#[derive(Clone)]
pub struct BodyParser(Arc<ParseFn>);

impl BodyParser {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(BodyInput) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn parse(&self, input: BodyInput) -> BoxFuture<'static, Result<Value, Failure>> {
        (self.0)(input)
    }
}

impl Default for BodyParser {
    fn default() -> Self {
        build_body_parser(&default_parsers())
    }
}

/// A decoder definition: takes the continuation, returns a parser.
pub type BodyParserLayer = fn(BodyParser) -> BodyParser;

/// The decoders used when none are configured: form bodies, then JSON.
pub fn default_parsers() -> Vec<BodyParserLayer> {
    vec![urlencoded, json]
}

/// Folds `layers` right-to-left onto the 415 fallback.
pub fn build_body_parser(layers: &[BodyParserLayer]) -> BodyParser {
    let terminal = BodyParser::new(|input: BodyInput| {
        Box::pin(async move {
            input.drain().await;
            Err::<Value, _>(Failure::unsupported_media_type())
        })
    });
    layers.iter().rev().fold(terminal, |next, layer| layer(next))
}

// ── Decoders ──────────────────────────────────────────────────────────────────

/// `application/json; charset=utf-8` (and `+json` vendor types).
/// Undecodable bodies fail with `422`.
pub fn json(next: BodyParser) -> BodyParser {
    BodyParser::new(move |input: BodyInput| {
        let next = next.clone();
        Box::pin(async move {
            let ct = &input.content_type;
            if !(ct.is("application", "json") && ct.charset == "utf-8") {
                return next.parse(input).await;
            }
            let buf = input.collect().await?;
            serde_json::from_slice::<Value>(&buf)
                .map_err(|_| Failure::malformed_body("Could not parse request body as JSON"))
        })
    })
}

/// `application/x-www-form-urlencoded; charset=utf-8`. Never fails once the
/// body is read: undecodable input yields an empty object. Repeated keys
/// become arrays.
pub fn urlencoded(next: BodyParser) -> BodyParser {
    BodyParser::new(move |input: BodyInput| {
        let next = next.clone();
        Box::pin(async move {
            let ct = &input.content_type;
            if !(ct.is("application", "x-www-form-urlencoded") && ct.charset == "utf-8") {
                return next.parse(input).await;
            }
            let buf = input.collect().await?;
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_bytes(&buf).unwrap_or_default();
            Ok(pairs_to_object(pairs))
        })
    })
}

fn pairs_to_object(pairs: Vec<(String, String)>) -> Value {
    let mut object = Map::new();
    for (key, value) in pairs {
        match object.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                object.insert(key, Value::String(value));
            }
        }
    }
    Value::Object(object)
}
