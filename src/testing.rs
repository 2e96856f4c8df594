//! In-process request injection.
//!
//! Drives a built [`Service`] without opening a socket:
//!
//! ```rust,no_run
//! # async fn demo(service: fulcrum::Service) {
//! use fulcrum::testing::inject;
//!
//! let res = inject(&service, http::Request::get("/hello/world").body("").unwrap()).await;
//! assert_eq!(res.status, 200);
//! assert_eq!(res.text(), "hello world");
//! # }
//! ```

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;

use crate::app::Service;
use crate::body::{build_body_parser, default_parsers};
use crate::context::Context;
use crate::envelope::full;

/// The address injected requests appear to come from.
pub const REMOTE: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);

/// A fully buffered response.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The body as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The body as JSON, or `Value::Null` when it is not JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    /// `name=value` of every `Set-Cookie`, ready to be sent back joined
    /// with `"; "`.
    pub fn cookies(&self) -> Vec<String> {
        self.headers
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::to_owned)
            .collect()
    }
}

/// Sends `req` through `service` and buffers the response.
pub async fn inject<B: Into<Bytes>>(service: &Service, req: http::Request<B>) -> TestResponse {
    let req = req.map(|body| full(body.into()));
    let res = service.respond(req, Some(REMOTE)).await;
    let (parts, body) = res.into_parts();
    let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    TestResponse { status: parts.status, headers: parts.headers, body }
}

/// A context for `method uri` with no headers and an empty body.
///
/// # Panics
///
/// Panics on an unknown method or an unparseable URI.
pub fn context(method: &str, uri: &str) -> Context {
    context_with(method, uri, &[], Bytes::new())
}

/// A context with headers and a body, parsed by the default body parsers.
/// Cookies are not marked secure.
///
/// # Panics
///
/// Panics on an unknown method or an unparseable URI.
pub fn context_with(method: &str, uri: &str, headers: &[(&str, &str)], body: impl Into<Bytes>) -> Context {
    let mut builder = http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(full(body.into())).expect("valid test request");
    Context::build(req, Some(REMOTE), build_body_parser(&default_parsers()), false)
        .expect("known test method")
}
