//! Fixed response headers.

use std::sync::Arc;

use crate::envelope::BoxError;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::Middleware;

/// Sets fixed headers on every response, replacing values set further in.
#[derive(Clone, Debug)]
pub struct ApplyHeaders {
    headers: Arc<Vec<(String, String)>>,
}

impl ApplyHeaders {
    pub fn new<K, V>(headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let headers = headers.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self { headers: Arc::new(headers) }
    }

    /// `x-frame-options`. Only `DENY` and `SAMEORIGIN` are accepted.
    pub fn xfo(mode: &str) -> Result<Self, BoxError> {
        match mode {
            "DENY" | "SAMEORIGIN" => Ok(Self::new([("x-frame-options", mode)])),
            _ => Err("allowed x-frame-options directives are DENY and SAMEORIGIN".into()),
        }
    }
}

impl Middleware for ApplyHeaders {
    fn name(&self) -> &str {
        "apply_headers"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let headers = Arc::clone(&self.headers);
        from_outcome_fn(move |cx| {
            let fut = next.call(cx);
            let headers = Arc::clone(&headers);
            async move {
                let mut envelope = fut.await?;
                for (name, value) in headers.iter() {
                    envelope.insert_header(name, value);
                }
                Ok::<_, Failure>(envelope)
            }
        })
    }
}

/// Appends to the `vary` response header.
#[derive(Clone, Debug)]
pub struct Vary {
    on: Arc<Vec<String>>,
}

impl Vary {
    pub fn new<S: Into<String>>(on: impl IntoIterator<Item = S>) -> Self {
        Self { on: Arc::new(on.into_iter().map(Into::into).collect()) }
    }
}

impl Middleware for Vary {
    fn name(&self) -> &str {
        "vary"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let on = Arc::clone(&self.on);
        from_outcome_fn(move |cx| {
            let fut = next.call(cx);
            let on = Arc::clone(&on);
            async move {
                let mut envelope = fut.await?;
                let mut values: Vec<String> = envelope
                    .header("vary")
                    .map(|v| v.split(',').map(|s| s.trim().to_owned()).collect())
                    .unwrap_or_default();
                for header in on.iter() {
                    if !values.iter().any(|v| v.eq_ignore_ascii_case(header)) {
                        values.push(header.clone());
                    }
                }
                envelope.insert_header("vary", &values.join(", "));
                Ok::<_, Failure>(envelope)
            }
        })
    }
}
