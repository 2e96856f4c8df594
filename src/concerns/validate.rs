//! Input validation decorators.
//!
//! Each decorator checks that one part of the request deserializes into `T`:
//!
//! ```rust,no_run
//! use fulcrum::concerns::validate;
//! use fulcrum::{Context, Failure, Route};
//!
//! #[derive(serde::Deserialize)]
//! struct Page { page: u32 }
//!
//! async fn list(_cx: Context) -> Result<&'static str, Failure> { Ok("ok") }
//!
//! let route = Route::new("GET /items", list).decorator(validate::query::<Page>());
//! ```
//!
//! [`query`] and [`params`] answer a mismatch themselves with a failed `400`
//! envelope. [`body`] instead replaces the request's memoized body with the
//! `400` rejection and lets the handler run, so the handler observes the
//! failure when it reads the body.
//!
//! Query strings and path parameters are strings on the wire; numeric and
//! boolean fields of `T` are parsed from them.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::context::Context;
use crate::envelope::Envelope;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::Middleware;

/// Which part of the request is checked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Source {
    Query,
    Params,
    Body,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Self::Query  => "query",
            Self::Params => "params",
            Self::Body   => "body",
        }
    }
}

/// A validation decorator. Build one with [`query`], [`params`] or [`body`].
pub struct Validate<T> {
    source: Source,
    name: &'static str,
    _shape: PhantomData<fn() -> T>,
}

pub fn query<T: DeserializeOwned + 'static>() -> Validate<T> {
    Validate { source: Source::Query, name: "validate.query", _shape: PhantomData }
}

pub fn params<T: DeserializeOwned + 'static>() -> Validate<T> {
    Validate { source: Source::Params, name: "validate.params", _shape: PhantomData }
}

pub fn body<T: DeserializeOwned + 'static>() -> Validate<T> {
    Validate { source: Source::Body, name: "validate.body", _shape: PhantomData }
}

fn errors(source: Source, message: impl std::fmt::Display) -> Value {
    json!([{ "source": source.as_str(), "message": message.to_string() }])
}

/// The structured errors for `cx`'s query or path parameters, if they do
/// not fit `T`.
fn check_strings<T: DeserializeOwned>(source: Source, cx: &Context) -> Option<Value> {
    let encoded = match source {
        Source::Query => cx.url().query().unwrap_or_default().to_owned(),
        _ => serde_urlencoded::to_string(cx.params()).unwrap_or_default(),
    };
    serde_urlencoded::from_str::<T>(&encoded).err().map(|e| errors(source, e))
}

impl<T: DeserializeOwned + 'static> Middleware for Validate<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let source = self.source;
        from_outcome_fn(move |cx| {
            let next = next.clone();
            async move {
                if source != Source::Body {
                    if let Some(errors) = check_strings::<T>(source, &cx) {
                        return Ok(Envelope::from_failure(Failure::validation(errors)));
                    }
                    return next.call(cx).await;
                }

                // A body that failed to parse keeps its own rejection.
                if let Ok(body) = cx.body().await {
                    let mismatch = serde_json::from_value::<T>(body).err();
                    if let Some(e) = mismatch {
                        cx.set_body(Err(Failure::validation(errors(source, e)))).await;
                    }
                }
                next.call(cx).await
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use serde::Deserialize;

    use super::*;
    use crate::testing::{context, context_with};

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Page {
        page: u32,
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Login {
        form_username: String,
        form_password: String,
    }

    fn echo_body() -> BoxedHandler {
        from_outcome_fn(|cx: Context| async move { Ok::<_, Failure>(Envelope::json(cx.body().await?)) })
    }

    fn ok() -> BoxedHandler {
        from_outcome_fn(|_cx| async { Ok::<_, Failure>(Envelope::text("ok")) })
    }

    #[tokio::test]
    async fn query_strings_are_coerced() {
        let handler = query::<Page>().wrap(ok());
        let envelope = handler.call(context("GET", "/items?page=3")).await.unwrap();
        assert_eq!(envelope.payload().as_text(), Some("ok"));
    }

    #[tokio::test]
    async fn bad_queries_return_a_failed_400() {
        let handler = query::<Page>().wrap(ok());
        let envelope = handler.call(context("GET", "/items?page=three")).await.unwrap();
        assert!(envelope.is_failed());
        assert_eq!(envelope.explicit_status(), Some(StatusCode::BAD_REQUEST));
        let body = envelope.payload().as_json().unwrap();
        assert_eq!(body["message"], json!("Bad request"));
        assert_eq!(body["errors"][0]["source"], json!("query"));
    }

    #[tokio::test]
    async fn missing_params_are_reported() {
        let envelope = params::<Page>().wrap(ok()).call(context("GET", "/items")).await.unwrap();
        assert!(envelope.is_failed());
        assert_eq!(envelope.payload().as_json().unwrap()["errors"][0]["source"], json!("params"));
    }

    #[tokio::test]
    async fn bad_bodies_surface_when_the_handler_reads_them() {
        let handler = body::<Login>().wrap(echo_body());
        let failure = handler
            .call(context_with("POST", "/login", &[("content-type", "application/json")], r#"{"form_username":"a"}"#))
            .await
            .unwrap_err();
        assert_eq!(failure.status(), Some(StatusCode::BAD_REQUEST));
        assert!(failure.detail("errors").is_some());

        let good = handler
            .call(context_with(
                "POST",
                "/login",
                &[("content-type", "application/json")],
                r#"{"form_username":"a","form_password":"b"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(good.payload().as_json().unwrap()["form_username"], json!("a"));
    }
}
