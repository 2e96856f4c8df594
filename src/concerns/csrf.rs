//! Cross-site request forgery protection.
//!
//! Each client holds a random secret in a signed cookie (`_csrf`), minted on
//! first contact. A token is a random salt signed with that secret; handlers
//! that render forms get one from [`Context::csrf_token`]. Requests with an
//! unsafe method must present a valid token in the body field `_csrf` or the
//! `csrf-token` header, or they are refused with `403` before reaching
//! anything further in. Signature checks run in constant time.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::signing;
use crate::config::Env;
use crate::context::Context;
use crate::envelope::BoxError;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::{Middleware, MiddlewareFactory};

const SECRET_BYTES: usize = 18;
const SALT_BYTES: usize = 6;

/// CSRF settings. Building fails without a cookie-signing secret.
#[derive(Clone, Debug)]
pub struct Csrf {
    cookie_secret: Option<String>,
    cookie: String,
    param: String,
    header: String,
}

impl Default for Csrf {
    fn default() -> Self {
        Self {
            cookie_secret: None,
            cookie: "_csrf".to_owned(),
            param: "_csrf".to_owned(),
            header: "csrf-token".to_owned(),
        }
    }
}

impl Csrf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `COOKIE_SECRET`.
    pub fn from_env(env: &Env) -> Self {
        Self { cookie_secret: env.var("COOKIE_SECRET"), ..Self::default() }
    }

    pub fn cookie_secret(mut self, secret: impl Into<String>) -> Self {
        self.cookie_secret = Some(secret.into());
        self
    }

    pub fn cookie(mut self, name: impl Into<String>) -> Self {
        self.cookie = name.into();
        self
    }

    /// Body field carrying the token.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.param = name.into();
        self
    }

    /// Header carrying the token when the body does not.
    pub fn header(mut self, name: impl Into<String>) -> Self {
        self.header = name.into();
        self
    }
}

#[async_trait]
impl MiddlewareFactory for Csrf {
    fn name(&self) -> String {
        "csrf".to_owned()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        let Some(cookie_secret) = self.cookie_secret.clone() else {
            return Err("You cannot use CSRF middleware without providing a secret for signing cookies".into());
        };
        Ok(Arc::new(CsrfLayer(Arc::new(Settings {
            cookie_secret,
            cookie: self.cookie,
            param: self.param,
            header: self.header,
        }))))
    }
}

struct Settings {
    cookie_secret: String,
    cookie: String,
    param: String,
    header: String,
}

impl Settings {
    /// The client's secret, if its cookie carries a valid signature.
    fn secret_from_cookie(&self, cx: &Context) -> Option<String> {
        let signed = cx.cookie(&self.cookie)?;
        signing::unsign(self.cookie_secret.as_bytes(), &signed).map(str::to_owned)
    }

    fn mint_secret(&self, cx: &Context) -> String {
        let secret = signing::random_token(SECRET_BYTES);
        let signed = signing::sign(self.cookie_secret.as_bytes(), &secret);
        cx.with_cookies(|jar| jar.set(&self.cookie, signed));
        secret
    }
}

fn create_token(secret: &str) -> String {
    signing::sign(secret.as_bytes(), &signing::random_token(SALT_BYTES))
}

fn verify_token(secret: &str, token: &str) -> bool {
    signing::unsign(secret.as_bytes(), token).is_some()
}

// ── Middleware ────────────────────────────────────────────────────────────────

struct CsrfLayer(Arc<Settings>);

/// Per-request token state, attached to the context.
#[derive(Clone)]
struct TokenState {
    settings: Arc<Settings>,
    current: Arc<Mutex<Current>>,
}

struct Current {
    secret: String,
    token: Option<String>,
}

impl Middleware for CsrfLayer {
    fn name(&self) -> &str {
        "csrf"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let settings = Arc::clone(&self.0);
        from_outcome_fn(move |cx| {
            let next = next.clone();
            let settings = Arc::clone(&settings);
            async move {
                let secret = settings
                    .secret_from_cookie(&cx)
                    .unwrap_or_else(|| settings.mint_secret(&cx));
                cx.insert(TokenState {
                    settings: Arc::clone(&settings),
                    current: Arc::new(Mutex::new(Current { secret: secret.clone(), token: None })),
                });

                if cx.method().is_safe() {
                    return next.call(cx).await;
                }

                let from_body = cx
                    .body()
                    .await
                    .ok()
                    .and_then(|body| body.get(&settings.param).and_then(Value::as_str).map(str::to_owned));
                let token = from_body.or_else(|| cx.header(&settings.header).map(str::to_owned));

                match token {
                    Some(token) if verify_token(&secret, &token) => next.call(cx).await,
                    _ => Err(Failure::forbidden("Invalid CSRF token")),
                }
            }
        })
    }
}

impl Context {
    /// A CSRF token for the current client.
    ///
    /// Repeated calls within one request return the same token unless
    /// `refresh` is set or the client's secret changed in between. Mints a
    /// secret cookie if the client has none. Fails when the CSRF middleware
    /// is not installed.
    pub fn csrf_token(&self, refresh: bool) -> Result<String, Failure> {
        let state = self
            .get::<TokenState>()
            .ok_or_else(|| Failure::new("CSRF middleware is not installed"))?;
        let fresh = state.settings.secret_from_cookie(self);
        let mut current = state.current.lock();

        if let Some(token) = &current.token {
            if !refresh && fresh.as_deref() == Some(current.secret.as_str()) {
                return Ok(token.clone());
            }
        }

        current.secret = match fresh {
            Some(secret) => secret,
            None => state.settings.mint_secret(self),
        };
        let token = create_token(&current.secret);
        current.token = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::StatusCode;

    use super::*;
    use crate::envelope::Envelope;
    use crate::testing::{context, context_with};

    const COOKIE_SECRET: &str = "avocados-are-delicious";

    async fn layer(config: Csrf) -> Arc<dyn Middleware> {
        Box::new(config).build().await.unwrap()
    }

    fn counting(calls: Arc<AtomicUsize>) -> BoxedHandler {
        from_outcome_fn(move |_cx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Failure>(Envelope::text("ok"))
            }
        })
    }

    fn client_cookie(secret: &str, signed_with: &str) -> String {
        format!("_csrf={}", signing::sign(signed_with.as_bytes(), secret))
    }

    #[tokio::test]
    async fn a_signing_secret_is_required() {
        let err = match Box::new(Csrf::new()).build().await {
            Err(err) => err,
            Ok(_) => panic!("build should fail"),
        };
        assert!(err.to_string().contains("a secret for signing cookies"));
    }

    #[tokio::test]
    async fn mutations_without_a_token_are_refused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = layer(Csrf::new().cookie_secret(COOKIE_SECRET)).await.wrap(counting(Arc::clone(&calls)));
        let failure = handler
            .call(context_with("PUT", "/", &[("content-type", "application/json")], r#"{"text":"tokenless"}"#))
            .await
            .unwrap_err();
        assert_eq!(failure.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(failure.message(), "Invalid CSRF token");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_and_header_tokens_are_accepted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = layer(Csrf::new().cookie_secret(COOKIE_SECRET).header("my-header"))
            .await
            .wrap(counting(Arc::clone(&calls)));
        let cookie = client_cookie("user-secret", COOKIE_SECRET);
        let token = create_token("user-secret");

        let body = format!(r#"{{"_csrf":"{token}"}}"#);
        handler
            .call(context_with(
                "PUT",
                "/",
                &[("cookie", cookie.as_str()), ("content-type", "application/json")],
                body,
            ))
            .await
            .unwrap();

        handler
            .call(context_with("PUT", "/", &[("cookie", cookie.as_str()), ("my-header", token.as_str())], ""))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn secrets_with_bad_signatures_are_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = layer(Csrf::new().cookie_secret(COOKIE_SECRET)).await.wrap(counting(Arc::clone(&calls)));
        let cookie = client_cookie("user-secret", "cilantro-is-great");
        let token = create_token("user-secret");

        let result = handler
            .call(context_with("PUT", "/", &[("cookie", cookie.as_str()), ("csrf-token", token.as_str())], ""))
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tokens_are_reused_until_refreshed() {
        let handler = layer(Csrf::new().cookie_secret(COOKIE_SECRET)).await.wrap(from_outcome_fn(|cx: Context| async move {
            let t1 = cx.csrf_token(false)?;
            let t2 = cx.csrf_token(false)?;
            let t3 = cx.csrf_token(true)?;
            let t4 = cx.csrf_token(false)?;
            assert_eq!(t1, t2);
            assert_ne!(t2, t3);
            assert_eq!(t3, t4);
            Ok::<_, Failure>(Envelope::text(t4))
        }));

        let cx = context("GET", "/");
        let envelope = handler.call(cx.clone()).await.unwrap();
        let token = envelope.payload().as_text().unwrap().to_owned();

        let minted = cx.set_cookie_headers();
        assert_eq!(minted.len(), 1);
        let signed = minted[0].trim_start_matches("_csrf=").split(';').next().unwrap();
        let secret = signing::unsign(COOKIE_SECRET.as_bytes(), signed).unwrap();
        assert!(verify_token(secret, &token));
    }

    #[test]
    fn the_token_accessor_needs_the_middleware() {
        assert!(context("GET", "/").csrf_token(false).is_err());
    }
}
