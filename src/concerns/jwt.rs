//! Bearer-token authentication.
//!
//! Requests without an `Authorization` header, or with a different scheme,
//! pass through unauthenticated. A bearer token that fails verification is
//! refused with `403 Invalid bearer token` before any inner layer runs. The
//! claims of a verified token are available through [`Context::claims`].
//!
//! The verification key comes from `AUTHENTICATION_KEY` or [`Jwt::key`]:
//! either the key itself (a PEM document, or the secret for `HS*`
//! algorithms) or an absolute path to a file holding it.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::Value;
use tracing::warn;

use crate::config::Env;
use crate::context::Context;
use crate::envelope::BoxError;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::{Middleware, MiddlewareFactory};

pub const DEFAULT_SCHEME: &str = "Bearer";

/// Bearer-token configuration.
#[derive(Clone, Debug)]
pub struct Jwt {
    scheme: String,
    key: Option<String>,
    algorithms: Vec<Algorithm>,
}

impl Default for Jwt {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_owned(),
            key: None,
            algorithms: vec![Algorithm::RS256],
        }
    }
}

impl Jwt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `AUTHENTICATION_KEY`.
    pub fn from_env(env: &Env) -> Self {
        Self { key: env.var("AUTHENTICATION_KEY"), ..Self::default() }
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// The key, or an absolute path to a file containing it.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Accepted algorithms. They must all use the same kind of key.
    pub fn algorithms(mut self, algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        self.algorithms = algorithms.into_iter().collect();
        self
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum KeyKind {
    Secret,
    Rsa,
    Ec,
}

fn key_kind(algorithm: Algorithm) -> Option<KeyKind> {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Some(KeyKind::Secret),
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Some(KeyKind::Rsa),
        Algorithm::ES256 | Algorithm::ES384 => Some(KeyKind::Ec),
        _ => None,
    }
}

fn decoding_key(kind: KeyKind, material: &[u8]) -> Result<DecodingKey, BoxError> {
    Ok(match kind {
        KeyKind::Secret => DecodingKey::from_secret(material),
        KeyKind::Rsa => DecodingKey::from_rsa_pem(material)?,
        KeyKind::Ec => DecodingKey::from_ec_pem(material)?,
    })
}

#[async_trait]
impl MiddlewareFactory for Jwt {
    fn name(&self) -> String {
        "jwt".to_owned()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        let key = self.key.ok_or(
            "to authenticate JWTs, set AUTHENTICATION_KEY or Jwt::key to a key or the absolute path of a key file",
        )?;
        let first = *self.algorithms.first().ok_or("at least one JWT algorithm is required")?;
        let kind = key_kind(first).ok_or_else(|| format!("unsupported JWT algorithm {first:?}"))?;
        if self.algorithms.iter().any(|a| key_kind(*a) != Some(kind)) {
            return Err("JWT algorithms must all use the same kind of key".into());
        }

        let material = if key.starts_with('/') {
            tokio::fs::read(&key)
                .await
                .map_err(|e| format!("cannot read the JWT key at {key}: {e}"))?
        } else {
            key.into_bytes()
        };

        let mut validation = Validation::new(first);
        validation.algorithms = self.algorithms.clone();
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        Ok(Arc::new(BearerLayer {
            prefix: format!("{} ", self.scheme),
            key: Arc::new(decoding_key(kind, &material)?),
            validation: Arc::new(validation),
        }))
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

struct BearerLayer {
    prefix: String,
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
}

/// Verified token claims, attached per request.
#[derive(Clone)]
struct Claims(Value);

impl Middleware for BearerLayer {
    fn name(&self) -> &str {
        "jwt"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let prefix: Arc<str> = Arc::from(self.prefix.as_str());
        let key = Arc::clone(&self.key);
        let validation = Arc::clone(&self.validation);
        from_outcome_fn(move |cx: Context| {
            let next = next.clone();
            let token = cx
                .header(AUTHORIZATION.as_str())
                .and_then(|h| h.strip_prefix(&*prefix))
                .map(str::to_owned);
            let verified = token.map(|token| decode::<Value>(token.as_str(), &key, &validation));
            async move {
                match verified {
                    Some(Ok(data)) => cx.insert(Claims(data.claims)),
                    Some(Err(e)) => {
                        warn!(request_id = %cx.id(), error = %e, "bearer token rejected");
                        return Err(Failure::forbidden("Invalid bearer token"));
                    }
                    None => {}
                }
                next.call(cx).await
            }
        })
    }
}

impl Context {
    /// The claims of the request's verified bearer token, if it carried one.
    pub fn claims(&self) -> Option<Value> {
        self.get::<Claims>().map(|Claims(value)| value)
    }
}
