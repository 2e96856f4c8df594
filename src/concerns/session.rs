//! Cookie-identified sessions.
//!
//! The cookie carries a signed client id, `s_{uuid}:{issued_ms}`. Session
//! data lives in a [`SessionStore`] under `s:{hex(sha256(client_id + salt))}`,
//! so a storage key never reveals a cookie value.
//!
//! Loading is lazy: nothing is read until a layer calls
//! [`Context::session`]. After the inner layers answer, a dirty session is
//! stamped with `modified` and saved; the cookie is (re)issued when the
//! session is new or [`Session::reissue`] was called.
//!
//! | Cookie | Outcome |
//! |---|---|
//! | absent | fresh session |
//! | bad signature | fresh session, warning logged |
//! | valid signature, malformed client id | `400 Invalid session cookie` |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::warn;

use super::signing;
use crate::config::Env;
use crate::context::Context;
use crate::cookie::Cookie;
use crate::envelope::BoxError;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::{Middleware, MiddlewareFactory};

const ONE_YEAR: Duration = Duration::from_secs(60 * 60 * 24 * 365);
const MIN_SECRET_LEN: usize = 32;

// ── Session ───────────────────────────────────────────────────────────────────

/// Key-value session data with change tracking.
#[derive(Clone, Debug, Default)]
pub struct Session {
    id: Option<String>,
    data: Map<String, Value>,
    dirty: bool,
    reissue: bool,
}

impl Session {
    fn new(id: Option<String>, data: Map<String, Value>) -> Self {
        Self { id, data, dirty: false, reissue: false }
    }

    fn fresh() -> Self {
        let mut data = Map::new();
        data.insert("created".to_owned(), Value::from(now_ms()));
        Self::new(None, data)
    }

    /// The client id, `None` for a session that was never saved.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Sets `key`. Only a changed value marks the session dirty.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if self.data.get(&key) != Some(&value) {
            self.dirty = true;
        }
        self.data.insert(key, value);
    }

    /// Removes `key`. Only an existing key marks the session dirty.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Rotates the client id and cookie on the next save.
    pub fn reissue(&mut self) {
        self.reissue = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.data
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// Where session data is kept, keyed by the derived storage key.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Unknown keys load as an empty map.
    async fn load(&self, cx: &Context, key: &str) -> Result<Map<String, Value>, BoxError>;

    async fn save(
        &self,
        cx: &Context,
        key: &str,
        data: &Map<String, Value>,
        expiry: Duration,
    ) -> Result<(), BoxError>;
}

/// Process-local storage. Expiry is not enforced. Clones share one map.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn load(&self, _cx: &Context, key: &str) -> Result<Map<String, Value>, BoxError> {
        match self.entries.lock().get(key) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(Map::new()),
        }
    }

    async fn save(
        &self,
        _cx: &Context,
        key: &str,
        data: &Map<String, Value>,
        _expiry: Duration,
    ) -> Result<(), BoxError> {
        let raw = serde_json::to_string(data)?;
        self.entries.lock().insert(key.to_owned(), raw);
        Ok(())
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Session settings. Building fails when the secret is shorter than 32
/// bytes or the salt is empty.
#[derive(Clone)]
pub struct Sessions {
    cookie: String,
    secret: Option<String>,
    salt: Option<String>,
    store: Arc<dyn SessionStore>,
    expiry: Duration,
}

impl Default for Sessions {
    fn default() -> Self {
        Self {
            cookie: "sid".to_owned(),
            secret: None,
            salt: None,
            store: Arc::new(InMemoryStore::new()),
            expiry: ONE_YEAR,
        }
    }
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `SESSION_ID` (the cookie name), `SESSION_SECRET` and
    /// `SESSION_SALT`.
    pub fn from_env(env: &Env) -> Self {
        let defaults = Self::default();
        Self {
            cookie: env.var("SESSION_ID").unwrap_or(defaults.cookie),
            secret: env.var("SESSION_SECRET"),
            salt: env.var("SESSION_SALT"),
            ..defaults
        }
    }

    pub fn cookie(mut self, name: impl Into<String>) -> Self {
        self.cookie = name.into();
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn store(mut self, store: impl SessionStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }
}

impl std::fmt::Debug for Sessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sessions")
            .field("cookie", &self.cookie)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MiddlewareFactory for Sessions {
    fn name(&self) -> String {
        "session".to_owned()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        let secret = self.secret.clone().unwrap_or_default();
        if secret.len() < MIN_SECRET_LEN {
            return Err(format!("`secret` must be at least {MIN_SECRET_LEN} bytes long").into());
        }
        let salt = self.salt.clone().unwrap_or_default();
        if salt.is_empty() {
            return Err("`salt` must be at least 1 byte long; preferably more".into());
        }
        Ok(Arc::new(SessionLayer(Arc::new(Settings {
            cookie: self.cookie,
            secret,
            salt,
            store: self.store,
            expiry: self.expiry,
        }))))
    }
}

struct Settings {
    cookie: String,
    secret: String,
    salt: String,
    store: Arc<dyn SessionStore>,
    expiry: Duration,
}

/// `s:` followed by the hex SHA-256 of the client id and salt.
pub fn storage_key(client_id: &str, salt: &str) -> String {
    let digest = Sha256::new()
        .chain_update(client_id.as_bytes())
        .chain_update(salt.as_bytes())
        .finalize();
    format!("s:{}", hex::encode(digest))
}

fn is_valid_client_id(client_id: &str) -> bool {
    client_id
        .strip_prefix("s_")
        .and_then(|rest| rest.split(':').next())
        .is_some_and(|uuid| uuid::Uuid::parse_str(uuid).is_ok())
}

// ── Middleware ────────────────────────────────────────────────────────────────

type Shared = Arc<AsyncMutex<Session>>;

/// Lazy per-request loader, attached to the context.
#[derive(Clone)]
struct Loader {
    settings: Arc<Settings>,
    session: Arc<OnceCell<Shared>>,
}

impl Loader {
    async fn load(&self, cx: &Context) -> Result<Shared, Failure> {
        let settings = &self.settings;
        let Some(sealed) = cx.cookie(&settings.cookie) else {
            return Ok(Arc::new(AsyncMutex::new(Session::fresh())));
        };

        let Some(client_id) = signing::unsign(settings.secret.as_bytes(), &sealed) else {
            warn!(request_id = %cx.id(), "removing session cookie with a bad signature");
            return Ok(Arc::new(AsyncMutex::new(Session::fresh())));
        };

        if !is_valid_client_id(client_id) {
            warn!(request_id = %cx.id(), client_id, "caught malformed session");
            return Err(Failure::bad_session());
        }

        let key = storage_key(client_id, &settings.salt);
        let data = settings.store.load(cx, &key).await.map_err(Failure::from_boxed)?;
        Ok(Arc::new(AsyncMutex::new(Session::new(Some(client_id.to_owned()), data))))
    }

    /// Saves a dirty session and reissues its cookie when needed.
    async fn persist(&self, cx: &Context) -> Result<(), Failure> {
        let Some(shared) = self.session.get() else {
            return Ok(());
        };
        let mut session = shared.lock().await;
        if !session.dirty {
            return Ok(());
        }

        let settings = &self.settings;
        let issued = now_ms();
        let reissue_id = match &session.id {
            Some(_) if !session.reissue => None,
            _ => Some(format!("s_{}:{issued}", uuid::Uuid::new_v4())),
        };
        let client_id = match (&reissue_id, &session.id) {
            (Some(id), _) | (None, Some(id)) => id.clone(),
            (None, None) => return Ok(()),
        };

        session.data.insert("modified".to_owned(), Value::from(issued));
        let key = storage_key(&client_id, &settings.salt);
        settings
            .store
            .save(cx, &key, &session.data, settings.expiry)
            .await
            .map_err(Failure::from_boxed)?;

        if let Some(client_id) = reissue_id {
            let cookie = Cookie::new(signing::sign(settings.secret.as_bytes(), &client_id), cx.secure_cookies())
                .max_age(settings.expiry.as_secs());
            cx.with_cookies(|jar| jar.set_cookie(&settings.cookie, cookie));
            session.id = Some(client_id);
            session.reissue = false;
        }
        session.dirty = false;
        Ok(())
    }
}

struct SessionLayer(Arc<Settings>);

impl Middleware for SessionLayer {
    fn name(&self) -> &str {
        "session"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let settings = Arc::clone(&self.0);
        from_outcome_fn(move |cx| {
            let next = next.clone();
            let loader = Loader { settings: Arc::clone(&settings), session: Arc::new(OnceCell::new()) };
            async move {
                cx.insert(loader.clone());
                let envelope = next.call(cx.clone()).await?;
                loader.persist(&cx).await?;
                Ok::<_, Failure>(envelope)
            }
        })
    }
}

impl Context {
    /// The request's session, loaded on first call.
    ///
    /// Hold the guard only as long as needed: the session middleware takes
    /// it back once the inner layers have answered. Fails when the session
    /// middleware is not installed or the cookie is malformed.
    pub async fn session(&self) -> Result<OwnedMutexGuard<Session>, Failure> {
        let loader = self
            .get::<Loader>()
            .ok_or_else(|| Failure::new("session middleware is not installed"))?;
        let shared = loader.session.get_or_try_init(|| loader.load(self)).await?;
        Ok(Arc::clone(shared).lock_owned().await)
    }
}
