//! Database connection attachment.
//!
//! The client library stays outside: implement [`Pool`] and [`Connection`]
//! for it. At startup the middleware checks out one connection to prove the
//! database is reachable. Per request, a connection is acquired on first use
//! through [`Context::db`] and released once the inner layers answer.
//!
//! Requests with a method other than `GET` or `HEAD` run inside a
//! transaction: `BEGIN` before the inner layers, then `COMMIT`, or
//! `ROLLBACK` when the envelope failed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::error;

use crate::config::{Env, Settings};
use crate::context::Context;
use crate::envelope::{BoxError, Envelope};
use crate::failure::Failure;
use crate::handler::{BoxFuture, BoxedHandler, from_outcome_fn};
use crate::middleware::{Middleware, MiddlewareFactory};

/// A checked-out connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Runs a statement, discarding any rows.
    async fn execute(&self, sql: &str) -> Result<(), BoxError>;

    /// Returns the connection to its pool.
    async fn release(&self);
}

/// A connection pool.
#[async_trait]
pub trait Pool: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Arc<dyn Connection>, BoxError>;
}

/// Connection settings for building a [`Pool`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatabaseUrl {
    pub url: String,
    pub max_connections: usize,
}

impl DatabaseUrl {
    /// Reads `PGURL` and `PGPOOLSIZE`. The URL defaults to a local database
    /// named after the service, the pool size to 20.
    pub fn from_env(env: &Env, settings: &Settings) -> Self {
        let url = env
            .var("PGURL")
            .unwrap_or_else(|| format!("postgres://postgres@localhost:5432/{}", settings.service_name));
        let max_connections = env
            .var("PGPOOLSIZE")
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(20);
        Self { url, max_connections }
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Attaches a [`Pool`] to every request.
#[derive(Clone)]
pub struct Database {
    pool: Arc<dyn Pool>,
}

impl Database {
    pub fn new(pool: impl Pool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Database")
    }
}

#[async_trait]
impl MiddlewareFactory for Database {
    fn name(&self) -> String {
        "database".to_owned()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        let startup = self.pool.acquire().await?;
        startup.release().await;
        Ok(Arc::new(DatabaseLayer { pool: self.pool }))
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

struct DatabaseLayer {
    pool: Arc<dyn Pool>,
}

/// The request's lazily acquired connection.
#[derive(Clone)]
struct Attached {
    pool: Arc<dyn Pool>,
    connection: Arc<OnceCell<Arc<dyn Connection>>>,
}

impl Attached {
    async fn connection(&self) -> Result<Arc<dyn Connection>, Failure> {
        self.connection
            .get_or_try_init(|| self.pool.acquire())
            .await
            .cloned()
            .map_err(Failure::from_boxed)
    }
}

impl Middleware for DatabaseLayer {
    fn name(&self) -> &str {
        "database"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let pool = Arc::clone(&self.pool);
        from_outcome_fn(move |cx| {
            let next = next.clone();
            let attached = Attached { pool: Arc::clone(&pool), connection: Arc::new(OnceCell::new()) };
            async move {
                cx.insert(attached.clone());
                let transactional = cx.method().is_transactional();
                if transactional {
                    let conn = attached.connection().await?;
                    if let Err(e) = conn.execute("BEGIN").await {
                        conn.release().await;
                        error!(request_id = %cx.id(), error = %e, "could not begin transaction");
                        return Err(Failure::from_boxed(e));
                    }
                }

                let outcome = next.call(cx.clone()).await;

                let Some(conn) = attached.connection.get() else {
                    return outcome;
                };
                let mut finished = Ok(());
                if transactional {
                    let failed = outcome.as_ref().map_or(true, Envelope::is_failed);
                    let statement = if failed { "ROLLBACK" } else { "COMMIT" };
                    finished = conn.execute(statement).await;
                }
                conn.release().await;

                if let Err(e) = finished {
                    error!(request_id = %cx.id(), error = %e, "could not end transaction");
                    return Err(Failure::from_boxed(e));
                }
                outcome
            }
        })
    }
}

impl Context {
    /// The request's database connection, acquired on first call. Fails when
    /// the database middleware is not installed or the pool refuses.
    pub async fn db(&self) -> Result<Arc<dyn Connection>, Failure> {
        let attached = self
            .get::<Attached>()
            .ok_or_else(|| Failure::new("database middleware is not installed"))?;
        attached.connection().await
    }
}

/// A reachability check for [`Status`](super::status::Status): runs
/// `SELECT 1` on the request's connection.
pub fn reachability(cx: Context) -> BoxFuture<'static, Result<(), BoxError>> {
    Box::pin(async move {
        let conn = cx.db().await.map_err(|f| BoxError::from(f.message().to_owned()))?;
        conn.execute("SELECT 1").await
    })
}
