//! Static asset serving for development.
//!
//! In development, `GET /static/app.css` reads `./static/app.css` and
//! answers with its bytes and a content type guessed from the extension.
//! Paths that leave the directory, and files that do not exist, are `404`.
//!
//! In production nothing is served: assets belong behind a CDN or the front
//! proxy. Either way the layer can also add `STATIC_URL` to templated
//! envelopes (see [`TemplateContext`]).

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use percent_encoding::percent_decode_str;
use tracing::info;

use crate::config::{Env, RuntimeMode, Settings};
use crate::context::Context;
use crate::envelope::{BoxError, Envelope};
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::{Middleware, MiddlewareFactory};

use super::template::{DEFAULT_STATIC_URL, TemplateContext};

/// Static file configuration.
#[derive(Clone, Debug)]
pub struct StaticFiles {
    prefix: String,
    dir: PathBuf,
    add_to_context: bool,
    static_url: Option<String>,
    development: bool,
}

impl StaticFiles {
    /// Serves `./static` under `/static/` in development.
    pub fn new(mode: RuntimeMode) -> Self {
        Self {
            prefix: "static".to_owned(),
            dir: PathBuf::from("static"),
            add_to_context: true,
            static_url: None,
            development: mode.is_development(),
        }
    }

    /// Reads `STATIC_URL`, the production asset location.
    pub fn from_env(env: &Env, settings: &Settings) -> Self {
        let mut files = Self::new(settings.mode);
        files.static_url = env.var("STATIC_URL");
        files
    }

    /// URL prefix, without slashes.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_owned();
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Whether templated envelopes get `STATIC_URL`. On by default.
    pub fn add_to_context(mut self, enabled: bool) -> Self {
        self.add_to_context = enabled;
        self
    }

    pub fn static_url(mut self, url: impl Into<String>) -> Self {
        self.static_url = Some(url.into());
        self
    }
}

#[async_trait]
impl MiddlewareFactory for StaticFiles {
    fn name(&self) -> String {
        "staticfiles".to_owned()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        let mount = format!("/{}/", self.prefix);
        let serving = if self.development {
            info!(prefix = %mount, dir = %self.dir.display(), "development mode: serving static assets");
            Some(self.dir.clone())
        } else {
            None
        };
        let static_url = if self.development {
            mount.clone()
        } else {
            self.static_url.clone().unwrap_or_else(|| DEFAULT_STATIC_URL.to_owned())
        };
        let context = self.add_to_context.then(|| TemplateContext::new().static_url(static_url));
        Ok(Arc::new(StaticLayer { mount, serving, context }))
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

struct StaticLayer {
    mount: String,
    serving: Option<PathBuf>,
    context: Option<TemplateContext>,
}

fn not_found() -> Failure {
    Failure::new("File not found").with_status(StatusCode::NOT_FOUND)
}

/// `a/b%20c.css` → `a/b c.css`, refusing anything but plain segments.
fn relative_path(rest: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(rest).decode_utf8().ok()?;
    let path = Path::new(decoded.as_ref());
    let plain = path.components().all(|c| matches!(c, Component::Normal(_)));
    (plain && !decoded.is_empty()).then(|| path.to_path_buf())
}

async fn serve(dir: &Path, rest: &str) -> Result<Envelope, Failure> {
    let relative = relative_path(rest).ok_or_else(not_found)?;
    let target = dir.join(relative);
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(not_found()),
    }
    let bytes = tokio::fs::read(&target).await.map_err(Failure::internal)?;
    let content_type = mime_guess::from_path(&target).first_or_octet_stream();
    Ok(Envelope::bytes(bytes).with_header("content-type", content_type.as_ref()))
}

impl Middleware for StaticLayer {
    fn name(&self) -> &str {
        "staticfiles"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let next = match &self.context {
            Some(context) => context.wrap(next),
            None => next,
        };
        let mount: Arc<str> = Arc::from(self.mount.as_str());
        let serving = self.serving.clone().map(Arc::new);
        from_outcome_fn(move |cx: Context| {
            let next = next.clone();
            let mount = Arc::clone(&mount);
            let serving = serving.clone();
            async move {
                if let Some(dir) = serving {
                    let path = cx.path();
                    if let Some(rest) = path.strip_prefix(&*mount) {
                        return serve(&dir, rest).await;
                    }
                }
                next.call(cx).await
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::context;

    async fn layer(files: StaticFiles) -> Arc<dyn Middleware> {
        Box::new(files).build().await.unwrap()
    }

    fn templated() -> BoxedHandler {
        from_outcome_fn(|_cx| async { Ok::<_, Failure>(Envelope::json(json!({})).with_template("index.html")) })
    }

    fn assets() -> PathBuf {
        let root = std::env::temp_dir().join(format!("fulcrum-static-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("css")).unwrap();
        std::fs::write(root.join("css/app.css"), "body {}").unwrap();
        std::fs::write(root.join("hello world.txt"), "hi").unwrap();
        root
    }

    #[test]
    fn only_plain_segments_are_served() {
        assert_eq!(relative_path("css/app.css"), Some(PathBuf::from("css/app.css")));
        assert_eq!(relative_path("hello%20world.txt"), Some(PathBuf::from("hello world.txt")));
        assert_eq!(relative_path("../secret"), None);
        assert_eq!(relative_path("css/%2E%2E/%2E%2E/secret"), None);
        assert_eq!(relative_path("%2Fetc/passwd"), None);
        assert_eq!(relative_path(""), None);
    }

    #[tokio::test]
    async fn development_serves_files_with_guessed_types() {
        let root = assets();
        let handler = layer(StaticFiles::new(RuntimeMode::Development).dir(&root)).await.wrap(templated());

        let envelope = handler.call(context("GET", "/static/css/app.css")).await.unwrap();
        assert_eq!(envelope.header("content-type"), Some("text/css"));
        assert!(matches!(envelope.payload(), crate::Payload::Bytes(b) if b.as_ref() == b"body {}"));

        let envelope = handler.call(context("GET", "/static/hello%20world.txt")).await.unwrap();
        assert_eq!(envelope.header("content-type"), Some("text/plain"));

        for missing in ["/static/nope.css", "/static/css", "/static/../Cargo.toml"] {
            let failure = handler.call(context("GET", missing)).await.unwrap_err();
            assert_eq!(failure.status(), Some(StatusCode::NOT_FOUND), "{missing}");
        }

        let envelope = handler.call(context("GET", "/")).await.unwrap();
        assert_eq!(envelope.payload().as_json(), Some(&json!({"STATIC_URL": "/static/"})));
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn production_only_sets_the_static_url() {
        let root = assets();
        let env = Env::from_pairs([("STATIC_URL", "https://cdn.test/assets/")]);
        let settings = Settings { mode: RuntimeMode::Production, ..Settings::default() };
        let handler = layer(StaticFiles::from_env(&env, &settings).dir(&root)).await.wrap(templated());

        let envelope = handler.call(context("GET", "/static/css/app.css")).await.unwrap();
        assert_eq!(envelope.payload().as_json(), Some(&json!({"STATIC_URL": "https://cdn.test/assets/"})));

        let quiet = layer(StaticFiles::new(RuntimeMode::Production).add_to_context(false)).await.wrap(templated());
        let envelope = quiet.call(context("GET", "/")).await.unwrap();
        assert_eq!(envelope.payload().as_json(), Some(&json!({})));
        std::fs::remove_dir_all(&root).unwrap();
    }
}
