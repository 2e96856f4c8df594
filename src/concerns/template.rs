//! HTML rendering with `handlebars`.
//!
//! An envelope tagged with [`Envelope::with_template`] is rendered with its
//! JSON payload as the template data. A failed envelope without a template is
//! rendered as an error page, unless the client looks like it wants JSON:
//!
//! - development: a built-in page with the failure's message and stack
//! - production: `4xx.html` or `5xx.html` by status class
//!
//! When rendering fails, the `5xx.html` page (or the development page) is
//! tried next, and as a last resort a bare HTML page carrying a correlation
//! id that is also written to the log.
//!
//! Templates are registered by their path relative to the template
//! directory, extension included: `templates/users/show.html` is
//! `users/show.html`.
//!
//! [`TemplateContext`] adds shared values, `STATIC_URL` among them, to the
//! data of every templated envelope that passes through it. Install it inside
//! [`Templates`] so it runs before rendering.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use http::StatusCode;
use serde_json::{Value, json};
use tracing::error;

use crate::config::{Env, RuntimeMode, Settings};
use crate::context::Context;
use crate::envelope::{BoxError, Envelope, Payload, TEXT_HTML};
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::{Middleware, MiddlewareFactory};

/// Name of the built-in development error page.
pub const DEV_ERROR_TEMPLATE: &str = "fulcrum/error.html";

const DEV_ERROR_SOURCE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <title>{{status}} {{message}}</title>
</head>
<body>
  <h1>{{status}}: {{message}}</h1>
  <p><code>{{method}} {{url}}</code> (request <code>{{request_id}}</code>)</p>
  {{#if route}}<p>Matched <code>{{route.method}} {{route.pattern}}</code></p>{{/if}}
  {{#if template}}<p>While rendering <code>{{template}}</code></p>{{/if}}
  {{#if render_error}}<h2>Template error</h2><pre>{{render_error}}</pre>{{/if}}
  <h2>Stack</h2>
  <ol>{{#each stack}}<li><pre>{{this}}</pre></li>{{/each}}</ol>
</body>
</html>
"#;

/// Template configuration, built into the rendering middleware at startup.
#[derive(Clone, Debug)]
pub struct Templates {
    dirs: Vec<PathBuf>,
    inline: Vec<(String, String)>,
    development: bool,
}

impl Templates {
    pub fn new(mode: RuntimeMode) -> Self {
        Self { dirs: Vec::new(), inline: Vec::new(), development: mode.is_development() }
    }

    /// Reads `./templates` in the configured mode.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.mode).dir("templates")
    }

    /// Adds a directory to load recursively. It must exist at build time.
    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dirs.push(path.into());
        self
    }

    /// Registers a template from source. Later registrations win.
    pub fn template(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.inline.push((name.into(), source.into()));
        self
    }
}

fn load_dir(registry: &mut Handlebars<'static>, root: &Path, dir: &Path) -> Result<(), BoxError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            load_dir(registry, root, &path)?;
            continue;
        }
        let name = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let source = std::fs::read_to_string(&path)?;
        registry
            .register_template_string(&name, source)
            .map_err(|e| BoxError::from(format!("template {name}: {e}")))?;
    }
    Ok(())
}

#[async_trait]
impl MiddlewareFactory for Templates {
    fn name(&self) -> String {
        "template".to_owned()
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn Middleware>, BoxError> {
        let mut registry = Handlebars::new();
        registry
            .register_template_string(DEV_ERROR_TEMPLATE, DEV_ERROR_SOURCE)
            .map_err(|e| BoxError::from(e.to_string()))?;
        for dir in &self.dirs {
            if !dir.is_dir() {
                return Err(format!("template directory not found: {}", dir.display()).into());
            }
            load_dir(&mut registry, dir, dir)?;
        }
        for (name, source) in &self.inline {
            registry
                .register_template_string(name, source)
                .map_err(|e| BoxError::from(format!("template {name}: {e}")))?;
        }
        Ok(Arc::new(TemplateLayer { registry: Arc::new(registry), development: self.development }))
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

struct TemplateLayer {
    registry: Arc<Handlebars<'static>>,
    development: bool,
}

/// Clients that sent or expect JSON get the failure as-is.
fn wants_json(cx: &Context) -> bool {
    cx.header("sec-fetch-dest") == Some("none")
        || cx.header("x-requested-with").is_some()
        || cx.header("content-type").is_some_and(|ct| ct.contains("application/json"))
}

/// `404` → `4xx.html`.
fn error_page(status: StatusCode) -> String {
    format!("{}xx.html", status.as_u16() / 100)
}

fn error_data(cx: &Context, failure: Option<&Failure>, status: StatusCode) -> Value {
    json!({
        "status": status.as_u16(),
        "message": failure.map(Failure::message).unwrap_or("Internal server error"),
        "stack": failure.map(Failure::stack).unwrap_or_default(),
        "request_id": cx.id(),
        "method": cx.method().as_str(),
        "url": cx.url().to_string(),
        "route": cx.route().map(|m| json!({ "method": m.method.as_str(), "pattern": m.pattern })),
        "template": null,
        "render_error": null,
    })
}

fn last_resort(cx: &Context, template: &str, err: &handlebars::RenderError) -> String {
    let correlation = uuid::Uuid::new_v4();
    error!(request_id = %cx.id(), %correlation, template, error = %err, "could not render error page");
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"UTF-8\"><title></title></head>\n\
         <body><h1>An unexpected server error occurred (ref: <code>{correlation}</code>).</h1></body>\n</html>\n"
    )
}

impl TemplateLayer {
    /// The status and page for `envelope`, and whether the page is an error
    /// page rather than the envelope's own template.
    fn render(&self, cx: &Context, envelope: &Envelope) -> Option<(StatusCode, String, bool)> {
        let mut status = envelope.explicit_status().unwrap_or(if envelope.is_failed() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        });

        let (name, mut data, error_page_rendering) = match envelope.template() {
            Some(name) => {
                let data = match envelope.payload() {
                    Payload::Json(value) => value.clone(),
                    _ => Value::Null,
                };
                (name.to_owned(), data, false)
            }
            None => {
                if wants_json(cx) {
                    return None;
                }
                let debug = self.development && !cx.query().contains_key("__production");
                let name = if debug { DEV_ERROR_TEMPLATE.to_owned() } else { error_page(status) };
                (name, error_data(cx, envelope.failure(), status), true)
            }
        };

        let rendered = self.registry.render(&name, &data);
        let replaced = error_page_rendering || rendered.is_err();
        let html = match rendered {
            Ok(html) => html,
            Err(err) => {
                status = StatusCode::INTERNAL_SERVER_ERROR;
                let fallback = if !error_page_rendering && self.development {
                    DEV_ERROR_TEMPLATE.to_owned()
                } else {
                    error_page(status)
                };
                if !error_page_rendering {
                    data = error_data(cx, envelope.failure(), status);
                }
                data["status"] = json!(status.as_u16());
                data["template"] = json!(name);
                data["render_error"] = json!(err.to_string());
                self.registry
                    .render(&fallback, &data)
                    .unwrap_or_else(|_| last_resort(cx, &fallback, &err))
            }
        };
        Some((status, html, replaced))
    }
}

impl Middleware for TemplateLayer {
    fn name(&self) -> &str {
        "template"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let layer = Arc::new(TemplateLayer {
            registry: Arc::clone(&self.registry),
            development: self.development,
        });
        from_outcome_fn(move |cx| {
            let next = next.clone();
            let layer = Arc::clone(&layer);
            async move {
                let mut envelope = match next.call(cx.clone()).await {
                    Ok(envelope) => envelope,
                    Err(failure) => Envelope::from_failure(failure),
                };
                if envelope.template().is_none() && !envelope.is_failed() {
                    return Ok::<_, Failure>(envelope);
                }
                let Some((status, html, error_page)) = layer.render(&cx, &envelope) else {
                    return Ok(envelope);
                };
                envelope.take_template();
                envelope.take_failure();
                envelope.set_status(status);
                if error_page || !envelope.has_content_type() {
                    envelope.insert_header("content-type", TEXT_HTML);
                }
                envelope.set_payload(Payload::Text(html));
                Ok(envelope)
            }
        })
    }
}

// ── Shared template data ──────────────────────────────────────────────────────

/// Where static assets are served from when `STATIC_URL` is unset.
pub const DEFAULT_STATIC_URL: &str = "/static";

type Computed = dyn Fn(&Context) -> Value + Send + Sync;

#[derive(Clone)]
enum Extra {
    Fixed(Value),
    Computed(Arc<Computed>),
}

/// Adds `STATIC_URL` and any configured values to templated envelopes.
///
/// Values are merged into the envelope's JSON object after the inner layers
/// answer. Keys the handler already set are overwritten.
#[derive(Clone)]
pub struct TemplateContext {
    extra: Vec<(String, Extra)>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `STATIC_URL`.
    pub fn from_env(env: &Env) -> Self {
        Self::new().static_url(env.var("STATIC_URL").unwrap_or_else(|| DEFAULT_STATIC_URL.to_owned()))
    }

    pub fn static_url(self, url: impl Into<String>) -> Self {
        self.value("STATIC_URL", Value::String(url.into()))
    }

    pub fn value(self, key: impl Into<String>, value: Value) -> Self {
        self.set(key.into(), Extra::Fixed(value))
    }

    /// A value computed from the request each time.
    pub fn computed<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Context) -> Value + Send + Sync + 'static,
    {
        self.set(key.into(), Extra::Computed(Arc::new(f)))
    }

    fn set(mut self, key: String, extra: Extra) -> Self {
        self.extra.retain(|(k, _)| *k != key);
        self.extra.push((key, extra));
        self
    }

    fn apply(&self, cx: &Context, envelope: &mut Envelope) {
        if envelope.template().is_none() {
            return;
        }
        let Payload::Json(data) = envelope.payload_mut() else {
            return;
        };
        if data.is_null() {
            *data = json!({});
        }
        let Some(object) = data.as_object_mut() else {
            return;
        };
        for (key, extra) in &self.extra {
            let value = match extra {
                Extra::Fixed(value) => value.clone(),
                Extra::Computed(f) => f(cx),
            };
            object.insert(key.clone(), value);
        }
    }
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self { extra: Vec::new() }.static_url(DEFAULT_STATIC_URL)
    }
}

impl std::fmt::Debug for TemplateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.extra.iter().map(|(key, _)| key)).finish()
    }
}

impl Middleware for TemplateContext {
    fn name(&self) -> &str {
        "template-context"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let layer = Arc::new(self.clone());
        from_outcome_fn(move |cx| {
            let next = next.clone();
            let layer = Arc::clone(&layer);
            async move {
                let mut envelope = next.call(cx.clone()).await?;
                layer.apply(&cx, &mut envelope);
                Ok::<_, Failure>(envelope)
            }
        })
    }
}
