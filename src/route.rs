//! Route declarations.
//!
//! A route is a handler plus everything the router needs to know about it:
//!
//! ```rust,no_run
//! use fulcrum::{Context, Failure, Route};
//!
//! async fn greeting(cx: Context) -> Result<String, Failure> {
//!     Ok(format!("hello {}", cx.param("name").unwrap_or("stranger")))
//! }
//!
//! let route = Route::new("GET /hello/:name", greeting).version("1.0.0");
//! ```
//!
//! The route string is `"METHOD /path"`, split on the first space. A bare
//! `/path` is `GET` unless [`Route::method`] or [`Route::methods`] says
//! otherwise.

use std::sync::Arc;

use crate::body::BodyParserLayer;
use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::{Middleware, MiddlewareFactory};

/// A handler with its route metadata.
pub struct Route {
    declaration: String,
    methods: Vec<Method>,
    pub(crate) version: Option<String>,
    pub(crate) handler: BoxedHandler,
    pub(crate) middleware: Vec<Box<dyn MiddlewareFactory>>,
    pub(crate) decorators: Vec<Arc<dyn Middleware>>,
    pub(crate) body_parsers: Option<Vec<BodyParserLayer>>,
}

impl Route {
    pub fn new(declaration: &str, handler: impl Handler) -> Self {
        Self {
            declaration: declaration.trim().to_owned(),
            methods: Vec::new(),
            version: None,
            handler: handler.into_boxed_handler(),
            middleware: Vec::new(),
            decorators: Vec::new(),
            body_parsers: None,
        }
    }

    /// Method for a bare-path route.
    pub fn method(self, method: Method) -> Self {
        self.methods([method])
    }

    /// Methods for a bare-path route. Ignored when the route string names
    /// its own method.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Matches only requests whose `accept-version` header selects this
    /// version. The response varies on `accept-version`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Route-scoped middleware, composed like global middleware.
    pub fn middleware(mut self, factory: impl MiddlewareFactory) -> Self {
        self.middleware.push(Box::new(factory));
        self
    }

    /// Adds a decorator. The first one added is the outermost.
    pub fn decorator(mut self, decorator: impl Middleware) -> Self {
        self.decorators.push(Arc::new(decorator));
        self
    }

    /// Replaces the application's body parsers for this route.
    pub fn body_parsers(mut self, layers: Vec<BodyParserLayer>) -> Self {
        self.body_parsers = Some(layers);
        self
    }

    /// The methods and path this route answers.
    pub(crate) fn target(&self) -> Result<(Vec<Method>, String), Error> {
        let (methods, path) = match self.declaration.split_once(char::is_whitespace) {
            Some((method, path)) => {
                let method = method.parse::<Method>().map_err(|()| Error::InvalidRoute {
                    route: self.declaration.clone(),
                    reason: format!("unknown method `{method}`"),
                })?;
                (vec![method], path.trim())
            }
            None if self.methods.is_empty() => (vec![Method::Get], self.declaration.as_str()),
            None => (self.methods.clone(), self.declaration.as_str()),
        };
        if !path.starts_with('/') {
            return Err(Error::InvalidRoute {
                route: self.declaration.clone(),
                reason: "path must start with `/`".to_owned(),
            });
        }
        Ok((methods, path.to_owned()))
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("declaration", &self.declaration)
            .field("version", &self.version)
            .field("middleware", &self.middleware.len())
            .field("decorators", &self.decorators.len())
            .finish()
    }
}
