//! Optional concern middlewares and decorators.
//!
//! None of these are installed by default. Add them to an
//! [`App`](crate::App) in the order they should wrap each other; the first
//! one added is the outermost.
//!
//! | Concern | Kind | Intercepts |
//! |---|---|---|
//! | [`log::Log`] | middleware | nothing; one access-log event per request |
//! | [`ping::Ping`] | middleware | `GET /monitor/ping` |
//! | [`status::Status`] | middleware | `/monitor/status` |
//! | [`cors::Cors`] | middleware | `OPTIONS` preflights |
//! | [`csrf::Csrf`] | factory | unsafe methods without a valid token |
//! | [`session::Sessions`] | factory | nothing; persists dirty sessions |
//! | [`database::Database`] | factory | nothing; wraps unsafe methods in a transaction |
//! | [`jwt::Jwt`] | factory | bearer tokens that fail verification |
//! | [`staticfiles::StaticFiles`] | factory | `/static/*` in development |
//! | [`template::Templates`] | factory | templated and failed envelopes |
//! | [`template::TemplateContext`] | middleware | nothing; adds shared template data |
//! | [`headers::ApplyHeaders`], [`headers::Vary`] | middleware | nothing |
//! | [`validate`] | decorators | requests whose input does not deserialize |

pub mod cors;
pub mod csrf;
pub mod database;
pub mod headers;
pub mod jwt;
pub mod log;
pub mod ping;
pub mod session;
pub mod staticfiles;
pub mod status;
pub mod template;
pub mod validate;

mod signing;
