//! A small fulcrum service: a greeting, a login form with sessions and CSRF,
//! and the monitor endpoints.
//!
//! Run with:
//!   SESSION_SECRET=0123456789abcdef0123456789abcdef SESSION_SALT=pepper \
//!   COOKIE_SECRET=keyboard-cat cargo run --example basic
//!
//! Try:
//!   curl http://localhost:5000/hello/world
//!   curl -c jar -b jar http://localhost:5000/login
//!   curl -c jar -b jar -X POST http://localhost:5000/login \
//!        -H 'content-type: application/json' -H "csrf-token: $TOKEN" \
//!        -d '{"form_username":"ada","form_password":"swordfish"}'
//!   curl http://localhost:5000/monitor/status

use fulcrum::concerns::csrf::Csrf;
use fulcrum::concerns::log::Log;
use fulcrum::concerns::ping::Ping;
use fulcrum::concerns::session::Sessions;
use fulcrum::concerns::status::Status;
use fulcrum::concerns::validate;
use fulcrum::config::Env;
use fulcrum::{App, Context, Failure, Json, Route};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Deserialize)]
#[allow(dead_code)]
struct LoginForm {
    form_username: String,
    form_password: String,
}

#[tokio::main]
async fn main() -> Result<(), fulcrum::Error> {
    let env = Env::process();
    let app = App::from_env()?;
    let status = Status::from_settings(app.settings());

    let app = app
        .middleware(Log)
        .middleware(Ping)
        .middleware(status)
        .middleware(Sessions::from_env(&env))
        .middleware(Csrf::from_env(&env))
        .route("GET /hello/:name", greeting)
        .route("GET /login", login_form)
        .declare(Route::new("POST /login", login).decorator(validate::body::<LoginForm>()));

    fulcrum::run(app).await
}

async fn greeting(cx: Context) -> Result<String, Failure> {
    Ok(format!("hello {}", cx.param("name").unwrap_or_default()))
}

// GET /login hands out a CSRF token for the form.
async fn login_form(cx: Context) -> Result<Json<Value>, Failure> {
    Ok(Json(json!({ "csrf": cx.csrf_token(false)? })))
}

// A wrong password is a normal answer, not a protocol failure.
async fn login(cx: Context) -> Result<Json<Value>, Failure> {
    let body = cx.body().await?;
    if body["form_password"] != "swordfish" {
        return Ok(Json(json!({ "errors": ["Invalid password"] })));
    }
    let mut session = cx.session().await?;
    session.set("user", body["form_username"].clone());
    session.reissue();
    Ok(Json(json!({ "user": body["form_username"] })))
}
