use std::sync::atomic::{AtomicUsize, Ordering};

use fulcrum::body::{BodyInput, json as json_parser};
use fulcrum::concerns::validate;
use fulcrum::middleware::{Next, from_fn};
use fulcrum::testing::inject;
use fulcrum::{App, BodyParser, Context, Failure, Json, Route, RuntimeMode, Service, Settings};
use http::{Request, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

fn settings(mode: RuntimeMode) -> Settings {
    Settings { mode, ..Settings::default() }
}

fn get(uri: &str) -> Request<&'static str> {
    Request::get(uri).body("").unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<String> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(body.to_string())
        .unwrap()
}

async fn greeting(cx: Context) -> Result<String, Failure> {
    Ok(format!("hello {}", cx.param("name").unwrap_or_default()))
}

async fn login(cx: Context) -> Result<Json<Value>, Failure> {
    let body = cx.body().await?;
    if body["form_password"] != "swordfish" {
        return Ok(Json(json!({ "errors": ["Invalid password"] })));
    }
    Ok(Json(json!({ "user": body["form_username"] })))
}

async fn boom(_cx: Context) -> Result<(), Failure> {
    Err(Failure::new("boom"))
}

async fn service(mode: RuntimeMode) -> Service {
    App::new(settings(mode))
        .route("GET /hello/:name", greeting)
        .route("POST /login", login)
        .route("GET /boom", boom)
        .build()
        .await
        .unwrap()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn greeting_renders_plain_text() {
    let res = inject(&service(RuntimeMode::Test).await, get("/hello/world")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.text(), "hello world");
    assert_eq!(res.header("content-type"), Some("text/plain; charset=utf-8"));
    assert_eq!(res.header("connection"), Some("keep-alive"));
}

#[tokio::test]
async fn routing_follows_the_request_target_not_the_host() {
    async fn root(_cx: Context) -> Result<&'static str, Failure> {
        Ok("ROOT")
    }
    let service = App::new(settings(RuntimeMode::Test))
        .route("GET /", root)
        .route("GET /hello/:name", greeting)
        .build()
        .await
        .unwrap();

    for host in ["[::1]:5000", "[::1]", "example.com:8080", "bad host"] {
        let req = Request::get("/hello/world").header("host", host).body("").unwrap();
        let res = inject(&service, req).await;
        assert_eq!(res.status, StatusCode::OK, "{host}");
        assert_eq!(res.text(), "hello world", "{host}");
    }
}

#[tokio::test]
async fn params_arrive_percent_decoded() {
    let service = service(RuntimeMode::Test).await;
    let res = inject(&service, get("/hello/John%20Doe")).await;
    assert_eq!(res.text(), "hello John Doe");

    let res = inject(&service, get("/hello/caf%C3%A9")).await;
    assert_eq!(res.text(), "hello caf\u{e9}");
}

#[tokio::test]
async fn failed_logins_are_application_data() {
    let service = service(RuntimeMode::Test).await;
    let res = inject(&service, post_json("/login", json!({"form_username": "a", "form_password": "wrong"}))).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["errors"], json!(["Invalid password"]));

    let res = inject(&service, post_json("/login", json!({"form_username": "a", "form_password": "swordfish"}))).await;
    assert_eq!(res.json(), json!({"user": "a"}));
}

// ── Failure shapes ────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_routes_are_404_with_diagnostics_in_development() {
    let res = inject(&service(RuntimeMode::Development).await, get("/nope?x=1")).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    let body = res.json();
    assert_eq!(body["message"], json!("Could not find route for GET /nope"));
    assert!(body["stack"].is_array());
    assert_eq!(body["context"]["query"], json!({"x": "1"}));
    assert!(body["context"]["available"].as_array().unwrap().contains(&json!("GET /hello/:name")));
}

#[tokio::test]
async fn production_hides_the_stack() {
    let res = inject(&service(RuntimeMode::Production).await, get("/boom")).await;
    assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.json(), json!({"message": "boom"}));
}

#[tokio::test]
async fn unknown_methods_are_405() {
    let req = Request::builder().method("BREW").uri("/hello/world").body("").unwrap();
    let res = inject(&service(RuntimeMode::Test).await, req).await;
    assert_eq!(res.status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn bodies_without_content_type_are_415() {
    let req = Request::post("/login").body("form_password=x").unwrap();
    let res = inject(&service(RuntimeMode::Test).await, req).await;
    assert_eq!(res.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn malformed_json_is_422() {
    let req = Request::post("/login")
        .header("content-type", "application/json")
        .body("{nope")
        .unwrap();
    let res = inject(&service(RuntimeMode::Test).await, req).await;
    assert_eq!(res.status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn panics_become_500s() {
    async fn explode(_cx: Context) -> Result<String, Failure> {
        let items: Vec<u8> = Vec::new();
        Ok(items[3].to_string())
    }
    let service = App::new(settings(RuntimeMode::Production))
        .route("/explode", explode)
        .build()
        .await
        .unwrap();
    let res = inject(&service, get("/explode")).await;
    assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(res.json()["message"].is_string());
}

#[tokio::test]
async fn returned_failures_keep_their_status() {
    async fn refuse(_cx: Context) -> Result<Failure, Failure> {
        Ok(Failure::bad_request("nope"))
    }
    let service = App::new(settings(RuntimeMode::Production)).route("/refuse", refuse).build().await.unwrap();
    let res = inject(&service, get("/refuse")).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.json(), json!({"message": "nope"}));
}

// ── Composition ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn middleware_observes_failures_as_envelopes() {
    let observer = from_fn("observer", |cx: Context, next: Next| async move {
        let mut envelope = next.run(cx).await?;
        let seen = format!("{} {}", envelope.is_failed(), envelope.status_code().as_u16());
        envelope.insert_header("x-observed", &seen);
        Ok::<_, Failure>(envelope)
    });
    let service = App::new(settings(RuntimeMode::Production))
        .middleware(observer)
        .route("/boom", boom)
        .build()
        .await
        .unwrap();
    let res = inject(&service, get("/boom")).await;
    assert_eq!(res.header("x-observed"), Some("true 500"));
    assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn passthrough_middleware_changes_nothing() {
    let bare = service(RuntimeMode::Production).await;
    let wrapped = App::new(settings(RuntimeMode::Production))
        .middleware(from_fn("noop", |cx: Context, next: Next| async move { next.run(cx).await }))
        .route("GET /hello/:name", greeting)
        .route("GET /boom", boom)
        .build()
        .await
        .unwrap();

    for uri in ["/hello/world", "/boom", "/missing"] {
        let a = inject(&bare, get(uri)).await;
        let b = inject(&wrapped, get(uri)).await;
        assert_eq!(a.status, b.status, "{uri}");
        assert_eq!(a.body, b.body, "{uri}");
        assert_eq!(a.header("content-type"), b.header("content-type"), "{uri}");
    }
}

#[tokio::test]
async fn middleware_runs_outermost_first() {
    fn tag(name: &'static str) -> impl fulcrum::middleware::Middleware {
        from_fn(name, move |cx: Context, next: Next| async move {
            let mut envelope = next.run(cx).await?;
            let trail = envelope.header("x-trail").map(|t| format!("{t},{name}")).unwrap_or(name.to_owned());
            envelope.insert_header("x-trail", &trail);
            Ok::<_, Failure>(envelope)
        })
    }
    let service = App::new(settings(RuntimeMode::Test))
        .middleware(tag("outer"))
        .middleware(tag("inner"))
        .declare(Route::new("/", greeting).middleware(tag("route")))
        .build()
        .await
        .unwrap();
    let res = inject(&service, get("/")).await;
    assert_eq!(res.header("x-trail"), Some("route,inner,outer"));
}

#[tokio::test]
async fn decorators_can_answer_for_the_handler() {
    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Page {
        page: u32,
    }
    let service = App::new(settings(RuntimeMode::Production))
        .declare(Route::new("/items", greeting).decorator(validate::query::<Page>()))
        .build()
        .await
        .unwrap();

    let res = inject(&service, get("/items?page=x")).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.json()["errors"][0]["source"], json!("query"));

    let res = inject(&service, get("/items?page=2")).await;
    assert_eq!(res.status, StatusCode::OK);
}

#[tokio::test]
async fn versioned_routes_win_and_vary() {
    async fn v1(_cx: Context) -> Result<&'static str, Failure> {
        Ok("v1")
    }
    async fn v2(_cx: Context) -> Result<&'static str, Failure> {
        Ok("v2")
    }
    let service = App::new(settings(RuntimeMode::Test))
        .route("/api", v1)
        .declare(Route::new("/api", v2).version("2.0.0"))
        .build()
        .await
        .unwrap();

    let res = inject(&service, Request::get("/api").header("accept-version", "2.0.0").body("").unwrap()).await;
    assert_eq!(res.text(), "v2");
    assert_eq!(res.header("vary"), Some("accept-version"));

    let res = inject(&service, get("/api")).await;
    assert_eq!(res.text(), "v1");
}

// ── Body ──────────────────────────────────────────────────────────────────────

static PARSES: AtomicUsize = AtomicUsize::new(0);

fn counting(next: BodyParser) -> BodyParser {
    BodyParser::new(move |input: BodyInput| {
        PARSES.fetch_add(1, Ordering::SeqCst);
        next.parse(input)
    })
}

#[tokio::test]
async fn bodies_are_parsed_once() {
    async fn twice(cx: Context) -> Result<Json<Value>, Failure> {
        let first = cx.body().await?;
        let second = cx.body().await?;
        assert_eq!(first, second);
        Ok(Json(second))
    }
    let service = App::new(settings(RuntimeMode::Test))
        .body_parsers(vec![counting, json_parser])
        .route("POST /twice", twice)
        .build()
        .await
        .unwrap();

    let res = inject(&service, post_json("/twice", json!({"a": 1}))).await;
    assert_eq!(res.json(), json!({"a": 1}));
    assert_eq!(PARSES.load(Ordering::SeqCst), 1);
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn draining_services_close_connections() {
    let service = service(RuntimeMode::Test).await;
    service.shutdown().begin();
    let res = inject(&service, get("/hello/world")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.header("connection"), Some("close"));
}
