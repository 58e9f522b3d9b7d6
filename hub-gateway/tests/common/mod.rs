//! Common test utilities and helpers
//!
//! Fake upstreams (registry, token service, CDN and a generic web host) run as
//! small axum apps on loopback ports. The gateway under test is wired to them
//! through [`gateway_config`] and driven with `axum-test`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_test::TestServer;
use hub_gateway::{build_router, AppState, GatewayConfig};
use serde_json::json;
use tokio::net::TcpListener;
use url::Url;

/// The CDN hop that finally answers. Reaching it from the registry takes six
/// follows when starting at hop 1.
pub const CHAIN_END: usize = 6;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

/// Requests seen by one fake upstream.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Recorded>>>);

impl Recorder {
    fn push(&self, method: &Method, uri: &Uri, headers: &HeaderMap) {
        self.0.lock().unwrap().push(Recorded {
            method: method.clone(),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers: headers.clone(),
        });
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.0.lock().unwrap().clone()
    }

    pub fn last(&self) -> Recorded {
        self.all().pop().expect("no request recorded")
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

pub struct Upstreams {
    pub registry: String,
    pub auth: String,
    pub cdn: String,
    pub web: String,
    pub registry_seen: Recorder,
    pub auth_seen: Recorder,
    pub cdn_seen: Recorder,
    pub web_seen: Recorder,
}

/// Serves `app` on an ephemeral loopback port and returns its base URL.
pub async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// `127.0.0.1:<port>` of a base URL.
pub fn host_of(base: &str) -> String {
    let url = Url::parse(base).unwrap();
    format!("{}:{}", url.host_str().unwrap(), url.port().unwrap())
}

pub async fn start_upstreams() -> Upstreams {
    let cdn_seen = Recorder::default();
    let cdn = spawn(cdn_app(cdn_seen.clone())).await;

    let auth_seen = Recorder::default();
    let auth = spawn(auth_app(auth_seen.clone())).await;

    let registry_seen = Recorder::default();
    let registry = spawn(registry_app(RegistryState {
        seen: registry_seen.clone(),
        cdn: cdn.clone(),
        auth: auth.clone(),
    }))
    .await;

    let web_seen = Recorder::default();
    let web = spawn(echo_app(web_seen.clone())).await;

    Upstreams {
        registry,
        auth,
        cdn,
        web,
        registry_seen,
        auth_seen,
        cdn_seen,
        web_seen,
    }
}

/// Embedded defaults pointed at the fake upstreams. Host prefix `other`
/// routes to the web host, which then acts as a non-Docker-Hub registry.
pub fn gateway_config(up: &Upstreams) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.upstream_scheme = "http".to_string();
    config.public_scheme = "http".to_string();
    config.default_upstream = host_of(&up.registry);
    config.auth_url = up.auth.clone();
    config.index_host = host_of(&up.web);
    config.hub_web_host = host_of(&up.web);
    config
        .aliases
        .insert("other".to_string(), host_of(&up.web));
    config
}

pub fn gateway(config: GatewayConfig) -> TestServer {
    let state = AppState::new(config).expect("Failed to build gateway state");
    TestServer::new(build_router(state)).expect("Failed to create test server")
}

fn record(seen: &Recorder, method: &Method, uri: &Uri, headers: &HeaderMap) {
    seen.push(method, uri, headers);
}

fn auth_app(seen: Recorder) -> Router {
    Router::new()
        .route(
            "/token",
            get(
                |State(seen): State<Recorder>,
                 method: Method,
                 uri: Uri,
                 headers: HeaderMap,
                 Query(params): Query<HashMap<String, String>>| async move {
                    record(&seen, &method, &uri, &headers);
                    let scope = params.get("scope").cloned().unwrap_or_default();
                    (
                        [(header::CACHE_CONTROL, "no-cache")],
                        Json(json!({ "token": format!("tok-{scope}"), "expires_in": 300 })),
                    )
                },
            ),
        )
        .with_state(seen)
}

/// Token service that always fails.
pub fn broken_auth_app() -> Router {
    Router::new().route(
        "/token",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
    )
}

#[derive(Clone)]
struct RegistryState {
    seen: Recorder,
    cdn: String,
    auth: String,
}

fn registry_app(state: RegistryState) -> Router {
    Router::new()
        .route("/v2/", get(api_root))
        .route("/v2/library/nginx/manifests/{reference}", get(manifest))
        .route("/v2/library/nginx/blobs/{digest}", get(blob_redirect))
        .route("/v2/library/loop/blobs/{digest}", get(long_chain))
        .route("/v2/library/short/blobs/{digest}", get(short_chain))
        .fallback(echo_registry)
        .with_state(state)
}

async fn api_root(
    State(state): State<RegistryState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state.seen, &method, &uri, &headers);
    match headers.get(header::AUTHORIZATION) {
        Some(value) => Json(json!({ "authorization": value.to_str().unwrap() })).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            [
                (
                    header::WWW_AUTHENTICATE,
                    format!(
                        r#"Bearer realm="{}/token",service="registry.docker.io""#,
                        state.auth
                    ),
                ),
                (header::CACHE_CONTROL, "no-store".to_string()),
            ],
            "unauthorized",
        )
            .into_response(),
    }
}

async fn manifest(
    State(state): State<RegistryState>,
    Path(reference): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state.seen, &method, &uri, &headers);
    let expected = "Bearer tok-repository:library/nginx:pull";
    if headers.get(header::AUTHORIZATION).map(|v| v.as_bytes()) != Some(expected.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, "missing brokered token").into_response();
    }
    (
        [
            (header::CONTENT_TYPE, "application/vnd.oci.image.index.v1+json"),
            (header::HeaderName::from_static("docker-content-digest"), "sha256:abc"),
            (
                header::HeaderName::from_static("content-security-policy"),
                "default-src 'none'",
            ),
            (header::CACHE_CONTROL, "private"),
        ],
        Json(json!({ "schemaVersion": 2, "tag": reference })),
    )
        .into_response()
}

async fn blob_redirect(
    State(state): State<RegistryState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Redirect {
    record(&state.seen, &method, &uri, &headers);
    Redirect::temporary(&format!("{}/blob123", state.cdn))
}

async fn long_chain(State(state): State<RegistryState>) -> Redirect {
    Redirect::temporary(&format!("{}/hop/1", state.cdn))
}

async fn short_chain(State(state): State<RegistryState>) -> Redirect {
    Redirect::temporary(&format!("{}/hop/2", state.cdn))
}

async fn echo_registry(
    State(state): State<RegistryState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<serde_json::Value> {
    record(&state.seen, &method, &uri, &headers);
    echo_body(&method, &uri, &body)
}

fn echo_body(method: &Method, uri: &Uri, body: &Bytes) -> Json<serde_json::Value> {
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "body": String::from_utf8_lossy(body),
    }))
}

fn echo_app(seen: Recorder) -> Router {
    Router::new()
        .fallback(
            |State(seen): State<Recorder>,
             method: Method,
             uri: Uri,
             headers: HeaderMap,
             body: Bytes| async move {
                record(&seen, &method, &uri, &headers);
                echo_body(&method, &uri, &body)
            },
        )
        .with_state(seen)
}

fn cdn_app(seen: Recorder) -> Router {
    Router::new()
        .route(
            "/blob123",
            get(
                |State(seen): State<Recorder>, method: Method, uri: Uri, headers: HeaderMap| async move {
                    record(&seen, &method, &uri, &headers);
                    (
                        [(header::CONTENT_TYPE, "application/octet-stream")],
                        "layer-bytes",
                    )
                },
            ),
        )
        .route(
            "/hop/{n}",
            get(|Path(n): Path<usize>, headers: HeaderMap| async move {
                if n >= CHAIN_END {
                    return "end of chain".into_response();
                }
                let host = headers[header::HOST].to_str().unwrap().to_string();
                Redirect::temporary(&format!("http://{host}/hop/{}", n + 1)).into_response()
            }),
        )
        .with_state(seen)
}
