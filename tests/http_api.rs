use bodega::http_server::{router, AppState};
use bodega::{Config, Store};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Helper: serve a fresh store on an ephemeral port
async fn start_server(auth: Option<(String, String)>) -> (SocketAddr, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::builder()
        .data_dir(dir.path())
        .idle_timeout(None)
        .build();
    let store = Arc::new(Store::open(config).unwrap());
    let state = AppState {
        store,
        start_time: Instant::now(),
    };
    let app = router(state, auth);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, dir)
}

/// Helper: raw HTTP/1.1 request, returning status and parsed JSON body
async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<Value>,
    extra_headers: &[(&str, &str)],
) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut req = format!("{method} {path} HTTP/1.1\r\nhost: {addr}\r\nconnection: close\r\n");
    for (name, value) in extra_headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    match body {
        Some(body) => {
            let body = body.to_string();
            req.push_str(&format!(
                "content-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            ));
        }
        None => req.push_str("\r\n"),
    }

    stream.write_all(req.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();

    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("malformed status line");
    let body_text = text.split("\r\n\r\n").nth(1).unwrap_or("");
    let body = serde_json::from_str(body_text).unwrap_or(Value::Null);
    (status, body)
}

async fn get(addr: SocketAddr, path: &str) -> (u16, Value) {
    request(addr, "GET", path, None, &[]).await
}

async fn post(addr: SocketAddr, path: &str, body: Value) -> (u16, Value) {
    request(addr, "POST", path, Some(body), &[]).await
}

async fn delete(addr: SocketAddr, path: &str, body: Option<Value>) -> (u16, Value) {
    request(addr, "DELETE", path, body, &[]).await
}

#[tokio::test]
async fn test_status_reports_server_info() {
    let (addr, _dir) = start_server(None).await;

    let (status, body) = get(addr, "/v1/status").await;
    assert_eq!(status, 200);
    assert!(body["hostname"].is_string());
    assert!(body["uptime_seconds"].is_u64());
    assert_eq!(body["open_databases"], json!(0));

    let (status, body) = get(addr, "/v1/uptime").await;
    assert_eq!(status, 200);
    assert!(body["uptime_seconds"].is_u64());
}

#[tokio::test]
async fn test_bucket_crud_flow() {
    let (addr, _dir) = start_server(None).await;

    let (status, _) = post(addr, "/v1/db/app/create", json!(["users", "jobs"])).await;
    assert_eq!(status, 200);

    let (status, body) = get(addr, "/v1/db/app/buckets").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!(["jobs", "users"]));

    let (status, body) = post(
        addr,
        "/v1/db/app/bucket/users/update",
        json!({"zack": "canada", "anna": "norway"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], json!("updated 2 keys in users"));

    let (status, body) = get(addr, "/v1/db/app/bucket/users/all").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"anna": "norway", "zack": "canada"}));

    let (status, body) = post(
        addr,
        "/v1/db/app/bucket/users/some",
        json!(["zack", "ghost"]),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"zack": "canada"}));

    let (status, body) = get(addr, "/v1/db/app/bucket/users/keys").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!(["anna", "zack"]));

    let (status, body) = get(addr, "/v1/db/app/bucket/users/count").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"count": 2}));

    let (status, body) = get(addr, "/v1/db/app/stats").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"jobs": 0, "users": 2}));

    let (status, body) = get(addr, "/v1/db/app/bucket/users/haskey/zack").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!(true));

    let (status, body) = get(addr, "/v1/db/app/bucket/users/haskey/ghost").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!(false));

    let (status, body) = post(
        addr,
        "/v1/db/app/haskeys",
        json!({"buckets": ["users", "missing"], "keys": ["anna", "nope"]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"anna": true, "nope": false}));

    let (status, _) = delete(
        addr,
        "/v1/db/app/bucket/users/keys",
        Some(json!(["anna"])),
    )
    .await;
    assert_eq!(status, 200);

    let (_, body) = get(addr, "/v1/db/app/bucket/users/count").await;
    assert_eq!(body, json!({"count": 1}));
}

#[tokio::test]
async fn test_queue_pop_and_move_flow() {
    let (addr, _dir) = start_server(None).await;

    let (status, _) = post(
        addr,
        "/v1/db/queue/bucket/pending/update",
        json!({"t1": "a", "t2": "b", "t3": "c", "t4": "d"}),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = post(addr, "/v1/db/queue/bucket/pending/pop?n=2", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"t1": "a", "t2": "b"}));

    let (_, body) = get(addr, "/v1/db/queue/bucket/pending/keys").await;
    assert_eq!(body, json!(["t3", "t4"]));

    let (status, body) = post(
        addr,
        "/v1/db/queue/move",
        json!({"from_bucket": "pending", "to_bucket": "done", "keys": ["t3", "ghost"]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"moved": ["t3"]}));

    let (status, body) = post(
        addr,
        "/v1/db/queue/movetop",
        json!({"from_bucket": "pending", "to_bucket": "done", "n": 5}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"t4": "d"}));

    let (_, body) = get(addr, "/v1/db/queue/bucket/done/count").await;
    assert_eq!(body, json!({"count": 2}));

    let (_, body) = get(addr, "/v1/db/queue/bucket/pending/count").await;
    assert_eq!(body, json!({"count": 0}));
}

#[tokio::test]
async fn test_missing_things_map_to_404() {
    let (addr, _dir) = start_server(None).await;

    let (status, body) = get(addr, "/v1/db/app/bucket/nope/all").await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, body) = delete(addr, "/v1/db/ghost", None).await;
    assert_eq!(status, 404);
    assert!(body["error"].is_string());

    let (status, _) = post(
        addr,
        "/v1/db/app/move",
        json!({"from_bucket": "nope", "to_bucket": "done", "keys": ["k"]}),
    )
    .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_invalid_n_is_rejected() {
    let (addr, _dir) = start_server(None).await;

    let (status, _) = post(
        addr,
        "/v1/db/queue/bucket/pending/update",
        json!({"t1": "a"}),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = post(addr, "/v1/db/queue/bucket/pending/pop?n=0", json!({})).await;
    assert_eq!(status, 400);
    assert!(body["error"].is_string());

    let (status, _) = post(addr, "/v1/db/queue/bucket/pending/pop?n=-3", json!({})).await;
    assert_eq!(status, 400);

    // Missing query entirely is also a client error.
    let (status, _) = post(addr, "/v1/db/queue/bucket/pending/pop", json!({})).await;
    assert_eq!(status, 400);

    let (status, _) = post(
        addr,
        "/v1/db/queue/movetop",
        json!({"from_bucket": "pending", "to_bucket": "done", "n": 0}),
    )
    .await;
    assert_eq!(status, 400);

    // Nothing was popped or moved by the rejected calls.
    let (_, body) = get(addr, "/v1/db/queue/bucket/pending/count").await;
    assert_eq!(body, json!({"count": 1}));
}

#[tokio::test]
async fn test_invalid_database_name_is_rejected() {
    let (addr, _dir) = start_server(None).await;

    let (status, body) = get(addr, "/v1/db/%2e%2e/buckets").await;
    assert_eq!(status, 400);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_delete_bucket_and_database() {
    let (addr, _dir) = start_server(None).await;

    let (status, _) = post(
        addr,
        "/v1/db/app/bucket/users/update",
        json!({"k": "v"}),
    )
    .await;
    assert_eq!(status, 200);

    let (status, _) = delete(addr, "/v1/db/app/bucket/users", None).await;
    assert_eq!(status, 200);

    let (status, _) = get(addr, "/v1/db/app/bucket/users/all").await;
    assert_eq!(status, 404);

    let (status, _) = delete(addr, "/v1/db/app", None).await;
    assert_eq!(status, 200);

    let (status, _) = delete(addr, "/v1/db/app", None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_empty_bucket_reads_as_empty_map() {
    let (addr, _dir) = start_server(None).await;

    let (status, _) = post(addr, "/v1/db/app/create", json!(["empty"])).await;
    assert_eq!(status, 200);

    let (status, body) = get(addr, "/v1/db/app/bucket/empty/all").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn test_basic_auth_guards_every_route() {
    let auth = Some(("zack".to_string(), "123".to_string()));
    let (addr, _dir) = start_server(auth).await;

    let (status, _) = get(addr, "/v1/status").await;
    assert_eq!(status, 401);

    let (status, _) = post(addr, "/v1/db/app/create", json!(["b"])).await;
    assert_eq!(status, 401);

    // "zack:123" base64-encoded.
    let header = [("authorization", "Basic emFjazoxMjM=")];
    let (status, _) = request(addr, "GET", "/v1/status", None, &header).await;
    assert_eq!(status, 200);

    let (status, _) = request(
        addr,
        "POST",
        "/v1/db/app/create",
        Some(json!(["b"])),
        &header,
    )
    .await;
    assert_eq!(status, 200);

    let wrong = [("authorization", "Basic d3Jvbmc6Y3JlZHM=")];
    let (status, _) = request(addr, "GET", "/v1/status", None, &wrong).await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_cors_preflight_bypasses_auth() {
    let auth = Some(("zack".to_string(), "123".to_string()));
    let (addr, _dir) = start_server(auth).await;

    let headers = [
        ("origin", "http://example.com"),
        ("access-control-request-method", "POST"),
    ];
    let (status, _) = request(addr, "OPTIONS", "/v1/db/app/create", None, &headers).await;
    assert_eq!(status, 200);
}
