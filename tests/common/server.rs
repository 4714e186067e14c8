//! Test platform lifecycle management
//!
//! This module manages spawning and shutting down an in-process mock of the
//! remote platform: storage, blob gateway, vcluster and apps endpoints plus
//! a few introspection routes. Each test gets an isolated server with its
//! own in-memory state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::header::{COOKIE, ETAG, LAST_MODIFIED, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const SERVER_READY_TIMEOUT_MS: u64 = 5_000;
const SERVER_READY_POLL_INTERVAL_MS: u64 = 10;

/// One node of the mock storage tree.
#[derive(Debug, Clone)]
pub struct StorageNode {
    pub is_dir: bool,
    pub data: Vec<u8>,
    pub mtime: i64,
}

/// One stored blob object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub mtime: i64,
    pub etag: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceAccountRecord {
    pub user: String,
    pub name: String,
    pub created_at: String,
    pub expired_at: String,
}

/// Shared mutable state behind the mock platform. Tests seed it directly
/// and inspect it after driving the client.
pub struct PlatformState {
    /// Storage tree keyed by normalized absolute path ("/" is the root).
    pub storage: Mutex<BTreeMap<String, StorageNode>>,
    /// Blob objects keyed by bucket, then key.
    pub objects: Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>,
    pub accounts: Mutex<Vec<ServiceAccountRecord>>,
    pub apps: Mutex<Vec<Value>>,
    /// Number of storage CREATE requests observed.
    pub create_requests: AtomicUsize,
    /// Number of storage OPEN requests observed.
    pub open_requests: AtomicUsize,
    /// Number of object PUT requests observed, failures included.
    pub put_requests: AtomicUsize,
    /// Number of object GET requests observed, failures included.
    pub get_requests: AtomicUsize,
    /// Number of object listing requests observed.
    pub list_requests: AtomicUsize,
    /// Fail the next N object PUTs with 502.
    pub put_failures: AtomicUsize,
    /// Fail the next N object GETs with 503.
    pub get_failures: AtomicUsize,
    /// Storage path whose CREATE requests fail with 503.
    pub fail_create_path: Mutex<Option<String>>,
    /// Maximum entries per object listing page; 0 means unlimited.
    pub page_size: AtomicUsize,
    /// Answer object listings with no contents but `is_truncated` set,
    /// imitating a gateway whose cursor cannot advance.
    pub stuck_listing: std::sync::atomic::AtomicBool,
    /// Content-MD5 header of the last object PUT.
    pub last_md5: Mutex<Option<String>>,
}

impl PlatformState {
    fn new() -> Self {
        let mut storage = BTreeMap::new();
        storage.insert(
            "/".to_string(),
            StorageNode {
                is_dir: true,
                data: Vec::new(),
                mtime: unix_now(),
            },
        );
        Self {
            storage: Mutex::new(storage),
            objects: Mutex::new(BTreeMap::new()),
            accounts: Mutex::new(Vec::new()),
            apps: Mutex::new(Vec::new()),
            create_requests: AtomicUsize::new(0),
            open_requests: AtomicUsize::new(0),
            put_requests: AtomicUsize::new(0),
            get_requests: AtomicUsize::new(0),
            list_requests: AtomicUsize::new(0),
            put_failures: AtomicUsize::new(0),
            get_failures: AtomicUsize::new(0),
            fail_create_path: Mutex::new(None),
            page_size: AtomicUsize::new(0),
            stuck_listing: std::sync::atomic::AtomicBool::new(false),
            last_md5: Mutex::new(None),
        }
    }

    /// Insert a directory and any missing ancestors.
    pub fn seed_dir(&self, path: &str) {
        let mut storage = self.storage.lock().unwrap();
        insert_ancestors(&mut storage, path);
        storage.insert(
            normalize(path),
            StorageNode {
                is_dir: true,
                data: Vec::new(),
                mtime: unix_now(),
            },
        );
    }

    /// Insert a file, creating missing parent directories.
    pub fn seed_file(&self, path: &str, data: &[u8], mtime: i64) {
        let mut storage = self.storage.lock().unwrap();
        insert_ancestors(&mut storage, path);
        storage.insert(
            normalize(path),
            StorageNode {
                is_dir: false,
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub fn storage_node(&self, path: &str) -> Option<StorageNode> {
        self.storage.lock().unwrap().get(&normalize(path)).cloned()
    }

    /// Create a bucket if it does not exist yet.
    pub fn seed_bucket(&self, bucket: &str) {
        self.objects
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default();
    }

    pub fn seed_object(&self, bucket: &str, key: &str, data: &[u8], mtime: i64) {
        self.objects
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: data.to_vec(),
                    mtime,
                    etag: format!("\"seed-{}\"", data.len()),
                },
            );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }
}

/// Test server instance with isolated platform state
///
/// When dropped, the server gracefully shuts down.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Platform state for direct seeding and inspection in tests
    pub state: Arc<PlatformState>,

    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port
    ///
    /// This function:
    /// 1. Creates empty platform state
    /// 2. Binds to a random port (127.0.0.1:0)
    /// 3. Spawns the server in a background task
    /// 4. Waits for the server to be ready
    ///
    /// # Panics
    ///
    /// Panics if:
    /// - Port binding fails
    /// - Server fails to start
    /// - Server doesn't become ready within timeout
    pub async fn spawn() -> Self {
        let state = Arc::new(PlatformState::new());

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = make_app(state.clone());

        // Spawn server in background task with graceful shutdown
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
            .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            state,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling the root endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn make_app(state: Arc<PlatformState>) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/echo", get(echo_headers))
        .route("/respond/{code}", get(canned_status))
        .route("/cookies/set", get(set_cookies))
        .route("/cookies/show", get(show_cookies))
        .route("/ws", get(ws_echo_auth))
        .route("/ws-denied", get(ws_denied))
        .route("/storage", any(storage_root))
        .route("/storage/{*path}", any(storage_op))
        .route("/blob/b", get(list_buckets))
        .route("/blob/o/{bucket}", get(list_objects))
        .route("/blob/o/{bucket}/{*key}", any(object_op))
        .route(
            "/vcluster/kube/cluster/{cluster}/org/{org}/project/{project}/config",
            any(accounts_root),
        )
        .route(
            "/vcluster/kube/cluster/{cluster}/org/{org}/project/{project}/config/{name}",
            any(account_op),
        )
        .route(
            "/apis/apps/v1/cluster/{cluster}/org/{org}/project/{project}/instances",
            get(list_apps),
        )
        .route(
            "/apis/apps/v1/cluster/{cluster}/org/{org}/project/{project}/instances/{id}",
            delete(uninstall_app),
        )
        .with_state(state)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_key(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => None,
    }
}

fn insert_ancestors(storage: &mut BTreeMap<String, StorageNode>, path: &str) {
    let mut current = normalize(path);
    while let Some(parent) = parent_key(&current) {
        storage.entry(parent.clone()).or_insert_with(|| StorageNode {
            is_dir: true,
            data: Vec::new(),
            mtime: unix_now(),
        });
        current = parent;
    }
}

fn error_json(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn path_not_found(path: &str) -> Response {
    error_json(
        StatusCode::NOT_FOUND,
        format!("File does not exist: {path}"),
    )
}

fn file_status_json(label: &str, node: &StorageNode) -> Value {
    json!({
        "path": label,
        "length": node.data.len(),
        "type": if node.is_dir { "DIRECTORY" } else { "FILE" },
        "modificationTime": node.mtime,
        "permission": "manage",
    })
}

async fn echo_headers(headers: HeaderMap) -> Json<Value> {
    let mut out = serde_json::Map::new();
    for (name, value) in &headers {
        out.insert(
            name.as_str().to_string(),
            json!(value.to_str().unwrap_or_default()),
        );
    }
    Json(Value::Object(out))
}

async fn canned_status(
    UrlPath(code): UrlPath<u16>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = params.get("body").cloned().unwrap_or_default();
    (status, body).into_response()
}

async fn set_cookies() -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.append(
        SET_COOKIE,
        HeaderValue::from_static("SKYLIFT_API_SESSION=abc123; Path=/"),
    );
    headers.append(SET_COOKIE, HeaderValue::from_static("scratch=zzz; Path=/"));
    response
}

/// Accepts the handshake and sends back the Authorization header it saw.
async fn ws_echo_auth(headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |mut socket| async move {
        let _ = socket
            .send(WsMessage::Text(format!("auth={auth}").into()))
            .await;
    })
}

async fn ws_denied() -> Response {
    let mut response = StatusCode::FORBIDDEN.into_response();
    response.headers_mut().insert(
        "x-error",
        HeaderValue::from_static("websocket access denied"),
    );
    response
}

async fn show_cookies(headers: HeaderMap) -> String {
    headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn storage_root(
    State(state): State<Arc<PlatformState>>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    storage_handle(&state, "/".to_string(), params, body)
}

async fn storage_op(
    State(state): State<Arc<PlatformState>>,
    UrlPath(path): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    storage_handle(&state, normalize(&path), params, body)
}

fn storage_handle(
    state: &PlatformState,
    path: String,
    params: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let op = params.get("op").cloned().unwrap_or_default();
    match op.as_str() {
        "LISTSTATUS" => {
            let storage = state.storage.lock().unwrap();
            let Some(node) = storage.get(&path) else {
                return path_not_found(&path);
            };
            if !node.is_dir {
                return error_json(StatusCode::BAD_REQUEST, format!("Not a directory: {path}"));
            }
            let children: Vec<Value> = storage
                .iter()
                .filter(|(key, _)| parent_key(key.as_str()).as_deref() == Some(path.as_str()))
                .map(|(key, child)| {
                    let name = key.rsplit('/').next().unwrap_or(key);
                    file_status_json(name, child)
                })
                .collect();
            Json(json!({ "FileStatuses": { "FileStatus": children } })).into_response()
        }
        "GETFILESTATUS" => {
            let storage = state.storage.lock().unwrap();
            let Some(node) = storage.get(&path) else {
                return path_not_found(&path);
            };
            Json(json!({ "FileStatus": file_status_json(&path, node) })).into_response()
        }
        "MKDIRS" => {
            let mut storage = state.storage.lock().unwrap();
            insert_ancestors(&mut storage, &path);
            storage.insert(
                path,
                StorageNode {
                    is_dir: true,
                    data: Vec::new(),
                    mtime: unix_now(),
                },
            );
            Json(json!({ "boolean": true })).into_response()
        }
        "CREATE" => {
            state.create_requests.fetch_add(1, Ordering::SeqCst);
            if state.fail_create_path.lock().unwrap().as_deref() == Some(path.as_str()) {
                return error_json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Storage write unavailable: {path}"),
                );
            }
            let mut storage = state.storage.lock().unwrap();
            insert_ancestors(&mut storage, &path);
            storage.insert(
                path,
                StorageNode {
                    is_dir: false,
                    data: body.to_vec(),
                    mtime: unix_now(),
                },
            );
            StatusCode::CREATED.into_response()
        }
        "OPEN" => {
            state.open_requests.fetch_add(1, Ordering::SeqCst);
            let storage = state.storage.lock().unwrap();
            let Some(node) = storage.get(&path) else {
                return path_not_found(&path);
            };
            node.data.clone().into_response()
        }
        "DELETE" => {
            let mut storage = state.storage.lock().unwrap();
            if !storage.contains_key(&path) {
                return path_not_found(&path);
            }
            let subtree_prefix = format!("{}/", path.trim_end_matches('/'));
            storage.retain(|key, _| key != &path && !key.starts_with(&subtree_prefix));
            Json(json!({ "boolean": true })).into_response()
        }
        "RENAME" => {
            let Some(destination) = params.get("destination") else {
                return error_json(StatusCode::BAD_REQUEST, "Missing destination".to_string());
            };
            let destination = normalize(destination);
            let mut storage = state.storage.lock().unwrap();
            if !storage.contains_key(&path) {
                return path_not_found(&path);
            }
            let subtree_prefix = format!("{}/", path.trim_end_matches('/'));
            let moved: Vec<(String, StorageNode)> = storage
                .iter()
                .filter(|(key, _)| *key == &path || key.starts_with(&subtree_prefix))
                .map(|(key, node)| {
                    let suffix = &key[path.len()..];
                    (format!("{destination}{suffix}"), node.clone())
                })
                .collect();
            storage.retain(|key, _| key != &path && !key.starts_with(&subtree_prefix));
            insert_ancestors(&mut storage, &destination);
            storage.extend(moved);
            Json(json!({ "boolean": true })).into_response()
        }
        other => error_json(
            StatusCode::BAD_REQUEST,
            format!("Unsupported storage op: {other}"),
        ),
    }
}

async fn list_buckets(State(state): State<Arc<PlatformState>>) -> Json<Value> {
    let objects = state.objects.lock().unwrap();
    let buckets: Vec<Value> = objects
        .keys()
        .map(|name| {
            json!({
                "name": name,
                "creation_date": "2026-01-01T00:00:00+00:00",
            })
        })
        .collect();
    Json(json!(buckets))
}

async fn list_objects(
    State(state): State<Arc<PlatformState>>,
    UrlPath(bucket): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.list_requests.fetch_add(1, Ordering::SeqCst);
    let objects = state.objects.lock().unwrap();
    let Some(bucket_objects) = objects.get(&bucket) else {
        return error_json(StatusCode::NOT_FOUND, format!("No such bucket: {bucket}"));
    };
    let prefix = params.get("prefix").cloned().unwrap_or_default();
    let recursive = params.get("recursive").map(|v| v == "true").unwrap_or(false);
    let start_after = params.get("start_after");
    let page_size = state.page_size.load(Ordering::SeqCst);
    let limit = if page_size == 0 { usize::MAX } else { page_size };

    let mut contents = Vec::new();
    let mut prefixes = BTreeSet::new();
    let mut truncated = false;
    for (key, object) in bucket_objects.iter() {
        if !key.starts_with(&prefix) {
            continue;
        }
        if let Some(after) = start_after {
            if key.as_str() <= after.as_str() {
                continue;
            }
        }
        let rest = &key[prefix.len()..];
        if !recursive {
            if let Some(idx) = rest.find('/') {
                prefixes.insert(format!("{prefix}{}/", &rest[..idx]));
                continue;
            }
        }
        if contents.len() == limit {
            truncated = true;
            break;
        }
        contents.push(json!({
            "key": key,
            "size": object.data.len(),
            "last_modified": object.mtime,
        }));
    }
    let common_prefixes: Vec<Value> = prefixes
        .into_iter()
        .map(|prefix| json!({ "prefix": prefix }))
        .collect();
    if state.stuck_listing.load(Ordering::SeqCst) {
        return Json(json!({
            "contents": [],
            "common_prefixes": common_prefixes,
            "is_truncated": true,
        }))
        .into_response();
    }
    Json(json!({
        "contents": contents,
        "common_prefixes": common_prefixes,
        "is_truncated": truncated,
    }))
    .into_response()
}

async fn object_op(
    State(state): State<Arc<PlatformState>>,
    UrlPath((bucket, key)): UrlPath<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::PUT {
        state.put_requests.fetch_add(1, Ordering::SeqCst);
        if state.put_failures.load(Ordering::SeqCst) > 0 {
            state.put_failures.fetch_sub(1, Ordering::SeqCst);
            return error_json(
                StatusCode::BAD_GATEWAY,
                "Upstream object write failed".to_string(),
            );
        }
        *state.last_md5.lock().unwrap() = headers
            .get("Content-MD5")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let etag = format!("\"etag-{}\"", body.len());
        state
            .objects
            .lock()
            .unwrap()
            .entry(bucket)
            .or_default()
            .insert(
                key,
                StoredObject {
                    data: body.to_vec(),
                    mtime: unix_now(),
                    etag: etag.clone(),
                },
            );
        let mut response = StatusCode::OK.into_response();
        if let Ok(value) = HeaderValue::from_str(&etag) {
            response.headers_mut().insert(ETAG, value);
        }
        response
    } else if method == Method::GET || method == Method::HEAD {
        if method == Method::GET {
            state.get_requests.fetch_add(1, Ordering::SeqCst);
            if state.get_failures.load(Ordering::SeqCst) > 0 {
                state.get_failures.fetch_sub(1, Ordering::SeqCst);
                return error_json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Upstream object read failed".to_string(),
                );
            }
        }
        let Some(object) = state.object(&bucket, &key) else {
            return error_json(
                StatusCode::NOT_FOUND,
                format!("No such object: {bucket}/{key}"),
            );
        };
        let last_modified = chrono::DateTime::from_timestamp(object.mtime, 0)
            .map(|t| t.to_rfc2822())
            .unwrap_or_default();
        let mut response = object.data.into_response();
        let response_headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&last_modified) {
            response_headers.insert(LAST_MODIFIED, value);
        }
        if let Ok(value) = HeaderValue::from_str(&object.etag) {
            response_headers.insert(ETAG, value);
        }
        response
    } else if method == Method::DELETE {
        let mut objects = state.objects.lock().unwrap();
        let removed = objects
            .get_mut(&bucket)
            .and_then(|bucket_objects| bucket_objects.remove(&key));
        if removed.is_none() {
            return error_json(
                StatusCode::NOT_FOUND,
                format!("No such object: {bucket}/{key}"),
            );
        }
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn accounts_root(
    State(state): State<Arc<PlatformState>>,
    UrlPath((cluster, _org, _project)): UrlPath<(String, String, String)>,
    method: Method,
    body: Bytes,
) -> Response {
    if method == Method::GET {
        let accounts = state.accounts.lock().unwrap();
        Json(json!(&*accounts)).into_response()
    } else if method == Method::POST {
        let payload: Value = serde_json::from_slice(&body).unwrap_or_default();
        let Some(name) = payload["name"].as_str().map(str::to_owned) else {
            return error_json(StatusCode::BAD_REQUEST, "name is required".to_string());
        };
        let ttl_secs = payload["ttl"].as_u64().unwrap_or(365 * 24 * 60 * 60);
        upsert_account(&state, &cluster, &name, ttl_secs)
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn account_op(
    State(state): State<Arc<PlatformState>>,
    UrlPath((cluster, _org, _project, name)): UrlPath<(String, String, String, String)>,
    method: Method,
    body: Bytes,
) -> Response {
    if method == Method::PUT {
        let payload: Value = serde_json::from_slice(&body).unwrap_or_default();
        let ttl_secs = payload["ttl"].as_u64().unwrap_or(365 * 24 * 60 * 60);
        upsert_account(&state, &cluster, &name, ttl_secs)
    } else if method == Method::DELETE {
        let mut accounts = state.accounts.lock().unwrap();
        let Some(position) = accounts.iter().position(|account| account.name == name) else {
            return error_json(
                StatusCode::NOT_FOUND,
                format!("No such service account: {name}"),
            );
        };
        let record = accounts.remove(position);
        Json(json!(record)).into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

fn upsert_account(state: &PlatformState, cluster: &str, name: &str, ttl_secs: u64) -> Response {
    let now = chrono::Utc::now();
    let record = ServiceAccountRecord {
        user: "alice".to_string(),
        name: name.to_string(),
        created_at: now.to_rfc3339(),
        expired_at: (now + chrono::Duration::seconds(ttl_secs as i64)).to_rfc3339(),
    };
    let mut accounts = state.accounts.lock().unwrap();
    accounts.retain(|account| account.name != name);
    accounts.push(record);
    bundle_yaml(cluster, name).into_response()
}

fn bundle_yaml(cluster: &str, name: &str) -> String {
    let entry = format!("{cluster}-{name}");
    [
        "apiVersion: v1".to_string(),
        "kind: Config".to_string(),
        "clusters:".to_string(),
        format!("- name: {entry}"),
        "  cluster:".to_string(),
        "    server: https://vcluster.test:6443".to_string(),
        "contexts:".to_string(),
        format!("- name: {entry}"),
        "  context:".to_string(),
        format!("    cluster: {entry}"),
        format!("    user: {name}"),
        format!("current-context: {entry}"),
        "users:".to_string(),
        format!("- name: {name}"),
        "  user:".to_string(),
        format!("    token: sa-token-{name}"),
    ]
    .join("\n")
}

async fn list_apps(State(state): State<Arc<PlatformState>>) -> Json<Value> {
    let apps = state.apps.lock().unwrap();
    Json(json!({ "items": &*apps }))
}

async fn uninstall_app(
    State(state): State<Arc<PlatformState>>,
    UrlPath((_cluster, _org, _project, id)): UrlPath<(String, String, String, String)>,
) -> Response {
    let mut apps = state.apps.lock().unwrap();
    let before = apps.len();
    apps.retain(|app| app["id"].as_str() != Some(id.as_str()));
    if apps.len() == before {
        return error_json(StatusCode::NOT_FOUND, format!("No such instance: {id}"));
    }
    StatusCode::NO_CONTENT.into_response()
}
