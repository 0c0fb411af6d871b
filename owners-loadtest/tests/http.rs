//! Drives the HTTP remote against an in-process fake of the owners API.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use owners_loadtest::entity::{Origin, OwnerFactory, OwnerOverrides};
use owners_loadtest::executor::{Executor, RetryPolicy};
use owners_loadtest::metrics::Metrics;
use owners_loadtest::pool::OwnerId;
use owners_loadtest::remote::{self, Endpoint, HttpRemote, SharedRemote};
use serde_json::{Value, json};

#[derive(Debug, Default)]
struct Owners {
    next_id: u64,
    owners: BTreeMap<u64, Value>,
    /// Answers this many requests with `503` before serving normally.
    unavailable: usize,
}

type FakeState = Arc<Mutex<Owners>>;

#[derive(Debug)]
struct FakeServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: FakeState,
}

impl FakeServer {
    async fn new() -> Self {
        let state = FakeState::default();

        let app = Router::new()
            .route("/dev/owners", get(list).post(create))
            .route("/dev/owners/{id}", get(read).put(update).delete(delete))
            .with_state(state.clone());

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            state,
        }
    }

    fn base_url(&self) -> String {
        format!("http://localhost:{}/dev", self.socket.port())
    }

    fn remote(&self) -> SharedRemote {
        Arc::new(HttpRemote::new(&self.base_url(), Duration::from_secs(5)).unwrap())
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn accepts_json(headers: &HeaderMap) -> bool {
    let is_json = |name| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "application/json")
    };
    is_json(header::CONTENT_TYPE) && is_json(header::ACCEPT)
}

fn with_request_id(status: StatusCode, body: Value, id: u64) -> Response {
    let request_id = format!("req-{id}");
    (status, [("x-amzn-requestid", request_id)], Json(body)).into_response()
}

fn unavailable(state: &mut Owners) -> Option<Response> {
    if state.unavailable == 0 {
        return None;
    }
    state.unavailable -= 1;
    Some(StatusCode::SERVICE_UNAVAILABLE.into_response())
}

async fn list(State(state): State<FakeState>, headers: HeaderMap) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(response) = unavailable(&mut state) {
        return response;
    }
    if !accepts_json(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let owners: Vec<_> = state.owners.values().cloned().collect();
    Json(owners).into_response()
}

async fn create(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(mut owner): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    if !accepts_json(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    state.next_id += 1;
    let id = state.next_id;
    owner["id"] = json!(id);
    state.owners.insert(id, owner.clone());
    with_request_id(StatusCode::CREATED, owner, id)
}

async fn read(State(state): State<FakeState>, Path(id): Path<u64>) -> Response {
    let state = state.lock().unwrap();
    match state.owners.get(&id) {
        Some(owner) => with_request_id(StatusCode::OK, owner.clone(), id),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn update(
    State(state): State<FakeState>,
    Path(id): Path<u64>,
    Json(mut owner): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    let Some(stored) = state.owners.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    owner["id"] = json!(id);
    *stored = owner.clone();
    Json(owner).into_response()
}

async fn delete(State(state): State<FakeState>, Path(id): Path<u64>) -> StatusCode {
    let mut state = state.lock().unwrap();
    match state.owners.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

fn executor(remote: SharedRemote, policy: RetryPolicy) -> Executor {
    Executor::new(remote, Arc::new(Metrics::default()), policy)
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(10),
        jitter: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn crud_against_http_api() {
    let server = FakeServer::new().await;
    let executor = executor(server.remote(), RetryPolicy::default());
    let factory = OwnerFactory::new(10).unwrap();

    let owner = factory.make(&OwnerOverrides::default(), Origin::Sequence(0));
    let created = executor.create(&owner).await;
    assert_eq!(created.status, Some(201));
    assert_eq!(created.request_id.as_deref(), Some("req-1"));
    let id = created.owner_id().unwrap();
    assert_eq!(id, OwnerId::Number(1));

    let read = executor.get(&id).await;
    assert_eq!(read.status, Some(200));
    let body: Value = serde_json::from_slice(&read.body).unwrap();
    assert_eq!(body["telephone"], json!(owner.telephone));
    assert_eq!(body["firstName"], json!(owner.first_name));

    let listed = executor.list().await;
    assert!(listed.is_success());

    let changed = factory.make(&OwnerOverrides::default(), Origin::Sequence(1));
    assert_eq!(executor.update(&id, &changed).await.status, Some(200));
    assert_eq!(executor.delete(&id).await.status, Some(204));
    assert_eq!(executor.get(&id).await.status, Some(404));

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.requests, 6);
    assert_eq!(snapshot.successes, 5);
    assert_eq!(snapshot.named_errors.not_found, 1);
    assert_eq!(snapshot.requests_to(Endpoint::GetOwner), 2);
}

#[tokio::test]
async fn retries_unavailable_gateway() {
    let server = FakeServer::new().await;
    server.state.lock().unwrap().unavailable = 2;
    let executor = executor(server.remote(), fast_retries());

    let response = executor.list().await;
    assert_eq!(response.status, Some(200));
    assert_eq!(response.attempts, 3);

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.requests, 1);
    assert_eq!(snapshot.retried_attempts, 2);
    assert_eq!(snapshot.failures(), 0);
}

#[tokio::test]
async fn gives_up_when_unavailable() {
    let server = FakeServer::new().await;
    server.state.lock().unwrap().unavailable = 10;
    let executor = executor(server.remote(), fast_retries());

    let response = executor.list().await;
    assert_eq!(response.status, Some(503));
    assert_eq!(response.attempts, 3);
    assert_eq!(server.state.lock().unwrap().unavailable, 7);

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.status.server_error, 1);
    assert_eq!(executor.metrics().error_samples().len(), 1);
}

#[tokio::test]
async fn connection_failures_are_transport_errors() {
    let port = {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.local_addr().unwrap().port()
    };
    let base_url = format!("http://127.0.0.1:{port}/dev");
    let remote: SharedRemote = Arc::new(HttpRemote::new(&base_url, Duration::from_secs(5)).unwrap());

    let executor = executor(remote, fast_retries());
    let response = executor.list().await;
    assert_eq!(response.status, None);
    assert_eq!(response.attempts, 3);
    assert_eq!(executor.metrics().snapshot().status.transport, 1);
}

#[test]
fn memory_scheme_selects_in_memory_store() {
    let remote = remote::from_base_url("memory://", Duration::from_secs(1)).unwrap();
    assert_eq!(remote.name(), "in-memory");

    let remote = remote::from_base_url("http://localhost:1/dev", Duration::from_secs(1)).unwrap();
    assert_eq!(remote.name(), "http");
}
