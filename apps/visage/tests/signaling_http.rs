use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use parking_lot::Mutex;

use visage::signaling::{AvatarConfig, SignalingClient, SignalingError};

struct ProviderState {
    /// Number of 429s to serve before succeeding.
    reject_first: usize,
    requests: AtomicUsize,
    auth_headers: Mutex<Vec<String>>,
}

impl ProviderState {
    fn new(reject_first: usize) -> Arc<Self> {
        Arc::new(Self {
            reject_first,
            requests: AtomicUsize::new(0),
            auth_headers: Mutex::new(Vec::new()),
        })
    }
}

async fn handle(
    state: Arc<ProviderState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if let Some(auth) = req.headers().get(hyper::header::AUTHORIZATION) {
        state
            .auth_headers
            .lock()
            .push(auth.to_str().unwrap_or_default().to_string());
    }
    let n = state.requests.fetch_add(1, Ordering::SeqCst);
    let response = match req.uri().path() {
        "/streams" if n < state.reject_first => Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .body(Body::from("busy"))
            .unwrap(),
        "/streams" => Response::builder()
            .status(StatusCode::CREATED)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{
                    "id": "s1",
                    "session_id": "x1",
                    "offer": { "type": "offer", "sdp": "v=0" },
                    "ice_servers": [{ "urls": "stun:stun.test:3478" }]
                }"#,
            ))
            .unwrap(),
        "/always-fails/streams" => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("kaboom"))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    };
    Ok(response)
}

fn spawn_provider(state: Arc<ProviderState>) -> SocketAddr {
    let make = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                handle(state, req)
            }))
        }
    });
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let server = Server::bind(&addr).serve(make);
    let bound = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    bound
}

#[tokio::test]
async fn rate_limited_create_stream_backs_off_and_recovers() {
    let state = ProviderState::new(1);
    let addr = spawn_provider(Arc::clone(&state));

    let config = AvatarConfig::new(format!("http://{addr}"), "user:secret").unwrap();
    let client = SignalingClient::new(config).unwrap();

    let started = Instant::now();
    let created = client
        .create_stream("https://img.test/face.png")
        .await
        .expect("create stream after retry");

    assert_eq!(created.id, "s1");
    assert_eq!(created.session_id, "x1");
    assert_eq!(state.requests.load(Ordering::SeqCst), 2);
    // First retry waits at least 2^1/4 = 0.5s.
    assert!(started.elapsed().as_millis() >= 500);

    let auth = state.auth_headers.lock();
    assert!(!auth.is_empty());
    assert!(auth.iter().all(|header| header.starts_with("Basic ")));
    // The user:pass key must have been Base64-encoded.
    assert!(auth.iter().all(|header| !header.contains(':')));
}

#[tokio::test]
async fn server_errors_surface_status_and_body_without_retry() {
    let state = ProviderState::new(0);
    let addr = spawn_provider(Arc::clone(&state));

    let config = AvatarConfig::new(format!("http://{addr}/always-fails"), "user:secret").unwrap();
    let client = SignalingClient::new(config).unwrap();

    let err = client
        .create_stream("https://img.test/face.png")
        .await
        .expect_err("must fail");
    match err {
        SignalingError::RemoteService { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "kaboom");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_endpoints_exhaust_into_max_retries() {
    // Nothing listens on this port; every attempt is a transport failure.
    let config = AvatarConfig::new("http://127.0.0.1:9", "user:secret").unwrap();
    let client = SignalingClient::new(config).unwrap();

    let err = client
        .create_stream("https://img.test/face.png")
        .await
        .expect_err("must exhaust");
    match err {
        SignalingError::MaxRetriesExceeded { attempts, source } => {
            assert_eq!(attempts, 5);
            assert!(matches!(*source, SignalingError::Network(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}
