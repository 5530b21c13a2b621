//! An in-process mock registry implementing just enough of the Docker
//! Distribution v2 pull surface for integration tests: bearer challenges, a
//! token endpoint, manifest negotiation, and ranged blob fetches.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

pub const TEST_TOKEN: &str = "test-token";

/// Shared, mutable state behind the mock registry's handlers.
#[derive(Default)]
pub struct RegistryState {
    /// Whether manifest and blob routes demand a bearer token.
    pub require_auth: bool,

    /// Manifest documents keyed by reference (tag or digest).
    pub manifests: Mutex<HashMap<String, (String, Vec<u8>)>>,

    /// Blob bodies keyed by `sha256:<hex>` digest.
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,

    /// Realm URL advertised in bearer challenges; set once the port is known.
    pub realm: Mutex<String>,

    /// Counts of authorized manifest requests (including retried failures).
    pub manifest_hits: AtomicUsize,

    /// Counts of blob requests that reached the payload stage.
    pub blob_hits: AtomicUsize,

    /// Total blob payload bytes written to responses.
    pub served_bytes: AtomicUsize,

    /// How many upcoming manifest requests should fail with 503.
    pub fail_manifest_remaining: AtomicUsize,

    /// When set, Range headers are ignored and blobs served whole with 200.
    pub ignore_range: AtomicBool,

    /// The Range header of the most recent blob request, if any.
    pub last_range: Mutex<Option<String>>,

    /// Blob digests whose responses are held until released.
    pub hold: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

/// A running mock registry bound to an ephemeral local port.
pub struct MockRegistry {
    pub addr: SocketAddr,
    pub state: Arc<RegistryState>,
    _server: JoinHandle<()>,
}

impl RegistryState {
    /// Registers a manifest document under a reference.
    pub fn add_manifest(&self, reference: &str, media_type: &str, body: Vec<u8>) {
        self.manifests
            .lock()
            .unwrap()
            .insert(reference.to_string(), (media_type.to_string(), body));
    }

    /// Registers a blob, returning its digest and size.
    pub fn add_blob(&self, data: Vec<u8>) -> (String, i64) {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
        let size = data.len() as i64;
        self.blobs.lock().unwrap().insert(digest.clone(), data);
        (digest, size)
    }

    /// Parks responses for `digest` until the returned sender publishes
    /// `false`.
    pub fn hold_digest(&self, digest: &str) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(true);
        self.hold.lock().unwrap().insert(digest.to_string(), rx);
        tx
    }
}

impl MockRegistry {
    /// Binds the registry on an ephemeral port and starts serving.
    pub async fn start(state: RegistryState) -> Self {
        let state = Arc::new(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        *state.realm.lock().unwrap() = format!("http://{addr}/token");

        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            _server: server,
        }
    }

    /// The registry base URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The host component references resolve to, e.g. `127.0.0.1:41234`.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }
}

async fn handle(State(state): State<Arc<RegistryState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();

    if path == "/token" {
        return Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"token":"{TEST_TOKEN}"}}"#)))
            .unwrap();
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some((_repo, reference)) = rest.split_once("/manifests/") {
        if state.require_auth && !authorized(&req) {
            let realm = state.realm.lock().unwrap().clone();
            return Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(
                    header::WWW_AUTHENTICATE,
                    format!(r#"Bearer realm="{realm}",service="mock-registry""#),
                )
                .body(Body::empty())
                .unwrap();
        }

        state.manifest_hits.fetch_add(1, Ordering::SeqCst);
        if take_failure(&state.fail_manifest_remaining) {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        let manifest = state.manifests.lock().unwrap().get(reference).cloned();
        return match manifest {
            Some((media_type, body)) => Response::builder()
                .header(header::CONTENT_TYPE, media_type)
                .body(Body::from(body))
                .unwrap(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    if let Some((_repo, digest)) = rest.split_once("/blobs/") {
        if state.require_auth && !authorized(&req) {
            return StatusCode::UNAUTHORIZED.into_response();
        }

        // Park while the test holds this digest.
        let gate = state.hold.lock().unwrap().get(digest).cloned();
        if let Some(mut gate) = gate {
            while *gate.borrow() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }

        state.blob_hits.fetch_add(1, Ordering::SeqCst);
        let data = state.blobs.lock().unwrap().get(digest).cloned();
        let Some(data) = data else {
            return StatusCode::NOT_FOUND.into_response();
        };

        let range = req
            .headers()
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        *state.last_range.lock().unwrap() = range.clone();

        if let Some(range) = range {
            if !state.ignore_range.load(Ordering::SeqCst) {
                if let Some(start) = parse_range_start(&range) {
                    let start = (start as usize).min(data.len());
                    let slice = data[start..].to_vec();
                    state.served_bytes.fetch_add(slice.len(), Ordering::SeqCst);
                    return Response::builder()
                        .status(StatusCode::PARTIAL_CONTENT)
                        .body(Body::from(slice))
                        .unwrap();
                }
            }
        }

        state.served_bytes.fetch_add(data.len(), Ordering::SeqCst);
        return Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(data))
            .unwrap();
    }

    StatusCode::NOT_FOUND.into_response()
}

fn authorized(req: &Request) -> bool {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {TEST_TOKEN}"))
        .unwrap_or(false)
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    loop {
        let current = remaining.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        if remaining
            .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

fn parse_range_start(range: &str) -> Option<u64> {
    range
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

/// Builds a manifest document referencing a config blob and layer blobs.
pub fn manifest_json(config: (&str, i64), layers: &[(&str, i64)]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|(digest, size)| {
            serde_json::json!({
                "mediaType": "application/octet-stream",
                "digest": digest,
                "size": size,
            })
        })
        .collect();
    serde_json::json!({
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/octet-stream",
            "digest": config.0,
            "size": config.1,
        },
        "layers": layers,
    })
    .to_string()
    .into_bytes()
}

/// Builds an index document from `(digest, os, architecture)` entries.
pub fn index_json(entries: &[(&str, &str, &str)]) -> Vec<u8> {
    let manifests: Vec<_> = entries
        .iter()
        .map(|(digest, os, arch)| {
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": digest,
                "platform": { "os": os, "architecture": arch },
            })
        })
        .collect();
    serde_json::json!({ "manifests": manifests })
        .to_string()
        .into_bytes()
}
