//! In-process HTTP asset server for download tests

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the server answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Honour `Range: bytes=N-`
    Ranged,
    /// Always answer 200 with the whole body
    IgnoreRange,
    /// Declare the full length but drop the connection after N bytes
    CutAfter(usize),
    /// Send N bytes, then never finish
    StallAfter(usize),
    /// Answer 503 for the first N requests, then behave like `Ranged`
    FailTimes(usize),
    NotFound,
}

struct Shared {
    data: Vec<u8>,
    mode: Mutex<ServeMode>,
    hits: AtomicUsize,
    last_range: Mutex<Option<String>>,
}

pub struct AssetServer {
    base: String,
    shared: Arc<Shared>,
}

impl AssetServer {
    pub async fn start(data: Vec<u8>, mode: ServeMode) -> Self {
        let shared = Arc::new(Shared {
            data,
            mode: Mutex::new(mode),
            hits: AtomicUsize::new(0),
            last_range: Mutex::new(None),
        });
        let app = Router::new()
            .route("/asset/{name}", get(serve_asset))
            .with_state(shared.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base: format!("http://{addr}"),
            shared,
        }
    }

    pub fn url(&self) -> String {
        self.url_for("game.bin")
    }

    pub fn url_for(&self, name: &str) -> String {
        format!("{}/asset/{}", self.base, name)
    }

    pub fn set_mode(&self, mode: ServeMode) {
        *self.shared.mode.lock() = mode;
    }

    pub fn hits(&self) -> usize {
        self.shared.hits.load(Ordering::SeqCst)
    }

    pub fn last_range(&self) -> Option<String> {
        self.shared.last_range.lock().clone()
    }
}

fn requested_offset(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .trim_end_matches('-')
        .parse()
        .ok()
}

async fn serve_asset(State(shared): State<Arc<Shared>>, headers: HeaderMap) -> Response {
    let hit = shared.hits.fetch_add(1, Ordering::SeqCst);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *shared.last_range.lock() = range;

    let mode = *shared.mode.lock();
    let len = shared.data.len();
    match mode {
        ServeMode::NotFound => StatusCode::NOT_FOUND.into_response(),
        ServeMode::FailTimes(n) if hit < n => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        ServeMode::IgnoreRange => full(&shared.data),
        ServeMode::CutAfter(cut) => {
            let head = Bytes::copy_from_slice(&shared.data[..cut.min(len)]);
            // Hold the error back until the headers and head chunk are on
            // the wire, otherwise hyper aborts before responding at all.
            let cut_off = stream::once(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<Bytes, _>(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "cut"))
            });
            let body = stream::iter(vec![Ok::<_, std::io::Error>(head)]).chain(cut_off);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, len)
                .body(Body::from_stream(body))
                .expect("response")
        }
        ServeMode::StallAfter(stall) => {
            let head = Bytes::copy_from_slice(&shared.data[..stall.min(len)]);
            let body = stream::iter(vec![Ok::<_, std::io::Error>(head)])
                .chain(stream::pending());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, len)
                .body(Body::from_stream(body))
                .expect("response")
        }
        ServeMode::Ranged | ServeMode::FailTimes(_) => match requested_offset(&headers) {
            Some(start) if start >= len => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{len}"))
                .body(Body::empty())
                .expect("response"),
            Some(start) => Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{}/{len}", len - 1))
                .body(Body::from(shared.data[start..].to_vec()))
                .expect("response"),
            None => full(&shared.data),
        },
    }
}

fn full(data: &[u8]) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from(data.to_vec()))
        .expect("response")
}
