//! Completed-request logging.
//!
//! # Responsibilities
//! - Count request and response body bytes as they stream
//! - Hand one [`RequestRecord`] per request to a [`RequestObserver`]
//!
//! # Design Decisions
//! - The record is emitted when the response body finishes or is dropped,
//!   so streamed and aborted responses are both logged
//! - Observers are pluggable; the default writes a tracing event

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Buf;
use http_body::{Frame, SizeHint};
use pin_project_lite::pin_project;

/// Summary of one completed request.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub remote_addr: Option<SocketAddr>,
    pub status: u16,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub duration: Duration,
    pub method: Method,
    pub host: String,
    pub path: String,
    pub user_agent: String,
}

/// Sink for completed requests.
pub trait RequestObserver: Send + Sync + 'static {
    fn observe(&self, record: &RequestRecord);
}

/// Writes each record as an `info` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RequestObserver for TracingObserver {
    fn observe(&self, record: &RequestRecord) {
        let remote = record
            .remote_addr
            .map_or_else(|| "-".to_string(), |addr| addr.to_string());
        tracing::info!(
            remote_addr = %remote,
            status = record.status,
            bytes_read = record.bytes_read,
            bytes_written = record.bytes_written,
            duration_ms = record.duration.as_millis() as u64,
            method = %record.method,
            host = %record.host,
            path = %record.path,
            user_agent = %record.user_agent,
            "request completed"
        );
    }
}

pin_project! {
    /// Body wrapper that counts data bytes passing through it.
    pub struct CountingBody<B> {
        #[pin]
        inner: B,
        counter: Arc<AtomicU64>,
        on_drop: Option<RecordOnDrop>,
    }
}

impl<B> CountingBody<B> {
    pub fn new(inner: B, counter: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            counter,
            on_drop: None,
        }
    }

    fn with_record(mut self, record: RecordOnDrop) -> Self {
        self.on_drop = Some(record);
        self
    }
}

impl<B> http_body::Body for CountingBody<B>
where
    B: http_body::Body,
    B::Data: Buf,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled {
            if let Some(data) = frame.data_ref() {
                this.counter.fetch_add(data.remaining() as u64, Ordering::Relaxed);
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Emits the record once the response body is gone.
pub struct RecordOnDrop {
    observer: Arc<dyn RequestObserver>,
    record: RequestRecord,
    started: Instant,
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl Drop for RecordOnDrop {
    fn drop(&mut self) {
        self.record.duration = self.started.elapsed();
        self.record.bytes_read = self.bytes_read.load(Ordering::Relaxed);
        self.record.bytes_written = self.bytes_written.load(Ordering::Relaxed);
        self.observer.observe(&self.record);
    }
}

pub async fn request_log_middleware(
    State(observer): State<Arc<dyn RequestObserver>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (method, host, path, user_agent) = {
        let headers = request.headers();
        let header_str = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let host = match headers.get(header::HOST) {
            Some(_) => header_str(header::HOST),
            None => request.uri().authority().map(|a| a.to_string()).unwrap_or_default(),
        };
        (
            request.method().clone(),
            host,
            request.uri().path().to_string(),
            header_str(header::USER_AGENT),
        )
    };

    let bytes_read = Arc::new(AtomicU64::new(0));
    let request = request.map(|body| Body::new(CountingBody::new(body, bytes_read.clone())));

    let response = next.run(request).await;

    let bytes_written = Arc::new(AtomicU64::new(0));
    let record = RecordOnDrop {
        observer,
        record: RequestRecord {
            remote_addr,
            status: response.status().as_u16(),
            bytes_read: 0,
            bytes_written: 0,
            duration: Duration::ZERO,
            method,
            host,
            path,
            user_agent,
        },
        started,
        bytes_read,
        bytes_written: bytes_written.clone(),
    };
    response.map(|body| Body::new(CountingBody::new(body, bytes_written).with_record(record)))
}
