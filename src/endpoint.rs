//! Duplex endpoint: the server half of the exchange.
//!
//! Each accepted connection runs on its own task. A request that passes
//! validation is switched to full duplex, the 200 status is flushed right
//! away so the initiator's read side unblocks, and then frames are pumped
//! in both directions on the same request/response pair until the peer
//! closes, the connection goes away, or shutdown is requested.

use crate::codec::{Frame, FrameCodec, CONTENT_TYPE_NDJSON};
use crate::config::{ExchangePolicy, ExchangeSettings};
use crate::error::{ExchangeError, LifecycleError};
use crate::metrics::Observer;
use crate::transport::{
    bind_listener, body_reader, ChannelBody, HttpResponseWriter, ResponseWriter,
};
use bytes::BytesMut;
use futures::StreamExt;
use http::header::{HeaderValue, ACCEPT, ALLOW, CONTENT_TYPE};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 1024;

/// How a single exchange ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Request failed validation; no duplex setup happened.
    Rejected(StatusCode),
    /// The transport cannot stream both directions.
    DuplexUnavailable,
    /// The initiator stopped sending.
    PeerClosed,
    /// Shutdown was requested.
    Cancelled,
}

/// Check method and content negotiation. On mismatch the rejection
/// status is written (not flushed) and returned.
fn reject<W: ResponseWriter>(parts: &Parts, writer: &mut W) -> Option<StatusCode> {
    if parts.method != Method::POST {
        writer.set_header(ALLOW, HeaderValue::from_static("POST"));
        writer.write_header(StatusCode::METHOD_NOT_ALLOWED);
        info!(wrong_method = %parts.method, "client attempted to connect with wrong method instead of POST");
        return Some(StatusCode::METHOD_NOT_ALLOWED);
    }

    let content_type = header_str(parts, CONTENT_TYPE);
    if !is_ndjson(content_type) {
        writer.write_header(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        info!(
            wrong_content_type = content_type.unwrap_or_default(),
            "client attempted to connect with wrong content-type instead of {}", CONTENT_TYPE_NDJSON
        );
        return Some(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    let accept = header_str(parts, ACCEPT);
    if !is_ndjson(accept) {
        writer.write_header(StatusCode::NOT_ACCEPTABLE);
        info!(
            wrong_accept = accept.unwrap_or_default(),
            "client requested data in wrong format instead of {}", CONTENT_TYPE_NDJSON
        );
        return Some(StatusCode::NOT_ACCEPTABLE);
    }

    None
}

fn header_str(parts: &Parts, name: http::header::HeaderName) -> Option<&str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Media type match ignoring parameters and case.
fn is_ndjson(value: Option<&str>) -> bool {
    value
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_NDJSON))
}

/// Run one exchange over an already-accepted request.
///
/// Rejections, duplex refusal, peer close and cancellation are normal
/// outcomes; only unexpected I/O or frame failures come back as `Err`.
pub async fn serve_exchange<R, W>(
    parts: &Parts,
    body: R,
    writer: &mut W,
    settings: &ExchangeSettings,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> Result<SessionEnd, ExchangeError>
where
    R: AsyncRead + Send + Unpin,
    W: ResponseWriter,
{
    if let Some(status) = reject(parts, writer) {
        return Ok(SessionEnd::Rejected(status));
    }

    if let Err(e) = writer.enable_full_duplex() {
        warn!(error = %e, "failed to enable full duplex on http writer");
        return Ok(SessionEnd::DuplexUnavailable);
    }

    // The initiator is blocked until it sees response headers.
    writer.set_header(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_NDJSON));
    writer.write_header(StatusCode::OK);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        flushed = writer.flush() => flushed?,
    }
    info!("wrote status ok to client");

    let frames = FramedRead::new(body, settings.codec());
    let result = match settings.policy {
        ExchangePolicy::Paired => pump_paired(frames, writer, settings, observer, cancel).await,
        ExchangePolicy::Independent => {
            pump_independent(frames, writer, settings, observer, cancel).await
        }
    };

    match result {
        Err(e) if e.is_peer_closed() => Ok(SessionEnd::PeerClosed),
        other => other,
    }
}

/// Answer each inbound ping with exactly one pong.
async fn pump_paired<R, W>(
    mut frames: FramedRead<R, FrameCodec>,
    writer: &mut W,
    settings: &ExchangeSettings,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> Result<SessionEnd, ExchangeError>
where
    R: AsyncRead + Send + Unpin,
    W: ResponseWriter,
{
    let mut out = Outbound::new(settings);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            next = frames.next() => next,
        };

        let ping = match next {
            Some(frame) => frame?,
            None => return Ok(SessionEnd::PeerClosed),
        };
        debug!(msg = %ping.msg, seq = ?ping.seq, "received message from client");
        observer.ping_received();

        match out.send(writer, &Frame::pong(ping.seq), cancel).await? {
            Some(bytes) => {
                debug!(seq = ?ping.seq, "sent pong to client");
                observer.pong_sent(bytes);
            }
            None => return Ok(SessionEnd::Cancelled),
        }
    }
}

/// Read pings and write pongs on independent schedules.
async fn pump_independent<R, W>(
    mut frames: FramedRead<R, FrameCodec>,
    writer: &mut W,
    settings: &ExchangeSettings,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> Result<SessionEnd, ExchangeError>
where
    R: AsyncRead + Send + Unpin,
    W: ResponseWriter,
{
    let mut out = Outbound::new(settings);
    let mut pacer = settings.pacer();
    let mut seq = 0u64;

    // Unbiased: in max-throughput mode both branches are always ready.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            next = frames.next() => {
                let ping = match next {
                    Some(frame) => frame?,
                    None => return Ok(SessionEnd::PeerClosed),
                };
                debug!(msg = %ping.msg, seq = ?ping.seq, "received message from client");
                observer.ping_received();
            }
            _ = pacer.tick() => {
                seq += 1;
                match out.send(writer, &Frame::pong(Some(seq)), cancel).await? {
                    Some(bytes) => {
                        debug!(seq, "sent pong to client");
                        observer.pong_sent(bytes);
                    }
                    None => return Ok(SessionEnd::Cancelled),
                }
            }
        }
    }
}

/// Encoder plus scratch buffer for outbound frames.
struct Outbound {
    codec: FrameCodec,
    scratch: BytesMut,
}

impl Outbound {
    fn new(settings: &ExchangeSettings) -> Self {
        Self {
            codec: settings.codec(),
            scratch: BytesMut::new(),
        }
    }

    /// Encode, write and flush one frame. `None` if cancelled mid-flush.
    async fn send<W: ResponseWriter>(
        &mut self,
        writer: &mut W,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, ExchangeError> {
        self.scratch.clear();
        self.codec.encode(frame, &mut self.scratch)?;
        writer.write(&self.scratch);

        // Buffered HTTP writers hold partial output until the exchange ends.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            flushed = writer.flush() => {
                flushed?;
                Ok(Some(self.scratch.len()))
            }
        }
    }
}

/// Shared state handed to every connection task.
struct ConnectionContext {
    settings: ExchangeSettings,
    observer: Arc<dyn Observer>,
    tracker: TaskTracker,
}

/// HTTP endpoint accepting duplex exchanges.
pub struct Endpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
    connection_limit: Arc<Semaphore>,
    shutdown_grace: Duration,
}

impl Endpoint {
    /// Bind the listener. Binding happens before any task starts so the
    /// initiator can be pointed at the real address.
    pub async fn bind(
        hostport: &str,
        settings: ExchangeSettings,
        observer: Arc<dyn Observer>,
        shutdown_grace: Duration,
    ) -> Result<Self, LifecycleError> {
        let listener = bind_listener(hostport)
            .await
            .map_err(|e| LifecycleError::Bind(hostport.to_string(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| LifecycleError::Bind(hostport.to_string(), e))?;

        Ok(Endpoint {
            listener,
            local_addr,
            context: Arc::new(ConnectionContext {
                settings,
                observer,
                tracker: TaskTracker::new(),
            }),
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` fires, then give in-flight
    /// exchanges the grace period to drain.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), LifecycleError> {
        info!(address = %self.local_addr, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    let context = Arc::clone(&self.context);
                    let shutdown = shutdown.clone();
                    self.context.tracker.spawn(async move {
                        serve_connection(stream, peer, context, shutdown).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("context was done, shutting down server");
        drop(self.listener);
        self.context.tracker.close();

        match tokio::time::timeout(self.shutdown_grace, self.context.tracker.wait()).await {
            Ok(()) => {
                info!("finished shutting down");
                Ok(())
            }
            Err(_) => Err(LifecycleError::ShutdownTimeout(self.shutdown_grace)),
        }
    }
}

/// Drive one HTTP/1.1 connection until it closes or shutdown drains it.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    // A dead connection surfaces in the exchange as a body error, so only
    // shutdown cancels it.
    let exchange_cancel = shutdown.clone();
    let service = service_fn(move |request| {
        handle_request(request, peer, Arc::clone(&context), exchange_cancel.clone())
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    match result {
        Ok(()) => debug!(peer = %peer, "Connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
    }
}

/// Hyper service: hand the request to a tracked exchange task and wait
/// for it to produce the response head.
async fn handle_request(
    request: Request<Incoming>,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    cancel: CancellationToken,
) -> Result<Response<ChannelBody>, ExchangeError> {
    let (parts, body) = request.into_parts();
    let (mut writer, head) = HttpResponseWriter::new(parts.version);

    let task_context = Arc::clone(&context);
    context.tracker.spawn(async move {
        let context = task_context;
        let result = serve_exchange(
            &parts,
            body_reader(body),
            &mut writer,
            &context.settings,
            context.observer.as_ref(),
            &cancel,
        )
        .await;

        match result {
            Ok(SessionEnd::PeerClosed) => {
                info!(peer = %peer, "client closed connection - finished");
                context.observer.exchange_closed();
            }
            Ok(SessionEnd::Cancelled) => debug!(peer = %peer, "exchange cancelled"),
            Ok(SessionEnd::Rejected(status)) => debug!(peer = %peer, %status, "request rejected"),
            Ok(SessionEnd::DuplexUnavailable) => debug!(peer = %peer, "request aborted"),
            Err(e) => {
                error!(peer = %peer, error = %e, "exchange with client failed");
                context.observer.exchange_failed();
            }
        }
    });

    head.await.map_err(|_| ExchangeError::Aborted)
}
