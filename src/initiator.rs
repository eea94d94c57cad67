//! Connection initiator: the client half of the exchange.
//!
//! Opens one POST whose request body is a fresh pipe, retries with a fixed
//! backoff until the endpoint answers 200, then pumps pings out of the
//! request body and pongs in from the response body on the same exchange.

use crate::codec::{Frame, FrameCodec, FrameError, CONTENT_TYPE_NDJSON};
use crate::config::{ExchangePolicy, ExchangeSettings};
use crate::error::ExchangeError;
use crate::metrics::Observer;
use crate::transport::{body_pipe, body_reader, BodyReader, BodyWriter};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{Method, Request, StatusCode};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Delay between connection attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// One established exchange. Dropping it tears the connection down.
struct Session {
    requests: BodyWriter,
    responses: FramedRead<BodyReader, FrameCodec>,
    _driver: Driver,
}

/// Client connection task, aborted when dropped.
struct Driver(JoinHandle<()>);

impl Drop for Driver {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Initiator {
    target: SocketAddr,
    settings: ExchangeSettings,
    observer: Arc<dyn Observer>,
    reconnect: bool,
    retry_delay: Duration,
}

impl Initiator {
    pub fn new(target: SocketAddr, settings: ExchangeSettings, observer: Arc<dyn Observer>) -> Self {
        Self {
            target,
            settings,
            observer,
            reconnect: false,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Start over with a fresh exchange whenever the endpoint ends one.
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[cfg(test)]
    fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Connect and pump until cancelled or the endpoint closes.
    ///
    /// Peer termination is a normal return; any other I/O or frame
    /// failure is returned for the coordinator to act on.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ExchangeError> {
        loop {
            let Some(mut session) = self.connect(&cancel).await else {
                info!("client: context was done, exiting");
                return Ok(());
            };

            match self.pump(&mut session, &cancel).await {
                Ok(()) => {}
                Err(e) if e.is_peer_closed() => {
                    info!(error = %e, "client: server closed connection - finished");
                }
                Err(e) => return Err(e),
            }

            if cancel.is_cancelled() {
                info!("client: context was done, exiting");
                return Ok(());
            }
            if !self.reconnect {
                return Ok(());
            }
        }
    }

    /// Retry until the endpoint accepts or `cancel` fires.
    async fn connect(&self, cancel: &CancellationToken) -> Option<Session> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                attempt = self.try_connect() => attempt,
            };

            match attempt {
                Ok(session) => {
                    info!(server = %self.target, "client: connected to server");
                    return Some(session);
                }
                Err(ExchangeError::Status(status)) => {
                    info!(statuscode = status.as_u16(), "client: failed to start request against server");
                }
                Err(e) => {
                    info!(error = %e, "client: failed to start request against server");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    async fn try_connect(&self) -> Result<Session, ExchangeError> {
        // A pipe consumed by a failed attempt cannot be reused.
        let (requests, body) = body_pipe();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(HOST, self.target.to_string())
            .header(CONTENT_TYPE, CONTENT_TYPE_NDJSON)
            .header(ACCEPT, CONTENT_TYPE_NDJSON)
            .body(body)?;

        let stream = TcpStream::connect(self.target).await?;
        stream.set_nodelay(true)?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        // Aborted on drop, including when this attempt is cancelled.
        let driver = Driver(tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "client: connection ended with error");
            }
        }));

        let response = sender.send_request(request).await?;
        if response.status() != StatusCode::OK {
            return Err(ExchangeError::Status(response.status()));
        }

        Ok(Session {
            requests,
            responses: FramedRead::new(body_reader(response.into_body()), self.settings.codec()),
            _driver: driver,
        })
    }

    async fn pump(&self, session: &mut Session, cancel: &CancellationToken) -> Result<(), ExchangeError> {
        let mut pacer = self.settings.pacer();
        let mut pings = Pings::new(self.settings.codec());

        match self.settings.policy {
            ExchangePolicy::Paired => loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = pacer.tick() => {}
                }

                let chunk = pings.next_ping()?;
                let bytes = chunk.len();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = session.requests.send(chunk) => sent?,
                }
                self.sent(pings.seq, bytes);

                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    next = session.responses.next() => next,
                };
                match next {
                    Some(frame) => self.received(frame?),
                    None => return Ok(()),
                }
            },
            ExchangePolicy::Independent => {
                // Keep reading while waiting for room in the request pipe,
                // so neither side can stall the other with full buffers.
                // Unbiased so an always-ready pacer cannot starve reads.
                let mut due = false;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        next = session.responses.next() => match next {
                            Some(frame) => self.received(frame?),
                            None => return Ok(()),
                        },
                        permit = session.requests.reserve(), if due => {
                            let chunk = pings.next_ping()?;
                            let bytes = chunk.len();
                            permit?.send(chunk);
                            self.sent(pings.seq, bytes);
                            due = false;
                        }
                        _ = pacer.tick(), if !due => due = true,
                    }
                }
            }
        }
    }

    fn sent(&self, seq: u64, bytes: usize) {
        debug!(seq, "client: posted ping to server");
        self.observer.ping_sent(bytes);
    }

    fn received(&self, frame: Frame) {
        debug!(msg = %frame.msg, seq = ?frame.seq, "client: received message from server");
        self.observer.pong_received();
    }
}

/// Numbered ping encoder for one session.
struct Pings {
    codec: FrameCodec,
    scratch: BytesMut,
    seq: u64,
}

impl Pings {
    fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            scratch: BytesMut::new(),
            seq: 0,
        }
    }

    fn next_ping(&mut self) -> Result<Bytes, FrameError> {
        self.seq += 1;
        self.codec.encode(&Frame::ping(self.seq), &mut self.scratch)?;
        Ok(self.scratch.split().freeze())
    }
}
