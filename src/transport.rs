//! HTTP plumbing for the duplex exchange.
//!
//! Bodies on both sides are channel-backed "pipes": a `BodyWriter` pushes
//! chunks that hyper writes to the socket as soon as they are polled, so
//! every send is effectively a flush. Inbound bodies are adapted to
//! `AsyncRead` so the frame codec can sit on top of them.

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode, Version};
use http_body_util::BodyStream;
use hyper::body::Incoming;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;

/// Chunks buffered in a body pipe before the writer waits.
const PIPE_CAPACITY: usize = 16;

/// Listen backlog for the endpoint socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Read half of a body pipe.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl http_body::Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, Infallible>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|chunk| Ok(http_body::Frame::data(chunk))))
    }
}

/// Write half of a body pipe. Dropping it ends the body.
#[derive(Debug, Clone)]
pub struct BodyWriter {
    tx: mpsc::Sender<Bytes>,
}

impl BodyWriter {
    /// Hand one chunk to the transport.
    ///
    /// Fails with `BrokenPipe` once the transport has dropped the body,
    /// which happens when the connection is gone.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "body receiver dropped"))
    }

    /// Wait for room for one chunk. Cancel safe, unlike `send`.
    pub async fn reserve(&self) -> io::Result<mpsc::Permit<'_, Bytes>> {
        self.tx
            .reserve()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "body receiver dropped"))
    }
}

/// A fresh pipe for one streaming body. Never reused across requests.
pub fn body_pipe() -> (BodyWriter, ChannelBody) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (BodyWriter { tx }, ChannelBody { rx })
}

/// Inbound body as a byte stream.
pub type BodyReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

pub fn body_reader(body: Incoming) -> BodyReader {
    let chunks = BodyStream::new(body)
        .map_err(body_error)
        .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())))
        .boxed();
    StreamReader::new(chunks)
}

/// A connection that dies mid-body reads as end of stream.
///
/// Body read failures wrap the socket error; its kind is kept so reset
/// and truncated connections classify as the peer going away.
fn body_error(e: hyper::Error) -> io::Error {
    let kind = if e.is_incomplete_message() || e.is_closed() || e.is_canceled() {
        io::ErrorKind::UnexpectedEof
    } else {
        io_kind(&e).unwrap_or(io::ErrorKind::Other)
    };
    io::Error::new(kind, e)
}

/// Kind of the first `io::Error` in the source chain.
fn io_kind(e: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        source = err.source();
    }
    None
}

/// The endpoint's view of a response in progress.
///
/// Writes are buffered; nothing reaches the peer until `flush`. The
/// status and headers go out with the first flush.
pub trait ResponseWriter: Send {
    /// Whether this transport can keep reading the request body while a
    /// response body is being streamed.
    fn can_stream_bidirectionally(&self) -> bool;

    /// Switch the response into full-duplex streaming.
    fn enable_full_duplex(&mut self) -> io::Result<()>;

    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    fn write_header(&mut self, status: StatusCode);

    fn write(&mut self, data: &[u8]);

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// `ResponseWriter` backed by a hyper service future waiting on a oneshot.
///
/// If the writer is dropped after `write_header` but before any flush,
/// the head is sent with an empty body. If it is dropped before a status
/// was chosen, the head channel closes and the request is aborted.
#[derive(Debug)]
pub struct HttpResponseWriter {
    version: Version,
    head: Option<oneshot::Sender<Response<ChannelBody>>>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<BodyWriter>,
    full_duplex: bool,
    buf: BytesMut,
}

impl HttpResponseWriter {
    pub fn new(version: Version) -> (Self, oneshot::Receiver<Response<ChannelBody>>) {
        let (tx, rx) = oneshot::channel();
        let writer = HttpResponseWriter {
            version,
            head: Some(tx),
            status: None,
            headers: HeaderMap::new(),
            body: None,
            full_duplex: false,
            buf: BytesMut::new(),
        };
        (writer, rx)
    }

    fn send_head(&mut self) -> io::Result<()> {
        let Some(head) = self.head.take() else {
            return Ok(());
        };

        let (body_writer, body) = body_pipe();
        let mut response = Response::new(body);
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = std::mem::take(&mut self.headers);

        head.send(response).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "response head receiver dropped")
        })?;

        if self.full_duplex {
            self.body = Some(body_writer);
        }
        Ok(())
    }
}

impl ResponseWriter for HttpResponseWriter {
    fn can_stream_bidirectionally(&self) -> bool {
        // HTTP/1.0 has no chunked encoding for an open-ended response.
        self.version >= Version::HTTP_11
    }

    fn enable_full_duplex(&mut self) -> io::Result<()> {
        if !self.can_stream_bidirectionally() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("full duplex is not available over {:?}", self.version),
            ));
        }
        self.full_duplex = true;
        Ok(())
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.head.is_some() {
            self.status = Some(status);
        }
    }

    fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            self.send_head()?;
            if self.buf.is_empty() {
                return Ok(());
            }
            let chunk = self.buf.split().freeze();
            match &self.body {
                Some(body) => body.send(chunk).await,
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "response body is closed",
                )),
            }
        }
    }
}

impl Drop for HttpResponseWriter {
    fn drop(&mut self) {
        if self.status.is_some() {
            let _ = self.send_head();
        }
    }
}

/// Bind the endpoint listener with `SO_REUSEADDR`.
pub async fn bind_listener(hostport: &str) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(hostport)
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} did not resolve to an address", hostport),
            )
        })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::ALLOW;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_pipe_ends_when_writer_dropped() {
        let (writer, body) = body_pipe();
        writer.send(Bytes::from_static(b"one\n")).await.unwrap();
        writer.send(Bytes::from_static(b"two\n")).await.unwrap();
        drop(writer);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_pipe_send_fails_after_body_dropped() {
        let (writer, body) = body_pipe();
        drop(body);
        let err = writer.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_rejection_sent_on_drop_without_flush() {
        let (mut writer, head) = HttpResponseWriter::new(Version::HTTP_11);
        writer.set_header(ALLOW, HeaderValue::from_static("POST"));
        writer.write_header(StatusCode::METHOD_NOT_ALLOWED);
        drop(writer);

        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_drop_without_status_aborts() {
        let (writer, head) = HttpResponseWriter::new(Version::HTTP_11);
        drop(writer);
        assert!(head.await.is_err());
    }

    #[tokio::test]
    async fn test_flush_streams_head_then_chunks() {
        let (mut writer, head) = HttpResponseWriter::new(Version::HTTP_11);
        writer.enable_full_duplex().unwrap();
        writer.write_header(StatusCode::OK);
        writer.flush().await.unwrap();

        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();

        writer.write(b"{\"Msg\":");
        writer.write(b"\"pong\"}\n");
        writer.flush().await.unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(&frame.into_data().unwrap()[..], b"{\"Msg\":\"pong\"}\n");

        drop(writer);
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_http10_cannot_stream() {
        let (mut writer, _head) = HttpResponseWriter::new(Version::HTTP_10);
        assert!(!writer.can_stream_bidirectionally());
        let err = writer.enable_full_duplex().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_truncated_chunked_body_reads_as_end_of_stream() {
        use crate::codec::{Frame, FrameCodec};
        use futures::StreamExt;
        use http_body_util::Empty;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;
        use tokio::io::AsyncWriteExt;
        use tokio_util::codec::FramedRead;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(move |request: hyper::Request<Incoming>| {
                let tx = tx.clone();
                // The service future dies with the connection; read elsewhere.
                tokio::spawn(async move {
                    let mut frames =
                        FramedRead::new(body_reader(request.into_body()), FrameCodec::default());
                    let first = frames.next().await;
                    let second = frames.next().await;
                    let _ = tx.send((first, second));
                });
                std::future::pending::<Result<Response<Empty<Bytes>>, Infallible>>()
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        // One chunk, then the connection goes away without the last chunk.
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(
                b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                  17\r\n{\"Msg\":\"ping\",\"Seq\":1}\n\r\n",
            )
            .await
            .unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(client);

        let (first, second) = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("body was never read")
            .unwrap();
        assert_eq!(first.unwrap().unwrap(), Frame::ping(1));
        match second {
            Some(Err(e)) => assert!(e.is_end_of_stream(), "not end of stream: {}", e),
            None => {}
            Some(Ok(frame)) => panic!("unexpected frame {:?}", frame),
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let listener = bind_listener("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }
}
