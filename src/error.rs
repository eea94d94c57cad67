//! Error types for the exchange and the process lifecycle.

use crate::codec::FrameError;
use http::StatusCode;
use std::fmt;
use std::io;
use std::time::Duration;

/// True when an I/O error only means the peer went away.
pub fn peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Failure of one duplex exchange.
#[derive(Debug)]
pub enum ExchangeError {
    Io(io::Error),
    Frame(FrameError),
    Http(hyper::Error),
    Request(http::Error),
    /// The endpoint answered with something other than 200.
    Status(StatusCode),
    /// The request was dropped before any response head was produced.
    Aborted,
}

impl ExchangeError {
    /// True when the error is the normal end of a session.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            ExchangeError::Io(e) => peer_closed(e),
            ExchangeError::Frame(e) => e.is_end_of_stream(),
            _ => false,
        }
    }
}

impl From<io::Error> for ExchangeError {
    fn from(e: io::Error) -> Self {
        ExchangeError::Io(e)
    }
}

impl From<FrameError> for ExchangeError {
    fn from(e: FrameError) -> Self {
        ExchangeError::Frame(e)
    }
}

impl From<hyper::Error> for ExchangeError {
    fn from(e: hyper::Error) -> Self {
        ExchangeError::Http(e)
    }
}

impl From<http::Error> for ExchangeError {
    fn from(e: http::Error) -> Self {
        ExchangeError::Request(e)
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Io(e) => write!(f, "I/O error: {}", e),
            ExchangeError::Frame(e) => write!(f, "{}", e),
            ExchangeError::Http(e) => write!(f, "HTTP error: {}", e),
            ExchangeError::Request(e) => write!(f, "failed to build request: {}", e),
            ExchangeError::Status(status) => write!(f, "unexpected status {}", status),
            ExchangeError::Aborted => write!(f, "request aborted before a response was written"),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExchangeError::Io(e) => Some(e),
            ExchangeError::Frame(e) => Some(e),
            ExchangeError::Http(e) => Some(e),
            ExchangeError::Request(e) => Some(e),
            _ => None,
        }
    }
}

/// Fatal errors surfaced by the lifecycle coordinator.
#[derive(Debug)]
pub enum LifecycleError {
    Bind(String, io::Error),
    Exchange(ExchangeError),
    Signal(io::Error),
    /// The endpoint did not drain within the grace period.
    ShutdownTimeout(Duration),
    Task(tokio::task::JoinError),
}

impl From<ExchangeError> for LifecycleError {
    fn from(e: ExchangeError) -> Self {
        LifecycleError::Exchange(e)
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::Bind(addr, e) => write!(f, "failed to listen on {}: {}", addr, e),
            LifecycleError::Exchange(e) => write!(f, "client: {}", e),
            LifecycleError::Signal(e) => write!(f, "failed to listen for signals: {}", e),
            LifecycleError::ShutdownTimeout(grace) => {
                write!(f, "server did not shut down within {:?}", grace)
            }
            LifecycleError::Task(e) => write!(f, "task failed: {}", e),
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifecycleError::Bind(_, e) => Some(e),
            LifecycleError::Exchange(e) => Some(e),
            LifecycleError::Signal(e) => Some(e),
            LifecycleError::Task(e) => Some(e),
            LifecycleError::ShutdownTimeout(_) => None,
        }
    }
}
