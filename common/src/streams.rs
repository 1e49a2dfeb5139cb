//! Source and sink endpoints
//!
//! The copy pipeline only ever sees a boxed [`AsyncRead`] and a boxed [`AsyncWrite`];
//! this module resolves the user's endpoint selection into exactly one [`Source`] and
//! one [`Sink`] and opens them.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::instrument;

use crate::config::ConfigError;

/// Type alias for boxed read stream (file, TCP or synthetic)
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
/// Type alias for boxed write stream (file, TCP or discard)
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Default address the receiving side listens on
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1987";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Read a local file
    File(std::path::PathBuf),
    /// Accept a single TCP connection and read from it
    Listen(String),
    /// Produce this many zero bytes
    Dummy(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// Create (or truncate) a local file
    File(std::path::PathBuf),
    /// Connect to a TCP address and write to it
    Dial(String),
    /// Drop everything
    Discard,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Source::File(path) => write!(f, "{}", path.display()),
            Source::Listen(addr) => write!(f, "{addr}"),
            Source::Dummy(size) => write!(f, "dummy:{}", bytesize::ByteSize(*size)),
        }
    }
}

impl std::fmt::Display for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Sink::File(path) => write!(f, "{}", path.display()),
            Sink::Dial(addr) => write!(f, "{addr}"),
            Sink::Discard => write!(f, "discard"),
        }
    }
}

/// Endpoint selection as given by the user; at most one source and one sink may be set.
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    pub input: Option<std::path::PathBuf>,
    pub listen_addr: Option<String>,
    pub dummy_input: Option<u64>,
    pub output: Option<std::path::PathBuf>,
    pub dial_addr: Option<String>,
    pub dummy_output: bool,
}

impl EndpointConfig {
    pub fn resolve(&self) -> Result<(Source, Sink), ConfigError> {
        let mut sources = Vec::new();
        if let Some(path) = &self.input {
            sources.push(Source::File(path.clone()));
        }
        if let Some(addr) = &self.listen_addr {
            sources.push(Source::Listen(addr.clone()));
        }
        if let Some(size) = self.dummy_input {
            sources.push(Source::Dummy(size));
        }
        let mut sinks = Vec::new();
        if let Some(path) = &self.output {
            sinks.push(Sink::File(path.clone()));
        }
        if let Some(addr) = &self.dial_addr {
            sinks.push(Sink::Dial(addr.clone()));
        }
        if self.dummy_output {
            sinks.push(Sink::Discard);
        }
        let source = match sources.len() {
            0 => return Err(ConfigError::NoSource),
            1 => sources.remove(0),
            _ => {
                return Err(ConfigError::MultipleSources(
                    sources.iter().map(ToString::to_string).collect(),
                ));
            }
        };
        let sink = match sinks.len() {
            0 => return Err(ConfigError::NoSink),
            1 => sinks.remove(0),
            _ => {
                return Err(ConfigError::MultipleSinks(
                    sinks.iter().map(ToString::to_string).collect(),
                ));
            }
        };
        Ok((source, sink))
    }
}

/// Accepts the `:PORT` shorthand for listening on all interfaces.
fn listen_address(addr: &str) -> std::borrow::Cow<'_, str> {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}").into()
    } else {
        addr.into()
    }
}

pub struct OpenedSource {
    pub reader: BoxedRead,
    pub name: String,
    /// Expected number of bytes, if the source knows it up front
    pub size: Option<u64>,
}

pub struct OpenedSink {
    pub writer: BoxedWrite,
    pub name: String,
}

impl Source {
    #[instrument]
    pub async fn open(&self) -> std::io::Result<OpenedSource> {
        match self {
            Source::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let size = file.metadata().await?.len();
                tracing::debug!("opened {:?} for reading, {} bytes", path, size);
                Ok(OpenedSource {
                    reader: Box::new(file),
                    name: self.to_string(),
                    size: Some(size),
                })
            }
            Source::Listen(addr) => {
                let listener = tokio::net::TcpListener::bind(&*listen_address(addr)).await?;
                tracing::info!("Listen: {}", listener.local_addr()?);
                let (stream, peer) = listener.accept().await?;
                tracing::info!("accepted connection from {}", peer);
                Ok(OpenedSource {
                    reader: Box::new(stream),
                    name: self.to_string(),
                    size: None,
                })
            }
            Source::Dummy(size) => Ok(OpenedSource {
                reader: Box::new(ZeroStream::new(*size)),
                name: self.to_string(),
                size: Some(*size),
            }),
        }
    }
}

impl Sink {
    #[instrument]
    pub async fn open(&self) -> std::io::Result<OpenedSink> {
        let writer: BoxedWrite = match self {
            Sink::File(path) => Box::new(tokio::fs::File::create(path).await?),
            Sink::Dial(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await?;
                tracing::info!("connected to {}", stream.peer_addr()?);
                Box::new(stream)
            }
            Sink::Discard => Box::new(tokio::io::sink()),
        };
        Ok(OpenedSink {
            writer,
            name: self.to_string(),
        })
    }
}

/// Synthetic source yielding a fixed number of zero bytes, then end-of-stream.
#[derive(Debug)]
pub struct ZeroStream {
    remaining: u64,
}

impl ZeroStream {
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self { remaining: size }
    }
}

impl AsyncRead for ZeroStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let n = std::cmp::min(buf.remaining() as u64, this.remaining) as usize;
        // pooled buffers are not cleared, so the zeros have to be written out
        buf.initialize_unfilled_to(n).fill(0);
        buf.advance(n);
        this.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}
