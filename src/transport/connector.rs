use std::io;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::TcpStream,
    sync::mpsc,
};

pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens one byte stream to the backend per call.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn TransportStream>>;

    fn describe(&self) -> String;
}

pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn TransportStream>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// In-process connector: each connect creates a duplex pipe and hands the far
/// end to whoever holds the acceptor. Once the acceptor is dropped every
/// connect is refused.
pub struct DuplexConnector {
    buffer_size: usize,
    acceptor: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexConnector {
    pub fn new(buffer_size: usize) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (acceptor, incoming) = mpsc::unbounded_channel();
        (
            Self {
                buffer_size,
                acceptor,
            },
            incoming,
        )
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> io::Result<Box<dyn TransportStream>> {
        let (local, remote) = tokio::io::duplex(self.buffer_size);
        self.acceptor
            .send(remote)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no backend listening"))?;
        Ok(Box::new(local))
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}
