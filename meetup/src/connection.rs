//! Established connections with per call read and write deadlines

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::Instant;

use crate::EndpointId;

/// A TCP connection obtained for one endpoint, waiting to be piped
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    endpoint: EndpointId,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(stream: TcpStream, endpoint: EndpointId) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("{endpoint}: could not set TCP_NODELAY: {e}");
        }
        Self {
            stream,
            endpoint,
            peer,
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Split into independently owned halves, each with its own deadline.
    /// The socket is closed once both halves are dropped.
    pub fn into_split(
        self,
    ) -> (
        DeadlineReader<OwnedReadHalf>,
        DeadlineWriter<OwnedWriteHalf>,
    ) {
        let (read, write) = self.stream.into_split();
        (DeadlineReader::new(read), DeadlineWriter::new(write))
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{} ({peer})", self.endpoint),
            None => write!(f, "{} (unknown peer)", self.endpoint),
        }
    }
}

/// Read side of a connection. While a deadline is set, a read that has not
/// completed by then fails with [`io::ErrorKind::TimedOut`].
#[derive(Debug)]
pub struct DeadlineReader<R> {
    inner: R,
    deadline: Option<Instant>,
}

impl<R: AsyncRead + Unpin> DeadlineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            deadline: None,
        }
    }

    pub fn set_deadline(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.deadline {
            Some(at) => tokio::time::timeout_at(at, self.inner.read(buf))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?,
            None => self.inner.read(buf).await,
        }
    }
}

/// Write side of a connection, with the same deadline behaviour as
/// [`DeadlineReader`]. Counts every byte the peer accepted, including those
/// of a write that was later abandoned.
#[derive(Debug)]
pub struct DeadlineWriter<W> {
    inner: W,
    deadline: Option<Instant>,
    written: u64,
}

impl<W: AsyncWrite + Unpin> DeadlineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            deadline: None,
            written: 0,
        }
    }

    pub fn set_deadline(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Total bytes accepted by the stream so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write some of `buf`. `Ok(0)` for a non-empty `buf` means the stream
    /// no longer accepts data.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.deadline {
            Some(at) => tokio::time::timeout_at(at, self.inner.write(buf))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??,
            None => self.inner.write(buf).await?,
        };
        self.written += n as u64;
        Ok(n)
    }

    /// Half close the write direction
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_read_deadline_expires() {
        let (client, _server) = tokio::io::duplex(64);
        let mut reader = DeadlineReader::new(client);
        reader.set_deadline(Instant::now() + Duration::from_millis(50));

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_cleared_deadline_does_not_fire() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = DeadlineReader::new(client);
        reader.set_deadline(Instant::now() + Duration::from_millis(10));
        reader.clear_deadline();
        assert!(reader.deadline().is_none());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            server.write_all(b"late").await.unwrap();
        });

        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn test_write_deadline_expires_when_peer_stalls() {
        // A 4 byte pipe that nobody drains
        let (client, _server) = tokio::io::duplex(4);
        let mut writer = DeadlineWriter::new(client);
        writer.set_deadline(Instant::now() + Duration::from_millis(50));

        assert_eq!(writer.write(b"more than four bytes").await.unwrap(), 4);
        let err = writer.write(b"than four bytes").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(writer.written(), 4);
    }
}
