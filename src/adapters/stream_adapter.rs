//! Adapter over any tokio byte stream, used for TCP instruments.

use super::Adapter;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Connect timeout for network instruments.
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Deadline for each drain read in [`StreamAdapter::flush_input`].
const FLUSH_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Stream adapter for network (or in-memory) instruments.
pub struct StreamAdapter<S> {
    stream: S,
    name: String,
}

impl<S> StreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S, name: impl Into<String>) -> Self {
        Self {
            stream,
            name: name.into(),
        }
    }
}

/// Dial `address` (`host:port`) with the fixed [`DIAL_TIMEOUT`].
pub async fn open_tcp(address: &str) -> io::Result<StreamAdapter<TcpStream>> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial timed out after {:?}", DIAL_TIMEOUT),
            )
        })??;
    stream.set_nodelay(true)?;
    debug!("TCP connection to {} established", address);
    Ok(StreamAdapter::new(stream, "tcp"))
}

#[async_trait]
impl<S> Adapter for StreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        match tokio::time::timeout(timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => {
                self.stream.flush().await?;
                Ok(data.len())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write timed out after {:?}", timeout),
            )),
        }
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        match tokio::time::timeout(timeout, self.stream.read(buf)).await {
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }

    async fn flush_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 1024];
        loop {
            match tokio::time::timeout(FLUSH_READ_TIMEOUT, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => return Ok(()),
                Ok(Ok(n)) => debug!("[{}] discarded {} stale bytes", self.name, n),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_returns_zero_on_silence() {
        let (client, _server) = tokio::io::duplex(64);
        let mut adapter = StreamAdapter::new(client, "duplex");
        let mut buf = [0u8; 16];
        let n = adapter
            .read(&mut buf, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_flush_drops_pending_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut adapter = StreamAdapter::new(client, "duplex");
        server.write_all(b"stale reply\n").await.unwrap();

        adapter.flush_input().await.unwrap();
        server.write_all(b"fresh\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = adapter
            .read(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"fresh\n");
    }

    #[tokio::test]
    async fn test_write_and_read_against_scripted_stream() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*IDN?\n")
            .read(b"ACME,SCOPE,1,2\n")
            .build();
        let mut adapter = StreamAdapter::new(stream, "scripted");

        let n = adapter
            .write(b"*IDN?\n", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(n, 6);

        let mut buf = [0u8; 64];
        let n = adapter
            .read(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"ACME,SCOPE,1,2\n");
    }

    #[tokio::test]
    async fn test_dial_refused_reports_error() {
        // Port 1 on localhost is essentially never listening.
        let result = open_tcp("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
