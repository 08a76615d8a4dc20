//! Connection handler: one socket, a text reader and a byte reader.
//!
//! Both readers are methods of [`ConnectionReader`] over a single
//! `BufReader`, so bytes buffered while reading a line are the first
//! bytes seen by the following `read_exactly`. Each takes `&mut self`;
//! the two channels cannot race on the stream.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

use filechat_protocol::constants::MAX_LINE_LEN;
use filechat_protocol::{ProtocolError, check_single_line};

use crate::TCP_BUFFER_SIZE;
use crate::error::DataChannelError;

/// Runs an I/O future under an optional deadline.
pub(crate) async fn with_timeout<T, F>(
    limit: Option<Duration>,
    fut: F,
) -> Result<T, DataChannelError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(DataChannelError::from),
            Err(_) => Err(DataChannelError::Timeout),
        },
        None => fut.await.map_err(DataChannelError::from),
    }
}

/// Read half of a peer connection.
pub struct ConnectionReader<R> {
    inner: BufReader<R>,
    io_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::with_capacity(TCP_BUFFER_SIZE, reader),
            io_timeout: None,
        }
    }

    /// Sets the deadline applied to every blocking read (`None` waits forever).
    pub fn with_io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Reads one text-channel line, without its terminator.
    ///
    /// Blocks until `\n` or stream close. Returns `None` on a clean close
    /// at a line boundary; an unterminated final line is returned as is.
    /// Invalid UTF-8 is replaced lossily.
    pub async fn read_line(&mut self) -> Result<Option<String>, DataChannelError> {
        // Room for the longest line plus "\r\n".
        let limit = MAX_LINE_LEN as u64 + 2;
        let mut buf = Vec::new();

        let n = {
            let mut limited = (&mut self.inner).take(limit);
            with_timeout(self.io_timeout, limited.read_until(b'\n', &mut buf)).await?
        };
        if n == 0 {
            trace!("text channel closed");
            return Ok(None);
        }

        let terminated = buf.last() == Some(&b'\n');
        if terminated {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if buf.len() > MAX_LINE_LEN || (!terminated && n as u64 == limit) {
            return Err(ProtocolError::LineTooLong { max: MAX_LINE_LEN }.into());
        }

        let line = match String::from_utf8(buf) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        Ok(Some(line))
    }

    /// Reads at most `buf.len()` bytes; `0` means the stream closed.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, DataChannelError> {
        with_timeout(self.io_timeout, self.inner.read(buf)).await
    }

    /// Reads exactly `n` bytes.
    ///
    /// If the stream closes early, fails with
    /// [`DataChannelError::ShortTransfer`] carrying the count actually
    /// read; a shorter buffer is never returned.
    pub async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>, DataChannelError> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.read_chunk(&mut buf[filled..]).await?;
            if read == 0 {
                return Err(DataChannelError::ShortTransfer {
                    expected: n as u64,
                    received: filled as u64,
                });
            }
            filled += read;
        }
        Ok(buf)
    }

    /// Reads and discards exactly `n` bytes.
    pub async fn discard(&mut self, n: u64) -> Result<(), DataChannelError> {
        let mut buf = vec![0u8; TCP_BUFFER_SIZE.min(n as usize)];
        let mut remaining = n;
        while remaining > 0 {
            let to_read = (remaining as usize).min(buf.len());
            let read = self.read_chunk(&mut buf[..to_read]).await?;
            if read == 0 {
                return Err(DataChannelError::ShortTransfer {
                    expected: n,
                    received: n - remaining,
                });
            }
            remaining -= read as u64;
        }
        Ok(())
    }
}

/// Write half of a peer connection.
pub struct ConnectionWriter<W> {
    inner: BufWriter<W>,
    io_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> ConnectionWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::with_capacity(TCP_BUFFER_SIZE, writer),
            io_timeout: None,
        }
    }

    /// Sets the deadline applied to every blocking write (`None` waits forever).
    pub fn with_io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Sends `text` as one text-channel line and flushes.
    pub async fn send_line(&mut self, text: &str) -> Result<(), DataChannelError> {
        check_single_line(text)?;
        self.write_chunk(text.as_bytes()).await?;
        self.write_chunk(b"\n").await?;
        self.flush().await
    }

    /// Sends raw bytes on the byte channel and flushes.
    pub async fn send_bytes(&mut self, buf: &[u8]) -> Result<(), DataChannelError> {
        self.write_chunk(buf).await?;
        self.flush().await
    }

    /// Buffers bytes without flushing.
    pub(crate) async fn write_chunk(&mut self, buf: &[u8]) -> Result<(), DataChannelError> {
        with_timeout(self.io_timeout, self.inner.write_all(buf)).await
    }

    pub async fn flush(&mut self) -> Result<(), DataChannelError> {
        with_timeout(self.io_timeout, self.inner.flush()).await
    }

    /// Flushes and closes the write direction of the stream.
    pub async fn shutdown(&mut self) -> Result<(), DataChannelError> {
        with_timeout(self.io_timeout, self.inner.shutdown()).await
    }
}

/// A peer connection: one stream, owned exclusively.
///
/// Dropping the connection (or both halves after
/// [`into_split`](Self::into_split)) closes the socket.
pub struct PeerConnection<R, W> {
    reader: ConnectionReader<R>,
    writer: ConnectionWriter<W>,
    peer_addr: Option<SocketAddr>,
}

impl PeerConnection<OwnedReadHalf, OwnedWriteHalf> {
    /// Wraps an accepted or connected TCP stream.
    pub fn from_tcp(
        stream: TcpStream,
        io_timeout: Option<Duration>,
    ) -> Result<Self, DataChannelError> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        debug!(%peer_addr, "peer connection opened");

        let mut conn = Self::new(reader, writer, io_timeout);
        conn.peer_addr = Some(peer_addr);
        Ok(conn)
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> PeerConnection<R, W> {
    pub fn new(reader: R, writer: W, io_timeout: Option<Duration>) -> Self {
        Self {
            reader: ConnectionReader::new(reader).with_io_timeout(io_timeout),
            writer: ConnectionWriter::new(writer).with_io_timeout(io_timeout),
            peer_addr: None,
        }
    }

    /// Remote address, for TCP connections.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub async fn send_line(&mut self, text: &str) -> Result<(), DataChannelError> {
        self.writer.send_line(text).await
    }

    pub async fn send_bytes(&mut self, buf: &[u8]) -> Result<(), DataChannelError> {
        self.writer.send_bytes(buf).await
    }

    pub async fn read_line(&mut self) -> Result<Option<String>, DataChannelError> {
        self.reader.read_line().await
    }

    pub async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>, DataChannelError> {
        self.reader.read_exactly(n).await
    }

    pub fn reader_mut(&mut self) -> &mut ConnectionReader<R> {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut ConnectionWriter<W> {
        &mut self.writer
    }

    /// Splits into halves so a receive loop and a send loop can run in
    /// separate tasks.
    pub fn into_split(self) -> (ConnectionReader<R>, ConnectionWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    type Half = PeerConnection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair(timeout: Option<Duration>) -> (Half, Half) {
        let (a, b) = duplex(TCP_BUFFER_SIZE);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            PeerConnection::new(ar, aw, timeout),
            PeerConnection::new(br, bw, timeout),
        )
    }

    #[tokio::test]
    async fn line_then_bytes_share_one_buffer() {
        let (mut alice, mut bob) = pair(None);

        alice.send_line("FILE_TRANSFER:a.txt:5").await.unwrap();
        alice.send_bytes(b"hello").await.unwrap();
        alice.send_line("after").await.unwrap();

        assert_eq!(
            bob.read_line().await.unwrap().as_deref(),
            Some("FILE_TRANSFER:a.txt:5")
        );
        assert_eq!(bob.read_exactly(5).await.unwrap(), b"hello");
        assert_eq!(bob.read_line().await.unwrap().as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn read_line_strips_crlf() {
        let (mut alice, mut bob) = pair(None);
        alice.send_bytes(b"windows\r\nunix\n").await.unwrap();
        assert_eq!(bob.read_line().await.unwrap().as_deref(), Some("windows"));
        assert_eq!(bob.read_line().await.unwrap().as_deref(), Some("unix"));
    }

    #[tokio::test]
    async fn read_line_eof() {
        let (alice, mut bob) = pair(None);
        drop(alice);
        assert_eq!(bob.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unterminated_last_line() {
        let (mut alice, mut bob) = pair(None);
        alice.send_bytes(b"partial").await.unwrap();
        drop(alice);
        assert_eq!(bob.read_line().await.unwrap().as_deref(), Some("partial"));
        assert_eq!(bob.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_utf8_is_lossy() {
        let (mut alice, mut bob) = pair(None);
        alice.send_bytes(b"caf\xe9\n").await.unwrap();
        assert_eq!(bob.read_line().await.unwrap().as_deref(), Some("caf\u{fffd}"));
    }

    #[tokio::test]
    async fn overlong_line_rejected() {
        let (a, b) = duplex(4 * MAX_LINE_LEN);
        let (_ar, mut aw) = split(a);
        let mut bob = ConnectionReader::new(b);

        let long = vec![b'x'; MAX_LINE_LEN + 10];
        aw.write_all(&long).await.unwrap();
        aw.write_all(b"\n").await.unwrap();

        let err = bob.read_line().await.unwrap_err();
        assert!(matches!(
            err,
            DataChannelError::Protocol(ProtocolError::LineTooLong { .. })
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn line_at_limit_accepted() {
        let (a, b) = duplex(4 * MAX_LINE_LEN);
        let (_ar, mut aw) = split(a);
        let mut bob = ConnectionReader::new(b);

        let line = "y".repeat(MAX_LINE_LEN);
        aw.write_all(line.as_bytes()).await.unwrap();
        aw.write_all(b"\r\n").await.unwrap();

        assert_eq!(bob.read_line().await.unwrap(), Some(line));
    }

    #[tokio::test]
    async fn read_exactly_short_read() {
        let (mut alice, mut bob) = pair(None);
        alice.send_bytes(b"abc").await.unwrap();
        drop(alice);

        let err = bob.read_exactly(10).await.unwrap_err();
        assert!(matches!(
            err,
            DataChannelError::ShortTransfer {
                expected: 10,
                received: 3
            }
        ));
        assert_eq!(err.missing(), Some(7));
    }

    #[tokio::test]
    async fn read_exactly_zero() {
        let (_alice, mut bob) = pair(None);
        assert!(bob.read_exactly(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discard_keeps_stream_in_sync() {
        let (mut alice, mut bob) = pair(None);
        alice.send_bytes(&[7u8; 9000]).await.unwrap();
        alice.send_line("next").await.unwrap();

        bob.reader_mut().discard(9000).await.unwrap();
        assert_eq!(bob.read_line().await.unwrap().as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn send_line_rejects_line_breaks() {
        let (mut alice, _bob) = pair(None);
        let err = alice.send_line("two\nlines").await.unwrap_err();
        assert!(matches!(
            err,
            DataChannelError::Protocol(ProtocolError::MultilineText)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_times_out() {
        let (_alice, mut bob) = pair(Some(Duration::from_secs(5)));
        let err = bob.read_line().await.unwrap_err();
        assert!(matches!(err, DataChannelError::Timeout));
    }

    #[tokio::test]
    async fn tcp_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = PeerConnection::from_tcp(stream, None).unwrap();
            let line = conn.read_line().await.unwrap().unwrap();
            conn.send_line(&format!("echo {line}")).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = PeerConnection::from_tcp(stream, None).unwrap();
        assert_eq!(conn.peer_addr(), Some(addr));
        conn.send_line("ping").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("echo ping"));
        server.await.unwrap();
    }
}
