//! TCP chat server.
//!
//! Accepts any number of peers, one task per connection. Each connection
//! owns its socket, its [`Receiver`] and its [`DirectorySink`]; writes go
//! through a per-connection writer task fed by an `mpsc` queue so file
//! bodies are never interleaved with other output.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use filechat_protocol::constants::DEFAULT_PORT;

use crate::connection::{ConnectionWriter, PeerConnection};
use crate::error::DataChannelError;
use crate::receiver::{Inbound, ReceivePolicy, Receiver};
use crate::sink::DirectorySink;
use crate::{DEFAULT_RECEIVED_PREFIX, OUTBOUND_QUEUE};

/// Capacity of the server event channel.
const EVENT_CAPACITY: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub bind: SocketAddr,
    /// Where received files are stored.
    pub download_dir: PathBuf,
    /// Prefix prepended to received filenames.
    pub received_prefix: String,
    pub policy: ReceivePolicy,
    /// Deadline for every socket read/write (`None` waits forever).
    pub io_timeout: Option<Duration>,
    /// Forward chat lines from one peer to all others.
    pub relay_chat: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            download_dir: PathBuf::from("."),
            received_prefix: DEFAULT_RECEIVED_PREFIX.into(),
            policy: ReceivePolicy::default(),
            io_timeout: None,
            relay_chat: true,
        }
    }
}

/// Identifies one accepted connection for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something to send to a peer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A text-channel line.
    Line(String),
    /// A local file, announced under its basename.
    File(PathBuf),
    /// An in-memory file.
    Bytes { filename: String, data: Arc<[u8]> },
}

/// Events published to server subscribers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected {
        id: ConnectionId,
        peer: SocketAddr,
    },
    Inbound {
        id: ConnectionId,
        event: Inbound,
    },
    Disconnected {
        id: ConnectionId,
        /// Why the connection ended, if it was not a clean close.
        error: Option<String>,
    },
}

/// The chat/file-transfer server.
pub struct ChatServer {
    config: ServerConfig,
    peers: Mutex<HashMap<ConnectionId, mpsc::Sender<Outbound>>>,
    events: broadcast::Sender<ServerEvent>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            peers: Mutex::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Subscribes to connection and inbound events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`bind`](Self::bind).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Number of connected peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, DataChannelError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("chat server listening on {local_addr}");
        Ok(listener)
    }

    /// Binds and serves until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), DataChannelError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), DataChannelError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("chat server shutting down");
                    self.peers.lock().await.clear();
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Queues `message` for every connected peer; returns how many
    /// accepted it.
    pub async fn broadcast(&self, message: Outbound) -> usize {
        self.send_except(None, message).await
    }

    /// Queues `message` for one peer; returns `false` if it is gone.
    pub async fn send_to(&self, id: ConnectionId, message: Outbound) -> bool {
        let tx = self.peers.lock().await.get(&id).cloned();
        match tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }

    async fn send_except(&self, skip: Option<ConnectionId>, message: Outbound) -> usize {
        let peers = self.peers.lock().await;
        let mut queued = 0;
        for (id, tx) in peers.iter() {
            if Some(*id) == skip {
                continue;
            }
            match tx.try_send(message.clone()) {
                Ok(()) => queued += 1,
                Err(e) => warn!(peer = %id, "dropping outbound message: {e}"),
            }
        }
        queued
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = match PeerConnection::from_tcp(stream, self.config.io_timeout) {
            Ok(conn) => conn,
            Err(e) => {
                error!(%peer_addr, "failed to set up connection: {e}");
                return;
            }
        };
        info!(peer = %id, %peer_addr, "peer connected");

        let (reader, writer) = conn.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.peers.lock().await.insert(id, tx);
        self.emit(ServerEvent::Connected {
            id,
            peer: peer_addr,
        });

        let cancel = self.cancel.child_token();
        let writer_task = tokio::spawn(write_loop(id, writer, rx, cancel.clone()));

        let sink =
            DirectorySink::with_prefix(&self.config.download_dir, &self.config.received_prefix);
        let mut receiver = Receiver::new(reader, sink, self.config.policy.clone());

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => match receiver.cancel().await {
                    Some(e) => break Err(e),
                    None => break Ok(()),
                },

                next = receiver.next() => match next {
                    Ok(Some(event)) => self.dispatch(id, event).await,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };

        self.peers.lock().await.remove(&id);
        cancel.cancel();
        if let Err(e) = writer_task.await {
            error!(peer = %id, "writer task failed: {e}");
        }

        match &result {
            Ok(()) => info!(peer = %id, "peer disconnected"),
            Err(e) => warn!(peer = %id, "connection closed: {e}"),
        }
        self.emit(ServerEvent::Disconnected {
            id,
            error: result.err().map(|e| e.to_string()),
        });
    }

    async fn dispatch(&self, id: ConnectionId, event: Inbound) {
        match &event {
            Inbound::Chat(line) => {
                info!(peer = %id, "{line}");
                if self.config.relay_chat {
                    self.send_except(Some(id), Outbound::Line(line.to_string()))
                        .await;
                }
            }
            Inbound::File(stored) => {
                info!(peer = %id, file = %stored.filename, size = stored.size, "file stored");
            }
            Inbound::Rejected { header, reason } => {
                warn!(peer = %id, file = %header, "transfer rejected: {reason}");
            }
            Inbound::Malformed(e) => {
                warn!(peer = %id, "malformed header: {e}");
            }
        }
        self.emit(ServerEvent::Inbound { id, event });
    }

    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Drains the outbound queue of one connection into its socket.
async fn write_loop(
    id: ConnectionId,
    mut writer: ConnectionWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let result = match message {
            Outbound::Line(line) => writer.send_line(&line).await,
            Outbound::File(path) => writer.send_file(&path).await.map(drop),
            Outbound::Bytes { filename, data } => {
                writer.send_file_bytes(&filename, &data).await.map(drop)
            }
        };

        if let Err(e) = result {
            if e.is_fatal() {
                warn!(peer = %id, "write failed, closing: {e}");
                cancel.cancel();
                break;
            }
            warn!(peer = %id, "send skipped: {e}");
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(peer = %id, "shutdown: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use filechat_protocol::ChatLine;

    async fn start(dir: &std::path::Path) -> (Arc<ChatServer>, SocketAddr) {
        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            download_dir: dir.to_path_buf(),
            ..ServerConfig::default()
        };
        let server = ChatServer::new(config);
        let listener = server.bind().await.unwrap();
        let addr = server.local_addr().await.unwrap();
        let s = Arc::clone(&server);
        tokio::spawn(async move { s.serve(listener).await });
        (server, addr)
    }

    async fn client(addr: SocketAddr) -> crate::TcpPeer {
        let stream = TcpStream::connect(addr).await.unwrap();
        PeerConnection::from_tcp(stream, None).unwrap()
    }

    async fn next_inbound(
        events: &mut broadcast::Receiver<ServerEvent>,
    ) -> (ConnectionId, Inbound) {
        loop {
            if let ServerEvent::Inbound { id, event } = events.recv().await.unwrap() {
                return (id, event);
            }
        }
    }

    #[tokio::test]
    async fn stores_announced_file() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let mut conn = client(addr).await;
        conn.send_line("FILE_TRANSFER:a.txt:5").await.unwrap();
        conn.send_bytes(b"hello").await.unwrap();

        let (_, event) = next_inbound(&mut events).await;
        let Inbound::File(stored) = event else {
            panic!("expected a file, got {event:?}");
        };
        assert_eq!(stored.filename, "a.txt");
        assert_eq!(
            std::fs::read(dir.path().join("Received_a.txt")).unwrap(),
            b"hello"
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn relays_chat_to_other_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let mut alice = client(addr).await;
        let mut bob = client(addr).await;
        // Both registered before Alice speaks.
        let mut connected = 0;
        while connected < 2 {
            if let ServerEvent::Connected { .. } = events.recv().await.unwrap() {
                connected += 1;
            }
        }

        alice.send_line("Alice: hi").await.unwrap();
        assert_eq!(bob.read_line().await.unwrap().as_deref(), Some("Alice: hi"));

        let (_, event) = next_inbound(&mut events).await;
        assert_eq!(event, Inbound::Chat(ChatLine::new("Alice: hi")));
        server.shutdown();
    }

    #[tokio::test]
    async fn malformed_header_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let mut conn = client(addr).await;
        conn.send_line("FILE_TRANSFER:a.txt:abc").await.unwrap();
        conn.send_line("Alice: hi").await.unwrap();

        assert!(matches!(
            next_inbound(&mut events).await.1,
            Inbound::Malformed(_)
        ));
        assert_eq!(
            next_inbound(&mut events).await.1,
            Inbound::Chat(ChatLine::new("Alice: hi"))
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn short_transfer_reported_on_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let mut conn = client(addr).await;
        conn.send_line("FILE_TRANSFER:a.txt:10").await.unwrap();
        conn.send_bytes(b"abc").await.unwrap();
        drop(conn);

        let error = loop {
            if let ServerEvent::Disconnected { error, .. } = events.recv().await.unwrap() {
                break error;
            }
        };
        let error = error.unwrap();
        assert!(error.contains("received 3 of 10"), "{error}");
        assert!(!dir.path().join("Received_a.txt").exists());
        server.shutdown();
    }

    #[tokio::test]
    async fn concurrent_connections_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let a_data = vec![b'A'; 100_000];
        let b_data = vec![b'B'; 120_000];

        let send = move |name: &'static str, data: Vec<u8>| async move {
            let mut conn = client(addr).await;
            conn.send_line(&format!("FILE_TRANSFER:{name}:{}", data.len()))
                .await
                .unwrap();
            for chunk in data.chunks(1000) {
                conn.send_bytes(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            conn
        };
        let (a, b) = tokio::join!(
            send("a.bin", a_data.clone()),
            send("b.bin", b_data.clone())
        );

        let mut files = 0;
        while files < 2 {
            if let (_, Inbound::File(_)) = next_inbound(&mut events).await {
                files += 1;
            }
        }
        assert_eq!(
            std::fs::read(dir.path().join("Received_a.bin")).unwrap(),
            a_data
        );
        assert_eq!(
            std::fs::read(dir.path().join("Received_b.bin")).unwrap(),
            b_data
        );
        drop((a, b));
        server.shutdown();
    }

    #[tokio::test]
    async fn broadcast_file_to_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let conn = client(addr).await;
        while !matches!(events.recv().await.unwrap(), ServerEvent::Connected { .. }) {}

        let queued = server
            .broadcast(Outbound::Bytes {
                filename: "notice.txt".into(),
                data: Arc::from(&b"server says hi"[..]),
            })
            .await;
        assert_eq!(queued, 1);

        let (reader, _writer) = conn.into_split();
        let mut rx = Receiver::new(reader, MemorySink::new(), ReceivePolicy::default());
        assert!(matches!(rx.next().await.unwrap(), Some(Inbound::File(_))));
        assert_eq!(rx.sink().get("notice.txt"), Some(&b"server says hi"[..]));
        server.shutdown();
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let conn = client(addr).await;
        while !matches!(events.recv().await.unwrap(), ServerEvent::Connected { .. }) {}
        assert_eq!(server.peer_count().await, 1);

        server.shutdown();
        let (mut reader, _writer) = conn.into_split();
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_mid_body_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path()).await;
        let mut events = server.subscribe();

        let mut conn = client(addr).await;
        conn.send_line("FILE_TRANSFER:a.txt:10").await.unwrap();
        conn.send_bytes(b"abc").await.unwrap();

        // Wait for the sink to open the file before pulling the plug.
        let partial = dir.path().join("Received_a.txt");
        for _ in 0..200 {
            if partial.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(partial.exists());

        server.shutdown();
        let error = loop {
            if let ServerEvent::Disconnected { error, .. } = events.recv().await.unwrap() {
                break error;
            }
        };
        let error = error.expect("cancelled body must not be a clean close");
        assert!(error.contains("of 10 bytes"), "{error}");
        assert!(!partial.exists());
        drop(conn);
    }
}

