//! TCP chat client.
//!
//! Connects to a server and hands back a [`PeerConnection`]; the caller
//! splits it to run its receive and send loops.

use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::TCP_CONNECT_TIMEOUT;
use crate::connection::PeerConnection;
use crate::error::DataChannelError;

/// A peer connection over TCP.
pub type TcpPeer = PeerConnection<OwnedReadHalf, OwnedWriteHalf>;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Deadline for every socket read/write (`None` waits forever).
    pub io_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: TCP_CONNECT_TIMEOUT,
            io_timeout: None,
        }
    }
}

/// Connects to `addr` with timeout + cancellation.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    options: &ClientOptions,
    cancel: &CancellationToken,
) -> Result<TcpPeer, DataChannelError> {
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(DataChannelError::Cancelled);
        }
        result = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)) => {
            match result {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(DataChannelError::Timeout),
            }
        }
    };

    let conn = PeerConnection::from_tcp(stream, options.io_timeout)?;
    if let Some(addr) = conn.peer_addr() {
        info!(%addr, "connected to chat server");
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{Inbound, ReceivePolicy, Receiver};
    use crate::server::{ChatServer, ServerConfig, ServerEvent};
    use crate::sink::MemorySink;
    use filechat_protocol::{ChatLine, Identity};

    #[tokio::test]
    async fn client_server_chat_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = ChatServer::new(ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            download_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        });
        let listener = server.bind().await.unwrap();
        let addr = server.local_addr().await.unwrap();
        let mut events = server.subscribe();
        let s = std::sync::Arc::clone(&server);
        tokio::spawn(async move { s.serve(listener).await });

        let cancel = CancellationToken::new();
        let conn = connect(addr, &ClientOptions::default(), &cancel)
            .await
            .unwrap();
        let (_reader, mut writer) = conn.into_split();

        let me = Identity::new("Client-7").unwrap();
        writer.send_chat(&me, "hello").await.unwrap();
        writer.send_file_bytes("a.txt", b"hello").await.unwrap();

        let mut inbound = Vec::new();
        while inbound.len() < 2 {
            if let ServerEvent::Inbound { event, .. } = events.recv().await.unwrap() {
                inbound.push(event);
            }
        }
        assert_eq!(inbound[0], Inbound::Chat(ChatLine::new("Client-7: hello")));
        assert!(matches!(inbound[1], Inbound::File(_)));
        assert_eq!(
            std::fs::read(dir.path().join("Received_a.txt")).unwrap(),
            b"hello"
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn client_receives_from_server() {
        let dir = tempfile::tempdir().unwrap();
        let server = ChatServer::new(ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            download_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        });
        let listener = server.bind().await.unwrap();
        let addr = server.local_addr().await.unwrap();
        let mut events = server.subscribe();
        let s = std::sync::Arc::clone(&server);
        tokio::spawn(async move { s.serve(listener).await });

        let conn = connect(addr, &ClientOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        while !matches!(events.recv().await.unwrap(), ServerEvent::Connected { .. }) {}

        server
            .broadcast(crate::Outbound::Line("Server: welcome".into()))
            .await;

        let (reader, _writer) = conn.into_split();
        let mut rx = Receiver::new(reader, MemorySink::new(), ReceivePolicy::default());
        assert_eq!(
            rx.next().await.unwrap(),
            Some(Inbound::Chat(ChatLine::new("Server: welcome")))
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, &ClientOptions::default(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(DataChannelError::Connection(_))));
    }

    #[tokio::test]
    async fn connect_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = connect("127.0.0.1:9", &ClientOptions::default(), &cancel).await;
        assert!(matches!(result, Err(DataChannelError::Cancelled)));
    }
}
