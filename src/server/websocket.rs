//! Relay server implementation
//!
//! Listens on the configured address, sorts incoming connections into plain
//! HTTP requests and WebSocket upgrades, and runs one session task per
//! upgraded connection.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::handshake::{accept_upgrade, bad_request_response};
use super::http::{plain_response, read_request_head};
use super::protocol::ProtocolError;
use super::session::ConnectionSession;
use crate::config::RelayConfig;

/// Initial capacity of the per-connection read buffer
const READ_BUFFER_CAPACITY: usize = 4096;

/// WebSocket relay server
pub struct RelayServer {
    config: RelayConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Relay running on ws://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown.
    ///
    /// A failing connection is logged and never stops the accept loop.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handle a single accepted connection
async fn handle_connection<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("New connection from {}", peer_addr);

    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let head = match read_request_head(&mut stream, &mut buf).await {
        Ok(head) => head,
        Err(ProtocolError::HandshakeMalformed(reason)) => {
            return reject(stream, peer_addr, &reason).await;
        }
        Err(e) => return Err(e.into()),
    };

    if !head.is_websocket_upgrade() {
        debug!(
            "Plain HTTP request from {}: {} {} {}",
            peer_addr, head.method, head.path, head.version
        );
        stream.write_all(plain_response().as_bytes()).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let token = match accept_upgrade(&head) {
        Ok(token) => token,
        Err(_) => return reject(stream, peer_addr, "Missing Sec-WebSocket-Key").await,
    };

    let mut session = ConnectionSession::new(stream, buf, shutdown_rx);
    info!("Session {} started for {}", session.id(), peer_addr);
    session.open(&token).await?;
    session.run().await?;
    Ok(())
}

/// Answer a malformed request with `400 Bad Request` and close.
///
/// The returned error is what the accept loop logs.
async fn reject<S>(mut stream: S, peer_addr: SocketAddr, reason: &str) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug!("Sending 400 to {}", peer_addr);
    stream
        .write_all(bad_request_response(reason).as_bytes())
        .await?;
    let _ = stream.shutdown().await;
    Err(ProtocolError::HandshakeMalformed(reason.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::frame::client_frame;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    const UPGRADE: &str = "GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_plain_http_request() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (_tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(handle_connection(server, peer(), rx));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("Relay is active."));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_without_key_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (_tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(handle_connection(server, peer(), rx));

        client
            .write_all(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!response.contains("Sec-WebSocket-Accept"));
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_malformed_head_is_rejected() {
        let requests: [&[u8]; 3] = [
            b"GARBAGE\r\n\r\n",
            b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n",
            b"GET / HTTP/1.1\r\nHost: \xff\xfe\r\n\r\n",
        ];

        for request in requests {
            let (mut client, server) = tokio::io::duplex(4096);
            let (_tx, rx) = broadcast::channel(1);
            let handle = tokio::spawn(handle_connection(server, peer(), rx));

            client.write_all(request).await.unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            let response = String::from_utf8(response).unwrap();

            assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
            assert!(handle.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn test_relay_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::sync::Arc::new(RelayServer::new(RelayConfig::default()));
        let serving = {
            let server = std::sync::Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Frame sent in the same write as the request head
        let mut request = UPGRADE.as_bytes().to_vec();
        request.extend(client_frame(0x1, b"ping", [9, 8, 7, 6]));
        client.write_all(&request).await.unwrap();

        let expected_head = "HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let mut head = vec![0u8; expected_head.len()];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(String::from_utf8(head).unwrap(), expected_head);

        let echo = b"Relay Echo: ping";
        let mut frame = vec![0u8; 2 + echo.len()];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1] as usize, echo.len());
        assert_eq!(&frame[2..], echo);

        server.shutdown();
        let mut close = [0u8; 2];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x00]);
        serving.await.unwrap().unwrap();
    }
}
