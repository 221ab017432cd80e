//! Network Server
//!
//! TCP server for accepting connections from other members and clients.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::replication::Message;

/// Message handler callback type. Handlers may suspend (e.g. a parked
/// lock acquire), so they return a future rather than a value.
pub type MessageHandler = Arc<
    dyn Fn(String, Message) -> Pin<Box<dyn Future<Output = Option<Message>> + Send>>
        + Send
        + Sync,
>;

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Message handler
    handler: MessageHandler,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: MessageHandler) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listener. Split from [`NetworkServer::serve`] so callers
    /// can learn the actual port when binding to port 0.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Run the accept loop until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Bind and run in one step
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection: requests are answered strictly in order,
/// so a sender multiplexing unrelated requests uses separate connections
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: MessageHandler,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                if let Some(response) = handler(peer_addr.clone(), message).await {
                    write_message(&mut writer, &response).await?;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client::send_once;
    use std::time::Duration;

    fn echo_handler() -> MessageHandler {
        Arc::new(|_peer, message| {
            Box::pin(async move {
                match message {
                    Message::StatusRequest => Some(Message::StatusResponse {
                        member_id: "member-1".to_string(),
                        table_version: 0,
                        owned_partitions: 0,
                        live_locks: 0,
                        entries: 0,
                    }),
                    _ => None,
                }
            })
        })
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let server = Arc::new(NetworkServer::new(
            "127.0.0.1:0".to_string(),
            echo_handler(),
        ));
        let listener = server.bind().await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let serve = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = serve.serve(listener).await;
        });

        let response = send_once(&address, Message::StatusRequest, Duration::from_secs(2))
            .await
            .unwrap();
        match response {
            Message::StatusResponse { member_id, .. } => assert_eq!(member_id, "member-1"),
            other => panic!("unexpected response: {:?}", other.type_name()),
        }

        server.stop();
    }
}
