//! WebSocket transport for the [`NotificationService`].
//!
//! Every accepted connection becomes a subscriber. Clients may send
//! `{"action": "ping"}` or `{"action": "get_history", "limit": N}`; replies
//! go to the requesting client only.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use super::{
    ChannelSink, HistoryFilter, NotificationMessage, NotificationService, TIMESTAMP_FORMAT,
};
use errors::NotifyError;

/// Outgoing messages buffered per client before new ones are dropped.
const CLIENT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Subscription failed: {0}")]
    Subscribe(#[from] NotifyError)
}

pub type WsResult<T> = Result<T, WsError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Ping,
    GetHistory {
        #[serde(default = "default_history_limit")]
        limit: usize
    }
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Pong { timestamp: String },
    History { messages: Vec<NotificationMessage> },
    Error { message: String }
}

pub struct NotificationServer {
    service: Arc<NotificationService>,
    shutdown: watch::Sender<bool>
}

impl NotificationServer {
    pub fn new(service: Arc<NotificationService>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { service, shutdown }
    }

    pub async fn listen(self: &Arc<Self>, addr: &str) -> WsResult<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts clients until [`NotificationServer::shutdown`] is called.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> WsResult<()> {
        let mut stop = self.shutdown.subscribe();
        tracing::info!(addr = %listener.local_addr()?, "notification server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!("Connection from {peer_addr} error: {e}");
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept error: {e}")
                    }
                }
                _ = stop.changed() => break
            }
        }
        tracing::info!("notification server stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> WsResult<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let client_id = utils::generate_uuid();
        let (tx, mut rx) = mpsc::channel::<String>(CLIENT_QUEUE);
        self.service
            .subscribe(client_id.clone(), Arc::new(ChannelSink::new(client_id.clone(), tx)))?;
        tracing::debug!("WebSocket client {client_id} connected from {peer_addr}");

        let result: WsResult<()> = async {
            loop {
                tokio::select! {
                    incoming = ws_receiver.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let reply = self.handle_request(&text);
                                let json = serde_json::to_string(&reply)?;
                                ws_sender.send(Message::Text(json.into())).await?;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                tracing::warn!("WebSocket receive error for {client_id}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                    outgoing = rx.recv() => {
                        match outgoing {
                            Some(payload) => ws_sender.send(Message::Text(payload.into())).await?,
                            None => break
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        self.service.unsubscribe(&client_id);
        tracing::debug!("WebSocket client {client_id} disconnected");
        result
    }

    fn handle_request(&self, text: &str) -> ServerReply {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(ClientRequest::Ping) => ServerReply::Pong {
                timestamp: chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
            },
            Ok(ClientRequest::GetHistory { limit }) => ServerReply::History {
                messages: self.service.history(&HistoryFilter {
                    limit: Some(limit),
                    ..HistoryFilter::default()
                })
            },
            Err(e) => ServerReply::Error {
                message: format!("invalid request: {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationType;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_request_parsing() {
        let ping: ClientRequest = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(ping, ClientRequest::Ping);
        let history: ClientRequest = serde_json::from_str(r#"{"action":"get_history"}"#).unwrap();
        assert_eq!(history, ClientRequest::GetHistory { limit: 50 });
        assert!(serde_json::from_str::<ClientRequest>(r#"{"action":"reboot"}"#).is_err());
    }

    #[test]
    fn test_invalid_request_gets_error_reply() {
        let server = NotificationServer::new(Arc::new(NotificationService::default()));
        assert!(matches!(server.handle_request("not json"), ServerReply::Error { .. }));
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin
    {
        loop {
            let msg = timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return text.as_str().to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_client_receives_broadcasts_and_replies() {
        let service = Arc::new(NotificationService::default());
        let server = Arc::new(NotificationServer::new(Arc::clone(&service)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let welcome: NotificationMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(welcome.kind, NotificationType::SystemStatus);
        assert_eq!(service.status().subscriber_count, 1);

        ws.send(Message::Text(r#"{"action":"ping"}"#.into())).await.unwrap();
        let pong: ServerReply = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert!(matches!(pong, ServerReply::Pong { .. }));

        service.notify_rollback("main", Some(2), 1);
        let pushed: NotificationMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(pushed.kind, NotificationType::Rollback);

        ws.send(Message::Text(r#"{"action":"get_history","limit":5}"#.into()))
            .await
            .unwrap();
        let reply: ServerReply = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        match reply {
            ServerReply::History { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].kind, NotificationType::Rollback);
            }
            other => panic!("expected history, got {other:?}")
        }

        ws.close(None).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while service.status().subscriber_count > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("client was not unsubscribed");

        server.shutdown();
        timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
    }
}
