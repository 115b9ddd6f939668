//! WebSocket Transport
//!
//! Connects peers over `ws://` using tokio-tungstenite. Messages are
//! encoded with the codec of the peer's serialization format: MessagePack
//! travels in binary frames, JSON in text frames.
//!
//! The client identifies itself in the query string so a reconnecting
//! client lands on the same server peer:
//!
//! ```text
//! ws://host:port/rpc?clientId=<uuid>&f=msgpack
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::codec::{codec_for, Frame};
use super::message::RpcMessage;
use super::peer::RpcPeer;
use super::peer_ref::{PeerRef, SerializationFormat};
use super::server::RpcServer;
use super::transport::{Connector, RpcConnection};
use crate::channel::{channel_pair, ChannelEnd};
use crate::error::{Error, Result};

/// Path the server expects connections on.
pub const RPC_PATH: &str = "/rpc";

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    client_id: Uuid,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            client_id: Uuid::new_v4(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn url(&self, peer_ref: &PeerRef) -> String {
        format!(
            "ws://{}{}?clientId={}&f={}",
            peer_ref.host,
            RPC_PATH,
            self.client_id,
            peer_ref.format.as_str()
        )
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, peer_ref: &PeerRef, cancel: &CancellationToken) -> Result<RpcConnection> {
        let url = self.url(peer_ref);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::PeerStopped(peer_ref.to_string())),
            connected = connect_async(url.as_str()) => connected,
        };
        let (stream, _) =
            connected.map_err(|error| Error::Disconnected(format!("{url}: {error}")))?;
        debug!(%url, "websocket connected");
        Ok(bridge(stream, peer_ref.format, peer_ref.host.clone()))
    }
}

/// Complete the WebSocket handshake on `stream` and hand the connection to
/// `server`.
pub async fn serve_websocket(server: &RpcServer, stream: TcpStream) -> Result<RpcPeer> {
    let remote = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut query = None;
    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        query = request.uri().query().map(str::to_string);
        Ok(response)
    };
    let websocket = accept_hdr_async(stream, callback)
        .await
        .map_err(|error| Error::HandshakeFailed(error.to_string()))?;

    let (client_id, format) = parse_query(query.as_deref().unwrap_or_default());
    let client_id = client_id.unwrap_or_else(|| remote.clone());
    let client_ref = PeerRef::remote(client_id).with_format(format).to_server();
    debug!(%remote, client = %client_ref, "websocket accepted");
    server.accept(bridge(websocket, format, remote), client_ref)
}

fn parse_query(query: &str) -> (Option<String>, SerializationFormat) {
    let mut client_id = None;
    let mut format = SerializationFormat::default();
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("clientId", value)) if !value.is_empty() => client_id = Some(value.to_string()),
            Some(("f", "json")) => format = SerializationFormat::Json,
            Some(("f", "msgpack")) => format = SerializationFormat::MsgPack,
            _ => {}
        }
    }
    (client_id, format)
}

/// Pump messages between a WebSocket and a channel pair.
fn bridge<S>(stream: WebSocketStream<S>, format: SerializationFormat, host: String) -> RpcConnection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = channel_pair::<RpcMessage>();
    let ChannelEnd { tx, mut rx } = remote;
    let (mut sink, mut source) = stream.split();

    let encoder = codec_for(format);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = match encoder.encode(&message) {
                Ok(frame) => frame,
                Err(error) => {
                    error!(%error, "failed to encode message");
                    continue;
                }
            };
            let message = match frame {
                Frame::Binary(bytes) => Message::Binary(bytes),
                Frame::Text(text) => Message::Text(text),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let decoder = codec_for(format);
    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            let frame = match item {
                Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            match decoder.decode(frame) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "dropping undecodable frame"),
            }
        }
    });

    RpcConnection::new(local, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;
    use crate::rpc::peer::PeerOptions;
    use crate::rpc::service::ServiceRegistry;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[test]
    fn query_carries_client_id_and_format() {
        let (id, format) = parse_query("clientId=abc&f=json");
        assert_eq!(id.as_deref(), Some("abc"));
        assert_eq!(format, SerializationFormat::Json);

        let (id, format) = parse_query("");
        assert_eq!(id, None);
        assert_eq!(format, SerializationFormat::MsgPack);
    }

    #[tokio::test]
    async fn plain_call_over_websocket() {
        let services = ServiceRegistry::builder()
            .plain("echo", "upper", |text: String, _| async move { Ok(text.to_uppercase()) })
            .build();
        let server = RpcServer::new("ws-test", services, PeerOptions::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let _ = serve_websocket(&server, stream).await;
                }
            });
        }

        for format in [SerializationFormat::MsgPack, SerializationFormat::Json] {
            let peer = RpcPeer::client(
                PeerRef::remote(addr.to_string()).with_format(format),
                Arc::new(WebSocketConnector::new()),
                ServiceRegistry::empty(),
                PeerOptions::default(),
            );
            let outcome = peer
                .call::<_, String>("echo", "upper", "ripple", &CancellationToken::new())
                .await;
            assert!(matches!(outcome, Outcome::Ok(ref text) if text == "RIPPLE"));
            peer.stop().await;
        }
        server.stop().await;
    }
}
