//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    extract_bearer_token, extract_query_token, Connection, ConnectionId,
    Transport, TransportError, UpgradeRequest,
};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A WebSocket-based [`Transport`] serving a single endpoint path.
pub struct WebSocketTransport {
    listener: TcpListener,
    endpoint: Arc<str>,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    ///
    /// Upgrade requests for any path other than `endpoint` are refused
    /// with `404 Not Found`.
    pub async fn bind(
        addr: &str,
        endpoint: &str,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, endpoint, "WebSocket transport listening");
        Ok(Self {
            listener,
            endpoint: Arc::from(endpoint),
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for WebSocketTransport {
    type Incoming = WebSocketUpgrade;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Incoming, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::debug!(%addr, "accepted TCP connection");

        Ok(WebSocketUpgrade {
            stream,
            addr,
            endpoint: Arc::clone(&self.endpoint),
        })
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A TCP connection waiting for its WebSocket upgrade.
pub struct WebSocketUpgrade {
    stream: TcpStream,
    addr: SocketAddr,
    endpoint: Arc<str>,
}

impl WebSocketUpgrade {
    /// Performs the HTTP upgrade, checking the endpoint path and capturing
    /// the bearer token the client presented.
    pub async fn upgrade(
        self,
    ) -> Result<(WebSocketConnection, UpgradeRequest), TransportError> {
        let endpoint = self.endpoint;
        let mut upgrade = UpgradeRequest {
            peer_addr: Some(self.addr),
            ..UpgradeRequest::default()
        };

        let callback = |req: &Request,
                        resp: Response|
         -> Result<Response, ErrorResponse> {
            let path = req.uri().path();
            if path != &*endpoint {
                let mut refusal = ErrorResponse::new(Some(format!(
                    "no real-time endpoint at {path}"
                )));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                return Err(refusal);
            }

            upgrade.path = path.to_owned();
            upgrade.bearer_token = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(extract_bearer_token)
                .or_else(|| req.uri().query().and_then(extract_query_token))
                .map(str::to_owned);
            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async(self.stream, callback)
            .await
            .map_err(|e| TransportError::UpgradeFailed(e.to_string()))?;

        let id = ConnectionId::new(
            NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        );
        tracing::debug!(%id, addr = %self.addr, "upgraded WebSocket connection");

        let (sink, stream) = ws.split();
        Ok((
            WebSocketConnection {
                id,
                sink: Mutex::new(sink),
                stream: Mutex::new(stream),
            },
            upgrade,
        ))
    }
}

/// A single WebSocket connection.
///
/// The write and read halves sit behind separate locks so an outbound
/// writer never waits on a reader parked in `recv`.
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let msg = Message::Binary(data.to_vec().into());
        self.sink.lock().await.send(msg).await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(data.into()));
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            e,
                        ),
                    ));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.sink.lock().await.close().await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    async fn close_with_reason(&self, reason: &str) -> Result<(), Self::Error> {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_owned().into(),
        };
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| {
                TransportError::SendFailed(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    e,
                ))
            })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
