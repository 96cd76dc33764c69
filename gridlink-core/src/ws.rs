//! WebSocket transport drivers
//!
//! One WebSocket connection per peer node. The handshake establishes node
//! identity (URL path tail) and negotiates the wire variant through
//! `Sec-WebSocket-Protocol`. Each accepted or dialed connection gets a
//! writer task draining the engine's outbound queue and a receive loop
//! feeding inbound frames into [`Node::ingest`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async, connect_async,
    tungstenite::{
        handshake::client::Request,
        handshake::server,
        http::{header, HeaderValue, Uri},
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::connection::WirePayload;
use crate::node::Node;
use crate::types::{NodeId, WireFormat};

/// Subprotocol for JSON text framing
pub const SUBPROTOCOL_JSON: &str = "gridlink1.0";
/// Subprotocol for binary framing
pub const SUBPROTOCOL_BINARY: &str = "gridlink1.0-bin";

#[derive(Debug, Error)]
pub enum WsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("peer did not present a node identity in the URL path")]
    MissingIdentity,

    #[error("invalid URL: {0}")]
    BadUrl(String),
}

fn subprotocol_for(format: WireFormat) -> &'static str {
    match format {
        WireFormat::Json => SUBPROTOCOL_JSON,
        WireFormat::Binary => SUBPROTOCOL_BINARY,
    }
}

fn format_for(subprotocol: &str) -> Option<WireFormat> {
    match subprotocol {
        SUBPROTOCOL_JSON => Some(WireFormat::Json),
        SUBPROTOCOL_BINARY => Some(WireFormat::Binary),
        _ => None,
    }
}

/// Accept loop: serve peers on `listen` until the task is dropped
pub async fn serve(node: Arc<Node>, listen: SocketAddr) -> Result<(), WsError> {
    let listener = TcpListener::bind(listen).await?;
    info!(node = node.id(), %listen, "listening for peers");

    loop {
        let (stream, remote) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_peer(node, stream).await {
                warn!(%remote, %e, "peer connection ended with error");
            }
        });
    }
}

async fn accept_peer(node: Arc<Node>, stream: TcpStream) -> Result<(), WsError> {
    let mut peer_id: Option<NodeId> = None;
    let mut format = WireFormat::Json;

    let callback = |req: &server::Request, mut resp: server::Response| {
        // Node identity is the last path segment: /gridlink/CS001
        peer_id = req
            .uri()
            .path()
            .rsplit('/')
            .find(|s| !s.is_empty())
            .map(str::to_string);

        // Pick the first offered subprotocol we speak
        if let Some(offered) = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
        {
            for candidate in offered.split(',').map(str::trim) {
                if let Some(f) = format_for(candidate) {
                    format = f;
                    if let Ok(value) = HeaderValue::from_str(candidate) {
                        resp.headers_mut()
                            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                    }
                    break;
                }
            }
        }

        Ok(resp)
    };

    let ws = accept_hdr_async(stream, callback).await?;
    let peer = peer_id.ok_or(WsError::MissingIdentity)?;
    info!(node = node.id(), %peer, ?format, "peer connected");

    drive(node, ws, peer, format).await
}

/// Options for dialing a remote node
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Base WebSocket URL of the remote endpoint (without our node id)
    pub url: String,
    /// Node id of the remote endpoint
    pub remote_id: NodeId,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>, remote_id: impl Into<NodeId>) -> Self {
        Self {
            url: url.into(),
            remote_id: remote_id.into(),
        }
    }
}

/// Dial the remote once and drive the connection until it closes
pub async fn connect(node: Arc<Node>, opts: &ConnectOptions) -> Result<(), WsError> {
    let format = node.config().wire_format;
    let url = format!("{}/{}", opts.url.trim_end_matches('/'), node.id());
    let uri: Uri = url
        .parse()
        .map_err(|_| WsError::BadUrl(url.clone()))?;

    let request = Request::builder()
        .uri(&url)
        .header(header::SEC_WEBSOCKET_PROTOCOL, subprotocol_for(format))
        .header(header::HOST, uri.host().unwrap_or("localhost"))
        .body(())
        .map_err(|_| WsError::BadUrl(url.clone()))?;

    let (ws, response) = connect_async(request).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(subprotocol_for(format)) {
        warn!(
            node = node.id(),
            ?accepted,
            "remote did not accept requested subprotocol"
        );
    }

    info!(node = node.id(), %url, "connected");
    drive(node, ws, opts.remote_id.clone(), format).await
}

/// Dial with reconnect: exponential backoff between attempts, capped by the
/// node config
pub async fn run_client(node: Arc<Node>, opts: ConnectOptions) {
    let mut delay = node.config().reconnect_delay;
    let max_delay = node.config().max_reconnect_delay;

    loop {
        match connect(node.clone(), &opts).await {
            Ok(()) => {
                info!(node = node.id(), "connection closed, reconnecting");
                delay = node.config().reconnect_delay;
            }
            Err(e) => {
                error!(node = node.id(), %e, "connection failed");
            }
        }

        info!(node = node.id(), ?delay, "reconnecting after delay");
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, max_delay);
    }
}

/// Shared receive/write loop for accepted and dialed connections
async fn drive<S>(
    node: Arc<Node>,
    ws: WebSocketStream<S>,
    peer: NodeId,
    format: WireFormat,
) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (conn, mut outbound_rx) = node.open_link(peer.clone(), format);

    // Single writer task: outbound frames are serialized, never interleaved
    let writer = tokio::spawn(async move {
        while let Some(wire) = outbound_rx.recv().await {
            let message = match wire {
                WirePayload::Text(text) => Message::Text(text.into()),
                WirePayload::Binary(bytes) => Message::Binary(bytes.into()),
            };
            if let Err(e) = ws_tx.send(message).await {
                error!(%e, "failed to write WebSocket message");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        node.ingest(&conn, WirePayload::Text(text.to_string())).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        node.ingest(&conn, WirePayload::Binary(bytes.into())).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(%peer, "peer closed connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong handled by tungstenite
                    }
                    Some(Err(e)) => {
                        warn!(%peer, %e, "WebSocket receive error");
                        break;
                    }
                    None => {
                        info!(%peer, "WebSocket stream ended");
                        break;
                    }
                }
            }

            // A reconnect for the same peer superseded this session
            _ = conn.closed() => {
                debug!(%peer, "session superseded, ending receive loop");
                break;
            }
        }
    }

    node.connection_lost(&conn);
    writer.abort();
    Ok(())
}
