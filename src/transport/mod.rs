//! The `transport` module gives the connection task one byte-stream
//! abstraction over every way of reaching the broker.
//!
//! A [`Channel`] is opened by [`open`], which makes the TCP connection
//! (to the broker, or to a proxy that is then asked to tunnel to the
//! broker) and optionally upgrades it to a websocket. Above this point
//! nothing knows which variant is in use: MQTT bytes go in with
//! [`Channel::write`] and come out of [`Channel::read`].

pub mod proxy;
pub mod websocket;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod websocket_tests;

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::{BrokerSettings, TransportKind, TransportSettings};
use crate::utils::error::ConnectError;

/// Any duplex byte stream a channel can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedIo = Box<dyn Io>;

enum Kind {
    Plain(BoxedIo),
    WebSocket(Box<WebSocketStream<BoxedIo>>),
}

/// An open, byte-oriented duplex connection to the broker.
pub struct Channel {
    kind: Kind,
    closed: bool,
}

impl Channel {
    /// MQTT directly over `io`, which may already be a proxy tunnel.
    pub fn plain(io: impl Io) -> Self {
        Self {
            kind: Kind::Plain(Box::new(io)),
            closed: false,
        }
    }

    /// MQTT in binary frames of an upgraded websocket.
    pub fn websocket(ws: WebSocketStream<BoxedIo>) -> Self {
        Self {
            kind: Kind::WebSocket(Box::new(ws)),
            closed: false,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.kind, Kind::WebSocket(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append received bytes to `buf`. `Ok(0)` means the peer closed.
    ///
    /// Cancel safe: if the future is dropped before completing, no bytes
    /// have been lost.
    pub async fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        match &mut self.kind {
            Kind::Plain(io) => io.read_buf(buf).await,
            Kind::WebSocket(ws) => loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if data.is_empty() {
                            continue;
                        }
                        buf.extend_from_slice(&data);
                        return Ok(data.len());
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "text frame received on MQTT websocket",
                        ));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(?frame, "websocket closed by peer");
                        return Ok(0);
                    }
                    // pongs are queued by tungstenite and go out with the next write
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                    Some(Err(err)) => return ws_read_error(err),
                    None => return Ok(0),
                }
            },
        }
    }

    /// Write all of `bytes` and flush.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel is closed"));
        }
        match &mut self.kind {
            Kind::Plain(io) => {
                io.write_all(bytes).await?;
                io.flush().await
            }
            Kind::WebSocket(ws) => ws
                .send(WsMessage::Binary(Bytes::copy_from_slice(bytes)))
                .await
                .map_err(ws_io_error),
        }
    }

    /// Shut the channel down. Calling it again does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let result = match &mut self.kind {
            Kind::Plain(io) => io.shutdown().await,
            Kind::WebSocket(ws) => {
                let ws: &mut WebSocketStream<BoxedIo> = ws;
                ws.close(None).await.map_err(ws_io_error)
            }
        };
        if let Err(err) = result {
            debug!(error = %err, "error while closing channel");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Kind::Plain(_) => "plain",
            Kind::WebSocket(_) => "websocket",
        };
        f.debug_struct("Channel")
            .field("kind", &kind)
            .field("closed", &self.closed)
            .finish()
    }
}

fn ws_read_error(err: tungstenite::Error) -> io::Result<usize> {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Ok(0),
        other => Err(ws_io_error(other)),
    }
}

fn ws_io_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(err) => err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::NotConnected, "websocket is closed")
        }
        other => io::Error::other(other),
    }
}

/// Open a channel to the broker as described by the settings. The whole
/// open, including any proxy handshake and websocket upgrade, is bounded by
/// the broker's connect timeout.
pub async fn open(broker: &BrokerSettings, transport: &TransportSettings) -> Result<Channel, ConnectError> {
    let timeout = Duration::from_millis(broker.connect_timeout_ms);
    tokio::time::timeout(timeout, open_channel(broker, transport))
        .await
        .map_err(|_| ConnectError::Timeout("transport open"))?
}

async fn open_channel(broker: &BrokerSettings, transport: &TransportSettings) -> Result<Channel, ConnectError> {
    let io: BoxedIo = match &transport.proxy {
        Some(proxy) => {
            let tcp = connect_tcp(&proxy.host, proxy.port).await?;
            let tunnel = proxy::tunnel(tcp, proxy, &broker.host, broker.port).await?;
            Box::new(tunnel)
        }
        None => Box::new(connect_tcp(&broker.host, broker.port).await?),
    };

    let channel = match transport.kind {
        TransportKind::Tcp => Channel {
            kind: Kind::Plain(io),
            closed: false,
        },
        TransportKind::WebSocket => {
            let ws = websocket::handshake(io, &broker.host, broker.port, &transport.websocket).await?;
            Channel::websocket(ws)
        }
    };
    info!(
        host = %broker.host,
        port = broker.port,
        kind = ?transport.kind,
        proxied = transport.proxy.is_some(),
        "transport open"
    );
    Ok(channel)
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let target = host.trim_start_matches('[').trim_end_matches(']');
    let stream = TcpStream::connect((target, port))
        .await
        .map_err(|source| ConnectError::Io {
            addr: format!("{host}:{port}"),
            source,
        })?;
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = %err, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}
