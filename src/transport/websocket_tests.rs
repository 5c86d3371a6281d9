use super::*;
use crate::config::WebSocketSettings;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::accept_hdr_async;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;
use tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

struct Upgrade {
    uri: String,
    protocol: Option<String>,
}

/// Accepts one websocket client, reports the upgrade request, then runs
/// `script` against the server side of the socket.
async fn ws_server<F, Fut>(script: F) -> (u16, oneshot::Receiver<Upgrade>)
where
    F: FnOnce(WebSocketStream<tokio::net::TcpStream>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (upgrade_tx, upgrade_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let protocol = req
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt"));
            let _ = upgrade_tx.send(Upgrade {
                uri: req.uri().to_string(),
                protocol,
            });
            Ok(response)
        };
        let ws = accept_hdr_async(stream, callback).await.unwrap();
        script(ws).await;
    });
    (port, upgrade_rx)
}

fn ws_broker(port: u16) -> (BrokerSettings, TransportSettings) {
    let broker = BrokerSettings {
        host: "127.0.0.1".into(),
        port,
        ..BrokerSettings::default()
    };
    let transport = TransportSettings {
        kind: TransportKind::WebSocket,
        ..TransportSettings::default()
    };
    (broker, transport)
}

#[test]
fn test_endpoint_url() {
    let settings = WebSocketSettings::default();
    let url = websocket::endpoint_url("broker.test", 8080, &settings).unwrap();
    assert_eq!(url.as_str(), "ws://broker.test:8080/mqtt");

    let settings = WebSocketSettings {
        server_path: "ws/mqtt".into(),
        query: Some("token=abc".into()),
        ..WebSocketSettings::default()
    };
    let url = websocket::endpoint_url("::1", 9001, &settings).unwrap();
    assert_eq!(url.as_str(), "ws://[::1]:9001/ws/mqtt?token=abc");

    let settings = WebSocketSettings {
        server_path: String::new(),
        query: Some(String::new()),
        ..WebSocketSettings::default()
    };
    let url = websocket::endpoint_url("10.0.0.1", 80, &settings).unwrap();
    assert_eq!(url.as_str(), "ws://10.0.0.1/");
}

#[tokio::test]
async fn test_upgrade_requests_path_and_subprotocol() {
    let (port, upgrade) = ws_server(|mut ws| async move {
        let frame = ws.next().await.unwrap().unwrap();
        ws.send(frame).await.unwrap();
    })
    .await;

    let (broker, mut transport) = ws_broker(port);
    transport.websocket.query = Some("id=7".into());
    let mut channel = open(&broker, &transport).await.expect("websocket open");
    assert!(channel.is_websocket());

    let upgrade = upgrade.await.unwrap();
    assert_eq!(upgrade.uri, "/mqtt?id=7");
    assert_eq!(upgrade.protocol.as_deref(), Some("mqtt"));

    channel.write(&[0xC0, 0x00]).await.unwrap();
    let mut buf = BytesMut::new();
    channel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..], &[0xC0, 0x00]);
}

#[tokio::test]
async fn test_control_frames_are_skipped_and_close_is_eof() {
    let (port, _upgrade) = ws_server(|mut ws| async move {
        ws.send(WsMessage::Ping(Bytes::from_static(b"hi"))).await.unwrap();
        ws.send(WsMessage::Binary(Bytes::new())).await.unwrap();
        ws.send(WsMessage::Binary(Bytes::from_static(&[0x20, 0x02])))
            .await
            .unwrap();
        ws.send(WsMessage::Binary(Bytes::from_static(&[0x00, 0x00])))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
        // drain until the client acknowledges the close
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let (broker, transport) = ws_broker(port);
    let mut channel = open(&broker, &transport).await.expect("websocket open");

    let mut buf = BytesMut::new();
    assert_eq!(channel.read(&mut buf).await.unwrap(), 2);
    assert_eq!(channel.read(&mut buf).await.unwrap(), 2);
    assert_eq!(&buf[..], &[0x20, 0x02, 0x00, 0x00]);
    assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
    channel.close().await;
}

#[tokio::test]
async fn test_text_frame_is_an_error() {
    let (port, _upgrade) = ws_server(|mut ws| async move {
        ws.send(WsMessage::Text("hello".into())).await.unwrap();
        let _ = ws.next().await;
    })
    .await;

    let (broker, transport) = ws_broker(port);
    let mut channel = open(&broker, &transport).await.expect("websocket open");
    let err = channel.read(&mut BytesMut::new()).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn test_upgrade_rejected_by_plain_http_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let (broker, transport) = ws_broker(port);
    let err = open(&broker, &transport).await.unwrap_err();
    assert!(matches!(err, ConnectError::WebSocket(_)));
}
