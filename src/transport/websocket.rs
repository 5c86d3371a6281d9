//! Websocket client upgrade for MQTT over websockets.

use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use url::Url;

use super::BoxedIo;
use crate::config::WebSocketSettings;
use crate::utils::error::ConnectError;

/// `ws://host:port/<server_path>?<query>`
pub fn endpoint_url(host: &str, port: u16, settings: &WebSocketSettings) -> Result<Url, ConnectError> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    let mut url = Url::parse(&format!("ws://{host}:{port}/"))
        .map_err(|err| ConnectError::InvalidEndpoint(err.to_string()))?;
    url.set_path(&settings.server_path);
    url.set_query(settings.query.as_deref().filter(|query| !query.is_empty()));
    Ok(url)
}

/// Upgrade `stream` to a websocket, requesting the configured subprotocol.
pub async fn handshake(
    stream: BoxedIo,
    host: &str,
    port: u16,
    settings: &WebSocketSettings,
) -> Result<WebSocketStream<BoxedIo>, ConnectError> {
    let url = endpoint_url(host, port, settings)?;
    let mut request = url.as_str().into_client_request()?;
    if !settings.subprotocol.is_empty() {
        let value = HeaderValue::from_str(&settings.subprotocol)
            .map_err(|err| ConnectError::InvalidEndpoint(err.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let (ws, response) = tokio_tungstenite::client_async(request, stream).await?;
    debug!(%url, status = %response.status(), "websocket upgrade complete");
    Ok(ws)
}
