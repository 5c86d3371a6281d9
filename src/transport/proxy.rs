//! Proxy tunnels: SOCKS4/4a, SOCKS5 and HTTP `CONNECT`.
//!
//! [`tunnel`] runs the handshake over an already connected stream and hands
//! the stream back once the proxy has connected it through to the target.
//! Responses are read exactly, never past their end, so the first bytes the
//! broker sends stay in the stream.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::{ProxyProtocol, ProxySettings};
use crate::utils::error::ConnectError;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const SOCKS_CMD_CONNECT: u8 = 0x01;

const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_UNACCEPTABLE: u8 = 0xFF;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const HTTP_MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Ask the proxy on `stream` to connect through to `host:port`.
pub async fn tunnel<S>(
    mut stream: S,
    settings: &ProxySettings,
    host: &str,
    port: u16,
) -> Result<S, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let timeout = Duration::from_millis(settings.handshake_timeout_ms);
    let handshake = async {
        match settings.protocol {
            ProxyProtocol::Socks4 => socks4(&mut stream, settings, host, port).await,
            ProxyProtocol::Socks5 => socks5(&mut stream, settings, host, port).await,
            ProxyProtocol::Http => http_connect(&mut stream, settings, host, port).await,
        }
    };
    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| ConnectError::Timeout("proxy handshake"))??;

    debug!(
        protocol = ?settings.protocol,
        proxy = %settings.host,
        target = %host,
        port,
        "proxy tunnel established"
    );
    Ok(stream)
}

async fn socks4<S>(stream: &mut S, settings: &ProxySettings, host: &str, port: u16) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user_id = settings.username.as_deref().unwrap_or_default();
    let mut request = vec![SOCKS4_VERSION, SOCKS_CMD_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.extend_from_slice(&ip.octets());
            push_nul_terminated(&mut request, user_id)?;
        }
        Ok(IpAddr::V6(_)) => {
            return Err(ConnectError::Proxy("SOCKS4 cannot reach IPv6 addresses".into()));
        }
        Err(_) => {
            // SOCKS4a: an invalid 0.0.0.x address tells the proxy to resolve the name
            request.extend_from_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
            push_nul_terminated(&mut request, user_id)?;
            push_nul_terminated(&mut request, host)?;
        }
    }
    stream.write_all(&request).await.map_err(ConnectError::ProxyIo)?;
    stream.flush().await.map_err(ConnectError::ProxyIo)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(ConnectError::ProxyIo)?;
    if reply[0] != 0x00 {
        return Err(ConnectError::Proxy(format!(
            "invalid SOCKS4 reply version {:#04x}",
            reply[0]
        )));
    }
    match reply[1] {
        0x5A => Ok(()),
        0x5B => Err(ConnectError::Proxy("SOCKS4 request rejected or failed".into())),
        0x5C => Err(ConnectError::Proxy(
            "SOCKS4 request rejected: proxy cannot reach identd".into(),
        )),
        0x5D => Err(ConnectError::Proxy(
            "SOCKS4 request rejected: identd reported a different user id".into(),
        )),
        other => Err(ConnectError::Proxy(format!("unknown SOCKS4 reply code {other:#04x}"))),
    }
}

fn push_nul_terminated(buf: &mut Vec<u8>, value: &str) -> Result<(), ConnectError> {
    if value.as_bytes().contains(&0) {
        return Err(ConnectError::Proxy("SOCKS4 fields must not contain NUL".into()));
    }
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

async fn socks5<S>(stream: &mut S, settings: &ProxySettings, host: &str, port: u16) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let credentials = settings
        .username
        .as_deref()
        .map(|user| (user, settings.password.as_deref().unwrap_or_default()));

    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE]
    };
    stream.write_all(greeting).await.map_err(ConnectError::ProxyIo)?;
    stream.flush().await.map_err(ConnectError::ProxyIo)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(ConnectError::ProxyIo)?;
    if choice[0] != SOCKS5_VERSION {
        return Err(ConnectError::Proxy(format!(
            "invalid SOCKS5 version {:#04x}",
            choice[0]
        )));
    }
    match (choice[1], credentials) {
        (SOCKS5_AUTH_NONE, _) => {}
        (SOCKS5_AUTH_PASSWORD, Some((user, password))) => {
            socks5_authenticate(stream, user, password).await?;
        }
        (SOCKS5_AUTH_UNACCEPTABLE, _) => {
            return Err(ConnectError::Proxy(
                "SOCKS5 proxy accepted none of the offered authentication methods".into(),
            ));
        }
        (method, _) => {
            return Err(ConnectError::Proxy(format!(
                "SOCKS5 proxy selected unexpected authentication method {method:#04x}"
            )));
        }
    }

    let mut request = vec![SOCKS5_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(SOCKS5_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(SOCKS5_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| ConnectError::Proxy("host name too long for SOCKS5".into()))?;
            request.push(SOCKS5_ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(ConnectError::ProxyIo)?;
    stream.flush().await.map_err(ConnectError::ProxyIo)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(ConnectError::ProxyIo)?;
    if head[0] != SOCKS5_VERSION {
        return Err(ConnectError::Proxy(format!(
            "invalid SOCKS5 version {:#04x}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(ConnectError::Proxy(format!(
            "SOCKS5 connect failed: {}",
            socks5_reply_text(head[1])
        )));
    }
    // the bound address is of no use to us but has to be consumed
    let addr_len = match head[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(ConnectError::ProxyIo)?;
            usize::from(len[0])
        }
        other => {
            return Err(ConnectError::Proxy(format!(
                "invalid SOCKS5 address type {other:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.map_err(ConnectError::ProxyIo)?;
    Ok(())
}

/// RFC 1929 username/password sub-negotiation.
async fn socks5_authenticate<S>(stream: &mut S, user: &str, password: &str) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user_len = u8::try_from(user.len())
        .map_err(|_| ConnectError::Proxy("SOCKS5 username longer than 255 bytes".into()))?;
    let password_len = u8::try_from(password.len())
        .map_err(|_| ConnectError::Proxy("SOCKS5 password longer than 255 bytes".into()))?;

    let mut request = Vec::with_capacity(3 + user.len() + password.len());
    request.push(0x01);
    request.push(user_len);
    request.extend_from_slice(user.as_bytes());
    request.push(password_len);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await.map_err(ConnectError::ProxyIo)?;
    stream.flush().await.map_err(ConnectError::ProxyIo)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(ConnectError::ProxyIo)?;
    if reply[1] != 0x00 {
        return Err(ConnectError::Proxy("SOCKS5 authentication failed".into()));
    }
    Ok(())
}

fn socks5_reply_text(code: u8) -> String {
    let text = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => return format!("unknown reply code {code:#04x}"),
    };
    text.to_string()
}

async fn http_connect<S>(stream: &mut S, settings: &ProxySettings, host: &str, port: u16) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(user) = &settings.username {
        let password = settings.password.as_deref().unwrap_or_default();
        let token = BASE64.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ConnectError::ProxyIo)?;
    stream.flush().await.map_err(ConnectError::ProxyIo)?;

    // byte at a time so nothing after the header is consumed
    let mut header = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= HTTP_MAX_RESPONSE_HEADER {
            return Err(ConnectError::Proxy("HTTP proxy response header too large".into()));
        }
        stream.read_exact(&mut byte).await.map_err(ConnectError::ProxyIo)?;
        header.push(byte[0]);
    }

    let header = String::from_utf8_lossy(&header);
    let status_line = header.lines().next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts.next().and_then(|code| code.parse::<u16>().ok());
    if !version.starts_with("HTTP/1.") {
        return Err(ConnectError::Proxy(format!(
            "invalid HTTP proxy response: {status_line:?}"
        )));
    }
    match status {
        Some(code) if (200..300).contains(&code) => Ok(()),
        Some(_) => Err(ConnectError::Proxy(format!(
            "HTTP proxy refused CONNECT: {status_line}"
        ))),
        None => Err(ConnectError::Proxy(format!(
            "invalid HTTP proxy response: {status_line:?}"
        ))),
    }
}
