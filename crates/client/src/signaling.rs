//! Signaling socket: connect, bootstrap the peer configuration, send JSON.

use crate::error::{Error, Result};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use droidlink_protocol::{ClientMessage, Inbound, RtcConfiguration, ServerMessage};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `{base}?token={token}` with the token percent-encoded.
pub fn signaling_url(base: &str, token: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}token={}", urlencoding::encode(token))
}

/// Build a TLS connector trusting system roots plus an optional pinned PEM.
pub(crate) fn build_tls_connector(tls_cert_path: Option<&str>) -> anyhow::Result<Connector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Skipping platform certificate: {e}");
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded platform root certificates");

    if let Some(cert_path) = tls_cert_path {
        let pem_data = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert from {cert_path}"))?;
        for cert in rustls_pemfile::certs(&mut pem_data.as_slice()) {
            let cert = cert.with_context(|| format!("Invalid PEM in {cert_path}"))?;
            root_store
                .add(cert)
                .with_context(|| format!("Failed to add pinned cert from {cert_path}"))?;
            info!("Pinned server certificate from {cert_path}");
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to configure TLS protocol versions")?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(tls_config)))
}

/// Open a WebSocket. TLS is only configured for `wss://` URLs.
pub(crate) async fn open_websocket(
    request: Request,
    tls_cert_path: Option<&str>,
) -> anyhow::Result<WsStream> {
    let connector = if request.uri().scheme_str() == Some("wss") {
        Some(build_tls_connector(tls_cert_path)?)
    } else {
        None
    };
    let (ws_stream, _) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
            .await
            .context("WebSocket connection failed")?;
    Ok(ws_stream)
}

/// Connect to the signaling endpoint within `timeout`.
pub async fn connect(
    base_url: &str,
    token: &str,
    tls_cert_path: Option<&str>,
    timeout: Duration,
) -> Result<WsStream> {
    let url = signaling_url(base_url, token);
    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Connection(format!("invalid signaling URL {base_url}: {e}")))?;

    info!(url = base_url, "Connecting to signaling server");
    match tokio::time::timeout(timeout, open_websocket(request, tls_cert_path)).await {
        Ok(Ok(ws)) => {
            info!("Connected to signaling server");
            Ok(ws)
        }
        Ok(Err(e)) => Err(Error::Connection(format!("{e:#}"))),
        Err(_) => Err(Error::Timeout {
            what: "signaling connect",
            after: timeout,
        }),
    }
}

/// Serialize and send one message as a text frame.
pub async fn send_json<S>(sink: &mut S, msg: &ClientMessage) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(msg).map_err(|e| Error::Protocol(e.to_string()))?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Ask for the peer configuration and wait for the reply.
///
/// Other frames that arrive first are logged and dropped.
pub async fn request_rtc_configuration(
    ws: &mut WsStream,
    session_id: &str,
    timeout: Duration,
) -> Result<RtcConfiguration> {
    send_json(
        ws,
        &ClientMessage::RequestRtcConfiguration {
            session_id: session_id.to_string(),
        },
    )
    .await?;

    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                    Ok(Inbound::Message(ServerMessage::RtcConfiguration { rtc_configuration })) => {
                        return Ok(rtc_configuration);
                    }
                    Ok(Inbound::Message(other)) => {
                        debug!(?other, "Ignoring message before rtcConfiguration");
                    }
                    Ok(Inbound::Unknown(kind)) => {
                        warn!(%kind, "Received unexpected message type");
                    }
                    Err(e) => warn!("Dropping malformed signaling message: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return Err(Error::Connection(format!(
                        "signaling socket closed before rtcConfiguration: {frame:?}"
                    )));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(Error::Connection(
                        "signaling socket ended before rtcConfiguration".to_string(),
                    ));
                }
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::Timeout {
            what: "rtcConfiguration",
            after: timeout,
        })?
}
