//! Single-connection TCP to WebSocket relay, used to reach an instance's ADB port.
//!
//! The listener accepts exactly one client and stops listening. Bytes from the
//! client go out as binary frames; every frame from the remote end is written
//! back verbatim. Either side going away tears down both.

use crate::error::{Error, Result};
use crate::signaling::{WsStream, open_websocket};

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

const READ_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub ping_interval: Duration,
    pub tls_cert: Option<String>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ping_interval: Duration::from_secs(30),
            tls_cert: None,
        }
    }
}

impl TunnelOptions {
    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self {
            host: config.tunnel.bind.clone(),
            port: config.tunnel.port,
            ping_interval: config.tunnel.ping_interval(),
            tls_cert: config.connection.tls_cert.clone(),
        }
    }
}

/// A running relay. Dropping the handle closes it.
#[derive(Debug)]
pub struct ProxyHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl ProxyHandle {
    /// Local address TCP clients should connect to.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stop the relay. Safe to call any number of times.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            debug!(address = %self.address, "Closing tunnel");
        }
    }

    /// Resolves once the relay task has finished tearing down.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.done.borrow()
    }
}

fn tunnel_request(remote_url: &str, token: &str) -> Result<Request> {
    let mut request = remote_url
        .into_client_request()
        .map_err(|e| Error::Tunnel(format!("invalid tunnel URL {remote_url}: {e}")))?;
    let auth = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| Error::Tunnel(format!("token is not a valid header value: {e}")))?;
    request.headers_mut().insert("Authorization", auth);
    Ok(request)
}

/// Bind a local listener and relay its first connection to `remote_url`.
///
/// Returns as soon as the listener is bound.
pub async fn start_tcp_proxy(
    remote_url: &str,
    token: &str,
    options: &TunnelOptions,
) -> Result<ProxyHandle> {
    if cfg!(target_family = "wasm") {
        return Err(Error::Environment(
            "TCP proxy requires raw socket support".to_string(),
        ));
    }

    if options.ping_interval.is_zero() {
        return Err(Error::Config("tunnel ping interval must be non-zero".to_string()));
    }

    let request = tunnel_request(remote_url, token)?;
    let listener = TcpListener::bind((options.host.as_str(), options.port))
        .await
        .map_err(|e| {
            Error::Tunnel(format!(
                "failed to listen on {}:{}: {e}",
                options.host, options.port
            ))
        })?;
    let address = listener
        .local_addr()
        .map_err(|e| Error::Tunnel(format!("failed to obtain listening address: {e}")))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);
    let ping_interval = options.ping_interval;
    let tls_cert = options.tls_cert.clone();
    tokio::spawn(async move {
        run_proxy(listener, request, tls_cert, ping_interval, shutdown_rx).await;
        let _ = done_tx.send(true);
    });

    info!(%address, remote = remote_url, "Tunnel listening");
    Ok(ProxyHandle {
        address,
        shutdown: shutdown_tx,
        done: done_rx,
    })
}

/// Completes on `close()` or when the handle is dropped.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_proxy(
    listener: TcpListener,
    request: Request,
    tls_cert: Option<String>,
    ping_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let accepted = tokio::select! {
        r = listener.accept() => r,
        _ = shutdown_requested(&mut shutdown) => {
            debug!("Tunnel closed before any client connected");
            return;
        }
    };
    // Single client per tunnel
    drop(listener);

    let (tcp, peer) = match accepted {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Tunnel accept failed: {e}");
            return;
        }
    };
    info!(%peer, "Tunnel client connected");

    let ws = tokio::select! {
        r = open_websocket(request, tls_cert.as_deref()) => r,
        _ = shutdown_requested(&mut shutdown) => return,
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Tunnel WebSocket failed: {e:#}");
            return;
        }
    };
    debug!("Tunnel WebSocket open");

    relay(tcp, ws, ping_interval, &mut shutdown).await;
    info!(%peer, "Tunnel closed");
}

type WsSink = SplitSink<WsStream, Message>;

/// TCP chunks out as binary frames, plus the keep-alive ping.
async fn pump_to_remote(tcp_rd: &mut OwnedReadHalf, ws_tx: &mut WsSink, ping_interval: Duration) {
    let mut ping =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            n = tcp_rd.read(&mut buf) => match n {
                Ok(0) => {
                    debug!("Tunnel client closed");
                    return;
                }
                Ok(n) => {
                    let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
                    if let Err(e) = ws_tx.send(frame).await {
                        warn!("Tunnel WebSocket send failed: {e}");
                        return;
                    }
                }
                Err(e) => {
                    warn!("Tunnel client read failed: {e}");
                    return;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = ws_tx.send(Message::Ping(Bytes::new())).await {
                    warn!("Tunnel ping failed: {e}");
                    return;
                }
            }
        }
    }
}

/// Every remote frame written back verbatim.
async fn pump_to_client(ws_rx: &mut SplitStream<WsStream>, tcp_wr: &mut OwnedWriteHalf) {
    while let Some(msg) = ws_rx.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Tunnel WebSocket closed by remote");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Tunnel WebSocket error: {e}");
                return;
            }
        };
        if let Err(e) = tcp_wr.write_all(&data).await {
            warn!("Tunnel client write failed: {e}");
            return;
        }
    }
}

/// Runs both directions independently; whichever ends first tears down both.
async fn relay(
    tcp: TcpStream,
    ws: WsStream,
    ping_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut tcp_rd, mut tcp_wr) = tcp.into_split();
    let (mut ws_tx, mut ws_rx) = ws.split();

    tokio::select! {
        _ = pump_to_remote(&mut tcp_rd, &mut ws_tx, ping_interval) => {}
        _ = pump_to_client(&mut ws_rx, &mut tcp_wr) => {}
        _ = shutdown_requested(shutdown) => debug!("Tunnel close requested"),
    }

    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "close".into(),
    }));
    if let Err(e) = ws_tx.send(close).await {
        debug!("Tunnel WebSocket close: {e}");
    }
    let _ = ws_tx.close().await;
    let _ = tcp_wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{Request as ServerRequest, Response};

    /// One-shot WebSocket endpoint that reports the Authorization header.
    async fn remote_endpoint() -> (
        String,
        tokio::task::JoinHandle<(Option<String>, WebSocketStream<TcpStream>)>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/adb", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut auth = None;
            let ws = accept_hdr_async(stream, |req: &ServerRequest, resp: Response| {
                auth = req
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            })
            .await
            .unwrap();
            (auth, ws)
        });
        (url, server)
    }

    async fn next_data(ws: &mut WebSocketStream<TcpStream>) -> Message {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Ping(_) | Message::Pong(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn tcp_bytes_arrive_as_binary_frame_with_bearer_auth() {
        let (url, server) = remote_endpoint().await;
        let handle = start_tcp_proxy(&url, "tok-123", &TunnelOptions::default())
            .await
            .unwrap();
        assert!(handle.address().ip().is_loopback());

        let mut client = TcpStream::connect(handle.address()).await.unwrap();
        client.write_all(b"PING").await.unwrap();

        let (auth, mut ws) = server.await.unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer tok-123"));
        match next_data(&mut ws).await {
            Message::Binary(data) => assert_eq!(&data[..], b"PING"),
            other => panic!("expected binary frame, got {other:?}"),
        }
        handle.close();
    }

    #[tokio::test]
    async fn remote_frames_are_written_verbatim() {
        let (url, server) = remote_endpoint().await;
        let handle = start_tcp_proxy(&url, "t", &TunnelOptions::default())
            .await
            .unwrap();
        let mut client = TcpStream::connect(handle.address()).await.unwrap();

        let (_, mut ws) = server.await.unwrap();
        ws.send(Message::Binary(Bytes::from_static(b"OKAY"))).await.unwrap();
        ws.send(Message::Text("hi".into())).await.unwrap();

        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OKAYhi");
        handle.close();
    }

    #[tokio::test]
    async fn both_directions_flow_while_client_is_busy_writing() {
        const LEN: usize = 4 * 1024 * 1024;
        let (url, server) = remote_endpoint().await;
        let handle = start_tcp_proxy(&url, "t", &TunnelOptions::default())
            .await
            .unwrap();
        let client = TcpStream::connect(handle.address()).await.unwrap();
        let (_, ws) = server.await.unwrap();
        let (mut ws_tx, mut ws_rx) = ws.split();

        let remote = tokio::spawn(async move {
            let send = async {
                for chunk in vec![7u8; LEN].chunks(64 * 1024) {
                    ws_tx
                        .send(Message::Binary(Bytes::copy_from_slice(chunk)))
                        .await
                        .unwrap();
                }
            };
            let recv = async {
                let mut received = 0;
                while received < LEN {
                    match ws_rx.next().await.unwrap().unwrap() {
                        Message::Binary(data) => received += data.len(),
                        _ => continue,
                    }
                }
                received
            };
            tokio::join!(send, recv).1
        });

        // The client only starts reading once its whole upload is written.
        let transfer = async {
            let (mut rd, mut wr) = client.into_split();
            wr.write_all(&vec![9u8; LEN]).await.unwrap();
            let mut buf = vec![0u8; LEN];
            rd.read_exact(&mut buf).await.unwrap();
            assert!(buf.iter().all(|&b| b == 7));
            (rd, wr)
        };
        let _client = tokio::time::timeout(Duration::from_secs(20), transfer)
            .await
            .expect("relay stalled");
        assert_eq!(remote.await.unwrap(), LEN);
        handle.close();
    }

    #[tokio::test]
    async fn zero_ping_interval_is_rejected() {
        let options = TunnelOptions {
            ping_interval: Duration::ZERO,
            ..TunnelOptions::default()
        };
        match start_tcp_proxy("ws://127.0.0.1:9/adb", "t", &options).await {
            Err(Error::Config(msg)) => assert!(msg.contains("ping interval")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_client_is_refused() {
        let (url, server) = remote_endpoint().await;
        let handle = start_tcp_proxy(&url, "t", &TunnelOptions::default())
            .await
            .unwrap();
        let _first = TcpStream::connect(handle.address()).await.unwrap();
        // The WebSocket only opens after the listener is gone.
        let (_, _ws) = server.await.unwrap();

        assert!(TcpStream::connect(handle.address()).await.is_err());
        handle.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_sends_normal_close() {
        let (url, server) = remote_endpoint().await;
        let handle = start_tcp_proxy(&url, "t", &TunnelOptions::default())
            .await
            .unwrap();
        let mut client = TcpStream::connect(handle.address()).await.unwrap();
        let (_, mut ws) = server.await.unwrap();

        handle.close();
        handle.close();
        handle.closed().await;
        assert!(handle.is_closed());
        handle.close();

        match next_data(&mut ws).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remote_close_tears_down_tcp_side() {
        let (url, server) = remote_endpoint().await;
        let handle = start_tcp_proxy(&url, "t", &TunnelOptions::default())
            .await
            .unwrap();
        let mut client = TcpStream::connect(handle.address()).await.unwrap();
        let (_, mut ws) = server.await.unwrap();

        ws.close(None).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        handle.closed().await;
    }

    #[tokio::test]
    async fn close_before_any_client_stops_listening() {
        let handle = start_tcp_proxy("ws://127.0.0.1:9/adb", "t", &TunnelOptions::default())
            .await
            .unwrap();
        let address = handle.address();
        handle.close();
        handle.closed().await;
        assert!(TcpStream::connect(address).await.is_err());
    }

    #[tokio::test]
    async fn dropping_handle_closes_tunnel() {
        let handle = start_tcp_proxy("ws://127.0.0.1:9/adb", "t", &TunnelOptions::default())
            .await
            .unwrap();
        let address = handle.address();
        let mut done = handle.done.clone();
        drop(handle);
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
        assert!(TcpStream::connect(address).await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_descriptive() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let options = TunnelOptions {
            port: taken.local_addr().unwrap().port(),
            ..TunnelOptions::default()
        };
        match start_tcp_proxy("ws://127.0.0.1:9/adb", "t", &options).await {
            Err(Error::Tunnel(msg)) => assert!(msg.contains("failed to listen")),
            other => panic!("expected Tunnel error, got {other:?}"),
        }
    }

    #[test]
    fn request_carries_bearer_header() {
        let request = tunnel_request("wss://host/adb", "abc").unwrap();
        assert_eq!(request.headers()["Authorization"], "Bearer abc");
        assert!(tunnel_request("not a url", "abc").is_err());
    }
}
