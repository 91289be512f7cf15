//! Remote-control session.
//!
//! A session is created by [`create_instance_client`], which connects the
//! signaling socket, fetches the peer configuration and sends the offer. From
//! then on a single driver task owns the socket and reacts to server messages,
//! transport events, caller commands and the keep-alive timer, in that one
//! `select!` loop. The [`Session`] handle only talks to the driver through a
//! channel, so messages on one connection are handled strictly in order.

use crate::adb::{ProcessRunner, TokioProcessRunner, adb_connect};
use crate::config::{ClientConfig, ScreenshotTransport};
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::peer::WebRtcTransportFactory;
use crate::signaling::{self, WsStream};
use crate::transport::{MediaTransport, PeerState, TransportEvent, TransportFactory};
use crate::tunnel::{ProxyHandle, TunnelOptions, start_tcp_proxy};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use droidlink_protocol::{
    ClientMessage, ControlMessage, Inbound, KeyEvent, ServerMessage, TouchEvent,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Signaling handshake in progress
    Connecting,
    /// Offer sent, waiting for the control channel
    Negotiating,
    /// Control channel open
    Ready,
    Closed,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

/// A captured screen, as a `data:image/png;base64,...` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub data_uri: String,
}

impl Screenshot {
    /// Decode the PNG bytes out of the data URI.
    pub fn png_bytes(&self) -> Result<Vec<u8>> {
        let (_, payload) = self
            .data_uri
            .split_once(";base64,")
            .ok_or_else(|| Error::Protocol("screenshot is not a base64 data URI".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::Protocol(format!("invalid screenshot payload: {e}")))
    }
}

/// Everything needed to open a session. Fixed once the session exists.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub webrtc_url: String,
    pub adb_url: Option<String>,
    pub token: String,
    pub tls_cert: Option<String>,
    pub connect_timeout: Duration,
    pub rtc_config_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub screenshot_timeout: Duration,
    pub screenshot_transport: ScreenshotTransport,
    pub prefer_h264: bool,
    /// Opened on the device as soon as the control channel is up
    pub open_url: Option<String>,
    pub tunnel: TunnelOptions,
    pub adb_path: String,
}

impl SessionOptions {
    pub fn new(webrtc_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            webrtc_url: webrtc_url.into(),
            adb_url: None,
            token: token.into(),
            tls_cert: None,
            connect_timeout: Duration::from_secs(5),
            rtc_config_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(10),
            screenshot_timeout: Duration::from_secs(30),
            screenshot_transport: ScreenshotTransport::Signaling,
            prefer_h264: true,
            open_url: None,
            tunnel: TunnelOptions::default(),
            adb_path: "adb".to_string(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let webrtc_url = config
            .connection
            .webrtc_url
            .clone()
            .ok_or_else(|| Error::Config("connection.webrtc_url is not set".to_string()))?;
        let token = config.connection.token.clone().ok_or_else(|| {
            Error::Config(format!(
                "no token: set connection.token or {}",
                crate::config::TOKEN_ENV
            ))
        })?;

        Ok(Self {
            webrtc_url,
            adb_url: config.connection.adb_url.clone(),
            token,
            tls_cert: config.connection.tls_cert.clone(),
            connect_timeout: config.session.connect_timeout(),
            rtc_config_timeout: config.session.rtc_config_timeout(),
            keep_alive_interval: config.session.keep_alive_interval(),
            screenshot_timeout: config.session.screenshot_timeout(),
            screenshot_transport: config.session.screenshot_transport,
            prefer_h264: config.session.prefer_h264,
            open_url: config.session.open_url.clone(),
            tunnel: TunnelOptions::from_config(config),
            adb_path: config.tunnel.adb_path.clone(),
        })
    }
}

/// Percent-decode, keeping the raw string if it does not decode.
fn decode_url(url: &str) -> String {
    match urlencoding::decode(url) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            debug!(url, "URL did not percent-decode, sending as is: {e}");
            url.to_string()
        }
    }
}

enum Command {
    Signal(ClientMessage, oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
}

/// Why the driver loop stopped.
enum Exit {
    Closed(String),
    Failed(String),
}

/// Handle to a live session. Dropping it tears the session down.
pub struct Session {
    id: String,
    options: SessionOptions,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<SessionState>>,
    connected: Arc<AtomicBool>,
    foreground: watch::Sender<bool>,
    transport: Arc<dyn MediaTransport>,
    screenshots: Correlator<Screenshot>,
    runner: Arc<dyn ProcessRunner>,
}

/// Connect with the WebRTC transport and the host's process runner.
pub async fn create_instance_client(options: SessionOptions) -> Result<Session> {
    let factory = WebRtcTransportFactory {
        prefer_h264: options.prefer_h264,
    };
    create_instance_client_with(options, Arc::new(factory), Arc::new(TokioProcessRunner)).await
}

/// Returns once the offer is out; the session reaches Ready when the control
/// channel opens (see [`Session::wait_ready`]).
pub async fn create_instance_client_with(
    options: SessionOptions,
    factory: Arc<dyn TransportFactory>,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Session> {
    if options.keep_alive_interval.is_zero() {
        return Err(Error::Config("keep-alive interval must be non-zero".to_string()));
    }
    let session_id = uuid::Uuid::new_v4().to_string();
    let (state, _) = watch::channel(SessionState::Connecting);
    let state = Arc::new(state);
    info!(%session_id, url = %options.webrtc_url, "Creating session");

    let mut ws = signaling::connect(
        &options.webrtc_url,
        &options.token,
        options.tls_cert.as_deref(),
        options.connect_timeout,
    )
    .await?;
    let rtc_configuration =
        signaling::request_rtc_configuration(&mut ws, &session_id, options.rtc_config_timeout)
            .await?;
    state.send_replace(SessionState::Negotiating);
    debug!(
        ice_servers = rtc_configuration.ice_servers.len(),
        "Received RTC configuration"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn MediaTransport> =
        Arc::from(factory.open(&rtc_configuration, events_tx).await?);

    let offer = async {
        let sdp = transport.create_offer().await?;
        signaling::send_json(
            &mut ws,
            &ClientMessage::Offer {
                sdp,
                session_id: session_id.clone(),
            },
        )
        .await
    };
    if let Err(e) = offer.await {
        if let Err(close) = transport.close().await {
            debug!("Transport close: {close}");
        }
        return Err(e);
    }
    info!(%session_id, "Offer sent");

    let screenshots = Correlator::new("ss", "screenshot request", options.screenshot_timeout);
    let connected = Arc::new(AtomicBool::new(false));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (foreground_tx, foreground_rx) = watch::channel(true);
    let (ws_tx, ws_rx) = ws.split();

    let driver = Driver {
        session_id: session_id.clone(),
        ws_tx,
        transport: Arc::clone(&transport),
        screenshots: screenshots.clone(),
        state: Arc::clone(&state),
        connected: Arc::clone(&connected),
        open_url: options.open_url.clone(),
    };
    let keep_alive = options.keep_alive_interval;
    tokio::spawn(driver.run(ws_rx, events_rx, commands_rx, foreground_rx, keep_alive));

    Ok(Session {
        id: session_id,
        options,
        commands: commands_tx,
        state,
        connected,
        foreground: foreground_tx,
        transport,
        screenshots,
        runner,
    })
}

impl Session {
    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// True while the peer connection reports connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Wait until the control channel is open.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s == SessionState::Ready || s.is_terminal())
                .await
                .map(|s| s.clone())
        })
        .await;

        match reached {
            Ok(Ok(SessionState::Ready)) => Ok(()),
            Ok(Ok(SessionState::Failed(reason))) => Err(Error::Connection(reason)),
            Ok(_) => Err(Error::Closed("session closed before it was ready".to_string())),
            Err(_) => Err(Error::Timeout {
                what: "session ready",
                after: timeout,
            }),
        }
    }

    fn require_ready(&self) -> Result<()> {
        if *self.state.borrow() == SessionState::Ready {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Hand a message to the driver and wait until it is on the socket.
    async fn signal(&self, msg: ClientMessage) -> Result<()> {
        let (ack, sent) = oneshot::channel();
        self.commands
            .send(Command::Signal(msg, ack))
            .map_err(|_| Error::NotConnected)?;
        sent.await
            .map_err(|_| Error::Closed("session driver stopped".to_string()))?
    }

    /// Capture the device screen.
    pub async fn screenshot(&self) -> Result<Screenshot> {
        self.require_ready()?;
        let via = self.options.screenshot_transport;
        self.screenshots
            .send(|id| async move {
                let request = ClientMessage::Screenshot { id };
                match via {
                    ScreenshotTransport::Signaling => self.signal(request).await,
                    ScreenshotTransport::DataChannel => {
                        let text = serde_json::to_string(&request)
                            .map_err(|e| Error::Protocol(e.to_string()))?;
                        self.transport.send_text(&text).await
                    }
                }
            })
            .await
    }

    /// Open a URL on the device.
    pub async fn open_url(&self, url: &str) -> Result<()> {
        self.require_ready()?;
        self.signal(ClientMessage::OpenUrl {
            url: decode_url(url),
            session_id: self.id.clone(),
        })
        .await
    }

    async fn send_control(&self, msg: ControlMessage) {
        if !self.transport.channel_open() {
            debug!(kind = msg.type_tag(), "Control channel not open, dropping message");
            return;
        }
        if let Err(e) = self.transport.send_control(Bytes::from(msg.encode())).await {
            debug!(kind = msg.type_tag(), "Control message not sent: {e}");
        }
    }

    /// Inject a key event. Unmapped keys are dropped.
    pub async fn send_key_event(&self, event: &KeyEvent) {
        match event.to_control_message() {
            Some(msg) => self.send_control(msg).await,
            None => debug!(code = %event.code, "Dropping unmapped key"),
        }
    }

    /// Key down immediately followed by key up.
    pub async fn press_key(&self, code: &str) {
        self.send_key_event(&KeyEvent::down(code)).await;
        self.send_key_event(&KeyEvent::up(code)).await;
    }

    pub async fn send_touch(&self, event: TouchEvent) {
        self.send_control(ControlMessage::InjectTouchEvent(event)).await;
    }

    pub async fn inject_text(&self, text: &str) {
        self.send_control(ControlMessage::InjectText {
            text: text.to_string(),
        })
        .await;
    }

    /// Put `text` on the device clipboard and paste it.
    pub async fn paste_text(&self, text: &str) {
        self.send_control(ControlMessage::SetClipboard {
            text: text.to_string(),
            paste: true,
        })
        .await;
    }

    /// Keep-alives only run while the host is in the foreground.
    pub fn set_foreground(&self, visible: bool) {
        self.foreground.send_replace(visible);
    }

    /// Tunnel a local port to the instance's ADB endpoint and `adb connect` to it.
    pub async fn start_adb_tunnel(&self) -> Result<ProxyHandle> {
        let adb_url = self
            .options
            .adb_url
            .as_deref()
            .ok_or_else(|| Error::Config("session has no adb url".to_string()))?;
        let handle = start_tcp_proxy(adb_url, &self.options.token, &self.options.tunnel).await?;
        let adb_path = &self.options.adb_path;
        if let Err(e) = adb_connect(self.runner.as_ref(), adb_path, handle.address()).await {
            handle.close();
            return Err(e);
        }
        Ok(handle)
    }

    /// Close everything and reject pending requests. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if self.state.send_replace(SessionState::Closed) != SessionState::Closed {
            info!(session_id = %self.id, "Disconnecting");
        }
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
        self.screenshots.fail_all("disconnected");
    }
}

struct Driver {
    session_id: String,
    ws_tx: SplitSink<WsStream, Message>,
    transport: Arc<dyn MediaTransport>,
    screenshots: Correlator<Screenshot>,
    state: Arc<watch::Sender<SessionState>>,
    connected: Arc<AtomicBool>,
    open_url: Option<String>,
}

impl Driver {
    async fn run(
        mut self,
        mut ws_rx: SplitStream<WsStream>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut foreground: watch::Receiver<bool>,
        keep_alive_interval: Duration,
    ) {
        let mut keep_alive =
            tokio::time::interval_at(Instant::now() + keep_alive_interval, keep_alive_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut foreground_open = true;
        let mut events_open = true;
        let mut disconnect_ack = None;

        let exit = loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(exit) = self.dispatch_text(&text).await {
                            break exit;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Signaling socket closed by server");
                        break Exit::Closed("disconnected from server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Exit::Failed(format!("signaling socket error: {e}")),
                    None => break Exit::Closed("disconnected from server".to_string()),
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if let Some(exit) = self.on_transport_event(event).await {
                            break exit;
                        }
                    }
                    None => events_open = false,
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Signal(msg, ack)) => {
                        let _ = ack.send(self.send(&msg).await);
                    }
                    Some(Command::Disconnect(ack)) => {
                        disconnect_ack = Some(ack);
                        break Exit::Closed("disconnected".to_string());
                    }
                    None => break Exit::Closed("session dropped".to_string()),
                },
                _ = keep_alive.tick(), if *foreground.borrow() => {
                    let msg = ClientMessage::KeepAlive { session_id: self.session_id.clone() };
                    if let Err(e) = self.send(&msg).await {
                        warn!("Keep-alive failed: {e}");
                    }
                }
                changed = foreground.changed(), if foreground_open => match changed {
                    Ok(()) => {
                        if *foreground.borrow_and_update() {
                            debug!("Foreground, resuming keep-alive");
                            keep_alive.reset();
                        } else {
                            debug!("Background, suspending keep-alive");
                        }
                    }
                    Err(_) => foreground_open = false,
                },
            }
        };

        self.teardown(exit).await;
        if let Some(ack) = disconnect_ack {
            let _ = ack.send(());
        }
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        signaling::send_json(&mut self.ws_tx, msg).await
    }

    async fn dispatch_text(&mut self, text: &str) -> Option<Exit> {
        match ServerMessage::parse(text) {
            Ok(Inbound::Message(msg)) => self.dispatch(msg).await,
            Ok(Inbound::Unknown(kind)) => {
                warn!(%kind, "Received unexpected message type");
                None
            }
            Err(e) => {
                warn!("Dropping malformed message: {e}");
                None
            }
        }
    }

    /// Every server message, whichever channel it came in on, lands here.
    async fn dispatch(&mut self, msg: ServerMessage) -> Option<Exit> {
        match msg {
            ServerMessage::RtcConfiguration { .. } => {
                debug!("Ignoring rtcConfiguration after negotiation started");
            }
            ServerMessage::Answer { sdp, .. } => {
                debug!("Received SDP answer");
                if let Err(e) = self.transport.apply_answer(&sdp).await {
                    return Some(Exit::Failed(format!("failed to apply answer: {e}")));
                }
            }
            ServerMessage::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                let candidate = droidlink_protocol::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                    warn!("Failed to add ICE candidate: {e}");
                }
            }
            ServerMessage::Screenshot { id, data_uri } => {
                debug!(%id, "Received screenshot");
                self.screenshots.resolve(&id, Screenshot { data_uri });
            }
            ServerMessage::ScreenshotError { id, message } => {
                error!(%id, "Server failed to capture screenshot: {message}");
                self.screenshots.reject(&id, message);
            }
        }
        None
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Option<Exit> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let msg = candidate.into_message(&self.session_id);
                if let Err(e) = self.send(&msg).await {
                    warn!("Failed to send ICE candidate: {e}");
                }
            }
            TransportEvent::ConnectionState(state) => {
                self.connected
                    .store(state == PeerState::Connected, Ordering::Relaxed);
                if state == PeerState::Failed {
                    return Some(Exit::Failed("peer connection failed".to_string()));
                }
            }
            TransportEvent::ChannelOpen => {
                let became_ready = self.state.send_if_modified(|s| {
                    if *s == SessionState::Negotiating {
                        *s = SessionState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if !became_ready {
                    return None;
                }
                info!(session_id = %self.session_id, "Session ready");

                let request_frame = ClientMessage::RequestFrame {
                    session_id: self.session_id.clone(),
                };
                if let Err(e) = self.send(&request_frame).await {
                    warn!("Failed to request first frame: {e}");
                }
                if let Some(url) = self.open_url.take() {
                    let msg = ClientMessage::OpenUrl {
                        url: decode_url(&url),
                        session_id: self.session_id.clone(),
                    };
                    if let Err(e) = self.send(&msg).await {
                        warn!("Failed to open URL: {e}");
                    }
                }
            }
            TransportEvent::ChannelClosed => {
                if *self.state.borrow() == SessionState::Ready {
                    return Some(Exit::Closed("control channel closed".to_string()));
                }
            }
            TransportEvent::ChannelMessage(text) => return self.dispatch_text(&text).await,
            TransportEvent::Track(kind) => debug!(%kind, "Remote track added"),
        }
        None
    }

    /// Signaling socket first, then the peer connection, then pending requests.
    async fn teardown(mut self, exit: Exit) {
        let (next, reason) = match exit {
            Exit::Closed(reason) => (SessionState::Closed, reason),
            Exit::Failed(reason) => (SessionState::Failed(reason.clone()), reason),
        };
        let changed = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            info!(session_id = %self.session_id, %reason, "Session ended");
        }

        if let Err(e) = self.ws_tx.send(Message::Close(None)).await {
            debug!("Signaling close: {e}");
        }
        if let Err(e) = self.ws_tx.close().await {
            debug!("Signaling sink close: {e}");
        }
        if let Err(e) = self.transport.close().await {
            debug!("Transport close: {e}");
        }
        self.connected.store(false, Ordering::Relaxed);
        self.screenshots.fail_all(&reason);
    }
}
