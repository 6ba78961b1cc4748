use crate::config::ChannelConfig;
use crate::envelope::{self, Inbound};
use crate::error::ChannelError;
use crate::ingest::AudioFragment;
use crate::output::AudioOutput;
use crate::playback::{PlaybackEngine, PlaybackHandle};
use crate::reconnect::ReconnectPolicy;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Sleep};
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

const LOG: &str = "voicelink::connection";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;
type WsReader = SplitStream<WsStream>;
type HandshakeResult =
    Result<(WsStream, tungstenite::handshake::client::Response), tungstenite::Error>;
type ConnectFuture =
    Pin<Box<dyn Future<Output = Result<HandshakeResult, tokio::time::error::Elapsed>> + Send>>;
type ReconnectTimer = Pin<Box<Sleep>>;

/// Lifecycle of the single channel instance. Exactly one connection may
/// be Connecting or Open at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Events published to the external status/message consumer.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    State(ConnectionState),
    /// Latest textual message from the service.
    Text(String),
}

#[derive(Debug)]
enum Command {
    Connect,
    SendText(Value),
    SendMedia(Vec<u8>),
    SendBinary(Vec<u8>),
    Interrupt,
    Shutdown,
}

/// Handle to a running channel. All operations are fire-and-forget; the
/// outbound path is deliberately lossy when the channel is not open.
#[derive(Debug, Clone)]
pub struct Channel {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Channel {
    /// Spawn the connection manager and playback engine tasks. Returns the
    /// handle plus the event stream for the status/message consumer.
    pub fn spawn(
        config: ChannelConfig,
        output: Box<dyn AudioOutput>,
    ) -> (Channel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (engine, playback) = PlaybackEngine::new(output, config.poll_interval);
        tokio::spawn(engine.run());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let manager = ChannelManager {
            config,
            cmd_rx,
            event_tx,
            state_tx,
            playback,
        };
        tokio::spawn(manager.run());
        (Channel { cmd_tx, state_rx }, event_rx)
    }

    /// Open the channel. No-op while already Connecting or Open.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Serialize and transmit as a text frame iff the channel is Open;
    /// otherwise dropped with a log line. No queue, no retry.
    pub fn send_message(&self, payload: Value) {
        let _ = self.cmd_tx.send(Command::SendText(payload));
    }

    /// Frame one media fragment in the outbound envelope shape. Same
    /// open-only/drop-if-not-open contract as `send_message`.
    pub fn send_media_chunk(&self, data: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::SendMedia(data));
    }

    /// Send a pre-serialized payload as a binary frame, bypassing JSON
    /// framing. Same open-only gate.
    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::SendBinary(data));
    }

    /// Stop active playback and discard queued audio immediately.
    pub fn interrupt(&self) {
        let _ = self.cmd_tx.send(Command::Interrupt);
    }

    /// Close the channel and cancel all pending timers.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Owns the channel instance, its lifecycle transitions, and the pending
/// timers. Runs as a single task; all state lives on this loop.
struct ChannelManager {
    config: ChannelConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    state_tx: watch::Sender<ConnectionState>,
    playback: PlaybackHandle,
}

impl ChannelManager {
    async fn run(self) {
        let ChannelManager {
            config,
            mut cmd_rx,
            event_tx,
            state_tx,
            playback,
        } = self;

        let mut state = ConnectionState::Disconnected;
        let mut sink: Option<WsSink> = None;
        let mut reader: Option<WsReader> = None;
        let mut connecting: Option<ConnectFuture> = None;
        // Single-instance timer: arming it again replaces the old one.
        let mut reconnect_timer: Option<ReconnectTimer> = None;
        let mut policy = ReconnectPolicy::new(config.reconnect_base, config.reconnect_max);
        let mut keepalive = tokio::time::interval(config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Connect) => {
                            if state == ConnectionState::Connecting || state == ConnectionState::Open {
                                log::info!(target: LOG, "connect ignored: already {:?}", state);
                            } else {
                                reconnect_timer = None;
                                match begin_connect(&config) {
                                    Ok(fut) => {
                                        log::info!(target: LOG, "connecting to {}", config.url);
                                        connecting = Some(fut);
                                        state = ConnectionState::Connecting;
                                        publish(&state_tx, &event_tx, state);
                                    }
                                    Err(e) => {
                                        log::error!(target: LOG, "cannot build connection request: {}", e);
                                        arm_reconnect(&mut policy, &mut reconnect_timer);
                                    }
                                }
                            }
                        }
                        Some(Command::SendText(payload)) => {
                            send_text(&mut sink, state, payload).await;
                        }
                        Some(Command::SendMedia(data)) => {
                            let payload = envelope::media_chunk_message(&config.mime_type, &data);
                            send_text(&mut sink, state, payload).await;
                        }
                        Some(Command::SendBinary(data)) => {
                            if state == ConnectionState::Open {
                                if let Some(ws) = sink.as_mut() {
                                    if let Err(e) = ws.send(tungstenite::Message::Binary(data)).await {
                                        log::warn!(target: LOG, "binary send failed: {}", e);
                                    }
                                }
                            } else {
                                log::debug!(target: LOG, "dropping outbound binary: channel is {:?}", state);
                            }
                        }
                        Some(Command::Interrupt) => playback.flush(),
                        Some(Command::Shutdown) | None => break,
                    }
                }
                result = await_connect(&mut connecting), if connecting.is_some() => {
                    connecting = None;
                    match result {
                        Ok(Ok((stream, _response))) => {
                            log::info!(target: LOG, "channel open");
                            let (tx, rx) = stream.split();
                            sink = Some(tx);
                            reader = Some(rx);
                            state = ConnectionState::Open;
                            publish(&state_tx, &event_tx, state);
                            policy.reset();
                            reconnect_timer = None;
                            keepalive.reset();
                            // One-time handshake. A send failure here is a
                            // transport fault; the reader surfaces it.
                            let setup = envelope::setup_message(&config.setup);
                            if let Some(ws) = sink.as_mut() {
                                if let Err(e) = ws
                                    .send(tungstenite::Message::Text(setup.to_string()))
                                    .await
                                {
                                    log::warn!(target: LOG, "failed to send setup: {}", e);
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            log::warn!(target: LOG, "connect failed: {}", e);
                            state = ConnectionState::Disconnected;
                            publish(&state_tx, &event_tx, state);
                            arm_reconnect(&mut policy, &mut reconnect_timer);
                        }
                        Err(_elapsed) => {
                            // Dropping the future aborts the handshake.
                            log::warn!(
                                target: LOG,
                                "connect timed out after {:?}",
                                config.connect_timeout
                            );
                            state = ConnectionState::Disconnected;
                            publish(&state_tx, &event_tx, state);
                            arm_reconnect(&mut policy, &mut reconnect_timer);
                        }
                    }
                }
                _ = await_timer(&mut reconnect_timer), if reconnect_timer.is_some() => {
                    reconnect_timer = None;
                    if state == ConnectionState::Disconnected {
                        match begin_connect(&config) {
                            Ok(fut) => {
                                log::info!(
                                    target: LOG,
                                    "reconnecting to {} (attempt {})",
                                    config.url,
                                    policy.attempts()
                                );
                                connecting = Some(fut);
                                state = ConnectionState::Connecting;
                                publish(&state_tx, &event_tx, state);
                            }
                            Err(e) => {
                                log::error!(target: LOG, "cannot build connection request: {}", e);
                                arm_reconnect(&mut policy, &mut reconnect_timer);
                            }
                        }
                    }
                }
                frame = next_frame(&mut reader), if reader.is_some() => {
                    let mut lost = false;
                    match frame {
                        Some(Ok(tungstenite::Message::Text(raw))) => {
                            match envelope::dispatch(&raw) {
                                Ok(actions) => {
                                    for action in actions {
                                        match action {
                                            Inbound::Interrupt => {
                                                log::info!(target: LOG, "server interrupt");
                                                playback.flush();
                                            }
                                            Inbound::Text(text) => {
                                                let _ = event_tx.send(ChannelEvent::Text(text));
                                            }
                                            Inbound::Audio(bytes) => {
                                                playback.push(AudioFragment::new(bytes));
                                            }
                                        }
                                    }
                                }
                                // Local recoverable error; the channel
                                // stays open.
                                Err(e) => log::warn!(target: LOG, "dropping malformed message: {}", e),
                            }
                        }
                        Some(Ok(tungstenite::Message::Binary(bytes))) => {
                            // Raw frames bypass JSON framing: one fragment.
                            playback.push(AudioFragment::new(bytes));
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            match frame {
                                Some(f) => log::info!(target: LOG, "channel closed: {} {}", f.code, f.reason),
                                None => log::info!(target: LOG, "channel closed"),
                            }
                            lost = true;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!(target: LOG, "channel error: {}", e);
                            lost = true;
                        }
                        None => lost = true,
                    }
                    if lost {
                        sink = None;
                        reader = None;
                        state = ConnectionState::Disconnected;
                        publish(&state_tx, &event_tx, state);
                        arm_reconnect(&mut policy, &mut reconnect_timer);
                    }
                }
                _ = keepalive.tick(), if config.keepalive.is_some() && state == ConnectionState::Open => {
                    if let (Some(msg), Some(ws)) = (config.keepalive.as_ref(), sink.as_mut()) {
                        log::debug!(target: LOG, "keepalive");
                        let _ = ws.send(tungstenite::Message::Text(msg.to_string())).await;
                    }
                }
            }
        }

        // Teardown: no orphaned timers or connections outlive the manager.
        log::info!(target: LOG, "shutting down channel");
        drop(connecting);
        drop(reconnect_timer);
        drop(reader);
        if let Some(mut ws) = sink.take() {
            state = ConnectionState::Closing;
            publish(&state_tx, &event_tx, state);
            let _ = ws.close().await;
        }
        playback.shutdown();
        state = ConnectionState::Disconnected;
        publish(&state_tx, &event_tx, state);
    }
}

fn publish(
    state_tx: &watch::Sender<ConnectionState>,
    event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    next: ConnectionState,
) {
    let _ = state_tx.send(next);
    let _ = event_tx.send(ChannelEvent::State(next));
}

/// Arm (or replace) the reconnect timer per the backoff policy.
fn arm_reconnect(policy: &mut ReconnectPolicy, timer: &mut Option<ReconnectTimer>) {
    policy.record_failure();
    let delay = policy.delay();
    log::info!(
        target: LOG,
        "reconnect in {:?} (attempt {})",
        delay,
        policy.attempts()
    );
    *timer = Some(Box::pin(sleep(delay)));
}

/// Start the handshake, bounded by the connection timeout.
fn begin_connect(config: &ChannelConfig) -> Result<ConnectFuture, ChannelError> {
    let request = build_request(config)?;
    Ok(Box::pin(timeout(
        config.connect_timeout,
        connect_async(request),
    )))
}

fn build_request(config: &ChannelConfig) -> Result<tungstenite::http::Request<()>, ChannelError> {
    let uri: tungstenite::http::Uri = config
        .url
        .parse()
        .map_err(tungstenite::http::Error::from)?;
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default();

    let mut request = tungstenite::http::Request::builder()
        .uri(uri)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        );

    let has_host = config
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("host"));
    if !has_host {
        request = request.header("Host", host);
    }
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    Ok(request.body(())?)
}

async fn await_connect(
    connecting: &mut Option<ConnectFuture>,
) -> Result<HandshakeResult, tokio::time::error::Elapsed> {
    match connecting.as_mut() {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn await_timer(timer: &mut Option<ReconnectTimer>) {
    match timer.as_mut() {
        Some(t) => t.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    reader: &mut Option<WsReader>,
) -> Option<Result<tungstenite::Message, tungstenite::Error>> {
    match reader.as_mut() {
        Some(r) => r.next().await,
        None => std::future::pending().await,
    }
}

async fn send_text(sink: &mut Option<WsSink>, state: ConnectionState, payload: Value) {
    if state == ConnectionState::Open {
        if let Some(ws) = sink.as_mut() {
            if let Err(e) = ws
                .send(tungstenite::Message::Text(payload.to_string()))
                .await
            {
                log::warn!(target: LOG, "send failed: {}", e);
            }
        }
    } else {
        log::debug!(target: LOG, "dropping outbound message: channel is {:?}", state);
    }
}
