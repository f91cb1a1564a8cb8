//! Connection Manager
//!
//! Owns the WebSocket connection to one capture server: opening it, reading
//! messages, keep-alive, and reconnecting with exponential backoff.
//!
//! Every way a connection can end (clean close, transport error, failed
//! open) goes through the same path to `Disconnected`, and reconnect
//! scheduling only happens there. `disconnect(false)` cancels the supervisor
//! task, which also cancels any armed reconnect timer.

use super::events::{ConnectionEvent, ConnectionState};
use crate::protocol::message::{PING, PONG};
use crate::protocol::{OutboundMessage, RawMessage};
use crate::recovery::{
    ReconnectionStrategy, INITIAL_RECONNECT_DELAY, MAX_RECONNECT_ATTEMPTS, MAX_RECONNECT_DELAY,
};
use crate::router::AckForwarder;
use crate::{Result, StreamError};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Keep-alive interval (send ping every 30 seconds)
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for the close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands that can be sent to the connection task
#[derive(Debug)]
enum ConnectionCommand {
    /// Send a message
    Send(OutboundMessage),
    /// Close the current connection; the supervisor decides what happens next
    Close,
}

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Reconnect after a drop or a failed open
    pub reconnect: bool,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// `None` disables the periodic ping
    pub keep_alive_interval: Option<Duration>,
    /// Sent once on every successful open
    pub hello_message: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_base_delay: INITIAL_RECONNECT_DELAY,
            reconnect_max_delay: MAX_RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            keep_alive_interval: Some(KEEP_ALIVE_INTERVAL),
            hello_message: Some(format!("camstream {} connected", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl ConnectionConfig {
    fn strategy(&self) -> ReconnectionStrategy {
        ReconnectionStrategy::with_limits(
            self.reconnect_base_delay,
            self.reconnect_max_delay,
            self.max_reconnect_attempts,
        )
    }
}

/// Traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub binary_messages: u64,
    pub text_messages: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    /// Successful opens
    pub connects: u64,
    pub reconnect_attempts: u64,
}

#[derive(Default)]
struct Counters {
    binary_messages: AtomicU64,
    text_messages: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    connects: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            binary_messages: self.binary_messages.load(Ordering::Relaxed),
            text_messages: self.text_messages.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the manager, its handles and the supervisor task
struct Shared {
    state: RwLock<ConnectionState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<ConnectionCommand>>>,
    counters: Counters,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *current == state {
                return;
            }
            debug!("Connection state {} -> {}", *current, state);
            *current = state;
        }
        self.emit(ConnectionEvent::StateChanged { state });
    }

    fn send_command(&self, command: ConnectionCommand) -> Result<()> {
        let guard = lock(&self.command_tx);
        let tx = guard.as_ref().ok_or(StreamError::NotConnected)?;
        tx.send(command).map_err(|_| StreamError::NotConnected)
    }
}

/// Cheap, cloneable sender for the current connection
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Queue a message for the open connection
    ///
    /// Never waits; fails with `NotConnected` when no connection is open.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.shared.send_command(ConnectionCommand::Send(message))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl AckForwarder for ConnectionHandle {
    fn forward_ack(&self, camera_id: &str, frame_number: u64) {
        if let Err(e) = self.send(OutboundMessage::frame_ack(camera_id, frame_number)) {
            debug!(
                "Dropping ack for camera {} frame {}: {}",
                camera_id, frame_number, e
            );
        }
    }
}

struct Supervisor {
    url: String,
    task: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

/// Why a single connection ended
enum CloseReason {
    /// `disconnect(false)` or teardown
    Cancelled,
    /// `disconnect(true)`
    Requested,
    /// Server closed the stream
    Remote(Option<String>),
    /// Transport error
    Failed(String),
}

/// Resilient streaming connection to one server endpoint
pub struct ConnectionManager {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                subscribers: Mutex::new(Vec::new()),
                command_tx: Mutex::new(None),
                counters: Counters::default(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.counters.snapshot()
    }

    /// URL of the active supervisor, if any
    pub fn url(&self) -> Option<String> {
        lock(&self.supervisor).as_ref().map(|s| s.url.clone())
    }

    /// Start connecting to `url`
    ///
    /// Returns once the supervisor task is running; progress is reported
    /// through [`subscribe`](Self::subscribe). Connecting to the URL that is
    /// already active is a no-op; a different URL replaces the old
    /// connection.
    pub async fn connect(&self, url: &str) -> Result<()> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(StreamError::Configuration(format!(
                "not a websocket URL: {}",
                url
            )));
        }

        let replace = {
            let supervisor = lock(&self.supervisor);
            match supervisor.as_ref() {
                Some(s) if s.url == url && !s.task.is_finished() => {
                    debug!("Already connected or connecting to {}", url);
                    return Ok(());
                }
                Some(_) => true,
                None => false,
            }
        };
        if replace {
            self.disconnect(false).await;
        }

        info!("Connecting to {}", url);
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            url.to_string(),
            self.config.clone(),
            self.shared.clone(),
            cancel_rx,
        ));

        *lock(&self.supervisor) = Some(Supervisor {
            url: url.to_string(),
            task,
            cancel,
        });
        Ok(())
    }

    /// Close the connection
    ///
    /// With `should_reconnect` the current connection is closed and the
    /// normal reconnect policy applies. Without it the supervisor is stopped
    /// and any pending reconnect timer is cancelled; when this returns the
    /// state is `Disconnected`.
    pub async fn disconnect(&self, should_reconnect: bool) {
        if should_reconnect {
            info!("Closing connection, reconnect allowed");
            if self.shared.send_command(ConnectionCommand::Close).is_err() {
                debug!("No open connection to close");
            }
            return;
        }

        let Some(supervisor) = lock(&self.supervisor).take() else {
            self.shared.set_state(ConnectionState::Disconnected);
            return;
        };

        info!("Disconnecting from {}", supervisor.url);
        let _ = supervisor.cancel.send(true);

        let mut task = supervisor.task;
        if tokio::time::timeout(CLOSE_TIMEOUT * 2, &mut task).await.is_err() {
            warn!("Connection task did not stop in time, aborting");
            task.abort();
        }

        *lock(&self.shared.command_tx) = None;
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Queue a message for the open connection
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.shared.send_command(ConnectionCommand::Send(message))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = lock(&self.supervisor).take() {
            let _ = supervisor.cancel.send(true);
            supervisor.task.abort();
        }
    }
}

/// Connect, read, and reconnect until cancelled or out of attempts
async fn supervise(
    url: String,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut strategy = config.strategy();

    loop {
        shared.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = cancel.changed() => break,
        };

        let reason = match opened {
            Ok((stream, _response)) => {
                strategy.reset();
                Counters::bump(&shared.counters.connects, 1);
                info!("Connected to {}", url);

                let (command_tx, command_rx) = mpsc::unbounded_channel();
                *lock(&shared.command_tx) = Some(command_tx);
                shared.set_state(ConnectionState::Connected);
                shared.emit(ConnectionEvent::Connected { url: url.clone() });

                let reason = run_connection(stream, &config, &shared, command_rx, &mut cancel).await;
                *lock(&shared.command_tx) = None;
                reason
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", url, e);
                CloseReason::Failed(e.to_string())
            }
        };

        let (message, cancelled) = match reason {
            CloseReason::Cancelled => (Some("disconnect requested".to_string()), true),
            CloseReason::Requested => (Some("reconnect requested".to_string()), false),
            CloseReason::Remote(reason) => (reason, false),
            CloseReason::Failed(message) => {
                shared.emit(ConnectionEvent::ConnectionError {
                    message: message.clone(),
                });
                (Some(message), false)
            }
        };

        let will_reconnect = !cancelled && config.reconnect && strategy.has_attempts_remaining();
        shared.set_state(ConnectionState::Disconnected);
        shared.emit(ConnectionEvent::Disconnected {
            reason: message,
            will_reconnect,
        });

        if cancelled || !config.reconnect {
            break;
        }

        let Some(delay) = strategy.next_delay() else {
            error!(
                "Giving up on {} after {} reconnect attempts",
                url, strategy.attempt
            );
            shared.emit(ConnectionEvent::ReconnectGaveUp {
                attempts: strategy.attempt,
            });
            break;
        };

        Counters::bump(&shared.counters.reconnect_attempts, 1);
        info!("Reconnecting to {} in {:?} ({})", url, delay, strategy.status());
        shared.emit(ConnectionEvent::ReconnectScheduled {
            attempt: strategy.attempt,
            delay,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => break,
        }
    }

    debug!("Connection supervisor for {} stopped", url);
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Drive one open connection until it ends
async fn run_connection(
    stream: WsStream,
    config: &ConnectionConfig,
    shared: &Shared,
    mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    cancel: &mut watch::Receiver<bool>,
) -> CloseReason {
    let (mut sink, mut stream) = stream.split();
    let counters = &shared.counters;

    if let Some(hello) = &config.hello_message {
        match OutboundMessage::hello(hello.clone()).to_text() {
            Ok(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return CloseReason::Failed(format!("hello failed: {}", e));
                }
                Counters::bump(&counters.messages_sent, 1);
            }
            Err(e) => warn!("Could not encode hello: {}", e),
        }
    }

    let mut keep_alive = config.keep_alive_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    let reason = loop {
        tokio::select! {
            _ = cancel.changed() => break CloseReason::Cancelled,

            Some(command) = command_rx.recv() => match command {
                ConnectionCommand::Send(message) => {
                    let text = match message.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Could not encode outbound message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!("Send failed: {}", e);
                        break CloseReason::Failed(e.to_string());
                    }
                    Counters::bump(&counters.messages_sent, 1);
                }
                ConnectionCommand::Close => break CloseReason::Requested,
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    Counters::bump(&counters.binary_messages, 1);
                    Counters::bump(&counters.bytes_received, bytes.len() as u64);
                    trace!("Received {} binary bytes", bytes.len());
                    shared.emit(ConnectionEvent::MessageReceived(RawMessage::Binary(bytes.to_vec())));
                }
                Some(Ok(Message::Text(text))) => {
                    Counters::bump(&counters.text_messages, 1);
                    Counters::bump(&counters.bytes_received, text.len() as u64);
                    match text.as_str() {
                        PING => {
                            trace!("Received ping, sending pong");
                            if let Err(e) = sink.send(Message::Text(PONG.into())).await {
                                break CloseReason::Failed(e.to_string());
                            }
                            Counters::bump(&counters.messages_sent, 1);
                        }
                        PONG => trace!("Received pong"),
                        other => shared.emit(ConnectionEvent::MessageReceived(
                            RawMessage::Text(other.to_owned()),
                        )),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| format!("{} ({})", f.reason.as_str(), u16::from(f.code)));
                    info!("Server closed the stream: {:?}", reason);
                    break CloseReason::Remote(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Stream error: {}", e);
                    break CloseReason::Failed(e.to_string());
                }
                None => break CloseReason::Remote(None),
            },

            _ = async {
                match keep_alive.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                trace!("Sending keep-alive ping");
                if let Err(e) = sink.send(Message::Text(PING.into())).await {
                    warn!("Keep-alive failed: {}", e);
                    break CloseReason::Failed(e.to_string());
                }
                Counters::bump(&counters.messages_sent, 1);
            }
        }
    };

    if matches!(reason, CloseReason::Cancelled | CloseReason::Requested) {
        shared.set_state(ConnectionState::Closing);
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => debug!("Close handshake sent"),
            Ok(Err(e)) => debug!("Close handshake failed: {}", e),
            Err(_) => debug!("Close handshake timed out"),
        }
    }

    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert!(config.reconnect);
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(1000));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert!(config.hello_message.is_some());
    }

    #[test]
    fn test_send_without_connection() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        assert!(matches!(
            manager.send(OutboundMessage::Ping),
            Err(StreamError::NotConnected)
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        assert!(matches!(
            manager.connect("http://localhost:8006").await,
            Err(StreamError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_harmless() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let mut events = manager.subscribe();
        manager.disconnect(false).await;
        manager.disconnect(true).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }
}
