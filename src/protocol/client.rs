use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::config::TtydConfig;
use crate::protocol::{self, InitFrame, ServerFrame};

/// State machine of the wire protocol; authoritative for upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Error,
}

impl ProtocolState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolState::Disconnected => "disconnected",
            ProtocolState::Connecting => "connecting",
            ProtocolState::Authenticating => "authenticating",
            ProtocolState::Ready => "ready",
            ProtocolState::Error => "error",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("initialization frame rejected: {0}")]
    Init(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Everything the protocol layer tells the upper layers, in arrival order.
#[derive(Debug)]
pub enum ProtocolEvent {
    State(ProtocolState),
    Output(String),
    Error(ProtocolError),
}

struct Shared {
    state: StdMutex<ProtocolState>,
    socket_alive: AtomicBool,
    events: mpsc::UnboundedSender<ProtocolEvent>,
}

impl Shared {
    fn state(&self) -> ProtocolState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: ProtocolState) {
        let mut guard = self.state.lock().unwrap();
        if *guard == next {
            return;
        }
        let previous = *guard;
        *guard = next;
        drop(guard);
        debug!(
            target: "protocol",
            from = previous.as_str(),
            to = next.as_str(),
            "protocol state changed"
        );
        let _ = self.events.send(ProtocolEvent::State(next));
    }

    fn fail(&self, err: ProtocolError) {
        error!(target: "protocol", %err, "protocol failure");
        self.set_state(ProtocolState::Error);
        let _ = self.events.send(ProtocolEvent::Error(err));
    }
}

/// WebSocket client implementing the ttyd wire protocol.
///
/// Owns exactly one socket. Concurrent sends are allowed (frames serialize
/// through the writer task); state changes, output, and errors surface on
/// the [`ProtocolEvent`] channel handed out at construction.
pub struct ProtocolClient {
    config: TtydConfig,
    shared: Arc<Shared>,
    stop: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ProtocolClient {
    pub fn new(config: TtydConfig) -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            config,
            shared: Arc::new(Shared {
                state: StdMutex::new(ProtocolState::Disconnected),
                socket_alive: AtomicBool::new(false),
                events,
            }),
            stop: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            outbound: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        };
        (client, events_rx)
    }

    pub fn state(&self) -> ProtocolState {
        self.shared.state()
    }

    /// Ready means the state machine reached `Ready` *and* the socket is
    /// still alive; stale state after an abrupt socket death does not count.
    pub fn is_ready(&self) -> bool {
        self.state() == ProtocolState::Ready && self.shared.socket_alive.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> bool {
        if self.is_ready() {
            warn!(target: "protocol", "already connected");
            return true;
        }

        self.shared.set_state(ProtocolState::Connecting);
        let request = match self.build_request() {
            Ok(request) => request,
            Err(err) => {
                self.shared.fail(err);
                return false;
            }
        };

        let (ws_stream, _) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(err) => {
                self.shared.fail(ProtocolError::Handshake(err.to_string()));
                return false;
            }
        };
        info!(
            target: "protocol",
            host = %self.config.host,
            port = self.config.port,
            "websocket established"
        );

        self.shared.set_state(ProtocolState::Authenticating);
        self.stopping.store(false, Ordering::SeqCst);
        self.shared.socket_alive.store(true, Ordering::SeqCst);

        let (mut ws_write, ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().unwrap() = Some(out_tx.clone());

        let writer_shared = Arc::clone(&self.shared);
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(err) = ws_write.send(message).await {
                    writer_shared.socket_alive.store(false, Ordering::SeqCst);
                    debug!(target: "protocol", %err, "writer stopped");
                    break;
                }
            }
        });

        let reader = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.stop),
            Arc::clone(&self.stopping),
            ws_read,
        ));

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(writer);
            tasks.push(reader);
        }

        let token = self.config.auth_token();
        let init = InitFrame {
            columns: self.config.columns,
            rows: self.config.rows,
            auth_token: &token,
        };
        let frame = match serde_json::to_string(&init) {
            Ok(frame) => frame,
            Err(err) => {
                self.shared.fail(ProtocolError::Init(err.to_string()));
                return false;
            }
        };
        if out_tx.send(Message::Text(frame)).is_err() {
            self.shared
                .fail(ProtocolError::Init("writer closed before init frame".into()));
            return false;
        }

        self.shared.set_state(ProtocolState::Ready);
        info!(target: "protocol", "protocol ready");
        true
    }

    fn build_request(&self) -> Result<Request, ProtocolError> {
        let url = self
            .config
            .endpoint()
            .map_err(|err| ProtocolError::Handshake(format!("invalid endpoint: {err}")))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ProtocolError::Handshake(err.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("tty"));
        let basic = HeaderValue::from_str(&format!("Basic {}", self.config.auth_token()))
            .map_err(|err| ProtocolError::Handshake(err.to_string()))?;
        headers.insert(AUTHORIZATION, basic);
        Ok(request)
    }

    /// Send command text, appending the profile's line terminator if absent.
    pub fn send_command(&self, command: &str) -> bool {
        let terminator = self.config.profile.line_terminator();
        let mut payload = command.to_string();
        if !payload.ends_with(terminator) {
            payload.push_str(terminator);
        }
        debug!(target: "protocol", command = command.trim(), "sending command");
        self.send_frame(protocol::encode_input(&payload), "command")
    }

    /// Send raw input bytes without any terminator handling.
    pub fn send_input(&self, data: &str) -> bool {
        self.send_frame(protocol::encode_input(data), "input")
    }

    pub fn resize(&self, rows: u16, columns: u16) -> bool {
        match protocol::encode_resize(rows, columns) {
            Ok(frame) => {
                debug!(target: "protocol", rows, columns, "resizing terminal");
                self.send_frame(frame, "resize")
            }
            Err(err) => {
                warn!(target: "protocol", %err, "resize payload encoding failed");
                false
            }
        }
    }

    fn send_frame(&self, frame: String, what: &str) -> bool {
        if !self.is_ready() {
            error!(target: "protocol", what, "cannot send: protocol not ready");
            return false;
        }
        let sent = {
            let guard = self.outbound.lock().unwrap();
            guard
                .as_ref()
                .map(|tx| tx.send(Message::Text(frame)).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            self.shared.fail(ProtocolError::Transport(format!(
                "{what} send failed: writer closed"
            )));
        }
        sent
    }

    /// Stop the receive loop, close the socket, and force `Disconnected`.
    /// Idempotent and infallible; safe concurrently with an in-flight wait.
    pub async fn disconnect(&self) {
        info!(target: "protocol", "disconnecting");
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();

        if let Some(tx) = self.outbound.lock().unwrap().take() {
            let _ = tx.send(Message::Close(None));
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.shared.socket_alive.store(false, Ordering::SeqCst);
        self.shared.set_state(ProtocolState::Disconnected);
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    stop: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    mut ws_read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
) {
    debug!(target: "protocol", "receive loop started");
    loop {
        tokio::select! {
            _ = stop.notified() => {
                debug!(target: "protocol", "receive loop stop requested");
                break;
            }
            frame = ws_read.next() => match frame {
                Some(Ok(message)) => {
                    if !handle_message(&shared, message) {
                        break;
                    }
                }
                Some(Err(err)) => {
                    if !stopping.load(Ordering::SeqCst) {
                        shared.fail(ProtocolError::Transport(err.to_string()));
                    }
                    break;
                }
                None => {
                    warn!(target: "protocol", "server closed the connection");
                    break;
                }
            }
        }
    }

    // loop exit forces disconnect however we got here
    shared.socket_alive.store(false, Ordering::SeqCst);
    shared.set_state(ProtocolState::Disconnected);
    debug!(target: "protocol", "receive loop stopped");
}

/// Returns `false` when the loop should stop.
fn handle_message(shared: &Shared, message: Message) -> bool {
    let raw = match message {
        Message::Text(text) => text,
        Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
        Message::Close(_) => {
            info!(target: "protocol", "server sent close frame");
            return false;
        }
        _ => return true,
    };

    match protocol::decode_server_frame(&raw) {
        Some(ServerFrame::Output(data)) => {
            let _ = shared.events.send(ProtocolEvent::Output(data));
        }
        Some(ServerFrame::WindowTitle(title)) => {
            debug!(target: "protocol", %title, "window title frame discarded");
        }
        Some(ServerFrame::Preferences(_)) => {
            debug!(target: "protocol", "preferences frame discarded");
        }
        Some(ServerFrame::Unknown(prefix)) => {
            debug!(target: "protocol", %prefix, "unknown frame discarded");
        }
        None => {}
    }
    true
}
