use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TtydConfig;
use crate::protocol::{ProtocolClient, ProtocolError, ProtocolEvent, ProtocolState};

/// Business-level view of the connection, derived from protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ListenerId = usize;

#[derive(Default)]
struct Dispatch {
    /// Tombstone-by-index: removal nulls the slot so indices handed out to
    /// callers stay valid while a fan-out is in flight.
    listeners: Vec<Option<mpsc::UnboundedSender<String>>>,
    primary: Option<mpsc::UnboundedSender<String>>,
}

/// Wraps the protocol client: translates protocol state into
/// [`ConnectionState`], fans inbound output to temporary listeners then the
/// primary handler, and delegates transport operations.
pub struct ConnectionManager {
    client: Arc<ProtocolClient>,
    state: Arc<StdMutex<ConnectionState>>,
    state_tx: watch::Sender<ConnectionState>,
    dispatch: Arc<StdMutex<Dispatch>>,
    errors_rx: StdMutex<Option<mpsc::UnboundedReceiver<ProtocolError>>>,
    router: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Must be called inside a tokio runtime: spawns the event router.
    pub fn new(config: TtydConfig) -> Self {
        let (client, events) = ProtocolClient::new(config);
        let state = Arc::new(StdMutex::new(ConnectionState::Idle));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let dispatch = Arc::new(StdMutex::new(Dispatch::default()));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let router = tokio::spawn(route_events(
            events,
            Arc::clone(&state),
            state_tx.clone(),
            Arc::clone(&dispatch),
            errors_tx,
        ));

        Self {
            client: Arc::new(client),
            state,
            state_tx,
            dispatch,
            errors_rx: StdMutex::new(Some(errors_rx)),
            router: StdMutex::new(Some(router)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Connected requires both the derived state and a live transport; a
    /// stale `Connected` after abrupt socket death must not count.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.client.is_ready()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Protocol errors, in arrival order. Takeable once.
    pub fn take_error_stream(&self) -> Option<mpsc::UnboundedReceiver<ProtocolError>> {
        self.errors_rx.lock().unwrap().take()
    }

    /// Register a temporary listener; it sees every inbound message before
    /// the primary handler until removed.
    pub fn add_listener(&self, listener: mpsc::UnboundedSender<String>) -> ListenerId {
        let mut dispatch = self.dispatch.lock().unwrap();
        dispatch.listeners.push(Some(listener));
        let id = dispatch.listeners.len() - 1;
        debug!(target: "connection", listener = id, "temporary listener added");
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let mut dispatch = self.dispatch.lock().unwrap();
        match dispatch.listeners.get_mut(id) {
            Some(slot) => {
                *slot = None;
                debug!(target: "connection", listener = id, "temporary listener removed");
            }
            None => warn!(target: "connection", listener = id, "unknown listener id"),
        }
    }

    /// Install the steady-state handler that receives messages after all
    /// temporary listeners.
    pub fn set_primary(&self, handler: mpsc::UnboundedSender<String>) {
        self.dispatch.lock().unwrap().primary = Some(handler);
        debug!(target: "connection", "primary handler installed");
    }

    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            warn!(target: "connection", "already connected");
            return true;
        }

        info!(target: "connection", "establishing connection");
        set_state(&self.state, &self.state_tx, ConnectionState::Connecting);

        if !self.client.connect().await {
            set_state(&self.state, &self.state_tx, ConnectionState::Failed);
            error!(target: "connection", "connection failed");
            return false;
        }

        // the router flips us to Connected when it sees the Ready event;
        // wait for that so callers observe a settled state
        self.await_state(ConnectionState::Connected).await;
        true
    }

    pub async fn disconnect(&self) {
        info!(target: "connection", "closing connection");
        set_state(&self.state, &self.state_tx, ConnectionState::Disconnecting);
        self.client.disconnect().await;
        // requested disconnects settle here; the router's special case only
        // fires for unsolicited protocol drops
        set_state(&self.state, &self.state_tx, ConnectionState::Disconnected);
    }

    pub fn send_command(&self, command: &str) -> bool {
        if !self.is_connected() {
            error!(target: "connection", "not connected; command dropped");
            return false;
        }
        self.client.send_command(command)
    }

    pub fn send_input(&self, data: &str) -> bool {
        if !self.is_connected() {
            error!(target: "connection", "not connected; input dropped");
            return false;
        }
        self.client.send_input(data)
    }

    pub fn resize_terminal(&self, rows: u16, columns: u16) -> bool {
        if !self.is_connected() {
            error!(target: "connection", "not connected; resize dropped");
            return false;
        }
        self.client.resize(rows, columns)
    }

    async fn await_state(&self, wanted: ConnectionState) {
        let mut rx = self.state_tx.subscribe();
        let settled = tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|state| *state == wanted),
        )
        .await;
        if settled.is_err() {
            warn!(target: "connection", wanted = wanted.as_str(), "state did not settle in time");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut router) = self.router.lock() {
            if let Some(task) = router.take() {
                task.abort();
            }
        }
    }
}

async fn route_events(
    mut events: mpsc::UnboundedReceiver<ProtocolEvent>,
    state: Arc<StdMutex<ConnectionState>>,
    state_tx: watch::Sender<ConnectionState>,
    dispatch: Arc<StdMutex<Dispatch>>,
    errors_tx: mpsc::UnboundedSender<ProtocolError>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProtocolEvent::Output(data) => dispatch_message(&dispatch, &data),
            ProtocolEvent::State(protocol_state) => {
                apply_protocol_state(&state, &state_tx, protocol_state)
            }
            ProtocolEvent::Error(err) => {
                error!(target: "connection", %err, "protocol error");
                let _ = errors_tx.send(err);
            }
        }
    }
    debug!(target: "connection", "event router stopped");
}

fn apply_protocol_state(
    state: &Arc<StdMutex<ConnectionState>>,
    state_tx: &watch::Sender<ConnectionState>,
    protocol_state: ProtocolState,
) {
    match protocol_state {
        ProtocolState::Disconnected => {
            let current = *state.lock().unwrap();
            if current == ConnectionState::Disconnecting || current == ConnectionState::Disconnected
            {
                info!(target: "connection", "connection closed as requested");
            } else {
                warn!(
                    target: "connection",
                    state = current.as_str(),
                    "connection dropped unexpectedly"
                );
            }
            set_state(state, state_tx, ConnectionState::Disconnected);
        }
        // handshake phases stay within the current business state
        ProtocolState::Connecting | ProtocolState::Authenticating => {
            debug!(
                target: "connection",
                protocol = protocol_state.as_str(),
                "handshake in progress"
            );
        }
        ProtocolState::Ready => set_state(state, state_tx, ConnectionState::Connected),
        ProtocolState::Error => set_state(state, state_tx, ConnectionState::Failed),
    }
}

fn set_state(
    state: &Arc<StdMutex<ConnectionState>>,
    state_tx: &watch::Sender<ConnectionState>,
    next: ConnectionState,
) {
    let mut guard = state.lock().unwrap();
    if *guard == next {
        return;
    }
    let previous = *guard;
    *guard = next;
    drop(guard);
    debug!(
        target: "connection",
        from = previous.as_str(),
        to = next.as_str(),
        "connection state changed"
    );
    state_tx.send_replace(next);
}

/// Temporary listeners first in registration order, then the primary
/// handler; one dead listener never blocks delivery to the rest.
fn dispatch_message(dispatch: &Arc<StdMutex<Dispatch>>, data: &str) {
    let (listeners, primary) = {
        let guard = dispatch.lock().unwrap();
        let listeners: Vec<_> = guard
            .listeners
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.clone().map(|tx| (id, tx)))
            .collect();
        (listeners, guard.primary.clone())
    };

    for (id, listener) in listeners {
        if listener.send(data.to_string()).is_err() {
            warn!(target: "connection", listener = id, "temporary listener dropped its receiver");
        }
    }

    if let Some(primary) = primary {
        if primary.send(data.to_string()).is_err() {
            warn!(target: "connection", "primary handler dropped its receiver");
        }
    }
}
