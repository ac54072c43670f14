use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout_at};
use tracing::{debug, error, info, warn};

use crate::config::TtydConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::executor::CommandExecutor;
use crate::model::{ChunkType, StreamChunk, TerminalProfile};
use crate::parser::OutputParser;
use crate::processor::MessageProcessor;
use crate::protocol::ProtocolError;

/// Business lifecycle of one terminal session; gates command submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Initializing,
    Idle,
    Busy,
    Error,
    Unavailable,
}

impl TerminalState {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalState::Initializing => "initializing",
            TerminalState::Idle => "idle",
            TerminalState::Busy => "busy",
            TerminalState::Error => "error",
            TerminalState::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection could not be established")]
    ConnectFailed,
    #[error("connection closed during initialization drain")]
    DrainInterrupted,
    #[error("connection pool exhausted")]
    PoolExhausted,
}

/// How long the generic profile discards startup output before accepting
/// commands. The assistant profile drains until its first ready prompt.
pub const GENERIC_DRAIN_WINDOW: Duration = Duration::from_millis(1100);
const DRAIN_PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Top-level façade: one connection manager, one command executor, one
/// message processor. A failed session is discarded and replaced with a new
/// instance, never reset in place.
pub struct TerminalClient {
    profile: TerminalProfile,
    manager: Arc<ConnectionManager>,
    executor: Arc<AsyncMutex<CommandExecutor>>,
    executor_tx: mpsc::UnboundedSender<String>,
    state: Arc<StdMutex<TerminalState>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl TerminalClient {
    /// Must be called inside a tokio runtime: spawns the state watchers.
    pub fn new(config: TtydConfig) -> Self {
        let profile = config.profile;
        let manager = Arc::new(ConnectionManager::new(config));
        let processor = MessageProcessor::new(profile);
        let (executor, executor_tx) = CommandExecutor::new(Arc::clone(&manager), processor);
        let state = Arc::new(StdMutex::new(TerminalState::Initializing));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(watch_connection(
            Arc::clone(&state),
            manager.subscribe_state(),
        )));
        if let Some(errors) = manager.take_error_stream() {
            tasks.push(tokio::spawn(watch_errors(Arc::clone(&state), errors)));
        }

        Self {
            profile,
            manager,
            executor: Arc::new(AsyncMutex::new(executor)),
            executor_tx,
            state,
            tasks: StdMutex::new(tasks),
        }
    }

    pub fn profile(&self) -> TerminalProfile {
        self.profile
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn terminal_state(&self) -> TerminalState {
        *self.state.lock().unwrap()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn can_execute_command(&self) -> bool {
        self.is_connected() && self.terminal_state() == TerminalState::Idle
    }

    /// Connect if needed, drain startup noise, and install the executor as
    /// the steady-state message handler.
    ///
    /// The drain listener is registered before the transport comes up so a
    /// banner arriving in the first instant of the connection is still
    /// observed and discarded.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        info!(
            target: "client",
            profile = self.profile.label(),
            "initializing terminal session"
        );

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let listener_id = self.manager.add_listener(tx);

        if !self.is_connected() && !self.manager.connect().await {
            self.manager.remove_listener(listener_id);
            self.set_state(TerminalState::Error);
            return Err(SessionError::ConnectFailed);
        }

        self.set_state(TerminalState::Initializing);
        let drained = self.drain_startup_noise(rx).await;
        self.manager.remove_listener(listener_id);
        if let Err(err) = drained {
            self.set_state(TerminalState::Error);
            return Err(err);
        }

        self.manager.set_primary(self.executor_tx.clone());
        self.set_state(TerminalState::Idle);
        info!(target: "client", "terminal ready for commands");
        Ok(())
    }

    /// Startup banners and telemetry must never reach a caller as content;
    /// the temporary listener observes and discards them.
    async fn drain_startup_noise(
        &self,
        rx: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), SessionError> {
        let started = Instant::now();
        let discarded = match self.profile {
            TerminalProfile::Generic => drain_for_window(rx, started).await?,
            TerminalProfile::Assistant => drain_until_ready(rx, started).await?,
        };
        info!(
            target: "client",
            discarded,
            elapsed = ?started.elapsed(),
            "startup drain finished"
        );
        Ok(())
    }

    /// Execute one command, yielding typed chunks in arrival order. The
    /// stream ends at the first Complete or Error chunk; the session returns
    /// to idle on every exit path, including dropping the stream mid-flight.
    pub fn execute_command_stream(
        &self,
        command: &str,
        silence_timeout: Duration,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::unbounded_channel();

        if !self.can_execute_command() {
            let reason = format!(
                "cannot execute command: connected={}, state={}",
                self.is_connected(),
                self.terminal_state()
            );
            error!(target: "client", %reason);
            let _ = tx.send(StreamChunk::error(&reason, self.profile, "command_refused"));
            return ChunkStream::refused(rx);
        }

        self.set_state(TerminalState::Busy);
        let guard = IdleGuard {
            state: Arc::clone(&self.state),
        };

        let executor = Arc::clone(&self.executor);
        let profile = self.profile;
        let command = command.to_string();
        let chunk_tx = tx.clone();
        let task = tokio::spawn(async move {
            let mut executor = executor.lock().await;
            let result = executor.execute(&command, silence_timeout, &chunk_tx).await;
            drop(executor);

            if let Some(err) = result.error {
                let mut chunk = StreamChunk::error(&err.to_string(), profile, err.kind());
                if let crate::executor::ExecutionError::SilenceTimeout { silence, .. } = &err {
                    chunk
                        .metadata
                        .insert("silence_seconds".into(), silence.as_secs_f64().into());
                }
                let _ = chunk_tx.send(chunk);
            }
            // on success the executor already emitted the Complete chunk
        });

        ChunkStream::new(rx, task, guard)
    }

    pub fn resize_terminal(&self, rows: u16, columns: u16) -> bool {
        self.manager.resize_terminal(rows, columns)
    }

    pub fn send_input(&self, data: &str) -> bool {
        self.manager.send_input(data)
    }

    /// Idempotent: marks the session unavailable and closes the transport.
    pub async fn shutdown(&self) {
        info!(target: "client", "shutting down terminal session");
        self.set_state(TerminalState::Unavailable);
        self.manager.disconnect().await;
    }

    fn set_state(&self, next: TerminalState) {
        set_terminal_state(&self.state, next);
    }
}

impl Drop for TerminalClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn set_terminal_state(state: &Arc<StdMutex<TerminalState>>, next: TerminalState) {
    let mut guard = state.lock().unwrap();
    if *guard == next {
        return;
    }
    let previous = *guard;
    *guard = next;
    drop(guard);
    debug!(
        target: "client",
        from = previous.as_str(),
        to = next.as_str(),
        "terminal state changed"
    );
}

/// Generic profile: whatever the shell prints on attach is noise; discard
/// for a fixed window.
async fn drain_for_window(
    mut rx: mpsc::UnboundedReceiver<String>,
    started: Instant,
) -> Result<usize, SessionError> {
    let deadline = started + GENERIC_DRAIN_WINDOW;
    let mut discarded = 0usize;
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(_)) => discarded += 1,
            Ok(None) => return Err(SessionError::DrainInterrupted),
            Err(_) => return Ok(discarded),
        }
    }
}

/// Assistant profile: discard until the parser reports the first ready
/// prompt, logging progress while the CLI loads its tooling.
async fn drain_until_ready(
    mut rx: mpsc::UnboundedReceiver<String>,
    started: Instant,
) -> Result<usize, SessionError> {
    // a throwaway parser classifies drain traffic without touching the
    // session parser's state
    let mut parser = OutputParser::for_profile(TerminalProfile::Assistant);
    let mut progress = interval_at(started + DRAIN_PROGRESS_INTERVAL, DRAIN_PROGRESS_INTERVAL);
    let mut discarded = 0usize;
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(raw) => {
                    discarded += 1;
                    if parser.parse(&raw).kind == ChunkType::Complete {
                        info!(target: "client", "ready prompt observed");
                        return Ok(discarded);
                    }
                }
                None => return Err(SessionError::DrainInterrupted),
            },
            _ = progress.tick() => {
                info!(
                    target: "client",
                    elapsed = ?started.elapsed(),
                    "still draining startup output"
                );
            }
        }
    }
}

async fn watch_connection(
    state: Arc<StdMutex<TerminalState>>,
    mut rx: watch::Receiver<ConnectionState>,
) {
    while rx.changed().await.is_ok() {
        let connection = *rx.borrow();
        let current = *state.lock().unwrap();
        match connection {
            ConnectionState::Connected => {
                if current == TerminalState::Unavailable {
                    info!(target: "client", "connection restored; terminal idle");
                    set_terminal_state(&state, TerminalState::Idle);
                }
            }
            ConnectionState::Failed | ConnectionState::Disconnected => {
                if current != TerminalState::Error && current != TerminalState::Unavailable {
                    warn!(target: "client", "connection lost; terminal unavailable");
                    set_terminal_state(&state, TerminalState::Unavailable);
                }
            }
            _ => {}
        }
    }
}

async fn watch_errors(
    state: Arc<StdMutex<TerminalState>>,
    mut errors: mpsc::UnboundedReceiver<ProtocolError>,
) {
    while let Some(err) = errors.recv().await {
        error!(target: "client", %err, "terminal transport error");
        set_terminal_state(&state, TerminalState::Error);
    }
}

/// Restores idle when the command finishes or the stream is dropped, unless
/// a failure already moved the session elsewhere.
struct IdleGuard {
    state: Arc<StdMutex<TerminalState>>,
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.state.lock() {
            if *guard == TerminalState::Busy {
                *guard = TerminalState::Idle;
                debug!(target: "client", "terminal state changed to idle");
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Ordered chunk stream for one command. Ends after the first Complete or
/// Error chunk; dropping it cancels the in-flight command and restores the
/// session to idle.
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<StreamChunk>,
    done: bool,
    task: Option<AbortOnDrop>,
    guard: Option<IdleGuard>,
}

impl ChunkStream {
    fn new(rx: mpsc::UnboundedReceiver<StreamChunk>, task: JoinHandle<()>, guard: IdleGuard) -> Self {
        Self {
            rx,
            done: false,
            task: Some(AbortOnDrop(task)),
            guard: Some(guard),
        }
    }

    /// A refused command: carries exactly one error chunk and no session
    /// state to restore.
    fn refused(rx: mpsc::UnboundedReceiver<StreamChunk>) -> Self {
        Self {
            rx,
            done: false,
            task: None,
            guard: None,
        }
    }
}

impl Stream for ChunkStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_terminal() {
                    self.done = true;
                    self.guard.take();
                    self.task.take();
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                self.done = true;
                self.guard.take();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
