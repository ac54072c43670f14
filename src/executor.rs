use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::model::{ChunkType, StreamChunk};
use crate::processor::MessageProcessor;

/// Why a command did not complete. `SilenceTimeout` is deliberately distinct
/// from the rest: callers can retry it with a larger budget, where the other
/// failures mean the session is unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("connection not established")]
    NotConnected,
    #[error("command could not be sent")]
    SendFailed,
    #[error("command went silent for {silence:.1?} (budget {budget:.1?})")]
    SilenceTimeout { silence: Duration, budget: Duration },
    #[error("message stream closed mid-execution")]
    StreamClosed,
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::NotConnected => "not_connected",
            ExecutionError::SendFailed => "send_failed",
            ExecutionError::SilenceTimeout { .. } => "silence_timeout",
            ExecutionError::StreamClosed => "stream_closed",
        }
    }
}

/// Outcome of one driven command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub execution_time: Duration,
    pub error: Option<ExecutionError>,
}

impl CommandResult {
    fn success(command: String, execution_time: Duration) -> Self {
        Self {
            command,
            success: true,
            execution_time,
            error: None,
        }
    }

    fn failure(command: String, execution_time: Duration, error: ExecutionError) -> Self {
        Self {
            command,
            success: false,
            execution_time,
            error: Some(error),
        }
    }
}

/// Ephemeral per-command context; at most one alive per executor, enforced
/// by `execute` taking `&mut self`.
struct CommandExecution {
    command: String,
    started: Instant,
    last_activity: Instant,
}

/// Drives exactly one command at a time to completion.
///
/// Raw output arrives on the channel installed as the connection manager's
/// primary handler; every inbound message refreshes the activity clock, so
/// the timeout measures *silence*, not wall-clock time. A slow tool call
/// that keeps emitting bytes is never killed by a fixed deadline.
pub struct CommandExecutor {
    manager: Arc<ConnectionManager>,
    processor: MessageProcessor,
    messages: mpsc::UnboundedReceiver<String>,
}

impl CommandExecutor {
    /// Returns the executor plus the sender the connection manager installs
    /// as its primary handler.
    pub fn new(
        manager: Arc<ConnectionManager>,
        processor: MessageProcessor,
    ) -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                manager,
                processor,
                messages: rx,
            },
            tx,
        )
    }

    pub async fn execute(
        &mut self,
        command: &str,
        silence_timeout: Duration,
        chunks: &mpsc::UnboundedSender<StreamChunk>,
    ) -> CommandResult {
        if !self.manager.is_connected() {
            return CommandResult::failure(
                command.to_string(),
                Duration::ZERO,
                ExecutionError::NotConnected,
            );
        }

        info!(target: "executor", command = command.trim(), "executing command");

        // anything that arrived between commands is prompt noise, not ours
        let mut stale = 0usize;
        while self.messages.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(target: "executor", stale, "discarded inter-command output");
        }

        let mut execution = CommandExecution {
            command: command.to_string(),
            started: Instant::now(),
            last_activity: Instant::now(),
        };

        if !self.manager.send_command(command) {
            return CommandResult::failure(
                execution.command,
                execution.started.elapsed(),
                ExecutionError::SendFailed,
            );
        }

        loop {
            let silence = execution.last_activity.elapsed();
            if silence >= silence_timeout {
                return self.timed_out(execution, silence, silence_timeout);
            }
            let deadline = tokio::time::Instant::now() + (silence_timeout - silence);

            let wakeup = tokio::select! {
                message = self.messages.recv() => Some(message),
                _ = tokio::time::sleep_until(deadline) => None,
            };

            match wakeup {
                Some(Some(raw)) => {
                    execution.last_activity = Instant::now();
                    if self.handle_raw_message(&raw, &execution, chunks) {
                        return CommandResult::success(
                            execution.command,
                            execution.started.elapsed(),
                        );
                    }
                }
                Some(None) => {
                    return CommandResult::failure(
                        execution.command,
                        execution.started.elapsed(),
                        ExecutionError::StreamClosed,
                    );
                }
                None => {
                    let silence = execution.last_activity.elapsed();
                    return self.timed_out(execution, silence, silence_timeout);
                }
            }
        }
    }

    fn timed_out(
        &self,
        execution: CommandExecution,
        silence: Duration,
        budget: Duration,
    ) -> CommandResult {
        warn!(
            target: "executor",
            command = execution.command.trim(),
            silence = ?silence,
            "command silence budget exhausted"
        );
        CommandResult::failure(
            execution.command,
            execution.started.elapsed(),
            ExecutionError::SilenceTimeout { silence, budget },
        )
    }

    /// Process one raw message; returns `true` once completion is observed.
    fn handle_raw_message(
        &mut self,
        raw: &str,
        execution: &CommandExecution,
        chunks: &mpsc::UnboundedSender<StreamChunk>,
    ) -> bool {
        let Some(mut chunk) = self.processor.process(raw, &execution.command) else {
            return false;
        };

        let complete = chunk.kind == ChunkType::Complete;
        if complete {
            debug!(target: "executor", "completion marker observed");
            chunk.metadata.insert(
                "execution_time".into(),
                execution.started.elapsed().as_secs_f64().into(),
            );
            chunk.metadata.insert("command_success".into(), true.into());
        }

        if chunks.send(chunk).is_err() {
            warn!(target: "executor", "chunk sink dropped");
        }
        complete
    }
}
