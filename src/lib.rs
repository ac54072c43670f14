//! Typed streaming client for ttyd-style terminal sharing endpoints.
//!
//! Drives an interactive program behind a terminal-sharing WebSocket server
//! (a shell, or an AI command-line assistant) and reconstructs a
//! semantically typed, ANSI-stripped event stream: callers distinguish
//! thinking, tool use, content, completion, and errors without knowing the
//! proxied program's terminal behavior.
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use std::time::Duration;
//! use ttypilot::{TerminalClient, TerminalProfile, TtydConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TtydConfig::new("localhost", 7681, "demo", "password123")
//!     .with_profile(TerminalProfile::Assistant);
//! let client = TerminalClient::new(config);
//! client.initialize().await?;
//!
//! let mut chunks = client.execute_command_stream("summarize the logs", Duration::from_secs(30));
//! while let Some(chunk) = chunks.next().await {
//!     println!("[{}] {}", chunk.kind, chunk.content);
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod executor;
pub mod model;
pub mod parser;
pub mod pool;
pub mod processor;
pub mod protocol;

pub use client::{ChunkStream, SessionError, TerminalClient, TerminalState};
pub use config::TtydConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use executor::{CommandExecutor, CommandResult, ExecutionError};
pub use model::{ChunkType, StreamChunk, TerminalProfile};
pub use pool::ClientPool;
pub use processor::MessageProcessor;
