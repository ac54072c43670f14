mod terminal;

pub use terminal::{ChunkStream, SessionError, TerminalClient, TerminalState};
