use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

/// Parsing/completion strategy for the program behind the terminal.
///
/// `Generic` covers ordinary shells whose prompt hook emits out-of-band
/// completion markers. `Assistant` covers the interactive AI CLI whose
/// output is classified heuristically (spinner, tool banner, prompt
/// resumption).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalProfile {
    Generic,
    Assistant,
}

impl TerminalProfile {
    pub fn label(self) -> &'static str {
        match self {
            TerminalProfile::Generic => "generic",
            TerminalProfile::Assistant => "assistant",
        }
    }

    /// Line terminator the proxied program expects on submitted commands.
    /// The assistant CLI reads raw-mode carriage returns; shells take LF.
    pub fn line_terminator(self) -> &'static str {
        match self {
            TerminalProfile::Generic => "\n",
            TerminalProfile::Assistant => "\r",
        }
    }
}

impl fmt::Display for TerminalProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Semantic classification of one unit of terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Thinking,
    ToolUse,
    Content,
    Pending,
    Complete,
    Error,
}

impl ChunkType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkType::Thinking => "thinking",
            ChunkType::ToolUse => "tool_use",
            ChunkType::Content => "content",
            ChunkType::Pending => "pending",
            ChunkType::Complete => "complete",
            ChunkType::Error => "error",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One semantically classified unit of output, as delivered to callers.
///
/// Complete/Error chunks carry empty or diagnostic content only; a Content
/// chunk always carries non-empty trimmed text or is never emitted.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    pub kind: ChunkType,
    pub metadata: HashMap<String, Value>,
    pub timestamp: f64,
}

impl StreamChunk {
    pub fn new(content: impl Into<String>, kind: ChunkType, metadata: HashMap<String, Value>) -> Self {
        Self {
            content: content.into(),
            kind,
            metadata,
            timestamp: epoch_seconds(),
        }
    }

    pub fn content(text: impl Into<String>, raw_length: usize, profile: TerminalProfile) -> Self {
        let text = text.into();
        let mut metadata = base_metadata(raw_length, profile);
        metadata.insert("content_length".into(), text.len().into());
        Self::new(text, ChunkType::Content, metadata)
    }

    pub fn thinking(raw_length: usize, profile: TerminalProfile) -> Self {
        Self::new("", ChunkType::Thinking, base_metadata(raw_length, profile))
    }

    pub fn tool_use(tool_name: impl Into<String>, raw_length: usize, profile: TerminalProfile) -> Self {
        let mut metadata = base_metadata(raw_length, profile);
        metadata.insert("tool_name".into(), tool_name.into().into());
        Self::new("", ChunkType::ToolUse, metadata)
    }

    pub fn complete(raw_length: usize, profile: TerminalProfile) -> Self {
        Self::new("", ChunkType::Complete, base_metadata(raw_length, profile))
    }

    pub fn error(message: &str, profile: TerminalProfile, error_kind: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error_message".into(), message.into());
        metadata.insert("error_kind".into(), error_kind.into());
        metadata.insert("profile".into(), profile.label().into());
        Self::new("", ChunkType::Error, metadata)
    }

    /// A terminal chunk ends the stream it travels on.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ChunkType::Complete | ChunkType::Error)
    }

    pub fn to_api_value(&self) -> Value {
        json!({
            "content": self.content,
            "type": self.kind.as_str(),
            "metadata": self.metadata,
            "timestamp": self.timestamp,
        })
    }
}

fn base_metadata(raw_length: usize, profile: TerminalProfile) -> HashMap<String, Value> {
    let mut metadata = HashMap::new();
    metadata.insert("raw_length".into(), raw_length.into());
    metadata.insert("profile".into(), profile.label().into());
    metadata
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_types_use_wire_labels() {
        assert_eq!(ChunkType::ToolUse.as_str(), "tool_use");
        assert_eq!(ChunkType::Complete.as_str(), "complete");
    }

    #[test]
    fn content_chunk_records_lengths() {
        let chunk = StreamChunk::content("hello", 42, TerminalProfile::Assistant);
        assert_eq!(chunk.kind, ChunkType::Content);
        assert_eq!(chunk.metadata["raw_length"], 42);
        assert_eq!(chunk.metadata["content_length"], 5);
        assert_eq!(chunk.metadata["profile"], "assistant");
    }

    #[test]
    fn api_value_matches_documented_shape() {
        let chunk = StreamChunk::error("boom", TerminalProfile::Generic, "processing_error");
        let value = chunk.to_api_value();
        assert_eq!(value["type"], "error");
        assert_eq!(value["content"], "");
        assert_eq!(value["metadata"]["error_message"], "boom");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn only_complete_and_error_are_terminal() {
        assert!(StreamChunk::complete(0, TerminalProfile::Generic).is_terminal());
        assert!(StreamChunk::error("x", TerminalProfile::Generic, "e").is_terminal());
        assert!(!StreamChunk::thinking(1, TerminalProfile::Assistant).is_terminal());
    }

    #[test]
    fn profiles_pick_their_line_terminator() {
        assert_eq!(TerminalProfile::Generic.line_terminator(), "\n");
        assert_eq!(TerminalProfile::Assistant.line_terminator(), "\r");
    }
}
