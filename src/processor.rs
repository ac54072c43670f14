use tracing::debug;

use crate::model::{ChunkType, StreamChunk, TerminalProfile};
use crate::parser::OutputParser;

/// Stateful façade over the output parser: converts one raw transport
/// message into at most one typed [`StreamChunk`], stripping the echo of the
/// command that produced it.
///
/// One processor per logical session; parser state (escape-sequence tail,
/// previous chunk type) lives inside it.
pub struct MessageProcessor {
    profile: TerminalProfile,
    parser: OutputParser,
}

impl MessageProcessor {
    pub fn new(profile: TerminalProfile) -> Self {
        Self {
            profile,
            parser: OutputParser::for_profile(profile),
        }
    }

    pub fn profile(&self) -> TerminalProfile {
        self.profile
    }

    /// Returns `None` when the frame carries nothing worth emitting (pure
    /// styling, echo-only output, or a repeat of a passive state).
    pub fn process(&mut self, raw: &str, command: &str) -> Option<StreamChunk> {
        if raw.is_empty() {
            return None;
        }

        let parsed = self.parser.parse(raw);

        match parsed.kind {
            ChunkType::Content => {
                let command = command.trim();
                let text = if command.is_empty() {
                    parsed.clean
                } else {
                    strip_command_echo(&parsed.clean, command)
                };
                if text.trim().is_empty() {
                    return None;
                }
                Some(StreamChunk::content(text, raw.len(), self.profile))
            }
            ChunkType::Complete => Some(StreamChunk::complete(raw.len(), self.profile)),
            ChunkType::Thinking => Some(StreamChunk::thinking(raw.len(), self.profile)),
            ChunkType::ToolUse => Some(StreamChunk::tool_use(
                parsed.tool_name.unwrap_or_else(|| "unknown".into()),
                raw.len(),
                self.profile,
            )),
            ChunkType::Pending | ChunkType::Error => None,
        }
    }
}

/// Remove the first echoed occurrence of the submitted command, then drop
/// the blank lines the echo leaves behind.
fn strip_command_echo(content: &str, command: &str) -> String {
    if content.is_empty() || command.is_empty() {
        return content.to_string();
    }

    let without_echo = if content.contains(command) {
        debug!(target: "processor", %command, "removed command echo");
        content.replacen(command, "", 1)
    } else {
        content.to_string()
    };

    without_echo
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_is_removed_once_not_globally() {
        let stripped = strip_command_echo("echo hi\nhi\necho hi again", "echo hi");
        assert_eq!(stripped, "hi\necho hi again");
    }

    #[test]
    fn generic_content_chunk_loses_echo() {
        let mut processor = MessageProcessor::new(TerminalProfile::Generic);
        let chunk = processor.process("pwd\r\n/home/demo\r\n", "pwd").unwrap();
        assert_eq!(chunk.kind, ChunkType::Content);
        assert_eq!(chunk.content, "/home/demo");
    }

    #[test]
    fn assistant_echo_removal_returns_remaining_content() {
        // the echoed command goes away and the answer stays; the historical
        // behavior of returning the bare command is pinned out here
        let mut processor = MessageProcessor::new(TerminalProfile::Assistant);
        let chunk = processor
            .process("what is 2+2\r\nThe answer is 4.\n", "what is 2+2")
            .unwrap();
        assert_eq!(chunk.kind, ChunkType::Content);
        assert_eq!(chunk.content, "The answer is 4.");
    }

    #[test]
    fn echo_only_frame_emits_nothing() {
        let mut processor = MessageProcessor::new(TerminalProfile::Assistant);
        assert!(processor.process("echo hi\r\n", "echo hi").is_none());
    }

    #[test]
    fn completion_frame_carries_no_user_content() {
        let mut processor = MessageProcessor::new(TerminalProfile::Generic);
        let chunk = processor
            .process("leftovers\x1b]697;ExitCode=0\x07", "")
            .unwrap();
        assert_eq!(chunk.kind, ChunkType::Complete);
        assert_eq!(chunk.content, "");
        assert_eq!(chunk.metadata["profile"], "generic");
    }

    #[test]
    fn tool_use_frame_records_tool_name() {
        let mut processor = MessageProcessor::new(TerminalProfile::Assistant);
        let chunk = processor
            .process("🛠️  Using tool: read_file", "")
            .unwrap();
        assert_eq!(chunk.kind, ChunkType::ToolUse);
        assert_eq!(chunk.content, "");
        assert_eq!(chunk.metadata["tool_name"], "read_file");
    }

    #[test]
    fn styling_only_frame_emits_nothing() {
        let mut processor = MessageProcessor::new(TerminalProfile::Assistant);
        assert!(processor.process("text", "").is_some());
        assert!(processor.process("\x1b[2K\x1b[1G", "").is_none());
    }
}
