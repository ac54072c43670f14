//! Reconstruction of clean text and semantic type from raw terminal bytes.
//!
//! Two strategies exist behind [`OutputParser`]: a regex cleaning pipeline
//! for ordinary shells and a structured ANSI decoder for the assistant CLI.
//! Both are per-session objects; the type of the previous chunk is instance
//! state used to classify content-free follow-up frames.

mod assistant;
mod generic;

pub use assistant::{AssistantMarkers, AssistantParser};
pub use generic::{GenericParser, PromptHooks};

use crate::model::{ChunkType, TerminalProfile};

/// Result of one parser call: extracted text plus its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub clean: String,
    pub kind: ChunkType,
    /// Populated on `ToolUse` chunks by the assistant parser.
    pub tool_name: Option<String>,
}

/// Per-session output parser, selected by terminal profile.
pub enum OutputParser {
    Generic(GenericParser),
    Assistant(AssistantParser),
}

impl OutputParser {
    pub fn for_profile(profile: TerminalProfile) -> Self {
        match profile {
            TerminalProfile::Generic => OutputParser::Generic(GenericParser::new()),
            TerminalProfile::Assistant => OutputParser::Assistant(AssistantParser::new()),
        }
    }

    pub fn parse(&mut self, raw: &str) -> ParsedOutput {
        match self {
            OutputParser::Generic(parser) => parser.parse(raw),
            OutputParser::Assistant(parser) => parser.parse(raw),
        }
    }
}
