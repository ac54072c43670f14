use once_cell::sync::Lazy;
use regex::Regex;
use vte::{Params, Parser, Perform};

use super::ParsedOutput;
use crate::model::ChunkType;

/// Braille spinner frames the assistant CLI animates while reasoning.
const SPINNER_GLYPHS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

static TOOL_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)Using tool:\s*([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
        Regex::new(r"(?i)🛠️\s*Using tool:\s*([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
        Regex::new(r"(?i)tool:\s*([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
    ]
});

/// Text markers tied to the assistant CLI's current output conventions.
/// Carried as data so a new CLI release means new markers, not new code.
#[derive(Debug, Clone)]
pub struct AssistantMarkers {
    /// Prompt-resumption marker; with a trailing CR it signals completion.
    pub prompt_marker: String,
    /// Token that must co-occur with a spinner glyph to count as thinking.
    pub thinking_token: String,
    /// Tool-invocation banner, matched case-insensitively.
    pub tool_banner: String,
}

impl Default for AssistantMarkers {
    fn default() -> Self {
        Self {
            prompt_marker: "!>".into(),
            thinking_token: "Thinking".into(),
            tool_banner: "Using tool:".into(),
        }
    }
}

/// Parser for the assistant CLI: a persistent [`vte::Parser`] extracts plain
/// text, then a fixed-priority heuristic classifies each frame.
///
/// Keeping one `vte::Parser` per session is what makes frame boundaries
/// inside escape sequences safe: an unfinished sequence is held in the
/// decoder's state and resumes with the next frame.
pub struct AssistantParser {
    decoder: Parser,
    markers: AssistantMarkers,
    last_kind: ChunkType,
}

impl AssistantParser {
    pub fn new() -> Self {
        Self::with_markers(AssistantMarkers::default())
    }

    pub fn with_markers(markers: AssistantMarkers) -> Self {
        Self {
            decoder: Parser::new(),
            markers,
            last_kind: ChunkType::Content,
        }
    }

    pub fn parse(&mut self, raw: &str) -> ParsedOutput {
        let mut collector = TextCollector::default();
        for byte in raw.as_bytes() {
            self.decoder.advance(&mut collector, *byte);
        }
        let clean = collector.text;

        let kind = self.classify(&clean);
        self.last_kind = kind;

        let tool_name =
            (kind == ChunkType::ToolUse).then(|| extract_tool_name(&clean));

        ParsedOutput {
            clean,
            kind,
            tool_name,
        }
    }

    fn classify(&self, clean: &str) -> ChunkType {
        if clean.contains(self.markers.prompt_marker.as_str()) && clean.ends_with('\r') {
            return ChunkType::Complete;
        }
        if clean.contains(self.markers.thinking_token.as_str())
            && clean.chars().any(|c| SPINNER_GLYPHS.contains(&c))
        {
            return ChunkType::Thinking;
        }
        if clean
            .to_lowercase()
            .contains(&self.markers.tool_banner.to_lowercase())
        {
            return ChunkType::ToolUse;
        }
        if !clean.trim().is_empty() {
            return ChunkType::Content;
        }
        self.last_kind
    }
}

impl Default for AssistantParser {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_tool_name(clean: &str) -> String {
    for pattern in TOOL_NAME_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(clean) {
            return captures[1].to_string();
        }
    }
    "unknown".to_string()
}

/// `Perform` sink that keeps printable text and line structure and drops
/// every control sequence.
#[derive(Default)]
struct TextCollector {
    text: String,
}

impl Perform for TextCollector {
    fn print(&mut self, c: char) {
        self.text.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.text.push('\n'),
            b'\r' => self.text.push('\r'),
            b'\t' => self.text.push('\t'),
            0x08 => {
                self.text.pop();
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}
