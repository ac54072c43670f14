use once_cell::sync::Lazy;
use regex::Regex;

use super::ParsedOutput;
use crate::model::ChunkType;

static OSC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\][^\x07]*\x07").unwrap());
static CSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[mGKHfABCDsuJ]").unwrap());
static PRIVATE_MODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[\?[0-9;]*[hl]").unwrap());
static CURSOR_SAVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b[78]").unwrap());
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {3,}").unwrap());

/// Out-of-band completion markers a shell prompt hook writes around each
/// command. Detection runs on the raw text, before any cleaning.
///
/// These track the current conventions of the proxied shell setup; swap the
/// marker set rather than the state machine when those conventions move.
#[derive(Debug, Clone)]
pub struct PromptHooks {
    pub markers: Vec<String>,
}

impl Default for PromptHooks {
    fn default() -> Self {
        Self {
            markers: vec![
                // new command start, the most reliable completion signal
                "\x1b]697;NewCmd=".into(),
                "\x1b]697;ExitCode=".into(),
                "\x1b]697;EndPrompt\x07".into(),
            ],
        }
    }
}

impl PromptHooks {
    fn matches(&self, raw: &str) -> bool {
        self.markers.iter().any(|marker| raw.contains(marker.as_str()))
    }
}

/// Parser for ordinary shell output: completion via prompt-hook markers,
/// cleaning via a fixed strip-and-collapse pipeline.
pub struct GenericParser {
    hooks: PromptHooks,
    last_kind: ChunkType,
}

impl GenericParser {
    pub fn new() -> Self {
        Self::with_hooks(PromptHooks::default())
    }

    pub fn with_hooks(hooks: PromptHooks) -> Self {
        Self {
            hooks,
            last_kind: ChunkType::Content,
        }
    }

    pub fn parse(&mut self, raw: &str) -> ParsedOutput {
        let complete = self.hooks.matches(raw);
        let clean = clean_terminal_output(raw);

        let kind = if complete {
            ChunkType::Complete
        } else if !clean.trim().is_empty() {
            ChunkType::Content
        } else {
            self.last_kind
        };
        self.last_kind = kind;

        ParsedOutput {
            clean,
            kind,
            tool_name: None,
        }
    }
}

impl Default for GenericParser {
    fn default() -> Self {
        Self::new()
    }
}

fn clean_terminal_output(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = OSC_RE.replace_all(text, "");
    let text = CSI_RE.replace_all(&text, "");
    let text = PRIVATE_MODE_RE.replace_all(&text, "");
    let text = CURSOR_SAVE_RE.replace_all(&text, "");
    let text = text.replace('\r', "");
    let text = BLANK_RUN_RE.replace_all(&text, "\n\n");
    let text = SPACE_RUN_RE.replace_all(&text, " ");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_and_collapses_whitespace() {
        let mut parser = GenericParser::new();
        let raw = "\x1b[32mhello\x1b[0m\r\n\x1b]0;title\x07world\n\n\n\nend     done\x1b[?25l\x1b7";
        let parsed = parser.parse(raw);
        assert_eq!(parsed.kind, ChunkType::Content);
        assert_eq!(parsed.clean, "hello\nworld\n\nend done");
    }

    #[test]
    fn prompt_hook_marker_wins_over_content() {
        let mut parser = GenericParser::new();
        let parsed = parser.parse("some trailing output\x1b]697;ExitCode=0\x07");
        assert_eq!(parsed.kind, ChunkType::Complete);
    }

    #[test]
    fn each_default_marker_signals_completion() {
        for raw in [
            "\x1b]697;NewCmd=abc123\x07",
            "\x1b]697;ExitCode=1\x07",
            "\x1b]697;EndPrompt\x07",
        ] {
            let mut parser = GenericParser::new();
            assert_eq!(parser.parse(raw).kind, ChunkType::Complete, "raw: {raw:?}");
        }
    }

    #[test]
    fn empty_output_repeats_previous_kind() {
        let mut parser = GenericParser::new();
        assert_eq!(parser.parse("data").kind, ChunkType::Content);
        assert_eq!(parser.parse("\x1b[0m\r").kind, ChunkType::Content);
        assert_eq!(parser.parse("\x1b]697;NewCmd=\x07").kind, ChunkType::Complete);
        assert_eq!(parser.parse("").kind, ChunkType::Complete);
    }

    #[test]
    fn custom_hooks_replace_defaults() {
        let hooks = PromptHooks {
            markers: vec!["\x1b]133;D\x07".into()],
        };
        let mut parser = GenericParser::with_hooks(hooks);
        assert_eq!(parser.parse("\x1b]133;D\x07").kind, ChunkType::Complete);
        assert_eq!(parser.parse("\x1b]697;ExitCode=0\x07ok").kind, ChunkType::Content);
    }
}
