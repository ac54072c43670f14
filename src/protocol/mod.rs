//! Wire framing for the ttyd terminal-sharing protocol.
//!
//! Every frame after the JSON init message is prefixed with a single byte:
//! `'0'` carries input (client→server) or output (server→client), `'1'`
//! carries a resize request (client→server) or a window title
//! (server→client), `'2'` carries server preferences.

mod client;

pub use client::{ProtocolClient, ProtocolError, ProtocolEvent, ProtocolState};

use serde::Serialize;

pub const INPUT_PREFIX: char = '0';
pub const RESIZE_PREFIX: char = '1';

/// First frame after the WebSocket handshake; the `AuthToken` field is the
/// second half of ttyd's dual authentication.
#[derive(Debug, Serialize)]
pub struct InitFrame<'a> {
    pub columns: u16,
    pub rows: u16,
    #[serde(rename = "AuthToken")]
    pub auth_token: &'a str,
}

#[derive(Debug, Serialize)]
struct ResizePayload {
    columns: u16,
    rows: u16,
}

pub fn encode_input(data: &str) -> String {
    format!("{INPUT_PREFIX}{data}")
}

pub fn encode_resize(rows: u16, columns: u16) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_string(&ResizePayload { columns, rows })?;
    Ok(format!("{RESIZE_PREFIX}{payload}"))
}

/// Server→client frames, demultiplexed by prefix byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Output(String),
    WindowTitle(String),
    Preferences(String),
    Unknown(char),
}

pub fn decode_server_frame(raw: &str) -> Option<ServerFrame> {
    let mut chars = raw.chars();
    let prefix = chars.next()?;
    let payload = chars.as_str().to_string();
    Some(match prefix {
        '0' => ServerFrame::Output(payload),
        '1' => ServerFrame::WindowTitle(payload),
        '2' => ServerFrame::Preferences(payload),
        other => ServerFrame::Unknown(other),
    })
}
