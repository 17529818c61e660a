//! Frames exchanged with terminal clients.

use serde::{Deserialize, Serialize};

fn default_username() -> String {
    "root".to_string()
}

/// Server-to-client event. Serialised with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalEvent {
    #[serde(rename = "ssh_connected")]
    Connected { terminal_id: String },

    #[serde(rename = "ssh_output")]
    Output { terminal_id: String, output: String },

    #[serde(rename = "ssh_error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_id: Option<String>,
        error: String,
    },

    #[serde(rename = "ssh_disconnected")]
    Disconnected { terminal_id: String },
}

impl TerminalEvent {
    pub fn terminal_id(&self) -> Option<&str> {
        match self {
            TerminalEvent::Connected { terminal_id }
            | TerminalEvent::Output { terminal_id, .. }
            | TerminalEvent::Disconnected { terminal_id } => Some(terminal_id),
            TerminalEvent::Error { terminal_id, .. } => terminal_id.as_deref(),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, TerminalEvent::Disconnected { .. })
    }
}

/// Client-to-server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "ssh_connect")]
    Connect {
        vm_id: String,
        #[serde(default = "default_username")]
        username: String,
    },

    #[serde(rename = "ssh_input")]
    Input { terminal_id: String, input: String },

    #[serde(rename = "ssh_disconnect")]
    Disconnect { terminal_id: String },
}
