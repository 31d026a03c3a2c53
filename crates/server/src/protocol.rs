//! Wire protocol of the line-delimited JSON transport.
//!
//! One JSON object per line in both directions.  Field names match the
//! browser client's message shapes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use fabula_engine::{ImageRole, TurnRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Submit a player turn.  Starts a new adventure when none is running.
    #[serde(rename_all = "camelCase")]
    Action {
        #[serde(default)]
        character_action: Option<String>,
        #[serde(default)]
        instructions: Option<String>,
    },
    /// Rate the latest turn.
    #[serde(rename_all = "camelCase")]
    Feedback {
        feedback_type: String,
        feedback_comment: String,
    },
    /// Drop the cached image for a role and regenerate it.
    #[serde(rename_all = "camelCase")]
    RefreshImage { role: ImageRole },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    TurnUpdate { content: TurnRecord },
    LlmRunning { content: bool },
    /// Generated image files for a role, newest first.
    #[serde(rename_all = "camelCase")]
    ImageUpdate { role: ImageRole, files: Vec<PathBuf> },
    Error { error: String },
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_command_parses_client_shape() {
        let raw = r#"{"type":"action","characterAction":"look around","instructions":null}"#;
        let command: ClientCommand = serde_json::from_str(raw).unwrap();
        match command {
            ClientCommand::Action {
                character_action,
                instructions,
            } => {
                assert_eq!(character_action.as_deref(), Some("look around"));
                assert!(instructions.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn refresh_image_roundtrip() {
        let command = ClientCommand::RefreshImage {
            role: ImageRole::Background,
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"type\":\"refresh-image\""));
        assert!(json.contains("\"role\":\"background\""));
        let back: ClientCommand = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ClientCommand::RefreshImage { role } if role == ImageRole::Background));
    }

    #[test]
    fn server_events_are_tagged() {
        let event = ServerEvent::LlmRunning { content: true };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"llm-running\""));
    }
}
