//! Turn records: one player-input / narrative-output cycle.

use serde::{Deserialize, Serialize};

use crate::section::{find_partial_section, find_section_quiet};

/// Player input for one turn.  All fields optional: a turn may carry an
/// in-character action, out-of-character instructions, or (on the corrective
/// path) an error report fed back to the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_of_character: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Vec<String>>,
}

impl UserInput {
    pub fn action(action: Option<String>, instructions: Option<String>) -> Self {
        Self {
            action,
            out_of_character: instructions,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Player,
    Background,
    Illustration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdate {
    pub role: ImageRole,
    pub image_prompt: String,
    pub negative_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Like,
    Dislike,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnFeedback {
    pub feedback_type: FeedbackKind,
    pub feedback_comment: String,
}

/// One committed (or in-flight) turn.
///
/// `writer_response` is the writer phase's full tagged output; the
/// player-visible narrative is the `<narrative>` section inside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnRecord {
    pub turn_number: u32,
    pub writer_response: String,
    pub suggested_actions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input: Option<UserInput>,
    #[serde(rename = "illustrationType")]
    pub illustration_kind: String,
    pub illustration_id: String,
    pub images: Vec<ImageUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<TurnFeedback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critic_feedback: Option<String>,
}

impl TurnRecord {
    pub fn new(turn_number: u32, user_input: Option<UserInput>) -> Self {
        Self {
            turn_number,
            user_input,
            ..Self::default()
        }
    }
}

/// The player-visible narrative of a turn.
///
/// With `partial` set, tolerates a response whose closing tags haven't
/// streamed in yet — used to publish prose mid-phase.
pub fn turn_narrative(turn: &TurnRecord, partial: bool) -> String {
    let section = if partial {
        find_partial_section(&turn.writer_response, "narrative")
    } else {
        find_section_quiet(&turn.writer_response, "narrative")
    };
    section.unwrap_or_default().to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
