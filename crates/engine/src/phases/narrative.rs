//! Narrative (writer) phase: produces the player-visible prose and suggested
//! actions inside a required tagged structure, publishing partial narrative
//! while the response is still streaming.

use async_trait::async_trait;

use fabula_config::LlmConfig;
use fabula_llm::{ChatMessage, LlmParameters};

use crate::conversation::Conversation;
use crate::orchestrator::TURNS_TO_KEEP_IN_HISTORY;
use crate::phase::{Phase, PhaseConfig};
use crate::phases::{MEMORY_FETCH_RESULT_PROMPT, NARRATIVE_PROMPT};
use crate::section::{find_partial_section, find_section, find_section_quiet};
use crate::state::SessionState;
use crate::turn::turn_narrative;
use crate::validation::TurnValidation;

use super::HISTORY_PROMPT;

pub struct NarrativePhase {
    config: PhaseConfig,
}

impl NarrativePhase {
    pub fn new(llm: &LlmConfig) -> Self {
        Self {
            config: PhaseConfig {
                agent_name: "Writer Agent",
                prompts: vec![NARRATIVE_PROMPT],
                prefill: String::new(),
                save_to_history: true,
                retry_count: 3,
                use_tools: true,
                llm: LlmParameters::text(llm.narrative_model(), 4000, "</response>"),
            },
        }
    }
}

#[async_trait]
impl Phase for NarrativePhase {
    fn config(&self) -> &PhaseConfig {
        &self.config
    }

    /// Rebuild the conversation for the writer: archived context first, then
    /// the trailing turn window replayed verbatim, then the fresh input.
    fn prepare(
        &mut self,
        state: &mut SessionState,
        conversation: &mut Conversation,
    ) -> anyhow::Result<()> {
        conversation.clear();
        conversation.push(ChatMessage::user(
            Some("Developer"),
            state.resolve_prompt(HISTORY_PROMPT)?,
        ));
        conversation.push(ChatMessage::user(
            Some("Developer"),
            state.resolve_prompt(MEMORY_FETCH_RESULT_PROMPT)?,
        ));

        let len = state.turns.len() as i64;
        let first_history = len - 1 - TURNS_TO_KEEP_IN_HISTORY;
        for turn in state.recent_turns(first_history, len - 2) {
            if let Some(input) = &turn.user_input {
                conversation.push(ChatMessage::user(
                    Some("Player"),
                    format!(
                        "## Turn {} start\nPlayer input:\n{}",
                        turn.turn_number,
                        serde_json::to_string_pretty(input)?
                    ),
                ));
            }
            if turn.turn_number == 0 {
                conversation.push(ChatMessage::user(
                    Some("Developer"),
                    format!("Turn 0:\n{}", turn.writer_response),
                ));
            } else {
                conversation.push(ChatMessage::assistant(
                    Some("Writer Agent"),
                    format!("<response>{}</response>", turn.writer_response),
                ));
            }
            if turn.critic_feedback.is_some() || turn.feedback.is_some() {
                let mut feedback_message = format!("## Turn {} end\n", turn.turn_number);
                if let Some(critic) = &turn.critic_feedback {
                    feedback_message.push_str(&format!("Critic feedback: {critic}\n"));
                }
                if let Some(feedback) = &turn.feedback {
                    feedback_message.push_str(&format!(
                        "Player feedback: {}",
                        serde_json::to_string_pretty(feedback)?
                    ));
                }
                conversation.push(ChatMessage::user(Some("Developer"), feedback_message));
            }
        }

        let input = serde_json::to_string_pretty(&state.last_turn().user_input)?;
        conversation.push(ChatMessage::user(Some("Player"), input));
        Ok(())
    }

    async fn parse(&mut self, response: &str, state: &mut SessionState) -> TurnValidation {
        let mut result = TurnValidation::ok();
        let wrapped = find_section_quiet(response, "response");
        let base = wrapped.unwrap_or(response);
        find_section(base, "scene", &mut result);
        find_section(base, "narrative", &mut result);
        find_section(base, "notes", &mut result);
        let suggested = find_section(base, "suggestedActions", &mut result);
        if result.is_failed() {
            return result;
        }

        // All inner sections are present: a missing <response> wrapper means
        // the model just forgot the outer tag, so wrap and carry on.
        let response_body = match wrapped {
            Some(body) => body.to_string(),
            None => {
                let repaired = format!("<response>{response}</response>");
                match find_section(&repaired, "response", &mut result) {
                    Some(body) => body.to_string(),
                    None => return result,
                }
            }
        };
        let suggested = suggested.unwrap_or_default().trim().to_string();

        let turn = state.last_turn_mut();
        turn.writer_response = response_body.trim().to_string();
        turn.suggested_actions = suggested;
        result
    }

    /// Mirror the streamed `<response>` prefix into the turn record so the
    /// transport can show prose as soon as the narrative section opens.
    fn on_delta(&mut self, accumulated: &str, state: &mut SessionState) -> bool {
        let partial = find_partial_section(accumulated, "response")
            .unwrap_or_default()
            .to_string();
        state.last_turn_mut().writer_response = partial;
        !turn_narrative(state.last_turn(), true).is_empty()
    }
}
