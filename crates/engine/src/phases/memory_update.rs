//! Memory-update (assistant) phase: extracts new and updated entities from
//! the turn, validates them against the graph, derives critic feedback, and
//! produces the three image prompts.

use async_trait::async_trait;
use serde::Deserialize;

use fabula_config::LlmConfig;
use fabula_llm::{ChatMessage, LlmParameters, parse_json_response};
use fabula_memory::MemoryGraphUpdate;

use crate::conversation::Conversation;
use crate::phase::{Phase, PhaseConfig};
use crate::phases::{ASSISTANT_PROMPT, HISTORY_PROMPT};
use crate::state::SessionState;
use crate::turn::{ImageRole, turn_narrative};
use crate::validation::TurnValidation;

/// Narratives under this many words get a CRITICAL length flag.
const NARRATIVE_WORDS_CRITICAL: usize = 500;
/// Narratives under this many words get a warning flag.
const NARRATIVE_WORDS_LOW: usize = 600;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MemoryUpdateResponse {
    feedback: String,
    new_entities: Option<MemoryGraphUpdate>,
    updates: Option<MemoryGraphUpdate>,
    background_prompt: String,
    illustration_type: String,
    illustration_id: String,
    illustration_prompt: String,
    player_portrait_prompt: String,
}

pub struct MemoryUpdatePhase {
    config: PhaseConfig,
}

impl MemoryUpdatePhase {
    pub fn new(llm: &LlmConfig) -> Self {
        Self {
            config: PhaseConfig {
                agent_name: "Assistant Agent",
                prompts: vec![ASSISTANT_PROMPT],
                prefill: String::new(),
                save_to_history: false,
                retry_count: 5,
                use_tools: false,
                llm: LlmParameters::json(llm.assistant_model(), 3000),
            },
        }
    }
}

#[async_trait]
impl Phase for MemoryUpdatePhase {
    fn config(&self) -> &PhaseConfig {
        &self.config
    }

    fn prepare(
        &mut self,
        state: &mut SessionState,
        conversation: &mut Conversation,
    ) -> anyhow::Result<()> {
        conversation.clear();
        // The assistant gets the archive context but not the recent-turn
        // replay; the current turn is injected verbatim below.
        let saved_recent = state.parameter_or_default("RECENT_TURNS", "");
        state.set_parameter("RECENT_TURNS", " ");
        let history = state.resolve_prompt(HISTORY_PROMPT);
        state.set_parameter("RECENT_TURNS", &saved_recent);
        conversation.push(ChatMessage::user(Some("Developer"), history?));

        let turn = state.last_turn();
        conversation.push(ChatMessage::user(
            Some("Player"),
            format!(
                "## Turn {} start\nPlayer input:\n{}",
                turn.turn_number,
                serde_json::to_string_pretty(&turn.user_input)?
            ),
        ));
        conversation.push(ChatMessage::user(
            Some("Writer Agent"),
            turn.writer_response.clone(),
        ));
        Ok(())
    }

    async fn parse(&mut self, response: &str, state: &mut SessionState) -> TurnValidation {
        let mut result = TurnValidation::ok();
        let parsed: MemoryUpdateResponse = match parse_json_response(response) {
            Ok(parsed) => parsed,
            Err(error) => return TurnValidation::error(format!("Failed to parse response: {error}")),
        };

        if !parsed.feedback.is_empty() {
            let word_count = turn_narrative(state.last_turn(), false)
                .split_whitespace()
                .count();
            let mut critic = format!("Feedback: Narrative word count {word_count}");
            if word_count < NARRATIVE_WORDS_CRITICAL {
                critic.push_str(
                    " CRITICAL: Narrative didn't reach the minimum word count. Next turn \
                     should overcompensate for this.\n",
                );
            } else if word_count < NARRATIVE_WORDS_LOW {
                critic.push_str(" Narrative length is dangerously low. Try writing more next time.\n");
            } else {
                critic.push_str(" Narrative length is good. Keep it up!\n");
            }
            state.last_turn_mut().critic_feedback = Some(critic + &parsed.feedback);
        }

        let new_entities = parsed.new_entities.unwrap_or_default();
        let collisions: Vec<&str> = new_entities
            .keys()
            .filter(|id| state.memory_graph.contains(id))
            .map(String::as_str)
            .collect();
        if !collisions.is_empty() {
            result.push(format!(
                "'newEntities' section contains entities already present in memory: {}",
                collisions.join(", ")
            ));
        }

        let updates = parsed.updates.unwrap_or_default();
        for id in updates.keys() {
            if !state.memory_graph.contains(id) {
                result.push(format!("Entity {id} must be added to memory before updating."));
            }
        }

        if parsed.illustration_type.is_empty() {
            result.push("illustrationType is missing");
        }
        if parsed.background_prompt.is_empty() {
            result.push("backgroundPrompt is missing");
        }
        if parsed.illustration_prompt.is_empty() {
            result.push("illustrationPrompt is missing");
        }
        if parsed.player_portrait_prompt.is_empty() {
            result.push("playerPortraitPrompt is missing");
        }
        if result.is_failed() {
            return result;
        }

        // Validation passed — only now do the merges touch the graph.
        result.merge(state.update_memory_graph(&new_entities).await);
        result.merge(state.update_memory_graph(&updates).await);
        if result.is_failed() {
            return result;
        }

        let turn = state.last_turn_mut();
        turn.illustration_kind = parsed.illustration_type.clone();
        turn.illustration_id = parsed.illustration_id.clone();
        let setting = parsed.background_prompt.trim().to_string();
        state.set_parameter("PREVIOUS_BACKGROUND_PROMPT", &setting);
        state.set_parameter("PREVIOUS_PLAYER_PROMPT", parsed.player_portrait_prompt.trim());

        let background = state.make_image_update(ImageRole::Background, &setting, "location");
        state.update_image(background);
        let player = state.make_image_update(
            ImageRole::Player,
            &format!("{}, located in {setting}", parsed.player_portrait_prompt),
            "character",
        );
        state.update_image(player);
        let illustration = state.make_image_update(
            ImageRole::Illustration,
            &format!("{}, located in {setting}", parsed.illustration_prompt),
            &parsed.illustration_type,
        );
        state.update_image(illustration);
        result
    }
}
