//! Memory-fetch phase: the model names entity ids to pull into context and
//! free-text queries to run against the semantic memory.

use async_trait::async_trait;
use serde::Deserialize;

use fabula_config::LlmConfig;
use fabula_llm::{ChatMessage, LlmParameters, parse_json_response};

use crate::conversation::Conversation;
use crate::phase::{Phase, PhaseConfig};
use crate::phases::MEMORY_FETCH_PROMPT;
use crate::state::SessionState;
use crate::validation::TurnValidation;

const ENTITY_RESULT_COUNT: usize = 5;
const NARRATIVE_RESULT_COUNT: usize = 10;

#[derive(Debug, Deserialize)]
struct MemoryFetchResponse {
    entities: Vec<String>,
    search: Vec<String>,
}

pub struct MemoryFetchPhase {
    config: PhaseConfig,
}

impl MemoryFetchPhase {
    pub fn new(llm: &LlmConfig) -> Self {
        Self {
            config: PhaseConfig {
                agent_name: "Search Agent",
                prompts: vec![MEMORY_FETCH_PROMPT],
                prefill: String::new(),
                save_to_history: true,
                retry_count: 3,
                use_tools: false,
                llm: LlmParameters::json(llm.memory_fetch_model(), 200),
            },
        }
    }
}

#[async_trait]
impl Phase for MemoryFetchPhase {
    fn config(&self) -> &PhaseConfig {
        &self.config
    }

    fn prepare(
        &mut self,
        state: &mut SessionState,
        conversation: &mut Conversation,
    ) -> anyhow::Result<()> {
        conversation.clear();
        // The previous turn's full writer output plus the fresh player input
        // is all the context the search agent needs.
        let previous_response = state
            .turns
            .iter()
            .rev()
            .nth(1)
            .map(|turn| turn.writer_response.clone())
            .unwrap_or_default();
        conversation.push(ChatMessage::user(Some("Writer"), previous_response));
        let input = serde_json::to_string_pretty(&state.last_turn().user_input)?;
        conversation.push(ChatMessage::user(Some("Player"), input));
        Ok(())
    }

    async fn parse(&mut self, response: &str, state: &mut SessionState) -> TurnValidation {
        let mut result = TurnValidation::ok();
        let parsed: MemoryFetchResponse = match parse_json_response(response) {
            Ok(parsed) => parsed,
            Err(error) => return TurnValidation::error(format!("Failed to parse response: {error}")),
        };

        for entity_id in &parsed.entities {
            let entity_id = entity_id.trim();
            if state.memory_graph.contains(entity_id) {
                state.add_fetched_entity(entity_id);
            } else {
                result.push(format!("Invalid entity id '{entity_id}'"));
            }
        }
        if parsed.search.is_empty() {
            result.push("No search terms provided");
        }

        let exclude = state.fetched.ids();
        match state
            .entity_store
            .search_multiple(&parsed.search, ENTITY_RESULT_COUNT, &exclude)
            .await
        {
            Ok(hits) => {
                for hit in hits {
                    state.add_fetched_entity(&hit.chunk.id);
                }
            }
            Err(error) => result.push(format!("entity search failed: {error}")),
        }

        let mut search_results = Vec::new();
        match state
            .narrative_store
            .search_multiple(&parsed.search, NARRATIVE_RESULT_COUNT, &[])
            .await
        {
            Ok(hits) => {
                for hit in hits {
                    match hit.chunk.meta.paragraph_id {
                        Some((turn, index)) => {
                            search_results.push(format!("Turn {turn} p{index}: {}", hit.chunk.text))
                        }
                        None => search_results.push(hit.chunk.text),
                    }
                }
            }
            Err(error) => result.push(format!("narrative search failed: {error}")),
        }

        if result.is_failed() {
            return result;
        }
        let fetched = state.fetched_entities_text(false);
        state.set_parameter("FETCHED_ENTITIES", &fetched);
        state.set_parameter("SEARCHED_RESULTS", &search_results.join("\n"));
        result
    }
}
