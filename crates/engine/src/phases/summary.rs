//! Summary phase: every few turns, compresses the turns since the last
//! summary into the rolling story archive, plot plan, and user profile.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use fabula_config::LlmConfig;
use fabula_llm::{ChatMessage, LlmParameters, parse_json_response};

use crate::conversation::Conversation;
use crate::phase::{Phase, PhaseConfig};
use crate::phases::SUMMARY_PROMPT;
use crate::state::SessionState;
use crate::validation::TurnValidation;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SummaryResponse {
    summary: String,
    analysis: String,
    plot_plan: String,
    user_profile: String,
}

pub struct SummaryPhase {
    config: PhaseConfig,
}

impl SummaryPhase {
    pub fn new(llm: &LlmConfig) -> Self {
        Self {
            config: PhaseConfig {
                agent_name: "Summary Agent",
                prompts: vec![SUMMARY_PROMPT],
                prefill: String::new(),
                save_to_history: false,
                retry_count: 5,
                use_tools: false,
                llm: LlmParameters::json(&llm.model, 2000),
            },
        }
    }
}

#[async_trait]
impl Phase for SummaryPhase {
    fn config(&self) -> &PhaseConfig {
        &self.config
    }

    fn prepare(
        &mut self,
        _state: &mut SessionState,
        conversation: &mut Conversation,
    ) -> anyhow::Result<()> {
        conversation.push(ChatMessage::user(Some("Developer"), "Summary phase"));
        Ok(())
    }

    async fn parse(&mut self, response: &str, state: &mut SessionState) -> TurnValidation {
        let mut result = TurnValidation::ok();
        let parsed: SummaryResponse = match parse_json_response(response) {
            Ok(parsed) => parsed,
            Err(error) => return TurnValidation::error(format!("Failed to parse response: {error}")),
        };
        if parsed.summary.is_empty() {
            result.push("Summary is missing");
        }
        if parsed.plot_plan.is_empty() {
            result.push("Plot plan is missing");
        }
        if parsed.user_profile.is_empty() {
            result.push("User profile is missing");
        }
        if result.is_failed() {
            return result;
        }

        state.set_parameter("PLOT_PLAN", &parsed.plot_plan);
        state.set_parameter("USER_PROFILE", &parsed.user_profile);
        state.set_parameter("SUMMARY_ANALYSIS", &parsed.analysis);
        info!(summary = %parsed.summary, "story archive extended");
        let archive = state.parameter_or_default("STORY_ARCHIVE", "") + &parsed.summary;
        state.set_parameter("STORY_ARCHIVE", &archive);
        state.last_summarized_turn = state.turns.len() as i64 - 1;
        result
    }
}
