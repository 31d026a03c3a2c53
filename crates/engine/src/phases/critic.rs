//! Critic phase: short qualitative feedback on the finished turn, carried
//! into the next turn's writer context.

use async_trait::async_trait;

use fabula_config::LlmConfig;
use fabula_llm::{ChatMessage, LlmParameters};

use crate::conversation::Conversation;
use crate::phase::{Phase, PhaseConfig};
use crate::phases::CRITIC_PROMPT;
use crate::section::find_section;
use crate::state::SessionState;
use crate::validation::TurnValidation;

pub struct CriticPhase {
    config: PhaseConfig,
}

impl CriticPhase {
    pub fn new(llm: &LlmConfig) -> Self {
        Self {
            config: PhaseConfig {
                agent_name: "Critic Agent",
                prompts: vec![CRITIC_PROMPT],
                prefill: String::new(),
                save_to_history: true,
                retry_count: 2,
                use_tools: false,
                llm: LlmParameters::text(&llm.model, 1500, ""),
            },
        }
    }
}

#[async_trait]
impl Phase for CriticPhase {
    fn config(&self) -> &PhaseConfig {
        &self.config
    }

    fn prepare(
        &mut self,
        _state: &mut SessionState,
        conversation: &mut Conversation,
    ) -> anyhow::Result<()> {
        conversation.push(ChatMessage::user(
            Some("Developer"),
            "## Write the short feedback on the current turn",
        ));
        Ok(())
    }

    async fn parse(&mut self, response: &str, state: &mut SessionState) -> TurnValidation {
        let mut result = TurnValidation::ok();
        let feedback = find_section(response, "response", &mut result);
        if result.is_failed() {
            return result;
        }
        state.last_turn_mut().critic_feedback = feedback.map(String::from);
        result
    }
}
