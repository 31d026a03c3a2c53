//! The phase framework: one model round with validation and retry.
//!
//! A phase owns its prompt sources, model parameters, and retry budget.  The
//! driver [`run_phase`] handles everything generic — conversation snapshot,
//! system-prompt swap, streaming, stop-sequence normalization, corrective
//! retries — and delegates preparation, parsing, and history finalization to
//! the phase implementation.
//!
//! Retries carry state only through conversation content: the corrective user
//! message is the sole thing a failed attempt leaves behind, and phase side
//! effects (graph merges, turn-field writes) happen only after validation
//! succeeds, so a retry can never duplicate them.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use fabula_llm::{ChatMessage, LlmParameters, ModelClient, ToolHandler};

use crate::conversation::Conversation;
use crate::state::SessionState;
use crate::tools;
use crate::turn::TurnRecord;
use crate::validation::TurnValidation;

#[derive(Debug, Clone)]
pub struct PhaseConfig {
    /// Speaker label used when the response is appended to the history.
    pub agent_name: &'static str,
    /// Prompt template names, concatenated into the system message.
    pub prompts: Vec<&'static str>,
    /// Assistant prefill pushed before the model call; also seeds the
    /// accumulated-response buffer.
    pub prefill: String,
    /// Append the raw response to the conversation history on success.
    pub save_to_history: bool,
    pub retry_count: u32,
    /// Expose the memory-search tools to the model during this phase.
    pub use_tools: bool,
    pub llm: LlmParameters,
}

/// Callback used to publish the in-flight turn to transport subscribers.
pub type TurnNotifier = dyn Fn(&TurnRecord) + Send + Sync;

#[async_trait]
pub trait Phase: Send {
    fn config(&self) -> &PhaseConfig;

    /// Stage additional context messages before the model call.
    fn prepare(
        &mut self,
        state: &mut SessionState,
        conversation: &mut Conversation,
    ) -> anyhow::Result<()> {
        let _ = (state, conversation);
        Ok(())
    }

    /// Parse and validate the accumulated response, applying state mutations
    /// only when the whole response validates.
    async fn parse(&mut self, response: &str, state: &mut SessionState) -> TurnValidation;

    /// Observe the accumulated response as it streams; return `true` to
    /// publish a turn update.
    fn on_delta(&mut self, accumulated: &str, state: &mut SessionState) -> bool {
        let _ = (accumulated, state);
        false
    }

    /// Final history adjustments after a successful attempt.
    fn finalize_history(&mut self, state: &mut SessionState, conversation: &mut Conversation) {
        let _ = (state, conversation);
    }
}

/// Drive one phase to success or retry exhaustion.
pub async fn run_phase(
    phase: &mut dyn Phase,
    state: &mut SessionState,
    conversation: &mut Conversation,
    client: &dyn ModelClient,
    tool_handler: &dyn ToolHandler,
    notify: &TurnNotifier,
) -> TurnValidation {
    let config = phase.config().clone();

    let mut system_prompt = String::new();
    for name in &config.prompts {
        match state.resolve_prompt(name) {
            Ok(text) => system_prompt.push_str(&text),
            Err(error) => return TurnValidation::error(format!("{error:#}")),
        }
    }

    let saved_messages = conversation.save();
    if let Err(error) = phase.prepare(state, conversation) {
        return TurnValidation::error(format!("{error:#}"));
    }
    conversation.replace_system(system_prompt);
    let tools_json = config.use_tools.then(tools::definitions);

    let mut result = TurnValidation::ok();
    for attempt in 1..=config.retry_count {
        debug!(agent = config.agent_name, attempt, "phase attempt");
        if !config.prefill.is_empty() {
            conversation.push(ChatMessage::assistant(None, config.prefill.clone()));
        }
        let mut accumulated = config.prefill.clone();

        let streamed = {
            let mut on_delta = |delta: &str| {
                accumulated.push_str(delta);
                if phase.on_delta(&accumulated, state) {
                    notify(state.last_turn());
                }
            };
            client
                .stream(
                    &config.llm,
                    conversation.messages_mut(),
                    tools_json.as_ref(),
                    tool_handler,
                    &mut on_delta,
                )
                .await
        };
        if let Err(fault) = streamed {
            // The client already retried transport hiccups; anything that
            // reaches here fails the turn rather than burning phase retries.
            error!(agent = config.agent_name, %fault, "model call failed");
            return TurnValidation::error(format!("model call failed: {fault}"));
        }

        if !config.llm.stop_sequence.is_empty() && !accumulated.contains(&config.llm.stop_sequence)
        {
            accumulated.push_str(&config.llm.stop_sequence);
        }

        result = if accumulated.is_empty() {
            TurnValidation::error("Response is empty")
        } else {
            phase.parse(&accumulated, state).await
        };

        if result.is_failed() {
            error!(agent = config.agent_name, errors = ?result.errors, "phase attempt rejected");
            let corrective = json!({
                "error": "Wrong output format. The message was discarded. Re-generate the \
                          response. Don't perform reasoning or write free-form text, output \
                          only the response.",
                "errorDetails": result.errors,
            });
            conversation.push(ChatMessage::user(None, corrective.to_string()));
            continue;
        }

        conversation.restore(saved_messages.clone());
        if config.save_to_history {
            conversation.push(ChatMessage::assistant(Some(config.agent_name), accumulated));
        }
        phase.finalize_history(state, conversation);
        return result;
    }
    result
}
