//! The per-turn state machine: build context, run the phase pipeline, then
//! commit or roll back.
//!
//! All durable state is snapshotted before anything else happens.  Phases
//! mutate the live state as they succeed; the first phase failure aborts the
//! pipeline and the snapshot is restored wholesale, so partial mutations from
//! earlier phases never survive a failed turn.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use fabula_config::LlmConfig;
use fabula_llm::{ChatMessage, ModelClient};

use crate::conversation::Conversation;
use crate::phase::{Phase, TurnNotifier, run_phase};
use crate::phases::{
    CriticPhase, HISTORY_PROMPT, MemoryFetchPhase, MemoryUpdatePhase, NarrativePhase, SummaryPhase,
};
use crate::section::find_section_quiet;
use crate::state::SessionState;
use crate::tools::MemoryToolHandler;
use crate::turn::{TurnRecord, UserInput, turn_narrative};
use crate::validation::TurnValidation;

/// Turns kept out of the narrative archive; older narratives are lazily
/// chunked into the narrative store as they fall past this window.
pub const TURNS_TO_KEEP: i64 = 8;
/// Trailing turns replayed verbatim into the writer's conversation.
pub const TURNS_TO_KEEP_IN_HISTORY: i64 = 4;
/// A summary phase runs once this many turns have accumulated since the
/// last summary.
const TURNS_TO_SUMMARIZE: i64 = 5;

/// The memory-fetch phase needs a previous writer response to work from, so
/// it is skipped until the story has this many turns.
const MIN_TURNS_FOR_MEMORY_FETCH: usize = 3;

pub struct TurnOrchestrator {
    client: Arc<dyn ModelClient>,
    llm: LlmConfig,
    enable_critic: bool,
    conversation: Conversation,
}

impl TurnOrchestrator {
    pub fn new(client: Arc<dyn ModelClient>, llm: LlmConfig) -> Self {
        Self {
            client,
            llm,
            enable_critic: false,
            conversation: Conversation::new(),
        }
    }

    /// Also run the critic phase after each successful pipeline.
    pub fn with_critic(mut self, enable: bool) -> Self {
        self.enable_critic = enable;
        self
    }

    /// Run one full turn.  On any failure the pre-turn snapshot is restored
    /// and the returned validation carries the errors.
    pub async fn perform_turn(
        &mut self,
        state: &mut SessionState,
        user_input: UserInput,
        notify: &TurnNotifier,
    ) -> TurnValidation {
        info!(input = ?user_input, "starting turn");
        let snapshot = state.snapshot();

        let len = state.turns.len() as i64;
        let first_unarchived = len - TURNS_TO_KEEP;
        let first_history = len - TURNS_TO_KEEP_IN_HISTORY;
        debug!(
            archived_window = %format!("{first_unarchived}..{}", first_history - 1),
            history_window = %format!("{first_history}..{}", len - 1),
            "turn context windows"
        );

        // Backfill narrative embeddings for turns that just fell out of the
        // live window, exactly once per turn number.
        for index in 0..first_unarchived.max(0) as usize {
            let turn_number = state.turns[index].turn_number;
            if !state.narrative_store.is_turn_known(turn_number) {
                let narrative = turn_narrative(&state.turns[index], false);
                if let Err(fault) = state
                    .narrative_store
                    .upsert_narrative(turn_number, &narrative)
                    .await
                {
                    warn!(turn = turn_number, %fault, "narrative backfill failed");
                }
            }
        }

        let turn_number = state.turns.len() as u32;
        state
            .turns
            .push(TurnRecord::new(turn_number, Some(user_input)));
        notify(state.last_turn());

        let recent = fetch_recent_turn_narratives(state, first_unarchived, first_history - 1);
        state.set_parameter("RECENT_TURNS", &recent);
        state.set_parameter("TURN_NUMBER", &turn_number.to_string());
        let refmap = state
            .memory_graph
            .entities
            .values()
            .map(|entity| {
                if entity.brief.is_empty() {
                    format!("{} -> {}", entity.id, entity.name)
                } else {
                    format!("{} -> {}, {}", entity.id, entity.name, entity.brief)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        state.set_parameter("REFMAP", &refmap);
        let entity_ids = state
            .memory_graph
            .ids()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        state.set_parameter("EXISTING_ENTITY_IDS", &entity_ids);
        state.set_parameter("SEARCHED_RESULTS", "");
        state.fetched.evict(turn_number);
        let fetched = state.fetched_entities_text(false);
        state.set_parameter("FETCHED_ENTITIES", &fetched);

        // Tools see the memory as it stood when the turn began.
        let tool_handler = MemoryToolHandler::new(state);

        let mut phases: Vec<Box<dyn Phase>> = Vec::new();
        if state.turns.len() >= MIN_TURNS_FOR_MEMORY_FETCH {
            phases.push(Box::new(MemoryFetchPhase::new(&self.llm)));
        }
        phases.push(Box::new(NarrativePhase::new(&self.llm)));
        phases.push(Box::new(MemoryUpdatePhase::new(&self.llm)));
        if self.enable_critic {
            phases.push(Box::new(CriticPhase::new(&self.llm)));
        }

        let mut result = TurnValidation::ok();
        for phase in &mut phases {
            result = run_phase(
                phase.as_mut(),
                state,
                &mut self.conversation,
                self.client.as_ref(),
                &tool_handler,
                notify,
            )
            .await;
            if result.is_failed() {
                break;
            }
            notify(state.last_turn());
        }
        self.conversation.clear();

        // The summary runs outside the pipeline's success/failure boundary:
        // its own failure never cancels the turn.
        if result.is_success()
            && state.turns.len() as i64 - state.last_summarized_turn > TURNS_TO_SUMMARIZE
        {
            self.run_summary(state, &tool_handler, notify).await;
        }

        if result.is_failed() {
            error!(errors = ?result.errors, "turn failed, rolling back");
            if let Err(fault) = state.restore(snapshot).await {
                result.push(format!("rollback failed: {fault:#}"));
            }
            notify(state.last_turn());
        }
        for name in ["RECENT_TURNS", "FETCHED_ENTITIES", "REFMAP", "SEARCHED_RESULTS"] {
            state.remove_parameter(name);
        }
        result
    }

    async fn run_summary(
        &mut self,
        state: &mut SessionState,
        tool_handler: &MemoryToolHandler,
        notify: &TurnNotifier,
    ) {
        let history = match state.resolve_prompt(HISTORY_PROMPT) {
            Ok(history) => history,
            Err(fault) => {
                warn!(%fault, "summary skipped: history prompt unavailable");
                return;
            }
        };
        self.conversation
            .push(ChatMessage::user(Some("History Provider"), history));
        let to_summarize = fetch_recent_turn_narratives(
            state,
            state.last_summarized_turn + 1,
            state.turns.len() as i64 - 1,
        );
        state.set_parameter("TURNS_TO_SUMMARIZE", &to_summarize);

        let mut phase = SummaryPhase::new(&self.llm);
        let summary_result = run_phase(
            &mut phase,
            state,
            &mut self.conversation,
            self.client.as_ref(),
            tool_handler,
            notify,
        )
        .await;
        if summary_result.is_failed() {
            warn!(errors = ?summary_result.errors, "summary phase failed");
        }
        state.remove_parameter("TURNS_TO_SUMMARIZE");
        self.conversation.clear();
    }
}

/// Render a turn range for prompt injection: input, narrative, notes, and
/// player feedback per turn.
fn fetch_recent_turn_narratives(state: &SessionState, first: i64, last_inclusive: i64) -> String {
    let mut text = String::new();
    for turn in state.recent_turns(first, last_inclusive) {
        text.push_str(&format!("\n--Turn {}:\n", turn.turn_number));
        if let Some(input) = &turn.user_input {
            text.push_str(&format!(
                ">{}\n",
                serde_json::to_string(input).unwrap_or_default()
            ));
        }
        text.push_str(&turn_narrative(turn, false));
        text.push_str("\nNotes:\n");
        text.push_str(find_section_quiet(&turn.writer_response, "notes").unwrap_or_default());
        if let Some(feedback) = &turn.feedback {
            text.push_str(&format!(
                "Player feedback: {}\n",
                serde_json::to_string(feedback).unwrap_or_default()
            ));
        }
    }
    text
}
