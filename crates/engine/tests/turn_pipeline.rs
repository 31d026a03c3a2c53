//! End-to-end turn pipeline tests against a scripted model client.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use fabula_config::LlmConfig;
use fabula_engine::{
    AdventureSession, Conversation, FeedbackKind, FilePrompts, SessionState, StoryParameters,
    TurnFeedback, TurnOrchestrator, TurnRecord, UserInput, turn_narrative,
};
use fabula_llm::{
    ChatMessage, LlmError, LlmParameters, ModelClient, ToolHandler,
};
use fabula_memory::{EmbedError, Embedder, Entity};

// ── Test doubles ─────────────────────────────────────────────────────────────

/// Replays canned responses in order, streaming them in small chunks.  When
/// `repeat_last` is set, the final response repeats forever (for retry tests).
struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
    repeat_last: bool,
    last: Mutex<Option<String>>,
}

impl ScriptedClient {
    fn new(responses: &[String]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().cloned().collect()),
            repeat_last: false,
            last: Mutex::new(None),
        })
    }

    fn repeating(responses: &[String]) -> Arc<Self> {
        let client = Self {
            responses: Mutex::new(responses.iter().cloned().collect()),
            repeat_last: true,
            last: Mutex::new(None),
        };
        Arc::new(client)
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(
        &self,
        _params: &LlmParameters,
        messages: &mut Vec<ChatMessage>,
        _tools: Option<&serde_json::Value>,
        _handler: &dyn ToolHandler,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError> {
        let next = {
            let mut queue = self.responses.lock().unwrap();
            match queue.pop_front() {
                Some(response) => {
                    *self.last.lock().unwrap() = Some(response.clone());
                    response
                }
                None if self.repeat_last => match self.last.lock().unwrap().clone() {
                    Some(response) => response,
                    None => return Err(LlmError::Transport("script exhausted".to_string())),
                },
                None => return Err(LlmError::Transport("script exhausted".to_string())),
            }
        };
        let chars: Vec<char> = next.chars().collect();
        for chunk in chars.chunks(7) {
            on_delta(&chunk.iter().collect::<String>());
        }
        messages.push(ChatMessage::assistant(None, next.clone()));
        Ok(next)
    }
}

/// Deterministic toy embedding: character statistics, two dimensions.
struct ByteEmbedder;

#[async_trait]
impl Embedder for ByteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let sum: u32 = text.bytes().map(u32::from).sum();
        Ok(vec![(sum % 97) as f32, (text.len() % 89) as f32])
    }

    fn dimension(&self) -> usize {
        2
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn write_prompts(dir: &TempDir) {
    let files = [
        ("history-prompt.txt", "Archive:\n{{STORY_ARCHIVE}}\nRecent:\n{{RECENT_TURNS}}\n"),
        ("memory-fetch-prompt.txt", "Pick entities from: {{EXISTING_ENTITY_IDS}}\n"),
        (
            "memory-fetch-result-prompt.txt",
            "Fetched:\n{{FETCHED_ENTITIES}}\nFound:\n{{SEARCHED_RESULTS}}\n",
        ),
        ("narrative-prompt.txt", "Write the next turn.\n{{NARRATIVE_INSTRUCTIONS}}\n"),
        ("assistant-prompt.txt", "Extract entities and image prompts.\n"),
        ("summarize-prompt.txt", "Summarize:\n{{TURNS_TO_SUMMARIZE}}\n"),
        ("critic-prompt.txt", "Critique the turn.\n"),
    ];
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
}

fn story() -> StoryParameters {
    StoryParameters {
        backstory: "The village of Thornwood sleeps under first snow.".to_string(),
        first_input: "Look around".to_string(),
        narrative_instructions: "Keep it grounded.".to_string(),
        entities: vec![Entity {
            name: "Aria".to_string(),
            info: "a wandering cartographer".to_string(),
            ..Entity::new("hero")
        }],
        important_entities: vec!["hero".to_string()],
        ..StoryParameters::default()
    }
}

async fn fresh_state(dir: &TempDir) -> SessionState {
    write_prompts(dir);
    let mut state = SessionState::new(Arc::new(ByteEmbedder), Arc::new(FilePrompts::new(dir.path())));
    state.init_story(story()).await.unwrap();
    state
}

fn narrative_response() -> String {
    "<response><scene>the village square</scene>\
     <narrative>Snow creaks underfoot as Aria crosses the empty square, \
     the forge's glow the only warmth in sight.</narrative>\
     <notes>quiet morning, forge lit</notes>\
     <suggestedActions>- Visit the forge\n- Head for the gate</suggestedActions></response>"
        .to_string()
}

fn memory_update_response() -> String {
    json!({
        "feedback": "Solid pacing, lean on the cold more.",
        "newEntities": {
            "blacksmith": { "name": "Boris", "info": "keeps the forge burning all winter" }
        },
        "updates": {
            "hero": { "info": "reached the village square" }
        },
        "backgroundPrompt": "snowy village square at dawn",
        "illustrationType": "character",
        "illustrationPrompt": "a blacksmith at a glowing forge",
        "playerPortraitPrompt": "a cloaked cartographer"
    })
    .to_string()
}

/// Memory-update variant for follow-up turns: no new entities, so replaying
/// it never collides with ids created earlier.
fn update_only_response() -> String {
    json!({
        "feedback": "Keep going.",
        "updates": { "hero": { "state": "moving on" } },
        "backgroundPrompt": "a winding village lane",
        "illustrationType": "location",
        "illustrationPrompt": "snow piling against timber walls",
        "playerPortraitPrompt": "a cloaked cartographer"
    })
    .to_string()
}

fn fetch_response() -> String {
    json!({ "entities": ["hero"], "search": ["village forge"] }).to_string()
}

fn summary_response() -> String {
    json!({
        "summary": "Aria reached Thornwood and met its blacksmith.",
        "analysis": "steady opening",
        "plotPlan": "lead Aria toward the frozen pass",
        "userProfile": "explores carefully"
    })
    .to_string()
}

fn no_notify() -> impl Fn(&TurnRecord) + Send + Sync {
    |_turn: &TurnRecord| {}
}

fn orchestrator(client: Arc<dyn ModelClient>) -> TurnOrchestrator {
    TurnOrchestrator::new(client, LlmConfig::default())
}

fn input(text: &str) -> UserInput {
    UserInput::action(Some(text.to_string()), None)
}

// ── Committed turn ───────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_turn_commits_all_phase_effects() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;
    let client = ScriptedClient::new(&[narrative_response(), memory_update_response()]);
    let mut orchestrator = orchestrator(client);

    let result = orchestrator
        .perform_turn(&mut state, input("walk into the square"), &no_notify())
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(state.turns.len(), 2);

    let turn = state.turns.last().unwrap();
    assert!(turn_narrative(turn, false).contains("Snow creaks underfoot"));
    assert_eq!(turn.suggested_actions, "- Visit the forge\n- Head for the gate");
    assert_eq!(turn.illustration_kind, "character");
    assert_eq!(turn.images.len(), 3);
    // Narrative well under 500 words: the critic note flags it.
    assert!(turn.critic_feedback.as_ref().unwrap().contains("CRITICAL"));

    // Graph: new entity created, existing entity's info appended.
    assert!(state.memory_graph.contains("blacksmith"));
    let hero = state.memory_graph.get("hero").unwrap();
    assert_eq!(hero.info, "a wandering cartographer\nreached the village square");

    // Image prompt parameters survive for the next turn.
    assert_eq!(
        state.parameter_or_default("PREVIOUS_BACKGROUND_PROMPT", ""),
        "snowy village square at dawn"
    );
    // Transient parameters are cleared after the turn.
    for name in ["RECENT_TURNS", "FETCHED_ENTITIES", "REFMAP", "SEARCHED_RESULTS"] {
        assert!(!state.parameters.contains_key(name), "{name} should be transient");
    }
}

// ── Rollback ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_update_target_fails_turn_and_rolls_back() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;
    let before = state.snapshot();

    let bad_update = json!({
        "updates": { "E1": { "info": "never created" } },
        "backgroundPrompt": "x",
        "illustrationType": "item",
        "illustrationPrompt": "x",
        "playerPortraitPrompt": "x"
    })
    .to_string();
    let client = ScriptedClient::repeating(&[narrative_response(), bad_update]);
    let mut orchestrator = orchestrator(client);

    let result = orchestrator
        .perform_turn(&mut state, input("poke the void"), &no_notify())
        .await;

    assert!(result.is_failed());
    assert!(
        result.errors.iter().any(|e| e.contains("E1")),
        "errors: {:?}",
        result.errors
    );
    // Everything — turn list, graph, working set, parameters — is back to
    // the pre-turn snapshot, despite the narrative phase having succeeded.
    assert_eq!(state.snapshot(), before);
    assert_eq!(state.turns.len(), 1);
}

#[tokio::test]
async fn narrative_retry_exhaustion_cancels_turn() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;
    let before = state.snapshot();

    // Missing <suggestedActions> on every attempt.
    let incomplete = "<response><scene>s</scene><narrative>n</narrative>\
                      <notes>n</notes></response>"
        .to_string();
    let client = ScriptedClient::repeating(&[incomplete]);
    let mut orchestrator = orchestrator(client);

    let result = orchestrator
        .perform_turn(&mut state, input("try again"), &no_notify())
        .await;

    assert!(result.is_failed());
    assert!(
        result.errors.iter().any(|e| e.contains("suggestedActions")),
        "errors: {:?}",
        result.errors
    );
    assert_eq!(state.turns.len(), 1);
    assert_eq!(state.snapshot(), before);
}

#[tokio::test]
async fn transport_failure_cancels_turn() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;
    let before = state.snapshot();

    let client = ScriptedClient::new(&[]);
    let mut orchestrator = orchestrator(client);
    let result = orchestrator
        .perform_turn(&mut state, input("anything"), &no_notify())
        .await;

    assert!(result.is_failed());
    assert!(result.errors[0].contains("model call failed"));
    assert_eq!(state.snapshot(), before);
}

// ── New-entity collision ─────────────────────────────────────────────────────

#[tokio::test]
async fn new_entity_collision_is_a_validation_error() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;
    let before = state.snapshot();

    let colliding = json!({
        "newEntities": { "hero": { "name": "Impostor" } },
        "backgroundPrompt": "x",
        "illustrationType": "item",
        "illustrationPrompt": "x",
        "playerPortraitPrompt": "x"
    })
    .to_string();
    let client = ScriptedClient::repeating(&[narrative_response(), colliding]);
    let mut orchestrator = orchestrator(client);

    let result = orchestrator
        .perform_turn(&mut state, input("imitate"), &no_notify())
        .await;

    assert!(result.is_failed());
    assert!(result.errors.iter().any(|e| e.contains("hero")));
    assert_eq!(state.snapshot(), before);
    assert_eq!(state.memory_graph.get("hero").unwrap().name, "Aria");
}

// ── Streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn partial_narrative_is_published_while_streaming() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;
    let client = ScriptedClient::new(&[narrative_response(), memory_update_response()]);
    let mut orchestrator = orchestrator(client);

    let published: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = published.clone();
    let notify = move |turn: &TurnRecord| {
        sink.lock().unwrap().push(turn_narrative(turn, true));
    };

    let result = orchestrator
        .perform_turn(&mut state, input("walk"), &notify)
        .await;
    assert!(result.is_success(), "errors: {:?}", result.errors);

    let published = published.lock().unwrap();
    let partials: Vec<&String> = published.iter().filter(|n| !n.is_empty()).collect();
    // Several mid-stream updates, growing monotonically toward the final text.
    assert!(partials.len() > 3, "published {} narratives", partials.len());
    for pair in partials.windows(2) {
        assert!(pair[1].len() >= pair[0].len());
    }
    assert!(partials.last().unwrap().contains("the forge's glow"));
}

// ── Summary cadence ──────────────────────────────────────────────────────────

#[tokio::test]
async fn summary_runs_after_enough_turns_and_extends_archive() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;

    // Per-turn phase scripts; memory fetch joins from the third stored turn.
    let mut script = Vec::new();
    script.extend([narrative_response(), memory_update_response()]); // turn 1
    script.extend([fetch_response(), narrative_response(), update_only_response()]); // turn 2
    script.extend([fetch_response(), narrative_response(), update_only_response()]); // turn 3
    script.extend([fetch_response(), narrative_response(), update_only_response()]); // turn 4
    script.push(summary_response()); // summary after turn 4
    let client = ScriptedClient::new(&script);
    let mut orchestrator = orchestrator(client);

    for n in 1..=4 {
        let result = orchestrator
            .perform_turn(&mut state, input(&format!("step {n}")), &no_notify())
            .await;
        assert!(result.is_success(), "turn {n} errors: {:?}", result.errors);
    }

    assert_eq!(
        state.parameter_or_default("STORY_ARCHIVE", ""),
        "Aria reached Thornwood and met its blacksmith."
    );
    assert_eq!(
        state.parameter_or_default("PLOT_PLAN", ""),
        "lead Aria toward the frozen pass"
    );
    assert_eq!(state.last_summarized_turn, 4);
    assert!(!state.parameters.contains_key("TURNS_TO_SUMMARIZE"));
}

#[tokio::test]
async fn summary_failure_does_not_cancel_the_turn() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;
    // Force the cadence check to fire on the very first turn.
    state.last_summarized_turn = -10;

    // Summary response is rejected (missing plotPlan) on every retry.
    let broken_summary = json!({ "summary": "s", "userProfile": "u" }).to_string();
    let client = ScriptedClient::repeating(&[
        narrative_response(),
        memory_update_response(),
        broken_summary,
    ]);
    let mut orchestrator = orchestrator(client);

    let result = orchestrator
        .perform_turn(&mut state, input("walk"), &no_notify())
        .await;

    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert_eq!(state.turns.len(), 2);
    assert!(!state.parameters.contains_key("STORY_ARCHIVE"));
}

// ── Conversation hygiene ─────────────────────────────────────────────────────

#[tokio::test]
async fn retry_garbage_never_leaks_into_later_phases() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir).await;

    // First narrative attempt malformed, second attempt valid.
    let client = ScriptedClient::new(&[
        "no tags at all".to_string(),
        narrative_response(),
        memory_update_response(),
    ]);
    let mut orchestrator = orchestrator(client);

    let result = orchestrator
        .perform_turn(&mut state, input("persist"), &no_notify())
        .await;
    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert!(turn_narrative(state.turns.last().unwrap(), false).contains("Snow creaks"));
}

// ── Prompt resolution failures ───────────────────────────────────────────────

#[tokio::test]
async fn missing_prompt_file_fails_the_turn_cleanly() {
    let dir = TempDir::new().unwrap();
    // Deliberately do not write any prompt files.
    let mut state =
        SessionState::new(Arc::new(ByteEmbedder), Arc::new(FilePrompts::new(dir.path())));
    state.init_story(story()).await.unwrap();
    let before = state.snapshot();

    let client = ScriptedClient::repeating(&[narrative_response()]);
    let mut orchestrator = orchestrator(client);
    let result = orchestrator
        .perform_turn(&mut state, input("walk"), &no_notify())
        .await;

    assert!(result.is_failed());
    assert_eq!(state.snapshot(), before);
}

// ── Conversation type sanity ─────────────────────────────────────────────────

#[test]
fn conversation_starts_with_system_placeholder() {
    let conversation = Conversation::new();
    assert_eq!(conversation.len(), 1);
}

// ── Session persistence and events ───────────────────────────────────────────

fn session_config(dir: &TempDir) -> fabula_config::AppConfig {
    let mut config = fabula_config::AppConfig::default();
    config.story.prompts_dir = dir.path().join("prompts").display().to_string();
    config.story.saved_dir = dir.path().join("saved").display().to_string();
    config
}

fn write_session_prompts(dir: &TempDir) {
    let prompts = dir.path().join("prompts");
    std::fs::create_dir_all(&prompts).unwrap();
    let source = TempDir::new().unwrap();
    write_prompts(&source);
    for entry in std::fs::read_dir(source.path()).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), prompts.join(entry.file_name())).unwrap();
    }
}

#[tokio::test]
async fn session_persists_state_with_rotating_backups() {
    let dir = TempDir::new().unwrap();
    write_session_prompts(&dir);
    let config = session_config(&dir);

    let script = [
        narrative_response(),
        memory_update_response(),
        fetch_response(),
        narrative_response(),
        update_only_response(),
    ];
    let client = ScriptedClient::new(&script);
    let mut session =
        AdventureSession::new(&config, client, Arc::new(ByteEmbedder));

    let result = session.start_story(story()).await.unwrap();
    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert!(session.is_story_started());
    assert_eq!(session.all_turns().len(), 2);

    let state_file = dir.path().join("saved/adventure-state.json");
    assert!(state_file.exists());

    let result = session.perform_turn(Some("walk on".to_string()), None).await;
    assert!(result.is_success(), "errors: {:?}", result.errors);
    assert!(dir.path().join("saved/adventure-state-1.json").exists());

    // A fresh session resumes from the saved file.
    let client = ScriptedClient::new(&[]);
    let mut resumed =
        AdventureSession::new(&config, client, Arc::new(ByteEmbedder));
    resumed.start().await.unwrap();
    assert_eq!(resumed.all_turns().len(), 3);
    assert_eq!(
        resumed.state().memory_graph.get("hero").unwrap().name,
        "Aria"
    );
}

#[tokio::test]
async fn failed_turn_emits_cancellation_marker() {
    let dir = TempDir::new().unwrap();
    write_session_prompts(&dir);
    let config = session_config(&dir);

    let client = ScriptedClient::new(&[narrative_response(), memory_update_response()]);
    let mut session =
        AdventureSession::new(&config, client, Arc::new(ByteEmbedder));
    session.start_story(story()).await.unwrap();

    let mut events = session.subscribe();
    // Script exhausted: the next turn dies on its first model call.
    let result = session.perform_turn(Some("walk".to_string()), None).await;
    assert!(result.is_failed());
    assert_eq!(session.all_turns().len(), 2);

    let mut saw_running = false;
    let mut saw_cancelled = false;
    while let Ok(event) = events.try_recv() {
        match event {
            fabula_engine::EngineEvent::LlmRunningChanged(true) => saw_running = true,
            fabula_engine::EngineEvent::TurnUpdated(turn) => {
                if turn.writer_response.contains("[TURN CANCELLED]") {
                    saw_cancelled = true;
                }
            }
            _ => {}
        }
    }
    assert!(saw_running);
    assert!(saw_cancelled);
}

#[tokio::test]
async fn feedback_lands_on_the_last_turn() {
    let dir = TempDir::new().unwrap();
    write_session_prompts(&dir);
    let config = session_config(&dir);

    let client = ScriptedClient::new(&[narrative_response(), memory_update_response()]);
    let mut session =
        AdventureSession::new(&config, client, Arc::new(ByteEmbedder));
    session.start_story(story()).await.unwrap();

    session.add_feedback(TurnFeedback {
        feedback_type: FeedbackKind::Like,
        feedback_comment: "loved the forge detail".to_string(),
    });
    let feedback = session.last_turn().unwrap().feedback.as_ref().unwrap();
    assert_eq!(feedback.feedback_comment, "loved the forge detail");
}
