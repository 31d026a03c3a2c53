//! The adventure session: durable state plus the orchestrator, exposed to the
//! transport layer through start / perform-turn / feedback operations and a
//! broadcast event stream.
//!
//! One session per client connection; sessions share nothing.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use fabula_config::AppConfig;
use fabula_llm::ModelClient;
use fabula_memory::SharedEmbedder;

use crate::events::EngineEvent;
use crate::orchestrator::TurnOrchestrator;
use crate::prompt::FilePrompts;
use crate::state::{ImagePromptParameters, SessionSnapshot, SessionState, StoryParameters};
use crate::turn::{TurnFeedback, TurnRecord, UserInput};
use crate::validation::TurnValidation;

/// Rotating backups kept next to the main state file.
const MAX_SAVE_FILES: usize = 4;
const STATE_FILE_STEM: &str = "adventure-state";

/// Broadcast capacity; slow subscribers drop old events.
const EVENT_CHANNEL_CAP: usize = 256;

pub struct AdventureSession {
    state: SessionState,
    orchestrator: TurnOrchestrator,
    events: broadcast::Sender<EngineEvent>,
    saved_dir: PathBuf,
    llm_running: bool,
}

impl AdventureSession {
    pub fn new(config: &AppConfig, client: Arc<dyn ModelClient>, embedder: SharedEmbedder) -> Self {
        let prompts = Arc::new(FilePrompts::new(&config.story.prompts_dir));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            state: SessionState::new(embedder, prompts),
            orchestrator: TurnOrchestrator::new(client, config.llm.clone()),
            events,
            saved_dir: PathBuf::from(&config.story.saved_dir),
            llm_running: false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Restore the last saved session, when one exists.
    pub async fn start(&mut self) -> Result<()> {
        let path = self.state_file();
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading saved state {}", path.display()))?;
        let snapshot: SessionSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("parsing saved state {}", path.display()))?;
        self.state.restore(snapshot).await?;
        info!(turns = self.state.turns.len(), "session resumed from disk");
        Ok(())
    }

    pub fn is_story_started(&self) -> bool {
        self.state.turns.len() > 1
    }

    pub fn is_llm_running(&self) -> bool {
        self.llm_running
    }

    pub fn all_turns(&self) -> &[TurnRecord] {
        &self.state.turns
    }

    pub fn last_turn(&self) -> Option<&TurnRecord> {
        self.state.turns.last()
    }

    pub fn image_parameters(&self) -> &ImagePromptParameters {
        &self.state.image_prompts
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Reset to a fresh story and run its opening turn.
    pub async fn start_story(&mut self, story: StoryParameters) -> Result<TurnValidation> {
        info!("*** starting adventure ***");
        self.state.init_story(story).await?;
        self.emit_last_turn();
        let first_input = format!(
            "[first action from automated system]: {}",
            self.state.parameter_or_default("FIRST_INPUT", "Begin the story")
        );
        Ok(self.perform_turn(None, Some(first_input)).await)
    }

    /// Run one player turn; commits on success, rolls back on failure.
    pub async fn perform_turn(
        &mut self,
        action: Option<String>,
        instructions: Option<String>,
    ) -> TurnValidation {
        self.set_llm_running(true);
        let events = self.events.clone();
        let notify = move |turn: &TurnRecord| {
            let _ = events.send(EngineEvent::TurnUpdated(turn.clone()));
        };
        let input = UserInput::action(action, instructions);
        let result = self
            .orchestrator
            .perform_turn(&mut self.state, input, &notify)
            .await;
        self.set_llm_running(false);

        if result.is_failed() {
            // Cancellation marker: the client drops its optimistic turn.
            let marker = TurnRecord {
                turn_number: self.state.current_turn_number() + 1,
                writer_response: "<narrative>[TURN CANCELLED]</narrative>".to_string(),
                ..TurnRecord::default()
            };
            let _ = self.events.send(EngineEvent::TurnUpdated(marker));
            return result;
        }

        if let Err(fault) = self.save_state() {
            warn!(%fault, "failed to persist session state");
        }
        self.emit_last_turn();
        if let Some(turn) = self.state.turns.last() {
            for image in &turn.images {
                let _ = self.events.send(EngineEvent::ImageRequested(image.clone()));
            }
        }
        result
    }

    pub fn add_feedback(&mut self, feedback: TurnFeedback) {
        if self.state.turns.is_empty() {
            return;
        }
        self.state.last_turn_mut().feedback = Some(feedback);
    }

    fn set_llm_running(&mut self, running: bool) {
        self.llm_running = running;
        let _ = self.events.send(EngineEvent::LlmRunningChanged(running));
    }

    fn emit_last_turn(&self) {
        if let Some(turn) = self.state.turns.last() {
            let _ = self.events.send(EngineEvent::TurnUpdated(turn.clone()));
        }
    }

    fn state_file(&self) -> PathBuf {
        self.saved_dir.join(format!("{STATE_FILE_STEM}.json"))
    }

    fn backup_file(&self, index: usize) -> PathBuf {
        self.saved_dir.join(format!("{STATE_FILE_STEM}-{index}.json"))
    }

    /// Persist the current snapshot, rotating the numbered backups: the
    /// oldest is deleted, the rest shift up, and the previous main file
    /// becomes backup 1.
    fn save_state(&self) -> Result<()> {
        fs::create_dir_all(&self.saved_dir)
            .with_context(|| format!("creating {}", self.saved_dir.display()))?;

        let oldest = self.backup_file(MAX_SAVE_FILES);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..MAX_SAVE_FILES).rev() {
            let current = self.backup_file(index);
            if current.exists() {
                fs::rename(&current, self.backup_file(index + 1))?;
            }
        }
        let main = self.state_file();
        if main.exists() {
            fs::rename(&main, self.backup_file(1))?;
        }

        let rendered = serde_json::to_string_pretty(&self.state.snapshot())?;
        fs::write(&main, rendered).with_context(|| format!("writing {}", main.display()))?;
        Ok(())
    }
}
