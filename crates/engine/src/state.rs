//! Durable session state: turns, prompt parameters, the memory graph, the
//! fetched-entity working set, and the derived vector stores.
//!
//! The value-typed part of the state is snapshotted structurally before every
//! turn; the vector stores are derived data and are rebuilt after a restore.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use fabula_memory::{
    Entity, MemoryGraph, MemoryGraphUpdate, MemoryStore, SharedEmbedder, WorkingSet,
};

use crate::prompt::{PromptSource, substitute};
use crate::turn::{ImageRole, ImageUpdate, TurnRecord, turn_narrative};
use crate::validation::TurnValidation;

// ── Story-start parameters ───────────────────────────────────────────────────

/// Per-kind fragments wrapped around model-produced image prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImagePromptParameters {
    pub model: String,
    pub character_start_prompt: String,
    pub character_end_prompt: String,
    pub character_negative_prompt: String,
    pub items_start_prompt: String,
    pub items_end_prompt: String,
    pub items_negative_prompt: String,
}

/// Everything needed to start a fresh adventure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryParameters {
    pub backstory: String,
    pub novel_instructions: String,
    pub author_style: String,
    pub first_input: String,
    pub narrative_instructions: String,
    pub image_instructions: String,
    pub plot_plan: String,
    pub entities: Vec<Entity>,
    pub important_entities: Vec<String>,
    pub image_parameters: ImagePromptParameters,
}

pub fn load_story_parameters(path: impl AsRef<Path>) -> Result<StoryParameters> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading story parameters {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing story parameters {}", path.display()))
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Structural copy of the durable state, taken before a turn begins and
/// restored wholesale when the turn fails.  Doubles as the on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSnapshot {
    pub turns: Vec<TurnRecord>,
    pub last_summarized_turn: i64,
    pub parameters: BTreeMap<String, String>,
    pub important_entities: Vec<String>,
    pub image_prompts: ImagePromptParameters,
    pub memory_graph: MemoryGraph,
    pub fetched: WorkingSet,
}

// ── Session state ────────────────────────────────────────────────────────────

pub struct SessionState {
    pub turns: Vec<TurnRecord>,
    /// Index of the newest turn already covered by the archived summary;
    /// `-1` until the first summary phase runs.
    pub last_summarized_turn: i64,
    /// Free-form prompt-template substitution values.
    pub parameters: BTreeMap<String, String>,
    /// Entities always included in the fetched-entity context.
    pub important_entities: Vec<String>,
    pub image_prompts: ImagePromptParameters,
    pub memory_graph: MemoryGraph,
    /// Bounded working set of recently referenced entities.
    pub fetched: WorkingSet,
    /// Derived embeddings of entity records.
    pub entity_store: MemoryStore,
    /// Derived embeddings of archived narrative chunks.
    pub narrative_store: MemoryStore,
    embedder: SharedEmbedder,
    prompts: Arc<dyn PromptSource>,
}

impl SessionState {
    pub fn new(embedder: SharedEmbedder, prompts: Arc<dyn PromptSource>) -> Self {
        Self {
            turns: Vec::new(),
            last_summarized_turn: -1,
            parameters: BTreeMap::new(),
            important_entities: Vec::new(),
            image_prompts: ImagePromptParameters::default(),
            memory_graph: MemoryGraph::default(),
            fetched: WorkingSet::default(),
            entity_store: MemoryStore::new(embedder.clone()),
            narrative_store: MemoryStore::new(embedder.clone()),
            embedder,
            prompts,
        }
    }

    /// Reset to a fresh story.
    pub async fn init_story(&mut self, story: StoryParameters) -> Result<()> {
        self.turns.clear();
        self.last_summarized_turn = -1;
        self.parameters.clear();
        self.memory_graph = MemoryGraph::default();
        self.fetched = WorkingSet::default();
        self.entity_store = MemoryStore::new(self.embedder.clone());
        self.narrative_store = MemoryStore::new(self.embedder.clone());

        self.set_parameter("BACKSTORY", &story.backstory);
        self.set_parameter("NOVEL_INSTRUCTIONS", &story.novel_instructions);
        self.set_parameter("AUTHOR_STYLE", &story.author_style);
        self.set_parameter("FIRST_INPUT", &story.first_input);
        self.set_parameter("NARRATIVE_INSTRUCTIONS", &story.narrative_instructions);
        self.set_parameter("IMAGE_PROMPT_INSTRUCTIONS", &story.image_instructions);
        self.set_parameter("PLOT_PLAN", &story.plot_plan);
        self.important_entities = story.important_entities;
        self.image_prompts = story.image_parameters;

        for entity in story.entities {
            self.entity_store
                .upsert_entity(&entity)
                .await
                .map_err(anyhow::Error::from)?;
            self.memory_graph.insert(entity);
        }

        // Turn 0 is synthesized from the backstory; it has no player input.
        self.turns.push(TurnRecord {
            turn_number: 0,
            writer_response: format!("<narrative>\n{}\n</narrative>", story.backstory),
            ..TurnRecord::default()
        });
        info!(entities = self.memory_graph.len(), "story initialized");
        Ok(())
    }

    // ── Parameters ───────────────────────────────────────────────────────

    pub fn set_parameter(&mut self, name: &str, value: &str) {
        self.parameters.insert(name.to_string(), value.to_string());
    }

    pub fn remove_parameter(&mut self, name: &str) {
        self.parameters.remove(name);
    }

    pub fn parameter_or_default(&self, name: &str, default: &str) -> String {
        self.parameters
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Load a prompt template and substitute `{{PARAM}}` placeholders.
    pub fn resolve_prompt(&self, name: &str) -> Result<String> {
        Ok(substitute(&self.prompts.load(name)?, &self.parameters))
    }

    // ── Turns ────────────────────────────────────────────────────────────

    pub fn last_turn(&self) -> &TurnRecord {
        &self.turns[self.turns.len() - 1]
    }

    pub fn last_turn_mut(&mut self) -> &mut TurnRecord {
        let index = self.turns.len() - 1;
        &mut self.turns[index]
    }

    pub fn current_turn_number(&self) -> u32 {
        self.turns.last().map(|turn| turn.turn_number).unwrap_or(0)
    }

    /// Turns in `[first, last_inclusive]`, clamped to the valid range.
    pub fn recent_turns(&self, first: i64, last_inclusive: i64) -> &[TurnRecord] {
        let len = self.turns.len() as i64;
        let first = first.clamp(0, len);
        let last = (last_inclusive + 1).clamp(first, len);
        &self.turns[first as usize..last as usize]
    }

    // ── Fetched entities ─────────────────────────────────────────────────

    /// Mark an entity as referenced on the current turn.
    pub fn add_fetched_entity(&mut self, id: &str) {
        let turn = self.current_turn_number();
        self.fetched.touch(id, turn);
    }

    /// Entity records rendered for prompt injection: the important entities,
    /// plus the working set (or every known entity when `all` is set).
    pub fn fetched_entities_text(&self, all: bool) -> String {
        let mut ids: Vec<String> = if all {
            self.memory_graph.ids().cloned().collect()
        } else {
            let mut ids = self.important_entities.clone();
            for id in self.fetched.ids() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            ids
        };
        ids.dedup();
        ids.iter()
            .filter_map(|id| self.memory_graph.get(id))
            .map(Entity::to_prompt_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    // ── Memory graph ─────────────────────────────────────────────────────

    /// Merge a batch of entity updates and keep the entity store in sync.
    pub async fn update_memory_graph(&mut self, update: &MemoryGraphUpdate) -> TurnValidation {
        let mut result = TurnValidation::ok();
        for (id, entity_update) in update {
            let entity = self.memory_graph.apply(id, entity_update).clone();
            if let Err(error) = self.entity_store.upsert_entity(&entity).await {
                result.push(format!("failed to index entity '{id}': {error}"));
            }
        }
        result
    }

    // ── Images ───────────────────────────────────────────────────────────

    /// Store an image update on the last turn, replacing any previous update
    /// for the same role (identical updates are dropped).
    pub fn update_image(&mut self, update: ImageUpdate) {
        let turn = self.last_turn_mut();
        if turn.images.contains(&update) {
            return;
        }
        turn.images.retain(|image| image.role != update.role);
        turn.images.push(update);
    }

    /// Wrap a model-produced prompt in the configured start/end/negative
    /// fragments for its entity kind.
    pub fn make_image_update(&self, role: ImageRole, prompt: &str, entity_kind: &str) -> ImageUpdate {
        let p = &self.image_prompts;
        let (start, end, negative) = if entity_kind == "character" {
            (
                &p.character_start_prompt,
                &p.character_end_prompt,
                &p.character_negative_prompt,
            )
        } else {
            (&p.items_start_prompt, &p.items_end_prompt, &p.items_negative_prompt)
        };
        ImageUpdate {
            role,
            image_prompt: format!("{start}{prompt}{end}"),
            negative_prompt: negative.clone(),
        }
    }

    // ── Snapshot / rollback ──────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            turns: self.turns.clone(),
            last_summarized_turn: self.last_summarized_turn,
            parameters: self.parameters.clone(),
            important_entities: self.important_entities.clone(),
            image_prompts: self.image_prompts.clone(),
            memory_graph: self.memory_graph.clone(),
            fetched: self.fetched.clone(),
        }
    }

    /// Restore a snapshot, discarding every mutation made since it was taken.
    ///
    /// The vector stores are derived data: both are rebuilt from the restored
    /// graph and turn narratives.
    pub async fn restore(&mut self, snapshot: SessionSnapshot) -> Result<()> {
        self.turns = snapshot.turns;
        self.last_summarized_turn = snapshot.last_summarized_turn;
        self.parameters = snapshot.parameters;
        self.important_entities = snapshot.important_entities;
        self.image_prompts = snapshot.image_prompts;
        self.memory_graph = snapshot.memory_graph;
        self.fetched = snapshot.fetched;

        self.entity_store = MemoryStore::new(self.embedder.clone());
        self.narrative_store = MemoryStore::new(self.embedder.clone());
        for entity in self.memory_graph.entities.values() {
            self.entity_store
                .upsert_entity(entity)
                .await
                .map_err(anyhow::Error::from)?;
        }
        let narratives: Vec<(u32, String)> = self
            .turns
            .iter()
            .map(|turn| (turn.turn_number, turn_narrative(turn, false)))
            .filter(|(_, narrative)| !narrative.is_empty())
            .collect();
        for (turn_number, narrative) in narratives {
            self.narrative_store
                .upsert_narrative(turn_number, &narrative)
                .await
                .map_err(anyhow::Error::from)?;
        }
        info!(
            turns = self.turns.len(),
            entities = self.memory_graph.len(),
            "session state restored"
        );
        Ok(())
    }
}
