//! Turn orchestration engine for the interactive narrative.
//!
//! One player turn runs an ordered pipeline of LLM phases (memory fetch →
//! narrative → memory update, plus a periodic summary), each with its own
//! validation and retry loop.  All durable state is snapshotted before the
//! turn starts; any phase failure rolls the whole turn back, so a turn either
//! fully commits or leaves nothing behind.

pub mod conversation;
pub mod events;
pub mod orchestrator;
pub mod phase;
pub mod phases;
pub mod prompt;
pub mod section;
pub mod session;
pub mod state;
pub mod tools;
pub mod turn;
pub mod validation;

pub use conversation::Conversation;
pub use events::EngineEvent;
pub use orchestrator::{TURNS_TO_KEEP, TURNS_TO_KEEP_IN_HISTORY, TurnOrchestrator};
pub use phase::{Phase, PhaseConfig, run_phase};
pub use prompt::{FilePrompts, PromptSource, substitute};
pub use session::AdventureSession;
pub use state::{ImagePromptParameters, SessionSnapshot, SessionState, StoryParameters};
pub use turn::{
    FeedbackKind, ImageRole, ImageUpdate, TurnFeedback, TurnRecord, UserInput, turn_narrative,
};
pub use validation::TurnValidation;
