//! Concrete phases of the per-turn pipeline, in execution order.

pub mod critic;
pub mod memory_fetch;
pub mod memory_update;
pub mod narrative;
pub mod summary;

pub use critic::CriticPhase;
pub use memory_fetch::MemoryFetchPhase;
pub use memory_update::MemoryUpdatePhase;
pub use narrative::NarrativePhase;
pub use summary::SummaryPhase;

// Prompt template names, resolved against the configured prompts directory.
pub const HISTORY_PROMPT: &str = "history-prompt.txt";
pub const SUMMARY_PROMPT: &str = "summarize-prompt.txt";
pub const MEMORY_FETCH_PROMPT: &str = "memory-fetch-prompt.txt";
pub const MEMORY_FETCH_RESULT_PROMPT: &str = "memory-fetch-result-prompt.txt";
pub const NARRATIVE_PROMPT: &str = "narrative-prompt.txt";
pub const ASSISTANT_PROMPT: &str = "assistant-prompt.txt";
pub const CRITIC_PROMPT: &str = "critic-prompt.txt";
