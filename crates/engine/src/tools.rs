//! Memory-search tools exposed to the model during a phase.
//!
//! The handler works on a view of the memory taken when the turn's context
//! was built; a tool call mid-stream therefore sees settled state, never the
//! half-written output of the phase it is called from.

use async_trait::async_trait;
use serde_json::json;

use fabula_llm::{ToolHandler, ToolOutcome};
use fabula_memory::{MemoryGraph, MemoryStore};

use crate::state::SessionState;

const SEARCH_RESULT_COUNT: usize = 5;

/// OpenAI-compatible `tools` array for the chat completions request.
pub fn definitions() -> serde_json::Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "search-memory",
                "description": "Free-text search across the story memory. Call this whenever \
                                the narrative mentions a name or a keyword that is missing \
                                from the chat history.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "String to look for" }
                    },
                    "required": ["query"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "get-entity",
                "description": "Return the full record of one entity. The entity id must \
                                match exactly.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string", "description": "Exact id of the entity to fetch." }
                    },
                    "required": ["id"]
                }
            }
        }
    ])
}

pub struct MemoryToolHandler {
    graph: MemoryGraph,
    entity_store: MemoryStore,
    narrative_store: MemoryStore,
}

impl MemoryToolHandler {
    pub fn new(state: &SessionState) -> Self {
        Self {
            graph: state.memory_graph.clone(),
            entity_store: state.entity_store.clone(),
            narrative_store: state.narrative_store.clone(),
        }
    }

    async fn search_memory(&self, query: &str) -> String {
        let mut lines = Vec::new();
        for store in [&self.entity_store, &self.narrative_store] {
            if let Ok(hits) = store.search(query, SEARCH_RESULT_COUNT).await {
                lines.extend(hits.into_iter().map(|hit| hit.chunk.text));
            }
        }
        if lines.is_empty() {
            "No results.".to_string()
        } else {
            lines.join("\n---\n")
        }
    }
}

#[async_trait]
impl ToolHandler for MemoryToolHandler {
    async fn call(&self, name: &str, arguments: &str) -> ToolOutcome {
        let args: serde_json::Value = serde_json::from_str(arguments).unwrap_or(json!({}));
        match name {
            "search-memory" => {
                let query = args["query"].as_str().unwrap_or_default();
                if query.is_empty() {
                    return ToolOutcome {
                        content: "Missing required argument \"query\"".to_string(),
                        is_error: true,
                    };
                }
                ToolOutcome {
                    content: self.search_memory(query).await,
                    is_error: false,
                }
            }
            "get-entity" => {
                let id = args["id"].as_str().unwrap_or_default();
                match self.graph.get(id) {
                    Some(entity) => ToolOutcome {
                        content: entity.to_prompt_text(),
                        is_error: false,
                    },
                    None => ToolOutcome {
                        content: format!("Unknown entity id '{id}'"),
                        is_error: true,
                    },
                }
            }
            other => ToolOutcome {
                content: format!("Tool \"{other}\" doesn't exist"),
                is_error: true,
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
