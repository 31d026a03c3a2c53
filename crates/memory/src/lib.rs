//! Persistent narrative memory: an entity graph, a chunked vector store for
//! semantic retrieval, and the bounded working set of recently fetched
//! entities.

pub mod chunk;
pub mod embed;
pub mod entity;
pub mod index;
pub mod store;
pub mod working_set;

pub use chunk::{ChunkKind, ChunkMeta, MemoryChunk, chunk_narrative};
pub use embed::{ApiEmbedder, EmbedError, Embedder, SharedEmbedder};
pub use entity::{Entity, EntityUpdate, MemoryGraph, MemoryGraphUpdate};
pub use index::VectorIndex;
pub use store::{MemoryStore, ScoredChunk};
pub use working_set::{MAX_FETCHED_ENTITIES, MIN_ENTITY_AGE_TO_DELETE, WorkingSet};
