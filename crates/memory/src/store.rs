//! The memory store: embeds chunks, owns the vector index, and answers
//! multi-query semantic searches with closest-wins deduplication.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::chunk::{MemoryChunk, chunk_narrative};
use crate::embed::{EmbedError, SharedEmbedder};
use crate::entity::Entity;
use crate::index::VectorIndex;

/// A search hit: the chunk plus its squared L2 distance to the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: MemoryChunk,
    pub distance: f32,
}

#[derive(Clone)]
pub struct MemoryStore {
    embedder: SharedEmbedder,
    index: VectorIndex,
    /// chunk id → current live row.
    rows: HashMap<String, usize>,
    /// row → chunk (rows are never reused, stale rows are tombstoned).
    chunks: HashMap<usize, MemoryChunk>,
    /// Turns whose narrative has already been chunked and indexed.
    known_turns: HashSet<u32>,
}

impl MemoryStore {
    pub fn new(embedder: SharedEmbedder) -> Self {
        Self {
            embedder,
            index: VectorIndex::new(),
            rows: HashMap::new(),
            chunks: HashMap::new(),
            known_turns: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Add or replace one chunk.  A replaced chunk's old row is tombstoned so
    /// stale text can never surface in search results.
    pub async fn upsert_chunk(&mut self, chunk: MemoryChunk) -> Result<(), EmbedError> {
        let vector = self.embedder.embed(&chunk.text).await?;
        if let Some(old_row) = self.rows.remove(&chunk.id) {
            self.index.remove(old_row);
            self.chunks.remove(&old_row);
        }
        let row = self.index.add(vector);
        self.rows.insert(chunk.id.clone(), row);
        self.chunks.insert(row, chunk);
        Ok(())
    }

    pub async fn upsert_entity(&mut self, entity: &Entity) -> Result<(), EmbedError> {
        self.upsert_chunk(MemoryChunk::from_entity(entity)).await
    }

    /// Chunk and index one turn's narrative, marking the turn as known.
    pub async fn upsert_narrative(
        &mut self,
        turn_number: u32,
        narrative: &str,
    ) -> Result<(), EmbedError> {
        let chunks = chunk_narrative(turn_number, narrative);
        debug!(turn = turn_number, chunks = chunks.len(), "indexing narrative");
        for chunk in chunks {
            self.upsert_chunk(chunk).await?;
        }
        self.known_turns.insert(turn_number);
        Ok(())
    }

    /// Whether `upsert_narrative` already ran for this turn.
    pub fn is_turn_known(&self, turn_number: u32) -> bool {
        self.known_turns.contains(&turn_number)
    }

    /// Tombstone a chunk by id.
    pub fn remove(&mut self, chunk_id: &str) -> bool {
        match self.rows.remove(chunk_id) {
            Some(row) => {
                self.chunks.remove(&row);
                self.index.remove(row)
            }
            None => false,
        }
    }

    /// `k` nearest chunks to `query`, ascending by distance.
    ///
    /// Returns nothing while the index holds fewer than two entries — a
    /// single-entry index matches everything, which is noise, not signal.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, EmbedError> {
        let k = k.min(self.index.len().saturating_sub(1));
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query).await?;
        Ok(self
            .index
            .search(&vector, k)
            .into_iter()
            .map(|(row, distance)| ScoredChunk {
                chunk: self.chunks[&row].clone(),
                distance,
            })
            .collect())
    }

    /// Merge the results of several queries into one ranked, deduplicated
    /// list of at most `k` chunks, skipping `exclude_ids`.
    ///
    /// Per-query depth is inflated by the exclusion count so filtering can't
    /// starve the result set.  Results are sorted by distance *before*
    /// deduplication, so when a chunk matches several queries its closest
    /// occurrence is the one that survives.
    pub async fn search_multiple(
        &self,
        queries: &[String],
        k: usize,
        exclude_ids: &[String],
    ) -> Result<Vec<ScoredChunk>, EmbedError> {
        let per_query = k + exclude_ids.len();
        let mut hits: Vec<ScoredChunk> = Vec::new();
        for query in queries {
            hits.extend(
                self.search(query, per_query)
                    .await?
                    .into_iter()
                    .filter(|hit| !exclude_ids.contains(&hit.chunk.id)),
            );
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        let mut seen = HashSet::new();
        hits.retain(|hit| seen.insert(hit.chunk.id.clone()));
        hits.truncate(k);
        Ok(hits)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
