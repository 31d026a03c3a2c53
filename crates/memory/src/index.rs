//! Flat L2 vector index.
//!
//! Rows are append-only; removal is a tombstone so row ids handed out to the
//! store stay stable.  Search is a linear scan — adventure memories top out in
//! the low thousands of chunks, well inside scan territory.

use crate::embed::l2_distance;

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    vectors: Vec<Vec<f32>>,
    deleted: Vec<bool>,
    live: usize,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a vector and return its row id.
    pub fn add(&mut self, vector: Vec<f32>) -> usize {
        self.vectors.push(vector);
        self.deleted.push(false);
        self.live += 1;
        self.vectors.len() - 1
    }

    /// Tombstone a row.  Returns `false` when the row was already gone.
    pub fn remove(&mut self, row: usize) -> bool {
        match self.deleted.get_mut(row) {
            Some(flag) if !*flag => {
                *flag = true;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Number of live (non-tombstoned) rows.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// `k` nearest live rows to `query`, ascending by squared L2 distance.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut hits: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(row, _)| !self.deleted[*row])
            .map(|(row, vector)| (row, l2_distance(query, vector)))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(k);
        hits
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
