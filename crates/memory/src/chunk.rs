//! Memory chunks: the unit of text that gets embedded and indexed.
//!
//! Entity chunks carry a full entity snapshot; narrative chunks carry a group
//! of contiguous paragraphs from one turn, sized to stay embeddable and
//! semantically coherent.

use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// Narrative chunks aim for this many characters.
pub const TARGET_CHUNK_LEN: usize = 1200;
/// A trailing group shorter than this merges into the previous chunk.
pub const MIN_CHUNK_LEN: usize = 400;
/// Groups never grow past this; oversized paragraphs are split at whitespace.
pub const MAX_CHUNK_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Entity,
    Narrative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub kind: ChunkKind,
    /// `(turn number, 1-based paragraph-group index)` for narrative chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paragraph_id: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: String,
    pub text: String,
    pub meta: ChunkMeta,
}

impl MemoryChunk {
    /// Entity chunk: the searchable text (`info` + `secret`) headed by the
    /// entity's name so name mentions also rank.
    pub fn from_entity(entity: &Entity) -> Self {
        let mut text = if entity.name.is_empty() {
            entity.id.clone()
        } else {
            entity.name.clone()
        };
        let searchable = entity.searchable_text();
        if !searchable.is_empty() {
            text.push_str(": ");
            text.push_str(&searchable);
        }
        Self {
            id: entity.id.clone(),
            text,
            meta: ChunkMeta {
                kind: ChunkKind::Entity,
                paragraph_id: None,
            },
        }
    }
}

/// Split one turn's narrative into indexable chunks.
///
/// Paragraphs (blank-line separated) are grouped contiguously until a group
/// reaches [`TARGET_CHUNK_LEN`]; a group is closed early rather than grown
/// past [`MAX_CHUNK_LEN`].  A trailing group shorter than [`MIN_CHUNK_LEN`]
/// merges into the previous chunk instead of standing alone.
pub fn chunk_narrative(turn_number: u32, narrative: &str) -> Vec<MemoryChunk> {
    let paragraphs: Vec<String> = narrative
        .split("\n\n")
        .map(|p| p.trim().replace('\n', " "))
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut groups: Vec<String> = Vec::new();
    let mut current = String::new();
    for paragraph in &paragraphs {
        let would_be = if current.is_empty() {
            paragraph.len()
        } else {
            current.len() + 1 + paragraph.len()
        };
        if !current.is_empty() && would_be > MAX_CHUNK_LEN && current.len() >= MIN_CHUNK_LEN {
            groups.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(paragraph);
        if current.len() >= TARGET_CHUNK_LEN {
            groups.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        if current.len() < MIN_CHUNK_LEN {
            match groups.last_mut() {
                Some(last) => {
                    last.push(' ');
                    last.push_str(&current);
                }
                None => groups.push(current),
            }
        } else {
            groups.push(current);
        }
    }

    let groups = groups
        .into_iter()
        .flat_map(split_oversized)
        .collect::<Vec<_>>();

    groups
        .into_iter()
        .enumerate()
        .map(|(index, text)| MemoryChunk {
            id: format!("narrative-{turn_number}-{index}"),
            text,
            meta: ChunkMeta {
                kind: ChunkKind::Narrative,
                paragraph_id: Some((turn_number, index as u32 + 1)),
            },
        })
        .collect()
}

/// Break a group that exceeds the hard maximum at whitespace boundaries.
fn split_oversized(group: String) -> Vec<String> {
    if group.len() <= MAX_CHUNK_LEN {
        return vec![group];
    }
    let mut pieces = Vec::new();
    let mut rest = group.as_str();
    while rest.len() > MAX_CHUNK_LEN {
        let mut window_end = MAX_CHUNK_LEN;
        while !rest.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let cut = rest[..window_end]
            .rfind(char::is_whitespace)
            .filter(|&at| at > 0)
            .unwrap_or(window_end);
        let (head, tail) = rest.split_at(cut);
        pieces.push(head.trim_end().to_string());
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Turn number encoded in a narrative chunk id, if any.
pub fn extract_turn_number(chunk_id: &str) -> Option<u32> {
    let rest = chunk_id.strip_prefix("narrative-")?;
    let (turn, _index) = rest.split_once('-')?;
    turn.parse().ok()
}

// ── Tests ────────────────────────────────────────────────────────────────────
