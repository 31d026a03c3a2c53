//! Bounded working set of recently referenced entities.
//!
//! Keeps prompts small: at most [`MAX_FETCHED_ENTITIES`] entities stay
//! "fetched", and only entries that haven't been referenced for at least
//! [`MIN_ENTITY_AGE_TO_DELETE`] turns are evictable.  When every entry is
//! still fresh the set may temporarily exceed the cap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MAX_FETCHED_ENTITIES: usize = 20;
pub const MIN_ENTITY_AGE_TO_DELETE: u32 = 2;

/// entity id → turn number it was last referenced on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    entries: BTreeMap<String, u32>,
}

impl WorkingSet {
    /// Mark `id` as referenced on `turn_number`, inserting it if absent.
    pub fn touch(&mut self, id: &str, turn_number: u32) {
        self.entries.insert(id.to_string(), turn_number);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids currently in the set, in stable (sorted) order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Evict aged entries until the set fits the cap.
    ///
    /// Only entries with `current_turn - last_referenced >=`
    /// [`MIN_ENTITY_AGE_TO_DELETE`] are eligible; the oldest go first.  When
    /// no eligible entry remains the set is left over the cap.
    pub fn evict(&mut self, current_turn: u32) {
        while self.entries.len() > MAX_FETCHED_ENTITIES {
            let candidate = self
                .entries
                .iter()
                .filter(|(_, last)| current_turn.saturating_sub(**last) >= MIN_ENTITY_AGE_TO_DELETE)
                .min_by_key(|(id, last)| (**last, (*id).clone()))
                .map(|(id, _)| id.clone());
            match candidate {
                Some(id) => {
                    debug!(entity = %id, "evicting aged entity from working set");
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
