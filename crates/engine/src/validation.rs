//! Structured validation outcome of a phase attempt or a whole turn.
//!
//! Errors are collected, never thrown: the retry loop inspects the list and
//! feeds it back to the model as a corrective message.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnValidation {
    pub errors: Vec<String>,
}

impl TurnValidation {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn merge(&mut self, other: TurnValidation) {
        self.errors.extend(other.errors);
    }

    pub fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
