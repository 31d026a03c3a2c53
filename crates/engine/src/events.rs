//! Engine → transport notification events.

use serde::{Deserialize, Serialize};

use crate::turn::{ImageUpdate, TurnRecord};

/// Broadcast to transport subscribers.  `TurnUpdated` also fires mid-phase
/// while narrative text is still streaming in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    TurnUpdated(TurnRecord),
    ImageRequested(ImageUpdate),
    LlmRunningChanged(bool),
}
