//! The shared conversation buffer.
//!
//! Owned by the orchestrator; each phase receives a scoped mutable borrow and
//! the phase driver restores the pre-phase message list on success, so retry
//! garbage never leaks into later phases.

use fabula_llm::ChatMessage;

/// Placeholder installed whenever the buffer is reset; a phase always swaps
/// in its real system prompt before calling the model.
const MISSING_SYSTEM_PROMPT: &str =
    "You are missing the system message. Inform the developer about it. Ignore user input.";

#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::system(MISSING_SYSTEM_PROMPT)],
        }
    }

    /// Drop everything and reinstall the placeholder system message.
    pub fn clear(&mut self) {
        self.messages = vec![ChatMessage::system(MISSING_SYSTEM_PROMPT)];
    }

    /// Replace the first (system) message.
    pub fn replace_system(&mut self, content: impl Into<String>) {
        self.messages[0] = ChatMessage::system(content);
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut Vec<ChatMessage> {
        &mut self.messages
    }

    /// Snapshot of the current message list.
    pub fn save(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    /// Restore a snapshot taken with [`Conversation::save`].
    pub fn restore(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_llm::ChatRole;

    #[test]
    fn new_conversation_has_placeholder_system_message() {
        let conversation = Conversation::new();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.messages()[0].role, ChatRole::System);
    }

    #[test]
    fn replace_system_keeps_later_messages() {
        let mut conversation = Conversation::new();
        conversation.push(ChatMessage::user(Some("Player"), "go north"));
        conversation.replace_system("real prompt");
        assert_eq!(conversation.messages()[0].content, "real prompt");
        assert_eq!(conversation.len(), 2);
    }

    #[test]
    fn save_restore_roundtrip() {
        let mut conversation = Conversation::new();
        conversation.push(ChatMessage::user(None, "one"));
        let saved = conversation.save();
        conversation.push(ChatMessage::user(None, "two"));
        conversation.push(ChatMessage::assistant(None, "junk"));
        conversation.restore(saved);
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.messages()[1].content, "one");
    }

    #[test]
    fn clear_resets_to_placeholder() {
        let mut conversation = Conversation::new();
        conversation.replace_system("real prompt");
        conversation.push(ChatMessage::user(None, "x"));
        conversation.clear();
        assert_eq!(conversation.len(), 1);
        assert!(conversation.messages()[0].content.contains("missing the system message"));
    }
}
