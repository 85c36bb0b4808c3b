//! Conversation history for filter extraction.
//!
//! Two states: Fresh (no turns yet) and Active. A first requirement seeds
//! `[system, user]`; every "update filters" request appends the assistant's
//! summary of the accepted filters plus the user's follow-up, and the
//! extractor re-runs over the full accumulated history. History is never
//! trimmed within a session.

use crate::llm::ChatMessage;

const SYSTEM_PROMPT: &str = "You translate a user's data requirement into structured column \
filters. Use only tables and columns from the catalog below. Produce one filter per \
distinct requirement, quoting the source requirement text verbatim.\n\nCatalog:\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Fresh,
    Active,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConversationState {
        if self.messages.is_empty() {
            ConversationState::Fresh
        } else {
            ConversationState::Active
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Seed a fresh conversation with the catalog context and the first
    /// requirement. Discards nothing: only valid from Fresh.
    pub fn seed(&mut self, catalog_context: &str, requirement: &str) {
        debug_assert_eq!(self.state(), ConversationState::Fresh);
        self.messages
            .push(ChatMessage::system(format!("{}{}", SYSTEM_PROMPT, catalog_context)));
        self.messages.push(ChatMessage::user(requirement));
    }

    /// Append the accepted-filter summary and a follow-up instruction;
    /// the next extraction is conditioned on the whole exchange.
    pub fn follow_up(&mut self, filter_summary: &str, instruction: &str) {
        debug_assert_eq!(self.state(), ConversationState::Active);
        self.messages.push(ChatMessage::assistant(filter_summary));
        self.messages.push(ChatMessage::user(instruction));
    }

    /// Drop all turns (dataset replaced; the old context no longer applies).
    pub fn reset(&mut self) {
        self.messages.clear();
    }
}
