use serde::{Deserialize, Serialize};

use crate::persona::Persona;

/// The role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        }
    }
}

/// A chat message in the study conversation.
///
/// While `streaming` is true the message is still being assembled and only
/// the [`Conversation`] that owns it may touch its content. Once the flag is
/// cleared the message is frozen.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: u64,
    pub role: ChatRole,
    pub content: String,
    pub persona: Option<Persona>,
    pub streaming: bool,
}

/// Ordered conversation history with controlled mutation: append-only, except
/// for in-place growth of the one streaming message, its removal on failure,
/// and a full clear on reset. At most one message is streaming at a time.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    next_id: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn push_user(&mut self, content: String) -> u64 {
        let id = self.allocate_id();
        self.messages.push(ChatMessage {
            id,
            role: ChatRole::User,
            content,
            persona: None,
            streaming: false,
        });
        id
    }

    /// Append a finished assistant message (non-streaming backend, or the
    /// generic error notice when `persona` is None).
    pub fn push_assistant(&mut self, content: String, persona: Option<Persona>) -> u64 {
        let id = self.allocate_id();
        self.messages.push(ChatMessage {
            id,
            role: ChatRole::Assistant,
            content,
            persona,
            streaming: false,
        });
        id
    }

    /// Append the empty assistant placeholder that a stream will grow.
    pub fn begin_streaming(&mut self, persona: Persona) -> u64 {
        debug_assert!(
            self.streaming_index().is_none(),
            "a message is already streaming"
        );
        let id = self.allocate_id();
        self.messages.push(ChatMessage {
            id,
            role: ChatRole::Assistant,
            content: String::new(),
            persona: Some(persona),
            streaming: true,
        });
        id
    }

    fn streaming_index(&self) -> Option<usize> {
        self.messages.iter().position(|m| m.streaming)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_index().is_some()
    }

    /// Grow the streaming message in place. A delta arriving when nothing is
    /// streaming (stale stream after reset) is dropped.
    pub fn append_to_streaming(&mut self, delta: &str) {
        if let Some(idx) = self.streaming_index() {
            self.messages[idx].content.push_str(delta);
        }
    }

    /// Freeze the streaming message. Terminal success state for that message.
    pub fn finalize_streaming(&mut self) {
        if let Some(idx) = self.streaming_index() {
            self.messages[idx].streaming = false;
        }
    }

    /// Remove the streaming placeholder after a failed stream, returning its
    /// partial content if there was one.
    pub fn remove_streaming(&mut self) -> Option<ChatMessage> {
        self.streaming_index().map(|idx| self.messages.remove(idx))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_message_grows_then_freezes() {
        let mut conv = Conversation::new();
        conv.push_user("What does Rashi say here?".to_string());
        conv.begin_streaming(Persona::Chavruta);
        assert!(conv.is_streaming());

        conv.append_to_streaming("Rashi reads");
        conv.append_to_streaming(" the clause narrowly.");
        conv.finalize_streaming();

        assert!(!conv.is_streaming());
        let last = conv.last().unwrap();
        assert_eq!(last.content, "Rashi reads the clause narrowly.");
        assert_eq!(last.role, ChatRole::Assistant);
    }

    #[test]
    fn append_without_streaming_message_is_dropped() {
        let mut conv = Conversation::new();
        conv.push_user("hello".to_string());
        conv.append_to_streaming("late delta");
        assert_eq!(conv.messages().len(), 1);
        assert_eq!(conv.last().unwrap().content, "hello");
    }

    #[test]
    fn remove_streaming_discards_partial_content() {
        let mut conv = Conversation::new();
        conv.push_user("q".to_string());
        conv.begin_streaming(Persona::Hillel);
        conv.append_to_streaming("partial");
        let removed = conv.remove_streaming().unwrap();
        assert_eq!(removed.content, "partial");
        assert_eq!(conv.messages().len(), 1);
        assert!(!conv.is_streaming());
    }

    #[test]
    fn ids_are_unique_across_clear() {
        let mut conv = Conversation::new();
        let a = conv.push_user("one".to_string());
        conv.clear();
        let b = conv.push_user("two".to_string());
        assert_ne!(a, b);
    }
}
