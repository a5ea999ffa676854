//! Incremental printing of a streaming answer

use parley_api::Role;
use parley_core::Conversation;
use std::io::Write;

/// Prints the growth of the latest assistant message as it streams.
///
/// Only the suffix that was not printed yet is written. If the content is
/// replaced rather than extended (an error message), it is printed anew on
/// its own line.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    /// Message printed before this turn; never printed again
    skip_id: Option<String>,
    message_id: Option<String>,
    printed: String,
}

impl StreamPrinter {
    /// Start a printer that ignores whatever `conversation` already ends with
    pub fn new(conversation: Option<&Conversation>) -> Self {
        Self {
            skip_id: conversation
                .and_then(|c| c.messages.last())
                .map(|m| m.id.clone()),
            ..Default::default()
        }
    }

    /// Text to print for the conversation's current state
    pub fn next_chunk(&mut self, conversation: Option<&Conversation>) -> Option<String> {
        let message = conversation?.messages.last()?;
        if message.role != Role::Assistant || self.skip_id.as_deref() == Some(message.id.as_str()) {
            return None;
        }

        if self.message_id.as_deref() != Some(message.id.as_str()) {
            self.message_id = Some(message.id.clone());
            self.printed.clear();
        }

        let content = &message.content;
        if content == &self.printed {
            return None;
        }
        let chunk = match content.strip_prefix(self.printed.as_str()) {
            Some(suffix) => suffix.to_string(),
            None => format!("\n{}", content),
        };
        self.printed = content.clone();
        Some(chunk)
    }

    /// Print whatever is new to stdout
    pub fn update(&mut self, conversation: Option<&Conversation>) {
        if let Some(chunk) = self.next_chunk(conversation) {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{}", chunk);
            let _ = stdout.flush();
        }
    }
}
