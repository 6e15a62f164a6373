//! Builds the engine-facing message window from stored history.

use sotto_engines::ChatMessage;

use crate::session::StoredMessage;

/// How many recent turns ride along with each generation by default.
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Assemble the messages for one generation: a synthesized system message
/// (base persona plus the optional running summary) followed by the last
/// `window` stored turns, oldest first.
#[must_use]
pub fn build_context(
    system_prompt: &str,
    summary: Option<&str>,
    history: &[StoredMessage],
    window: usize,
) -> Vec<ChatMessage> {
    let mut system = system_prompt.to_string();
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        system.push_str("\n\nPrevious conversation summary for context: ");
        system.push_str(summary);
    }

    let start = history.len().saturating_sub(window);
    let mut messages = Vec::with_capacity(1 + history.len() - start);
    messages.push(ChatMessage::system(system));
    for stored in &history[start..] {
        messages.push(ChatMessage {
            role: stored.role,
            content: stored.content.clone(),
        });
    }
    messages
}

#[cfg(test)]
mod tests {
    use sotto_engines::Role;

    use super::*;

    fn history(turns: usize) -> Vec<StoredMessage> {
        (0..turns)
            .map(|i| {
                if i % 2 == 0 {
                    StoredMessage::user(format!("user {i}"))
                } else {
                    StoredMessage::assistant(format!("assistant {i}"))
                }
            })
            .collect()
    }

    #[test]
    fn truncates_to_last_window_turns() {
        let history = history(13);
        let messages = build_context("persona", None, &history, DEFAULT_HISTORY_WINDOW);

        assert_eq!(messages.len(), 11, "system message plus last 10 turns");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "user 3");
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("user 12"));
    }

    #[test]
    fn short_history_is_kept_whole() {
        let history = history(4);
        let messages = build_context("persona", None, &history, DEFAULT_HISTORY_WINDOW);
        assert_eq!(messages.len(), 5);
    }

    #[test]
    fn summary_is_appended_to_system_message() {
        let messages = build_context(
            "persona",
            Some("they talked about hiking"),
            &history(2),
            DEFAULT_HISTORY_WINDOW,
        );

        let system = &messages[0];
        assert!(system.content.starts_with("persona"));
        assert!(
            system
                .content
                .contains("Previous conversation summary for context: they talked about hiking")
        );
    }

    #[test]
    fn blank_summary_is_ignored() {
        let messages = build_context("persona", Some("   "), &history(2), DEFAULT_HISTORY_WINDOW);
        assert_eq!(messages[0].content, "persona");
    }

    #[test]
    fn turn_order_is_preserved() {
        let history = history(6);
        let messages = build_context("persona", None, &history, DEFAULT_HISTORY_WINDOW);
        let contents: Vec<&str> = messages[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "user 0",
                "assistant 1",
                "user 2",
                "assistant 3",
                "user 4",
                "assistant 5"
            ]
        );
    }
}
