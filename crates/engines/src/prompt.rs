//! Chat prompt formatting for the model families in the registry.
//!
//! Llama 3 and ChatML cover every registry entry; `Auto` falls back to
//! ChatML, which most instruct-tuned GGUF models accept.

use crate::engine::ChatMessage;

/// Which prompt template a model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateHint {
    /// Fall back to ChatML.
    #[default]
    Auto,
    /// `<|begin_of_text|><|start_header_id|>system<|end_header_id|>...`
    Llama3,
    /// `<|im_start|>system\n...<|im_end|>` (Qwen, Yi)
    ChatML,
}

impl TemplateHint {
    /// Parse from string (for config).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "llama3" | "llama" => Self::Llama3,
            "chatml" | "qwen" | "yi" => Self::ChatML,
            _ => Self::Auto,
        }
    }
}

/// Format messages for generation using the given template.
#[must_use]
pub fn format_messages(messages: &[ChatMessage], hint: TemplateHint) -> String {
    match hint {
        TemplateHint::Auto | TemplateHint::ChatML => format_chatml(messages),
        TemplateHint::Llama3 => format_llama3(messages),
    }
}

fn format_chatml(messages: &[ChatMessage]) -> String {
    let mut output = String::new();

    for msg in messages {
        output.push_str("<|im_start|>");
        output.push_str(msg.role.as_str());
        output.push('\n');
        output.push_str(&msg.content);
        output.push_str("<|im_end|>\n");
    }

    // Assistant prefix for generation
    output.push_str("<|im_start|>assistant\n");
    output
}

fn format_llama3(messages: &[ChatMessage]) -> String {
    let mut output = String::from("<|begin_of_text|>");

    for msg in messages {
        output.push_str("<|start_header_id|>");
        output.push_str(msg.role.as_str());
        output.push_str("<|end_header_id|>\n\n");
        output.push_str(&msg.content);
        output.push_str("<|eot_id|>");
    }

    // Assistant prefix for generation
    output.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    output
}
