//! Chat prompt building
//!
//! The engine owns the caller's message history only long enough to render
//! it into a prompt string; the template flavor follows the loaded model's
//! architecture and name.

use serde::{Deserialize, Serialize};

/// Supported chat template types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateType {
    /// ChatML format (Qwen, Phi, most fine-tunes)
    /// Format: <|im_start|>role\ncontent<|im_end|>
    ChatML,

    /// Llama 3 format
    /// Format: <|start_header_id|>role<|end_header_id|>\ncontent<|eot_id|>
    Llama3,

    /// Gemma format
    /// Format: <start_of_turn>role\ncontent<end_of_turn>\n
    Gemma,

    /// Raw concatenation (completion models)
    Raw,
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl TemplateType {
    /// Pick a template from the model's architecture and display name
    pub fn detect(arch: &str, model_name: &str) -> Self {
        let name = model_name.to_lowercase();
        if arch == "gemma" || name.contains("gemma") {
            Self::Gemma
        } else if name.contains("llama-3") || name.contains("llama3") {
            Self::Llama3
        } else if arch == "llama" || arch == "llama_legacy" || arch == "mistral" {
            // Modern llama-family instruct checkpoints ship ChatML-style
            // special tokens unless the name pins a Llama 3 release
            Self::ChatML
        } else if arch == "unknown" {
            Self::Raw
        } else {
            Self::ChatML
        }
    }

    /// Template-specific stop sequences that end an assistant turn
    pub fn stop_sequences(&self) -> Vec<String> {
        match self {
            Self::ChatML => vec!["<|im_end|>".to_string()],
            Self::Llama3 => vec!["<|eot_id|>".to_string()],
            Self::Gemma => vec!["<end_of_turn>".to_string()],
            Self::Raw => vec![],
        }
    }
}

/// Render the message history into a prompt ending at the assistant turn
pub fn apply_chat_template(messages: &[ChatMessage], template_type: TemplateType) -> String {
    match template_type {
        TemplateType::ChatML => apply_chatml(messages),
        TemplateType::Llama3 => apply_llama3(messages),
        TemplateType::Gemma => apply_gemma(messages),
        TemplateType::Raw => apply_raw(messages),
    }
}

fn apply_chatml(messages: &[ChatMessage]) -> String {
    let mut formatted = String::new();
    for message in messages {
        formatted.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role, message.content
        ));
    }
    formatted.push_str("<|im_start|>assistant\n");
    formatted
}

fn apply_llama3(messages: &[ChatMessage]) -> String {
    let mut formatted = String::from("<|begin_of_text|>");
    for message in messages {
        formatted.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            message.role, message.content
        ));
    }
    formatted.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    formatted
}

fn apply_gemma(messages: &[ChatMessage]) -> String {
    let mut formatted = String::new();
    for message in messages {
        // Gemma has no system role; fold it into a user turn
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        formatted.push_str(&format!(
            "<start_of_turn>{}\n{}<end_of_turn>\n",
            role, message.content
        ));
    }
    formatted.push_str("<start_of_turn>model\n");
    formatted
}

fn apply_raw(messages: &[ChatMessage]) -> String {
    let mut formatted = String::new();
    for message in messages {
        formatted.push_str(&message.content);
        formatted.push('\n');
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system".into(),
                content: "Be terse.".into(),
            },
            ChatMessage {
                role: "user".into(),
                content: "Hi".into(),
            },
        ]
    }

    #[test]
    fn chatml_ends_with_assistant_header() {
        let prompt = apply_chat_template(&history(), TemplateType::ChatML);
        assert!(prompt.starts_with("<|im_start|>system\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn llama3_wraps_turns_with_headers() {
        let prompt = apply_chat_template(&history(), TemplateType::Llama3);
        assert!(prompt.starts_with("<|begin_of_text|>"));
        assert!(prompt.contains("<|start_header_id|>user<|end_header_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn gemma_renames_assistant_to_model() {
        let messages = vec![ChatMessage {
            role: "assistant".into(),
            content: "prior reply".into(),
        }];
        let prompt = apply_chat_template(&messages, TemplateType::Gemma);
        assert!(prompt.contains("<start_of_turn>model\nprior reply"));
    }

    #[test]
    fn detection_prefers_arch() {
        assert_eq!(TemplateType::detect("gemma", "my-model"), TemplateType::Gemma);
        assert_eq!(
            TemplateType::detect("llama", "Llama-3.2-1B-Instruct"),
            TemplateType::Llama3
        );
        assert_eq!(TemplateType::detect("mistral", "mistral-7b"), TemplateType::ChatML);
        assert_eq!(TemplateType::detect("unknown", "mystery"), TemplateType::Raw);
    }
}
