//! Conversation templates and prompt assembly
//!
//! Turns a system message and a list of chat messages into the single
//! prompt string the engine consumes. Rendering is deterministic and
//! stateless.

use llmops_common::{LlmOpsError, Result};
use llmops_proto::{ChatMessage, ConvTemplateInfo, GenerateParams, Role};

/// How turns are joined together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorStyle {
    /// `ROLE: msg<sep>` after every turn
    AddColonSingle,
    /// `ROLE: msg` followed by `sep` and `sep2` alternately
    AddColonTwo,
    /// `ROLEmsg<sep>` with no colon
    NoColonSingle,
    /// Llama 2 `[INST]` tags with the system block folded into the first turn
    Llama2,
    /// `<|im_start|>role\nmsg<|im_end|>\n`
    ChatMl,
}

/// A named conversation template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTemplate {
    name: String,
    /// Contains one `{system_message}` placeholder
    system_template: String,
    default_system_message: String,
    roles: (String, String),
    sep_style: SeparatorStyle,
    sep: String,
    sep2: Option<String>,
}

/// Names accepted by [`ConversationTemplate::named`]
pub const TEMPLATE_NAMES: &[&str] = &["vicuna_v1.1", "llama-2", "chatml", "zero_shot", "raw"];

impl ConversationTemplate {
    /// Look up a built-in template by name
    pub fn named(name: &str) -> Option<Self> {
        let template = match name {
            "vicuna_v1.1" => Self {
                name: name.to_string(),
                system_template: "{system_message}".to_string(),
                default_system_message: "A chat between a curious user and an artificial intelligence assistant. \
                    The assistant gives helpful, detailed, and polite answers to the user's questions."
                    .to_string(),
                roles: ("USER".to_string(), "ASSISTANT".to_string()),
                sep_style: SeparatorStyle::AddColonTwo,
                sep: " ".to_string(),
                sep2: Some("</s>".to_string()),
            },
            "llama-2" => Self {
                name: name.to_string(),
                system_template: "[INST] <<SYS>>\n{system_message}\n<</SYS>>\n\n".to_string(),
                default_system_message: String::new(),
                roles: ("[INST]".to_string(), "[/INST]".to_string()),
                sep_style: SeparatorStyle::Llama2,
                sep: " ".to_string(),
                sep2: Some(" </s><s>".to_string()),
            },
            "chatml" => Self {
                name: name.to_string(),
                system_template: "<|im_start|>system\n{system_message}".to_string(),
                default_system_message: "You are a helpful assistant.".to_string(),
                roles: (
                    "<|im_start|>user".to_string(),
                    "<|im_start|>assistant".to_string(),
                ),
                sep_style: SeparatorStyle::ChatMl,
                sep: "<|im_end|>".to_string(),
                sep2: None,
            },
            "zero_shot" => Self {
                name: name.to_string(),
                system_template: "{system_message}".to_string(),
                default_system_message: "A chat between a curious human and an artificial intelligence assistant. \
                    The assistant gives helpful, detailed, and polite answers to the human's questions."
                    .to_string(),
                roles: ("### Human".to_string(), "### Assistant".to_string()),
                sep_style: SeparatorStyle::AddColonSingle,
                sep: "\n### ".to_string(),
                sep2: None,
            },
            "raw" => Self::raw(),
            _ => return None,
        };
        Some(template)
    }

    /// Pick a template from a model identifier
    pub fn for_model(model_identifier: &str) -> Self {
        let id = model_identifier.to_lowercase();
        let name = if id.contains("vicuna") {
            "vicuna_v1.1"
        } else if id.contains("llama-2") || id.contains("llama2") {
            "llama-2"
        } else if id.contains("qwen") || id.contains("chatml") || id.contains("yi-") {
            "chatml"
        } else {
            "zero_shot"
        };
        // Every name in the chain above is built in
        Self::named(name).unwrap_or_else(Self::raw)
    }

    fn raw() -> Self {
        Self {
            name: "raw".to_string(),
            system_template: "{system_message}".to_string(),
            default_system_message: String::new(),
            roles: (String::new(), String::new()),
            sep_style: SeparatorStyle::NoColonSingle,
            sep: String::new(),
            sep2: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> ConvTemplateInfo {
        ConvTemplateInfo {
            name: self.name.clone(),
            system_template: self.system_template.clone(),
            roles: self.roles.clone(),
            sep: self.sep.clone(),
            sep2: self.sep2.clone(),
        }
    }

    /// Render the prompt, ending with an open assistant turn
    pub fn render(&self, system_message: Option<&str>, messages: &[ChatMessage]) -> String {
        let system_message = system_message.unwrap_or(&self.default_system_message);
        let system_prompt = self.system_template.replace("{system_message}", system_message);

        let mut turns: Vec<(&str, Option<&str>)> = messages
            .iter()
            .filter_map(|m| match m.role {
                Role::Human => Some((self.roles.0.as_str(), Some(m.text.as_str()))),
                Role::Ai => Some((self.roles.1.as_str(), Some(m.text.as_str()))),
                Role::Other => None,
            })
            .collect();
        turns.push((self.roles.1.as_str(), None));

        let sep2 = self.sep2.as_deref().unwrap_or(&self.sep);
        let mut out = String::new();

        match self.sep_style {
            SeparatorStyle::AddColonSingle => {
                out.push_str(&system_prompt);
                out.push_str(&self.sep);
                for (role, msg) in turns {
                    match msg {
                        Some(msg) => {
                            out.push_str(&format!("{role}: {msg}"));
                            out.push_str(&self.sep);
                        }
                        None => out.push_str(&format!("{role}:")),
                    }
                }
            }
            SeparatorStyle::AddColonTwo => {
                let seps = [self.sep.as_str(), sep2];
                out.push_str(&system_prompt);
                out.push_str(seps[0]);
                for (i, (role, msg)) in turns.into_iter().enumerate() {
                    match msg {
                        Some(msg) => {
                            out.push_str(&format!("{role}: {msg}"));
                            out.push_str(seps[i % 2]);
                        }
                        None => out.push_str(&format!("{role}:")),
                    }
                }
            }
            SeparatorStyle::NoColonSingle => {
                out.push_str(&system_prompt);
                for (role, msg) in turns {
                    out.push_str(role);
                    if let Some(msg) = msg {
                        out.push_str(msg);
                        out.push_str(&self.sep);
                    }
                }
            }
            SeparatorStyle::Llama2 => {
                let seps = [self.sep.as_str(), sep2];
                if system_message.is_empty() {
                    out.push_str("[INST] ");
                } else {
                    out.push_str(&system_prompt);
                }
                for (i, (role, msg)) in turns.into_iter().enumerate() {
                    match msg {
                        Some(msg) if i == 0 => {
                            out.push_str(msg);
                            out.push(' ');
                        }
                        Some(msg) => {
                            out.push_str(&format!("{role} {msg}"));
                            out.push_str(seps[i % 2]);
                        }
                        None => out.push_str(role),
                    }
                }
            }
            SeparatorStyle::ChatMl => {
                if !system_prompt.is_empty() {
                    out.push_str(&system_prompt);
                    out.push_str(&self.sep);
                    out.push('\n');
                }
                for (role, msg) in turns {
                    out.push_str(role);
                    out.push('\n');
                    if let Some(msg) = msg {
                        out.push_str(msg);
                        out.push_str(&self.sep);
                        out.push('\n');
                    }
                }
            }
        }

        out
    }
}

/// Builds engine prompts from generation parameters
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    /// Template forced by configuration, regardless of model identifier
    forced: Option<ConversationTemplate>,
    /// Template used when a request names no model
    default: ConversationTemplate,
}

impl PromptBuilder {
    /// Create a builder; `conv_template` must name a built-in template
    pub fn new(conv_template: Option<&str>, model_path: &str) -> Result<Self> {
        let forced = match conv_template {
            Some(name) => Some(ConversationTemplate::named(name).ok_or_else(|| {
                LlmOpsError::config(format!(
                    "Unknown conversation template '{}', expected one of {:?}",
                    name, TEMPLATE_NAMES
                ))
            })?),
            None => None,
        };
        Ok(Self {
            forced,
            default: ConversationTemplate::for_model(model_path),
        })
    }

    /// Template reported by `worker_conv_template`
    pub fn default_template(&self) -> &ConversationTemplate {
        self.forced.as_ref().unwrap_or(&self.default)
    }

    /// Assemble the prompt for a request
    pub fn build(&self, params: &GenerateParams) -> Result<String> {
        if let Some(prompt) = &params.prompt {
            if prompt.is_empty() {
                return Err(LlmOpsError::validation("prompt must not be empty"));
            }
            return Ok(prompt.clone());
        }

        if !params
            .messages
            .iter()
            .any(|m| matches!(m.role, Role::Human | Role::Ai))
        {
            return Err(LlmOpsError::validation(
                "messages must contain at least one human or ai turn",
            ));
        }

        let prompt = match (&self.forced, params.model_identifier.is_empty()) {
            (Some(template), _) => template.render(params.system_message.as_deref(), &params.messages),
            (None, true) => self
                .default
                .render(params.system_message.as_deref(), &params.messages),
            (None, false) => ConversationTemplate::for_model(&params.model_identifier)
                .render(params.system_message.as_deref(), &params.messages),
        };
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::human("Hi"),
            ChatMessage::ai("Hello!"),
            ChatMessage::human("Tell me a joke"),
        ]
    }

    #[test]
    fn test_vicuna_prompt() {
        let template = ConversationTemplate::named("vicuna_v1.1").unwrap();
        let prompt = template.render(Some("SYS"), &conversation());
        assert_eq!(
            prompt,
            "SYS USER: Hi ASSISTANT: Hello!</s>USER: Tell me a joke ASSISTANT:"
        );
    }

    #[test]
    fn test_llama2_prompt_with_system() {
        let template = ConversationTemplate::named("llama-2").unwrap();
        let prompt = template.render(Some("Be brief."), &[ChatMessage::human("Hi")]);
        assert_eq!(prompt, "[INST] <<SYS>>\nBe brief.\n<</SYS>>\n\nHi [/INST]");
    }

    #[test]
    fn test_llama2_prompt_without_system() {
        let template = ConversationTemplate::named("llama-2").unwrap();
        let prompt = template.render(None, &conversation());
        assert_eq!(
            prompt,
            "[INST] Hi [/INST] Hello! </s><s>[INST] Tell me a joke [/INST]"
        );
    }

    #[test]
    fn test_chatml_prompt() {
        let template = ConversationTemplate::named("chatml").unwrap();
        let prompt = template.render(Some("S"), &[ChatMessage::human("Hi")]);
        assert_eq!(
            prompt,
            "<|im_start|>system\nS<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_unknown_roles_are_skipped() {
        let template = ConversationTemplate::named("raw").unwrap();
        let messages = vec![
            ChatMessage::human("a"),
            ChatMessage { role: Role::Other, text: "ignored".to_string() },
            ChatMessage::ai("b"),
        ];
        assert_eq!(template.render(None, &messages), "ab");
    }

    #[test]
    fn test_template_picked_from_model_identifier() {
        assert_eq!(ConversationTemplate::for_model("lmsys/vicuna-7b-v1.5").name(), "vicuna_v1.1");
        assert_eq!(ConversationTemplate::for_model("meta/Llama-2-7b-chat").name(), "llama-2");
        assert_eq!(ConversationTemplate::for_model("Qwen/Qwen1.5-7B-Chat").name(), "chatml");
        assert_eq!(ConversationTemplate::for_model("mystery").name(), "zero_shot");
    }

    #[test]
    fn test_builder_rejects_unknown_template() {
        assert!(PromptBuilder::new(Some("no-such-template"), "m").is_err());
    }

    #[test]
    fn test_builder_forced_template_wins() {
        let builder = PromptBuilder::new(Some("raw"), "lmsys/vicuna-7b").unwrap();
        let params = GenerateParams {
            model_identifier: "llama-2".to_string(),
            messages: vec![ChatMessage::human("x")],
            ..Default::default()
        };
        assert_eq!(builder.build(&params).unwrap(), "x");
        assert_eq!(builder.default_template().name(), "raw");
    }

    #[test]
    fn test_builder_validation() {
        let builder = PromptBuilder::new(None, "m").unwrap();

        let empty = GenerateParams::default();
        assert!(matches!(builder.build(&empty), Err(LlmOpsError::Validation(_))));

        let raw = GenerateParams {
            prompt: Some("verbatim".to_string()),
            ..Default::default()
        };
        assert_eq!(builder.build(&raw).unwrap(), "verbatim");
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let builder = PromptBuilder::new(None, "lmsys/vicuna-7b").unwrap();
        let params = GenerateParams {
            messages: conversation(),
            ..Default::default()
        };
        assert_eq!(builder.build(&params).unwrap(), builder.build(&params).unwrap());
    }
}
