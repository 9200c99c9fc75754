use serde::{Deserialize, Serialize};

use crate::config::AgentSpec;

pub const ANALYST_PREAMBLE: &str =
    "You are a specialized code analysis assistant. Focus on your unique role or perspective.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

/// One agent's request against the shared document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub name: String,
    pub system_role: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

pub fn compose_requests(agents: &[AgentSpec], document: &str) -> Vec<PromptRequest> {
    agents
        .iter()
        .map(|agent| PromptRequest {
            name: agent.name.clone(),
            system_role: agent.role_system.clone(),
            prompt: format!("{}\n\nCode to analyze:\n{}", agent.role_user, document),
        })
        .collect()
}

pub fn chat_messages(request: &PromptRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new("system", ANALYST_PREAMBLE),
        ChatMessage::new(
            "system",
            format!("You are now acting as {}. {}", request.name, request.system_role),
        ),
        ChatMessage::new("user", request.prompt.clone()),
    ]
}

pub fn chat_template_for(family: PromptFamily) -> &'static str {
    match family {
        PromptFamily::Llama => concat!(
            "{% for m in messages %}<|start_header_id|>{{ m.role }}<|end_header_id|>\n\n",
            "{{ m.content }}<|eot_id|>{% endfor %}",
            "<|start_header_id|>assistant<|end_header_id|>\n\n"
        ),
        PromptFamily::Qwen => concat!(
            "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>\n{% endfor %}",
            "<|im_start|>assistant\n"
        ),
        PromptFamily::Mistral => concat!(
            "[INST] {% for m in messages %}{{ m.content }}\n\n{% endfor %}[/INST]"
        ),
        PromptFamily::Unknown => concat!(
            "{% for m in messages %}[{{ m.role }}]\n{{ m.content }}\n{% endfor %}[assistant]\n"
        ),
    }
}

/// Renders the request as a single prompt in the family's chat markup.
/// `template_override` replaces the family template and sees the same
/// `messages` and `agent` variables.
pub fn render_prompt(
    request: &PromptRequest,
    family: PromptFamily,
    template_override: Option<&str>,
) -> Result<String, minijinja::Error> {
    let source = template_override.unwrap_or_else(|| chat_template_for(family));
    let mut env = minijinja::Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("chat", source)?;
    let tmpl = env.get_template("chat")?;
    tmpl.render(minijinja::context! {
        messages => chat_messages(request),
        agent => &request.name,
    })
}

pub fn infer_family_from_filename(name: &str) -> PromptFamily {
    let lowered = name.to_lowercase();
    if lowered.contains("llama") {
        PromptFamily::Llama
    } else if lowered.contains("qwen") {
        PromptFamily::Qwen
    } else if lowered.contains("mistral") || lowered.contains("mixtral") {
        PromptFamily::Mistral
    } else {
        PromptFamily::Unknown
    }
}
