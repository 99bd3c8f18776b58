//! Translate OpenAI chat and embedding requests into Gemini requests.
//!
//! Gemini only knows two conversational roles (`user` and `model`), so system
//! and tool messages are folded onto the user side. Older Gemini versions also
//! reject two consecutive turns with the same role; [`MergePolicy`] controls how
//! aggressively turns are merged to satisfy that.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::gemini_types::{
    BatchEmbedContentsRequest, Content, EmbedContentRequest, FunctionCallingConfig,
    FunctionDeclaration, GenerateContentRequest, GenerationConfig, Part, SafetySetting, Tool,
    ToolConfig, HARM_CATEGORIES, ROLE_MODEL, ROLE_USER,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatMessage, ChatToolChoice, ContentPart, EmbeddingRequest,
    Role,
};
use crate::error::{ProxyError, Result};

const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/heic",
    "image/heif",
];

/// Where leading system messages end up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    /// Prefix the system text onto the first user turn.
    #[default]
    Fold,
    /// Send it as the backend's dedicated `systemInstruction`.
    Instruction,
    /// Treat it like any other user message.
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicy {
    /// Merge consecutive turns that map to the same backend role.
    #[serde(default = "default_true")]
    pub merge_consecutive_roles: bool,
    #[serde(default)]
    pub system: SystemMode,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            merge_consecutive_roles: true,
            system: SystemMode::Fold,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The converted conversation, ready to drop into a `generateContent` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMessages {
    pub contents: Vec<Content>,
    pub system_instruction: Option<Content>,
}

/// Translate a chat completion request into a Gemini `generateContent` request.
/// Pure function: every failure is an input validation error.
pub fn openai_to_gemini(
    req: &ChatCompletionRequest,
    policy: &MergePolicy,
    safety_threshold: Option<&str>,
) -> Result<GenerateContentRequest> {
    let messages = to_backend_messages(&req.messages, policy)?;

    Ok(GenerateContentRequest {
        contents: messages.contents,
        system_instruction: messages.system_instruction,
        generation_config: generation_config(req),
        safety_settings: safety_threshold.map(safety_settings),
        tools: translate_tools(req)?,
        tool_config: req.tool_choice.as_ref().map(translate_tool_choice).transpose()?,
    })
}

/// Map chat messages onto backend turns according to `policy`.
pub fn to_backend_messages(messages: &[ChatMessage], policy: &MergePolicy) -> Result<BackendMessages> {
    if messages.is_empty() {
        return Err(ProxyError::invalid_request(
            "messages must contain at least one message",
        ));
    }

    let mut contents: Vec<Content> = Vec::new();
    let mut system_parts: Vec<Part> = Vec::new();
    let mut leading = true;
    // tool_call_id -> function name, so tool results can be matched to their calls
    let mut call_names: HashMap<String, String> = HashMap::new();

    for msg in messages {
        let (role, parts) = match &msg.role {
            Role::Unknown(other) => {
                return Err(ProxyError::invalid_request(format!(
                    "unsupported message role '{other}'"
                )));
            }
            Role::System if leading && policy.system != SystemMode::User => {
                system_parts.extend(content_parts(msg.content.as_ref())?);
                continue;
            }
            Role::System | Role::User => (ROLE_USER, content_parts(msg.content.as_ref())?),
            Role::Assistant => (ROLE_MODEL, assistant_parts(msg, &mut call_names)?),
            Role::Tool => (ROLE_USER, tool_parts(msg, &call_names)),
        };
        leading = false;
        push_turn(&mut contents, role, parts, policy.merge_consecutive_roles);
    }

    if contents.is_empty() && system_parts.is_empty() {
        return Err(ProxyError::invalid_request("messages contain no content"));
    }

    let mut system_instruction = None;
    if !system_parts.is_empty() {
        match policy.system {
            SystemMode::Instruction if !contents.is_empty() => {
                system_instruction = Some(Content {
                    role: None,
                    parts: system_parts,
                });
            }
            _ => fold_system(&mut contents, system_parts),
        }
    }

    Ok(BackendMessages {
        contents,
        system_instruction,
    })
}

/// Turns without parts are dropped; Gemini rejects empty text parts.
fn push_turn(contents: &mut Vec<Content>, role: &str, mut parts: Vec<Part>, merge: bool) {
    if parts.is_empty() {
        return;
    }

    if merge {
        if let Some(last) = contents.last_mut() {
            if last.role.as_deref() == Some(role) {
                last.parts.append(&mut parts);
                return;
            }
        }
    }

    contents.push(Content::new(role, parts));
}

fn fold_system(contents: &mut Vec<Content>, mut system_parts: Vec<Part>) {
    match contents.first_mut() {
        Some(first) if first.role.as_deref() == Some(ROLE_USER) => {
            system_parts.append(&mut first.parts);
            first.parts = system_parts;
        }
        _ => contents.insert(0, Content::new(ROLE_USER, system_parts)),
    }
}

fn content_parts(content: Option<&ChatContent>) -> Result<Vec<Part>> {
    match content {
        None => Ok(Vec::new()),
        Some(ChatContent::Text(text)) => Ok(vec![Part::text(text.clone())]),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Ok(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } => image_part(&image_url.url),
            })
            .collect(),
    }
}

/// Accepts base64 data URLs (sent inline) and http(s)/gs references (sent as
/// file data for the backend to fetch).
fn image_part(url: &str) -> Result<Part> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (meta, data) = rest
            .split_once(',')
            .ok_or_else(|| ProxyError::invalid_request("malformed image data URL"))?;
        let mime_type = meta.strip_suffix(";base64").ok_or_else(|| {
            ProxyError::invalid_request("image data URLs must be base64-encoded")
        })?;
        if !SUPPORTED_IMAGE_TYPES.contains(&mime_type) {
            return Err(ProxyError::invalid_request(format!(
                "unsupported image type '{mime_type}'"
            )));
        }
        if data.is_empty() {
            return Err(ProxyError::invalid_request("image data URL has no data"));
        }
        return Ok(Part::inline_data(mime_type, data));
    }

    if ["http://", "https://", "gs://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        return Ok(Part::file_data(mime_from_path(url), url));
    }

    Err(ProxyError::invalid_request(format!(
        "unsupported image reference '{}'",
        url.chars().take(64).collect::<String>()
    )))
}

fn mime_from_path(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        _ => "image/jpeg",
    }
}

fn assistant_parts(msg: &ChatMessage, call_names: &mut HashMap<String, String>) -> Result<Vec<Part>> {
    let mut parts = content_parts(msg.content.as_ref())?;
    // Assistant turns with tool calls usually carry `content: ""`
    parts.retain(|p| p.text.as_deref() != Some(""));

    for call in msg.tool_calls.iter().flatten() {
        let args = call_arguments(&call.function.name, &call.function.arguments)?;
        call_names.insert(call.id.clone(), call.function.name.clone());
        parts.push(Part::function_call(call.function.name.clone(), args));
    }

    Ok(parts)
}

/// Blank arguments mean a call without parameters; anything else must be a
/// JSON object.
fn call_arguments(name: &str, arguments: &str) -> Result<serde_json::Value> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    match serde_json::from_str::<serde_json::Value>(arguments) {
        Ok(value @ serde_json::Value::Object(_)) => Ok(value),
        Ok(_) => Err(ProxyError::invalid_request(format!(
            "arguments of tool call '{name}' must be a JSON object"
        ))),
        Err(e) => Err(ProxyError::invalid_request(format!(
            "arguments of tool call '{name}' are not valid JSON: {e}"
        ))),
    }
}

fn tool_parts(msg: &ChatMessage, call_names: &HashMap<String, String>) -> Vec<Part> {
    let text = msg.content.as_ref().map(ChatContent::as_text).unwrap_or_default();
    let name = msg.name.clone().or_else(|| {
        msg.tool_call_id
            .as_ref()
            .and_then(|id| call_names.get(id).cloned())
    });

    match name {
        Some(name) => {
            let response = match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value @ serde_json::Value::Object(_)) => value,
                Ok(value) => serde_json::json!({ "content": value }),
                Err(_) => serde_json::json!({ "content": text }),
            };
            vec![Part::function_response(name, response)]
        }
        None => vec![Part::text(text)],
    }
}

/// Only values the caller set are forwarded; the backend applies its own defaults.
fn generation_config(req: &ChatCompletionRequest) -> Option<GenerationConfig> {
    let response_mime_type = req
        .response_format
        .as_ref()
        .filter(|f| f.format_type == "json_object" || f.format_type == "json_schema")
        .map(|_| "application/json".to_string());

    let config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_tokens.or(req.max_completion_tokens),
        stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
        candidate_count: req.n,
        response_mime_type,
    };

    (!config.is_empty()).then_some(config)
}

fn safety_settings(threshold: &str) -> Vec<SafetySetting> {
    HARM_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: (*category).to_string(),
            threshold: threshold.to_string(),
        })
        .collect()
}

fn translate_tools(req: &ChatCompletionRequest) -> Result<Option<Vec<Tool>>> {
    let mut declarations = Vec::new();

    for tool in req.tools.iter().flatten() {
        if tool.tool_type != "function" {
            return Err(ProxyError::invalid_request(format!(
                "unsupported tool type '{}'",
                tool.tool_type
            )));
        }
        declarations.push(FunctionDeclaration {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.clone(),
        });
    }

    for function in req.functions.iter().flatten() {
        declarations.push(FunctionDeclaration {
            name: function.name.clone(),
            description: function.description.clone(),
            parameters: function.parameters.clone(),
        });
    }

    if declarations.is_empty() {
        return Ok(None);
    }

    Ok(Some(vec![Tool {
        function_declarations: declarations,
    }]))
}

fn translate_tool_choice(choice: &ChatToolChoice) -> Result<ToolConfig> {
    let (mode, allowed) = match choice {
        ChatToolChoice::Mode(mode) => match mode.as_str() {
            "none" => ("NONE", None),
            "auto" => ("AUTO", None),
            "required" => ("ANY", None),
            other => {
                return Err(ProxyError::invalid_request(format!(
                    "unsupported tool_choice '{other}'"
                )));
            }
        },
        ChatToolChoice::Named(named) => ("ANY", Some(vec![named.function.name.clone()])),
    };

    Ok(ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    })
}

/// Translate an embeddings request into a Gemini `batchEmbedContents` request.
pub fn embedding_to_gemini(req: &EmbeddingRequest, backend_model: &str) -> Result<BatchEmbedContentsRequest> {
    let inputs = req.input.as_slice();
    if inputs.is_empty() {
        return Err(ProxyError::invalid_request("input must not be empty"));
    }
    if inputs.iter().any(String::is_empty) {
        return Err(ProxyError::invalid_request("input must not contain empty strings"));
    }

    let model = format!("models/{}", backend_model.trim_start_matches("models/"));

    Ok(BatchEmbedContentsRequest {
        requests: inputs
            .iter()
            .map(|text| EmbedContentRequest {
                model: model.clone(),
                content: Content {
                    role: None,
                    parts: vec![Part::text(text.clone())],
                },
                output_dimensionality: req.dimensions,
            })
            .collect(),
    })
}
