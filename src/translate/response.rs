use super::gemini_types::{
    BackendFinishReason, BatchEmbedContentsResponse, Candidate, Content, GenerateContentResponse,
    UsageMetadata,
};
use super::openai_types::{
    ChatCompletionResponse, ChatToolCall, ChatToolCallFunction, Choice, ChoiceMessage,
    EmbeddingData, EmbeddingResponse, EmbeddingUsage, FinishReason, Usage,
};
use crate::error::{ProxyError, Result};

/// Translate a Gemini `generateContent` response into a chat completion.
/// Pure function: `requested_model` is the model name the client asked for.
pub fn gemini_to_openai(resp: &GenerateContentResponse, requested_model: &str) -> ChatCompletionResponse {
    let mut choices: Vec<Choice> = resp
        .candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| candidate_to_choice(position as u32, candidate))
        .collect();

    // A blocked prompt yields no candidates at all
    if choices.is_empty() {
        let blocked = prompt_blocked(resp);
        choices.push(Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: Some(String::new()),
                tool_calls: None,
            },
            finish_reason: Some(if blocked {
                FinishReason::ContentFilter
            } else {
                FinishReason::Stop
            }),
        });
    }

    ChatCompletionResponse {
        id: new_completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: requested_model.to_string(),
        choices,
        usage: usage_from_metadata(resp.usage_metadata.as_ref()),
    }
}

fn candidate_to_choice(index: u32, candidate: &Candidate) -> Choice {
    let text = candidate
        .content
        .as_ref()
        .map(Content::text)
        .unwrap_or_default();
    let tool_calls = candidate
        .content
        .as_ref()
        .map(content_tool_calls)
        .unwrap_or_default();

    let finish_reason = candidate
        .finish_reason
        .map_or(Some(FinishReason::Stop), map_finish_reason);

    let (content, tool_calls) = if tool_calls.is_empty() {
        (Some(text), None)
    } else {
        ((!text.is_empty()).then_some(text), Some(tool_calls))
    };

    Choice {
        index,
        finish_reason: with_tool_calls(finish_reason, tool_calls.is_some()),
        message: ChoiceMessage {
            role: "assistant".to_string(),
            content,
            tool_calls,
        },
    }
}

/// Map a Gemini finish reason onto the OpenAI vocabulary.
///
/// Total over the enum: reasons with no OpenAI counterpart become `stop`,
/// except `OTHER`, which is reported as `null`.
pub fn map_finish_reason(reason: BackendFinishReason) -> Option<FinishReason> {
    match reason {
        BackendFinishReason::Stop => Some(FinishReason::Stop),
        BackendFinishReason::MaxTokens => Some(FinishReason::Length),
        BackendFinishReason::Safety
        | BackendFinishReason::Recitation
        | BackendFinishReason::Blocklist
        | BackendFinishReason::ProhibitedContent
        | BackendFinishReason::Spii => Some(FinishReason::ContentFilter),
        BackendFinishReason::Other => None,
        BackendFinishReason::FinishReasonUnspecified
        | BackendFinishReason::Language
        | BackendFinishReason::MalformedFunctionCall
        | BackendFinishReason::Unrecognized => Some(FinishReason::Stop),
    }
}

pub(crate) fn prompt_blocked(resp: &GenerateContentResponse) -> bool {
    resp.prompt_feedback
        .as_ref()
        .is_some_and(|f| f.block_reason.is_some())
}

/// A normal stop that produced function calls is reported as `tool_calls`.
pub(crate) fn with_tool_calls(reason: Option<FinishReason>, has_tool_calls: bool) -> Option<FinishReason> {
    match reason {
        Some(FinishReason::Stop) if has_tool_calls => Some(FinishReason::ToolCalls),
        other => other,
    }
}

pub(crate) fn content_tool_calls(content: &Content) -> Vec<ChatToolCall> {
    content
        .parts
        .iter()
        .filter_map(|p| p.function_call.as_ref())
        .map(|call| ChatToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: call.name.clone(),
                arguments: serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string()),
            },
        })
        .collect()
}

/// Missing counters are reported as zero, never estimated.
pub fn usage_from_metadata(metadata: Option<&UsageMetadata>) -> Usage {
    let Some(metadata) = metadata else {
        return Usage::default();
    };

    let prompt_tokens = metadata.prompt_token_count.unwrap_or(0);
    let completion_tokens = metadata.candidates_token_count.unwrap_or(0);

    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
    }
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Translate a Gemini `batchEmbedContents` response, keeping input order.
pub fn gemini_embeddings_to_openai(
    resp: BatchEmbedContentsResponse,
    requested_model: &str,
    expected: usize,
) -> Result<EmbeddingResponse> {
    if resp.embeddings.len() != expected {
        return Err(ProxyError::unexpected_response(format!(
            "expected {expected} embeddings, backend returned {}",
            resp.embeddings.len()
        )));
    }

    let data = resp
        .embeddings
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingData {
            object: "embedding".to_string(),
            embedding: embedding.values,
            index,
        })
        .collect();

    Ok(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: requested_model.to_string(),
        usage: EmbeddingUsage::default(),
    })
}
