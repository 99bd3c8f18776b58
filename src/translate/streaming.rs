//! Per-request state for translating Gemini stream results into OpenAI chunks.
//!
//! Every chunk of one completion shares the same `id`, `created` and `model`;
//! the first chunk additionally announces `role: "assistant"` in its delta.
//! The translator emits exactly one [`ChatCompletionChunk`] per backend result.

use std::collections::HashMap;

use super::gemini_types::GenerateContentResponse;
use super::openai_types::{ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkToolCall, FinishReason};
use super::response::{
    content_tool_calls, map_finish_reason, new_completion_id, prompt_blocked, usage_from_metadata,
    with_tool_calls,
};

#[derive(Debug)]
pub struct ChunkTranslator {
    id: String,
    created: i64,
    model: String,
    include_usage: bool,
    role_sent: bool,
    /// Tool calls emitted so far, per choice index.
    tool_calls_sent: HashMap<u32, u32>,
}

impl ChunkTranslator {
    pub fn new(model: &str, include_usage: bool) -> Self {
        Self {
            id: new_completion_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            include_usage,
            role_sent: false,
            tool_calls_sent: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Translate one backend stream result into one chunk.
    pub fn process(&mut self, resp: &GenerateContentResponse) -> ChatCompletionChunk {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant".to_string())
        };

        let mut choices = Vec::with_capacity(resp.candidates.len().max(1));

        for (position, candidate) in resp.candidates.iter().enumerate() {
            let text = candidate
                .content
                .as_ref()
                .map(|c| c.text())
                .unwrap_or_default();
            let calls = candidate
                .content
                .as_ref()
                .map(content_tool_calls)
                .unwrap_or_default();

            let choice_index = position as u32;
            let sent = self.tool_calls_sent.entry(choice_index).or_insert(0);
            let tool_calls: Vec<ChunkToolCall> = calls
                .into_iter()
                .map(|call| {
                    let index = *sent;
                    *sent += 1;
                    ChunkToolCall {
                        index,
                        id: call.id,
                        call_type: call.call_type,
                        function: call.function,
                    }
                })
                .collect();

            let finish_reason = with_tool_calls(
                candidate.finish_reason.and_then(map_finish_reason),
                *sent > 0,
            );

            choices.push(ChunkChoice {
                index: choice_index,
                delta: ChunkDelta {
                    role: role.clone(),
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason,
            });
        }

        // Results without candidates (usage-only trailers, blocked prompts)
        // still occupy a chunk so ordering stays one-to-one.
        if choices.is_empty() {
            choices.push(ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role,
                    ..ChunkDelta::default()
                },
                finish_reason: prompt_blocked(resp).then_some(FinishReason::ContentFilter),
            });
        }

        let finished = choices.iter().any(|c| c.finish_reason.is_some());
        let usage = (self.include_usage && finished)
            .then(|| usage_from_metadata(resp.usage_metadata.as_ref()));

        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage,
        }
    }
}
