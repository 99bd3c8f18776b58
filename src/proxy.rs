//! Per-operation orchestration: validate and convert the request, call the
//! backend, convert the result. Every conversion error surfaces before the
//! backend is contacted.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::logging::{LogLevel, RequestEvent, SharedLogger};
use crate::models;
use crate::stream::{spawn_stream_worker, ChunkStream};
use crate::translate::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelList,
    ModelObject,
};
use crate::translate::request::{embedding_to_gemini, openai_to_gemini};
use crate::translate::response::{gemini_embeddings_to_openai, gemini_to_openai};
use crate::translate::streaming::ChunkTranslator;

/// Forward a non-streaming chat completion.
pub async fn proxy_chat(
    req: &ChatCompletionRequest,
    config: &ProxyConfig,
    backend: &dyn Backend,
    logger: &SharedLogger,
) -> Result<ChatCompletionResponse> {
    let backend_model = config.backend_model(&req.model);
    let gemini_req = openai_to_gemini(req, &config.merge, config.backend.safety_threshold.as_deref())?;

    let event = RequestEvent::new("chat.completions", &req.model).backend_model(&backend_model);
    logger.request(
        LogLevel::Info,
        "proxy",
        format!("generateContent model={} turns={}", backend_model, gemini_req.contents.len()),
        &event,
    );

    let started = Instant::now();
    let gemini_resp = backend.generate(&backend_model, &gemini_req).await?;
    let response = gemini_to_openai(&gemini_resp, &req.model);

    logger.request(
        LogLevel::Info,
        "proxy",
        format!(
            "Completed: choices={} prompt={} completion={} tokens",
            response.choices.len(),
            response.usage.prompt_tokens,
            response.usage.completion_tokens
        ),
        &event.usage(&response.usage).status(200).elapsed_since(started),
    );

    Ok(response)
}

/// Open a streamed chat completion. Failures opening the backend stream are
/// returned here, before any chunk exists; later failures arrive through the
/// returned stream.
pub async fn proxy_chat_stream(
    req: &ChatCompletionRequest,
    config: &ProxyConfig,
    backend: &dyn Backend,
    logger: &SharedLogger,
    cancel: CancellationToken,
) -> Result<ChunkStream> {
    let backend_model = config.backend_model(&req.model);
    let gemini_req = openai_to_gemini(req, &config.merge, config.backend.safety_threshold.as_deref())?;

    let event = RequestEvent::new("chat.completions", &req.model)
        .backend_model(&backend_model)
        .streaming(true);
    logger.request(
        LogLevel::Info,
        "proxy",
        format!("streamGenerateContent model={} turns={}", backend_model, gemini_req.contents.len()),
        &event,
    );

    let backend_stream = backend.stream_generate(&backend_model, &gemini_req).await?;
    let translator = ChunkTranslator::new(&req.model, req.include_usage_in_stream());

    Ok(spawn_stream_worker(
        backend_stream,
        translator,
        config.streaming.capacity(),
        cancel,
        logger.clone(),
    ))
}

/// Forward an embeddings request. One vector per input, in input order.
pub async fn proxy_embeddings(
    req: &EmbeddingRequest,
    config: &ProxyConfig,
    backend: &dyn Backend,
    logger: &SharedLogger,
) -> Result<EmbeddingResponse> {
    let backend_model = config.backend_model(&req.model);
    let gemini_req = embedding_to_gemini(req, &backend_model)?;
    let expected = gemini_req.requests.len();

    let event = RequestEvent::new("embeddings", &req.model).backend_model(&backend_model);
    logger.request(
        LogLevel::Info,
        "proxy",
        format!("batchEmbedContents model={} inputs={}", backend_model, expected),
        &event,
    );

    let started = Instant::now();
    let gemini_resp = backend.embed(&backend_model, &gemini_req).await?;
    let response = gemini_embeddings_to_openai(gemini_resp, &req.model, expected)?;

    logger.request(
        LogLevel::Debug,
        "proxy",
        format!("Embedded {} inputs", response.data.len()),
        &event.status(200).elapsed_since(started),
    );

    Ok(response)
}

pub async fn list_models(
    config: &ProxyConfig,
    backend: &dyn Backend,
    logger: &SharedLogger,
) -> Result<ModelList> {
    let models = backend.list_models().await?;
    logger.debug("proxy", format!("Backend listed {} models", models.len()));
    Ok(models::model_list(&models, &config.backend.owned_by))
}

/// Single-model lookup. Echoes the id without consulting the backend.
pub fn describe_model(id: &str, config: &ProxyConfig) -> ModelObject {
    models::model_object(id, &config.backend.owned_by)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStream;
    use crate::error::ProxyError;
    use crate::translate::gemini_types::*;
    use crate::translate::openai_types::{ChatMessage, EmbeddingInput, Role};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls so tests can assert validation happens first.
    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn generate(&self, model: &str, _request: &GenerateContentRequest) -> Result<GenerateContentResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(model, "gemini-1.5-pro");
            Ok(GenerateContentResponse {
                candidates: vec![Candidate {
                    content: Some(Content::new(ROLE_MODEL, vec![Part::text("hello")])),
                    finish_reason: Some(BackendFinishReason::Stop),
                    index: Some(0),
                }],
                ..GenerateContentResponse::default()
            })
        }

        async fn stream_generate(&self, _model: &str, _request: &GenerateContentRequest) -> Result<BackendStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProxyError::backend(429, "quota"))
        }

        async fn embed(&self, _model: &str, _request: &BatchEmbedContentsRequest) -> Result<BatchEmbedContentsResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // One short of what was asked for
            Ok(BatchEmbedContentsResponse {
                embeddings: vec![ContentEmbedding { values: vec![0.5] }],
            })
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ModelInfo {
                name: "models/gemini-1.5-flash".to_string(),
                ..ModelInfo::default()
            }])
        }
    }

    fn test_logger() -> (tempfile::TempDir, SharedLogger) {
        let dir = tempfile::tempdir().unwrap();
        let logger = SharedLogger::new(dir.path().join("proxy.log")).unwrap();
        (dir, logger)
    }

    #[tokio::test]
    async fn test_chat_echoes_requested_model() {
        let (_dir, logger) = test_logger();
        let backend = CountingBackend::default();
        let req = ChatCompletionRequest::new("gpt-4", vec![ChatMessage::text(Role::User, "hi")]);

        let resp = proxy_chat(&req, &ProxyConfig::default(), &backend, &logger)
            .await
            .unwrap();

        assert_eq!(resp.model, "gpt-4");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
        assert!(logger.recent(10).iter().any(|e| e.request.is_some()));
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_backend() {
        let (_dir, logger) = test_logger();
        let backend = CountingBackend::default();
        let req = ChatCompletionRequest::new("gpt-4", vec![]);

        let err = proxy_chat(&req, &ProxyConfig::default(), &backend, &logger)
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::InvalidRequest { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_open_failure_is_returned_directly() {
        let (_dir, logger) = test_logger();
        let backend = CountingBackend::default();
        let req = ChatCompletionRequest::new("gpt-4", vec![ChatMessage::text(Role::User, "hi")]);

        let result = proxy_chat_stream(
            &req,
            &ProxyConfig::default(),
            &backend,
            &logger,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ProxyError::Backend { status: 429, .. })));
    }

    #[tokio::test]
    async fn test_embedding_count_mismatch() {
        let (_dir, logger) = test_logger();
        let backend = CountingBackend::default();
        let req = EmbeddingRequest {
            model: "text-embedding-ada-002".to_string(),
            input: EmbeddingInput::Multiple(vec!["a".to_string(), "b".to_string()]),
            encoding_format: None,
            dimensions: None,
            user: None,
        };

        let err = proxy_embeddings(&req, &ProxyConfig::default(), &backend, &logger)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnexpectedResponse { .. }));
    }

    #[tokio::test]
    async fn test_list_models_uses_configured_owner() {
        let (_dir, logger) = test_logger();
        let backend = CountingBackend::default();
        let mut config = ProxyConfig::default();
        config.backend.owned_by = "acme".to_string();

        let list = list_models(&config, &backend, &logger).await.unwrap();
        assert_eq!(list.data[0].id, "gemini-1.5-flash");
        assert_eq!(list.data[0].owned_by, "acme");

        assert_eq!(describe_model("gpt-4", &config).id, "gpt-4");
    }
}
