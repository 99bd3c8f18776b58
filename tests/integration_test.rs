use async_trait::async_trait;
use futures::StreamExt;
use gemini_openai_proxy::backend::{Backend, BackendStream};
use gemini_openai_proxy::translate::gemini_types::*;
use gemini_openai_proxy::{build_router, AppState, ProxyConfig, ProxyError, Result, SharedLogger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ────────────────────────────────────────────────────────────────
// Scripted backend
// ────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum StreamScript {
    /// Emit one result per text, then end normally.
    Chunks(Vec<&'static str>),
    /// Emit the texts, then fail with the given backend status.
    FailAfter(Vec<&'static str>, u16),
}

struct FakeBackend {
    stream: StreamScript,
    generate_status: Option<u16>,
    models: Vec<ModelInfo>,
    calls: AtomicUsize,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            stream: StreamScript::Chunks(vec!["c1", "c2", "c3"]),
            generate_status: None,
            models: vec![model_info("gemini-1.5-pro"), model_info("text-embedding-004")],
            calls: AtomicUsize::new(0),
        }
    }

    fn with_stream(mut self, script: StreamScript) -> Self {
        self.stream = script;
        self
    }

    fn failing_generate(mut self, status: u16) -> Self {
        self.generate_status = Some(status);
        self
    }
}

fn model_info(id: &str) -> ModelInfo {
    ModelInfo {
        name: format!("models/{id}"),
        ..ModelInfo::default()
    }
}

fn text_result(text: &str, finish: Option<BackendFinishReason>) -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content::new(ROLE_MODEL, vec![Part::text(text)])),
            finish_reason: finish,
            index: Some(0),
        }],
        usage_metadata: Some(UsageMetadata {
            prompt_token_count: Some(5),
            candidates_token_count: Some(2),
            total_token_count: Some(7),
        }),
        ..GenerateContentResponse::default()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn generate(&self, _model: &str, _request: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.generate_status {
            Some(status) => Err(ProxyError::backend(
                status,
                "Resource has been exhausted (e.g. check quota).",
            )),
            None => Ok(text_result("Hello!", Some(BackendFinishReason::Stop))),
        }
    }

    async fn stream_generate(&self, _model: &str, _request: &GenerateContentRequest) -> Result<BackendStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (texts, failure) = match &self.stream {
            StreamScript::Chunks(texts) => (texts.clone(), None),
            StreamScript::FailAfter(texts, status) => (texts.clone(), Some(*status)),
        };

        let last = texts.len().saturating_sub(1);
        let mut items: Vec<Result<GenerateContentResponse>> = texts
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let finish = (i == last && failure.is_none()).then_some(BackendFinishReason::Stop);
                Ok(text_result(t, finish))
            })
            .collect();
        if let Some(status) = failure {
            items.push(Err(ProxyError::backend(status, "upstream went away")));
        }

        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn embed(&self, _model: &str, request: &BatchEmbedContentsRequest) -> Result<BatchEmbedContentsResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let embeddings = request
            .requests
            .iter()
            .enumerate()
            .map(|(i, r)| ContentEmbedding {
                values: vec![i as f32, r.content.text().len() as f32],
            })
            .collect();
        Ok(BatchEmbedContentsResponse { embeddings })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.models.clone())
    }
}

struct TestServer {
    base: String,
    backend: Arc<FakeBackend>,
    client: reqwest::Client,
    _log_dir: tempfile::TempDir,
}

async fn spawn_server(backend: FakeBackend) -> TestServer {
    let log_dir = tempfile::tempdir().unwrap();
    let logger = SharedLogger::new(log_dir.path().join("test.log")).unwrap();
    let backend = Arc::new(backend);

    let state = Arc::new(AppState {
        config: ProxyConfig {
            port: 0,
            ..ProxyConfig::default()
        },
        backend: backend.clone(),
        logger,
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        backend,
        client: reqwest::Client::new(),
        _log_dir: log_dir,
    }
}

impl TestServer {
    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .header("Authorization", "Bearer sk-anything")
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }
}

fn data_lines(body: &str) -> Vec<&str> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect()
}

fn chat_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "m",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    })
}

// ────────────────────────────────────────────────────────────────
// End-to-end scenarios
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_completion_returns_one_choice() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "m");
    assert_eq!(body["choices"].as_array().unwrap().len(), 1);
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 7);
}

#[tokio::test]
async fn test_streaming_preserves_order_and_ends_with_done() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers()["cache-control"].to_str().unwrap(), "no-cache");
    assert_eq!(resp.headers()["x-accel-buffering"].to_str().unwrap(), "no");

    let body = resp.text().await.unwrap();
    assert!(
        body.lines().filter(|l| !l.is_empty()).all(|l| l.starts_with("data: ")),
        "non-data line in body: {body:?}"
    );
    let data = data_lines(&body);
    assert_eq!(data.last(), Some(&"[DONE]"));

    let chunks: Vec<serde_json::Value> = data[..data.len() - 1]
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    let contents: Vec<&str> = chunks
        .iter()
        .map(|c| c["choices"][0]["delta"]["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["c1", "c2", "c3"]);

    assert_eq!(chunks[0]["object"], "chat.completion.chunk");
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert!(chunks[1]["choices"][0]["delta"].get("role").is_none());
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
}

#[tokio::test]
async fn test_embeddings_in_input_order() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server
        .post(
            "/v1/embeddings",
            serde_json::json!({"model": "m", "input": ["a", "bb"]}),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["index"], 0);
    assert_eq!(data[0]["embedding"], serde_json::json!([0.0, 1.0]));
    assert_eq!(data[1]["index"], 1);
    assert_eq!(data[1]["embedding"], serde_json::json!([1.0, 2.0]));
    assert_eq!(body["model"], "m");
}

#[tokio::test]
async fn test_malformed_json_is_invalid_request() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server
        .client
        .post(format!("{}/v1/chat/completions", server.base))
        .header("Authorization", "Bearer sk-anything")
        .header("Content-Type", "application/json")
        .body("{\"model\": \"m\", \"messages\": [")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 400);
    assert_eq!(body["type"], "invalid_request_error");
    assert_eq!(server.backend.calls.load(Ordering::SeqCst), 0);
}

// ────────────────────────────────────────────────────────────────
// Error handling
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rate_limit_normalized() {
    let server = spawn_server(FakeBackend::new().failing_generate(429)).await;

    let resp = server.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 429);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 429);
    assert_eq!(body["type"], "rate_limit_error");
    assert_eq!(body["message"], "Rate limit exceeded");
}

#[tokio::test]
async fn test_backend_status_passed_through() {
    let server = spawn_server(FakeBackend::new().failing_generate(503)).await;

    let resp = server.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 503);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "server_error");
    assert!(body["message"].as_str().unwrap().contains("exhausted"));
}

#[tokio::test]
async fn test_empty_messages_rejected_before_backend() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server
        .post(
            "/v1/chat/completions",
            serde_json::json!({"model": "m", "messages": []}),
        )
        .await;

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "invalid_request_error");
    assert_eq!(server.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_role_rejected() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server
        .post(
            "/v1/chat/completions",
            serde_json::json!({"model": "m", "messages": [{"role": "narrator", "content": "x"}]}),
        )
        .await;

    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_malformed_auth_header_rejected() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server
        .client
        .post(format!("{}/v1/chat/completions", server.base))
        .header("Authorization", "Token abc")
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_missing_auth_header_rejected() {
    let server = spawn_server(FakeBackend::new()).await;

    for path in ["/v1/chat/completions", "/v1/embeddings"] {
        let resp = server
            .client
            .post(format!("{}{}", server.base, path))
            .json(&serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "hi"}], "input": "a"}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 400, "{path}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["type"], "invalid_request_error");
    }
    assert_eq!(server.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stream_error_before_first_chunk_is_json() {
    let server = spawn_server(
        FakeBackend::new().with_stream(StreamScript::FailAfter(vec![], 429)),
    )
    .await;

    let resp = server.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(resp.status(), 429);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("application/json"));

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "rate_limit_error");
}

#[tokio::test]
async fn test_stream_error_mid_stream_has_no_done() {
    let server = spawn_server(
        FakeBackend::new().with_stream(StreamScript::FailAfter(vec!["partial", "more"], 500)),
    )
    .await;

    let resp = server.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(resp.status(), 200);

    let mut body = Vec::new();
    let mut aborted = false;
    let mut bytes = resp.bytes_stream();
    while let Some(chunk) = bytes.next().await {
        match chunk {
            Ok(b) => body.extend_from_slice(&b),
            Err(_) => {
                aborted = true;
                break;
            }
        }
    }

    let body = String::from_utf8_lossy(&body);
    assert!(aborted, "body should end with a transport error");
    assert!(!body.contains("[DONE]"));
}

// ────────────────────────────────────────────────────────────────
// Models and misc endpoints
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_model_listing_is_idempotent() {
    let server = spawn_server(FakeBackend::new()).await;

    let first: serde_json::Value = server.get("/v1/models").await.json().await.unwrap();
    let second: serde_json::Value = server.get("/v1/models").await.json().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first["object"], "list");
    assert_eq!(first["data"][0]["id"], "gemini-1.5-pro");
    assert_eq!(first["data"][0]["object"], "model");
    assert_eq!(first["data"][0]["owned_by"], "google");
    assert!(first["data"][0]["created"].is_i64());
}

#[tokio::test]
async fn test_single_model_echoes_id() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server.get("/v1/models/gpt-4o").await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "gpt-4o");
    assert_eq!(body["object"], "model");
}

#[tokio::test]
async fn test_root_signals_wrong_base_url() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server.get("/").await;
    assert_eq!(resp.status(), 421);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["message"].is_string());

    let health = server.get("/health").await;
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_unknown_endpoint_uses_error_envelope() {
    let server = spawn_server(FakeBackend::new()).await;

    let resp = server.get("/v1/completions").await;
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 404);
    assert_eq!(body["type"], "invalid_request_error");
}

// ────────────────────────────────────────────────────────────────
// Live backend (needs GEMINI_API_KEY)
// ────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires GEMINI_API_KEY"]
async fn test_live_chat_completion() {
    use gemini_openai_proxy::GeminiClient;

    let config = ProxyConfig::default();
    let api_key = config.resolve_api_key(None).unwrap();
    let backend = GeminiClient::new(&config.backend, api_key).unwrap();

    let log_dir = tempfile::tempdir().unwrap();
    let logger = SharedLogger::new(log_dir.path().join("live.log")).unwrap();

    let req = gemini_openai_proxy::translate::openai_types::ChatCompletionRequest::new(
        "gpt-4o-mini",
        vec![gemini_openai_proxy::translate::openai_types::ChatMessage::text(
            gemini_openai_proxy::translate::openai_types::Role::User,
            "Say 'pong' and nothing else.",
        )],
    );

    let resp = gemini_openai_proxy::proxy::proxy_chat(&req, &config, &backend, &logger)
        .await
        .unwrap();

    println!("Live response: {:?}", resp.choices[0].message.content);
    assert_eq!(resp.choices.len(), 1);
    assert!(resp.usage.total_tokens > 0);
}
