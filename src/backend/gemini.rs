//! Gemini REST client.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Backend, BackendStream};
use crate::config::BackendConfig;
use crate::error::{ProxyError, Result};
use crate::translate::gemini_types::{
    BatchEmbedContentsRequest, BatchEmbedContentsResponse, GeminiErrorResponse,
    GenerateContentRequest, GenerateContentResponse, ListModelsResponse, ModelInfo,
};

const API_KEY_HEADER: &str = "x-goog-api-key";
const MAX_MODEL_PAGES: usize = 20;

pub struct GeminiClient {
    client: reqwest::Client,
    /// Bounds idle time between bytes instead of the whole response, so long
    /// generations are not cut off mid-stream.
    stream_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(config: &BackendConfig, api_key: impl Into<String>) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(timeout)
            .build()?;

        Ok(Self {
            stream_client,
            ..Self::with_client(client, &config.base_url, api_key)
        })
    }

    /// Uses `client` for both one-shot and streamed calls.
    pub fn with_client(client: reqwest::Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            stream_client: client.clone(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.base_url,
            model.trim_start_matches("models/"),
            method
        )
    }

    async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        tracing::debug!(url = %url, "POST");

        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;

        decode(response).await
    }
}

#[async_trait]
impl Backend for GeminiClient {
    async fn generate(&self, model: &str, request: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        let url = self.model_url(model, "generateContent");
        self.post_json(&url, request).await
    }

    async fn stream_generate(&self, model: &str, request: &GenerateContentRequest) -> Result<BackendStream> {
        let url = format!("{}?alt=sse", self.model_url(model, "streamGenerateContent"));
        tracing::debug!(url = %url, "POST (streaming)");

        let response = self
            .stream_client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &body));
        }

        let events = response.bytes_stream().eventsource();

        let results = events.filter_map(|event| async move {
            match event {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        return None;
                    }
                    Some(parse_stream_data(data))
                }
                Err(e) => Some(Err(ProxyError::stream(e.to_string()))),
            }
        });

        Ok(Box::pin(results))
    }

    async fn embed(&self, model: &str, request: &BatchEmbedContentsRequest) -> Result<BatchEmbedContentsResponse> {
        let url = self.model_url(model, "batchEmbedContents");
        self.post_json(&url, request).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.base_url);
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_MODEL_PAGES {
            let mut request = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .query(&[("pageSize", "1000")]);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: ListModelsResponse = decode(request.send().await?).await?;
            models.extend(page.models);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(models)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        tracing::warn!(status = %status, "backend returned error");
        return Err(error_from_body(status.as_u16(), &body));
    }

    serde_json::from_str(&body).map_err(|e| {
        ProxyError::unexpected_response(format!("{e}. Body: {}", truncate(&body, 300)))
    })
}

/// Prefer the message from Google's error envelope over the raw body.
fn error_from_body(status: u16, body: &str) -> ProxyError {
    match serde_json::from_str::<GeminiErrorResponse>(body) {
        Ok(err) => ProxyError::backend(status, err.error.message),
        Err(_) => ProxyError::backend(status, truncate(body, 500).to_string()),
    }
}

/// Error envelopes are checked first: every response field is optional, so an
/// error object would otherwise decode as an empty result.
fn parse_stream_data(data: &str) -> Result<GenerateContentResponse> {
    if let Ok(err) = serde_json::from_str::<GeminiErrorResponse>(data) {
        let status = if err.error.code == 0 { 500 } else { err.error.code };
        return Err(ProxyError::backend(status, err.error.message));
    }
    serde_json::from_str::<GenerateContentResponse>(data).map_err(|e| {
        ProxyError::unexpected_response(format!(
            "unparseable stream event: {e}. Data: {}",
            truncate(data, 300)
        ))
    })
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
