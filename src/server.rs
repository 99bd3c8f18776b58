use crate::backend::Backend;
use crate::config::ProxyConfig;
use crate::error::{translate_error, ProxyError, Result};
use crate::logging::SharedLogger;
use crate::proxy;
use crate::translate::openai_types::{
    ApiError, ApiErrorType, ChatCompletionRequest, EmbeddingRequest,
};

use axum::extract::{Path, State};
use axum::http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const WELCOME_MESSAGE: &str =
    "This is an OpenAI-compatible proxy for Gemini. Point your client's base URL at /v1.";

pub struct AppState {
    pub config: ProxyConfig,
    pub backend: Arc<dyn Backend>,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .route("/v1/models/:model", get(handle_model))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/embeddings", post(handle_embeddings))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ChatCompletionRequest = match authorize(&headers).and_then(|()| parse_body(&body)) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &e),
    };

    state.logger.info(
        "server",
        format!(
            "Request: model={} streaming={} messages={}",
            req.model,
            req.stream,
            req.messages.len()
        ),
    );

    if req.stream {
        handle_streaming(state, req).await
    } else {
        match proxy::proxy_chat(&req, &state.config, state.backend.as_ref(), &state.logger).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => error_response(&state, &e),
        }
    }
}

/// The first chunk is awaited before committing to SSE so that an early
/// failure can still be reported as a plain JSON error.
async fn handle_streaming(state: Arc<AppState>, req: ChatCompletionRequest) -> Response {
    let cancel = CancellationToken::new();
    let mut chunks = match proxy::proxy_chat_stream(
        &req,
        &state.config,
        state.backend.as_ref(),
        &state.logger,
        cancel,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => return error_response(&state, &e),
    };

    let first = match chunks.next_chunk().await {
        Some(Err(e)) => return error_response(&state, &e),
        other => other,
    };

    let logger = state.logger.clone();
    let events = async_stream::stream! {
        if let Some(Ok(data)) = first {
            yield Ok::<Event, ProxyError>(Event::default().data(data));
        }

        while let Some(item) = chunks.next_chunk().await {
            match item {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(e) => {
                    // Headers are already sent: abort the body without [DONE]
                    let (status, _) = translate_error(&e);
                    tracing::error!(status = status.as_u16(), error = %e, "stream aborted");
                    logger.error("server", format!("Stream aborted ({}): {}", status.as_u16(), e));
                    yield Err(e);
                    return;
                }
            }
        }

        yield Ok(Event::default().data("[DONE]"));
    };

    // No keep-alive comments: the body carries `data:` lines only
    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

async fn handle_embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: EmbeddingRequest = match authorize(&headers).and_then(|()| parse_body(&body)) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &e),
    };

    match proxy::proxy_embeddings(&req, &state.config, state.backend.as_ref(), &state.logger).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(&state, &e),
    }
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Response {
    match proxy::list_models(&state.config, state.backend.as_ref(), &state.logger).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error_response(&state, &e),
    }
}

async fn handle_model(State(state): State<Arc<AppState>>, Path(model): Path<String>) -> Response {
    Json(proxy::describe_model(&model, &state.config)).into_response()
}

/// Answers with 421 so a client misconfigured to the bare host notices.
async fn handle_root() -> Response {
    (
        StatusCode::MISDIRECTED_REQUEST,
        Json(serde_json::json!({ "message": WELCOME_MESSAGE })),
    )
        .into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_not_found(State(state): State<Arc<AppState>>, method: Method, uri: Uri) -> Response {
    let err = ProxyError::Api(ApiError::new(
        StatusCode::NOT_FOUND.as_u16(),
        ApiErrorType::InvalidRequestError,
        format!("Unknown endpoint: {} {}", method, uri.path()),
    ));
    error_response(&state, &err)
}

/// Log the untranslated error, then respond with its envelope.
fn error_response(state: &AppState, err: &ProxyError) -> Response {
    let (status, api_error) = translate_error(err);

    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), error = %err, "request failed");
        state.logger.error("server", format!("{} -> {}", err, status.as_u16()));
    } else {
        tracing::warn!(status = status.as_u16(), error = %err, "request rejected");
        state.logger.warn("server", format!("{} -> {}", err, status.as_u16()));
    }

    (status, Json(api_error)).into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::invalid_request(format!("Invalid request body: {e}")))
}

/// The bearer token must be present and well-formed but its value is not
/// checked: the backend is authenticated with the proxy's own key.
fn authorize(headers: &HeaderMap) -> Result<()> {
    bearer_token(headers).map(|token| {
        tracing::trace!(token_len = token.len(), "authorization header");
    })
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| {
            ProxyError::invalid_request("Missing Authorization header, expected 'Bearer <token>'")
        })?;

    let value = value
        .to_str()
        .map_err(|_| ProxyError::invalid_request("Authorization header is not valid text"))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(ProxyError::invalid_request(
            "Malformed Authorization header, expected 'Bearer <token>'",
        )),
    }
}
