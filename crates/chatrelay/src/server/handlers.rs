//! Query route handler
//!
//! Pipeline per request: auth gate, content type, body validation,
//! denylist, prompt shaping, then the upstream call in the route's mode.

use axum::{
    Json,
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::Instrument;

use super::error::{ApiError, ErrorKind};
use super::{AppState, Route};
use crate::prompt::Overrides;
use crate::relay::relay_stream;
use crate::upstream::{ChatRequest, RetrievalTool};

const EVENT_STREAM: &str = "text/event-stream; charset=utf-8";
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Logged queries are cut to this many characters
const QUERY_PREVIEW_CHARS: usize = 50;

/// JSON body accepted by every query route
#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: Option<Value>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default, alias = "config")]
    pub profile: Option<String>,
}

impl QueryRequest {
    /// The query text, if present, a string and non-empty
    pub fn query_text(&self) -> Option<&str> {
        self.query
            .as_ref()
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
    }
}

pub(super) async fn query_handler(
    state: Arc<AppState>,
    index: usize,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let path = state
        .routes
        .get(index)
        .map(|r| r.config.path.as_str())
        .unwrap_or_default();
    let span = tracing::info_span!("query", %request_id, route = %path);

    async move {
        match handle_query(&state, index, &headers, &body).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }
    .instrument(span)
    .await
}

async fn handle_query(
    state: &AppState,
    index: usize,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    let route = state
        .routes
        .get(index)
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "Unknown route"))?;

    authorize(state, headers)?;
    require_json(headers)?;

    let request: QueryRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::validation(format!("Invalid JSON body: {e}")))?;
    let query = request
        .query_text()
        .ok_or_else(|| ApiError::validation("Missing or invalid 'query' parameter"))?;
    let stream = request.stream.unwrap_or(route.config.stream);

    tracing::info!(query = %preview(query), stream, "Query received");

    let blocked = request
        .query
        .as_ref()
        .is_some_and(|value| state.denylist.is_blocked_value(value));
    if blocked {
        tracing::info!(query = %preview(query), "Banned word detected, answering with rejection");
        let answer = route
            .config
            .blocked_response
            .as_deref()
            .unwrap_or(&state.filter_rejection);
        return Ok(plain_answer(answer.to_string(), stream));
    }

    let overrides = Overrides {
        model: request.model.as_deref(),
        prompt: request.prompt.as_deref(),
        profile: request.profile.as_deref(),
    };
    let resolved = state.shaper.resolve(&route.config, query, overrides)?;

    let retrieval = resolved.knowledge_id.map(|knowledge_id| RetrievalTool {
        knowledge_id,
        prompt_template: route.config.prompt_template.clone(),
    });
    let chat = ChatRequest::new(&resolved.system_prompt, &resolved.query)
        .with_model(resolved.model)
        .with_bot_id(route.config.bot_id.clone())
        .with_retrieval(retrieval);

    if stream {
        stream_answer(state, route, &chat).await
    } else {
        let answer = route.provider.complete(&chat).await?;
        tracing::info!(
            provider = route.provider.name(),
            answer_chars = answer.chars().count(),
            "Query answered"
        );
        Ok(Json(answer).into_response())
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.auth.enabled {
        return Ok(());
    }

    let header = headers
        .get(state.auth.header.as_str())
        .and_then(|v| v.to_str().ok());

    state.allow_list.authorize(header).map(|_| ()).map_err(|e| {
        tracing::warn!(reason = %e, "Rejected request");
        ApiError::auth(state.auth.rejection_message.clone())
    })
}

fn require_json(headers: &HeaderMap) -> Result<(), ApiError> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));

    if is_json {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorKind::UnsupportedMediaType,
            "Request must be JSON",
        ))
    }
}

async fn stream_answer(
    state: &AppState,
    route: &Route,
    chat: &ChatRequest,
) -> Result<Response, ApiError> {
    let events = route.provider.stream(chat).await?;
    tracing::debug!(provider = route.provider.name(), "Relaying upstream stream");

    let body = relay_stream(events, state.relay.clone())
        .map(|token| Ok::<_, Infallible>(Bytes::from(token)));

    Ok(event_stream_response(Body::from_stream(body)))
}

/// A fixed answer rendered in the shape of the request's mode
fn plain_answer(answer: String, stream: bool) -> Response {
    if stream {
        event_stream_response(Body::from(answer))
    } else {
        Json(answer).into_response()
    }
}

fn event_stream_response(body: Body) -> Response {
    (
        [
            (CONTENT_TYPE, EVENT_STREAM),
            (CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response()
}

fn preview(query: &str) -> String {
    let mut preview: String = query.chars().take(QUERY_PREVIEW_CHARS).collect();
    if query.chars().count() > QUERY_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
