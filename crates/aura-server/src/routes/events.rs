use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    pub last_event_id: Option<String>,
    pub once: Option<String>,
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw, "1" | "true" | "yes")
}

fn resume_seq(headers: &HeaderMap, query: &EventStreamQuery) -> i64 {
    headers
        .get("Last-Event-ID")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .or_else(|| query.last_event_id.clone())
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

/// Resumable event stream: frames carry the store-assigned `seq` as the
/// SSE id, so a reconnecting client resumes exactly at `seq + 1`.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<EventStreamQuery>,
) -> Result<Response, ApiError> {
    if state.store.get_run(&run_id).await?.is_none() {
        return Err(ApiError::not_found("Запуск не найден"));
    }

    let once = query.once.as_deref().map(is_truthy).unwrap_or(false);
    let mut last_seq = resume_seq(&headers, &query);

    let event_stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>,
    > = Box::pin(stream! {
        loop {
            let events = match state.store.list_events_since(&run_id, last_seq).await {
                Ok(events) => events,
                Err(error) => {
                    tracing::warn!(%error, %run_id, "event tail scan failed");
                    break;
                }
            };
            for event in events {
                last_seq = event.seq;
                let data = serde_json::to_string(&event).unwrap_or_default();
                yield Ok(SseEvent::default()
                    .id(event.seq.to_string())
                    .event(event.event_type.clone())
                    .data(data));
            }
            if once {
                break;
            }
            tokio::time::sleep(TAIL_POLL_INTERVAL).await;
        }
    });

    let mut response = Sse::new(event_stream).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache"),
    );
    response_headers.insert(
        axum::http::header::CONNECTION,
        axum::http::HeaderValue::from_static("keep-alive"),
    );
    Ok(response)
}

/// Full event log as NDJSON, capped at 5000 events.
pub async fn download_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    if state.store.get_run(&run_id).await?.is_none() {
        return Err(ApiError::not_found("Запуск не найден"));
    }
    let events = state.store.list_events(&run_id, 5000).await?;
    let lines: Vec<String> = events
        .iter()
        .filter_map(|event| serde_json::to_string(event).ok())
        .collect();
    let response = (
        [(
            axum::http::header::CONTENT_TYPE,
            "application/x-ndjson".to_string(),
        )],
        lines.join("\n"),
    )
        .into_response();
    Ok(response)
}
