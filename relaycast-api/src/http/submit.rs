//! Submission endpoint
//!
//! `POST /submit` accepts a form field `content` (the original client
//! contract) or a JSON body `{"content": "..."}`.

use axum::{
    extract::{FromRequest, Request, State},
    http::header::CONTENT_TYPE,
    Form, Json,
};
use serde::Deserialize;

use crate::http::{AppError, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct SubmitBody {
    #[serde(default)]
    pub content: String,
}

/// Persist a submission and queue its broadcast
pub async fn submit(State(state): State<AppState>, request: Request) -> AppResult<String> {
    let body = if is_json(&request) {
        Json::<SubmitBody>::from_request(request, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?
            .0
    } else {
        Form::<SubmitBody>::from_request(request, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?
            .0
    };

    let ack = state.ingestor.submit(&body.content).await?;

    tracing::debug!(record_id = ack.record_id, "Submission accepted");
    Ok(ack.message())
}

fn is_json(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}
