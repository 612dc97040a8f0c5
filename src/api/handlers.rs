use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::auth::Owner;
use crate::models::BatchItem;
use crate::store::{RedirectStore, Resolution, StoreError};

pub struct AppState {
    pub store: Arc<RedirectStore>,
    /// Work accepted by a handler but finished after the response.
    pub tasks: TaskTracker,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

#[derive(Deserialize)]
pub struct ShortenRequest {
    pub url: String,
}

#[derive(Serialize, Deserialize)]
pub struct ShortenResponse {
    pub result: String,
}

#[derive(Deserialize)]
pub struct BatchRequestItem {
    pub correlation_id: String,
    pub original_url: String,
}

#[derive(Serialize, Deserialize)]
pub struct BatchResponseItem {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct UserUrl {
    pub short_url: String,
    pub original_url: String,
}

/// Store failures rendered as HTTP responses.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            StoreError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::CodeSpaceExhausted { .. } | StoreError::Storage { .. } => {
                error!(error = %self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn created_status(created: bool) -> StatusCode {
    if created {
        StatusCode::CREATED
    } else {
        StatusCode::CONFLICT
    }
}

/// Shorten a URL sent as the plain-text body; answers with the short URL as text
pub async fn shorten_text(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .store
        .create_redirect(&body, Some(&owner.id))
        .await?;

    Ok((
        created_status(outcome.created),
        [(header::CONTENT_TYPE, "text/plain")],
        state.store.short_url(&outcome.code),
    ))
}

pub async fn shorten_json(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    Json(payload): Json<ShortenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .store
        .create_redirect(&payload.url, Some(&owner.id))
        .await?;

    Ok((
        created_status(outcome.created),
        Json(ShortenResponse {
            result: state.store.short_url(&outcome.code),
        }),
    ))
}

pub async fn shorten_batch(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    Json(payload): Json<Vec<BatchRequestItem>>,
) -> Result<Response, ApiError> {
    if payload.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "batch must not be empty".to_string(),
            }),
        )
            .into_response());
    }

    let items = payload
        .into_iter()
        .map(|item| BatchItem {
            correlation_id: item.correlation_id,
            original_url: item.original_url,
        })
        .collect();

    let outcomes = state.store.create_batch(items, Some(&owner.id)).await?;
    let body: Vec<BatchResponseItem> = outcomes
        .into_iter()
        .map(|outcome| match outcome.result {
            Ok(code) => BatchResponseItem {
                correlation_id: outcome.correlation_id,
                short_url: Some(state.store.short_url(&code)),
                error: None,
            },
            Err(err) => BatchResponseItem {
                correlation_id: outcome.correlation_id,
                short_url: None,
                error: Some(err.to_string()),
            },
        })
        .collect();

    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// Redirect to the original URL
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Response, ApiError> {
    let response = match state.store.resolve_redirect(&code).await? {
        Resolution::Active { original_url } => Redirect::temporary(&original_url).into_response(),
        Resolution::Tombstoned { .. } => {
            (StatusCode::GONE, "This link has been deleted").into_response()
        }
        Resolution::NotFound => (StatusCode::BAD_REQUEST, "Unknown short code").into_response(),
    };

    Ok(response)
}

pub async fn list_user_urls(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
) -> Result<Response, ApiError> {
    if owner.issued {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }

    let records = state.store.list_by_owner(&owner.id).await?;
    if records.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<UserUrl> = records
        .into_iter()
        .map(|record| UserUrl {
            short_url: state.store.short_url(&record.code),
            original_url: record.original_url,
        })
        .collect();

    Ok(Json(body).into_response())
}

/// Accept a list of codes and tombstone them in the background
pub async fn delete_user_urls(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    Json(codes): Json<Vec<String>>,
) -> StatusCode {
    if owner.issued {
        return StatusCode::UNAUTHORIZED;
    }

    let store = Arc::clone(&state.store);
    state.tasks.spawn(async move {
        if let Err(err) = store.delete_batch(&codes, &owner.id).await {
            warn!(owner = %owner.id, error = %err, "background delete failed");
        }
    });

    StatusCode::ACCEPTED
}

/// Backend liveness
pub async fn ping(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.store.health_check().await {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

pub async fn health_check() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        message: "OK".to_string(),
    })
}
