use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tower_http::{
    compression::CompressionLayer, decompression::RequestDecompressionLayer, trace::TraceLayer,
};

use crate::auth::owner_middleware;
use crate::store::RedirectStore;

use super::handlers::{
    delete_user_urls, health_check, list_user_urls, ping, redirect, shorten_batch, shorten_json,
    shorten_text, AppState,
};

/// Build the service router. Background work is spawned on `tasks`; close and
/// wait on it before shutting the store down.
pub fn create_router(store: Arc<RedirectStore>, tasks: TaskTracker) -> Router {
    let state = Arc::new(AppState { store, tasks });

    Router::new()
        .route("/", post(shorten_text))
        .route("/api/shorten", post(shorten_json))
        .route("/api/shorten/batch", post(shorten_batch))
        .route("/api/user/urls", get(list_user_urls).delete(delete_user_urls))
        .route("/ping", get(ping))
        .route("/health", get(health_check))
        .route("/{code}", get(redirect))
        .layer(middleware::from_fn(owner_middleware))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
