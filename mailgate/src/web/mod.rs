//! HTTP surface.
//!
//! Everything under `/api` is API-key authenticated; `/api/send` is also
//! rate limited. `/webhooks/postal` is the provider callback and is not
//! key-authenticated.

pub mod admission;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use admission::{require_api_key, require_send_quota, API_KEY_HEADER};
pub use handlers::{AppState, HealthResponse, WebhookResponse, POSTAL_SIGNATURE_HEADER};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let send = Router::new()
        .route("/send", post(handlers::send_email))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_send_quota,
        ));

    let manage = Router::new()
        .route("/messages", get(handlers::list_messages))
        .route("/messages/:id", get(handlers::get_message))
        .route(
            "/webhooks",
            get(handlers::list_webhooks).post(handlers::create_webhook),
        )
        .route("/webhooks/:id", delete(handlers::delete_webhook))
        .route(
            "/keys",
            get(handlers::list_api_keys).post(handlers::create_api_key),
        )
        .route(
            "/keys/:id",
            patch(handlers::update_api_key).delete(handlers::revoke_api_key),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let api = send.merge(manage);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/postal", post(handlers::postal_webhook))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
