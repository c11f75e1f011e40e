//! HTTP surface: relay path, system endpoints and the OpenAPI document.

pub mod handlers;

use axum::Router;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::error::{ErrorBody, ErrorResponse};

/// OpenAPI document for the relay's HTTP endpoints.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "tailrelay", description = "Control-protocol handshake relay"),
    paths(
        handlers::relay::forward_handler,
        handlers::relay::upgrade_handler,
        handlers::system::health_handler,
        handlers::system::metrics_handler,
    ),
    components(schemas(
        ErrorResponse,
        ErrorBody,
        handlers::relay::DebugInfo,
        handlers::system::HealthResponse,
    )),
    tags(
        (name = "Relay", description = "Handshake forwarding and WebSocket relay"),
        (name = "System", description = "Health and metrics"),
    )
)]
pub struct ApiDoc;

/// Builds the router with the relay mounted at `relay_path`.
pub fn build_router(relay_path: &str) -> Router<AppState> {
    let router = Router::new()
        .merge(handlers::relay::routes(relay_path))
        .merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );

    router
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_relay_and_system_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/ts2021"));
        assert!(doc.paths.paths.contains_key("/health"));
        assert!(doc.paths.paths.contains_key("/metrics"));
    }
}
