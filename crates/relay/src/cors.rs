// CORS for the relay's plain HTTP routes.
//
// Origins come from `COLLAB_RELAY_CORS_ORIGINS` (comma-separated, or `*`).
// Without it, local browser dev servers are allowed.

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;

const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build a [`CorsLayer`] for the configured origin list.
///
/// `Some("*")` allows any origin without credentials. Any other value is
/// parsed as an exact origin list.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(REQUEST_ID_HEADER)])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::Response, routing::get, Router};
    use tower::ServiceExt;

    fn test_app(origins: Option<&str>) -> Router {
        Router::new().route("/healthz", get(|| async { "ok" })).layer(cors_layer(origins))
    }

    async fn preflight(app: Router, origin: &str) -> Response {
        app.oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/healthz")
                .header("origin", origin)
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .expect("preflight request should build"),
        )
        .await
        .expect("preflight should return a response")
    }

    #[tokio::test]
    async fn preflight_allows_default_dev_origin() {
        let response = preflight(test_app(None), "http://localhost:5173").await;

        assert_eq!(
            response.headers().get("access-control-allow-origin").map(HeaderValue::as_bytes),
            Some(&b"http://localhost:5173"[..])
        );
        assert_eq!(
            response.headers().get("access-control-allow-credentials").map(HeaderValue::as_bytes),
            Some(&b"true"[..])
        );
        assert_eq!(
            response.headers().get("access-control-max-age").map(HeaderValue::as_bytes),
            Some(&b"3600"[..])
        );
    }

    #[tokio::test]
    async fn preflight_ignores_unknown_origin() {
        let response = preflight(test_app(None), "https://evil.example.com").await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_origins_replace_defaults() {
        let origins = Some("https://collab.example.dev, https://staging.example.dev");

        let allowed = preflight(test_app(origins), "https://staging.example.dev").await;
        assert_eq!(
            allowed.headers().get("access-control-allow-origin").map(HeaderValue::as_bytes),
            Some(&b"https://staging.example.dev"[..])
        );

        let dropped = preflight(test_app(origins), "http://localhost:3000").await;
        assert!(dropped.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_origin_disables_credentials() {
        let response = preflight(test_app(Some("*")), "https://anything.example.com").await;

        assert_eq!(
            response.headers().get("access-control-allow-origin").map(HeaderValue::as_bytes),
            Some(&b"*"[..])
        );
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn parse_origins_skips_blank_entries() {
        let origins = parse_origins("  https://a.example , https://b.example  , ");
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
    }
}
