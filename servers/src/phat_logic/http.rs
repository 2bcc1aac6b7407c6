//! # HTTP Surface
//!
//! - `PUT /`, `PUT /image`: upload an image (`Content-Type: image/*`). Add
//!   `?raw=true` to store it without palette conversion.
//! - `GET /image`: the current image, with `ETag` / `Last-Modified` and
//!   conditional-request support.
//! - `GET /`, `GET /clients`: every display's last status as JSON.
//! - `GET /metrics`: Prometheus exposition.
//! - `GET /health`: liveness probe.
//!
//! Every request passes through [`log_requests`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::{Bytes, HttpBody},
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use chrono::{DateTime, Utc};
use lib_common::core::{CachedImage, Coordinator, ValidationError};
use serde::{Deserialize, Serialize};

pub type AppState = Arc<Coordinator>;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Errors a handler can answer with.
#[derive(Debug)]
pub enum AppError {
    /// Upload without an `image/*` content type.
    NotAnImage,
    /// The upload failed validation or decoding.
    Rejected(ValidationError),
    /// Nothing uploaded yet.
    NoImage,
    /// A bug or a crashed worker thread.
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotAnImage => {
                tracing::error!(problem = "bad-content-type", "upload rejected");
                (StatusCode::NOT_ACCEPTABLE, "ERROR: Content-type not image/*").into_response()
            }
            AppError::Rejected(e) => (StatusCode::NOT_ACCEPTABLE, format!("ERROR: {e}")).into_response(),
            AppError::NoImage => (StatusCode::NOT_FOUND, "No image cached yet").into_response(),
            AppError::Internal(reason) => {
                tracing::error!(error = %reason, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "ERROR: internal server error").into_response()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    raw: Option<String>,
}

/// Body of a successful upload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub fingerprint: String,
    pub content_type: String,
    pub size: usize,
    pub stored_at: DateTime<Utc>,
}

impl From<&CachedImage> for UploadResponse {
    fn from(image: &CachedImage) -> Self {
        Self {
            fingerprint: image.fingerprint().to_string(),
            content_type: image.content_type().to_string(),
            size: image.len(),
            stored_at: image.stored_at(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_clients).put(upload_image))
        .route("/image", get(download_image).put(upload_image))
        .route("/clients", get(list_clients))
        .route("/metrics", get(metrics))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn upload_image(
    State(coordinator): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let is_image = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().to_ascii_lowercase().starts_with("image/"));
    if !is_image {
        return Err(AppError::NotAnImage);
    }

    let perform_conversion = params.raw.as_deref() != Some("true");
    tracing::info!(size = body.len(), convert = perform_conversion, "image upload");

    let stored = tokio::task::spawn_blocking(move || coordinator.handle_upload(&body, perform_conversion))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::Rejected)?;

    Ok((StatusCode::CREATED, Json(UploadResponse::from(stored.as_ref()))))
}

async fn download_image(State(coordinator): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    let image = coordinator.handle_download().map_err(|_| AppError::NoImage)?;

    let etag = format!("\"{}\"", image.fingerprint());
    let last_modified = image.stored_at().format(HTTP_DATE).to_string();
    let validators = [
        (header::ETAG, etag.clone()),
        (header::LAST_MODIFIED, last_modified),
        (header::CACHE_CONTROL, "no-cache".to_string()),
    ];

    if not_modified(&headers, &etag, image.stored_at()) {
        return Ok((StatusCode::NOT_MODIFIED, validators).into_response());
    }

    let content_type = HeaderValue::from_str(image.content_type())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let mut response = (StatusCode::OK, validators, Bytes::copy_from_slice(image.bytes())).into_response();
    response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    Ok(response)
}

/// `If-None-Match` takes precedence; `If-Modified-Since` is only consulted
/// when it is absent.
fn not_modified(headers: &HeaderMap, etag: &str, stored_at: DateTime<Utc>) -> bool {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        return value
            .split(',')
            .map(|candidate| candidate.trim().trim_start_matches("W/"))
            .any(|candidate| candidate == "*" || candidate == etag);
    }

    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .is_some_and(|since| stored_at.timestamp() <= since.timestamp())
}

async fn list_clients(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(coordinator.list_clients())
}

async fn metrics(State(coordinator): State<AppState>) -> Result<Response, AppError> {
    let text = coordinator
        .metrics()
        .render()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Logs one line per request with client address, status, size and duration.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    let response = next.run(request).await;

    let response_size = response.body().size_hint().exact().unwrap_or(0);
    tracing::info!(
        %method,
        path = %path,
        client_addr = %client_addr,
        code = response.status().as_u16(),
        response_size,
        duration_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request as HttpRequest};
    use image::{ImageFormat, Rgba, RgbaImage};
    use lib_common::core::{CoordinatorConfig, MemoryPublisher, TopicScheme};
    use std::io::Cursor;
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let (coordinator, _worker) = Coordinator::new(
            Arc::new(MemoryPublisher::new()),
            CoordinatorConfig {
                external_url: "http://127.0.0.1:39391".to_string(),
                topics: TopicScheme::default(),
            },
        )
        .unwrap();
        let state = Arc::new(coordinator);
        (router(state.clone()), state)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn put(uri: &str, content_type: &str, body: Vec<u8>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    fn get_req(uri: &str) -> axum::http::request::Builder {
        HttpRequest::builder().method(Method::GET).uri(uri)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn upload_then_download() {
        let (app, _state) = app();

        let response = app.clone().oneshot(put("/", "image/png", png(212, 104))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let uploaded: UploadResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(uploaded.content_type, "image/png");

        let response = app.oneshot(get_req("/image").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(
            response.headers()[header::ETAG].to_str().unwrap(),
            format!("\"{}\"", uploaded.fingerprint)
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), uploaded.size);
    }

    #[tokio::test]
    async fn wrong_size_is_not_acceptable() {
        let (app, _state) = app();
        let response = app.clone().oneshot(put("/image", "image/png", png(100, 100))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
        let text = body_text(response).await;
        assert!(text.starts_with("ERROR: "), "{text}");
        assert!(text.contains("100x100"), "{text}");

        let response = app.oneshot(get_req("/image").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "No image cached yet");
    }

    #[tokio::test]
    async fn non_image_content_type_is_not_acceptable() {
        let (app, state) = app();
        let response = app.oneshot(put("/", "text/plain", png(212, 104))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(body_text(response).await, "ERROR: Content-type not image/*");
        assert_eq!(state.metrics().images_posted.get(), 0);
    }

    #[tokio::test]
    async fn raw_upload_skips_conversion() {
        let (app, _state) = app();
        let original = png(212, 104);
        let response = app
            .clone()
            .oneshot(put("/image?raw=true", "image/png", original.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.oneshot(get_req("/image").body(Body::empty()).unwrap()).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), original.as_slice());
    }

    #[tokio::test]
    async fn conditional_get_returns_not_modified() {
        let (app, state) = app();
        app.clone().oneshot(put("/", "image/png", png(212, 104))).await.unwrap();
        let image = state.store().get().unwrap();
        let etag = format!("\"{}\"", image.fingerprint());

        let response = app
            .clone()
            .oneshot(get_req("/image").header(header::IF_NONE_MATCH, &etag).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let response = app
            .clone()
            .oneshot(
                get_req("/image")
                    .header(header::IF_NONE_MATCH, "\"something-else\"")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let later = (image.stored_at() + chrono::Duration::seconds(5)).format(HTTP_DATE).to_string();
        let response = app
            .clone()
            .oneshot(get_req("/image").header(header::IF_MODIFIED_SINCE, later).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let earlier = (image.stored_at() - chrono::Duration::hours(1)).format(HTTP_DATE).to_string();
        let response = app
            .oneshot(get_req("/image").header(header::IF_MODIFIED_SINCE, earlier).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn client_list_reflects_presence() {
        let (app, state) = app();

        let response = app.clone().oneshot(get_req("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "{}");

        state.handle_presence_message("phat/client/hall", b"ALIVE").unwrap();
        state.handle_presence_message("phat/client/hall", b"DEAD").unwrap();

        let response = app.oneshot(get_req("/clients").body(Body::empty()).unwrap()).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["hall"]["status"], "DEAD");
        assert!(json["hall"]["lastSeen"].is_string());
    }

    #[tokio::test]
    async fn metrics_and_health() {
        let (app, _state) = app();
        app.clone().oneshot(put("/", "image/png", png(212, 104))).await.unwrap();

        let response = app.clone().oneshot(get_req("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("phatmqtt_server_images_posted 1"), "{text}");

        let response = app.oneshot(get_req("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(body_text(response).await, "OK");
    }
}
