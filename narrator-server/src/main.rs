use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use hf_hub::api::tokio::Api;
use narrator_core::{
    load_captioner, CaptionFailure, CaptionRequest, CaptionService, DeviceMap, ModelCell,
    RetryPolicy,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

// Uploads past this size are rejected before decoding.
const UPLOAD_LIMIT: usize = 10 * 1024 * 1024;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Image caption generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Captioning model to use
    #[arg(long, default_value = "Salesforce/blip-image-captioning-large")]
    model: String,

    /// Cap on generated caption length, in tokens
    #[arg(long, default_value_t = narrator_core::DEFAULT_MAX_TOKENS)]
    max_tokens: usize,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

// Application state: the one-time model cell plus fixed configuration.
struct AppState {
    model: ModelCell,
    policy: RetryPolicy,
    device_map: DeviceMap,
    model_name: String,
    request: CaptionRequest,
}

impl AppState {
    /// Returns a caption service over the shared handle, acquiring the
    /// model (with retry) exactly once across all callers.
    async fn service(&self) -> CaptionService {
        let handle = self
            .model
            .get_or_acquire(self.policy, || {
                let model = self.model_name.clone();
                let device_map = self.device_map;
                async move {
                    let api = Api::new()?;
                    load_captioner(&model, api, device_map).await
                }
            })
            .await;
        CaptionService::new(handle.clone())
    }
}

#[derive(Serialize)]
struct CaptionResponse {
    caption: String,
}

#[derive(Serialize)]
struct FailureResponse {
    error: String,
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let service = state.service().await;
    if service.handle().is_ready() {
        Json(serde_json::json!({ "status": "ok", "model": state.model_name })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "model unavailable", "model": state.model_name })),
        )
            .into_response()
    }
}

async fn generate_caption_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let bytes = match read_image_field(&mut multipart).await {
        Ok(bytes) => bytes,
        Err(message) => return failure_response(&CaptionFailure::InvalidImage(message)),
    };

    let service = state.service().await;
    match service.caption_upload(&bytes, &state.request) {
        Ok(caption) => Json(CaptionResponse { caption }).into_response(),
        Err(failure) => {
            warn!("caption request failed: {failure}");
            failure_response(&failure)
        }
    }
}

/// Pulls the `image` part out of the multipart upload.
async fn read_image_field(multipart: &mut Multipart) -> Result<Vec<u8>, String> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("malformed upload: {e}"))?
    {
        if field.name() == Some("image") {
            return field
                .bytes()
                .await
                .map(|bytes| bytes.to_vec())
                .map_err(|e| format!("failed to read upload: {e}"));
        }
    }
    Err("missing image field in upload".to_string())
}

fn failure_response(failure: &CaptionFailure) -> Response {
    let status = match failure {
        CaptionFailure::InvalidImage(_) => StatusCode::BAD_REQUEST,
        CaptionFailure::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        CaptionFailure::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(FailureResponse {
            error: failure.to_string(),
        }),
    )
        .into_response()
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/captions", post(generate_caption_handler))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let state = Arc::new(AppState {
        model: ModelCell::new(),
        policy: RetryPolicy::default(),
        device_map: DeviceMap::from_cpu_flag(args.cpu),
        model_name: args.model,
        request: CaptionRequest {
            max_tokens: Some(args.max_tokens),
        },
    });

    // Warm the model up front; a permanent failure leaves the server
    // running and every caption request reporting it unavailable.
    if !state.service().await.handle().is_ready() {
        error!("starting without a captioning model; restart to retry loading");
    }

    let app = router(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use narrator_core::ModelHandle;
    use tower::util::ServiceExt;

    fn unavailable_state() -> Arc<AppState> {
        Arc::new(AppState {
            model: ModelCell::preloaded(ModelHandle::Unavailable),
            policy: RetryPolicy::default(),
            device_map: DeviceMap::ForceCpu,
            model_name: "Salesforce/blip-image-captioning-large".to_string(),
            request: CaptionRequest::default(),
        })
    }

    fn multipart_body(boundary: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"image\"; filename=\"upload.png\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 120, 40]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    async fn post_upload(state: Arc<AppState>, bytes: &[u8]) -> (StatusCode, serde_json::Value) {
        let boundary = "captiontestboundary";
        let response = router(state)
            .oneshot(
                Request::post("/captions")
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(multipart_body(boundary, bytes)))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn index_serves_the_upload_page() {
        let response = router(unavailable_state())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8(body.to_vec()).unwrap();
        assert!(page.contains("Generate Caption"));
    }

    #[tokio::test]
    async fn health_reports_unavailable_model() {
        let response = router(unavailable_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn valid_upload_without_model_is_503() {
        let (status, body) = post_upload(unavailable_state(), &png_bytes()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn garbage_upload_is_400() {
        let (status, body) = post_upload(unavailable_state(), b"not an image").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid image"));
    }
}
