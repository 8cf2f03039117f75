use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    config::ServiceCfg,
    detector::{DuplicateDetector, UploadOutcome},
    error::DetectError,
    ingest::UploadedFile,
};

const NO_VALID_UPLOADS: &str = "No valid image files were uploaded";

#[derive(Clone)]
pub struct AppState {
    detector: DuplicateDetector,
}

pub fn router(detector: DuplicateDetector, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/upload/{user_key}", post(upload))
        .route("/duplicates/{user_key}", get(duplicates))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { detector })
}

pub async fn serve(cfg: &ServiceCfg, detector: DuplicateDetector) -> Result<()> {
    let app = router(detector, cfg.max_upload_bytes());
    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.bind))?;
    info!("imgdedup API listening on http://{}", cfg.bind);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[derive(Serialize)]
struct Pong { message: &'static str }

#[derive(Serialize)]
struct GroupsResp { duplicate_groups: Vec<Vec<String>> }

#[derive(Serialize)]
struct NoticeResp { error: &'static str }

async fn ping() -> Json<Pong> { Json(Pong { message: "pong" }) }

async fn upload(
    State(st): State<AppState>,
    Path(user_key): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, ApiErr> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(ApiErr::multipart)? {
        // plain form values carry no filename
        let Some(filename) = field.file_name().map(str::to_string) else { continue };
        let bytes = field.bytes().await.map_err(ApiErr::multipart)?;
        files.push(UploadedFile::new(filename, bytes.to_vec()));
    }
    info!(user_key = %user_key, files = files.len(), "upload received");

    match st.detector.upload(user_key.clone(), files).await? {
        UploadOutcome::NothingAccepted { skipped } => {
            info!(user_key = %user_key, skipped, "no valid image files in upload");
            Ok(Json(NoticeResp { error: NO_VALID_UPLOADS }).into_response())
        }
        UploadOutcome::Groups { report, groups } => {
            info!(user_key = %user_key, accepted = report.accepted, skipped = report.skipped, groups = groups.len(), "upload processed");
            Ok(Json(GroupsResp { duplicate_groups: groups }).into_response())
        }
    }
}

async fn duplicates(State(st): State<AppState>, Path(user_key): Path<String>) -> Result<Json<GroupsResp>, ApiErr> {
    let groups = st.detector.duplicates(user_key).await?;
    Ok(Json(GroupsResp { duplicate_groups: groups }))
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: &'static str,
    message: String,
    suggestion: Option<String>,
}

impl ApiErr {
    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: "Internal Server Error".to_string(),
            suggestion: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "bad_request", message: message.into(), suggestion: None }
    }

    fn multipart(e: MultipartError) -> Self {
        Self { status: e.status(), ..Self::bad_request(format!("Invalid multipart body: {}", e.body_text())) }
    }
}

impl From<DetectError> for ApiErr {
    fn from(e: DetectError) -> Self {
        if !e.is_domain() {
            error!(error = %e, "duplicate detection failed");
            return Self::internal();
        }
        let (code, suggestion) = match e {
            DetectError::UnconvertibleImages => ("unconvertible_images", Some("Upload JPEG or PNG versions of HEIC photos.".to_string())),
            _ => ("no_processable_images", None),
        };
        Self { status: StatusCode::BAD_REQUEST, code, message: e.to_string(), suggestion }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<String>,
        }
        (
            self.status,
            Json(ErrorResponse { error: self.message, code: self.code, suggestion: self.suggestion }),
        )
            .into_response()
    }
}
