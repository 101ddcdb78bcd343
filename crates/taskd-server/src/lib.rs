//! HTTP front end: multipart task creation, JSON reads, result downloads and
//! server-sent event streams over a [`TaskController`].

pub mod config;

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::str::FromStr;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::sse::{self, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use libtaskd::{
    CreateTask, EventStream, PurgeScheduler, Scope, SseEncoder, TaskController, TaskError,
    TaskFiles, Upload,
};
use serde_json::{Value, json};
use taskd_protocol::{ErrorBody, ErrorCode, TaskInfo, TaskParameters};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub controller: TaskController,
    /// Ends open event streams so graceful shutdown can finish.
    pub shutdown: CancellationToken,
}

/// Error reply: `{"error": .., "code": ..}` with a matching HTTP status.
pub struct ApiError(TaskError);

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        Self(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidState | ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::ResourceExhausted => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = self.0.to_error_code();
        let status = status_for(code);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

/// Build the router for `controller`.
pub fn app(controller: TaskController, config: &ServerConfig) -> Result<Router> {
    let body_limit = usize::try_from(config.max_upload_size).unwrap_or(usize::MAX);
    let state = AppState {
        shutdown: controller.shutdown_token(),
        controller,
    };

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/v1/infer", post(create_infer))
        .route("/v1/train", post(create_train))
        .route("/v1/tasks", get(watch_all))
        .route("/v1/tasks/{id}", get(task_info).delete(cancel_task))
        .route("/v1/tasks/{id}/status", get(watch_task))
        .route(
            "/v1/tasks/{id}/result",
            get(download_result).delete(discard_result),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(build_cors(&config.allow_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(ui_dir) = &config.ui_dir {
        app = app.fallback_service(ServeDir::new(ui_dir));
    }
    Ok(app)
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers(Any))
}

/// Serve until `shutdown` resolves, then stop the engine.
pub async fn run(
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    tokio::fs::create_dir_all(&config.tasks_root)
        .await
        .with_context(|| format!("failed to create {}", config.tasks_root.display()))?;

    let controller =
        TaskController::new(config.engine_config()).context("invalid engine configuration")?;
    let purge = PurgeScheduler::new(controller.clone(), config.purge_interval).spawn();
    let app = app(controller.clone(), &config)?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        listen = %config.listen,
        tasks_root = %controller.files().root().display(),
        "taskd server started"
    );

    let engine = controller.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutting down...");
            engine.shutdown().await;
        })
        .await
        .context("http server failed")?;

    let _ = purge.await;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tasks": state.controller.registry().len(),
    }))
}

/// Decoded multipart body: text fields and uploaded files by field name.
#[derive(Default)]
struct Form {
    fields: HashMap<String, String>,
    files: HashMap<String, Vec<Upload>>,
}

fn multipart_error(err: MultipartError) -> TaskError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        TaskError::ResourceExhausted(format!("SizeExceeded: {}", err.body_text()))
    } else {
        TaskError::InvalidRequest(err.body_text())
    }
}

impl Form {
    /// Text fields are read whole. Files are streamed chunk by chunk into the
    /// upload spool, so no file is held in memory.
    async fn read(mut multipart: Multipart, files: &TaskFiles) -> Result<Self, TaskError> {
        let mut form = Form::default();
        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let mut writer = files.begin_upload(file_name).await?;
                    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                        writer.write(&chunk).await?;
                    }
                    form.files
                        .entry(name)
                        .or_default()
                        .push(writer.finish().await?);
                }
                None => {
                    let text = field.text().await.map_err(multipart_error)?;
                    form.fields.insert(name, text);
                }
            }
        }
        Ok(form)
    }

    fn text(&self, name: &str) -> Result<&str, TaskError> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .ok_or_else(|| TaskError::InvalidRequest(format!("missing field {name}")))
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<T, TaskError> {
        let value = self.text(name)?;
        value
            .parse()
            .map_err(|_| TaskError::InvalidRequest(format!("invalid {name}: {value:?}")))
    }

    fn take_files(&mut self, name: &str) -> Vec<Upload> {
        self.files.remove(name).unwrap_or_default()
    }
}

async fn create_infer(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<String, ApiError> {
    let mut form = Form::read(multipart, state.controller.files()).await?;
    let request = CreateTask {
        name: form.text("name")?.to_string(),
        parameters: TaskParameters::Infer {
            index_ratio: form.parse("indexRatio")?,
            pitch: form.parse("pitch")?,
        },
        input: form.take_files("input"),
        model: form.take_files("model"),
    };
    Ok(state.controller.create(request).await?)
}

async fn create_train(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<String, ApiError> {
    let mut form = Form::read(multipart, state.controller.files()).await?;
    let request = CreateTask {
        name: form.text("name")?.to_string(),
        parameters: TaskParameters::Train {
            batch_size: form.parse("batchSize")?,
            epochs: form.parse("epochs")?,
            sample_rate: form.parse("sampleRate")?,
        },
        input: form.take_files("dataset"),
        model: Vec::new(),
    };
    Ok(state.controller.create(request).await?)
}

async fn task_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskInfo>, ApiError> {
    Ok(Json(state.controller.get(&id)?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<&'static str, ApiError> {
    state.controller.cancel(&id)?;
    Ok("Success")
}

async fn discard_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<&'static str, ApiError> {
    state.controller.discard(&id).await?;
    Ok("Success")
}

async fn download_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.controller.result_path(&id).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TaskError::NotFound(id.clone())
        } else {
            e.into()
        }
    })?;

    let disposition = format!("attachment; filename=\"{id}.zip\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn watch_all(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<sse::Event, Infallible>>>, ApiError> {
    let events = state.controller.subscribe(Scope::All)?;
    Ok(event_stream(events, &state.shutdown))
}

async fn watch_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<sse::Event, Infallible>>>, ApiError> {
    let events = state.controller.subscribe(Scope::Task(id))?;
    Ok(event_stream(events, &state.shutdown))
}

/// Frame engine events as SSE. Dropping the response (client gone) drops the
/// subscription with it.
fn event_stream(
    events: EventStream,
    shutdown: &CancellationToken,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>> + use<>> {
    let mut encoder = SseEncoder::new();
    let frames = events
        .take_until(shutdown.clone().cancelled_owned())
        .map(move |event| {
            let frame = encoder.frame(&event);
            Ok(sse::Event::default()
                .id(frame.id.to_string())
                .event(frame.event)
                .data(frame.data))
        });
    Sse::new(frames).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, FileConfig};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    const BOUNDARY: &str = "taskd-test-boundary";

    fn multipart_body(fields: &[(&str, &str)], file: (&str, &str, &[u8])) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        let (name, file_name, data) = file;
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::InvalidState), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::ResourceExhausted), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_for(ErrorCode::InvalidRequest), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_while_streaming() {
        let tmp = tempfile::tempdir().unwrap();
        let args = Args {
            tasks_root: Some(tmp.path().join("tasks")),
            max_upload_size: Some(4096),
            ..Args::default()
        };
        let config = ServerConfig::resolve(args, FileConfig::default()).unwrap();
        let controller = TaskController::new(config.engine_config()).unwrap();
        let app = app(controller.clone(), &config).unwrap();

        let body = multipart_body(
            &[("name", "voice"), ("indexRatio", "0.5"), ("pitch", "0")],
            ("input", "song.wav", &vec![0u8; 64 * 1024]),
        );
        let request = Request::builder()
            .method("POST")
            .uri("/v1/infer")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.expect("router response");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "resource_exhausted");

        let spool = controller.files().spool_dir();
        let spooled = std::fs::read_dir(&spool).map(|d| d.count()).unwrap_or(0);
        assert_eq!(spooled, 0);
        assert!(controller.list().is_empty());
    }
}
