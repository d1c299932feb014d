use axum::body::{Body, Bytes};
use axum::extract::{Multipart, Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatch::{
    AppInfo, ComposeOp, ContainerAction, Dispatcher, LogsMessage, NewKeyRequest, Order, SortField,
    UserSettings,
};
use crate::docker::containers::ContainerView;
use crate::docker::images::{self, ImageView};
use crate::docker::networks::NetworkView;
use crate::docker::pool::ClientEntry;
use crate::docker::stats::ContainerStats;
use crate::docker::volumes::{self, VolumeView};
use crate::domain::Store;
use crate::domain::machines::models::{KeyPair, Machine, SaveMachineRequest};
use crate::error::{Error, ErrorKind};
use crate::files::decode_filename;
use crate::git::{CommitInfo, History};
use crate::shared::HostName;

/// Multipart field carrying the file of `files/save`.
pub const CONTENTS_FIELD: &str = "contents";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

pub struct AppState<S: Store, H: History> {
    pub dispatcher: Arc<Dispatcher<S, H>>,
    pub credentials: Option<Credentials>,
    pub origins: Arc<Vec<String>>,
}

impl<S: Store, H: History> Clone for AppState<S, H> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            credentials: self.credentials.clone(),
            origins: self.origins.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Failure of an operation, answered with the status its kind maps to.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        Self(value)
    }
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(self.0.kind());
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        } else {
            debug!("request rejected: {}", self.0);
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

/// Newline delimited json, one [`LogsMessage`] per line.
fn ndjson(lines: mpsc::Receiver<LogsMessage>) -> Response {
    let body = ReceiverStream::new(lines).map(|message| {
        let mut line = serde_json::to_vec(&message).unwrap_or_default();
        line.push(b'\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

fn basic_credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some(Credentials {
        user: user.to_string(),
        pass: pass.to_string(),
    })
}

async fn auth_middleware<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.credentials else {
        return Ok(next.run(request).await);
    };
    if request.uri().path() == "/health" || request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }
    match basic_credentials(request.headers()) {
        Some(given)
            if !given.user.is_empty() && !given.pass.is_empty() && given == *expected =>
        {
            Ok(next.run(request).await)
        }
        _ => {
            warn!("rejected unauthenticated request to {}", request.uri().path());
            Err(Error::Unauthorized.into())
        }
    }
}

/// Answers browsers from the configured origins.
async fn cors_middleware<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .filter(|o| {
            o.to_str()
                .is_ok_and(|o| state.origins.iter().any(|allowed| allowed == o))
        })
        .cloned();
    let Some(origin) = origin else {
        return next.run(request).await;
    };
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, content-type"),
    );
    response
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize, Debug)]
pub struct ComposeRequest {
    pub file: String,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct ComposeListRequest {
    pub file: String,
    #[serde(default)]
    pub all: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SortRequest {
    pub file: Option<String>,
    pub sort_by: SortField,
    pub order: Order,
}

async fn compose_stream<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Path(op): Path<ComposeOp>,
    Json(req): Json<ComposeRequest>,
) -> Result<Response, ApiError> {
    let stream = state.dispatcher.compose(op, &req.file, req.services).await?;
    Ok(ndjson(stream.lines))
}

async fn compose_validate<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<ComposeRequest>,
) -> ApiResult<Vec<String>> {
    ok(state.dispatcher.compose_validate(&req.file).await?)
}

async fn compose_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<ComposeListRequest>,
) -> ApiResult<Vec<ContainerView>> {
    ok(state.dispatcher.compose_list(&req.file, req.all).await?)
}

async fn compose_stats<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<SortRequest>,
) -> ApiResult<Vec<ContainerStats>> {
    let file = req
        .file
        .ok_or_else(|| Error::invalid("compose stats needs a file"))?;
    ok(state
        .dispatcher
        .compose_stats(&file, req.sort_by, req.order)
        .await?)
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ListRequest {
    pub all: bool,
}

#[derive(Deserialize, Debug)]
pub struct IdsRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Deserialize, Debug)]
pub struct LogsRequest {
    pub id: String,
    #[serde(default)]
    pub tail: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct ExecRequest {
    pub id: String,
    #[serde(default)]
    pub cmd: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct ExecInputRequest {
    pub id: String,
    pub line: String,
}

async fn container_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<ListRequest>,
) -> ApiResult<Vec<ContainerView>> {
    ok(state.dispatcher.container_list(req.all).await?)
}

async fn container_action<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Path(action): Path<ContainerAction>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.container_action(action, &req.ids).await?)
}

async fn container_update<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<IdsRequest>,
) -> Result<Response, ApiError> {
    let stream = state.dispatcher.container_update(req.ids).await?;
    Ok(ndjson(stream.lines))
}

async fn container_stats<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<SortRequest>,
) -> ApiResult<Vec<ContainerStats>> {
    ok(state
        .dispatcher
        .container_stats(req.sort_by, req.order)
        .await?)
}

async fn container_logs<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<LogsRequest>,
) -> Result<Response, ApiError> {
    Ok(ndjson(
        state.dispatcher.container_logs(&req.id, req.tail).await?,
    ))
}

async fn exec_output<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<ExecRequest>,
) -> Result<Response, ApiError> {
    Ok(ndjson(state.dispatcher.exec_output(&req.id, req.cmd).await?))
}

async fn exec_input<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<ExecInputRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.exec_input(&req.id, req.line).await?)
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ImagePruneRequest {
    pub mode: images::PruneMode,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct VolumePruneRequest {
    pub mode: volumes::PruneMode,
}

#[derive(Deserialize, Debug)]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
}

async fn image_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<Vec<ImageView>> {
    ok(state.dispatcher.image_list().await?)
}

async fn image_remove<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<Vec<String>> {
    ok(state.dispatcher.image_remove(&req.ids, req.force).await?)
}

async fn image_prune<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<ImagePruneRequest>,
) -> ApiResult<images::PruneReport> {
    ok(state.dispatcher.image_prune(req.mode).await?)
}

async fn volume_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<Vec<VolumeView>> {
    ok(state.dispatcher.volume_list().await?)
}

async fn volume_create<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<VolumeView> {
    ok(state
        .dispatcher
        .volume_create(&req.name, req.driver.as_deref())
        .await?)
}

async fn volume_delete<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.volume_delete(&req.ids, req.force).await?)
}

async fn volume_prune<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<VolumePruneRequest>,
) -> ApiResult<volumes::PruneReport> {
    ok(state.dispatcher.volume_prune(req.mode).await?)
}

async fn network_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<Vec<NetworkView>> {
    ok(state.dispatcher.network_list().await?)
}

async fn network_create<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<String> {
    ok(state
        .dispatcher
        .network_create(&req.name, req.driver.as_deref())
        .await?)
}

async fn network_delete<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.network_delete(&req.ids).await?)
}

async fn network_prune<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<Vec<String>> {
    ok(state.dispatcher.network_prune().await?)
}

#[derive(Deserialize, Debug)]
pub struct HostRequest {
    pub name: HostName,
}

#[derive(Deserialize, Debug)]
pub struct ToggleRequest {
    pub name: HostName,
    pub enable: bool,
}

async fn host_new<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<SaveMachineRequest>,
) -> ApiResult<Machine> {
    ok(state.dispatcher.host_new(req).await?)
}

async fn host_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<Vec<Machine>> {
    ok(state.dispatcher.host_list().await?)
}

async fn host_get<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<HostRequest>,
) -> ApiResult<Machine> {
    ok(state.dispatcher.host_get(&req.name).await?)
}

async fn host_edit<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<SaveMachineRequest>,
) -> ApiResult<Machine> {
    ok(state.dispatcher.host_edit(req).await?)
}

async fn host_toggle<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<ToggleRequest>,
) -> ApiResult<Machine> {
    ok(state.dispatcher.host_toggle(&req.name, req.enable).await?)
}

async fn host_delete<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<HostRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.host_delete(&req.name).await?)
}

async fn host_switch<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<HostRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.host_switch(&req.name).await?)
}

async fn list_clients<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<Vec<ClientEntry>> {
    ok(state.dispatcher.list_clients().await)
}

#[derive(Deserialize, Debug)]
pub struct KeyRequest {
    pub name: String,
}

async fn ssh_new<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<NewKeyRequest>,
) -> ApiResult<KeyPair> {
    ok(state.dispatcher.ssh_new(req).await?)
}

async fn ssh_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<Vec<KeyPair>> {
    ok(state.dispatcher.ssh_list().await?)
}

async fn ssh_get<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<KeyPair> {
    ok(state.dispatcher.ssh_get(&req.name).await?)
}

async fn ssh_delete<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.ssh_delete(&req.name).await?)
}

#[derive(Deserialize, Debug)]
pub struct FileRequest {
    pub filename: String,
}

#[derive(Deserialize, Debug)]
pub struct RenameRequest {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Debug)]
pub struct CommitRequest {
    pub filename: String,
    pub commit: String,
}

async fn files_list<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<std::collections::BTreeMap<String, Vec<String>>> {
    ok(state.dispatcher.file_list().await?)
}

async fn files_create<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<FileRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.file_create(&req.filename).await?)
}

async fn files_exists<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<FileRequest>,
) -> ApiResult<bool> {
    ok(state.dispatcher.file_exists(&req.filename).await?)
}

async fn files_delete<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<FileRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.file_delete(&req.filename).await?)
}

async fn files_rename<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<()> {
    ok(state.dispatcher.file_rename(&req.from, &req.to).await?)
}

/// Takes the `contents` field; its file name is base64 encoded.
async fn files_save<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    mut multipart: Multipart,
) -> ApiResult<()> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::invalid(format!("malformed upload: {e}")))?
    {
        if field.name() != Some(CONTENTS_FIELD) {
            continue;
        }
        let encoded = field
            .file_name()
            .ok_or_else(|| Error::invalid("upload has no file name"))?
            .to_string();
        let name = decode_filename(&encoded)?;
        let contents = field
            .bytes()
            .await
            .map_err(|e| Error::invalid(format!("malformed upload: {e}")))?;
        return ok(state.dispatcher.file_save(&name, &contents[..]).await?);
    }
    Err(Error::invalid(format!("upload has no {CONTENTS_FIELD} field")).into())
}

async fn files_load<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Path(encoded): Path<String>,
) -> Result<Response, ApiError> {
    let name = decode_filename(&encoded)?;
    let contents = state.dispatcher.file_load(&name).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        contents,
    )
        .into_response())
}

async fn files_history<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<FileRequest>,
) -> ApiResult<Vec<CommitInfo>> {
    ok(state.dispatcher.file_history(&req.filename).await?)
}

async fn files_load_at_commit<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(req): Json<CommitRequest>,
) -> Result<Response, ApiError> {
    let contents = state
        .dispatcher
        .file_at_commit(&req.filename, &req.commit)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        contents,
    )
        .into_response())
}

async fn app_info<S: Store, H: History>(State(state): State<AppState<S, H>>) -> ApiResult<AppInfo> {
    ok(state.dispatcher.app_info().await)
}

async fn changelog<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<String> {
    ok(state.dispatcher.changelog().await?)
}

async fn read_version<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<&'static str> {
    ok(state.dispatcher.version())
}

async fn user_config_get<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
) -> ApiResult<UserSettings> {
    ok(state.dispatcher.user_settings().await?)
}

async fn user_config_set<S: Store, H: History>(
    State(state): State<AppState<S, H>>,
    Json(settings): Json<UserSettings>,
) -> ApiResult<()> {
    ok(state.dispatcher.save_user_settings(&settings).await?)
}

pub async fn create_app<S: Store, H: History>(state: AppState<S, H>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/compose/validate", post(compose_validate))
        .route("/compose/list", post(compose_list))
        .route("/compose/stats", post(compose_stats))
        .route("/compose/{op}", post(compose_stream))
        .route("/container/list", post(container_list))
        .route("/container/update", post(container_update))
        .route("/container/stats", post(container_stats))
        .route("/container/logs", post(container_logs))
        .route("/container/exec-output", post(exec_output))
        .route("/container/exec-input", post(exec_input))
        .route("/container/{action}", post(container_action))
        .route("/image/list", get(image_list))
        .route("/image/remove", post(image_remove))
        .route("/image/prune", post(image_prune))
        .route("/volume/list", get(volume_list))
        .route("/volume/create", post(volume_create))
        .route("/volume/delete", post(volume_delete))
        .route("/volume/prune", post(volume_prune))
        .route("/network/list", get(network_list))
        .route("/network/create", post(network_create))
        .route("/network/delete", post(network_delete))
        .route("/network/prune", post(network_prune))
        .route("/host/new", post(host_new))
        .route("/host/list", get(host_list))
        .route("/host/get", post(host_get))
        .route("/host/edit", post(host_edit))
        .route("/host/toggle", post(host_toggle))
        .route("/host/delete", post(host_delete))
        .route("/host/switch", post(host_switch))
        .route("/host/list-clients", get(list_clients))
        .route("/ssh/new", post(ssh_new))
        .route("/ssh/list", get(ssh_list))
        .route("/ssh/get", post(ssh_get))
        .route("/ssh/delete", post(ssh_delete))
        .route("/files/list", get(files_list))
        .route("/files/create", post(files_create))
        .route("/files/exists", post(files_exists))
        .route("/files/delete", post(files_delete))
        .route("/files/rename", post(files_rename))
        .route("/files/save", post(files_save))
        .route("/files/load/{filename}", get(files_load))
        .route("/files/history", post(files_history))
        .route("/files/load-at-commit", post(files_load_at_commit))
        .route("/info/get-app-info", get(app_info))
        .route("/info/get-changelog", get(changelog))
        .route("/info/read-version", get(read_version))
        .route("/user-config/get", get(user_config_get))
        .route("/user-config/set", post(user_config_set))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cors_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(status_of(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ErrorKind::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_of(ErrorKind::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ErrorKind::Unimplemented), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(status_of(ErrorKind::SyncFailed), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn basic_credentials_are_decoded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", STANDARD.encode("admin:s3:cret"))).unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(Credentials {
                user: "admin".to_string(),
                pass: "s3:cret".to_string(),
            })
        );
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        assert_eq!(basic_credentials(&headers), None);
    }
}
