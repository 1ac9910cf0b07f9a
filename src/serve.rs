//! Purpose: HTTP surface over the command engine.
//! Exports: `ServeConfig`, `AppState`, `router`, `serve`.
//! Role: Axum server that resolves the caller's session, rewrites expressions and awaits or defers commands.
//! Invariants: Error bodies are `{"message": ...}`; error kinds map to fixed status codes.
//! Invariants: Deferred submissions answer 201 with `Location: <base>/lastcommand` and an empty body.
//! Invariants: Non-loopback binds require a bearer token.
//! Notes: Handlers never block on a link; they await the command's completion channel instead.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, head, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::catalog;
use crate::core::command::CommandHandle;
use crate::core::error::{Error, ErrorKind, Failure};
use crate::core::validate::{validate_identifier, validate_object_path, validate_workspace_id};
use crate::core::value::Value;
use crate::engine::CommandEngine;
use crate::link::http::HttpLinkProvider;
use crate::ops;
use crate::packages;
use crate::rewrite::{ExpressionRewriter, MethodRewriter, MethodTable};
use crate::session::SessionKey;
use crate::workspace::{DirWorkspaceStore, workspace_path};

const USER_HEADER: &str = "x-user";
const PROFILE_HEADER: &str = "x-profile";
const DEFAULT_USER: &str = "anonymous";
const DEFAULT_PROFILE: &str = "default";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub workspace_dir: PathBuf,
    pub profiles: BTreeMap<String, String>,
    pub methods: Option<PathBuf>,
    pub token: Option<String>,
    pub admin_token: Option<String>,
    pub public_url: Option<String>,
    pub max_body_bytes: u64,
    pub idle_timeout_secs: u64,
}

pub struct AppState {
    engine: Arc<CommandEngine>,
    rewriter: Arc<dyn ExpressionRewriter>,
    token: Option<String>,
    admin_token: Option<String>,
    public_url: Option<String>,
}

impl AppState {
    pub fn new(engine: Arc<CommandEngine>, rewriter: Arc<dyn ExpressionRewriter>) -> Self {
        Self {
            engine,
            rewriter,
            token: None,
            admin_token: None,
            public_url: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token;
        self
    }

    pub fn with_public_url(mut self, url: Option<String>) -> Self {
        self.public_url = url.map(|url| url.trim_end_matches('/').to_string());
        self
    }

    pub fn engine(&self) -> &Arc<CommandEngine> {
        &self.engine
    }
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    let profiles = validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let methods = match &config.methods {
        Some(path) => MethodTable::load(path)?,
        None => MethodTable::builtin(),
    };
    let provider = Arc::new(HttpLinkProvider::new(profiles)?);
    let store = Arc::new(DirWorkspaceStore::new(&config.workspace_dir)?);
    let engine = Arc::new(CommandEngine::new(provider, store)?);
    let state = Arc::new(
        AppState::new(Arc::clone(&engine), Arc::new(MethodRewriter::new(methods)))
            .with_token(config.token.clone())
            .with_admin_token(config.admin_token.clone())
            .with_public_url(config.public_url.clone()),
    );

    let sweeper = tokio::spawn(sweep_idle_sessions(
        Arc::clone(&engine),
        Duration::from_secs(config.idle_timeout_secs),
    ));

    let app = router(state, max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        workspace_dir = %config.workspace_dir.display(),
        profiles = config.profiles.len(),
        "shieldexec serving"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    let outcome = tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                }),
                Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
            }
        }
    };
    sweeper.abort();
    outcome
}

/// Builds the routed application; exposed so tests can serve it on an ephemeral port.
pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/packages", get(list_packages))
        .route("/install-package", post(install_package))
        .route("/tables", get(list_tables))
        .route("/tables/:name", head(table_exists))
        .route("/symbols", get(list_symbols))
        .route("/symbols/:name", post(assign_symbol).delete(remove_symbol))
        .route("/lastresult", get(last_result))
        .route("/lastcommand", get(last_command))
        .route("/execute", post(execute))
        .route("/workspaces", get(list_workspaces))
        .route("/workspaces/:id", post(save_workspace).delete(remove_workspace))
        .route("/load-workspace", post(load_workspace))
        .route("/load-tables", post(load_tables))
        .route("/logout", post(logout))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn sweep_idle_sessions(engine: Arc<CommandEngine>, max_idle: Duration) {
    let period = (max_idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let evicted = engine.evict_idle(max_idle);
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "idle sweep evicted sessions");
        }
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

/// Checks the config and returns the parsed profile table.
fn validate_config(config: &ServeConfig) -> Result<BTreeMap<String, Url>, Error> {
    if config.profiles.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("at least one --profile is required")
            .with_hint("Use --profile default=http://127.0.0.1:6311."));
    }

    let mut profiles = BTreeMap::new();
    for (name, raw) in &config.profiles {
        validate_identifier("profile", name)?;
        let url = Url::parse(raw).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid URL for profile '{name}'"))
                .with_source(err)
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("profile '{name}' must use http or https"))
                .with_hint("Use a URL like http://127.0.0.1:6311."));
        }
        profiles.insert(name.clone(), url);
    }

    if let Some(public_url) = &config.public_url {
        Url::parse(public_url).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid --public-url")
                .with_source(err)
        })?;
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 104857600."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    if config.idle_timeout_secs == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--idle-timeout-secs must be greater than zero")
            .with_hint("Use a positive value like 1800."));
    }

    if !is_loopback(config.bind.ip()) && config.token.is_none() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires --token")
            .with_hint("Provide --token or bind to a loopback address."));
    }

    Ok(profiles)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

struct ApiError {
    status: StatusCode,
    error: Error,
}

impl ApiError {
    fn forbidden(error: Error) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            error,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            status: status_for(error.kind()),
            error,
        }
    }
}

impl From<Failure> for ApiError {
    fn from(failure: Failure) -> Self {
        ApiError::from(Error::from(failure))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status, &self.error)
    }
}

type ApiResult = Result<Response, ApiError>;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage | ErrorKind::Parse => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Permission => StatusCode::UNAUTHORIZED,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Execution | ErrorKind::Internal | ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, err: &Error) -> Response {
    if status.is_server_error() {
        tracing::warn!(status = status.as_u16(), error = %err, "request failed");
    }
    let message = Failure::from(err).message;
    let body = match err.hint() {
        Some(hint) => json!({ "message": message, "hint": hint }),
        None => json!({ "message": message }),
    };
    (status, Json(body)).into_response()
}

fn json_response(payload: serde_json::Value) -> Response {
    Json(payload).into_response()
}

fn empty_response(status: StatusCode) -> Response {
    status.into_response()
}

fn octet_response(bytes: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(bytes));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    response
}

/// Raw buffers go out as bytes, `Null` as an empty 200, anything else as JSON.
fn value_response(value: Value) -> Response {
    match value {
        Value::Raw(bytes) => octet_response(bytes),
        Value::Null => empty_response(StatusCode::OK),
        other => json_response(other.to_json()),
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// The admin token also opens regular routes, so one header serves both checks.
fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(presented) = bearer(headers) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    if presented == token || state.admin_token.as_deref() == Some(presented) {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"))
    }
}

fn authorize_admin(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let Some(admin) = state.admin_token.as_ref() else {
        return Ok(());
    };
    if bearer(headers) == Some(admin.as_str()) {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            Error::new(ErrorKind::Permission)
                .with_message("package installation requires the admin token"),
        ))
    }
}

fn header_or<'a>(headers: &'a HeaderMap, name: &str, default: &'a str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
}

/// Authorizes the request and resolves the caller's session key.
fn caller(headers: &HeaderMap, state: &AppState) -> Result<SessionKey, Error> {
    authorize(headers, state)?;
    SessionKey::new(
        header_or(headers, USER_HEADER, DEFAULT_USER),
        header_or(headers, PROFILE_HEADER, DEFAULT_PROFILE),
    )
}

fn location_base(headers: &HeaderMap, state: &AppState) -> String {
    if let Some(public_url) = &state.public_url {
        return public_url.clone();
    }
    match headers.get(header::HOST).and_then(|value| value.to_str().ok()) {
        Some(host) => format!("http://{host}"),
        None => String::new(),
    }
}

fn deferred_response(headers: &HeaderMap, state: &AppState) -> Response {
    let location = format!("{}/lastcommand", location_base(headers, state));
    let mut response = empty_response(StatusCode::CREATED);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

fn parse_failure(err: Error) -> Error {
    if err.kind() != ErrorKind::Parse {
        return err;
    }
    let diagnostic = err.message().unwrap_or("invalid expression").to_string();
    Error::new(ErrorKind::Parse).with_message(format!("Error parsing expression: {diagnostic}"))
}

async fn finished(handle: CommandHandle) -> Result<Value, ApiError> {
    handle.wait().await.map_err(ApiError::from)
}

#[derive(Debug, Default, Deserialize)]
struct DeferQuery {
    #[serde(rename = "async")]
    deferred: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct SymbolQuery {
    table: Option<String>,
    variables: Option<String>,
    #[serde(rename = "async")]
    deferred: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct InstallQuery {
    filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkspaceQuery {
    id: Option<String>,
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    json_response(json!({ "ok": true, "sessions": state.engine.session_count() }))
}

async fn list_packages(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let key = caller(&headers, &state)?;
    let value = finished(state.engine.get_packages(&key)?).await?;
    let rows = packages::parse_listing(&value.as_strings()?)?;
    Ok(Json(rows).into_response())
}

async fn install_package(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InstallQuery>,
    body: Bytes,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    authorize_admin(&headers, &state)?;
    let Some(filename) = query.filename else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("missing filename query parameter")
            .into());
    };
    if body.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("package archive body is empty")
            .into());
    }
    let handle = state.engine.install_package(&key, body.to_vec(), &filename)?;
    finished(handle).await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

async fn list_tables(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let key = caller(&headers, &state)?;
    let tables = catalog::list_tables(&state.engine, &key).await?;
    Ok(json_response(json!(tables)))
}

async fn table_exists(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    if catalog::table_exists(&state.engine, &key, &name).await? {
        Ok(empty_response(StatusCode::OK))
    } else {
        Ok(empty_response(StatusCode::NOT_FOUND))
    }
}

async fn list_symbols(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let key = caller(&headers, &state)?;
    let symbols = catalog::list_symbols(&state.engine, &key).await?;
    Ok(json_response(json!(symbols)))
}

async fn remove_symbol(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    finished(catalog::remove_symbol(&state.engine, &key, &name)?).await?;
    Ok(empty_response(StatusCode::OK))
}

async fn assign_symbol(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<SymbolQuery>,
    body: String,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    let handle = match query.table.as_deref() {
        Some(table) => {
            let variables: Vec<String> = query
                .variables
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|variable| !variable.is_empty())
                .map(str::to_string)
                .collect();
            catalog::load_table(&state.engine, &key, &name, table, &variables)?
        }
        None => {
            let call = state.rewriter.rewrite_assign(&body).map_err(parse_failure)?;
            state.engine.assign(&key, &name, call)?
        }
    };
    if query.deferred.unwrap_or(false) {
        return Ok(deferred_response(&headers, &state));
    }
    finished(handle).await?;
    Ok(empty_response(StatusCode::OK))
}

async fn execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DeferQuery>,
    body: String,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    let call = state.rewriter.rewrite_aggregate(&body).map_err(parse_failure)?;
    let handle = state.engine.evaluate(&key, ops::serialize_call(&call))?;
    if query.deferred.unwrap_or(false) {
        return Ok(deferred_response(&headers, &state));
    }
    Ok(value_response(finished(handle).await?))
}

async fn last_result(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let key = caller(&headers, &state)?;
    let Some(result) = state.engine.last_execution(&key) else {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("no result available")
            .into());
    };
    let value = result.value().await?;
    Ok(value_response(value))
}

async fn last_command(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let key = caller(&headers, &state)?;
    match state.engine.last_command(&key) {
        Some(record) => Ok(json_response(record.to_json())),
        None => Err(Error::new(ErrorKind::NotFound)
            .with_message("no command submitted")
            .into()),
    }
}

async fn list_workspaces(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let key = caller(&headers, &state)?;
    let listed = state.engine.list_workspaces(&key)?;
    let out: Vec<serde_json::Value> = listed
        .iter()
        .map(|info| {
            json!({
                "name": info.name,
                "size": info.size,
                "lastModified": info.last_modified,
                "sha256": info.sha256,
            })
        })
        .collect();
    Ok(json_response(json!(out)))
}

async fn save_workspace(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    validate_workspace_id("saveUserWorkspace", &id)?;
    let path = workspace_path(&key.user, &id);
    finished(state.engine.save_workspace(&key, &path)?).await?;
    Ok(empty_response(StatusCode::CREATED))
}

async fn remove_workspace(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    validate_workspace_id("removeUserWorkspace", &id)?;
    let path = workspace_path(&key.user, &id);
    finished(state.engine.remove_workspace(&key, &path)?).await?;
    Ok(empty_response(StatusCode::OK))
}

async fn load_workspace(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WorkspaceQuery>,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    let id = query.id.unwrap_or_default();
    validate_workspace_id("loadUserWorkspace", &id)?;
    let path = workspace_path(&key.user, &id);
    finished(state.engine.load_user_workspace(&key, &path)?).await?;
    Ok(empty_response(StatusCode::OK))
}

async fn load_tables(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> ApiResult {
    let key = caller(&headers, &state)?;
    let raw = raw.unwrap_or_default();
    let mut paths = Vec::new();
    for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        if name != "workspace" {
            continue;
        }
        validate_object_path("loadTables", &value)?;
        if let Some((project, object)) = value.split_once('/') {
            paths.push(workspace_path(project, object));
        }
    }
    if paths.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("loadTables.workspace: at least one workspace is required")
            .into());
    }
    finished(state.engine.load_workspaces(&key, paths)?).await?;
    Ok(empty_response(StatusCode::OK))
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let key = caller(&headers, &state)?;
    let closed = state.engine.logout(&key);
    Ok(json_response(json!({ "ok": true, "closed": closed })))
}

#[cfg(test)]
mod tests {
    use super::{ServeConfig, status_for, validate_config};
    use crate::core::error::ErrorKind;
    use axum::http::StatusCode;
    use std::collections::BTreeMap;

    fn config(bind: &str) -> ServeConfig {
        let temp = std::env::temp_dir();
        let mut profiles = BTreeMap::new();
        profiles.insert("default".to_string(), "http://127.0.0.1:6311".to_string());
        ServeConfig {
            bind: bind.parse().expect("bind"),
            workspace_dir: temp,
            profiles,
            methods: None,
            token: None,
            admin_token: None,
            public_url: None,
            max_body_bytes: 1024 * 1024,
            idle_timeout_secs: 1800,
        }
    }

    #[test]
    fn loopback_defaults_are_valid() {
        let profiles = validate_config(&config("127.0.0.1:0")).expect("config ok");
        assert_eq!(
            profiles.get("default").map(|url| url.as_str()),
            Some("http://127.0.0.1:6311/")
        );
    }

    #[test]
    fn non_loopback_requires_token() {
        let err = validate_config(&config("0.0.0.0:0")).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let mut with_token = config("0.0.0.0:0");
        with_token.token = Some("secret".to_string());
        validate_config(&with_token).expect("config ok");
    }

    #[test]
    fn profiles_are_required_and_checked() {
        let mut empty = config("127.0.0.1:0");
        empty.profiles.clear();
        assert_eq!(
            validate_config(&empty).expect_err("no profiles").kind(),
            ErrorKind::Usage
        );

        let mut bad_scheme = config("127.0.0.1:0");
        bad_scheme
            .profiles
            .insert("exposome".to_string(), "ftp://host".to_string());
        assert_eq!(
            validate_config(&bad_scheme).expect_err("bad scheme").kind(),
            ErrorKind::Usage
        );

        let mut bad_name = config("127.0.0.1:0");
        bad_name
            .profiles
            .insert("../x".to_string(), "http://host".to_string());
        assert_eq!(
            validate_config(&bad_name).expect_err("bad name").kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn safety_limits_require_positive_values() {
        let mut zero_body = config("127.0.0.1:0");
        zero_body.max_body_bytes = 0;
        assert_eq!(
            validate_config(&zero_body).expect_err("zero body").kind(),
            ErrorKind::Usage
        );

        let mut zero_idle = config("127.0.0.1:0");
        zero_idle.idle_timeout_secs = 0;
        assert_eq!(
            validate_config(&zero_idle).expect_err("zero idle").kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(status_for(ErrorKind::Parse), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Usage), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Permission), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::Execution), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
    }
}
