//! The HTTP and websocket API.

use crate::{
    console::{ClusterUpdate, Console, NewCluster},
    socket,
};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        FromRequestParts, Path, Query, RawQuery, State,
    },
    http::{header, request::Parts, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use bytes::Bytes;
use kubedeck_core::{
    cluster::Reachability,
    session::{LogOptions, SessionId, SessionInfo, Target},
    AccessRequest, ClusterDescriptor, ClusterId, Decision, Error, UserId,
};
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Clone)]
struct AppState {
    console: Console,
    identity_header: HeaderName,
    metrics: Arc<Registry>,
}

/// The authenticated caller, taken from the identity header set by the
/// fronting proxy.
struct Subject(UserId);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing {0} header")]
    Unauthenticated(HeaderName),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Core(#[from] Error),

    #[error("failed to encode metrics")]
    Metrics(#[from] std::fmt::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterView {
    id: ClusterId,
    name: String,
    server: String,
    auth: &'static str,
    default: bool,
    reachability: Reachability,
}

#[derive(Debug, Deserialize)]
struct AuthorizeBody {
    cluster: String,
    verb: String,
    kind: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct AuthorizeView {
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<usize>,
}

pub fn router(console: Console, identity_header: HeaderName, metrics: Registry) -> Router {
    let state = AppState {
        console,
        identity_header,
        metrics: Arc::new(metrics),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_text))
        .route("/api/v1/authorize", post(authorize))
        .route("/api/v1/clusters", get(list_clusters).post(add_cluster))
        .route("/api/v1/clusters/import", post(import_bundle))
        .route(
            "/api/v1/clusters/{id}",
            patch(update_cluster).delete(remove_cluster),
        )
        .route("/api/v1/clusters/{id}/default", post(set_default))
        .route("/api/v1/clusters/{id}/refresh", post(refresh_clients))
        .route("/api/v1/clusters/{id}/discovery", post(refresh_discovery))
        .route("/api/v1/clusters/{id}/probe", post(probe))
        .route("/api/v1/clusters/{id}/credentials", put(put_credential))
        .route(
            "/api/v1/clusters/{id}/credentials/validate",
            post(validate_credential),
        )
        .route(
            "/api/v1/clusters/{cluster}/namespaces/{ns}/pods/{pod}/log",
            get(pod_logs),
        )
        .route(
            "/api/v1/clusters/{cluster}/namespaces/{ns}/pods/{pod}/exec",
            get(pod_exec),
        )
        .route("/api/v1/clusters/{cluster}/nodes/{node}/shell", get(node_shell))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/{id}", delete(terminate_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === impl Subject ===

impl FromRequestParts<AppState> for Subject {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        parts
            .headers
            .get(&state.identity_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Subject(UserId::new(v)))
            .ok_or_else(|| ApiError::Unauthenticated(state.identity_header.clone()))
    }
}

// === impl ApiError ===

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Core(error) => match error {
                Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
                Error::UnknownCluster(_) => StatusCode::NOT_FOUND,
                Error::DuplicateCluster(_) => StatusCode::CONFLICT,
                Error::CredentialMissing { .. } => StatusCode::PRECONDITION_FAILED,
                Error::InvalidBundle(_) | Error::InvalidDescriptor(_) => StatusCode::BAD_REQUEST,
                Error::ProviderAuth { .. } => StatusCode::BAD_GATEWAY,
                Error::ClusterUnreachable { .. } | Error::UpstreamUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                Error::PodSpawnTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                Error::Decryption(_) | Error::Seal(_) | Error::Store(_) | Error::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Metrics(_) => "internal",
            Self::Core(error) => error.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

// === impl ClusterView ===

impl From<ClusterDescriptor> for ClusterView {
    fn from(desc: ClusterDescriptor) -> Self {
        Self {
            id: desc.id,
            auth: desc.auth.name(),
            name: desc.name,
            server: desc.endpoint.server,
            default: desc.default,
            reachability: desc.reachability,
        }
    }
}

// === handlers ===

async fn metrics_text(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mut body = String::new();
    prometheus_client::encoding::text::encode(&mut body, &state.metrics)?;
    Ok((
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

async fn authorize(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Json(body): Json<AuthorizeBody>,
) -> Json<AuthorizeView> {
    let req = AccessRequest::new(
        subject,
        body.cluster,
        body.verb,
        body.kind,
        body.namespace,
        body.name,
    );
    Json(match state.console.decide(&req) {
        Decision::Allow { role, rule } => AuthorizeView {
            allowed: true,
            role: Some(role),
            rule: Some(rule),
        },
        Decision::Deny => AuthorizeView {
            allowed: false,
            role: None,
            rule: None,
        },
    })
}

async fn list_clusters(
    State(state): State<AppState>,
    Subject(subject): Subject,
) -> Json<Vec<ClusterView>> {
    let clusters = state.console.list_clusters(&subject);
    Json(clusters.into_iter().map(ClusterView::from).collect())
}

async fn add_cluster(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Json(new): Json<NewCluster>,
) -> Result<(StatusCode, Json<ClusterView>), ApiError> {
    let desc = state.console.add_cluster(&subject, new).await?;
    Ok((StatusCode::CREATED, Json(desc.into())))
}

async fn update_cluster(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
    Json(update): Json<ClusterUpdate>,
) -> Result<Json<ClusterView>, ApiError> {
    let desc = state.console.update_cluster(&subject, &id, update).await?;
    Ok(Json(desc.into()))
}

async fn remove_cluster(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.console.remove_cluster(&subject, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn import_bundle(
    State(state): State<AppState>,
    Subject(subject): Subject,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ids = state.console.import_bundle(&subject, &body).await?;
    Ok(Json(serde_json::json!({ "imported": ids })))
}

async fn set_default(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
) -> Result<Json<ClusterView>, ApiError> {
    let desc = state.console.set_default(&subject, &id).await?;
    Ok(Json(desc.into()))
}

async fn refresh_clients(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invalidated = state.console.refresh_clients(&subject, &id).await?;
    Ok(Json(serde_json::json!({ "invalidated": invalidated })))
}

async fn refresh_discovery(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.console.refresh_discovery(&subject, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn probe(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
) -> Result<Json<Reachability>, ApiError> {
    Ok(Json(state.console.probe(&subject, &id).await?))
}

async fn put_credential(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("credential must not be empty".to_string()));
    }
    state.console.put_credential(&subject, &id, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn validate_credential(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let validation = state.console.validate_credential(&subject, &id).await?;
    Ok(Json(serde_json::json!({ "validation": validation })))
}

async fn list_sessions(
    State(state): State<AppState>,
    Subject(subject): Subject,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    Ok(Json(state.console.list_sessions(&subject).await?))
}

async fn terminate_session(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = id
        .parse::<SessionId>()
        .map_err(|_| ApiError::BadRequest(format!("invalid session id {id}")))?;
    if state.console.terminate_session(&subject, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no session {id}")))
    }
}

async fn pod_logs(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path((cluster, namespace, pod)): Path<(String, String, String)>,
    Query(options): Query<LogOptions>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let target = Target::Logs {
        cluster,
        namespace,
        pod,
        options,
    };
    upgrade(state.console, subject, target, ws).await
}

async fn pod_exec(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path((cluster, namespace, pod)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let params = match serde_urlencoded::from_str::<Vec<(String, String)>>(
        query.as_deref().unwrap_or_default(),
    ) {
        Ok(params) => params,
        Err(error) => return ApiError::BadRequest(error.to_string()).into_response(),
    };
    let mut container = None;
    let mut command = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "container" => container = Some(value),
            "command" => command.push(value),
            _ => {}
        }
    }
    let target = Target::Terminal {
        cluster,
        namespace,
        pod,
        container,
        command,
    };
    upgrade(state.console, subject, target, ws).await
}

async fn node_shell(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Path((cluster, node)): Path<(String, String)>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let target = Target::NodeTerminal { cluster, node };
    upgrade(state.console, subject, target, ws).await
}

/// Authorizes a session before accepting the upgrade, so a denied caller
/// never gets a socket.
async fn upgrade(
    console: Console,
    subject: UserId,
    target: Target,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(error) = console.authorize_session(&subject, &target).await {
        return ApiError::from(error).into_response();
    }
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| async move {
            let (rx, tx) = socket::split(socket);
            console.run_session(subject, target, rx, tx).await;
        }),
        Err(rejection) => rejection.into_response(),
    }
}
