use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cluster::identity::NodeIdentity;
use crate::error::{ErrorCode, GovernorError};
use crate::governor::Governor;
use crate::state::job::ActiveJob;
use crate::state::registry::AgentSnapshot;
use crate::state::stats::JobTypeStatsSnapshot;

#[derive(Clone)]
pub struct ApiState {
    pub governor: Arc<Governor>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexResponse {
    package_name: &'static str,
    versions: BTreeMap<&'static str, &'static str>,
    #[serde(flatten)]
    identity: NodeIdentity,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeView {
    name: String,
    hostname: String,
    port: u16,
    master: bool,
    uptime: f64,
    server_id: String,
    priority: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobsResponse {
    job_types: BTreeMap<String, JobTypeStatsSnapshot>,
    active_jobs: Vec<ActiveJob>,
}

#[derive(Serialize)]
struct ReapResponse {
    reaped: Vec<Uuid>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    leader: Option<String>,
}

/// Error wrapper so handlers can use `?` on governor results.
pub struct ApiError(GovernorError);

impl From<GovernorError> for ApiError {
    fn from(err: GovernorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::NotLeader => StatusCode::CONFLICT,
            ErrorCode::InvariantViolation => StatusCode::CONFLICT,
            ErrorCode::IdentityMismatch | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let leader = match &self.0 {
            GovernorError::NotLeader(leader) => leader.clone(),
            _ => None,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                leader,
            }),
        )
            .into_response()
    }
}

/// Build the control surface. Everything lives under `/api`; `/` redirects
/// there.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/", get(index_handler))
        .route("/nodes", get(nodes_handler))
        .route("/node/demote", get(demote_handler).post(demote_handler))
        .route("/node/promote", get(promote_handler).post(promote_handler))
        .route("/agents", get(agents_handler))
        .route("/agents/:name", get(agent_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/reap", post(reap_handler))
        .route("/jobs/:name", get(job_type_handler))
        .route("/locks", get(locks_handler));

    Router::new()
        .route("/", get(|| async { Redirect::temporary("/api") }))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting control surface");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind control surface");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Control surface failed");
    }
}

async fn index_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let versions = BTreeMap::from([("app", env!("CARGO_PKG_VERSION"))]);
    Json(IndexResponse {
        package_name: env!("CARGO_PKG_NAME"),
        versions,
        identity: state.governor.identify_me().await,
    })
}

async fn nodes_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let me = state.governor.identify_me().await;
    let now = Utc::now();
    let nodes: Vec<NodeView> = state
        .governor
        .membership
        .read()
        .await
        .node_list(me)
        .into_iter()
        .map(|node| NodeView {
            uptime: node.uptime_at(now),
            name: node.node_name,
            hostname: node.node_hostname,
            port: node.node_port,
            master: node.is_master,
            server_id: node.server_id,
            priority: node.priority,
        })
        .collect();

    Json(nodes)
}

async fn demote_handler(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.governor.demote().await?))
}

async fn promote_handler(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.governor.promote().await?))
}

async fn agents_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = state.governor.registry.read().await;
    let agents: BTreeMap<String, AgentSnapshot> = registry
        .agents()
        .map(|agent| (agent.name.clone(), agent.snapshot()))
        .collect();
    Json(agents)
}

async fn agent_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.governor.registry.read().await;
    let agent = registry
        .agent(&name)
        .ok_or_else(|| GovernorError::NotFound(format!("agent {name}")))?;
    Ok(Json(agent.snapshot()))
}

async fn jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = state.governor.registry.read().await;
    Json(JobsResponse {
        job_types: registry
            .job_types()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect(),
        active_jobs: registry.active_jobs().into_iter().cloned().collect(),
    })
}

async fn job_type_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.governor.registry.read().await;
    let stats = registry
        .job_type(&name)
        .ok_or_else(|| GovernorError::NotFound(format!("job type {name}")))?;
    Ok(Json(stats.snapshot()))
}

async fn locks_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.governor.shared.read().await.clone())
}

async fn reap_handler(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    if !state.governor.is_leader().await {
        return Err(GovernorError::NotLeader(state.governor.current_master().await).into());
    }
    let reaped = state.governor.reap_expired().await;
    Ok(Json(ReapResponse { reaped }))
}
