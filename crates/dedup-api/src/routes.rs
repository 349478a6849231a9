use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use dedup_core::connection::AuthorizationRequest;
use dedup_core::crm::{CrmClient, HubSpotClient};
use dedup_core::export::DirectoryExportSink;
use dedup_core::models::{
    Account, AccountId, CandidateRecord, ConnectionStatus, DuplicateGroup, GroupPage, GroupState,
    MergeAuditEntry, MergeCommand, ProcessRun, RunStatus,
};
use dedup_core::{ConnectionManager, DatabaseService, MergeEngine, StatusTracker};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::plan_quota::{MergeGroupQuota, QuotaMetricsSnapshot};

const ACCOUNT_HEADER: &str = "x-account-id";
const DEFAULT_PAGE_SIZE: u32 = 25;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    db: DatabaseService,
    connections: Arc<ConnectionManager>,
    merges: Arc<MergeEngine>,
    runs: StatusTracker,
    quota: MergeGroupQuota,
}

impl AppState {
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let db = DatabaseService::open_path(config.database_path.clone()).await?;
        let crm = HubSpotClient::new(config.hubspot_config())?;
        Self::new(config, db, Arc::new(crm))
    }

    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseService,
        crm: Arc<dyn CrmClient>,
    ) -> Result<Self, AppError> {
        let oauth = config
            .oauth_settings()
            .map_err(|error| AppError::Config(error.to_string()))?;
        let connections = Arc::new(ConnectionManager::new(
            db.clone(),
            Arc::clone(&crm),
            oauth,
            config.lifecycle_config(),
        ));
        let quota = MergeGroupQuota::from_config(&config);
        let merges = Arc::new(MergeEngine::new(
            db.clone(),
            Arc::clone(&connections),
            crm,
            Arc::new(quota.clone()),
            Arc::new(DirectoryExportSink::new(config.export_dir.clone())),
            config.merge_config(),
        ));

        Ok(Self {
            runs: StatusTracker::new(db.clone()),
            config,
            db,
            connections,
            merges,
            quota,
        })
    }
}

pub fn app_router(state: AppState) -> Router {
    let account_routes = Router::new()
        .route("/v1/connection", get(connection_status))
        .route("/v1/connection/authorize", post(authorize))
        .route("/v1/connection/disconnect", post(disconnect))
        .route("/v1/runs", post(start_run))
        .route("/v1/runs/{run_key}/groups", post(ingest_groups).get(list_groups))
        .route("/v1/runs/{run_key}/ready", post(mark_ready))
        .route("/v1/runs/{run_key}/restart", post(restart_run))
        .route("/v1/runs/{run_key}/status", get(run_status))
        .route("/v1/runs/{run_key}/finish", post(finish_run))
        .route("/v1/groups/{group_id}/merge", post(merge_group))
        .route("/v1/groups/{group_id}/remove", post(remove_candidate))
        .route("/v1/groups/{group_id}/reset", post(reset_group))
        .route("/v1/groups/{group_id}/audit", get(group_audit))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_account));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/oauth/callback", get(oauth_callback))
        .route("/v1/accounts", post(create_account))
        .merge(account_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    plan: QuotaMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        plan: state.quota.metrics_snapshot(),
    })
}

async fn require_account(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let account_id = extract_account_id(request.headers())?;
    if !state.db.account_exists(&account_id).await? {
        return Err(AppError::unauthorized("Unknown account"));
    }
    request.extensions_mut().insert(account_id);
    Ok(next.run(request).await)
}

fn extract_account_id(headers: &HeaderMap) -> Result<AccountId, AppError> {
    let value = headers
        .get(ACCOUNT_HEADER)
        .ok_or_else(|| AppError::unauthorized("Missing x-account-id header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("x-account-id header is not valid UTF-8"))?;
    value
        .parse()
        .map_err(|_| AppError::unauthorized("x-account-id header is not an account id"))
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    display_name: String,
}

async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    let account = state.db.create_account(&request.display_name).await?;
    tracing::info!(account_id = %account.id, "Created account");
    Ok((StatusCode::CREATED, Json(account)))
}

async fn authorize(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
) -> Result<Json<AuthorizationRequest>, AppError> {
    Ok(Json(state.connections.begin_authorization(&account_id).await?))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let failure = match (query.error, query.code, query.state) {
        (Some(error), _, _) => Some(error),
        (None, Some(code), Some(oauth_state)) => {
            match state
                .connections
                .complete_authorization(&code, &oauth_state)
                .await
            {
                Ok(_) => None,
                Err(error) => {
                    tracing::warn!(code = error.code(), "OAuth callback failed: {error}");
                    Some(error.code().to_string())
                }
            }
        }
        (None, None, _) => Some("missing_code".to_string()),
        (None, Some(_), None) => Some("missing_state".to_string()),
    };

    let target = callback_redirect(&state.config.app_redirect_url, failure.as_deref());
    Redirect::to(&target).into_response()
}

fn callback_redirect(base: &str, failure: Option<&str>) -> String {
    let Ok(mut url) = url::Url::parse(base) else {
        return base.to_string();
    };
    {
        let mut pairs = url.query_pairs_mut();
        match failure {
            None => {
                pairs.append_pair("outcome", "success");
            }
            Some(reason) => {
                pairs.append_pair("outcome", "error");
                pairs.append_pair("reason", reason);
            }
        }
    }
    url.into()
}

async fn connection_status(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
) -> Json<ConnectionStatus> {
    Json(state.connections.status(&account_id).await)
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn disconnect(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.connections.disconnect(&account_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    run_key: String,
    #[serde(default)]
    display_name: String,
}

async fn start_run(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<ProcessRun>), AppError> {
    let run = state
        .runs
        .start_run(&account_id, &request.run_key, &request.display_name)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    clusters: Vec<Vec<CandidateRecord>>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    inserted: usize,
}

async fn ingest_groups(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(run_key): Path<String>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    state.runs.owned_run(&account_id, &run_key).await?;
    let inserted = state.runs.ingest_groups(&run_key, request.clusters).await?;
    Ok(Json(IngestResponse { inserted }))
}

async fn mark_ready(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(run_key): Path<String>,
) -> Result<Json<ProcessRun>, AppError> {
    state.runs.owned_run(&account_id, &run_key).await?;
    Ok(Json(state.runs.mark_ready(&run_key).await?))
}

async fn restart_run(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(run_key): Path<String>,
) -> Result<Json<ProcessRun>, AppError> {
    state.runs.owned_run(&account_id, &run_key).await?;
    Ok(Json(state.runs.restart_run(&run_key).await?))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn list_groups(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(run_key): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<GroupPage>, AppError> {
    state.runs.owned_run(&account_id, &run_key).await?;
    let page = state
        .merges
        .list_groups(
            &run_key,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(page))
}

async fn run_status(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(run_key): Path<String>,
) -> Result<Json<RunStatus>, AppError> {
    state.runs.owned_run(&account_id, &run_key).await?;
    Ok(Json(state.runs.status(&run_key).await?))
}

#[derive(Debug, Serialize)]
struct FinishResponse {
    export_reference: String,
}

async fn finish_run(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(run_key): Path<String>,
) -> Result<Json<FinishResponse>, AppError> {
    state.runs.owned_run(&account_id, &run_key).await?;
    let export_reference = state.merges.finish(&run_key).await?;
    Ok(Json(FinishResponse { export_reference }))
}

#[derive(Debug, Serialize)]
struct GroupResponse {
    state: GroupState,
    group: DuplicateGroup,
}

impl From<DuplicateGroup> for GroupResponse {
    fn from(group: DuplicateGroup) -> Self {
        Self {
            state: group.state(),
            group,
        }
    }
}

async fn merge_group(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(group_id): Path<i64>,
    Json(command): Json<MergeCommand>,
) -> Result<Json<GroupResponse>, AppError> {
    let group = state
        .merges
        .merge_pair(&account_id, group_id, &command)
        .await?;
    Ok(Json(group.into()))
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    record_id: String,
}

async fn remove_candidate(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(group_id): Path<i64>,
    Json(request): Json<RemoveRequest>,
) -> Result<Json<GroupResponse>, AppError> {
    if request.record_id.trim().is_empty() {
        return Err(AppError::bad_request("record_id cannot be empty"));
    }
    let group = state
        .merges
        .remove_candidate(&account_id, group_id, &request.record_id)
        .await?;
    Ok(Json(group.into()))
}

async fn reset_group(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(group_id): Path<i64>,
) -> Result<Json<GroupResponse>, AppError> {
    let group = state.merges.reset_group(&account_id, group_id).await?;
    Ok(Json(group.into()))
}

async fn group_audit(
    State(state): State<AppState>,
    Extension(account_id): Extension<AccountId>,
    Path(group_id): Path<i64>,
) -> Result<Json<Vec<MergeAuditEntry>>, AppError> {
    Ok(Json(state.merges.audit_trail(&account_id, group_id).await?))
}
