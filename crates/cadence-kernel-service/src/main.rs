use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cadence_kernel_api::{
    AddMembershipRequest, CadenceKernelApi, CreateTeamRequest, EstablishModelRequest,
    ReconcileCheckpointsRequest, ReconcileMappingsRequest, API_CONTRACT_VERSION,
};
use cadence_kernel_core::RecordId;
use clap::Parser;
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: CadenceKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoveModelRequest {
    team_id: String,
    record_id: RecordId,
}

#[derive(Debug, Clone, Deserialize)]
struct ReopenModelRequest {
    team_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TimelineRequest {
    team_id: String,
    as_of: Option<Date>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "cadence-kernel-service")]
#[command(about = "Local HTTP service for Cadence Kernel")]
struct Args {
    #[arg(long, default_value = "./cadence_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/team/create", post(team_create))
        .route("/v1/model/establish", post(model_establish))
        .route("/v1/model/remove", post(model_remove))
        .route("/v1/model/reopen", post(model_reopen))
        .route("/v1/model/timeline", post(model_timeline))
        .route("/v1/checkpoint/reconcile", post(checkpoint_reconcile))
        .route("/v1/mapping/reconcile", post(mapping_reconcile))
        .route("/v1/membership/add", post(membership_add))
        .route("/v1/plan/:plan_id", get(plan_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let state = ServiceState { api: CadenceKernelApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "cadence kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_api::MigrateResult>>, ServiceError> {
    info!(dry_run = request.dry_run, "migrating database");
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn team_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateTeamRequest>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_store_sqlite::TeamRow>>, ServiceError> {
    info!(team_id = %request.team_id, "creating team");
    let team = state.api.create_team(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(team)))
}

async fn model_establish(
    State(state): State<ServiceState>,
    Json(request): Json<EstablishModelRequest>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_api::EstablishModelResult>>, ServiceError> {
    info!(team_id = %request.team_id, start_on = %request.start_on, "establishing operating model");
    let result =
        state.api.establish_model(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn model_remove(
    State(state): State<ServiceState>,
    Json(request): Json<RemoveModelRequest>,
) -> Result<
    Json<ServiceEnvelope<cadence_kernel_core::SpanRecord<cadence_kernel_core::OperatingModel>>>,
    ServiceError,
> {
    info!(team_id = %request.team_id, record_id = %request.record_id, "removing operating model");
    let removed = state
        .api
        .remove_model(&request.team_id, request.record_id)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(removed)))
}

async fn model_reopen(
    State(state): State<ServiceState>,
    Json(request): Json<ReopenModelRequest>,
) -> Result<Json<ServiceEnvelope<RecordId>>, ServiceError> {
    info!(team_id = %request.team_id, "reopening latest operating model");
    let reopened = state
        .api
        .reopen_model(&request.team_id)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(reopened)))
}

async fn model_timeline(
    State(state): State<ServiceState>,
    Json(request): Json<TimelineRequest>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_api::ModelTimeline>>, ServiceError> {
    let timeline = state
        .api
        .model_timeline(&request.team_id, request.as_of)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(timeline)))
}

async fn checkpoint_reconcile(
    State(state): State<ServiceState>,
    Json(request): Json<ReconcileCheckpointsRequest>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_api::PlanArtifact>>, ServiceError> {
    info!(team_id = %request.team_id, specs = request.specs.len(), "reconciling checkpoints");
    let artifact = state
        .api
        .reconcile_checkpoints(request)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(artifact)))
}

async fn mapping_reconcile(
    State(state): State<ServiceState>,
    Json(request): Json<ReconcileMappingsRequest>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_api::PlanArtifact>>, ServiceError> {
    info!(team_id = %request.team_id, specs = request.specs.len(), "reconciling mappings");
    let artifact = state
        .api
        .reconcile_mappings(request)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(artifact)))
}

async fn membership_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddMembershipRequest>,
) -> Result<
    Json<ServiceEnvelope<cadence_kernel_core::SpanRecord<cadence_kernel_core::TeamMembership>>>,
    ServiceError,
> {
    info!(
        parent_team = %request.parent_team,
        child_team = %request.child_team,
        "adding membership span"
    );
    let record = state
        .api
        .add_membership(request)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(record)))
}

async fn plan_show(
    State(state): State<ServiceState>,
    Path(plan_id): Path<String>,
) -> Result<Json<ServiceEnvelope<cadence_kernel_api::PlanArtifact>>, ServiceError> {
    let artifact =
        state.api.plan_show(&plan_id).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(artifact)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("cadencekernel-service-{}.sqlite3", ulid::Ulid::new()))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState { api: CadenceKernelApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = ServiceState { api: CadenceKernelApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/model/establish"));
        assert!(body.contains("/v1/checkpoint/reconcile"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn service_model_lifecycle_round_trip() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: CadenceKernelApi::new(db_path.clone()) };
        let router = app(state);

        let create_response = post_json(
            router.clone(),
            "/v1/team/create",
            &serde_json::json!({ "team_id": "alpha", "name": "Alpha" }),
        )
        .await;
        assert_eq!(create_response.status(), StatusCode::OK);

        let establish_response = post_json(
            router.clone(),
            "/v1/model/establish",
            &serde_json::json!({
                "team_id": "alpha",
                "start_on": "2024-01-01",
                "framework": "scrum",
                "estimation": "story_points"
            }),
        )
        .await;
        assert_eq!(establish_response.status(), StatusCode::OK);
        let establish_value = response_json(establish_response).await;
        assert!(establish_value
            .pointer("/data/closed")
            .is_some_and(serde_json::Value::is_null));

        let timeline_response = post_json(
            router,
            "/v1/model/timeline",
            &serde_json::json!({ "team_id": "alpha", "as_of": "2024-06-15" }),
        )
        .await;
        assert_eq!(timeline_response.status(), StatusCode::OK);
        let timeline_value = response_json(timeline_response).await;
        assert_eq!(
            timeline_value
                .pointer("/data/entries/0/state")
                .and_then(serde_json::Value::as_str),
            Some("active")
        );
        assert_eq!(
            timeline_value
                .pointer("/data/entries/0/is_current")
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn service_membership_conflict_returns_bad_request() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: CadenceKernelApi::new(db_path.clone()) };
        let router = app(state);

        let first = post_json(
            router.clone(),
            "/v1/membership/add",
            &serde_json::json!({
                "parent_team": "tribe",
                "child_team": "alpha",
                "start_on": "2024-01-01",
                "end_on": null
            }),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);

        let overlapping = post_json(
            router,
            "/v1/membership/add",
            &serde_json::json!({
                "parent_team": "tribe",
                "child_team": "alpha",
                "start_on": "2024-06-01",
                "end_on": null
            }),
        )
        .await;
        assert_eq!(overlapping.status(), StatusCode::BAD_REQUEST);
        let value = response_json(overlapping).await;
        let message = value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing error field in response: {value}"));
        assert!(message.contains("overlap conflict"), "error was: {message}");

        let _ = std::fs::remove_file(&db_path);
    }
}
