use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_api::{IdentityApi, MigrateResult, API_CONTRACT_VERSION};
use identity_core::{ContactId, IdentifyRequest, IdentifyResponse, ResolverError};
use identity_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const BANNER: &str = "Identity Reconciliation API - Use POST /identify";
const IDENTIFY_HINT: &str = "Identity Reconciliation API - Use POST /identify with email/phoneNumber";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
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
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "identity-service")]
#[command(about = "HTTP service for identity reconciliation")]
struct Args {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Overrides the port of `--bind`.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    #[arg(long, env = "IDENTITY_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn listen_addr(&self) -> SocketAddr {
        match self.port {
            Some(port) => SocketAddr::new(self.bind.ip(), port),
            None => self.bind,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    #[allow(clippy::needless_pass_by_value)]
    fn internal(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "admin request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }

    fn from_resolver(err: &ResolverError) -> Self {
        let status = status_for(err);
        if status.is_server_error() {
            tracing::error!(error = %err, "admin request failed");
        }
        Self::new(status, err.to_string())
    }
}

fn status_for(err: &ResolverError) -> StatusCode {
    match err {
        ResolverError::Validation(_) => StatusCode::BAD_REQUEST,
        ResolverError::NotFound(_) => StatusCode::NOT_FOUND,
        ResolverError::Store(_) | ResolverError::DataIntegrity(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
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

async fn run_blocking<T, F>(task: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(task).await.unwrap_or_else(|err| {
        Err(ServiceError::internal(anyhow::Error::new(err).context("blocking task failed")))
    })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/identify", post(identify).get(identify_hint))
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .route("/v1/contacts/:contact_id", get(contact_show))
        .with_state(state)
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let listen_addr = args.listen_addr();
    let state = ServiceState { api: IdentityApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, db = %args.db.display(), "identity service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn banner() -> &'static str {
    BANNER
}

async fn identify_hint() -> &'static str {
    IDENTIFY_HINT
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> (StatusCode, Json<IdentifyResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::warn!(error = %rejection.body_text(), "rejected malformed identify request");
            return (StatusCode::BAD_REQUEST, Json(IdentifyResponse::empty()));
        }
    };

    let api = state.api;
    let outcome = run_blocking(move || Ok(api.identify(&request))).await;
    match outcome {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)),
        Ok(Err(err)) => {
            let status = status_for(&err);
            if err.is_client_error() {
                tracing::warn!(error = %err, "rejected identify request");
            } else {
                tracing::error!(error = %err, "identify request failed");
            }
            (status, Json(IdentifyResponse::empty()))
        }
        Err(err) => (err.status, Json(IdentifyResponse::empty())),
    }
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status =
        run_blocking(move || state.api.schema_status().map_err(ServiceError::internal)).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result =
        run_blocking(move || state.api.migrate(request.dry_run).map_err(ServiceError::internal))
            .await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report =
        run_blocking(move || state.api.integrity_check().map_err(ServiceError::internal)).await?;
    Ok(Json(envelope(report)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<IdentifyResponse>>, ServiceError> {
    let response = run_blocking(move || {
        state.api.contact(ContactId(contact_id)).map_err(|err| ServiceError::from_resolver(&err))
    })
    .await?;
    Ok(Json(envelope(response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("identity-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn router_for(db_path: PathBuf) -> Router {
        app(ServiceState { api: IdentityApi::new(db_path) })
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_json(uri: &str, body: impl Into<String>) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.into()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn zero_payload() -> serde_json::Value {
        serde_json::json!({
            "contact": {
                "primaryContatctId": 0,
                "emails": [],
                "phoneNumbers": [],
                "secondaryContactIds": []
            }
        })
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = send(router_for(unique_temp_db_path()), get_request("/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("data").and_then(|data| data.get("status")).and_then(serde_json::Value::as_str),
            Some("ok")
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let response = send(router_for(unique_temp_db_path()), get_request("/v1/openapi")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_text(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));

        let document: serde_yaml::Value = match serde_yaml::from_str(&body) {
            Ok(document) => document,
            Err(err) => panic!("openapi document is not YAML: {err}"),
        };
        let paths = document
            .get("paths")
            .and_then(serde_yaml::Value::as_mapping)
            .unwrap_or_else(|| panic!("openapi document has no paths"));
        for path in ["/identify", "/v1/health", "/v1/db/integrity", "/v1/contacts/{contactId}"] {
            assert!(paths.contains_key(path), "missing path {path}");
        }
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn banner_routes_return_usage_text() {
        let router = router_for(unique_temp_db_path());

        let root = send(router.clone(), get_request("/")).await;
        assert_eq!(root.status(), StatusCode::OK);
        assert_eq!(response_text(root).await, BANNER);

        let hint = send(router, get_request("/identify")).await;
        assert_eq!(hint.status(), StatusCode::OK);
        assert_eq!(response_text(hint).await, IDENTIFY_HINT);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn identify_creates_primary_then_secondary() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        let first = send(
            router.clone(),
            post_json(
                "/identify",
                r#"{"email":"lorraine@hillvalley.edu","phoneNumber":"123456"}"#,
            ),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            response_json(first).await,
            serde_json::json!({
                "contact": {
                    "primaryContatctId": 1,
                    "emails": ["lorraine@hillvalley.edu"],
                    "phoneNumbers": ["123456"],
                    "secondaryContactIds": []
                }
            })
        );

        let second = send(
            router,
            post_json("/identify", r#"{"email":"mcfly@hillvalley.edu","phoneNumber":"123456"}"#),
        )
        .await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(
            response_json(second).await,
            serde_json::json!({
                "contact": {
                    "primaryContatctId": 1,
                    "emails": ["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"],
                    "phoneNumbers": ["123456"],
                    "secondaryContactIds": [2]
                }
            })
        );

        cleanup(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn identify_accepts_numeric_phone_number() {
        let db_path = unique_temp_db_path();
        let response =
            send(router_for(db_path.clone()), post_json("/identify", r#"{"phoneNumber":717171}"#))
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["contact"]["phoneNumbers"], serde_json::json!(["717171"]));
        assert_eq!(value["contact"]["emails"], serde_json::json!([]));
        cleanup(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn identify_rejects_missing_fields_with_zero_payload() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        for body in ["{}", r#"{"email":null,"phoneNumber":null}"#, r#"{"email":"  ","phoneNumber":""}"#]
        {
            let response = send(router.clone(), post_json("/identify", body)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body={body}");
            assert_eq!(response_json(response).await, zero_payload());
        }
        assert!(!db_path.exists());
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn identify_rejects_malformed_json_with_zero_payload() {
        let router = router_for(unique_temp_db_path());

        let truncated = send(router.clone(), post_json("/identify", r#"{"email":"#)).await;
        assert_eq!(truncated.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(truncated).await, zero_payload());

        let wrong_type = send(router, post_json("/identify", r#"{"phoneNumber":[1,2]}"#)).await;
        assert_eq!(wrong_type.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(wrong_type).await, zero_payload());
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn identify_store_failure_returns_server_error_with_zero_payload() {
        let unreachable = std::env::temp_dir()
            .join(format!("identity-missing-{}", ulid::Ulid::new()))
            .join("identity.sqlite3");
        let response = send(
            router_for(unreachable),
            post_json("/identify", r#"{"email":"doc@hillvalley.edu"}"#),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(response).await, zero_payload());
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn contact_show_returns_cluster_or_not_found() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        let created = send(
            router.clone(),
            post_json("/identify", r#"{"email":"doc@hillvalley.edu","phoneNumber":"1955"}"#),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);

        let shown = send(router.clone(), get_request("/v1/contacts/1")).await;
        assert_eq!(shown.status(), StatusCode::OK);
        let value = response_json(shown).await;
        assert_eq!(value["api_contract_version"], serde_json::json!(API_CONTRACT_VERSION));
        assert_eq!(value["data"]["contact"]["primaryContatctId"], serde_json::json!(1));

        let missing = send(router, get_request("/v1/contacts/99")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let error = response_json(missing).await;
        assert!(error.get("error").and_then(serde_json::Value::as_str).is_some());

        cleanup(&db_path);
    }

    // Test IDs: TSVC-010
    #[tokio::test]
    async fn db_routes_report_schema_and_integrity() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        let planned =
            send(router.clone(), post_json("/v1/db/migrate", r#"{"dry_run":true}"#)).await;
        assert_eq!(planned.status(), StatusCode::OK);
        let planned = response_json(planned).await;
        assert_eq!(planned["data"]["would_apply_versions"], serde_json::json!([1]));

        let applied =
            send(router.clone(), post_json("/v1/db/migrate", r#"{"dry_run":false}"#)).await;
        assert_eq!(applied.status(), StatusCode::OK);
        assert_eq!(response_json(applied).await["data"]["up_to_date"], serde_json::json!(true));

        let status = send(router.clone(), post_json("/v1/db/schema-version", "")).await;
        assert_eq!(status.status(), StatusCode::OK);
        assert_eq!(response_json(status).await["data"]["current_version"], serde_json::json!(1));

        let integrity = send(router, get_request("/v1/db/integrity")).await;
        assert_eq!(integrity.status(), StatusCode::OK);
        let integrity = response_json(integrity).await;
        assert_eq!(integrity["data"]["quick_check_ok"], serde_json::json!(true));
        assert_eq!(integrity["data"]["linkage_violations"], serde_json::json!([]));

        cleanup(&db_path);
    }

    #[test]
    fn port_overrides_bind_port() {
        let args = match Args::try_parse_from([
            "identity-service",
            "--bind",
            "0.0.0.0:3000",
            "--port",
            "8080",
        ]) {
            Ok(args) => args,
            Err(err) => panic!("failed to parse args: {err}"),
        };
        assert_eq!(args.listen_addr(), SocketAddr::from(([0, 0, 0, 0], 8080)));
    }

    #[test]
    fn resolver_errors_map_to_status_codes() {
        assert_eq!(
            status_for(&ResolverError::Validation("empty".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&ResolverError::NotFound(ContactId(3))), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ResolverError::Store("disk".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&ResolverError::DataIntegrity("chain".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
