use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use fitsave_core::config::DriverKind;
use fitsave_core::gateway::SubmissionOutcome;
use fitsave_core::identity::{
    AnonymousCookieSigner, AuthProvider, IdentityResolver, RequestCredentials, ResolvedIdentity,
};
use fitsave_core::util::fingerprint;
use fitsave_core::{OwnerId, PersistenceGateway, SavedResult, SubmissionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_session_token, JwtSessionVerifier};
use crate::config::AppConfig;
use crate::cookies::{anonymous_cookie, read_cookie, ANONYMOUS_COOKIE};
use crate::csrf::{CsrfVerifier, OriginCheck};
use crate::error::AppError;
use crate::rate_limit::{
    client_key, AdmissionGuard, AdmissionMetricsSnapshot, SlidingWindowLimiter,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    gateway: Arc<PersistenceGateway>,
    identity: Arc<IdentityResolver>,
    csrf: Arc<dyn CsrfVerifier>,
    admission: Arc<dyn AdmissionGuard>,
}

impl AppState {
    pub fn with_gateway(config: Arc<AppConfig>, gateway: Arc<PersistenceGateway>) -> Self {
        let auth = config
            .auth
            .as_ref()
            .map(|auth| Arc::new(JwtSessionVerifier::new(auth)) as Arc<dyn AuthProvider>);
        let signer = config
            .anonymous_cookie_secret
            .as_deref()
            .map(AnonymousCookieSigner::new);

        Self {
            identity: Arc::new(IdentityResolver::new(auth, signer, config.allow_anonymous)),
            csrf: Arc::new(OriginCheck::new(config.allowed_origins.clone())),
            admission: Arc::new(SlidingWindowLimiter::from_config(&config)),
            gateway,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/saved-results",
            get(list_saved_results)
                .post(save_result)
                .delete(clear_saved_results),
        )
        .route("/saved-results/merge", post(merge_saved_result))
        .route("/saved-results/{id}", delete(delete_saved_result))
        .route("/newsletter", post(subscribe_newsletter))
        .route("/contact", post(submit_contact))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            guard_mutations,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", api_routes)
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
struct StorageHealth {
    driver: DriverKind,
    configured: bool,
    strict_mode: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    storage: StorageHealth,
    auth_configured: bool,
    rate_limit: AdmissionMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        storage: StorageHealth {
            driver: state.gateway.driver_kind(),
            configured: state.gateway.is_configured(),
            strict_mode: state.gateway.strict_mode(),
        },
        auth_configured: state.identity.is_auth_configured(),
        rate_limit: state.admission.metrics_snapshot().await,
    })
}

/// CSRF check then admission, for every non-GET request under `/v1`.
async fn guard_mutations(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = request.method();
    if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    state.csrf.verify(request.headers())?;
    let admission = state.admission.admit(&client_key(request.headers())).await?;

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("x-ratelimit-remaining", HeaderValue::from(admission.remaining));
    Ok(response)
}

fn credentials(headers: &HeaderMap) -> RequestCredentials {
    RequestCredentials {
        session_token: extract_session_token(headers),
        anonymous_cookie: read_cookie(headers, ANONYMOUS_COOKIE),
    }
}

/// Identity for a saved-results call, in precedence order: auth, storage, identity.
async fn saved_results_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<ResolvedIdentity, AppError> {
    if !state.identity.is_auth_configured() {
        return Err(AppError::NotImplemented(
            "Saved results require an auth provider".to_string(),
        ));
    }
    if !state.gateway.is_configured() {
        return Err(AppError::ServiceUnavailable(
            "Result storage is not configured".to_string(),
        ));
    }
    state
        .identity
        .resolve(&credentials(headers))
        .await
        .ok_or_else(|| AppError::unauthorized("Sign in to use saved results"))
}

/// Attach the freshly minted anonymous cookie, if any.
fn respond<T: Serialize>(state: &AppState, identity: &ResolvedIdentity, body: T) -> Response {
    let mut response = Json(body).into_response();
    if let Some(value) = identity.issued_cookie.as_deref() {
        if let Some(cookie) = anonymous_cookie(value, state.config.cookie_secure) {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
    response
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    success: bool,
    results: Vec<SavedResult>,
}

async fn list_saved_results(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let identity = saved_results_identity(&state, &headers).await?;
    let results = state.gateway.list_results(&identity.owner, query.limit).await?;

    tracing::debug!(
        endpoint = "saved_results_list",
        owner = fingerprint(&identity.owner.storage_key()),
        count = results.len(),
        "Listed saved results"
    );
    Ok(respond(
        &state,
        &identity,
        ListResponse {
            success: true,
            results,
        },
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveResultRequest {
    calculator_type: String,
    calculator_name: String,
    data: Value,
}

#[derive(Debug, Serialize)]
struct SaveResultResponse {
    success: bool,
    result: SavedResult,
}

async fn save_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SaveResultRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request = json_body(payload)?;
    let identity = saved_results_identity(&state, &headers).await?;
    let result = state
        .gateway
        .save_result(
            &identity.owner,
            &request.calculator_type,
            &request.calculator_name,
            &request.data,
        )
        .await?;

    tracing::info!(
        endpoint = "saved_results_save",
        owner = fingerprint(&identity.owner.storage_key()),
        anonymous = identity.owner.is_anonymous(),
        calculator_type = %result.calculator_type,
        "Saved calculator result"
    );
    Ok(respond(
        &state,
        &identity,
        SaveResultResponse {
            success: true,
            result,
        },
    ))
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    success: bool,
    removed: bool,
}

async fn delete_saved_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let identity = saved_results_identity(&state, &headers).await?;
    let removed = state.gateway.delete_result(&identity.owner, &id).await?;

    tracing::info!(
        endpoint = "saved_results_delete",
        owner = fingerprint(&identity.owner.storage_key()),
        removed,
        "Deleted saved result"
    );
    Ok(respond(
        &state,
        &identity,
        DeleteResponse {
            success: true,
            removed,
        },
    ))
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    success: bool,
    removed: u64,
}

async fn clear_saved_results(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let identity = saved_results_identity(&state, &headers).await?;
    let removed = state.gateway.clear_results(&identity.owner).await?;
    Ok(respond(
        &state,
        &identity,
        ClearResponse {
            success: true,
            removed,
        },
    ))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    id: String,
}

#[derive(Debug, Serialize)]
struct MergeResponse {
    success: bool,
    id: String,
    result: SavedResult,
}

/// Move one anonymous result into the signed-in account.
async fn merge_saved_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<MergeResponse>, AppError> {
    let request = json_body(payload)?;
    if !state.identity.is_auth_configured() {
        return Err(AppError::NotImplemented(
            "Saved results require an auth provider".to_string(),
        ));
    }

    let credentials = credentials(&headers);
    let account = state
        .identity
        .authenticated_account(&credentials)
        .await
        .ok_or_else(|| AppError::unauthorized("Sign in to merge saved results"))?;
    let anonymous = state
        .identity
        .anonymous_owner(&credentials)
        .ok_or_else(|| AppError::bad_request("No anonymous identity to merge from"))?;

    let from = OwnerId::Anonymous(anonymous);
    let to = OwnerId::Account(account);
    let result = state
        .gateway
        .transfer_result(&from, &to, &request.id)
        .await?
        .ok_or_else(|| AppError::NotFound("Saved result not found".to_string()))?;

    tracing::info!(
        endpoint = "saved_results_merge",
        owner = fingerprint(&to.storage_key()),
        "Merged anonymous result into account"
    );
    Ok(Json(MergeResponse {
        success: true,
        id: result.result_key.clone(),
        result,
    }))
}

#[derive(Debug, Serialize)]
struct SubmissionResponse {
    success: bool,
    persisted: bool,
}

async fn record_submission(
    state: &AppState,
    kind: SubmissionKind,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SubmissionResponse>, AppError> {
    let payload = json_body(payload)?;
    let SubmissionOutcome { persisted } = state.gateway.record_submission(kind, &payload).await?;
    tracing::info!(kind = kind.as_str(), persisted, "Recorded submission");
    Ok(Json(SubmissionResponse {
        success: true,
        persisted,
    }))
}

async fn subscribe_newsletter(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SubmissionResponse>, AppError> {
    record_submission(&state, SubmissionKind::Newsletter, payload).await
}

async fn submit_contact(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SubmissionResponse>, AppError> {
    record_submission(&state, SubmissionKind::Contact, payload).await
}
