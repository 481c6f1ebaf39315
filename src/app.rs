use crate::bedrock::BedrockClient;
use crate::config::Config;
use crate::error::{AppError, AppResult, ErrorMarker};
use crate::upstream::UpstreamClient;
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub fn load_state(config: Config) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("bedrock-claude-proxy/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| AppError::internal(format!("http client init failed: {err}")))?;
    let upstream = Arc::new(BedrockClient::from_config(http, &config.bedrock));
    load_state_with_upstream(config, upstream)
}

/// Builds state around any upstream client; tests pass their own.
pub fn load_state_with_upstream(
    config: Config,
    upstream: Arc<dyn UpstreamClient>,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    Ok(AppState {
        config: Arc::new(config),
        upstream,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(format!(
                    "metrics init failed: {err}"
                )));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.config.metrics_path.clone();
    let body_limit = state.config.max_inbound_bytes;
    Router::<AppState>::new()
        .route("/v1/messages", post(crate::handlers::create_message))
        .route(
            "/v1/messages/count_tokens",
            post(crate::handlers::count_tokens),
        )
        .route("/v1/complete", post(crate::handlers::create_completion))
        .route(&metrics_path, get(crate::handlers::metrics))
        .route("/health", get(crate::handlers::health))
        .fallback(crate::handlers::not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::map_response_with_state(
            state.clone(),
            rewrite_error_status,
        ))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// With `errors_with_ok_status`, error envelopes go out as HTTP 200.
async fn rewrite_error_status(State(state): State<AppState>, mut resp: Response) -> Response {
    if state.config.errors_with_ok_status && resp.extensions().get::<ErrorMarker>().is_some() {
        *resp.status_mut() = StatusCode::OK;
    }
    resp
}
