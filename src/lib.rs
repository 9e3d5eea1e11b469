use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

pub mod aliases;
pub mod config;
pub mod dispatch;
pub mod normalize;
pub mod upstream;

pub use aliases::ModelAliasTable;
pub use config::AppConfig;
pub use dispatch::{DispatchError, Dispatcher, FallbackPlan, RetryPolicy, UpstreamResponse};
pub use normalize::{ChatMessage, ChatRequest, EmptyInputPolicy, Normalizer};
pub use upstream::{HttpTransport, UpstreamReply, UpstreamTransport};

/// Response header naming the upstream model that produced the response.
pub const SELECTED_MODEL_HEADER: &str = "x-relay-selected-model";

const CHAT_COMPLETIONS_HINT: &str = "POST an OpenAI chat completion payload here.";

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    normalizer: Arc<Normalizer>,
    dispatcher: Dispatcher,
    fallback_models: Arc<[String]>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(&config));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: AppConfig, transport: Arc<dyn UpstreamTransport>) -> Self {
        let normalizer = Normalizer::new(config.default_model.clone(), config.model_aliases.clone())
            .with_empty_input(config.on_empty_input, config.default_message.clone())
            .with_provider_hint(config.provider_hint.clone());
        let fallback_models = config
            .fallback_models
            .iter()
            .map(|m| normalizer.aliases().resolve(m).to_string())
            .collect();
        let dispatcher = Dispatcher::new(transport, config.retry.clone());

        Self {
            config: Arc::new(config),
            normalizer: Arc::new(normalizer),
            dispatcher,
            fallback_models,
        }
    }

    fn fallback_plan(&self, requested: &str) -> FallbackPlan {
        FallbackPlan::for_request(
            requested,
            self.normalizer.default_model(),
            &self.fallback_models,
        )
    }
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/tester", get(tester))
        .route(
            "/v1/chat/completions",
            get(chat_completions_hint).post(chat_completions),
        )
        .route(
            "/chat/completions",
            get(chat_completions_hint).post(chat_completions),
        )
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn root() -> Json<Value> {
    Json(json!({
        "ok": true,
        "endpoint": "chat/completions",
        "hint": CHAT_COMPLETIONS_HINT,
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "code": health_code() }))
}

fn health_code() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("ok-{suffix}")
}

async fn tester() -> Html<&'static str> {
    Html(include_str!("../static/tester.html"))
}

async fn chat_completions_hint() -> Json<Value> {
    Json(json!({
        "ok": true,
        "path": "/v1/chat/completions",
        "hint": CHAT_COMPLETIONS_HINT,
    }))
}

async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    if state.config.api_key.is_none() {
        return openai_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "upstream API key (OPENROUTER_KEY) is not configured on the server",
            None,
            Some("missing_api_key"),
        );
    }

    let body = match body {
        Ok(body) => body,
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            return openai_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "request body too large",
                None,
                Some("request_too_large"),
            );
        }
        Err(_) => {
            return openai_error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "failed to read request body",
                None,
                Some("invalid_body"),
            );
        }
    };

    // Unparseable bodies normalize like an empty payload.
    let raw = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
    let mut request = state.normalizer.normalize(raw);
    let plan = state.fallback_plan(&request.model);

    tracing::debug!(
        model = %request.model,
        messages = request.messages.len(),
        candidates_total = plan.len(),
        "relaying chat completion"
    );

    match state.dispatcher.dispatch(&mut request, &plan).await {
        Ok(upstream) => relay_response(upstream),
        Err(err) => dispatch_error_response(&err),
    }
}

fn relay_response(upstream: UpstreamResponse) -> Response {
    let mut resp = Response::new(Body::from(upstream.body));
    *resp.status_mut() = upstream.status;
    *resp.headers_mut() = upstream.headers;

    let headers = resp.headers_mut();
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    if let Ok(value) = HeaderValue::from_str(&upstream.model) {
        headers.insert(SELECTED_MODEL_HEADER, value);
    }
    resp
}

fn dispatch_error_response(err: &DispatchError) -> Response {
    let status = err.status();
    let code = match status {
        StatusCode::NOT_FOUND => "no_available_model",
        StatusCode::GATEWAY_TIMEOUT => "upstream_timeout",
        StatusCode::BAD_GATEWAY => "upstream_unreachable",
        _ => "internal_error",
    };
    tracing::warn!(upstream_status = status.as_u16(), error = %err, "relay failed");

    let body = OpenAiErrorResponse {
        error: OpenAiError {
            message: err.to_string(),
            error_type: "server_error".to_string(),
            param: Some("model".to_string()),
            code: Some(code.to_string()),
        },
        last_upstream_error: err.last_upstream_error(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upstream_error: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn openai_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    param: Option<&str>,
    code: Option<&str>,
) -> Response {
    let body = OpenAiErrorResponse {
        error: OpenAiError {
            message: message.to_string(),
            error_type: error_type.to_string(),
            param: param.map(ToString::to_string),
            code: code.map(ToString::to_string),
        },
        last_upstream_error: None,
    };
    (status, Json(body)).into_response()
}
