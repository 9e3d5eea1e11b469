//! Retry and model-fallback state machine around the upstream call.
//!
//! The dispatcher walks a [`FallbackPlan`] one candidate at a time. Each candidate
//! gets a bounded number of attempts; every attempt's result is classified into an
//! [`UpstreamOutcome`] that decides whether to return, retry the same candidate, or
//! move on to the next one. Calls are strictly sequential.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use serde_json::{json, Value};

use crate::normalize::ChatRequest;
use crate::upstream::{
    forwarded_response_headers, TransportError, UpstreamReply, UpstreamTransport,
};

/// Lowercased body fragments that mark a 404 as "this model has no route".
const ROUTING_NOT_FOUND_MARKERS: [&str; 2] = ["no endpoints found", "not found"];

const TRANSIENT_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Ordered, de-duplicated model identifiers to try.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FallbackPlan {
    candidates: Vec<String>,
}

impl FallbackPlan {
    /// Builds a plan from raw candidates, dropping blanks and repeats while keeping
    /// first-seen order.
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let candidates = candidates
            .into_iter()
            .map(Into::into)
            .filter(|c: &String| !c.is_empty())
            .filter(|c| seen.insert(c.clone()))
            .collect();
        Self { candidates }
    }

    /// Requested model first, then the configured default, then the known-good list.
    pub fn for_request(requested: &str, default_model: &str, fallback_models: &[String]) -> Self {
        Self::new(
            [requested, default_model]
                .into_iter()
                .chain(fallback_models.iter().map(String::as_str)),
        )
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per candidate, including the first one.
    pub max_attempts: u32,
    /// Linear backoff unit: the pause after attempt `n` is `backoff_step * n`.
    pub backoff_step: Duration,
    /// Retry 429 on the same candidate before substituting another model.
    pub retry_rate_limited: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(600),
            retry_rate_limited: true,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Classification of a single upstream attempt.
#[derive(Debug)]
pub enum UpstreamOutcome {
    Success(UpstreamReply),
    RoutingNotFound { body: Value },
    Transient { status: StatusCode, body: Value },
    NetworkFailure(TransportError),
    TerminalError(UpstreamReply),
}

impl UpstreamOutcome {
    pub fn classify(result: Result<UpstreamReply, TransportError>) -> Self {
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => return Self::NetworkFailure(err),
        };

        let status = reply.status;
        if status.as_u16() < 400 {
            return Self::Success(reply);
        }

        if status == StatusCode::NOT_FOUND && is_routing_failure(&reply.body) {
            return Self::RoutingNotFound {
                body: error_body_json(&reply),
            };
        }

        if TRANSIENT_STATUSES.contains(&status) {
            return Self::Transient {
                status,
                body: error_body_json(&reply),
            };
        }

        Self::TerminalError(reply)
    }
}

fn is_routing_failure(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_lowercase();
    ROUTING_NOT_FOUND_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

/// Parses an upstream error body, wrapping non-JSON bodies in an OpenAI-style error.
fn error_body_json(reply: &UpstreamReply) -> Value {
    if let Ok(v) = serde_json::from_slice::<Value>(&reply.body) {
        return v;
    }
    let text = String::from_utf8_lossy(&reply.body);
    let message = match text.trim() {
        "" => format!("HTTP {}", reply.status.as_u16()),
        trimmed => trimmed.to_string(),
    };
    json!({ "error": { "message": message } })
}

/// Response handed back to the caller unchanged apart from header filtering.
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The candidate model that produced this response.
    pub model: String,
}

impl UpstreamResponse {
    fn new(reply: UpstreamReply, model: &str) -> Self {
        Self {
            status: reply.status,
            headers: forwarded_response_headers(&reply.headers),
            body: reply.body,
            model: model.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LastFailure {
    Upstream { status: StatusCode, body: Value },
    Network { timed_out: bool, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to serialize upstream request: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{}", exhausted_message(.candidates, .last_failure))]
    Exhausted {
        candidates: usize,
        last_failure: Option<LastFailure>,
    },
}

fn exhausted_message(candidates: &usize, last_failure: &Option<LastFailure>) -> String {
    match last_failure {
        Some(LastFailure::Network {
            timed_out: true, ..
        }) => format!("upstream timed out for every candidate model ({candidates} tried)"),
        Some(LastFailure::Network { .. }) => {
            format!("upstream unreachable for every candidate model ({candidates} tried)")
        }
        _ => format!("no available model satisfied the request ({candidates} tried)"),
    }
}

impl DispatchError {
    /// Status reported to the caller: 404 once every model was rejected, 502/504 when
    /// the final failure never reached the upstream.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Exhausted {
                last_failure: Some(LastFailure::Network { timed_out: true, .. }),
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            Self::Exhausted {
                last_failure: Some(LastFailure::Network { .. }),
                ..
            } => StatusCode::BAD_GATEWAY,
            Self::Exhausted { .. } => StatusCode::NOT_FOUND,
        }
    }

    /// The last upstream error body seen, if any.
    pub fn last_upstream_error(&self) -> Option<Value> {
        match self {
            Self::Exhausted {
                last_failure: Some(LastFailure::Upstream { body, .. }),
                ..
            } => Some(body.clone()),
            Self::Exhausted {
                last_failure: Some(LastFailure::Network { message, .. }),
                ..
            } => Some(json!({ "error": { "message": message } })),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn UpstreamTransport>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn UpstreamTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn dispatch(
        &self,
        request: &mut ChatRequest,
        plan: &FallbackPlan,
    ) -> Result<UpstreamResponse, DispatchError> {
        let candidates_total = plan.len();
        let max_attempts = self.policy.attempts();
        let mut last_failure = None;

        for (idx, candidate) in plan.candidates().iter().enumerate() {
            request.model = candidate.clone();
            let body = Bytes::from(serde_json::to_vec(request)?);

            for attempt in 1..=max_attempts {
                let outcome = UpstreamOutcome::classify(self.transport.send(body.clone()).await);

                let retryable = match outcome {
                    UpstreamOutcome::Success(reply) => {
                        tracing::info!(
                            model = %candidate,
                            candidate_idx = idx,
                            candidates_total,
                            attempt,
                            upstream_status = reply.status.as_u16(),
                            "upstream accepted request"
                        );
                        return Ok(UpstreamResponse::new(reply, candidate));
                    }
                    UpstreamOutcome::TerminalError(reply) => {
                        tracing::warn!(
                            model = %candidate,
                            candidate_idx = idx,
                            attempt,
                            upstream_status = reply.status.as_u16(),
                            "upstream rejected request; not retrying"
                        );
                        return Ok(UpstreamResponse::new(reply, candidate));
                    }
                    UpstreamOutcome::RoutingNotFound { body } => {
                        tracing::warn!(
                            model = %candidate,
                            candidate_idx = idx,
                            candidates_total,
                            reason = "routing_not_found",
                            "no upstream route for model"
                        );
                        last_failure = Some(LastFailure::Upstream {
                            status: StatusCode::NOT_FOUND,
                            body,
                        });
                        false
                    }
                    UpstreamOutcome::Transient { status, body } => {
                        tracing::warn!(
                            model = %candidate,
                            attempt,
                            upstream_status = status.as_u16(),
                            "transient upstream failure"
                        );
                        last_failure = Some(LastFailure::Upstream { status, body });
                        status != StatusCode::TOO_MANY_REQUESTS || self.policy.retry_rate_limited
                    }
                    UpstreamOutcome::NetworkFailure(err) => {
                        tracing::warn!(
                            model = %candidate,
                            attempt,
                            error = %err,
                            "upstream call failed"
                        );
                        last_failure = Some(LastFailure::Network {
                            timed_out: err.is_timeout(),
                            message: err.to_string(),
                        });
                        true
                    }
                };

                if !retryable || attempt == max_attempts {
                    break;
                }

                let delay = self.policy.backoff(attempt);
                tracing::warn!(
                    model = %candidate,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retryable upstream failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }

            if idx + 1 < candidates_total {
                tracing::warn!(
                    failed_model = %candidate,
                    candidate_idx = idx,
                    candidates_total,
                    "candidate exhausted; attempting failover"
                );
            }
        }

        Err(DispatchError::Exhausted {
            candidates: candidates_total,
            last_failure,
        })
    }
}
