//! Outbound HTTP call to the chat completion upstream.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use reqwest::Client;

use crate::config::AppConfig;

/// Upstream response headers forwarded to the caller; everything else is dropped.
pub const FORWARDED_RESPONSE_HEADERS: [&str; 5] = [
    "content-type",
    "x-request-id",
    "x-openai-model",
    "openrouter-processing-ms",
    "openrouter-cache-status",
];

/// A fully buffered upstream response.
#[derive(Clone, Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Request(err) => err.is_timeout(),
        }
    }
}

/// Sends one serialized chat completion request upstream.
///
/// Implementations must bound the call in time and buffer the whole body.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, body: Bytes) -> Result<UpstreamReply, TransportError>;
}

pub struct HttpTransport {
    client: Client,
    url: String,
    api_key: String,
    timeout: Duration,
    extra_headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &AppConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(config.upstream_timeout)
            .build()
            .expect("failed to build reqwest client");

        let mut extra_headers = HeaderMap::new();
        insert_optional_header(&mut extra_headers, "http-referer", &config.http_referer);
        insert_optional_header(&mut extra_headers, "x-title", &config.app_title);

        Self {
            client,
            url: upstream_chat_completions_url(config),
            api_key: config.api_key.clone().unwrap_or_default(),
            timeout: config.upstream_timeout,
            extra_headers,
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, body: Bytes) -> Result<UpstreamReply, TransportError> {
        let req = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .headers(self.extra_headers.clone())
            .body(body);

        let call = async {
            let resp = req.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            Ok::<_, TransportError>(UpstreamReply {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

pub fn upstream_chat_completions_url(config: &AppConfig) -> String {
    format!(
        "{}/v1/chat/completions",
        config.upstream_base_url.trim_end_matches('/')
    )
}

fn insert_optional_header(headers: &mut HeaderMap, name: &'static str, value: &Option<String>) {
    let Some(value) = value.as_deref() else {
        return;
    };
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => tracing::warn!(header = name, "ignoring invalid attribution header value"),
    }
}

/// Keeps only the headers listed in [`FORWARDED_RESPONSE_HEADERS`].
pub fn forwarded_response_headers(from: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in FORWARDED_RESPONSE_HEADERS {
        for value in from.get_all(name) {
            out.append(HeaderName::from_static(name), value.clone());
        }
    }
    out
}
