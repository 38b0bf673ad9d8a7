use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

use crate::auth::{ApiKeyLocation, AuthMethod};
use crate::error::TransportError;

use super::request::ResolvedRequest;
use super::response::{HttpResponse, TimingBreakdown};

/// The HTTP transport capability. Implementations capture every outcome as
/// either a response or a [`TransportError`]; nothing panics or hangs past
/// the per-request timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ResolvedRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport over a shared `reqwest` client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ResolvedRequest) -> Result<HttpResponse, TransportError> {
        let method: reqwest::Method = request.method.into();
        let mut url =
            reqwest::Url::parse(&request.url).map_err(|source| TransportError::InvalidUrl {
                url: request.url.clone(),
                source,
            })?;

        if let AuthMethod::ApiKey {
            key,
            value,
            location: ApiKeyLocation::Query,
        } = &request.auth
        {
            let key = key.trim();
            if key.is_empty() {
                return Err(TransportError::InvalidAuth(
                    "API key name cannot be empty".to_string(),
                ));
            }
            url.query_pairs_mut().append_pair(key, value.trim());
        }

        let mut builder = self.client.request(method, url);
        builder = apply_headers(builder, &request.headers)?;
        builder = apply_auth(builder, &request.auth)?;
        if request.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(request.timeout_ms));
        }

        let body = request.body.trim();
        if !body.is_empty() {
            builder = builder.body(body.to_string());
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout(request.timeout_ms)
            } else {
                TransportError::Send(err.to_string())
            }
        })?;
        let headers_ms = elapsed_ms(started);

        let status = response.status();
        let headers = collect_headers(response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Body(err.to_string()))?;
        let total_ms = elapsed_ms(started);

        Ok(HttpResponse {
            status_code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers,
            size_bytes: bytes.len(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
            timing: TimingBreakdown {
                headers_ms,
                body_ms: total_ms.saturating_sub(headers_ms),
                total_ms,
            },
        })
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}

/// Parse one `key<sep>value` entry per line; blank lines are skipped.
pub fn parse_key_value_lines(
    input: &str,
    separator: char,
) -> Result<Vec<(String, String)>, TransportError> {
    let mut pairs = Vec::new();

    for line in input.lines() {
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let (key, value) = raw
            .split_once(separator)
            .ok_or_else(|| TransportError::InvalidParam(raw.to_string()))?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(TransportError::InvalidParam(raw.to_string()));
        }
        pairs.push((key.to_string(), value.to_string()));
    }

    Ok(pairs)
}

fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &str,
) -> Result<reqwest::RequestBuilder, TransportError> {
    for line in headers.lines() {
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let (key, value) = raw
            .split_once(':')
            .ok_or_else(|| TransportError::InvalidHeader {
                value: raw.to_string(),
                message: "expected `Key: Value`".to_string(),
            })?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(TransportError::InvalidHeader {
                value: raw.to_string(),
                message: "header key is empty".to_string(),
            });
        }

        let header_name =
            HeaderName::from_bytes(key.as_bytes()).map_err(|err| TransportError::InvalidHeader {
                value: raw.to_string(),
                message: err.to_string(),
            })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|err| TransportError::InvalidHeader {
                value: raw.to_string(),
                message: err.to_string(),
            })?;
        builder = builder.header(header_name, header_value);
    }

    Ok(builder)
}

fn apply_auth(
    mut builder: reqwest::RequestBuilder,
    auth: &AuthMethod,
) -> Result<reqwest::RequestBuilder, TransportError> {
    match auth {
        AuthMethod::None => {}
        AuthMethod::ApiKey {
            location: ApiKeyLocation::Query,
            ..
        } => {
            // Applied to the URL before the builder exists.
        }
        AuthMethod::BearerToken { token } => {
            let token = token.trim();
            if token.is_empty() {
                return Err(TransportError::InvalidAuth(
                    "Bearer token cannot be empty".to_string(),
                ));
            }
            builder = builder.bearer_auth(token);
        }
        AuthMethod::BasicAuth { username, password } => {
            let username = username.trim();
            if username.is_empty() {
                return Err(TransportError::InvalidAuth(
                    "Basic auth username cannot be empty".to_string(),
                ));
            }
            builder = builder.basic_auth(username, Some(password.trim()));
        }
        AuthMethod::ApiKey {
            key,
            value,
            location: ApiKeyLocation::Header,
        } => {
            let key = key.trim();
            if key.is_empty() {
                return Err(TransportError::InvalidAuth(
                    "API key name cannot be empty".to_string(),
                ));
            }

            let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| {
                TransportError::InvalidAuth(format!("Invalid API key header `{key}`: {err}"))
            })?;
            let header_value = HeaderValue::from_str(value.trim()).map_err(|err| {
                TransportError::InvalidAuth(format!("Invalid API key header value: {err}"))
            })?;
            builder = builder.header(header_name, header_value);
        }
    }

    Ok(builder)
}
