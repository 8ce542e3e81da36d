use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tracing::{info, warn};

use crate::context::Deployment;

/// Caller-facing API function; decides both the logical endpoint label and the
/// default upstream path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFunction {
    ChatCompletions,
    Completions,
    Embeddings,
    Messages,
}

impl ApiFunction {
    pub fn endpoint(&self) -> &'static str {
        match self {
            ApiFunction::ChatCompletions => "/v1/chat/completions",
            ApiFunction::Completions => "/v1/completions",
            ApiFunction::Embeddings => "/v1/embeddings",
            ApiFunction::Messages => "/v1/messages",
        }
    }

    pub fn upstream_path(&self) -> &'static str {
        match self {
            ApiFunction::ChatCompletions => "/chat/completions",
            ApiFunction::Completions => "/completions",
            ApiFunction::Embeddings => "/embeddings",
            ApiFunction::Messages => "/messages",
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            ApiFunction::ChatCompletions => "chat.completions",
            ApiFunction::Completions => "completions",
            ApiFunction::Embeddings => "embeddings",
            ApiFunction::Messages => "messages",
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub enum UpstreamResponse {
    Json {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream {
        status: StatusCode,
        headers: HeaderMap,
        stream: BoxStream<'static, Result<Bytes, io::Error>>,
    },
}

/// Opens the single upstream HTTP call for a request. The client carries the
/// configured total-duration timeout; cancellation propagates by dropping the
/// returned stream.
#[derive(Clone)]
pub struct ProxyEngine {
    client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub async fn post(
        &self,
        deployment: &Deployment,
        path: &str,
        op: &'static str,
        body: Bytes,
        is_stream: bool,
        trace_id: &str,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = join_url(deployment.config.base_url(), path);
        let mut request = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", deployment.config.api_key()))
            .header(CONTENT_TYPE, "application/json");
        if let Some(version) = deployment.config.anthropic_version() {
            request = request.header("anthropic-version", version);
        }

        let started_at = Instant::now();
        info!(
            event = "upstream_request",
            trace_id,
            provider = %deployment.provider,
            op,
            method = "POST",
            path,
            model = %deployment.deployment_name,
            is_stream
        );
        let response = request.body(body).send().await.map_err(|err| {
            warn!(
                event = "upstream_response",
                trace_id,
                provider = %deployment.provider,
                op,
                status = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err
            );
            UpstreamError::Http(err)
        })?;
        info!(
            event = "upstream_response",
            trace_id,
            provider = %deployment.provider,
            op,
            status = response.status().as_u16(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            is_stream
        );
        Ok(split_response(response, is_stream).await?)
    }

    pub async fn get(
        &self,
        deployment: &Deployment,
        path: &str,
        op: &'static str,
        query: Option<&str>,
        trace_id: &str,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut url = join_url(deployment.config.base_url(), path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        let started_at = Instant::now();
        info!(
            event = "upstream_request",
            trace_id,
            provider = %deployment.provider,
            op,
            method = "GET",
            path
        );
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", deployment.config.api_key()))
            .send()
            .await
            .map_err(|err| {
                warn!(
                    event = "upstream_response",
                    trace_id,
                    provider = %deployment.provider,
                    op,
                    status = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err
                );
                UpstreamError::Http(err)
            })?;
        info!(
            event = "upstream_response",
            trace_id,
            provider = %deployment.provider,
            op,
            status = response.status().as_u16(),
            elapsed_ms = started_at.elapsed().as_millis() as u64
        );
        Ok(split_response(response, false).await?)
    }
}

async fn split_response(
    response: reqwest::Response,
    is_stream: bool,
) -> Result<UpstreamResponse, reqwest::Error> {
    let status = response.status();
    let headers = response.headers().clone();
    if is_stream && status.is_success() {
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string())))
            .boxed();
        Ok(UpstreamResponse::Stream {
            status,
            headers,
            stream,
        })
    } else {
        let body = response.bytes().await?;
        Ok(UpstreamResponse::Json {
            status,
            headers,
            body,
        })
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_paths() {
        assert_eq!(ApiFunction::ChatCompletions.upstream_path(), "/chat/completions");
        assert_eq!(ApiFunction::Messages.upstream_path(), "/messages");
        assert_eq!(ApiFunction::Embeddings.endpoint(), "/v1/embeddings");
    }

    #[test]
    fn join_url_handles_trailing_slash() {
        assert_eq!(
            join_url("https://openrouter.ai/api/v1/", "/chat/completions"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://openrouter.ai/api/v1", "/chat/completions"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }
}
