use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::{unfold, BoxStream, Stream};
use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde_json::{json, Value};
use tracing::error;

use modelgate_protocol::anthropic::messages::CreateMessageRequest;
use modelgate_protocol::openai::chat::{ChatCompletionChunk, CreateChatCompletionResponse};
use modelgate_protocol::sse::SseParser;
use modelgate_transform::messages::anthropic2openai;
use modelgate_transform::messages::openai2anthropic;
use modelgate_transform::messages::openai2anthropic::stream::{
    encode_event, OpenAiToAnthropicStreamState,
};

use crate::admission;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::ratelimit::RateDecision;
use crate::router::GatewayState;
use crate::upstream::{ApiFunction, UpstreamResponse};
use crate::usage::{
    now_millis, tee_usage, usage_from_json, SseUsageScanner, UsageDialect, UsageMeta, UsageSink,
};

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_openai(state, ApiFunction::ChatCompletions, headers, body).await
}

pub async fn completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_openai(state, ApiFunction::Completions, headers, body).await
}

pub async fn embeddings(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_openai(state, ApiFunction::Embeddings, headers, body).await
}

pub async fn messages(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started_at = Instant::now();
    let trace_id = trace_id(&headers);
    let ctx = match admission::admit(
        &state.storage,
        &state.resolver,
        &state.free_models,
        &Method::POST,
        ApiFunction::Messages.endpoint(),
        None,
        &headers,
        &body,
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let rate = match check_rate(&state, &ctx).await {
        Ok(rate) => rate,
        Err(err) => return err.into_response(),
    };

    let mut response = if ctx.deployment.is_messages_native() {
        run_passthrough(
            &state,
            &ctx,
            ApiFunction::Messages,
            UsageDialect::Anthropic,
            body,
            started_at,
            &trace_id,
        )
        .await
    } else {
        run_bridged(&state, &ctx, body, started_at, &trace_id).await
    };
    apply_rate_headers(&mut response, rate.as_ref());
    response
}

pub async fn list_models(State(state): State<Arc<GatewayState>>) -> Response {
    models_response(state.storage.list_models(None).await)
}

pub async fn list_models_by_provider(
    State(state): State<Arc<GatewayState>>,
    Path(provider): Path<String>,
) -> Response {
    models_response(state.storage.list_models(Some(&provider)).await)
}

pub async fn attestation_report(
    State(state): State<Arc<GatewayState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    dispatch_public(
        state,
        "/v1/attestation/report",
        "/attestation/report".to_string(),
        "attestation.report",
        query,
        headers,
    )
    .await
}

pub async fn signature(
    State(state): State<Arc<GatewayState>>,
    Path(rest): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    dispatch_public(
        state,
        &format!("/v1/signature/{rest}"),
        format!("/signature/{rest}"),
        "signature",
        query,
        headers,
    )
    .await
}

async fn dispatch_openai(
    state: Arc<GatewayState>,
    function: ApiFunction,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started_at = Instant::now();
    let trace_id = trace_id(&headers);
    let ctx = match admission::admit(
        &state.storage,
        &state.resolver,
        &state.free_models,
        &Method::POST,
        function.endpoint(),
        None,
        &headers,
        &body,
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let rate = match check_rate(&state, &ctx).await {
        Ok(rate) => rate,
        Err(err) => return err.into_response(),
    };
    let mut response = run_passthrough(
        &state,
        &ctx,
        function,
        UsageDialect::OpenAi,
        body,
        started_at,
        &trace_id,
    )
    .await;
    apply_rate_headers(&mut response, rate.as_ref());
    response
}

async fn dispatch_public(
    state: Arc<GatewayState>,
    caller_path: &str,
    upstream_path: String,
    op: &'static str,
    query: Option<String>,
    headers: HeaderMap,
) -> Response {
    let trace_id = trace_id(&headers);
    let ctx = match admission::admit(
        &state.storage,
        &state.resolver,
        &state.free_models,
        &Method::GET,
        caller_path,
        query.as_deref(),
        &headers,
        &Bytes::new(),
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let upstream = match state
        .engine
        .get(&ctx.deployment, &upstream_path, op, query.as_deref(), &trace_id)
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            error!(trace_id, error = %err, "public proxy failed");
            return GatewayError::internal().into_response();
        }
    };
    match upstream {
        UpstreamResponse::Json {
            status,
            headers,
            body,
        } => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().extend(headers);
            response
        }
        UpstreamResponse::Stream {
            status,
            headers,
            stream,
        } => stream_response(status, headers, Body::from_stream(stream)),
    }
}

/// Proxy the body verbatim and tee the response through the usage extractor.
async fn run_passthrough(
    state: &GatewayState,
    ctx: &RequestContext,
    function: ApiFunction,
    dialect: UsageDialect,
    body: Bytes,
    started_at: Instant,
    trace_id: &str,
) -> Response {
    let is_stream = body_requests_stream(&body);
    let upstream = match state
        .engine
        .post(
            &ctx.deployment,
            function.upstream_path(),
            function.op(),
            body,
            is_stream,
            trace_id,
        )
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            error!(trace_id, error = %err, "upstream call failed");
            return GatewayError::internal().into_response();
        }
    };
    match upstream {
        UpstreamResponse::Json {
            status,
            headers,
            body,
        } => {
            if let Some(sink) = usage_sink(state, ctx, function, status.as_u16(), started_at) {
                sink.complete(usage_from_json(dialect, &body)).await;
            }
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().extend(headers);
            response
        }
        UpstreamResponse::Stream {
            status,
            headers,
            stream,
        } => {
            let sink = usage_sink(state, ctx, function, status.as_u16(), started_at);
            let teed = tee_usage(stream, dialect, sink);
            stream_response(status, headers, Body::from_stream(teed))
        }
    }
}

/// `/v1/messages` against an OpenAI-dialect upstream: transform the request, call
/// `/chat/completions`, translate the response back (unary or streamed).
async fn run_bridged(
    state: &GatewayState,
    ctx: &RequestContext,
    body: Bytes,
    started_at: Instant,
    trace_id: &str,
) -> Response {
    let request: CreateMessageRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return GatewayError::bad_request("Invalid request body").into_response(),
    };
    let is_stream = request.stream.unwrap_or(false);
    let openai_request = anthropic2openai::request::transform_request(request);
    let upstream_body = match serde_json::to_vec(&openai_request) {
        Ok(encoded) => Bytes::from(encoded),
        Err(err) => {
            error!(trace_id, error = %err, "bridge request encoding failed");
            return GatewayError::internal().into_response();
        }
    };
    let upstream = match state
        .engine
        .post(
            &ctx.deployment,
            ApiFunction::ChatCompletions.upstream_path(),
            "messages.bridge",
            upstream_body,
            is_stream,
            trace_id,
        )
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            error!(trace_id, error = %err, "upstream call failed");
            return GatewayError::internal().into_response();
        }
    };

    match upstream {
        UpstreamResponse::Json {
            status,
            headers,
            body,
        } if !status.is_success() => {
            let rewrapped =
                openai2anthropic::response::transform_error(&body, &ctx.deployment.provider);
            json_response(status, headers, serde_json::to_vec(&rewrapped).unwrap_or_default())
        }
        UpstreamResponse::Json {
            status,
            headers,
            body,
        } => {
            let parsed: CreateChatCompletionResponse = match serde_json::from_slice(&body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    error!(trace_id, error = %err, "bridge response decoding failed");
                    return GatewayError::internal().into_response();
                }
            };
            if let Some(sink) =
                usage_sink(state, ctx, ApiFunction::Messages, status.as_u16(), started_at)
            {
                sink.complete(usage_from_json(UsageDialect::OpenAi, &body)).await;
            }
            let translated = openai2anthropic::response::transform_response(parsed);
            json_response(
                status,
                headers,
                serde_json::to_vec(&translated).unwrap_or_default(),
            )
        }
        UpstreamResponse::Stream {
            status,
            headers,
            stream,
        } => {
            let sink = usage_sink(state, ctx, ApiFunction::Messages, status.as_u16(), started_at);
            let bridged = bridge_stream(stream, sink);
            stream_response(status, headers, Body::from_stream(bridged))
        }
    }
}

struct BridgeState {
    upstream: BoxStream<'static, Result<Bytes, io::Error>>,
    parser: SseParser,
    bridge: OpenAiToAnthropicStreamState,
    scanner: SseUsageScanner,
    sink: Option<UsageSink>,
    pending: VecDeque<Bytes>,
    upstream_done: bool,
}

impl BridgeState {
    fn handle_data(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            for event in self.bridge.finish() {
                self.pending.push_back(encode_event(&event));
            }
            return;
        }
        // Malformed chunk JSON is skipped.
        if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) {
            for event in self.bridge.transform_chunk(chunk) {
                self.pending.push_back(encode_event(&event));
            }
        }
    }
}

/// Translates the upstream OpenAI SSE stream into Anthropic events on the fly.
/// Usage is harvested from the upstream chunks (the translated events carry no
/// prompt counts) and enqueued at stream flush. EOF without `[DONE]` still emits
/// the closing event sequence.
fn bridge_stream(
    upstream: BoxStream<'static, Result<Bytes, io::Error>>,
    sink: Option<UsageSink>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    unfold(
        BridgeState {
            upstream,
            parser: SseParser::new(),
            bridge: OpenAiToAnthropicStreamState::new(),
            scanner: SseUsageScanner::new(UsageDialect::OpenAi),
            sink,
            pending: VecDeque::new(),
            upstream_done: false,
        },
        |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.upstream_done {
                    let usage = state.scanner.finish();
                    if let Some(sink) = state.sink.take() {
                        sink.complete(usage).await;
                    }
                    return None;
                }
                match state.upstream.next().await {
                    Some(Ok(bytes)) => {
                        state.scanner.push(&bytes);
                        let events = state.parser.push_bytes(&bytes);
                        for event in events {
                            state.handle_data(&event.data);
                        }
                    }
                    Some(Err(err)) => return Some((Err(err), state)),
                    None => {
                        let events = state.parser.finish();
                        for event in events {
                            state.handle_data(&event.data);
                        }
                        for event in state.bridge.finish() {
                            state.pending.push_back(encode_event(&event));
                        }
                        state.upstream_done = true;
                    }
                }
            }
        },
    )
}

async fn check_rate(
    state: &GatewayState,
    ctx: &RequestContext,
) -> Result<Option<RateDecision>, GatewayError> {
    let Some(account) = &ctx.account else {
        return Ok(None);
    };
    if ctx.key.is_none() || account.tier == "ENTERPRISE" {
        return Ok(None);
    }
    let limit = account
        .rate_limit_rpm
        .map(i64::from)
        .unwrap_or_else(|| state.limiter.default_rpm());
    let decision = state.limiter.check_and_increment(account.id, limit).await;
    if decision.allowed {
        Ok(Some(decision))
    } else {
        Err(GatewayError::rate_limited(&decision, now_millis() / 1000))
    }
}

fn usage_sink(
    state: &GatewayState,
    ctx: &RequestContext,
    function: ApiFunction,
    status: u16,
    started_at: Instant,
) -> Option<UsageSink> {
    // No key, nothing to charge: anonymous and public traffic is not metered.
    ctx.key.as_ref()?;
    Some(UsageSink::new(
        state.queue.clone(),
        UsageMeta {
            endpoint: function.endpoint(),
            status,
            started_at,
            account_id: ctx.account_id(),
            key_id: ctx.key_id(),
            deployment_id: ctx.deployment.id,
            provider: ctx.deployment.provider.clone(),
            model: ctx.requested_model.clone(),
            input_cost_per_token: ctx.deployment.input_cost_per_token,
            output_cost_per_token: ctx.deployment.output_cost_per_token,
            spend_mode: ctx.spend_mode,
        },
    ))
}

fn models_response(result: Result<Vec<modelgate_storage::ModelListing>, sea_orm::DbErr>) -> Response {
    match result {
        Ok(rows) => {
            let data: Vec<Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.model,
                        "object": "model",
                        "created": row.created_at.unix_timestamp(),
                        "owned_by": row.provider_name.clone().unwrap_or_else(|| "system".to_string()),
                        "name": row.name,
                    })
                })
                .collect();
            Json(json!({ "object": "list", "data": data })).into_response()
        }
        Err(err) => {
            error!(error = %err, "model listing failed");
            GatewayError::internal().into_response()
        }
    }
}

fn json_response(status: StatusCode, mut headers: HeaderMap, body: Vec<u8>) -> Response {
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().extend(headers);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn stream_response(status: StatusCode, mut headers: HeaderMap, body: Body) -> Response {
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().extend(headers);
    if !response.headers().contains_key(CONTENT_TYPE) {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    }
    response
}

fn apply_rate_headers(response: &mut Response, rate: Option<&RateDecision>) {
    let Some(rate) = rate else {
        return;
    };
    for (name, value) in [
        ("x-ratelimit-limit", rate.limit),
        ("x-ratelimit-remaining", rate.remaining),
        ("x-ratelimit-reset", rate.reset_at),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            response.headers_mut().insert(name, value);
        }
    }
}

fn body_requests_stream(body: &Bytes) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

fn trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .or_else(|| headers.get("request-id"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", REQUEST_SEQ.fetch_add(1, Ordering::Relaxed)))
}
