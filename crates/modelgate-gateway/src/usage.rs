use std::io;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::{unfold, BoxStream, Stream};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;

use modelgate_protocol::sse::SseParser;

use crate::context::SpendMode;
use crate::spend::{SpendQueue, UsageRecord};

/// Which wire dialect the response body speaks, for usage harvesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDialect {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Parses `.usage` out of a completed unary JSON body.
pub fn usage_from_json(dialect: UsageDialect, body: &[u8]) -> Option<TokenUsage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let mut scanner = FieldScanner::default();
    scanner.scan(dialect, &value);
    scanner.finish()
}

/// Incremental usage harvester for SSE bodies. Every chunk passes through the
/// caller untouched; this only observes. Policy is last-wins per field: providers
/// may emit `usage` on every delta and only the final value is authoritative.
pub struct SseUsageScanner {
    dialect: UsageDialect,
    parser: SseParser,
    fields: FieldScanner,
}

impl SseUsageScanner {
    pub fn new(dialect: UsageDialect) -> Self {
        Self {
            dialect,
            parser: SseParser::new(),
            fields: FieldScanner::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let events = self.parser.push_bytes(chunk);
        for event in events {
            self.scan_data(&event.data);
        }
    }

    pub fn finish(&mut self) -> Option<TokenUsage> {
        let events = self.parser.finish();
        for event in events {
            self.scan_data(&event.data);
        }
        self.fields.finish()
    }

    fn scan_data(&mut self, data: &str) {
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        // Non-JSON lines are skipped, not errors.
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        self.fields.scan(self.dialect, &value);
    }
}

#[derive(Debug, Default)]
struct FieldScanner {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
}

impl FieldScanner {
    fn scan(&mut self, dialect: UsageDialect, value: &Value) {
        let usage = match dialect {
            UsageDialect::OpenAi => value.get("usage"),
            // Anthropic puts usage at the root for unary bodies and message_delta
            // events, and under `message` for message_start.
            UsageDialect::Anthropic => value
                .get("usage")
                .or_else(|| value.get("message").and_then(|message| message.get("usage"))),
        };
        let Some(usage) = usage else {
            return;
        };
        let (input_field, output_field) = match dialect {
            UsageDialect::OpenAi => ("prompt_tokens", "completion_tokens"),
            UsageDialect::Anthropic => ("input_tokens", "output_tokens"),
        };
        if let Some(input) = usage.get(input_field).and_then(Value::as_i64) {
            self.input_tokens = Some(input);
        }
        if let Some(output) = usage.get(output_field).and_then(Value::as_i64) {
            self.output_tokens = Some(output);
        }
    }

    fn finish(&self) -> Option<TokenUsage> {
        if self.input_tokens.is_none() && self.output_tokens.is_none() {
            return None;
        }
        Some(TokenUsage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
        })
    }
}

/// Per-request facts needed to turn harvested token counts into a usage record.
#[derive(Debug, Clone)]
pub struct UsageMeta {
    pub endpoint: &'static str,
    pub status: u16,
    pub started_at: Instant,
    pub account_id: Option<i64>,
    pub key_id: Option<i64>,
    pub deployment_id: i64,
    pub provider: String,
    pub model: String,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    pub spend_mode: SpendMode,
}

/// Fire-and-forget bridge from a finished response to the spend queue. Enqueue
/// failures and aborts are logged and swallowed; they never fail the request.
pub struct UsageSink {
    queue: SpendQueue,
    meta: UsageMeta,
}

impl UsageSink {
    pub fn new(queue: SpendQueue, meta: UsageMeta) -> Self {
        Self { queue, meta }
    }

    pub async fn complete(self, usage: Option<TokenUsage>) {
        let Some(usage) = usage else {
            return;
        };
        let record = UsageRecord {
            timestamp_ms: now_millis(),
            endpoint: self.meta.endpoint.to_string(),
            status: self.meta.status,
            duration_ms: self.meta.started_at.elapsed().as_millis() as i64,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            account_id: self.meta.account_id,
            key_id: self.meta.key_id,
            deployment_id: self.meta.deployment_id,
            provider: self.meta.provider,
            model: self.meta.model,
            input_cost_per_token: self.meta.input_cost_per_token,
            output_cost_per_token: self.meta.output_cost_per_token,
            spend_mode: self.meta.spend_mode,
        };
        if let Err(err) = self.queue.enqueue(&record).await {
            warn!(error = %err, "usage enqueue failed, dropping record");
        }
    }
}

struct TeeState {
    upstream: BoxStream<'static, Result<Bytes, io::Error>>,
    scanner: SseUsageScanner,
    sink: Option<UsageSink>,
}

/// Passes every chunk through unchanged while harvesting usage; on upstream EOF the
/// record is enqueued before the final flush reaches the caller. Dropping the
/// stream mid-flight (client disconnect) abandons the in-flight state.
pub fn tee_usage(
    upstream: BoxStream<'static, Result<Bytes, io::Error>>,
    dialect: UsageDialect,
    sink: Option<UsageSink>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    unfold(
        TeeState {
            upstream,
            scanner: SseUsageScanner::new(dialect),
            sink,
        },
        |mut state| async move {
            match state.upstream.next().await {
                Some(Ok(bytes)) => {
                    state.scanner.push(&bytes);
                    Some((Ok(bytes), state))
                }
                Some(Err(err)) => Some((Err(err), state)),
                None => {
                    let usage = state.scanner.finish();
                    if let Some(sink) = state.sink.take() {
                        sink.complete(usage).await;
                    }
                    None
                }
            }
        },
    )
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}
