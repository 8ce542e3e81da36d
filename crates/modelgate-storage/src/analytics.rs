use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// ClickHouse connection settings, straight from the environment.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("clickhouse request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("clickhouse returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("row encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One settled usage row. Costs are materialized server-side from the token counts
/// and per-token rates.
#[derive(Debug, Clone, Serialize)]
pub struct SpendRow {
    pub timestamp: i64,
    pub endpoint: String,
    pub duration_ms: i64,
    pub account_id: i64,
    pub key_id: i64,
    pub provider: String,
    pub model: String,
    pub deployment_id: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub input_cost_per_token: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub output_cost_per_token: Decimal,
}

const SPEND_LOG_DDL: &str = "\
CREATE TABLE IF NOT EXISTS spend_log (
    timestamp DateTime64(3),
    endpoint String,
    duration_ms Int64,
    account_id Int64,
    key_id Int64,
    provider String,
    model String,
    deployment_id Int64,
    input_tokens Int64,
    output_tokens Int64,
    input_cost_per_token Decimal(20, 10),
    output_cost_per_token Decimal(20, 10),
    input_cost Decimal(28, 10) MATERIALIZED input_tokens * input_cost_per_token,
    output_cost Decimal(28, 10) MATERIALIZED output_tokens * output_cost_per_token,
    total_cost Decimal(28, 10) MATERIALIZED input_cost + output_cost
) ENGINE = MergeTree
PARTITION BY toYYYYMM(timestamp)
ORDER BY (account_id, key_id, timestamp)
TTL toDateTime(timestamp) + INTERVAL 1 YEAR";

/// Append-only writer for the analytical store, speaking the ClickHouse HTTP
/// interface in JSONEachRow format.
#[derive(Clone)]
pub struct SpendLog {
    client: reqwest::Client,
    config: AnalyticsConfig,
}

impl SpendLog {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), AnalyticsError> {
        self.execute(SPEND_LOG_DDL.to_string()).await?;
        info!(table = "spend_log", "analytics schema ready");
        Ok(())
    }

    pub async fn insert_rows(&self, rows: &[SpendRow]) -> Result<(), AnalyticsError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut body = String::with_capacity(rows.len() * 256);
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        self.query("INSERT INTO spend_log FORMAT JSONEachRow", body)
            .await
    }

    async fn execute(&self, sql: String) -> Result<(), AnalyticsError> {
        let response = self
            .client
            .post(&self.config.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[("database", self.config.database.as_str())])
            .body(sql)
            .send()
            .await?;
        check_status(response).await
    }

    async fn query(&self, sql: &str, body: String) -> Result<(), AnalyticsError> {
        let response = self
            .client
            .post(&self.config.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[
                ("database", self.config.database.as_str()),
                ("query", sql),
            ])
            .body(body)
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), AnalyticsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(AnalyticsError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_serialize_one_json_object_per_line() {
        let row = SpendRow {
            timestamp: 1_700_000_000_123,
            endpoint: "/v1/chat/completions".to_string(),
            duration_ms: 420,
            account_id: 1,
            key_id: 2,
            provider: "openrouter".to_string(),
            model: "openrouter/llama".to_string(),
            deployment_id: 3,
            input_tokens: 100,
            output_tokens: 50,
            input_cost_per_token: Decimal::new(1, 6),
            output_cost_per_token: Decimal::new(2, 6),
        };
        let encoded = serde_json::to_string(&row).unwrap();
        assert!(!encoded.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000_123i64);
        assert_eq!(value["input_tokens"], 100);
        // serde-float keeps the rate numeric for the Decimal column.
        assert!(value["input_cost_per_token"].is_f64());
    }
}
