use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::SpendMode;

/// One request's harvested usage, as it travels through the spend queue. The spend
/// mode rides along because the settlement writer routes budget updates by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp_ms: i64,
    pub endpoint: String,
    pub status: u16,
    pub duration_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub account_id: Option<i64>,
    pub key_id: Option<i64>,
    pub deployment_id: i64,
    pub provider: String,
    pub model: String,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    pub spend_mode: SpendMode,
}

impl UsageRecord {
    pub fn cost(&self) -> Decimal {
        Decimal::from(self.input_tokens) * self.input_cost_per_token
            + Decimal::from(self.output_tokens) * self.output_cost_per_token
    }
}

#[derive(Debug, Error)]
pub enum SpendCodecError {
    #[error("record encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("record decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("record is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// MessagePack, then base64 for the list value.
pub fn encode_record(record: &UsageRecord) -> Result<String, SpendCodecError> {
    let packed = rmp_serde::to_vec_named(record)?;
    Ok(B64.encode(packed))
}

pub fn decode_record(encoded: &str) -> Result<UsageRecord, SpendCodecError> {
    let packed = B64.decode(encoded)?;
    Ok(rmp_serde::from_slice(&packed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_record() -> UsageRecord {
        UsageRecord {
            timestamp_ms: 1_700_000_000_000,
            endpoint: "/v1/chat/completions".to_string(),
            status: 200,
            duration_ms: 812,
            input_tokens: 100,
            output_tokens: 50,
            account_id: Some(1),
            key_id: Some(2),
            deployment_id: 3,
            provider: "openrouter".to_string(),
            model: "openrouter/llama".to_string(),
            input_cost_per_token: Decimal::new(1, 6),
            output_cost_per_token: Decimal::new(4, 6),
            spend_mode: SpendMode::Regular,
        }
    }

    #[test]
    fn codec_round_trip() {
        let record = sample_record();
        let encoded = encode_record(&record).unwrap();
        assert_eq!(decode_record(&encoded).unwrap(), record);
    }

    #[test]
    fn cost_uses_decimal_arithmetic() {
        let record = sample_record();
        // 100 * 0.000001 + 50 * 0.000004 = 0.0003
        assert_eq!(record.cost(), Decimal::new(3, 4));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_record("not-base64!!").is_err());
        assert!(decode_record(&B64.encode(b"not msgpack records")).is_err());
    }
}
