use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use modelgate_storage::entities::{accounts, api_keys};

/// Which budget counters and credit pools a settled request affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendMode {
    Regular,
    Subscription,
    SubscriptionOverflow,
}

/// Immutable snapshot of the upstream selected for a model. Cached in the KV store
/// with the config already decrypted into its typed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub model: String,
    pub provider: String,
    pub deployment_name: String,
    pub config: ProviderConfig,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
}

impl Deployment {
    /// Whether the upstream speaks Anthropic Messages natively; everything else gets
    /// the dialect bridge on `/v1/messages`.
    pub fn is_messages_native(&self) -> bool {
        matches!(self.config, ProviderConfig::Anthropic { .. })
    }

    /// Confidential-enclave providers; POST bodies to these get a request hash for
    /// the downstream signature endpoints.
    pub fn is_confidential(&self) -> bool {
        matches!(self.config, ProviderConfig::Phala { .. })
    }
}

/// Deployment connection config, tagged by provider family. Fields the family does
/// not model are preserved in the `Other` fallback for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ProviderConfig {
    Anthropic {
        base_url: String,
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Phala {
        base_url: String,
        api_key: String,
    },
    OpenAiCompat {
        base_url: String,
        api_key: String,
    },
    Other {
        base_url: String,
        api_key: String,
        #[serde(default)]
        extra: Map<String, Value>,
    },
}

impl ProviderConfig {
    pub fn from_fields(provider: &str, mut fields: Map<String, Value>) -> Self {
        let base_url = take_string(&mut fields, "base_url");
        let api_key = take_string(&mut fields, "api_key");
        if provider.contains("anthropic") {
            let version = fields
                .remove("version")
                .and_then(|value| value.as_str().map(str::to_string));
            ProviderConfig::Anthropic {
                base_url,
                api_key,
                version,
            }
        } else if provider.starts_with("phala") {
            ProviderConfig::Phala { base_url, api_key }
        } else if fields.is_empty() {
            ProviderConfig::OpenAiCompat { base_url, api_key }
        } else {
            ProviderConfig::Other {
                base_url,
                api_key,
                extra: fields,
            }
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            ProviderConfig::Anthropic { base_url, .. }
            | ProviderConfig::Phala { base_url, .. }
            | ProviderConfig::OpenAiCompat { base_url, .. }
            | ProviderConfig::Other { base_url, .. } => base_url,
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            ProviderConfig::Anthropic { api_key, .. }
            | ProviderConfig::Phala { api_key, .. }
            | ProviderConfig::OpenAiCompat { api_key, .. }
            | ProviderConfig::Other { api_key, .. } => api_key,
        }
    }

    pub fn anthropic_version(&self) -> Option<&str> {
        match self {
            ProviderConfig::Anthropic { version, .. } => version.as_deref(),
            _ => None,
        }
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> String {
    match fields.remove(key) {
        Some(Value::String(value)) => value,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Everything admission resolved for one request. Owns the account and key rows for
/// the request's lifetime; dropped when the response completes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub account: Option<accounts::Model>,
    pub key: Option<api_keys::Model>,
    pub deployment: Deployment,
    pub requested_model: String,
    pub spend_mode: SpendMode,
    pub request_hash: Option<String>,
}

impl RequestContext {
    pub fn account_id(&self) -> Option<i64> {
        self.account.as_ref().map(|account| account.id)
    }

    pub fn key_id(&self) -> Option<i64> {
        self.key.as_ref().map(|key| key.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn anthropic_family_is_messages_native() {
        let config = ProviderConfig::from_fields(
            "anthropic",
            fields(json!({"base_url": "https://api.anthropic.com/v1", "api_key": "sk", "version": "2023-06-01"})),
        );
        assert!(matches!(config, ProviderConfig::Anthropic { .. }));
        assert_eq!(config.anthropic_version(), Some("2023-06-01"));
    }

    #[test]
    fn phala_family_is_confidential() {
        let config = ProviderConfig::from_fields(
            "phala-vllm",
            fields(json!({"base_url": "https://enclave.example/v1", "api_key": "pk"})),
        );
        assert!(matches!(config, ProviderConfig::Phala { .. }));
    }

    #[test]
    fn unknown_fields_survive_in_fallback() {
        let config = ProviderConfig::from_fields(
            "openrouter",
            fields(json!({"base_url": "https://openrouter.ai/api/v1", "api_key": "or", "region": "eu"})),
        );
        let ProviderConfig::Other { extra, .. } = &config else {
            panic!("expected fallback config");
        };
        assert_eq!(extra["region"], "eu");
        assert_eq!(config.base_url(), "https://openrouter.ai/api/v1");
    }

    #[test]
    fn bare_openai_compat_config() {
        let config = ProviderConfig::from_fields(
            "openrouter",
            fields(json!({"base_url": "https://openrouter.ai/api/v1", "api_key": "or"})),
        );
        assert!(matches!(config, ProviderConfig::OpenAiCompat { .. }));
    }
}
