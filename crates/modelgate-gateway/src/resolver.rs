use redis::AsyncCommands;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use modelgate_storage::{DeploymentRow, GatewayStorage};

use crate::context::{Deployment, ProviderConfig};
use crate::crypto::{ConfigCipher, CryptoError};
use crate::kv::Kv;

const POSITIVE_TTL_SECS: u64 = 24 * 60 * 60;
const NEGATIVE_TTL_SECS: u64 = 5 * 60;
const MISS_SENTINEL: &str = "__none__";
const INVALIDATE_PATTERNS: [&str; 3] = ["models:*", "embedding-models:*", "model-deployment:*"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("deployment config decryption failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Read-through cache from a model id or alias to its deployment snapshot.
///
/// Hits live for 24 h; misses are cached for 5 min under a sentinel so unknown-model
/// storms don't reach the SQL store. A KV outage falls through to SQL.
#[derive(Clone)]
pub struct DeploymentResolver {
    kv: Kv,
    storage: GatewayStorage,
    cipher: ConfigCipher,
}

impl DeploymentResolver {
    pub fn new(kv: Kv, storage: GatewayStorage, cipher: ConfigCipher) -> Self {
        Self {
            kv,
            storage,
            cipher,
        }
    }

    pub async fn resolve(&self, model: &str) -> Result<Option<Deployment>, ResolveError> {
        let cache_key = cache_key(model);
        match self.cache_get(&cache_key).await {
            Some(cached) if cached == MISS_SENTINEL => return Ok(None),
            Some(cached) => match serde_json::from_str::<Deployment>(&cached) {
                Ok(deployment) => return Ok(Some(deployment)),
                Err(err) => {
                    warn!(model, error = %err, "stale deployment cache entry, refetching");
                }
            },
            None => {}
        }

        let Some(row) = self.storage.resolve_deployment(model).await? else {
            self.cache_set(&cache_key, MISS_SENTINEL, NEGATIVE_TTL_SECS)
                .await;
            return Ok(None);
        };
        let deployment = self.decrypt_row(row)?;
        if let Ok(encoded) = serde_json::to_string(&deployment) {
            self.cache_set(&cache_key, &encoded, POSITIVE_TTL_SECS).await;
        }
        debug!(model, deployment = deployment.id, provider = %deployment.provider, "deployment resolved");
        Ok(Some(deployment))
    }

    /// Wildcard invalidation over every model-related cache namespace.
    pub async fn invalidate(&self) -> Result<u64, redis::RedisError> {
        let mut deleted = 0;
        for pattern in INVALIDATE_PATTERNS {
            deleted += self.kv.delete_pattern(pattern).await?;
        }
        Ok(deleted)
    }

    async fn cache_get(&self, key: &str) -> Option<String> {
        let mut conn = match self.kv.connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "deployment cache unavailable");
                return None;
            }
        };
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "deployment cache read failed");
                None
            }
        }
    }

    async fn cache_set(&self, key: &str, value: &str, ttl_secs: u64) {
        let mut conn = match self.kv.connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "deployment cache unavailable");
                return;
            }
        };
        if let Err(err) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!(error = %err, "deployment cache write failed");
        }
    }

    fn decrypt_row(&self, row: DeploymentRow) -> Result<Deployment, CryptoError> {
        let mut fields = match row.config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        decrypt_fields(&self.cipher, &mut fields)?;
        Ok(Deployment {
            id: row.id,
            model: row.model,
            provider: row.provider_name.clone(),
            deployment_name: row.deployment_name,
            config: ProviderConfig::from_fields(&row.provider_name, fields),
            input_cost_per_token: row.input_cost_per_token,
            output_cost_per_token: row.output_cost_per_token,
        })
    }
}

/// Replaces every `encrypted_<name>` entry with a decrypted `<name>` entry.
fn decrypt_fields(cipher: &ConfigCipher, fields: &mut Map<String, Value>) -> Result<(), CryptoError> {
    let encrypted: Vec<String> = fields
        .keys()
        .filter(|key| key.starts_with("encrypted_"))
        .cloned()
        .collect();
    for key in encrypted {
        let Some(value) = fields.remove(&key) else {
            continue;
        };
        let Value::String(wire) = value else {
            continue;
        };
        let plaintext = cipher.decrypt(&wire)?;
        let bare = key.trim_start_matches("encrypted_").to_string();
        fields.insert(bare, Value::String(plaintext));
    }
    Ok(())
}

fn cache_key(model: &str) -> String {
    format!("model-deployment:{model}")
}
