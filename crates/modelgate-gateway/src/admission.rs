use bytes::Bytes;
use http::{HeaderMap, Method};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, error};

use modelgate_storage::entities::{accounts, api_keys};
use modelgate_storage::{GatewayStorage, ResolvedKey};

use crate::context::{Deployment, RequestContext, SpendMode};
use crate::crypto::sha256_hex;
use crate::error::GatewayError;
use crate::resolver::DeploymentResolver;

/// Builds the request context or a fail-fast error response, per the admission
/// contract: model extraction, caller classification, budget checks, deployment
/// resolution, and the confidential-provider request hash.
pub async fn admit(
    storage: &GatewayStorage,
    resolver: &DeploymentResolver,
    free_models: &[String],
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<RequestContext, GatewayError> {
    let model = extract_model(method, body, query)
        .ok_or_else(|| GatewayError::bad_request("Model parameter is required"))?;

    if is_public_path(path) {
        let deployment = resolve_deployment(resolver, &model).await?;
        return Ok(finish_context(
            None,
            None,
            deployment,
            model,
            SpendMode::Regular,
            method,
            body,
        ));
    }

    match bearer_token(headers) {
        Some(token) => {
            let hash = sha256_hex(token.as_bytes());
            let resolved = storage.find_key_by_hash(&hash).await.map_err(|err| {
                error!(error = %err, "key lookup failed");
                GatewayError::internal()
            })?;
            let Some(ResolvedKey { key, account }) = resolved else {
                return Err(GatewayError::unauthorized("Invalid API key provided"));
            };
            if !key.active {
                return Err(GatewayError::unauthorized("Invalid API key provided"));
            }
            let spend_mode = classify_spend(&key, &account)?;
            let deployment = resolve_deployment(resolver, &model).await?;
            let ctx = finish_context(
                Some(account),
                Some(key),
                deployment,
                model,
                spend_mode,
                method,
                body,
            );
            if let Some(hash) = &ctx.request_hash {
                debug!(request_hash = %hash, "confidential request hash recorded");
            }
            Ok(ctx)
        }
        None => {
            if !free_models.iter().any(|free| free == &model) {
                return Err(GatewayError::forbidden("This model requires an API key"));
            }
            let deployment = resolve_deployment(resolver, &model).await?;
            Ok(finish_context(
                None,
                None,
                deployment,
                model,
                SpendMode::Regular,
                method,
                body,
            ))
        }
    }
}

async fn resolve_deployment(
    resolver: &DeploymentResolver,
    model: &str,
) -> Result<Deployment, GatewayError> {
    match resolver.resolve(model).await {
        Ok(Some(deployment)) => Ok(deployment),
        Ok(None) => Err(GatewayError::not_found(&format!(
            "Model '{model}' is not available"
        ))),
        Err(err) => {
            error!(model, error = %err, "deployment resolution failed");
            Err(GatewayError::internal())
        }
    }
}

fn finish_context(
    account: Option<accounts::Model>,
    key: Option<api_keys::Model>,
    deployment: Deployment,
    requested_model: String,
    spend_mode: SpendMode,
    method: &Method,
    body: &Bytes,
) -> RequestContext {
    let request_hash = if deployment.is_confidential() && method == Method::POST {
        Some(sha256_hex(body))
    } else {
        None
    };
    RequestContext {
        account,
        key,
        deployment,
        requested_model,
        spend_mode,
        request_hash,
    }
}

/// Spend-mode classification and budget gates for an authenticated key.
pub(crate) fn classify_spend(
    key: &api_keys::Model,
    account: &accounts::Model,
) -> Result<SpendMode, GatewayError> {
    let is_subscription = key
        .metadata
        .get("type")
        .and_then(Value::as_str)
        .map(|kind| kind == "subscription")
        .unwrap_or(false);

    if is_subscription {
        let within_quota = match key.budget_limit {
            Some(limit) => key.budget_used < limit,
            None => true,
        };
        if within_quota {
            Ok(SpendMode::Subscription)
        } else if account.credits > Decimal::ZERO {
            Ok(SpendMode::SubscriptionOverflow)
        } else {
            Err(GatewayError::payment_required("Subscription quota exceeded"))
        }
    } else {
        if let Some(limit) = account.budget_limit {
            if account.budget_used >= limit {
                return Err(GatewayError::payment_required(
                    "Account quota exceeded. Please add credits to continue.",
                ));
            }
        }
        if let Some(limit) = key.budget_limit {
            if key.budget_used >= limit {
                return Err(GatewayError::payment_required("API key quota exceeded"));
            }
        }
        Ok(SpendMode::Regular)
    }
}

/// `model` from the JSON body on POST, from the query string otherwise.
pub(crate) fn extract_model(method: &Method, body: &Bytes, query: Option<&str>) -> Option<String> {
    if method == Method::POST {
        let value: Value = serde_json::from_slice(body).ok()?;
        value.get("model")?.as_str().map(str::to_string)
    } else {
        query_param(query?, "model")
    }
}

pub(crate) fn is_public_path(path: &str) -> bool {
    path.starts_with("/v1/attestation/report") || path.starts_with("/v1/signature/")
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use serde_json::json;
    use time::OffsetDateTime;

    fn account(budget_limit: Option<&str>, budget_used: &str, credits: &str) -> accounts::Model {
        accounts::Model {
            id: 1,
            username: "acme".to_string(),
            email: "ops@acme.test".to_string(),
            tier: "PRO".to_string(),
            budget_limit: budget_limit.map(|value| value.parse().unwrap()),
            budget_used: budget_used.parse().unwrap(),
            credits: credits.parse().unwrap(),
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn api_key(
        budget_limit: Option<&str>,
        budget_used: &str,
        metadata: serde_json::Value,
    ) -> api_keys::Model {
        api_keys::Model {
            id: 2,
            key_name: "sk-...abcd".to_string(),
            key_alias: None,
            api_key_hash: "deadbeef".to_string(),
            account_id: 1,
            active: true,
            budget_limit: budget_limit.map(|value| value.parse().unwrap()),
            budget_used: budget_used.parse().unwrap(),
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            metadata,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn regular_key_under_budget_is_regular() {
        let mode = classify_spend(
            &api_key(None, "0", json!({})),
            &account(Some("100"), "99.5", "1000000000"),
        )
        .unwrap();
        assert_eq!(mode, SpendMode::Regular);
    }

    #[test]
    fn account_at_budget_is_rejected() {
        let err = classify_spend(
            &api_key(None, "0", json!({})),
            &account(Some("100"), "100", "0"),
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::PAYMENT_REQUIRED);
        let value: Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(
            value["error"]["message"],
            "Account quota exceeded. Please add credits to continue."
        );
    }

    #[test]
    fn key_at_budget_is_rejected() {
        let err = classify_spend(
            &api_key(Some("10"), "10", json!({})),
            &account(None, "0", "0"),
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::PAYMENT_REQUIRED);
        let value: Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(value["error"]["message"], "API key quota exceeded");
    }

    #[test]
    fn subscription_key_within_quota() {
        let mode = classify_spend(
            &api_key(Some("20"), "5", json!({"type": "subscription"})),
            &account(None, "0", "0"),
        )
        .unwrap();
        assert_eq!(mode, SpendMode::Subscription);
    }

    #[test]
    fn exhausted_subscription_with_credits_overflows() {
        let mode = classify_spend(
            &api_key(Some("20"), "20", json!({"type": "subscription"})),
            &account(None, "0", "5"),
        )
        .unwrap();
        assert_eq!(mode, SpendMode::SubscriptionOverflow);
    }

    #[test]
    fn exhausted_subscription_without_credits_is_rejected() {
        let err = classify_spend(
            &api_key(Some("20"), "20", json!({"type": "subscription"})),
            &account(None, "0", "0"),
        )
        .unwrap_err();
        let value: Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(value["error"]["message"], "Subscription quota exceeded");
    }

    #[test]
    fn model_from_post_body() {
        let body = Bytes::from(r#"{"model":"gpt-x","messages":[]}"#);
        assert_eq!(
            extract_model(&Method::POST, &body, None).as_deref(),
            Some("gpt-x")
        );
    }

    #[test]
    fn model_from_query_on_get() {
        assert_eq!(
            extract_model(&Method::GET, &Bytes::new(), Some("model=qwen/qwen-2.5-7b-instruct")).as_deref(),
            Some("qwen/qwen-2.5-7b-instruct")
        );
    }

    #[test]
    fn missing_model_is_none() {
        assert_eq!(extract_model(&Method::POST, &Bytes::from("{}"), None), None);
        assert_eq!(extract_model(&Method::GET, &Bytes::new(), None), None);
        assert_eq!(
            extract_model(&Method::GET, &Bytes::new(), Some("other=1")),
            None
        );
    }

    #[test]
    fn public_paths() {
        assert!(is_public_path("/v1/attestation/report"));
        assert!(is_public_path("/v1/signature/0xabc"));
        assert!(!is_public_path("/v1/chat/completions"));
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer sk-test".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("sk-test"));
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
