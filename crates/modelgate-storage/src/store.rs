use sea_orm::entity::prelude::*;
use sea_orm::{Database, DatabaseConnection, DbBackend, DbErr, FromQueryResult, Schema, Statement};

use crate::entities;

/// An API key resolved by hash together with its owning account.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub key: entities::api_keys::Model,
    pub account: entities::accounts::Model,
}

/// Flat row produced by the deployment resolution join. `config` still carries
/// `encrypted_`-prefixed values at this point.
#[derive(Debug, Clone, FromQueryResult)]
pub struct DeploymentRow {
    pub id: i64,
    pub model: String,
    pub provider_name: String,
    pub deployment_name: String,
    pub config: serde_json::Value,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct ModelListing {
    pub model: String,
    pub name: String,
    pub provider_name: Option<String>,
    pub created_at: time::OffsetDateTime,
}

#[derive(Clone)]
pub struct GatewayStorage {
    db: DatabaseConnection,
}

impl GatewayStorage {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        let db = Database::connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Accounts)
            .register(entities::ApiKeys)
            .register(entities::Models)
            .register(entities::Deployments)
            .register(entities::ModelAliases)
            .sync(&self.db)
            .await
    }

    pub async fn close(self) -> Result<(), DbErr> {
        self.db.close().await
    }

    pub async fn find_key_by_hash(&self, hash: &str) -> Result<Option<ResolvedKey>, DbErr> {
        let Some(key) = entities::ApiKeys::find()
            .filter(entities::api_keys::Column::ApiKeyHash.eq(hash))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let Some(account) = entities::Accounts::find_by_id(key.account_id)
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(ResolvedKey { key, account }))
    }

    /// Resolves a deployment by canonical model id or alias. One query over the
    /// deployments, models, and aliases relations; every row must be active.
    pub async fn resolve_deployment(&self, model: &str) -> Result<Option<DeploymentRow>, DbErr> {
        DeploymentRow::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT d.id, m.model_id AS model, d.provider_name, d.deployment_name,
                   d.config, d.input_cost_per_token, d.output_cost_per_token
            FROM deployments d
            INNER JOIN models m ON m.id = d.model_id
            LEFT JOIN model_aliases a ON a.model_id = m.id AND a.active = TRUE
            WHERE d.active = TRUE
              AND m.active = TRUE
              AND (m.model_id = $1 OR a.alias = $1)
            LIMIT 1
            "#,
            [model.into()],
        ))
        .one(&self.db)
        .await
    }

    pub async fn list_models(&self, provider: Option<&str>) -> Result<Vec<ModelListing>, DbErr> {
        let statement = match provider {
            Some(provider) => Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"
                SELECT DISTINCT m.model_id AS model, m.name, d.provider_name, m.created_at
                FROM models m
                INNER JOIN deployments d ON d.model_id = m.id AND d.active = TRUE
                WHERE m.active = TRUE AND d.provider_name = $1
                ORDER BY m.model_id
                "#,
                [provider.into()],
            ),
            None => Statement::from_string(
                DbBackend::Postgres,
                r#"
                SELECT m.model_id AS model, m.name, NULL::text AS provider_name, m.created_at
                FROM models m
                WHERE m.active = TRUE
                ORDER BY m.model_id
                "#,
            ),
        };
        ModelListing::find_by_statement(statement).all(&self.db).await
    }
}
