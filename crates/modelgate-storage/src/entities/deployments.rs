use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One upstream endpoint serving a model. `config` holds the provider connection
/// settings; sensitive values are stored under `encrypted_`-prefixed keys and
/// decrypted by the resolver before use.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "deployments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub model_id: i64,
    pub provider_name: String,
    pub deployment_name: String,
    pub config: Json,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    pub active: bool,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "model_id", to = "id")]
    pub parent_model: HasOne<super::models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
