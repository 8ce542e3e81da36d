use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub key_name: String,
    pub key_alias: Option<String>,
    #[sea_orm(unique)]
    pub api_key_hash: String,
    pub account_id: i64,
    pub active: bool,
    pub budget_limit: Option<Decimal>,
    pub budget_used: Decimal,
    pub rate_limit_rpm: Option<i32>,
    pub rate_limit_tpm: Option<i32>,
    pub metadata: Json,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "account_id", to = "id")]
    pub account: HasOne<super::accounts::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
