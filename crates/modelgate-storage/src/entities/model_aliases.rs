use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_aliases")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub model_id: i64,
    #[sea_orm(unique)]
    pub alias: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "model_id", to = "id")]
    pub parent_model: HasOne<super::models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
