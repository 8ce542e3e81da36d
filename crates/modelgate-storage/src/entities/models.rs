use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub model_id: String,
    pub name: String,
    pub description: Option<String>,
    pub specs: Json,
    pub active: bool,
    pub created_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub deployments: HasMany<super::deployments::Entity>,
    #[sea_orm(has_many)]
    pub aliases: HasMany<super::model_aliases::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
