pub mod analytics;
pub mod entities;
pub mod settlement;
pub mod store;

pub use analytics::{AnalyticsConfig, AnalyticsError, SpendLog, SpendRow};
pub use settlement::SettlementWriter;
pub use store::{DeploymentRow, GatewayStorage, ModelListing, ResolvedKey};
