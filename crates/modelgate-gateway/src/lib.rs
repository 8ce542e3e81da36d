pub mod admission;
pub mod context;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod kv;
pub mod ratelimit;
pub mod resolver;
pub mod router;
pub mod spend;
pub mod upstream;
pub mod usage;

pub use context::{Deployment, ProviderConfig, RequestContext, SpendMode};
pub use crypto::ConfigCipher;
pub use error::GatewayError;
pub use kv::{Kv, KvConfig};
pub use ratelimit::{RateDecision, RateLimiter};
pub use resolver::DeploymentResolver;
pub use router::{router, GatewayState};
pub use spend::{SpendQueue, SpendWorker, UsageRecord};
pub use upstream::{ApiFunction, ProxyEngine};
