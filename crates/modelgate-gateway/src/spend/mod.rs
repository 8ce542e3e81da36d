pub mod queue;
pub mod record;
pub mod worker;

pub use queue::{SpendQueue, SpendQueueError};
pub use record::{decode_record, encode_record, UsageRecord};
pub use worker::SpendWorker;
