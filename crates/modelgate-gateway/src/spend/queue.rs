use redis::AsyncCommands;
use thiserror::Error;

use crate::kv::Kv;

use super::record::{encode_record, SpendCodecError, UsageRecord};

pub const QUEUE_KEY: &str = "spend:queue";
pub const LOCK_KEY: &str = "spend:lock";
pub const LOCK_TTL_MS: u64 = 30_000;
pub const MAX_BATCH: i64 = 500;

#[derive(Debug, Error)]
pub enum SpendQueueError {
    #[error("kv error: {0}")]
    Kv(#[from] redis::RedisError),
    #[error(transparent)]
    Codec(#[from] SpendCodecError),
}

/// Durable FIFO of encoded usage records in the KV store. Producers LPUSH from the
/// request path; the single leased worker RPOPs batches.
#[derive(Clone)]
pub struct SpendQueue {
    kv: Kv,
}

impl SpendQueue {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub async fn enqueue(&self, record: &UsageRecord) -> Result<(), SpendQueueError> {
        let encoded = encode_record(record)?;
        let mut conn = self.kv.connection().await?;
        let _: i64 = conn.lpush(QUEUE_KEY, encoded).await?;
        Ok(())
    }

    /// `SET spend:lock locked PX 30000 NX` — true when this replica is the writer
    /// for the tick.
    pub async fn acquire_lease(&self) -> Result<bool, SpendQueueError> {
        let mut conn = self.kv.connection().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(LOCK_KEY)
            .arg("locked")
            .arg("PX")
            .arg(LOCK_TTL_MS)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn release_lease(&self) -> Result<(), SpendQueueError> {
        let mut conn = self.kv.connection().await?;
        let _: i64 = conn.del(LOCK_KEY).await?;
        Ok(())
    }

    /// Pops up to `min(MAX_BATCH, len)` records in one pipelined round trip.
    pub async fn pop_batch(&self) -> Result<Vec<String>, SpendQueueError> {
        let mut conn = self.kv.connection().await?;
        let len: i64 = conn.llen(QUEUE_KEY).await?;
        let take = len.min(MAX_BATCH);
        if take <= 0 {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for _ in 0..take {
            pipe.rpop(QUEUE_KEY, None);
        }
        let popped: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(popped.into_iter().flatten().collect())
    }
}
