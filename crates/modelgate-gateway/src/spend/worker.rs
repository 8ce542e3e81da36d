use std::collections::BTreeMap;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use modelgate_storage::{AnalyticsError, SettlementWriter, SpendLog, SpendRow};

use crate::context::SpendMode;

use super::queue::{SpendQueue, SpendQueueError};
use super::record::{decode_record, UsageRecord};

#[derive(Debug, Error)]
enum DrainError {
    #[error(transparent)]
    Queue(#[from] SpendQueueError),
    #[error("settlement failed: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
}

/// Aggregated outcome of one batch: summed deltas per account and key, plus the
/// analytical rows. Per-record ordering inside an account is irrelevant because
/// addition is commutative.
#[derive(Debug, Default)]
pub(crate) struct SettlementBatch {
    pub account_costs: BTreeMap<i64, Decimal>,
    pub key_costs: BTreeMap<i64, Decimal>,
    pub rows: Vec<SpendRow>,
}

/// Drains the spend queue on a timer, under the distributed lease. Whichever
/// replica wins the lease is the sole writer for that tick; everyone else skips.
pub struct SpendWorker {
    queue: SpendQueue,
    settlement: SettlementWriter,
    spend_log: SpendLog,
    interval: Duration,
}

impl SpendWorker {
    pub fn new(
        queue: SpendQueue,
        settlement: SettlementWriter,
        spend_log: SpendLog,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            settlement,
            spend_log,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // One last drain on the way out, still gated by the lease.
        self.tick().await;
        info!("spend worker stopped");
    }

    async fn tick(&self) {
        match self.queue.acquire_lease().await {
            Ok(true) => {}
            // Another replica is the writer this tick.
            Ok(false) => return,
            Err(err) => {
                warn!(error = %err, "spend lease unavailable");
                return;
            }
        }
        if let Err(err) = self.drain().await {
            error!(error = %err, "spend batch failed");
        }
        // Release is unconditional, even after errors.
        if let Err(err) = self.queue.release_lease().await {
            warn!(error = %err, "spend lease release failed");
        }
    }

    async fn drain(&self) -> Result<(), DrainError> {
        let raw = self.queue.pop_batch().await?;
        if raw.is_empty() {
            return Ok(());
        }
        let mut records = Vec::with_capacity(raw.len());
        for encoded in &raw {
            match decode_record(encoded) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "dropping undecodable spend record"),
            }
        }
        let batch = aggregate(&records);

        let settle = async {
            self.settlement
                .update_account_budgets(&batch.account_costs)
                .await?;
            self.settlement.update_key_budgets(&batch.key_costs).await?;
            Ok::<(), sea_orm::DbErr>(())
        };
        let insert = self.spend_log.insert_rows(&batch.rows);
        let (settled, inserted) = tokio::join!(settle, insert);
        settled?;
        inserted?;

        debug!(
            records = records.len(),
            accounts = batch.account_costs.len(),
            keys = batch.key_costs.len(),
            "spend batch settled"
        );
        Ok(())
    }
}

/// Folds decoded records into summed per-account and per-key costs. Zero-cost
/// records are discarded before any output. Subscription-mode records charge only
/// the key budget; regular and overflow records charge both.
pub(crate) fn aggregate(records: &[UsageRecord]) -> SettlementBatch {
    let mut batch = SettlementBatch::default();
    for record in records {
        let cost = record.cost();
        if cost.is_zero() {
            continue;
        }
        if record.spend_mode != SpendMode::Subscription {
            if let Some(account_id) = record.account_id {
                *batch.account_costs.entry(account_id).or_default() += cost;
            }
        }
        if let Some(key_id) = record.key_id {
            *batch.key_costs.entry(key_id).or_default() += cost;
        }
        batch.rows.push(SpendRow {
            timestamp: record.timestamp_ms,
            endpoint: record.endpoint.clone(),
            duration_ms: record.duration_ms,
            account_id: record.account_id.unwrap_or_default(),
            key_id: record.key_id.unwrap_or_default(),
            provider: record.provider.clone(),
            model: record.model.clone(),
            deployment_id: record.deployment_id,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            input_cost_per_token: record.input_cost_per_token,
            output_cost_per_token: record.output_cost_per_token,
        });
    }
    batch
}
