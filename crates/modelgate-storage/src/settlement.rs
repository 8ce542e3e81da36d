use std::collections::BTreeMap;

use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement, Value};
use tracing::debug;

/// Batched applier of aggregated costs. The spend worker is the only caller, and the
/// only writer of `budget_used` and `credits` anywhere in the system.
#[derive(Clone)]
pub struct SettlementWriter {
    db: DatabaseConnection,
    credit_multiplier: Decimal,
}

impl SettlementWriter {
    pub fn new(db: DatabaseConnection, credit_multiplier: Decimal) -> Self {
        Self {
            db,
            credit_multiplier,
        }
    }

    /// Adds each cost to the account's `budget_used` and burns credits at the
    /// configured multiplier, in one multi-row UPDATE.
    pub async fn update_account_budgets(
        &self,
        costs: &BTreeMap<i64, Decimal>,
    ) -> Result<(), DbErr> {
        if costs.is_empty() {
            return Ok(());
        }
        let (rows, mut values) = values_clause(costs, 2);
        let sql = format!(
            "UPDATE accounts AS a \
             SET budget_used = a.budget_used + v.cost, \
                 credits = a.credits - v.cost * $1 \
             FROM (VALUES {rows}) AS v(id, cost) \
             WHERE a.id = v.id"
        );
        let mut params: Vec<Value> = vec![self.credit_multiplier.into()];
        params.append(&mut values);
        let result = self
            .db
            .execute_raw(Statement::from_sql_and_values(DbBackend::Postgres, sql, params))
            .await?;
        debug!(accounts = result.rows_affected(), "account budgets settled");
        Ok(())
    }

    pub async fn update_key_budgets(&self, costs: &BTreeMap<i64, Decimal>) -> Result<(), DbErr> {
        if costs.is_empty() {
            return Ok(());
        }
        let (rows, values) = values_clause(costs, 1);
        let sql = format!(
            "UPDATE api_keys AS k \
             SET budget_used = k.budget_used + v.cost \
             FROM (VALUES {rows}) AS v(id, cost) \
             WHERE k.id = v.id"
        );
        let result = self
            .db
            .execute_raw(Statement::from_sql_and_values(DbBackend::Postgres, sql, values))
            .await?;
        debug!(keys = result.rows_affected(), "key budgets settled");
        Ok(())
    }
}

fn values_clause(costs: &BTreeMap<i64, Decimal>, first_param: usize) -> (String, Vec<Value>) {
    let mut rows = Vec::with_capacity(costs.len());
    let mut values: Vec<Value> = Vec::with_capacity(costs.len() * 2);
    let mut param = first_param;
    for (id, cost) in costs {
        rows.push(format!("(${}::bigint, ${}::numeric)", param, param + 1));
        param += 2;
        values.push((*id).into());
        values.push((*cost).into());
    }
    (rows.join(", "), values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_clause_numbers_placeholders() {
        let mut costs = BTreeMap::new();
        costs.insert(7, Decimal::new(3, 1));
        costs.insert(9, Decimal::new(5, 1));
        let (rows, values) = values_clause(&costs, 2);
        assert_eq!(rows, "($2::bigint, $3::numeric), ($4::bigint, $5::numeric)");
        assert_eq!(values.len(), 4);
    }
}
