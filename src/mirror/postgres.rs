use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::mirror::{
    AppendOutcome, MirrorStore, PayoutRecord, PoolRecord, SettlementRecord, YieldWithdrawalRecord,
};
use crate::pool::models::{Address, AssetId};

fn to_numeric(value: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::Internal(format!("Decimal conversion error: {}", e)))
}

fn from_numeric(row: &PgRow, column: &str) -> AppResult<Decimal> {
    let value: BigDecimal = row.try_get(column)?;
    parse_numeric(&value)
}

fn parse_numeric(value: &BigDecimal) -> AppResult<Decimal> {
    Ok(Decimal::from_str(&value.to_string())?)
}

fn outcome(rows_affected: u64) -> AppendOutcome {
    if rows_affected == 0 {
        AppendOutcome::Duplicate
    } else {
        AppendOutcome::Inserted
    }
}

/// Mirror store on PostgreSQL; uniqueness enforced by table constraints
pub struct PgMirrorStore {
    pub pool: PgPool,
}

impl PgMirrorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool_from_row(row: &PgRow) -> AppResult<PoolRecord> {
        Ok(PoolRecord {
            address: Address::new(row.try_get::<String, _>("address")?),
            name: row.try_get("name")?,
            owner: Address::new(row.try_get::<String, _>("owner")?),
            lock_period: row.try_get("lock_period")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn settlement_from_row(row: &PgRow) -> AppResult<SettlementRecord> {
        Ok(SettlementRecord {
            id: row.try_get("id")?,
            pool: Address::new(row.try_get::<String, _>("pool_address")?),
            asset: AssetId::new(row.try_get::<String, _>("asset")?),
            total: from_numeric(row, "total")?,
            principal: from_numeric(row, "principal")?,
            interest: from_numeric(row, "interest")?,
            fee: from_numeric(row, "fee")?,
            distributable: from_numeric(row, "distributable")?,
            payouts: Vec::new(),
            tx_hash: row.try_get("tx_hash")?,
            block_number: row.try_get("block_number")?,
            settled_at: row.try_get("settled_at")?,
        })
    }

    fn payout_from_row(row: &PgRow) -> AppResult<(Uuid, PayoutRecord)> {
        Ok((
            row.try_get("settlement_id")?,
            PayoutRecord {
                member: Address::new(row.try_get::<String, _>("member")?),
                amount: from_numeric(row, "amount")?,
                contribution: from_numeric(row, "contribution")?,
                paid_at: row.try_get("paid_at")?,
            },
        ))
    }

    /// Attach payouts to settlements loaded for one pool
    async fn with_payouts(
        &self,
        pool: &Address,
        mut settlements: Vec<SettlementRecord>,
    ) -> AppResult<Vec<SettlementRecord>> {
        if settlements.is_empty() {
            return Ok(settlements);
        }

        let rows = sqlx::query(
            r#"
            SELECT p.settlement_id, p.member, p.amount, p.contribution, p.paid_at
            FROM settlement_payouts p
            JOIN settlements s ON s.id = p.settlement_id
            WHERE s.pool_address = $1
            ORDER BY p.seq
            "#,
        )
        .bind(pool.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<PayoutRecord>> = HashMap::new();
        for row in &rows {
            let (settlement_id, payout) = Self::payout_from_row(row)?;
            grouped.entry(settlement_id).or_default().push(payout);
        }
        for settlement in settlements.iter_mut() {
            if let Some(payouts) = grouped.remove(&settlement.id) {
                settlement.payouts = payouts;
            }
        }
        Ok(settlements)
    }
}

#[async_trait]
impl MirrorStore for PgMirrorStore {
    async fn upsert_pool(&self, pool: PoolRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pools (address, name, owner, lock_period, is_active, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (address) DO UPDATE
            SET name = EXCLUDED.name,
                owner = EXCLUDED.owner,
                lock_period = EXCLUDED.lock_period,
                is_active = EXCLUDED.is_active,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(pool.address.as_str())
        .bind(&pool.name)
        .bind(pool.owner.as_str())
        .bind(pool.lock_period)
        .bind(pool.is_active)
        .bind(pool.created_at)
        .bind(pool.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_pool(&self, address: &Address) -> AppResult<Option<PoolRecord>> {
        let row = sqlx::query(
            r#"
            SELECT address, name, owner, lock_period, is_active, created_at, completed_at
            FROM pools
            WHERE address = $1
            "#,
        )
        .bind(address.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::pool_from_row).transpose()
    }

    async fn list_active_pools(&self) -> AppResult<Vec<PoolRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT address, name, owner, lock_period, is_active, created_at, completed_at
            FROM pools
            WHERE is_active
            ORDER BY created_at, address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::pool_from_row).collect()
    }

    async fn mark_pool_inactive(&self, address: &Address, completed_at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pools
            SET is_active = FALSE, completed_at = $2
            WHERE address = $1 AND is_active
            "#,
        )
        .bind(address.as_str())
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_settlement(&self, record: SettlementRecord) -> AppResult<AppendOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO settlements
                (id, pool_address, asset, total, principal, interest, fee, distributable,
                 tx_hash, block_number, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (pool_address, asset, tx_hash) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.pool.as_str())
        .bind(record.asset.as_str())
        .bind(to_numeric(record.total)?)
        .bind(to_numeric(record.principal)?)
        .bind(to_numeric(record.interest)?)
        .bind(to_numeric(record.fee)?)
        .bind(to_numeric(record.distributable)?)
        .bind(&record.tx_hash)
        .bind(record.block_number)
        .bind(record.settled_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            debug!("Settlement {} for {} already mirrored", record.tx_hash, record.pool);
            return Ok(AppendOutcome::Duplicate);
        }

        for payout in &record.payouts {
            sqlx::query(
                r#"
                INSERT INTO settlement_payouts (settlement_id, member, amount, contribution, paid_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (settlement_id, member) DO NOTHING
                "#,
            )
            .bind(record.id)
            .bind(payout.member.as_str())
            .bind(to_numeric(payout.amount)?)
            .bind(to_numeric(payout.contribution)?)
            .bind(payout.paid_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(AppendOutcome::Inserted)
    }

    async fn latest_settlement(&self, pool: &Address) -> AppResult<Option<SettlementRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, pool_address, asset, total, principal, interest, fee, distributable,
                   tx_hash, block_number, settled_at
            FROM settlements
            WHERE pool_address = $1
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(pool.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut settlement = Self::settlement_from_row(&row)?;

        let payout_rows = sqlx::query(
            r#"
            SELECT settlement_id, member, amount, contribution, paid_at
            FROM settlement_payouts
            WHERE settlement_id = $1
            ORDER BY seq
            "#,
        )
        .bind(settlement.id)
        .fetch_all(&self.pool)
        .await?;

        settlement.payouts = payout_rows
            .iter()
            .map(|row| Self::payout_from_row(row).map(|(_, payout)| payout))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Some(settlement))
    }

    async fn append_payout(&self, settlement_id: Uuid, payout: PayoutRecord) -> AppResult<AppendOutcome> {
        let exists = sqlx::query("SELECT 1 FROM settlements WHERE id = $1")
            .bind(settlement_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound(format!("Settlement {} not found", settlement_id)));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO settlement_payouts (settlement_id, member, amount, contribution, paid_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (settlement_id, member) DO NOTHING
            "#,
        )
        .bind(settlement_id)
        .bind(payout.member.as_str())
        .bind(to_numeric(payout.amount)?)
        .bind(to_numeric(payout.contribution)?)
        .bind(payout.paid_at)
        .execute(&self.pool)
        .await?;

        Ok(outcome(result.rows_affected()))
    }

    async fn record_yield_withdrawal(&self, record: YieldWithdrawalRecord) -> AppResult<AppendOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO yield_withdrawals (pool_address, asset, amount, tx_hash, block_number)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (pool_address, tx_hash, asset) DO NOTHING
            "#,
        )
        .bind(record.pool.as_str())
        .bind(record.asset.as_str())
        .bind(to_numeric(record.amount)?)
        .bind(&record.tx_hash)
        .bind(record.block_number)
        .execute(&self.pool)
        .await?;

        Ok(outcome(result.rows_affected()))
    }

    async fn yield_withdrawals(&self, pool: &Address) -> AppResult<Vec<YieldWithdrawalRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT pool_address, asset, amount, tx_hash, block_number
            FROM yield_withdrawals
            WHERE pool_address = $1
            ORDER BY seq
            "#,
        )
        .bind(pool.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(YieldWithdrawalRecord {
                    pool: Address::new(row.try_get::<String, _>("pool_address")?),
                    asset: AssetId::new(row.try_get::<String, _>("asset")?),
                    amount: from_numeric(row, "amount")?,
                    tx_hash: row.try_get("tx_hash")?,
                    block_number: row.try_get("block_number")?,
                })
            })
            .collect()
    }

    async fn settlements_for_pool(&self, pool: &Address) -> AppResult<Vec<SettlementRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, pool_address, asset, total, principal, interest, fee, distributable,
                   tx_hash, block_number, settled_at
            FROM settlements
            WHERE pool_address = $1
            ORDER BY seq
            "#,
        )
        .bind(pool.as_str())
        .fetch_all(&self.pool)
        .await?;

        let settlements = rows
            .iter()
            .map(Self::settlement_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        self.with_payouts(pool, settlements).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_numeric_conversion_keeps_precision() {
        let value = dec!(2.038800000000000001);
        let numeric = to_numeric(value).unwrap();
        assert_eq!(numeric.to_string(), "2.038800000000000001");
        assert_eq!(parse_numeric(&numeric).unwrap(), value);
    }

    #[test]
    fn test_numeric_out_of_decimal_range_is_an_error() {
        let huge = BigDecimal::from_str(&format!("1{}", "0".repeat(40))).unwrap();
        assert!(matches!(parse_numeric(&huge), Err(AppError::Internal(_))));
    }

    #[test]
    fn test_rows_affected_maps_to_outcome() {
        assert_eq!(outcome(0), AppendOutcome::Duplicate);
        assert_eq!(outcome(1), AppendOutcome::Inserted);
    }
}
