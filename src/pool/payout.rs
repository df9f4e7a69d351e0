//! Fee and payout arithmetic for settling one asset of a pool.
//!
//! All amounts are integer base units. Each payout is floored independently
//! so the sum of payouts never exceeds the distributable amount; the
//! difference (dust) is reported back to the caller.

use primitive_types::U256;
use serde::Serialize;

use crate::error::PoolError;
use crate::pool::models::Address;

/// Protocol fee charged on interest: 3%
pub const PROTOCOL_FEE_BPS: u128 = 300;

pub const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettlementAmounts {
    pub total: u128,
    pub principal: u128,
    pub interest: u128,
    pub fee: u128,
    pub distributable: u128,
}

/// Derive interest, fee and distributable from what came back out of custody
pub fn compute_settlement(total: u128, principal: u128, fee_bps: u128) -> SettlementAmounts {
    let interest = total.saturating_sub(principal);
    // interest * bps cannot overflow for any realistic supply; fall back to
    // dividing first if it does, which only loses sub-unit precision
    let fee = interest
        .checked_mul(fee_bps)
        .map(|v| v / BPS_DENOMINATOR)
        .unwrap_or_else(|| interest / BPS_DENOMINATOR * fee_bps);

    SettlementAmounts {
        total,
        principal,
        interest,
        fee,
        distributable: total - fee,
    }
}

/// A member's stake in the settled asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberShare {
    pub member: Address,
    pub payout_address: Address,
    pub contribution: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutLine {
    pub member: Address,
    pub payout_address: Address,
    pub contribution: u128,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutAllocation {
    pub payouts: Vec<PayoutLine>,
    /// distributable minus the sum of payouts
    pub dust: u128,
}

/// Split `distributable` pro rata over `shares`, keeping their order.
/// Members with zero contribution are skipped.
pub fn allocate_payouts(
    distributable: u128,
    shares: &[MemberShare],
) -> Result<PayoutAllocation, PoolError> {
    let total_contributions = shares
        .iter()
        .try_fold(0u128, |acc, s| acc.checked_add(s.contribution))
        .ok_or(PoolError::Overflow)?;

    if total_contributions == 0 {
        return Ok(PayoutAllocation {
            payouts: Vec::new(),
            dust: distributable,
        });
    }

    let mut payouts = Vec::with_capacity(shares.len());
    let mut paid = 0u128;

    for share in shares.iter().filter(|s| s.contribution > 0) {
        let amount = mul_div_floor(distributable, share.contribution, total_contributions)?;
        paid += amount;
        payouts.push(PayoutLine {
            member: share.member.clone(),
            payout_address: share.payout_address.clone(),
            contribution: share.contribution,
            amount,
        });
    }

    Ok(PayoutAllocation {
        payouts,
        dust: distributable - paid,
    })
}

/// floor(a * b / denominator) with a 256-bit intermediate product
fn mul_div_floor(a: u128, b: u128, denominator: u128) -> Result<u128, PoolError> {
    if denominator == 0 {
        return Err(PoolError::Overflow);
    }
    if let Some(product) = a.checked_mul(b) {
        return Ok(product / denominator);
    }
    let quotient = U256::from(a)
        .checked_mul(U256::from(b))
        .ok_or(PoolError::Overflow)?
        / U256::from(denominator);
    if quotient.bits() > 128 {
        return Err(PoolError::Overflow);
    }
    Ok(quotient.low_u128())
}
