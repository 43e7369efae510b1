//! Protocol constants and the derived schedules.
//!
//! The credit price and reward schedules are protocol constants; their values
//! are pinned by the unit tests below and must not be re-derived.

use crate::numbers::Amount;

/// One STR in base units.
pub const STR: u128 = 1_000_000_000;

/// Start of the ledger epoch (2020-01-01T00:00:00Z). Block timestamps below
/// this are invalid.
pub const EPOCH_TIMESTAMP: u64 = 1_577_836_800;

/// Allowed forward clock skew for incoming blocks, seconds.
pub const MAX_TIMESTAMP_DIFF: u64 = 300;

/// Transactions one credit buys per UTC day.
pub const TRANSACTIONS_PER_CREDIT: u32 = 20;

/// Upper bound of the credit field.
pub const MAX_ACCOUNT_CREDIT: u16 = u16::MAX;

/// Seconds per UTC day.
pub const DAY_SECONDS: u64 = 24 * 60 * 60;

/// Credit price halving interval: one quarter.
const PRICE_HALVING_SECONDS: u64 = 90 * DAY_SECONDS;

/// Floor of the credit price after all halvings.
const PRICE_FLOOR: u128 = 1_000_000;

/// Reward accrual granularity: whole days.
const REWARD_PERIOD: u64 = DAY_SECONDS;

/// Annual reward rate, numerator over denominator: 5 / 100 per 365 days.
const REWARD_RATE_NUM: u128 = 5;
const REWARD_RATE_DEN: u128 = 100 * 365;

/// Fork records allowed per credit, and the absolute cap.
const FORKS_PER_CREDIT: u32 = 16;
const MAX_FORKS: u32 = 256;

/// Chain bindings allowed per credit.
const BINDINGS_PER_CREDIT: u64 = 2;

/// Minimum weight for a representative's vote to be counted at all.
pub const QUALIFIED_REP_WEIGHT: Amount = Amount(4096 * STR);

/// True when both timestamps fall on the same UTC day.
pub fn same_day(a: u64, b: u64) -> bool {
    a / DAY_SECONDS == b / DAY_SECONDS
}

/// Price of one credit at the given timestamp: 1 STR at the epoch, halving
/// every quarter down to the floor.
pub fn credit_price(timestamp: u64) -> Amount {
    if timestamp < EPOCH_TIMESTAMP {
        return Amount(STR);
    }
    let halvings = (timestamp - EPOCH_TIMESTAMP) / PRICE_HALVING_SECONDS;
    if halvings >= 128 {
        return Amount(PRICE_FLOOR);
    }
    let price = STR >> halvings;
    Amount(price.max(PRICE_FLOOR))
}

/// Representative reward accrued by `balance` between two block timestamps,
/// truncated to whole reward periods. Zero when the interval spans no full
/// period or the timestamps are out of order.
pub fn reward_amount(balance: Amount, prev_timestamp: u64, succ_timestamp: u64) -> Amount {
    if succ_timestamp <= prev_timestamp {
        return Amount::ZERO;
    }
    let periods = ((succ_timestamp - prev_timestamp) / REWARD_PERIOD) as u128;
    if periods == 0 {
        return Amount::ZERO;
    }
    let amount = balance
        .0
        .checked_mul(periods * REWARD_RATE_NUM)
        .map(|x| x / REWARD_RATE_DEN)
        .unwrap_or_else(|| (balance.0 / REWARD_RATE_DEN).saturating_mul(periods * REWARD_RATE_NUM));
    Amount(amount)
}

/// Timestamp from which an accrued reward becomes claimable: the midpoint of
/// the whole-period interval the amount was computed over. Zero when nothing
/// accrued.
pub fn reward_timestamp(prev_timestamp: u64, succ_timestamp: u64) -> u64 {
    if succ_timestamp <= prev_timestamp {
        return 0;
    }
    let periods = (succ_timestamp - prev_timestamp) / REWARD_PERIOD;
    if periods == 0 {
        return 0;
    }
    prev_timestamp + periods * REWARD_PERIOD / 2
}

/// Fork records an account may accumulate before it is restricted.
pub fn max_allowed_forks(_timestamp: u64, credit: u16) -> u32 {
    (credit as u32 * FORKS_PER_CREDIT).min(MAX_FORKS)
}

/// Cross-chain bindings an account's credit level allows.
pub fn allowed_bindings(credit: u16) -> u64 {
    credit as u64 * BINDINGS_PER_CREDIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_boundaries() {
        assert!(same_day(EPOCH_TIMESTAMP, EPOCH_TIMESTAMP + DAY_SECONDS - 1));
        assert!(!same_day(EPOCH_TIMESTAMP, EPOCH_TIMESTAMP + DAY_SECONDS));
        assert!(same_day(1541128318, 1541128319));
    }

    #[test]
    fn credit_price_schedule() {
        assert_eq!(credit_price(EPOCH_TIMESTAMP), Amount(STR));
        assert_eq!(
            credit_price(EPOCH_TIMESTAMP + PRICE_HALVING_SECONDS - 1),
            Amount(STR)
        );
        assert_eq!(
            credit_price(EPOCH_TIMESTAMP + PRICE_HALVING_SECONDS),
            Amount(STR / 2)
        );
        assert_eq!(
            credit_price(EPOCH_TIMESTAMP + 3 * PRICE_HALVING_SECONDS),
            Amount(STR / 8)
        );
        // After enough halvings the price pins to the floor.
        assert_eq!(
            credit_price(EPOCH_TIMESTAMP + 64 * PRICE_HALVING_SECONDS),
            Amount(PRICE_FLOOR)
        );
        assert_eq!(credit_price(u64::MAX), Amount(PRICE_FLOOR));
        // Pre-epoch timestamps are rejected upstream; the price is defined
        // anyway so the function is total.
        assert_eq!(credit_price(0), Amount(STR));
    }

    #[test]
    fn reward_schedule() {
        let balance = Amount(365_000 * STR);
        // Less than a full period accrues nothing.
        assert_eq!(
            reward_amount(balance, EPOCH_TIMESTAMP, EPOCH_TIMESTAMP + DAY_SECONDS - 1),
            Amount::ZERO
        );
        assert_eq!(
            reward_timestamp(EPOCH_TIMESTAMP, EPOCH_TIMESTAMP + DAY_SECONDS - 1),
            0
        );
        // One day at 5%/365d on 365000 STR = 50 STR.
        assert_eq!(
            reward_amount(balance, EPOCH_TIMESTAMP, EPOCH_TIMESTAMP + DAY_SECONDS),
            Amount(50 * STR)
        );
        assert_eq!(
            reward_timestamp(EPOCH_TIMESTAMP, EPOCH_TIMESTAMP + DAY_SECONDS),
            EPOCH_TIMESTAMP + DAY_SECONDS / 2
        );
        // Ten days scale linearly, partial tail days truncate.
        assert_eq!(
            reward_amount(
                balance,
                EPOCH_TIMESTAMP,
                EPOCH_TIMESTAMP + 10 * DAY_SECONDS + 37
            ),
            Amount(500 * STR)
        );
        // Reversed interval accrues nothing.
        assert_eq!(
            reward_amount(balance, EPOCH_TIMESTAMP + DAY_SECONDS, EPOCH_TIMESTAMP),
            Amount::ZERO
        );
    }

    #[test]
    fn fork_and_binding_caps() {
        assert_eq!(max_allowed_forks(EPOCH_TIMESTAMP, 1), 16);
        assert_eq!(max_allowed_forks(EPOCH_TIMESTAMP, 15), 240);
        assert_eq!(max_allowed_forks(EPOCH_TIMESTAMP, 16), 256);
        assert_eq!(max_allowed_forks(EPOCH_TIMESTAMP, u16::MAX), 256);
        assert_eq!(allowed_bindings(3), 6);
    }
}
