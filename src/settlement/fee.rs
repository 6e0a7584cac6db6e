//! Transfer fees.
//!
//! Coin transfers pay a flat fee. Stable transfers pay a percentage picked by
//! the signer's coin balance:
//!
//! | coin balance | rate      | bounds          |
//! |--------------|-----------|-----------------|
//! | ≥ 10 000     | 3/100 000 | floor, then cap |
//! | ≥ 1 000      | 3/10 000  | floor           |
//! | otherwise    | 1/1 000   | floor           |
//!
//! The product is computed with one extra decimal digit, rounded half-up and
//! truncated to 18 digits.

use alloy::primitives::U256;

use crate::config::FeeConfig;
use crate::ledger::{Amount, Token};

/// A fee rate as a fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub num: u64,
    pub den: u64,
}

pub const RATE_BASE: Rate = Rate { num: 1, den: 1_000 };
pub const RATE_MID: Rate = Rate { num: 3, den: 10_000 };
pub const RATE_TOP: Rate = Rate { num: 3, den: 100_000 };

/// Coin balance thresholds in whole tokens.
pub const TIER_MID_BALANCE: u64 = 1_000;
pub const TIER_TOP_BALANCE: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Base,
    Mid,
    Top,
}

impl Tier {
    pub fn for_balance(other_balance: Amount) -> Self {
        if other_balance >= Amount::whole(TIER_TOP_BALANCE) {
            Tier::Top
        } else if other_balance >= Amount::whole(TIER_MID_BALANCE) {
            Tier::Mid
        } else {
            Tier::Base
        }
    }

    pub fn rate(&self) -> Rate {
        match self {
            Tier::Base => RATE_BASE,
            Tier::Mid => RATE_MID,
            Tier::Top => RATE_TOP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeeSchedule {
    coin_flat: Amount,
    stable_min: Amount,
    stable_max: Amount,
}

impl FeeSchedule {
    pub fn new(config: &FeeConfig) -> Self {
        Self {
            coin_flat: config.coin_flat,
            stable_min: config.stable_min,
            stable_max: config.stable_max,
        }
    }

    /// Fee for sending `amount` of `token` from a signer whose balance of the
    /// other token is `other_balance`.
    pub fn fee(&self, token: Token, amount: Amount, other_balance: Amount) -> Amount {
        match token {
            Token::Coin => self.coin_flat,
            Token::Stable => self.stable_fee(amount, Tier::for_balance(other_balance)),
        }
    }

    fn stable_fee(&self, amount: Amount, tier: Tier) -> Amount {
        let fee = apply_rate(amount, tier.rate()).max(self.stable_min);
        match tier {
            Tier::Top => fee.min(self.stable_max),
            _ => fee,
        }
    }
}

/// `amount × rate`, half-up rounded at the 19th fractional digit.
fn apply_rate(amount: Amount, rate: Rate) -> Amount {
    let ten = U256::from(10u8);
    let scaled = amount
        .units()
        .saturating_mul(U256::from(rate.num))
        .saturating_mul(ten)
        / U256::from(rate.den);
    Amount::from_units(scaled.saturating_add(U256::from(5u8)) / ten)
}
