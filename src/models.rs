// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Base-unit denomination of the staking token.
pub const ATTO_DENOM: &str = "iris-atto";

/// Number of decimal places between the human unit and the base unit.
pub const ATTO_EXPONENT: u32 = 18;

/// 10^18, the base-unit scale factor.
pub fn atto_scale() -> Decimal {
    Decimal::from(10u64.pow(ATTO_EXPONENT))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: Decimal, // Decimal (serialized as string)
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: Decimal) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }

    pub fn zero(denom: impl Into<String>) -> Self {
        Self::new(denom, Decimal::ZERO)
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Adds two coins of the same denom. A zero coin with an empty denom
    /// takes the other side's denom; any other mismatch, or an overflowing
    /// sum, yields `None`.
    pub fn checked_add(&self, other: &Coin) -> Option<Coin> {
        if self.denom == other.denom {
            let amount = self.amount.checked_add(other.amount)?;
            return Some(Coin::new(self.denom.clone(), amount));
        }
        if self.denom.is_empty() && self.is_zero() {
            return Some(other.clone());
        }
        if other.denom.is_empty() && other.is_zero() {
            return Some(self.clone());
        }
        None
    }
}

/// A reward (or commission) amount carried in both units.
///
/// `iris_atto` is authoritative; `iris` is derived from it for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rewards {
    pub iris: f64,
    pub iris_atto: String,
}

impl Rewards {
    pub fn from_atto(atto: Decimal) -> Self {
        let iris = (atto / atto_scale()).to_f64().unwrap_or(0.0);
        Self {
            iris,
            iris_atto: atto.normalize().to_string(),
        }
    }

    /// `None` when the base-unit value does not fit a `Decimal`.
    pub fn from_iris(iris: Decimal) -> Option<Self> {
        iris.checked_mul(atto_scale()).map(Self::from_atto)
    }

    /// Base-unit value. Falls back to the human value when the base-unit
    /// string is empty or unparseable; a human value too large to scale
    /// counts as zero.
    pub fn atto(&self) -> Decimal {
        if let Ok(atto) = Decimal::from_str(self.iris_atto.trim()) {
            return atto;
        }
        match Decimal::from_f64(self.iris).and_then(|iris| iris.checked_mul(atto_scale())) {
            Some(atto) => atto,
            None => {
                warn!(iris = self.iris, "reward amount out of range, using zero");
                Decimal::ZERO
            }
        }
    }
}

/// Point-in-time account sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub address: String,
    pub delegation: Coin,
    pub delegations_rewards: Vec<Rewards>, // first entry authoritative
    pub commission: Vec<Rewards>,          // first entry authoritative
    pub date: DateTime<Utc>,
}

impl AccountSnapshot {
    /// Stand-in for a missing sample: zero delegation, no rewards.
    pub fn zero(address: &str, denom: &str, date: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            delegation: Coin::zero(denom),
            delegations_rewards: Vec::new(),
            commission: Vec::new(),
            date,
        }
    }

    pub fn rewards_atto(&self) -> Decimal {
        self.delegations_rewards
            .first()
            .map(Rewards::atto)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn commission_atto(&self) -> Decimal {
        self.commission
            .first()
            .map(Rewards::atto)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TxType {
    Delegate,
    BeginRedelegate,
    BeginUnbonding,
    WithdrawDelegatorReward,
    WithdrawDelegatorRewardsAll,
    WithdrawValidatorRewardsAll,
    Other(String),
}

impl TxType {
    pub fn as_str(&self) -> &str {
        match self {
            TxType::Delegate => "delegate",
            TxType::BeginRedelegate => "begin_redelegate",
            TxType::BeginUnbonding => "begin_unbonding",
            TxType::WithdrawDelegatorReward => "withdraw_delegator_reward",
            TxType::WithdrawDelegatorRewardsAll => "withdraw_delegator_rewards_all",
            TxType::WithdrawValidatorRewardsAll => "withdraw_validator_rewards_all",
            TxType::Other(s) => s,
        }
    }

    /// Types whose execution can emit a reward or commission coin flow.
    pub fn moves_coins(&self) -> bool {
        matches!(
            self,
            TxType::WithdrawDelegatorReward
                | TxType::WithdrawDelegatorRewardsAll
                | TxType::WithdrawValidatorRewardsAll
                | TxType::BeginRedelegate
                | TxType::BeginUnbonding
                | TxType::Delegate
        )
    }

    pub fn is_delegation_action(&self) -> bool {
        matches!(
            self,
            TxType::Delegate | TxType::BeginRedelegate | TxType::BeginUnbonding
        )
    }
}

impl From<&str> for TxType {
    fn from(s: &str) -> Self {
        match s {
            "delegate" => TxType::Delegate,
            "begin_redelegate" => TxType::BeginRedelegate,
            "begin_unbonding" => TxType::BeginUnbonding,
            "withdraw_delegator_reward" => TxType::WithdrawDelegatorReward,
            "withdraw_delegator_rewards_all" => TxType::WithdrawDelegatorRewardsAll,
            "withdraw_validator_rewards_all" => TxType::WithdrawValidatorRewardsAll,
            other => TxType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub tx_hash: String,
    pub tx_type: TxType,
    pub time: DateTime<Utc>,
    pub from_address: String,
    pub to_address: String,
}

impl Transaction {
    pub fn involves(&self, address: &str) -> bool {
        self.from_address == address || self.to_address == address
    }
}

/// One address's statistics for one month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyAggregateRecord {
    pub id: String,
    pub address: String,
    pub date: String, // "YYYY.MM"
    pub terminal_delegation: Coin,
    pub period_delegation_times: i64,
    pub period_withdraw_rewards: Rewards,
    pub increment_delegation: Coin,
    pub period_increment_rewards: Rewards,
    pub terminal_rewards: Rewards,
    pub period_withdraw_commission: Rewards,
    pub increment_commission: Rewards,
    pub create_at: i64,
    pub update_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewards_round_trip_through_atto() {
        let r = Rewards::from_iris(Decimal::from(45)).unwrap();
        assert_eq!(r.iris_atto, "45000000000000000000");
        assert!((r.iris - 45.0).abs() < 1e-9);
        assert_eq!(r.atto(), Decimal::from(45) * atto_scale());
    }

    #[test]
    fn rewards_fall_back_to_human_value() {
        let r = Rewards {
            iris: 1.5,
            iris_atto: String::new(),
        };
        assert_eq!(r.atto(), Decimal::from_str("1500000000000000000").unwrap());
    }

    #[test]
    fn oversized_amounts_do_not_panic() {
        assert!(Rewards::from_iris(Decimal::MAX).is_none());
        let huge = Rewards {
            iris: 1e30,
            iris_atto: String::new(),
        };
        assert_eq!(huge.atto(), Decimal::ZERO);

        let max = Coin::new("iris-atto", Decimal::MAX);
        assert!(max.checked_add(&Coin::new("iris-atto", Decimal::ONE)).is_none());
    }

    #[test]
    fn coin_add_refuses_mixed_denoms() {
        let a = Coin::new("iris-atto", Decimal::from(3));
        let b = Coin::new("uatom", Decimal::from(4));
        assert!(a.checked_add(&b).is_none());
        let empty = Coin::zero("");
        assert_eq!(empty.checked_add(&a), Some(a.clone()));
        assert_eq!(a.checked_add(&a).unwrap().amount, Decimal::from(6));
    }

    #[test]
    fn tx_type_classes() {
        assert!(TxType::from("delegate").is_delegation_action());
        assert!(TxType::from("withdraw_delegator_reward").moves_coins());
        assert!(!TxType::from("withdraw_delegator_reward").is_delegation_action());
        let other = TxType::from("transfer");
        assert_eq!(other, TxType::Other("transfer".into()));
        assert!(!other.moves_coins());
        assert_eq!(other.to_string(), "transfer");
    }
}
