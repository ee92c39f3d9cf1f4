// src/parser.rs
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

use crate::address::AddressConverter;
use crate::models::{Coin, ATTO_DENOM};

/// Coin-flow lines are `::`-separated with exactly this many fields.
pub const COIN_FLOW_FIELDS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCategory {
    DelegatorReward,
    ValidatorReward,
    ValidatorCommission,
}

/// A decoded reward/commission movement.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinFlow {
    pub category: FlowCategory,
    pub address: String,
    pub coin: Coin, // always base units
}

/// Tag prefixes that select a category.
#[derive(Debug, Clone)]
pub struct FlowTags {
    pub delegator_reward: String,
    pub validator_reward: String,
    pub validator_commission: String,
}

impl Default for FlowTags {
    fn default() -> Self {
        Self {
            delegator_reward: "delegatorReward".to_string(),
            validator_reward: "validatorReward".to_string(),
            validator_commission: "validatorCommission".to_string(),
        }
    }
}

/// Denominations a reward amount may be quoted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardDenom {
    IrisAtto,
    IrisNano,
    IrisMicro,
    IrisMilli,
    Iris,
}

impl RewardDenom {
    pub const ALL: [RewardDenom; 5] = [
        RewardDenom::IrisAtto,
        RewardDenom::IrisNano,
        RewardDenom::IrisMicro,
        RewardDenom::IrisMilli,
        RewardDenom::Iris,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            RewardDenom::IrisAtto => "iris-atto",
            RewardDenom::IrisNano => "iris-nano",
            RewardDenom::IrisMicro => "uiris",
            RewardDenom::IrisMilli => "iris-milli",
            RewardDenom::Iris => "iris",
        }
    }

    /// Power of ten from this denom to the base unit.
    pub fn exponent(self) -> u32 {
        match self {
            RewardDenom::IrisAtto => 0,
            RewardDenom::IrisNano => 9,
            RewardDenom::IrisMicro => 12,
            RewardDenom::IrisMilli => 15,
            RewardDenom::Iris => 18,
        }
    }

    /// Longest matching suffix, independent of declaration order.
    pub fn match_suffix(s: &str) -> Option<RewardDenom> {
        Self::ALL
            .iter()
            .copied()
            .filter(|d| s.ends_with(d.suffix()))
            .max_by_key(|d| d.suffix().len())
    }
}

/// Parses e.g. `"100uiris"` into a base-unit coin. Unknown denoms,
/// unparseable or negative numbers and amounts too large for a `Decimal`
/// give a zero coin.
pub fn parse_coin(s: &str) -> Coin {
    let s = s.trim();
    let Some(denom) = RewardDenom::match_suffix(s) else {
        return Coin::zero(ATTO_DENOM);
    };
    let number = &s[..s.len() - denom.suffix().len()];
    let amount = match Decimal::from_str(number.trim()) {
        Ok(amount) if !amount.is_sign_negative() => amount,
        _ => return Coin::zero(ATTO_DENOM),
    };
    let scale = Decimal::from(10u64.pow(denom.exponent()));
    match amount.checked_mul(scale) {
        Some(atto) => Coin::new(ATTO_DENOM, atto.normalize()),
        None => {
            warn!(amount = s, "coin flow amount out of range, using zero");
            Coin::zero(ATTO_DENOM)
        }
    }
}

pub struct Classifier<C> {
    tags: FlowTags,
    converter: C,
}

impl<C: AddressConverter> Classifier<C> {
    pub fn new(tags: FlowTags, converter: C) -> Self {
        Self { tags, converter }
    }

    /// Decode one coin-flow line. Lines that are malformed, untagged or
    /// carry an unconvertible address yield `None`.
    pub fn classify(&self, line: &str) -> Option<CoinFlow> {
        let fields: Vec<&str> = line.split("::").collect();
        if fields.len() != COIN_FLOW_FIELDS {
            return None;
        }
        let (source, target, amount, tag) = (fields[0], fields[1], fields[2], fields[3]);

        let (category, address) = if tag.starts_with(&self.tags.delegator_reward) {
            (FlowCategory::DelegatorReward, target.to_string())
        } else if tag.starts_with(&self.tags.validator_reward) {
            (FlowCategory::ValidatorReward, self.convert(source, line)?)
        } else if tag.starts_with(&self.tags.validator_commission) {
            (FlowCategory::ValidatorCommission, self.convert(source, line)?)
        } else {
            return None;
        };

        Some(CoinFlow {
            category,
            address,
            coin: parse_coin(amount),
        })
    }

    fn convert(&self, raw: &str, line: &str) -> Option<String> {
        match self.converter.to_account(raw) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(line, error = %e, "skipping coin flow with unconvertible address");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eyre::{eyre, Result};

    /// Replaces everything before the bech32 separator with `faa`.
    pub(crate) struct PrefixSwap;

    impl AddressConverter for PrefixSwap {
        fn to_account(&self, raw: &str) -> Result<String> {
            let (_, rest) = raw.split_once('1').ok_or_else(|| eyre!("no separator in {}", raw))?;
            Ok(format!("faa1{}", rest))
        }
    }

    pub(crate) fn test_tags() -> FlowTags {
        FlowTags {
            delegator_reward: "delegator_reward_tag".to_string(),
            validator_reward: "validator_reward_tag".to_string(),
            validator_commission: "validator_commission_tag".to_string(),
        }
    }

    fn classifier() -> Classifier<PrefixSwap> {
        Classifier::new(test_tags(), PrefixSwap)
    }

    #[test]
    fn validator_reward_keys_by_converted_source() {
        let flow = classifier()
            .classify("cosmosvaloper1xyz::faa1abc::100uiris::validator_reward_tag::extra::extra2")
            .unwrap();
        assert_eq!(flow.category, FlowCategory::ValidatorReward);
        assert_eq!(flow.address, "faa1xyz");
        assert_ne!(flow.address, "cosmosvaloper1xyz");
        assert_eq!(flow.coin, Coin::new(ATTO_DENOM, Decimal::from(100u64 * 10u64.pow(12))));
    }

    #[test]
    fn delegator_reward_keys_by_target() {
        let flow = classifier()
            .classify("fva1val::faa1abc::5iris::delegator_reward_tag_x::a::b")
            .unwrap();
        assert_eq!(flow.category, FlowCategory::DelegatorReward);
        assert_eq!(flow.address, "faa1abc");
        assert_eq!(flow.coin.amount, Decimal::from(5) * crate::models::atto_scale());
    }

    #[test]
    fn commission_and_ignored_tags() {
        let c = classifier();
        let flow = c.classify("fva1val::x::7iris-atto::validator_commission_tag::a::b").unwrap();
        assert_eq!(flow.category, FlowCategory::ValidatorCommission);
        assert_eq!(flow.address, "faa1val");
        assert_eq!(flow.coin.amount, Decimal::from(7));

        assert!(c.classify("fva1val::x::7iris::transfer::a::b").is_none());
    }

    #[test]
    fn wrong_field_count_is_ignored() {
        let c = classifier();
        assert!(c.classify("fva1val::faa1abc::5iris::delegator_reward_tag::a").is_none());
        assert!(c.classify("fva1val::faa1abc::5iris::delegator_reward_tag::a::b::c").is_none());
        assert!(c.classify("").is_none());
    }

    #[test]
    fn unconvertible_source_is_skipped() {
        assert!(classifier()
            .classify("garbage::faa1abc::5iris::validator_reward_tag::a::b")
            .is_none());
    }

    #[test]
    fn longest_suffix_wins() {
        assert_eq!(RewardDenom::match_suffix("100uiris"), Some(RewardDenom::IrisMicro));
        assert_eq!(RewardDenom::match_suffix("100iris"), Some(RewardDenom::Iris));
        assert_eq!(RewardDenom::match_suffix("100iris-atto"), Some(RewardDenom::IrisAtto));
        assert_eq!(RewardDenom::match_suffix("100uatom"), None);
    }

    #[test]
    fn parse_coin_edge_cases() {
        assert_eq!(parse_coin("1.5iris").amount, Decimal::from(15u64 * 10u64.pow(17)));
        assert!(parse_coin("12uatom").is_zero());
        assert!(parse_coin("abciris").is_zero());
        assert!(parse_coin("iris").is_zero());
        assert_eq!(parse_coin("12uatom").denom, ATTO_DENOM);
    }

    #[test]
    fn oversized_amount_is_zero() {
        assert!(parse_coin("100000000000iris").is_zero());
        assert!(parse_coin("79228162514264337593543950335iris-milli").is_zero());
        // largest base-unit amount still parses
        assert_eq!(
            parse_coin("79228162514264337593543950335iris-atto").amount,
            Decimal::MAX
        );
    }

    #[test]
    fn negative_amount_is_zero() {
        assert!(parse_coin("-5iris").is_zero());
        assert!(classifier()
            .classify("fva1val::faa1abc::-5iris::delegator_reward_tag::a::b")
            .unwrap()
            .coin
            .is_zero());
    }
}
