use chrono::FixedOffset;
use dotenvy::dotenv;
use eyre::{eyre, Result};
use std::env;
use tracing::info;

use crate::parser::FlowTags;

/// One lunar month.
pub const DEFAULT_TASK_INTERVAL_SECS: u64 = 3600 * 24 * 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub lcd_url: String, // ledger light-client service
    pub db_path: String,
    pub acc_addr_prefix: String,
    pub civil_offset: FixedOffset,
    pub task_tick_secs: u64,
    pub task_interval_secs: i64,
    pub task_lease_secs: i64,
    pub fetch_concurrency: usize,
    pub port: u16,
    pub flow_tags: FlowTags,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Seconds as stored in `task_control`. Values past `i64::MAX` are an error.
fn secs_or(key: &str, default: u64) -> Result<i64> {
    let secs: u64 = parsed_or(key, default);
    i64::try_from(secs).map_err(|_| eyre!("{} out of range: {}", key, secs))
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // Load from .env file

    // Ledger LCD endpoint
    let lcd_url = env::var("LCD_URL")
        .or_else(|_| env::var("LCD_ADDR")) // alias support
        .unwrap_or_else(|_| "http://localhost:1317".to_string());

    let db_path = var_or("DATABASE_URL", "delegator_stats.db");
    let acc_addr_prefix = var_or("ACC_ADDR_PREFIX", "faa");

    // Civil time zone used for period boundaries (default: UTC+8)
    let offset_hours: i32 = parsed_or("CIVIL_TZ_OFFSET_HOURS", 8);
    let civil_offset = FixedOffset::east_opt(offset_hours * 3600)
        .ok_or_else(|| eyre!("CIVIL_TZ_OFFSET_HOURS out of range: {}", offset_hours))?;

    let defaults = FlowTags::default();
    let flow_tags = FlowTags {
        delegator_reward: var_or("DELEGATOR_REWARD_TAG", &defaults.delegator_reward),
        validator_reward: var_or("VALIDATOR_REWARD_TAG", &defaults.validator_reward),
        validator_commission: var_or("VALIDATOR_COMMISSION_TAG", &defaults.validator_commission),
    };

    let cfg = Config {
        lcd_url,
        db_path,
        acc_addr_prefix,
        civil_offset,
        task_tick_secs: parsed_or("TASK_TICK_SECS", 600),
        task_interval_secs: secs_or("TASK_INTERVAL_SECS", DEFAULT_TASK_INTERVAL_SECS)?,
        task_lease_secs: secs_or("TASK_LEASE_SECS", 3600)?,
        fetch_concurrency: parsed_or("FETCH_CONCURRENCY", 8),
        port: parsed_or("PORT", 8080),
        flow_tags,
    };

    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_values_fall_back_to_defaults() {
        assert_eq!(parsed_or("DELEGATOR_STATS_TEST_UNSET_NUMBER", 42u64), 42);
        assert_eq!(var_or("DELEGATOR_STATS_TEST_UNSET_TEXT", "x"), "x");
    }

    #[test]
    fn unparseable_number_falls_back() {
        env::set_var("DELEGATOR_STATS_TEST_BAD_NUMBER", "twelve");
        assert_eq!(parsed_or("DELEGATOR_STATS_TEST_BAD_NUMBER", 7u16), 7);
        env::set_var("DELEGATOR_STATS_TEST_GOOD_NUMBER", " 12 ");
        assert_eq!(parsed_or("DELEGATOR_STATS_TEST_GOOD_NUMBER", 7u16), 12);
    }

    #[test]
    fn seconds_beyond_i64_are_rejected() {
        env::set_var("DELEGATOR_STATS_TEST_HUGE_SECS", u64::MAX.to_string());
        let err = secs_or("DELEGATOR_STATS_TEST_HUGE_SECS", 60).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        env::set_var("DELEGATOR_STATS_TEST_MAX_SECS", i64::MAX.to_string());
        assert_eq!(secs_or("DELEGATOR_STATS_TEST_MAX_SECS", 60).unwrap(), i64::MAX);
        assert_eq!(secs_or("DELEGATOR_STATS_TEST_UNSET_SECS", 60).unwrap(), 60);
    }
}
