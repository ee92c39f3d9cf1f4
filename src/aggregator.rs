use chrono::{DateTime, FixedOffset, Utc};
use eyre::{Result, WrapErr};
use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::AddressConverter;
use crate::db::Store;
use crate::models::{AccountSnapshot, Coin, MonthlyAggregateRecord, Rewards, Transaction};
use crate::parser::{Classifier, CoinFlow, FlowCategory};
use crate::period::Period;
use crate::rpc::LedgerSource;

/// Per-run accumulation of coin flows, keyed by account address.
#[derive(Debug, Default)]
pub struct AggregationContext {
    rewards: HashMap<String, Coin>,
    commission: HashMap<String, Coin>,
    pub failed_fetches: usize,
    pub ignored_lines: usize,
}

impl AggregationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, flow: CoinFlow) {
        let map = match flow.category {
            FlowCategory::DelegatorReward | FlowCategory::ValidatorReward => &mut self.rewards,
            FlowCategory::ValidatorCommission => &mut self.commission,
        };
        let entry = map
            .entry(flow.address.clone())
            .or_insert_with(|| Coin::zero(flow.coin.denom.clone()));
        match entry.checked_add(&flow.coin) {
            Some(sum) => *entry = sum,
            None => warn!(
                address = %flow.address,
                have = %entry.denom,
                got = %flow.coin.denom,
                "skipping coin flow with mismatched denom"
            ),
        }
    }

    /// Accumulated period rewards in base units.
    pub fn period_rewards(&self, address: &str) -> Decimal {
        self.rewards.get(address).map(|c| c.amount).unwrap_or(Decimal::ZERO)
    }

    /// Accumulated period commission in base units.
    pub fn period_commission(&self, address: &str) -> Decimal {
        self.commission.get(address).map(|c| c.amount).unwrap_or(Decimal::ZERO)
    }
}

/// What a call to [`Aggregator::run`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSummary {
    /// No snapshot before the cutoff.
    NoData,
    /// The resolved month was already written by an earlier run.
    UpToDate(String),
    Written { period: String, records: usize },
}

/// Builds monthly delegator statistics from snapshots, transactions and
/// ledger coin flows.
pub struct Aggregator<L, C> {
    store: Store,
    ledger: L,
    classifier: Classifier<C>,
    tz: FixedOffset,
    fetch_concurrency: usize,
}

impl<L: LedgerSource, C: AddressConverter> Aggregator<L, C> {
    pub fn new(
        store: Store,
        ledger: L,
        classifier: Classifier<C>,
        tz: FixedOffset,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            classifier,
            tz,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Aggregate the last completed month before `now`, unless that month
    /// is `last_period`.
    pub async fn run(&self, now: DateTime<Utc>, last_period: Option<&str>) -> Result<RunSummary> {
        let cutoff = Period::containing(now, self.tz).start(self.tz)?.with_timezone(&Utc);
        let Some(terminal) = self.store.terminal_date(cutoff)? else {
            info!("No snapshot before {}, nothing to aggregate", cutoff);
            return Ok(RunSummary::NoData);
        };

        let period = Period::containing(terminal, self.tz).label();
        if last_period == Some(period.as_str()) {
            debug!("Period {} already aggregated, skipping", period);
            return Ok(RunSummary::UpToDate(period));
        }
        let records = self.run_for_terminal(terminal).await?;
        Ok(RunSummary::Written { period, records })
    }

    /// Aggregate the month whose terminal snapshots were sampled on the
    /// civil day of `terminal`.
    pub async fn run_for_terminal(&self, terminal: DateTime<Utc>) -> Result<usize> {
        let terminal_day = terminal.with_timezone(&self.tz);
        let terminal_data = self
            .store
            .get_by_date(terminal_day)
            .wrap_err_with(|| format!("loading terminal snapshots for {}", terminal_day))?;
        if terminal_data.is_empty() {
            info!("No terminal snapshots on {}, nothing to write", terminal_day.date_naive());
            return Ok(0);
        }

        let period = Period::containing(terminal, self.tz);
        let mut ctx = AggregationContext::new();
        let txs = self.period_transactions(period, None, &mut ctx).await?;
        info!(
            "Period {}: {} terminal snapshots, {} txs, {} failed fetches, {} ignored lines",
            period.label(),
            terminal_data.len(),
            txs.len(),
            ctx.failed_fetches,
            ctx.ignored_lines
        );

        let mut records = Vec::with_capacity(terminal_data.len());
        for terminal in &terminal_data {
            if let Some(record) = self.reconcile(terminal, &txs, &ctx)? {
                records.push(record);
            }
        }

        let written = self.save(records)?;
        info!("💾 Saved {} monthly records for {}", written, period.label());
        Ok(written)
    }

    /// Transactions of `period` (optionally for one address). Every coin
    /// moving transaction has its coin flow folded into `ctx`.
    pub async fn period_transactions(
        &self,
        period: Period,
        address: Option<&str>,
        ctx: &mut AggregationContext,
    ) -> Result<Vec<Transaction>> {
        let (start, end) = period.window(self.tz)?;
        let txs = self
            .store
            .get_by_duration_and_address(start, end, address)
            .wrap_err_with(|| format!("loading txs for {}", period.label()))?;

        let hashes: Vec<String> = txs
            .iter()
            .filter(|tx| tx.tx_type.moves_coins())
            .map(|tx| tx.tx_hash.clone())
            .collect();
        self.fetch_coin_flows(hashes, ctx).await;

        Ok(txs)
    }

    /// Fetches are concurrent; results are folded into `ctx` here only.
    async fn fetch_coin_flows(&self, hashes: Vec<String>, ctx: &mut AggregationContext) {
        let mut results = stream::iter(hashes)
            .map(|hash| async move {
                let result = self.ledger.coin_flow(&hash).await;
                (hash, result)
            })
            .buffer_unordered(self.fetch_concurrency);

        while let Some((hash, result)) = results.next().await {
            match result {
                Ok(lines) => {
                    for line in &lines {
                        match self.classifier.classify(line) {
                            Some(flow) => ctx.apply(flow),
                            None => ctx.ignored_lines += 1,
                        }
                    }
                }
                Err(e) => {
                    ctx.failed_fetches += 1;
                    warn!(tx_hash = %hash, error = %e, "coin flow fetch failed, skipping tx");
                }
            }
        }
    }

    /// One address's record, or `None` when an increment does not fit a
    /// `Decimal`.
    fn reconcile(
        &self,
        terminal: &AccountSnapshot,
        txs: &[Transaction],
        ctx: &AggregationContext,
    ) -> Result<Option<MonthlyAggregateRecord>> {
        let period = Period::containing(terminal.date, self.tz);
        let begin_date = period.start(self.tz)?;

        let begin = match self.store.get_one_day(begin_date, &terminal.address) {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => {
                debug!("No begin snapshot for {}, using zero", terminal.address);
                AccountSnapshot::zero(
                    &terminal.address,
                    &terminal.delegation.denom,
                    begin_date.with_timezone(&Utc),
                )
            }
            Err(e) => return Err(e).wrap_err("loading begin snapshot"),
        };

        let period_rewards = ctx.period_rewards(&terminal.address);
        let period_commission = ctx.period_commission(&terminal.address);

        let increments = (
            increment_delegation(terminal, &begin),
            increment(terminal.rewards_atto(), begin.rewards_atto(), period_rewards),
            increment(terminal.commission_atto(), begin.commission_atto(), period_commission),
        );
        let (Some(delegation), Some(rewards), Some(commission)) = increments else {
            warn!(address = %terminal.address, "increment out of range, skipping address");
            return Ok(None);
        };

        Ok(Some(MonthlyAggregateRecord {
            id: String::new(),
            address: terminal.address.clone(),
            date: period.label(),
            terminal_delegation: terminal.delegation.clone(),
            period_delegation_times: delegation_times(&terminal.address, txs),
            period_withdraw_rewards: Rewards::from_atto(period_rewards),
            increment_delegation: delegation,
            period_increment_rewards: Rewards::from_atto(rewards),
            terminal_rewards: terminal.delegations_rewards.first().cloned().unwrap_or_default(),
            period_withdraw_commission: Rewards::from_atto(period_commission),
            increment_commission: Rewards::from_atto(commission),
            create_at: 0,
            update_at: 0,
        }))
    }

    /// Stamp ids and times, then insert the whole batch atomically.
    fn save(&self, mut records: Vec<MonthlyAggregateRecord>) -> Result<usize> {
        let now = Utc::now().timestamp();
        for record in &mut records {
            record.id = Uuid::new_v4().to_string();
            record.create_at = now;
            record.update_at = now;
        }
        let written = self
            .store
            .insert_monthly_records(&records)
            .wrap_err("batch insert of monthly records")?;
        Ok(written)
    }
}

fn increment_delegation(terminal: &AccountSnapshot, begin: &AccountSnapshot) -> Option<Coin> {
    let amount = terminal.delegation.amount.checked_sub(begin.delegation.amount)?;
    Some(Coin::new(terminal.delegation.denom.clone(), amount))
}

/// `terminal - begin + withdrawn`
fn increment(terminal: Decimal, begin: Decimal, withdrawn: Decimal) -> Option<Decimal> {
    terminal.checked_sub(begin)?.checked_add(withdrawn)
}

fn delegation_times(address: &str, txs: &[Transaction]) -> i64 {
    txs.iter()
        .filter(|tx| tx.tx_type.is_delegation_action() && tx.involves(address))
        .count() as i64
}
