use chrono::{DateTime, Utc};
use eyre::Result;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use crate::address::AddressConverter;
use crate::aggregator::{Aggregator, RunSummary};
use crate::db::Store;
use crate::rpc::LedgerSource;

pub const STATIC_DELEGATOR_MONTH: &str = "static_delegator_month";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Interval not elapsed, or another run holds the claim.
    Skipped,
    /// The month due was written by an earlier run.
    UpToDate(String),
    Completed(usize),
    Failed(String),
}

/// Gates a task to at most one run per interval, and one write per month,
/// via the persisted `task_control` row.
#[derive(Clone)]
pub struct TaskRunner {
    store: Store,
    interval_secs: i64,
    lease_secs: i64,
}

impl TaskRunner {
    pub fn new(store: Store, interval_secs: i64, lease_secs: i64) -> Self {
        Self {
            store,
            interval_secs,
            lease_secs,
        }
    }

    pub async fn run_at_most_once_per_interval<F, Fut>(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
        f: F,
    ) -> Result<TickOutcome>
    where
        F: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = Result<RunSummary>>,
    {
        if !self
            .store
            .try_claim_task(task_name, self.interval_secs, self.lease_secs, now)?
        {
            return Ok(TickOutcome::Skipped);
        }
        let last_period = self.store.task_status(task_name)?.and_then(|s| s.last_period);

        info!("▶️ Running task {}", task_name);
        match f(last_period).await {
            Ok(RunSummary::UpToDate(period)) => {
                self.store.release_task(task_name)?;
                debug!("Task {} already wrote {}", task_name, period);
                Ok(TickOutcome::UpToDate(period))
            }
            Ok(RunSummary::NoData) => {
                self.store.complete_task(task_name, now, None)?;
                info!("✅ Task {} finished, nothing to write", task_name);
                Ok(TickOutcome::Completed(0))
            }
            Ok(RunSummary::Written { period, records }) => {
                self.store.complete_task(task_name, now, Some(&period))?;
                info!("✅ Task {} finished, {} records for {}", task_name, records, period);
                Ok(TickOutcome::Completed(records))
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                self.store.fail_task(task_name, &msg)?;
                error!("Task {} failed: {}", task_name, msg);
                Ok(TickOutcome::Failed(msg))
            }
        }
    }
}

/// Scheduler loop for the monthly delegator aggregation.
pub async fn run<L, C>(runner: TaskRunner, aggregator: Aggregator<L, C>, tick_secs: u64) -> Result<()>
where
    L: LedgerSource,
    C: AddressConverter,
{
    info!("Task runner started, tick = {}s", tick_secs);

    let aggregator = &aggregator;
    loop {
        let now = Utc::now();
        let outcome = runner
            .run_at_most_once_per_interval(STATIC_DELEGATOR_MONTH, now, move |last| async move {
                aggregator.run(now, last.as_deref()).await
            })
            .await;

        match outcome {
            Ok(TickOutcome::Skipped) => info!("Task {} not due", STATIC_DELEGATOR_MONTH),
            Ok(_) => {}
            Err(e) => error!("Task bookkeeping failed: {:?}", e),
        }

        sleep(Duration::from_secs(tick_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::{aggregator, cst, may_ledger, seed_may, snapshot, StubLedger};
    use crate::parser::tests::PrefixSwap;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use eyre::eyre;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner() -> (Store, TaskRunner) {
        let store = Store::open_in_memory().unwrap();
        (store.clone(), TaskRunner::new(store, 100, 10))
    }

    fn written(period: &str, records: usize) -> Result<RunSummary> {
        Ok(RunSummary::Written {
            period: period.to_string(),
            records,
        })
    }

    #[tokio::test]
    async fn runs_once_per_interval() {
        let (_store, runner) = runner();
        let calls = AtomicUsize::new(0);
        let now = Utc::now();

        let job = |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            written("2020.05", 3)
        };
        assert_eq!(
            runner.run_at_most_once_per_interval("t", now, job).await.unwrap(),
            TickOutcome::Completed(3)
        );
        assert_eq!(
            runner.run_at_most_once_per_interval("t", now, job).await.unwrap(),
            TickOutcome::Skipped
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_retried_on_next_tick() {
        let (store, runner) = runner();
        let now = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();

        let outcome = runner
            .run_at_most_once_per_interval("t", now, |_| async { Err(eyre!("snapshot query failed")) })
            .await
            .unwrap();
        assert!(matches!(outcome, TickOutcome::Failed(ref m) if m.contains("snapshot")));

        let status = store.task_status("t").unwrap().unwrap();
        assert_eq!(status.last_status.as_deref(), Some("failed"));
        assert_eq!(status.last_run_at, None);
        assert_eq!(status.last_period, None);

        let later = now + ChronoDuration::seconds(1);
        let outcome = runner
            .run_at_most_once_per_interval("t", later, |_| async { written("2020.05", 0) })
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Completed(0));
        let status = store.task_status("t").unwrap().unwrap();
        assert_eq!(status.last_status.as_deref(), Some("ok"));
        assert_eq!(status.last_period.as_deref(), Some("2020.05"));
    }

    #[tokio::test]
    async fn overlapping_ticks_do_not_run_twice() {
        let (_store, runner) = runner();
        let now = Utc::now();
        let other = runner.clone();

        let outcome = runner
            .run_at_most_once_per_interval("t", now, |_| async {
                // a second tick arriving mid-run sees the claim
                let inner = other
                    .run_at_most_once_per_interval("t", now, |_| async { written("2020.05", 99) })
                    .await
                    .unwrap();
                assert_eq!(inner, TickOutcome::Skipped);
                written("2020.05", 1)
            })
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Completed(1));
    }

    async fn tick(
        runner: &TaskRunner,
        agg: &Aggregator<StubLedger, PrefixSwap>,
        january_day: u32,
    ) -> TickOutcome {
        let now = cst()
            .with_ymd_and_hms(2021, 1, january_day, 0, 10, 0)
            .unwrap()
            .with_timezone(&Utc);
        runner
            .run_at_most_once_per_interval(STATIC_DELEGATOR_MONTH, now, move |last| async move {
                agg.run(now, last.as_deref()).await
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn month_is_written_once_across_interval_drift() {
        let store = Store::open_in_memory().unwrap();
        let runner = TaskRunner::new(store.clone(), 30 * 24 * 3600, 3600);
        let dec_31 = cst().with_ymd_and_hms(2020, 12, 31, 12, 0, 0).unwrap().with_timezone(&Utc);
        store.insert_snapshot(&snapshot("faa1abc", 1000, 50, dec_31)).unwrap();
        let agg = aggregator(&store, may_ledger());

        assert_eq!(tick(&runner, &agg, 1).await, TickOutcome::Completed(1));
        // 30 days later the interval has elapsed but December is still the month due
        assert_eq!(
            tick(&runner, &agg, 31).await,
            TickOutcome::UpToDate("2020.12".to_string())
        );

        let records = store.query_monthly_records(Some("2020.12"), None, 10).unwrap();
        assert_eq!(records.len(), 1);
        let status = store.task_status(STATIC_DELEGATOR_MONTH).unwrap().unwrap();
        assert_eq!(status.last_period.as_deref(), Some("2020.12"));
        assert_eq!(status.claimed_until, None);
    }

    #[tokio::test]
    async fn scheduler_loop_runs_on_a_spawned_task() {
        let store = Store::open_in_memory().unwrap();
        seed_may(&store);
        let runner = TaskRunner::new(store.clone(), 3600, 60);

        let handle = tokio::spawn(run(runner, aggregator(&store, may_ledger()), 3600));

        let mut records = Vec::new();
        for _ in 0..200 {
            records = store.query_monthly_records(Some("2020.05"), None, 10).unwrap();
            if !records.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, "faa1abc");
    }
}
