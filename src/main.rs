use delegator_stats::address::Bech32Converter;
use delegator_stats::aggregator::Aggregator;
use delegator_stats::db::Store;
use delegator_stats::parser::Classifier;
use delegator_stats::rpc::LcdClient;
use delegator_stats::task::{self, TaskRunner};
use delegator_stats::{api, config};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout) // force logs to stdout
        .with_target(false)
        .init();

    info!("Delegator stats starting...");

    // Load configuration
    let cfg = config::load()?;
    info!("  LCD URL: {}", cfg.lcd_url);
    info!("  DB Path: {}", cfg.db_path);
    info!("  Port: {}", cfg.port);
    info!("  Civil offset: {}", cfg.civil_offset);
    info!("  Task interval: {}s (tick {}s)", cfg.task_interval_secs, cfg.task_tick_secs);

    // Runs migrations once at startup
    let store = Store::open(&cfg.db_path)?;

    let aggregator = Aggregator::new(
        store.clone(),
        LcdClient::new(&cfg.lcd_url)?,
        Classifier::new(cfg.flow_tags.clone(), Bech32Converter::new(&cfg.acc_addr_prefix)),
        cfg.civil_offset,
        cfg.fetch_concurrency,
    );
    let runner = TaskRunner::new(store.clone(), cfg.task_interval_secs, cfg.task_lease_secs);

    // Spawn API task
    let api_handle = tokio::spawn({
        let store = store.clone();
        let port = cfg.port;
        async move { api::serve(port, store).await }
    });

    // Spawn task runner
    let task_handle = tokio::spawn({
        let tick = cfg.task_tick_secs;
        async move { task::run(runner, aggregator, tick).await }
    });

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = task_handle => match res {
            Ok(Ok(_)) => info!("Task runner exited cleanly"),
            Ok(Err(e)) => error!("Task runner error: {:?}", e),
            Err(e) => error!("Task runner panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Delegator stats stopped.");
    Ok(())
}
