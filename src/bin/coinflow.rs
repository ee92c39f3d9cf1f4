use delegator_stats::address::Bech32Converter;
use delegator_stats::config;
use delegator_stats::parser::Classifier;
use delegator_stats::rpc::{LcdClient, LedgerSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(tx_hash) = std::env::args().nth(1) else {
        eprintln!("usage: coinflow <tx_hash>");
        std::process::exit(2);
    };

    let cfg = config::load().map_err(|e| anyhow::anyhow!("{:#}", e))?;
    let client = LcdClient::new(&cfg.lcd_url).map_err(|e| anyhow::anyhow!("{:#}", e))?;
    let classifier = Classifier::new(cfg.flow_tags.clone(), Bech32Converter::new(&cfg.acc_addr_prefix));

    println!("Fetching coin flow for {} from {}...", tx_hash, cfg.lcd_url);
    let lines = match client.coin_flow(&tx_hash).await {
        Ok(lines) => lines,
        Err(e) => {
            eprintln!("LCD error while fetching coin flow: {:#}", e);
            return Ok(());
        }
    };

    println!("Fetched {} lines", lines.len());
    for line in &lines {
        match classifier.classify(line) {
            Some(flow) => println!(
                "{:?} | {} | {} {}",
                flow.category, flow.address, flow.coin.amount, flow.coin.denom
            ),
            None => println!("ignored | {}", line),
        }
    }

    Ok(())
}
