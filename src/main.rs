use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use brokerfeed_rs::browser::cdp::CdpDriver;
use brokerfeed_rs::browser::scripted::ScriptedDriver;
use brokerfeed_rs::browser::BrowserDriver;
use brokerfeed_rs::market_data::adapters::BrokerVariant;
use brokerfeed_rs::{telemetry, Acquisition, FeedConfig, MarketDataFacade, SessionLoop};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "brokerfeed", about = "Market data from a broker web app running in a debuggable browser")]
struct Cli {
    /// TOML config file; `brokerfeed.toml` in the working directory if present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    broker: Option<BrokerVariant>,
    /// DevTools HTTP endpoint, e.g. http://localhost:9222
    #[arg(long)]
    endpoint: Option<String>,
    /// Never touch a browser; every answer comes from the degraded paths.
    #[arg(long)]
    offline: bool,
    #[arg(long, default_value_t = 9000)]
    metrics_port: u16,
}

fn print_acquisition(acq: &Acquisition, tail: usize) {
    let flag = if acq.is_synthetic() { "  (SYNTHETIC, do not trade on it)" } else { "" };
    println!("{} bars for {} from {}{}", acq.candles.len(), acq.instrument, acq.source, flag);
    let skip = acq.candles.len().saturating_sub(tail);
    for c in &acq.candles[skip..] {
        println!("  {}  o={:.5} h={:.5} l={:.5} c={:.5}", c.timestamp, c.open, c.high, c.low, c.close);
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  price <asset>              - Current price");
    println!("  candles <asset> <minutes>  - Candles with their source");
    println!("  payout <asset>             - Payout percentage");
    println!("  switch <asset>             - Switch the chart");
    println!("  current                    - Instrument the chart shows");
    println!("  state                      - Connection state");
    println!("  discover                   - Pick an instrument by payout");
    println!("  reconnect                  - Force a reconnect");
    println!("  diag                       - Interceptor and cache counters");
    println!("  screenshot <path>          - Save a PNG of the broker tab");
    println!("  quit, q                    - Exit");
}

async fn run_command(facade: &MarketDataFacade, parts: &[&str]) -> anyhow::Result<()> {
    match parts {
        ["help" | "h"] => print_help(),
        ["price", asset] => match facade.get_current_price(asset).await? {
            Some(p) => println!("{asset}: {p}"),
            None => println!("{asset}: no price available"),
        },
        ["candles", asset, minutes] => {
            let minutes: f64 = minutes.parse().context("minutes must be a number")?;
            let acq = facade.acquire(asset, minutes).await?;
            print_acquisition(&acq, 5);
        }
        ["payout", asset] => println!("{asset}: {}%", facade.get_payout(asset).await?),
        ["switch", asset] => {
            let ok = facade.switch_instrument(asset).await?;
            println!("switch to {asset}: {}", if ok { "done" } else { "failed" });
        }
        ["current"] => match facade.get_current_instrument().await {
            Some(name) => println!("chart shows {name}"),
            None => println!("chart instrument unknown"),
        },
        ["state"] => println!("{}", facade.connection_state()),
        ["discover"] => println!("{}", serde_json::to_string_pretty(&facade.discover_assets().await)?),
        ["reconnect"] => {
            let started = facade.reconnect().await;
            println!("{}", if started { "reconnecting" } else { "reconnect already running or loop unavailable" });
        }
        ["diag"] => println!("{}", serde_json::to_string_pretty(&facade.diagnostics())?),
        ["screenshot", path] => match facade.screenshot().await {
            Some(png) => {
                std::fs::write(path, &png).with_context(|| format!("writing {path}"))?;
                println!("saved {} bytes to {path}", png.len());
            }
            None => println!("no screenshot, is a broker tab attached?"),
        },
        _ => println!("Unknown command. Type 'help' for options."),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let cli = Cli::parse();

    let mut cfg = FeedConfig::load(cli.config.as_deref())?;
    if let Some(broker) = cli.broker {
        cfg.broker = broker;
    }
    if let Some(endpoint) = cli.endpoint {
        cfg.endpoint = endpoint;
    }
    cfg.validate()?;

    telemetry::init_tracing(&cfg.log_level);
    telemetry::init_metrics(cli.metrics_port);

    let driver: Arc<dyn BrowserDriver> = if cli.offline {
        Arc::new(ScriptedDriver::unreachable())
    } else {
        Arc::new(CdpDriver::new(cfg.connect.call_timeout()))
    };
    println!("brokerfeed: {} via {}{}", cfg.broker, cfg.endpoint, if cli.offline { " (offline)" } else { "" });

    let session = SessionLoop::spawn(cfg, driver)?;
    let facade = session.facade();

    // CLI loop
    loop {
        print!("\nbrokerfeed> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if matches!(parts[..], ["quit" | "q" | "exit"]) {
            println!("Goodbye!");
            break;
        }
        if let Err(e) = run_command(&facade, &parts).await {
            println!("Error: {e:#}");
        }
    }

    drop(facade);
    session.join();
    Ok(())
}
