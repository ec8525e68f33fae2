// =============================================================================
// Pump Bot — Main Entry Point
// =============================================================================
//
// Starts in Demo mode unless the config or PUMP_ACCOUNT_MODE says otherwise:
// orders go to the in-memory paper exchange while prices come from Binance.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod exchange;
mod execution;
mod exit;
mod portfolio;
mod prompt;
mod retry;
mod runtime_config;
mod types;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::client::BinanceClient;
use crate::exchange::paper::PaperExchange;
use crate::exchange::Exchange;
use crate::execution::ExecutionEngine;
use crate::exit::controller::{ExitOutcome, PumpParams, StagedExit};
use crate::exit::interrupt::{escalate, Escalation, Interrupt};
use crate::prompt::Prompter;
use crate::runtime_config::{RuntimeConfig, DEFAULT_CONFIG_PATH};
use crate::types::{AccountMode, BalanceKind, Symbol};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("PUMP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let first_run = !Path::new(&config_path).exists();
    let mut config = RuntimeConfig::load_or_default(&config_path);
    if first_run {
        if let Err(e) = config.save(&config_path) {
            warn!(error = %e, "Failed to write default config");
        }
    }
    config.apply_env()?;

    info!(account_mode = %config.account_mode, base_url = %config.base_url, "Pump bot starting");

    // ── 2. Exchange ──────────────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();

    let exchange: Arc<dyn Exchange> = match config.account_mode {
        AccountMode::Live => {
            if api_key.is_empty() || api_secret.is_empty() {
                bail!("Live mode needs BINANCE_API_KEY and BINANCE_API_SECRET");
            }
            Arc::new(BinanceClient::new(api_key, api_secret, config.base_url.clone())?)
        }
        AccountMode::Demo => {
            let feed = Arc::new(BinanceClient::new(api_key, api_secret, config.base_url.clone())?);
            let paper = PaperExchange::with_feed(feed);
            for (asset, free) in &config.paper_balances {
                paper.set_balance(asset, *free);
            }
            Arc::new(paper)
        }
    };
    info!(exchange = exchange.name(), "Exchange ready");

    let engine = Arc::new(ExecutionEngine::new(exchange, config.retry, config.adjust));

    // ── 3. Startup sweep ─────────────────────────────────────────────────
    println!("[+] PRELOADING TICKER DATA . . .");
    let tickers = engine
        .fetch_all_tickers()
        .await
        .context("failed to preload tickers")?;
    info!(tickers = tickers.len(), "Tickers preloaded");
    let markets: HashSet<Symbol> = engine
        .load_markets()
        .await
        .context("failed to load markets")?
        .into_iter()
        .collect();

    println!("[+] CANCELLING ALL ORDERS . . .");
    portfolio::cancel_all_orders(&engine, &[], &config.cancel_pairs, &config.reserved_assets)
        .await
        .context("failed to cancel open orders")?;

    // ── Maintenance commands ─────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => {}
        Some("portfolio") => {
            let usd = portfolio::get_portfolio(&engine, &config.reserved_assets).await?;
            println!("[+] PORTFOLIO VALUE: ${usd:.2}");
            return Ok(());
        }
        Some("normalize") => {
            let pair = args.get(1).map(|p| p.to_uppercase()).unwrap_or_else(|| "ETH".into());
            let (sells, buys) =
                portfolio::normalize_balances(&engine, &config.reserved_assets, &pair).await?;
            println!("[+] NORMALIZED: {} SOLD, {} BOUGHT", sells.len(), buys.len());
            return Ok(());
        }
        Some(other) => bail!("unknown command '{other}' (expected run, portfolio or normalize [PAIR])"),
    }

    // ── 4. Operator input ────────────────────────────────────────────────
    let stdin = std::io::stdin();
    let mut prompter = Prompter::new(stdin.lock(), std::io::stdout());

    let sell_percent = prompter.ask_f64("[+] ENTER PERCENTAGE INCREASE TO SELL: ")?;
    let step_change = prompter.ask_f64("[+] ENTER PERCENTAGE DECREASE STEP CHANGE: ")?;
    let interval_secs = prompter.ask_f64("[+] ENTER TIME INTERVAL (SEC) TO EXECUTE STEPS: ")?;
    let pair = prompter.ask_pair()?;

    let pair_balance = engine.fetch_balance(&pair, BalanceKind::Free).await?;
    let pair_usd = portfolio::get_pair_usd_balance(&engine, &pair).await?;
    prompter.say(&format!("[+] {pair} BALANCE: {pair_balance} (${pair_usd:.2})"))?;

    let pair_percent =
        prompter.ask_f64(&format!("[+] ENTER % OF {pair} YOU WOULD LIKE TO RISK: "))?;
    prompter.say("NOTE: PAIR % WILL AUTO ADJUST IF MINIMUM COST NOT REACHED (0.001 BTC | 0.01 ETH)")?;
    prompter.say(&format!(
        "[+] RISKING {:.8} {pair} (${:.2})",
        pair_balance * pair_percent / 100.0,
        pair_usd * pair_percent / 100.0
    ))?;

    let symbol = prompter.ask_ticker(&pair, &markets)?;
    drop(prompter);

    let change_before = tickers.get(&symbol).map(|t| t.change).unwrap_or_default();

    if !(interval_secs > 0.0) {
        bail!("time interval must be positive, got {interval_secs}");
    }
    let params = PumpParams {
        symbol,
        pair_percent,
        change_before,
        sell_percent,
        step_change,
        time_interval: Duration::from_secs_f64(interval_secs),
        fill_poll: Duration::from_millis(config.fill_poll_ms),
    };
    params.validate()?;

    // ── 5. Interrupt ─────────────────────────────────────────────────────
    let (trigger, interrupt) = Interrupt::channel();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            match escalate(&trigger) {
                Escalation::Unwind => {
                    warn!("Interrupt received — unwinding position (Ctrl+C again to abort)");
                }
                Escalation::Abort => {
                    error!("Second interrupt — aborting, open orders may remain on the book");
                    std::process::exit(130);
                }
            }
        }
    });

    // ── 6. Staged exit ───────────────────────────────────────────────────
    let report = StagedExit::new(engine, params, interrupt).run().await?;

    match report.outcome {
        ExitOutcome::EntryCancelled => info!("[-] ENTRY CANCELLED, NOTHING BOUGHT"),
        ExitOutcome::SoldOut => info!(pnl_pct = report.pnl_pct, "[+] SOLD OUT"),
        ExitOutcome::Liquidated => info!(pnl_pct = report.pnl_pct, "[+] POSITION LIQUIDATED"),
    }
    match serde_json::to_string(&report) {
        Ok(json) => info!(report = %json, "Run finished"),
        Err(e) => warn!(error = %e, "Failed to serialise run report"),
    }

    Ok(())
}
