// =============================================================================
// Portfolio helpers — balance listing, USD valuation and bulk operations
// =============================================================================
//
// USD values go through the pair's USDT market:
//   usd(ticker) = last(pair/USDT) * total(ticker) * last(ticker/pair)
// Reserved assets (quote and fee currencies) are never treated as positions.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::exchange::ExchangeError;
use crate::execution::ExecutionEngine;
use crate::types::{BalanceKind, Order, Symbol};

const USD_QUOTE: &str = "USDT";

/// Pairs whose USD value counts toward the portfolio total.
const VALUED_PAIRS: [&str; 3] = ["ETH", "BTC", "BNB"];

/// Assets holding at least one whole unit, excluding `reserved`.
pub async fn fetch_nonzero_balances(engine: &ExecutionEngine, reserved: &[String]) -> Result<Vec<String>> {
    let balances = engine.fetch_balances().await?;
    let mut assets: Vec<String> = balances
        .iter()
        .filter(|(asset, b)| b.total >= 1.0 && !reserved.iter().any(|r| r == *asset))
        .map(|(asset, _)| asset.clone())
        .collect();
    assets.sort();
    debug!(count = assets.len(), "non-zero balances");
    Ok(assets)
}

/// USD value of the whole `ticker` balance, priced through `pair`.
pub async fn get_usd_balance(engine: &ExecutionEngine, ticker: &str, pair: &str) -> Result<f64> {
    let pair_usd = engine.fetch_ticker(&Symbol::new(pair, USD_QUOTE)).await?.last;
    let total = engine.fetch_balance(ticker, BalanceKind::Total).await?;
    let price = engine.fetch_ticker(&Symbol::new(ticker, pair)).await?.last;
    Ok(pair_usd * total * price)
}

/// USD value of the whole balance of a pair currency (BTC, ETH, BNB, USDT).
pub async fn get_pair_usd_balance(engine: &ExecutionEngine, pair: &str) -> Result<f64> {
    let total = engine.fetch_balance(pair, BalanceKind::Total).await?;
    if pair.eq_ignore_ascii_case(USD_QUOTE) {
        return Ok(total);
    }
    let pair_usd = engine.fetch_ticker(&Symbol::new(pair, USD_QUOTE)).await?.last;
    Ok(total * pair_usd)
}

/// USD value of the account, rounded to cents. Positions are priced through
/// their ETH market.
pub async fn get_portfolio(engine: &ExecutionEngine, reserved: &[String]) -> Result<f64> {
    let mut total = engine.fetch_balance(USD_QUOTE, BalanceKind::Total).await?;
    for pair in VALUED_PAIRS {
        total += get_pair_usd_balance(engine, pair)
            .await
            .with_context(|| format!("failed to value {pair}"))?;
    }
    for ticker in fetch_nonzero_balances(engine, reserved).await? {
        total += get_usd_balance(engine, &ticker, "ETH")
            .await
            .with_context(|| format!("failed to value {ticker}"))?;
    }
    Ok((total * 100.0).round() / 100.0)
}

/// Market sell `percent` % of each ticker against `pair`.
pub async fn sell_tickers(
    engine: &ExecutionEngine,
    tickers: &[String],
    percent: f64,
    pair: &str,
) -> Result<Vec<Order>> {
    let mut orders = Vec::with_capacity(tickers.len());
    for ticker in tickers {
        let symbol = Symbol::new(ticker, pair);
        let order = engine
            .sell(&symbol, percent, true)
            .await
            .with_context(|| format!("sell of {symbol} failed"))?;
        orders.push(order);
    }
    Ok(orders)
}

/// Market buy every ticker with an equal share of the free pair balance.
///
/// The i-th buy spends `100 / (n - i)` % of what is left, so each ticker
/// gets the same amount of the pair.
pub async fn buy_tickers(engine: &ExecutionEngine, tickers: &[String], pair: &str) -> Result<Vec<Order>> {
    let n = tickers.len();
    let mut orders = Vec::with_capacity(n);
    for (i, ticker) in tickers.iter().enumerate() {
        let pair_percent = 100.0 / (n - i) as f64;
        let symbol = Symbol::new(ticker, pair);
        let order = engine
            .buy(&symbol, pair_percent, true)
            .await
            .with_context(|| format!("buy of {symbol} failed"))?;
        orders.push(order);
    }
    Ok(orders)
}

/// Sell every position into `pair`, then buy them all back in equal shares.
pub async fn normalize_balances(
    engine: &ExecutionEngine,
    reserved: &[String],
    pair: &str,
) -> Result<(Vec<Order>, Vec<Order>)> {
    let tickers = fetch_nonzero_balances(engine, reserved).await?;
    info!(count = tickers.len(), pair, "normalizing balances");
    let sells = sell_tickers(engine, &tickers, 100.0, pair).await?;
    let buys = buy_tickers(engine, &tickers, pair).await?;
    Ok((sells, buys))
}

/// Cancel open orders of `tickers` on every pair in `pairs`. With no tickers
/// given, every non-zero balance is swept. Markets that do not exist are
/// skipped.
pub async fn cancel_all_orders(
    engine: &ExecutionEngine,
    tickers: &[String],
    pairs: &[String],
    reserved: &[String],
) -> Result<usize> {
    let tickers = if tickers.is_empty() {
        fetch_nonzero_balances(engine, reserved).await?
    } else {
        tickers.to_vec()
    };

    let mut canceled = 0;
    for ticker in &tickers {
        for pair in pairs {
            let symbol = Symbol::new(ticker, pair);
            match engine.cancel_open_orders(&symbol).await {
                Ok(n) => canceled += n,
                Err(ExchangeError::BadSymbol(_)) => {
                    debug!(symbol = %symbol, "no such market, skipping");
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "failed to cancel open orders");
                    return Err(e).with_context(|| format!("cancel on {symbol} failed"));
                }
            }
        }
    }
    info!(tickers = tickers.len(), canceled, "open orders swept");
    Ok(canceled)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::{test_ticker, PaperExchange};
    use crate::exchange::Exchange;
    use crate::execution::AdjustPolicy;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;
    use tokio::time::Duration;

    fn reserved() -> Vec<String> {
        ["ETH", "BTC", "USDT", "BNB"].iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (Arc<PaperExchange>, ExecutionEngine) {
        let paper = Arc::new(PaperExchange::new());
        paper.set_ticker(test_ticker(&Symbol::new("ETH", "USDT"), 2000.0, 2000.0));
        paper.set_ticker(test_ticker(&Symbol::new("BTC", "USDT"), 30000.0, 30000.0));
        paper.set_ticker(test_ticker(&Symbol::new("BNB", "USDT"), 300.0, 300.0));
        paper.set_ticker(test_ticker(&Symbol::new("TRX", "ETH"), 0.01, 0.01));
        paper.set_ticker(test_ticker(&Symbol::new("ADA", "ETH"), 0.02, 0.02));
        paper.set_balance("ETH", 1.0);
        paper.set_balance("USDT", 50.0);
        paper.set_balance("TRX", 100.0);
        paper.set_balance("ADA", 0.5);
        let engine = ExecutionEngine::new(
            paper.clone(),
            RetryPolicy::new(2, Duration::from_millis(10)),
            AdjustPolicy::default(),
        );
        (paper, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn nonzero_balances_skip_reserved_and_dust() {
        let (_paper, engine) = setup();
        let assets = fetch_nonzero_balances(&engine, &reserved()).await.unwrap();
        assert_eq!(assets, vec!["TRX"]);
    }

    #[tokio::test(start_paused = true)]
    async fn usd_valuation_goes_through_the_pair() {
        let (_paper, engine) = setup();
        // 100 TRX * 0.01 ETH * 2000 USD
        let usd = get_usd_balance(&engine, "TRX", "ETH").await.unwrap();
        assert!((usd - 2000.0).abs() < 1e-6);
        assert_eq!(get_pair_usd_balance(&engine, "ETH").await.unwrap(), 2000.0);
        assert_eq!(get_pair_usd_balance(&engine, "USDT").await.unwrap(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn portfolio_sums_pairs_cash_and_positions() {
        let (_paper, engine) = setup();
        // ETH 2000 + USDT 50 + TRX 2000 (BTC and BNB are empty)
        assert_eq!(get_portfolio(&engine, &reserved()).await.unwrap(), 4050.0);
    }

    #[tokio::test(start_paused = true)]
    async fn buy_tickers_splits_the_pair_evenly() {
        let (paper, engine) = setup();
        let tickers = vec!["TRX".to_string(), "ADA".to_string()];
        let orders = buy_tickers(&engine, &tickers, "ETH").await.unwrap();
        // 0.5 ETH each: 50 TRX at 0.01, 25 ADA at 0.02
        assert_eq!(orders[0].quantity, 50.0);
        assert_eq!(orders[1].quantity, 25.0);
        assert!(paper.balance_of("ETH").free.abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn normalize_sells_then_rebuys_positions() {
        let (paper, engine) = setup();
        let (sells, buys) = normalize_balances(&engine, &reserved(), "ETH").await.unwrap();
        assert_eq!(sells.len(), 1);
        assert_eq!(buys.len(), 1);
        assert_eq!(paper.balance_of("TRX").free, 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_skips_missing_markets() {
        let (paper, engine) = setup();
        paper
            .create_limit_sell_order(&Symbol::new("TRX", "ETH"), 10.0, 0.5)
            .await
            .unwrap();
        let pairs = vec!["ETH".to_string(), "BTC".to_string()];
        let canceled = cancel_all_orders(&engine, &[], &pairs, &reserved()).await.unwrap();
        assert_eq!(canceled, 1);
        assert_eq!(paper.balance_of("TRX").free, 100.0);
    }
}
