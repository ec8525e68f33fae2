// =============================================================================
// Staged Exit Controller — buy, then ladder the position out
// =============================================================================
//
// Phases:
//   ENTERING             limit buy at the ask, poll the free balance until
//                        it grows past the pre-buy snapshot.
//   HOLDING_AND_SELLING  each cycle: limit sell 100 % of the balance at the
//                        ladder target, wait one interval, cancel whatever
//                        is left of the order, lower the target.
//   EXITED               balance sold out, entry cancelled, or liquidated at
//                        market after an interrupt.
//
// Re-selling the *current* balance every cycle absorbs partial fills into the
// next cycle's quantity. The interrupt is honoured between exchange calls and
// during waits only.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::interrupt::Interrupt;
use super::ladder::SellLadder;
use crate::exchange::ExchangeError;
use crate::execution::{sell_quantity, ExecutionEngine};
use crate::types::{BalanceKind, Order, Symbol};

/// Consecutive polls with the whole balance locked before giving up.
const MAX_LOCKED_POLLS: u32 = 20;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Everything the operator chooses for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpParams {
    pub symbol: Symbol,
    /// Share of the free pair balance to spend, in percent.
    pub pair_percent: f64,
    /// 24h change of the ticker when it was picked, in percent.
    pub change_before: f64,
    /// Profit target above `change_before`, in percent.
    pub sell_percent: f64,
    /// Target decrement per cycle, in percentage points.
    pub step_change: f64,
    /// Time each ladder order is left on the book.
    pub time_interval: Duration,
    /// Entry fill polling cadence.
    pub fill_poll: Duration,
}

impl PumpParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.pair_percent > 0.0 && self.pair_percent <= 100.0) {
            bail!("pair percentage must be in (0, 100], got {}", self.pair_percent);
        }
        if !(self.step_change > 0.0) {
            bail!("step change must be positive, got {}", self.step_change);
        }
        if !self.sell_percent.is_finite() || !self.change_before.is_finite() {
            bail!("sell percentage and starting change must be finite numbers");
        }
        if self.time_interval.is_zero() || self.fill_poll.is_zero() {
            bail!("time interval and fill poll must be non-zero");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Entering,
    HoldingAndSelling,
    Exited,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entering => write!(f, "ENTERING"),
            Self::HoldingAndSelling => write!(f, "HOLDING_AND_SELLING"),
            Self::Exited => write!(f, "EXITED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitOutcome {
    /// Interrupted before the entry filled; open orders cancelled.
    EntryCancelled,
    /// The ladder sold the whole position.
    SoldOut,
    /// Interrupted while laddering; the remainder went at market.
    Liquidated,
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitReport {
    pub symbol: Symbol,
    pub outcome: ExitOutcome,
    pub entry_price: f64,
    /// Quantity of the entry order.
    pub bought: f64,
    /// Ladder orders placed.
    pub cycles: u32,
    /// Target of each ladder order, in percent above entry.
    pub targets_pct: Vec<f64>,
    /// Market sell placed on interrupt, if any.
    pub final_sale: Option<Order>,
    /// Change of the free pair balance over the run, in percent.
    pub pnl_pct: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct StagedExit {
    engine: Arc<ExecutionEngine>,
    params: PumpParams,
    interrupt: Interrupt,
    phase: Phase,
}

impl StagedExit {
    pub fn new(engine: Arc<ExecutionEngine>, params: PumpParams, interrupt: Interrupt) -> Self {
        Self {
            engine,
            params,
            interrupt,
            phase: Phase::Entering,
        }
    }

    fn enter_phase(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "phase transition");
        self.phase = phase;
    }

    /// Run the strategy to completion.
    pub async fn run(mut self) -> Result<ExitReport> {
        self.params.validate()?;
        let started_at = Utc::now();
        let symbol = self.params.symbol.clone();
        let engine = self.engine.clone();

        // ── Entry ────────────────────────────────────────────────────────
        let ticker = engine
            .fetch_ticker(&symbol)
            .await
            .with_context(|| format!("failed to fetch ticker {symbol}"))?;
        let entry_price = ticker.entry_price();
        let start_change = ticker.change;

        let pair_start = engine.fetch_balance(&symbol.quote, BalanceKind::Free).await?;
        let ticker_start = engine.fetch_balance(&symbol.base, BalanceKind::Free).await?;

        let buy_order = engine
            .limit_buy(&symbol, self.params.pair_percent, entry_price, true)
            .await
            .with_context(|| format!("entry buy on {symbol} failed"))?;
        info!(
            symbol = %symbol,
            quantity = buy_order.quantity,
            price = entry_price,
            "[+] BUY ORDER PLACED"
        );

        let mut report = ExitReport {
            symbol: symbol.clone(),
            outcome: ExitOutcome::SoldOut,
            entry_price,
            bought: buy_order.quantity,
            cycles: 0,
            targets_pct: Vec::new(),
            final_sale: None,
            pnl_pct: 0.0,
            started_at,
            finished_at: started_at,
        };

        // ── ENTERING ─────────────────────────────────────────────────────
        self.enter_phase(Phase::Entering);
        while engine.fetch_balance(&symbol.base, BalanceKind::Free).await? <= ticker_start {
            if self.interrupt.sleep(self.params.fill_poll).await {
                engine.cancel_open_orders(&symbol).await?;
                warn!(symbol = %symbol, "[-] ORDER CANCELED");
                report.outcome = ExitOutcome::EntryCancelled;
                return self.finish(report, pair_start).await;
            }
            info!("[-] ORDER NOT FILLED . . . PRESS CTRL+C TO CANCEL AND EXIT");
        }
        info!(
            symbol = %symbol,
            quantity = buy_order.quantity,
            price = entry_price,
            "[+] BUY ORDER FILLED: BOUGHT {} {} at {}",
            buy_order.quantity,
            symbol.base,
            entry_price
        );

        // ── HOLDING_AND_SELLING ──────────────────────────────────────────
        self.enter_phase(Phase::HoldingAndSelling);
        let mut ladder = SellLadder::new(
            entry_price,
            self.params.sell_percent,
            self.params.change_before,
            self.params.step_change,
        );

        let mut locked_polls = 0;
        loop {
            if self.interrupt.is_set() {
                report.final_sale = self.liquidate().await?;
                report.outcome = ExitOutcome::Liquidated;
                break;
            }

            let remaining = engine.fetch_balance(&symbol.base, BalanceKind::Total).await?;
            if sell_quantity(remaining, 100.0) <= 0.0 {
                debug!(symbol = %symbol, remaining, "nothing left to sell");
                break;
            }

            let target = ladder.target_price();
            let sell_order = match engine.limit_sell(&symbol, 100.0, target, true).await {
                Ok(order) => order,
                Err(ExchangeError::ZeroQuantity(_)) => {
                    // Balance is held by some other order; free it up.
                    locked_polls += 1;
                    if locked_polls > MAX_LOCKED_POLLS {
                        bail!(
                            "{remaining} {} stays locked by orders outside {symbol}",
                            symbol.base
                        );
                    }
                    warn!(symbol = %symbol, remaining, "balance locked, cancelling open orders");
                    engine.cancel_open_orders(&symbol).await?;
                    self.interrupt.sleep(self.params.fill_poll).await;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("ladder sell on {symbol} failed"))
                }
            };
            locked_polls = 0;
            report.cycles += 1;
            report.targets_pct.push(ladder.target_pct());

            info!(
                symbol = %symbol,
                cycle = report.cycles,
                "[+] SELLING {} {} at {}",
                sell_order.quantity,
                symbol.base,
                sell_order.price
            );
            match engine.fetch_ticker(&symbol).await {
                Ok(t) => info!(
                    "[+] START CHANGE: {} | CURRENT CHANGE: {} | TARGET: {}",
                    start_change,
                    t.change,
                    ladder.target_pct()
                ),
                Err(e) => warn!(symbol = %symbol, error = %e, "could not refresh ticker"),
            }
            info!("[-] WAITING . . . PRESS CTRL+C TO SELL AT MARKET");

            let interrupted = self.interrupt.sleep(self.params.time_interval).await;

            if engine.cancel_order(&sell_order.id, &symbol).await?.is_none() {
                debug!(symbol = %symbol, id = %sell_order.id, "ladder order filled before cancel");
            }

            if interrupted {
                report.final_sale = self.liquidate().await?;
                report.outcome = ExitOutcome::Liquidated;
                break;
            }
            ladder.step();
        }

        if report.outcome == ExitOutcome::SoldOut {
            info!("[+] SOLD EVERYTHING . . .");
        }
        self.finish(report, pair_start).await
    }

    /// Cancel everything on the symbol and sell the rest at market.
    async fn liquidate(&self) -> Result<Option<Order>> {
        let symbol = &self.params.symbol;
        self.engine.cancel_open_orders(symbol).await?;

        let free = self.engine.fetch_balance(&symbol.base, BalanceKind::Free).await?;
        if sell_quantity(free, 100.0) <= 0.0 {
            info!(symbol = %symbol, "nothing left to liquidate");
            return Ok(None);
        }

        let order = self
            .engine
            .sell(symbol, 100.0, true)
            .await
            .with_context(|| format!("market liquidation of {symbol} failed"))?;
        warn!(
            symbol = %symbol,
            "[-] SOLD AT MARKET: {} {} AT {}",
            order.filled,
            symbol.base,
            order.price
        );
        Ok(Some(order))
    }

    async fn finish(mut self, mut report: ExitReport, pair_start: f64) -> Result<ExitReport> {
        self.enter_phase(Phase::Exited);
        let pair_end = self
            .engine
            .fetch_balance(&self.params.symbol.quote, BalanceKind::Free)
            .await?;
        report.pnl_pct = if pair_start > 0.0 {
            100.0 * (pair_end / pair_start) - 100.0
        } else {
            0.0
        };
        report.finished_at = Utc::now();
        info!(
            outcome = ?report.outcome,
            cycles = report.cycles,
            "[+] TOTAL PROFIT/LOSS: {:.2}%",
            report.pnl_pct
        );
        Ok(report)
    }
}
