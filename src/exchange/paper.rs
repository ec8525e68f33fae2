// =============================================================================
// Paper Exchange — in-memory simulated venue for demo mode
// =============================================================================
//
// Fill model:
//   - Market orders fill immediately at the ask (buy) or bid (sell).
//   - Limit orders that cross the book on placement fill immediately at the
//     opposite side of the book.
//   - Resting limit orders reserve their funds and fill at their own price
//     once the ticker crosses them. Matching runs whenever balances, tickers
//     or open orders are read.
//   - Crossing fills are all-or-nothing; a partially filled order keeps its
//     remainder reserved until it fills or is cancelled.
//
// With a price feed attached, tickers are refreshed from the feed (normally
// the public Binance endpoints) while balances and orders stay local. Markets
// with resting orders are re-priced before every balance, open-order or
// cancel read so fills during a wait are not missed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Exchange, ExchangeError, ExchangeResult};
use crate::types::{
    BalanceEntry, Balances, Order, OrderStatus, OrderType, Side, Symbol, Ticker,
};

#[derive(Default)]
struct Book {
    balances: HashMap<String, BalanceEntry>,
    tickers: HashMap<Symbol, Ticker>,
    open: Vec<Order>,
    frozen: bool,
}

impl Book {
    fn entry(&mut self, asset: &str) -> &mut BalanceEntry {
        self.balances.entry(asset.to_string()).or_default()
    }

    fn adjust(&mut self, asset: &str, free_delta: f64, used_delta: f64) {
        let e = self.entry(asset);
        e.free += free_delta;
        e.used += used_delta;
        e.total = e.free + e.used;
    }

    fn ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker> {
        self.tickers
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::BadSymbol(symbol.to_string()))
    }

    /// Settle a fill that was never reserved (taker fills).
    fn settle_taker(&mut self, symbol: &Symbol, side: Side, quantity: f64, price: f64) {
        let notional = quantity * price;
        match side {
            Side::Buy => {
                self.adjust(&symbol.quote, -notional, 0.0);
                self.adjust(&symbol.base, quantity, 0.0);
            }
            Side::Sell => {
                self.adjust(&symbol.base, -quantity, 0.0);
                self.adjust(&symbol.quote, notional, 0.0);
            }
        }
    }

    /// Move reserved funds of a resting order either into the fill or back
    /// to free.
    fn release(&mut self, order: &Order, filled: bool) {
        let remaining = order.quantity - order.filled;
        match (order.side, filled) {
            (Side::Buy, true) => {
                self.adjust(&order.symbol.quote, 0.0, -remaining * order.price);
                self.adjust(&order.symbol.base, remaining, 0.0);
            }
            (Side::Buy, false) => {
                self.adjust(&order.symbol.quote, remaining * order.price, -remaining * order.price);
            }
            (Side::Sell, true) => {
                self.adjust(&order.symbol.base, 0.0, -remaining);
                self.adjust(&order.symbol.quote, remaining * order.price, 0.0);
            }
            (Side::Sell, false) => {
                self.adjust(&order.symbol.base, remaining, -remaining);
            }
        }
    }

    fn crosses(&self, order: &Order) -> bool {
        let Some(t) = self.tickers.get(&order.symbol) else {
            return false;
        };
        match order.side {
            Side::Buy => t.ask > 0.0 && order.price >= t.ask,
            Side::Sell => t.bid > 0.0 && order.price <= t.bid,
        }
    }

    fn match_resting(&mut self) {
        if self.frozen {
            return;
        }
        let (hits, rest): (Vec<Order>, Vec<Order>) = std::mem::take(&mut self.open)
            .into_iter()
            .partition(|o| self.crosses(o));
        self.open = rest;
        for mut order in hits {
            self.release(&order, true);
            order.filled = order.quantity;
            order.status = OrderStatus::Filled;
            debug!(id = %order.id, symbol = %order.symbol, side = %order.side, price = order.price, "paper order filled");
        }
    }

    /// Execute `quantity` of a resting order at its own price.
    #[cfg(test)]
    fn fill_part(&mut self, order_id: &str, quantity: f64) -> Option<Order> {
        let idx = self.open.iter().position(|o| o.id == order_id)?;
        let mut order = self.open[idx].clone();
        let qty = quantity.min(order.quantity - order.filled);
        match order.side {
            Side::Buy => {
                self.adjust(&order.symbol.quote, 0.0, -qty * order.price);
                self.adjust(&order.symbol.base, qty, 0.0);
            }
            Side::Sell => {
                self.adjust(&order.symbol.base, 0.0, -qty);
                self.adjust(&order.symbol.quote, qty * order.price, 0.0);
            }
        }
        order.filled += qty;
        if order.filled >= order.quantity {
            order.status = OrderStatus::Filled;
            self.open.remove(idx);
        } else {
            order.status = OrderStatus::PartiallyFilled;
            self.open[idx] = order.clone();
        }
        Some(order)
    }

    fn check_funds(&self, symbol: &Symbol, side: Side, quantity: f64, price: f64) -> ExchangeResult<()> {
        let (asset, needed) = match side {
            Side::Buy => (&symbol.quote, quantity * price),
            Side::Sell => (&symbol.base, quantity),
        };
        let available = self.balances.get(asset).map(|b| b.free).unwrap_or(0.0);
        if needed > available + 1e-12 {
            return Err(ExchangeError::InsufficientFunds(format!(
                "need {needed} {asset}, have {available}"
            )));
        }
        Ok(())
    }

    fn place(
        &mut self,
        symbol: &Symbol,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        limit: Option<f64>,
    ) -> ExchangeResult<Order> {
        if !(quantity > 0.0) {
            return Err(ExchangeError::InvalidArgument(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        let ticker = self.ticker(symbol)?;
        let touch = match side {
            Side::Buy => ticker.entry_price(),
            Side::Sell => {
                if ticker.bid > 0.0 {
                    ticker.bid
                } else {
                    ticker.last
                }
            }
        };

        let mut order = Order {
            id: Uuid::new_v4().simple().to_string(),
            symbol: symbol.clone(),
            side,
            order_type,
            quantity,
            filled: 0.0,
            price: limit.unwrap_or(touch),
            status: OrderStatus::Open,
        };

        let takes = match order_type {
            OrderType::Market => true,
            OrderType::Limit => !self.frozen && self.crosses(&order),
        };

        if takes {
            if !(touch > 0.0) {
                return Err(ExchangeError::Exchange(format!("no liquidity for {symbol}")));
            }
            self.check_funds(symbol, side, quantity, touch)?;
            self.settle_taker(symbol, side, quantity, touch);
            order.price = touch;
            order.filled = quantity;
            order.status = OrderStatus::Filled;
        } else {
            self.check_funds(symbol, side, quantity, order.price)?;
            match side {
                Side::Buy => {
                    let notional = quantity * order.price;
                    self.adjust(&symbol.quote, -notional, notional);
                }
                Side::Sell => self.adjust(&symbol.base, -quantity, quantity),
            }
            self.open.push(order.clone());
        }

        debug!(id = %order.id, symbol = %symbol, side = %side, quantity, price = order.price, status = ?order.status, "paper order accepted");
        Ok(order)
    }
}

/// Simulated exchange with an in-memory order book.
pub struct PaperExchange {
    feed: Option<Arc<dyn Exchange>>,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            feed: None,
            book: Mutex::new(Book::default()),
        }
    }

    /// Paper trading against live prices from `feed`.
    pub fn with_feed(feed: Arc<dyn Exchange>) -> Self {
        info!(feed = feed.name(), "paper exchange using live price feed");
        Self {
            feed: Some(feed),
            book: Mutex::new(Book::default()),
        }
    }

    /// Set the free balance of `asset`, leaving reserved funds untouched.
    pub fn set_balance(&self, asset: &str, free: f64) {
        let mut book = self.book.lock();
        let e = book.entry(&asset.to_uppercase());
        e.free = free;
        e.total = e.free + e.used;
    }

    #[cfg(test)]
    pub fn set_ticker(&self, ticker: Ticker) {
        let mut book = self.book.lock();
        book.tickers.insert(ticker.symbol.clone(), ticker);
        book.match_resting();
    }

    /// While frozen, limit orders rest and never fill.
    #[cfg(test)]
    pub fn freeze_fills(&self, frozen: bool) {
        let mut book = self.book.lock();
        book.frozen = frozen;
        book.match_resting();
    }

    #[cfg(test)]
    pub fn balance_of(&self, asset: &str) -> BalanceEntry {
        self.book.lock().balances.get(asset).copied().unwrap_or_default()
    }

    /// Fill part of a resting order, as a thin book would.
    #[cfg(test)]
    pub fn fill_partially(&self, order_id: &str, quantity: f64) -> Option<Order> {
        self.book.lock().fill_part(order_id, quantity)
    }

    /// Re-price markets with resting orders (only `symbol` when given).
    async fn refresh_resting(&self, symbol: Option<&Symbol>) -> ExchangeResult<()> {
        let Some(feed) = &self.feed else {
            return Ok(());
        };
        let mut symbols: Vec<Symbol> = self
            .book
            .lock()
            .open
            .iter()
            .map(|o| o.symbol.clone())
            .filter(|s| symbol.map_or(true, |only| only == s))
            .collect();
        symbols.sort();
        symbols.dedup();

        for s in symbols {
            let ticker = feed.fetch_ticker(&s).await?;
            self.book.lock().tickers.insert(s, ticker);
        }
        Ok(())
    }

    async fn refresh(&self, symbol: &Symbol) -> ExchangeResult<()> {
        if let Some(feed) = &self.feed {
            let ticker = feed.fetch_ticker(symbol).await?;
            self.book.lock().tickers.insert(symbol.clone(), ticker);
        }
        Ok(())
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn load_markets(&self) -> ExchangeResult<Vec<Symbol>> {
        if let Some(feed) = &self.feed {
            return feed.load_markets().await;
        }
        let mut markets: Vec<Symbol> = self.book.lock().tickers.keys().cloned().collect();
        markets.sort();
        Ok(markets)
    }

    async fn fetch_balance(&self) -> ExchangeResult<Balances> {
        self.refresh_resting(None).await?;
        let mut book = self.book.lock();
        book.match_resting();
        Ok(Balances(book.balances.clone()))
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker> {
        self.refresh(symbol).await?;
        let mut book = self.book.lock();
        book.match_resting();
        book.ticker(symbol)
    }

    async fn fetch_tickers(&self) -> ExchangeResult<HashMap<Symbol, Ticker>> {
        if let Some(feed) = &self.feed {
            let tickers = feed.fetch_tickers().await?;
            let mut book = self.book.lock();
            book.tickers.extend(tickers.clone());
            book.match_resting();
            return Ok(tickers);
        }
        Ok(self.book.lock().tickers.clone())
    }

    async fn create_market_buy_order(&self, symbol: &Symbol, quantity: f64) -> ExchangeResult<Order> {
        self.refresh(symbol).await?;
        self.book.lock().place(symbol, Side::Buy, OrderType::Market, quantity, None)
    }

    async fn create_market_sell_order(&self, symbol: &Symbol, quantity: f64) -> ExchangeResult<Order> {
        self.refresh(symbol).await?;
        self.book.lock().place(symbol, Side::Sell, OrderType::Market, quantity, None)
    }

    async fn create_limit_buy_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
    ) -> ExchangeResult<Order> {
        self.refresh(symbol).await?;
        self.book.lock().place(symbol, Side::Buy, OrderType::Limit, quantity, Some(price))
    }

    async fn create_limit_sell_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
    ) -> ExchangeResult<Order> {
        self.refresh(symbol).await?;
        self.book.lock().place(symbol, Side::Sell, OrderType::Limit, quantity, Some(price))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> ExchangeResult<Order> {
        self.refresh_resting(Some(symbol)).await?;
        let mut book = self.book.lock();
        book.match_resting();
        let idx = book
            .open
            .iter()
            .position(|o| o.id == order_id && &o.symbol == symbol)
            .ok_or_else(|| ExchangeError::OrderNotFound(format!("{order_id} on {symbol}")))?;
        let mut order = book.open.remove(idx);
        book.release(&order, false);
        order.status = OrderStatus::Canceled;
        debug!(id = %order.id, symbol = %symbol, "paper order canceled");
        Ok(order)
    }

    async fn fetch_open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<Order>> {
        self.refresh_resting(Some(symbol)).await?;
        let mut book = self.book.lock();
        book.match_resting();
        Ok(book.open.iter().filter(|o| &o.symbol == symbol).cloned().collect())
    }
}

#[cfg(test)]
pub(crate) fn test_ticker(symbol: &Symbol, bid: f64, ask: f64) -> Ticker {
    Ticker {
        symbol: symbol.clone(),
        bid,
        ask,
        last: (bid + ask) / 2.0,
        high: ask,
        low: bid,
        change: 0.0,
        base_volume: 1_000_000.0,
    }
}
