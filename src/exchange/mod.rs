// =============================================================================
// Exchange abstraction
// =============================================================================
//
// Everything the bot needs from a venue. `BinanceClient` talks to the real
// exchange; `PaperExchange` simulates fills in memory for demo mode and tests.

pub mod error;
pub mod paper;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{Balances, Order, Symbol, Ticker};

pub use error::ExchangeError;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Short venue name for logs.
    fn name(&self) -> &str;

    /// All tradable markets.
    async fn load_markets(&self) -> ExchangeResult<Vec<Symbol>>;

    async fn fetch_balance(&self) -> ExchangeResult<Balances>;

    async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker>;

    /// 24h tickers for every known market.
    async fn fetch_tickers(&self) -> ExchangeResult<HashMap<Symbol, Ticker>>;

    async fn create_market_buy_order(&self, symbol: &Symbol, quantity: f64)
        -> ExchangeResult<Order>;

    async fn create_market_sell_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
    ) -> ExchangeResult<Order>;

    async fn create_limit_buy_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
    ) -> ExchangeResult<Order>;

    async fn create_limit_sell_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
    ) -> ExchangeResult<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> ExchangeResult<Order>;

    async fn fetch_open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<Order>>;
}
