// =============================================================================
// Execution Engine — retried exchange access, position sizing and order
// placement with bounded size step-down
// =============================================================================
//
// Every read goes through the retry policy. Order placement has its own loop:
// when the exchange refuses an order for lack of funds (or another generic
// rejection) and auto-adjust is on, the working quantity shrinks by
// `step_pct` and the order is resubmitted after `pause_ms`. The loop is
// capped by `max_attempts`.
//
// Quantities are floor-truncated to whole units right before submission.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::exchange::{Exchange, ExchangeError, ExchangeResult};
use crate::retry::RetryPolicy;
use crate::types::{BalanceKind, Balances, Order, OrderType, Side, Symbol, Ticker};

// ---------------------------------------------------------------------------
// Step-down policy
// ---------------------------------------------------------------------------

fn default_step_pct() -> f64 {
    1.0
}

fn default_pause_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    100
}

/// How rejected orders are resized and resubmitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustPolicy {
    /// Percentage removed from the working quantity per rejection.
    #[serde(default = "default_step_pct")]
    pub step_pct: f64,

    /// Pause before resubmitting (milliseconds).
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,

    /// Submissions before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for AdjustPolicy {
    fn default() -> Self {
        Self {
            step_pct: default_step_pct(),
            pause_ms: default_pause_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Whole units of the ticker bought with `pair_percent` % of `pair_balance`
/// at `price`.
pub fn buy_quantity(pair_balance: f64, pair_percent: f64, price: f64) -> f64 {
    if !(price > 0.0) {
        return 0.0;
    }
    (pair_balance * (pair_percent / 100.0) / price).floor()
}

/// Whole units of the ticker making up `percent` % of `balance`.
pub fn sell_quantity(balance: f64, percent: f64) -> f64 {
    (balance * (percent / 100.0)).floor()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The exchange session plus the policies every call goes through.
pub struct ExecutionEngine {
    exchange: Arc<dyn Exchange>,
    retry: RetryPolicy,
    adjust: AdjustPolicy,
}

impl ExecutionEngine {
    pub fn new(exchange: Arc<dyn Exchange>, retry: RetryPolicy, adjust: AdjustPolicy) -> Self {
        Self {
            exchange,
            retry,
            adjust,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn load_markets(&self) -> ExchangeResult<Vec<Symbol>> {
        self.retry.run("load_markets", || self.exchange.load_markets()).await
    }

    pub async fn fetch_balances(&self) -> ExchangeResult<Balances> {
        self.retry.run("fetch_balance", || self.exchange.fetch_balance()).await
    }

    /// One bucket of one asset's balance.
    pub async fn fetch_balance(&self, asset: &str, kind: BalanceKind) -> ExchangeResult<f64> {
        let balances = self.fetch_balances().await?;
        Ok(balances.get(asset, kind))
    }

    pub async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker> {
        self.retry.run("fetch_ticker", || self.exchange.fetch_ticker(symbol)).await
    }

    /// Every market's ticker in one request.
    pub async fn fetch_all_tickers(&self) -> ExchangeResult<HashMap<Symbol, Ticker>> {
        self.retry.run("fetch_tickers", || self.exchange.fetch_tickers()).await
    }

    pub async fn fetch_open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<Order>> {
        self.retry
            .run("fetch_open_orders", || self.exchange.fetch_open_orders(symbol))
            .await
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Market buy with `pair_percent` % of the free pair balance, sized at the
    /// last traded price.
    pub async fn buy(&self, symbol: &Symbol, pair_percent: f64, auto_adjust: bool) -> ExchangeResult<Order> {
        let pair_balance = self.fetch_balance(&symbol.quote, BalanceKind::Free).await?;
        let price = self.fetch_ticker(symbol).await?.last;
        let quantity = buy_quantity(pair_balance, pair_percent, price);
        info!(symbol = %symbol, pair_balance, pair_percent, price, quantity, "market buy");
        self.submit(symbol, Side::Buy, OrderType::Market, quantity, None, auto_adjust)
            .await
    }

    /// Limit buy at `price` with `pair_percent` % of the free pair balance.
    pub async fn limit_buy(
        &self,
        symbol: &Symbol,
        pair_percent: f64,
        price: f64,
        auto_adjust: bool,
    ) -> ExchangeResult<Order> {
        let pair_balance = self.fetch_balance(&symbol.quote, BalanceKind::Free).await?;
        let quantity = buy_quantity(pair_balance, pair_percent, price);
        info!(symbol = %symbol, pair_balance, pair_percent, price, quantity, "limit buy");
        self.submit(symbol, Side::Buy, OrderType::Limit, quantity, Some(price), auto_adjust)
            .await
    }

    /// Market sell of `percent` % of the free ticker balance.
    pub async fn sell(&self, symbol: &Symbol, percent: f64, auto_adjust: bool) -> ExchangeResult<Order> {
        let balance = self.fetch_balance(&symbol.base, BalanceKind::Free).await?;
        let quantity = sell_quantity(balance, percent);
        info!(symbol = %symbol, balance, percent, quantity, "market sell");
        self.submit(symbol, Side::Sell, OrderType::Market, quantity, None, auto_adjust)
            .await
    }

    /// Limit sell of `percent` % of the free ticker balance at `price`.
    pub async fn limit_sell(
        &self,
        symbol: &Symbol,
        percent: f64,
        price: f64,
        auto_adjust: bool,
    ) -> ExchangeResult<Order> {
        let balance = self.fetch_balance(&symbol.base, BalanceKind::Free).await?;
        let quantity = sell_quantity(balance, percent);
        info!(symbol = %symbol, balance, percent, price, quantity, "limit sell");
        self.submit(symbol, Side::Sell, OrderType::Limit, quantity, Some(price), auto_adjust)
            .await
    }

    async fn place(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> ExchangeResult<Order> {
        match (side, order_type, price) {
            (Side::Buy, OrderType::Market, _) => self.exchange.create_market_buy_order(symbol, quantity).await,
            (Side::Sell, OrderType::Market, _) => self.exchange.create_market_sell_order(symbol, quantity).await,
            (Side::Buy, OrderType::Limit, Some(p)) => self.exchange.create_limit_buy_order(symbol, quantity, p).await,
            (Side::Sell, OrderType::Limit, Some(p)) => self.exchange.create_limit_sell_order(symbol, quantity, p).await,
            (_, OrderType::Limit, None) => Err(ExchangeError::InvalidArgument(
                "limit order without a price".into(),
            )),
        }
    }

    /// Submit an order, shrinking it on rejection when `auto_adjust` is set.
    async fn submit(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        auto_adjust: bool,
    ) -> ExchangeResult<Order> {
        let attempts = self.adjust.max_attempts.max(1);
        let shrink = 1.0 - self.adjust.step_pct / 100.0;
        let mut amount = quantity;
        let mut last = None;

        for attempt in 1..=attempts {
            let qty = amount.floor();
            if qty <= 0.0 {
                return Err(ExchangeError::ZeroQuantity(symbol.to_string()));
            }

            match self.place(symbol, side, order_type, qty, price).await {
                Ok(order) => {
                    debug!(symbol = %symbol, %side, %order_type, quantity = qty, attempt, id = %order.id, "order accepted");
                    return Ok(order);
                }
                Err(e) if e.is_transient() => {
                    if auto_adjust && e.warrants_size_step_down() {
                        amount *= shrink;
                        warn!(symbol = %symbol, %side, error = %e, next_quantity = amount.floor(), "order rejected, stepping size down");
                    } else {
                        warn!(symbol = %symbol, %side, error = %e, quantity = qty, "order rejected, resubmitting");
                    }
                    last = Some(e);
                    if attempt < attempts {
                        sleep(Duration::from_millis(self.adjust.pause_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ExchangeError::AdjustExhausted {
            symbol: symbol.to_string(),
            attempts,
            quantity: amount.floor(),
            last: Box::new(last.unwrap_or_else(|| ExchangeError::Exchange("no attempt made".into()))),
        })
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel one order. `None` means the exchange no longer knows the order,
    /// which for our own ids means it already filled.
    pub async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> ExchangeResult<Option<Order>> {
        match self
            .retry
            .run("cancel_order", || self.exchange.cancel_order(order_id, symbol))
            .await
        {
            Ok(order) => Ok(Some(order)),
            Err(ExchangeError::OrderNotFound(detail)) => {
                debug!(symbol = %symbol, order_id, detail = %detail, "order already gone");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel every open order on `symbol`; returns how many were canceled.
    pub async fn cancel_open_orders(&self, symbol: &Symbol) -> ExchangeResult<usize> {
        let mut canceled = 0;
        let open = self.fetch_open_orders(symbol).await?;
        for order in open.iter().filter(|o| o.is_open()) {
            if self.cancel_order(&order.id, symbol).await?.is_some() {
                canceled += 1;
            }
        }
        if canceled > 0 {
            info!(symbol = %symbol, canceled, "open orders canceled");
        }
        Ok(canceled)
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("exchange", &self.exchange.name())
            .field("retry", &self.retry)
            .field("adjust", &self.adjust)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::{test_ticker, PaperExchange};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn trx_eth() -> Symbol {
        Symbol::new("TRX", "ETH")
    }

    fn engine(exchange: Arc<dyn Exchange>) -> ExecutionEngine {
        ExecutionEngine::new(
            exchange,
            RetryPolicy::new(3, Duration::from_secs(2)),
            AdjustPolicy {
                step_pct: 1.0,
                pause_ms: 1000,
                max_attempts: 5,
            },
        )
    }

    /// Accepts orders only up to `max_quantity`, recording every submission.
    struct PickyExchange {
        max_quantity: f64,
        rejection: ExchangeError,
        submitted: Mutex<Vec<f64>>,
    }

    impl PickyExchange {
        fn new(max_quantity: f64, rejection: ExchangeError) -> Self {
            Self {
                max_quantity,
                rejection,
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn order(&self, symbol: &Symbol, side: Side, quantity: f64) -> ExchangeResult<Order> {
            self.submitted.lock().push(quantity);
            if quantity > self.max_quantity {
                return Err(self.rejection.clone());
            }
            Ok(Order {
                id: "1".into(),
                symbol: symbol.clone(),
                side,
                order_type: OrderType::Market,
                quantity,
                filled: quantity,
                price: 0.01,
                status: crate::types::OrderStatus::Filled,
            })
        }
    }

    #[async_trait]
    impl Exchange for PickyExchange {
        fn name(&self) -> &str {
            "picky"
        }
        async fn load_markets(&self) -> ExchangeResult<Vec<Symbol>> {
            Ok(vec![trx_eth()])
        }
        async fn fetch_balance(&self) -> ExchangeResult<Balances> {
            let mut map = HashMap::new();
            map.insert("ETH".to_string(), crate::types::BalanceEntry::new(10.0, 0.0));
            map.insert("TRX".to_string(), crate::types::BalanceEntry::new(123.7, 0.0));
            Ok(Balances(map))
        }
        async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker> {
            Ok(test_ticker(symbol, 0.01, 0.01))
        }
        async fn fetch_tickers(&self) -> ExchangeResult<HashMap<Symbol, Ticker>> {
            Ok(HashMap::new())
        }
        async fn create_market_buy_order(&self, symbol: &Symbol, quantity: f64) -> ExchangeResult<Order> {
            self.order(symbol, Side::Buy, quantity)
        }
        async fn create_market_sell_order(&self, symbol: &Symbol, quantity: f64) -> ExchangeResult<Order> {
            self.order(symbol, Side::Sell, quantity)
        }
        async fn create_limit_buy_order(&self, symbol: &Symbol, quantity: f64, _price: f64) -> ExchangeResult<Order> {
            self.order(symbol, Side::Buy, quantity)
        }
        async fn create_limit_sell_order(&self, symbol: &Symbol, quantity: f64, _price: f64) -> ExchangeResult<Order> {
            self.order(symbol, Side::Sell, quantity)
        }
        async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> ExchangeResult<Order> {
            Err(ExchangeError::OrderNotFound(order_id.to_string()))
        }
        async fn fetch_open_orders(&self, _symbol: &Symbol) -> ExchangeResult<Vec<Order>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn buy_quantity_is_floored() {
        assert_eq!(buy_quantity(10.0, 50.0, 0.01), 500.0);
        assert_eq!(buy_quantity(1.0, 100.0, 0.3), 3.0);
        assert_eq!(buy_quantity(1.0, 100.0, 0.0), 0.0);
    }

    #[test]
    fn sell_quantity_is_floored() {
        assert_eq!(sell_quantity(123.7, 100.0), 123.0);
        assert_eq!(sell_quantity(10.0, 25.0), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn market_buy_uses_half_the_pair_balance() {
        let paper = Arc::new(PaperExchange::new());
        paper.set_balance("ETH", 10.0);
        paper.set_ticker(test_ticker(&trx_eth(), 0.01, 0.01));

        let order = engine(paper.clone()).buy(&trx_eth(), 50.0, true).await.unwrap();
        assert_eq!(order.quantity, 500.0);
        assert_eq!(paper.balance_of("TRX").free, 500.0);
        assert!((paper.balance_of("ETH").free - 5.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_funds_steps_size_down_one_percent() {
        let picky = Arc::new(PickyExchange::new(
            490.0,
            ExchangeError::InsufficientFunds("low".into()),
        ));
        let order = engine(picky.clone()).buy(&trx_eth(), 50.0, true).await.unwrap();

        assert_eq!(order.quantity, 490.0);
        assert_eq!(*picky.submitted.lock(), vec![500.0, 495.0, 490.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn without_auto_adjust_size_stays_and_attempts_are_capped() {
        let picky = Arc::new(PickyExchange::new(
            490.0,
            ExchangeError::InsufficientFunds("low".into()),
        ));
        let err = engine(picky.clone()).buy(&trx_eth(), 50.0, false).await.unwrap_err();

        assert!(matches!(err, ExchangeError::AdjustExhausted { attempts: 5, .. }));
        assert_eq!(*picky.submitted.lock(), vec![500.0; 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn network_rejection_does_not_shrink() {
        let picky = Arc::new(PickyExchange::new(
            0.0,
            ExchangeError::Network("reset".into()),
        ));
        let err = engine(picky.clone()).sell(&trx_eth(), 100.0, true).await.unwrap_err();

        assert!(matches!(err, ExchangeError::AdjustExhausted { .. }));
        assert_eq!(*picky.submitted.lock(), vec![123.0; 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_rejection_is_not_retried() {
        let picky = Arc::new(PickyExchange::new(
            0.0,
            ExchangeError::BadSymbol("TRX/ETH".into()),
        ));
        let err = engine(picky.clone())
            .limit_sell(&trx_eth(), 100.0, 0.02, true)
            .await
            .unwrap_err();

        assert!(matches!(err, ExchangeError::BadSymbol(_)));
        assert_eq!(picky.submitted.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_balance_is_zero_quantity() {
        let paper = Arc::new(PaperExchange::new());
        paper.set_balance("ETH", 0.001);
        paper.set_ticker(test_ticker(&trx_eth(), 0.01, 0.01));

        let err = engine(paper).limit_buy(&trx_eth(), 50.0, 0.01, true).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ZeroQuantity(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_of_vanished_order_is_none() {
        let picky = Arc::new(PickyExchange::new(0.0, ExchangeError::Exchange("x".into())));
        let result = engine(picky).cancel_order("42", &trx_eth()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_open_orders_clears_the_book() {
        let paper = Arc::new(PaperExchange::new());
        paper.set_balance("ETH", 10.0);
        paper.set_ticker(test_ticker(&trx_eth(), 0.009, 0.01));
        let eng = engine(paper.clone());

        eng.limit_buy(&trx_eth(), 10.0, 0.005, false).await.unwrap();
        eng.limit_buy(&trx_eth(), 10.0, 0.004, false).await.unwrap();

        assert_eq!(eng.cancel_open_orders(&trx_eth()).await.unwrap(), 2);
        assert!(eng.fetch_open_orders(&trx_eth()).await.unwrap().is_empty());
        assert!((paper.balance_of("ETH").free - 10.0).abs() < 1e-9);
    }
}
