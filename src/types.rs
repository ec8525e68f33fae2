// =============================================================================
// Shared types used across the pump bot
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeError;

// ---------------------------------------------------------------------------
// Symbol
// ---------------------------------------------------------------------------

/// A market such as `TRX/ETH`: `base` is the traded ticker, `quote` the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim().to_uppercase(),
            quote: quote.as_ref().trim().to_uppercase(),
        }
    }

    /// Exchange market id, e.g. `TRXETH`.
    pub fn market_id(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// 24h ticker snapshot for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub high: f64,
    pub low: f64,
    /// 24h change in percent.
    pub change: f64,
    pub base_volume: f64,
}

impl Ticker {
    /// Price a buyer should expect to pay right now: the ask, or the last
    /// trade when the book side is empty.
    pub fn entry_price(&self) -> f64 {
        if self.ask > 0.0 {
            self.ask
        } else {
            self.last
        }
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Which bucket of a balance to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceKind {
    Free,
    Used,
    Total,
}

/// Balance of a single asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub used: f64,
    #[serde(default)]
    pub total: f64,
}

impl BalanceEntry {
    pub fn new(free: f64, used: f64) -> Self {
        Self {
            free,
            used,
            total: free + used,
        }
    }

    pub fn get(&self, kind: BalanceKind) -> f64 {
        match kind {
            BalanceKind::Free => self.free,
            BalanceKind::Used => self.used,
            BalanceKind::Total => self.total,
        }
    }
}

/// Account balances keyed by asset symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances(pub HashMap<String, BalanceEntry>);

impl Balances {
    /// Missing assets read as zero.
    pub fn get(&self, asset: &str, kind: BalanceKind) -> f64 {
        self.0.get(asset).map(|b| b.get(kind)).unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BalanceEntry)> {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Map an exchange status string (`NEW`, `FILLED`, ...) to a status.
    pub fn from_exchange(s: &str) -> Self {
        match s {
            "FILLED" => Self::Filled,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "CANCELED" | "PENDING_CANCEL" | "EXPIRED" | "EXPIRED_IN_MATCH" => Self::Canceled,
            "REJECTED" => Self::Rejected,
            _ => Self::Open,
        }
    }
}

/// An order as acknowledged by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    /// Requested quantity.
    pub quantity: f64,
    pub filled: f64,
    /// Limit price, or the average fill price for market orders.
    pub price: f64,
    pub status: OrderStatus,
}

impl Order {
    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

// ---------------------------------------------------------------------------
// Account mode
// ---------------------------------------------------------------------------

/// Whether orders reach the real exchange or the in-memory paper book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

impl FromStr for AccountMode {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "demo" | "paper" => Ok(Self::Demo),
            "live" => Ok(Self::Live),
            other => Err(ExchangeError::InvalidArgument(format!(
                "unknown account mode '{other}'"
            ))),
        }
    }
}
