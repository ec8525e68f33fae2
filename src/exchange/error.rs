// =============================================================================
// Exchange error kinds
// =============================================================================
//
// Transient kinds (network, exchange rejection, insufficient funds, rate
// limit) are retried by `RetryPolicy`; everything else propagates at once.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Transport failure, timeout, or a 5xx from the exchange.
    #[error("network error: {0}")]
    Network(String),

    /// The exchange rejected the request for a reason not covered below.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// Exchange rejection caused by an undersized balance.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unknown symbol: {0}")]
    BadSymbol(String),

    /// Cancel or query of an order the exchange no longer tracks (usually
    /// because it already filled).
    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("malformed exchange response: {0}")]
    Decode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: Box<ExchangeError>,
    },

    #[error("{symbol} order not placed after {attempts} size adjustments (last quantity {quantity}): {last}")]
    AdjustExhausted {
        symbol: String,
        attempts: u32,
        quantity: f64,
        last: Box<ExchangeError>,
    },

    #[error("order quantity for {0} rounds down to zero")]
    ZeroQuantity(String),
}

impl ExchangeError {
    /// Whether a retry after a pause may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Exchange(_) | Self::InsufficientFunds(_) | Self::RateLimited(_)
        )
    }

    /// Whether shrinking the order may let it through.
    pub fn warrants_size_step_down(&self) -> bool {
        matches!(self, Self::InsufficientFunds(_) | Self::Exchange(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
