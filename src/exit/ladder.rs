// =============================================================================
// Sell Ladder — decaying take-profit target
// =============================================================================
//
// The first target is `sell_percent + change_before` percent above the entry
// price. `change_before` is the 24h change the ticker already had when it was
// picked, so a late entry still aims for the full move. Every cycle lowers
// the target by `step_change`; it never rises and may go below zero, in which
// case the ladder is selling under the entry price.
// =============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SellLadder {
    pub entry_price: f64,
    /// Current target, in percent above the entry price.
    pub sell_change: f64,
    pub step_change: f64,
}

impl SellLadder {
    pub fn new(entry_price: f64, sell_percent: f64, change_before: f64, step_change: f64) -> Self {
        Self {
            entry_price,
            sell_change: sell_percent + change_before,
            step_change,
        }
    }

    pub fn target_pct(&self) -> f64 {
        self.sell_change
    }

    pub fn target_price(&self) -> f64 {
        self.entry_price * (1.0 + self.sell_change / 100.0)
    }

    /// Move to the next, lower target.
    pub fn step(&mut self) {
        self.sell_change -= self.step_change;
    }
}
