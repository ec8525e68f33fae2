// =============================================================================
// Staged Exit Module
// =============================================================================
//
// Buys a ticker, then sells it through a ladder of limit orders whose target
// decays every interval, with a market-sell escape hatch on Ctrl+C.

pub mod controller;
pub mod interrupt;
pub mod ladder;
