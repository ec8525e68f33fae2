// =============================================================================
// Runtime Configuration — bot settings with atomic save
// =============================================================================
//
// Everything that is not asked interactively lives here: account mode,
// endpoint, retry and step-down tuning, polling cadence, and the balances
// used to seed the paper exchange.
//
// All fields carry `#[serde(default)]` so a partial (or missing) file still
// loads. Persistence uses an atomic tmp + rename pattern.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binance::client::DEFAULT_BASE_URL;
use crate::execution::AdjustPolicy;
use crate::retry::RetryPolicy;
use crate::types::AccountMode;

pub const DEFAULT_CONFIG_PATH: &str = "pump_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_fill_poll_ms() -> u64 {
    500
}

/// Quote and fee assets never treated as positions.
fn default_reserved_assets() -> Vec<String> {
    vec![
        "ETH".to_string(),
        "BTC".to_string(),
        "USDT".to_string(),
        "BNB".to_string(),
    ]
}

/// Pairs swept by the startup order cancellation.
fn default_cancel_pairs() -> Vec<String> {
    vec!["ETH".to_string(), "BTC".to_string()]
}

fn default_paper_balances() -> BTreeMap<String, f64> {
    BTreeMap::from([("ETH".to_string(), 10.0), ("BTC".to_string(), 0.5)])
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Demo trades on the paper exchange with live prices; Live sends orders.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Binance REST root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Retry policy applied to every exchange call.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Order size step-down on rejected orders.
    #[serde(default)]
    pub adjust: AdjustPolicy,

    /// How often the entry fill is polled (milliseconds).
    #[serde(default = "default_fill_poll_ms")]
    pub fill_poll_ms: u64,

    /// Assets excluded from "non-zero balances" (quote and fee assets).
    #[serde(default = "default_reserved_assets")]
    pub reserved_assets: Vec<String>,

    /// Pairs whose open orders are canceled at startup.
    #[serde(default = "default_cancel_pairs")]
    pub cancel_pairs: Vec<String>,

    /// Starting free balances for the paper exchange.
    #[serde(default = "default_paper_balances")]
    pub paper_balances: BTreeMap<String, f64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Demo,
            base_url: default_base_url(),
            retry: RetryPolicy::default(),
            adjust: AdjustPolicy::default(),
            fill_poll_ms: default_fill_poll_ms(),
            reserved_assets: default_reserved_assets(),
            cancel_pairs: default_cancel_pairs(),
            paper_balances: default_paper_balances(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            account_mode = %config.account_mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            Self::default()
        })
    }

    /// Apply `PUMP_ACCOUNT_MODE` and `PUMP_BASE_URL` from the environment.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("PUMP_ACCOUNT_MODE") {
            self.account_mode = mode.parse().context("invalid PUMP_ACCOUNT_MODE")?;
        }
        if let Ok(url) = std::env::var("PUMP_BASE_URL") {
            if !url.trim().is_empty() {
                self.base_url = url.trim().to_string();
            }
        }
        Ok(())
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
