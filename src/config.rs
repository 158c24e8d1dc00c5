// =============================================================================
// Process-wide configuration (§6 "Configuration", §10.3)
// =============================================================================
//
// Every tunable named in the spec lives here so the engine can be redeployed
// with new thresholds without a code change. Persistence uses an atomic
// tmp-then-rename save, matching the reference engine's `RuntimeConfig`.
// Every field carries `#[serde(default = ...)]` so an older config file on
// disk keeps loading after new fields are added.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_cycle_interval_s() -> u64 {
    300
}
fn default_monitor_interval_s() -> u64 {
    5
}
fn default_signal_sources_whitelist() -> Vec<String> {
    vec!["titan_v3".to_string(), "COUNCIL_V2.0_FALLBACK".to_string()]
}
fn default_min_confidence() -> f64 {
    0.35
}
fn default_volatility_capped_confidence() -> f64 {
    0.65
}
fn default_volatility_cap_threshold() -> f64 {
    0.05
}
fn default_signal_freshness_hours() -> i64 {
    6
}
fn default_trailing_activation() -> f64 {
    0.005
}
fn default_trailing_distance() -> f64 {
    0.01
}
fn default_partial_tp_levels() -> Vec<(f64, f64)> {
    vec![(0.01, 0.25), (0.02, 0.5), (0.03, 0.75)]
}
fn default_partial_tp_residual_floor() -> f64 {
    0.10
}
fn default_max_hold_hours() -> i64 {
    12
}
fn default_liquidation_warn() -> f64 {
    15.0
}
fn default_liquidation_close() -> f64 {
    3.5
}
fn default_max_trades_per_cycle() -> u32 {
    3
}
fn default_ghost_grace_minutes() -> i64 {
    2
}
fn default_checkpoint_interval_s() -> u64 {
    60
}
fn default_price_cache_ttl_s() -> u64 {
    5
}
fn default_broker_timeout_s() -> u64 {
    30
}
fn default_signal_store_timeout_s() -> u64 {
    10
}
fn default_price_fetch_timeout_s() -> u64 {
    10
}
fn default_calendar_window_before_min() -> i64 {
    30
}
fn default_calendar_window_after_min() -> i64 {
    60
}
fn default_max_broker_retries() -> u32 {
    3
}

/// Process-wide configuration, shared read-only by every Auto-Trader and the
/// Position Monitor (§6, §9: no global mutable singleton — this is passed
/// into constructors explicitly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_cycle_interval_s")]
    pub cycle_interval_s: u64,
    #[serde(default = "default_monitor_interval_s")]
    pub monitor_interval_s: u64,
    #[serde(default = "default_signal_sources_whitelist")]
    pub signal_sources_whitelist: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_volatility_capped_confidence")]
    pub volatility_capped_confidence: f64,
    #[serde(default = "default_volatility_cap_threshold")]
    pub volatility_cap_threshold: f64,
    #[serde(default = "default_signal_freshness_hours")]
    pub signal_freshness_hours: i64,
    #[serde(default = "default_trailing_activation")]
    pub trailing_activation: f64,
    #[serde(default = "default_trailing_distance")]
    pub trailing_distance: f64,
    #[serde(default = "default_partial_tp_levels")]
    pub partial_tp_levels: Vec<(f64, f64)>,
    #[serde(default = "default_partial_tp_residual_floor")]
    pub partial_tp_residual_floor: f64,
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: i64,
    #[serde(default = "default_liquidation_warn")]
    pub liquidation_warn: f64,
    #[serde(default = "default_liquidation_close")]
    pub liquidation_close: f64,
    #[serde(default = "default_max_trades_per_cycle")]
    pub max_trades_per_cycle: u32,
    #[serde(default = "default_ghost_grace_minutes")]
    pub ghost_grace_minutes: i64,
    #[serde(default = "default_checkpoint_interval_s")]
    pub checkpoint_interval_s: u64,
    #[serde(default = "default_price_cache_ttl_s")]
    pub price_cache_ttl_s: u64,
    #[serde(default = "default_broker_timeout_s")]
    pub broker_timeout_s: u64,
    #[serde(default = "default_signal_store_timeout_s")]
    pub signal_store_timeout_s: u64,
    #[serde(default = "default_price_fetch_timeout_s")]
    pub price_fetch_timeout_s: u64,
    #[serde(default = "default_calendar_window_before_min")]
    pub calendar_window_before_min: i64,
    #[serde(default = "default_calendar_window_after_min")]
    pub calendar_window_after_min: i64,
    #[serde(default = "default_max_broker_retries")]
    pub max_broker_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle_interval_s: default_cycle_interval_s(),
            monitor_interval_s: default_monitor_interval_s(),
            signal_sources_whitelist: default_signal_sources_whitelist(),
            min_confidence: default_min_confidence(),
            volatility_capped_confidence: default_volatility_capped_confidence(),
            volatility_cap_threshold: default_volatility_cap_threshold(),
            signal_freshness_hours: default_signal_freshness_hours(),
            trailing_activation: default_trailing_activation(),
            trailing_distance: default_trailing_distance(),
            partial_tp_levels: default_partial_tp_levels(),
            partial_tp_residual_floor: default_partial_tp_residual_floor(),
            max_hold_hours: default_max_hold_hours(),
            liquidation_warn: default_liquidation_warn(),
            liquidation_close: default_liquidation_close(),
            max_trades_per_cycle: default_max_trades_per_cycle(),
            ghost_grace_minutes: default_ghost_grace_minutes(),
            checkpoint_interval_s: default_checkpoint_interval_s(),
            price_cache_ttl_s: default_price_cache_ttl_s(),
            broker_timeout_s: default_broker_timeout_s(),
            signal_store_timeout_s: default_signal_store_timeout_s(),
            price_fetch_timeout_s: default_price_fetch_timeout_s(),
            calendar_window_before_min: default_calendar_window_before_min(),
            calendar_window_after_min: default_calendar_window_after_min(),
            max_broker_retries: default_max_broker_retries(),
        }
    }
}

impl Config {
    /// Load from a JSON file, falling back to defaults (logged) when absent
    /// or malformed. Every field can also be overridden by an environment
    /// variable named `AURORA_CORE_<FIELD_NAME_UPPERCASE>` for container
    /// deployment; only the scalar fields support the override.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            info!(path = %path.display(), "no config file found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AURORA_CORE_CYCLE_INTERVAL_S") {
            if let Ok(n) = v.parse() {
                self.cycle_interval_s = n;
            }
        }
        if let Ok(v) = std::env::var("AURORA_CORE_MONITOR_INTERVAL_S") {
            if let Ok(n) = v.parse() {
                self.monitor_interval_s = n;
            }
        }
        if let Ok(v) = std::env::var("AURORA_CORE_MIN_CONFIDENCE") {
            if let Ok(n) = v.parse() {
                self.min_confidence = n;
            }
        }
    }

    /// Atomic tmp-then-rename save, matching the reference engine's
    /// `RuntimeConfig::save` pattern.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("json.tmp");
        let serialized =
            serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&tmp_path, serialized)
            .with_context(|| format!("failed to write temp config {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename temp config into {}", path.display()))?;
        Ok(())
    }
}

/// `get_upcoming_high_impact_event` collaborator response (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighImpactEvent {
    pub name: String,
    pub minutes_until: i64,
}

/// Whether `event`, reported `minutes_until` now, falls inside the
/// before/after gating window from config (§4.6 step 1).
pub fn event_gates_trading(event: &HighImpactEvent, config: &Config) -> bool {
    if event.minutes_until >= 0 {
        event.minutes_until <= config.calendar_window_before_min
    } else {
        event.minutes_until.abs() <= config.calendar_window_after_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.cycle_interval_s, 300);
        assert_eq!(c.monitor_interval_s, 5);
        assert!((c.min_confidence - 0.35).abs() < 1e-9);
        assert!((c.liquidation_close - 3.5).abs() < 1e-9);
        assert_eq!(c.partial_tp_levels.len(), 3);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("aurora-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let mut cfg = Config::default();
        cfg.min_confidence = 0.5;
        cfg.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert!((reloaded.min_confidence - 0.5).abs() < 1e-9);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn event_within_before_window_gates() {
        let c = Config::default();
        let event = HighImpactEvent { name: "CPI".into(), minutes_until: 20 };
        assert!(event_gates_trading(&event, &c));
    }

    #[test]
    fn event_outside_after_window_does_not_gate() {
        let c = Config::default();
        let event = HighImpactEvent { name: "CPI".into(), minutes_until: -61 };
        assert!(!event_gates_trading(&event, &c));
    }
}
