// =============================================================================
// Domain entities — User, TradingSettings, Signal, Position, Trade, ReEvaluation
// =============================================================================
//
// These are storage-agnostic value types (§3). The durable store (§4.8,
// `crate::store`) maps them to rows; the in-memory position map
// (`crate::position_monitor`) holds them directly.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CloseReason, PositionStatus, Side, SignalAction, TradingMode};

// ---------------------------------------------------------------------------
// User & settings
// ---------------------------------------------------------------------------

/// A registered user of the bot. Credential storage and auth are out of
/// scope (§1) — this is only the slice the core needs to run a trading
/// cycle and monitor positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub exchange: String,
    pub trading_mode: TradingMode,
    pub settings: TradingSettings,
}

fn default_risk_per_trade_pct() -> f64 {
    0.02
}
fn default_max_concurrent_positions() -> u32 {
    5
}
fn default_daily_trade_limit() -> u32 {
    15
}
fn default_hourly_trade_limit() -> u32 {
    5
}
fn default_stop_loss_pct() -> f64 {
    0.02
}
fn default_take_profit_pct() -> f64 {
    0.04
}
fn default_max_hold_hours() -> i64 {
    12
}

/// Per-user tunables (§3). `leverage` is forced to 1.0 for spot users by
/// `TradingSettings::normalized_for_mode` — never trust a raw field read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSettings {
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,
    pub max_position_usd: f64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
    #[serde(default = "default_daily_trade_limit")]
    pub daily_trade_limit: u32,
    #[serde(default = "default_hourly_trade_limit")]
    pub hourly_trade_limit: u32,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    pub leverage: f64,
    #[serde(default)]
    pub trailing_enabled: bool,
    #[serde(default)]
    pub partial_tp_enabled: bool,
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: i64,
    /// When set, an opposite-side position may coexist with an open one for
    /// the same symbol (§4.6 step 4b, default: not set).
    #[serde(default)]
    pub hedging_enabled: bool,
}

impl TradingSettings {
    /// Default settings for a given trading mode (§3: leverage default 10
    /// for non-spot, forced 1.0 for spot).
    pub fn defaults_for_mode(mode: TradingMode) -> Self {
        Self {
            risk_per_trade_pct: default_risk_per_trade_pct(),
            max_position_usd: 5_000.0,
            max_concurrent_positions: default_max_concurrent_positions(),
            daily_trade_limit: default_daily_trade_limit(),
            hourly_trade_limit: default_hourly_trade_limit(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            leverage: if mode.is_spot() { 1.0 } else { 10.0 },
            trailing_enabled: true,
            partial_tp_enabled: true,
            max_hold_hours: default_max_hold_hours(),
            hedging_enabled: false,
        }
    }

    /// Force the spot invariant (§3): leverage always exactly 1.0 on spot.
    pub fn normalized_for_mode(&self, mode: TradingMode) -> Self {
        let mut s = self.clone();
        if mode.is_spot() {
            s.leverage = 1.0;
        }
        s
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// An AI-generated trading signal (§3). The core only reads these; an
/// external producer is responsible for writing rows into the signal store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub source: String,
    pub reasoning: Option<String>,
    /// `None` means this is a global signal, applicable to every user.
    pub user_id: Option<Uuid>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Identity used for deduplication and consensus counting (§4.2, §4.3):
    /// the user this signal effectively applies to, the symbol, and the
    /// action.
    pub fn dedup_key(&self, resolved_user: Uuid) -> (Uuid, String, SignalAction) {
        (resolved_user, self.symbol.clone(), self.action)
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A tracked, possibly partially-closed, position (§3). Created once by the
/// Auto-Trader; every subsequent mutation is owned by the Position Monitor
/// (§5 ordering guarantees).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub original_quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_sl: Option<f64>,
    pub peak_price: Option<f64>,
    pub trailing_activated: bool,
    /// Keyed by ladder index (0, 1, 2 — see `PARTIAL_TP_LEVELS`).
    pub partial_tp_taken: HashMap<usize, bool>,
    pub leverage: f64,
    pub trading_mode: TradingMode,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Construct a freshly opened position with no trailing/partial-TP
    /// history, enforcing the spot invariant at construction time (§3, §7).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: Uuid,
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        leverage: f64,
        trading_mode: TradingMode,
        opened_at: DateTime<Utc>,
    ) -> Self {
        let leverage = if trading_mode.is_spot() { 1.0 } else { leverage };
        Self {
            id: Uuid::new_v4(),
            user_id,
            symbol: symbol.into(),
            side,
            quantity,
            original_quantity: quantity,
            entry_price,
            stop_loss,
            take_profit,
            trailing_sl: None,
            peak_price: None,
            trailing_activated: false,
            partial_tp_taken: HashMap::new(),
            leverage,
            trading_mode,
            status: PositionStatus::Open,
            opened_at,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, PositionStatus::Open)
    }

    /// Signed profit fraction from entry to `price` (positive is favorable
    /// regardless of side) — used throughout §4.7.
    pub fn profit_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// The immutable record of a fully or partially closed position slice (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub user_id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub pnl_pct: f64,
    pub close_reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position: &Position,
        quantity: f64,
        exit_price: f64,
        close_reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let realized_pnl = position.side.sign() * (exit_price - position.entry_price) * quantity;
        let pnl_pct = if position.entry_price > 0.0 {
            position.side.sign() * (exit_price - position.entry_price) / position.entry_price
        } else {
            0.0
        };
        Self {
            id: Uuid::new_v4(),
            user_id: position.user_id,
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            quantity,
            entry_price: position.entry_price,
            exit_price,
            realized_pnl,
            pnl_pct,
            close_reason,
            opened_at: position.opened_at,
            closed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// ReEvaluation (audit log, §3, §9)
// ---------------------------------------------------------------------------

/// An append-only audit record of any SL/TP/quantity adjustment the Monitor
/// makes to a position. Never updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReEvaluation {
    pub id: Uuid,
    pub position_id: Uuid,
    pub kind: ReEvaluationKind,
    pub old_sl: Option<f64>,
    pub new_sl: Option<f64>,
    pub old_tp: Option<f64>,
    pub new_tp: Option<f64>,
    pub reason: String,
    pub action_taken: String,
    pub ts: DateTime<Utc>,
}

/// The category of adjustment a `ReEvaluation` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReEvaluationKind {
    TrailingActivate,
    TrailingUpdate,
    PartialTp,
    BreakEven,
    Close,
}

impl ReEvaluation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position_id: Uuid,
        kind: ReEvaluationKind,
        old_sl: Option<f64>,
        new_sl: Option<f64>,
        old_tp: Option<f64>,
        new_tp: Option<f64>,
        reason: impl Into<String>,
        action_taken: impl Into<String>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            position_id,
            kind,
            old_sl,
            new_sl,
            old_tp,
            new_tp,
            reason: reason.into(),
            action_taken: action_taken.into(),
            ts,
        }
    }
}
