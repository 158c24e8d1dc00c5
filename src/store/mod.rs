// =============================================================================
// Hybrid Persistence & Reconciliation (§4.8, §10.4)
// =============================================================================
//
// `Store` is the narrow repository trait both the Auto-Trader and the
// Position Monitor talk to — never a raw SQL connection — so the trading
// logic stays testable against `store::memory::InMemoryStore` without a
// real database (§10.4). `store::sqlite` is the production implementation.
//
// Write-ownership split (§5 "Shared resources"): Auto-Trader writes are
// restricted to position *creation*; Monitor writes are restricted to
// *mutation* and *close*. No row is ever written by both.
// =============================================================================

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Position, ReEvaluation, Signal, Trade, TradingSettings};

/// Aggregate statistics for the signal validator's historical-accuracy step
/// (§4.3 step 2): only meaningful once `total >= 20`.
#[derive(Debug, Clone, Copy)]
pub struct AccuracyStats {
    pub wins: u32,
    pub total: u32,
}

impl AccuracyStats {
    pub fn win_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.wins as f64 / self.total as f64
        }
    }
}

/// Aggregate statistics for the risk manager's half-Kelly sizing step (§4.4
/// step 3): only meaningful once `count >= 20` and `avg_loss > 0`.
#[derive(Debug, Clone, Copy)]
pub struct KellyStats {
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub count: u32,
}

/// The durable-store repository contract (§6 "Durable store", §10.4). Every
/// method is free of trading logic — it's pure persistence plus the
/// aggregate queries the business logic needs to stay fast.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a position row, keyed by `position.id` (upsert).
    async fn upsert_position(&self, position: &Position) -> anyhow::Result<()>;

    /// All non-CLOSED positions across every user — the startup
    /// reconciliation load (§4.8 step 1) and the Monitor's working set.
    async fn load_open_positions(&self) -> anyhow::Result<Vec<Position>>;

    async fn insert_trade(&self, trade: &Trade) -> anyhow::Result<()>;

    async fn insert_reevaluation(&self, reeval: &ReEvaluation) -> anyhow::Result<()>;

    /// Fresh, whitelisted, unexpired BUY/SELL signals for `user_id` plus any
    /// global (`user_id IS NULL`) signal, newest first (§4.2).
    async fn fetch_fresh_signals(
        &self,
        user_id: Uuid,
        whitelist: &[String],
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Signal>>;

    async fn load_settings(&self, user_id: Uuid) -> anyhow::Result<Option<TradingSettings>>;

    async fn save_settings(&self, user_id: Uuid, settings: &TradingSettings) -> anyhow::Result<()>;

    /// `(wins, total)` for `(user, symbol, source)`, or `None` if fewer than
    /// 20 closed trades exist (§4.3 step 2 threshold is enforced by the
    /// caller, not here — this returns the raw count either way).
    async fn accuracy_stats(&self, user_id: Uuid, symbol: &str, source: &str) -> anyhow::Result<AccuracyStats>;

    /// Win rate / average win / average loss for `(user, symbol)`, over all
    /// closed trades (§4.4 step 3).
    async fn kelly_stats(&self, user_id: Uuid, symbol: &str) -> anyhow::Result<KellyStats>;

    /// Count of trades closed for `user_id` within the rolling window
    /// starting at `since` (§8 daily/hourly trade-limit invariant).
    async fn trades_since(&self, user_id: Uuid, since: DateTime<Utc>) -> anyhow::Result<u32>;
}
