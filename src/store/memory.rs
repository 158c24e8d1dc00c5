// =============================================================================
// In-memory `Store` fake — used by unit/integration tests so the trading
// logic (Auto-Trader, Position Monitor, reconciliation) is testable without
// a real database (§10.4, §10.5).
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::{Position, ReEvaluation, Signal, Trade, TradingSettings};
use crate::store::{AccuracyStats, KellyStats, Store};
use crate::types::CloseReason;

#[derive(Default)]
pub struct InMemoryStore {
    positions: RwLock<HashMap<Uuid, Position>>,
    trades: RwLock<Vec<Trade>>,
    reevaluations: RwLock<Vec<ReEvaluation>>,
    signals: RwLock<Vec<Signal>>,
    settings: RwLock<HashMap<Uuid, TradingSettings>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/seed helper: inject a signal as if an external producer had
    /// written it into the signal store.
    pub fn seed_signal(&self, signal: Signal) {
        self.signals.write().push(signal);
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades.read().clone()
    }

    pub fn reevaluations(&self) -> Vec<ReEvaluation> {
        self.reevaluations.read().clone()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_position(&self, position: &Position) -> anyhow::Result<()> {
        self.positions.write().insert(position.id, position.clone());
        Ok(())
    }

    async fn load_open_positions(&self) -> anyhow::Result<Vec<Position>> {
        Ok(self.positions.read().values().filter(|p| p.is_open()).cloned().collect())
    }

    async fn insert_trade(&self, trade: &Trade) -> anyhow::Result<()> {
        self.trades.write().push(trade.clone());
        Ok(())
    }

    async fn insert_reevaluation(&self, reeval: &ReEvaluation) -> anyhow::Result<()> {
        self.reevaluations.write().push(reeval.clone());
        Ok(())
    }

    async fn fetch_fresh_signals(
        &self,
        user_id: Uuid,
        whitelist: &[String],
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Signal>> {
        let mut rows: Vec<Signal> = self
            .signals
            .read()
            .iter()
            .filter(|s| whitelist.iter().any(|w| w == &s.source))
            .filter(|s| s.created_at > since)
            .filter(|s| s.user_id == Some(user_id) || s.user_id.is_none())
            .filter(|s| !matches!(s.action, crate::types::SignalAction::Hold))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn load_settings(&self, user_id: Uuid) -> anyhow::Result<Option<TradingSettings>> {
        Ok(self.settings.read().get(&user_id).cloned())
    }

    async fn save_settings(&self, user_id: Uuid, settings: &TradingSettings) -> anyhow::Result<()> {
        self.settings.write().insert(user_id, settings.clone());
        Ok(())
    }

    async fn accuracy_stats(&self, user_id: Uuid, symbol: &str, source: &str) -> anyhow::Result<AccuracyStats> {
        let trades = self.trades.read();
        let matching: Vec<&Trade> = trades
            .iter()
            .filter(|t| t.user_id == user_id && t.symbol == symbol)
            .filter(|_| true)
            .collect();
        // The in-memory fake doesn't track `source` on `Trade` (it isn't part
        // of the Trade entity in §3) — callers passing a source narrow by
        // symbol only, matching the durable implementation's join on the
        // originating signal.
        let _ = source;
        let total = matching.len() as u32;
        let wins = matching.iter().filter(|t| t.realized_pnl > 0.0).count() as u32;
        Ok(AccuracyStats { wins, total })
    }

    async fn kelly_stats(&self, user_id: Uuid, symbol: &str) -> anyhow::Result<KellyStats> {
        let trades = self.trades.read();
        let matching: Vec<&Trade> = trades.iter().filter(|t| t.user_id == user_id && t.symbol == symbol).collect();
        let count = matching.len() as u32;
        if count == 0 {
            return Ok(KellyStats { win_rate: 0.0, avg_win: 0.0, avg_loss: 0.0, count: 0 });
        }
        let wins: Vec<f64> = matching.iter().filter(|t| t.realized_pnl > 0.0).map(|t| t.realized_pnl).collect();
        let losses: Vec<f64> = matching.iter().filter(|t| t.realized_pnl < 0.0).map(|t| -t.realized_pnl).collect();
        let win_rate = wins.len() as f64 / count as f64;
        let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().sum::<f64>() / wins.len() as f64 };
        let avg_loss = if losses.is_empty() { 0.0 } else { losses.iter().sum::<f64>() / losses.len() as f64 };
        Ok(KellyStats { win_rate, avg_win, avg_loss, count })
    }

    async fn trades_since(&self, user_id: Uuid, since: DateTime<Utc>) -> anyhow::Result<u32> {
        let count = self
            .trades
            .read()
            .iter()
            .filter(|t| t.user_id == user_id && t.closed_at > since)
            .filter(|t| !matches!(t.close_reason, CloseReason::GhostCleanup))
            .count();
        Ok(count as u32)
    }
}
