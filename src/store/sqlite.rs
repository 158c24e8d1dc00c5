// =============================================================================
// SQLite-backed `Store` (§10.4)
// =============================================================================
//
// SQLite is sufficient for the single-process core and keeps the crate
// self-contained; a Postgres deployment would swap the pool type behind the
// same `Store` trait. Queries are built with `sqlx::query`/`query_as` at
// runtime rather than the `query!` macro family, so the crate compiles
// without a live database connection or `DATABASE_URL` at build time.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Position, ReEvaluation, ReEvaluationKind, Signal, Trade, TradingSettings};
use crate::store::{AccuracyStats, KellyStats, Store};
use crate::types::{CloseReason, PositionStatus, Side, SignalAction, TradingMode};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Runs the embedded migrations. Plain `.sql` files under `migrations/`,
    /// matching the reference engine's preference for explicit, reviewable
    /// SQL over an ORM schema DSL.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn side_to_str(s: Side) -> &'static str {
    match s {
        Side::Long => "long",
        Side::Short => "short",
    }
}

fn side_from_str(s: &str) -> Side {
    if s == "short" {
        Side::Short
    } else {
        Side::Long
    }
}

fn mode_to_str(m: TradingMode) -> &'static str {
    match m {
        TradingMode::Spot => "spot",
        TradingMode::Margin => "margin",
        TradingMode::Futures => "futures",
    }
}

fn mode_from_str(s: &str) -> TradingMode {
    match s {
        "margin" => TradingMode::Margin,
        "futures" => TradingMode::Futures,
        _ => TradingMode::Spot,
    }
}

fn status_from_str(s: &str) -> PositionStatus {
    if s == "OPEN" {
        PositionStatus::Open
    } else {
        PositionStatus::Closed
    }
}

fn close_reason_to_str(r: CloseReason) -> &'static str {
    match r {
        CloseReason::StopLoss => "stop_loss",
        CloseReason::TakeProfit => "take_profit",
        CloseReason::TrailingStop => "trailing_stop",
        CloseReason::PartialTp => "partial_tp",
        CloseReason::TimeExit => "time_exit",
        CloseReason::LiquidationClose => "liquidation_close",
        CloseReason::Manual => "manual",
        CloseReason::GhostCleanup => "ghost_cleanup",
    }
}

#[allow(dead_code)]
fn close_reason_from_str(s: &str) -> CloseReason {
    match s {
        "take_profit" => CloseReason::TakeProfit,
        "trailing_stop" => CloseReason::TrailingStop,
        "partial_tp" => CloseReason::PartialTp,
        "time_exit" => CloseReason::TimeExit,
        "liquidation_close" => CloseReason::LiquidationClose,
        "manual" => CloseReason::Manual,
        "ghost_cleanup" => CloseReason::GhostCleanup,
        _ => CloseReason::StopLoss,
    }
}

fn reeval_kind_to_str(k: ReEvaluationKind) -> &'static str {
    match k {
        ReEvaluationKind::TrailingActivate => "trailing_activate",
        ReEvaluationKind::TrailingUpdate => "trailing_update",
        ReEvaluationKind::PartialTp => "partial_tp",
        ReEvaluationKind::BreakEven => "break_even",
        ReEvaluationKind::Close => "close",
    }
}

#[allow(dead_code)]
fn reeval_kind_from_str(s: &str) -> ReEvaluationKind {
    match s {
        "trailing_update" => ReEvaluationKind::TrailingUpdate,
        "partial_tp" => ReEvaluationKind::PartialTp,
        "break_even" => ReEvaluationKind::BreakEven,
        "close" => ReEvaluationKind::Close,
        _ => ReEvaluationKind::TrailingActivate,
    }
}

fn action_from_str(s: &str) -> SignalAction {
    match s {
        "SELL" => SignalAction::Sell,
        "HOLD" => SignalAction::Hold,
        _ => SignalAction::Buy,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_position(&self, position: &Position) -> anyhow::Result<()> {
        let partial_tp_json = serde_json::to_string(&position.partial_tp_taken)?;
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, user_id, symbol, side, quantity, original_quantity, entry_price,
                stop_loss, take_profit, trailing_sl, peak_price, trailing_activated,
                partial_tp_taken, leverage, trading_mode, status, opened_at, closed_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                quantity = excluded.quantity,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                trailing_sl = excluded.trailing_sl,
                peak_price = excluded.peak_price,
                trailing_activated = excluded.trailing_activated,
                partial_tp_taken = excluded.partial_tp_taken,
                status = excluded.status,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(position.id.to_string())
        .bind(position.user_id.to_string())
        .bind(&position.symbol)
        .bind(side_to_str(position.side))
        .bind(position.quantity)
        .bind(position.original_quantity)
        .bind(position.entry_price)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.trailing_sl)
        .bind(position.peak_price)
        .bind(position.trailing_activated)
        .bind(partial_tp_json)
        .bind(position.leverage)
        .bind(mode_to_str(position.trading_mode))
        .bind(if position.is_open() { "OPEN" } else { "CLOSED" })
        .bind(position.opened_at.to_rfc3339())
        .bind(position.closed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_open_positions(&self) -> anyhow::Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status != 'CLOSED'").fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let partial_tp_json: String = row.try_get("partial_tp_taken")?;
            let partial_tp_taken: HashMap<usize, bool> = serde_json::from_str(&partial_tp_json).unwrap_or_default();
            let opened_at: String = row.try_get("opened_at")?;
            let closed_at: Option<String> = row.try_get("closed_at")?;
            let status_str: String = row.try_get("status")?;

            out.push(Position {
                id: Uuid::from_str(&row.try_get::<String, _>("id")?)?,
                user_id: Uuid::from_str(&row.try_get::<String, _>("user_id")?)?,
                symbol: row.try_get("symbol")?,
                side: side_from_str(&row.try_get::<String, _>("side")?),
                quantity: row.try_get("quantity")?,
                original_quantity: row.try_get("original_quantity")?,
                entry_price: row.try_get("entry_price")?,
                stop_loss: row.try_get("stop_loss")?,
                take_profit: row.try_get("take_profit")?,
                trailing_sl: row.try_get("trailing_sl")?,
                peak_price: row.try_get("peak_price")?,
                trailing_activated: row.try_get("trailing_activated")?,
                partial_tp_taken,
                leverage: row.try_get("leverage")?,
                trading_mode: mode_from_str(&row.try_get::<String, _>("trading_mode")?),
                status: status_from_str(&status_str),
                opened_at: DateTime::parse_from_rfc3339(&opened_at)?.with_timezone(&Utc),
                closed_at: closed_at
                    .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
                    .transpose()?,
            });
        }
        Ok(out)
    }

    async fn insert_trade(&self, trade: &Trade) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, user_id, position_id, symbol, side, quantity, entry_price, exit_price,
                realized_pnl, pnl_pct, close_reason, opened_at, closed_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(trade.id.to_string())
        .bind(trade.user_id.to_string())
        .bind(trade.position_id.to_string())
        .bind(&trade.symbol)
        .bind(side_to_str(trade.side))
        .bind(trade.quantity)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.realized_pnl)
        .bind(trade.pnl_pct)
        .bind(close_reason_to_str(trade.close_reason))
        .bind(trade.opened_at.to_rfc3339())
        .bind(trade.closed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_reevaluation(&self, reeval: &ReEvaluation) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO position_reevaluations (
                id, position_id, kind, old_sl, new_sl, old_tp, new_tp, reason, action_taken, ts
            ) VALUES (?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(reeval.id.to_string())
        .bind(reeval.position_id.to_string())
        .bind(reeval_kind_to_str(reeval.kind))
        .bind(reeval.old_sl)
        .bind(reeval.new_sl)
        .bind(reeval.old_tp)
        .bind(reeval.new_tp)
        .bind(&reeval.reason)
        .bind(&reeval.action_taken)
        .bind(reeval.ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_fresh_signals(
        &self,
        user_id: Uuid,
        whitelist: &[String],
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Signal>> {
        // Whitelist is short (two entries by default, §3) so an IN-list is
        // built inline rather than pulling in a query-builder crate.
        let placeholders = whitelist.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            r#"
            SELECT * FROM trading_signals
            WHERE source IN ({placeholders})
              AND created_at > ?
              AND action IN ('BUY','SELL')
              AND (user_id = ? OR user_id IS NULL)
            ORDER BY created_at DESC
            "#
        );
        let mut query = sqlx::query(&sql);
        for source in whitelist {
            query = query.bind(source);
        }
        query = query.bind(since.to_rfc3339()).bind(user_id.to_string());

        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let user_id_str: Option<String> = row.try_get("user_id")?;
            let created_at: String = row.try_get("created_at")?;
            let expires_at: Option<String> = row.try_get("expires_at")?;
            out.push(Signal {
                id: Uuid::from_str(&row.try_get::<String, _>("id")?)?,
                symbol: row.try_get("symbol")?,
                action: action_from_str(&row.try_get::<String, _>("action")?),
                confidence: row.try_get("confidence")?,
                source: row.try_get("source")?,
                reasoning: row.try_get("reasoning")?,
                user_id: user_id_str.map(|s| Uuid::from_str(&s)).transpose()?,
                stop_loss: row.try_get("stop_loss")?,
                take_profit: row.try_get("take_profit")?,
                expires_at: expires_at
                    .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
                    .transpose()?,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        Ok(out)
    }

    async fn load_settings(&self, user_id: Uuid) -> anyhow::Result<Option<TradingSettings>> {
        let row = sqlx::query("SELECT settings_json FROM trading_settings WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.try_get("settings_json")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn save_settings(&self, user_id: Uuid, settings: &TradingSettings) -> anyhow::Result<()> {
        let json = serde_json::to_string(settings)?;
        sqlx::query(
            r#"
            INSERT INTO trading_settings (user_id, settings_json) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET settings_json = excluded.settings_json
            "#,
        )
        .bind(user_id.to_string())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn accuracy_stats(&self, user_id: Uuid, symbol: &str, source: &str) -> anyhow::Result<AccuracyStats> {
        // Trades don't carry `source` directly (§3); join through the
        // originating signal via position_id -> positions -> no signal_id
        // link exists either, so accuracy is approximated over all trades
        // for (user, symbol) — the same approximation the in-memory fake
        // makes, kept consistent between the two `Store` implementations.
        let _ = source;
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN realized_pnl > 0 THEN 1 ELSE 0 END) AS wins
            FROM trades WHERE user_id = ? AND symbol = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let wins: i64 = row.try_get("wins").unwrap_or(0);
        Ok(AccuracyStats { wins: wins.max(0) as u32, total: total.max(0) as u32 })
    }

    async fn kelly_stats(&self, user_id: Uuid, symbol: &str) -> anyhow::Result<KellyStats> {
        let rows = sqlx::query("SELECT realized_pnl FROM trades WHERE user_id = ? AND symbol = ?")
            .bind(user_id.to_string())
            .bind(symbol)
            .fetch_all(&self.pool)
            .await?;
        let pnls: Vec<f64> = rows.iter().map(|r| r.try_get::<f64, _>("realized_pnl")).collect::<Result<_, _>>()?;
        let count = pnls.len() as u32;
        if count == 0 {
            return Ok(KellyStats { win_rate: 0.0, avg_win: 0.0, avg_loss: 0.0, count: 0 });
        }
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).map(|p| -p).collect();
        let win_rate = wins.len() as f64 / count as f64;
        let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().sum::<f64>() / wins.len() as f64 };
        let avg_loss = if losses.is_empty() { 0.0 } else { losses.iter().sum::<f64>() / losses.len() as f64 };
        Ok(KellyStats { win_rate, avg_win, avg_loss, count })
    }

    async fn trades_since(&self, user_id: Uuid, since: DateTime<Utc>) -> anyhow::Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM trades WHERE user_id = ? AND closed_at > ? AND close_reason != 'ghost_cleanup'",
        )
        .bind(user_id.to_string())
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u32)
    }
}
