// =============================================================================
// Position Monitor (§4.7) — the hardest subsystem.
// =============================================================================
//
// A single loop ticks every 5 s. For each open position it evaluates, in
// fixed order, stop-loss, take-profit, trailing stop, partial take-profit,
// time exit, and liquidation protection (§5 "Ordering guarantees"), then
// persists anything that changed. The in-memory `positions` map is the
// source of truth during steady state (§4.8); the durable store is a mirror
// updated on every mutation plus a full 60 s checkpoint.
//
// New positions arrive over a channel from the Auto-Trader rather than a
// shared lock the trader reaches into directly (§9 "position update
// channel"). A per-position `tokio::sync::Mutex` guards evaluation and
// close execution so a partial-TP close and a trailing-stop close can never
// both be issued for the same position in the same tick.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::Config;
use crate::models::{Position, ReEvaluation, ReEvaluationKind, Trade};
use crate::store::Store;
use crate::types::{AlertSeverity, CloseReason, Side, TradingMode, PositionStatus};
use crate::alert::AlertSink;

/// Resolves the broker instance for a given user. One `Broker` per
/// `(user, exchange, trading_mode)` is constructed by the supervisor at
/// startup (§5 "Broker client per user").
pub trait BrokerRegistry: Send + Sync {
    fn broker_for(&self, user_id: Uuid) -> Option<Arc<dyn Broker>>;
}

/// A fixed map of user -> broker, sufficient for a single-process deployment
/// or a process already sharded by user id (§5 "Implementations may shard
/// monitors across processes by user id").
pub struct StaticBrokerRegistry {
    brokers: HashMap<Uuid, Arc<dyn Broker>>,
}

impl StaticBrokerRegistry {
    pub fn new(brokers: HashMap<Uuid, Arc<dyn Broker>>) -> Self {
        Self { brokers }
    }
}

impl BrokerRegistry for StaticBrokerRegistry {
    fn broker_for(&self, user_id: Uuid) -> Option<Arc<dyn Broker>> {
        self.brokers.get(&user_id).cloned()
    }
}

/// Process-wide price cache, TTL 5 s, keyed by symbol (§5 "Shared
/// resources"). Concurrent readers, single writer per key — the `RwLock`
/// gives us that for free since refreshes are infrequent relative to reads.
struct PriceCache {
    ttl: chrono::Duration,
    entries: RwLock<HashMap<String, (f64, chrono::DateTime<Utc>)>>,
}

impl PriceCache {
    fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl_secs as i64),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, symbol: &str) -> Option<f64> {
        let entries = self.entries.read();
        let (price, at) = entries.get(symbol)?;
        if Utc::now() - *at <= self.ttl {
            Some(*price)
        } else {
            None
        }
    }

    fn put(&self, symbol: &str, price: f64) {
        self.entries.write().insert(symbol.to_string(), (price, Utc::now()));
    }
}

/// Outcome of a margin check for one user in one tick (§4.7 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarginState {
    Normal,
    Warn,
    Emergency,
}

/// Users whose sizing budget was halved by a liquidation warning on the most
/// recent tick (§4.7 step 7 "halve the sizing budget for the next Auto-Trader
/// cycle"). The Auto-Trader consults this before sizing a new position and
/// clears its own entry once consumed.
#[derive(Default)]
pub struct SizingBudgetFlags {
    halved: RwLock<HashSet<Uuid>>,
}

impl SizingBudgetFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, user_id: Uuid) {
        self.halved.write().insert(user_id);
    }

    /// Consume (clear) the flag for `user_id`, returning whether it was set.
    pub fn take(&self, user_id: Uuid) -> bool {
        self.halved.write().remove(&user_id)
    }
}

pub struct PositionMonitor {
    positions: RwLock<HashMap<Uuid, Position>>,
    dirty: RwLock<HashSet<Uuid>>,
    locks: RwLock<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    store: Arc<dyn Store>,
    brokers: Arc<dyn BrokerRegistry>,
    alerts: Arc<dyn AlertSink>,
    config: Config,
    price_cache: PriceCache,
    pub sizing_budget: Arc<SizingBudgetFlags>,
    new_positions_rx: AsyncMutex<mpsc::UnboundedReceiver<Position>>,
}

/// Sender half of the position-update channel (§9): the Auto-Trader holds
/// one of these per monitor and pushes newly opened positions through it
/// instead of reaching into the monitor's map directly.
pub type NewPositionSender = mpsc::UnboundedSender<Position>;

impl PositionMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        brokers: Arc<dyn BrokerRegistry>,
        alerts: Arc<dyn AlertSink>,
        config: Config,
    ) -> (Arc<Self>, NewPositionSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let price_cache_ttl = config.price_cache_ttl_s;
        let monitor = Arc::new(Self {
            positions: RwLock::new(HashMap::new()),
            dirty: RwLock::new(HashSet::new()),
            locks: RwLock::new(HashMap::new()),
            store,
            brokers,
            alerts,
            config,
            price_cache: PriceCache::new(price_cache_ttl),
            sizing_budget: Arc::new(SizingBudgetFlags::new()),
            new_positions_rx: AsyncMutex::new(rx),
        });
        (monitor, tx)
    }

    /// Startup reconciliation step 1 (§4.8): load every non-CLOSED row from
    /// the durable mirror into the in-memory map. Ghost cleanup and
    /// unmonitored-position ingestion (step 2) are driven by `crate::reconcile`
    /// per user and fed back in through `ingest`.
    pub async fn load_from_store(&self) -> anyhow::Result<()> {
        let rows = self.store.load_open_positions().await?;
        let mut map = self.positions.write();
        for position in rows {
            map.insert(position.id, position);
        }
        info!(count = map.len(), "Position monitor loaded open positions from durable mirror");
        Ok(())
    }

    /// Insert a position the monitor doesn't yet know about (newly ingested
    /// by `crate::reconcile::ingest_unmonitored_positions`). The caller is
    /// responsible for having already upserted it to the store.
    pub fn ingest(&self, position: Position) {
        self.positions.write().insert(position.id, position);
    }

    /// Snapshot of every currently open position, for external readers
    /// (§9 "external readers get snapshots").
    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.read().values().filter(|p| p.is_open()).cloned().collect()
    }

    pub fn open_positions_for_user(&self, user_id: Uuid) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.is_open() && p.user_id == user_id)
            .cloned()
            .collect()
    }

    fn lock_for(&self, position_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.write();
        locks.entry(position_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Run forever, ticking every `config.monitor_interval_s` and draining
    /// the new-position channel as it arrives. `shutdown` going `true`
    /// interrupts the sleep between ticks (§5 "Cancellation") but never an
    /// in-flight tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.config.monitor_interval_s, "Position monitor started");
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.monitor_interval_s));
        let mut checkpoint_ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.checkpoint_interval_s));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_new_positions().await;
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "position monitor tick failed");
                    }
                }
                _ = checkpoint_ticker.tick() => {
                    if let Err(e) = self.checkpoint().await {
                        error!(error = %e, "position monitor checkpoint failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Position monitor shutting down, flushing durable mirror");
                        let _ = self.checkpoint().await;
                        break;
                    }
                }
            }
        }
    }

    async fn drain_new_positions(&self) {
        let mut rx = self.new_positions_rx.lock().await;
        while let Ok(position) = rx.try_recv() {
            info!(position_id = %position.id, symbol = %position.symbol, "Position monitor received new position");
            self.positions.write().insert(position.id, position);
        }
    }

    /// Full checkpoint (§4.8): write every position's current state to the
    /// durable mirror, dirty or not.
    async fn checkpoint(&self) -> anyhow::Result<()> {
        let snapshot: Vec<Position> = self.positions.read().values().cloned().collect();
        for position in &snapshot {
            self.store.upsert_position(position).await?;
        }
        self.dirty.write().clear();
        debug!(count = snapshot.len(), "Position monitor checkpoint written");
        Ok(())
    }

    /// One supervision pass over every open position (§4.7). Exposed
    /// directly so tests can drive explicit ticks instead of real timers
    /// (§10.5).
    #[instrument(skip(self))]
    pub async fn tick(&self) -> anyhow::Result<()> {
        let open = self.open_positions();
        if open.is_empty() {
            return Ok(());
        }

        let user_ids: HashSet<Uuid> = open.iter().map(|p| p.user_id).collect();
        let mut margin_states: HashMap<Uuid, MarginState> = HashMap::new();
        for user_id in user_ids {
            let positions_for_user: Vec<&Position> = open.iter().filter(|p| p.user_id == user_id).collect();
            let trading_mode = positions_for_user.first().map(|p| p.trading_mode).unwrap_or(TradingMode::Spot);
            if trading_mode.is_spot() {
                margin_states.insert(user_id, MarginState::Normal);
                continue;
            }
            let state = self.evaluate_margin_state(user_id).await;
            margin_states.insert(user_id, state);
        }

        let mut settings_cache: HashMap<Uuid, crate::models::TradingSettings> = HashMap::new();
        for user_id in open.iter().map(|p| p.user_id).collect::<HashSet<_>>() {
            let settings = self
                .store
                .load_settings(user_id)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| crate::models::TradingSettings::defaults_for_mode(TradingMode::Futures));
            settings_cache.insert(user_id, settings);
        }

        for position in &open {
            let lock = self.lock_for(position.id);
            let _guard = lock.lock().await;

            // Re-read: another path (e.g. ghost cleanup) may have closed it
            // between the snapshot above and acquiring the lock.
            let current = self.positions.read().get(&position.id).cloned();
            let Some(current) = current else { continue };
            if !current.is_open() {
                continue;
            }

            let margin_state = margin_states.get(&current.user_id).copied().unwrap_or(MarginState::Normal);
            let settings = settings_cache
                .get(&current.user_id)
                .cloned()
                .unwrap_or_else(|| crate::models::TradingSettings::defaults_for_mode(current.trading_mode));

            if let Err(e) = self.evaluate_position(current, margin_state, &settings).await {
                error!(position_id = %position.id, error = %e, "position evaluation failed, position left open");
            }
        }

        for (user_id, state) in margin_states {
            match state {
                MarginState::Emergency => {
                    self.alerts
                        .emit(
                            AlertSeverity::Critical,
                            "emergency liquidation-protection close triggered",
                            &serde_json::json!({ "user_id": user_id }),
                        )
                        .await;
                }
                MarginState::Warn => {
                    self.sizing_budget.set(user_id);
                    self.alerts
                        .emit(
                            AlertSeverity::Warning,
                            "margin level low, next cycle's sizing budget halved",
                            &serde_json::json!({ "user_id": user_id }),
                        )
                        .await;
                }
                MarginState::Normal => {}
            }
        }

        Ok(())
    }

    async fn evaluate_margin_state(&self, user_id: Uuid) -> MarginState {
        let Some(broker) = self.brokers.broker_for(user_id) else {
            return MarginState::Normal;
        };
        match broker.get_margin_snapshot().await {
            Ok(Some(snapshot)) => match snapshot.margin_level_pct() {
                Some(level) if level <= self.config.liquidation_close => MarginState::Emergency,
                Some(level) if level <= self.config.liquidation_warn => MarginState::Warn,
                _ => MarginState::Normal,
            },
            Ok(None) => MarginState::Normal,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "margin snapshot fetch failed, skipping liquidation check this tick");
                MarginState::Normal
            }
        }
    }

    /// Evaluate and, if triggered, act on one position. Fixed order (§5):
    /// SL -> TP -> trailing -> partial-TP -> time -> liquidation -> persist.
    async fn evaluate_position(
        &self,
        mut position: Position,
        margin_state: MarginState,
        settings: &crate::models::TradingSettings,
    ) -> anyhow::Result<()> {
        let Some(broker) = self.brokers.broker_for(position.user_id) else {
            warn!(position_id = %position.id, "no broker registered for user, skipping tick");
            return Ok(());
        };

        let price = match self.price_for(&position.symbol, broker.as_ref()).await {
            Some(p) => p,
            None => {
                warn!(symbol = %position.symbol, "price fetch failed, skipping symbol this tick");
                return Ok(());
            }
        };

        let now = Utc::now();
        let mut changed = false;

        // Liquidation overrides everything else except an already-closed
        // position, which the caller has already filtered out.
        if margin_state == MarginState::Emergency {
            self.close_full(&mut position, &*broker, price, CloseReason::LiquidationClose, now).await?;
            self.persist(&position, None).await?;
            return Ok(());
        }

        // 1. Stop loss.
        if self.stop_loss_triggered(&position, price) {
            self.close_full(&mut position, &*broker, price, CloseReason::StopLoss, now).await?;
            self.persist(&position, None).await?;
            return Ok(());
        }

        // 2. Take profit.
        if self.take_profit_triggered(&position, price) {
            self.close_full(&mut position, &*broker, price, CloseReason::TakeProfit, now).await?;
            self.persist(&position, None).await?;
            return Ok(());
        }

        // 3. Trailing stop.
        if settings.trailing_enabled {
            if let Some(reeval) = self.apply_trailing(&mut position, price, now) {
                self.persist(&position, Some(reeval)).await?;
                changed = true;
            }
            if self.trailing_stop_triggered(&position, price) {
                self.close_full(&mut position, &*broker, price, CloseReason::TrailingStop, now).await?;
                self.persist(&position, None).await?;
                return Ok(());
            }
        }

        // 4. Partial take profit (only reached if TP didn't already fire).
        if settings.partial_tp_enabled {
            if let Some(full_exit) = self.apply_partial_tp(&mut position, &*broker, price, now).await? {
                if full_exit {
                    self.close_full(&mut position, &*broker, price, CloseReason::TakeProfit, now).await?;
                }
                self.persist(&position, None).await?;
                if full_exit {
                    return Ok(());
                }
                changed = true;
            }
        }

        // 5. Time exit.
        let max_hold = chrono::Duration::hours(settings.max_hold_hours);
        if now - position.opened_at >= max_hold {
            self.close_full(&mut position, &*broker, price, CloseReason::TimeExit, now).await?;
            self.persist(&position, None).await?;
            return Ok(());
        }

        if changed {
            self.mark_dirty(position.id);
        }
        Ok(())
    }

    async fn price_for(&self, symbol: &str, broker: &dyn Broker) -> Option<f64> {
        if let Some(price) = self.price_cache.get(symbol) {
            return Some(price);
        }
        match broker.get_market_price(symbol).await {
            Ok(price) => {
                self.price_cache.put(symbol, price);
                Some(price)
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "price fetch error");
                None
            }
        }
    }

    /// Price exactly at SL triggers the close: `<=` for long, `>=` for short
    /// (§8 boundary behavior).
    fn stop_loss_triggered(&self, position: &Position, price: f64) -> bool {
        match position.side {
            Side::Long => price <= position.stop_loss,
            Side::Short => price >= position.stop_loss,
        }
    }

    fn take_profit_triggered(&self, position: &Position, price: f64) -> bool {
        match position.side {
            Side::Long => price >= position.take_profit,
            Side::Short => price <= position.take_profit,
        }
    }

    fn trailing_stop_triggered(&self, position: &Position, price: f64) -> bool {
        let Some(trailing_sl) = position.trailing_sl else { return false };
        match position.side {
            Side::Long => price <= trailing_sl,
            Side::Short => price >= trailing_sl,
        }
    }

    /// Activate/update the trailing stop (§4.7 step 4). Returns a
    /// `ReEvaluation` when the trail state changed this tick.
    fn apply_trailing(
        &self,
        position: &mut Position,
        price: f64,
        now: chrono::DateTime<Utc>,
    ) -> Option<ReEvaluation> {
        let profit_pct = position.profit_pct(price);

        if !position.trailing_activated {
            if profit_pct >= self.config.trailing_activation {
                let trailing_sl = match position.side {
                    Side::Long => price * (1.0 - self.config.trailing_distance),
                    Side::Short => price * (1.0 + self.config.trailing_distance),
                };
                let old_sl = Some(position.stop_loss);
                position.trailing_activated = true;
                position.peak_price = Some(price);
                position.trailing_sl = Some(trailing_sl);
                self.mark_dirty(position.id);
                return Some(ReEvaluation::new(
                    position.id,
                    ReEvaluationKind::TrailingActivate,
                    old_sl,
                    Some(trailing_sl),
                    None,
                    None,
                    format!("profit {:.4}% reached trailing activation", profit_pct * 100.0),
                    "trailing stop activated",
                    now,
                ));
            }
            return None;
        }

        let peak = position.peak_price.unwrap_or(position.entry_price);
        let improved = match position.side {
            Side::Long => price > peak,
            Side::Short => price < peak,
        };
        if !improved {
            return None;
        }

        let old_sl = position.trailing_sl;
        let new_peak = price;
        let new_trailing_sl = match position.side {
            Side::Long => new_peak * (1.0 - self.config.trailing_distance),
            Side::Short => new_peak * (1.0 + self.config.trailing_distance),
        };
        position.peak_price = Some(new_peak);
        position.trailing_sl = Some(new_trailing_sl);
        self.mark_dirty(position.id);
        Some(ReEvaluation::new(
            position.id,
            ReEvaluationKind::TrailingUpdate,
            old_sl,
            Some(new_trailing_sl),
            None,
            None,
            format!("new peak {new_peak:.4}"),
            "trailing stop ratcheted",
            now,
        ))
    }

    /// Partial TP ladder (§4.7 step 5). Each level's fraction is applied to
    /// the *remaining* quantity, not the original — `[0.25, 0.5, 0.75]` over
    /// three levels leaves a 0.09375 runner on a unit position (§8 scenario
    /// 3), whereas fractions of the original would overshoot the position
    /// by the second level. The residual floor is likewise judged against
    /// the quantity still open going into the level, not the original size,
    /// so the ladder's own shrinking base doesn't self-trigger escalation on
    /// its last rung. Returns `Some(true)` if the residual floor forced
    /// escalation to a full exit, `Some(false)` if a partial close was taken
    /// without escalation, `None` if no level triggered.
    async fn apply_partial_tp(
        &self,
        position: &mut Position,
        broker: &dyn Broker,
        price: f64,
        now: chrono::DateTime<Utc>,
    ) -> anyhow::Result<Option<bool>> {
        let profit_pct = position.profit_pct(price);
        let levels = self.config.partial_tp_levels.clone();

        for (idx, (target_pct, fraction)) in levels.iter().enumerate() {
            if position.partial_tp_taken.get(&idx).copied().unwrap_or(false) {
                continue;
            }
            if profit_pct < *target_pct {
                continue;
            }

            let floor = position.quantity * self.config.partial_tp_residual_floor;
            let qty = position.quantity * fraction;
            let residual = position.quantity - qty;

            if residual < floor {
                // Escalate to a full exit rather than leave dust (§8
                // boundary behavior).
                position.partial_tp_taken.insert(idx, true);
                let trade = Trade::new(position, position.quantity, price, CloseReason::TakeProfit, now);
                self.store.insert_trade(&trade).await?;
                info!(position_id = %position.id, level = idx, "partial TP residual below floor, escalating to full exit");
                return Ok(Some(true));
            }

            match broker.partial_close(&position.symbol, position.side, qty, position.quantity).await {
                Ok(_) => {
                    let trade = Trade::new(position, qty, price, CloseReason::PartialTp, now);
                    self.store.insert_trade(&trade).await?;
                    position.quantity = residual;
                    position.partial_tp_taken.insert(idx, true);
                    self.mark_dirty(position.id);

                    let reeval = ReEvaluation::new(
                        position.id,
                        ReEvaluationKind::PartialTp,
                        None,
                        None,
                        None,
                        None,
                        format!("level {idx} target {:.2}% reached, took {:.1}% of original", target_pct * 100.0, fraction * 100.0),
                        format!("partial close of {qty:.8}"),
                        now,
                    );
                    self.store.insert_reevaluation(&reeval).await?;

                    self.apply_break_even(position, now).await?;
                    return Ok(Some(false));
                }
                Err(e) => {
                    error!(position_id = %position.id, error = %e, "partial close failed, leaving level untaken");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Break-even move triggered by a partial TP (§4.7 step 5): move SL to
    /// `entry * (1 + 0.1% * side_sign)`, but only if that's tighter than the
    /// current SL.
    async fn apply_break_even(&self, position: &mut Position, now: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        const BREAK_EVEN_OFFSET: f64 = 0.001;
        let breakeven_sl = position.entry_price * (1.0 + BREAK_EVEN_OFFSET * position.side.sign());
        let tighter = match position.side {
            Side::Long => breakeven_sl > position.stop_loss,
            Side::Short => breakeven_sl < position.stop_loss,
        };
        if !tighter {
            return Ok(());
        }
        let old_sl = position.stop_loss;
        position.stop_loss = breakeven_sl;
        self.mark_dirty(position.id);
        let reeval = ReEvaluation::new(
            position.id,
            ReEvaluationKind::BreakEven,
            Some(old_sl),
            Some(breakeven_sl),
            None,
            None,
            "partial TP taken",
            "stop loss moved to break-even",
            now,
        );
        self.store.insert_reevaluation(&reeval).await
    }

    /// Close the remaining quantity, retrying the broker call up to
    /// `max_broker_retries` times (§4.7 failure semantics). A persistent
    /// failure leaves the position OPEN and logs an error — it is never
    /// marked CLOSED without a confirmed close.
    async fn close_full(
        &self,
        position: &mut Position,
        broker: &dyn Broker,
        price: f64,
        reason: CloseReason,
        now: chrono::DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let qty = position.quantity;
        if qty <= 0.0 {
            return Ok(());
        }

        let mut last_err = None;
        for _attempt in 0..self.config.max_broker_retries {
            match broker.close_position(&position.symbol, position.side, qty).await {
                Ok(_) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }

        if let Some(e) = last_err {
            error!(position_id = %position.id, reason = %reason, error = %e, "close failed after retries, position left OPEN");
            return Ok(());
        }

        let trade = Trade::new(position, qty, price, reason, now);
        self.store.insert_trade(&trade).await?;

        position.quantity = 0.0;
        position.status = PositionStatus::Closed;
        position.closed_at = Some(now);
        self.mark_dirty(position.id);

        let reeval = ReEvaluation::new(
            position.id,
            ReEvaluationKind::Close,
            Some(position.stop_loss),
            None,
            Some(position.take_profit),
            None,
            reason.to_string(),
            format!("closed at {price}"),
            now,
        );
        self.store.insert_reevaluation(&reeval).await?;

        info!(position_id = %position.id, symbol = %position.symbol, reason = %reason, pnl = trade.realized_pnl, "position closed");
        Ok(())
    }

    fn mark_dirty(&self, position_id: Uuid) {
        self.dirty.write().insert(position_id);
    }

    /// Write the mutated position back to the in-memory map and, if it was
    /// marked dirty, to the durable mirror (§4.8's "flushed on every
    /// successful mutation"). An optional `ReEvaluation` is persisted first.
    async fn persist(&self, position: &Position, reeval: Option<ReEvaluation>) -> anyhow::Result<()> {
        if let Some(reeval) = reeval {
            self.store.insert_reevaluation(&reeval).await?;
        }
        self.positions.write().insert(position.id, position.clone());
        if self.dirty.write().remove(&position.id) || !position.is_open() {
            self.store.upsert_position(position).await?;
        }
        Ok(())
    }

    /// Ghost cleanup entry point (§4.8 step 2): drop a position the monitor
    /// still tracks as open but which `crate::reconcile::ghost_cleanup`
    /// has already closed and recorded in the durable store.
    pub fn forget_closed(&self, position_id: Uuid) {
        self.positions.write().remove(&position_id);
        self.locks.write().remove(&position_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Balance, ExchangePosition, MarginSnapshot, Order, PlaceOrderRequest, PlaceOrderResult};
    use crate::candles::Candle;
    use crate::error::BrokerError;
    use crate::models::TradingSettings;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;

    struct FakeAlerts {
        events: RwLock<Vec<(AlertSeverity, String)>>,
    }

    #[async_trait]
    impl AlertSink for FakeAlerts {
        async fn emit(&self, severity: AlertSeverity, message: &str, _context: &serde_json::Value) {
            self.events.write().push((severity, message.to_string()));
        }
    }

    struct FakeBroker {
        price: RwLock<f64>,
        margin: Option<MarginSnapshot>,
        closes: RwLock<Vec<(String, f64)>>,
        partials: RwLock<Vec<(String, f64)>>,
    }

    impl FakeBroker {
        fn new(price: f64) -> Self {
            Self { price: RwLock::new(price), margin: None, closes: RwLock::new(Vec::new()), partials: RwLock::new(Vec::new()) }
        }
        fn set_price(&self, price: f64) {
            *self.price.write() = price;
        }
    }

    #[async_trait]
    impl Broker for FakeBroker {
        fn trading_mode(&self) -> TradingMode {
            TradingMode::Futures
        }
        async fn place_order(&self, _req: PlaceOrderRequest) -> Result<PlaceOrderResult, BrokerError> {
            unimplemented!()
        }
        async fn close_position(&self, symbol: &str, _side: Side, quantity: f64) -> Result<Order, BrokerError> {
            self.closes.write().push((symbol.to_string(), quantity));
            Ok(Order { id: "1".into(), symbol: symbol.to_string(), side: Side::Long, quantity, price: 0.0, reduce_only: true })
        }
        async fn partial_close(&self, symbol: &str, _side: Side, qty: f64, _remaining: f64) -> Result<Order, BrokerError> {
            self.partials.write().push((symbol.to_string(), qty));
            Ok(Order { id: "2".into(), symbol: symbol.to_string(), side: Side::Long, quantity: qty, price: 0.0, reduce_only: true })
        }
        async fn get_positions(&self) -> Result<Vec<ExchangePosition>, BrokerError> {
            Ok(Vec::new())
        }
        async fn get_balance(&self) -> Result<Balance, BrokerError> {
            Ok(Balance { free: 10_000.0 })
        }
        async fn get_margin_snapshot(&self) -> Result<Option<MarginSnapshot>, BrokerError> {
            Ok(self.margin)
        }
        async fn get_market_price(&self, _symbol: &str) -> Result<f64, BrokerError> {
            Ok(*self.price.read())
        }
        async fn get_ohlcv(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> Result<Vec<Candle>, BrokerError> {
            Ok(Vec::new())
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: f64) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn setup(broker: FakeBroker, position: Position) -> (Arc<PositionMonitor>, Arc<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let user_id = position.user_id;
        let mut brokers = HashMap::new();
        brokers.insert(user_id, Arc::new(broker) as Arc<dyn Broker>);
        let registry = Arc::new(StaticBrokerRegistry::new(brokers));
        let alerts = Arc::new(FakeAlerts { events: RwLock::new(Vec::new()) });
        let (monitor, _tx) = PositionMonitor::new(store.clone(), registry, alerts, Config::default());
        monitor.ingest(position);
        (monitor, store, user_id)
    }

    fn long_position(user_id: Uuid, entry: f64, sl: f64, tp: f64) -> Position {
        Position::new(user_id, "BTC/USDT", Side::Long, 1.0, entry, sl, tp, 1.0, TradingMode::Futures, Utc::now())
    }

    #[tokio::test]
    async fn stop_loss_closes_at_boundary_price() {
        let user_id = Uuid::new_v4();
        let position = long_position(user_id, 50_000.0, 49_000.0, 52_000.0);
        let id = position.id;
        let broker = FakeBroker::new(49_000.0);
        let (monitor, store, _) = setup(broker, position);

        monitor.tick().await.unwrap();

        assert!(monitor.positions.read().get(&id).unwrap().is_open() == false);
        assert_eq!(store.trades().len(), 1);
        assert_eq!(store.trades()[0].close_reason, CloseReason::StopLoss);
    }

    #[tokio::test]
    async fn take_profit_closes_at_boundary_price() {
        let user_id = Uuid::new_v4();
        let position = long_position(user_id, 50_000.0, 49_000.0, 52_000.0);
        let broker = FakeBroker::new(52_000.0);
        let (monitor, store, _) = setup(broker, position);

        monitor.tick().await.unwrap();

        assert_eq!(store.trades()[0].close_reason, CloseReason::TakeProfit);
    }

    #[tokio::test]
    async fn tick_is_idempotent_on_closed_position() {
        let user_id = Uuid::new_v4();
        let position = long_position(user_id, 50_000.0, 49_000.0, 52_000.0);
        let broker = FakeBroker::new(52_000.0);
        let (monitor, store, _) = setup(broker, position);

        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();

        assert_eq!(store.trades().len(), 1);
    }

    #[tokio::test]
    async fn trailing_activates_and_then_exits() {
        let user_id = Uuid::new_v4();
        let mut position = long_position(user_id, 100_000.0, 90_000.0, 150_000.0);
        position.quantity = 1.0;
        position.original_quantity = 1.0;
        let id = position.id;

        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(FakeBroker::new(100_100.0));
        let mut brokers: HashMap<Uuid, Arc<dyn Broker>> = HashMap::new();
        brokers.insert(user_id, broker.clone() as Arc<dyn Broker>);
        let registry = Arc::new(StaticBrokerRegistry::new(brokers));
        let alerts = Arc::new(FakeAlerts { events: RwLock::new(Vec::new()) });
        let mut config = Config::default();
        config.price_cache_ttl_s = 0; // force a fresh broker read every tick
        let (monitor, _tx) = PositionMonitor::new(store, registry, alerts, config);
        monitor.ingest(position);
        monitor
            .store
            .save_settings(user_id, &{
                let mut s = TradingSettings::defaults_for_mode(TradingMode::Futures);
                s.trailing_enabled = true;
                s.partial_tp_enabled = false;
                s
            })
            .await
            .unwrap();

        // 100_100 is only +0.1% over entry, below the 0.5% activation bar.
        monitor.tick().await.unwrap();
        assert!(!monitor.positions.read().get(&id).unwrap().trailing_activated);

        // +0.8% clears activation: trailing stop arms 1% below this new peak.
        broker.set_price(100_800.0);
        monitor.tick().await.unwrap();
        {
            let p = monitor.positions.read().get(&id).unwrap().clone();
            assert!(p.trailing_activated);
            assert!((p.trailing_sl.unwrap() - 100_800.0 * 0.99).abs() < 1e-6);
        }

        // Price pulls back through the trailing stop: position should close.
        broker.set_price(99_000.0);
        monitor.tick().await.unwrap();
        let closed = monitor.positions.read().get(&id).unwrap().clone();
        assert!(!closed.is_open());
    }

    #[tokio::test]
    async fn partial_tp_takes_first_level_and_moves_to_breakeven() {
        let user_id = Uuid::new_v4();
        let mut position = long_position(user_id, 3_000.0, 2_900.0, 3_200.0);
        position.quantity = 1.0;
        position.original_quantity = 1.0;
        let id = position.id;
        let broker = FakeBroker::new(3_030.0);
        let (monitor, store, _) = setup(broker, position);
        monitor.store.save_settings(user_id, &{
            let mut s = TradingSettings::defaults_for_mode(TradingMode::Futures);
            s.trailing_enabled = false;
            s.partial_tp_enabled = true;
            s
        }).await.unwrap();

        monitor.tick().await.unwrap();

        let p = monitor.positions.read().get(&id).unwrap().clone();
        assert!(p.is_open());
        assert_eq!(p.partial_tp_taken.get(&0), Some(&true));
        assert!((p.quantity - 0.75).abs() < 1e-9);
        assert!(p.stop_loss > 2_900.0, "stop loss should have moved toward break-even");
        assert_eq!(store.trades().len(), 1);
        assert_eq!(store.trades()[0].close_reason, CloseReason::PartialTp);
    }

    /// §8 scenario 3: LONG ETH, entry 3000, qty=1. Three ticks walk the
    /// price through all three ladder levels; each level's fraction is
    /// taken off the *remaining* quantity (0.25, then 0.375, then
    /// 0.28125), leaving a 0.09375 runner OPEN rather than escalating to a
    /// full exit at level 2.
    #[tokio::test]
    async fn partial_tp_ladder_leaves_a_runner_across_three_levels() {
        let user_id = Uuid::new_v4();
        let mut position = long_position(user_id, 3_000.0, 2_900.0, 10_000.0);
        position.quantity = 1.0;
        position.original_quantity = 1.0;
        let id = position.id;

        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(FakeBroker::new(3_030.0));
        let mut brokers: HashMap<Uuid, Arc<dyn Broker>> = HashMap::new();
        brokers.insert(user_id, broker.clone() as Arc<dyn Broker>);
        let registry = Arc::new(StaticBrokerRegistry::new(brokers));
        let alerts = Arc::new(FakeAlerts { events: RwLock::new(Vec::new()) });
        let mut config = Config::default();
        config.price_cache_ttl_s = 0;
        let (monitor, _tx) = PositionMonitor::new(store.clone(), registry, alerts, config);
        monitor.ingest(position);
        monitor
            .store
            .save_settings(user_id, &{
                let mut s = TradingSettings::defaults_for_mode(TradingMode::Futures);
                s.trailing_enabled = false;
                s.partial_tp_enabled = true;
                s
            })
            .await
            .unwrap();

        // Level 0: +1% -> sell 25% of the original 1.0.
        monitor.tick().await.unwrap();
        {
            let p = monitor.positions.read().get(&id).unwrap().clone();
            assert!(p.is_open());
            assert_eq!(p.partial_tp_taken.get(&0), Some(&true));
            assert!((p.quantity - 0.75).abs() < 1e-9);
        }

        // Level 1: +2% -> sell 50% of the remaining 0.75.
        broker.set_price(3_060.0);
        monitor.tick().await.unwrap();
        {
            let p = monitor.positions.read().get(&id).unwrap().clone();
            assert!(p.is_open());
            assert_eq!(p.partial_tp_taken.get(&1), Some(&true));
            assert!((p.quantity - 0.375).abs() < 1e-9);
        }

        // Level 2: +3% -> sell 75% of the remaining 0.375, leaving a runner.
        broker.set_price(3_090.0);
        monitor.tick().await.unwrap();
        {
            let p = monitor.positions.read().get(&id).unwrap().clone();
            assert!(p.is_open(), "position should survive as a 0.09375 runner, not be escalated to a full exit");
            assert_eq!(p.partial_tp_taken.get(&2), Some(&true));
            assert!((p.quantity - 0.09375).abs() < 1e-9);
        }

        let trades = store.trades();
        assert_eq!(trades.len(), 3);
        assert!(trades.iter().all(|t| t.close_reason == CloseReason::PartialTp));

        // 3 partial-tp reevals, but break-even fires only once: the break-even
        // SL is a fixed offset off entry_price, so once level 0 moves the SL
        // there, levels 1 and 2 recompute the same value and find it no
        // longer strictly tighter than the current SL.
        assert_eq!(store.reevaluations().len(), 4);
        assert_eq!(
            monitor.positions.read().get(&id).unwrap().partial_tp_taken,
            [(0usize, true), (1, true), (2, true)].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn time_exit_closes_stale_position() {
        let user_id = Uuid::new_v4();
        let mut position = long_position(user_id, 50_000.0, 40_000.0, 90_000.0);
        position.opened_at = Utc::now() - chrono::Duration::hours(13);
        let broker = FakeBroker::new(50_100.0);
        let (monitor, store, _) = setup(broker, position);

        monitor.tick().await.unwrap();

        assert_eq!(store.trades()[0].close_reason, CloseReason::TimeExit);
    }

    #[tokio::test]
    async fn emergency_margin_closes_position() {
        let user_id = Uuid::new_v4();
        let position = long_position(user_id, 50_000.0, 40_000.0, 90_000.0);
        let mut broker = FakeBroker::new(50_100.0);
        broker.margin = Some(MarginSnapshot { equity: 30.0, used_margin: 1000.0 }); // 3% margin level
        let (monitor, store, _) = setup(broker, position);

        monitor.tick().await.unwrap();

        assert_eq!(store.trades()[0].close_reason, CloseReason::LiquidationClose);
    }
}
