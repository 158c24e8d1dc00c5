// =============================================================================
// Auto-Trader (§4.6) — the signal-to-position cycle driver.
// =============================================================================
//
// One `AutoTrader` runs per user, ticking every `config.cycle_interval_s`
// (default 300s). Each cycle: pre-flight gates, broker reconciliation,
// fetch+dedup candidate signals, validate/size/place in confidence order,
// capped by the per-cycle trade limit. Newly opened positions are handed to
// the shared Position Monitor over a channel rather than by reaching into
// its map directly (§9).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, PlaceOrderRequest};
use crate::calendar::EconomicCalendar;
use crate::candles::Candle;
use crate::config::{event_gates_trading, Config};
use crate::models::{Position, TradingSettings, User};
use crate::monitor::{NewPositionSender, PositionMonitor};
use crate::portfolio::{self, OpenExposure};
use crate::regime;
use crate::risk;
use crate::signals::reader::fresh_deduplicated_signals;
use crate::signals::validator::{self, ValidationContext};
use crate::store::Store;
use crate::types::{OrderType, Side, SignalAction};

/// Lookback used for the 24h realized-volatility figure fed to the
/// validator (§4.3 step 1) — 24 hourly candles.
const VOLATILITY_LOOKBACK_CANDLES: usize = 24;

/// How far ahead to ask the calendar collaborator, generous enough to cover
/// both the before- and after-event gating windows (§4.6 step 1).
const CALENDAR_LOOKAHEAD_MIN: i64 = 180;

pub struct AutoTrader {
    user: User,
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    calendar: Arc<dyn EconomicCalendar>,
    config: Config,
    monitor: Arc<PositionMonitor>,
    monitor_tx: NewPositionSender,
}

impl AutoTrader {
    pub fn new(
        user: User,
        broker: Arc<dyn Broker>,
        store: Arc<dyn Store>,
        calendar: Arc<dyn EconomicCalendar>,
        config: Config,
        monitor: Arc<PositionMonitor>,
        monitor_tx: NewPositionSender,
    ) -> Self {
        Self { user, broker, store, calendar, config, monitor, monitor_tx }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(user_id = %self.user.id, interval_s = self.config.cycle_interval_s, "Auto-Trader started");
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.cycle_interval_s));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(user_id = %self.user.id, error = %e, "auto-trader cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(user_id = %self.user.id, "Auto-Trader shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full trading cycle (§4.6 steps 1-5). Exposed directly so tests
    /// can drive cycles explicitly rather than real timers (§10.5).
    #[instrument(skip(self), fields(user_id = %self.user.id))]
    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        let settings = self
            .store
            .load_settings(self.user.id)
            .await?
            .unwrap_or_else(|| self.user.settings.clone())
            .normalized_for_mode(self.user.trading_mode);

        // Step 1: pre-flight gates.
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let day_ago = Utc::now() - chrono::Duration::hours(24);
        let hourly_count = self.store.trades_since(self.user.id, hour_ago).await?;
        if hourly_count >= settings.hourly_trade_limit {
            info!(hourly_count, limit = settings.hourly_trade_limit, "hourly trade limit reached, skipping cycle");
            return Ok(());
        }
        let daily_count = self.store.trades_since(self.user.id, day_ago).await?;
        if daily_count >= settings.daily_trade_limit {
            info!(daily_count, limit = settings.daily_trade_limit, "daily trade limit reached, skipping cycle");
            return Ok(());
        }

        if let Some(event) = self.calendar.get_upcoming_high_impact_event(CALENDAR_LOOKAHEAD_MIN).await? {
            if event_gates_trading(&event, &self.config) {
                info!(event = %event.name, minutes_until = event.minutes_until, "high-impact event gate active, skipping cycle");
                return Ok(());
            }
        }

        // Step 2: reconcile broker-reported positions against the durable
        // mirror, feeding any newly discovered position to the Monitor.
        let ingested = crate::reconcile::ingest_unmonitored_positions(
            self.broker.as_ref(),
            self.store.as_ref(),
            self.user.id,
            self.user.trading_mode,
            settings.stop_loss_pct,
            settings.take_profit_pct,
            &self.config,
        )
        .await?;
        for position in ingested {
            let _ = self.monitor_tx.send(position);
        }

        // Step 3: fetch and dedup candidate signals, sorted by confidence.
        let raw_since = Utc::now() - chrono::Duration::hours(self.config.signal_freshness_hours);
        let raw_rows = self
            .store
            .fetch_fresh_signals(self.user.id, &self.config.signal_sources_whitelist, raw_since)
            .await?;
        let mut consensus: HashMap<(String, SignalAction), u32> = HashMap::new();
        for row in &raw_rows {
            *consensus.entry((row.symbol.clone(), row.action)).or_insert(0) += 1;
        }

        let mut candidates =
            fresh_deduplicated_signals(self.store.as_ref(), self.user.id, &self.config.signal_sources_whitelist, self.config.signal_freshness_hours)
                .await?;
        candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

        if candidates.is_empty() {
            debug!("no fresh candidate signals this cycle");
            return Ok(());
        }

        let open_positions = self.monitor.open_positions_for_user(self.user.id);
        let mut trades_this_cycle: u32 = 0;

        for signal in candidates {
            if trades_this_cycle >= self.config.max_trades_per_cycle {
                info!(limit = self.config.max_trades_per_cycle, "per-cycle trade cap reached, stopping cycle early");
                break;
            }

            let Some(side) = signal.action.to_side() else { continue };

            if self.user.trading_mode.is_spot() && side == Side::Short {
                debug!(symbol = %signal.symbol, "spot account cannot short, skipping signal");
                continue;
            }

            let same_symbol: Vec<&Position> = open_positions.iter().filter(|p| p.symbol == signal.symbol).collect();
            if same_symbol.iter().any(|p| p.side == side) {
                debug!(symbol = %signal.symbol, %side, "already holding this direction, skipping signal");
                continue;
            }
            if same_symbol.iter().any(|p| p.side != side) && !settings.hedging_enabled {
                debug!(symbol = %signal.symbol, "opposite-side position open and hedging disabled, skipping signal");
                continue;
            }

            if open_positions.len() >= settings.max_concurrent_positions as usize {
                info!(max = settings.max_concurrent_positions, "max concurrent positions reached, stopping cycle early");
                break;
            }

            match self.try_open_position(&signal, side, &settings, &consensus, &open_positions).await {
                Ok(Some(position)) => {
                    info!(position_id = %position.id, symbol = %position.symbol, %side, "opened new position");
                    let _ = self.monitor_tx.send(position);
                    trades_this_cycle += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(symbol = %signal.symbol, error = %e, "failed to act on signal");
                }
            }
        }

        Ok(())
    }

    /// Validate, size, and (if everything clears) place one candidate
    /// signal (§4.6 step 4). Returns `Ok(None)` for any rejection that isn't
    /// an error — rejections are logged with their reasons but don't abort
    /// the cycle.
    async fn try_open_position(
        &self,
        signal: &crate::models::Signal,
        side: Side,
        settings: &TradingSettings,
        consensus: &HashMap<(String, SignalAction), u32>,
        open_positions: &[Position],
    ) -> anyhow::Result<Option<Position>> {
        let candles = self.broker.get_ohlcv(&signal.symbol, "1h", 60).await.ok();
        let regime = candles.as_deref().and_then(|c| regime::detect_regime(c, regime::DEFAULT_LOOKBACK));
        let realized_volatility_24h = candles
            .as_deref()
            .map(|c| regime::realized_volatility(c, VOLATILITY_LOOKBACK_CANDLES))
            .unwrap_or(0.0);

        let accuracy = self.store.accuracy_stats(self.user.id, &signal.symbol, &signal.source).await.ok();
        let consensus_count = consensus.get(&(signal.symbol.clone(), signal.action)).copied().unwrap_or(1).saturating_sub(1);

        let ctx = ValidationContext {
            min_confidence: self.config.min_confidence,
            volatility_capped_confidence: self.config.volatility_capped_confidence,
            volatility_cap_threshold: self.config.volatility_cap_threshold,
            realized_volatility_24h,
            accuracy,
            consensus_count,
            regime,
        };
        let result = validator::validate(signal, &ctx);
        if !result.accept {
            debug!(symbol = %signal.symbol, reasons = ?result.reasons, "signal rejected by validator");
            return Ok(None);
        }

        let entry_price = self.broker.get_market_price(&signal.symbol).await?;
        if entry_price <= 0.0 {
            return Ok(None);
        }

        let balance = self.broker.get_balance().await?;
        let kelly_stats = self.store.kelly_stats(self.user.id, &signal.symbol).await.ok();
        let sizing_input = risk::SizingInput {
            balance: balance.free,
            risk_per_trade_pct: settings.risk_per_trade_pct,
            stop_loss_pct: settings.stop_loss_pct,
            max_position_usd: settings.max_position_usd,
            confidence: result.score,
            candles: candles.as_deref().unwrap_or(&[]),
            kelly_stats,
        };
        let mut proposed_usd_size = risk::size_position(&sizing_input);
        if proposed_usd_size <= 0.0 {
            return Ok(None);
        }

        if self.monitor.sizing_budget.take(self.user.id) {
            proposed_usd_size *= 0.5;
            info!(symbol = %signal.symbol, "sizing budget halved following a recent margin warning");
        }

        let exposures: Vec<OpenExposure> = open_positions
            .iter()
            .map(|p| OpenExposure { symbol: p.symbol.clone(), notional_usd: p.quantity * p.entry_price })
            .collect();
        let portfolio_input = portfolio::PortfolioCheckInput {
            symbol: &signal.symbol,
            proposed_usd_size,
            equity: balance.free,
            stablecoin_balance_usd: balance.free,
            open_positions: &exposures,
        };
        let decision = portfolio::check(&portfolio_input);
        if !decision.execute {
            debug!(symbol = %signal.symbol, reasons = ?decision.reasons, "signal rejected by portfolio manager");
            return Ok(None);
        }
        proposed_usd_size *= decision.size_multiplier;

        let quantity = proposed_usd_size / entry_price;
        if quantity <= 0.0 {
            return Ok(None);
        }

        let computed_sl_tp = candles
            .as_deref()
            .zip(regime)
            .and_then(|(c, r)| risk::dynamic_stop_loss_take_profit(c, entry_price, side, r, settings.stop_loss_pct));
        let (stop_loss, take_profit) = computed_sl_tp.unwrap_or_else(|| match side {
            Side::Long => (entry_price * (1.0 - settings.stop_loss_pct), entry_price * (1.0 + settings.take_profit_pct)),
            Side::Short => (entry_price * (1.0 + settings.stop_loss_pct), entry_price * (1.0 - settings.take_profit_pct)),
        });
        let (stop_loss, take_profit) =
            risk::tighten_with_signal((stop_loss, take_profit), signal.stop_loss, signal.take_profit, entry_price, side);

        if !self.user.trading_mode.is_spot() {
            self.broker.set_leverage(&signal.symbol, settings.leverage).await.ok();
        }

        let request = PlaceOrderRequest {
            symbol: signal.symbol.clone(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            leverage: (!self.user.trading_mode.is_spot()).then_some(settings.leverage),
            reduce_only: false,
        };
        let result = self.broker.place_order(request).await?;

        let position = Position::new(
            self.user.id,
            signal.symbol.clone(),
            side,
            result.order.quantity,
            entry_price,
            stop_loss,
            take_profit,
            settings.leverage,
            self.user.trading_mode,
            Utc::now(),
        );
        self.store.upsert_position(&position).await?;
        Ok(Some(position))
    }
}

/// Resolves the set of users the supervisor should run an `AutoTrader` for.
/// Kept as a trait so `main` can swap in per-deployment wiring (a static
/// list, a config file, a users table) without `AutoTrader` itself knowing
/// about process topology.
pub trait UserRegistry: Send + Sync {
    fn users(&self) -> Vec<User>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSink;
    use crate::broker::{Balance, ExchangePosition, MarginSnapshot, Order, PlaceOrderResult};
    use crate::calendar::NoOpCalendar;
    use crate::config::HighImpactEvent;
    use crate::error::BrokerError;
    use crate::models::Signal;
    use crate::monitor::StaticBrokerRegistry;
    use crate::store::memory::InMemoryStore;
    use crate::types::TradingMode;
    use async_trait::async_trait;
    use parking_lot::RwLock as PLRwLock;

    struct FakeAlerts;
    #[async_trait]
    impl AlertSink for FakeAlerts {
        async fn emit(&self, _s: crate::types::AlertSeverity, _m: &str, _c: &serde_json::Value) {}
    }

    struct FakeBroker {
        price: f64,
        placed: PLRwLock<Vec<PlaceOrderRequest>>,
    }

    #[async_trait]
    impl Broker for FakeBroker {
        fn trading_mode(&self) -> TradingMode {
            TradingMode::Futures
        }
        async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResult, BrokerError> {
            let order = Order { id: "1".into(), symbol: req.symbol.clone(), side: req.side, quantity: req.quantity, price: self.price, reduce_only: req.reduce_only };
            self.placed.write().push(req);
            Ok(PlaceOrderResult { order, sl_tp_exchange_side: true })
        }
        async fn close_position(&self, _symbol: &str, _side: Side, _quantity: f64) -> Result<Order, BrokerError> {
            unimplemented!()
        }
        async fn partial_close(&self, _symbol: &str, _side: Side, _qty: f64, _remaining: f64) -> Result<Order, BrokerError> {
            unimplemented!()
        }
        async fn get_positions(&self) -> Result<Vec<ExchangePosition>, BrokerError> {
            Ok(Vec::new())
        }
        async fn get_balance(&self) -> Result<Balance, BrokerError> {
            Ok(Balance { free: 10_000.0 })
        }
        async fn get_margin_snapshot(&self) -> Result<Option<MarginSnapshot>, BrokerError> {
            Ok(None)
        }
        async fn get_market_price(&self, _symbol: &str) -> Result<f64, BrokerError> {
            Ok(self.price)
        }
        async fn get_ohlcv(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> Result<Vec<Candle>, BrokerError> {
            Ok((0..60)
                .map(|i| Candle::new(i, 100.0, 101.0, 99.0, 100.0 + (i as f64 * 0.01), 10.0, i + 1))
                .collect())
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: f64) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn test_user(trading_mode: TradingMode) -> User {
        User { id: Uuid::new_v4(), exchange: "binance".into(), trading_mode, settings: TradingSettings::defaults_for_mode(trading_mode) }
    }

    fn setup(user: User, price: f64) -> (Arc<AutoTrader>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker { price, placed: PLRwLock::new(Vec::new()) });
        let mut brokers = HashMap::new();
        brokers.insert(user.id, broker.clone());
        let registry = Arc::new(StaticBrokerRegistry::new(brokers));
        let alerts = Arc::new(FakeAlerts);
        let (monitor, tx) = PositionMonitor::new(store.clone(), registry, alerts, Config::default());
        let calendar = Arc::new(NoOpCalendar);
        let trader = Arc::new(AutoTrader::new(user, broker, store.clone(), calendar, Config::default(), monitor, tx));
        (trader, store)
    }

    fn fresh_signal(symbol: &str, action: SignalAction, confidence: f64) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action,
            confidence,
            source: "titan_v3".to_string(),
            reasoning: None,
            user_id: None,
            stop_loss: None,
            take_profit: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn opens_position_from_high_confidence_signal() {
        let user = test_user(TradingMode::Futures);
        let (trader, store) = setup(user, 100.0);
        store.seed_signal(fresh_signal("BTC/USDT", SignalAction::Buy, 0.9));

        trader.run_cycle().await.unwrap();

        let open = store.load_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Long);
    }

    #[tokio::test]
    async fn low_confidence_signal_is_skipped() {
        let user = test_user(TradingMode::Futures);
        let (trader, store) = setup(user, 100.0);
        store.seed_signal(fresh_signal("BTC/USDT", SignalAction::Buy, 0.1));

        trader.run_cycle().await.unwrap();

        assert!(store.load_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spot_account_rejects_short_signal() {
        let user = test_user(TradingMode::Spot);
        let (trader, store) = setup(user, 100.0);
        store.seed_signal(fresh_signal("BTC/USDT", SignalAction::Sell, 0.9));

        trader.run_cycle().await.unwrap();

        assert!(store.load_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn calendar_gate_blocks_cycle() {
        struct GatedCalendar;
        #[async_trait]
        impl EconomicCalendar for GatedCalendar {
            async fn get_upcoming_high_impact_event(&self, _within_minutes: i64) -> anyhow::Result<Option<HighImpactEvent>> {
                Ok(Some(HighImpactEvent { name: "CPI".into(), minutes_until: 5 }))
            }
        }

        let user = test_user(TradingMode::Futures);
        let (trader_base, store) = setup(user, 100.0);
        // Swap in a gated calendar by reconstructing around the same store/broker.
        let trader = Arc::new(AutoTrader {
            user: trader_base.user.clone(),
            broker: trader_base.broker.clone(),
            store: trader_base.store.clone(),
            calendar: Arc::new(GatedCalendar),
            config: trader_base.config.clone(),
            monitor: trader_base.monitor.clone(),
            monitor_tx: trader_base.monitor_tx.clone(),
        });
        store.seed_signal(fresh_signal("BTC/USDT", SignalAction::Buy, 0.9));

        trader.run_cycle().await.unwrap();

        assert!(store.load_open_positions().await.unwrap().is_empty());
    }
}
