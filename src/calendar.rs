// =============================================================================
// Economic calendar collaborator (§6 "Economic calendar collaborator")
// =============================================================================
//
// Single query: the next upcoming high-impact macro event, if any, and how
// many minutes until it fires. `config::event_gates_trading` turns that
// answer into the ±30min/60min gating decision consumed by the Auto-Trader's
// pre-flight check (§4.6 step 1).
// =============================================================================

use async_trait::async_trait;

use crate::config::HighImpactEvent;

#[async_trait]
pub trait EconomicCalendar: Send + Sync {
    /// The next HIGH-impact event within `within_minutes`, or `None` if
    /// there isn't one. `within_minutes` should be generous enough to cover
    /// both the before- and after-event gating windows.
    async fn get_upcoming_high_impact_event(&self, within_minutes: i64) -> anyhow::Result<Option<HighImpactEvent>>;
}

/// A calendar with no events — the default when no calendar feed is wired
/// up. Trading is never gated.
pub struct NoOpCalendar;

#[async_trait]
impl EconomicCalendar for NoOpCalendar {
    async fn get_upcoming_high_impact_event(&self, _within_minutes: i64) -> anyhow::Result<Option<HighImpactEvent>> {
        Ok(None)
    }
}
