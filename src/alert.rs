// =============================================================================
// Alerting sink (§6 "Alerting sink", produced)
// =============================================================================
//
// A fire-and-forget interface used for liquidation warnings and critical
// close events (§4.7 step 7). The default implementation logs through
// `tracing`; a real deployment would swap in an email/Slack/webhook sink
// behind the same trait without touching the Monitor.
// =============================================================================

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::types::AlertSeverity;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, severity: AlertSeverity, message: &str, context: &serde_json::Value);
}

/// Logs every alert via `tracing` at a level matching its severity. This is
/// the alerting transport itself is out of scope (§1); the trait boundary is
/// what matters.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, severity: AlertSeverity, message: &str, context: &serde_json::Value) {
        match severity {
            AlertSeverity::Info => info!(%severity, context = %context, "{message}"),
            AlertSeverity::Warning => warn!(%severity, context = %context, "{message}"),
            AlertSeverity::Critical => error!(%severity, context = %context, "{message}"),
        }
    }
}
