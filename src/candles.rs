// =============================================================================
// OHLCV candle — the shared unit consumed by indicators, regime detection,
// and the broker's `get_ohlcv` call.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV bar. `open_time`/`close_time` are exchange timestamps in
/// milliseconds since epoch (opaque to the core — only used for ordering).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}
