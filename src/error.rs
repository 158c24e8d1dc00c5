// =============================================================================
// Error taxonomy for the trading core
// =============================================================================
//
// Broker-facing errors are typed so that callers can branch on the semantic
// category (§7) instead of string-matching. Everything else (config loading,
// store plumbing, process wiring) uses `anyhow` for ad-hoc context, matching
// the reference engine's split between `BinanceClient` (anyhow) and a small
// number of precise failure types the business logic actually branches on.
// =============================================================================

use thiserror::Error;

/// Errors returned by a `Broker` implementation (§4.1, §7).
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The venue explicitly rejected the order for lack of funds.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Margin-mode specific: available margin too low to support the order.
    #[error("margin too low: {0}")]
    MarginTooLow(String),

    /// Venue is rate-limiting us; caller may retry after backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The requested capability is not supported on this venue/mode
    /// (e.g. reduce-only on spot — though the spot case is silently
    /// dropped rather than raised, see §4.1).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Any other transient failure (timeout, 5xx, connection reset) that
    /// has already exhausted its retry budget inside the adapter.
    #[error("transient venue error: {0}")]
    Transient(String),
}

impl BrokerError {
    /// Whether this category is worth retrying again by the *caller*
    /// (the adapter itself already retries transient/rate-limited errors
    /// internally up to 3 times before surfacing them — see §4.1).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}
