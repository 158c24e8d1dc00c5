// =============================================================================
// Signal Store Reader (§4.2)
// =============================================================================
//
// `Store::fetch_fresh_signals` already applies the query contract (whitelist,
// 6h freshness, BUY/SELL only, user-or-global). This module adds the
// dedup pass the store itself has no reason to know about: within the same
// fetch, two signals are duplicates iff `(resolved_user, symbol, action)`
// match, and only the newest of each group survives.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::Signal;
use crate::store::Store;

/// Fetch and deduplicate fresh signals for `user_id` (§4.2). The store's
/// query already returns newest-first, so the first signal seen per dedup
/// key is kept and the rest dropped.
pub async fn fresh_deduplicated_signals(
    store: &dyn Store,
    user_id: Uuid,
    whitelist: &[String],
    freshness_hours: i64,
) -> anyhow::Result<Vec<Signal>> {
    let since = Utc::now() - chrono::Duration::hours(freshness_hours);
    let rows = store.fetch_fresh_signals(user_id, whitelist, since).await?;
    Ok(dedup(rows, user_id))
}

fn dedup(rows: Vec<Signal>, user_id: Uuid) -> Vec<Signal> {
    let mut seen: HashMap<(Uuid, String, crate::types::SignalAction), ()> = HashMap::new();
    let mut out = Vec::with_capacity(rows.len());
    for signal in rows {
        let key = signal.dedup_key(signal.user_id.unwrap_or(user_id));
        if seen.contains_key(&key) {
            continue;
        }
        seen.insert(key, ());
        out.push(signal);
    }
    out
}

/// Whether `a` and `b` are duplicates under the 6h sliding-window rule
/// (§4.2): same resolved user/symbol/action and no more than `window_hours`
/// apart. Exposed for tests and for the consensus step in the validator,
/// which needs the same key without necessarily fetching through a `Store`.
pub fn are_duplicates(a: &Signal, b: &Signal, resolved_user: Uuid, window_hours: i64) -> bool {
    if a.dedup_key(resolved_user) != b.dedup_key(resolved_user) {
        return false;
    }
    let delta = (a.created_at - b.created_at).num_seconds().abs();
    delta <= window_hours * 3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalAction;

    fn signal(symbol: &str, action: SignalAction, created_at: DateTime<Utc>) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action,
            confidence: 0.8,
            source: "titan_v3".to_string(),
            reasoning: None,
            user_id: None,
            stop_loss: None,
            take_profit: None,
            expires_at: None,
            created_at,
        }
    }

    #[test]
    fn dedup_keeps_only_newest_of_each_key() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let newer = signal("BTC/USDT", SignalAction::Buy, now);
        let older = signal("BTC/USDT", SignalAction::Buy, now - chrono::Duration::hours(1));
        let different_symbol = signal("ETH/USDT", SignalAction::Buy, now);

        let rows = vec![newer.clone(), older, different_symbol.clone()];
        let out = dedup(rows, user);

        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|s| s.id == newer.id));
        assert!(out.iter().any(|s| s.id == different_symbol.id));
    }

    #[test]
    fn duplicates_require_same_window() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let a = signal("BTC/USDT", SignalAction::Buy, now);
        let b = signal("BTC/USDT", SignalAction::Buy, now - chrono::Duration::hours(7));
        assert!(!are_duplicates(&a, &b, user, 6));
    }
}
