// =============================================================================
// Process supervisor (§6 "The core has no CLI of its own; it is started by
// an external supervisor that passes user lists and configuration at boot").
// =============================================================================
//
// This module is the thin boot-time wiring the spec treats as external: it
// reads a flat JSON file of registered users (id, exchange, trading mode,
// venue credentials, per-user settings) and turns each one into a `User`
// plus a concrete `Broker`. The web layer that would normally own user
// registration is out of scope (§1) — `main` stands in for it with the
// simplest possible file-backed registry.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::autotrader::UserRegistry;
use crate::broker::binance::BinanceBroker;
use crate::broker::Broker;
use crate::models::{TradingSettings, User};
use crate::types::TradingMode;

/// One row of the boot-time user file. Credential storage and encryption
/// are out of scope (§1); this is the minimal shape the core needs to
/// construct a `User` and a live `Broker` for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBootConfig {
    pub id: Uuid,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    pub trading_mode: TradingMode,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub settings: Option<TradingSettings>,
}

fn default_exchange() -> String {
    "binance".to_string()
}

/// Loads the user list from a JSON file. Missing file is treated as "no
/// users" rather than an error, so a fresh deployment can boot with an
/// empty roster and have users added without a restart-breaking change.
pub fn load_users_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<UserBootConfig>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let users: Vec<UserBootConfig> = serde_json::from_str(&raw)?;
    Ok(users)
}

/// A fixed, boot-time-loaded roster — the supervisor's `UserRegistry`
/// implementation (§4.6 `AutoTrader` is constructed once per returned user).
pub struct StaticUserRegistry {
    users: Vec<User>,
}

impl StaticUserRegistry {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }
}

impl UserRegistry for StaticUserRegistry {
    fn users(&self) -> Vec<User> {
        self.users.clone()
    }
}

/// Turns the raw boot file into `(User, Broker)` pairs. Each user gets its
/// own `Broker` instance, serialized internally to respect per-key rate
/// limits (§5 "Broker client per user") — never a shared client across users.
pub fn build_users_and_brokers(
    rows: Vec<UserBootConfig>,
) -> (Vec<User>, HashMap<Uuid, Arc<dyn Broker>>) {
    let mut users = Vec::with_capacity(rows.len());
    let mut brokers = HashMap::with_capacity(rows.len());

    for row in rows {
        let settings = row
            .settings
            .unwrap_or_else(|| TradingSettings::defaults_for_mode(row.trading_mode))
            .normalized_for_mode(row.trading_mode);

        let user = User {
            id: row.id,
            exchange: row.exchange,
            trading_mode: row.trading_mode,
            settings,
        };

        let broker: Arc<dyn Broker> =
            Arc::new(BinanceBroker::new(row.api_key, row.api_secret, row.trading_mode));

        brokers.insert(user.id, broker);
        users.push(user);
    }

    (users, brokers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_users_file_yields_empty_roster() {
        let rows = load_users_file("/nonexistent/path/users.json").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn boot_rows_produce_matching_user_and_broker_counts() {
        let rows = vec![UserBootConfig {
            id: Uuid::new_v4(),
            exchange: "binance".into(),
            trading_mode: TradingMode::Spot,
            api_key: "k".into(),
            api_secret: "s".into(),
            settings: None,
        }];
        let (users, brokers) = build_users_and_brokers(rows);
        assert_eq!(users.len(), 1);
        assert_eq!(brokers.len(), 1);
        assert_eq!(users[0].settings.leverage, 1.0);
    }
}
