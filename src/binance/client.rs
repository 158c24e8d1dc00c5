// =============================================================================
// Binance REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Mode-aware: `spot` targets the classic `/api/v3` surface; `margin` and
// `futures` target the USD-M futures surface (`/fapi/v1`, `/fapi/v2`), which
// is where Binance exposes `reduceOnly` and per-symbol leverage. This keeps
// the exchange-protocol detail — genuinely out of scope per the core spec —
// confined to a single adapter behind the `Broker` trait (`crate::broker`).
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::candles::Candle;
use crate::types::TradingMode;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance REST API client with HMAC-SHA256 request signing. One instance
/// is constructed per `(user, trading_mode)` pair by the broker adapter.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    mode: TradingMode,
    client: reqwest::Client,
}

impl BinanceClient {
    /// Create a new `BinanceClient` targeting the REST surface for `mode`.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, mode: TradingMode) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = match mode {
            TradingMode::Spot => "https://api.binance.com".to_string(),
            TradingMode::Margin | TradingMode::Futures => "https://fapi.binance.com".to_string(),
        };

        debug!(base_url = %base_url, mode = %mode, "BinanceClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            mode,
            client,
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn order_path(&self) -> &'static str {
        match self.mode {
            TradingMode::Spot => "/api/v3/order",
            TradingMode::Margin | TradingMode::Futures => "/fapi/v1/order",
        }
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "binance::get_account")]
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        let path = match self.mode {
            TradingMode::Spot => "/api/v3/account",
            TradingMode::Margin | TradingMode::Futures => "/fapi/v2/account",
        };
        let qs = self.signed_query("");
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {} returned {}: {}", path, status, body);
        }

        debug!("account info retrieved successfully");
        Ok(body)
    }

    /// Free balance for `asset`, spot and futures shapes normalised to one
    /// call site.
    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> Result<f64> {
        let account = self.get_account().await?;

        let balances = match self.mode {
            TradingMode::Spot => account["balances"]
                .as_array()
                .context("account response missing 'balances' array")?
                .clone(),
            TradingMode::Margin | TradingMode::Futures => account["assets"]
                .as_array()
                .context("account response missing 'assets' array")?
                .clone(),
        };

        let free_key = match self.mode {
            TradingMode::Spot => "free",
            TradingMode::Margin | TradingMode::Futures => "availableBalance",
        };

        for b in &balances {
            if b["asset"].as_str() == Some(asset) {
                let free: f64 = b[free_key].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    /// Equity and used-margin, for the liquidation-protection check (§4.7
    /// step 7). Spot has no margin concept, so callers never invoke this in
    /// spot mode.
    #[instrument(skip(self), name = "binance::get_margin_snapshot")]
    pub async fn get_margin_snapshot(&self) -> Result<(f64, f64)> {
        let account = self.get_account().await?;
        let equity: f64 = account["totalMarginBalance"]
            .as_str()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);
        let used_margin: f64 = account["totalPositionInitialMargin"]
            .as_str()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);
        Ok((equity, used_margin))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit a new order. `reduce_only` and `leverage_hint` are only ever
    /// sent for non-spot modes — the caller (broker adapter) is responsible
    /// for the spot silent-drop rule (§4.1); this client sends what it's
    /// told, scoped by `self.mode`.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, price, time_in_force, client_order_id), name = "binance::place_order")]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
        client_order_id: Option<&str>,
        reduce_only: bool,
    ) -> Result<serde_json::Value> {
        let mut params = format!("symbol={symbol}&side={side}&type={order_type}&quantity={quantity}");

        if let Some(p) = price {
            params.push_str(&format!("&price={p}"));
        }
        if let Some(tif) = time_in_force {
            params.push_str(&format!("&timeInForce={tif}"));
        }
        if let Some(coid) = client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }
        if reduce_only && !matches!(self.mode, TradingMode::Spot) {
            params.push_str("&reduceOnly=true");
        }

        let qs = self.signed_query(&params);
        let url = format!("{}{}?{}", self.base_url, self.order_path(), qs);

        debug!(symbol, side, order_type, quantity, reduce_only, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("Binance POST order returned {}: {}", status, body);
        }

        debug!(symbol, side, "order placed successfully");
        Ok(body)
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<serde_json::Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}{}?{}", self.base_url, self.order_path(), qs);

        debug!(symbol, order_id, "cancelling order");

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse cancel response")?;

        if !status.is_success() {
            anyhow::bail!("Binance DELETE order returned {}: {}", status, body);
        }

        debug!(symbol, order_id, "order cancelled");
        Ok(body)
    }

    /// Open positions, futures/margin only — spot has no "position" concept
    /// beyond raw balances, so the broker adapter never calls this in spot
    /// mode.
    #[instrument(skip(self), name = "binance::get_position_risk")]
    pub async fn get_position_risk(&self) -> Result<Vec<serde_json::Value>> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET positionRisk request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse positionRisk response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET positionRisk returned {}: {}", status, body);
        }

        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// Set per-symbol leverage, futures/margin only (§4.1 `set_leverage`).
    #[instrument(skip(self), name = "binance::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST leverage request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            anyhow::bail!("Binance POST leverage returned {}: {}", status, body);
        }
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// `fetch_ohlcv(timeframe, limit)` (§6): GET klines, public endpoint.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let path = match self.mode {
            TradingMode::Spot => "/api/v3/klines",
            TradingMode::Margin | TradingMode::Futures => "/fapi/v1/klines",
        };
        let url = format!(
            "{}{}?symbol={}&interval={}&limit={}",
            self.base_url, path, symbol, interval, limit
        );

        let resp = self.client.get(&url).send().await.context("GET klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = Self::parse_str_f64(&arr[1])?;
            let high = Self::parse_str_f64(&arr[2])?;
            let low = Self::parse_str_f64(&arr[3])?;
            let close = Self::parse_str_f64(&arr[4])?;
            let volume = Self::parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Latest traded price — used both as a fallback mid-price and to seed
    /// the broker adapter's price cache.
    #[instrument(skip(self), name = "binance::get_price")]
    pub async fn get_price(&self, symbol: &str) -> Result<f64> {
        let path = match self.mode {
            TradingMode::Spot => "/api/v3/ticker/price",
            TradingMode::Margin | TradingMode::Futures => "/fapi/v1/ticker/price",
        };
        let url = format!("{}{}?symbol={}", self.base_url, path, symbol);

        let resp = self.client.get(&url).send().await.context("GET ticker/price request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse ticker response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET ticker/price returned {}: {}", status, body);
        }
        Self::parse_str_f64(&body["price"])
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("mode", &self.mode)
            .finish()
    }
}
