// =============================================================================
// Binance REST adapter
// =============================================================================
//
// Adapts the signed Binance REST API behind `ExchangePort`. HMAC signing,
// recv-window handling, and response parsing all funnel into
// `ExchangeError::{Transient,Permanent}` instead of a bare `anyhow::Error`,
// so the `Guarded` wrapper can apply retry/circuit-breaking uniformly.
//
// SECURITY: the secret key is never logged or serialized.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use super::{ExchangeError, ExchangePort};
use crate::types::{Bar, Fill, OrderIntent, Side, Timeframe};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

/// Binance REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceExchange {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceExchange {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://api.binance.com".to_string())
    }

    pub fn testnet(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://testnet.binance.vision".to_string())
    }

    fn with_base_url(api_key: impl Into<String>, secret: impl Into<String>, base_url: String) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BinanceExchange initialised");

        Self { api_key, secret, base_url, client }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
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

    /// Classify an HTTP status into the two error classes the Exchange Port
    /// contract switches on.
    fn classify_status(status: StatusCode, body: &serde_json::Value) -> ExchangeError {
        if status.as_u16() == 429 || status.is_server_error() {
            ExchangeError::Transient {
                message: format!("Binance returned {status}: {body}"),
            }
        } else {
            ExchangeError::Permanent {
                message: format!("Binance returned {status}: {body}"),
            }
        }
    }

    fn network_error(context: &str, err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() || err.is_connect() {
            ExchangeError::Transient { message: format!("{context}: {err}") }
        } else {
            ExchangeError::Permanent { message: format!("{context}: {err}") }
        }
    }

    /// Derive `newClientOrderId` from the intent's own fields rather than
    /// minting a fresh random one, so a retry of the same intent (the retry
    /// policy calls this on every transient-error attempt) carries the same
    /// key and the venue can dedupe a lost-but-actually-filled order instead
    /// of executing it twice.
    fn client_order_id(intent: &OrderIntent) -> String {
        let mut hasher = Sha256::new();
        hasher.update(intent.symbol.as_bytes());
        hasher.update([match intent.side {
            Side::Buy => 0u8,
            Side::Sell => 1u8,
        }]);
        hasher.update(intent.quantity.to_bits().to_le_bytes());
        hasher.update([intent.reason as u8]);
        hasher.update(intent.reference_price.to_bits().to_le_bytes());
        format!("aurora-{}", hex::encode(&hasher.finalize()[..16]))
    }

    fn parse_str_f64(val: &serde_json::Value) -> Result<f64, ExchangeError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().map_err(|e| ExchangeError::Permanent {
                message: format!("failed to parse '{s}' as f64: {e}"),
            })
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(ExchangeError::Permanent {
                message: format!("expected string or number, got: {val}"),
            })
        }
    }

    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::network_error("GET /api/v3/account", e))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Permanent {
            message: format!("failed to parse account response: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let balances = body["balances"].as_array().ok_or_else(|| ExchangeError::Permanent {
            message: "account response missing 'balances' array".to_string(),
        })?;

        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }
}

#[async_trait]
impl ExchangePort for BinanceExchange {
    #[instrument(skip(self), name = "binance::fetch_bars")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::network_error("GET /api/v3/klines", e))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Permanent {
            message: format!("failed to parse klines response: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let raw = body.as_array().ok_or_else(|| ExchangeError::Permanent {
            message: "klines response is not an array".to_string(),
        })?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().ok_or_else(|| ExchangeError::Permanent {
                message: "kline entry is not an array".to_string(),
            })?;
            if arr.len() < 6 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let open_time_ms = arr[0].as_i64().unwrap_or(0);
            let timestamp = chrono::DateTime::from_timestamp_millis(open_time_ms)
                .unwrap_or_else(chrono::Utc::now);
            bars.push(Bar {
                timestamp,
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
            });
        }

        debug!(symbol, timeframe = %timeframe, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    #[instrument(skip(self, intent), name = "binance::submit_market_order")]
    async fn submit_market_order(&self, intent: &OrderIntent) -> Result<Fill, ExchangeError> {
        let side_str = match intent.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let client_order_id = Self::client_order_id(intent);
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&newClientOrderId={}",
            intent.symbol, side_str, intent.quantity, client_order_id
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol = %intent.symbol, side = side_str, quantity = intent.quantity, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::network_error("POST /api/v3/order", e))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Permanent {
            message: format!("failed to parse order response: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let average_price = body["fills"]
            .as_array()
            .filter(|fills| !fills.is_empty())
            .map(|fills| {
                let (notional, qty) = fills.iter().fold((0.0, 0.0), |(n, q), f| {
                    let p: f64 = f["price"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                    let quantity: f64 = f["qty"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                    (n + p * quantity, q + quantity)
                });
                if qty > 0.0 { notional / qty } else { intent.reference_price }
            })
            .unwrap_or(intent.reference_price);

        let filled_quantity: f64 = body["executedQty"]
            .as_str()
            .unwrap_or("0")
            .parse()
            .unwrap_or(intent.quantity);

        Ok(Fill {
            order_id: body["orderId"].as_u64().map(|v| v.to_string()).unwrap_or(client_order_id),
            symbol: intent.symbol.clone(),
            side: intent.side,
            filled_quantity,
            average_price,
            timestamp: chrono::Utc::now(),
            fees: 0.0,
        })
    }

    #[instrument(skip(self), name = "binance::current_price")]
    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::network_error("GET /api/v3/ticker/price", e))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Permanent {
            message: format!("failed to parse ticker response: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        Self::parse_str_f64(&body["price"])
    }
}

impl std::fmt::Debug for BinanceExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceExchange")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_impl_redacts_credentials() {
        let client = BinanceExchange::new("my-api-key", "my-secret");
        let debug_str = format!("{:?}", client);
        assert!(!debug_str.contains("my-api-key"));
        assert!(!debug_str.contains("my-secret"));
    }

    #[test]
    fn sign_is_deterministic_for_same_secret_and_query() {
        let client = BinanceExchange::new("key", "secret");
        let a = client.sign("foo=bar");
        let b = client.sign("foo=bar");
        assert_eq!(a, b);
    }

    #[test]
    fn classify_status_marks_server_errors_transient() {
        let err = BinanceExchange::classify_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            &serde_json::json!({}),
        );
        assert!(err.is_transient());
    }

    #[test]
    fn classify_status_marks_client_errors_permanent() {
        let err = BinanceExchange::classify_status(StatusCode::UNAUTHORIZED, &serde_json::json!({}));
        assert!(!err.is_transient());
    }

    #[test]
    fn classify_status_marks_rate_limit_transient() {
        let err = BinanceExchange::classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &serde_json::json!({}),
        );
        assert!(err.is_transient());
    }

    #[test]
    fn client_order_id_is_stable_across_retries_of_the_same_intent() {
        let intent = OrderIntent {
            symbol: "XRPUSDT".to_string(),
            side: Side::Sell,
            quantity: 42.0,
            reason: crate::types::OrderReason::StopLoss,
            reference_price: 1.23,
        };
        let a = BinanceExchange::client_order_id(&intent);
        let b = BinanceExchange::client_order_id(&intent);
        assert_eq!(a, b, "the same intent must produce the same client order id on retry");
    }

    #[test]
    fn client_order_id_differs_for_a_different_intent() {
        let base = OrderIntent {
            symbol: "XRPUSDT".to_string(),
            side: Side::Sell,
            quantity: 42.0,
            reason: crate::types::OrderReason::StopLoss,
            reference_price: 1.23,
        };
        let other = OrderIntent { quantity: 43.0, ..base.clone() };
        assert_ne!(BinanceExchange::client_order_id(&base), BinanceExchange::client_order_id(&other));
    }
}
