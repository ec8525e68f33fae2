// =============================================================================
// Binance Spot REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Error replies (`{"code": -2010, "msg": "..."}`) are mapped onto the typed
// `ExchangeError` kinds so the retry policy and the order helpers can tell
// transient failures from fatal ones.
// =============================================================================

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::rate_limit::WeightTracker;
use crate::exchange::{Exchange, ExchangeError, ExchangeResult};
use crate::types::{
    BalanceEntry, Balances, Order, OrderStatus, OrderType, Side, Symbol, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Prefix for client order ids so our orders are recognisable on the venue.
const CLIENT_ORDER_PREFIX: &str = "pump";

/// Trading rules for one market, from exchangeInfo.
#[derive(Debug, Clone)]
struct MarketInfo {
    symbol: Symbol,
    tick_size: f64,
}

/// Binance REST API client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    weight: WeightTracker,
    /// Market id (`TRXETH`) → market info, filled by `load_markets`.
    markets: RwLock<HashMap<String, MarketInfo>>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key`  — Binance API key (sent as a header, never in query params).
    /// * `secret`   — Binance secret key used exclusively for HMAC signing.
    /// * `base_url` — REST root, e.g. `https://api.binance.com`.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if !api_key.is_empty() {
            let val = HeaderValue::from_str(&api_key).context("API key is not a valid header value")?;
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            client,
            weight: WeightTracker::new(),
            markets: RwLock::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Append timestamp, recvWindow and signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = chrono::Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> ExchangeResult<Value> {
        self.weight.check(weight)?;

        let qs = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self.client.request(method.clone(), &url).send().await?;
        self.weight.update_from_headers(resp.headers());

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            // Gateways answer 5xx with HTML; keep a snippet as the message.
            let body = serde_json::from_str(&text).unwrap_or_else(|_| {
                serde_json::json!({ "msg": text.trim().chars().take(200).collect::<String>() })
            });
            let err = map_api_error(status.as_u16(), &body);
            warn!(%method, path, status = status.as_u16(), error = %err, "Binance request rejected");
            return Err(err);
        }

        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Decode(format!("{method} {path}: {e}")))
    }

    fn market(&self, symbol: &Symbol) -> Option<MarketInfo> {
        self.markets.read().get(&symbol.market_id()).cloned()
    }

    async fn ensure_markets(&self) -> ExchangeResult<()> {
        if self.markets.read().is_empty() {
            self.load_markets().await?;
        }
        Ok(())
    }

    #[instrument(skip(self, symbol), fields(symbol = %symbol), name = "binance::place_order")]
    async fn place_order(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> ExchangeResult<Order> {
        if !(quantity > 0.0) {
            return Err(ExchangeError::InvalidArgument(format!(
                "quantity must be positive, got {quantity}"
            )));
        }

        let client_order_id = format!("{CLIENT_ORDER_PREFIX}{}", Uuid::new_v4().simple());
        let mut params = format!(
            "symbol={}&side={side}&type={order_type}&quantity={}&newClientOrderId={}&newOrderRespType=FULL",
            symbol.market_id(),
            format_decimal(quantity, 1.0),
            client_order_id,
        );

        if let Some(p) = price {
            let tick = self.market(symbol).map(|m| m.tick_size).unwrap_or(0.0);
            params.push_str(&format!("&price={}&timeInForce=GTC", format_decimal(p, tick)));
        }

        debug!(symbol = %symbol, %side, %order_type, quantity, ?price, "placing order");
        let body = self.request(Method::POST, "/api/v3/order", &params, true, 1).await?;
        let order = parse_order(&body, symbol)?;
        debug!(symbol = %symbol, id = %order.id, status = ?order.status, "order placed");
        Ok(order)
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    /// GET /api/v3/exchangeInfo (public).
    #[instrument(skip(self), name = "binance::load_markets")]
    async fn load_markets(&self) -> ExchangeResult<Vec<Symbol>> {
        let body = self.request(Method::GET, "/api/v3/exchangeInfo", "", false, 20).await?;
        let entries = body["symbols"]
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("exchangeInfo missing 'symbols'".into()))?;

        let mut markets = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry["status"].as_str() != Some("TRADING") {
                continue;
            }
            let (Some(id), Some(base), Some(quote)) = (
                entry["symbol"].as_str(),
                entry["baseAsset"].as_str(),
                entry["quoteAsset"].as_str(),
            ) else {
                continue;
            };
            let tick_size = entry["filters"]
                .as_array()
                .and_then(|filters| {
                    filters
                        .iter()
                        .find(|f| f["filterType"].as_str() == Some("PRICE_FILTER"))
                })
                .and_then(|f| parse_num(&f["tickSize"]).ok())
                .unwrap_or(0.0);
            markets.insert(
                id.to_string(),
                MarketInfo {
                    symbol: Symbol::new(base, quote),
                    tick_size,
                },
            );
        }

        let mut symbols: Vec<Symbol> = markets.values().map(|m| m.symbol.clone()).collect();
        symbols.sort();
        debug!(count = symbols.len(), "markets loaded");
        *self.markets.write() = markets;
        Ok(symbols)
    }

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "binance::fetch_balance")]
    async fn fetch_balance(&self) -> ExchangeResult<Balances> {
        let body = self.request(Method::GET, "/api/v3/account", "", true, 20).await?;
        let entries = body["balances"]
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("account response missing 'balances'".into()))?;

        let mut balances = HashMap::with_capacity(entries.len());
        for b in entries {
            let Some(asset) = b["asset"].as_str() else {
                continue;
            };
            let free = parse_num(&b["free"])?;
            let locked = parse_num(&b["locked"])?;
            balances.insert(asset.to_string(), BalanceEntry::new(free, locked));
        }

        debug!(assets = balances.len(), "balances retrieved");
        Ok(Balances(balances))
    }

    /// GET /api/v3/ticker/24hr for one market (public).
    #[instrument(skip(self, symbol), fields(symbol = %symbol), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker> {
        let params = format!("symbol={}", symbol.market_id());
        let body = self.request(Method::GET, "/api/v3/ticker/24hr", &params, false, 2).await?;
        parse_ticker(&body, symbol.clone())
    }

    /// GET /api/v3/ticker/24hr for every market (public, heavy).
    #[instrument(skip(self), name = "binance::fetch_tickers")]
    async fn fetch_tickers(&self) -> ExchangeResult<HashMap<Symbol, Ticker>> {
        self.ensure_markets().await?;
        let body = self.request(Method::GET, "/api/v3/ticker/24hr", "", false, 80).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("24hr ticker response is not an array".into()))?;

        let markets = self.markets.read().clone();
        let mut tickers = HashMap::with_capacity(entries.len());
        for entry in entries {
            let Some(info) = entry["symbol"].as_str().and_then(|id| markets.get(id)) else {
                continue;
            };
            match parse_ticker(entry, info.symbol.clone()) {
                Ok(t) => {
                    tickers.insert(info.symbol.clone(), t);
                }
                Err(e) => warn!(symbol = %info.symbol, error = %e, "skipping malformed ticker"),
            }
        }

        debug!(count = tickers.len(), "tickers fetched");
        Ok(tickers)
    }

    async fn create_market_buy_order(&self, symbol: &Symbol, quantity: f64) -> ExchangeResult<Order> {
        self.place_order(symbol, Side::Buy, OrderType::Market, quantity, None).await
    }

    async fn create_market_sell_order(&self, symbol: &Symbol, quantity: f64) -> ExchangeResult<Order> {
        self.place_order(symbol, Side::Sell, OrderType::Market, quantity, None).await
    }

    async fn create_limit_buy_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
    ) -> ExchangeResult<Order> {
        self.ensure_markets().await?;
        self.place_order(symbol, Side::Buy, OrderType::Limit, quantity, Some(price)).await
    }

    async fn create_limit_sell_order(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: f64,
    ) -> ExchangeResult<Order> {
        self.ensure_markets().await?;
        self.place_order(symbol, Side::Sell, OrderType::Limit, quantity, Some(price)).await
    }

    /// DELETE /api/v3/order (signed).
    #[instrument(skip(self, symbol), fields(symbol = %symbol), name = "binance::cancel_order")]
    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> ExchangeResult<Order> {
        let params = format!("symbol={}&orderId={order_id}", symbol.market_id());
        let body = self.request(Method::DELETE, "/api/v3/order", &params, true, 1).await?;
        debug!(symbol = %symbol, order_id, "order cancelled");
        parse_order(&body, symbol)
    }

    /// GET /api/v3/openOrders (signed).
    #[instrument(skip(self, symbol), fields(symbol = %symbol), name = "binance::fetch_open_orders")]
    async fn fetch_open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<Order>> {
        let params = format!("symbol={}", symbol.market_id());
        let body = self.request(Method::GET, "/api/v3/openOrders", &params, true, 6).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("openOrders response is not an array".into()))?;
        let orders = entries
            .iter()
            .map(|o| parse_order(o, symbol))
            .collect::<ExchangeResult<Vec<_>>>()?;
        debug!(count = orders.len(), "open orders retrieved");
        Ok(orders)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("weight", &self.weight)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response mapping
// -----------------------------------------------------------------------------

/// Map a non-2xx reply onto an error kind.
fn map_api_error(status: u16, body: &Value) -> ExchangeError {
    let code = body["code"].as_i64().unwrap_or(0);
    let msg = body["msg"].as_str().unwrap_or("").to_string();
    let detail = format!("{code} {msg}");

    match (status, code) {
        (429 | 418, _) => ExchangeError::RateLimited(detail),
        (500..=599, _) => ExchangeError::Network(detail),
        (_, -2010) if msg.to_lowercase().contains("insufficient balance") => {
            ExchangeError::InsufficientFunds(detail)
        }
        (_, -2011 | -2013) => ExchangeError::OrderNotFound(detail),
        (_, -1121) => ExchangeError::BadSymbol(detail),
        (_, -1021 | -1001 | -1003) => ExchangeError::Network(detail),
        _ => ExchangeError::Exchange(detail),
    }
}

/// Binance sends numbers as strings; accept either form.
fn parse_num(val: &Value) -> ExchangeResult<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|e| ExchangeError::Decode(format!("'{s}' is not a number: {e}")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ExchangeError::Decode(format!("expected string or number, got: {val}")))
    }
}

fn parse_ticker(v: &Value, symbol: Symbol) -> ExchangeResult<Ticker> {
    Ok(Ticker {
        symbol,
        bid: parse_num(&v["bidPrice"])?,
        ask: parse_num(&v["askPrice"])?,
        last: parse_num(&v["lastPrice"])?,
        high: parse_num(&v["highPrice"])?,
        low: parse_num(&v["lowPrice"])?,
        change: parse_num(&v["priceChangePercent"])?,
        base_volume: parse_num(&v["volume"])?,
    })
}

fn parse_order(v: &Value, symbol: &Symbol) -> ExchangeResult<Order> {
    let id = match &v["orderId"] {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => return Err(ExchangeError::Decode(format!("order without orderId: {other}"))),
    };
    let side = match v["side"].as_str() {
        Some("BUY") => Side::Buy,
        Some("SELL") => Side::Sell,
        other => return Err(ExchangeError::Decode(format!("unknown order side {other:?}"))),
    };
    let order_type = match v["type"].as_str() {
        Some("MARKET") => OrderType::Market,
        _ => OrderType::Limit,
    };
    let quantity = parse_num(&v["origQty"])?;
    let filled = parse_num(&v["executedQty"]).unwrap_or(0.0);
    let mut price = parse_num(&v["price"]).unwrap_or(0.0);

    // Market orders report price 0; use the average fill instead.
    if price == 0.0 && filled > 0.0 {
        if let Ok(quote) = parse_num(&v["cummulativeQuoteQty"]) {
            price = quote / filled;
        }
    }

    Ok(Order {
        id,
        symbol: symbol.clone(),
        side,
        order_type,
        quantity,
        filled,
        price,
        status: OrderStatus::from_exchange(v["status"].as_str().unwrap_or("NEW")),
    })
}

/// Render `value` rounded to a multiple of `step` (8 decimals when unknown),
/// without trailing zeros.
fn format_decimal(value: f64, step: f64) -> String {
    let (rounded, decimals) = if step > 0.0 {
        let decimals = (-step.log10()).ceil().max(0.0) as usize;
        ((value / step).round() * step, decimals)
    } else {
        (value, 8)
    };
    let s = format!("{rounded:.decimals$}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_matches_binance_reference_vector() {
        // Example from the Binance API documentation.
        let client = BinanceClient::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            DEFAULT_BASE_URL,
        )
        .unwrap();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn insufficient_balance_maps_to_insufficient_funds() {
        let body = json!({"code": -2010, "msg": "Account has insufficient balance for requested action."});
        assert!(matches!(map_api_error(400, &body), ExchangeError::InsufficientFunds(_)));
    }

    #[test]
    fn error_codes_map_to_kinds() {
        let unknown = json!({"code": -2011, "msg": "Unknown order sent."});
        assert!(matches!(map_api_error(400, &unknown), ExchangeError::OrderNotFound(_)));

        let bad = json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(matches!(map_api_error(400, &bad), ExchangeError::BadSymbol(_)));

        let filter = json!({"code": -1013, "msg": "Filter failure: NOTIONAL"});
        assert!(matches!(map_api_error(400, &filter), ExchangeError::Exchange(_)));

        assert!(matches!(map_api_error(429, &json!({})), ExchangeError::RateLimited(_)));
        assert!(matches!(map_api_error(502, &json!({})), ExchangeError::Network(_)));
    }

    /// Serve one canned HTTP reply on a local port and return its base URL.
    async fn serve_once(reply: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn html_gateway_error_is_transient() {
        let body = "<html><body>502 Bad Gateway</body></html>";
        let reply = format!(
            "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let client = BinanceClient::new("", "", serve_once(reply).await).unwrap();

        let err = client.fetch_ticker(&Symbol::new("TRX", "ETH")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Network(ref m) if m.contains("502 Bad Gateway")), "{err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn malformed_success_body_is_a_decode_error() {
        let reply = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_string();
        let client = BinanceClient::new("", "", serve_once(reply).await).unwrap();

        let err = client.fetch_ticker(&Symbol::new("TRX", "ETH")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Decode(_)), "{err:?}");
        assert!(!err.is_transient());
    }

    #[test]
    fn market_order_price_is_average_fill() {
        let body = json!({
            "symbol": "TRXETH",
            "orderId": 28,
            "price": "0.00000000",
            "origQty": "500.00000000",
            "executedQty": "500.00000000",
            "cummulativeQuoteQty": "5.00000000",
            "status": "FILLED",
            "type": "MARKET",
            "side": "SELL"
        });
        let order = parse_order(&body, &Symbol::new("TRX", "ETH")).unwrap();
        assert_eq!(order.id, "28");
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.price - 0.01).abs() < 1e-12);
    }

    #[test]
    fn ticker_parses_string_numbers() {
        let body = json!({
            "symbol": "TRXETH",
            "priceChangePercent": "12.5",
            "lastPrice": "0.0100",
            "bidPrice": "0.0099",
            "askPrice": "0.0101",
            "highPrice": "0.0110",
            "lowPrice": "0.0080",
            "volume": "123456"
        });
        let t = parse_ticker(&body, Symbol::new("TRX", "ETH")).unwrap();
        assert_eq!(t.change, 12.5);
        assert_eq!(t.ask, 0.0101);
        assert_eq!(t.base_volume, 123456.0);
    }

    #[test]
    fn decimals_follow_tick_size() {
        assert_eq!(format_decimal(500.0, 1.0), "500");
        assert_eq!(format_decimal(0.010700000000000001, 0.000001), "0.0107");
        assert_eq!(format_decimal(0.0123456789, 0.0), "0.01234568");
        assert_eq!(format_decimal(1.07, 0.01), "1.07");
    }
}
