//! Minimal signed REST client for Binance USDT-margined futures.
//!
//! Only the endpoints the adaptor consumes are implemented. Signed calls
//! use HMAC-SHA256 over the query string with a millisecond timestamp;
//! every request carries a 10 s timeout.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

use perp_common::Kline;

use super::super::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://fapi.binance.com";
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Sign a query string with the account secret.
fn sign_query(secret: &str, query: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn parse_f64(v: &str, what: &str) -> Result<f64, ExchangeError> {
    v.parse::<f64>()
        .map_err(|e| ExchangeError::Parse(format!("bad {what} `{v}`: {e}")))
}

/// Account totals as reported by /fapi/v2/account.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTotals {
    pub total_wallet_balance: String,
    pub total_unrealized_profit: String,
    pub total_initial_margin: String,
}

/// One row of /fapi/v2/positionRisk.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    pub mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: String,
    pub liquidation_price: String,
    pub leverage: String,
}

/// One row of /fapi/v1/userTrades.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub symbol: String,
    pub side: String,
    pub price: String,
    pub qty: String,
    pub realized_pnl: String,
    pub time: i64,
}

/// One resting order from /fapi/v1/openOrders.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: i64,
    #[serde(rename = "type")]
    pub order_type: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Parameters for a new order. Optional fields are omitted from the query
/// entirely; hedge mode decides whether `position_side` is attached.
#[derive(Debug, Default, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: &'static str,       // BUY | SELL
    pub order_type: &'static str, // MARKET | STOP_MARKET | TAKE_PROFIT_MARKET
    pub quantity: Option<String>,
    pub position_side: Option<&'static str>, // LONG | SHORT
    pub stop_price: Option<String>,
    pub close_position: bool,
    pub working_type: Option<&'static str>,
}

/// Signed REST client. Cheap to clone; holds only the HTTP pool and keys.
#[derive(Clone)]
pub struct BinanceClient {
    http: reqwest::Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceClient {
    pub fn new(
        api_key: String,
        secret_key: String,
        proxy_url: Option<&str>,
    ) -> Result<Self, ExchangeError> {
        let mut builder = reqwest::Client::builder().timeout(API_TIMEOUT);
        if let Some(url) = proxy_url {
            match reqwest::Proxy::all(url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!(url, error = %e, "invalid proxy URL, connecting directly"),
            }
        }
        Ok(Self {
            http: builder.build()?,
            api_key,
            secret_key,
            base_url: BASE_URL.to_string(),
        })
    }

    async fn handle_response(response: reqwest::Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or(ApiErrorBody {
            code: status.as_u16() as i64,
            msg: body.clone(),
        });
        Err(ExchangeError::Api {
            code: parsed.code,
            message: parsed.msg,
        })
    }

    /// Unsigned GET.
    async fn get_public(&self, path: &str, query: &str) -> Result<String, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self.http.get(&url).send().await?;
        Self::handle_response(response).await
    }

    /// Signed request. `method` is GET, POST or DELETE.
    async fn call_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<String, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let full_query = if query.is_empty() {
            format!("timestamp={timestamp}&recvWindow=5000")
        } else {
            format!("{query}&timestamp={timestamp}&recvWindow=5000")
        };
        let signature = sign_query(&self.secret_key, &full_query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, full_query, signature
        );

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    // ------------------------------------------------------------------
    // Market data (unsigned)
    // ------------------------------------------------------------------

    /// Klines for `symbol` at `interval`, most recent last.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let body = self
            .get_public(
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;
        let rows: Vec<Vec<Value>> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("klines body: {e}")))?;

        let field = |row: &[Value], i: usize, what: &str| -> Result<f64, ExchangeError> {
            match row.get(i) {
                Some(Value::String(s)) => parse_f64(s, what),
                Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or_default()),
                _ => Err(ExchangeError::Parse(format!("kline missing {what}"))),
            }
        };

        let mut klines = Vec::with_capacity(rows.len());
        for row in &rows {
            if row.len() < 11 {
                continue;
            }
            klines.push(Kline {
                open: field(row, 1, "open")?,
                high: field(row, 2, "high")?,
                low: field(row, 3, "low")?,
                close: field(row, 4, "close")?,
                volume: field(row, 5, "volume")?,
                close_time: row
                    .get(6)
                    .and_then(Value::as_i64)
                    .unwrap_or_default(),
                taker_buy_volume: field(row, 9, "taker buy volume").unwrap_or_default(),
            });
        }
        Ok(klines)
    }

    /// Latest funding rate from the premium index.
    pub async fn funding_rate(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self
            .get_public("/fapi/v1/premiumIndex", &format!("symbol={symbol}"))
            .await?;
        // Single-symbol queries return an object, symbol-less an array.
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("premium index: {e}")))?;
        let obj = match &value {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        match obj.get("lastFundingRate").and_then(Value::as_str) {
            Some(rate) => parse_f64(rate, "funding rate"),
            None => Err(ExchangeError::Parse("premium index missing rate".into())),
        }
    }

    /// Latest open interest in contracts.
    pub async fn open_interest(&self, symbol: &str) -> Result<f64, ExchangeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Body {
            open_interest: String,
        }
        let body = self
            .get_public("/fapi/v1/openInterest", &format!("symbol={symbol}"))
            .await?;
        let parsed: Body = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("open interest: {e}")))?;
        parse_f64(&parsed.open_interest, "open interest")
    }

    /// Top-trader long/short account ratio: (ratio, long_pct, short_pct).
    pub async fn top_long_short_ratio(
        &self,
        symbol: &str,
    ) -> Result<(f64, f64, f64), ExchangeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Row {
            long_short_ratio: String,
            long_account: String,
            short_account: String,
        }
        let body = self
            .get_public(
                "/futures/data/topLongShortAccountRatio",
                &format!("symbol={symbol}&period=5m&limit=1"),
            )
            .await?;
        let rows: Vec<Row> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("long/short ratio: {e}")))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Parse("long/short ratio empty".into()))?;
        Ok((
            parse_f64(&row.long_short_ratio, "ls ratio")?,
            parse_f64(&row.long_account, "long account")?,
            parse_f64(&row.short_account, "short account")?,
        ))
    }

    // ------------------------------------------------------------------
    // Account (signed)
    // ------------------------------------------------------------------

    pub async fn account_totals(&self) -> Result<AccountTotals, ExchangeError> {
        let body = self
            .call_signed(reqwest::Method::GET, "/fapi/v2/account", "")
            .await?;
        serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(format!("account: {e}")))
    }

    pub async fn position_risk(&self) -> Result<Vec<PositionRisk>, ExchangeError> {
        let body = self
            .call_signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("position risk: {e}")))
    }

    pub async fn user_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<UserTrade>, ExchangeError> {
        let body = self
            .call_signed(
                reqwest::Method::GET,
                "/fapi/v1/userTrades",
                &format!("symbol={symbol}&limit={limit}"),
            )
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("user trades: {e}")))
    }

    /// True when the account runs in hedge (dual-side) mode.
    pub async fn dual_side_position(&self) -> Result<bool, ExchangeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Body {
            dual_side_position: bool,
        }
        let body = self
            .call_signed(reqwest::Method::GET, "/fapi/v1/positionSide/dual", "")
            .await?;
        let parsed: Body = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("position mode: {e}")))?;
        Ok(parsed.dual_side_position)
    }

    // ------------------------------------------------------------------
    // Orders (signed)
    // ------------------------------------------------------------------

    pub async fn change_leverage(
        &self,
        symbol: &str,
        leverage: u32,
    ) -> Result<(), ExchangeError> {
        self.call_signed(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
        )
        .await?;
        Ok(())
    }

    pub async fn create_order(&self, req: &OrderRequest) -> Result<(), ExchangeError> {
        let mut query = format!(
            "symbol={}&side={}&type={}",
            req.symbol, req.side, req.order_type
        );
        if let Some(q) = &req.quantity {
            query.push_str(&format!("&quantity={q}"));
        }
        if let Some(ps) = req.position_side {
            query.push_str(&format!("&positionSide={ps}"));
        }
        if let Some(sp) = &req.stop_price {
            query.push_str(&format!("&stopPrice={sp}"));
        }
        if req.close_position {
            query.push_str("&closePosition=true");
        }
        if let Some(wt) = req.working_type {
            query.push_str(&format!("&workingType={wt}"));
        }
        self.call_signed(reqwest::Method::POST, "/fapi/v1/order", &query)
            .await?;
        Ok(())
    }

    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let body = self
            .call_signed(
                reqwest::Method::GET,
                "/fapi/v1/openOrders",
                &format!("symbol={symbol}"),
            )
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Parse(format!("open orders: {e}")))
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        self.call_signed(
            reqwest::Method::DELETE,
            "/fapi/v1/order",
            &format!("symbol={symbol}&orderId={order_id}"),
        )
        .await?;
        Ok(())
    }

    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.call_signed(
            reqwest::Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &format!("symbol={symbol}"),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // Binance's documented example key/query pair.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn order_request_query_shape() {
        let req = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: "SELL",
            order_type: "STOP_MARKET",
            quantity: Some("0.500".into()),
            position_side: Some("LONG"),
            stop_price: Some("19000.0000".into()),
            close_position: true,
            working_type: Some("CONTRACT_PRICE"),
        };
        // Shape only; the signed call appends timestamp + signature.
        let mut query = format!(
            "symbol={}&side={}&type={}",
            req.symbol, req.side, req.order_type
        );
        if let Some(q) = &req.quantity {
            query.push_str(&format!("&quantity={q}"));
        }
        assert!(query.starts_with("symbol=BTCUSDT&side=SELL&type=STOP_MARKET"));
        assert!(query.contains("quantity=0.500"));
    }

    #[test]
    fn kline_rows_parse_mixed_types() {
        let body = r#"[[1700000000000,"100.1","101.2","99.3","100.5","1234.5",1700000179999,"123456.7",42,"600.1","60123.4","0"]]"#;
        let rows: Vec<Vec<Value>> = serde_json::from_str(body).unwrap();
        assert_eq!(rows[0].len(), 12);
        assert_eq!(rows[0][4].as_str().unwrap(), "100.5");
        assert_eq!(rows[0][6].as_i64().unwrap(), 1700000179999);
    }
}
