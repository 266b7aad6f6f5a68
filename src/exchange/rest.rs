use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;

use super::{
    AccountInfo, BalanceSheet, ExchangeClient, ExchangeError, Fill, FillsQuery,
    InstrumentDecimals, OrderAck, OrderRequest, OrderSide, OrderStatus, PositionSnapshot,
    QUOTE_SYMBOL,
};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT_SECS: u64 = 20;
const SIGNATURE_WINDOW_MS: u32 = 5_000;
const TRANSIENT_RETRIES: u32 = 3;
const TRANSIENT_BACKOFF_SECS: u64 = 5;

/// Signed REST client for the exchange. One instance per account; holds that
/// account's credentials and optional egress proxy.
pub struct RestExchangeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    chain: String,
}

impl RestExchangeClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        proxy: Option<&str>,
        chain: &str,
    ) -> Result<Self, ExchangeError> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        if let Some(raw) = proxy {
            let url = proxy_url(raw).ok_or_else(|| {
                ExchangeError::Unexpected(format!("malformed proxy string: {}", raw))
            })?;
            let proxy = reqwest::Proxy::all(&url)
                .map_err(|e| ExchangeError::Unexpected(format!("invalid proxy {}: {}", url, e)))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| ExchangeError::Unexpected(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            chain: chain.to_string(),
        })
    }

    fn sign(&self, timestamp_ms: i64, method: &Method, path: &str, body: &str) -> String {
        let message = format!("{}{}{}{}", timestamp_ms, method.as_str(), path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, ExchangeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(method.clone(), path, query, body.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < TRANSIENT_RETRIES => {
                    log::warn!(
                        "[HTTP] {} {} attempt {}/{} failed: {}; retrying",
                        method,
                        path,
                        attempt,
                        TRANSIENT_RETRIES,
                        err
                    );
                    sleep(Duration::from_secs(TRANSIENT_BACKOFF_SECS)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let body_text = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let timestamp_ms = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp_ms, &method, path, &body_text);

        let mut request = self
            .http
            .request(method, &url)
            .header("X-API-KEY", &self.api_key)
            .header("X-TIMESTAMP", timestamp_ms.to_string())
            .header("X-WINDOW", SIGNATURE_WINDOW_MS.to_string())
            .header("X-SIGNATURE", signature);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ExchangeError::Transient(e.to_string())
            } else {
                ExchangeError::Unexpected(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        if status.is_success() {
            if text.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| ExchangeError::Unexpected(format!("bad json: {} ({})", e, text)));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ExchangeError::Transient(format!("<{}> {}", status, text)));
        }
        Err(classify_rejection(extract_message(&text)))
    }
}

fn proxy_url(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [host, port, login, pass] => Some(format!("http://{}:{}@{}:{}", login, pass, host, port)),
        [host, port] => Some(format!("http://{}:{}", host, port)),
        _ => None,
    }
}

fn classify_rejection(message: String) -> ExchangeError {
    if message.contains("being liquidated") {
        ExchangeError::AccountBeingLiquidated(message)
    } else {
        ExchangeError::Rejected(message)
    }
}

fn extract_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| text.to_string())
}

fn parse_dec(raw: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(raw)
        .map_err(|e| ExchangeError::Unexpected(format!("bad decimal '{}': {}", raw, e)))
}

fn parse_wire<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(value)
        .map_err(|e| ExchangeError::Unexpected(format!("unexpected payload shape: {}", e)))
}

/// Number of fractional digits in a decimal string like "0.001".
fn fraction_digits(raw: &str) -> u32 {
    raw.split_once('.')
        .map(|(_, frac)| frac.len() as u32)
        .unwrap_or(0)
}

fn parse_fill_timestamp(raw: &str) -> Result<i64, ExchangeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc().timestamp());
        }
    }
    Err(ExchangeError::Unexpected(format!(
        "unparseable fill timestamp '{}'",
        raw
    )))
}

#[derive(Deserialize)]
struct TickerWire {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Deserialize)]
struct CollateralEntryWire {
    symbol: String,
    #[serde(rename = "totalQuantity")]
    total_quantity: String,
    #[serde(rename = "availableQuantity")]
    available_quantity: String,
}

#[derive(Deserialize)]
struct CollateralWire {
    #[serde(rename = "netEquityAvailable")]
    net_equity_available: String,
    collateral: Vec<CollateralEntryWire>,
}

#[derive(Deserialize)]
struct CapitalEntryWire {
    available: String,
}

#[derive(Deserialize)]
struct AccountWire {
    #[serde(rename = "leverageLimit")]
    leverage_limit: String,
}

#[derive(Deserialize)]
struct OrderAckWire {
    status: Option<String>,
    #[serde(rename = "executedQuantity")]
    executed_quantity: Option<String>,
    #[serde(rename = "executedQuoteQuantity")]
    executed_quote_quantity: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct PositionWire {
    symbol: String,
    #[serde(rename = "netQuantity")]
    net_quantity: String,
    #[serde(rename = "netExposureQuantity")]
    net_exposure_quantity: String,
    #[serde(rename = "netExposureNotional")]
    net_exposure_notional: String,
    #[serde(rename = "pnlUnrealized")]
    pnl_unrealized: String,
    #[serde(rename = "pnlRealized")]
    pnl_realized: String,
}

#[derive(Deserialize)]
struct FillWire {
    symbol: String,
    quantity: String,
    price: String,
    side: String,
    #[serde(rename = "orderId")]
    order_id: String,
    timestamp: String,
}

#[derive(Deserialize)]
struct QuantityFilterWire {
    #[serde(rename = "minQuantity")]
    min_quantity: String,
}

#[derive(Deserialize)]
struct PriceFilterWire {
    #[serde(rename = "minPrice")]
    min_price: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
}

#[derive(Deserialize)]
struct MarketFiltersWire {
    quantity: QuantityFilterWire,
    price: PriceFilterWire,
}

#[derive(Deserialize)]
struct MarketWire {
    symbol: String,
    #[serde(rename = "baseSymbol")]
    base_symbol: String,
    filters: MarketFiltersWire,
}

#[derive(Deserialize)]
struct BorrowPositionWire {
    symbol: String,
    #[serde(rename = "netExposureQuantity")]
    net_exposure_quantity: String,
}

#[async_trait]
impl ExchangeClient for RestExchangeClient {
    async fn get_prices(&self, perp_only: bool) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let value = self.send(Method::GET, "/api/v1/tickers", &[], None).await?;
        let tickers: Vec<TickerWire> = parse_wire(value)?;
        let mut prices = HashMap::new();
        for ticker in tickers {
            if perp_only && !ticker.symbol.ends_with("_PERP") {
                continue;
            }
            let token = ticker
                .symbol
                .replace("_USDC", "")
                .replace("_PERP", "");
            prices.insert(token, parse_dec(&ticker.last_price)?);
        }
        prices.insert(QUOTE_SYMBOL.to_string(), Decimal::ONE);
        Ok(prices)
    }

    async fn get_balances(&self) -> Result<BalanceSheet, ExchangeError> {
        let value = self
            .send(Method::GET, "/api/v1/capital/collateral", &[], None)
            .await?;
        let collateral: CollateralWire = parse_wire(value)?;

        let mut sheet = BalanceSheet {
            net_equity_available: parse_dec(&collateral.net_equity_available)?,
            ..BalanceSheet::default()
        };
        for entry in collateral.collateral {
            sheet
                .total
                .insert(entry.symbol.clone(), parse_dec(&entry.total_quantity)?);
            sheet
                .available
                .insert(entry.symbol, parse_dec(&entry.available_quantity)?);
        }

        // Spot capital covers symbols that never appear as collateral.
        let value = self.send(Method::GET, "/api/v1/capital", &[], None).await?;
        let capital: HashMap<String, CapitalEntryWire> = parse_wire(value)?;
        for (symbol, entry) in capital {
            let quantity = parse_dec(&entry.available)?;
            sheet.total.entry(symbol.clone()).or_insert(quantity);
            sheet.available.entry(symbol).or_insert(quantity);
        }
        Ok(sheet)
    }

    async fn get_transferable_amount(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("autoLendRedeem", "true".to_string()),
        ];
        let value = self
            .send(Method::GET, "/api/v1/account/limits/withdrawal", &query, None)
            .await?;
        let raw = value
            .get("maxWithdrawalQuantity")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ExchangeError::Unexpected(format!("no maxWithdrawalQuantity for {}", symbol))
            })?;
        parse_dec(raw)
    }

    async fn get_max_order_size(
        &self,
        symbol: &str,
        side: OrderSide,
    ) -> Result<Decimal, ExchangeError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
        ];
        let value = self
            .send(Method::GET, "/api/v1/account/limits/order", &query, None)
            .await?;
        let raw = value
            .get("maxOrderQuantity")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ExchangeError::Unexpected(format!("no maxOrderQuantity for {} {}", symbol, side))
            })?;
        parse_dec(raw)
    }

    async fn get_account_info(&self) -> Result<AccountInfo, ExchangeError> {
        let value = self.send(Method::GET, "/api/v1/account", &[], None).await?;
        let account: AccountWire = parse_wire(value)?;
        let leverage_limit = account.leverage_limit.parse::<u32>().map_err(|_| {
            ExchangeError::Unexpected(format!("bad leverageLimit '{}'", account.leverage_limit))
        })?;
        Ok(AccountInfo { leverage_limit })
    }

    async fn change_leverage(&self, leverage: u32) -> Result<(), ExchangeError> {
        let body = json!({ "leverageLimit": leverage.to_string() });
        self.send(Method::PATCH, "/api/v1/account", &[], Some(body))
            .await?;
        let info = self.get_account_info().await?;
        if info.leverage_limit != leverage {
            return Err(ExchangeError::Rejected(format!(
                "leverage change not applied: wanted {}, account reports {}",
                leverage, info.leverage_limit
            )));
        }
        Ok(())
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut body = json!({
            "orderType": "Market",
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "reduceOnly": request.reduce_only,
        });
        if let Some(quantity) = request.quantity {
            body["quantity"] = Value::String(quantity.to_string());
        }
        if let Some(quote_quantity) = request.quote_quantity {
            body["quoteQuantity"] = Value::String(quote_quantity.to_string());
        }
        let value = self.send(Method::POST, "/api/v1/order", &[], Some(body)).await?;
        let raw_text = value.to_string();
        let ack: OrderAckWire = parse_wire(value)?;
        let status = ack
            .status
            .as_deref()
            .map(OrderStatus::from_wire)
            .unwrap_or(OrderStatus::Unknown);
        Ok(OrderAck {
            status,
            executed_quantity: ack
                .executed_quantity
                .as_deref()
                .map(parse_dec)
                .transpose()?
                .unwrap_or_default(),
            executed_quote_quantity: ack
                .executed_quote_quantity
                .as_deref()
                .map(parse_dec)
                .transpose()?
                .unwrap_or_default(),
            message: ack.message.or(Some(raw_text)),
        })
    }

    async fn get_futures_positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        let value = self.send(Method::GET, "/api/v1/position", &[], None).await?;
        let positions: Vec<PositionWire> = parse_wire(value)?;
        positions
            .into_iter()
            .map(|p| {
                Ok(PositionSnapshot {
                    net_quantity: parse_dec(&p.net_quantity)?,
                    net_exposure_quantity: parse_dec(&p.net_exposure_quantity)?,
                    net_exposure_notional: parse_dec(&p.net_exposure_notional)?,
                    pnl_unrealized: parse_dec(&p.pnl_unrealized)?,
                    pnl_realized: parse_dec(&p.pnl_realized)?,
                    symbol: p.symbol,
                })
            })
            .collect()
    }

    async fn get_fills(&self, query: &FillsQuery) -> Result<Vec<Fill>, ExchangeError> {
        let mut params = vec![
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
        ];
        if query.liquidations_only {
            params.push(("fillType", "AllLiquidation".to_string()));
            params.push(("marketType", "PERP".to_string()));
        }
        let value = self
            .send(Method::GET, "/wapi/v1/history/fills", &params, None)
            .await?;
        let fills: Vec<FillWire> = parse_wire(value)?;
        fills
            .into_iter()
            .map(|f| {
                let side = OrderSide::parse(&f.side).ok_or_else(|| {
                    ExchangeError::Unexpected(format!("unknown fill side '{}'", f.side))
                })?;
                Ok(Fill {
                    quantity: parse_dec(&f.quantity)?,
                    price: parse_dec(&f.price)?,
                    side,
                    order_id: f.order_id,
                    timestamp: parse_fill_timestamp(&f.timestamp)?,
                    symbol: f.symbol,
                })
            })
            .collect()
    }

    async fn get_deposit_address(&self) -> Result<String, ExchangeError> {
        let query = [("blockchain", self.chain.clone())];
        let value = self
            .send(Method::GET, "/wapi/v1/capital/deposit/address", &query, None)
            .await?;
        value
            .get("address")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| ExchangeError::Unexpected(format!("no deposit address: {}", value)))
    }

    async fn withdraw(
        &self,
        address: &str,
        amount: Decimal,
        symbol: &str,
    ) -> Result<(), ExchangeError> {
        let body = json!({
            "address": address,
            "quantity": amount.to_string(),
            "symbol": symbol,
            "blockchain": self.chain,
        });
        let value = self
            .send(Method::POST, "/wapi/v1/capital/withdrawals", &[], Some(body))
            .await?;
        let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
        match status {
            "pending" | "confirmed" | "success" => Ok(()),
            _ => Err(ExchangeError::Rejected(format!(
                "withdrawal not accepted: {}",
                value
            ))),
        }
    }

    async fn get_instrument_decimals(
        &self,
    ) -> Result<HashMap<String, InstrumentDecimals>, ExchangeError> {
        let value = self.send(Method::GET, "/api/v1/markets", &[], None).await?;
        let markets: Vec<MarketWire> = parse_wire(value)?;
        let mut decimals = HashMap::new();
        for market in markets {
            if !market.symbol.ends_with("_PERP") {
                continue;
            }
            decimals.insert(
                market.base_symbol,
                InstrumentDecimals {
                    amount: fraction_digits(&market.filters.quantity.min_quantity),
                    price: fraction_digits(&market.filters.price.min_price),
                    tick_size: market
                        .filters
                        .price
                        .tick_size
                        .as_deref()
                        .map(fraction_digits)
                        .unwrap_or(0),
                },
            );
        }
        Ok(decimals)
    }

    async fn get_borrow_amount(&self) -> Result<Decimal, ExchangeError> {
        let value = self
            .send(Method::GET, "/api/v1/borrowLend/positions", &[], None)
            .await?;
        let positions: Vec<BorrowPositionWire> = parse_wire(value)?;
        for position in positions {
            if position.symbol == QUOTE_SYMBOL {
                return parse_dec(&position.net_exposure_quantity);
            }
        }
        Ok(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_digits_counts_decimal_places() {
        assert_eq!(fraction_digits("0.001"), 3);
        assert_eq!(fraction_digits("1"), 0);
        assert_eq!(fraction_digits("0.1"), 1);
    }

    #[test]
    fn proxy_url_accepts_four_part_strings() {
        assert_eq!(
            proxy_url("10.0.0.1:8080:user:pw").as_deref(),
            Some("http://user:pw@10.0.0.1:8080")
        );
        assert!(proxy_url("nonsense").is_none());
    }

    #[test]
    fn rejections_mentioning_liquidation_are_classified() {
        let err = classify_rejection("Account is currently being liquidated".to_string());
        assert!(matches!(err, ExchangeError::AccountBeingLiquidated(_)));
        let err = classify_rejection("Insufficient margin".to_string());
        assert!(matches!(err, ExchangeError::Rejected(_)));
    }

    #[test]
    fn fill_timestamps_parse_with_and_without_offset() {
        assert!(parse_fill_timestamp("2024-05-01T12:33:44.123Z").is_ok());
        assert!(parse_fill_timestamp("2024-05-01T12:33:44.123456").is_ok());
        assert!(parse_fill_timestamp("yesterday").is_err());
    }
}
