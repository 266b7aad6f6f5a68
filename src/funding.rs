//! Secondary liquidity source: an OKX-style funding account used only to
//! top up under-funded main accounts when their sub-account runs dry.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;

use crate::notify::{notify, Severity};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_FUNDING_ENDPOINT: &str = "https://www.okx.com";
const FUNDING_TOKEN: &str = "USDC";
const BALANCE_WAIT_ATTEMPTS: u32 = 30;
const BALANCE_WAIT_INTERVAL_SECS: u64 = 10;
const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_RETRY_DELAY_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Opaque external deposit operation consumed by the collateral balancer.
#[async_trait]
pub trait LiquiditySource: Send + Sync {
    async fn request_withdrawal(&self, address: &str, amount: Decimal) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<Value>,
}

pub struct FundingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    chain: String,
}

impl FundingClient {
    /// Builds the client from `FUNDING_*` env vars; `None` when the fallback
    /// is not configured.
    pub fn from_env(chain: &str) -> Result<Option<Self>> {
        let api_key = env::var("FUNDING_API_KEY").ok().filter(|v| !v.is_empty());
        let api_secret = env::var("FUNDING_API_SECRET").ok().filter(|v| !v.is_empty());
        let passphrase = env::var("FUNDING_PASSPHRASE").ok().filter(|v| !v.is_empty());
        let (Some(api_key), Some(api_secret), Some(passphrase)) =
            (api_key, api_secret, passphrase)
        else {
            log::info!("[FUNDING] external liquidity source not configured");
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build funding http client")?;
        Ok(Some(Self {
            http,
            base_url: env::var("FUNDING_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_FUNDING_ENDPOINT.to_string()),
            api_key,
            api_secret,
            passphrase,
            chain: format!("{}-{}", FUNDING_TOKEN, chain),
        }))
    }

    fn signed_headers(&self, method: &Method, request_path: &str, body: &str) -> Vec<(String, String)> {
        let now = Utc::now();
        let timestamp = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let message = format!("{}{}{}{}", timestamp, method.as_str(), request_path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("OK-ACCESS-KEY".to_string(), self.api_key.clone()),
            ("OK-ACCESS-SIGN".to_string(), signature),
            ("OK-ACCESS-TIMESTAMP".to_string(), timestamp),
            ("OK-ACCESS-PASSPHRASE".to_string(), self.passphrase.clone()),
        ]
    }

    async fn request(&self, method: Method, request_path: &str, body: Option<Value>) -> Result<Envelope> {
        let body_text = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let url = format!("{}{}", self.base_url, request_path);
        let mut request = self.http.request(method.clone(), &url);
        for (name, value) in self.signed_headers(&method, request_path, &body_text) {
            request = request.header(name, value);
        }
        if !body_text.is_empty() {
            request = request.body(body_text);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("funding request {} failed", request_path))?;
        let envelope: Envelope = response
            .json()
            .await
            .with_context(|| format!("funding response for {} is not json", request_path))?;
        Ok(envelope)
    }

    async fn withdrawal_fee(&self) -> Result<String> {
        let path = format!("/api/v5/asset/currencies?ccy={}", FUNDING_TOKEN);
        let envelope = self.request(Method::GET, &path, None).await?;
        if envelope.data.is_empty() {
            bail!(
                "funding API returned no currency data; check API key permissions and IP allowlist"
            );
        }
        envelope
            .data
            .iter()
            .find(|entry| entry.get("chain").and_then(|c| c.as_str()) == Some(self.chain.as_str()))
            .and_then(|entry| entry.get("minFee").and_then(|f| f.as_str()))
            .map(String::from)
            .ok_or_else(|| anyhow!("no withdrawal fee for chain {}", self.chain))
    }

    /// Moves any sub-account balances into the funding account. Best effort:
    /// individual failures are logged and skipped.
    async fn sweep_sub_accounts(&self) {
        let list = match self
            .request(Method::GET, "/api/v5/users/subaccount/list", None)
            .await
        {
            Ok(envelope) => envelope.data,
            Err(err) => {
                log::warn!("[FUNDING] sub-account list failed: {:#}", err);
                return;
            }
        };
        for entry in list {
            let Some(name) = entry.get("subAcct").and_then(|v| v.as_str()) else {
                continue;
            };
            let path = format!(
                "/api/v5/asset/subaccount/balances?subAcct={}&ccy={}",
                name, FUNDING_TOKEN
            );
            let balance = match self.request(Method::GET, &path, None).await {
                Ok(envelope) => envelope
                    .data
                    .first()
                    .and_then(|d| d.get("bal").and_then(|b| b.as_str()))
                    .and_then(|b| Decimal::from_str(b).ok())
                    .unwrap_or_default(),
                Err(err) => {
                    log::warn!("[FUNDING] balance query for {} failed: {:#}", name, err);
                    continue;
                }
            };
            if balance <= Decimal::ZERO {
                continue;
            }
            log::info!("[FUNDING] sweeping {} {} from {}", balance, FUNDING_TOKEN, name);
            let body = json!({
                "ccy": FUNDING_TOKEN,
                "amt": balance.to_string(),
                "from": "6",
                "to": "6",
                "type": "2",
                "subAcct": name,
            });
            if let Err(err) = self
                .request(Method::POST, "/api/v5/asset/transfer", Some(body))
                .await
            {
                log::warn!("[FUNDING] sweep from {} failed: {:#}", name, err);
            }
        }
    }

    /// Moves any trading-account balance into the funding account.
    async fn sweep_trading_balance(&self) {
        let path = format!("/api/v5/account/balance?ccy={}", FUNDING_TOKEN);
        let Ok(envelope) = self.request(Method::GET, &path, None).await else {
            return;
        };
        let balance = envelope
            .data
            .first()
            .and_then(|d| d.get("details"))
            .and_then(|d| d.as_array())
            .and_then(|a| a.first())
            .and_then(|d| d.get("cashBal").and_then(|b| b.as_str()))
            .and_then(|b| Decimal::from_str(b).ok())
            .unwrap_or_default();
        if balance <= Decimal::ZERO {
            return;
        }
        let body = json!({
            "ccy": FUNDING_TOKEN,
            "amt": balance.to_string(),
            "from": "18",
            "to": "6",
            "type": "0",
        });
        if let Err(err) = self
            .request(Method::POST, "/api/v5/asset/transfer", Some(body))
            .await
        {
            log::warn!("[FUNDING] trading balance sweep failed: {:#}", err);
        }
    }

    async fn funding_balance(&self) -> Result<Decimal> {
        let path = format!("/api/v5/asset/balances?ccy={}", FUNDING_TOKEN);
        let envelope = self.request(Method::GET, &path, None).await?;
        envelope
            .data
            .first()
            .and_then(|d| d.get("availBal").and_then(|b| b.as_str()))
            .and_then(|b| Decimal::from_str(b).ok())
            .ok_or_else(|| anyhow!("funding balance missing from response"))
    }
}

#[async_trait]
impl LiquiditySource for FundingClient {
    async fn request_withdrawal(&self, address: &str, amount: Decimal) -> Result<()> {
        let fee = self.withdrawal_fee().await?;

        // Gather liquidity until the funding account covers the request.
        let mut covered = false;
        for _attempt in 0..BALANCE_WAIT_ATTEMPTS {
            self.sweep_sub_accounts().await;
            self.sweep_trading_balance().await;
            let balance = self.funding_balance().await?;
            log::info!("[FUNDING] balance: {} {}", balance, FUNDING_TOKEN);
            if balance >= amount {
                covered = true;
                break;
            }
            notify(
                Severity::Warning,
                format!(
                    "Funding balance too low ({} < {}), waiting...",
                    balance, amount
                ),
            );
            sleep(Duration::from_secs(BALANCE_WAIT_INTERVAL_SECS)).await;
        }
        if !covered {
            bail!(
                "funding balance never covered {} {}",
                amount,
                FUNDING_TOKEN
            );
        }

        let body = json!({
            "ccy": FUNDING_TOKEN,
            "amt": amount.to_string(),
            "fee": fee,
            "dest": "4",
            "chain": self.chain,
            "toAddr": address,
        });
        let mut last_message = String::new();
        for attempt in 1..=SUBMIT_ATTEMPTS {
            let envelope = self
                .request(Method::POST, "/api/v5/asset/withdrawal", Some(body.clone()))
                .await?;
            if envelope.code == "0" {
                notify(
                    Severity::Success,
                    format!(
                        "Requested deposit of {} {} to {}",
                        amount, FUNDING_TOKEN, address
                    ),
                );
                return Ok(());
            }
            last_message = envelope.msg;
            notify(
                Severity::Error,
                format!(
                    "External withdrawal of {} {} failed ({}/{}): {}",
                    amount, FUNDING_TOKEN, attempt, SUBMIT_ATTEMPTS, last_message
                ),
            );
            sleep(Duration::from_secs(SUBMIT_RETRY_DELAY_SECS)).await;
        }
        bail!("external withdrawal failed: {}", last_message)
    }
}
