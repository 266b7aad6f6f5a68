pub mod rest;
#[cfg(test)]
pub mod testkit;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

pub const QUOTE_SYMBOL: &str = "USDC";
const PERP_SUFFIX: &str = "_USDC_PERP";

pub fn perp_symbol(token: &str) -> String {
    format!("{}{}", token, PERP_SUFFIX)
}

pub fn token_of(symbol: &str) -> &str {
    symbol.strip_suffix(PERP_SUFFIX).unwrap_or(symbol)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Bid,
    Ask,
}

impl OrderSide {
    pub fn flipped(self) -> Self {
        match self {
            OrderSide::Bid => OrderSide::Ask,
            OrderSide::Ask => OrderSide::Bid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Bid => "Bid",
            OrderSide::Ask => "Ask",
        }
    }

    /// Direction label used in notifications.
    pub fn direction_label(self) -> &'static str {
        match self {
            OrderSide::Bid => "LONG",
            OrderSide::Ask => "SHORT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Bid" => Some(OrderSide::Bid),
            "Ask" => Some(OrderSide::Ask),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    /// Size in base units. Exactly one of `quantity`/`quote_quantity` is set.
    pub quantity: Option<Decimal>,
    /// Size in USDC notional.
    pub quote_quantity: Option<Decimal>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "Filled" => OrderStatus::Filled,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Rejected" | "Cancelled" | "Expired" => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub status: OrderStatus,
    pub executed_quantity: Decimal,
    pub executed_quote_quantity: Decimal,
    pub message: Option<String>,
}

impl OrderAck {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

#[derive(Debug, Clone, Default)]
pub struct BalanceSheet {
    /// Net equity available as margin, in USDC.
    pub net_equity_available: Decimal,
    /// Immediately spendable quantity per symbol.
    pub available: HashMap<String, Decimal>,
    /// Total quantity per symbol, including amounts locked as collateral.
    pub total: HashMap<String, Decimal>,
}

impl BalanceSheet {
    pub fn available_of(&self, symbol: &str) -> Decimal {
        self.available.get(symbol).copied().unwrap_or_default()
    }

    pub fn total_of(&self, symbol: &str) -> Decimal {
        self.total.get(symbol).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub net_quantity: Decimal,
    pub net_exposure_quantity: Decimal,
    pub net_exposure_notional: Decimal,
    pub pnl_unrealized: Decimal,
    pub pnl_realized: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct InstrumentDecimals {
    pub amount: u32,
    pub price: u32,
    pub tick_size: u32,
}

#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub leverage_limit: u32,
}

#[derive(Debug, Clone)]
pub struct Fill {
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub side: OrderSide,
    pub order_id: String,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FillsQuery {
    pub limit: u32,
    pub offset: u32,
    pub liquidations_only: bool,
}

#[derive(Debug)]
pub enum ExchangeError {
    /// The exchange reported a reason for refusing the request.
    Rejected(String),
    /// The exchange is force-liquidating the whole account.
    AccountBeingLiquidated(String),
    /// Timeouts, connection resets and rate limits; safe to retry.
    Transient(String),
    /// Malformed or unexpected response payloads.
    Unexpected(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Rejected(msg) => write!(f, "rejected by exchange: {}", msg),
            ExchangeError::AccountBeingLiquidated(msg) => {
                write!(f, "account is being liquidated: {}", msg)
            }
            ExchangeError::Transient(msg) => write!(f, "transient network failure: {}", msg),
            ExchangeError::Unexpected(msg) => write!(f, "unexpected response: {}", msg),
        }
    }
}

impl Error for ExchangeError {}

/// The capability set the orchestration core consumes. Implemented by the
/// signed REST client and by the test mock.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Last prices keyed by token name ("USDC" maps to 1).
    async fn get_prices(&self, perp_only: bool) -> Result<HashMap<String, Decimal>, ExchangeError>;

    async fn get_balances(&self) -> Result<BalanceSheet, ExchangeError>;

    /// Maximum quantity withdrawable right now for `symbol`.
    async fn get_transferable_amount(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Maximum order quantity in base units for `symbol`/`side`.
    async fn get_max_order_size(
        &self,
        symbol: &str,
        side: OrderSide,
    ) -> Result<Decimal, ExchangeError>;

    async fn get_account_info(&self) -> Result<AccountInfo, ExchangeError>;

    async fn change_leverage(&self, leverage: u32) -> Result<(), ExchangeError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn get_futures_positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError>;

    /// One page of fills history; callers paginate via `query.offset`.
    async fn get_fills(&self, query: &FillsQuery) -> Result<Vec<Fill>, ExchangeError>;

    async fn get_deposit_address(&self) -> Result<String, ExchangeError>;

    async fn withdraw(
        &self,
        address: &str,
        amount: Decimal,
        symbol: &str,
    ) -> Result<(), ExchangeError>;

    async fn get_instrument_decimals(
        &self,
    ) -> Result<HashMap<String, InstrumentDecimals>, ExchangeError>;

    /// Outstanding USDC borrow, zero when the account has no borrows.
    async fn get_borrow_amount(&self) -> Result<Decimal, ExchangeError>;
}
