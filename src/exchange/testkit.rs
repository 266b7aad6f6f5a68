//! Scriptable in-memory exchange for unit tests: queue responses up front,
//! assert on the captured call log afterwards.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{
    AccountInfo, BalanceSheet, ExchangeClient, ExchangeError, Fill, FillsQuery,
    InstrumentDecimals, OrderAck, OrderRequest, OrderSide, OrderStatus, PositionSnapshot,
};

pub struct MockExchange {
    pub prices: Mutex<HashMap<String, Decimal>>,
    pub balances: Mutex<VecDeque<BalanceSheet>>,
    pub positions: Mutex<VecDeque<Vec<PositionSnapshot>>>,
    pub order_results: Mutex<VecDeque<Result<OrderAck, ExchangeError>>>,
    pub withdraw_results: Mutex<VecDeque<Result<(), ExchangeError>>>,
    pub transferable: Mutex<VecDeque<Decimal>>,
    pub fills: Mutex<Vec<Fill>>,
    pub liquidation_fills: Mutex<Vec<Fill>>,
    pub decimals: Mutex<HashMap<String, InstrumentDecimals>>,
    pub max_order_size: Mutex<Decimal>,
    pub leverage: Mutex<u32>,
    pub borrow: Mutex<Decimal>,
    pub deposit_address: String,

    pub orders: Mutex<Vec<OrderRequest>>,
    pub withdrawals: Mutex<Vec<(String, Decimal)>>,
    pub leverage_changes: Mutex<Vec<u32>>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            balances: Mutex::new(VecDeque::new()),
            positions: Mutex::new(VecDeque::new()),
            order_results: Mutex::new(VecDeque::new()),
            withdraw_results: Mutex::new(VecDeque::new()),
            transferable: Mutex::new(VecDeque::new()),
            fills: Mutex::new(Vec::new()),
            liquidation_fills: Mutex::new(Vec::new()),
            decimals: Mutex::new(HashMap::new()),
            max_order_size: Mutex::new(dec!(1_000_000)),
            leverage: Mutex::new(10),
            borrow: Mutex::new(Decimal::ZERO),
            deposit_address: "mock-deposit-address".to_string(),
            orders: Mutex::new(Vec::new()),
            withdrawals: Mutex::new(Vec::new()),
            leverage_changes: Mutex::new(Vec::new()),
        }
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, token: &str, price: Decimal) {
        self.prices.lock().unwrap().insert(token.to_string(), price);
    }

    pub fn push_balances(&self, sheet: BalanceSheet) {
        self.balances.lock().unwrap().push_back(sheet);
    }

    pub fn push_positions(&self, positions: Vec<PositionSnapshot>) {
        self.positions.lock().unwrap().push_back(positions);
    }

    pub fn push_order_result(&self, result: Result<OrderAck, ExchangeError>) {
        self.order_results.lock().unwrap().push_back(result);
    }

    pub fn push_transferable(&self, amount: Decimal) {
        self.transferable.lock().unwrap().push_back(amount);
    }

    pub fn rejected_ack(message: &str) -> OrderAck {
        OrderAck {
            status: OrderStatus::Rejected,
            executed_quantity: Decimal::ZERO,
            executed_quote_quantity: Decimal::ZERO,
            message: Some(message.to_string()),
        }
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    fn price_of(&self, symbol: &str) -> Decimal {
        let token = super::token_of(symbol);
        self.prices
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    /// Pops the next scripted entry, holding on the final one so repeated
    /// polls keep observing the last scripted state.
    fn next_scripted<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_prices(
        &self,
        _perp_only: bool,
    ) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let mut prices = self.prices.lock().unwrap().clone();
        prices.insert(super::QUOTE_SYMBOL.to_string(), Decimal::ONE);
        Ok(prices)
    }

    async fn get_balances(&self) -> Result<BalanceSheet, ExchangeError> {
        Ok(Self::next_scripted(&self.balances).unwrap_or_default())
    }

    async fn get_transferable_amount(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(Self::next_scripted(&self.transferable).unwrap_or_default())
    }

    async fn get_max_order_size(
        &self,
        _symbol: &str,
        _side: OrderSide,
    ) -> Result<Decimal, ExchangeError> {
        Ok(*self.max_order_size.lock().unwrap())
    }

    async fn get_account_info(&self) -> Result<AccountInfo, ExchangeError> {
        Ok(AccountInfo {
            leverage_limit: *self.leverage.lock().unwrap(),
        })
    }

    async fn change_leverage(&self, leverage: u32) -> Result<(), ExchangeError> {
        self.leverage_changes.lock().unwrap().push(leverage);
        *self.leverage.lock().unwrap() = leverage;
        Ok(())
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let scripted = self.order_results.lock().unwrap().pop_front();
        match scripted {
            Some(Err(err)) => Err(err),
            Some(Ok(ack)) => {
                if ack.is_filled() {
                    self.orders.lock().unwrap().push(request.clone());
                }
                Ok(ack)
            }
            None => {
                self.orders.lock().unwrap().push(request.clone());
                let price = self.price_of(&request.symbol);
                let (quantity, quote) = match (request.quantity, request.quote_quantity) {
                    (Some(quantity), _) => (quantity, quantity * price),
                    (_, Some(quote)) => (quote / price, quote),
                    _ => (Decimal::ZERO, Decimal::ZERO),
                };
                Ok(OrderAck {
                    status: OrderStatus::Filled,
                    executed_quantity: quantity,
                    executed_quote_quantity: quote,
                    message: None,
                })
            }
        }
    }

    async fn get_futures_positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        Ok(Self::next_scripted(&self.positions).unwrap_or_default())
    }

    async fn get_fills(&self, query: &FillsQuery) -> Result<Vec<Fill>, ExchangeError> {
        let source = if query.liquidations_only {
            self.liquidation_fills.lock().unwrap()
        } else {
            self.fills.lock().unwrap()
        };
        let start = (query.offset as usize).min(source.len());
        let end = (start + query.limit as usize).min(source.len());
        Ok(source[start..end].to_vec())
    }

    async fn get_deposit_address(&self) -> Result<String, ExchangeError> {
        Ok(self.deposit_address.clone())
    }

    async fn withdraw(
        &self,
        address: &str,
        amount: Decimal,
        _symbol: &str,
    ) -> Result<(), ExchangeError> {
        let scripted = self.withdraw_results.lock().unwrap().pop_front();
        match scripted {
            Some(Err(err)) => Err(err),
            _ => {
                self.withdrawals
                    .lock()
                    .unwrap()
                    .push((address.to_string(), amount));
                Ok(())
            }
        }
    }

    async fn get_instrument_decimals(
        &self,
    ) -> Result<HashMap<String, InstrumentDecimals>, ExchangeError> {
        Ok(self.decimals.lock().unwrap().clone())
    }

    async fn get_borrow_amount(&self) -> Result<Decimal, ExchangeError> {
        Ok(*self.borrow.lock().unwrap())
    }
}

pub fn position(symbol: &str, net_quantity: Decimal, notional: Decimal) -> PositionSnapshot {
    PositionSnapshot {
        symbol: symbol.to_string(),
        net_quantity,
        net_exposure_quantity: net_quantity.abs(),
        net_exposure_notional: notional,
        pnl_unrealized: Decimal::ZERO,
        pnl_realized: Decimal::ZERO,
    }
}
