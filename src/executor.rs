use anyhow::{anyhow, Context, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use tokio::time::sleep;

use crate::accounts::AccountHandle;
use crate::config::sample_delay;
use crate::exchange::{
    perp_symbol, ExchangeError, InstrumentDecimals, OrderRequest, OrderSide,
};
use crate::notify::{notify, Severity};

/// Settle window after a leverage change before the order goes out.
const LEVERAGE_SETTLE_SECS: [f64; 2] = [2.5, 7.5];

/// Truncates toward zero at the given number of decimal places.
pub fn round_to_decimals(amount: Decimal, decimals: u32) -> Decimal {
    amount.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

#[derive(Debug, Clone, Copy)]
pub enum OrderSizing {
    /// USDC notional to spend.
    Quote(Decimal),
    /// Size in base units.
    Quantity(Decimal),
}

#[derive(Debug, Clone)]
pub struct OrderFill {
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub price: Decimal,
}

/// Terminal order failure after the retry budget, carrying the exchange's
/// last reported reason.
#[derive(Debug)]
pub struct OrderRejected {
    pub account_id: String,
    pub symbol: String,
    pub message: String,
}

impl fmt::Display for OrderRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "order on {} for {} failed: {}",
            self.account_id, self.symbol, self.message
        )
    }
}

impl Error for OrderRejected {}

pub fn is_account_liquidation_error(err: &anyhow::Error) -> bool {
    err.to_string().contains("being liquidated")
}

pub struct OrderExecutor {
    decimals: HashMap<String, InstrumentDecimals>,
    retry_limit: u32,
}

impl OrderExecutor {
    pub fn new(decimals: HashMap<String, InstrumentDecimals>, retry_limit: u32) -> Self {
        Self {
            decimals,
            retry_limit,
        }
    }

    pub(crate) fn decimals_for(&self, token: &str) -> Result<InstrumentDecimals> {
        self.decimals
            .get(token)
            .copied()
            .ok_or_else(|| anyhow!("no instrument decimals for {}", token))
    }

    /// Places one leveraged market order. The whole sequence, including the
    /// leverage sync and size-cap re-check, reruns on every retry.
    pub async fn place_order(
        &self,
        account: &AccountHandle,
        token: &str,
        side: OrderSide,
        sizing: OrderSizing,
        leverage: Option<u32>,
        log_failures: bool,
    ) -> Result<OrderFill> {
        let symbol = perp_symbol(token);
        let decimals = self.decimals_for(token)?;
        let mut last_error = String::new();

        for _attempt in 0..=self.retry_limit {
            if let Some(leverage) = leverage {
                self.sync_leverage(account, leverage).await?;
            }

            let (max_order_size, prices) = tokio::join!(
                account.client().get_max_order_size(&symbol, side),
                account.client().get_prices(true),
            );
            let max_order_size = max_order_size
                .with_context(|| format!("failed to fetch max order size for {}", symbol))?;
            let prices = prices.context("failed to fetch futures prices")?;
            let price = prices
                .get(token)
                .copied()
                .ok_or_else(|| anyhow!("no futures price for {}", token))?;
            let max_quote = max_order_size * price;

            let request = match sizing {
                OrderSizing::Quote(requested) => {
                    let mut amount = requested;
                    if amount > max_quote {
                        notify(
                            Severity::Warning,
                            format!(
                                "Requested {:.2} USDC exceeds max {:.2} USDC for {} on {}",
                                amount, max_quote, token, account.id
                            ),
                        );
                        amount = max_quote;
                    }
                    let rounded = round_to_decimals(amount, decimals.tick_size);
                    if rounded <= Decimal::ZERO {
                        return Err(anyhow!(
                            "order size {} USDC rounds to zero for {}",
                            amount,
                            token
                        ));
                    }
                    OrderRequest {
                        symbol: symbol.clone(),
                        side,
                        quantity: None,
                        quote_quantity: Some(rounded),
                        reduce_only: false,
                    }
                }
                OrderSizing::Quantity(requested) => {
                    let mut amount = requested;
                    if amount > max_order_size {
                        notify(
                            Severity::Warning,
                            format!(
                                "Requested {} {} exceeds max {} {} on {}",
                                amount, token, max_order_size, token, account.id
                            ),
                        );
                        amount = max_order_size;
                    }
                    let rounded = round_to_decimals(amount, decimals.amount);
                    if rounded <= Decimal::ZERO {
                        return Err(anyhow!("order size {} {} rounds to zero", amount, token));
                    }
                    OrderRequest {
                        symbol: symbol.clone(),
                        side,
                        quantity: Some(rounded),
                        quote_quantity: None,
                        reduce_only: false,
                    }
                }
            };

            match account.client().create_order(&request).await {
                Ok(ack) if ack.is_filled() => {
                    let quantity = ack.executed_quantity;
                    let quote = ack.executed_quote_quantity;
                    let fill_price = if quantity > Decimal::ZERO {
                        round_to_decimals(quote / quantity, decimals.price)
                    } else {
                        price
                    };
                    let leverage_note = leverage
                        .map(|l| format!(" with {}x", l))
                        .unwrap_or_default();
                    notify(
                        Severity::Success,
                        format!(
                            "Created {} order for {}{}: {:.5} {} @ {} USDC",
                            side.direction_label(),
                            account.id,
                            leverage_note,
                            quantity,
                            token,
                            fill_price
                        ),
                    );
                    return Ok(OrderFill {
                        quantity,
                        quote_quantity: quote,
                        price: fill_price,
                    });
                }
                Ok(ack) => {
                    last_error = ack
                        .message
                        .unwrap_or_else(|| format!("order status {:?}", ack.status));
                }
                Err(err) => {
                    last_error = err.to_string();
                    if let ExchangeError::AccountBeingLiquidated(_) = err {
                        // No point re-submitting until the borrow is covered.
                        return Err(anyhow!(OrderRejected {
                            account_id: account.id.clone(),
                            symbol,
                            message: last_error,
                        }));
                    }
                }
            }

            if log_failures {
                notify(
                    Severity::Error,
                    format!(
                        "Order creation failed on {} for {}: {}",
                        account.id, symbol, last_error
                    ),
                );
            }
        }

        Err(anyhow!(OrderRejected {
            account_id: account.id.clone(),
            symbol,
            message: last_error,
        }))
    }

    async fn sync_leverage(&self, account: &AccountHandle, leverage: u32) -> Result<()> {
        let info = account
            .client()
            .get_account_info()
            .await
            .with_context(|| format!("failed to fetch account info for {}", account.id))?;
        if info.leverage_limit != leverage {
            account
                .client()
                .change_leverage(leverage)
                .await
                .with_context(|| format!("failed to change leverage on {}", account.id))?;
            log::debug!("[ORDER] {} leverage set to {}x", account.id, leverage);
            sleep(sample_delay(LEVERAGE_SETTLE_SECS)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testkit::MockExchange;
    use crate::exchange::ExchangeClient;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn decimals() -> HashMap<String, InstrumentDecimals> {
        HashMap::from([(
            "BTC".to_string(),
            InstrumentDecimals {
                amount: 3,
                price: 1,
                tick_size: 2,
            },
        )])
    }

    fn account(mock: &Arc<MockExchange>) -> AccountHandle {
        AccountHandle::for_tests("acc1", mock.clone() as Arc<dyn ExchangeClient>)
    }

    #[tokio::test]
    async fn quote_orders_round_to_tick_size_decimals() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        let executor = OrderExecutor::new(decimals(), 1);

        let fill = executor
            .place_order(
                &account(&mock),
                "BTC",
                OrderSide::Bid,
                OrderSizing::Quote(dec!(50.129)),
                None,
                true,
            )
            .await
            .unwrap();
        assert_eq!(fill.quote_quantity, dec!(50.12));

        let orders = mock.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quote_quantity, Some(dec!(50.12)));
        assert!(!orders[0].reduce_only);
    }

    #[tokio::test]
    async fn oversized_quote_orders_clamp_to_the_notional_cap() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        *mock.max_order_size.lock().unwrap() = dec!(0.5);
        let executor = OrderExecutor::new(decimals(), 0);

        executor
            .place_order(
                &account(&mock),
                "BTC",
                OrderSide::Bid,
                OrderSizing::Quote(dec!(500)),
                None,
                true,
            )
            .await
            .unwrap();

        let orders = mock.orders.lock().unwrap();
        assert_eq!(orders[0].quote_quantity, Some(dec!(50)));
    }

    #[tokio::test]
    async fn rejections_retry_then_surface_the_exchange_message() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        mock.push_order_result(Ok(MockExchange::rejected_ack("margin too low")));
        mock.push_order_result(Ok(MockExchange::rejected_ack("margin too low")));
        mock.push_order_result(Ok(MockExchange::rejected_ack("margin too low")));
        let executor = OrderExecutor::new(decimals(), 2);

        let err = executor
            .place_order(
                &account(&mock),
                "BTC",
                OrderSide::Ask,
                OrderSizing::Quote(dec!(10)),
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("margin too low"));
        assert_eq!(mock.order_count(), 0);
    }

    #[tokio::test]
    async fn a_retry_after_rejection_succeeds() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        mock.push_order_result(Ok(MockExchange::rejected_ack("transient glitch")));
        let executor = OrderExecutor::new(decimals(), 2);

        let fill = executor
            .place_order(
                &account(&mock),
                "BTC",
                OrderSide::Bid,
                OrderSizing::Quote(dec!(10)),
                None,
                false,
            )
            .await
            .unwrap();
        assert_eq!(fill.quote_quantity, dec!(10));
        assert_eq!(mock.order_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leverage_is_synced_before_the_order() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        *mock.leverage.lock().unwrap() = 10;
        let executor = OrderExecutor::new(decimals(), 0);

        executor
            .place_order(
                &account(&mock),
                "BTC",
                OrderSide::Bid,
                OrderSizing::Quote(dec!(10)),
                Some(20),
                true,
            )
            .await
            .unwrap();
        assert_eq!(*mock.leverage_changes.lock().unwrap(), vec![20]);

        // Matching leverage skips the change entirely.
        executor
            .place_order(
                &account(&mock),
                "BTC",
                OrderSide::Bid,
                OrderSizing::Quote(dec!(10)),
                Some(20),
                true,
            )
            .await
            .unwrap();
        assert_eq!(mock.leverage_changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn account_liquidation_rejections_fail_fast() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        mock.push_order_result(Err(ExchangeError::AccountBeingLiquidated(
            "Account is currently being liquidated".to_string(),
        )));
        let executor = OrderExecutor::new(decimals(), 3);

        let err = executor
            .place_order(
                &account(&mock),
                "BTC",
                OrderSide::Bid,
                OrderSizing::Quote(dec!(10)),
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(is_account_liquidation_error(&err));
        assert_eq!(mock.order_count(), 0);
    }
}
