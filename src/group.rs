use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use crate::accounts::AccountHandle;
use crate::config::{sample_delay, sample_f, BotConfig};
use crate::exchange::{perp_symbol, ExchangeError, OrderSide, PositionSnapshot};
use crate::executor::{round_to_decimals, OrderExecutor, OrderSizing};
use crate::notify::{notify, notify_quiet, Severity};

const MONITOR_POLL_SECS: u64 = 10;
const SIZE_SPLIT_DECIMALS: u32 = 8;

/// Splits `total` across `num_accounts` legs with bounded random variance.
/// The last leg absorbs the rounding residual so the sizes always sum to
/// exactly `total`.
pub fn split_hedge_sizes(total: Decimal, num_accounts: usize, variation: f64) -> Vec<Decimal> {
    if num_accounts == 0 {
        return Vec::new();
    }
    let n = Decimal::from(num_accounts as u64);
    let base = total / n;

    let mut sizes: Vec<Decimal> = {
        let mut rng = rand::thread_rng();
        (0..num_accounts)
            .map(|_| {
                let v = if variation > 0.0 {
                    rng.gen_range(-variation..=variation)
                } else {
                    0.0
                };
                base * Decimal::from_f64(1.0 + v).unwrap_or(Decimal::ONE)
            })
            .collect()
    };

    let assigned: Decimal = sizes.iter().copied().sum();
    let adjustment = (total - assigned) / n;
    for size in sizes.iter_mut() {
        *size = (*size + adjustment).round_dp(SIZE_SPLIT_DECIMALS);
    }
    let head: Decimal = sizes[..num_accounts - 1].iter().copied().sum();
    sizes[num_accounts - 1] = total - head;
    sizes
}

/// Leverage-adjusted PnL as a percentage of committed margin.
pub fn pnl_percent(position: &PositionSnapshot, leverage: u32) -> f64 {
    let total_pnl = (position.pnl_unrealized + position.pnl_realized)
        .to_f64()
        .unwrap_or(0.0);
    let notional = position.net_exposure_notional.abs().to_f64().unwrap_or(0.0);
    if notional == 0.0 || leverage == 0 {
        return 0.0;
    }
    total_pnl / (notional / leverage as f64) * 100.0
}

/// Absolute notional of the account's open position in `token`, zero when
/// no position exists.
pub async fn fetch_position_notional(
    account: &AccountHandle,
    token: &str,
) -> Result<Decimal, ExchangeError> {
    let symbol = perp_symbol(token);
    let positions = account.client().get_futures_positions().await?;
    Ok(positions
        .iter()
        .find(|p| p.symbol == symbol)
        .map(|p| p.net_exposure_notional.abs())
        .unwrap_or(Decimal::ZERO))
}

#[derive(Debug, Clone)]
pub struct GroupOpenParams {
    pub leverage: u32,
    pub primary_size: Decimal,
    pub hedge_sizes: Vec<Decimal>,
    pub primary_side: OrderSide,
}

pub struct GroupManager {
    executor: Arc<OrderExecutor>,
    cfg: Arc<BotConfig>,
}

impl GroupManager {
    pub fn new(executor: Arc<OrderExecutor>, cfg: Arc<BotConfig>) -> Self {
        Self { executor, cfg }
    }

    /// Opens the primary leg, then each hedge leg with a randomized delay.
    /// On any leg failure every leg opened so far is force-closed and the
    /// group is reported as failed.
    pub async fn open_group(
        &self,
        primary: &AccountHandle,
        hedges: &[AccountHandle],
        token: &str,
        params: &GroupOpenParams,
    ) -> bool {
        let hedge_side = params.primary_side.flipped();
        let total: Decimal = params.primary_size + params.hedge_sizes.iter().copied().sum::<Decimal>();

        let hedge_lines: Vec<String> = hedges
            .iter()
            .zip(&params.hedge_sizes)
            .map(|(account, size)| {
                format!(
                    "{} {:.2} USDC for {}",
                    hedge_side.direction_label(),
                    size,
                    account.id
                )
            })
            .collect();
        notify(
            Severity::Info,
            format!(
                "Opening new positions:\nToken: {}\nTotal size: {:.2} USDC\nLeverage: {}x\n{} {:.2} USDC for {}\n{}",
                token,
                total,
                params.leverage,
                params.primary_side.direction_label(),
                params.primary_size,
                primary.id,
                hedge_lines.join("\n")
            ),
        );

        let result = self
            .place_group_legs(primary, hedges, token, params, hedge_side)
            .await;
        match result {
            Ok(()) => {
                notify(
                    Severity::Success,
                    format!(
                        "Opened positions for {}: {} {:.5} USDC, {} hedge legs",
                        token,
                        params.primary_side.direction_label().to_lowercase(),
                        params.primary_size,
                        hedges.len()
                    ),
                );
                true
            }
            Err(err) => {
                notify(Severity::Error, format!("Error opening positions: {:#}", err));
                let mut all = vec![primary.clone()];
                all.extend_from_slice(hedges);
                self.close_all(&all, None).await;
                false
            }
        }
    }

    async fn place_group_legs(
        &self,
        primary: &AccountHandle,
        hedges: &[AccountHandle],
        token: &str,
        params: &GroupOpenParams,
        hedge_side: OrderSide,
    ) -> Result<()> {
        self.executor
            .place_order(
                primary,
                token,
                params.primary_side,
                OrderSizing::Quote(params.primary_size),
                Some(params.leverage),
                true,
            )
            .await
            .with_context(|| format!("primary leg on {}", primary.id))?;

        for (account, size) in hedges.iter().zip(&params.hedge_sizes) {
            let delay = sample_delay(self.cfg.order_delay_secs);
            notify_quiet(
                Severity::Info,
                format!(
                    "Sleeping {:.2}s before next hedge leg...",
                    delay.as_secs_f64()
                ),
            );
            sleep(delay).await;

            self.executor
                .place_order(
                    account,
                    token,
                    hedge_side,
                    OrderSizing::Quote(*size),
                    Some(params.leverage),
                    true,
                )
                .await
                .with_context(|| format!("hedge leg on {}", account.id))?;
        }
        Ok(())
    }

    /// Watches the primary leg until the randomized hold time or PnL limit
    /// hits, then closes every leg. On monitoring errors only the group's
    /// token is force-closed.
    pub async fn monitor_group(
        &self,
        primary: &AccountHandle,
        hedges: &[AccountHandle],
        token: &str,
    ) {
        let mut all = vec![primary.clone()];
        all.extend_from_slice(hedges);
        match self.watch_exit_conditions(primary, token).await {
            Ok(()) => {
                self.close_all(&all, None).await;
            }
            Err(err) => {
                notify(Severity::Error, format!("Error monitoring positions: {:#}", err));
                self.close_all(&all, Some(token)).await;
            }
        }
    }

    async fn watch_exit_conditions(&self, primary: &AccountHandle, token: &str) -> Result<()> {
        let symbol = perp_symbol(token);
        let volume_cfg = &self.cfg.volume;
        let started = Instant::now();
        let max_hold_secs = sample_f(volume_cfg.max_hold_secs);
        let pnl_limit = sample_f(volume_cfg.max_pnl_pct);
        let hold_enabled = volume_cfg.max_hold_secs[0] + volume_cfg.max_hold_secs[1] > 0.0;
        let pnl_enabled = volume_cfg.max_pnl_pct[0] + volume_cfg.max_pnl_pct[1] > 0.0;

        let leverage = primary
            .client()
            .get_account_info()
            .await
            .context("failed to fetch account leverage")?
            .leverage_limit;

        notify(
            Severity::Info,
            format!(
                "Monitoring {} with PnL limit {:.2}% and max hold {:.2}s",
                symbol, pnl_limit, max_hold_secs
            ),
        );

        loop {
            let elapsed = started.elapsed().as_secs_f64();
            let positions = primary
                .client()
                .get_futures_positions()
                .await
                .context("failed to fetch positions")?;
            let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
                notify(
                    Severity::Warning,
                    format!("Position not found for {} on {}", symbol, primary.id),
                );
                return Ok(());
            };

            let pnl_pct = pnl_percent(position, leverage);
            if hold_enabled && elapsed >= max_hold_secs {
                notify(
                    Severity::Info,
                    format!(
                        "Max hold time reached for {}: {:.2}s, PnL {:.2}%",
                        symbol, elapsed, pnl_pct
                    ),
                );
                return Ok(());
            }
            if pnl_enabled && pnl_pct.abs() >= pnl_limit {
                notify(
                    Severity::Info,
                    format!(
                        "PnL limit reached for {}: {:.2}% after {:.2}s",
                        symbol, pnl_pct, elapsed
                    ),
                );
                return Ok(());
            }
            sleep(Duration::from_secs(MONITOR_POLL_SECS)).await;
        }
    }

    /// Closes every open position on one account, optionally narrowed to a
    /// single token. Returns whether any closing order went out.
    pub async fn close_positions(
        &self,
        account: &AccountHandle,
        token: Option<&str>,
    ) -> Result<bool> {
        let filter_symbol = token.map(perp_symbol);
        let positions = account
            .client()
            .get_futures_positions()
            .await
            .with_context(|| format!("failed to fetch positions on {}", account.id))?;
        let positions: Vec<&PositionSnapshot> = positions
            .iter()
            .filter(|p| filter_symbol.as_deref().map_or(true, |s| p.symbol == s))
            .collect();
        if positions.is_empty() {
            notify_quiet(
                Severity::Info,
                format!("No positions found on {}", account.id),
            );
            return Ok(false);
        }

        for position in positions {
            let token = crate::exchange::token_of(&position.symbol);
            let side = if position.net_quantity < Decimal::ZERO {
                OrderSide::Bid
            } else {
                OrderSide::Ask
            };
            let decimals = self.executor.decimals_for(token)?;
            let amount = round_to_decimals(
                position.net_exposure_quantity.abs(),
                decimals.amount,
            );
            if amount == Decimal::ZERO {
                notify(
                    Severity::Warning,
                    format!("Zero position amount for {} on {}", position.symbol, account.id),
                );
                continue;
            }
            self.executor
                .place_order(account, token, side, OrderSizing::Quantity(amount), None, true)
                .await
                .with_context(|| format!("closing {} on {}", position.symbol, account.id))?;
        }
        Ok(true)
    }

    /// Closes positions across accounts in random order with randomized
    /// delays. Returns false when any account failed to close.
    pub async fn close_all(&self, accounts: &[AccountHandle], token: Option<&str>) -> bool {
        let mut shuffled = accounts.to_vec();
        {
            let mut rng = rand::thread_rng();
            shuffled.shuffle(&mut rng);
        }
        let mut all_closed = true;
        let last_index = shuffled.len().saturating_sub(1);
        for (i, account) in shuffled.iter().enumerate() {
            let label = token.map(|t| format!("{} ", t)).unwrap_or_default();
            log::debug!("[CLOSE] Closing all {}positions on {}", label, account.id);
            let attempted = match self.close_positions(account, token).await {
                Ok(closed) => closed,
                Err(err) => {
                    notify(Severity::Error, format!("Error closing positions: {:#}", err));
                    all_closed = false;
                    true
                }
            };
            if attempted && i < last_index {
                let delay = sample_delay(self.cfg.order_delay_secs);
                notify_quiet(
                    Severity::Info,
                    format!(
                        "Sleeping {:.2}s before closing next account...",
                        delay.as_secs_f64()
                    ),
                );
                sleep(delay).await;
            }
        }
        if all_closed {
            notify(Severity::Success, "Closed all positions on selected accounts");
        }
        all_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testkit::{position, MockExchange};
    use crate::exchange::{ExchangeClient, InstrumentDecimals};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn test_cfg() -> Arc<BotConfig> {
        let mut cfg = BotConfig::from_env_or_yaml().unwrap();
        cfg.order_delay_secs = [0.0, 0.0];
        cfg.volume.max_hold_secs = [0.0, 0.0];
        cfg.volume.max_pnl_pct = [0.0, 0.0];
        Arc::new(cfg)
    }

    fn decimals() -> HashMap<String, InstrumentDecimals> {
        HashMap::from([
            (
                "BTC".to_string(),
                InstrumentDecimals {
                    amount: 3,
                    price: 1,
                    tick_size: 2,
                },
            ),
            (
                "ETH".to_string(),
                InstrumentDecimals {
                    amount: 2,
                    price: 2,
                    tick_size: 2,
                },
            ),
        ])
    }

    fn manager(retry_limit: u32) -> GroupManager {
        GroupManager::new(
            Arc::new(OrderExecutor::new(decimals(), retry_limit)),
            test_cfg(),
        )
    }

    #[test]
    fn hedge_sizes_always_sum_to_the_total() {
        for num_accounts in 1..=6 {
            for variation in [0.0, 0.1, 0.5, 0.9] {
                let total = dec!(137.41);
                let sizes = split_hedge_sizes(total, num_accounts, variation);
                assert_eq!(sizes.len(), num_accounts);
                let sum: Decimal = sizes.iter().copied().sum();
                assert_eq!(sum, total, "n={} variation={}", num_accounts, variation);
            }
        }
    }

    #[test]
    fn zero_variation_splits_equally() {
        let sizes = split_hedge_sizes(dec!(100), 2, 0.0);
        assert_eq!(sizes, vec![dec!(50), dec!(50)]);
    }

    #[test]
    fn pnl_percent_is_leverage_adjusted() {
        let mut p = position("BTC_USDC_PERP", dec!(1), dec!(1000));
        p.pnl_unrealized = dec!(50);
        assert_eq!(pnl_percent(&p, 10), 50.0);
        assert_eq!(pnl_percent(&p, 0), 0.0);
    }

    #[tokio::test]
    async fn primary_failure_submits_no_hedge_orders() {
        let primary_mock = Arc::new(MockExchange::new());
        primary_mock.set_price("BTC", dec!(100));
        primary_mock.push_order_result(Ok(MockExchange::rejected_ack("no margin")));
        let hedge_mock = Arc::new(MockExchange::new());
        hedge_mock.set_price("BTC", dec!(100));

        let primary =
            AccountHandle::for_tests("main", primary_mock.clone() as Arc<dyn ExchangeClient>);
        let hedge = AccountHandle::for_tests("h1", hedge_mock.clone() as Arc<dyn ExchangeClient>);

        let manager = manager(0);
        let params = GroupOpenParams {
            leverage: 10,
            primary_size: dec!(100),
            hedge_sizes: vec![dec!(50), dec!(50)],
            primary_side: OrderSide::Bid,
        };
        let opened = manager.open_group(&primary, &[hedge.clone()], "BTC", &params).await;
        assert!(!opened);
        assert_eq!(hedge_mock.order_count(), 0);
        assert_eq!(primary_mock.order_count(), 0);
    }

    #[tokio::test]
    async fn closing_inverts_the_net_exposure_sign() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        mock.push_positions(vec![position("BTC_USDC_PERP", dec!(-0.5), dec!(50))]);
        let account = AccountHandle::for_tests("acc", mock.clone() as Arc<dyn ExchangeClient>);

        let manager = manager(0);
        let closed = manager.close_positions(&account, None).await.unwrap();
        assert!(closed);

        let orders = mock.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Bid);
        assert_eq!(orders[0].quantity, Some(dec!(0.5)));
    }

    #[tokio::test]
    async fn zero_sized_residuals_are_skipped() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        // 0.0004 truncates to zero at 3 amount decimals.
        mock.push_positions(vec![position("BTC_USDC_PERP", dec!(0.0004), dec!(0.04))]);
        let account = AccountHandle::for_tests("acc", mock.clone() as Arc<dyn ExchangeClient>);

        let manager = manager(0);
        manager.close_positions(&account, None).await.unwrap();
        assert_eq!(mock.order_count(), 0);
    }

    #[tokio::test]
    async fn token_filter_restricts_closing() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC", dec!(100));
        mock.set_price("ETH", dec!(10));
        mock.push_positions(vec![
            position("BTC_USDC_PERP", dec!(1), dec!(100)),
            position("ETH_USDC_PERP", dec!(2), dec!(20)),
        ]);
        let account = AccountHandle::for_tests("acc", mock.clone() as Arc<dyn ExchangeClient>);

        let manager = manager(0);
        manager.close_positions(&account, Some("ETH")).await.unwrap();
        let orders = mock.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].symbol, "ETH_USDC_PERP");
    }
}
