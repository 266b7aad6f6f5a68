use anyhow::{anyhow, Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::accounts::AccountPair;
use crate::config::sample_f;
use crate::exchange::QUOTE_SYMBOL;
use crate::executor::round_to_decimals;
use crate::funding::LiquiditySource;
use crate::notify::{notify, Severity};

/// Margin requirements are padded by 5% before any comparison.
const MARGIN_SAFETY_FACTOR: f64 = 1.05;
/// Transfers below this are treated as dust and skipped.
const DUST_THRESHOLD: f64 = 0.005;
const TRANSFER_SETTLE_SECS: u64 = 3;
const DEPOSIT_POLL_ATTEMPTS: u32 = 60;
const DEPOSIT_POLL_INTERVAL_SECS: u64 = 5;
/// Bound on the full verify-adjust-reverify cycles.
const VERIFY_PASSES: u32 = 3;
const SWEEP_RETRY_LIMIT: u32 = 20;

/// Margin could not be sourced from the sub-account or the external
/// liquidity fallback.
#[derive(Debug)]
pub struct InsufficientLiquidity {
    pub account_id: String,
    pub required: Decimal,
    pub available: Decimal,
}

impl fmt::Display for InsufficientLiquidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot source margin for {}: {:.5}/{:.5} USDC",
            self.account_id, self.available, self.required
        )
    }
}

impl Error for InsufficientLiquidity {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Swept,
    NothingToSweep,
}

/// Shrink policy for failed sweep transfers: back off a little, never below
/// the baseline 99% fraction.
fn reduced_fraction(fraction: Decimal) -> Decimal {
    (fraction - dec!(0.0005)).max(dec!(0.99))
}

pub struct CollateralBalancer {
    funder: Option<Arc<dyn LiquiditySource>>,
}

impl CollateralBalancer {
    pub fn new(funder: Option<Arc<dyn LiquiditySource>>) -> Self {
        Self { funder }
    }

    /// Makes sure the pair's main account holds at least `required_margin`
    /// (+5%) of net equity, pulling from the sub-account and falling back to
    /// the external liquidity source when the sub runs dry. A surplus main
    /// balance is swept back to the sub on the way.
    pub async fn ensure_margin(&self, pair: &AccountPair, required_margin: Decimal) -> Result<()> {
        let required = required_margin * Decimal::from_f64(MARGIN_SAFETY_FACTOR).unwrap_or(Decimal::ONE);
        let dust = Decimal::from_f64(DUST_THRESHOLD).unwrap_or_default();

        for _pass in 0..VERIFY_PASSES {
            let sheet = fetch_balances(&pair.main).await?;
            let mut net_equity = sheet.net_equity_available;
            let spendable = sheet.available_of(QUOTE_SYMBOL);

            if net_equity >= required {
                if spendable > Decimal::ZERO {
                    self.sweep_surplus(pair, required, net_equity, spendable, dust)
                        .await?;
                }
                return Ok(());
            }

            // Deficit: pull from the sub-account while it has anything left.
            loop {
                let sub_balance = fetch_balances(&pair.sub).await?.total_of(QUOTE_SYMBOL);
                if sub_balance <= dec!(0.0001) {
                    break;
                }
                let deficit = (required - net_equity) * dec!(1.01);
                let amount = round_to_decimals(deficit.min(sub_balance), 5);
                if amount <= dust {
                    break;
                }
                let main_address = pair.main.deposit_address().await?.clone();
                pair.sub
                    .client()
                    .withdraw(&main_address, amount, QUOTE_SYMBOL)
                    .await
                    .with_context(|| format!("transfer from {} failed", pair.sub.id))?;
                notify(
                    Severity::Success,
                    format!(
                        "Moved {} USDC from {} to {}",
                        amount, pair.sub.id, pair.main.id
                    ),
                );
                sleep(Duration::from_secs(TRANSFER_SETTLE_SECS)).await;
                net_equity = fetch_balances(&pair.main).await?.net_equity_available;
                if net_equity >= required {
                    break;
                }
            }
            if net_equity >= required {
                return Ok(());
            }

            // Sub exhausted: request an external deposit and wait for it.
            let Some(funder) = &self.funder else {
                return Err(anyhow!(InsufficientLiquidity {
                    account_id: pair.id().to_string(),
                    required,
                    available: net_equity,
                }));
            };
            log::debug!(
                "[MARGIN] {} under-funded ({:.5}/{:.5} USDC); requesting external deposit",
                pair.id(),
                net_equity,
                required
            );
            let top_up = ((required - net_equity) * dec!(1.1))
                .max(Decimal::from_f64(sample_f([1.05, 2.0])).unwrap_or(Decimal::ONE));
            let main_address = pair.main.deposit_address().await?.clone();
            funder
                .request_withdrawal(&main_address, top_up)
                .await
                .with_context(|| format!("external deposit for {} failed", pair.id()))?;

            let mut landed = false;
            for _ in 0..DEPOSIT_POLL_ATTEMPTS {
                sleep(Duration::from_secs(DEPOSIT_POLL_INTERVAL_SECS)).await;
                let balance = fetch_balances(&pair.main).await?.net_equity_available;
                if balance > net_equity {
                    notify(
                        Severity::Success,
                        format!(
                            "USDC deposit received on {}, new balance: {:.5} USDC",
                            pair.id(),
                            balance
                        ),
                    );
                    landed = true;
                    break;
                }
            }
            if !landed {
                return Err(anyhow!(InsufficientLiquidity {
                    account_id: pair.id().to_string(),
                    required,
                    available: net_equity,
                }));
            }
            // Deposit landed; rerun the verify pass from the top.
        }

        Err(anyhow!(InsufficientLiquidity {
            account_id: pair.id().to_string(),
            required,
            available: Decimal::ZERO,
        }))
    }

    async fn sweep_surplus(
        &self,
        pair: &AccountPair,
        required: Decimal,
        net_equity: Decimal,
        spendable: Decimal,
        dust: Decimal,
    ) -> Result<()> {
        let buffer = Decimal::from_f64(sample_f([0.001, 0.01])).unwrap_or_default();
        let excess = if net_equity - spendable > required {
            round_to_decimals(spendable - buffer, 5)
        } else {
            round_to_decimals(spendable - required, 5)
        };
        let cap = round_to_decimals(
            pair.main
                .client()
                .get_transferable_amount(QUOTE_SYMBOL)
                .await
                .with_context(|| format!("failed to fetch transferable amount on {}", pair.id()))?
                * dec!(0.95),
            3,
        );
        let excess = excess.min(cap);
        if excess <= dust {
            return Ok(());
        }
        let sub_address = pair.sub.deposit_address().await?.clone();
        pair.main
            .client()
            .withdraw(&sub_address, excess, QUOTE_SYMBOL)
            .await
            .with_context(|| format!("transfer from {} failed", pair.id()))?;
        notify(
            Severity::Success,
            format!(
                "Swept {} USDC from {} back to {}",
                excess, pair.main.id, pair.sub.id
            ),
        );
        sleep(Duration::from_secs(TRANSFER_SETTLE_SECS)).await;
        Ok(())
    }

    /// Moves `fraction` of the main account's transferable USDC to the sub.
    /// Transient transfer failures shrink the fraction a bounded number of
    /// times before giving up.
    pub async fn sweep_excess(
        &self,
        pair: &AccountPair,
        fraction: Decimal,
    ) -> Result<SweepOutcome> {
        let mut fraction = fraction;
        let mut last_error: Option<anyhow::Error> = None;

        for _attempt in 0..SWEEP_RETRY_LIMIT {
            let transferable = pair
                .main
                .client()
                .get_transferable_amount(QUOTE_SYMBOL)
                .await
                .with_context(|| format!("failed to fetch transferable amount on {}", pair.id()))?;
            let amount = round_to_decimals(transferable * fraction, 6);
            if amount <= Decimal::ZERO {
                notify(
                    Severity::Warning,
                    format!("No available balance for transfer on {}", pair.id()),
                );
                return Ok(SweepOutcome::NothingToSweep);
            }
            let sub_address = pair.sub.deposit_address().await?.clone();
            match pair
                .main
                .client()
                .withdraw(&sub_address, amount, QUOTE_SYMBOL)
                .await
            {
                Ok(()) => {
                    notify(
                        Severity::Success,
                        format!(
                            "Withdrew free balance ({} USDC) from {} to {}",
                            amount, pair.main.id, pair.sub.id
                        ),
                    );
                    sleep(Duration::from_secs(TRANSFER_SETTLE_SECS)).await;
                    return Ok(SweepOutcome::Swept);
                }
                Err(err) if fraction > dec!(0.99) => {
                    notify(
                        Severity::Warning,
                        format!(
                            "Failed to withdraw {} USDC on {}: {}. Reducing amount a bit",
                            amount,
                            pair.id(),
                            err
                        ),
                    );
                    fraction = reduced_fraction(fraction);
                    last_error = Some(err.into());
                }
                Err(err) => {
                    notify(
                        Severity::Warning,
                        format!("Failed to withdraw {} USDC on {}: {}", amount, pair.id(), err),
                    );
                    return Err(err.into());
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("sweep retries exhausted on {}", pair.id())))
    }

    /// Covers the main account's outstanding borrow from the sub-account,
    /// for when the exchange reports an account-wide liquidation.
    pub async fn cover_borrow(&self, pair: &AccountPair) -> bool {
        let result: Result<()> = async {
            let borrow = pair
                .main
                .client()
                .get_borrow_amount()
                .await
                .with_context(|| format!("failed to fetch borrow on {}", pair.id()))?
                + Decimal::ONE;
            if borrow > Decimal::ZERO {
                let main_address = pair.main.deposit_address().await?.clone();
                pair.sub
                    .client()
                    .withdraw(&main_address, borrow, QUOTE_SYMBOL)
                    .await
                    .with_context(|| format!("borrow cover transfer failed on {}", pair.id()))?;
                notify(
                    Severity::Success,
                    format!(
                        "Moved {} USDC from {} to {} to cover borrows",
                        borrow, pair.sub.id, pair.main.id
                    ),
                );
                sleep(Duration::from_secs(TRANSFER_SETTLE_SECS)).await;
            } else {
                notify(
                    Severity::Warning,
                    format!("No borrows found on {}", pair.id()),
                );
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                notify(
                    Severity::Warning,
                    format!("Failed to cover borrows on {}: {:#}", pair.id(), err),
                );
                false
            }
        }
    }
}

async fn fetch_balances(handle: &crate::accounts::AccountHandle) -> Result<crate::exchange::BalanceSheet> {
    handle
        .client()
        .get_balances()
        .await
        .with_context(|| format!("failed to fetch balances for {}", handle.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testkit::MockExchange;
    use crate::exchange::{BalanceSheet, ExchangeClient, ExchangeError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn sheet(net_equity: Decimal, available_usdc: Decimal) -> BalanceSheet {
        BalanceSheet {
            net_equity_available: net_equity,
            available: HashMap::from([(QUOTE_SYMBOL.to_string(), available_usdc)]),
            total: HashMap::from([(QUOTE_SYMBOL.to_string(), available_usdc)]),
        }
    }

    fn sub_with_balance(balance: Decimal) -> Arc<MockExchange> {
        let sub = Arc::new(MockExchange::new());
        sub.push_balances(sheet(balance, balance));
        sub
    }

    struct RecordingFunder {
        calls: Mutex<Vec<(String, Decimal)>>,
    }

    #[async_trait]
    impl LiquiditySource for RecordingFunder {
        async fn request_withdrawal(&self, address: &str, amount: Decimal) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((address.to_string(), amount));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deficit_pulls_once_from_sub_and_reverifies() {
        let main = Arc::new(MockExchange::new());
        main.push_balances(sheet(dec!(5), dec!(0)));
        main.push_balances(sheet(dec!(10.6), dec!(0)));
        let sub = sub_with_balance(dec!(20));

        let pair = AccountPair::for_tests(
            "acc",
            main.clone() as Arc<dyn ExchangeClient>,
            sub.clone() as Arc<dyn ExchangeClient>,
        );
        let balancer = CollateralBalancer::new(None);
        balancer.ensure_margin(&pair, dec!(10)).await.unwrap();

        let transfers = sub.withdrawals.lock().unwrap();
        assert_eq!(transfers.len(), 1);
        assert!(transfers[0].1 <= dec!(20));
        // (10.5 - 5) * 1.01
        assert_eq!(transfers[0].1, dec!(5.555));
    }

    #[tokio::test(start_paused = true)]
    async fn surplus_sweeps_back_to_sub_capped_by_transferable() {
        let main = Arc::new(MockExchange::new());
        main.push_balances(sheet(dec!(100), dec!(60)));
        main.push_transferable(dec!(50));
        let sub = Arc::new(MockExchange::new());

        let pair = AccountPair::for_tests(
            "acc",
            main.clone() as Arc<dyn ExchangeClient>,
            sub as Arc<dyn ExchangeClient>,
        );
        let balancer = CollateralBalancer::new(None);
        balancer.ensure_margin(&pair, dec!(10)).await.unwrap();

        let transfers = main.withdrawals.lock().unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].1, dec!(47.5));
    }

    #[tokio::test]
    async fn exhausted_sub_without_fallback_is_insufficient_liquidity() {
        let main = Arc::new(MockExchange::new());
        main.push_balances(sheet(dec!(5), dec!(0)));
        let sub = sub_with_balance(dec!(0));

        let pair = AccountPair::for_tests(
            "acc",
            main as Arc<dyn ExchangeClient>,
            sub as Arc<dyn ExchangeClient>,
        );
        let balancer = CollateralBalancer::new(None);
        let err = balancer.ensure_margin(&pair, dec!(10)).await.unwrap_err();
        assert!(err.downcast_ref::<InsufficientLiquidity>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn external_fallback_tops_up_the_residual_deficit() {
        let main = Arc::new(MockExchange::new());
        main.push_balances(sheet(dec!(5), dec!(0)));
        main.push_balances(sheet(dec!(20), dec!(0)));
        let sub = sub_with_balance(dec!(0));
        let funder = Arc::new(RecordingFunder {
            calls: Mutex::new(Vec::new()),
        });

        let pair = AccountPair::for_tests(
            "acc",
            main as Arc<dyn ExchangeClient>,
            sub as Arc<dyn ExchangeClient>,
        );
        let balancer = CollateralBalancer::new(Some(funder.clone()));
        balancer.ensure_margin(&pair, dec!(10)).await.unwrap();

        let calls = funder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        // At least the residual deficit plus margin: (10.5 - 5) * 1.1.
        assert!(calls[0].1 >= dec!(6.05));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_excess_reports_nothing_on_zero_balance() {
        let main = Arc::new(MockExchange::new());
        main.push_transferable(dec!(0));
        let sub = Arc::new(MockExchange::new());
        let pair = AccountPair::for_tests(
            "acc",
            main as Arc<dyn ExchangeClient>,
            sub as Arc<dyn ExchangeClient>,
        );
        let balancer = CollateralBalancer::new(None);
        let outcome = balancer.sweep_excess(&pair, dec!(0.99)).await.unwrap();
        assert_eq!(outcome, SweepOutcome::NothingToSweep);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_excess_shrinks_the_fraction_after_a_failure() {
        let main = Arc::new(MockExchange::new());
        main.push_transferable(dec!(100));
        main.push_transferable(dec!(100));
        main.withdraw_results
            .lock()
            .unwrap()
            .push_back(Err(ExchangeError::Rejected("busy".to_string())));
        let sub = Arc::new(MockExchange::new());
        let pair = AccountPair::for_tests(
            "acc",
            main.clone() as Arc<dyn ExchangeClient>,
            sub as Arc<dyn ExchangeClient>,
        );

        let balancer = CollateralBalancer::new(None);
        let outcome = balancer.sweep_excess(&pair, dec!(1)).await.unwrap();
        assert_eq!(outcome, SweepOutcome::Swept);

        let transfers = main.withdrawals.lock().unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].1, dec!(99.95));
    }

    #[test]
    fn shrink_policy_never_drops_below_the_baseline() {
        let mut fraction = dec!(1);
        for _ in 0..100 {
            fraction = reduced_fraction(fraction);
        }
        assert_eq!(fraction, dec!(0.99));
    }
}
