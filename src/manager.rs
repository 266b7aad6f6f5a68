use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::accounts::{AccountHandle, AccountPair, AccountStore};
use crate::balancer::{CollateralBalancer, SweepOutcome};
use crate::config::{pick, sample_delay, sample_f, sample_u, BotConfig};
use crate::exchange::OrderSide;
use crate::executor::OrderExecutor;
use crate::funding::{FundingClient, LiquiditySource};
use crate::group::{split_hedge_sizes, GroupManager, GroupOpenParams};
use crate::liquidation::delta_neutral::DeltaNeutralOrchestrator;
use crate::liquidation::multi_token::MultiTokenOrchestrator;
use crate::notify::{notify, notify_quiet, Severity};
use crate::pool::AccountPool;
use crate::quota::{current_epoch_start, EligibilityProfile, QuotaTracker};
use crate::stats::{self, AccountData};

const OPEN_FAILURE_PAUSE_SECS: u64 = 60;

/// Top-level driver: owns the credential store, quota table and the shared
/// execution plumbing, and runs whichever mode was requested.
pub struct TradingManager {
    cfg: Arc<BotConfig>,
    store: AccountStore,
    quota: Arc<QuotaTracker>,
    executor: Arc<OrderExecutor>,
    group: Arc<GroupManager>,
}

impl TradingManager {
    /// Loads accounts and quota records and pulls instrument metadata
    /// through the first account. Any failure here is fatal to the process.
    pub async fn bootstrap(cfg: BotConfig) -> Result<Self> {
        let cfg = Arc::new(cfg);
        let store = AccountStore::load(&cfg.accounts_file)?;
        let handles = store.main_handles(&cfg)?;
        let api_keys: Vec<String> = handles.iter().map(|h| h.api_key.clone()).collect();
        let quota = Arc::new(QuotaTracker::load(
            &cfg.database_dir,
            &api_keys,
            &cfg.quota,
            Utc::now(),
        )?);

        let first = handles
            .first()
            .ok_or_else(|| anyhow!("no accounts loaded"))?;
        let decimals = first
            .client()
            .get_instrument_decimals()
            .await
            .context("failed to fetch instrument decimals")?;

        let executor = Arc::new(OrderExecutor::new(decimals, cfg.retry_limit));
        let group = Arc::new(GroupManager::new(Arc::clone(&executor), Arc::clone(&cfg)));
        Ok(Self {
            cfg,
            store,
            quota,
            executor,
            group,
        })
    }

    /// Organic-volume mode: endless cycles of open-monitor-close hedge
    /// groups over the eligible accounts.
    pub async fn run_volume_mode(&mut self) -> Result<()> {
        let handles = self.store.main_handles(&self.cfg)?;
        if let Err(err) = self.volume_cycle(&handles).await {
            notify(Severity::Error, format!("Error in trading cycle: {:#}", err));
            self.group.close_all(&handles, None).await;
            return Err(err);
        }
        Ok(())
    }

    async fn volume_cycle(&mut self, handles: &[AccountHandle]) -> Result<()> {
        let volume_cfg = self.cfg.volume.clone();
        // Enough margin for half the largest configured group at its lowest
        // leverage, plus slack.
        let min_usdc_balance = Decimal::from_f64(
            volume_cfg.total_position_size[1] / volume_cfg.leverage[0].max(1) as f64 / 2.0 * 1.1,
        )
        .unwrap_or(Decimal::ZERO);
        let profile = EligibilityProfile::Volume { min_usdc_balance };

        loop {
            notify(Severity::Info, "Starting new trading cycle...");
            let data = self.parse_and_record(handles, false).await?;

            let available: Vec<AccountHandle> = handles
                .iter()
                .filter(|handle| {
                    data.iter()
                        .find(|entry| entry.account_id == handle.id)
                        .map(|entry| self.quota.is_eligible(entry, &profile))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            let num_accounts = sample_u(volume_cfg.accounts_in_group).max(2) as usize;

            if available.is_empty() {
                notify(
                    Severity::Error,
                    "No accounts available for trading. All accounts have reached their limits or hold too little USDC.",
                );
                bail!("no eligible accounts left");
            }
            if available.len() < num_accounts {
                let ids: Vec<&str> = available.iter().map(|h| h.id.as_str()).collect();
                notify(
                    Severity::Error,
                    format!(
                        "Not enough accounts available for trading. [{}/{}] Available only: {}",
                        available.len(),
                        num_accounts,
                        ids.join(", ")
                    ),
                );
                bail!("not enough eligible accounts");
            }

            let mut selected = available;
            {
                let mut rng = rand::thread_rng();
                selected.shuffle(&mut rng);
            }
            selected.truncate(num_accounts);
            let primary = selected.remove(0);
            let hedges = selected;

            let token = pick(&volume_cfg.tokens)
                .ok_or_else(|| anyhow!("no tokens configured"))?
                .clone();
            let leverage = sample_u(volume_cfg.leverage).max(1);
            let primary_size = (Decimal::from_f64(sample_f(volume_cfg.total_position_size))
                .unwrap_or(Decimal::ZERO)
                / dec!(2))
            .round_dp(2);
            let variation = sample_f(volume_cfg.size_variation);
            let hedge_sizes = split_hedge_sizes(primary_size, hedges.len(), variation);

            let params = GroupOpenParams {
                leverage,
                primary_size,
                hedge_sizes,
                primary_side: OrderSide::Bid,
            };
            if !self.group.open_group(&primary, &hedges, &token, &params).await {
                notify(Severity::Error, "Failed to open positions.");
                sleep(Duration::from_secs(OPEN_FAILURE_PAUSE_SECS)).await;
                continue;
            }

            self.group.monitor_group(&primary, &hedges, &token).await;

            let pause = sample_delay(self.cfg.cycle_pause_secs);
            notify_quiet(
                Severity::Info,
                format!(
                    "Sleeping {:.2}s before next trading cycle...",
                    pause.as_secs_f64()
                ),
            );
            sleep(pause).await;
        }
    }

    /// Force-closes every open position on every loaded account.
    pub async fn close_all_positions(&self) -> Result<()> {
        let handles = self.store.main_handles(&self.cfg)?;
        self.group.close_all(&handles, None).await;
        Ok(())
    }

    /// Collects balances and statistics for every account and exports them
    /// as CSV, refreshing cached deposit addresses in the store.
    pub async fn parse_accounts(&mut self) -> Result<()> {
        let handles = self.store.main_handles(&self.cfg)?;
        self.parse_and_record(&handles, true).await?;
        notify(Severity::Success, "All account data was successfully parsed");
        Ok(())
    }

    async fn parse_and_record(
        &mut self,
        handles: &[AccountHandle],
        export_csv: bool,
    ) -> Result<Vec<AccountData>> {
        log::debug!("[STATS] parsing account data...");
        let targets: Vec<(AccountHandle, Option<AccountHandle>)> =
            handles.iter().cloned().map(|h| (h, None)).collect();
        let week_start = current_epoch_start(Utc::now());
        let data = stats::collect_many(&targets, week_start).await?;

        let updates: Vec<(String, String)> = data
            .iter()
            .filter_map(|entry| {
                entry
                    .deposit_address
                    .as_ref()
                    .map(|address| (entry.account_id.clone(), address.clone()))
            })
            .collect();
        self.store.record_deposit_addresses(&updates)?;

        if export_csv {
            stats::export_csv(&self.cfg.database_dir, &data)?;
        } else {
            stats::save_snapshot(&self.cfg.database_dir, &data)?;
        }
        Ok(data)
    }

    /// Sweeps the full transferable USDC balance of every main account to
    /// its sub-account, in random order.
    pub async fn withdraw_all_balances(&self) -> Result<()> {
        let mut pairs = self.store.account_pairs(&self.cfg)?;
        {
            let mut rng = rand::thread_rng();
            pairs.shuffle(&mut rng);
        }
        self.prefetch_deposit_addresses(&pairs).await;
        notify(Severity::Info, "Starting withdrawal of all USDC balances...");

        let balancer = CollateralBalancer::new(None);
        let last_index = pairs.len().saturating_sub(1);
        for (i, pair) in pairs.iter().enumerate() {
            notify(Severity::Info, format!("Processing account {}...", pair.id()));
            match balancer.sweep_excess(pair, dec!(1)).await {
                Ok(SweepOutcome::Swept) if i < last_index => {
                    let delay = sample_delay(self.cfg.order_delay_secs);
                    notify_quiet(
                        Severity::Info,
                        format!(
                            "Sleeping {:.2}s before transferring on the next account...",
                            delay.as_secs_f64()
                        ),
                    );
                    sleep(delay).await;
                }
                Ok(_) => {}
                Err(err) => {
                    notify(
                        Severity::Error,
                        format!("Failed to process {}: {:#}", pair.id(), err),
                    );
                }
            }
        }
        notify(Severity::Info, "Finished processing all accounts");
        Ok(())
    }

    pub async fn run_delta_neutral(&self) -> Result<()> {
        let pairs = self.store.account_pairs(&self.cfg)?;
        let all_handles: Vec<AccountHandle> = pairs.iter().map(|p| p.main.clone()).collect();
        self.prefetch_deposit_addresses(&pairs).await;

        let pool = self.build_pool(pairs);
        let balancer = self.build_balancer()?;
        let orchestrator = Arc::new(DeltaNeutralOrchestrator::new(
            pool,
            Arc::clone(&self.group),
            Arc::clone(&self.executor),
            balancer,
            Arc::clone(&self.cfg),
        ));
        if let Err(err) = orchestrator.run().await {
            notify(
                Severity::Error,
                format!("Error in liquidation trading: {:#}", err),
            );
            self.group.close_all(&all_handles, None).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn run_default_liquidations(&self) -> Result<()> {
        let pairs = self.store.account_pairs(&self.cfg)?;
        self.prefetch_deposit_addresses(&pairs).await;

        let pool = self.build_pool(pairs);
        let balancer = self.build_balancer()?;
        let orchestrator = Arc::new(MultiTokenOrchestrator::new(
            pool,
            Arc::clone(&self.group),
            Arc::clone(&self.executor),
            balancer,
            Arc::clone(&self.quota),
            Arc::clone(&self.cfg),
        ));
        orchestrator.run().await
    }

    fn build_pool(&self, pairs: Vec<AccountPair>) -> Arc<AccountPool> {
        Arc::new(AccountPool::new(
            pairs,
            Arc::clone(&self.quota),
            Duration::from_secs(self.cfg.stats_cache_secs),
        ))
    }

    fn build_balancer(&self) -> Result<Arc<CollateralBalancer>> {
        let funder = FundingClient::from_env(&self.cfg.chain)?
            .map(|client| Arc::new(client) as Arc<dyn LiquiditySource>);
        Ok(Arc::new(CollateralBalancer::new(funder)))
    }

    async fn prefetch_deposit_addresses(&self, pairs: &[AccountPair]) {
        for pair in pairs {
            for handle in [&pair.main, &pair.sub] {
                if handle.cached_deposit_address().is_some() {
                    continue;
                }
                if let Err(err) = handle.deposit_address().await {
                    log::warn!(
                        "[ACCOUNTS] failed to fetch deposit address for {}: {}",
                        handle.id,
                        err
                    );
                }
            }
        }
    }
}
