//! Per-account liquidation farming: each worker holds a handful of
//! single-direction positions on one account, replaces liquidated tokens,
//! and recycles realized gains back into exposure.

use anyhow::{bail, Result};
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};

use super::{token_leverage, LIQUIDATION_LEVERAGE};
use crate::accounts::AccountPair;
use crate::balancer::CollateralBalancer;
use crate::config::{sample_delay, sample_f, sample_u, BotConfig};
use crate::exchange::{token_of, OrderSide};
use crate::executor::{is_account_liquidation_error, OrderExecutor, OrderSizing};
use crate::group::{pnl_percent, GroupManager};
use crate::notify::{notify, notify_quiet, Severity};
use crate::pool::AccountPool;
use crate::quota::{current_epoch_start, EligibilityProfile, QuotaTracker};
use crate::stats;

const WORKER_POLL_SECS: u64 = 5;
const SHUTDOWN_GRACE_SECS: u64 = 30;
const REINVEST_SWEEP_FRACTION: Decimal = dec!(0.99);

#[derive(Debug, Clone, PartialEq)]
pub enum TokenAction {
    Hold,
    /// Close and reopen the position to reset its basis.
    Reopen,
    /// Scale exposure up using realized gains (margin USDC).
    Reinvest { gain_usdc: f64 },
}

/// Pure per-token decision from one observed PnL sample. Thresholds of zero
/// disable the corresponding action; reopen wins over reinvest.
pub fn decide_token_action(
    pnl_pct: f64,
    last_reinvest_pnl: f64,
    reopen_pct: f64,
    reinvest_pct: f64,
    position_value: f64,
    leverage: u32,
) -> TokenAction {
    if reopen_pct != 0.0 && pnl_pct >= reopen_pct {
        return TokenAction::Reopen;
    }
    if reinvest_pct != 0.0
        && pnl_pct >= reinvest_pct
        && pnl_pct >= last_reinvest_pnl + reinvest_pct
    {
        let gained_pct = pnl_pct - last_reinvest_pnl;
        let gain_usdc = gained_pct / (100.0 * leverage as f64) * position_value;
        return TokenAction::Reinvest { gain_usdc };
    }
    TokenAction::Hold
}

#[derive(Debug, Default)]
struct TradingState {
    direction: Option<OrderSide>,
    tokens: Vec<String>,
    last_reinvest_pnl: HashMap<String, f64>,
}

fn remaining_universe(universe: &[String], held: &[String]) -> Vec<String> {
    universe
        .iter()
        .filter(|token| !held.contains(token))
        .cloned()
        .collect()
}

struct AccountWorker {
    pair: AccountPair,
    label: String,
    state: TradingState,
    group: Arc<GroupManager>,
    executor: Arc<OrderExecutor>,
    balancer: Arc<CollateralBalancer>,
    pool: Arc<AccountPool>,
    quota: Arc<QuotaTracker>,
    cfg: Arc<BotConfig>,
    active: Arc<Mutex<HashMap<String, AccountPair>>>,
}

impl AccountWorker {
    /// Worker task body. Always force-closes remaining exposure and returns
    /// the account to the pool on the way out.
    async fn run(mut self) {
        if let Err(err) = self.trade().await {
            notify(
                Severity::Error,
                format!("{} | Account management error: {:#}", self.label, err),
            );
        }
        self.active.lock().await.remove(self.pair.id());
        self.group.close_all(&[self.pair.main.clone()], None).await;
        self.pool.release(self.pair.clone()).await;
    }

    async fn trade(&mut self) -> Result<()> {
        let cfg = Arc::clone(&self.cfg);
        let mt_cfg = &cfg.multi_token;

        let num_positions = sample_u(mt_cfg.positions_per_account).max(1);
        let direction = if rand::thread_rng().gen_bool(0.5) {
            OrderSide::Bid
        } else {
            OrderSide::Ask
        };
        self.state.direction = Some(direction);
        notify(
            Severity::Info,
            format!(
                "{} | Initializing {} {} positions",
                self.label,
                num_positions,
                direction.direction_label().to_lowercase()
            ),
        );

        let mut opened = 0;
        while opened < num_positions {
            match self.try_open_position(None, None).await {
                Some(_) => {
                    opened += 1;
                    if opened < num_positions {
                        let delay = sample_delay(cfg.order_delay_secs);
                        notify_quiet(
                            Severity::Info,
                            format!(
                                "{} | Sleeping {:.2}s before next position...",
                                self.label,
                                delay.as_secs_f64()
                            ),
                        );
                        sleep(delay).await;
                    }
                }
                None => break,
            }
        }
        if self.state.tokens.is_empty() {
            bail!("failed to open any positions");
        }
        notify(
            Severity::Info,
            format!(
                "{} | Started monitoring {} positions",
                self.label,
                self.state.tokens.len()
            ),
        );
        self.active
            .lock()
            .await
            .insert(self.pair.id().to_string(), self.pair.clone());

        while !self.state.tokens.is_empty() {
            let positions = self.pair.main.client().get_futures_positions().await?;
            let current: HashMap<String, crate::exchange::PositionSnapshot> = positions
                .into_iter()
                .map(|p| (token_of(&p.symbol).to_string(), p))
                .collect();

            // Tokens that vanished from the account were liquidated.
            for token in self.state.tokens.clone() {
                if !current.contains_key(&token) && !self.handle_liquidation(&token, true).await {
                    return Ok(());
                }
            }

            for (token, position) in &current {
                if !self.state.tokens.contains(token) {
                    continue;
                }
                let leverage = token_leverage(token);
                let pnl_pct = pnl_percent(position, leverage);
                let position_value = position.net_exposure_notional.abs().to_f64().unwrap_or(0.0);
                let last = self
                    .state
                    .last_reinvest_pnl
                    .get(token)
                    .copied()
                    .unwrap_or(0.0);
                match decide_token_action(
                    pnl_pct,
                    last,
                    mt_cfg.reopen_pnl_pct,
                    mt_cfg.reinvest_pnl_pct,
                    position_value,
                    leverage,
                ) {
                    TokenAction::Hold => {}
                    TokenAction::Reopen => {
                        notify(
                            Severity::Info,
                            format!(
                                "{} | Position {} reached reopen threshold ({:.2}%), reopening...",
                                self.label, token, pnl_pct
                            ),
                        );
                        if let Err(err) = self
                            .group
                            .close_positions(&self.pair.main, Some(token.as_str()))
                            .await
                        {
                            notify(
                                Severity::Warning,
                                format!("{} | Failed to close {}: {:#}", self.label, token, err),
                            );
                        }
                        if !self.handle_liquidation(token, false).await {
                            return Ok(());
                        }
                    }
                    TokenAction::Reinvest { gain_usdc } => {
                        self.reinvest(token, gain_usdc, pnl_pct).await;
                    }
                }
            }

            sleep(Duration::from_secs(WORKER_POLL_SECS)).await;
        }
        Ok(())
    }

    /// Opens one position on a random token from the remaining universe.
    /// Returns the token on success; `None` once tokens and retries run out.
    async fn try_open_position(
        &mut self,
        universe_override: Option<Vec<String>>,
        fixed_size: Option<Decimal>,
    ) -> Option<String> {
        let cfg = Arc::clone(&self.cfg);
        let mt_cfg = &cfg.multi_token;
        let direction = self.state.direction.unwrap_or(OrderSide::Bid);
        let mut available = universe_override
            .unwrap_or_else(|| remaining_universe(&mt_cfg.tokens, &self.state.tokens));
        let mut retries = cfg.retry_limit.max(1);

        let size = fixed_size.unwrap_or_else(|| {
            (Decimal::from_f64(sample_f(mt_cfg.position_margin)).unwrap_or(Decimal::ONE)
                * Decimal::from(LIQUIDATION_LEVERAGE))
            .round_dp(2)
        });
        let margin = size / Decimal::from(LIQUIDATION_LEVERAGE);

        while retries > 0 && !available.is_empty() {
            let index = rand::thread_rng().gen_range(0..available.len());
            let token = available.remove(index);

            if let Err(err) = self.balancer.ensure_margin(&self.pair, margin).await {
                notify(
                    Severity::Warning,
                    format!(
                        "{} | Failed to adjust balance for {}: {:#}",
                        self.label, token, err
                    ),
                );
                continue;
            }

            match self
                .executor
                .place_order(
                    &self.pair.main,
                    &token,
                    direction,
                    OrderSizing::Quote(size),
                    Some(LIQUIDATION_LEVERAGE),
                    false,
                )
                .await
            {
                Ok(_) => {
                    self.state.tokens.push(token.clone());
                    return Some(token);
                }
                Err(err) => {
                    notify(
                        Severity::Warning,
                        format!(
                            "{} | Failed to open position for {}: {:#}",
                            self.label, token, err
                        ),
                    );
                    if is_account_liquidation_error(&err) {
                        self.balancer.cover_borrow(&self.pair).await;
                        available =
                            remaining_universe(&mt_cfg.tokens, &self.state.tokens);
                        retries -= 1;
                        continue;
                    }
                    if available.is_empty() && retries > 1 {
                        available =
                            remaining_universe(&mt_cfg.tokens, &self.state.tokens);
                        retries -= 1;
                        notify(
                            Severity::Info,
                            format!(
                                "{} | Retrying with remaining tokens, attempts left: {}",
                                self.label, retries
                            ),
                        );
                    }
                }
            }
        }
        None
    }

    /// Drops a liquidated token and tries to open a replacement, subject to
    /// the account's current quota standing. Returns whether the worker
    /// should keep running.
    async fn handle_liquidation(&mut self, token: &str, log: bool) -> bool {
        if log {
            notify(
                Severity::Debug,
                format!("{} | Handling liquidation on {}", self.label, token),
            );
        }
        self.state.tokens.retain(|held| held != token);

        match self.check_account_limits().await {
            Ok(true) => {}
            Ok(false) => {
                notify(
                    Severity::Warning,
                    format!(
                        "{} | Account limits exceeded or not enough funds, opening new position skipped...",
                        self.label
                    ),
                );
                return !self.state.tokens.is_empty();
            }
            Err(err) => {
                notify(
                    Severity::Error,
                    format!("{} | Failed to handle liquidation: {:#}", self.label, err),
                );
                return false;
            }
        }

        let universe = self.cfg.multi_token.tokens.clone();
        if remaining_universe(&universe, &self.state.tokens).is_empty() {
            notify(
                Severity::Warning,
                format!("{} | No more tokens available for trading", self.label),
            );
            return !self.state.tokens.is_empty();
        }

        let opened = self.try_open_position(None, None).await;
        opened.is_some() || !self.state.tokens.is_empty()
    }

    async fn check_account_limits(&self) -> Result<bool> {
        let week_start = current_epoch_start(Utc::now());
        let targets = [(self.pair.main.clone(), Some(self.pair.sub.clone()))];
        let data = stats::collect_many(&targets, week_start).await?;
        Ok(data
            .first()
            .map(|entry| self.quota.is_eligible(entry, &EligibilityProfile::Liquidation))
            .unwrap_or(false))
    }

    /// Scales the token's exposure with realized gains; falls back to
    /// sweeping the excess balance to the sub-account when the order fails.
    async fn reinvest(&mut self, token: &str, gain_usdc: f64, current_pnl: f64) {
        log::debug!(
            "[WORKER] {} reinvesting {:.4} USDC on {}",
            self.label,
            gain_usdc,
            token
        );
        let leverage = token_leverage(token);
        let amount = Decimal::from_f64(gain_usdc * leverage as f64).unwrap_or(Decimal::ZERO);
        if amount <= Decimal::ZERO {
            return;
        }
        let direction = self.state.direction.unwrap_or(OrderSide::Bid);
        match self
            .executor
            .place_order(
                &self.pair.main,
                token,
                direction,
                OrderSizing::Quote(amount),
                Some(LIQUIDATION_LEVERAGE),
                false,
            )
            .await
        {
            Ok(_) => {
                self.state
                    .last_reinvest_pnl
                    .insert(token.to_string(), current_pnl);
            }
            Err(err) => {
                notify(
                    Severity::Warning,
                    format!(
                        "{} | Failed to reinvest profit: {:#}. Trying to withdraw excess USDC...",
                        self.label, err
                    ),
                );
                match self
                    .balancer
                    .sweep_excess(&self.pair, REINVEST_SWEEP_FRACTION)
                    .await
                {
                    Ok(_) => {
                        self.state
                            .last_reinvest_pnl
                            .insert(token.to_string(), current_pnl);
                    }
                    Err(err) => {
                        notify(
                            Severity::Warning,
                            format!("{} | Excess sweep failed: {:#}", self.label, err),
                        );
                    }
                }
            }
        }
    }
}

pub struct MultiTokenOrchestrator {
    pool: Arc<AccountPool>,
    group: Arc<GroupManager>,
    executor: Arc<OrderExecutor>,
    balancer: Arc<CollateralBalancer>,
    quota: Arc<QuotaTracker>,
    cfg: Arc<BotConfig>,
    active: Arc<Mutex<HashMap<String, AccountPair>>>,
}

impl MultiTokenOrchestrator {
    pub fn new(
        pool: Arc<AccountPool>,
        group: Arc<GroupManager>,
        executor: Arc<OrderExecutor>,
        balancer: Arc<CollateralBalancer>,
        quota: Arc<QuotaTracker>,
        cfg: Arc<BotConfig>,
    ) -> Self {
        Self {
            pool,
            group,
            executor,
            balancer,
            quota,
            cfg,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Keeps a fixed number of worker slots filled while accounts remain;
    /// on shutdown waits a bounded grace period, then force-closes whatever
    /// exposure is still registered.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let parallel = sample_u(self.cfg.multi_token.parallel_accounts).max(1) as usize;
        notify(Severity::Info, format!("Starting {} parallel accounts", parallel));

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            while tasks.len() < parallel {
                if !self.start_worker(&mut tasks).await? {
                    break;
                }
            }
            if tasks.is_empty() {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    notify(
                        Severity::Info,
                        "Liquidation trading cancelled, closing positions...",
                    );
                    break;
                }
                joined = tasks.join_next() => {
                    if let Some(Err(err)) = joined {
                        log::error!("[WORKER] task failed: {:?}", err);
                    }
                }
            }
        }
        self.shutdown(tasks).await;
        Ok(())
    }

    async fn start_worker(&self, tasks: &mut JoinSet<()>) -> Result<bool> {
        let Some(pair) = self
            .pool
            .checkout_one(&EligibilityProfile::Liquidation)
            .await?
        else {
            notify(Severity::Warning, "No more accounts available for trading");
            return Ok(false);
        };
        let label = pair.id().to_string();
        let worker = AccountWorker {
            pair,
            label,
            state: TradingState::default(),
            group: Arc::clone(&self.group),
            executor: Arc::clone(&self.executor),
            balancer: Arc::clone(&self.balancer),
            pool: Arc::clone(&self.pool),
            quota: Arc::clone(&self.quota),
            cfg: Arc::clone(&self.cfg),
            active: Arc::clone(&self.active),
        };
        tasks.spawn(worker.run());
        sleep(sample_delay(self.cfg.multi_token.account_delay_secs)).await;
        Ok(true)
    }

    async fn shutdown(&self, mut tasks: JoinSet<()>) {
        if !tasks.is_empty() {
            let grace = timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if grace.is_err() {
                notify(
                    Severity::Warning,
                    format!("Shutdown timeout after {}s", SHUTDOWN_GRACE_SECS),
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }
        // Last resort: close whatever the aborted workers left registered.
        let remaining: Vec<AccountPair> = self.active.lock().await.values().cloned().collect();
        for pair in remaining {
            if let Err(err) = self.group.close_positions(&pair.main, None).await {
                notify(
                    Severity::Error,
                    format!("Failed to close leftover exposure on {}: {:#}", pair.id(), err),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_thresholds_disable_both_actions() {
        assert_eq!(
            decide_token_action(1_000.0, 0.0, 0.0, 0.0, 1_000.0, 50),
            TokenAction::Hold
        );
    }

    #[test]
    fn reopen_wins_over_reinvest() {
        assert_eq!(
            decide_token_action(150.0, 0.0, 80.0, 120.0, 1_000.0, 50),
            TokenAction::Reopen
        );
    }

    #[test]
    fn reinvest_requires_advancing_past_the_checkpoint() {
        // First crossing: checkpoint at zero.
        let action = decide_token_action(130.0, 0.0, 0.0, 120.0, 1_000.0, 50);
        let TokenAction::Reinvest { gain_usdc } = action else {
            panic!("expected reinvest, got {:?}", action);
        };
        assert!((gain_usdc - 26.0).abs() < 1e-9);

        // Same PnL again: the checkpoint has moved, no second reinvest.
        assert_eq!(
            decide_token_action(130.0, 130.0, 0.0, 120.0, 1_000.0, 50),
            TokenAction::Hold
        );
        // Needs a full threshold step beyond the checkpoint.
        assert_eq!(
            decide_token_action(249.0, 130.0, 0.0, 120.0, 1_000.0, 50),
            TokenAction::Hold
        );
        assert!(matches!(
            decide_token_action(250.0, 130.0, 0.0, 120.0, 1_000.0, 50),
            TokenAction::Reinvest { .. }
        ));
    }

    #[test]
    fn remaining_universe_excludes_held_tokens() {
        let universe = vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()];
        let held = vec!["ETH".to_string()];
        assert_eq!(remaining_universe(&universe, &held), vec!["BTC", "SOL"]);
    }
}
