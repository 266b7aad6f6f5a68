//! Hedged-pair liquidation farming: one primary leg offset by one or more
//! hedge legs on separate accounts, all at maximum leverage, monitored until
//! the exchange liquidates one side.

use anyhow::{anyhow, Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::sleep;

use super::LIQUIDATION_LEVERAGE;
use crate::accounts::{AccountHandle, AccountPair};
use crate::balancer::CollateralBalancer;
use crate::config::{pick, sample_f, sample_u, BotConfig};
use crate::exchange::OrderSide;
use crate::executor::{OrderExecutor, OrderSizing};
use crate::group::{fetch_position_notional, split_hedge_sizes, GroupManager, GroupOpenParams};
use crate::notify::{notify, Severity};
use crate::pool::AccountPool;
use crate::quota::EligibilityProfile;

const PAIR_POLL_SECS: u64 = 8;
const SWEEP_PAUSE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegId {
    Primary,
    Hedge(String),
}

/// Pair lifecycle. `PartialLiquidation` narrows polling to one leg until it
/// either fully liquidates or the timeout forces a close.
#[derive(Debug, Clone, PartialEq)]
pub enum PairPhase {
    Active,
    PartialLiquidation { leg: LegId, initial_size: Decimal },
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Quiet,
    PrimaryLiquidated,
    PrimaryShrunk,
    /// Hedge legs found fully liquidated this poll, in scan order.
    HedgesLiquidated(Vec<String>),
    HedgeShrunk(String),
}

/// A position that shrank more than 1% below its recorded size counts as
/// partially liquidated.
fn shrunk(current: Decimal, initial: Decimal) -> bool {
    current < initial * dec!(0.99)
}

/// Pure evaluation of one monitoring poll. The primary is checked first;
/// hedge scanning stops at the first shrunk leg.
pub fn evaluate_poll(
    initial_primary: Decimal,
    primary_now: Decimal,
    hedges: &[(String, Decimal, Decimal)],
) -> PollOutcome {
    if primary_now == Decimal::ZERO {
        return PollOutcome::PrimaryLiquidated;
    }
    if shrunk(primary_now, initial_primary) {
        return PollOutcome::PrimaryShrunk;
    }
    let mut liquidated = Vec::new();
    let mut first_shrunk = None;
    for (account_id, initial, now) in hedges {
        if *now == Decimal::ZERO {
            liquidated.push(account_id.clone());
        } else if shrunk(*now, *initial) {
            first_shrunk = Some(account_id.clone());
            break;
        }
    }
    if !liquidated.is_empty() {
        PollOutcome::HedgesLiquidated(liquidated)
    } else if let Some(account_id) = first_shrunk {
        PollOutcome::HedgeShrunk(account_id)
    } else {
        PollOutcome::Quiet
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialOutcome {
    StillOpen,
    LegLiquidated,
    TimedOut,
}

pub fn resolve_partial(
    elapsed: Duration,
    timeout: Duration,
    current_size: Decimal,
) -> PartialOutcome {
    if elapsed > timeout {
        PartialOutcome::TimedOut
    } else if current_size == Decimal::ZERO {
        PartialOutcome::LegLiquidated
    } else {
        PartialOutcome::StillOpen
    }
}

struct HedgeLeg {
    pair: AccountPair,
    /// USDC size of the original hedge order; repair orders reuse it even if
    /// the position was partially reduced since.
    order_size: Decimal,
    initial_notional: Decimal,
}

pub struct PairRunner {
    label: String,
    main: AccountPair,
    hedges: Vec<HedgeLeg>,
    token: String,
    main_side: OrderSide,
    initial_primary: Decimal,
    phase: PairPhase,
    partial_since: Option<Instant>,
    timeout: Duration,
    group: Arc<GroupManager>,
    executor: Arc<OrderExecutor>,
    pool: Arc<AccountPool>,
}

impl PairRunner {
    #[allow(clippy::too_many_arguments)]
    fn new(
        label: String,
        main: AccountPair,
        hedges: Vec<HedgeLeg>,
        token: String,
        main_side: OrderSide,
        initial_primary: Decimal,
        timeout: Duration,
        group: Arc<GroupManager>,
        executor: Arc<OrderExecutor>,
        pool: Arc<AccountPool>,
    ) -> Self {
        Self {
            label,
            main,
            hedges,
            token,
            main_side,
            initial_primary,
            phase: PairPhase::Active,
            partial_since: None,
            timeout,
            group,
            executor,
            pool,
        }
    }

    fn direction_word(&self) -> &'static str {
        match self.main_side {
            OrderSide::Bid => "long",
            OrderSide::Ask => "short",
        }
    }

    fn all_main_handles(&self) -> Vec<AccountHandle> {
        let mut handles = vec![self.main.main.clone()];
        handles.extend(self.hedges.iter().map(|leg| leg.pair.main.clone()));
        handles
    }

    fn all_pairs(&self) -> Vec<AccountPair> {
        let mut pairs = vec![self.main.clone()];
        pairs.extend(self.hedges.iter().map(|leg| leg.pair.clone()));
        pairs
    }

    /// One monitoring step. Returns true when the pair has finished.
    pub async fn poll_once(&mut self) -> Result<bool> {
        match self.phase.clone() {
            PairPhase::Closed => Ok(true),
            PairPhase::Active => self.poll_active().await,
            PairPhase::PartialLiquidation { leg, .. } => self.poll_partial(leg).await,
        }
    }

    async fn poll_active(&mut self) -> Result<bool> {
        let primary_now = fetch_position_notional(&self.main.main, &self.token)
            .await
            .context("failed to poll primary leg")?;
        let mut hedge_observations = Vec::with_capacity(self.hedges.len());
        for leg in &self.hedges {
            let now = fetch_position_notional(&leg.pair.main, &self.token)
                .await
                .context("failed to poll hedge leg")?;
            hedge_observations.push((leg.pair.id().to_string(), leg.initial_notional, now));
        }

        match evaluate_poll(self.initial_primary, primary_now, &hedge_observations) {
            PollOutcome::Quiet => Ok(false),
            PollOutcome::PrimaryLiquidated => {
                self.handle_primary_liquidation().await?;
                Ok(true)
            }
            PollOutcome::PrimaryShrunk => {
                self.enter_partial(LegId::Primary, self.initial_primary);
                Ok(false)
            }
            PollOutcome::HedgeShrunk(account_id) => {
                let initial = self
                    .hedges
                    .iter()
                    .find(|leg| leg.pair.id() == account_id)
                    .map(|leg| leg.initial_notional)
                    .unwrap_or_default();
                self.enter_partial(LegId::Hedge(account_id), initial);
                Ok(false)
            }
            PollOutcome::HedgesLiquidated(account_ids) => {
                for account_id in account_ids {
                    if self.handle_hedge_liquidation(&account_id).await? {
                        self.phase = PairPhase::Closed;
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn enter_partial(&mut self, leg: LegId, initial_size: Decimal) {
        notify(
            Severity::Warning,
            format!(
                "{} | Partial liquidation detected on {:?}, watching the leg",
                self.label, leg
            ),
        );
        self.partial_since = Some(Instant::now());
        self.phase = PairPhase::PartialLiquidation { leg, initial_size };
    }

    async fn poll_partial(&mut self, leg: LegId) -> Result<bool> {
        let account = match &leg {
            LegId::Primary => self.main.main.clone(),
            LegId::Hedge(account_id) => {
                match self
                    .hedges
                    .iter()
                    .find(|candidate| candidate.pair.id() == *account_id)
                {
                    Some(candidate) => candidate.pair.main.clone(),
                    // The leg is already gone; resume normal monitoring.
                    None => {
                        self.phase = PairPhase::Active;
                        return Ok(false);
                    }
                }
            }
        };
        let current = fetch_position_notional(&account, &self.token)
            .await
            .context("failed to poll partially liquidated leg")?;
        let elapsed = self
            .partial_since
            .map(|since| since.elapsed())
            .unwrap_or_default();

        match resolve_partial(elapsed, self.timeout, current) {
            PartialOutcome::StillOpen => Ok(false),
            PartialOutcome::TimedOut => {
                notify(
                    Severity::Warning,
                    format!(
                        "{} | Closing pair due to partial liquidation timeout on {:?}",
                        self.label, leg
                    ),
                );
                self.force_close_and_release().await;
                Ok(true)
            }
            PartialOutcome::LegLiquidated => match leg {
                LegId::Primary => {
                    self.handle_primary_liquidation().await?;
                    Ok(true)
                }
                LegId::Hedge(account_id) => {
                    let closed = self.handle_hedge_liquidation(&account_id).await?;
                    if closed {
                        self.phase = PairPhase::Closed;
                        Ok(true)
                    } else {
                        self.phase = PairPhase::Active;
                        Ok(false)
                    }
                }
            },
        }
    }

    async fn handle_primary_liquidation(&mut self) -> Result<()> {
        notify(
            Severity::Info,
            format!(
                "{} | Main {} position liquidated on {}, closing all hedges",
                self.label,
                self.direction_word(),
                self.main.id()
            ),
        );
        self.group.close_all(&self.all_main_handles(), None).await;
        self.pool.release_all(self.all_pairs()).await;
        self.phase = PairPhase::Closed;
        Ok(())
    }

    /// Resolves a fully liquidated hedge leg. Returns true when the pair is
    /// finished (the liquidated hedge was the last one).
    async fn handle_hedge_liquidation(&mut self, account_id: &str) -> Result<bool> {
        notify(
            Severity::Info,
            format!(
                "{} | Hedge position liquidated on {}, adjusting position",
                self.label, account_id
            ),
        );
        let index = self
            .hedges
            .iter()
            .position(|leg| leg.pair.id() == account_id)
            .ok_or_else(|| anyhow!("unknown hedge account {}", account_id))?;

        if self.hedges.len() == 1 {
            // Last hedge gone: nothing left to balance against, close out.
            let leg = self.hedges.remove(index);
            self.pool.release(leg.pair).await;
            notify(
                Severity::Info,
                format!("{} | All hedge positions liquidated, closing pair...", self.label),
            );
            self.group.close_all(&[self.main.main.clone()], None).await;
            self.pool.release(self.main.clone()).await;
            return Ok(true);
        }

        // Rebuild the lost exposure on the primary, sized to the hedge's
        // original order size.
        let repair_side = self.main_side.flipped();
        self.executor
            .place_order(
                &self.main.main,
                &self.token,
                repair_side,
                OrderSizing::Quote(self.hedges[index].order_size),
                Some(LIQUIDATION_LEVERAGE),
                true,
            )
            .await
            .context("repair order failed")?;

        self.initial_primary = fetch_position_notional(&self.main.main, &self.token)
            .await
            .context("failed to re-measure primary leg")?;
        let leg = self.hedges.remove(index);
        self.pool.release(leg.pair).await;
        Ok(false)
    }

    async fn force_close_and_release(&mut self) {
        self.group.close_all(&self.all_main_handles(), None).await;
        self.pool.release_all(self.all_pairs()).await;
        self.phase = PairPhase::Closed;
    }
}

pub struct DeltaNeutralOrchestrator {
    pool: Arc<AccountPool>,
    group: Arc<GroupManager>,
    executor: Arc<OrderExecutor>,
    balancer: Arc<CollateralBalancer>,
    cfg: Arc<BotConfig>,
}

impl DeltaNeutralOrchestrator {
    pub fn new(
        pool: Arc<AccountPool>,
        group: Arc<GroupManager>,
        executor: Arc<OrderExecutor>,
        balancer: Arc<CollateralBalancer>,
        cfg: Arc<BotConfig>,
    ) -> Self {
        Self {
            pool,
            group,
            executor,
            balancer,
            cfg,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let parallel = sample_u(self.cfg.delta_neutral.parallel_pairs).max(1);
            notify(
                Severity::Info,
                format!("Starting {} parallel delta neutral pairs", parallel),
            );
            let mut tasks: JoinSet<bool> = JoinSet::new();
            for i in 0..parallel {
                let this = Arc::clone(&self);
                let label = format!("pair-{}", i + 1);
                tasks.spawn(async move { this.run_single_pair(label).await });
            }
            let mut any_started = false;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(started) => any_started = any_started || started,
                    Err(err) => log::error!("[PAIR] pair task panicked: {:?}", err),
                }
            }
            if !any_started || self.pool.remaining().await == 0 {
                notify(Severity::Info, "No more accounts available for trading");
                return Ok(());
            }
            sleep(Duration::from_secs(SWEEP_PAUSE_SECS)).await;
        }
    }

    async fn run_single_pair(&self, label: String) -> bool {
        let dn_cfg = &self.cfg.delta_neutral;
        let accounts_needed = sample_u(dn_cfg.accounts_in_pair).max(2) as usize;
        let selection = match self
            .pool
            .checkout_group(accounts_needed, &EligibilityProfile::Liquidation)
            .await
        {
            Ok(Some(selection)) => selection,
            Ok(None) => {
                notify(
                    Severity::Warning,
                    format!("{} | Not enough accounts for launching a pair", label),
                );
                return false;
            }
            Err(err) => {
                notify(
                    Severity::Error,
                    format!("{} | Account selection failed: {:#}", label, err),
                );
                return false;
            }
        };

        let selected = selection.all();
        match self.drive_pair(&label, selection).await {
            Ok(()) => true,
            Err(err) => {
                notify(Severity::Error, format!("{} | Error in pair trading: {:#}", label, err));
                let handles: Vec<AccountHandle> =
                    selected.iter().map(|pair| pair.main.clone()).collect();
                self.group.close_all(&handles, None).await;
                self.pool.release_all(selected).await;
                false
            }
        }
    }

    async fn drive_pair(&self, label: &str, selection: crate::pool::CheckedOutGroup) -> Result<()> {
        let dn_cfg = &self.cfg.delta_neutral;
        let main = selection.primary;
        let hedge_pairs = selection.hedges;

        let token = pick(&dn_cfg.tokens)
            .ok_or_else(|| anyhow!("no tokens configured for delta neutral mode"))?
            .clone();
        let margin = sample_f(dn_cfg.position_margin);
        let main_size = (Decimal::from_f64(margin).unwrap_or(Decimal::ONE)
            * Decimal::from(LIQUIDATION_LEVERAGE))
        .round_dp(2);
        let variation = sample_f(dn_cfg.size_variation);
        let hedge_sizes = split_hedge_sizes(main_size, hedge_pairs.len(), variation);
        let main_side = match pick(&dn_cfg.main_directions).map(String::as_str) {
            Some("short") => OrderSide::Ask,
            _ => OrderSide::Bid,
        };

        let leverage_dec = Decimal::from(LIQUIDATION_LEVERAGE);
        for (pair, size) in std::iter::once((&main, &main_size))
            .chain(hedge_pairs.iter().zip(hedge_sizes.iter()))
        {
            self.balancer
                .ensure_margin(pair, *size / leverage_dec)
                .await
                .with_context(|| format!("failed to adjust balance for {}", pair.id()))?;
        }

        let hedge_handles: Vec<AccountHandle> =
            hedge_pairs.iter().map(|pair| pair.main.clone()).collect();
        let params = GroupOpenParams {
            leverage: LIQUIDATION_LEVERAGE,
            primary_size: main_size,
            hedge_sizes: hedge_sizes.clone(),
            primary_side: main_side,
        };
        if !self
            .group
            .open_group(&main.main, &hedge_handles, &token, &params)
            .await
        {
            return Err(anyhow!("failed to open positions"));
        }

        let initial_primary = fetch_position_notional(&main.main, &token)
            .await
            .context("failed to record primary size")?;
        let mut hedges = Vec::with_capacity(hedge_pairs.len());
        for (pair, order_size) in hedge_pairs.into_iter().zip(hedge_sizes) {
            let initial_notional = fetch_position_notional(&pair.main, &token)
                .await
                .context("failed to record hedge size")?;
            hedges.push(HedgeLeg {
                pair,
                order_size,
                initial_notional,
            });
        }

        notify(
            Severity::Info,
            format!(
                "{} | Monitoring liquidations for pair with {} (main {})",
                label,
                main.id(),
                match main_side {
                    OrderSide::Bid => "long",
                    OrderSide::Ask => "short",
                }
            ),
        );

        let mut runner = PairRunner::new(
            label.to_string(),
            main,
            hedges,
            token,
            main_side,
            initial_primary,
            Duration::from_secs(dn_cfg.partial_liquidation_timeout_mins * 60),
            Arc::clone(&self.group),
            Arc::clone(&self.executor),
            Arc::clone(&self.pool),
        );
        loop {
            sleep(Duration::from_secs(PAIR_POLL_SECS)).await;
            if runner.poll_once().await? {
                return Ok(());
            }
        }
    }
}
