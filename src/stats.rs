use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::accounts::AccountHandle;
use crate::exchange::{ExchangeError, Fill, FillsQuery, OrderSide, QUOTE_SYMBOL};

const FILLS_PAGE_SIZE: u32 = 1_000;
const MONTH_WINDOW_SECS: i64 = 60 * 60 * 24 * 30;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WindowF {
    pub week: f64,
    pub month: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WindowU {
    pub week: u32,
    pub month: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountStatistics {
    pub pnl: WindowF,
    pub volume: WindowF,
    pub active_days: WindowU,
    pub orders: WindowU,
    pub liquidations: WindowU,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountData {
    pub account_id: String,
    pub api_key: String,
    pub deposit_address: Option<String>,
    pub usdc_balance: Decimal,
    pub total_usd_balance: Decimal,
    pub statistics: AccountStatistics,
}

/// Drains the paginated fills history into one vector.
pub async fn fetch_all_fills(
    account: &AccountHandle,
    liquidations_only: bool,
) -> Result<Vec<Fill>, ExchangeError> {
    let mut fills = Vec::new();
    let mut offset = 0;
    loop {
        let page = account
            .client()
            .get_fills(&FillsQuery {
                limit: FILLS_PAGE_SIZE,
                offset,
                liquidations_only,
            })
            .await?;
        let page_len = page.len();
        fills.extend(page);
        if page_len < FILLS_PAGE_SIZE as usize {
            return Ok(fills);
        }
        offset += FILLS_PAGE_SIZE;
    }
}

/// Derives weekly/monthly statistics from raw fills.
///
/// PnL pairs adjacent fills per `(symbol, quantity)` key and assumes they
/// alternate open/close. This is an approximation: partial fills or several
/// concurrent same-size positions can misattribute PnL.
pub fn compute_statistics(
    fills: &[Fill],
    liquidation_fills: &[Fill],
    week_start: i64,
    now: i64,
) -> AccountStatistics {
    let month_start = now - MONTH_WINDOW_SECS;

    let mut grouped: HashMap<String, Vec<&Fill>> = HashMap::new();
    for fill in fills {
        grouped
            .entry(format!("{}_{}", fill.symbol, fill.quantity))
            .or_default()
            .push(fill);
    }

    let mut week_pnl = 0.0;
    let mut month_pnl = 0.0;
    for series in grouped.values() {
        let mut i = 0;
        while i + 1 < series.len() {
            let open = series[i];
            let close = series[i + 1];
            if open.side != close.side {
                let open_volume = fill_volume(open);
                let close_volume = fill_volume(close);
                let pnl = match open.side {
                    OrderSide::Bid => close_volume - open_volume,
                    OrderSide::Ask => open_volume - close_volume,
                };
                if close.timestamp >= week_start {
                    week_pnl += pnl;
                }
                if close.timestamp >= month_start {
                    month_pnl += pnl;
                }
            }
            i += 2;
        }
    }

    let volume_since = |since: i64| -> f64 {
        fills
            .iter()
            .filter(|f| f.timestamp >= since)
            .map(fill_volume)
            .sum()
    };
    let days_since = |since: i64| -> u32 {
        fills
            .iter()
            .filter(|f| f.timestamp >= since)
            .filter_map(|f| DateTime::<Utc>::from_timestamp(f.timestamp, 0))
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .collect::<HashSet<_>>()
            .len() as u32
    };
    let orders_since = |since: i64| -> u32 {
        fills
            .iter()
            .filter(|f| f.timestamp >= since)
            .map(|f| f.order_id.as_str())
            .collect::<HashSet<_>>()
            .len() as u32
    };
    let liquidations_since = |since: i64| -> u32 {
        liquidation_fills
            .iter()
            .filter(|f| f.timestamp >= since)
            .count() as u32
    };

    AccountStatistics {
        pnl: WindowF {
            week: week_pnl,
            month: month_pnl,
        },
        volume: WindowF {
            week: volume_since(week_start),
            month: volume_since(month_start),
        },
        active_days: WindowU {
            week: days_since(week_start),
            month: days_since(month_start),
        },
        orders: WindowU {
            week: orders_since(week_start),
            month: orders_since(month_start),
        },
        liquidations: WindowU {
            week: liquidations_since(week_start),
            month: liquidations_since(month_start),
        },
    }
}

fn fill_volume(fill: &Fill) -> f64 {
    (fill.price * fill.quantity).to_f64().unwrap_or(0.0)
}

/// Full data collection for one account: deposit address, balances (sub
/// balances folded in when present) and fills-derived statistics.
pub async fn collect_account_data(
    main: &AccountHandle,
    sub: Option<&AccountHandle>,
    prices: &HashMap<String, Decimal>,
    week_start: i64,
) -> Result<AccountData> {
    let deposit_address = main
        .deposit_address()
        .await
        .map(|addr| addr.clone())
        .with_context(|| format!("failed to fetch deposit address for {}", main.id))?;

    let sheet = main
        .client()
        .get_balances()
        .await
        .with_context(|| format!("failed to fetch balances for {}", main.id))?;
    let mut balances = sheet.total.clone();
    if let Some(sub) = sub {
        let sub_sheet = sub
            .client()
            .get_balances()
            .await
            .with_context(|| format!("failed to fetch balances for {}", sub.id))?;
        for (symbol, quantity) in sub_sheet.total {
            *balances.entry(symbol).or_default() += quantity;
        }
    }

    let total_usd_balance = balances
        .iter()
        .filter_map(|(symbol, quantity)| prices.get(symbol).map(|price| *quantity * *price))
        .sum::<Decimal>()
        .round_dp(2);
    let usdc_balance = balances
        .get(QUOTE_SYMBOL)
        .copied()
        .unwrap_or_default()
        .round_dp(2);

    let fills = fetch_all_fills(main, false)
        .await
        .with_context(|| format!("failed to fetch fills for {}", main.id))?;
    let liquidation_fills = fetch_all_fills(main, true)
        .await
        .with_context(|| format!("failed to fetch liquidation fills for {}", main.id))?;
    let statistics = compute_statistics(&fills, &liquidation_fills, week_start, Utc::now().timestamp());

    Ok(AccountData {
        account_id: main.id.clone(),
        api_key: main.api_key.clone(),
        deposit_address: Some(deposit_address),
        usdc_balance,
        total_usd_balance,
        statistics,
    })
}

/// Collects data for many accounts concurrently. Prices are fetched once
/// through the first account.
pub async fn collect_many(
    targets: &[(AccountHandle, Option<AccountHandle>)],
    week_start: i64,
) -> Result<Vec<AccountData>> {
    let first = targets
        .first()
        .ok_or_else(|| anyhow!("no accounts to collect data for"))?;
    let prices = first
        .0
        .client()
        .get_prices(false)
        .await
        .context("failed to fetch prices")?;

    let mut tasks: JoinSet<Result<AccountData>> = JoinSet::new();
    for (main, sub) in targets.iter().cloned() {
        let prices = prices.clone();
        tasks.spawn(async move {
            collect_account_data(&main, sub.as_ref(), &prices, week_start).await
        });
    }

    let mut collected = Vec::with_capacity(targets.len());
    while let Some(joined) = tasks.join_next().await {
        collected.push(joined.context("account data task panicked")??);
    }
    collected.sort_by(|a, b| a.account_id.cmp(&b.account_id));
    Ok(collected)
}

/// Persists the latest collection pass as `account_stats.json`.
pub fn save_snapshot<P: AsRef<Path>>(database_dir: P, data: &[AccountData]) -> Result<()> {
    let dir = database_dir.as_ref();
    fs::create_dir_all(dir)?;
    let snapshot = serde_json::json!({
        "last_update": Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
        "accounts": data,
    });
    let path = dir.join("account_stats.json");
    fs::write(&path, serde_json::to_string_pretty(&snapshot)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Writes a timestamped CSV export, one row per account.
pub fn export_csv<P: AsRef<Path>>(database_dir: P, data: &[AccountData]) -> Result<()> {
    let dir = database_dir.as_ref();
    fs::create_dir_all(dir)?;
    let mut out = String::from(
        "api_key,id,balance_usdc,balance_total,pnl_week,pnl_month,volume_week,volume_month,liquidations_week,liquidations_month\n",
    );
    for account in data {
        out.push_str(&format!(
            "{},{},{},{},{:.6},{:.6},{:.2},{:.2},{},{}\n",
            account.api_key,
            account.account_id,
            account.usdc_balance,
            account.total_usd_balance,
            account.statistics.pnl.week,
            account.statistics.pnl.month,
            account.statistics.volume.week,
            account.statistics.volume.month,
            account.statistics.liquidations.week,
            account.statistics.liquidations.month,
        ));
    }
    let path = dir.join(format!(
        "account_stats_{}.csv",
        Utc::now().format("%Y-%m-%d_%H-%M-%S")
    ));
    fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Cached statistics snapshot shared by the account pool.
pub struct StatsCache {
    entries: Vec<AccountData>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            fetched_at: None,
            ttl,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        match self.fetched_at {
            None => true,
            Some(fetched_at) => now.duration_since(fetched_at) >= self.ttl,
        }
    }

    /// True when the cache holds an entry for every given account id.
    pub fn covers<'a>(&self, mut ids: impl Iterator<Item = &'a str>) -> bool {
        ids.all(|id| self.entries.iter().any(|e| e.account_id == id))
    }

    pub fn replace(&mut self, entries: Vec<AccountData>, now: Instant) {
        self.entries = entries;
        self.fetched_at = Some(now);
    }

    pub fn entries(&self) -> &[AccountData] {
        &self.entries
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountData> {
        self.entries.iter().find(|e| e.account_id == account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(symbol: &str, quantity: Decimal, price: Decimal, side: OrderSide, ts: i64) -> Fill {
        Fill {
            symbol: symbol.to_string(),
            quantity,
            price,
            side,
            order_id: format!("o-{}", ts),
            timestamp: ts,
        }
    }

    #[test]
    fn adjacent_fill_pairs_produce_pnl() {
        let now = 1_000_000;
        let fills = vec![
            fill("BTC_USDC_PERP", dec!(0.5), dec!(100), OrderSide::Bid, now - 100),
            fill("BTC_USDC_PERP", dec!(0.5), dec!(120), OrderSide::Ask, now - 50),
        ];
        let stats = compute_statistics(&fills, &[], now - 1_000, now);
        assert!((stats.pnl.week - 10.0).abs() < 1e-9);
        assert!((stats.volume.week - 110.0).abs() < 1e-9);
        assert_eq!(stats.orders.week, 2);
    }

    #[test]
    fn same_side_adjacent_fills_are_not_paired() {
        let now = 1_000_000;
        let fills = vec![
            fill("ETH_USDC_PERP", dec!(1), dec!(100), OrderSide::Bid, now - 100),
            fill("ETH_USDC_PERP", dec!(1), dec!(105), OrderSide::Bid, now - 50),
        ];
        let stats = compute_statistics(&fills, &[], now - 1_000, now);
        assert_eq!(stats.pnl.week, 0.0);
    }

    #[test]
    fn fills_before_the_week_window_only_count_toward_month() {
        let now = 10_000_000;
        let week_start = now - 100;
        let fills = vec![
            fill("SOL_USDC_PERP", dec!(2), dec!(10), OrderSide::Bid, now - 500),
            fill("SOL_USDC_PERP", dec!(2), dec!(15), OrderSide::Ask, now - 400),
        ];
        let stats = compute_statistics(&fills, &[], week_start, now);
        assert_eq!(stats.pnl.week, 0.0);
        assert!((stats.pnl.month - 10.0).abs() < 1e-9);
        assert_eq!(stats.volume.week, 0.0);
    }

    #[test]
    fn liquidation_fills_count_per_window() {
        let now = 1_000_000;
        let liq = vec![
            fill("BTC_USDC_PERP", dec!(1), dec!(10), OrderSide::Ask, now - 10),
            fill("BTC_USDC_PERP", dec!(1), dec!(10), OrderSide::Ask, now - MONTH_WINDOW_SECS + 10),
        ];
        let stats = compute_statistics(&[], &liq, now - 100, now);
        assert_eq!(stats.liquidations.week, 1);
        assert_eq!(stats.liquidations.month, 2);
    }

    #[test]
    fn cache_staleness_follows_ttl() {
        let mut cache = StatsCache::new(Duration::from_secs(600));
        let t0 = Instant::now();
        assert!(cache.is_stale(t0));
        cache.replace(Vec::new(), t0);
        assert!(!cache.is_stale(t0 + Duration::from_secs(599)));
        assert!(cache.is_stale(t0 + Duration::from_secs(600)));
    }

    #[test]
    fn cache_coverage_requires_every_id() {
        let mut cache = StatsCache::new(Duration::from_secs(600));
        let entry = AccountData {
            account_id: "acc1".to_string(),
            api_key: "k".to_string(),
            deposit_address: None,
            usdc_balance: Decimal::ZERO,
            total_usd_balance: Decimal::ZERO,
            statistics: AccountStatistics::default(),
        };
        cache.replace(vec![entry], Instant::now());
        assert!(cache.covers(["acc1"].into_iter()));
        assert!(!cache.covers(["acc1", "acc2"].into_iter()));
    }
}
