use anyhow::{Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::accounts::{AccountHandle, AccountPair};
use crate::quota::{current_epoch_start, EligibilityProfile, QuotaTracker};
use crate::stats::{self, StatsCache};

/// A checked-out set of accounts: one primary plus zero or more hedges.
#[derive(Debug)]
pub struct CheckedOutGroup {
    pub primary: AccountPair,
    pub hedges: Vec<AccountPair>,
}

impl CheckedOutGroup {
    pub fn all(&self) -> Vec<AccountPair> {
        let mut all = vec![self.primary.clone()];
        all.extend(self.hedges.iter().cloned());
        all
    }
}

struct PoolInner {
    pairs: Vec<AccountPair>,
    cache: StatsCache,
}

/// Mutually-exclusive checkout registry for account pairs. One mutex guards
/// every read-modify-write sequence; the statistics refresh inside
/// `checkout_group` deliberately runs under the lock so selection is
/// serialized and the cache refresh is single-flight.
pub struct AccountPool {
    inner: Mutex<PoolInner>,
    quota: Arc<QuotaTracker>,
}

impl AccountPool {
    pub fn new(pairs: Vec<AccountPair>, quota: Arc<QuotaTracker>, cache_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                pairs,
                cache: StatsCache::new(cache_ttl),
            }),
            quota,
        }
    }

    pub async fn remaining(&self) -> usize {
        self.inner.lock().await.pairs.len()
    }

    pub async fn checkout_one(
        &self,
        profile: &EligibilityProfile,
    ) -> Result<Option<AccountPair>> {
        Ok(self
            .checkout_group(1, profile)
            .await?
            .map(|group| group.primary))
    }

    /// Atomically selects `accounts_needed` eligible pairs uniformly at
    /// random and removes them from the pool. Returns `None` when the pool
    /// or the eligible subset is too small.
    pub async fn checkout_group(
        &self,
        accounts_needed: usize,
        profile: &EligibilityProfile,
    ) -> Result<Option<CheckedOutGroup>> {
        let mut inner = self.inner.lock().await;

        dedup_by_id(&mut inner.pairs);
        if inner.pairs.len() < accounts_needed {
            return Ok(None);
        }

        self.refresh_cache_if_needed(&mut inner).await?;

        let eligible_ids: Vec<String> = inner
            .pairs
            .iter()
            .filter(|pair| {
                inner
                    .cache
                    .get(pair.id())
                    .map(|data| self.quota.is_eligible(data, profile))
                    .unwrap_or(false)
            })
            .map(|pair| pair.id().to_string())
            .collect();
        if eligible_ids.len() < accounts_needed {
            return Ok(None);
        }

        let mut chosen = eligible_ids;
        {
            let mut rng = rand::thread_rng();
            chosen.shuffle(&mut rng);
        }
        chosen.truncate(accounts_needed);

        let mut selected: Vec<AccountPair> = Vec::with_capacity(accounts_needed);
        for id in &chosen {
            if let Some(index) = inner.pairs.iter().position(|pair| pair.id() == id) {
                selected.push(inner.pairs.remove(index));
            }
        }
        let primary = selected.remove(0);
        Ok(Some(CheckedOutGroup {
            primary,
            hedges: selected,
        }))
    }

    /// Returns a pair to the pool; releasing the same pair twice leaves one
    /// entry.
    pub async fn release(&self, pair: AccountPair) {
        let mut inner = self.inner.lock().await;
        if !inner.pairs.iter().any(|p| p.id() == pair.id()) {
            inner.pairs.push(pair);
        }
    }

    pub async fn release_all(&self, pairs: Vec<AccountPair>) {
        let mut inner = self.inner.lock().await;
        for pair in pairs {
            if !inner.pairs.iter().any(|p| p.id() == pair.id()) {
                inner.pairs.push(pair);
            }
        }
    }

    async fn refresh_cache_if_needed(&self, inner: &mut PoolInner) -> Result<()> {
        let now = Instant::now();
        let covered = inner.cache.covers(inner.pairs.iter().map(|p| p.id()));
        if !inner.cache.is_stale(now) && covered {
            return Ok(());
        }
        let targets: Vec<(AccountHandle, Option<AccountHandle>)> = inner
            .pairs
            .iter()
            .map(|pair| (pair.main.clone(), Some(pair.sub.clone())))
            .collect();
        let week_start = current_epoch_start(Utc::now());
        let data = stats::collect_many(&targets, week_start)
            .await
            .context("failed to refresh account statistics")?;
        inner.cache.replace(data, now);
        Ok(())
    }
}

fn dedup_by_id(pairs: &mut Vec<AccountPair>) {
    let mut seen: Vec<String> = Vec::with_capacity(pairs.len());
    pairs.retain(|pair| {
        if seen.iter().any(|id| id == pair.id()) {
            false
        } else {
            seen.push(pair.id().to_string());
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testkit::MockExchange;
    use crate::exchange::ExchangeClient;
    use crate::quota::QuotaRecord;

    fn pair(id: &str) -> AccountPair {
        let main = Arc::new(MockExchange::new());
        let sub = Arc::new(MockExchange::new());
        AccountPair::for_tests(
            id,
            main as Arc<dyn ExchangeClient>,
            sub as Arc<dyn ExchangeClient>,
        )
    }

    fn permissive_quota(ids: &[&str]) -> Arc<QuotaTracker> {
        let records = ids
            .iter()
            .map(|id| {
                (
                    format!("key-{}", id),
                    QuotaRecord {
                        volume_limit: 0.0,
                        pnl_limit: 0.0,
                        liquidation_limit: 0.0,
                    },
                )
            })
            .collect();
        Arc::new(QuotaTracker::from_records(records))
    }

    fn pool(ids: &[&str]) -> AccountPool {
        let pairs = ids.iter().map(|id| pair(id)).collect();
        AccountPool::new(pairs, permissive_quota(ids), Duration::from_secs(600))
    }

    #[tokio::test]
    async fn checkout_removes_selected_pairs() {
        let pool = pool(&["a", "b", "c"]);
        let group = pool
            .checkout_group(2, &EligibilityProfile::Liquidation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.hedges.len(), 1);
        assert_eq!(pool.remaining().await, 1);
        assert_ne!(group.primary.id(), group.hedges[0].id());
    }

    #[tokio::test]
    async fn checkout_returns_none_when_pool_is_too_small() {
        let pool = pool(&["a"]);
        let group = pool
            .checkout_group(2, &EligibilityProfile::Liquidation)
            .await
            .unwrap();
        assert!(group.is_none());
        assert_eq!(pool.remaining().await, 1);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = pool(&["a", "b"]);
        let checked_out = pool
            .checkout_one(&EligibilityProfile::Liquidation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.remaining().await, 1);

        pool.release(checked_out.clone()).await;
        pool.release(checked_out).await;
        assert_eq!(pool.remaining().await, 2);
    }

    #[tokio::test]
    async fn duplicate_pool_entries_collapse_on_checkout() {
        let pairs = vec![pair("a"), pair("a"), pair("b")];
        let pool = AccountPool::new(pairs, permissive_quota(&["a", "b"]), Duration::from_secs(600));
        let group = pool
            .checkout_group(2, &EligibilityProfile::Liquidation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.all().len(), 2);
        assert_eq!(pool.remaining().await, 0);
    }

    #[tokio::test]
    async fn ineligible_accounts_are_never_selected() {
        let pairs = vec![pair("a"), pair("b")];
        let mut records = std::collections::BTreeMap::new();
        // A negative volume limit is always reached, so "a" is never eligible.
        records.insert(
            "key-a".to_string(),
            QuotaRecord {
                volume_limit: -1.0,
                pnl_limit: 0.0,
                liquidation_limit: 0.0,
            },
        );
        records.insert(
            "key-b".to_string(),
            QuotaRecord {
                volume_limit: 0.0,
                pnl_limit: 0.0,
                liquidation_limit: 0.0,
            },
        );
        let pool = AccountPool::new(
            pairs,
            Arc::new(QuotaTracker::from_records(records)),
            Duration::from_secs(600),
        );
        for _ in 0..5 {
            let checked_out = pool
                .checkout_one(&EligibilityProfile::Liquidation)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(checked_out.id(), "b");
            pool.release(checked_out).await;
        }
    }
}
