use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::QuotaConfig;
use crate::stats::AccountData;

pub const QUOTA_FILE_NAME: &str = "account_limits.json";

/// Start of the current weekly epoch: the most recent Thursday 00:00 UTC.
/// Exactly at the boundary instant the previous epoch still applies.
pub fn current_epoch_start(now: DateTime<Utc>) -> i64 {
    let weekday = now.weekday().num_days_from_monday() as i64;
    let mut days_back = (weekday - 3).rem_euclid(7);
    if days_back == 0 && now.hour() == 0 && now.minute() == 0 && now.second() == 0 {
        days_back = 7;
    }
    let date = now.date_naive() - chrono::Duration::days(days_back);
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
        .timestamp()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub volume_limit: f64,
    pub pnl_limit: f64,
    pub liquidation_limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredQuota {
    volume_limit: f64,
    pnl_limit: f64,
    #[serde(default)]
    liquidation_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QuotaFile {
    timestamp: i64,
    accounts: BTreeMap<String, StoredQuota>,
}

#[derive(Debug, Clone)]
pub enum EligibilityProfile {
    /// Organic-volume trading: weekly volume + PnL limits and a minimum
    /// spendable USDC floor.
    Volume { min_usdc_balance: Decimal },
    /// Liquidation modes: weekly volume + liquidation-count limits.
    Liquidation,
}

#[derive(Debug)]
pub struct QuotaTracker {
    records: BTreeMap<String, QuotaRecord>,
}

impl QuotaTracker {
    /// Loads the quota table, regenerating limits when the stored epoch
    /// predates the current one, and persists any change.
    pub fn load<P: AsRef<Path>>(
        database_dir: P,
        api_keys: &[String],
        cfg: &QuotaConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let path = quota_path(database_dir.as_ref());
        let saved = match fs::read_to_string(&path) {
            Ok(raw) => Some(
                serde_json::from_str::<QuotaFile>(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?,
            ),
            Err(_) => None,
        };

        let (file, changed) = refresh(saved, api_keys, cfg, now);
        if changed {
            fs::create_dir_all(path.parent().expect("quota path has a parent"))?;
            fs::write(&path, serde_json::to_string_pretty(&file)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let records = file
            .accounts
            .into_iter()
            .map(|(key, stored)| {
                (
                    key,
                    QuotaRecord {
                        volume_limit: stored.volume_limit,
                        pnl_limit: stored.pnl_limit,
                        liquidation_limit: stored.liquidation_limit.unwrap_or(0.0),
                    },
                )
            })
            .collect();
        Ok(Self { records })
    }

    #[cfg(test)]
    pub fn from_records(records: BTreeMap<String, QuotaRecord>) -> Self {
        Self { records }
    }

    pub fn record(&self, api_key: &str) -> Option<&QuotaRecord> {
        self.records.get(api_key)
    }

    pub fn is_eligible(&self, data: &AccountData, profile: &EligibilityProfile) -> bool {
        let Some(record) = self.records.get(&data.api_key) else {
            log::warn!("[QUOTA] no quota record for {}; excluding", data.account_id);
            return false;
        };
        match profile {
            EligibilityProfile::Volume { min_usdc_balance } => {
                if limit_reached(record.volume_limit, data.statistics.volume.week) {
                    return false;
                }
                if limit_reached(record.pnl_limit, data.statistics.pnl.week) {
                    return false;
                }
                data.usdc_balance >= *min_usdc_balance
            }
            EligibilityProfile::Liquidation => {
                if limit_reached(record.volume_limit, data.statistics.volume.week) {
                    return false;
                }
                !limit_reached(
                    record.liquidation_limit,
                    data.statistics.liquidations.week as f64,
                )
            }
        }
    }
}

/// `limit == 0` means unlimited on that axis.
fn limit_reached(limit: f64, value: f64) -> bool {
    limit != 0.0 && value >= limit
}

fn quota_path(database_dir: &Path) -> PathBuf {
    database_dir.join(QUOTA_FILE_NAME)
}

/// Pure refresh core. Returns the table to use plus whether it must be
/// persisted. A stale epoch re-randomizes every account; a fresh epoch keeps
/// stored values, randomizes only unknown accounts, and backfills a missing
/// `liquidation_limit` without touching the other fields.
fn refresh(
    saved: Option<QuotaFile>,
    api_keys: &[String],
    cfg: &QuotaConfig,
    now: DateTime<Utc>,
) -> (QuotaFile, bool) {
    let epoch_start = current_epoch_start(now);
    let stale = saved
        .as_ref()
        .map(|file| file.timestamp < epoch_start)
        .unwrap_or(true);

    let mut file = saved.unwrap_or_default();
    let mut changed = false;

    for api_key in api_keys {
        let known = file.accounts.contains_key(api_key);
        if stale || !known {
            file.accounts.insert(api_key.clone(), random_quota(cfg));
            changed = true;
        } else if let Some(stored) = file.accounts.get_mut(api_key) {
            if stored.liquidation_limit.is_none() {
                stored.liquidation_limit = Some(random_liquidation_limit(cfg));
                changed = true;
            }
        }
    }

    if changed {
        file.timestamp = now.timestamp();
    }
    (file, changed)
}

fn random_quota(cfg: &QuotaConfig) -> StoredQuota {
    StoredQuota {
        volume_limit: round2(crate::config::sample_f(cfg.volume)),
        pnl_limit: round2(crate::config::sample_f(cfg.pnl)),
        liquidation_limit: Some(random_liquidation_limit(cfg)),
    }
}

fn random_liquidation_limit(cfg: &QuotaConfig) -> f64 {
    if cfg.liquidations[0] >= cfg.liquidations[1] {
        return cfg.liquidations[0] as f64;
    }
    rand::thread_rng().gen_range(cfg.liquidations[0]..=cfg.liquidations[1]) as f64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::AccountStatistics;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn quota_cfg() -> QuotaConfig {
        QuotaConfig {
            volume: [100.0, 200.0],
            pnl: [10.0, 20.0],
            liquidations: [1, 3],
        }
    }

    fn account_data(api_key: &str, week_volume: f64, week_pnl: f64, liquidations: u32) -> AccountData {
        let mut statistics = AccountStatistics::default();
        statistics.volume.week = week_volume;
        statistics.pnl.week = week_pnl;
        statistics.liquidations.week = liquidations;
        AccountData {
            account_id: "acc1".to_string(),
            api_key: api_key.to_string(),
            deposit_address: None,
            usdc_balance: dec!(1000),
            total_usd_balance: dec!(1000),
            statistics,
        }
    }

    fn tracker_with(record: QuotaRecord) -> QuotaTracker {
        let mut records = BTreeMap::new();
        records.insert("key".to_string(), record);
        QuotaTracker { records }
    }

    #[test]
    fn epoch_start_is_most_recent_thursday_midnight() {
        // Wednesday 2026-08-05 -> Thursday 2026-07-30.
        let now = Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 7, 30, 0, 0, 0).unwrap();
        assert_eq!(current_epoch_start(now), expected.timestamp());

        // Thursday afternoon stays in the same day's epoch.
        let thursday = Utc.with_ymd_and_hms(2026, 8, 6, 15, 0, 0).unwrap();
        let same_day = Utc.with_ymd_and_hms(2026, 8, 6, 0, 0, 0).unwrap();
        assert_eq!(current_epoch_start(thursday), same_day.timestamp());

        // Exactly at the boundary the previous epoch still applies.
        let boundary = Utc.with_ymd_and_hms(2026, 8, 6, 0, 0, 0).unwrap();
        assert_eq!(
            current_epoch_start(boundary),
            Utc.with_ymd_and_hms(2026, 7, 30, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn regeneration_triggers_iff_epoch_is_stale() {
        let cfg = quota_cfg();
        let now = Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap();
        let keys = vec!["key".to_string()];

        let fresh = QuotaFile {
            timestamp: current_epoch_start(now) + 60,
            accounts: BTreeMap::from([(
                "key".to_string(),
                StoredQuota {
                    volume_limit: 123.0,
                    pnl_limit: 12.0,
                    liquidation_limit: Some(2.0),
                },
            )]),
        };
        let (kept, changed) = refresh(Some(fresh.clone()), &keys, &cfg, now);
        assert!(!changed);
        assert_eq!(kept.accounts["key"].volume_limit, 123.0);

        let stale = QuotaFile {
            timestamp: current_epoch_start(now) - 60,
            ..fresh
        };
        let (_, changed) = refresh(Some(stale), &keys, &cfg, now);
        assert!(changed);
    }

    #[test]
    fn missing_liquidation_limit_is_backfilled_in_place() {
        let cfg = quota_cfg();
        let now = Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap();
        let saved = QuotaFile {
            timestamp: current_epoch_start(now) + 60,
            accounts: BTreeMap::from([(
                "key".to_string(),
                StoredQuota {
                    volume_limit: 150.0,
                    pnl_limit: 15.0,
                    liquidation_limit: None,
                },
            )]),
        };
        let (file, changed) = refresh(Some(saved), &["key".to_string()], &cfg, now);
        assert!(changed);
        let record = &file.accounts["key"];
        assert_eq!(record.volume_limit, 150.0);
        assert_eq!(record.pnl_limit, 15.0);
        assert!(record.liquidation_limit.is_some());
    }

    #[test]
    fn zero_limit_never_excludes_on_that_axis() {
        let tracker = tracker_with(QuotaRecord {
            volume_limit: 0.0,
            pnl_limit: 0.0,
            liquidation_limit: 0.0,
        });
        let data = account_data("key", 1e12, 1e12, 10_000);
        let volume_profile = EligibilityProfile::Volume {
            min_usdc_balance: dec!(1),
        };
        assert!(tracker.is_eligible(&data, &volume_profile));
        assert!(tracker.is_eligible(&data, &EligibilityProfile::Liquidation));
    }

    #[test]
    fn reached_limits_exclude() {
        let tracker = tracker_with(QuotaRecord {
            volume_limit: 100.0,
            pnl_limit: 0.0,
            liquidation_limit: 2.0,
        });
        let volume_profile = EligibilityProfile::Volume {
            min_usdc_balance: dec!(1),
        };
        assert!(!tracker.is_eligible(&account_data("key", 100.0, 0.0, 0), &volume_profile));
        assert!(tracker.is_eligible(&account_data("key", 99.0, 0.0, 0), &volume_profile));
        assert!(!tracker.is_eligible(&account_data("key", 0.0, 0.0, 2), &EligibilityProfile::Liquidation));
    }

    #[test]
    fn low_balance_excludes_only_for_volume_profile() {
        let tracker = tracker_with(QuotaRecord {
            volume_limit: 0.0,
            pnl_limit: 0.0,
            liquidation_limit: 0.0,
        });
        let mut data = account_data("key", 0.0, 0.0, 0);
        data.usdc_balance = dec!(5);
        let volume_profile = EligibilityProfile::Volume {
            min_usdc_balance: dec!(10),
        };
        assert!(!tracker.is_eligible(&data, &volume_profile));
        assert!(tracker.is_eligible(&data, &EligibilityProfile::Liquidation));
    }
}
