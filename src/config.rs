use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

const DEFAULT_ACCOUNTS_FILE: &str = "accounts.json";
const DEFAULT_DATABASE_DIR: &str = "database";
const DEFAULT_REST_ENDPOINT: &str = "https://api.example-perps.exchange";
const DEFAULT_CHAIN: &str = "Solana";
const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_ORDER_DELAY_SECS: [f64; 2] = [5.0, 15.0];
const DEFAULT_CYCLE_PAUSE_SECS: [f64; 2] = [120.0, 600.0];
const DEFAULT_STATS_CACHE_SECS: u64 = 600;

const DEFAULT_VOLUME_TOKENS: &[&str] = &["BTC", "ETH", "SOL"];
const DEFAULT_ACCOUNTS_IN_GROUP: [u32; 2] = [3, 4];
const DEFAULT_TOTAL_POSITION_SIZE: [f64; 2] = [200.0, 400.0];
const DEFAULT_VOLUME_LEVERAGE: [u32; 2] = [5, 10];
const DEFAULT_MAX_HOLD_SECS: [f64; 2] = [600.0, 3600.0];
const DEFAULT_MAX_PNL_PCT: [f64; 2] = [30.0, 60.0];
const DEFAULT_SIZE_VARIATION: [f64; 2] = [0.05, 0.25];

const DEFAULT_DN_ACCOUNTS_IN_PAIR: [u32; 2] = [2, 3];
const DEFAULT_DN_POSITION_MARGIN: [f64; 2] = [4.0, 8.0];
const DEFAULT_DN_SIZE_VARIATION: [f64; 2] = [0.0, 0.2];
const DEFAULT_DN_PARALLEL_PAIRS: [u32; 2] = [1, 2];
const DEFAULT_DN_PARTIAL_TIMEOUT_MINS: u64 = 30;

const DEFAULT_MT_POSITION_MARGIN: [f64; 2] = [1.5, 4.0];
const DEFAULT_MT_POSITIONS_PER_ACCOUNT: [u32; 2] = [2, 4];
const DEFAULT_MT_REOPEN_PNL_PCT: f64 = 80.0;
const DEFAULT_MT_REINVEST_PNL_PCT: f64 = 120.0;
const DEFAULT_MT_PARALLEL_ACCOUNTS: [u32; 2] = [2, 4];
const DEFAULT_MT_ACCOUNT_DELAY_SECS: [f64; 2] = [10.0, 60.0];

const DEFAULT_QUOTA_VOLUME: [f64; 2] = [250_000.0, 1_000_000.0];
const DEFAULT_QUOTA_PNL: [f64; 2] = [50.0, 400.0];
const DEFAULT_QUOTA_LIQUIDATIONS: [u32; 2] = [2, 6];

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct BotYaml {
    accounts_file: Option<String>,
    database_dir: Option<String>,
    rest_endpoint: Option<String>,
    chain: Option<String>,
    retry_limit: Option<u32>,
    order_delay_secs: Option<[f64; 2]>,
    cycle_pause_secs: Option<[f64; 2]>,
    stats_cache_secs: Option<u64>,
    volume: Option<VolumeYaml>,
    delta_neutral: Option<DeltaNeutralYaml>,
    multi_token: Option<MultiTokenYaml>,
    quota: Option<QuotaYaml>,
}

#[derive(Debug, Deserialize, Default)]
struct VolumeYaml {
    tokens: Option<Vec<String>>,
    accounts_in_group: Option<[u32; 2]>,
    total_position_size: Option<[f64; 2]>,
    leverage: Option<[u32; 2]>,
    max_hold_secs: Option<[f64; 2]>,
    max_pnl_pct: Option<[f64; 2]>,
    size_variation: Option<[f64; 2]>,
}

#[derive(Debug, Deserialize, Default)]
struct DeltaNeutralYaml {
    tokens: Option<Vec<String>>,
    accounts_in_pair: Option<[u32; 2]>,
    position_margin: Option<[f64; 2]>,
    size_variation: Option<[f64; 2]>,
    main_directions: Option<Vec<String>>,
    parallel_pairs: Option<[u32; 2]>,
    partial_liquidation_timeout_mins: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MultiTokenYaml {
    tokens: Option<Vec<String>>,
    position_margin: Option<[f64; 2]>,
    positions_per_account: Option<[u32; 2]>,
    reopen_pnl_pct: Option<f64>,
    reinvest_pnl_pct: Option<f64>,
    parallel_accounts: Option<[u32; 2]>,
    account_delay_secs: Option<[f64; 2]>,
}

#[derive(Debug, Deserialize, Default)]
struct QuotaYaml {
    volume: Option<[f64; 2]>,
    pnl: Option<[f64; 2]>,
    liquidations: Option<[u32; 2]>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub accounts_file: String,
    pub database_dir: String,
    pub rest_endpoint: String,
    pub chain: String,
    pub retry_limit: u32,
    /// Randomized pause between consecutive orders on different accounts.
    pub order_delay_secs: [f64; 2],
    /// Randomized pause between volume-mode trading cycles.
    pub cycle_pause_secs: [f64; 2],
    pub stats_cache_secs: u64,
    pub volume: VolumeConfig,
    pub delta_neutral: DeltaNeutralConfig,
    pub multi_token: MultiTokenConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub tokens: Vec<String>,
    pub accounts_in_group: [u32; 2],
    /// Combined notional of both sides, in USDC.
    pub total_position_size: [f64; 2],
    pub leverage: [u32; 2],
    pub max_hold_secs: [f64; 2],
    pub max_pnl_pct: [f64; 2],
    pub size_variation: [f64; 2],
}

#[derive(Debug, Clone)]
pub struct DeltaNeutralConfig {
    pub tokens: Vec<String>,
    pub accounts_in_pair: [u32; 2],
    /// Margin committed per position, in USDC; notional is margin x leverage.
    pub position_margin: [f64; 2],
    pub size_variation: [f64; 2],
    pub main_directions: Vec<String>,
    pub parallel_pairs: [u32; 2],
    pub partial_liquidation_timeout_mins: u64,
}

#[derive(Debug, Clone)]
pub struct MultiTokenConfig {
    pub tokens: Vec<String>,
    pub position_margin: [f64; 2],
    pub positions_per_account: [u32; 2],
    /// PnL% at which a position is closed and reopened; 0 disables.
    pub reopen_pnl_pct: f64,
    /// PnL% step at which realized gains are scaled back in; 0 disables.
    pub reinvest_pnl_pct: f64,
    pub parallel_accounts: [u32; 2],
    pub account_delay_secs: [f64; 2],
}

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub volume: [f64; 2],
    pub pnl: [f64; 2],
    pub liquidations: [u32; 2],
}

impl BotConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("VOLBOT_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let yaml = match config_path {
            Some(path) => Self::read_yaml(&path)?,
            None => BotYaml::default(),
        };
        let mut cfg = Self::from_yaml(yaml);
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = Self::read_yaml(path.as_ref())?;
        let mut cfg = Self::from_yaml(yaml);
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn read_yaml<P: AsRef<Path>>(path: P) -> Result<BotYaml> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open config {}", path_ref.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))
    }

    fn from_yaml(yaml: BotYaml) -> Self {
        let volume = yaml.volume.unwrap_or_default();
        let delta_neutral = yaml.delta_neutral.unwrap_or_default();
        let multi_token = yaml.multi_token.unwrap_or_default();
        let quota = yaml.quota.unwrap_or_default();

        BotConfig {
            accounts_file: yaml
                .accounts_file
                .unwrap_or_else(|| DEFAULT_ACCOUNTS_FILE.to_string()),
            database_dir: yaml
                .database_dir
                .unwrap_or_else(|| DEFAULT_DATABASE_DIR.to_string()),
            rest_endpoint: yaml
                .rest_endpoint
                .unwrap_or_else(|| DEFAULT_REST_ENDPOINT.to_string()),
            chain: yaml.chain.unwrap_or_else(|| DEFAULT_CHAIN.to_string()),
            retry_limit: yaml.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
            order_delay_secs: yaml.order_delay_secs.unwrap_or(DEFAULT_ORDER_DELAY_SECS),
            cycle_pause_secs: yaml.cycle_pause_secs.unwrap_or(DEFAULT_CYCLE_PAUSE_SECS),
            stats_cache_secs: yaml.stats_cache_secs.unwrap_or(DEFAULT_STATS_CACHE_SECS),
            volume: VolumeConfig {
                tokens: volume.tokens.unwrap_or_else(default_tokens),
                accounts_in_group: volume
                    .accounts_in_group
                    .unwrap_or(DEFAULT_ACCOUNTS_IN_GROUP),
                total_position_size: volume
                    .total_position_size
                    .unwrap_or(DEFAULT_TOTAL_POSITION_SIZE),
                leverage: volume.leverage.unwrap_or(DEFAULT_VOLUME_LEVERAGE),
                max_hold_secs: volume.max_hold_secs.unwrap_or(DEFAULT_MAX_HOLD_SECS),
                max_pnl_pct: volume.max_pnl_pct.unwrap_or(DEFAULT_MAX_PNL_PCT),
                size_variation: volume.size_variation.unwrap_or(DEFAULT_SIZE_VARIATION),
            },
            delta_neutral: DeltaNeutralConfig {
                tokens: delta_neutral.tokens.unwrap_or_else(default_tokens),
                accounts_in_pair: delta_neutral
                    .accounts_in_pair
                    .unwrap_or(DEFAULT_DN_ACCOUNTS_IN_PAIR),
                position_margin: delta_neutral
                    .position_margin
                    .unwrap_or(DEFAULT_DN_POSITION_MARGIN),
                size_variation: delta_neutral
                    .size_variation
                    .unwrap_or(DEFAULT_DN_SIZE_VARIATION),
                main_directions: delta_neutral
                    .main_directions
                    .unwrap_or_else(|| vec!["long".to_string(), "short".to_string()]),
                parallel_pairs: delta_neutral
                    .parallel_pairs
                    .unwrap_or(DEFAULT_DN_PARALLEL_PAIRS),
                partial_liquidation_timeout_mins: delta_neutral
                    .partial_liquidation_timeout_mins
                    .unwrap_or(DEFAULT_DN_PARTIAL_TIMEOUT_MINS),
            },
            multi_token: MultiTokenConfig {
                tokens: multi_token.tokens.unwrap_or_else(default_tokens),
                position_margin: multi_token
                    .position_margin
                    .unwrap_or(DEFAULT_MT_POSITION_MARGIN),
                positions_per_account: multi_token
                    .positions_per_account
                    .unwrap_or(DEFAULT_MT_POSITIONS_PER_ACCOUNT),
                reopen_pnl_pct: multi_token
                    .reopen_pnl_pct
                    .unwrap_or(DEFAULT_MT_REOPEN_PNL_PCT),
                reinvest_pnl_pct: multi_token
                    .reinvest_pnl_pct
                    .unwrap_or(DEFAULT_MT_REINVEST_PNL_PCT),
                parallel_accounts: multi_token
                    .parallel_accounts
                    .unwrap_or(DEFAULT_MT_PARALLEL_ACCOUNTS),
                account_delay_secs: multi_token
                    .account_delay_secs
                    .unwrap_or(DEFAULT_MT_ACCOUNT_DELAY_SECS),
            },
            quota: QuotaConfig {
                volume: quota.volume.unwrap_or(DEFAULT_QUOTA_VOLUME),
                pnl: quota.pnl.unwrap_or(DEFAULT_QUOTA_PNL),
                liquidations: quota.liquidations.unwrap_or(DEFAULT_QUOTA_LIQUIDATIONS),
            },
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("ACCOUNTS_FILE") {
            if !value.trim().is_empty() {
                self.accounts_file = value;
            }
        }
        if let Ok(value) = env::var("REST_ENDPOINT") {
            if !value.trim().is_empty() {
                self.rest_endpoint = value;
            }
        }
        if let Ok(value) = env::var("DATABASE_DIR") {
            if !value.trim().is_empty() {
                self.database_dir = value;
            }
        }
        if let Ok(value) = env::var("RETRY_LIMIT") {
            if let Ok(parsed) = value.parse::<u32>() {
                self.retry_limit = parsed;
            }
        }
    }
}

fn default_tokens() -> Vec<String> {
    DEFAULT_VOLUME_TOKENS.iter().map(|t| t.to_string()).collect()
}

/// Uniform sample from an inclusive `[lo, hi]` range. Degenerate ranges
/// (`lo >= hi`) return `lo`.
pub fn sample_f(range: [f64; 2]) -> f64 {
    if range[0] >= range[1] {
        return range[0];
    }
    rand::thread_rng().gen_range(range[0]..=range[1])
}

pub fn sample_u(range: [u32; 2]) -> u32 {
    if range[0] >= range[1] {
        return range[0];
    }
    rand::thread_rng().gen_range(range[0]..=range[1])
}

pub fn sample_delay(range: [f64; 2]) -> Duration {
    Duration::from_secs_f64(sample_f(range).max(0.0))
}

pub fn pick<T>(items: &[T]) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..items.len());
    items.get(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_section() {
        let cfg = BotConfig::from_yaml(BotYaml::default());
        assert_eq!(cfg.retry_limit, DEFAULT_RETRY_LIMIT);
        assert_eq!(cfg.volume.tokens, vec!["BTC", "ETH", "SOL"]);
        assert_eq!(cfg.delta_neutral.partial_liquidation_timeout_mins, 30);
        assert_eq!(cfg.quota.liquidations, DEFAULT_QUOTA_LIQUIDATIONS);
    }

    #[test]
    fn sampling_respects_degenerate_ranges() {
        assert_eq!(sample_f([5.0, 5.0]), 5.0);
        assert_eq!(sample_u([3, 3]), 3);
        for _ in 0..50 {
            let v = sample_f([1.0, 2.0]);
            assert!((1.0..=2.0).contains(&v));
        }
    }

    #[test]
    fn pick_returns_none_on_empty_slice() {
        let empty: [u32; 0] = [];
        assert!(pick(&empty).is_none());
        assert_eq!(pick(&[7]), Some(&7));
    }
}
