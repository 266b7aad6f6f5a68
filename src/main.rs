use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::str::FromStr;
use volbot::config::BotConfig;
use volbot::manager::TradingManager;

const USAGE: &str = "usage: volbot <mode>\n\
    modes:\n\
    \tvolume                organic volume trading cycles\n\
    \tdelta-neutral         hedged-pair liquidation farming\n\
    \tdefault-liquidations  per-account multi-token liquidation farming\n\
    \tclose-all             force-close all positions on all accounts\n\
    \tparse-accounts        collect and export account statistics\n\
    \twithdraw-all          sweep main-account balances to sub-accounts";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    let Some(mode) = env::args().nth(1) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let cfg = BotConfig::from_env_or_yaml().expect("invalid configuration");
    let mut manager = TradingManager::bootstrap(cfg)
        .await
        .expect("failed to initialize trading manager");

    log::info!("Starting volbot in {} mode...", mode);
    match mode.as_str() {
        "volume" => manager.run_volume_mode().await,
        "delta-neutral" => manager.run_delta_neutral().await,
        "default-liquidations" => manager.run_default_liquidations().await,
        "close-all" => manager.close_all_positions().await,
        "parse-accounts" => manager.parse_accounts().await,
        "withdraw-all" => manager.withdraw_all_balances().await,
        other => {
            eprintln!("unknown mode '{}'\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}
