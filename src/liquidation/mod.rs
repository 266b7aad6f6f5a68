pub mod delta_neutral;
pub mod multi_token;

use lazy_static::lazy_static;
use std::collections::HashMap;

/// Both liquidation modes run at the exchange's maximum leverage tier.
pub const LIQUIDATION_LEVERAGE: u32 = 50;

const DEFAULT_TOKEN_LEVERAGE: u32 = 10;

lazy_static! {
    /// Effective leverage tier per token, used for PnL normalization.
    static ref TOKEN_LEVERAGE: HashMap<&'static str, u32> = HashMap::from([
        ("BTC", 50),
        ("ETH", 50),
        ("SOL", 50),
        ("XRP", 20),
        ("DOGE", 20),
        ("SUI", 20),
    ]);
}

pub fn token_leverage(token: &str) -> u32 {
    TOKEN_LEVERAGE
        .get(token)
        .copied()
        .unwrap_or(DEFAULT_TOKEN_LEVERAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tokens_fall_back_to_the_default_tier() {
        assert_eq!(token_leverage("BTC"), 50);
        assert_eq!(token_leverage("PEPE"), DEFAULT_TOKEN_LEVERAGE);
    }
}
