use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::BotConfig;
use crate::exchange::rest::RestExchangeClient;
use crate::exchange::{ExchangeClient, ExchangeError};

const PROXY_PLACEHOLDER: &str = "ip:port:login:pass";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_api_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_address: Option<String>,
}

/// Credential store backing `accounts.json`. Keyed by account id; kept in a
/// BTreeMap so iteration order is stable across runs.
pub struct AccountStore {
    path: PathBuf,
    entries: BTreeMap<String, StoredAccount>,
}

impl AccountStore {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read accounts file {}", path_ref.display()))?;
        let entries: BTreeMap<String, StoredAccount> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse accounts file {}", path_ref.display()))?;
        if entries.is_empty() {
            bail!("accounts file {} holds no accounts", path_ref.display());
        }
        Ok(Self {
            path: path_ref.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records freshly discovered deposit addresses and persists the store if
    /// anything changed.
    pub fn record_deposit_addresses(&mut self, updates: &[(String, String)]) -> Result<()> {
        let mut modified = false;
        for (id, address) in updates {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.deposit_address.as_deref() != Some(address.as_str()) {
                    entry.deposit_address = Some(address.clone());
                    modified = true;
                }
            }
        }
        if modified {
            let serialized = serde_json::to_string_pretty(&self.entries)?;
            fs::write(&self.path, serialized)
                .with_context(|| format!("failed to write {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Main-account handles only, for modes that never touch sub-accounts.
    pub fn main_handles(&self, cfg: &BotConfig) -> Result<Vec<AccountHandle>> {
        self.entries
            .iter()
            .map(|(id, entry)| {
                build_handle(
                    cfg,
                    id.clone(),
                    &entry.api_key,
                    &entry.api_secret,
                    entry.proxy.as_deref(),
                    entry.deposit_address.clone(),
                )
            })
            .collect()
    }

    /// Main/sub pairs for the modes that rebalance collateral. Every entry
    /// must carry sub-account credentials.
    pub fn account_pairs(&self, cfg: &BotConfig) -> Result<Vec<AccountPair>> {
        self.entries
            .iter()
            .map(|(id, entry)| {
                let (Some(sub_key), Some(sub_secret)) =
                    (entry.sub_api_key.as_deref(), entry.sub_api_secret.as_deref())
                else {
                    bail!("account {} has no sub-account credentials", id);
                };
                let main = build_handle(
                    cfg,
                    id.clone(),
                    &entry.api_key,
                    &entry.api_secret,
                    entry.proxy.as_deref(),
                    entry.deposit_address.clone(),
                )?;
                let sub = build_handle(
                    cfg,
                    format!("{}_sub", id),
                    sub_key,
                    sub_secret,
                    entry.proxy.as_deref(),
                    None,
                )?;
                Ok(AccountPair { main, sub })
            })
            .collect()
    }
}

fn build_handle(
    cfg: &BotConfig,
    id: String,
    api_key: &str,
    api_secret: &str,
    proxy: Option<&str>,
    known_address: Option<String>,
) -> Result<AccountHandle> {
    let proxy = proxy.filter(|p| !p.is_empty() && *p != PROXY_PLACEHOLDER);
    let client = RestExchangeClient::new(&cfg.rest_endpoint, api_key, api_secret, proxy, &cfg.chain)
        .with_context(|| format!("failed to build exchange client for {}", id))?;
    Ok(AccountHandle::new(
        id,
        api_key.to_string(),
        Arc::new(client),
        known_address,
    ))
}

/// One tradable account. Immutable after construction except for the lazily
/// cached deposit address.
#[derive(Clone)]
pub struct AccountHandle {
    pub id: String,
    pub api_key: String,
    client: Arc<dyn ExchangeClient>,
    deposit_address: Arc<OnceCell<String>>,
}

impl AccountHandle {
    pub fn new(
        id: String,
        api_key: String,
        client: Arc<dyn ExchangeClient>,
        known_address: Option<String>,
    ) -> Self {
        Self {
            id,
            api_key,
            client,
            deposit_address: Arc::new(OnceCell::new_with(known_address)),
        }
    }

    #[cfg(test)]
    pub fn for_tests(id: &str, client: Arc<dyn ExchangeClient>) -> Self {
        Self::new(id.to_string(), format!("key-{}", id), client, None)
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    /// The account's deposit address, fetched once and cached.
    pub async fn deposit_address(&self) -> Result<&String, ExchangeError> {
        self.deposit_address
            .get_or_try_init(|| async { self.client.get_deposit_address().await })
            .await
    }

    pub fn cached_deposit_address(&self) -> Option<&String> {
        self.deposit_address.get()
    }
}

impl fmt::Debug for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountHandle")
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AccountPair {
    pub main: AccountHandle,
    pub sub: AccountHandle,
}

impl AccountPair {
    pub fn id(&self) -> &str {
        &self.main.id
    }

    #[cfg(test)]
    pub fn for_tests(
        id: &str,
        main: Arc<dyn ExchangeClient>,
        sub: Arc<dyn ExchangeClient>,
    ) -> Self {
        Self {
            main: AccountHandle::for_tests(id, main),
            sub: AccountHandle::for_tests(&format!("{}_sub", id), sub),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_store(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_rejects_empty_store() {
        let file = write_store("{}");
        assert!(AccountStore::load(file.path()).is_err());
    }

    #[test]
    fn deposit_address_write_back_persists() {
        let file = write_store(
            r#"{"acc1": {"api_key": "k", "api_secret": "s", "proxy": "ip:port:login:pass"}}"#,
        );
        let mut store = AccountStore::load(file.path()).unwrap();
        store
            .record_deposit_addresses(&[("acc1".to_string(), "addr-xyz".to_string())])
            .unwrap();

        let reloaded = AccountStore::load(file.path()).unwrap();
        assert_eq!(
            reloaded.entries["acc1"].deposit_address.as_deref(),
            Some("addr-xyz")
        );
    }

    #[test]
    fn pairs_require_sub_credentials() {
        let file = write_store(r#"{"acc1": {"api_key": "k", "api_secret": "s"}}"#);
        let store = AccountStore::load(file.path()).unwrap();
        let cfg = crate::config::BotConfig::from_env_or_yaml().unwrap();
        assert!(store.account_pairs(&cfg).is_err());
        assert_eq!(store.main_handles(&cfg).unwrap().len(), 1);
    }
}
