use crate::errors::{CartographError, ErrorKind};
use crate::prelude::*;
use crate::types::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// How discovery authenticates against a registered account. These are
/// references into the operator's credential store; the raw secrets never
/// enter the graph and are not cached between syncs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum AccountAuth {
    Profile {
        name: String,
    },
    AssumeRole {
        role_arn: String,
        #[serde(default)]
        external_id: Option<String>,
    },
    ServicePrincipal {
        client_id: String,
        tenant_id: String,
    },
    ServiceAccount {
        key_path: String,
    },
    Kubeconfig {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        context: Option<String>,
    },
    Default,
}

/// A cloud account/subscription/project registered for discovery.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CloudAccount {
    pub id: String,
    pub provider: Provider,
    pub native_account_id: String,
    pub name: String,
    pub tenant_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub regions: Vec<String>,
    pub auth: AccountAuth,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    pub provider: Option<Provider>,
    pub tenant_id: Option<String>,
    pub enabled_only: bool,
}

/// In-memory registry of cloud accounts. Mutations are atomic per record
/// behind an `RwLock`; readers see a coherent copy.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: RwLock<BTreeMap<String, CloudAccount>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        AccountRegistry::default()
    }

    pub fn register(&self, account: CloudAccount) -> Result<()> {
        if account.id.is_empty() {
            return Err(ErrorKind::Validation("account id must not be empty".to_string()).into());
        }
        if account.tenant_id.is_empty() {
            return Err(
                ErrorKind::Validation("account tenantId must not be empty".to_string()).into(),
            );
        }
        let mut accounts = self.accounts.write().expect("account registry poisoned");
        accounts.insert(account.id.clone(), account);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<CloudAccount> {
        let accounts = self.accounts.read().expect("account registry poisoned");
        accounts
            .get(id)
            .cloned()
            .ok_or_else(|| ErrorKind::AccountNotFound(id.to_string()).into())
    }

    pub fn update<F>(&self, id: &str, mutate: F) -> Result<CloudAccount>
    where
        F: FnOnce(&mut CloudAccount),
    {
        let mut accounts = self.accounts.write().expect("account registry poisoned");
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| CartographError::from(ErrorKind::AccountNotFound(id.to_string())))?;
        mutate(account);
        Ok(account.clone())
    }

    pub fn remove(&self, id: &str) -> Result<CloudAccount> {
        let mut accounts = self.accounts.write().expect("account registry poisoned");
        accounts
            .remove(id)
            .ok_or_else(|| ErrorKind::AccountNotFound(id.to_string()).into())
    }

    /// Accounts matching the filter, ordered by id.
    pub fn list(&self, filter: &AccountFilter) -> Vec<CloudAccount> {
        let accounts = self.accounts.read().expect("account registry poisoned");
        accounts
            .values()
            .filter(|account| {
                if filter.enabled_only && !account.enabled {
                    return false;
                }
                if let Some(provider) = filter.provider {
                    if account.provider != provider {
                        return false;
                    }
                }
                if let Some(tenant) = &filter.tenant_id {
                    if account.tenant_id != *tenant {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    pub fn count_for_tenant(&self, tenant_id: &str) -> usize {
        let accounts = self.accounts.read().expect("account registry poisoned");
        accounts
            .values()
            .filter(|account| account.tenant_id == tenant_id)
            .count()
    }

    pub fn touch_last_sync(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |account| account.last_sync_at = Some(at))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, provider: Provider, tenant: &str, enabled: bool) -> CloudAccount {
        CloudAccount {
            id: id.to_string(),
            provider,
            native_account_id: format!("native-{id}"),
            name: format!("Account {id}"),
            tenant_id: tenant.to_string(),
            enabled,
            regions: vec!["us-east-1".to_string()],
            auth: AccountAuth::Default,
            tags: BTreeMap::new(),
            last_sync_at: None,
        }
    }

    #[test]
    fn crud_round_trip() {
        let registry = AccountRegistry::new();
        registry
            .register(account("a1", Provider::Aws, "t1", true))
            .unwrap();
        let loaded = registry.get("a1").unwrap();
        assert_eq!(loaded.name, "Account a1");

        registry
            .update("a1", |acc| acc.enabled = false)
            .unwrap();
        assert!(!registry.get("a1").unwrap().enabled);

        registry.remove("a1").unwrap();
        assert!(registry.get("a1").is_err());
    }

    #[test]
    fn list_filters_by_provider_tenant_enabled() {
        let registry = AccountRegistry::new();
        registry
            .register(account("a1", Provider::Aws, "t1", true))
            .unwrap();
        registry
            .register(account("a2", Provider::Azure, "t1", true))
            .unwrap();
        registry
            .register(account("a3", Provider::Aws, "t2", false))
            .unwrap();

        let aws = registry.list(&AccountFilter {
            provider: Some(Provider::Aws),
            ..Default::default()
        });
        assert_eq!(aws.len(), 2);

        let enabled_t1: Vec<String> = registry
            .list(&AccountFilter {
                tenant_id: Some("t1".to_string()),
                enabled_only: true,
                ..Default::default()
            })
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(enabled_t1, vec!["a1", "a2"]);
        assert_eq!(registry.count_for_tenant("t1"), 2);
    }

    #[test]
    fn rejects_empty_identifiers() {
        let registry = AccountRegistry::new();
        let mut bad = account("", Provider::Aws, "t1", true);
        assert!(registry.register(bad.clone()).is_err());
        bad.id = "a1".to_string();
        bad.tenant_id = String::new();
        assert!(registry.register(bad).is_err());
    }

    #[test]
    fn touch_last_sync_updates_bookkeeping() {
        let registry = AccountRegistry::new();
        registry
            .register(account("a1", Provider::Aws, "t1", true))
            .unwrap();
        let now = Utc::now();
        registry.touch_last_sync("a1", now).unwrap();
        assert_eq!(registry.get("a1").unwrap().last_sync_at, Some(now));
    }
}
