use crate::config::{StorageConfig, StorageKind, TenancyConfig};
use crate::errors::ErrorKind;
use crate::prelude::*;
use crate::storage::embedded::EmbeddedStorage;
use crate::storage::relational::RelationalStorage;
use crate::storage::GraphStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TenantIsolation {
    /// Relational schema (table prefix) per tenant.
    Schema,
    /// Separate database/file per tenant.
    Database,
    /// Key prefix inside one store.
    #[default]
    Prefix,
    /// Everything in one store; for single-tenant deployments.
    Shared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantLimits {
    #[serde(default)]
    pub max_accounts: Option<usize>,
    #[serde(default)]
    pub max_nodes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    pub id: String,
    pub name: String,
    pub active: bool,
    #[serde(default)]
    pub limits: TenantLimits,
    pub created_at: DateTime<Utc>,
}

/// Owns the storage factory and a cache of per-tenant storage handles.
/// Handles are created and initialized lazily on first use; deactivated
/// tenants are refused.
#[derive(Debug)]
pub struct TenantManager {
    storage_config: StorageConfig,
    isolation: TenantIsolation,
    default_limits: TenantLimits,
    tenants: RwLock<HashMap<String, TenantRecord>>,
    handles: tokio::sync::Mutex<HashMap<String, Arc<dyn GraphStorage>>>,
}

impl TenantManager {
    pub fn new(storage_config: StorageConfig, tenancy: &TenancyConfig) -> Self {
        TenantManager {
            storage_config,
            isolation: tenancy.isolation,
            default_limits: TenantLimits {
                max_accounts: tenancy.max_accounts,
                max_nodes: tenancy.max_nodes,
            },
            tenants: RwLock::new(HashMap::new()),
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn register_tenant(&self, id: &str, name: &str) -> Result<TenantRecord> {
        self.register_tenant_with_limits(id, name, self.default_limits)
    }

    pub fn register_tenant_with_limits(
        &self,
        id: &str,
        name: &str,
        limits: TenantLimits,
    ) -> Result<TenantRecord> {
        if id.is_empty() {
            return Err(ErrorKind::Validation("tenant id must not be empty".to_string()).into());
        }
        let record = TenantRecord {
            id: id.to_string(),
            name: name.to_string(),
            active: true,
            limits,
            created_at: Utc::now(),
        };
        let mut tenants = self.tenants.write().expect("tenant registry poisoned");
        tenants.insert(id.to_string(), record.clone());
        Ok(record)
    }

    pub fn get_tenant(&self, id: &str) -> Result<TenantRecord> {
        let tenants = self.tenants.read().expect("tenant registry poisoned");
        tenants
            .get(id)
            .cloned()
            .ok_or_else(|| ErrorKind::TenantNotFound(id.to_string()).into())
    }

    pub fn list_tenants(&self) -> Vec<TenantRecord> {
        let tenants = self.tenants.read().expect("tenant registry poisoned");
        let mut records: Vec<TenantRecord> = tenants.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut tenants = self.tenants.write().expect("tenant registry poisoned");
        let tenant = tenants
            .get_mut(id)
            .ok_or_else(|| crate::errors::CartographError::from(ErrorKind::TenantNotFound(
                id.to_string(),
            )))?;
        tenant.active = active;
        Ok(())
    }

    pub fn limits(&self, id: &str) -> Result<TenantLimits> {
        Ok(self.get_tenant(id)?.limits)
    }

    /// The tenant's storage handle, built and initialized on first request.
    pub async fn get_storage(&self, tenant_id: &str) -> Result<Arc<dyn GraphStorage>> {
        let tenant = self.get_tenant(tenant_id)?;
        if !tenant.active {
            return Err(ErrorKind::TenantInactive(tenant_id.to_string()).into());
        }

        let key = self.handle_key(tenant_id);
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&key) {
            return Ok(handle.clone());
        }

        let handle = self.build_storage(tenant_id)?;
        handle.initialize().await?;
        info!("tenancy: initialized storage for tenant {tenant_id} (key {key})");
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    /// Closes and destroys the tenant's storage. Irreversible; the tenant
    /// record itself is removed as well.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        let key = self.handle_key(tenant_id);
        let handle = {
            let mut handles = self.handles.lock().await;
            handles.remove(&key)
        };
        if let Some(handle) = handle {
            handle.close().await?;
        }
        if let Some(path) = self.tenant_file(tenant_id) {
            match std::fs::remove_file(&path) {
                Ok(()) => info!("tenancy: removed storage file {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("tenancy: failed to remove {}: {err}", path.display()),
            }
        }
        let mut tenants = self.tenants.write().expect("tenant registry poisoned");
        tenants.remove(tenant_id);
        Ok(())
    }

    /// Closes every cached handle; used on shutdown.
    pub async fn close_all(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        for (key, handle) in handles.drain() {
            if let Err(err) = handle.close().await {
                warn!("tenancy: closing storage {key} failed: {err}");
            }
        }
        Ok(())
    }

    fn handle_key(&self, tenant_id: &str) -> String {
        match self.isolation {
            TenantIsolation::Shared => "shared".to_string(),
            _ => format!("tenant:{tenant_id}"),
        }
    }

    /// Path of the tenant's dedicated storage file, when isolation and the
    /// backend imply one.
    fn tenant_file(&self, tenant_id: &str) -> Option<PathBuf> {
        if self.storage_config.connection.is_empty()
            || self.storage_config.connection == ":memory:"
        {
            return None;
        }
        match self.isolation {
            TenantIsolation::Database => {
                Some(derive_tenant_path(&self.storage_config.connection, tenant_id))
            }
            TenantIsolation::Prefix | TenantIsolation::Schema
                if self.storage_config.kind == StorageKind::Embedded =>
            {
                Some(derive_tenant_path(&self.storage_config.connection, tenant_id))
            }
            _ => None,
        }
    }

    fn build_storage(&self, tenant_id: &str) -> Result<Arc<dyn GraphStorage>> {
        match self.storage_config.kind {
            StorageKind::Embedded => {
                // The embedded store is a per-process table set; every
                // isolation mode except `shared` gets its own instance, with
                // a derived file when persistence is configured.
                let storage = match self.tenant_file(tenant_id) {
                    Some(path) => EmbeddedStorage::with_path(path),
                    None if !self.storage_config.connection.is_empty()
                        && self.storage_config.connection != ":memory:"
                        && self.isolation == TenantIsolation::Shared =>
                    {
                        EmbeddedStorage::with_path(&self.storage_config.connection)
                    }
                    None => EmbeddedStorage::new(),
                };
                Ok(Arc::new(storage))
            }
            StorageKind::Relational => {
                let storage = match self.isolation {
                    TenantIsolation::Database => {
                        let path = derive_tenant_path(&self.storage_config.connection, tenant_id);
                        RelationalStorage::open(&path.to_string_lossy())?
                    }
                    TenantIsolation::Schema | TenantIsolation::Prefix => {
                        RelationalStorage::open_with_namespace(
                            &self.storage_config.connection,
                            Some(tenant_id),
                        )?
                    }
                    TenantIsolation::Shared => {
                        RelationalStorage::open(&self.storage_config.connection)?
                    }
                };
                Ok(Arc::new(storage))
            }
        }
    }
}

fn derive_tenant_path(connection: &str, tenant_id: &str) -> PathBuf {
    let base = PathBuf::from(connection);
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "graph".to_string());
    let extension = base
        .extension()
        .map(|s| s.to_string_lossy().to_string());
    let file = match extension {
        Some(ext) => format!("{stem}-{tenant_id}.{ext}"),
        None => format!("{stem}-{tenant_id}"),
    };
    match base.parent() {
        Some(parent) => parent.join(file),
        None => PathBuf::from(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NodeFilter;
    use crate::types::{NodeInput, NodeStatus, Provider, ResourceType};
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn manager(isolation: TenantIsolation) -> TenantManager {
        let storage = StorageConfig {
            kind: StorageKind::Embedded,
            connection: String::new(),
        };
        let tenancy = TenancyConfig {
            max_accounts: Some(5),
            max_nodes: Some(100),
            isolation,
        };
        TenantManager::new(storage, &tenancy)
    }

    fn node_input(native_id: &str) -> NodeInput {
        NodeInput {
            native_id: native_id.to_string(),
            name: native_id.to_string(),
            provider: Provider::Aws,
            account: "111111111111".to_string(),
            region: "us-east-1".to_string(),
            resource_type: ResourceType::Compute,
            status: NodeStatus::Running,
            tags: BTreeMap::new(),
            metadata: Map::new(),
            cost_monthly: None,
            owner: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn storage_is_isolated_per_tenant() {
        let manager = manager(TenantIsolation::Prefix);
        manager.register_tenant("t1", "Tenant One").unwrap();
        manager.register_tenant("t2", "Tenant Two").unwrap();

        let s1 = manager.get_storage("t1").await.unwrap();
        let s2 = manager.get_storage("t2").await.unwrap();
        s1.upsert_node(&node_input("i-1"), "s").await.unwrap();

        assert_eq!(s1.query_nodes(&NodeFilter::default()).await.unwrap().len(), 1);
        assert!(s2.query_nodes(&NodeFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_isolation_reuses_one_store() {
        let manager = manager(TenantIsolation::Shared);
        manager.register_tenant("t1", "One").unwrap();
        manager.register_tenant("t2", "Two").unwrap();
        let s1 = manager.get_storage("t1").await.unwrap();
        let s2 = manager.get_storage("t2").await.unwrap();
        s1.upsert_node(&node_input("i-1"), "s").await.unwrap();
        assert_eq!(s2.query_nodes(&NodeFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inactive_tenant_is_refused() {
        let manager = manager(TenantIsolation::Prefix);
        manager.register_tenant("t1", "One").unwrap();
        manager.set_active("t1", false).unwrap();
        let err = manager.get_storage("t1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TenantInactive(_)));
    }

    #[tokio::test]
    async fn unknown_tenant_is_an_error() {
        let manager = manager(TenantIsolation::Prefix);
        let err = manager.get_storage("nope").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn delete_tenant_is_terminal() {
        let manager = manager(TenantIsolation::Prefix);
        manager.register_tenant("t1", "One").unwrap();
        manager.get_storage("t1").await.unwrap();
        manager.delete_tenant("t1").await.unwrap();
        assert!(manager.get_tenant("t1").is_err());
    }

    #[test]
    fn tenant_paths_derive_from_connection() {
        let path = derive_tenant_path("/var/lib/cartograph/graph.db", "acme");
        assert_eq!(
            path,
            PathBuf::from("/var/lib/cartograph/graph-acme.db")
        );
    }

    #[test]
    fn limits_come_from_config_defaults() {
        let manager = manager(TenantIsolation::Prefix);
        manager.register_tenant("t1", "One").unwrap();
        let limits = manager.limits("t1").unwrap();
        assert_eq!(limits.max_accounts, Some(5));
        assert_eq!(limits.max_nodes, Some(100));
    }
}
