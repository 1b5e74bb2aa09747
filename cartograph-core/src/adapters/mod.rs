use crate::errors::ErrorCategory;
use crate::prelude::*;
use crate::registry::CloudAccount;
use crate::retry::RetryPolicy;
use crate::types::{EdgeInput, NodeInput, Provider, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod fixture;

/// Safety cap on provider API pagination.
pub const DEFAULT_PAGE_CAP: usize = 100;

/// Metadata key adapters stamp on every emitted node for tracing.
pub const DISCOVERY_SOURCE_KEY: &str = "discoverySource";

/// Per-run discovery parameters handed to an adapter by the engine.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    /// Restricts discovery to these resource types; `None` means all.
    pub resource_types: Option<BTreeSet<ResourceType>>,
    pub page_cap: usize,
    pub retry: RetryPolicy,
}

impl Default for DiscoveryContext {
    fn default() -> Self {
        DiscoveryContext {
            resource_types: None,
            page_cap: DEFAULT_PAGE_CAP,
            retry: RetryPolicy::default(),
        }
    }
}

impl DiscoveryContext {
    pub fn wants(&self, resource_type: ResourceType) -> bool {
        match &self.resource_types {
            None => true,
            Some(types) => types.contains(&resource_type),
        }
    }
}

/// A scoped, non-fatal discovery failure. Terminal errors for one resource
/// class land here; the rest of the discovery proceeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryError {
    pub scope: String,
    pub message: String,
    #[serde(default = "unknown_category")]
    pub category: ErrorCategory,
}

fn unknown_category() -> ErrorCategory {
    ErrorCategory::Unknown
}

/// What one adapter run produced for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    #[serde(default)]
    pub nodes: Vec<NodeInput>,
    #[serde(default)]
    pub edges: Vec<EdgeInput>,
    #[serde(default)]
    pub errors: Vec<DiscoveryError>,
}

impl Discovery {
    pub fn merge(&mut self, other: Discovery) {
        self.nodes.extend(other.nodes);
        self.edges.extend(other.edges);
        self.errors.extend(other.errors);
    }
}

/// Provider-specific discovery. Implementations paginate the provider APIs
/// up to `context.page_cap`, retry transient failures with the supplied
/// policy, observe the cancellation token between pages, and stamp
/// `metadata.discoverySource` on emitted nodes. Edges may only reference
/// nodes of the same batch or globally addressable native ids.
#[async_trait]
pub trait DiscoveryAdapter: Send + Sync + std::fmt::Debug {
    fn provider(&self) -> Provider;

    async fn discover(
        &self,
        account: &CloudAccount,
        context: &DiscoveryContext,
        cancel: &CancellationToken,
    ) -> Result<Discovery>;
}

/// Provider → adapter dispatch table. Read-only after setup.
#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn DiscoveryAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn DiscoveryAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn DiscoveryAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.adapters.keys().copied().collect();
        providers.sort();
        providers
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
