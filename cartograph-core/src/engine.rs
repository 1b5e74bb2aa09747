use crate::adapters::{AdapterRegistry, Discovery, DiscoveryContext, DEFAULT_PAGE_CAP};
use crate::config::SyncConfig;
use crate::errors::{classify, CartographError, ErrorCategory, ErrorKind};
use crate::inference::{derive_attribute_edges, derive_cross_account_edges};
use crate::native_id::resource_suffix;
use crate::prelude::*;
use crate::registry::{AccountFilter, AccountRegistry, CloudAccount};
use crate::retry::RetryPolicy;
use crate::storage::{
    ChangeQuery, EdgeDirection, EdgeFilter, GraphStorage, MissingScope, NodeFilter,
};
use crate::tenancy::TenantManager;
use crate::types::{
    ChangeRecord, ChangeType, EdgeDefinition, EdgeInput, GraphEdge, GraphNode, GraphStats,
    NodeRef, Provider, RelationshipType, ResourceType, DEPENDENCY_RELATIONSHIPS,
    IMPACT_RELATIONSHIPS, LIGHT_SYNC_RESOURCE_TYPES,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_TRAVERSAL_DEPTH: u32 = 8;

/// How many node upserts happen between yields back to the runtime during a
/// large reconcile batch.
const UPSERT_YIELD_STRIDE: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub retry: RetryPolicy,
    pub page_cap: usize,
    pub cross_account_inference: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sync: SyncConfig::default(),
            retry: RetryPolicy::default(),
            page_cap: DEFAULT_PAGE_CAP,
            cross_account_inference: true,
        }
    }
}

/// What one `sync` call covers. An unset field does not constrain; a full
/// sync is one without a resource type restriction.
#[derive(Debug, Clone, Default)]
pub struct SyncScope {
    pub tenant_id: Option<String>,
    pub account_id: Option<String>,
    pub provider: Option<Provider>,
    pub resource_types: Option<BTreeSet<ResourceType>>,
}

impl SyncScope {
    pub fn for_tenant(tenant_id: &str) -> Self {
        SyncScope {
            tenant_id: Some(tenant_id.to_string()),
            ..Default::default()
        }
    }

    /// The light-sync scope: frequently changing resource types only.
    pub fn light(tenant_id: &str) -> Self {
        SyncScope {
            tenant_id: Some(tenant_id.to_string()),
            resource_types: Some(LIGHT_SYNC_RESOURCE_TYPES.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn is_full(&self) -> bool {
        self.resource_types.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub scope: String,
    pub category: ErrorCategory,
    pub message: String,
}

impl SyncError {
    fn from_err(scope: &str, err: &CartographError) -> Self {
        let class = classify(err);
        SyncError {
            scope: scope.to_string(),
            category: class.category,
            message: class.message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub sync_id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub provider: Provider,
    pub nodes_discovered: usize,
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub edges_discovered: usize,
    pub edges_created: usize,
    pub duration_ms: u64,
    pub errors: Vec<SyncError>,
}

impl SyncResult {
    fn empty(sync_id: String, tenant_id: &str, account: &CloudAccount) -> Self {
        SyncResult {
            sync_id,
            tenant_id: tenant_id.to_string(),
            account_id: account.id.clone(),
            provider: account.provider,
            nodes_discovered: 0,
            nodes_created: 0,
            nodes_updated: 0,
            edges_discovered: 0,
            edges_created: 0,
            duration_ms: 0,
            errors: Vec::new(),
        }
    }

    pub fn has_limit_error(&self) -> bool {
        self.errors
            .iter()
            .any(|error| error.category == ErrorCategory::Limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastRadius {
    pub root_node_id: String,
    pub nodes: BTreeMap<String, GraphNode>,
    pub hops: BTreeMap<u32, Vec<String>>,
    pub total_cost_monthly: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyChain {
    pub root_node_id: String,
    pub direction: EdgeDirection,
    pub levels: BTreeMap<u32, Vec<String>>,
    pub nodes: BTreeMap<String, GraphNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostContributor {
    pub node_id: String,
    pub name: String,
    pub cost_monthly: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostReport {
    pub label: String,
    pub total_monthly: f64,
    pub by_resource_type: BTreeMap<String, f64>,
    pub top_contributors: Vec<CostContributor>,
}

const TOP_COST_CONTRIBUTORS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftedNode {
    pub node: GraphNode,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub scanned_at: DateTime<Utc>,
    pub drifted_nodes: Vec<DriftedNode>,
    pub disappeared_nodes: Vec<GraphNode>,
    pub new_nodes: Vec<GraphNode>,
}

#[derive(Debug, Clone)]
struct SyncJournalEntry {
    started_at: DateTime<Utc>,
    full: bool,
}

fn new_sync_id() -> String {
    format!("{}-{}", Uuid::new_v4(), Utc::now().timestamp_millis())
}

/// Orchestrates discovery and reconciliation, and exposes the compound
/// read operations consumed by outer surfaces. All methods are
/// tenant-scoped; reads go straight to the tenant's storage.
#[derive(Debug)]
pub struct GraphEngine {
    tenants: Arc<TenantManager>,
    accounts: Arc<AccountRegistry>,
    adapters: Arc<AdapterRegistry>,
    config: EngineConfig,
    journal: Mutex<HashMap<String, Vec<SyncJournalEntry>>>,
}

impl GraphEngine {
    pub fn new(
        tenants: Arc<TenantManager>,
        accounts: Arc<AccountRegistry>,
        adapters: Arc<AdapterRegistry>,
        config: EngineConfig,
    ) -> Self {
        GraphEngine {
            tenants,
            accounts,
            adapters,
            config,
            journal: Mutex::new(HashMap::new()),
        }
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn tenants(&self) -> &TenantManager {
        &self.tenants
    }

    /// Registers an account, enforcing the tenant's `maxAccounts` limit.
    pub fn register_account(&self, account: CloudAccount) -> Result<()> {
        let limits = self.tenants.limits(&account.tenant_id)?;
        if let Some(max_accounts) = limits.max_accounts {
            if self.accounts.count_for_tenant(&account.tenant_id) >= max_accounts {
                return Err(ErrorKind::TenantLimitExceeded {
                    tenant: account.tenant_id.clone(),
                    limit: format!("maxAccounts ({max_accounts})"),
                }
                .into());
            }
        }
        self.accounts.register(account)
    }

    /// One discovery-and-reconcile pass over the scope. Per-account adapter
    /// I/O runs concurrently within a tenant; reconciliation into the
    /// tenant's storage is serialized. Partial progress survives
    /// cancellation.
    pub async fn sync(
        &self,
        scope: Option<SyncScope>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncResult>> {
        let scope = scope.unwrap_or_default();
        let filter = AccountFilter {
            provider: scope.provider,
            tenant_id: scope.tenant_id.clone(),
            enabled_only: true,
        };
        let mut accounts = self.accounts.list(&filter);
        if let Some(account_id) = &scope.account_id {
            accounts.retain(|account| account.id == *account_id);
        }

        let mut by_tenant: BTreeMap<String, Vec<CloudAccount>> = BTreeMap::new();
        for account in accounts {
            by_tenant
                .entry(account.tenant_id.clone())
                .or_default()
                .push(account);
        }

        let mut results = Vec::new();
        for (tenant_id, tenant_accounts) in by_tenant {
            let started_at = Utc::now();
            let storage = match self.tenants.get_storage(&tenant_id).await {
                Ok(storage) => storage,
                Err(err) => {
                    warn!("sync: tenant {tenant_id} unavailable: {err}");
                    for account in &tenant_accounts {
                        let mut result = SyncResult::empty(new_sync_id(), &tenant_id, account);
                        result.errors.push(SyncError::from_err("tenant", &err));
                        results.push(result);
                    }
                    continue;
                }
            };

            let tenant_results = self
                .sync_tenant(&tenant_id, storage, tenant_accounts, &scope, cancel)
                .await;
            results.extend(tenant_results);

            let mut journal = self.journal.lock().expect("sync journal poisoned");
            journal
                .entry(tenant_id)
                .or_default()
                .push(SyncJournalEntry {
                    started_at,
                    full: scope.is_full(),
                });

            if cancel.is_cancelled() {
                break;
            }
        }
        Ok(results)
    }

    async fn sync_tenant(
        &self,
        tenant_id: &str,
        storage: Arc<dyn GraphStorage>,
        accounts: Vec<CloudAccount>,
        scope: &SyncScope,
        cancel: &CancellationToken,
    ) -> Vec<SyncResult> {
        let context = DiscoveryContext {
            resource_types: scope.resource_types.clone(),
            page_cap: self.config.page_cap,
            retry: self.config.retry.clone(),
        };

        // Adapter I/O for all accounts of the tenant runs concurrently;
        // reconciliation below is strictly sequential.
        let discovery_futures = accounts.iter().map(|account| {
            let adapter = self.adapters.get(account.provider);
            let context = context.clone();
            let cancel = cancel.clone();
            let account = account.clone();
            async move {
                let sync_id = new_sync_id();
                let started = Instant::now();
                let outcome = match adapter {
                    None => Err(CartographError::from(ErrorKind::AdapterMissing(
                        account.provider.to_string(),
                    ))),
                    Some(adapter) => adapter.discover(&account, &context, &cancel).await,
                };
                (account, sync_id, started, outcome)
            }
        });
        let discoveries = futures::future::join_all(discovery_futures).await;

        let mut results = Vec::new();
        let mut limit_hit = false;
        for (account, sync_id, started, outcome) in discoveries {
            if limit_hit {
                let mut result = SyncResult::empty(sync_id, tenant_id, &account);
                result.errors.push(SyncError {
                    scope: "tenant".to_string(),
                    category: ErrorCategory::Limit,
                    message: "tenant node limit reached earlier in this cycle".to_string(),
                });
                results.push(result);
                continue;
            }
            if cancel.is_cancelled() {
                let mut result = SyncResult::empty(sync_id, tenant_id, &account);
                result.errors.push(SyncError {
                    scope: "sync".to_string(),
                    category: ErrorCategory::Unknown,
                    message: "cancelled before reconcile".to_string(),
                });
                results.push(result);
                continue;
            }

            let result = match outcome {
                Err(err) => {
                    let mut result = SyncResult::empty(sync_id, tenant_id, &account);
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    result.errors.push(SyncError::from_err("discover", &err));
                    result
                }
                Ok(discovery) => {
                    self.reconcile_account(
                        tenant_id,
                        storage.as_ref(),
                        &account,
                        sync_id,
                        started,
                        scope,
                        discovery,
                        cancel,
                    )
                    .await
                }
            };
            limit_hit = result.has_limit_error();
            results.push(result);
        }

        if scope.is_full()
            && self.config.cross_account_inference
            && !limit_hit
            && !cancel.is_cancelled()
            && results.len() > 1
        {
            if let Err(err) = self
                .cross_account_pass(storage.as_ref(), &mut results)
                .await
            {
                warn!("sync: cross-account inference for {tenant_id} failed: {err}");
            }
        }

        results
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_account(
        &self,
        tenant_id: &str,
        storage: &dyn GraphStorage,
        account: &CloudAccount,
        sync_id: String,
        started: Instant,
        scope: &SyncScope,
        discovery: Discovery,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let mut result = SyncResult::empty(sync_id.clone(), tenant_id, account);
        for issue in &discovery.errors {
            result.errors.push(SyncError {
                scope: issue.scope.clone(),
                category: issue.category,
                message: issue.message.clone(),
            });
        }

        let max_nodes = self
            .tenants
            .limits(tenant_id)
            .ok()
            .and_then(|limits| limits.max_nodes);
        let mut node_count = match storage.get_stats().await {
            Ok(stats) => stats.node_count as usize,
            Err(_) => 0,
        };

        result.nodes_discovered = discovery.nodes.len();
        let mut upserted_ids = Vec::new();
        for (index, input) in discovery.nodes.iter().enumerate() {
            if cancel.is_cancelled() {
                result.errors.push(SyncError {
                    scope: "reconcile".to_string(),
                    category: ErrorCategory::Unknown,
                    message: "cancelled mid-reconcile; partial progress kept".to_string(),
                });
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
            if index > 0 && index % UPSERT_YIELD_STRIDE == 0 {
                tokio::task::yield_now().await;
            }

            if let Some(max) = max_nodes {
                if node_count >= max {
                    let exists = storage
                        .get_node(&input.node_id())
                        .await
                        .ok()
                        .flatten()
                        .is_some();
                    if !exists {
                        result.errors.push(SyncError {
                            scope: input.node_id(),
                            category: ErrorCategory::Limit,
                            message: format!("tenant {tenant_id} reached maxNodes ({max})"),
                        });
                        break;
                    }
                }
            }

            match storage.upsert_node(input, &sync_id).await {
                Ok(outcome) => {
                    if outcome.created {
                        result.nodes_created += 1;
                        node_count += 1;
                    }
                    if outcome.updated {
                        result.nodes_updated += 1;
                    }
                    upserted_ids.push(input.node_id());
                }
                Err(err) => {
                    // One bad node must not abort the batch.
                    result
                        .errors
                        .push(SyncError::from_err(&input.node_id(), &err));
                }
            }
        }

        result.edges_discovered = discovery.edges.len();
        for edge in &discovery.edges {
            match self.resolve_edge(storage, edge).await {
                Ok(Some(definition)) => match storage.upsert_edge(&definition).await {
                    Ok(outcome) => {
                        if outcome.created {
                            result.edges_created += 1;
                        }
                    }
                    Err(err) => {
                        result
                            .errors
                            .push(SyncError::from_err(&definition.edge_id(), &err));
                    }
                },
                Ok(None) => {
                    warn!(
                        "sync: dropping edge with unresolvable endpoint: {:?} -> {:?}",
                        edge.source, edge.target
                    );
                    result.errors.push(SyncError {
                        scope: "edge-resolution".to_string(),
                        category: ErrorCategory::NotFound,
                        message: format!(
                            "unresolvable endpoint for {} edge",
                            edge.relationship_type
                        ),
                    });
                }
                Err(err) => result.errors.push(SyncError::from_err("edge", &err)),
            }
        }

        // Enrichment: derive edges from attribute evidence of this batch.
        match self.enrich_from_attributes(storage, &upserted_ids).await {
            Ok(created) => result.edges_created += created,
            Err(err) => result.errors.push(SyncError::from_err("enrichment", &err)),
        }

        if scope.is_full() {
            let missing_scope = MissingScope {
                provider: Some(account.provider),
                account: Some(account.native_account_id.clone()),
                grace_syncs: self.config.sync.disappearance_grace_syncs,
            };
            match storage.mark_missing(&sync_id, &missing_scope).await {
                Ok(affected) if !affected.is_empty() => {
                    info!(
                        "sync: {} nodes progressed toward disappearance in {}",
                        affected.len(),
                        account.id
                    );
                }
                Ok(_) => {}
                Err(err) => result.errors.push(SyncError::from_err("mark-missing", &err)),
            }
        }

        if let Err(err) = self.accounts.touch_last_sync(&account.id, Utc::now()) {
            debug!("sync: bookkeeping for {} failed: {err}", account.id);
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "sync {}: account {} discovered={} created={} updated={} edges={} errors={}",
            result.sync_id,
            account.id,
            result.nodes_discovered,
            result.nodes_created,
            result.nodes_updated,
            result.edges_created,
            result.errors.len()
        );
        result
    }

    /// Resolves an adapter edge reference to stored node ids. Tries the
    /// composite id, then the native id, then the trailing ARN segment.
    pub async fn find_node_by_arn_or_id(
        &self,
        storage: &dyn GraphStorage,
        reference: &str,
    ) -> Result<Option<GraphNode>> {
        if let Some(node) = storage.get_node(reference).await? {
            return Ok(Some(node));
        }
        if let Some(node) = storage.find_node_by_native_id(reference).await? {
            return Ok(Some(node));
        }
        let suffix = resource_suffix(reference);
        if suffix != reference {
            return storage.find_node_by_native_id(suffix).await;
        }
        Ok(None)
    }

    async fn resolve_ref(
        &self,
        storage: &dyn GraphStorage,
        node_ref: &NodeRef,
    ) -> Result<Option<String>> {
        match node_ref {
            NodeRef::Id(id) => Ok(storage.get_node(id).await?.map(|node| node.id)),
            NodeRef::NativeId(native_id) => Ok(self
                .find_node_by_arn_or_id(storage, native_id)
                .await?
                .map(|node| node.id)),
        }
    }

    async fn resolve_edge(
        &self,
        storage: &dyn GraphStorage,
        edge: &EdgeInput,
    ) -> Result<Option<EdgeDefinition>> {
        let Some(source_node_id) = self.resolve_ref(storage, &edge.source).await? else {
            return Ok(None);
        };
        let Some(target_node_id) = self.resolve_ref(storage, &edge.target).await? else {
            return Ok(None);
        };
        Ok(Some(EdgeDefinition {
            source_node_id,
            target_node_id,
            relationship_type: edge.relationship_type,
            confidence: edge.confidence,
            discovered_via: edge.discovered_via,
            metadata: edge.metadata.clone(),
        }))
    }

    async fn enrich_from_attributes(
        &self,
        storage: &dyn GraphStorage,
        node_ids: &[String],
    ) -> Result<usize> {
        let mut nodes = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            if let Some(node) = storage.get_node(id).await? {
                nodes.push(node);
            }
        }
        let mut created = 0;
        for inferred in derive_attribute_edges(&nodes) {
            let Some(target) = self
                .find_node_by_arn_or_id(storage, &inferred.target_native_id)
                .await?
            else {
                continue;
            };
            if target.id == inferred.source_node_id {
                continue;
            }
            let definition = inferred.into_definition(target.id);
            if storage.upsert_edge(&definition).await?.created {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn cross_account_pass(
        &self,
        storage: &dyn GraphStorage,
        results: &mut [SyncResult],
    ) -> Result<()> {
        let mut by_account: HashMap<String, Vec<GraphNode>> = HashMap::new();
        let mut result_index: HashMap<String, usize> = HashMap::new();
        for (index, result) in results.iter().enumerate() {
            let account = self.accounts.get(&result.account_id)?;
            let nodes = storage
                .query_nodes(&NodeFilter::for_account(&account.native_account_id))
                .await?;
            result_index.insert(account.native_account_id.clone(), index);
            by_account.insert(account.native_account_id, nodes);
        }

        let node_accounts: HashMap<String, String> = by_account
            .iter()
            .flat_map(|(account, nodes)| {
                nodes
                    .iter()
                    .map(move |node| (node.id.clone(), account.clone()))
            })
            .collect();

        for edge in derive_cross_account_edges(&by_account) {
            let source_account = node_accounts.get(&edge.source_node_id).cloned();
            let definition = edge.into_definition();
            if storage.upsert_edge(&definition).await?.created {
                if let Some(index) = source_account.and_then(|a| result_index.get(&a)) {
                    results[*index].edges_created += 1;
                }
                debug!(
                    "sync: inferred cross-account edge {}",
                    definition.edge_id()
                );
            }
        }
        Ok(())
    }

    /// Nodes reachable from `root_id` within `max_depth` hops along impact
    /// edges (outgoing everywhere, incoming at the root). A missing root
    /// yields an empty result.
    pub async fn get_blast_radius(
        &self,
        tenant_id: &str,
        root_id: &str,
        max_depth: u32,
    ) -> Result<BlastRadius> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        let mut radius = BlastRadius {
            root_node_id: root_id.to_string(),
            nodes: BTreeMap::new(),
            hops: BTreeMap::new(),
            total_cost_monthly: 0.0,
        };
        let Some(root) = storage.get_node(root_id).await? else {
            return Ok(radius);
        };
        if root.is_deleted() {
            return Ok(radius);
        }
        let depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let impact: HashSet<RelationshipType> = IMPACT_RELATIONSHIPS.iter().copied().collect();

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root.id.clone());
        radius.hops.insert(0, vec![root.id.clone()]);
        radius.nodes.insert(root.id.clone(), root.clone());
        let mut frontier = vec![root.id.clone()];

        for hop in 1..=depth {
            let mut next: BTreeSet<String> = BTreeSet::new();
            for node_id in &frontier {
                let direction = if *node_id == radius.root_node_id {
                    EdgeDirection::Both
                } else {
                    EdgeDirection::Downstream
                };
                for edge in storage.get_edges_for_node(node_id, direction).await? {
                    if !impact.contains(&edge.relationship_type) {
                        continue;
                    }
                    let neighbor = if edge.source_node_id == *node_id {
                        &edge.target_node_id
                    } else {
                        &edge.source_node_id
                    };
                    if !visited.contains(neighbor) {
                        next.insert(neighbor.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            let mut level = Vec::new();
            for id in next {
                let Some(node) = storage.get_node(&id).await? else {
                    continue;
                };
                if node.is_deleted() {
                    continue;
                }
                visited.insert(id.clone());
                level.push(id.clone());
                radius.nodes.insert(id, node);
            }
            if level.is_empty() {
                break;
            }
            radius.hops.insert(hop, level.clone());
            frontier = level;
        }

        radius.total_cost_monthly = radius
            .nodes
            .values()
            .filter_map(|node| node.cost_monthly)
            .sum();
        Ok(radius)
    }

    /// BFS along dependency-bearing edges in one direction. Depth 0 returns
    /// only the root.
    pub async fn get_dependency_chain(
        &self,
        tenant_id: &str,
        root_id: &str,
        direction: EdgeDirection,
        max_depth: u32,
    ) -> Result<DependencyChain> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        let mut chain = DependencyChain {
            root_node_id: root_id.to_string(),
            direction,
            levels: BTreeMap::new(),
            nodes: BTreeMap::new(),
        };
        let Some(root) = storage.get_node(root_id).await? else {
            return Ok(chain);
        };
        if root.is_deleted() {
            return Ok(chain);
        }
        let depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let dependency: HashSet<RelationshipType> =
            DEPENDENCY_RELATIONSHIPS.iter().copied().collect();

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root.id.clone());
        chain.levels.insert(0, vec![root.id.clone()]);
        chain.nodes.insert(root.id.clone(), root);
        let mut frontier = vec![root_id.to_string()];

        for level_index in 1..=depth {
            let mut next: BTreeSet<String> = BTreeSet::new();
            for node_id in &frontier {
                for edge in storage.get_edges_for_node(node_id, direction).await? {
                    if !dependency.contains(&edge.relationship_type) {
                        continue;
                    }
                    let neighbor = match direction {
                        EdgeDirection::Downstream => &edge.target_node_id,
                        EdgeDirection::Upstream => &edge.source_node_id,
                        EdgeDirection::Both => {
                            if edge.source_node_id == *node_id {
                                &edge.target_node_id
                            } else {
                                &edge.source_node_id
                            }
                        }
                    };
                    if !visited.contains(neighbor) {
                        next.insert(neighbor.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            let mut level = Vec::new();
            for id in next {
                let Some(node) = storage.get_node(&id).await? else {
                    continue;
                };
                if node.is_deleted() {
                    continue;
                }
                visited.insert(id.clone());
                level.push(id.clone());
                chain.nodes.insert(id, node);
            }
            if level.is_empty() {
                break;
            }
            chain.levels.insert(level_index, level.clone());
            frontier = level;
        }
        Ok(chain)
    }

    /// Filtered subgraph; edge endpoints are restricted to the included
    /// node set.
    pub async fn get_topology(&self, tenant_id: &str, filter: &NodeFilter) -> Result<Topology> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        let nodes = storage.query_nodes(filter).await?;
        let included: HashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
        let edges = storage
            .query_edges(&EdgeFilter::default())
            .await?
            .into_iter()
            .filter(|edge| {
                included.contains(edge.source_node_id.as_str())
                    && included.contains(edge.target_node_id.as_str())
            })
            .collect();
        Ok(Topology { nodes, edges })
    }

    pub async fn get_group_cost(&self, tenant_id: &str, group_id: &str) -> Result<CostReport> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        let Some(group) = storage.get_group(group_id).await? else {
            return Err(ErrorKind::NotFound(format!("group {group_id}")).into());
        };

        let mut members: BTreeMap<String, GraphNode> = BTreeMap::new();
        for id in &group.node_ids {
            if let Some(node) = storage.get_node(id).await? {
                if !node.is_deleted() {
                    members.insert(node.id.clone(), node);
                }
            }
        }
        // tagsMatch auto-populates membership on top of the explicit ids.
        if let Some(tags) = &group.tags_match {
            let matched = storage
                .query_nodes(&NodeFilter {
                    tags: tags.clone(),
                    ..Default::default()
                })
                .await?;
            for node in matched {
                members.insert(node.id.clone(), node);
            }
        }

        Ok(cost_report(
            &group.name,
            members.into_values().collect::<Vec<_>>(),
        ))
    }

    pub async fn get_cost_by_filter(
        &self,
        tenant_id: &str,
        filter: &NodeFilter,
        label: &str,
    ) -> Result<CostReport> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        let nodes = storage.query_nodes(filter).await?;
        Ok(cost_report(label, nodes))
    }

    /// Differences accumulated since the last completed full sync:
    /// field-level drift, nodes on their way out, and new arrivals.
    pub async fn detect_drift(
        &self,
        tenant_id: &str,
        provider: Option<Provider>,
    ) -> Result<DriftReport> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        let scanned_at = Utc::now();
        let since = {
            let journal = self.journal.lock().expect("sync journal poisoned");
            journal
                .get(tenant_id)
                .and_then(|entries| entries.iter().rev().find(|entry| entry.full))
                .map(|entry| entry.started_at)
        };
        let mut report = DriftReport {
            scanned_at,
            drifted_nodes: Vec::new(),
            disappeared_nodes: Vec::new(),
            new_nodes: Vec::new(),
        };
        let Some(since) = since else {
            return Ok(report);
        };

        let changes = storage
            .query_changes(&ChangeQuery {
                since: Some(since),
                ..Default::default()
            })
            .await?;

        let mut updated: BTreeMap<String, Vec<ChangeRecord>> = BTreeMap::new();
        let mut created: BTreeSet<String> = BTreeSet::new();
        let mut deleted: BTreeSet<String> = BTreeSet::new();
        for change in changes {
            match change.change_type {
                ChangeType::Updated => {
                    updated.entry(change.node_id.clone()).or_default().push(change)
                }
                ChangeType::Created | ChangeType::Reappeared => {
                    created.insert(change.node_id.clone());
                }
                ChangeType::Deleted => {
                    deleted.insert(change.node_id.clone());
                }
            }
        }

        let matches_provider = |node: &GraphNode| match provider {
            None => true,
            Some(provider) => node.provider == provider,
        };

        for (node_id, changes) in updated {
            if created.contains(&node_id) {
                continue;
            }
            if let Some(node) = storage.get_node(&node_id).await? {
                if matches_provider(&node) && !node.is_deleted() {
                    report.drifted_nodes.push(DriftedNode { node, changes });
                }
            }
        }

        for node_id in created {
            if let Some(node) = storage.get_node(&node_id).await? {
                if matches_provider(&node) && !node.is_deleted() {
                    report.new_nodes.push(node);
                }
            }
        }

        // Nodes inside the grace window plus nodes tombstoned in it.
        let disappearing = storage
            .query_nodes(&NodeFilter {
                only_disappearing: true,
                providers: provider.map(|p| vec![p]),
                ..Default::default()
            })
            .await?;
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for node in disappearing {
            seen.insert(node.id.clone());
            report.disappeared_nodes.push(node);
        }
        for node_id in deleted {
            if seen.contains(&node_id) {
                continue;
            }
            if let Some(node) = storage.get_node(&node_id).await? {
                if matches_provider(&node) {
                    report.disappeared_nodes.push(node);
                }
            }
        }
        report
            .disappeared_nodes
            .sort_by(|a, b| a.id.cmp(&b.id));
        Ok(report)
    }

    /// Most recent change records for a node, newest first.
    pub async fn get_timeline(
        &self,
        tenant_id: &str,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        storage
            .query_changes(&ChangeQuery {
                node_id: Some(node_id.to_string()),
                limit: Some(limit),
                ..Default::default()
            })
            .await
    }

    pub async fn get_stats(&self, tenant_id: &str) -> Result<GraphStats> {
        let storage = self.tenants.get_storage(tenant_id).await?;
        storage.get_stats().await
    }
}

fn cost_report(label: &str, nodes: Vec<GraphNode>) -> CostReport {
    let mut report = CostReport {
        label: label.to_string(),
        total_monthly: 0.0,
        by_resource_type: BTreeMap::new(),
        top_contributors: Vec::new(),
    };
    let mut contributors = Vec::new();
    for node in nodes {
        let Some(cost) = node.cost_monthly else {
            continue;
        };
        report.total_monthly += cost;
        *report
            .by_resource_type
            .entry(node.resource_type.to_string())
            .or_insert(0.0) += cost;
        contributors.push(CostContributor {
            node_id: node.id,
            name: node.name,
            cost_monthly: cost,
        });
    }
    contributors.sort_by(|a, b| {
        b.cost_monthly
            .partial_cmp(&a.cost_monthly)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    contributors.truncate(TOP_COST_CONTRIBUTORS);
    report.top_contributors = contributors;
    report
}
