use crate::prelude::*;
use crate::snapshot::GraphSnapshot;
use crate::types::{
    diff_fields, ChangeRecord, ChangeType, EdgeDefinition, GraphEdge, GraphNode, GraphStats, Group,
    NodeInput, NodeStatus, Provider, RelationshipType, ResourceType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub(crate) mod actor;
pub mod embedded;
pub mod relational;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDirection {
    Upstream,
    Downstream,
    Both,
}

/// Node query filter. List-valued fields are tri-state: `None` does not
/// constrain, `Some(empty)` matches nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    #[serde(default)]
    pub providers: Option<Vec<Provider>>,
    #[serde(default)]
    pub accounts: Option<Vec<String>>,
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    #[serde(default)]
    pub resource_types: Option<Vec<ResourceType>>,
    #[serde(default)]
    pub statuses: Option<Vec<NodeStatus>>,
    /// All listed tags must be present with the given values.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub cost_min: Option<f64>,
    #[serde(default)]
    pub cost_max: Option<f64>,
    #[serde(default)]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub only_disappearing: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl NodeFilter {
    pub fn for_provider(provider: Provider) -> Self {
        NodeFilter {
            providers: Some(vec![provider]),
            ..Default::default()
        }
    }

    pub fn for_account(account: &str) -> Self {
        NodeFilter {
            accounts: Some(vec![account.to_string()]),
            ..Default::default()
        }
    }

    pub fn matches(&self, node: &GraphNode) -> bool {
        fn in_list<T: PartialEq>(list: &Option<Vec<T>>, value: &T) -> bool {
            match list {
                None => true,
                Some(values) => values.contains(value),
            }
        }

        if node.is_deleted() && !self.include_deleted {
            return false;
        }
        if self.only_disappearing && !node.is_disappearing() {
            return false;
        }
        if !in_list(&self.providers, &node.provider)
            || !in_list(&self.accounts, &node.account)
            || !in_list(&self.regions, &node.region)
            || !in_list(&self.resource_types, &node.resource_type)
            || !in_list(&self.statuses, &node.status)
        {
            return false;
        }
        for (key, value) in &self.tags {
            if node.tags.get(key) != Some(value) {
                return false;
            }
        }
        if let Some(min) = self.cost_min {
            if node.cost_monthly.map(|c| c < min).unwrap_or(true) {
                return false;
            }
        }
        if let Some(max) = self.cost_max {
            if node.cost_monthly.map(|c| c > max).unwrap_or(true) {
                return false;
            }
        }
        if let Some(fragment) = &self.name_contains {
            if !node.name.contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if node.created_at.map(|t| t < after).unwrap_or(true) {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if node.created_at.map(|t| t > before).unwrap_or(true) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeFilter {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub relationship_types: Option<Vec<RelationshipType>>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

impl EdgeFilter {
    pub fn matches(&self, edge: &GraphEdge) -> bool {
        if let Some(source) = &self.source_id {
            if edge.source_node_id != *source {
                return false;
            }
        }
        if let Some(target) = &self.target_id {
            if edge.target_node_id != *target {
                return false;
            }
        }
        if let Some(types) = &self.relationship_types {
            if !types.contains(&edge.relationship_type) {
                return false;
            }
        }
        if let Some(threshold) = self.min_confidence {
            if edge.confidence < threshold {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeQuery {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Scope of a `mark_missing` pass: nodes outside it are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingScope {
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub account: Option<String>,
    /// Consecutive full syncs a node may stay unobserved before it is marked
    /// deleted.
    pub grace_syncs: u32,
}

impl MissingScope {
    pub fn covers(&self, node: &GraphNode) -> bool {
        if let Some(provider) = self.provider {
            if node.provider != provider {
                return false;
            }
        }
        if let Some(account) = &self.account {
            if node.account != *account {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub created: bool,
    pub updated: bool,
    pub fields_changed: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeUpsert {
    pub created: bool,
    pub updated: bool,
}

/// Storage contract shared by the embedded and relational backends.
///
/// Writes are all-or-nothing per entity; concurrent writers to the same node
/// are serialized inside the backend. Query results are ordered by id unless
/// stated otherwise, so results are reproducible.
#[async_trait]
pub trait GraphStorage: Send + Sync + std::fmt::Debug {
    async fn initialize(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn upsert_node(&self, input: &NodeInput, sync_id: &str) -> Result<NodeUpsert>;
    async fn upsert_edge(&self, edge: &EdgeDefinition) -> Result<EdgeUpsert>;

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>>;
    async fn get_edge(&self, id: &str) -> Result<Option<GraphEdge>>;
    async fn find_node_by_native_id(&self, native_id: &str) -> Result<Option<GraphNode>>;

    async fn query_nodes(&self, filter: &NodeFilter) -> Result<Vec<GraphNode>>;
    async fn query_edges(&self, filter: &EdgeFilter) -> Result<Vec<GraphEdge>>;
    async fn get_edges_for_node(
        &self,
        id: &str,
        direction: EdgeDirection,
    ) -> Result<Vec<GraphEdge>>;

    async fn record_change(&self, change: &ChangeRecord) -> Result<()>;
    /// Newest first; ties in `detected_at` resolved by insertion order.
    async fn query_changes(&self, query: &ChangeQuery) -> Result<Vec<ChangeRecord>>;

    async fn save_group(&self, group: &Group) -> Result<()>;
    async fn get_group(&self, id: &str) -> Result<Option<Group>>;
    async fn list_groups(&self) -> Result<Vec<Group>>;

    async fn get_stats(&self) -> Result<GraphStats>;

    /// Progresses disappearance state for nodes in `scope` that were not
    /// re-observed by `sync_id`. Idempotent per sync id. Returns affected
    /// node ids.
    async fn mark_missing(&self, sync_id: &str, scope: &MissingScope) -> Result<Vec<String>>;

    async fn export_snapshot(&self) -> Result<GraphSnapshot>;
    async fn import_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()>;
}

fn new_change(
    node_id: &str,
    change_type: ChangeType,
    detected_at: DateTime<Utc>,
    sync_id: &str,
) -> ChangeRecord {
    ChangeRecord {
        id: Uuid::new_v4().to_string(),
        node_id: node_id.to_string(),
        detected_at,
        change_type,
        field: None,
        previous_value: None,
        new_value: None,
        source: sync_id.to_string(),
    }
}

/// Pure reconcile step shared by both backends: applies one observation to
/// the stored record (if any) and yields the new record plus the change
/// records to append. Backends only do the durable read/write around it.
pub(crate) fn apply_node_observation(
    existing: Option<GraphNode>,
    input: &NodeInput,
    sync_id: &str,
    now: DateTime<Utc>,
) -> Result<(GraphNode, NodeUpsert, Vec<ChangeRecord>)> {
    input.validate()?;
    let id = input.node_id();

    let Some(mut node) = existing else {
        let node = GraphNode {
            id: id.clone(),
            native_id: input.native_id.clone(),
            name: input.name.clone(),
            provider: input.provider,
            account: input.account.clone(),
            region: input.region.clone(),
            resource_type: input.resource_type,
            status: input.status,
            tags: input.tags.clone(),
            metadata: input.metadata.clone(),
            cost_monthly: input.cost_monthly,
            owner: input.owner.clone(),
            created_at: input.created_at,
            first_seen_at: now,
            last_seen_at: now,
            last_modified_at: now,
            last_sync_id: Some(sync_id.to_string()),
            missing_count: 0,
            missing_marked_by: None,
            deleted_at: None,
        };
        let change = new_change(&id, ChangeType::Created, now, sync_id);
        let outcome = NodeUpsert {
            created: true,
            updated: false,
            fields_changed: Vec::new(),
        };
        return Ok((node, outcome, vec![change]));
    };

    let mut changes = Vec::new();
    let reappeared = node.is_deleted();
    let diffs = diff_fields(&node, input);

    node.last_seen_at = now;
    node.last_sync_id = Some(sync_id.to_string());
    node.missing_count = 0;
    node.missing_marked_by = None;

    if reappeared {
        node.deleted_at = None;
        changes.push(new_change(&id, ChangeType::Reappeared, now, sync_id));
    }

    if diffs.is_empty() && !reappeared {
        let outcome = NodeUpsert {
            created: false,
            updated: false,
            fields_changed: Vec::new(),
        };
        return Ok((node, outcome, changes));
    }

    let mut fields_changed = Vec::with_capacity(diffs.len());
    for diff in &diffs {
        fields_changed.push(diff.field.to_string());
        let mut change = new_change(&id, ChangeType::Updated, now, sync_id);
        change.field = Some(diff.field.to_string());
        change.previous_value = diff.previous.clone();
        change.new_value = diff.new.clone();
        changes.push(change);
    }

    node.name = input.name.clone();
    node.status = input.status;
    node.tags = input.tags.clone();
    node.metadata = input.metadata.clone();
    node.cost_monthly = input.cost_monthly;
    node.owner = input.owner.clone();
    node.created_at = input.created_at;
    if !diffs.is_empty() || reappeared {
        node.last_modified_at = now;
    }

    let outcome = NodeUpsert {
        created: false,
        updated: !diffs.is_empty(),
        fields_changed,
    };
    Ok((node, outcome, changes))
}

/// Pure edge reconcile step. `endpoints_present` reports whether
/// source/target currently exist; a miss flags the edge instead of rejecting
/// it.
pub(crate) fn apply_edge_observation(
    existing: Option<GraphEdge>,
    definition: &EdgeDefinition,
    endpoints_present: (bool, bool),
) -> Result<(GraphEdge, EdgeUpsert)> {
    definition.validate()?;
    let dangling = !(endpoints_present.0 && endpoints_present.1);

    match existing {
        None => {
            let edge = GraphEdge {
                id: definition.edge_id(),
                source_node_id: definition.source_node_id.clone(),
                target_node_id: definition.target_node_id.clone(),
                relationship_type: definition.relationship_type,
                confidence: definition.confidence,
                discovered_via: definition.discovered_via,
                metadata: definition.metadata.clone(),
                dangling,
            };
            Ok((
                edge,
                EdgeUpsert {
                    created: true,
                    updated: false,
                },
            ))
        }
        Some(mut edge) => {
            let updated = edge.confidence != definition.confidence
                || edge.discovered_via != definition.discovered_via
                || edge.metadata != definition.metadata
                || edge.dangling != dangling;
            edge.confidence = definition.confidence;
            edge.discovered_via = definition.discovered_via;
            edge.metadata = definition.metadata.clone();
            edge.dangling = dangling;
            Ok((
                edge,
                EdgeUpsert {
                    created: false,
                    updated,
                },
            ))
        }
    }
}

/// Outcome of `mark_missing` on one node.
pub(crate) enum MissingTransition {
    /// Counter bumped, still within the grace period.
    Disappearing,
    /// Grace period exhausted; the node was tombstoned.
    Deleted(ChangeRecord),
}

/// Advances disappearance state of a node that was not observed by
/// `sync_id`. Returns `None` when the node is exempt (already deleted, or
/// this sync already marked it).
pub(crate) fn apply_missing_mark(
    node: &mut GraphNode,
    sync_id: &str,
    grace_syncs: u32,
    now: DateTime<Utc>,
) -> Option<MissingTransition> {
    if node.is_deleted() {
        return None;
    }
    if node.last_sync_id.as_deref() == Some(sync_id) {
        return None;
    }
    if node.missing_marked_by.as_deref() == Some(sync_id) {
        return None;
    }

    node.missing_count += 1;
    node.missing_marked_by = Some(sync_id.to_string());

    if node.missing_count >= grace_syncs.max(1) {
        node.deleted_at = Some(now);
        let mut change = new_change(&node.id, ChangeType::Deleted, now, sync_id);
        change.field = Some("status".to_string());
        change.previous_value = Some(node.status.to_string());
        change.new_value = Some("deleted".to_string());
        Some(MissingTransition::Deleted(change))
    } else {
        Some(MissingTransition::Disappearing)
    }
}

/// Recomputes aggregate stats from full node/edge listings. Backends with
/// indexed counts may shortcut this; correctness is what matters here.
pub(crate) fn stats_from_tables(
    nodes: impl Iterator<Item = GraphNode>,
    edges: impl Iterator<Item = GraphEdge>,
    last_sync_at: Option<DateTime<Utc>>,
    oldest_change_at: Option<DateTime<Utc>>,
    newest_change_at: Option<DateTime<Utc>>,
) -> GraphStats {
    let mut stats = GraphStats {
        last_sync_at,
        oldest_change_at,
        newest_change_at,
        ..Default::default()
    };
    for node in nodes {
        if node.is_deleted() {
            continue;
        }
        stats.node_count += 1;
        *stats
            .nodes_by_provider
            .entry(node.provider.to_string())
            .or_insert(0) += 1;
        *stats
            .nodes_by_resource_type
            .entry(node.resource_type.to_string())
            .or_insert(0) += 1;
        stats.total_cost_monthly += node.cost_monthly.unwrap_or(0.0);
    }
    for edge in edges {
        stats.edge_count += 1;
        *stats
            .edges_by_relationship_type
            .entry(edge.relationship_type.to_string())
            .or_insert(0) += 1;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DiscoveryMethod;
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn sample_input() -> NodeInput {
        NodeInput {
            native_id: "i-abc".to_string(),
            name: "api".to_string(),
            provider: Provider::Aws,
            account: "111111111111".to_string(),
            region: "us-east-1".to_string(),
            resource_type: ResourceType::Compute,
            status: NodeStatus::Running,
            tags: BTreeMap::new(),
            metadata: Map::new(),
            cost_monthly: Some(100.0),
            owner: None,
            created_at: None,
        }
    }

    #[test]
    fn first_observation_creates() {
        let now = Utc::now();
        let (node, outcome, changes) =
            apply_node_observation(None, &sample_input(), "sync-1", now).unwrap();
        assert!(outcome.created);
        assert_eq!(node.first_seen_at, now);
        assert_eq!(node.last_seen_at, now);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Created);
        assert_eq!(changes[0].source, "sync-1");
    }

    #[test]
    fn identical_reobservation_only_advances_last_seen() {
        let t0 = Utc::now();
        let (node, _, _) = apply_node_observation(None, &sample_input(), "sync-1", t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(60);
        let (node, outcome, changes) =
            apply_node_observation(Some(node), &sample_input(), "sync-2", t1).unwrap();
        assert!(!outcome.created && !outcome.updated);
        assert!(changes.is_empty());
        assert_eq!(node.last_seen_at, t1);
        assert_eq!(node.last_modified_at, t0);
    }

    #[test]
    fn changed_field_yields_one_change_per_field() {
        let t0 = Utc::now();
        let (node, _, _) = apply_node_observation(None, &sample_input(), "sync-1", t0).unwrap();
        let mut update = sample_input();
        update.cost_monthly = Some(120.0);
        update.owner = Some("payments".to_string());
        let t1 = t0 + chrono::Duration::seconds(60);
        let (node, outcome, changes) =
            apply_node_observation(Some(node), &update, "sync-2", t1).unwrap();
        assert!(outcome.updated);
        assert_eq!(outcome.fields_changed, vec!["costMonthly", "owner"]);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.change_type == ChangeType::Updated));
        assert_eq!(node.last_modified_at, t1);
    }

    #[test]
    fn deleted_node_reappears() {
        let t0 = Utc::now();
        let (mut node, _, _) = apply_node_observation(None, &sample_input(), "sync-1", t0).unwrap();
        node.deleted_at = Some(t0);
        node.missing_count = 2;
        let t1 = t0 + chrono::Duration::seconds(60);
        let (node, _, changes) =
            apply_node_observation(Some(node), &sample_input(), "sync-3", t1).unwrap();
        assert!(!node.is_deleted());
        assert_eq!(node.missing_count, 0);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Reappeared);
    }

    #[test]
    fn missing_mark_is_idempotent_per_sync() {
        let t0 = Utc::now();
        let (mut node, _, _) =
            apply_node_observation(None, &sample_input(), "sync-1", t0).unwrap();

        let first = apply_missing_mark(&mut node, "sync-2", 2, t0);
        assert!(matches!(first, Some(MissingTransition::Disappearing)));
        assert_eq!(node.missing_count, 1);

        // Same sync id again: no further progress.
        assert!(apply_missing_mark(&mut node, "sync-2", 2, t0).is_none());
        assert_eq!(node.missing_count, 1);

        let second = apply_missing_mark(&mut node, "sync-3", 2, t0);
        assert!(matches!(second, Some(MissingTransition::Deleted(_))));
        assert!(node.is_deleted());

        // Deleted nodes are left alone.
        assert!(apply_missing_mark(&mut node, "sync-4", 2, t0).is_none());
    }

    #[test]
    fn node_seen_by_sync_is_not_marked() {
        let t0 = Utc::now();
        let (mut node, _, _) =
            apply_node_observation(None, &sample_input(), "sync-1", t0).unwrap();
        assert!(apply_missing_mark(&mut node, "sync-1", 2, t0).is_none());
    }

    #[test]
    fn edge_observation_dedupes_and_flags_dangling() {
        let definition = EdgeDefinition {
            source_node_id: "a".to_string(),
            target_node_id: "b".to_string(),
            relationship_type: RelationshipType::Uses,
            confidence: 0.9,
            discovered_via: DiscoveryMethod::ApiField,
            metadata: Map::new(),
        };
        let (edge, outcome) =
            apply_edge_observation(None, &definition, (true, false)).unwrap();
        assert!(outcome.created);
        assert!(edge.dangling);

        let (edge, outcome) =
            apply_edge_observation(Some(edge), &definition, (true, true)).unwrap();
        assert!(!outcome.created);
        assert!(outcome.updated, "dangling flag cleared counts as update");
        assert!(!edge.dangling);

        let (_, outcome) = apply_edge_observation(Some(edge), &definition, (true, true)).unwrap();
        assert!(!outcome.created && !outcome.updated);
    }

    #[test]
    fn empty_filter_list_matches_nothing() {
        let now = Utc::now();
        let (node, _, _) = apply_node_observation(None, &sample_input(), "s", now).unwrap();
        let filter = NodeFilter {
            providers: Some(Vec::new()),
            ..Default::default()
        };
        assert!(!filter.matches(&node));
        let open = NodeFilter::default();
        assert!(open.matches(&node));
    }
}
