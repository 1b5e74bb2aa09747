use crate::prelude::*;
use crate::snapshot::GraphSnapshot;
use crate::storage::{
    apply_edge_observation, apply_missing_mark, apply_node_observation, stats_from_tables,
    ChangeQuery, EdgeDirection, EdgeFilter, EdgeUpsert, GraphStorage, MissingScope,
    MissingTransition, NodeFilter, NodeUpsert,
};
use crate::types::{
    ChangeRecord, EdgeDefinition, GraphEdge, GraphNode, GraphStats, Group, NodeInput,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// In-process key/value backend holding the four logical tables in ordered
/// maps, with secondary indexes for neighborhood lookups. Single writer,
/// serialized on an internal lock. With a path configured the tables are
/// loaded on `initialize` and flushed as a JSON snapshot on `close`.
#[derive(Debug, Default)]
pub struct EmbeddedStorage {
    path: Option<PathBuf>,
    state: Mutex<Option<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    nodes: BTreeMap<String, GraphNode>,
    edges: BTreeMap<String, GraphEdge>,
    changes: Vec<ChangeRecord>,
    groups: BTreeMap<String, Group>,
    last_sync_at: Option<DateTime<Utc>>,

    // Secondary indexes, rebuilt on load.
    edges_by_source: HashMap<String, BTreeSet<String>>,
    edges_by_target: HashMap<String, BTreeSet<String>>,
    nodes_by_native_id: HashMap<String, BTreeSet<String>>,
}

impl Tables {
    fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut tables = Tables {
            last_sync_at: snapshot.last_sync_at,
            changes: snapshot.changes,
            ..Default::default()
        };
        for node in snapshot.nodes {
            tables.index_node(&node);
            tables.nodes.insert(node.id.clone(), node);
        }
        for edge in snapshot.edges {
            tables.index_edge(&edge);
            tables.edges.insert(edge.id.clone(), edge);
        }
        for group in snapshot.groups {
            tables.groups.insert(group.id.clone(), group);
        }
        tables
    }

    fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            changes: self.changes.clone(),
            groups: self.groups.values().cloned().collect(),
            last_sync_at: self.last_sync_at,
        }
    }

    fn index_node(&mut self, node: &GraphNode) {
        self.nodes_by_native_id
            .entry(node.native_id.clone())
            .or_default()
            .insert(node.id.clone());
    }

    fn index_edge(&mut self, edge: &GraphEdge) {
        self.edges_by_source
            .entry(edge.source_node_id.clone())
            .or_default()
            .insert(edge.id.clone());
        self.edges_by_target
            .entry(edge.target_node_id.clone())
            .or_default()
            .insert(edge.id.clone());
    }
}

impl EmbeddedStorage {
    pub fn new() -> Self {
        EmbeddedStorage::default()
    }

    /// Backend that persists its tables to `path` across restarts.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        EmbeddedStorage {
            path: Some(path.into()),
            state: Mutex::new(None),
        }
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock().expect("embedded storage lock poisoned");
        let tables = guard.as_mut().ok_or_else(|| {
            crate::errors::CartographError::from(crate::errors::ErrorKind::Storage(
                "embedded storage not initialized".to_string(),
            ))
        })?;
        f(tables)
    }
}

#[async_trait]
impl GraphStorage for EmbeddedStorage {
    async fn initialize(&self) -> Result<()> {
        let mut guard = self.state.lock().expect("embedded storage lock poisoned");
        if guard.is_some() {
            return Ok(());
        }
        let tables = match &self.path {
            Some(path) if path.exists() => {
                let snapshot = GraphSnapshot::read_from_file(path)?;
                info!(
                    "embedded: loaded {} nodes, {} edges from {}",
                    snapshot.nodes.len(),
                    snapshot.edges.len(),
                    path.display()
                );
                Tables::from_snapshot(snapshot)
            }
            _ => Tables::default(),
        };
        *guard = Some(tables);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.state.lock().expect("embedded storage lock poisoned");
        let Some(tables) = guard.take() else {
            return Ok(());
        };
        if let Some(path) = &self.path {
            tables.to_snapshot().write_to_file(path)?;
            info!("embedded: flushed tables to {}", path.display());
        }
        Ok(())
    }

    async fn upsert_node(&self, input: &NodeInput, sync_id: &str) -> Result<NodeUpsert> {
        self.with_tables(|tables| {
            let now = Utc::now();
            let id = input.node_id();
            let existing = tables.nodes.get(&id).cloned();
            let (node, outcome, changes) =
                apply_node_observation(existing, input, sync_id, now)?;
            tables.index_node(&node);
            tables.nodes.insert(id, node);
            tables.changes.extend(changes);
            tables.last_sync_at = Some(now);
            Ok(outcome)
        })
    }

    async fn upsert_edge(&self, definition: &EdgeDefinition) -> Result<EdgeUpsert> {
        self.with_tables(|tables| {
            let id = definition.edge_id();
            let existing = tables.edges.get(&id).cloned();
            let endpoints = (
                tables.nodes.contains_key(&definition.source_node_id),
                tables.nodes.contains_key(&definition.target_node_id),
            );
            let (edge, outcome) = apply_edge_observation(existing, definition, endpoints)?;
            if edge.dangling {
                debug!("embedded: retaining dangling edge {}", edge.id);
            }
            tables.index_edge(&edge);
            tables.edges.insert(id, edge);
            Ok(outcome)
        })
    }

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        self.with_tables(|tables| Ok(tables.nodes.get(id).cloned()))
    }

    async fn get_edge(&self, id: &str) -> Result<Option<GraphEdge>> {
        self.with_tables(|tables| Ok(tables.edges.get(id).cloned()))
    }

    async fn find_node_by_native_id(&self, native_id: &str) -> Result<Option<GraphNode>> {
        self.with_tables(|tables| {
            let Some(ids) = tables.nodes_by_native_id.get(native_id) else {
                return Ok(None);
            };
            // First id in order keeps the lookup deterministic when several
            // accounts share a native id.
            Ok(ids
                .iter()
                .filter_map(|id| tables.nodes.get(id))
                .find(|node| !node.is_deleted())
                .cloned())
        })
    }

    async fn query_nodes(&self, filter: &NodeFilter) -> Result<Vec<GraphNode>> {
        self.with_tables(|tables| {
            let mut result: Vec<GraphNode> = tables
                .nodes
                .values()
                .filter(|node| filter.matches(node))
                .cloned()
                .collect();
            if let Some(limit) = filter.limit {
                result.truncate(limit);
            }
            Ok(result)
        })
    }

    async fn query_edges(&self, filter: &EdgeFilter) -> Result<Vec<GraphEdge>> {
        self.with_tables(|tables| {
            // Narrow by endpoint index when the filter pins one.
            let candidate_ids: Option<&BTreeSet<String>> = match (&filter.source_id, &filter.target_id)
            {
                (Some(source), _) => tables.edges_by_source.get(source),
                (None, Some(target)) => tables.edges_by_target.get(target),
                (None, None) => None,
            };
            let result = match candidate_ids {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| tables.edges.get(id))
                    .filter(|edge| filter.matches(edge))
                    .cloned()
                    .collect(),
                None if filter.source_id.is_some() || filter.target_id.is_some() => Vec::new(),
                None => tables
                    .edges
                    .values()
                    .filter(|edge| filter.matches(edge))
                    .cloned()
                    .collect(),
            };
            Ok(result)
        })
    }

    async fn get_edges_for_node(
        &self,
        id: &str,
        direction: EdgeDirection,
    ) -> Result<Vec<GraphEdge>> {
        self.with_tables(|tables| {
            let mut ids: BTreeSet<&String> = BTreeSet::new();
            if matches!(direction, EdgeDirection::Downstream | EdgeDirection::Both) {
                if let Some(outgoing) = tables.edges_by_source.get(id) {
                    ids.extend(outgoing.iter());
                }
            }
            if matches!(direction, EdgeDirection::Upstream | EdgeDirection::Both) {
                if let Some(incoming) = tables.edges_by_target.get(id) {
                    ids.extend(incoming.iter());
                }
            }
            Ok(ids
                .into_iter()
                .filter_map(|edge_id| tables.edges.get(edge_id))
                .cloned()
                .collect())
        })
    }

    async fn record_change(&self, change: &ChangeRecord) -> Result<()> {
        self.with_tables(|tables| {
            tables.changes.push(change.clone());
            Ok(())
        })
    }

    async fn query_changes(&self, query: &ChangeQuery) -> Result<Vec<ChangeRecord>> {
        self.with_tables(|tables| {
            let mut result: Vec<ChangeRecord> = tables
                .changes
                .iter()
                .filter(|change| {
                    if let Some(node_id) = &query.node_id {
                        if change.node_id != *node_id {
                            return false;
                        }
                    }
                    if let Some(since) = query.since {
                        if change.detected_at < since {
                            return false;
                        }
                    }
                    if let Some(until) = query.until {
                        if change.detected_at > until {
                            return false;
                        }
                    }
                    true
                })
                .cloned()
                .collect();
            // Newest first; insertion order (stable sort) breaks ties.
            result.reverse();
            result.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
            if let Some(limit) = query.limit {
                result.truncate(limit);
            }
            Ok(result)
        })
    }

    async fn save_group(&self, group: &Group) -> Result<()> {
        self.with_tables(|tables| {
            tables.groups.insert(group.id.clone(), group.clone());
            Ok(())
        })
    }

    async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        self.with_tables(|tables| Ok(tables.groups.get(id).cloned()))
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        self.with_tables(|tables| Ok(tables.groups.values().cloned().collect()))
    }

    async fn get_stats(&self) -> Result<GraphStats> {
        self.with_tables(|tables| {
            let oldest = tables.changes.iter().map(|c| c.detected_at).min();
            let newest = tables.changes.iter().map(|c| c.detected_at).max();
            Ok(stats_from_tables(
                tables.nodes.values().cloned(),
                tables.edges.values().cloned(),
                tables.last_sync_at,
                oldest,
                newest,
            ))
        })
    }

    async fn mark_missing(&self, sync_id: &str, scope: &MissingScope) -> Result<Vec<String>> {
        self.with_tables(|tables| {
            let now = Utc::now();
            let mut affected = Vec::new();
            let mut new_changes = Vec::new();
            for node in tables.nodes.values_mut() {
                if !scope.covers(node) {
                    continue;
                }
                match apply_missing_mark(node, sync_id, scope.grace_syncs, now) {
                    None => {}
                    Some(MissingTransition::Disappearing) => affected.push(node.id.clone()),
                    Some(MissingTransition::Deleted(change)) => {
                        affected.push(node.id.clone());
                        new_changes.push(change);
                    }
                }
            }
            tables.changes.extend(new_changes);
            Ok(affected)
        })
    }

    async fn export_snapshot(&self) -> Result<GraphSnapshot> {
        self.with_tables(|tables| Ok(tables.to_snapshot()))
    }

    async fn import_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()> {
        self.with_tables(|tables| {
            *tables = Tables::from_snapshot(snapshot.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiscoveryMethod, NodeStatus, Provider, RelationshipType, ResourceType};
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn node_input(native_id: &str, cost: f64) -> NodeInput {
        NodeInput {
            native_id: native_id.to_string(),
            name: format!("node-{native_id}"),
            provider: Provider::Aws,
            account: "111111111111".to_string(),
            region: "us-east-1".to_string(),
            resource_type: ResourceType::Compute,
            status: NodeStatus::Running,
            tags: BTreeMap::new(),
            metadata: Map::new(),
            cost_monthly: Some(cost),
            owner: None,
            created_at: None,
        }
    }

    fn edge(source: &str, target: &str, rel: RelationshipType) -> EdgeDefinition {
        EdgeDefinition {
            source_node_id: source.to_string(),
            target_node_id: target.to_string(),
            relationship_type: rel,
            confidence: 1.0,
            discovered_via: DiscoveryMethod::ApiField,
            metadata: Map::new(),
        }
    }

    async fn storage() -> EmbeddedStorage {
        let storage = EmbeddedStorage::new();
        storage.initialize().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_user_fields() {
        let storage = storage().await;
        let input = node_input("i-abc", 100.0);
        let outcome = storage.upsert_node(&input, "sync-1").await.unwrap();
        assert!(outcome.created);

        let node = storage.get_node(&input.node_id()).await.unwrap().unwrap();
        assert_eq!(node.native_id, input.native_id);
        assert_eq!(node.name, input.name);
        assert_eq!(node.cost_monthly, input.cost_monthly);
        assert_eq!(node.recompute_id(), node.id);
    }

    #[tokio::test]
    async fn double_upsert_is_idempotent() {
        let storage = storage().await;
        let input = node_input("i-abc", 100.0);
        storage.upsert_node(&input, "sync-1").await.unwrap();
        let outcome = storage.upsert_node(&input, "sync-2").await.unwrap();
        assert!(!outcome.created && !outcome.updated);
        let changes = storage
            .query_changes(&ChangeQuery::default())
            .await
            .unwrap();
        assert_eq!(changes.len(), 1, "only the creation change");
    }

    #[tokio::test]
    async fn edge_upsert_dedupes_by_identity() {
        let storage = storage().await;
        let a = node_input("a", 1.0);
        let b = node_input("b", 1.0);
        storage.upsert_node(&a, "s").await.unwrap();
        storage.upsert_node(&b, "s").await.unwrap();
        let definition = edge(&a.node_id(), &b.node_id(), RelationshipType::Uses);
        let first = storage.upsert_edge(&definition).await.unwrap();
        assert!(first.created);
        let second = storage.upsert_edge(&definition).await.unwrap();
        assert!(!second.created && !second.updated);
        let edges = storage.query_edges(&EdgeFilter::default()).await.unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[tokio::test]
    async fn neighborhood_lookup_respects_direction() {
        let storage = storage().await;
        let a = node_input("a", 1.0);
        let b = node_input("b", 1.0);
        let c = node_input("c", 1.0);
        for input in [&a, &b, &c] {
            storage.upsert_node(input, "s").await.unwrap();
        }
        storage
            .upsert_edge(&edge(&a.node_id(), &b.node_id(), RelationshipType::Uses))
            .await
            .unwrap();
        storage
            .upsert_edge(&edge(&c.node_id(), &a.node_id(), RelationshipType::Triggers))
            .await
            .unwrap();

        let down = storage
            .get_edges_for_node(&a.node_id(), EdgeDirection::Downstream)
            .await
            .unwrap();
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].target_node_id, b.node_id());

        let up = storage
            .get_edges_for_node(&a.node_id(), EdgeDirection::Upstream)
            .await
            .unwrap();
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].source_node_id, c.node_id());

        let both = storage
            .get_edges_for_node(&a.node_id(), EdgeDirection::Both)
            .await
            .unwrap();
        assert_eq!(both.len(), 2);
    }

    #[tokio::test]
    async fn query_nodes_is_ordered_and_filters() {
        let storage = storage().await;
        for (native, cost) in [("i-b", 30.0), ("i-a", 10.0), ("i-c", 90.0)] {
            storage
                .upsert_node(&node_input(native, cost), "s")
                .await
                .unwrap();
        }
        let all = storage.query_nodes(&NodeFilter::default()).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|n| n.native_id.as_str()).collect();
        assert_eq!(ids, vec!["i-a", "i-b", "i-c"], "ordered by id");

        let pricey = storage
            .query_nodes(&NodeFilter {
                cost_min: Some(50.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pricey.len(), 1);
        assert_eq!(pricey[0].native_id, "i-c");

        let none = storage
            .query_nodes(&NodeFilter {
                accounts: Some(Vec::new()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty(), "empty list filter matches nothing");
    }

    #[tokio::test]
    async fn mark_missing_two_sync_grace_then_delete() {
        let storage = storage().await;
        let input = node_input("i-gone", 5.0);
        let id = input.node_id();
        storage.upsert_node(&input, "sync-1").await.unwrap();

        let scope = MissingScope {
            provider: Some(Provider::Aws),
            account: None,
            grace_syncs: 2,
        };
        let affected = storage.mark_missing("sync-2", &scope).await.unwrap();
        assert_eq!(affected, vec![id.clone()]);
        let node = storage.get_node(&id).await.unwrap().unwrap();
        assert!(node.is_disappearing());

        // Same sync id twice: idempotent.
        let again = storage.mark_missing("sync-2", &scope).await.unwrap();
        assert!(again.is_empty());

        let affected = storage.mark_missing("sync-3", &scope).await.unwrap();
        assert_eq!(affected, vec![id.clone()]);
        let node = storage.get_node(&id).await.unwrap().unwrap();
        assert!(node.is_deleted());

        // Deleted nodes are hidden from default queries but retained.
        let visible = storage.query_nodes(&NodeFilter::default()).await.unwrap();
        assert!(visible.is_empty());
        let with_deleted = storage
            .query_nodes(&NodeFilter {
                include_deleted: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(with_deleted.len(), 1);

        // Reappearance revives it.
        storage.upsert_node(&input, "sync-4").await.unwrap();
        let node = storage.get_node(&id).await.unwrap().unwrap();
        assert!(!node.is_deleted());
        let timeline = storage
            .query_changes(&ChangeQuery {
                node_id: Some(id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(timeline[0].change_type, crate::types::ChangeType::Reappeared);
    }

    #[tokio::test]
    async fn stats_reflect_tables() {
        let storage = storage().await;
        let a = node_input("a", 10.0);
        let b = node_input("b", 20.0);
        storage.upsert_node(&a, "s").await.unwrap();
        storage.upsert_node(&b, "s").await.unwrap();
        storage
            .upsert_edge(&edge(&a.node_id(), &b.node_id(), RelationshipType::Uses))
            .await
            .unwrap();
        let stats = storage.get_stats().await.unwrap();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.edge_count, 1);
        assert_eq!(stats.total_cost_monthly, 30.0);
        assert_eq!(stats.nodes_by_provider.get("aws"), Some(&2));
        assert_eq!(stats.edges_by_relationship_type.get("uses"), Some(&1));
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_identical_tables() {
        let storage = storage().await;
        let a = node_input("a", 10.0);
        let b = node_input("b", 20.0);
        storage.upsert_node(&a, "s").await.unwrap();
        storage.upsert_node(&b, "s").await.unwrap();
        storage
            .upsert_edge(&edge(&a.node_id(), &b.node_id(), RelationshipType::Uses))
            .await
            .unwrap();

        let snapshot = storage.export_snapshot().await.unwrap();
        let restored = EmbeddedStorage::new();
        restored.initialize().await.unwrap();
        restored.import_snapshot(&snapshot).await.unwrap();

        assert_eq!(
            storage.query_nodes(&NodeFilter::default()).await.unwrap(),
            restored.query_nodes(&NodeFilter::default()).await.unwrap()
        );
        assert_eq!(
            storage.query_edges(&EdgeFilter::default()).await.unwrap(),
            restored.query_edges(&EdgeFilter::default()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let storage = EmbeddedStorage::with_path(&path);
        storage.initialize().await.unwrap();
        storage
            .upsert_node(&node_input("i-abc", 100.0), "s")
            .await
            .unwrap();
        storage.close().await.unwrap();

        let reopened = EmbeddedStorage::with_path(&path);
        reopened.initialize().await.unwrap();
        let nodes = reopened.query_nodes(&NodeFilter::default()).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].native_id, "i-abc");
    }
}
