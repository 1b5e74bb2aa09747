//! Read-only analytics over a storage snapshot.
//!
//! A [`GraphView`] loads nodes and edges once, interns ids to dense handles
//! and answers structural questions (paths, orphans, articulation points,
//! centrality, components) without touching storage again. All functions
//! return explicit empty/`None` results for unknown inputs; they never
//! fail on bad ids.

use crate::id_gen::{GetNextIdResult, IdGen};
use crate::prelude::*;
use crate::storage::{EdgeFilter, GraphStorage, NodeFilter};
use crate::types::{GraphEdge, GraphNode, RelationshipType, DEPENDENCY_RELATIONSHIPS};
use petgraph::graphmap::DiGraphMap;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryLimits {
    /// Caps the number of nodes loaded into the view. Past the cap nodes
    /// are dropped in id order and the view is flagged truncated.
    pub max_nodes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub path: Vec<String>,
    pub edges: Vec<GraphEdge>,
    pub hops: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalNode {
    pub node: GraphNode,
    pub in_degree: usize,
    pub out_degree: usize,
    pub reachable: usize,
    pub reachability_ratio: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Clusters {
    /// Weakly connected components with at least two members, largest
    /// first, members in id order.
    pub clusters: Vec<Vec<String>>,
    /// Nodes with no edges at all.
    pub isolated: Vec<String>,
}

/// Immutable snapshot of the active graph for analytics.
#[derive(Debug)]
pub struct GraphView {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    ids: IdGen,
    graph: DiGraphMap<u32, ()>,
    pub truncated: bool,
}

impl GraphView {
    /// Loads the active (non-deleted) graph. Deterministic under
    /// truncation: nodes survive in id order.
    pub async fn load(storage: &dyn GraphStorage, limits: &QueryLimits) -> Result<GraphView> {
        let mut nodes = storage.query_nodes(&NodeFilter::default()).await?;
        let mut truncated = false;
        if let Some(cap) = limits.max_nodes {
            if nodes.len() > cap {
                nodes.truncate(cap);
                truncated = true;
            }
        }
        let kept: HashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
        let edges: Vec<GraphEdge> = storage
            .query_edges(&EdgeFilter::default())
            .await?
            .into_iter()
            .filter(|edge| {
                kept.contains(edge.source_node_id.as_str())
                    && kept.contains(edge.target_node_id.as_str())
            })
            .collect();
        debug!(
            "query: loaded view with {} nodes, {} edges (truncated: {truncated})",
            nodes.len(),
            edges.len()
        );
        Ok(GraphView::from_parts(nodes, edges, truncated))
    }

    fn from_parts(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>, truncated: bool) -> GraphView {
        let mut ids = IdGen::new();
        let mut graph = DiGraphMap::new();
        for node in &nodes {
            if let GetNextIdResult::New(id) = ids.get_next_id(&node.id) {
                graph.add_node(id);
            }
        }
        for edge in &edges {
            let (Some(source), Some(target)) = (
                ids.get_id(&edge.source_node_id),
                ids.get_id(&edge.target_node_id),
            ) else {
                continue;
            };
            graph.add_edge(source, target, ());
        }
        GraphView {
            nodes,
            edges,
            ids,
            graph,
            truncated,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn node_by_handle(&self, handle: u32) -> Option<&GraphNode> {
        let id = self.ids.get_by_id(handle)?;
        self.nodes.iter().find(|node| node.id == id)
    }

    fn degree(&self, handle: u32) -> (usize, usize) {
        let out_degree = self
            .graph
            .neighbors_directed(handle, petgraph::Direction::Outgoing)
            .count();
        let in_degree = self
            .graph
            .neighbors_directed(handle, petgraph::Direction::Incoming)
            .count();
        (in_degree, out_degree)
    }

    fn undirected_neighbors(&self, handle: u32) -> BTreeSet<u32> {
        let mut neighbors: BTreeSet<u32> = self
            .graph
            .neighbors_directed(handle, petgraph::Direction::Outgoing)
            .collect();
        neighbors.extend(
            self.graph
                .neighbors_directed(handle, petgraph::Direction::Incoming),
        );
        neighbors.remove(&handle);
        neighbors
    }

    /// Undirected BFS shortest path; relationship direction does not affect
    /// reachability. `None` when either endpoint is unknown or no path
    /// exists.
    pub fn shortest_path(&self, source_id: &str, target_id: &str) -> Option<PathResult> {
        let source = self.ids.get_id(source_id)?;
        let target = self.ids.get_id(target_id)?;
        if source == target {
            return Some(PathResult {
                path: vec![source_id.to_string()],
                edges: Vec::new(),
                hops: 0,
            });
        }

        let mut parents: Vec<Option<u32>> = vec![None; self.ids.len()];
        let mut visited = vec![false; self.ids.len()];
        visited[source as usize] = true;
        let mut queue = VecDeque::from([source]);
        'search: while let Some(current) = queue.pop_front() {
            for neighbor in self.undirected_neighbors(current) {
                if visited[neighbor as usize] {
                    continue;
                }
                visited[neighbor as usize] = true;
                parents[neighbor as usize] = Some(current);
                if neighbor == target {
                    break 'search;
                }
                queue.push_back(neighbor);
            }
        }
        if !visited[target as usize] {
            return None;
        }

        let mut handles = vec![target];
        let mut cursor = target;
        while let Some(parent) = parents[cursor as usize] {
            handles.push(parent);
            cursor = parent;
        }
        handles.reverse();

        let path: Vec<String> = handles
            .iter()
            .filter_map(|handle| self.ids.get_by_id(*handle).map(str::to_string))
            .collect();
        let edges = path
            .windows(2)
            .filter_map(|pair| self.edge_between(&pair[0], &pair[1]))
            .cloned()
            .collect();
        Some(PathResult {
            hops: path.len() - 1,
            path,
            edges,
        })
    }

    fn edge_between(&self, a: &str, b: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|edge| {
            (edge.source_node_id == a && edge.target_node_id == b)
                || (edge.source_node_id == b && edge.target_node_id == a)
        })
    }

    /// Nodes with no edges in either direction, in id order.
    pub fn find_orphans(&self) -> Vec<GraphNode> {
        self.nodes
            .iter()
            .filter(|node| {
                let Some(handle) = self.ids.get_id(&node.id) else {
                    return false;
                };
                let (in_degree, out_degree) = self.degree(handle);
                in_degree == 0 && out_degree == 0
            })
            .cloned()
            .collect()
    }

    /// Articulation points of the undirected graph, restricted to nodes
    /// whose downstream reachable set along dependency-bearing edges
    /// exceeds one node.
    pub fn find_single_points_of_failure(&self) -> Vec<GraphNode> {
        let articulation = self.articulation_points();
        let mut result: Vec<GraphNode> = articulation
            .into_iter()
            .filter_map(|handle| self.node_by_handle(handle))
            .filter(|node| self.dependency_reach(&node.id) > 1)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Iterative Tarjan lowpoint computation over the undirected graph.
    fn articulation_points(&self) -> BTreeSet<u32> {
        let n = self.ids.len();
        let mut discovery = vec![usize::MAX; n];
        let mut low = vec![0usize; n];
        let mut parent: Vec<Option<u32>> = vec![None; n];
        let mut points: BTreeSet<u32> = BTreeSet::new();
        let mut timer = 0usize;

        for start in 0..n as u32 {
            if discovery[start as usize] != usize::MAX {
                continue;
            }
            let mut root_children = 0usize;
            // Stack of (node, neighbor iterator position).
            let mut stack: Vec<(u32, Vec<u32>, usize)> = Vec::new();
            discovery[start as usize] = timer;
            low[start as usize] = timer;
            timer += 1;
            stack.push((
                start,
                self.undirected_neighbors(start).into_iter().collect(),
                0,
            ));

            while let Some((node, neighbors, index)) = stack.pop() {
                if index < neighbors.len() {
                    let next = neighbors[index];
                    stack.push((node, neighbors, index + 1));
                    if discovery[next as usize] == usize::MAX {
                        parent[next as usize] = Some(node);
                        if node == start {
                            root_children += 1;
                        }
                        discovery[next as usize] = timer;
                        low[next as usize] = timer;
                        timer += 1;
                        stack.push((
                            next,
                            self.undirected_neighbors(next).into_iter().collect(),
                            0,
                        ));
                    } else if parent[node as usize] != Some(next) {
                        low[node as usize] = low[node as usize].min(discovery[next as usize]);
                    }
                } else if let Some(p) = parent[node as usize] {
                    low[p as usize] = low[p as usize].min(low[node as usize]);
                    if p != start && low[node as usize] >= discovery[p as usize] {
                        points.insert(p);
                    }
                }
            }
            if root_children > 1 {
                points.insert(start);
            }
        }
        points
    }

    fn dependency_reach(&self, node_id: &str) -> usize {
        let dependency: HashSet<RelationshipType> =
            DEPENDENCY_RELATIONSHIPS.iter().copied().collect();
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(node_id);
        let mut queue = VecDeque::from([node_id]);
        while let Some(current) = queue.pop_front() {
            for edge in &self.edges {
                if edge.source_node_id == current
                    && dependency.contains(&edge.relationship_type)
                    && visited.insert(edge.target_node_id.as_str())
                {
                    queue.push_back(edge.target_node_id.as_str());
                }
            }
        }
        visited.len()
    }

    fn reachable_count(&self, handle: u32) -> usize {
        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(handle);
        let mut queue = VecDeque::from([handle]);
        while let Some(current) = queue.pop_front() {
            for neighbor in self
                .graph
                .neighbors_directed(current, petgraph::Direction::Outgoing)
            {
                if visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        visited.len() - 1
    }

    /// Top `top_n` nodes by `inDegree + outDegree + reachabilityRatio`.
    pub fn find_critical_nodes(&self, top_n: usize) -> Vec<CriticalNode> {
        let total = self.nodes.len();
        if total == 0 {
            return Vec::new();
        }
        let mut ranked: Vec<CriticalNode> = self
            .nodes
            .iter()
            .filter_map(|node| {
                let handle = self.ids.get_id(&node.id)?;
                let (in_degree, out_degree) = self.degree(handle);
                let reachable = self.reachable_count(handle);
                let reachability_ratio = reachable as f64 / total as f64;
                Some(CriticalNode {
                    node: node.clone(),
                    in_degree,
                    out_degree,
                    reachable,
                    reachability_ratio,
                    score: in_degree as f64 + out_degree as f64 + reachability_ratio,
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        ranked.truncate(top_n);
        ranked
    }

    /// Weakly connected components plus fully isolated nodes.
    pub fn find_clusters(&self) -> Clusters {
        let n = self.ids.len();
        if n == 0 {
            return Clusters::default();
        }
        let mut union = UnionFind::<u32>::new(n);
        for edge in &self.edges {
            let (Some(source), Some(target)) = (
                self.ids.get_id(&edge.source_node_id),
                self.ids.get_id(&edge.target_node_id),
            ) else {
                continue;
            };
            union.union(source, target);
        }

        let mut components: std::collections::BTreeMap<u32, Vec<String>> =
            std::collections::BTreeMap::new();
        for node in &self.nodes {
            let Some(handle) = self.ids.get_id(&node.id) else {
                continue;
            };
            components
                .entry(union.find(handle))
                .or_default()
                .push(node.id.clone());
        }

        let mut clusters = Clusters::default();
        for (_, mut members) in components {
            members.sort();
            if members.len() == 1 {
                let id = &members[0];
                let degree_free = self
                    .ids
                    .get_id(id)
                    .map(|handle| {
                        let (in_degree, out_degree) = self.degree(handle);
                        in_degree == 0 && out_degree == 0
                    })
                    .unwrap_or(true);
                if degree_free {
                    clusters.isolated.push(members.remove(0));
                    continue;
                }
            }
            clusters.clusters.push(members);
        }
        clusters
            .clusters
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::embedded::EmbeddedStorage;
    use crate::types::{
        DiscoveryMethod, EdgeDefinition, NodeInput, NodeStatus, Provider, ResourceType,
    };
    use serde_json::Map;
    use std::collections::BTreeMap;

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

    fn edge(source: &NodeInput, target: &NodeInput, rel: RelationshipType) -> EdgeDefinition {
        EdgeDefinition {
            source_node_id: source.node_id(),
            target_node_id: target.node_id(),
            relationship_type: rel,
            confidence: 1.0,
            discovered_via: DiscoveryMethod::ApiField,
            metadata: Map::new(),
        }
    }

    async fn build_view(
        nodes: &[NodeInput],
        edges: &[EdgeDefinition],
        limits: QueryLimits,
    ) -> GraphView {
        let storage = EmbeddedStorage::new();
        storage.initialize().await.unwrap();
        for node in nodes {
            storage.upsert_node(node, "s").await.unwrap();
        }
        for definition in edges {
            storage.upsert_edge(definition).await.unwrap();
        }
        GraphView::load(&storage, &limits).await.unwrap()
    }

    #[tokio::test]
    async fn shortest_path_ignores_direction() {
        let a = node_input("a");
        let b = node_input("b");
        let c = node_input("c");
        let view = build_view(
            &[a.clone(), b.clone(), c.clone()],
            &[
                edge(&a, &b, RelationshipType::Uses),
                // Deliberately reversed: path must still be found.
                edge(&c, &b, RelationshipType::Uses),
            ],
            QueryLimits::default(),
        )
        .await;

        let result = view.shortest_path(&a.node_id(), &c.node_id()).unwrap();
        assert_eq!(result.hops, 2);
        assert_eq!(result.path, vec![a.node_id(), b.node_id(), c.node_id()]);
        assert_eq!(result.edges.len(), 2);

        assert!(view.shortest_path(&a.node_id(), "missing").is_none());
        assert_eq!(
            view.shortest_path(&a.node_id(), &a.node_id()).unwrap().hops,
            0
        );
    }

    #[tokio::test]
    async fn orphans_are_exactly_the_disconnected_nodes() {
        let chain: Vec<NodeInput> = (0..5).map(|i| node_input(&format!("chain-{i}"))).collect();
        let isolated: Vec<NodeInput> = (0..5).map(|i| node_input(&format!("iso-{i}"))).collect();
        let edges: Vec<EdgeDefinition> = chain
            .windows(2)
            .map(|pair| edge(&pair[0], &pair[1], RelationshipType::Uses))
            .collect();
        let all: Vec<NodeInput> = chain.iter().chain(isolated.iter()).cloned().collect();
        let view = build_view(&all, &edges, QueryLimits::default()).await;

        let orphans = view.find_orphans();
        let orphan_ids: Vec<String> = orphans.iter().map(|node| node.native_id.clone()).collect();
        assert_eq!(
            orphan_ids,
            vec!["iso-0", "iso-1", "iso-2", "iso-3", "iso-4"],
            "exactly the isolated nodes, ordered by id"
        );
    }

    #[tokio::test]
    async fn articulation_point_with_downstream_reach_is_spof() {
        // a -> hub -> b, hub -> c: removing hub separates the graph and hub
        // reaches more than one node downstream.
        let a = node_input("a");
        let hub = node_input("hub");
        let b = node_input("b");
        let c = node_input("c");
        let view = build_view(
            &[a.clone(), hub.clone(), b.clone(), c.clone()],
            &[
                edge(&a, &hub, RelationshipType::Uses),
                edge(&hub, &b, RelationshipType::DependsOn),
                edge(&hub, &c, RelationshipType::Uses),
            ],
            QueryLimits::default(),
        )
        .await;

        let spofs = view.find_single_points_of_failure();
        assert_eq!(spofs.len(), 1);
        assert_eq!(spofs[0].native_id, "hub");
    }

    #[tokio::test]
    async fn critical_nodes_rank_by_degree_and_reach() {
        let hub = node_input("hub");
        let spokes: Vec<NodeInput> = (0..4).map(|i| node_input(&format!("s-{i}"))).collect();
        let mut edges = Vec::new();
        for spoke in &spokes {
            edges.push(edge(&hub, spoke, RelationshipType::Uses));
        }
        let mut all = vec![hub.clone()];
        all.extend(spokes.clone());
        let view = build_view(&all, &edges, QueryLimits::default()).await;

        let critical = view.find_critical_nodes(2);
        assert_eq!(critical.len(), 2);
        assert_eq!(critical[0].node.native_id, "hub");
        assert_eq!(critical[0].out_degree, 4);
        assert_eq!(critical[0].reachable, 4);
        assert!(critical[0].score > critical[1].score);
    }

    #[tokio::test]
    async fn clusters_split_components_and_isolated() {
        let a = node_input("a");
        let b = node_input("b");
        let c = node_input("c");
        let d = node_input("d");
        let lonely = node_input("lonely");
        let view = build_view(
            &[a.clone(), b.clone(), c.clone(), d.clone(), lonely.clone()],
            &[
                edge(&a, &b, RelationshipType::Uses),
                edge(&c, &d, RelationshipType::Uses),
            ],
            QueryLimits::default(),
        )
        .await;

        let clusters = view.find_clusters();
        assert_eq!(clusters.clusters.len(), 2);
        assert_eq!(clusters.isolated, vec![lonely.node_id()]);
        for cluster in &clusters.clusters {
            assert_eq!(cluster.len(), 2);
        }
    }

    #[tokio::test]
    async fn truncation_is_deterministic_and_flagged() {
        let nodes: Vec<NodeInput> = (0..10).map(|i| node_input(&format!("n-{i}"))).collect();
        let view = build_view(
            &nodes,
            &[],
            QueryLimits {
                max_nodes: Some(3),
            },
        )
        .await;
        assert!(view.truncated);
        assert_eq!(view.node_count(), 3);
        let orphan_ids: Vec<String> =
            view.find_orphans().iter().map(|n| n.native_id.clone()).collect();
        assert_eq!(orphan_ids, vec!["n-0", "n-1", "n-2"]);
    }
}
