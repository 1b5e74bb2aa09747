//! Edge derivation from attribute evidence.
//!
//! Two passes: a per-account pass that reads metadata references out of
//! freshly upserted nodes (key ARNs, subnet ids, security groups,
//! replication sources), and a cross-account pass that joins node metadata
//! across the accounts of one tenant (IAM trust, VPC peering, shared
//! services, data replication). Derived edges carry
//! `discoveredVia = inference` and bounded confidence.

use crate::types::{
    DiscoveryMethod, EdgeDefinition, GraphNode, RelationshipType, ResourceType,
};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Upper bound for every inferred edge; attribute evidence never beats an
/// explicit API field.
pub const MAX_INFERRED_CONFIDENCE: f64 = 0.9;

const ATTRIBUTE_RULES: &[(&str, RelationshipType, f64)] = &[
    ("kmsKeyArn", RelationshipType::EncryptsWith, 0.75),
    ("kmsKeyId", RelationshipType::EncryptsWith, 0.75),
    ("subnetId", RelationshipType::RunsIn, 0.7),
    ("vpcId", RelationshipType::RunsIn, 0.7),
    ("securityGroupId", RelationshipType::SecuredBy, 0.7),
    ("replicaSourceId", RelationshipType::ReplicatesTo, 0.7),
    ("dnsTarget", RelationshipType::RoutesTo, 0.65),
];

/// A derived relationship whose target is still a native-id reference; the
/// engine resolves it against storage before upserting.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredEdge {
    pub source_node_id: String,
    pub target_native_id: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
}

impl InferredEdge {
    pub fn into_definition(self, target_node_id: String) -> EdgeDefinition {
        EdgeDefinition {
            source_node_id: self.source_node_id,
            target_node_id,
            relationship_type: self.relationship_type,
            confidence: self.confidence.min(MAX_INFERRED_CONFIDENCE),
            discovered_via: DiscoveryMethod::Inference,
            metadata: Map::new(),
        }
    }
}

fn string_values(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
        _ => Vec::new(),
    }
}

/// Scans node metadata for references to other resources. Keys match the
/// rule table exactly or as a plural (`subnetIds`).
pub fn derive_attribute_edges(nodes: &[GraphNode]) -> Vec<InferredEdge> {
    let mut edges = Vec::new();
    for node in nodes {
        for (key, relationship, confidence) in ATTRIBUTE_RULES {
            let plural = format!("{key}s");
            let value = node
                .metadata
                .get(*key)
                .or_else(|| node.metadata.get(&plural));
            let Some(value) = value else { continue };
            for reference in string_values(value) {
                if reference.is_empty() {
                    continue;
                }
                edges.push(InferredEdge {
                    source_node_id: node.id.clone(),
                    target_native_id: reference.to_string(),
                    relationship_type: *relationship,
                    confidence: *confidence,
                });
            }
        }
    }
    edges
}

/// A derived cross-account relationship; both endpoints are already graph
/// node ids.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossAccountEdge {
    pub source_node_id: String,
    pub target_node_id: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
}

impl CrossAccountEdge {
    pub fn into_definition(self) -> EdgeDefinition {
        EdgeDefinition {
            source_node_id: self.source_node_id,
            target_node_id: self.target_node_id,
            relationship_type: self.relationship_type,
            confidence: self.confidence.min(MAX_INFERRED_CONFIDENCE),
            discovered_via: DiscoveryMethod::Inference,
            metadata: Map::new(),
        }
    }
}

fn metadata_text(node: &GraphNode, key: &str) -> Option<String> {
    node.metadata.get(key).map(|value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Joins metadata evidence across the accounts of one tenant. `nodes` maps
/// native account id → that account's active nodes.
pub fn derive_cross_account_edges(
    nodes: &HashMap<String, Vec<GraphNode>>,
) -> Vec<CrossAccountEdge> {
    let mut edges = Vec::new();

    for (source_account, source_nodes) in nodes {
        for (target_account, target_nodes) in nodes {
            if source_account == target_account {
                continue;
            }

            for source in source_nodes {
                // IAM trust: an identity whose trust policy names the other
                // account trusts that account's identities.
                if source.resource_type == ResourceType::Identity {
                    if let Some(policy) = metadata_text(source, "trustPolicy") {
                        if policy.contains(target_account.as_str()) {
                            for target in target_nodes
                                .iter()
                                .filter(|n| n.resource_type == ResourceType::Identity)
                            {
                                edges.push(CrossAccountEdge {
                                    source_node_id: source.id.clone(),
                                    target_node_id: target.id.clone(),
                                    relationship_type: RelationshipType::IamTrust,
                                    confidence: 0.85,
                                });
                            }
                        }
                    }
                }

                // VPC peering: a VPC naming a peer VPC that lives in the
                // other account.
                if source.resource_type == ResourceType::Vpc {
                    if let Some(peer) = metadata_text(source, "peerVpcId") {
                        for target in target_nodes
                            .iter()
                            .filter(|n| n.resource_type == ResourceType::Vpc)
                        {
                            if target.native_id == peer {
                                edges.push(CrossAccountEdge {
                                    source_node_id: source.id.clone(),
                                    target_node_id: target.id.clone(),
                                    relationship_type: RelationshipType::VpcPeering,
                                    confidence: 0.85,
                                });
                            }
                        }
                    }
                }

                // Shared service: explicit share lists naming the consumer
                // account.
                if let Some(shared_with) = source.metadata.get("sharedWith") {
                    if string_values(shared_with)
                        .iter()
                        .any(|account| account == target_account)
                    {
                        for target in target_nodes
                            .iter()
                            .filter(|n| n.resource_type == source.resource_type)
                        {
                            edges.push(CrossAccountEdge {
                                source_node_id: source.id.clone(),
                                target_node_id: target.id.clone(),
                                relationship_type: RelationshipType::SharedService,
                                confidence: 0.8,
                            });
                        }
                    }
                }

                // Data replication: replication targets referencing native
                // ids in the other account.
                if let Some(targets) = source.metadata.get("replicationTargets") {
                    for reference in string_values(targets) {
                        for target in target_nodes.iter() {
                            if target.native_id == reference {
                                edges.push(CrossAccountEdge {
                                    source_node_id: source.id.clone(),
                                    target_node_id: target.id.clone(),
                                    relationship_type: RelationshipType::DataReplication,
                                    confidence: 0.8,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    edges.sort_by(|a, b| {
        (&a.source_node_id, &a.target_node_id, a.relationship_type).cmp(&(
            &b.source_node_id,
            &b.target_node_id,
            b.relationship_type,
        ))
    });
    edges.dedup();
    edges
}
