use crate::errors::{CartographError, ErrorKind};
use crate::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// Resource types refreshed by a light sync; everything else waits for the
/// next full sync.
pub static LIGHT_SYNC_RESOURCE_TYPES: &[ResourceType] = &[
    ResourceType::Compute,
    ResourceType::Database,
    ResourceType::LoadBalancer,
    ResourceType::Function,
    ResourceType::Container,
];

#[derive(
    Debug,
    Display,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
    Kubernetes,
    #[serde(other)]
    Custom,
}

impl Provider {
    pub fn try_new(name: &str) -> Result<Self> {
        Provider::iter()
            .find(|candidate| candidate.to_string() == name)
            .ok_or_else(|| {
                CartographError::from(ErrorKind::InvalidProvider(name.to_string()))
            })
    }

    /// Lossy parse used on the read path: unrecognized providers become
    /// `custom` instead of failing the whole row.
    pub fn parse_lossy(name: &str) -> Self {
        Provider::try_new(name).unwrap_or(Provider::Custom)
    }
}

#[derive(
    Debug,
    Display,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Compute,
    Database,
    Storage,
    Network,
    Vpc,
    Subnet,
    LoadBalancer,
    Function,
    Container,
    Cache,
    Cdn,
    Dns,
    Identity,
    SecurityGroup,
    ApiGateway,
    Queue,
    Topic,
    #[serde(other)]
    Custom,
}

impl ResourceType {
    pub fn try_new(kind: &str) -> Result<Self> {
        ResourceType::iter()
            .find(|candidate| candidate.to_string() == kind)
            .ok_or_else(|| {
                CartographError::from(ErrorKind::InvalidResourceType(kind.to_string()))
            })
    }

    pub fn parse_lossy(kind: &str) -> Self {
        ResourceType::try_new(kind).unwrap_or(ResourceType::Custom)
    }
}

#[derive(
    Debug,
    Display,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Running,
    Stopped,
    Error,
    #[serde(other)]
    Unknown,
}

impl NodeStatus {
    pub fn parse_lossy(status: &str) -> Self {
        NodeStatus::iter()
            .find(|candidate| candidate.to_string() == status)
            .unwrap_or(NodeStatus::Unknown)
    }
}

#[derive(
    Debug,
    Display,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipType {
    RunsIn,
    MemberOf,
    Uses,
    Triggers,
    Contains,
    SecuredBy,
    EncryptsWith,
    ConnectsTo,
    DependsOn,
    ReplicatesTo,
    BacksUp,
    RoutesTo,
    PeersWith,
    MemberOfFleet,

    // Cross-account relationships produced by the inference pass.
    IamTrust,
    VpcPeering,
    SharedService,
    DataReplication,

    #[serde(other)]
    Unknown,
}

impl RelationshipType {
    pub fn try_new(name: &str) -> Result<Self> {
        RelationshipType::iter()
            .find(|candidate| candidate.to_string() == name)
            .ok_or_else(|| {
                CartographError::from(ErrorKind::InvalidRelationshipType(name.to_string()))
            })
    }

    pub fn parse_lossy(name: &str) -> Self {
        RelationshipType::try_new(name).unwrap_or(RelationshipType::Unknown)
    }

    /// Self-loops are rejected everywhere except for explicit
    /// self-dependencies.
    pub fn allows_self_loop(&self) -> bool {
        matches!(self, RelationshipType::DependsOn)
    }
}

/// Edge types traversed by blast-radius queries.
pub static IMPACT_RELATIONSHIPS: &[RelationshipType] = &[
    RelationshipType::Uses,
    RelationshipType::ConnectsTo,
    RelationshipType::Triggers,
    RelationshipType::DependsOn,
    RelationshipType::Contains,
];

/// Edge types traversed by dependency-chain queries and the SPOF analysis.
pub static DEPENDENCY_RELATIONSHIPS: &[RelationshipType] = &[
    RelationshipType::Uses,
    RelationshipType::DependsOn,
    RelationshipType::RunsIn,
    RelationshipType::MemberOf,
];

#[derive(
    Debug,
    Display,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMethod {
    ApiField,
    ConfigScan,
    Inference,
    #[serde(other)]
    User,
}

impl DiscoveryMethod {
    pub fn parse_lossy(name: &str) -> Self {
        DiscoveryMethod::iter()
            .find(|candidate| candidate.to_string() == name)
            .unwrap_or(DiscoveryMethod::User)
    }
}

#[derive(
    Debug,
    Display,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
    Reappeared,
}

/// Composes the canonical node identity. The id is a pure function of its
/// parts; `recompute` on any stored node must yield the stored id.
pub fn compose_node_id(
    provider: Provider,
    account: &str,
    region: &str,
    resource_type: ResourceType,
    native_id: &str,
) -> String {
    format!("{provider}:{account}:{region}:{resource_type}:{native_id}")
}

pub fn compose_edge_id(source_id: &str, relationship: RelationshipType, target_id: &str) -> String {
    format!("{source_id}--{relationship}--{target_id}")
}

/// A candidate node as emitted by a discovery adapter: user-provided fields
/// only, no graph bookkeeping.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NodeInput {
    pub native_id: String,
    pub name: String,
    pub provider: Provider,
    pub account: String,
    pub region: String,
    pub resource_type: ResourceType,
    #[serde(default = "default_status")]
    pub status: NodeStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub cost_monthly: Option<f64>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_status() -> NodeStatus {
    NodeStatus::Unknown
}

impl NodeInput {
    pub fn node_id(&self) -> String {
        compose_node_id(
            self.provider,
            &self.account,
            &self.region,
            self.resource_type,
            &self.native_id,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.native_id.is_empty() {
            return Err(CartographError::validation("nativeId must not be empty"));
        }
        if self.account.is_empty() {
            return Err(CartographError::validation("account must not be empty"));
        }
        if self.region.is_empty() {
            return Err(CartographError::validation(
                "region must not be empty (use \"global\" for unscoped resources)",
            ));
        }
        if let Some(cost) = self.cost_monthly {
            if !cost.is_finite() || cost < 0.0 {
                return Err(CartographError::validation(format!(
                    "costMonthly must be a non-negative number, got {cost}"
                )));
            }
        }
        Ok(())
    }
}

/// A stored resource vertex. Identity and user fields come from discovery;
/// the `first_seen_at`/`last_seen_at`/`last_modified_at` timestamps and the
/// disappearance bookkeeping are maintained by storage.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub native_id: String,
    pub name: String,
    pub provider: Provider,
    pub account: String,
    pub region: String,
    pub resource_type: ResourceType,
    pub status: NodeStatus,
    pub tags: BTreeMap<String, String>,
    pub metadata: Map<String, Value>,
    pub cost_monthly: Option<f64>,
    pub owner: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,

    #[serde(default)]
    pub last_sync_id: Option<String>,
    #[serde(default)]
    pub missing_count: u32,
    #[serde(default)]
    pub missing_marked_by: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl GraphNode {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// True when the node failed re-observation at least once but has not yet
    /// crossed the disappearance grace period.
    pub fn is_disappearing(&self) -> bool {
        self.missing_count > 0 && !self.is_deleted()
    }

    pub fn recompute_id(&self) -> String {
        compose_node_id(
            self.provider,
            &self.account,
            &self.region,
            self.resource_type,
            &self.native_id,
        )
    }
}

/// One differing user field between a stored node and a re-observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub previous: Option<String>,
    pub new: Option<String>,
}

fn display_cost(cost: f64) -> String {
    if cost.fract() == 0.0 {
        format!("{cost:.0}")
    } else {
        cost.to_string()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Field-level diff between a stored node and a fresh observation. Identity
/// components never differ for a matching id, so only mutable user fields are
/// compared. Field names follow the wire casing used in change records.
pub fn diff_fields(stored: &GraphNode, input: &NodeInput) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if stored.name != input.name {
        changes.push(FieldChange {
            field: "name",
            previous: Some(stored.name.clone()),
            new: Some(input.name.clone()),
        });
    }
    if stored.status != input.status {
        changes.push(FieldChange {
            field: "status",
            previous: Some(stored.status.to_string()),
            new: Some(input.status.to_string()),
        });
    }
    if stored.tags != input.tags {
        changes.push(FieldChange {
            field: "tags",
            previous: serde_json::to_string(&stored.tags).ok(),
            new: serde_json::to_string(&input.tags).ok(),
        });
    }
    if stored.metadata != input.metadata {
        changes.push(FieldChange {
            field: "metadata",
            previous: Some(display_value(&Value::Object(stored.metadata.clone()))),
            new: Some(display_value(&Value::Object(input.metadata.clone()))),
        });
    }
    if stored.cost_monthly != input.cost_monthly {
        changes.push(FieldChange {
            field: "costMonthly",
            previous: stored.cost_monthly.map(display_cost),
            new: input.cost_monthly.map(display_cost),
        });
    }
    if stored.owner != input.owner {
        changes.push(FieldChange {
            field: "owner",
            previous: stored.owner.clone(),
            new: input.owner.clone(),
        });
    }
    if stored.created_at != input.created_at {
        changes.push(FieldChange {
            field: "createdAt",
            previous: stored.created_at.map(|t| t.to_rfc3339()),
            new: input.created_at.map(|t| t.to_rfc3339()),
        });
    }
    changes
}

/// A stored directed relationship. Unique per
/// (source, target, relationship type); `dangling` flags edges whose
/// endpoints were missing at write time.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    pub discovered_via: DiscoveryMethod,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub dangling: bool,
}

/// Reference to a node as known to an adapter: either the composite graph id
/// or the provider-native identifier resolved at reconcile time.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub enum NodeRef {
    Id(String),
    NativeId(String),
}

/// A candidate edge as emitted by a discovery adapter.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EdgeInput {
    pub source: NodeRef,
    pub target: NodeRef,
    pub relationship_type: RelationshipType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub discovered_via: DiscoveryMethod,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_confidence() -> f64 {
    1.0
}

/// A fully resolved edge ready for storage.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    pub source_node_id: String,
    pub target_node_id: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    pub discovered_via: DiscoveryMethod,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EdgeDefinition {
    pub fn edge_id(&self) -> String {
        compose_edge_id(
            &self.source_node_id,
            self.relationship_type,
            &self.target_node_id,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(CartographError::validation(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }
        if self.source_node_id == self.target_node_id
            && !self.relationship_type.allows_self_loop()
        {
            return Err(CartographError::validation(format!(
                "self-loop not permitted for relationship type {}",
                self.relationship_type
            )));
        }
        Ok(())
    }
}

/// Append-only audit row recording one detected difference.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: String,
    pub node_id: String,
    pub detected_at: DateTime<Utc>,
    pub change_type: ChangeType,
    pub field: Option<String>,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub source: String,
}

/// Named cost/ownership aggregation. Membership is a view over node ids;
/// groups never own the nodes they reference.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub node_ids: BTreeSet<String>,
    #[serde(default)]
    pub tags_match: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GraphStats {
    pub node_count: u64,
    pub edge_count: u64,
    pub nodes_by_provider: BTreeMap<String, u64>,
    pub nodes_by_resource_type: BTreeMap<String, u64>,
    pub edges_by_relationship_type: BTreeMap<String, u64>,
    pub total_cost_monthly: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub oldest_change_at: Option<DateTime<Utc>>,
    pub newest_change_at: Option<DateTime<Utc>>,
}
