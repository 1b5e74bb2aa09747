use crate::errors::ErrorKind;
use crate::prelude::*;
use crate::snapshot::GraphSnapshot;
use crate::storage::actor::StorageActor;
use crate::storage::{
    apply_edge_observation, apply_missing_mark, apply_node_observation, stats_from_tables,
    ChangeQuery, EdgeDirection, EdgeFilter, EdgeUpsert, GraphStorage, MissingScope,
    MissingTransition, NodeFilter, NodeUpsert,
};
use crate::types::{
    ChangeRecord, ChangeType, DiscoveryMethod, EdgeDefinition, GraphEdge, GraphNode, GraphStats,
    Group, NodeInput, NodeStatus, Provider, RelationshipType, ResourceType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Relational backend over sqlite. The blocking connection lives on a
/// [`StorageActor`] thread, which serializes all reads and writes for the
/// tenant that owns this handle.
///
/// A `namespace` yields schema-per-tenant isolation by prefixing table
/// names; `None` shares the plain table names.
#[derive(Debug)]
pub struct RelationalStorage {
    actor: StorageActor,
    prefix: String,
}

fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl RelationalStorage {
    pub fn open(connection: &str) -> Result<Self> {
        Self::open_with_namespace(connection, None)
    }

    pub fn open_with_namespace(connection: &str, namespace: Option<&str>) -> Result<Self> {
        let conn = Connection::open(connection)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let actor = StorageActor::spawn("relational", conn)?;
        let prefix = namespace
            .map(|ns| format!("t_{}_", sanitize_namespace(ns)))
            .unwrap_or_default();
        Ok(RelationalStorage { actor, prefix })
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

const NODE_COLUMNS: &str = "id, name, provider, account, region, resource_type, native_id, \
     status, tags_json, metadata_json, cost_monthly, owner, created_at, first_seen_at, \
     last_seen_at, last_modified_at, last_sync_id, missing_count, missing_marked_by, deleted_at";

const EDGE_COLUMNS: &str =
    "id, source_id, target_id, relationship_type, confidence, discovered_via, metadata_json, dangling";

const CHANGE_COLUMNS: &str =
    "id, node_id, detected_at, change_type, field, previous_value, new_value, source";

fn parse_dt(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| ErrorKind::Storage(format!("bad timestamp {raw:?}: {e}")))?
        .with_timezone(&Utc))
}

fn parse_opt_dt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_dt(&s)).transpose()
}

fn parse_json_map(raw: &str) -> Result<Map<String, Value>> {
    Ok(serde_json::from_str(raw)?)
}

// Raw row images; conversion to the typed records happens outside the
// rusqlite row mapper so JSON/timestamp errors surface as storage errors.
struct NodeRow {
    id: String,
    name: String,
    provider: String,
    account: String,
    region: String,
    resource_type: String,
    native_id: String,
    status: String,
    tags_json: String,
    metadata_json: String,
    cost_monthly: Option<f64>,
    owner: Option<String>,
    created_at: Option<String>,
    first_seen_at: String,
    last_seen_at: String,
    last_modified_at: String,
    last_sync_id: Option<String>,
    missing_count: u32,
    missing_marked_by: Option<String>,
    deleted_at: Option<String>,
}

fn node_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: row.get(2)?,
        account: row.get(3)?,
        region: row.get(4)?,
        resource_type: row.get(5)?,
        native_id: row.get(6)?,
        status: row.get(7)?,
        tags_json: row.get(8)?,
        metadata_json: row.get(9)?,
        cost_monthly: row.get(10)?,
        owner: row.get(11)?,
        created_at: row.get(12)?,
        first_seen_at: row.get(13)?,
        last_seen_at: row.get(14)?,
        last_modified_at: row.get(15)?,
        last_sync_id: row.get(16)?,
        missing_count: row.get(17)?,
        missing_marked_by: row.get(18)?,
        deleted_at: row.get(19)?,
    })
}

fn node_from_row(row: NodeRow) -> Result<GraphNode> {
    Ok(GraphNode {
        id: row.id,
        native_id: row.native_id,
        name: row.name,
        provider: Provider::parse_lossy(&row.provider),
        account: row.account,
        region: row.region,
        resource_type: ResourceType::parse_lossy(&row.resource_type),
        status: NodeStatus::parse_lossy(&row.status),
        tags: serde_json::from_str::<BTreeMap<String, String>>(&row.tags_json)?,
        metadata: parse_json_map(&row.metadata_json)?,
        cost_monthly: row.cost_monthly,
        owner: row.owner,
        created_at: parse_opt_dt(row.created_at)?,
        first_seen_at: parse_dt(&row.first_seen_at)?,
        last_seen_at: parse_dt(&row.last_seen_at)?,
        last_modified_at: parse_dt(&row.last_modified_at)?,
        last_sync_id: row.last_sync_id,
        missing_count: row.missing_count,
        missing_marked_by: row.missing_marked_by,
        deleted_at: parse_opt_dt(row.deleted_at)?,
    })
}

fn write_node(conn: &Connection, table: &str, node: &GraphNode) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {table} ({NODE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
    );
    conn.execute(
        &sql,
        params![
            node.id,
            node.name,
            node.provider.to_string(),
            node.account,
            node.region,
            node.resource_type.to_string(),
            node.native_id,
            node.status.to_string(),
            serde_json::to_string(&node.tags)?,
            serde_json::to_string(&node.metadata)?,
            node.cost_monthly,
            node.owner,
            node.created_at.map(|t| t.to_rfc3339()),
            node.first_seen_at.to_rfc3339(),
            node.last_seen_at.to_rfc3339(),
            node.last_modified_at.to_rfc3339(),
            node.last_sync_id,
            node.missing_count,
            node.missing_marked_by,
            node.deleted_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

struct EdgeRow {
    id: String,
    source_id: String,
    target_id: String,
    relationship_type: String,
    confidence: f64,
    discovered_via: String,
    metadata_json: String,
    dangling: bool,
}

fn edge_row(row: &Row<'_>) -> rusqlite::Result<EdgeRow> {
    Ok(EdgeRow {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        relationship_type: row.get(3)?,
        confidence: row.get(4)?,
        discovered_via: row.get(5)?,
        metadata_json: row.get(6)?,
        dangling: row.get(7)?,
    })
}

fn edge_from_row(row: EdgeRow) -> Result<GraphEdge> {
    Ok(GraphEdge {
        id: row.id,
        source_node_id: row.source_id,
        target_node_id: row.target_id,
        relationship_type: RelationshipType::parse_lossy(&row.relationship_type),
        confidence: row.confidence,
        discovered_via: DiscoveryMethod::parse_lossy(&row.discovered_via),
        metadata: parse_json_map(&row.metadata_json)?,
        dangling: row.dangling,
    })
}

fn write_edge(conn: &Connection, table: &str, edge: &GraphEdge) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {table} ({EDGE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
    );
    conn.execute(
        &sql,
        params![
            edge.id,
            edge.source_node_id,
            edge.target_node_id,
            edge.relationship_type.to_string(),
            edge.confidence,
            edge.discovered_via.to_string(),
            serde_json::to_string(&edge.metadata)?,
            edge.dangling,
        ],
    )?;
    Ok(())
}

struct ChangeRow {
    id: String,
    node_id: String,
    detected_at: String,
    change_type: String,
    field: Option<String>,
    previous_value: Option<String>,
    new_value: Option<String>,
    source: String,
}

fn change_row(row: &Row<'_>) -> rusqlite::Result<ChangeRow> {
    Ok(ChangeRow {
        id: row.get(0)?,
        node_id: row.get(1)?,
        detected_at: row.get(2)?,
        change_type: row.get(3)?,
        field: row.get(4)?,
        previous_value: row.get(5)?,
        new_value: row.get(6)?,
        source: row.get(7)?,
    })
}

fn change_from_row(row: ChangeRow) -> Result<ChangeRecord> {
    let change_type = match row.change_type.as_str() {
        "created" => ChangeType::Created,
        "updated" => ChangeType::Updated,
        "deleted" => ChangeType::Deleted,
        "reappeared" => ChangeType::Reappeared,
        other => {
            return Err(ErrorKind::Storage(format!("unknown change type {other:?}")).into());
        }
    };
    Ok(ChangeRecord {
        id: row.id,
        node_id: row.node_id,
        detected_at: parse_dt(&row.detected_at)?,
        change_type,
        field: row.field,
        previous_value: row.previous_value,
        new_value: row.new_value,
        source: row.source,
    })
}

fn write_change(conn: &Connection, table: &str, change: &ChangeRecord) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {table} ({CHANGE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
    );
    conn.execute(
        &sql,
        params![
            change.id,
            change.node_id,
            change.detected_at.to_rfc3339(),
            change.change_type.to_string(),
            change.field,
            change.previous_value,
            change.new_value,
            change.source,
        ],
    )?;
    Ok(())
}

fn load_node(conn: &Connection, table: &str, id: &str) -> Result<Option<GraphNode>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM {table} WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id], node_row)
        .optional()?;
    row.map(node_from_row).transpose()
}

fn set_meta(conn: &Connection, table: &str, key: &str, value: &str) -> Result<()> {
    let sql = format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)");
    conn.execute(&sql, params![key, value])?;
    Ok(())
}

fn get_meta(conn: &Connection, table: &str, key: &str) -> Result<Option<String>> {
    let sql = format!("SELECT value FROM {table} WHERE key = ?1");
    Ok(conn
        .query_row(&sql, params![key], |row| row.get(0))
        .optional()?)
}

#[async_trait]
impl GraphStorage for RelationalStorage {
    async fn initialize(&self) -> Result<()> {
        let nodes = self.table("nodes");
        let edges = self.table("edges");
        let changes = self.table("changes");
        let groups = self.table("groups");
        let meta = self.table("meta");
        self.actor
            .call(move |conn| {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {nodes} (
                        id TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        provider TEXT NOT NULL,
                        account TEXT NOT NULL,
                        region TEXT NOT NULL,
                        resource_type TEXT NOT NULL,
                        native_id TEXT NOT NULL,
                        status TEXT NOT NULL,
                        tags_json TEXT NOT NULL,
                        metadata_json TEXT NOT NULL,
                        cost_monthly REAL,
                        owner TEXT,
                        created_at TEXT,
                        first_seen_at TEXT NOT NULL,
                        last_seen_at TEXT NOT NULL,
                        last_modified_at TEXT NOT NULL,
                        last_sync_id TEXT,
                        missing_count INTEGER NOT NULL DEFAULT 0,
                        missing_marked_by TEXT,
                        deleted_at TEXT
                    );
                    CREATE INDEX IF NOT EXISTS {nodes}_par_idx ON {nodes} (provider, account, region);
                    CREATE INDEX IF NOT EXISTS {nodes}_type_idx ON {nodes} (resource_type);
                    CREATE INDEX IF NOT EXISTS {nodes}_native_idx ON {nodes} (native_id);
                    CREATE TABLE IF NOT EXISTS {edges} (
                        id TEXT PRIMARY KEY,
                        source_id TEXT NOT NULL,
                        target_id TEXT NOT NULL,
                        relationship_type TEXT NOT NULL,
                        confidence REAL NOT NULL,
                        discovered_via TEXT NOT NULL,
                        metadata_json TEXT NOT NULL,
                        dangling INTEGER NOT NULL DEFAULT 0,
                        UNIQUE (source_id, target_id, relationship_type)
                    );
                    CREATE INDEX IF NOT EXISTS {edges}_source_idx ON {edges} (source_id);
                    CREATE INDEX IF NOT EXISTS {edges}_target_idx ON {edges} (target_id);
                    CREATE TABLE IF NOT EXISTS {changes} (
                        id TEXT PRIMARY KEY,
                        node_id TEXT NOT NULL,
                        detected_at TEXT NOT NULL,
                        change_type TEXT NOT NULL,
                        field TEXT,
                        previous_value TEXT,
                        new_value TEXT,
                        source TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS {changes}_node_idx ON {changes} (node_id, detected_at);
                    CREATE TABLE IF NOT EXISTS {groups} (
                        id TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        node_ids_json TEXT NOT NULL,
                        tags_match_json TEXT
                    );
                    CREATE TABLE IF NOT EXISTS {meta} (
                        key TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );"
                ))?;
                Ok(())
            })
            .await?;
        info!("relational: schema ready (prefix {:?})", self.prefix);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.actor.shutdown().await;
        Ok(())
    }

    async fn upsert_node(&self, input: &NodeInput, sync_id: &str) -> Result<NodeUpsert> {
        let nodes = self.table("nodes");
        let changes_table = self.table("changes");
        let meta = self.table("meta");
        let input = input.clone();
        let sync_id = sync_id.to_string();
        self.actor
            .call(move |conn| {
                let now = Utc::now();
                let tx = conn.transaction()?;
                let existing = load_node(&tx, &nodes, &input.node_id())?;
                let (node, outcome, new_changes) =
                    apply_node_observation(existing, &input, &sync_id, now)?;
                write_node(&tx, &nodes, &node)?;
                for change in &new_changes {
                    write_change(&tx, &changes_table, change)?;
                }
                set_meta(&tx, &meta, "last_sync_at", &now.to_rfc3339())?;
                tx.commit()?;
                Ok(outcome)
            })
            .await
    }

    async fn upsert_edge(&self, definition: &EdgeDefinition) -> Result<EdgeUpsert> {
        let nodes = self.table("nodes");
        let edges = self.table("edges");
        let definition = definition.clone();
        self.actor
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing = {
                    let sql = format!("SELECT {EDGE_COLUMNS} FROM {edges} WHERE id = ?1");
                    tx.query_row(&sql, params![definition.edge_id()], edge_row)
                        .optional()?
                        .map(edge_from_row)
                        .transpose()?
                };
                let exists_sql = format!("SELECT COUNT(*) FROM {nodes} WHERE id = ?1");
                let source_present: i64 =
                    tx.query_row(&exists_sql, params![definition.source_node_id], |row| {
                        row.get(0)
                    })?;
                let target_present: i64 =
                    tx.query_row(&exists_sql, params![definition.target_node_id], |row| {
                        row.get(0)
                    })?;
                let (edge, outcome) = apply_edge_observation(
                    existing,
                    &definition,
                    (source_present > 0, target_present > 0),
                )?;
                if edge.dangling {
                    debug!("relational: retaining dangling edge {}", edge.id);
                }
                write_edge(&tx, &edges, &edge)?;
                tx.commit()?;
                Ok(outcome)
            })
            .await
    }

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let nodes = self.table("nodes");
        let id = id.to_string();
        self.actor
            .call(move |conn| load_node(conn, &nodes, &id))
            .await
    }

    async fn get_edge(&self, id: &str) -> Result<Option<GraphEdge>> {
        let edges = self.table("edges");
        let id = id.to_string();
        self.actor
            .call(move |conn| {
                let sql = format!("SELECT {EDGE_COLUMNS} FROM {edges} WHERE id = ?1");
                conn.query_row(&sql, params![id], edge_row)
                    .optional()?
                    .map(edge_from_row)
                    .transpose()
            })
            .await
    }

    async fn find_node_by_native_id(&self, native_id: &str) -> Result<Option<GraphNode>> {
        let nodes = self.table("nodes");
        let native_id = native_id.to_string();
        self.actor
            .call(move |conn| {
                let sql = format!(
                    "SELECT {NODE_COLUMNS} FROM {nodes} \
                     WHERE native_id = ?1 AND deleted_at IS NULL ORDER BY id LIMIT 1"
                );
                conn.query_row(&sql, params![native_id], node_row)
                    .optional()?
                    .map(node_from_row)
                    .transpose()
            })
            .await
    }

    async fn query_nodes(&self, filter: &NodeFilter) -> Result<Vec<GraphNode>> {
        let nodes = self.table("nodes");
        let filter = filter.clone();
        self.actor
            .call(move |conn| {
                let mut sql = format!("SELECT {NODE_COLUMNS} FROM {nodes}");
                if !filter.include_deleted {
                    sql.push_str(" WHERE deleted_at IS NULL");
                }
                sql.push_str(" ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], node_row)?;
                let mut result = Vec::new();
                for raw in rows {
                    let node = node_from_row(raw?)?;
                    if filter.matches(&node) {
                        result.push(node);
                    }
                }
                if let Some(limit) = filter.limit {
                    result.truncate(limit);
                }
                Ok(result)
            })
            .await
    }

    async fn query_edges(&self, filter: &EdgeFilter) -> Result<Vec<GraphEdge>> {
        let edges = self.table("edges");
        let filter = filter.clone();
        self.actor
            .call(move |conn| {
                let mut sql = format!("SELECT {EDGE_COLUMNS} FROM {edges}");
                let mut clauses = Vec::new();
                let mut args: Vec<String> = Vec::new();
                if let Some(source) = &filter.source_id {
                    args.push(source.clone());
                    clauses.push(format!("source_id = ?{}", args.len()));
                }
                if let Some(target) = &filter.target_id {
                    args.push(target.clone());
                    clauses.push(format!("target_id = ?{}", args.len()));
                }
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                sql.push_str(" ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), edge_row)?;
                let mut result = Vec::new();
                for raw in rows {
                    let edge = edge_from_row(raw?)?;
                    if filter.matches(&edge) {
                        result.push(edge);
                    }
                }
                Ok(result)
            })
            .await
    }

    async fn get_edges_for_node(
        &self,
        id: &str,
        direction: EdgeDirection,
    ) -> Result<Vec<GraphEdge>> {
        let edges = self.table("edges");
        let id = id.to_string();
        self.actor
            .call(move |conn| {
                let clause = match direction {
                    EdgeDirection::Downstream => "source_id = ?1",
                    EdgeDirection::Upstream => "target_id = ?1",
                    EdgeDirection::Both => "source_id = ?1 OR target_id = ?1",
                };
                let sql = format!(
                    "SELECT {EDGE_COLUMNS} FROM {edges} WHERE {clause} ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![id], edge_row)?;
                let mut result = Vec::new();
                for raw in rows {
                    result.push(edge_from_row(raw?)?);
                }
                Ok(result)
            })
            .await
    }

    async fn record_change(&self, change: &ChangeRecord) -> Result<()> {
        let changes = self.table("changes");
        let change = change.clone();
        self.actor
            .call(move |conn| write_change(conn, &changes, &change))
            .await
    }

    async fn query_changes(&self, query: &ChangeQuery) -> Result<Vec<ChangeRecord>> {
        let changes = self.table("changes");
        let query = query.clone();
        self.actor
            .call(move |conn| {
                let mut sql = format!("SELECT {CHANGE_COLUMNS} FROM {changes}");
                let mut clauses = Vec::new();
                let mut args: Vec<String> = Vec::new();
                if let Some(node_id) = &query.node_id {
                    args.push(node_id.clone());
                    clauses.push(format!("node_id = ?{}", args.len()));
                }
                if let Some(since) = query.since {
                    args.push(since.to_rfc3339());
                    clauses.push(format!("detected_at >= ?{}", args.len()));
                }
                if let Some(until) = query.until {
                    args.push(until.to_rfc3339());
                    clauses.push(format!("detected_at <= ?{}", args.len()));
                }
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                // rowid breaks detected_at ties by insertion order.
                sql.push_str(" ORDER BY detected_at DESC, rowid DESC");
                if let Some(limit) = query.limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), change_row)?;
                let mut result = Vec::new();
                for raw in rows {
                    result.push(change_from_row(raw?)?);
                }
                Ok(result)
            })
            .await
    }

    async fn save_group(&self, group: &Group) -> Result<()> {
        let groups = self.table("groups");
        let group = group.clone();
        self.actor
            .call(move |conn| {
                let sql = format!(
                    "INSERT OR REPLACE INTO {groups} (id, name, node_ids_json, tags_match_json) \
                     VALUES (?1, ?2, ?3, ?4)"
                );
                conn.execute(
                    &sql,
                    params![
                        group.id,
                        group.name,
                        serde_json::to_string(&group.node_ids)?,
                        group
                            .tags_match
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        let groups = self.table("groups");
        let id = id.to_string();
        self.actor
            .call(move |conn| {
                let sql = format!(
                    "SELECT id, name, node_ids_json, tags_match_json FROM {groups} WHERE id = ?1"
                );
                let raw: Option<(String, String, String, Option<String>)> = conn
                    .query_row(&sql, params![id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .optional()?;
                raw.map(|(id, name, node_ids_json, tags_match_json)| {
                    Ok(Group {
                        id,
                        name,
                        node_ids: serde_json::from_str::<BTreeSet<String>>(&node_ids_json)?,
                        tags_match: tags_match_json
                            .map(|raw| serde_json::from_str(&raw))
                            .transpose()?,
                    })
                })
                .transpose()
            })
            .await
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let groups = self.table("groups");
        self.actor
            .call(move |conn| {
                let sql = format!(
                    "SELECT id, name, node_ids_json, tags_match_json FROM {groups} ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?;
                let mut result = Vec::new();
                for raw in rows {
                    let (id, name, node_ids_json, tags_match_json) = raw?;
                    result.push(Group {
                        id,
                        name,
                        node_ids: serde_json::from_str::<BTreeSet<String>>(&node_ids_json)?,
                        tags_match: tags_match_json
                            .map(|raw| serde_json::from_str(&raw))
                            .transpose()?,
                    });
                }
                Ok(result)
            })
            .await
    }

    async fn get_stats(&self) -> Result<GraphStats> {
        let nodes = self.export_nodes().await?;
        let edges = self.query_edges(&EdgeFilter::default()).await?;
        let (last_sync_at, oldest, newest) = {
            let meta = self.table("meta");
            let changes = self.table("changes");
            self.actor
                .call(move |conn| {
                    let last_sync = get_meta(conn, &meta, "last_sync_at")?
                        .map(|raw| parse_dt(&raw))
                        .transpose()?;
                    let sql = format!("SELECT MIN(detected_at), MAX(detected_at) FROM {changes}");
                    let bounds: (Option<String>, Option<String>) =
                        conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
                    Ok((
                        last_sync,
                        parse_opt_dt(bounds.0)?,
                        parse_opt_dt(bounds.1)?,
                    ))
                })
                .await?
        };
        Ok(stats_from_tables(
            nodes.into_iter(),
            edges.into_iter(),
            last_sync_at,
            oldest,
            newest,
        ))
    }

    async fn mark_missing(&self, sync_id: &str, scope: &MissingScope) -> Result<Vec<String>> {
        let nodes = self.table("nodes");
        let changes_table = self.table("changes");
        let sync_id = sync_id.to_string();
        let scope = scope.clone();
        self.actor
            .call(move |conn| {
                let now = Utc::now();
                let tx = conn.transaction()?;
                let candidates = {
                    let sql = format!(
                        "SELECT {NODE_COLUMNS} FROM {nodes} WHERE deleted_at IS NULL \
                         AND (last_sync_id IS NULL OR last_sync_id != ?1) ORDER BY id"
                    );
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt.query_map(params![sync_id], node_row)?;
                    let mut loaded = Vec::new();
                    for raw in rows {
                        loaded.push(node_from_row(raw?)?);
                    }
                    loaded
                };

                let mut affected = Vec::new();
                for mut node in candidates {
                    if !scope.covers(&node) {
                        continue;
                    }
                    match apply_missing_mark(&mut node, &sync_id, scope.grace_syncs, now) {
                        None => {}
                        Some(MissingTransition::Disappearing) => {
                            write_node(&tx, &nodes, &node)?;
                            affected.push(node.id.clone());
                        }
                        Some(MissingTransition::Deleted(change)) => {
                            write_node(&tx, &nodes, &node)?;
                            write_change(&tx, &changes_table, &change)?;
                            affected.push(node.id.clone());
                        }
                    }
                }
                tx.commit()?;
                Ok(affected)
            })
            .await
    }

    async fn export_snapshot(&self) -> Result<GraphSnapshot> {
        let nodes = self.export_nodes_including_deleted().await?;
        let edges = self.query_edges(&EdgeFilter::default()).await?;
        let changes = self.query_changes(&ChangeQuery::default()).await?;
        let groups = self.list_groups().await?;
        let meta = self.table("meta");
        let last_sync_at = self
            .actor
            .call(move |conn| {
                get_meta(conn, &meta, "last_sync_at")?
                    .map(|raw| parse_dt(&raw))
                    .transpose()
            })
            .await?;
        Ok(GraphSnapshot {
            nodes,
            edges,
            changes,
            groups,
            last_sync_at,
        })
    }

    async fn import_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let nodes = self.table("nodes");
        let edges = self.table("edges");
        let changes = self.table("changes");
        let groups = self.table("groups");
        let meta = self.table("meta");
        let snapshot = snapshot.clone();
        self.actor
            .call(move |conn| {
                let tx = conn.transaction()?;
                for table in [&nodes, &edges, &changes, &groups, &meta] {
                    tx.execute(&format!("DELETE FROM {table}"), [])?;
                }
                for node in &snapshot.nodes {
                    write_node(&tx, &nodes, node)?;
                }
                for edge in &snapshot.edges {
                    write_edge(&tx, &edges, edge)?;
                }
                for change in &snapshot.changes {
                    write_change(&tx, &changes, change)?;
                }
                for group in &snapshot.groups {
                    let sql = format!(
                        "INSERT OR REPLACE INTO {groups} (id, name, node_ids_json, tags_match_json) \
                         VALUES (?1, ?2, ?3, ?4)"
                    );
                    tx.execute(
                        &sql,
                        params![
                            group.id,
                            group.name,
                            serde_json::to_string(&group.node_ids)?,
                            group
                                .tags_match
                                .as_ref()
                                .map(serde_json::to_string)
                                .transpose()?,
                        ],
                    )?;
                }
                if let Some(last_sync_at) = snapshot.last_sync_at {
                    set_meta(&tx, &meta, "last_sync_at", &last_sync_at.to_rfc3339())?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }
}

impl RelationalStorage {
    async fn export_nodes(&self) -> Result<Vec<GraphNode>> {
        self.query_nodes(&NodeFilter::default()).await
    }

    async fn export_nodes_including_deleted(&self) -> Result<Vec<GraphNode>> {
        self.query_nodes(&NodeFilter {
            include_deleted: true,
            ..Default::default()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    async fn storage() -> RelationalStorage {
        let storage = RelationalStorage::open(":memory:").unwrap();
        storage.initialize().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn upsert_and_reload() {
        let storage = storage().await;
        let input = node_input("i-abc", 100.0);
        let outcome = storage.upsert_node(&input, "sync-1").await.unwrap();
        assert!(outcome.created);
        let node = storage.get_node(&input.node_id()).await.unwrap().unwrap();
        assert_eq!(node.cost_monthly, Some(100.0));
        assert_eq!(node.recompute_id(), node.id);

        let outcome = storage.upsert_node(&input, "sync-2").await.unwrap();
        assert!(!outcome.created && !outcome.updated);
        let changes = storage.query_changes(&ChangeQuery::default()).await.unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn field_change_produces_change_record() {
        let storage = storage().await;
        let input = node_input("i-abc", 100.0);
        storage.upsert_node(&input, "sync-1").await.unwrap();
        let mut update = input.clone();
        update.cost_monthly = Some(120.0);
        let outcome = storage.upsert_node(&update, "sync-2").await.unwrap();
        assert_eq!(outcome.fields_changed, vec!["costMonthly"]);
        let changes = storage
            .query_changes(&ChangeQuery {
                node_id: Some(input.node_id()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(changes[0].change_type, ChangeType::Updated);
        assert_eq!(changes[0].previous_value.as_deref(), Some("100"));
        assert_eq!(changes[0].new_value.as_deref(), Some("120"));
    }

    #[tokio::test]
    async fn namespaced_tables_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");
        let path_str = path.to_string_lossy().to_string();
        let alpha = RelationalStorage::open_with_namespace(&path_str, Some("alpha")).unwrap();
        let beta = RelationalStorage::open_with_namespace(&path_str, Some("beta")).unwrap();
        alpha.initialize().await.unwrap();
        beta.initialize().await.unwrap();

        alpha
            .upsert_node(&node_input("i-alpha", 1.0), "s")
            .await
            .unwrap();
        assert_eq!(
            alpha.query_nodes(&NodeFilter::default()).await.unwrap().len(),
            1
        );
        assert!(beta.query_nodes(&NodeFilter::default()).await.unwrap().is_empty());
        alpha.close().await.unwrap();
        beta.close().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_round_trip_across_backends() {
        use crate::storage::embedded::EmbeddedStorage;

        let relational = storage().await;
        let a = node_input("a", 10.0);
        let b = node_input("b", 20.0);
        relational.upsert_node(&a, "s").await.unwrap();
        relational.upsert_node(&b, "s").await.unwrap();
        relational
            .upsert_edge(&EdgeDefinition {
                source_node_id: a.node_id(),
                target_node_id: b.node_id(),
                relationship_type: RelationshipType::Uses,
                confidence: 1.0,
                discovered_via: DiscoveryMethod::ApiField,
                metadata: Map::new(),
            })
            .await
            .unwrap();

        let snapshot = relational.export_snapshot().await.unwrap();
        let embedded = EmbeddedStorage::new();
        embedded.initialize().await.unwrap();
        embedded.import_snapshot(&snapshot).await.unwrap();

        assert_eq!(
            relational.query_nodes(&NodeFilter::default()).await.unwrap(),
            embedded.query_nodes(&NodeFilter::default()).await.unwrap()
        );
        assert_eq!(
            relational.query_edges(&EdgeFilter::default()).await.unwrap(),
            embedded.query_edges(&EdgeFilter::default()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn mark_missing_lifecycle_on_sqlite() {
        let storage = storage().await;
        let input = node_input("i-gone", 5.0);
        storage.upsert_node(&input, "sync-1").await.unwrap();
        let scope = MissingScope {
            provider: None,
            account: None,
            grace_syncs: 2,
        };
        assert_eq!(
            storage.mark_missing("sync-2", &scope).await.unwrap().len(),
            1
        );
        assert!(storage.mark_missing("sync-2", &scope).await.unwrap().is_empty());
        assert_eq!(
            storage.mark_missing("sync-3", &scope).await.unwrap().len(),
            1
        );
        let node = storage.get_node(&input.node_id()).await.unwrap().unwrap();
        assert!(node.is_deleted());
    }
}
