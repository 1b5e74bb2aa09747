use crate::config::SyncConfig;
use crate::engine::{GraphEngine, SyncScope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SyncKind {
    Light,
    Full,
}

/// Drives periodic light and full syncs per tenant. Cooperative: each loop
/// is a single task that observes the cancellation token, and a tick whose
/// predecessor is still running is skipped, never queued.
#[derive(Debug)]
pub struct SyncScheduler {
    engine: Arc<GraphEngine>,
    light_interval: Duration,
    full_interval: Duration,
    drift_detection: bool,
    cancel: CancellationToken,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<GraphEngine>, config: &SyncConfig) -> Self {
        Self::with_intervals(
            engine,
            config.light_interval(),
            config.full_interval(),
            config.enable_drift_detection,
        )
    }

    /// Direct interval control; used by small deployments and tests.
    pub fn with_intervals(
        engine: Arc<GraphEngine>,
        light_interval: Duration,
        full_interval: Duration,
        drift_detection: bool,
    ) -> Self {
        SyncScheduler {
            engine,
            light_interval,
            full_interval,
            drift_detection,
            cancel: CancellationToken::new(),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts the two periodic loops for each tenant.
    pub fn start(&self, tenant_ids: &[String]) {
        let mut handles = self.handles.lock().expect("scheduler handles poisoned");
        for tenant_id in tenant_ids {
            let gates: HashMap<SyncKind, Arc<AsyncMutex<()>>> = [
                (SyncKind::Light, Arc::new(AsyncMutex::new(()))),
                (SyncKind::Full, Arc::new(AsyncMutex::new(()))),
            ]
            .into_iter()
            .collect();

            for (kind, interval) in [
                (SyncKind::Light, self.light_interval),
                (SyncKind::Full, self.full_interval),
            ] {
                let engine = self.engine.clone();
                let token = self.cancel.clone();
                let tenant = tenant_id.clone();
                let gate = gates[&kind].clone();
                let drift = self.drift_detection;
                handles.push(tokio::spawn(async move {
                    run_sync_loop(engine, tenant, kind, interval, gate, drift, token).await;
                }));
            }
        }
    }

    /// Cancels all loops and waits for them to wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("scheduler handles poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("scheduler: stopped");
    }
}

async fn run_sync_loop(
    engine: Arc<GraphEngine>,
    tenant_id: String,
    kind: SyncKind,
    interval: Duration,
    gate: Arc<AsyncMutex<()>>,
    drift_detection: bool,
    token: CancellationToken,
) {
    info!("scheduler: {kind:?} sync loop for {tenant_id} every {interval:?}");
    let mut ticks: usize = 0;
    let mut skipped: usize = 0;
    let mut timer = tokio::time::interval(interval);
    // A run that overshoots its period must not cause a burst of catch-up
    // ticks afterwards.
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    timer.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                break;
            },
            _ = timer.tick() => {
                ticks += 1;
                // A tick that fires while the previous run is still going is
                // dropped, not queued.
                let Ok(_guard) = gate.try_lock() else {
                    skipped += 1;
                    warn!("scheduler: skipping {kind:?} tick {ticks} for {tenant_id}, previous run still active");
                    continue;
                };
                let scope = match kind {
                    SyncKind::Light => SyncScope::light(&tenant_id),
                    SyncKind::Full => SyncScope::for_tenant(&tenant_id),
                };
                match engine.sync(Some(scope), &token).await {
                    Ok(results) => {
                        let limit_hit = results.iter().any(|result| result.has_limit_error());
                        if limit_hit {
                            warn!("scheduler: {tenant_id} hit a tenant limit, remainder of cycle skipped");
                        }
                        if kind == SyncKind::Full && drift_detection && !token.is_cancelled() {
                            report_drift(&engine, &tenant_id).await;
                        }
                    }
                    Err(err) => {
                        warn!("scheduler: {kind:?} sync for {tenant_id} failed: {err}");
                    }
                }
            },
        }
    }
    info!("scheduler: {kind:?} loop for {tenant_id} stopped after {ticks} ticks ({skipped} skipped)");
}

async fn report_drift(engine: &GraphEngine, tenant_id: &str) {
    match engine.detect_drift(tenant_id, None).await {
        Ok(report) => {
            info!(
                "scheduler: drift for {tenant_id}: {} drifted, {} disappeared, {} new",
                report.drifted_nodes.len(),
                report.disappeared_nodes.len(),
                report.new_nodes.len()
            );
        }
        Err(err) => warn!("scheduler: drift detection for {tenant_id} failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixture::FixtureAdapter;
    use crate::adapters::AdapterRegistry;
    use crate::config::{StorageConfig, TenancyConfig};
    use crate::engine::EngineConfig;
    use crate::registry::{AccountAuth, AccountRegistry, CloudAccount};
    use crate::storage::NodeFilter;
    use crate::tenancy::TenantManager;
    use crate::types::Provider;
    use std::collections::BTreeMap;

    fn engine_with_fixture(pages: usize) -> Arc<GraphEngine> {
        use crate::adapters::{Discovery, DiscoveryError};
        use crate::types::{NodeInput, NodeStatus, ResourceType};
        use serde_json::Map;

        let tenants = Arc::new(TenantManager::new(
            StorageConfig::default(),
            &TenancyConfig::default(),
        ));
        tenants.register_tenant("t1", "Tenant One").unwrap();

        let accounts = Arc::new(AccountRegistry::new());
        accounts
            .register(CloudAccount {
                id: "a1".to_string(),
                provider: Provider::Aws,
                native_account_id: "111111111111".to_string(),
                name: "prod".to_string(),
                tenant_id: "t1".to_string(),
                enabled: true,
                regions: vec!["us-east-1".to_string()],
                auth: AccountAuth::Default,
                tags: BTreeMap::new(),
                last_sync_at: None,
            })
            .unwrap();

        let nodes: Vec<NodeInput> = (0..pages)
            .map(|i| NodeInput {
                native_id: format!("i-{i}"),
                name: format!("i-{i}"),
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
            })
            .collect();
        let discovery = Discovery {
            nodes,
            edges: Vec::new(),
            errors: Vec::<DiscoveryError>::new(),
        };

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(FixtureAdapter::single_page(
            Provider::Aws,
            discovery,
        )));

        Arc::new(GraphEngine::new(
            tenants,
            accounts,
            Arc::new(adapters),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn ticks_run_and_shutdown_is_clean() {
        let engine = engine_with_fixture(2);
        let scheduler = SyncScheduler::with_intervals(
            engine.clone(),
            Duration::from_millis(20),
            Duration::from_millis(35),
            false,
        );
        scheduler.start(&["t1".to_string()]);
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.shutdown().await;

        let storage = engine.tenants().get_storage("t1").await.unwrap();
        let nodes = storage.query_nodes(&NodeFilter::default()).await.unwrap();
        assert_eq!(nodes.len(), 2, "periodic syncs populated the graph");
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_no_op() {
        let engine = engine_with_fixture(1);
        let scheduler = SyncScheduler::with_intervals(
            engine,
            Duration::from_millis(10),
            Duration::from_millis(10),
            false,
        );
        scheduler.shutdown().await;
    }
}
