use crate::adapters::{
    Discovery, DiscoveryAdapter, DiscoveryContext, DiscoveryError, DISCOVERY_SOURCE_KEY,
};
use crate::errors::{classify, CartographError, ErrorCategory};
use crate::prelude::*;
use crate::registry::CloudAccount;
use crate::retry::{retry, RetryOptions};
use crate::types::Provider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One page of recorded discovery output, as an adapter would receive it
/// from a provider API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPage {
    #[serde(flatten)]
    pub discovery: Discovery,
}

/// Replays recorded discovery pages, either loaded from a directory of JSON
/// files or built in memory. Serves offline demos and tests; it goes through
/// the same pagination, retry and cancellation motions as a live adapter.
#[derive(Debug)]
pub struct FixtureAdapter {
    provider: Provider,
    pages: Vec<DiscoveryPage>,
    /// Number of initial page fetches that fail transiently, exercising the
    /// retry path.
    transient_failures: AtomicU32,
    transient_code: String,
}

impl FixtureAdapter {
    pub fn empty(provider: Provider) -> Self {
        Self::from_pages(provider, Vec::new())
    }

    pub fn from_pages(provider: Provider, pages: Vec<DiscoveryPage>) -> Self {
        FixtureAdapter {
            provider,
            pages,
            transient_failures: AtomicU32::new(0),
            transient_code: "ServiceUnavailable".to_string(),
        }
    }

    pub fn single_page(provider: Provider, discovery: Discovery) -> Self {
        Self::from_pages(provider, vec![DiscoveryPage { discovery }])
    }

    /// Loads `page-*.json` files from a directory, in file name order.
    pub fn from_dir(provider: Provider, dir: impl AsRef<Path>) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().map(|ext| ext == "json").unwrap_or(false)
                    && path
                        .file_name()
                        .map(|name| name.to_string_lossy().starts_with("page-"))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();
        let mut pages = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = std::fs::read_to_string(&path)?;
            pages.push(serde_json::from_str(&raw)?);
        }
        info!(
            "fixture: loaded {} discovery pages from {}",
            pages.len(),
            dir.as_ref().display()
        );
        Ok(Self::from_pages(provider, pages))
    }

    /// Makes the next `count` page fetches fail with `code` before
    /// succeeding; the built-in retry absorbs them when they are transient.
    pub fn with_transient_failures(mut self, code: &str, count: u32) -> Self {
        self.transient_failures = AtomicU32::new(count);
        self.transient_code = code.to_string();
        self
    }

    fn fetch_page(&self, index: usize) -> Result<DiscoveryPage> {
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(CartographError::provider(
                self.transient_code.clone(),
                format!("simulated failure fetching page {index}"),
            ));
        }
        Ok(self.pages[index].clone())
    }
}

#[async_trait]
impl DiscoveryAdapter for FixtureAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn discover(
        &self,
        account: &CloudAccount,
        context: &DiscoveryContext,
        cancel: &CancellationToken,
    ) -> Result<Discovery> {
        let mut output = Discovery::default();
        let source = format!("fixture:{}:{}", self.provider, account.id);

        let page_count = self.pages.len();
        if page_count > context.page_cap {
            warn!(
                "fixture: {page_count} pages exceed cap {}, truncating",
                context.page_cap
            );
            output.errors.push(DiscoveryError {
                scope: "pagination".to_string(),
                message: format!(
                    "page cap {} reached with {page_count} pages pending",
                    context.page_cap
                ),
                category: ErrorCategory::Limit,
            });
        }

        for index in 0..page_count.min(context.page_cap) {
            // Cancellation is observed between pages, like a live adapter
            // between paginated API calls.
            if cancel.is_cancelled() {
                return Err(CartographError::cancelled());
            }

            let page = match retry(
                RetryOptions::with_policy(context.retry.clone()).cancelled_by(cancel),
                |_| async move { self.fetch_page(index) },
            )
            .await
            {
                Ok(page) => page,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    let class = classify(&err);
                    output.errors.push(DiscoveryError {
                        scope: format!("page-{index}"),
                        message: class.message,
                        category: class.category,
                    });
                    continue;
                }
            };

            let mut page = page.discovery;
            page.nodes.retain(|node| context.wants(node.resource_type));
            for node in &mut page.nodes {
                node.metadata
                    .entry(DISCOVERY_SOURCE_KEY.to_string())
                    .or_insert_with(|| Value::String(source.clone()));
            }
            output.merge(page);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AccountAuth, CloudAccount};
    use crate::retry::RetryPolicy;
    use crate::types::{NodeInput, NodeStatus, ResourceType};
    use serde_json::Map;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn account() -> CloudAccount {
        CloudAccount {
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
        }
    }

    fn node(native_id: &str, resource_type: ResourceType) -> NodeInput {
        NodeInput {
            native_id: native_id.to_string(),
            name: native_id.to_string(),
            provider: Provider::Aws,
            account: "111111111111".to_string(),
            region: "us-east-1".to_string(),
            resource_type,
            status: NodeStatus::Running,
            tags: BTreeMap::new(),
            metadata: Map::new(),
            cost_monthly: None,
            owner: None,
            created_at: None,
        }
    }

    fn page(nodes: Vec<NodeInput>) -> DiscoveryPage {
        DiscoveryPage {
            discovery: Discovery {
                nodes,
                edges: Vec::new(),
                errors: Vec::new(),
            },
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn stamps_discovery_source_and_merges_pages() {
        let adapter = FixtureAdapter::from_pages(
            Provider::Aws,
            vec![
                page(vec![node("i-1", ResourceType::Compute)]),
                page(vec![node("i-2", ResourceType::Compute)]),
            ],
        );
        let output = adapter
            .discover(&account(), &DiscoveryContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.nodes.len(), 2);
        for node in &output.nodes {
            assert_eq!(
                node.metadata.get(DISCOVERY_SOURCE_KEY),
                Some(&Value::String("fixture:aws:a1".to_string()))
            );
        }
    }

    #[tokio::test]
    async fn respects_resource_type_scope() {
        let adapter = FixtureAdapter::single_page(
            Provider::Aws,
            Discovery {
                nodes: vec![
                    node("i-1", ResourceType::Compute),
                    node("vpc-1", ResourceType::Vpc),
                ],
                edges: Vec::new(),
                errors: Vec::new(),
            },
        );
        let context = DiscoveryContext {
            resource_types: Some([ResourceType::Compute].into_iter().collect()),
            ..Default::default()
        };
        let output = adapter
            .discover(&account(), &context, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.nodes.len(), 1);
        assert_eq!(output.nodes[0].native_id, "i-1");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_away() {
        let adapter = FixtureAdapter::from_pages(
            Provider::Aws,
            vec![page(vec![node("i-1", ResourceType::Compute)])],
        )
        .with_transient_failures("ThrottlingException", 2);
        let context = DiscoveryContext {
            retry: fast_retry(),
            ..Default::default()
        };
        let output = adapter
            .discover(&account(), &context, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.nodes.len(), 1);
        assert!(output.errors.is_empty());
    }

    #[tokio::test]
    async fn terminal_failure_is_reported_not_fatal() {
        let adapter = FixtureAdapter::from_pages(
            Provider::Aws,
            vec![
                page(vec![node("i-1", ResourceType::Compute)]),
                page(vec![node("i-2", ResourceType::Compute)]),
            ],
        )
        .with_transient_failures("AccessDenied", 1);
        let context = DiscoveryContext {
            retry: fast_retry(),
            ..Default::default()
        };
        let output = adapter
            .discover(&account(), &context, &CancellationToken::new())
            .await
            .unwrap();
        // First page fails terminally, second still lands.
        assert_eq!(output.nodes.len(), 1);
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors[0].category, ErrorCategory::Permission);
    }

    #[tokio::test]
    async fn cancellation_stops_between_pages() {
        let token = CancellationToken::new();
        token.cancel();
        let adapter = FixtureAdapter::from_pages(
            Provider::Aws,
            vec![page(vec![node("i-1", ResourceType::Compute)])],
        );
        let err = adapter
            .discover(&account(), &DiscoveryContext::default(), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn page_cap_truncates_with_limit_error() {
        let pages: Vec<DiscoveryPage> = (0..5)
            .map(|i| page(vec![node(&format!("i-{i}"), ResourceType::Compute)]))
            .collect();
        let adapter = FixtureAdapter::from_pages(Provider::Aws, pages);
        let context = DiscoveryContext {
            page_cap: 3,
            ..Default::default()
        };
        let output = adapter
            .discover(&account(), &context, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.nodes.len(), 3);
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors[0].category, ErrorCategory::Limit);
    }

    #[tokio::test]
    async fn loads_pages_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let page_json = serde_json::to_string(&page(vec![node("i-1", ResourceType::Compute)]))
            .unwrap();
        std::fs::write(dir.path().join("page-000.json"), page_json).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let adapter = FixtureAdapter::from_dir(Provider::Aws, dir.path()).unwrap();
        let output = adapter
            .discover(&account(), &DiscoveryContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.nodes.len(), 1);
    }
}
