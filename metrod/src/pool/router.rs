//! Routing of collect/process/publish jobs to pool instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::PoolRegistry;
use crate::catalog::policy::ConfigDataNode;
use crate::plugin::proto::{Metric, MetricRequest};
use crate::plugin::PluginId;
use crate::{Error, Result};

/// A concrete metric request bound to its owning plugin.
#[derive(Debug, Clone)]
pub struct ResolvedMetric {
    pub owner: PluginId,
    pub request: MetricRequest,
}

/// Routes jobs to running instances.
///
/// Collect jobs fan out per owning plugin with one retry on a healthy
/// alternate; process and publish are single-instance, no retry. Every
/// entry point honors the supplied deadline; timing out drops the
/// outstanding rpc futures, abandoning work already inside a plugin.
pub struct Router {
    pools: Arc<PoolRegistry>,
}

impl Router {
    pub fn new(pools: Arc<PoolRegistry>) -> Self {
        Self { pools }
    }

    /// Collect all resolved metrics within `deadline`.
    ///
    /// Requests are grouped by owning plugin and issued concurrently.
    /// A group whose instance fails is retried once on another
    /// instance; a group that still fails surfaces as
    /// [`Error::CollectPartial`] carrying what did succeed.
    pub async fn collect(
        &self,
        resolved: Vec<ResolvedMetric>,
        deadline: Duration,
    ) -> Result<Vec<Metric>> {
        let requested = resolved.len();
        let mut groups: BTreeMap<PluginId, Vec<MetricRequest>> = BTreeMap::new();
        for item in resolved {
            groups.entry(item.owner).or_default().push(item.request);
        }

        let outcomes = tokio::time::timeout(deadline, async {
            let jobs = groups.into_iter().map(|(owner, requests)| async move {
                let result = self.collect_group(&owner, requests, deadline).await;
                (owner, result)
            });
            futures::future::join_all(jobs).await
        })
        .await
        .map_err(|_| Error::CollectTimeout)?;

        let mut merged = Vec::new();
        let mut failures = Vec::new();
        for (owner, outcome) in outcomes {
            match outcome {
                Ok(metrics) => merged.extend(metrics),
                Err(e) => {
                    warn!(plugin = %owner, "collect group failed: {e}");
                    failures.push((owner, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(merged)
        } else {
            let succeeded = merged.iter().map(|m| m.namespace.clone()).collect();
            let message = failures
                .iter()
                .map(|(owner, e)| format!("{owner}: {e}"))
                .collect::<Vec<_>>()
                .join(" -- ");
            Err(Error::CollectPartial {
                collected: merged.len(),
                requested,
                succeeded,
                message,
            })
        }
    }

    async fn collect_group(
        &self,
        owner: &PluginId,
        requests: Vec<MetricRequest>,
        deadline: Duration,
    ) -> Result<Vec<Metric>> {
        let mut checked = self.pools.checkout(owner).await?;
        match checked
            .instance()
            .rpc()
            .collect(requests.clone(), deadline)
            .await
        {
            Ok(metrics) => Ok(metrics),
            Err(first_err) => {
                debug!(plugin = %owner, "collect failed, retrying on another instance");
                checked.report_failure();
                drop(checked);
                match self.pools.checkout(owner).await {
                    Ok(mut retry) => {
                        match retry.instance().rpc().collect(requests, deadline).await {
                            Ok(metrics) => Ok(metrics),
                            Err(e) => {
                                retry.report_failure();
                                Err(e)
                            }
                        }
                    }
                    Err(_) => Err(first_err),
                }
            }
        }
    }

    /// Transform a batch through one processor instance. No retry.
    pub async fn process(
        &self,
        target: &PluginId,
        batch: Vec<Metric>,
        config: ConfigDataNode,
        deadline: Duration,
    ) -> Result<Vec<Metric>> {
        let mut checked = self.pools.checkout(target).await?;
        match checked.instance().rpc().process(batch, config, deadline).await {
            Ok(batch) => Ok(batch),
            Err(e) => {
                checked.report_failure();
                Err(e)
            }
        }
    }

    /// Sink a batch into one publisher instance. No retry.
    pub async fn publish(
        &self,
        target: &PluginId,
        batch: Vec<Metric>,
        config: ConfigDataNode,
        deadline: Duration,
    ) -> Result<()> {
        let mut checked = self.pools.checkout(target).await?;
        match checked.instance().rpc().publish(batch, config, deadline).await {
            Ok(()) => Ok(()),
            Err(e) => {
                checked.report_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::event::EventBus;
    use crate::plugin::proto::PluginArgs;
    use crate::plugin::stub::{StubHandle, StubPlugin};
    use crate::plugin::{LoadedPlugin, PluginType};
    use crate::pool::instance::testing::StubLauncher;

    const DEADLINE: Duration = Duration::from_secs(2);

    fn loaded(plugin_type: PluginType, name: &str) -> LoadedPlugin {
        LoadedPlugin::new(
            PluginId::new(plugin_type, name, 1),
            "/nonexistent".into(),
            [0; 32],
            false,
        )
    }

    fn request(namespace: &str) -> MetricRequest {
        MetricRequest {
            namespace: namespace.to_string(),
            version: 1,
            config: ConfigDataNode::default(),
        }
    }

    fn registry_for(stubs: &[&StubHandle]) -> Arc<PoolRegistry> {
        let endpoints = stubs
            .iter()
            .map(|s| (s.endpoint(), s.token().to_string()))
            .collect();
        Arc::new(PoolRegistry::new(
            Arc::new(StubLauncher::new(endpoints)),
            Arc::new(ControlConfig::default()),
            Arc::new(EventBus::new()),
            PluginArgs {
                control_public_key: None,
                log_path: "/tmp/metrod-plugin.log".into(),
                session_token: "t".into(),
            },
        ))
    }

    #[tokio::test]
    async fn test_collect_merges_groups() {
        let stub = StubPlugin::collector("mock1", 1).spawn().await;
        let registry = registry_for(&[&stub]);
        let plugin = loaded(PluginType::Collector, "mock1");
        registry.register(&plugin);
        let router = Router::new(registry);

        let metrics = router
            .collect(
                vec![
                    ResolvedMetric {
                        owner: plugin.id.clone(),
                        request: request("/metro/mock/foo"),
                    },
                    ResolvedMetric {
                        owner: plugin.id.clone(),
                        request: request("/metro/mock/bar"),
                    },
                ],
                DEADLINE,
            )
            .await
            .unwrap();
        assert_eq!(metrics.len(), 2);
        // One rpc for the whole group, not one per metric.
        assert_eq!(stub.collect_count(), 1);
    }

    #[tokio::test]
    async fn test_collect_retries_once_on_failure() {
        // First collect fails, the retry instance succeeds.
        let stub = StubPlugin::collector("mock1", 1)
            .with_collect_failures(1)
            .spawn()
            .await;
        let registry = registry_for(&[&stub]);
        let plugin = loaded(PluginType::Collector, "mock1");
        registry.register(&plugin);
        let router = Router::new(registry);

        let metrics = router
            .collect(
                vec![ResolvedMetric {
                    owner: plugin.id.clone(),
                    request: request("/metro/mock/foo"),
                }],
                DEADLINE,
            )
            .await
            .unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(stub.collect_count(), 2);
    }

    #[tokio::test]
    async fn test_collect_partial_carries_successes() {
        let good = StubPlugin::collector("good", 1).spawn().await;
        // Fails the first call and its retry.
        let bad = StubPlugin::collector("bad", 1)
            .with_collect_failures(2)
            .spawn()
            .await;

        let good_plugin = loaded(PluginType::Collector, "good");
        let bad_plugin = loaded(PluginType::Collector, "bad");
        let launcher = StubLauncher::new(Vec::new())
            .with_plugin("good", good.endpoint(), good.token())
            .with_plugin("bad", bad.endpoint(), bad.token());
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(launcher),
            Arc::new(ControlConfig::default()),
            Arc::new(EventBus::new()),
            PluginArgs {
                control_public_key: None,
                log_path: "/tmp/metrod-plugin.log".into(),
                session_token: "t".into(),
            },
        ));
        registry.register(&good_plugin);
        registry.register(&bad_plugin);
        let router = Router::new(registry);

        let err = router
            .collect(
                vec![
                    ResolvedMetric {
                        owner: good_plugin.id.clone(),
                        request: request("/metro/good/foo"),
                    },
                    ResolvedMetric {
                        owner: bad_plugin.id.clone(),
                        request: request("/metro/bad/foo"),
                    },
                ],
                DEADLINE,
            )
            .await
            .unwrap_err();

        match err {
            Error::CollectPartial {
                collected,
                requested,
                succeeded,
                ..
            } => {
                assert_eq!(collected, 1);
                assert_eq!(requested, 2);
                assert_eq!(succeeded, vec!["/metro/good/foo".to_string()]);
            }
            other => panic!("expected CollectPartial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_collect_deadline() {
        let stub = StubPlugin::collector("slow", 1)
            .with_reply_delay(Duration::from_millis(300))
            .spawn()
            .await;
        let registry = registry_for(&[&stub]);
        let plugin = loaded(PluginType::Collector, "slow");
        registry.register(&plugin);
        let router = Router::new(registry);

        let err = router
            .collect(
                vec![ResolvedMetric {
                    owner: plugin.id.clone(),
                    request: request("/metro/slow/foo"),
                }],
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CollectTimeout));
    }

    #[tokio::test]
    async fn test_process_and_publish() {
        let processor = StubPlugin::processor("passthru", 1).spawn().await;
        let publisher = StubPlugin::publisher("file", 1).spawn().await;

        let proc_plugin = loaded(PluginType::Processor, "passthru");
        let pub_plugin = loaded(PluginType::Publisher, "file");
        let endpoints = vec![
            (processor.endpoint(), processor.token().to_string()),
            (publisher.endpoint(), publisher.token().to_string()),
        ];
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(StubLauncher::new(endpoints)),
            Arc::new(ControlConfig::default()),
            Arc::new(EventBus::new()),
            PluginArgs {
                control_public_key: None,
                log_path: "/tmp/metrod-plugin.log".into(),
                session_token: "t".into(),
            },
        ));
        registry.register(&proc_plugin);
        registry.register(&pub_plugin);
        let router = Router::new(registry);

        let batch = vec![Metric {
            namespace: "/metro/mock/foo".into(),
            version: 1,
            data: serde_json::json!(42),
            collected_at: chrono::Utc::now(),
        }];

        let processed = router
            .process(&proc_plugin.id, batch, ConfigDataNode::default(), DEADLINE)
            .await
            .unwrap();
        assert_eq!(processed[0].data, serde_json::json!({ "processed": 42 }));

        router
            .publish(
                &pub_plugin.id,
                processed.clone(),
                ConfigDataNode::default(),
                DEADLINE,
            )
            .await
            .unwrap();
        assert_eq!(publisher.published().len(), 1);
    }
}
