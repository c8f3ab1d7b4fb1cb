//! Group Registry (spec §4.1): the top-level poll loop that walks every
//! node, assigns it a group key, and keeps exactly one Candidate Runner /
//! Drain Runner pair alive per observed group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use nla_config::{Config, RetryStrategyKind};
use nla_drain_buffer::DrainBuffer;
use nla_filters::{CompositeFilter, LabelExpr};
use nla_k8s::client::{EventType, ObjectRef};
use nla_k8s::group_key::{compute_group_key, override_is_valid, GroupKeyResult};
use nla_k8s::annotations::LABEL_GROUP_KEY;
use nla_k8s::node::NodeView;
use nla_k8s::ClusterClient;
use nla_limiter::{CordonLimiter, GlobalBlocker};
use nla_metrics::Metrics;
use nla_retry_wall::{RetryStrategy, RetryWall};
use nla_simulator::DrainSimulator;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::candidate_runner::CandidateRunner;
use crate::drain_runner::DrainRunner;

/// At most this many nodes are reconciled concurrently per poll
/// (spec §4.1: "reconciles nodes with bounded concurrency").
const MAX_CONCURRENT_RECONCILES: usize = 2;

/// Requeue hint returned by [`GroupRegistry::reconcile`]; the caller may
/// ignore it since the poll loop re-visits every node every cycle anyway,
/// but it documents the backoff the spec calls for while caches warm up.
pub type RequeueAfter = Option<Duration>;

struct GroupHandle {
    shutdown: CancellationToken,
    candidate: JoinHandle<()>,
    drain: JoinHandle<()>,
}

pub struct GroupRegistry<C: ClusterClient + 'static> {
    client: Arc<C>,
    config: Config,
    metrics: Arc<Metrics>,
    label_expr: LabelExpr,
    filter_chain: Arc<CompositeFilter<C>>,
    retry_wall: Arc<RetryWall<C>>,
    drain_buffer: Arc<DrainBuffer<C>>,
    global_blocker: Arc<GlobalBlocker<C>>,
    cordon_limiter: Arc<CordonLimiter<C>>,
    simulator: Arc<DrainSimulator<C>>,
    drainer: Arc<nla_drainer::Drainer<C>>,
    groups: Mutex<HashMap<String, GroupHandle>>,
}

impl<C: ClusterClient + 'static> GroupRegistry<C> {
    /// The shared metrics registry, for wiring the same collector set into
    /// sibling components (e.g. the scope observer) from the binary crate.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn drain_buffer(&self) -> Arc<DrainBuffer<C>> {
        self.drain_buffer.clone()
    }

    pub fn simulator(&self) -> Arc<DrainSimulator<C>> {
        self.simulator.clone()
    }

    pub fn global_blocker(&self) -> Arc<GlobalBlocker<C>> {
        self.global_blocker.clone()
    }

    /// Loads the drain buffer's persisted state (spec §4.8 `Initialize`).
    /// Must be called once, after the cluster client reports
    /// `has_synced()`, before the group poll loop starts.
    pub async fn initialize(&self) -> nla_error::Result<()> {
        self.drain_buffer.initialize().await
    }

    /// Bundles the registry's own node poll loop together with the support
    /// loops its collaborators own (drain buffer persistence, simulator
    /// cache cleanup, global blocker polling) into `nla-service-manager`
    /// services, so the binary crate only has to hand one `Vec` to
    /// `service_manager::start`.
    pub fn services(self: &Arc<Self>, poll_period: Duration) -> Vec<nla_service_manager::Service> {
        let registry = self.clone();
        let node_poll = nla_service_manager::Service::new(
            "group-registry-node-poll",
            nla_service_manager::ServiceKind::Service,
            move |shutdown| {
                let registry = registry.clone();
                async move {
                    registry.run_node_poll_loop(poll_period, shutdown).await;
                    Ok(())
                }
            },
        );

        let drain_buffer = self.drain_buffer.clone();
        let drain_buffer_persistence = nla_service_manager::Service::new(
            "drain-buffer-persistence",
            nla_service_manager::ServiceKind::Service,
            move |shutdown| {
                let drain_buffer = drain_buffer.clone();
                async move {
                    drain_buffer.run_persistence_loop(shutdown).await;
                    Ok(())
                }
            },
        );

        let simulator = self.simulator.clone();
        let simulator_cleanup = nla_service_manager::Service::new(
            "drain-simulator-cache-cleanup",
            nla_service_manager::ServiceKind::Service,
            move |shutdown| {
                let simulator = simulator.clone();
                async move {
                    simulator.run_cleanup_loop(shutdown).await;
                    Ok(())
                }
            },
        );

        let global_blocker = self.global_blocker.clone();
        let global_blocker_poll = nla_service_manager::Service::new(
            "global-blocker-poll",
            nla_service_manager::ServiceKind::Service,
            move |shutdown| {
                let global_blocker = global_blocker.clone();
                async move {
                    global_blocker.run_poll_loop(shutdown).await;
                    Ok(())
                }
            },
        );

        vec![
            node_poll,
            drain_buffer_persistence,
            simulator_cleanup,
            global_blocker_poll,
        ]
    }

    pub fn new(client: Arc<C>, config: Config) -> Self {
        let metrics = Arc::new(Metrics::new());
        let label_expr = LabelExpr::parse(&config.node_label_expr);
        let global_blocker = Arc::new(GlobalBlocker::new(client.clone(), config.global_blocker.clone()));
        let cordon_limiter = Arc::new(CordonLimiter::new(&config.cordon_limiter, global_blocker.clone()));
        let retry_wall = Arc::new(RetryWall::new(client.clone(), default_retry_strategy(&config)));
        let drain_buffer = Arc::new(DrainBuffer::new(client.clone()));
        let simulator = Arc::new(DrainSimulator::new(client.clone()));
        let drainer = Arc::new(nla_drainer::Drainer::new(client.clone(), cordon_limiter.clone(), config.clone()));

        GroupRegistry {
            client,
            config,
            metrics,
            label_expr,
            filter_chain: Arc::new(CompositeFilter::standard()),
            retry_wall,
            drain_buffer,
            global_blocker,
            cordon_limiter,
            simulator,
            drainer,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles a single node: assigns/refreshes its group-key label and
    /// makes sure a runner pair exists for that group. Returns a requeue
    /// hint mirroring the caller's backoff while the watch cache is cold.
    pub async fn reconcile(&self, node_name: &str) -> nla_error::Result<RequeueAfter> {
        if !self.client.has_synced() {
            return Ok(Some(Duration::from_secs(5)));
        }

        let Some(node) = self.client.get_node(node_name).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if now - node.creation_timestamp < chrono::Duration::from_std(self.config.timing.node_warmup_delay).unwrap_or_default() {
            return Ok(Some(self.config.timing.node_warmup_delay));
        }

        if !self.label_expr.matches(&node.labels) {
            return Ok(None);
        }

        let pods = self.client.list_pods_on_node(node_name).await?;
        let result = compute_group_key(&node, &self.config.drain_group_labels, &pods);
        if let GroupKeyResult::Disagreement { .. } = &result {
            self.client
                .emit_event(
                    &ObjectRef::node(node_name),
                    EventType::Warning,
                    "GroupOverrideBadConfiguration",
                    "pods on this node disagree on their drain-group-override annotation; falling back to the computed group key",
                )
                .await?;
        } else if !override_is_valid(&node) {
            self.client
                .emit_event(
                    &ObjectRef::node(node_name),
                    EventType::Warning,
                    "GroupOverrideBadConfiguration",
                    "this node's drain-group-override annotation is empty; falling back to the computed group key",
                )
                .await?;
        }
        let group_key = result.key().to_string();

        if node.group_key_label() != Some(group_key.as_str()) {
            self.client.set_node_label(node_name, LABEL_GROUP_KEY, &group_key).await?;
        }

        self.ensure_runners(group_key);
        Ok(None)
    }

    /// Spawns a Candidate Runner / Drain Runner pair for `group_key` unless
    /// one is already running, first sweeping finished handles so a group
    /// that has fully drained can be restarted if nodes reappear.
    fn ensure_runners(&self, group_key: String) {
        let mut groups = self.groups.lock().unwrap();
        groups.retain(|_, handle| !handle.candidate.is_finished() || !handle.drain.is_finished());

        if groups.contains_key(&group_key) {
            return;
        }

        let shutdown = CancellationToken::new();

        let candidate_runner = Arc::new(CandidateRunner::new(
            self.client.clone(),
            group_key.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.label_expr.clone(),
            self.filter_chain.clone(),
            self.retry_wall.clone(),
            self.drain_buffer.clone(),
            self.global_blocker.clone(),
            self.simulator.clone(),
        ));
        let drain_runner = Arc::new(DrainRunner::new(
            self.client.clone(),
            group_key.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.retry_wall.clone(),
            self.drain_buffer.clone(),
            self.drainer.clone(),
        ));

        let candidate_shutdown = shutdown.clone();
        let candidate = tokio::spawn(async move { candidate_runner.run(candidate_shutdown).await });
        let drain_shutdown = shutdown.clone();
        let drain = tokio::spawn(async move { drain_runner.run(drain_shutdown).await });

        tracing::info!(group = %group_key, "started candidate/drain runner pair");
        groups.insert(group_key, GroupHandle { shutdown, candidate, drain });
    }

    /// Polls the full node list on `period`, reconciling at most
    /// [`MAX_CONCURRENT_RECONCILES`] nodes at a time, until `shutdown`
    /// fires.
    pub async fn run_node_poll_loop(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let nodes = match self.client.list_nodes().await {
                        Ok(nodes) => nodes,
                        Err(err) => {
                            tracing::warn!(%err, "group registry failed to list nodes");
                            continue;
                        }
                    };
                    let names: Vec<String> = nodes.into_iter().map(|n: NodeView| n.name).collect();
                    stream::iter(names)
                        .for_each_concurrent(MAX_CONCURRENT_RECONCILES, |name| async move {
                            if let Err(err) = self.reconcile(&name).await {
                                tracing::warn!(node = %name, %err, "reconcile failed");
                            }
                        })
                        .await;
                }
            }
        }

        let groups = self.groups.lock().unwrap();
        for handle in groups.values() {
            handle.shutdown.cancel();
        }
    }
}

fn default_retry_strategy(config: &Config) -> RetryStrategy {
    let alert_threshold = config.retry.alert_threshold;
    match config.retry.default_strategy {
        RetryStrategyKind::Static => RetryStrategy::Static {
            delay_secs: config.retry.backoff_delay.as_secs(),
            alert_threshold,
        },
        RetryStrategyKind::Exponential => RetryStrategy::Exponential {
            base_delay_secs: config.retry.backoff_delay.as_secs(),
            alert_threshold,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nla_k8s::test_support::FakeClient;
    use std::collections::BTreeMap;

    fn node(name: &str) -> NodeView {
        NodeView {
            name: name.to_string(),
            labels: BTreeMap::from([("app".to_string(), "a".to_string())]),
            annotations: BTreeMap::new(),
            creation_timestamp: Utc::now() - chrono::Duration::hours(1),
            deletion_timestamp: None,
            unschedulable: false,
            nla_taint: None,
            conditions: Vec::new(),
            allocatable_cpu_millis: 0,
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.drain_group_labels = vec!["app".to_string()];
        config.timing.node_warmup_delay = Duration::from_secs(0);
        config
    }

    #[tokio::test]
    async fn reconcile_assigns_group_key_label() {
        let client = Arc::new(FakeClient::new().with_node(node("n1")));
        let registry = GroupRegistry::new(client.clone(), config());
        registry.reconcile("n1").await.unwrap();
        let updated = client.get_node("n1").await.unwrap().unwrap();
        assert_eq!(updated.group_key_label(), Some("a"));
    }

    #[tokio::test]
    async fn reconcile_requeues_while_cache_cold() {
        let client = Arc::new(FakeClient::new().with_node(node("n1")));
        client.state.lock().unwrap().synced = false;
        let registry = GroupRegistry::new(client, config());
        let requeue = registry.reconcile("n1").await.unwrap();
        assert!(requeue.is_some());
    }

    #[tokio::test]
    async fn reconcile_skips_nodes_outside_label_scope() {
        let client = Arc::new(FakeClient::new().with_node(node("n1")));
        let mut cfg = config();
        cfg.node_label_expr = "app=other".to_string();
        let registry = GroupRegistry::new(client.clone(), cfg);
        registry.reconcile("n1").await.unwrap();
        let updated = client.get_node("n1").await.unwrap().unwrap();
        assert_eq!(updated.group_key_label(), None);
    }

    #[tokio::test]
    async fn ensure_runners_is_idempotent() {
        let client = Arc::new(FakeClient::new().with_node(node("n1")));
        let registry = GroupRegistry::new(client, config());
        registry.ensure_runners("group-a".to_string());
        registry.ensure_runners("group-a".to_string());
        assert_eq!(registry.groups.lock().unwrap().len(), 1);
    }
}
