use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use super::codec::{Codec, JsonCodec};
use super::merge::{merge_remote, KnownNodes, MergeReport};
use crate::concurrency_error;
use crate::crdt::{GCounter, GrowOnlyCounter};
use crate::error::{ErrorHandler, QuotaError, Result};
use crate::node_id::NodeName;
use crate::persistence::Flusher;
use crate::quota::{Metadata, Quota, QuotaStatus, QuotaTable};
use crate::settings::{EngineSettings, TransportSettings};
use crate::transport::{MessageHandler, Subscription, Transport};

/// State shared between the engine handle and its background tasks
struct Shared<C: GrowOnlyCounter> {
    node: NodeName,
    is_leader: AtomicBool,
    quotas: Mutex<QuotaTable<C>>,
    known_nodes: KnownNodes,
    codec: Arc<dyn Codec<C>>,
    flusher: Arc<dyn Flusher<C>>,
    errors_tx: mpsc::UnboundedSender<QuotaError>,
}

impl<C: GrowOnlyCounter> Shared<C> {
    fn quotas(&self) -> Result<MutexGuard<'_, QuotaTable<C>>> {
        self.quotas
            .lock()
            .map_err(|e| concurrency_error!("Mutex lock fail {}", e))
    }

    fn report(&self, err: QuotaError) {
        debug!("[{}] Queueing {}: {}", self.node, err.error_type(), err);
        // Receiver lives as long as the engine; a send failure means we are shutting down
        let _ = self.errors_tx.send(err);
    }

    fn snapshot(&self) -> Result<QuotaTable<C>> {
        self.quotas().map(|quotas| quotas.clone())
    }

    fn merge(&self, remote: QuotaTable<C>) -> Result<MergeReport> {
        let mut quotas = self.quotas()?;
        Ok(merge_remote(&mut quotas, remote, &self.node, &self.known_nodes))
    }

    /// Inbound message handler body
    fn handle_payload(&self, payload: &[u8]) {
        let remote = match self.codec.decode(payload) {
            Ok(remote) => remote,
            Err(e) => {
                self.report(QuotaError::Deserialization(e));
                return;
            }
        };
        let entries = remote.len();
        match self.merge(remote) {
            Ok(report) => {
                if report.changed() {
                    debug!(
                        "[{}] Merged {} remote entries: {:?}",
                        self.node, entries, report
                    );
                }
            }
            Err(e) => self.report(e),
        }
    }

    async fn broadcast_once(&self, transport: &dyn Transport, topic: &str) {
        let purged = self.known_nodes.purge_expired();
        if purged > 0 {
            debug!("[{}] Expired {} silent peers", self.node, purged);
        }

        let payload = match self
            .snapshot()
            .and_then(|quotas| self.codec.encode(&quotas).map_err(QuotaError::Serialization))
        {
            Ok(payload) => payload,
            Err(e) => {
                self.report(e);
                return;
            }
        };

        if let Err(e) = transport.publish(topic, payload).await {
            self.report(QuotaError::Publish(e));
        }
    }

    async fn flush_once(&self) {
        if !self.is_leader.load(Ordering::Acquire) {
            return;
        }
        let quotas = match self.snapshot() {
            Ok(quotas) => quotas,
            Err(e) => {
                self.report(e);
                return;
            }
        };
        if quotas.is_empty() {
            return;
        }
        match self.flusher.flush(&quotas).await {
            Ok(()) => debug!("[{}] Flushed {} quotas", self.node, quotas.len()),
            Err(e) => self.report(QuotaError::Persistence(e)),
        }
    }
}

#[derive(Clone)]
struct TransportBinding {
    client: Arc<dyn Transport>,
    settings: TransportSettings,
}

#[derive(Default)]
struct Runtime {
    started: bool,
    // Bumped by every `start`, so a stale startup can tell it was superseded
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl Runtime {
    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.subscription = None;
        self.started = false;
    }
}

/// Distributed quota engine.
///
/// Owns the local quota table and the peer liveness cache. Once started it
/// broadcasts the full table on every tick, merges every table it receives,
/// and, while leader, hands the table to its `Flusher`. Asynchronous failures
/// never stop a loop; they go to the `ErrorHandler` in arrival order.
pub struct QuotaEngine<C: GrowOnlyCounter = GCounter> {
    shared: Arc<Shared<C>>,
    settings: EngineSettings,
    error_handler: Arc<dyn ErrorHandler>,
    errors_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<QuotaError>>>,
    binding: Mutex<Option<TransportBinding>>,
    runtime: Mutex<Runtime>,
}

impl<C: GrowOnlyCounter> std::fmt::Debug for QuotaEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEngine")
            .field("node", &self.shared.node)
            .field("is_leader", &self.is_leader())
            .field("flush_interval", &self.settings.flush_interval)
            .finish()
    }
}

impl<C: GrowOnlyCounter> QuotaEngine<C> {
    pub fn new<F, H>(settings: EngineSettings, flusher: F, error_handler: H) -> Self
    where
        F: Flusher<C> + 'static,
        H: ErrorHandler + 'static,
    {
        Self::with_codec(settings, flusher, error_handler, JsonCodec)
    }

    pub fn with_codec<F, H, K>(
        settings: EngineSettings,
        flusher: F,
        error_handler: H,
        codec: K,
    ) -> Self
    where
        F: Flusher<C> + 'static,
        H: ErrorHandler + 'static,
        K: Codec<C> + 'static,
    {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        info!(
            "Created quota engine for node {} (leader: {})",
            settings.node_name, settings.is_leader
        );
        let shared = Shared {
            node: settings.node_name.clone(),
            is_leader: AtomicBool::new(settings.is_leader),
            quotas: Mutex::new(QuotaTable::new()),
            known_nodes: KnownNodes::new(settings.liveness_ttl),
            codec: Arc::new(codec),
            flusher: Arc::new(flusher),
            errors_tx,
        };
        Self {
            shared: Arc::new(shared),
            settings,
            error_handler: Arc::new(error_handler),
            errors_rx: Arc::new(AsyncMutex::new(errors_rx)),
            binding: Mutex::new(None),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    pub fn node_name(&self) -> &NodeName {
        &self.shared.node
    }

    pub fn set_leader(&self, is_leader: bool) {
        let was = self.shared.is_leader.swap(is_leader, Ordering::AcqRel);
        if was != is_leader {
            info!("[{}] Leadership changed: {}", self.shared.node, is_leader);
        }
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::Acquire)
    }

    /// Configure where and how often the table is broadcast. Must be called before `start`.
    pub fn bind_transport(
        &self,
        client: Arc<dyn Transport>,
        interval: Duration,
        topic: impl Into<String>,
    ) {
        let binding = TransportBinding {
            client,
            settings: TransportSettings {
                topic: topic.into(),
                broadcast_interval: interval,
            },
        };
        match self.binding.lock() {
            Ok(mut slot) => *slot = Some(binding),
            Err(poisoned) => *poisoned.into_inner() = Some(binding),
        }
    }

    fn runtime(&self) -> Result<MutexGuard<'_, Runtime>> {
        self.runtime
            .lock()
            .map_err(|e| concurrency_error!("Failed to acquire runtime lock: {}", e))
    }

    fn bound_transport(&self) -> Result<TransportBinding> {
        self.binding
            .lock()
            .map_err(|e| concurrency_error!("Failed to acquire binding lock: {}", e))?
            .clone()
            .ok_or(QuotaError::NotBound)
    }

    /// Connect, subscribe and launch the background tasks.
    ///
    /// Connection and subscription failures abort startup and are returned;
    /// the engine may then be started again.
    pub async fn start(&self) -> Result<()> {
        let binding = self.bound_transport()?;
        if binding.settings.broadcast_interval.is_zero() {
            return Err(QuotaError::Config(
                "broadcast interval must be greater than zero".to_string(),
            ));
        }
        if self.settings.flush_interval.is_zero() {
            return Err(QuotaError::Config(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        let generation = {
            let mut runtime = self.runtime()?;
            if runtime.started {
                return Err(QuotaError::AlreadyStarted);
            }
            runtime.started = true;
            runtime.generation += 1;
            runtime.generation
        };

        let node = self.shared.node.clone();
        info!(
            "[{}] Starting quota engine on topic '{}' (broadcast every {}ms, flush every {}ms)",
            node,
            binding.settings.topic,
            binding.settings.broadcast_interval.as_millis(),
            self.settings.flush_interval.as_millis()
        );

        if let Err(e) = binding.client.connect().await {
            self.runtime()?.shutdown();
            return Err(QuotaError::TransportConnect(e));
        }

        let error_task = tokio::spawn(run_error_fan_in(
            self.errors_rx.clone(),
            self.error_handler.clone(),
        ));
        let flush_task = tokio::spawn(run_flush_loop(
            self.shared.clone(),
            self.settings.flush_interval,
        ));
        self.runtime()?.tasks.extend([error_task, flush_task]);

        let shared = self.shared.clone();
        let handler: MessageHandler =
            Arc::new(move |payload: Vec<u8>| shared.handle_payload(&payload));
        let subscription = match binding
            .client
            .subscribe(&binding.settings.topic, handler)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                self.runtime()?.shutdown();
                return Err(QuotaError::Subscription(e));
            }
        };
        self.runtime()?.subscription = Some(subscription);

        // Give the subscription a moment to settle before our first broadcast
        time::sleep(self.settings.settle_delay).await;

        {
            let mut runtime = self.runtime()?;
            if !runtime.started || runtime.generation != generation {
                info!("[{}] Engine stopped during startup; not broadcasting", node);
                return Ok(());
            }
            let broadcast_task = tokio::spawn(run_broadcast_loop(self.shared.clone(), binding));
            runtime.tasks.push(broadcast_task);
        }

        info!("[{}] Quota engine started", node);
        Ok(())
    }

    /// Abort the background tasks and drop the subscription
    pub fn stop(&self) {
        let mut runtime = match self.runtime.lock() {
            Ok(runtime) => runtime,
            Err(poisoned) => poisoned.into_inner(),
        };
        if runtime.started {
            info!("[{}] Stopping quota engine", self.shared.node);
        }
        runtime.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.runtime().map(|rt| rt.started).unwrap_or(false)
    }

    /// Create a quota, or top up an existing one, without dividing `initial_value`
    pub fn initialize_quota(
        &self,
        max: u64,
        initial_value: u64,
        id: &str,
        metadata: Metadata,
    ) -> Result<()> {
        let mut quotas = self.shared.quotas()?;
        let quota = quotas.initialize(&self.shared.node, max, initial_value, id, metadata);
        debug!(
            "[{}] Initialized quota '{}': max={}, used={}",
            self.shared.node,
            id,
            quota.limit(),
            quota.used()
        );
        Ok(())
    }

    /// Split `total_initial` evenly across the peers seen recently, then initialize
    pub fn initialize_quota_distributed(
        &self,
        max: u64,
        total_initial: u64,
        id: &str,
        metadata: Metadata,
    ) -> Result<()> {
        let peers = self.known_node_count().max(1) as u64;
        self.initialize_quota(max, total_initial / peers, id, metadata)
    }

    pub fn increment_by(&self, id: &str, amount: u64) -> Result<QuotaStatus> {
        Ok(self.shared.quotas()?.increment_by(id, amount))
    }

    /// Mark a quota deleted; the tombstone spreads with the next broadcast
    pub fn tag_delete(&self, id: &str) -> Result<bool> {
        let tagged = self.shared.quotas()?.tag_delete(id);
        if tagged {
            debug!("[{}] Tombstoned quota '{}'", self.shared.node, id);
        }
        Ok(tagged)
    }

    pub fn delete_now(&self, id: &str) -> Result<bool> {
        Ok(self.shared.quotas()?.delete_now(id).is_some())
    }

    /// Apply a received table to the local one
    pub fn merge_remote(&self, remote: QuotaTable<C>) -> Result<MergeReport> {
        self.shared.merge(remote)
    }

    pub fn used(&self, id: &str) -> Result<Option<u64>> {
        Ok(self.shared.quotas()?.get(id).map(|q| q.used()))
    }

    pub fn limit(&self, id: &str) -> Result<Option<u64>> {
        Ok(self.shared.quotas()?.get(id).map(|q| q.limit()))
    }

    pub fn quota(&self, id: &str) -> Result<Option<Quota<C>>> {
        Ok(self.shared.quotas()?.get(id).cloned())
    }

    pub fn snapshot(&self) -> Result<QuotaTable<C>> {
        self.shared.snapshot()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.shared.quotas()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.shared.quotas()?.is_empty())
    }

    /// Peers (including ourselves, once our own broadcast comes back) seen within the TTL
    pub fn known_node_count(&self) -> usize {
        self.shared.known_nodes.count()
    }
}

impl<C: GrowOnlyCounter> Drop for QuotaEngine<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_error_fan_in(
    errors_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<QuotaError>>>,
    handler: Arc<dyn ErrorHandler>,
) {
    let mut errors = errors_rx.lock().await;
    while let Some(err) = errors.recv().await {
        handler.handle(err);
    }
}

async fn run_flush_loop<C: GrowOnlyCounter>(shared: Arc<Shared<C>>, interval: Duration) {
    let mut ticker = time::interval(interval);
    // A slow flush pushes the schedule back instead of queueing catch-up flushes
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        shared.flush_once().await;
    }
}

async fn run_broadcast_loop<C: GrowOnlyCounter>(shared: Arc<Shared<C>>, binding: TransportBinding) {
    let mut ticker = time::interval(binding.settings.broadcast_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut round = 0u64;
    loop {
        ticker.tick().await;
        round += 1;
        shared
            .broadcast_once(binding.client.as_ref(), &binding.settings.topic)
            .await;
        if round % 100 == 0 {
            debug!(
                "[{}] Broadcast round {}: {} live peers",
                shared.node,
                round,
                shared.known_nodes.count()
            );
        }
    }
}
