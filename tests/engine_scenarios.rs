use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dquota::error::BoxError;
use dquota::persistence::{Flusher, MemoryFlusher};
use dquota::settings::EngineSettings;
use dquota::transport::{MemoryBus, MessageHandler, Subscription, Transport, TransportError};
use dquota::{GCounter, LogErrorHandler, Metadata, QuotaEngine, QuotaError, QuotaStatus, QuotaTable};

const TOPIC: &str = "dquota.test";
const BROADCAST: Duration = Duration::from_millis(20);

fn settings(node: &str) -> EngineSettings {
    EngineSettings::new(node)
        .with_settle_delay(Duration::from_millis(10))
        .with_flush_interval(Duration::from_secs(60))
}

async fn started(bus: &MemoryBus, settings: EngineSettings) -> QuotaEngine {
    let engine: QuotaEngine =
        QuotaEngine::new(settings, MemoryFlusher::<GCounter>::new(), LogErrorHandler);
    engine.bind_transport(Arc::new(bus.client()), BROADCAST, TOPIC);
    engine.start().await.unwrap();
    engine
}

/// Poll `check` until it holds or two seconds pass
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn single_node_hits_limit() {
    let bus = MemoryBus::new();
    let engine = started(&bus, settings("a")).await;

    engine.initialize_quota(5, 0, "q1", Metadata::new()).unwrap();
    assert_eq!(engine.increment_by("q1", 5).unwrap(), QuotaStatus::Violated);
    assert_eq!(engine.increment_by("unknown", 1).unwrap(), QuotaStatus::NotFound);
}

#[tokio::test]
async fn two_nodes_converge_on_shared_total() {
    let bus = MemoryBus::new();
    let a = started(&bus, settings("a")).await;
    let b = started(&bus, settings("b")).await;

    a.initialize_quota(10, 0, "q2", Metadata::new()).unwrap();
    b.initialize_quota(10, 0, "q2", Metadata::new()).unwrap();

    assert_eq!(a.increment_by("q2", 2).unwrap(), QuotaStatus::Ok);
    for _ in 0..3 {
        assert_eq!(b.increment_by("q2", 1).unwrap(), QuotaStatus::Ok);
    }

    let used = |e: &QuotaEngine| e.used("q2").unwrap().unwrap_or_default();
    assert!(eventually(|| used(&a) == 5 && used(&b) == 5).await);

    for _ in 0..5 {
        b.increment_by("q2", 1).unwrap();
    }
    assert!(eventually(|| used(&a) >= 10).await);

    assert_eq!(a.increment_by("q2", 1).unwrap(), QuotaStatus::Violated);
    assert_eq!(b.increment_by("q2", 1).unwrap(), QuotaStatus::Violated);
}

#[tokio::test]
async fn remote_quota_is_created_on_merge() {
    let bus = MemoryBus::new();
    let a = started(&bus, settings("a")).await;
    let b = started(&bus, settings("b")).await;

    let mut metadata = Metadata::new();
    metadata.insert("tenant".to_string(), "acme".to_string());
    a.initialize_quota(50, 7, "shared", metadata).unwrap();

    assert!(eventually(|| b.used("shared").unwrap() == Some(7)).await);
    let copy = b.quota("shared").unwrap().unwrap();
    assert_eq!(copy.owner.as_str(), "b");
    assert_eq!(copy.limit(), 50);
    assert_eq!(copy.metadata.get("tenant").map(String::as_str), Some("acme"));
}

#[tokio::test]
async fn tombstone_removes_quota_from_peers() {
    let bus = MemoryBus::new();
    let a = started(&bus, settings("a")).await;
    let b = started(&bus, settings("b")).await;

    b.initialize_quota(10, 0, "q3", Metadata::new()).unwrap();
    assert!(eventually(|| a.used("q3").unwrap().is_some()).await);

    assert!(b.tag_delete("q3").unwrap());
    assert!(eventually(|| a.used("q3").unwrap().is_none()).await);
    assert_eq!(a.increment_by("q3", 1).unwrap(), QuotaStatus::NotFound);

    // Our own tombstone coming back around removes it here too
    assert!(eventually(|| b.quota("q3").unwrap().is_none()).await);
    assert!(!b.delete_now("q3").unwrap());
}

#[tokio::test]
async fn peer_can_recreate_quota_after_tombstone_spreads() {
    let bus = MemoryBus::new();
    let a = started(&bus, settings("a")).await;
    let b = started(&bus, settings("b")).await;

    b.initialize_quota(10, 0, "q9", Metadata::new()).unwrap();
    assert!(eventually(|| a.used("q9").unwrap().is_some()).await);

    b.tag_delete("q9").unwrap();
    assert!(
        eventually(|| a.quota("q9").unwrap().is_none() && b.quota("q9").unwrap().is_none())
            .await
    );

    a.initialize_quota(50, 0, "q9", Metadata::new()).unwrap();
    assert_eq!(a.increment_by("q9", 1).unwrap(), QuotaStatus::Ok);

    // Ten broadcast rounds later the new quota is still alive on both nodes
    tokio::time::sleep(BROADCAST * 10).await;
    assert_eq!(a.increment_by("q9", 1).unwrap(), QuotaStatus::Ok);
    assert!(eventually(|| b.used("q9").unwrap() == Some(2)).await);
    assert_eq!(b.limit("q9").unwrap(), Some(50));
}

#[tokio::test]
async fn reinitialized_quota_uses_new_limit() {
    let bus = MemoryBus::new();
    let a = started(&bus, settings("a")).await;
    let b = started(&bus, settings("b")).await;

    b.initialize_quota(100, 0, "q4", Metadata::new()).unwrap();
    assert!(eventually(|| a.limit("q4").unwrap() == Some(100)).await);

    b.tag_delete("q4").unwrap();
    assert!(
        eventually(|| a.used("q4").unwrap().is_none() && b.quota("q4").unwrap().is_none())
            .await
    );

    b.initialize_quota(3, 0, "q4", Metadata::new()).unwrap();
    assert!(eventually(|| a.limit("q4").unwrap() == Some(3)).await);

    assert_eq!(a.increment_by("q4", 2).unwrap(), QuotaStatus::Ok);
    assert_eq!(a.increment_by("q4", 1).unwrap(), QuotaStatus::Violated);
}

#[tokio::test]
async fn distributed_init_splits_across_live_peers() {
    let bus = MemoryBus::new();
    let engines = vec![
        started(&bus, settings("a")).await,
        started(&bus, settings("b")).await,
        started(&bus, settings("c")).await,
    ];

    // Peers are only learned from quota entries, so seed one per node
    for engine in &engines {
        let id = format!("seed-{}", engine.node_name());
        engine.initialize_quota(1, 0, &id, Metadata::new()).unwrap();
    }
    assert!(eventually(|| engines.iter().all(|e| e.known_node_count() == 3)).await);

    for engine in &engines {
        engine
            .initialize_quota_distributed(1000, 90, "split", Metadata::new())
            .unwrap();
    }

    assert!(
        eventually(|| engines
            .iter()
            .all(|e| e.used("split").unwrap() == Some(90)))
        .await
    );
}

#[tokio::test]
async fn leader_flushes_and_followers_do_not() {
    let bus = MemoryBus::new();
    let leader_store = Arc::new(MemoryFlusher::<GCounter>::new());
    let follower_store = Arc::new(MemoryFlusher::<GCounter>::new());
    let flush_every = Duration::from_millis(30);

    let leader: QuotaEngine = QuotaEngine::new(
        settings("a").with_flush_interval(flush_every).with_leader(true),
        leader_store.clone(),
        LogErrorHandler,
    );
    let follower: QuotaEngine = QuotaEngine::new(
        settings("b").with_flush_interval(flush_every),
        follower_store.clone(),
        LogErrorHandler,
    );
    for engine in [&leader, &follower] {
        engine.bind_transport(Arc::new(bus.client()), BROADCAST, TOPIC);
        engine.start().await.unwrap();
    }

    follower.initialize_quota(10, 4, "q5", Metadata::new()).unwrap();
    assert!(eventually(|| leader_store.get("q5").map(|q| q.used()) == Some(4)).await);
    assert_eq!(follower_store.flush_count(), 0);

    // Giving up leadership stops the flushes
    leader.set_leader(false);
    tokio::time::sleep(flush_every * 2).await;
    let count = leader_store.flush_count();
    tokio::time::sleep(flush_every * 3).await;
    assert_eq!(leader_store.flush_count(), count);
}

#[tokio::test]
async fn empty_table_is_not_flushed() {
    let bus = MemoryBus::new();
    let store = Arc::new(MemoryFlusher::<GCounter>::new());
    let engine: QuotaEngine = QuotaEngine::new(
        settings("a")
            .with_flush_interval(Duration::from_millis(10))
            .with_leader(true),
        store.clone(),
        LogErrorHandler,
    );
    engine.bind_transport(Arc::new(bus.client()), BROADCAST, TOPIC);
    engine.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(store.flush_count(), 0);
}

#[tokio::test]
async fn engines_on_other_topics_are_isolated() {
    let bus = MemoryBus::new();
    let a = started(&bus, settings("a")).await;

    let b: QuotaEngine =
        QuotaEngine::new(settings("b"), MemoryFlusher::<GCounter>::new(), LogErrorHandler);
    b.bind_transport(Arc::new(bus.client()), BROADCAST, "elsewhere");
    b.start().await.unwrap();

    a.initialize_quota(10, 1, "q6", Metadata::new()).unwrap();
    tokio::time::sleep(BROADCAST * 5).await;
    assert!(b.used("q6").unwrap().is_none());
}

/// Transport whose failures are switched on per operation
#[derive(Default)]
struct FlakyTransport {
    refuse_connect: AtomicBool,
    refuse_subscribe: AtomicBool,
    refuse_publish: AtomicBool,
    connects: AtomicUsize,
    inner: Option<Arc<dyn Transport>>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn connect(&self) -> Result<(), BoxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(Box::new(TransportError::Refused("broker down".to_string())));
        }
        match &self.inner {
            Some(inner) => inner.connect().await,
            None => Ok(()),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BoxError> {
        if self.refuse_publish.load(Ordering::SeqCst) {
            return Err(Box::new(TransportError::Closed(topic.to_string())));
        }
        match &self.inner {
            Some(inner) => inner.publish(topic, payload).await,
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, BoxError> {
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(Box::new(TransportError::Refused(format!("subscribe {}", topic))));
        }
        match &self.inner {
            Some(inner) => inner.subscribe(topic, handler).await,
            None => Ok(Subscription::new(topic, tokio::spawn(async {}))),
        }
    }
}

fn recording_handler() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(QuotaError) + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |err: QuotaError| {
        sink.lock().unwrap().push(err.error_type())
    })
}

#[tokio::test]
async fn connect_failure_aborts_start_and_allows_retry() {
    let transport = Arc::new(FlakyTransport::default());
    transport.refuse_connect.store(true, Ordering::SeqCst);

    let engine: QuotaEngine =
        QuotaEngine::new(settings("a"), MemoryFlusher::<GCounter>::new(), LogErrorHandler);
    engine.bind_transport(transport.clone(), BROADCAST, TOPIC);

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, QuotaError::TransportConnect(_)));
    assert!(err.is_fatal());
    assert!(!engine.is_running());

    transport.refuse_connect.store(false, Ordering::SeqCst);
    engine.start().await.unwrap();
    assert!(engine.is_running());
    assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn subscribe_failure_aborts_start() {
    let transport = Arc::new(FlakyTransport::default());
    transport.refuse_subscribe.store(true, Ordering::SeqCst);

    let engine: QuotaEngine =
        QuotaEngine::new(settings("a"), MemoryFlusher::<GCounter>::new(), LogErrorHandler);
    engine.bind_transport(transport.clone(), BROADCAST, TOPIC);

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, QuotaError::Subscription(_)));
    assert!(!engine.is_running());
}

#[tokio::test]
async fn publish_failures_reach_handler_and_broadcast_continues() {
    let bus = MemoryBus::new();
    let transport = Arc::new(FlakyTransport {
        inner: Some(Arc::new(bus.client())),
        ..Default::default()
    });
    transport.refuse_publish.store(true, Ordering::SeqCst);

    let (seen, handler) = recording_handler();
    let engine: QuotaEngine =
        QuotaEngine::new(settings("a"), MemoryFlusher::<GCounter>::new(), handler);
    engine.bind_transport(transport.clone(), BROADCAST, TOPIC);
    engine.start().await.unwrap();
    engine.initialize_quota(10, 1, "q7", Metadata::new()).unwrap();

    assert!(eventually(|| seen.lock().unwrap().len() >= 2).await);
    assert!(seen.lock().unwrap().iter().all(|kind| *kind == "publish_error"));

    // Once the broker recovers, our own broadcast comes back to us
    transport.refuse_publish.store(false, Ordering::SeqCst);
    assert!(eventually(|| engine.known_node_count() == 1).await);
}

struct BrokenStore;

#[async_trait]
impl Flusher<GCounter> for BrokenStore {
    async fn flush(&self, _quotas: &QuotaTable) -> Result<(), BoxError> {
        Err("disk full".into())
    }
}

#[tokio::test]
async fn flush_failures_reach_handler() {
    let bus = MemoryBus::new();
    let (seen, handler) = recording_handler();
    let engine: QuotaEngine = QuotaEngine::new(
        settings("a")
            .with_flush_interval(Duration::from_millis(15))
            .with_leader(true),
        BrokenStore,
        handler,
    );
    engine.bind_transport(Arc::new(bus.client()), BROADCAST, TOPIC);
    engine.start().await.unwrap();
    engine.initialize_quota(10, 1, "q8", Metadata::new()).unwrap();

    assert!(eventually(|| seen.lock().unwrap().len() >= 2).await);
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|kind| *kind == "persistence_error"));
}
