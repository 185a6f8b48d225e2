//! Watch, classify, queue and dispatch loop for one resource kind.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::lock::LockRegistry;
use crate::metrics::EngineMetrics;
use crate::op::Op;
use crate::pending::PendingOps;
use crate::queue::WorkQueue;
use crate::rate_limiter::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, ExponentialBackoff};
use crate::{Listener, ReconcileError, Result};

pub const DEFAULT_WORKERS: usize = 40;
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Workers draining the queue for this kind
    pub workers: usize,
    /// First retry delay of a failed op
    pub base_delay: Duration,
    /// Ceiling of the retry delay
    pub max_delay: Duration,
    /// Period of re-delivering idle objects to `Listener::add`, `None` disables it
    pub resync: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            resync: Some(DEFAULT_RESYNC_PERIOD),
        }
    }
}

/// Local copy of the remote state, owned by the watch loop.
struct Mirror<K> {
    objects: HashMap<String, Arc<K>>,
    /// Identities seen since the last `Init`, while a relist is running
    relist: Option<HashSet<String>>,
}

impl<K> Default for Mirror<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            relist: None,
        }
    }
}

pub struct Engine<L: Listener> {
    kind: String,
    listener: Arc<L>,
    workers: usize,
    resync_period: Option<Duration>,
    queue: WorkQueue<String>,
    pending: PendingOps<L::Resource>,
    locks: LockRegistry<String>,
    metrics: EngineMetrics,
}

/// Watches every object of `api` and drives `listener` until `cancel` fires.
pub async fn run_for<L>(
    api: Api<L::Resource>,
    listener: L,
    config: EngineConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    L: Listener,
    L::Resource: Resource<DynamicType = ()> + Clone + PartialEq + DeserializeOwned + Debug,
{
    let events = watcher(api, watcher::Config::default()).default_backoff();
    Engine::new(listener, config).run(events, cancel).await
}

impl<L> Engine<L>
where
    L: Listener,
    L::Resource: Resource<DynamicType = ()> + Clone + PartialEq + Debug,
{
    pub fn new(listener: L, config: EngineConfig) -> Self {
        let kind = <L::Resource as Resource>::kind(&()).into_owned();
        Self {
            metrics: EngineMetrics::for_kind(&kind),
            kind,
            listener: Arc::new(listener),
            workers: config.workers.max(1),
            resync_period: config.resync.filter(|p| !p.is_zero()),
            queue: WorkQueue::new(ExponentialBackoff::new(config.base_delay, config.max_delay)),
            pending: PendingOps::default(),
            locks: LockRegistry::default(),
        }
    }

    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }

    /// Consumes `events` and runs the worker pool. Returns once `cancel`
    /// fires and every worker has finished its current op.
    pub async fn run<S>(self, events: S, cancel: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<watcher::Event<L::Resource>, watcher::Error>> + Send,
    {
        let engine = Arc::new(self);
        info!(kind = %engine.kind, workers = engine.workers, "starting reconcile engine");

        let mut workers = JoinSet::new();
        for id in 0..engine.workers {
            let engine = engine.clone();
            workers.spawn(async move { engine.worker(id).await });
        }

        let mut mirror = Mirror::default();
        let mut events = std::pin::pin!(events);
        let mut resync = engine.resync_period.map(|period| {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks
        });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = next_resync(&mut resync) => engine.resync(&mirror),
                event = events.next() => match event {
                    Some(Ok(event)) => engine.process_event(&mut mirror, event),
                    Some(Err(e)) => warn!(kind = %engine.kind, error = %e, "watch stream error"),
                    None => {
                        debug!(kind = %engine.kind, "watch stream ended");
                        cancel.cancelled().await;
                        break;
                    }
                },
            }
        }

        info!(kind = %engine.kind, "stopping reconcile engine");
        engine.queue.shutdown();
        while let Some(res) = workers.join_next().await {
            res?;
        }
        Ok(())
    }

    fn process_event(&self, mirror: &mut Mirror<L::Resource>, event: watcher::Event<L::Resource>) {
        match event {
            watcher::Event::Init => {
                trace!(kind = %self.kind, "relist started");
                mirror.relist = Some(HashSet::new());
            }
            watcher::Event::InitApply(obj) => {
                if let (Some(seen), Some(uid)) = (mirror.relist.as_mut(), obj.uid()) {
                    seen.insert(uid);
                }
                self.apply(mirror, obj);
            }
            watcher::Event::InitDone => {
                let Some(seen) = mirror.relist.take() else {
                    return;
                };
                let gone: Vec<String> = mirror
                    .objects
                    .keys()
                    .filter(|uid| !seen.contains(*uid))
                    .cloned()
                    .collect();
                for uid in gone {
                    if let Some(obj) = mirror.objects.remove(&uid) {
                        debug!(kind = %self.kind, name = %obj.name_any(), "object missing after relist");
                        self.enqueue(uid, Op::Delete(obj));
                    }
                }
            }
            watcher::Event::Apply(obj) => self.apply(mirror, obj),
            watcher::Event::Delete(obj) => {
                let Some(uid) = obj.uid() else {
                    warn!(kind = %self.kind, name = %obj.name_any(), "deleted object has no uid");
                    return;
                };
                mirror.objects.remove(&uid);
                self.enqueue(uid, Op::Delete(Arc::new(obj)));
            }
        }
    }

    /// Re-delivers every mirrored object with no op waiting as an add, so
    /// listeners re-check state they may have missed.
    fn resync(&self, mirror: &Mirror<L::Resource>) {
        if mirror.relist.is_some() {
            return;
        }
        let mut resynced = 0;
        for (uid, obj) in &mirror.objects {
            if self.pending.contains(uid) {
                continue;
            }
            self.enqueue(uid.clone(), Op::Add(obj.clone()));
            resynced += 1;
        }
        debug!(kind = %self.kind, resynced, "resync");
    }

    fn apply(&self, mirror: &mut Mirror<L::Resource>, obj: L::Resource) {
        let Some(uid) = obj.uid() else {
            warn!(kind = %self.kind, name = %obj.name_any(), "object has no uid");
            return;
        };
        let obj = Arc::new(obj);
        let op = match mirror.objects.insert(uid.clone(), obj.clone()) {
            Some(old) if old == obj => {
                trace!(kind = %self.kind, name = %obj.name_any(), "unchanged");
                return;
            }
            Some(old) => Op::Update { old, new: obj },
            None => Op::Add(obj),
        };
        self.enqueue(uid, op);
    }

    fn enqueue(&self, key: String, op: Op<L::Resource>) {
        let name = op.object().name_any();
        let op_name = op.name();
        match self.pending.stage(&key, op) {
            Ok(()) => self.queue.add(key),
            Err(e) => {
                error!(kind = %self.kind, %name, error = %e, "rejected {op_name}");
                self.metrics.count_failure(op_name, "addconflict".into());
                self.queue.add_rate_limited(key);
            }
        }
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }

    async fn worker(&self, id: usize) {
        while let Some(key) = self.queue.get().await {
            self.process_key(&key).await;
            self.queue.done(&key);
            self.metrics.queue_depth.set(self.queue.len() as i64);
        }
        trace!(kind = %self.kind, worker = id, "worker exited");
    }

    async fn process_key(&self, key: &String) {
        let _guard = self.locks.lock(key.clone()).await;
        let Some((generation, op)) = self.pending.peek(key) else {
            self.queue.forget(key);
            return;
        };

        let _measure = self.metrics.count_and_measure(op.name());
        let result = op.visit(self.listener.as_ref()).await;
        self.handle_err(key, generation, &op, result);
    }

    fn handle_err(
        &self,
        key: &String,
        generation: u64,
        op: &Op<L::Resource>,
        result: Result<(), L::Error>,
    ) {
        let name = op.object().name_any();
        match result {
            Ok(()) => {
                self.pending.complete(key, generation);
                self.queue.forget(key);
                debug!(kind = %self.kind, %name, op = op.name(), "op succeeded");
            }
            Err(e) => {
                let retry_in = self.queue.add_rate_limited(key.clone());
                if e.is_waiting() {
                    info!(kind = %self.kind, %name, op = op.name(), ?retry_in, "waiting: {e}");
                } else {
                    self.metrics.count_failure(op.name(), e.metric_label());
                    error!(kind = %self.kind, %name, op = op.name(), ?retry_in, error = %e, "op failed");
                }
            }
        }
    }
}

async fn next_resync(resync: &mut Option<Interval>) {
    match resync {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::channel::mpsc;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use thiserror::Error;
    use tokio::time::Instant;

    use super::*;

    #[derive(Error, Debug)]
    enum TestError {
        #[error("injected failure")]
        Injected,
        #[error("not ready yet")]
        NotReady,
    }

    impl ReconcileError for TestError {
        fn is_waiting(&self) -> bool {
            matches!(self, TestError::NotReady)
        }

        fn metric_label(&self) -> String {
            match self {
                TestError::Injected => "injected",
                TestError::NotReady => "not_ready",
            }
            .to_string()
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        attempts: Mutex<Vec<Instant>>,
        failures_left: AtomicUsize,
        waits_left: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn record(&self, call: String) -> Result<(), TestError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.attempts.lock().unwrap().push(Instant::now());
            if self
                .waits_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TestError::NotReady);
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TestError::Injected);
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    struct RecordingListener(Arc<Recorder>);

    #[async_trait]
    impl Listener for RecordingListener {
        type Resource = ConfigMap;
        type Error = TestError;

        async fn add(&self, obj: Arc<ConfigMap>) -> Result<(), TestError> {
            self.0.record(format!("add {}", obj.name_any())).await
        }

        async fn update(&self, old: Arc<ConfigMap>, new: Arc<ConfigMap>) -> Result<(), TestError> {
            self.0
                .record(format!(
                    "update {} {}->{}",
                    new.name_any(),
                    value(&old),
                    value(&new)
                ))
                .await
        }

        async fn delete(&self, obj: Arc<ConfigMap>) -> Result<(), TestError> {
            self.0.record(format!("delete {}", obj.name_any())).await
        }
    }

    fn value(cm: &ConfigMap) -> String {
        cm.data
            .as_ref()
            .and_then(|d| d.get("v"))
            .cloned()
            .unwrap_or_default()
    }

    fn config_map(name: &str, v: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("v".to_string(), v.to_string())])),
            ..Default::default()
        }
    }

    type Sender = mpsc::UnboundedSender<Result<watcher::Event<ConfigMap>, watcher::Error>>;

    fn start(
        recorder: Arc<Recorder>,
        workers: usize,
    ) -> (Sender, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        start_with(
            recorder,
            EngineConfig {
                workers,
                resync: None,
                ..Default::default()
            },
        )
    }

    fn start_with(
        recorder: Arc<Recorder>,
        config: EngineConfig,
    ) -> (Sender, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();
        let engine = Engine::new(RecordingListener(recorder), config);
        let handle = tokio::spawn(engine.run(rx, cancel.clone()));
        (tx, cancel, handle)
    }

    async fn eventually(recorder: &Recorder, expected: usize) -> Vec<String> {
        for _ in 0..500 {
            let calls = recorder.calls();
            if calls.len() >= expected {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        recorder.calls()
    }

    #[tokio::test]
    async fn test_deltas_become_typed_ops() {
        let recorder = Arc::new(Recorder::default());
        let (tx, cancel, handle) = start(recorder.clone(), 2);

        tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", "1"))))
            .unwrap();
        assert_eq!(eventually(&recorder, 1).await, vec!["add a"]);

        tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", "2"))))
            .unwrap();
        assert_eq!(eventually(&recorder, 2).await[1], "update a 1->2");

        tx.unbounded_send(Ok(watcher::Event::Delete(config_map("a", "2"))))
            .unwrap();
        assert_eq!(eventually(&recorder, 3).await[2], "delete a");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_deltas_are_dropped() {
        let recorder = Arc::new(Recorder::default());
        let (tx, cancel, handle) = start(recorder.clone(), 1);

        for _ in 0..3 {
            tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", "1"))))
                .unwrap();
        }
        tx.unbounded_send(Ok(watcher::Event::Apply(config_map("b", "1"))))
            .unwrap();
        let calls = eventually(&recorder, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls, vec!["add a", "add b"]);
        assert_eq!(recorder.calls().len(), 2);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relist_deletes_objects_that_disappeared() {
        let recorder = Arc::new(Recorder::default());
        let (tx, cancel, handle) = start(recorder.clone(), 1);

        for event in [
            watcher::Event::Init,
            watcher::Event::InitApply(config_map("a", "1")),
            watcher::Event::InitApply(config_map("b", "1")),
            watcher::Event::InitDone,
        ] {
            tx.unbounded_send(Ok(event)).unwrap();
        }
        let mut calls = eventually(&recorder, 2).await;
        calls.sort();
        assert_eq!(calls, vec!["add a", "add b"]);

        for event in [
            watcher::Event::Init,
            watcher::Event::InitApply(config_map("a", "1")),
            watcher::Event::InitDone,
        ] {
            tx.unbounded_send(Ok(event)).unwrap();
        }
        assert_eq!(eventually(&recorder, 3).await[2], "delete b");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ops_are_retried_with_growing_delay() {
        let recorder = Arc::new(Recorder::default());
        recorder.failures_left.store(3, Ordering::SeqCst);
        recorder.waits_left.store(1, Ordering::SeqCst);
        let (tx, cancel, handle) = start(recorder.clone(), 4);

        tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", "1"))))
            .unwrap();
        assert_eq!(eventually(&recorder, 1).await, vec!["add a"]);

        let attempts = recorder.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]), "{gaps:?}");
        assert!(gaps[0] >= DEFAULT_BASE_DELAY);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ops_for_one_identity_never_overlap() {
        let recorder = Arc::new(Recorder::default());
        let (tx, cancel, handle) = start(recorder.clone(), 8);

        tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", "0"))))
            .unwrap();
        for i in 1..50 {
            tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", &i.to_string()))))
                .unwrap();
        }
        tx.unbounded_send(Ok(watcher::Event::Delete(config_map("a", "49"))))
            .unwrap();

        for _ in 0..500 {
            if recorder.calls().last().is_some_and(|c| c == "delete a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.calls().last().map(String::as_str), Some("delete a"));
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_redelivers_idle_objects_as_adds() {
        let recorder = Arc::new(Recorder::default());
        let (tx, cancel, handle) = start_with(
            recorder.clone(),
            EngineConfig {
                workers: 1,
                resync: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        );

        tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", "1"))))
            .unwrap();
        assert_eq!(eventually(&recorder, 1).await, vec!["add a"]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(recorder.calls().len(), 1, "no resync before the period");
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(eventually(&recorder, 2).await, vec!["add a", "add a"]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_disabled() {
        let recorder = Arc::new(Recorder::default());
        let (tx, cancel, handle) = start(recorder.clone(), 1);

        tx.unbounded_send(Ok(watcher::Event::Apply(config_map("a", "1"))))
            .unwrap();
        assert_eq!(eventually(&recorder, 1).await, vec!["add a"]);
        tokio::time::sleep(DEFAULT_RESYNC_PERIOD * 3).await;
        assert_eq!(recorder.calls(), vec!["add a"]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
