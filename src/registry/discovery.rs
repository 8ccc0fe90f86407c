use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FrameworkError;
use crate::etcd::client::{EventKind, WatchBatch, WatchEvent};
use crate::etcd::EtcdClient;
use crate::registry::instance::{app_prefix, ServiceInstance};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(8);
/// A watch session that lived at least this long resets the backoff.
const HEALTHY_THRESHOLD: Duration = Duration::from_secs(15);
const STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct CachedInstance {
    instance: ServiceInstance,
    /// Pre-formatted `"addr:port"` handed to the balancer.
    resolved_addr: String,
}

/// Keyed view of the live instances of one app. Pure data structure; the
/// discoverer wraps it in a lock and owns all mutation.
#[derive(Default)]
struct InstanceCache {
    entries: HashMap<String, CachedInstance>,
}

impl InstanceCache {
    /// Replace the whole cache from a range-read snapshot. Malformed values
    /// are skipped; keys absent from the snapshot disappear.
    fn replace_from_snapshot(&mut self, kvs: &[crate::etcd::client::KeyValue]) {
        let mut entries = HashMap::with_capacity(kvs.len());
        for kv in kvs {
            match decode_instance(&kv.value) {
                Ok(instance) => {
                    let resolved_addr = instance.resolved_addr();
                    entries.insert(
                        kv.key.clone(),
                        CachedInstance {
                            instance,
                            resolved_addr,
                        },
                    );
                }
                Err(e) => {
                    warn!(
                        "discovery: malformed instance in snapshot, key={}, skipping: {}",
                        kv.key, e
                    );
                }
            }
        }
        self.entries = entries;
    }

    /// Apply one watch event. Returns whether the cache changed. A malformed
    /// PUT value must not poison the cache: it is logged and skipped.
    fn apply(&mut self, event: &WatchEvent) -> bool {
        match event.kind {
            EventKind::Put => {
                let value = event.value.as_deref().unwrap_or_default();
                match decode_instance(value) {
                    Ok(instance) => {
                        let resolved_addr = instance.resolved_addr();
                        self.entries.insert(
                            event.key.clone(),
                            CachedInstance {
                                instance,
                                resolved_addr,
                            },
                        );
                        true
                    }
                    Err(e) => {
                        warn!(
                            "discovery: malformed instance event, key={}, skipping: {}",
                            event.key, e
                        );
                        false
                    }
                }
            }
            EventKind::Delete => self.entries.remove(&event.key).is_some(),
        }
    }

    fn instances(&self) -> Vec<ServiceInstance> {
        self.entries.values().map(|c| c.instance.clone()).collect()
    }

    fn resolved_addrs(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|c| c.resolved_addr.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn decode_instance(value: &str) -> Result<ServiceInstance, serde_json::Error> {
    serde_json::from_str::<ServiceInstance>(value)
}

struct WatchCtx {
    etcd: EtcdClient,
    app_name: String,
    prefix: String,
    cache: Arc<RwLock<InstanceCache>>,
    version_tx: watch::Sender<u64>,
    cancel: CancellationToken,
}

/// Locally cached view of the live instances of one named service,
/// bootstrapped by a prefix range read and kept current by the watch stream.
///
/// Readers always see a consistent snapshot and receive deep copies, so no
/// lock is held across user code. One discoverer tracks one app.
pub struct Discoverer {
    etcd: EtcdClient,
    app_name: String,
    prefix: String,
    cache: Arc<RwLock<InstanceCache>>,
    version_tx: watch::Sender<u64>,
    cancel: CancellationToken,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Discoverer {
    pub fn new(etcd: EtcdClient, app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        let prefix = app_prefix(&app_name);
        let (version_tx, _) = watch::channel(0u64);
        Self {
            etcd,
            app_name,
            prefix,
            cache: Arc::new(RwLock::new(InstanceCache::default())),
            version_tx,
            cancel: CancellationToken::new(),
            task: StdMutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Begin tracking: populate the cache from a range read, then keep it
    /// current from the watch stream. Call once per discoverer.
    pub async fn watch(&self) -> Result<(), FrameworkError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FrameworkError::Internal(format!(
                "discoverer for {} already watching",
                self.app_name
            )));
        }

        self.refresh()
            .await
            .map_err(|e| FrameworkError::Etcd(e.to_string()))?;

        let ctx = WatchCtx {
            etcd: self.etcd.clone(),
            app_name: self.app_name.clone(),
            prefix: self.prefix.clone(),
            cache: self.cache.clone(),
            version_tx: self.version_tx.clone(),
            cancel: self.cancel.child_token(),
        };
        let handle = tokio::spawn(watch_loop(ctx));
        *lock_task(&self.task) = Some(handle);
        Ok(())
    }

    /// Re-run the bootstrap range read, replacing the whole cache. Also the
    /// resolver's "resolve now" trigger. Returns the snapshot revision.
    pub async fn refresh(&self) -> anyhow::Result<i64> {
        let snapshot = self.etcd.range_prefix(&self.prefix).await?;
        let count = {
            let mut cache = write_cache(&self.cache);
            cache.replace_from_snapshot(&snapshot.kvs);
            cache.len()
        };
        self.version_tx.send_modify(|v| *v += 1);
        metrics::gauge!("octopus_discovery_instances", "app" => self.app_name.clone())
            .set(count as f64);
        debug!(
            "discovery: cache refreshed, app={}, instances={}, revision={}",
            self.app_name, count, snapshot.revision
        );
        Ok(snapshot.revision)
    }

    /// Deep copy of the cached instances, in unspecified order. Callers may
    /// freely mutate the result.
    pub fn get_instances(&self) -> Vec<ServiceInstance> {
        read_cache(&self.cache).instances()
    }

    /// Pre-formatted `"addr:port"` strings for the balancer.
    pub fn resolved_addrs(&self) -> Vec<String> {
        read_cache(&self.cache).resolved_addrs()
    }

    pub fn instance_count(&self) -> usize {
        read_cache(&self.cache).len()
    }

    /// Receiver bumped after every applied snapshot or event batch.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Cancel the watch task and wait up to 5 s for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = lock_task(&self.task).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_WAIT, handle).await.is_err() {
                warn!(
                    "discovery: watch task did not exit within {}s, app={}",
                    STOP_WAIT.as_secs(),
                    self.app_name
                );
            }
        }
    }

    /// Stop and release the store-client handle. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop().await;
    }
}

impl Drop for Discoverer {
    fn drop(&mut self) {
        // The watch task must not outlive its discoverer.
        self.cancel.cancel();
    }
}

fn lock_task(
    m: &StdMutex<Option<tokio::task::JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_cache(c: &RwLock<InstanceCache>) -> std::sync::RwLockReadGuard<'_, InstanceCache> {
    c.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_cache(c: &RwLock<InstanceCache>) -> std::sync::RwLockWriteGuard<'_, InstanceCache> {
    c.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn watch_loop(ctx: WatchCtx) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        let session_start = Instant::now();
        if let Err(e) = watch_session(&ctx).await {
            warn!(
                "discovery: watch session failed, app={}: {}",
                ctx.app_name, e
            );
        }
        if ctx.cancel.is_cancelled() {
            return;
        }

        if session_start.elapsed() >= HEALTHY_THRESHOLD {
            backoff = INITIAL_BACKOFF;
        }
        info!(
            "discovery: watch ended, app={}, reconnecting in {}s",
            ctx.app_name,
            backoff.as_secs()
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = ctx.cancel.cancelled() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One watch session: mandatory full re-read, then incremental events from
/// the snapshot revision. When the re-read fails no watch is opened; a
/// watch over a stale cache would miss changes from the disconnect window.
async fn watch_session(ctx: &WatchCtx) -> anyhow::Result<()> {
    let snapshot = ctx.etcd.range_prefix(&ctx.prefix).await?;
    let count = {
        let mut cache = write_cache(&ctx.cache);
        cache.replace_from_snapshot(&snapshot.kvs);
        cache.len()
    };
    ctx.version_tx.send_modify(|v| *v += 1);
    metrics::gauge!("octopus_discovery_instances", "app" => ctx.app_name.clone())
        .set(count as f64);
    info!(
        "discovery: watch starting, app={}, instances={}, revision={}",
        ctx.app_name, count, snapshot.revision
    );

    let mut stream = ctx
        .etcd
        .watch_prefix(&ctx.prefix, snapshot.revision + 1)
        .await?;

    loop {
        tokio::select! {
            batch = stream.next_batch() => match batch {
                Some(batch) => apply_batch(ctx, batch),
                None => return Ok(()),
            },
            _ = ctx.cancel.cancelled() => return Ok(()),
        }
    }
}

fn apply_batch(ctx: &WatchCtx, batch: WatchBatch) {
    let mut changed = false;
    let count = {
        let mut cache = write_cache(&ctx.cache);
        for event in &batch.events {
            let applied = cache.apply(event);
            changed |= applied;
            let kind = match event.kind {
                EventKind::Put => "put",
                EventKind::Delete => "delete",
            };
            metrics::counter!("octopus_discovery_events_total", "kind" => kind).increment(1);
            if applied {
                debug!(
                    "discovery: event applied, app={}, kind={}, key={}",
                    ctx.app_name, kind, event.key
                );
            }
        }
        cache.len()
    };

    if changed {
        ctx.version_tx.send_modify(|v| *v += 1);
        metrics::gauge!("octopus_discovery_instances", "app" => ctx.app_name.clone())
            .set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etcd::client::KeyValue;

    fn put_event(inst: &ServiceInstance) -> WatchEvent {
        WatchEvent {
            kind: EventKind::Put,
            key: inst.key(),
            value: Some(serde_json::to_string(inst).unwrap()),
        }
    }

    fn inst(addr: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            app_name: "user-service".to_string(),
            addr: addr.to_string(),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn put_then_delete() {
        let mut cache = InstanceCache::default();
        let a = inst("10.0.0.5", 50051);

        assert!(cache.apply(&put_event(&a)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolved_addrs(), vec!["10.0.0.5:50051".to_string()]);

        assert!(cache.apply(&WatchEvent {
            kind: EventKind::Delete,
            key: a.key(),
            value: None,
        }));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn delete_of_unknown_key_is_a_noop() {
        let mut cache = InstanceCache::default();
        assert!(!cache.apply(&WatchEvent {
            kind: EventKind::Delete,
            key: "/octopus/rpc/apps/user-service/10.0.0.9:1".to_string(),
            value: None,
        }));
    }

    #[test]
    fn malformed_put_does_not_poison_cache() {
        let mut cache = InstanceCache::default();
        cache.apply(&put_event(&inst("10.0.0.5", 50051)));

        assert!(!cache.apply(&WatchEvent {
            kind: EventKind::Put,
            key: "/octopus/rpc/apps/user-service/bad".to_string(),
            value: Some("{not json".to_string()),
        }));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn snapshot_replace_drops_stale_keys() {
        let mut cache = InstanceCache::default();
        cache.apply(&put_event(&inst("10.0.0.5", 50051)));
        cache.apply(&put_event(&inst("10.0.0.6", 50051)));

        let survivor = inst("10.0.0.7", 50051);
        let kvs = vec![KeyValue {
            key: survivor.key(),
            value: serde_json::to_string(&survivor).unwrap(),
            lease: 42,
        }];
        cache.replace_from_snapshot(&kvs);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolved_addrs(), vec!["10.0.0.7:50051".to_string()]);
    }

    #[test]
    fn instances_are_deep_copies() {
        let mut cache = InstanceCache::default();
        let mut a = inst("10.0.0.5", 50051);
        a.metadata
            .insert("region".to_string(), "eu-west-1".to_string());
        cache.apply(&put_event(&a));

        let mut copy = cache.instances();
        copy[0].addr = "mutated".to_string();
        copy[0].metadata.insert("x".to_string(), "y".to_string());

        let fresh = cache.instances();
        assert_eq!(fresh[0].addr, "10.0.0.5");
        assert_eq!(fresh[0].metadata.len(), 1);
    }
}
