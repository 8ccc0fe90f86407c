use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FrameworkError;
use crate::etcd::EtcdClient;
use crate::registry::instance::ServiceInstance;

pub const DEFAULT_TTL_SECS: i64 = 60;
pub const MIN_TTL_SECS: i64 = 10;

/// Pause between re-registration attempts after a lease loss.
const REREGISTER_RETRY_PAUSE: Duration = Duration::from_secs(5);
/// How long unregister waits for the keepalive task to exit.
const TASK_EXIT_WAIT: Duration = Duration::from_secs(5);
const LIVENESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshot of a registrar's state, readable concurrently with operations.
#[derive(Debug, Clone)]
pub struct RegistryState {
    pub lease_id: i64,
    pub ttl: i64,
    pub key: String,
    pub registered: bool,
}

struct KeepaliveTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

struct Inner {
    registered: bool,
    keepalive: Option<KeepaliveTask>,
}

/// Publishes a single service instance under a lease and keeps it alive.
///
/// The key is restored automatically after lease loss (a new lease is
/// granted and the same key re-put), so a full store disconnect heals once
/// connectivity returns. `register` / `unregister` are linearizable from the
/// caller's perspective; status reads never block on them.
pub struct Registrar {
    etcd: EtcdClient,
    instance: ServiceInstance,
    /// JSON encoding of the instance, computed once.
    value: String,
    key: String,
    ttl: i64,
    lease_id: Arc<AtomicI64>,
    last_renewal: Arc<StdMutex<Option<Instant>>>,
    inner: Mutex<Inner>,
    status: Arc<ArcSwap<RegistryState>>,
    closed: AtomicBool,
}

/// Everything the background keepalive task needs, detached from the
/// registrar so the task holds no reference back into it.
struct KeepaliveCtx {
    etcd: EtcdClient,
    key: String,
    value: String,
    ttl: i64,
    lease_id: Arc<AtomicI64>,
    last_renewal: Arc<StdMutex<Option<Instant>>>,
    status: Arc<ArcSwap<RegistryState>>,
    cancel: CancellationToken,
}

impl Registrar {
    pub fn new(
        etcd: EtcdClient,
        ttl: i64,
        instance: ServiceInstance,
    ) -> Result<Self, FrameworkError> {
        instance.validate()?;
        if ttl < MIN_TTL_SECS {
            return Err(FrameworkError::InvalidTtl(ttl));
        }

        let key = instance.key();
        let value = serde_json::to_string(&instance)
            .map_err(|e| FrameworkError::Internal(format!("instance encode failed: {}", e)))?;
        let status = Arc::new(ArcSwap::from_pointee(RegistryState {
            lease_id: 0,
            ttl,
            key: key.clone(),
            registered: false,
        }));

        Ok(Self {
            etcd,
            instance,
            value,
            key,
            ttl,
            lease_id: Arc::new(AtomicI64::new(0)),
            last_renewal: Arc::new(StdMutex::new(None)),
            inner: Mutex::new(Inner {
                registered: false,
                keepalive: None,
            }),
            status,
            closed: AtomicBool::new(false),
        })
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Grant a lease, publish the instance key under it, and start the
    /// keepalive task. Fails with `AlreadyRegistered` when registered.
    pub async fn register(&self) -> Result<(), FrameworkError> {
        let mut inner = self.inner.lock().await;
        if inner.registered {
            return Err(FrameworkError::AlreadyRegistered(self.key.clone()));
        }

        let lease_id = self
            .etcd
            .lease_grant(self.ttl)
            .await
            .map_err(|e| FrameworkError::Etcd(e.to_string()))?;
        self.etcd
            .put(&self.key, &self.value, lease_id)
            .await
            .map_err(|e| FrameworkError::Etcd(e.to_string()))?;

        self.lease_id.store(lease_id, Ordering::Release);
        *lock_renewal(&self.last_renewal) = Some(Instant::now());

        let cancel = CancellationToken::new();
        let ctx = KeepaliveCtx {
            etcd: self.etcd.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            ttl: self.ttl,
            lease_id: self.lease_id.clone(),
            last_renewal: self.last_renewal.clone(),
            status: self.status.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(keepalive_loop(ctx));
        inner.keepalive = Some(KeepaliveTask { cancel, handle });
        inner.registered = true;
        self.publish(lease_id, true);

        metrics::counter!("octopus_registry_register_total", "result" => "ok").increment(1);
        info!(
            "registry: registered, key={}, lease={}, ttl={}s",
            self.key, lease_id, self.ttl
        );
        Ok(())
    }

    /// Stop the keepalive task and revoke the lease, which deletes the key.
    /// Safe to call with the store unreachable: revoke failures are logged
    /// and lease expiry cleans up eventually.
    pub async fn unregister(&self) -> Result<(), FrameworkError> {
        let mut inner = self.inner.lock().await;
        if !inner.registered {
            return Err(FrameworkError::NotRegistered(self.key.clone()));
        }

        if let Some(task) = inner.keepalive.take() {
            task.cancel.cancel();
            if tokio::time::timeout(TASK_EXIT_WAIT, task.handle)
                .await
                .is_err()
            {
                warn!(
                    "registry: keepalive task did not exit within {}s, key={}",
                    TASK_EXIT_WAIT.as_secs(),
                    self.key
                );
            }
        }

        let lease_id = self.lease_id.swap(0, Ordering::AcqRel);
        if lease_id != 0 {
            match self.etcd.lease_revoke(lease_id).await {
                Ok(()) => info!("registry: lease revoked, key={}, lease={}", self.key, lease_id),
                Err(e) => warn!(
                    "registry: lease revoke failed (expiry will clean up), key={}, lease={}: {}",
                    self.key, lease_id, e
                ),
            }
        } else {
            // Registration never reached the store; nothing to revoke.
            debug!("registry: no lease to revoke, key={}", self.key);
        }

        inner.registered = false;
        *lock_renewal(&self.last_renewal) = None;
        self.publish(0, false);
        info!("registry: unregistered, key={}", self.key);
        Ok(())
    }

    /// Release the store-client handle. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.status.load().registered {
            warn!(
                "registry: closed while registered, key={} (lease will expire)",
                self.key
            );
        }
    }

    pub fn status(&self) -> RegistryState {
        (**self.status.load()).clone()
    }

    /// Registered with a heartbeat acknowledged within the lease TTL.
    pub fn is_healthy(&self) -> bool {
        if !self.status.load().registered {
            return false;
        }
        match *lock_renewal(&self.last_renewal) {
            Some(at) => at.elapsed() < Duration::from_secs(self.ttl as u64),
            None => false,
        }
    }

    fn publish(&self, lease_id: i64, registered: bool) {
        self.status.store(Arc::new(RegistryState {
            lease_id,
            ttl: self.ttl,
            key: self.key.clone(),
            registered,
        }));
    }
}

fn lock_renewal(m: &StdMutex<Option<Instant>>) -> std::sync::MutexGuard<'_, Option<Instant>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn keepalive_interval(ttl: i64) -> Duration {
    Duration::from_secs(((ttl / 3).max(1)) as u64)
}

async fn keepalive_loop(ctx: KeepaliveCtx) {
    let interval = keepalive_interval(ctx.ttl);
    loop {
        let lease_id = ctx.lease_id.load(Ordering::Acquire);
        let mut stream = ctx.etcd.keep_alive(lease_id, interval);
        let mut liveness = tokio::time::interval(LIVENESS_LOG_INTERVAL);
        liveness.tick().await;

        loop {
            tokio::select! {
                ack = stream.recv() => match ack {
                    Some(ack) => {
                        *lock_renewal(&ctx.last_renewal) = Some(Instant::now());
                        metrics::counter!("octopus_registry_keepalive_total", "result" => "ok")
                            .increment(1);
                        debug!("registry: keepalive ack, key={}, ttl={}", ctx.key, ack.ttl);
                    }
                    None => break,
                },
                _ = liveness.tick() => {
                    let age = (*lock_renewal(&ctx.last_renewal)).map(|t| t.elapsed());
                    match age {
                        Some(age) => info!(
                            "registry: keepalive live, key={}, lease={}, last_renewal_age={}",
                            ctx.key,
                            lease_id,
                            humantime::format_duration(Duration::from_secs(age.as_secs())),
                        ),
                        None => warn!("registry: no renewal recorded yet, key={}", ctx.key),
                    }
                }
                _ = ctx.cancel.cancelled() => return,
            }
        }

        metrics::counter!("octopus_registry_keepalive_total", "result" => "lost").increment(1);
        warn!(
            "registry: keepalive stream closed, key={}, lease={}, re-registering",
            ctx.key, lease_id
        );

        // The stop signal wins over re-registration.
        loop {
            if ctx.cancel.is_cancelled() {
                return;
            }
            match re_register(&ctx).await {
                Ok(new_lease) => {
                    metrics::counter!("octopus_registry_register_total", "result" => "recovered")
                        .increment(1);
                    info!(
                        "registry: re-registered, key={}, lease={}",
                        ctx.key, new_lease
                    );
                    break;
                }
                Err(e) => {
                    error!("registry: re-register failed, key={}: {}", ctx.key, e);
                    tokio::select! {
                        _ = tokio::time::sleep(REREGISTER_RETRY_PAUSE) => {}
                        _ = ctx.cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}

/// Grant a fresh lease and re-put the same key under it. Restores the key
/// even after the old lease already expired and deleted it.
async fn re_register(ctx: &KeepaliveCtx) -> anyhow::Result<i64> {
    let lease_id = ctx.etcd.lease_grant(ctx.ttl).await?;
    ctx.etcd.put(&ctx.key, &ctx.value, lease_id).await?;
    ctx.lease_id.store(lease_id, Ordering::Release);
    *lock_renewal(&ctx.last_renewal) = Some(Instant::now());
    ctx.status.store(Arc::new(RegistryState {
        lease_id,
        ttl: ctx.ttl,
        key: ctx.key.clone(),
        registered: true,
    }));
    Ok(lease_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_interval_is_a_third_of_ttl() {
        assert_eq!(keepalive_interval(60), Duration::from_secs(20));
        assert_eq!(keepalive_interval(10), Duration::from_secs(3));
    }
}
