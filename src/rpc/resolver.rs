use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tower::discover::Change;
use tracing::{info, warn};

use crate::config::RpcClientOptions;
use crate::error::FrameworkError;
use crate::etcd::EtcdClient;
use crate::registry::Discoverer;
use crate::rpc::client::build_endpoint;

/// The RPC framework's side of the bridge: the balanced channel consumes
/// whatever address changes are sent here.
pub type ChangeSender = Sender<Change<String, Endpoint>>;

/// Feeds a balanced channel from a discoverer's cache.
///
/// The initial address set is pushed as soon as the bootstrap range read
/// completes (an empty set simply leaves the balancer without endpoints,
/// failing calls until instances appear); afterwards every cache change is
/// diffed against the last pushed set.
pub struct EtcdResolver {
    discoverer: Arc<Discoverer>,
    cancel: CancellationToken,
}

impl EtcdResolver {
    /// Build a discoverer for `app_name` and keep pushing its address set
    /// into `tx` until shutdown.
    pub async fn start(
        etcd: EtcdClient,
        app_name: &str,
        tx: ChangeSender,
        options: RpcClientOptions,
    ) -> Result<Self, FrameworkError> {
        let discoverer = Arc::new(Discoverer::new(etcd, app_name));
        // Subscribe before watch() so the bootstrap bump is not missed.
        let rx = discoverer.subscribe();
        discoverer.watch().await?;

        let cancel = CancellationToken::new();
        tokio::spawn(push_loop(
            discoverer.clone(),
            rx,
            tx,
            options,
            cancel.child_token(),
        ));

        Ok(Self { discoverer, cancel })
    }

    /// Force a re-bootstrap of the discovery cache.
    pub async fn resolve_now(&self) {
        if let Err(e) = self.discoverer.refresh().await {
            warn!(
                "resolver: refresh failed, app={}: {}",
                self.discoverer.app_name(),
                e
            );
        }
    }

    /// Cancel background work and return immediately; the discoverer's
    /// watch task finishes its cleanup asynchronously.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let discoverer = self.discoverer.clone();
        tokio::spawn(async move {
            discoverer.close().await;
        });
    }
}

/// Added and removed addresses relative to the last pushed set.
fn set_diff(current: &HashSet<String>, pushed: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let added = current.difference(pushed).cloned().collect();
    let removed = pushed.difference(current).cloned().collect();
    (added, removed)
}

async fn push_loop(
    discoverer: Arc<Discoverer>,
    mut rx: watch::Receiver<u64>,
    tx: ChangeSender,
    options: RpcClientOptions,
    cancel: CancellationToken,
) {
    let app = discoverer.app_name().to_string();
    let mut pushed: HashSet<String> = HashSet::new();
    let mut bootstrapped = false;

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }

        let current: HashSet<String> = discoverer.resolved_addrs().into_iter().collect();
        if !bootstrapped {
            bootstrapped = true;
            info!(
                "resolver: initial address set, app={}, endpoints={}",
                app,
                current.len()
            );
        }
        if current == pushed {
            continue;
        }

        let (added, removed) = set_diff(&current, &pushed);
        // Insert before remove so the balancer set never empties while a
        // replacement is in flight.
        for addr in &added {
            match build_endpoint(addr, &options) {
                Ok(endpoint) => {
                    if tx.send(Change::Insert(addr.clone(), endpoint)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        "resolver: unusable address skipped, app={}, addr={}: {}",
                        app, addr, e
                    );
                }
            }
        }
        for addr in &removed {
            if tx.send(Change::Remove(addr.clone())).await.is_err() {
                return;
            }
        }

        metrics::counter!("octopus_resolver_updates_total", "app" => app.clone()).increment(1);
        info!(
            "resolver: address set updated, app={}, endpoints={}, added={}, removed={}",
            app,
            current.len(),
            added.len(),
            removed.len()
        );
        pushed = current;
    }
}

/// Push a fixed endpoint list once. Duplicates are collapsed; the set is
/// never updated afterwards.
pub(crate) async fn push_direct(
    endpoints: &[String],
    tx: &ChangeSender,
    options: &RpcClientOptions,
) -> Result<usize, FrameworkError> {
    let mut seen = HashSet::new();
    for endpoint in endpoints {
        if !seen.insert(endpoint.clone()) {
            continue;
        }
        let ep = build_endpoint(endpoint, options)?;
        tx.send(Change::Insert(endpoint.clone(), ep))
            .await
            .map_err(|_| FrameworkError::Internal("balancer channel closed".to_string()))?;
    }
    Ok(seen.len())
}
