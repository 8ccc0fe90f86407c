//! Integration tests for registration, discovery, and resolution against a
//! real etcd.
//!
//! These tests require Docker (via testcontainers) and are skipped in
//! environments without Docker by simply failing at container startup.
//!
//! Run with: `cargo test --test etcd_integration`

use std::time::Duration;

use octopus_rpc::config::{EtcdConfig, RpcClientOptions};
use octopus_rpc::error::FrameworkError;
use octopus_rpc::etcd::EtcdClient;
use octopus_rpc::registry::{app_prefix, Discoverer, Registrar, ServiceInstance};
use octopus_rpc::rpc::{EtcdResolver, RpcClientFactory};

use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Start an etcd container and return a connected client.
async fn start_etcd() -> (EtcdClient, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("quay.io/coreos/etcd", "v3.5.17")
        .with_exposed_port(2379_u16.tcp())
        .with_env_var("ETCD_ADVERTISE_CLIENT_URLS", "http://0.0.0.0:2379")
        .with_env_var("ETCD_LISTEN_CLIENT_URLS", "http://0.0.0.0:2379")
        .start()
        .await
        .expect("failed to start etcd container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(2379).await.expect("get port");
    let endpoint = format!("http://{}:{}", host, port);

    // Wait for etcd to be ready.
    let http = reqwest::Client::new();
    for _ in 0..30 {
        if let Ok(resp) = http
            .post(format!("{}/v3/maintenance/status", endpoint))
            .json(&serde_json::json!({}))
            .send()
            .await
        {
            if resp.status().is_success() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let cfg = EtcdConfig {
        endpoints: vec![endpoint],
        ..Default::default()
    };
    let client = EtcdClient::connect(&cfg).await.expect("connect to etcd");
    (client, container)
}

fn instance(app: &str, addr: &str, port: u16) -> ServiceInstance {
    ServiceInstance {
        app_name: app.to_string(),
        addr: addr.to_string(),
        port,
        version: "1.0.0".to_string(),
        ..Default::default()
    }
}

/// Poll `check` every 100 ms until it returns true or `timeout` elapses.
async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── store client plumbing ───────────────────────────────────────────────

#[tokio::test]
async fn kv_and_lease_roundtrip() {
    let (client, _container) = start_etcd().await;

    client
        .put("/octopus/rpc/apps/t/10.0.0.1:1", "{}", 0)
        .await
        .expect("put");
    let snap = client
        .range_prefix("/octopus/rpc/apps/t/")
        .await
        .expect("range");
    assert_eq!(snap.kvs.len(), 1);
    assert_eq!(snap.kvs[0].key, "/octopus/rpc/apps/t/10.0.0.1:1");
    assert_eq!(snap.kvs[0].value, "{}");
    assert!(snap.revision > 0);

    let lease = client.lease_grant(10).await.expect("grant");
    client
        .put("/octopus/rpc/apps/t/10.0.0.2:2", "{}", lease)
        .await
        .expect("put with lease");
    let snap = client
        .range_prefix("/octopus/rpc/apps/t/")
        .await
        .expect("range");
    let leased = snap
        .kvs
        .iter()
        .find(|kv| kv.key.ends_with("10.0.0.2:2"))
        .expect("leased key present");
    assert_eq!(leased.lease, lease);

    client.lease_revoke(lease).await.expect("revoke");
    let snap = client
        .range_prefix("/octopus/rpc/apps/t/")
        .await
        .expect("range");
    assert!(
        !snap.kvs.iter().any(|kv| kv.key.ends_with("10.0.0.2:2")),
        "revoke must delete the bound key"
    );
}

#[tokio::test]
async fn keepalive_stream_acks_then_closes_on_revoke() {
    let (client, _container) = start_etcd().await;

    let lease = client.lease_grant(10).await.expect("grant");
    let mut stream = client.keep_alive(lease, Duration::from_secs(1));

    let ack = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("ack within 5s")
        .expect("stream open");
    assert!(ack.ttl > 0);

    client.lease_revoke(lease).await.expect("revoke");
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while stream.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "stream must close after lease revoke");
}

// ── registrar ───────────────────────────────────────────────────────────

#[tokio::test]
async fn register_then_discover_single_instance() {
    let (client, _container) = start_etcd().await;

    let registrar = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    registrar.register().await.expect("register");

    let status = registrar.status();
    assert!(status.registered);
    assert_ne!(status.lease_id, 0);
    assert!(registrar.is_healthy());

    // Exactly one key at the canonical path, bound to the current lease.
    let snap = client
        .range_prefix(&app_prefix("user-service"))
        .await
        .expect("range");
    assert_eq!(snap.kvs.len(), 1);
    assert_eq!(
        snap.kvs[0].key,
        "/octopus/rpc/apps/user-service/10.0.0.5:50051"
    );
    assert_eq!(snap.kvs[0].lease, status.lease_id);

    let discoverer = Discoverer::new(client.clone(), "user-service");
    discoverer.watch().await.expect("watch");
    let instances = discoverer.get_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].addr, "10.0.0.5");
    assert_eq!(instances[0].port, 50051);

    discoverer.close().await;
    registrar.unregister().await.expect("unregister");
}

#[tokio::test]
async fn caller_misuse_is_surfaced_synchronously() {
    let (client, _container) = start_etcd().await;

    let registrar = Registrar::new(client, 60, instance("user-service", "10.0.0.5", 50051))
        .expect("registrar");

    assert!(matches!(
        registrar.unregister().await,
        Err(FrameworkError::NotRegistered(_))
    ));

    registrar.register().await.expect("register");
    assert!(matches!(
        registrar.register().await,
        Err(FrameworkError::AlreadyRegistered(_))
    ));

    registrar.unregister().await.expect("unregister");
    assert!(matches!(
        registrar.unregister().await,
        Err(FrameworkError::NotRegistered(_))
    ));
}

#[tokio::test]
async fn unregister_removes_key_and_empties_discovery() {
    let (client, _container) = start_etcd().await;

    let registrar = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    registrar.register().await.expect("register");

    let discoverer = Discoverer::new(client.clone(), "user-service");
    discoverer.watch().await.expect("watch");
    assert_eq!(discoverer.instance_count(), 1);

    registrar.unregister().await.expect("unregister");
    assert!(!registrar.status().registered);

    let prefix = app_prefix("user-service");
    let key_gone = eventually(Duration::from_secs(3), || {
        let client = client.clone();
        let prefix = prefix.clone();
        async move {
            client
                .range_prefix(&prefix)
                .await
                .map(|s| s.kvs.is_empty())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(key_gone, "key must be deleted within 3s of unregister");

    let cache_empty = eventually(Duration::from_secs(5), || {
        let count = discoverer.instance_count();
        async move { count == 0 }
    })
    .await;
    assert!(cache_empty, "discovery cache must drain within 5s");

    discoverer.close().await;
}

#[tokio::test]
async fn external_lease_revoke_triggers_reregistration() {
    let (client, _container) = start_etcd().await;

    // Minimum TTL keeps the keepalive cadence tight for the test.
    let registrar = Registrar::new(
        client.clone(),
        10,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    registrar.register().await.expect("register");
    let old_lease = registrar.status().lease_id;

    // Out-of-band revoke deletes the key and kills the keepalive stream.
    client.lease_revoke(old_lease).await.expect("revoke");

    let prefix = app_prefix("user-service");
    let recovered = eventually(Duration::from_secs(10), || {
        let client = client.clone();
        let prefix = prefix.clone();
        async move {
            match client.range_prefix(&prefix).await {
                Ok(snap) => {
                    snap.kvs.len() == 1
                        && snap.kvs[0].lease != 0
                        && snap.kvs[0].lease != old_lease
                }
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(
        recovered,
        "a new key under a new lease must appear within 10s"
    );
    assert_ne!(registrar.status().lease_id, old_lease);

    registrar.unregister().await.expect("unregister");
}

// ── discoverer ──────────────────────────────────────────────────────────

#[tokio::test]
async fn two_instances_discovered_together() {
    let (client, _container) = start_etcd().await;

    let first = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    let second = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.6", 50051),
    )
    .expect("registrar");
    first.register().await.expect("register first");
    second.register().await.expect("register second");

    let discoverer = Discoverer::new(client.clone(), "user-service");
    discoverer.watch().await.expect("watch");

    let mut addrs = discoverer.resolved_addrs();
    addrs.sort();
    assert_eq!(addrs, vec!["10.0.0.5:50051", "10.0.0.6:50051"]);

    discoverer.close().await;
    first.unregister().await.expect("unregister");
    second.unregister().await.expect("unregister");
}

#[tokio::test]
async fn discoverer_tracks_changes_from_watch() {
    let (client, _container) = start_etcd().await;

    let discoverer = Discoverer::new(client.clone(), "user-service");
    discoverer.watch().await.expect("watch");
    assert_eq!(discoverer.instance_count(), 0);

    let registrar = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    registrar.register().await.expect("register");

    let seen = eventually(Duration::from_secs(5), || {
        let count = discoverer.instance_count();
        async move { count == 1 }
    })
    .await;
    assert!(seen, "watch must deliver the registration");

    registrar.unregister().await.expect("unregister");
    let gone = eventually(Duration::from_secs(5), || {
        let count = discoverer.instance_count();
        async move { count == 0 }
    })
    .await;
    assert!(gone, "watch must deliver the deregistration");

    discoverer.close().await;
}

#[tokio::test]
async fn rebootstrap_catches_up_with_missed_changes() {
    let (client, _container) = start_etcd().await;

    let keep = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    let doomed = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.6", 50051),
    )
    .expect("registrar");
    keep.register().await.expect("register");
    doomed.register().await.expect("register");

    let discoverer = Discoverer::new(client.clone(), "user-service");
    discoverer.watch().await.expect("watch");
    assert_eq!(discoverer.instance_count(), 2);

    // Kill the watch task, then change the live set behind its back.
    discoverer.stop().await;

    let late = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.7", 50051),
    )
    .expect("registrar");
    late.register().await.expect("register");
    doomed.unregister().await.expect("unregister");

    // The cache still reflects the stale pre-outage state.
    assert_eq!(discoverer.instance_count(), 2);

    // The mandatory re-read replaces the cache with the live set.
    discoverer.refresh().await.expect("refresh");
    let mut addrs = discoverer.resolved_addrs();
    addrs.sort();
    assert_eq!(addrs, vec!["10.0.0.5:50051", "10.0.0.7:50051"]);

    keep.unregister().await.expect("unregister");
    late.unregister().await.expect("unregister");
}

#[tokio::test]
async fn get_instances_returns_deep_copies() {
    let (client, _container) = start_etcd().await;

    let registrar = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    registrar.register().await.expect("register");

    let discoverer = Discoverer::new(client.clone(), "user-service");
    discoverer.watch().await.expect("watch");

    let mut copy = discoverer.get_instances();
    copy[0].addr = "mutated".to_string();
    copy[0]
        .metadata
        .insert("poison".to_string(), "true".to_string());
    copy.clear();

    let fresh = discoverer.get_instances();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].addr, "10.0.0.5");
    assert!(fresh[0].metadata.is_empty());

    discoverer.close().await;
    registrar.unregister().await.expect("unregister");
}

// ── resolver & client factory ───────────────────────────────────────────

#[tokio::test]
async fn resolver_pushes_inserts_and_removes() {
    use tower::discover::Change;

    let (client, _container) = start_etcd().await;

    let registrar = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    registrar.register().await.expect("register");

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let resolver = EtcdResolver::start(
        client.clone(),
        "user-service",
        tx,
        RpcClientOptions::default(),
    )
    .await
    .expect("resolver");

    let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("initial push within 5s")
        .expect("channel open");
    match change {
        Change::Insert(key, _) => assert_eq!(key, "10.0.0.5:50051"),
        _ => panic!("expected insert for the bootstrapped instance"),
    }

    registrar.unregister().await.expect("unregister");
    let change = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("removal pushed within 10s")
        .expect("channel open");
    match change {
        Change::Remove(key) => assert_eq!(key, "10.0.0.5:50051"),
        _ => panic!("expected remove after unregister"),
    }

    resolver.shutdown();
}

#[tokio::test]
async fn factory_dispatches_schemes() {
    // No store client: direct and bare endpoints work, etcd targets fail.
    let factory = RpcClientFactory::new(None, RpcClientOptions::default());

    let direct = factory
        .dial("direct:///127.0.0.1:50051, 127.0.0.1:50052")
        .await
        .expect("direct dial");
    assert_eq!(direct.target(), "direct:///127.0.0.1:50051, 127.0.0.1:50052");
    direct.close();

    let single = factory.dial("127.0.0.1:50051").await.expect("bare dial");
    single.close();

    assert!(factory.dial("etcd:///user-service").await.is_err());
    assert!(factory.dial("consul:///user-service").await.is_err());
}

#[tokio::test]
async fn factory_dials_etcd_scheme_with_store_client() {
    let (client, _container) = start_etcd().await;

    let registrar = Registrar::new(
        client.clone(),
        60,
        instance("user-service", "10.0.0.5", 50051),
    )
    .expect("registrar");
    registrar.register().await.expect("register");

    let factory = RpcClientFactory::new(Some(client), RpcClientOptions::default());
    let rpc_client = factory
        .dial("etcd:///user-service")
        .await
        .expect("etcd dial");
    rpc_client.resolve_now().await;
    rpc_client.close();

    registrar.unregister().await.expect("unregister");
}
