use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use http::{Request, Response};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::config::RpcServerConfig;
use crate::error::FrameworkError;
use crate::etcd::EtcdClient;
use crate::registry::{Registrar, ServiceInstance};

type TonicRouter = tonic::transport::server::Router;
type ServiceMounter = Box<dyn FnOnce(TonicRouter) -> TonicRouter + Send>;

/// Collects user RPC services before the server starts.
///
/// Services are held as deferred mount closures so arbitrarily many
/// generated service types can be registered through one non-generic
/// surface.
#[derive(Default)]
pub struct RpcServiceRegistry {
    mounters: Vec<ServiceMounter>,
    service_names: Vec<&'static str>,
    file_descriptor_sets: Vec<&'static [u8]>,
}

impl RpcServiceRegistry {
    /// Install a generated tonic service. Its name is reported SERVING by
    /// the health service once the server starts.
    pub fn add_service<S>(&mut self, svc: S)
    where
        S: Service<Request<BoxBody>, Response = Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.service_names.push(S::NAME);
        self.mounters
            .push(Box::new(move |router| router.add_service(svc)));
    }

    /// Register an encoded file-descriptor set for server reflection
    /// (the `FILE_DESCRIPTOR_SET` constant emitted by tonic-build).
    pub fn add_file_descriptor_set(&mut self, fds: &'static [u8]) {
        self.file_descriptor_sets.push(fds);
    }

    pub fn service_names(&self) -> &[&'static str] {
        &self.service_names
    }

    pub fn is_empty(&self) -> bool {
        self.mounters.is_empty()
    }
}

/// Hosts listed when construction fails on an unroutable bind address.
const UNROUTABLE_HOSTS: &[&str] = &["0.0.0.0", "127.0.0.1", "localhost", "::", "[::]", "::1"];

/// Listener + tonic server + optional self-registration.
///
/// Binding happens before anything else so port conflicts fail fast; the
/// registrar publishes the advertise address only after the server is
/// accepting calls.
pub struct RpcServer {
    cfg: RpcServerConfig,
    registry: StdMutex<Option<RpcServiceRegistry>>,
    registrar: Option<Arc<Registrar>>,
    cancel: CancellationToken,
    serve_task: StdMutex<Option<tokio::task::JoinHandle<Result<(), tonic::transport::Error>>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl RpcServer {
    /// Validates the configuration and, when registration is requested and
    /// the store client is available, prepares the registrar. Registration
    /// with an unroutable bind host and no advertise address is rejected
    /// here, before any listener is opened.
    pub fn new(cfg: RpcServerConfig, etcd: Option<&EtcdClient>) -> Result<Self, FrameworkError> {
        if cfg.app_name.is_empty() {
            return Err(FrameworkError::Config(
                "rpcServer.appName must not be empty".to_string(),
            ));
        }
        if cfg.port == 0 {
            return Err(FrameworkError::Config(
                "rpcServer.port must be in 1..=65535".to_string(),
            ));
        }

        let registrar = match (cfg.enable_registration, etcd) {
            (true, Some(etcd)) => {
                let advertise = resolve_advertise_addr(&cfg)?;
                let instance = ServiceInstance {
                    app_name: cfg.app_name.clone(),
                    addr: advertise,
                    port: cfg.port,
                    version: cfg.version.clone(),
                    zone: cfg.zone.clone(),
                    weight: cfg.weight,
                    tags: cfg.tags.clone(),
                    metadata: cfg.metadata.clone(),
                };
                Some(Arc::new(Registrar::new(etcd.clone(), cfg.ttl, instance)?))
            }
            (true, None) => {
                debug!(
                    "rpc server: registration requested but etcd is not configured, app={}",
                    cfg.app_name
                );
                None
            }
            (false, _) => None,
        };

        Ok(Self {
            cfg,
            registry: StdMutex::new(Some(RpcServiceRegistry::default())),
            registrar,
            cancel: CancellationToken::new(),
            serve_task: StdMutex::new(None),
            local_addr: StdMutex::new(None),
        })
    }

    /// Access the service registry. Panics when called after `start`.
    pub fn with_registry(&self, f: impl FnOnce(&mut RpcServiceRegistry)) {
        let mut guard = lock(&self.registry);
        let registry = guard
            .as_mut()
            .expect("rpc services must be registered before start");
        f(registry);
    }

    pub fn registrar(&self) -> Option<&Arc<Registrar>> {
        self.registrar.as_ref()
    }

    /// Bound address, available once `start` returned. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Bind, assemble health/reflection/user services, begin accepting in
    /// the background, then register the instance.
    pub async fn start(&self) -> Result<(), FrameworkError> {
        let registry = lock(&self.registry)
            .take()
            .ok_or_else(|| FrameworkError::Internal("rpc server already started".to_string()))?;

        let addr: SocketAddr = format!("{}:{}", self.cfg.host, self.cfg.port)
            .parse()
            .map_err(|e| {
                FrameworkError::Config(format!(
                    "rpcServer address {}:{} invalid: {}",
                    self.cfg.host, self.cfg.port, e
                ))
            })?;
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            FrameworkError::Config(format!("rpcServer bind {} failed: {}", addr, e))
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            FrameworkError::Internal(format!("local_addr failed: {}", e))
        })?;
        *lock(&self.local_addr) = Some(local_addr);

        let health_service = if self.cfg.enable_health {
            let (mut reporter, service) = tonic_health::server::health_reporter();
            for name in registry.service_names() {
                reporter
                    .set_service_status(*name, ServingStatus::Serving)
                    .await;
            }
            reporter
                .set_service_status("", ServingStatus::Serving)
                .await;
            Some(service)
        } else {
            None
        };

        if health_service.is_none() && registry.is_empty() && !self.cfg.enable_reflection {
            return Err(FrameworkError::Config(format!(
                "rpcServer {} has no services registered",
                self.cfg.app_name
            )));
        }

        let mut router = Server::builder().add_optional_service(health_service);
        for mounter in registry.mounters {
            router = mounter(router);
        }
        if self.cfg.enable_reflection {
            let mut builder = tonic_reflection::server::Builder::configure();
            for fds in &registry.file_descriptor_sets {
                builder = builder.register_encoded_file_descriptor_set(*fds);
            }
            let reflection = builder.build_v1().map_err(|e| {
                FrameworkError::Internal(format!("reflection service build failed: {}", e))
            })?;
            router = router.add_service(reflection);
        }

        let token = self.cancel.clone();
        let incoming = TcpListenerStream::new(listener);
        let handle = tokio::spawn(router.serve_with_incoming_shutdown(incoming, async move {
            token.cancelled().await;
        }));
        *lock(&self.serve_task) = Some(handle);

        info!(
            "rpc server: listening, app={}, addr={}, services={}",
            self.cfg.app_name,
            local_addr,
            registry.service_names.join(",")
        );

        if let Some(ref registrar) = self.registrar {
            registrar.register().await?;
        }
        Ok(())
    }

    /// Graceful stop: best-effort unregister, refuse new calls, wait for
    /// in-flight calls up to `timeout`, then forcibly stop.
    pub async fn stop(&self, timeout: Duration) {
        if let Some(ref registrar) = self.registrar {
            match registrar.unregister().await {
                Ok(()) => {}
                Err(FrameworkError::NotRegistered(_)) => {}
                Err(e) => warn!("rpc server: unregister failed: {}", e),
            }
        }

        self.cancel.cancel();
        let handle = lock(&self.serve_task).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(Ok(()))) => info!("rpc server: stopped, app={}", self.cfg.app_name),
                Ok(Ok(Err(e))) => error!("rpc server: serve error on stop: {}", e),
                Ok(Err(e)) => error!("rpc server: serve task panicked: {}", e),
                Err(_) => {
                    warn!(
                        "rpc server: drain deadline ({}s) exceeded, forcing stop, app={}",
                        timeout.as_secs(),
                        self.cfg.app_name
                    );
                    abort.abort();
                }
            }
        }
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The address embedded in the published instance record. Falls back to the
/// bind host when it is routable; otherwise registration would silently
/// publish an unreachable address, so construction fails listing what the
/// machine actually exposes.
fn resolve_advertise_addr(cfg: &RpcServerConfig) -> Result<String, FrameworkError> {
    if !cfg.advertise_addr.is_empty() {
        return Ok(cfg.advertise_addr.clone());
    }
    if !UNROUTABLE_HOSTS.contains(&cfg.host.as_str()) {
        return Ok(cfg.host.clone());
    }

    let detected = detect_routable_addrs();
    let hint = if detected.is_empty() {
        "no routable addresses detected".to_string()
    } else {
        format!("detected routable addresses: {}", detected.join(", "))
    };
    Err(FrameworkError::Config(format!(
        "rpcServer.advertiseAddr is required when binding {} with registration enabled ({})",
        cfg.host, hint
    )))
}

/// Non-loopback, non-link-local IPv4 addresses of this machine.
fn detect_routable_addrs() -> Vec<String> {
    let mut addrs = Vec::new();
    for iface in pnet_datalink::interfaces() {
        for ip in iface.ips {
            if let ipnetwork::IpNetwork::V4(net) = ip {
                let addr = net.ip();
                if !addr.is_loopback() && !addr.is_link_local() && !addr.is_unspecified() {
                    addrs.push(addr.to_string());
                }
            }
        }
    }
    addrs
}
