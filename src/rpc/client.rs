use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::config::RpcClientOptions;
use crate::error::FrameworkError;
use crate::etcd::EtcdClient;
use crate::rpc::resolver::{push_direct, EtcdResolver};

/// A parsed client target.
///
/// ```text
/// target  = "etcd:///" appName
///         | "direct:///" endpoint ("," endpoint)*
///         | endpoint
/// endpoint = host ":" port
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetUrl {
    /// Resolve the app name through a discoverer.
    Etcd(String),
    /// Fixed address list, pushed once.
    Direct(Vec<String>),
    /// Single endpoint, no resolver involvement.
    HostPort(String),
}

impl TargetUrl {
    pub fn parse(target: &str) -> Result<Self, FrameworkError> {
        if let Some(app_name) = target.strip_prefix("etcd:///") {
            if app_name.is_empty() || app_name.contains('/') {
                return Err(FrameworkError::InvalidTarget(target.to_string()));
            }
            return Ok(TargetUrl::Etcd(app_name.to_string()));
        }

        if let Some(list) = target.strip_prefix("direct:///") {
            let endpoints: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if endpoints.is_empty() {
                return Err(FrameworkError::InvalidTarget(target.to_string()));
            }
            for ep in &endpoints {
                validate_endpoint(ep)
                    .map_err(|_| FrameworkError::InvalidTarget(target.to_string()))?;
            }
            return Ok(TargetUrl::Direct(endpoints));
        }

        // Any other scheme is unsupported.
        if target.contains("://") {
            return Err(FrameworkError::InvalidTarget(target.to_string()));
        }

        validate_endpoint(target)?;
        Ok(TargetUrl::HostPort(target.to_string()))
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), FrameworkError> {
    let mut parts = endpoint.rsplitn(2, ':');
    let port = parts.next().unwrap_or_default();
    let host = parts.next().unwrap_or_default();
    if host.is_empty() {
        return Err(FrameworkError::InvalidTarget(endpoint.to_string()));
    }
    match port.parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(()),
        _ => Err(FrameworkError::InvalidTarget(endpoint.to_string())),
    }
}

/// Build a plaintext endpoint for `"host:port"` carrying the configured
/// connect timeout, TCP nodelay, and optional HTTP/2 keepalive.
pub(crate) fn build_endpoint(
    addr: &str,
    options: &RpcClientOptions,
) -> Result<Endpoint, FrameworkError> {
    let mut endpoint = Endpoint::from_shared(format!("http://{}", addr))
        .map_err(|_| FrameworkError::InvalidTarget(addr.to_string()))?
        .connect_timeout(Duration::from_secs(options.connect_timeout_secs))
        .tcp_nodelay(options.tcp_nodelay);

    if let Some(interval) = options.keepalive_interval_secs {
        endpoint = endpoint
            .http2_keep_alive_interval(Duration::from_secs(interval))
            .keep_alive_timeout(Duration::from_secs(options.keepalive_timeout_secs))
            .keep_alive_while_idle(options.keepalive_while_idle);
    }

    Ok(endpoint)
}

/// A dialed client connection. The caller owns it and closes it when done;
/// `channel()` hands out cheap clones for generated service stubs.
pub struct RpcClient {
    target: String,
    channel: Channel,
    resolver: Option<EtcdResolver>,
}

impl RpcClient {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Force the discovery-backed resolver to re-bootstrap. No-op for
    /// direct and single-endpoint targets.
    pub async fn resolve_now(&self) {
        if let Some(ref resolver) = self.resolver {
            resolver.resolve_now().await;
        }
    }

    /// Shut the resolver down. Non-blocking; background cleanup completes
    /// asynchronously.
    pub fn close(&self) {
        if let Some(ref resolver) = self.resolver {
            resolver.shutdown();
        }
    }
}

/// Constructs balanced client connections from target URLs, sharing one
/// coordination-store client across all discovery-backed resolvers.
#[derive(Clone)]
pub struct RpcClientFactory {
    etcd: Option<EtcdClient>,
    options: RpcClientOptions,
}

impl RpcClientFactory {
    pub fn new(etcd: Option<EtcdClient>, options: RpcClientOptions) -> Self {
        Self { etcd, options }
    }

    /// Dial `target`, selecting the resolution strategy from its scheme.
    pub async fn dial(&self, target: &str) -> Result<RpcClient, FrameworkError> {
        match TargetUrl::parse(target)? {
            TargetUrl::Etcd(app_name) => {
                let etcd = self.etcd.clone().ok_or_else(|| {
                    FrameworkError::Config(format!(
                        "target {} requires etcd endpoints to be configured",
                        target
                    ))
                })?;
                let (channel, tx) = Channel::balance_channel(64);
                let resolver =
                    EtcdResolver::start(etcd, &app_name, tx, self.options.clone()).await?;
                info!("rpc client: dialed, target={}, scheme=etcd", target);
                Ok(RpcClient {
                    target: target.to_string(),
                    channel,
                    resolver: Some(resolver),
                })
            }
            TargetUrl::Direct(endpoints) => {
                let (channel, tx) = Channel::balance_channel(endpoints.len() * 2);
                let pushed = push_direct(&endpoints, &tx, &self.options).await?;
                info!(
                    "rpc client: dialed, target={}, scheme=direct, endpoints={}",
                    target, pushed
                );
                Ok(RpcClient {
                    target: target.to_string(),
                    channel,
                    resolver: None,
                })
            }
            TargetUrl::HostPort(endpoint) => {
                let channel = build_endpoint(&endpoint, &self.options)?.connect_lazy();
                debug!("rpc client: dialed, target={}, scheme=none", target);
                Ok(RpcClient {
                    target: target.to_string(),
                    channel,
                    resolver: None,
                })
            }
        }
    }
}
