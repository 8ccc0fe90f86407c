pub mod admin;
pub mod jobs;
pub mod logging;

pub use admin::AdminServer;
pub use jobs::JobScheduler;

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::AppConfig;
use crate::etcd::EtcdClient;
use crate::rpc::{RpcClientFactory, RpcServer, RpcServiceRegistry};

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Lifecycle orchestrator: owns the logger, the shared store client, the
/// RPC server, the HTTP admin server, and the job scheduler.
///
/// Construction order is logger → store client → RPC server → admin server
/// → scheduler; `run()` starts everything, blocks on SIGTERM/SIGINT, and
/// stops components in reverse dependency order under one deadline.
pub struct App {
    config: AppConfig,
    logger_guard: Option<WorkerGuard>,
    etcd: Option<EtcdClient>,
    rpc_server: Option<RpcServer>,
    admin: Option<AdminServer>,
    jobs: JobScheduler,
    before_run: Vec<Hook>,
    on_shutdown: Vec<Hook>,
    cancel: CancellationToken,
}

impl App {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let logger_guard = logging::init(&config.logger)?;

        let etcd = if config.etcd.endpoints.is_empty() {
            info!("app: etcd not configured, registration and discovery disabled");
            None
        } else {
            let client = EtcdClient::connect(&config.etcd)
                .await
                .context("etcd connect failed")?;
            info!("app: etcd connected, endpoint={}", client.base_url());
            Some(client)
        };

        let rpc_server = match config.rpc_server {
            Some(ref cfg) => Some(RpcServer::new(cfg.clone(), etcd.as_ref())?),
            None => None,
        };

        let app_name = config
            .rpc_server
            .as_ref()
            .map(|c| c.app_name.clone())
            .unwrap_or_else(|| "octopus".to_string());
        let admin = config
            .api_server
            .as_ref()
            .map(|cfg| AdminServer::new(cfg.clone(), app_name));

        let cancel = CancellationToken::new();
        let jobs = JobScheduler::new(cancel.child_token());

        Ok(Self {
            config,
            logger_guard,
            etcd,
            rpc_server,
            admin,
            jobs,
            before_run: Vec::new(),
            on_shutdown: Vec::new(),
            cancel,
        })
    }

    /// Hook executed before services start, in registration order. A
    /// failure aborts startup.
    pub fn on_before_run<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_run.push(Box::new(move || Box::pin(hook())));
    }

    /// Hook executed after services stop, in registration order. Failures
    /// are logged and do not stop later hooks.
    pub fn on_shutdown<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_shutdown.push(Box::new(move || Box::pin(hook())));
    }

    /// Install RPC service implementations onto the internal server.
    pub fn register_rpc_services(&mut self, f: impl FnOnce(&mut RpcServiceRegistry)) {
        match self.rpc_server {
            Some(ref server) => server.with_registry(f),
            None => warn!("app: register_rpc_services ignored, rpcServer not configured"),
        }
    }

    /// Install HTTP routes onto the internal admin server.
    pub fn register_api_routes(&mut self, f: impl FnOnce(Router) -> Router + Send + 'static) {
        match self.admin {
            Some(ref mut admin) => admin.install_routes(f),
            None => warn!("app: register_api_routes ignored, apiServer not configured"),
        }
    }

    /// Register a background job, started with `run()` and cancelled at
    /// shutdown.
    pub fn add_job<F, Fut>(&mut self, name: &str, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.add(name, job);
    }

    /// Client factory sharing this app's store client and client options.
    pub fn rpc_client_factory(&self) -> RpcClientFactory {
        RpcClientFactory::new(self.etcd.clone(), self.config.rpc_client_options.clone())
    }

    pub fn etcd(&self) -> Option<&EtcdClient> {
        self.etcd.as_ref()
    }

    pub fn rpc_server(&self) -> Option<&RpcServer> {
        self.rpc_server.as_ref()
    }

    /// Start everything, block until SIGTERM/SIGINT, then shut down.
    ///
    /// Startup errors propagate (the hosting binary exits non-zero);
    /// shutdown errors are logged and never interrupt the sequence.
    pub async fn run(mut self) -> Result<()> {
        for hook in self.before_run.drain(..) {
            hook().await.context("before-run hook failed")?;
        }

        if let Some(ref mut admin) = self.admin {
            admin.start().await?;
        }
        if let Some(ref rpc) = self.rpc_server {
            rpc.start().await?;
        }
        self.jobs.start();
        info!("app: started, jobs={}", self.jobs.job_count());

        wait_for_shutdown_signal().await;
        self.cancel.cancel();

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_timeout_secs);
        if let Some(ref admin) = self.admin {
            admin.stop(remaining(deadline)).await;
        }
        if let Some(ref rpc) = self.rpc_server {
            rpc.stop(remaining(deadline)).await;
        }
        if let Err(e) = self.jobs.stop(remaining(deadline)).await {
            warn!("app: {}", e);
        }

        for hook in self.on_shutdown.drain(..) {
            if let Err(e) = hook().await {
                error!("app: shutdown hook failed: {:#}", e);
            }
        }

        self.etcd.take();
        info!("app: shutdown complete");
        // Dropped last so the final lines are flushed.
        self.logger_guard.take();
        Ok(())
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("app: received SIGINT, shutting down"),
        _ = terminate => info!("app: received SIGTERM, shutting down"),
    }
}
