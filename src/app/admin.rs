use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ApiServerConfig;
use crate::error::FrameworkError;

type RouteInstaller = Box<dyn FnOnce(Router) -> Router + Send>;

/// HTTP admin surface: health endpoint, caller-installed routes, and an
/// optional debug group with Prometheus metrics and process vars.
pub struct AdminServer {
    cfg: ApiServerConfig,
    app_name: String,
    installers: Vec<RouteInstaller>,
    cancel: CancellationToken,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    started_at: Instant,
}

impl AdminServer {
    pub fn new(cfg: ApiServerConfig, app_name: String) -> Self {
        Self {
            cfg,
            app_name,
            installers: Vec::new(),
            cancel: CancellationToken::new(),
            task: StdMutex::new(None),
            local_addr: StdMutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Queue a route-installation callback, applied when the server starts.
    pub fn install_routes(&mut self, f: impl FnOnce(Router) -> Router + Send + 'static) {
        self.installers.push(Box::new(f));
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub async fn start(&mut self) -> Result<(), FrameworkError> {
        let addr: SocketAddr = format!("{}:{}", self.cfg.host, self.cfg.port)
            .parse()
            .map_err(|e| {
                FrameworkError::Config(format!(
                    "apiServer address {}:{} invalid: {}",
                    self.cfg.host, self.cfg.port, e
                ))
            })?;
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            FrameworkError::Config(format!("apiServer bind {} failed: {}", addr, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| FrameworkError::Internal(format!("local_addr failed: {}", e)))?;
        *lock(&self.local_addr) = Some(local_addr);

        let app_name = self.app_name.clone();
        let started_at = self.started_at;
        let mut router = Router::new().route(
            self.cfg.health_path.as_str(),
            get(move || {
                let app_name = app_name.clone();
                async move {
                    Json(serde_json::json!({
                        "status": "ok",
                        "app": app_name,
                    }))
                }
            }),
        );

        for installer in self.installers.drain(..) {
            router = installer(router);
        }

        if self.cfg.pprof {
            router = mount_debug_routes(router, &self.app_name, started_at);
        }

        router = router.layer(TimeoutLayer::new(Duration::from_secs(
            self.cfg.write_timeout_secs,
        )));
        if self.cfg.mode == "debug" {
            router = router.layer(TraceLayer::new_for_http());
        }

        let token = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                token.cancelled().await;
            });
            if let Err(e) = serve.await {
                error!("api server: serve error: {}", e);
            }
        });
        *lock(&self.task) = Some(handle);

        info!("api server: listening, addr={}", local_addr);
        Ok(())
    }

    /// Stop accepting, wait for in-flight requests up to `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => info!("api server: stopped"),
                Err(_) => {
                    warn!(
                        "api server: drain deadline ({}s) exceeded, forcing stop",
                        timeout.as_secs()
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

/// `/debug/metrics` (Prometheus text) and `/debug/vars` (process info).
fn mount_debug_routes(router: Router, app_name: &str, started_at: Instant) -> Router {
    let router = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => router.route(
            "/debug/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ),
        Err(e) => {
            // A recorder from an earlier instance stays in place.
            warn!("api server: prometheus recorder not installed: {}", e);
            router
        }
    };

    let app_name = app_name.to_string();
    router.route(
        "/debug/vars",
        get(move || {
            let app_name = app_name.clone();
            async move {
                Json(serde_json::json!({
                    "app": app_name,
                    "version": env!("CARGO_PKG_VERSION"),
                    "pid": std::process::id(),
                    "uptime_secs": started_at.elapsed().as_secs(),
                }))
            }
        }),
    )
}
