use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level framework configuration. Keys are camelCase in the file:
/// `logger`, `etcd`, `rpcServer`, `apiServer`, `rpcClientOptions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub etcd: EtcdConfig,

    /// RPC server section; absent means this process serves no RPC.
    #[serde(default)]
    pub rpc_server: Option<RpcServerConfig>,

    /// HTTP admin server section; absent means no admin surface.
    #[serde(default)]
    pub api_server: Option<ApiServerConfig>,

    #[serde(default)]
    pub rpc_client_options: RpcClientOptions,

    /// Budget for the whole shutdown sequence after a signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    /// `trace` / `debug` / `info` / `warn` / `error`, or a full filter
    /// directive; `RUST_LOG` overrides when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `json` or `text`.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Annotate events with file and line.
    #[serde(default)]
    pub add_source: bool,

    /// `stdout`, `stderr`, or a log file path (rotated daily).
    #[serde(default = "default_log_output")]
    pub output: String,

    /// Rotated log files kept on disk.
    #[serde(default = "default_log_retention")]
    pub retention_days: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            add_source: false,
            output: default_log_output(),
            retention_days: default_log_retention(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_log_retention() -> usize {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// Empty disables everything store-backed (registration, discovery).
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout_secs: default_dial_timeout(),
            username: None,
            password: None,
        }
    }
}

fn default_dial_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcServerConfig {
    pub app_name: String,

    #[serde(default = "default_bind_host")]
    pub host: String,

    pub port: u16,

    /// Address published in the instance record; must be reachable by
    /// clients. Defaults to `host` when that is routable.
    #[serde(default)]
    pub advertise_addr: String,

    /// Lease TTL in seconds, minimum 10.
    #[serde(default = "default_lease_ttl")]
    pub ttl: i64,

    #[serde(default = "default_true")]
    pub enable_registration: bool,

    #[serde(default = "default_true")]
    pub enable_health: bool,

    #[serde(default)]
    pub enable_reflection: bool,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub weight: Option<u32>,

    #[serde(default)]
    pub tags: HashMap<String, String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            host: default_bind_host(),
            port: 0,
            advertise_addr: String::new(),
            ttl: default_lease_ttl(),
            enable_registration: true,
            enable_health: true,
            enable_reflection: false,
            version: String::new(),
            zone: String::new(),
            weight: None,
            tags: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_lease_ttl() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// `debug` adds per-request tracing; `release` stays quiet.
    #[serde(default = "default_api_mode")]
    pub mode: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Enables the debug surface (`/debug/metrics`, `/debug/vars`).
    #[serde(default)]
    pub pprof: bool,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_api_port(),
            mode: default_api_mode(),
            health_path: default_health_path(),
            pprof: false,
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

fn default_api_mode() -> String {
    "release".to_string()
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_read_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcClientOptions {
    /// Only `round_robin` is supported; the balanced channel distributes
    /// across ready endpoints.
    #[serde(default = "default_lb_policy")]
    pub load_balancing_policy: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// HTTP/2 keepalive ping interval; absent disables keepalive.
    #[serde(default)]
    pub keepalive_interval_secs: Option<u64>,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default)]
    pub keepalive_while_idle: bool,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            load_balancing_policy: default_lb_policy(),
            connect_timeout_secs: default_connect_timeout(),
            tcp_nodelay: true,
            keepalive_interval_secs: None,
            keepalive_timeout_secs: default_keepalive_timeout(),
            keepalive_while_idle: false,
        }
    }
}

fn default_lb_policy() -> String {
    "round_robin".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_keepalive_timeout() -> u64 {
    3
}
