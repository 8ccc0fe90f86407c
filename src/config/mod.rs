pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;

use anyhow::Result;

impl AppConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. A missing file means
    /// built-in defaults, so a process can start with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: AppConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for connection/deployment settings, the
    /// values that differ per environment while the file stays shared.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OCTOPUS_ETCD_ENDPOINTS") {
            self.etcd.endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("OCTOPUS_ETCD_USERNAME") {
            self.etcd.username = Some(v);
        }
        if let Ok(v) = std::env::var("OCTOPUS_ETCD_PASSWORD") {
            self.etcd.password = Some(v);
        }

        if let Ok(v) = std::env::var("OCTOPUS_LOGGER_LEVEL") {
            self.logger.level = v;
        }
        if let Ok(v) = std::env::var("OCTOPUS_LOGGER_FORMAT") {
            self.logger.format = v;
        }

        if let Some(ref mut rpc) = self.rpc_server {
            if let Ok(v) = std::env::var("OCTOPUS_RPC_ADVERTISE_ADDR") {
                rpc.advertise_addr = v;
            }
            if let Ok(v) = std::env::var("OCTOPUS_RPC_HOST") {
                rpc.host = v;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for ep in &self.etcd.endpoints {
            if ep.is_empty() {
                anyhow::bail!("etcd endpoint cannot be empty");
            }
        }

        match self.logger.format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("logger.format {:?} unsupported, use json or text", other),
        }

        if let Some(ref rpc) = self.rpc_server {
            if rpc.app_name.is_empty() {
                anyhow::bail!("rpcServer.appName must not be empty");
            }
            if rpc.port == 0 {
                anyhow::bail!("rpcServer.port must be in 1..=65535");
            }
            if rpc.ttl < crate::registry::registrar::MIN_TTL_SECS {
                anyhow::bail!(
                    "rpcServer.ttl {} below minimum of {} seconds",
                    rpc.ttl,
                    crate::registry::registrar::MIN_TTL_SECS
                );
            }
        }

        if let Some(ref api) = self.api_server {
            if api.port == 0 {
                anyhow::bail!("apiServer.port must be in 1..=65535");
            }
            match api.mode.as_str() {
                "debug" | "release" => {}
                other => anyhow::bail!("apiServer.mode {:?} unsupported, use debug or release", other),
            }
            if !api.health_path.starts_with('/') {
                anyhow::bail!("apiServer.healthPath must start with '/'");
            }
        }

        if self.rpc_client_options.load_balancing_policy != "round_robin" {
            anyhow::bail!(
                "rpcClientOptions.loadBalancingPolicy {:?} unsupported, use round_robin",
                self.rpc_client_options.load_balancing_policy
            );
        }

        Ok(())
    }
}
