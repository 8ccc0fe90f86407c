use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::FrameworkError;

/// Root of all keys owned by this framework.
pub const REGISTRY_PREFIX: &str = "/octopus/rpc/apps";

/// Prefix that enumerates exactly the live instances of `app_name`.
pub fn app_prefix(app_name: &str) -> String {
    format!("{}/{}/", REGISTRY_PREFIX, app_name)
}

/// One running endpoint of a service. Identity is `(appName, addr, port)`;
/// the JSON encoding of this record is the value stored at the instance key.
///
/// Unknown fields are tolerated on read so older framework versions can
/// decode records written by newer ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub app_name: String,
    pub addr: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    /// Locality tag; persisted but not consumed by the default balancer.
    #[serde(default)]
    pub zone: String,
    /// Relative weight; persisted but not consumed by the default balancer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Reject the record before any store interaction.
    pub fn validate(&self) -> Result<(), FrameworkError> {
        if self.app_name.is_empty() {
            return Err(FrameworkError::InvalidInstance(
                "appName must not be empty".to_string(),
            ));
        }
        if self.app_name.contains('/') {
            return Err(FrameworkError::InvalidInstance(format!(
                "appName {:?} must not contain '/'",
                self.app_name
            )));
        }
        if self.addr.is_empty() {
            return Err(FrameworkError::InvalidInstance(
                "addr must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(FrameworkError::InvalidInstance(
                "port must be in 1..=65535".to_string(),
            ));
        }
        Ok(())
    }

    /// The `"addr:port"` string consumed by the balancer.
    pub fn resolved_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// The single key this instance occupies in the store.
    pub fn key(&self) -> String {
        format!("{}{}", app_prefix(&self.app_name), self.resolved_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServiceInstance {
        ServiceInstance {
            app_name: "user-service".to_string(),
            addr: "10.0.0.5".to_string(),
            port: 50051,
            version: "1.2.0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn key_follows_scheme() {
        assert_eq!(
            sample().key(),
            "/octopus/rpc/apps/user-service/10.0.0.5:50051"
        );
        assert_eq!(app_prefix("user-service"), "/octopus/rpc/apps/user-service/");
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut inst = sample();
        inst.app_name = String::new();
        assert!(inst.validate().is_err());

        let mut inst = sample();
        inst.addr = String::new();
        assert!(inst.validate().is_err());

        let mut inst = sample();
        inst.port = 0;
        assert!(inst.validate().is_err());

        let mut inst = sample();
        inst.app_name = "a/b".to_string();
        assert!(inst.validate().is_err());

        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_maps_omitted_from_json() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(!json.contains("tags"));
        assert!(!json.contains("metadata"));
        assert!(json.contains(r#""appName":"user-service""#));
    }

    #[test]
    fn unknown_fields_tolerated_on_read() {
        let json = r#"{
            "appName": "user-service",
            "addr": "10.0.0.5",
            "port": 50051,
            "version": "1.2.0",
            "futureField": {"nested": true}
        }"#;
        let inst: ServiceInstance = serde_json::from_str(json).unwrap();
        assert_eq!(inst, sample());
    }

    #[test]
    fn maps_round_trip() {
        let mut inst = sample();
        inst.tags.insert("proto".to_string(), "grpc".to_string());
        inst.metadata
            .insert("region".to_string(), "eu-west-1".to_string());
        inst.weight = Some(20);
        inst.zone = "zone-a".to_string();

        let json = serde_json::to_string(&inst).unwrap();
        let back: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
