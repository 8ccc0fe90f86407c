use super::*;

#[test]
fn defaults_are_valid() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.logger.level, "info");
    assert_eq!(config.shutdown_timeout_secs, 10);
    assert!(config.rpc_server.is_none());
    assert!(config.api_server.is_none());
    assert_eq!(config.rpc_client_options.load_balancing_policy, "round_robin");
}

#[test]
fn toml_with_camel_case_keys() {
    let config: AppConfig = toml::from_str(
        r#"
        [logger]
        level = "debug"
        format = "json"
        addSource = true

        [etcd]
        endpoints = ["http://127.0.0.1:2379"]
        dialTimeoutSecs = 3

        [rpcServer]
        appName = "user-service"
        host = "0.0.0.0"
        port = 50051
        advertiseAddr = "10.0.0.5"
        ttl = 30
        enableReflection = true

        [apiServer]
        port = 8081
        mode = "debug"
        pprof = true

        [rpcClientOptions]
        keepaliveIntervalSecs = 30
        "#,
    )
    .unwrap();

    assert!(config.validate().is_ok());
    assert_eq!(config.logger.format, "json");
    assert!(config.logger.add_source);
    assert_eq!(config.etcd.dial_timeout_secs, 3);

    let rpc = config.rpc_server.unwrap();
    assert_eq!(rpc.app_name, "user-service");
    assert_eq!(rpc.advertise_addr, "10.0.0.5");
    assert_eq!(rpc.ttl, 30);
    assert!(rpc.enable_reflection);
    assert!(rpc.enable_health);

    let api = config.api_server.unwrap();
    assert_eq!(api.port, 8081);
    assert!(api.pprof);
    assert_eq!(api.health_path, "/healthz");

    assert_eq!(config.rpc_client_options.keepalive_interval_secs, Some(30));
}

#[test]
fn json_config_parses() {
    let config: AppConfig = serde_json::from_str(
        r#"{
            "etcd": {"endpoints": ["http://etcd:2379"], "username": "u", "password": "p"},
            "rpcServer": {"appName": "user-service", "port": 50051}
        }"#,
    )
    .unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.etcd.username.as_deref(), Some("u"));
    assert_eq!(config.rpc_server.unwrap().ttl, 60);
}

#[test]
fn validation_rejects_bad_values() {
    let mut config = AppConfig::default();
    config.logger.format = "yaml".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.rpc_server = Some(RpcServerConfig {
        app_name: "user-service".to_string(),
        port: 50051,
        ttl: 5,
        ..Default::default()
    });
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.rpc_server = Some(RpcServerConfig {
        app_name: String::new(),
        port: 50051,
        ..Default::default()
    });
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.rpc_client_options.load_balancing_policy = "pick_first".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.api_server = Some(ApiServerConfig {
        health_path: "healthz".to_string(),
        ..Default::default()
    });
    assert!(config.validate().is_err());
}

#[test]
fn env_overrides_apply() {
    std::env::set_var("OCTOPUS_ETCD_ENDPOINTS", "http://a:2379, http://b:2379");
    std::env::set_var("OCTOPUS_LOGGER_LEVEL", "warn");

    let mut config = AppConfig {
        rpc_server: Some(RpcServerConfig {
            app_name: "user-service".to_string(),
            port: 50051,
            ..Default::default()
        }),
        ..Default::default()
    };
    config.apply_env_overrides();

    assert_eq!(
        config.etcd.endpoints,
        vec!["http://a:2379".to_string(), "http://b:2379".to_string()]
    );
    assert_eq!(config.logger.level, "warn");

    std::env::remove_var("OCTOPUS_ETCD_ENDPOINTS");
    std::env::remove_var("OCTOPUS_LOGGER_LEVEL");
}
