use ants_core::config::AntConfig;
use ants_core::types::{PullPolicy, TaskMethod};
use std::io::Write;
use std::time::Duration;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults() {
    let config = AntConfig::default();
    assert!(config.id.starts_with("ant-"));
    assert_eq!(config.methods, vec![TaskMethod::Shell]);
    assert_eq!(config.max_capacity, 10);
    assert_eq!(config.output_limit, 64 * 1024 * 1024);
    assert_eq!(config.default_shell[0], "sh");
    assert_eq!(config.poll_interval(), Duration::from_secs(3));
    assert_eq!(config.poll_timeout(), 500);
    assert_eq!(config.termination_grace_period(), Duration::from_secs(5));
    assert_eq!(config.await_running_period(), Duration::from_secs(600));
    assert_eq!(config.container_reaper_interval(), Duration::from_secs(60));
    assert_eq!(config.max_job_timeout(), Duration::from_secs(7200));
    assert_eq!(config.container_prefix, "ants-");
    assert_eq!(config.kubernetes.namespace, "default");
    assert_eq!(config.kubernetes.max_services_per_pod, 10);
}

#[test]
fn test_load_from_yaml() {
    let file = write_config(
        r#"
id: ant-7
methods: [SHELL, DOCKER, KUBERNETES]
tags: [gpu]
max_capacity: 0
poll_interval_secs: 100
termination_grace_period_secs: 3600
docker:
  registry:
    server: registry.local
    username: bot
    pull_policy: always
kubernetes:
  namespace: ants
  cap_drop: [ALL]
  default_limits:
    cpu: 500m
    memory: 1Gi
"#,
    );
    let config = AntConfig::load_from(file.path()).unwrap();
    assert_eq!(config.id, "ant-7");
    assert_eq!(config.methods.len(), 3);
    assert_eq!(config.max_capacity, 10);
    assert_eq!(config.poll_interval(), Duration::from_secs(30));
    assert_eq!(config.termination_grace_period(), Duration::from_secs(300));
    assert!(config.docker.registry.has_credentials());
    assert_eq!(config.docker.registry.pull_policy, PullPolicy::Always);
    assert_eq!(config.kubernetes.namespace, "ants");
    assert_eq!(config.kubernetes.default_limits.cpu, "500m");
    assert_eq!(config.kubernetes.cap_drop, vec!["ALL".to_string()]);
}

#[test]
fn test_load_rejects_missing_methods() {
    let file = write_config("id: ant-1\nmethods: []\n");
    let err = AntConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("methods"));
}

#[test]
fn test_new_registration() {
    let mut config = AntConfig::default();
    config.tags = vec!["linux".into()];
    let mut registration = config.new_registration();
    assert_eq!(registration.ant_id, config.id);
    assert_eq!(registration.tags, vec!["linux".to_string()]);
    assert!(registration.ant_started_at <= registration.created_at);
    assert!(registration.validate().is_ok());

    let again = config.new_registration();
    assert_eq!(again.ant_started_at, registration.ant_started_at);
}

#[test]
fn test_registration_start_time_is_fixed_at_load() {
    let file = write_config("id: ant-3\n");
    let config = AntConfig::load_from(file.path()).unwrap();
    let loaded_at = config.started_at;
    std::thread::sleep(Duration::from_millis(20));
    let registration = config.new_registration();
    assert_eq!(registration.ant_started_at, loaded_at);
    assert!(registration.created_at > loaded_at);
}
