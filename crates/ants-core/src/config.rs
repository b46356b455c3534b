use crate::error::AntError;
use crate::events::AntRegistration;
use crate::types::{PullPolicy, TaskMethod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SHELL_PROBE: &str = "if [ -x /usr/local/bin/bash ]; then\n\texec /usr/local/bin/bash \nelif [ -x /usr/bin/bash ]; then\n\texec /usr/bin/bash \nelif [ -x /bin/bash ]; then\n\texec /bin/bash \nelif [ -x /usr/local/bin/sh ]; then\n\texec /usr/local/bin/sh \nelif [ -x /usr/bin/sh ]; then\n\texec /usr/bin/sh \nelif [ -x /bin/sh ]; then\n\texec /bin/sh \nelif [ -x /busybox/sh ]; then\n\texec /busybox/sh \nelse\n\techo shell not found\n\texit 1\nfi\n";

/// Ant configuration. Loaded from ~/.config/ants/ant.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntConfig {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_methods")]
    pub methods: Vec<TaskMethod>,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: i32,
    #[serde(default = "default_output_limit")]
    pub output_limit: i64,
    #[serde(default = "default_shell")]
    pub default_shell: Vec<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: i64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: i64,
    #[serde(default)]
    pub termination_grace_period_secs: u64,
    #[serde(default)]
    pub await_running_period_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub container_reaper_interval_secs: u64,
    #[serde(default = "default_max_job_timeout")]
    pub max_job_timeout_secs: u64,
    #[serde(default = "default_registration_interval")]
    pub registration_interval_secs: u64,

    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    #[serde(default = "default_recently_completed_capacity")]
    pub recently_completed_jobs_capacity: usize,
    #[serde(default)]
    pub clock_skew_tolerance_secs: u64,

    #[serde(default = "default_registration_topic")]
    pub registration_topic: String,
    #[serde(default = "default_container_lifecycle_topic")]
    pub container_lifecycle_topic: String,
    #[serde(default = "default_recently_completed_jobs_topic")]
    pub recently_completed_jobs_topic: String,

    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// When this ant's configuration was built. Sent as `ant_started_at` in
    /// every heartbeat.
    #[serde(skip, default = "Utc::now")]
    pub started_at: DateTime<Utc>,
}

/// Container registry credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl RegistryConfig {
    pub fn has_credentials(&self) -> bool {
        !self.server.is_empty() && !self.username.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon address; local defaults when empty.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// CPU, memory and ephemeral storage quantities such as `500m` or `1Gi`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub ephemeral_storage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostAliasConfig {
    pub ip: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    #[serde(default)]
    pub allow_privilege_escalation: bool,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub default_limits: ResourceLimits,
    #[serde(default)]
    pub min_limits: ResourceLimits,
    #[serde(default)]
    pub max_limits: ResourceLimits,
    #[serde(default = "default_max_services_per_pod")]
    pub max_services_per_pod: i32,
    #[serde(default)]
    pub await_shutdown_pod: bool,
    #[serde(default)]
    pub host_aliases: Vec<HostAliasConfig>,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubeconfig: None,
            context: None,
            service_account: String::new(),
            registry: RegistryConfig::default(),
            image_pull_secrets: Vec::new(),
            allow_privilege_escalation: false,
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            environment: HashMap::new(),
            default_limits: ResourceLimits::default(),
            min_limits: ResourceLimits::default(),
            max_limits: ResourceLimits::default(),
            max_services_per_pod: default_max_services_per_pod(),
            await_shutdown_pod: false,
            host_aliases: Vec::new(),
            pull_policy: PullPolicy::default(),
        }
    }
}

fn default_id() -> String {
    format!("ant-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

fn default_user_agent() -> String {
    format!("ants/{}", env!("CARGO_PKG_VERSION"))
}

fn default_methods() -> Vec<TaskMethod> {
    vec![TaskMethod::Shell]
}

fn default_max_capacity() -> i32 {
    10
}

fn default_output_limit() -> i64 {
    64 * 1024 * 1024
}

fn default_shell() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        DEFAULT_SHELL_PROBE.to_string(),
    ]
}

fn default_poll_interval() -> i64 {
    3
}

fn default_poll_timeout() -> i64 {
    500
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_max_job_timeout() -> u64 {
    2 * 60 * 60
}

fn default_registration_interval() -> u64 {
    5
}

fn default_container_prefix() -> String {
    "ants-".to_string()
}

fn default_recently_completed_capacity() -> usize {
    1000
}

fn default_registration_topic() -> String {
    "ants-topic-registration".to_string()
}

fn default_container_lifecycle_topic() -> String {
    "ants-topic-container-lifecycle".to_string()
}

fn default_recently_completed_jobs_topic() -> String {
    "ants-topic-recently-completed-jobs".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_max_services_per_pod() -> i32 {
    10
}

impl Default for AntConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            user_agent: default_user_agent(),
            debug: false,
            tags: Vec::new(),
            methods: default_methods(),
            max_capacity: default_max_capacity(),
            output_limit: default_output_limit(),
            default_shell: default_shell(),
            poll_interval_secs: default_poll_interval(),
            poll_timeout_secs: default_poll_timeout(),
            termination_grace_period_secs: 0,
            await_running_period_secs: 0,
            container_reaper_interval_secs: default_reaper_interval(),
            max_job_timeout_secs: default_max_job_timeout(),
            registration_interval_secs: default_registration_interval(),
            container_prefix: default_container_prefix(),
            recently_completed_jobs_capacity: default_recently_completed_capacity(),
            clock_skew_tolerance_secs: 0,
            registration_topic: default_registration_topic(),
            container_lifecycle_topic: default_container_lifecycle_topic(),
            recently_completed_jobs_topic: default_recently_completed_jobs_topic(),
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
            started_at: Utc::now(),
        }
    }
}

impl AntConfig {
    /// Load config from the default path (~/.config/ants/ant.yaml).
    pub fn load_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: AntConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("ants")
            .join("ant.yaml")
    }

    /// Normalizes out-of-range values and rejects unusable ones.
    pub fn validate(&mut self) -> Result<(), AntError> {
        if self.id.is_empty() {
            return Err(AntError::Config("ant id is not specified".into()));
        }
        if self.methods.is_empty() {
            return Err(AntError::Config("methods are not specified".into()));
        }
        if self.container_prefix.is_empty() {
            return Err(AntError::Config("container prefix is not specified".into()));
        }
        if self.max_capacity <= 0 {
            self.max_capacity = default_max_capacity();
        }
        if self.output_limit <= 0 {
            self.output_limit = default_output_limit();
        }
        if self.default_shell.is_empty() {
            self.default_shell = default_shell();
        }
        if self.recently_completed_jobs_capacity == 0 {
            self.recently_completed_jobs_capacity = default_recently_completed_capacity();
        }
        if self.kubernetes.max_services_per_pod <= 0 {
            self.kubernetes.max_services_per_pod = default_max_services_per_pod();
        }
        Ok(())
    }

    /// Interval between readiness and status polls, clamped to 1..=30 seconds.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.clamp(1, 30) as u64)
    }

    /// Number of polls before readiness gives up.
    pub fn poll_timeout(&self) -> i64 {
        if self.poll_timeout_secs <= 0 {
            default_poll_timeout()
        } else {
            self.poll_timeout_secs
        }
    }

    pub fn termination_grace_period(&self) -> Duration {
        match self.termination_grace_period_secs {
            0 => Duration::from_secs(5),
            secs => Duration::from_secs(secs.min(5 * 60)),
        }
    }

    pub fn await_running_period(&self) -> Duration {
        match self.await_running_period_secs {
            0 => Duration::from_secs(10 * 60),
            secs => Duration::from_secs(secs.min(30 * 60)),
        }
    }

    pub fn container_reaper_interval(&self) -> Duration {
        Duration::from_secs(self.container_reaper_interval_secs.max(1))
    }

    pub fn max_job_timeout(&self) -> Duration {
        Duration::from_secs(self.max_job_timeout_secs)
    }

    pub fn registration_interval(&self) -> Duration {
        Duration::from_secs(self.registration_interval_secs.max(1))
    }

    pub fn clock_skew_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_tolerance_secs as i64)
    }

    /// Topic this ant receives task requests on.
    pub fn request_topic(&self) -> String {
        format!("ants-topic-ant-request-{}", self.id)
    }

    /// Heartbeat describing this ant, stamped now.
    pub fn new_registration(&self) -> AntRegistration {
        AntRegistration {
            ant_id: self.id.clone(),
            ant_topic: self.request_topic(),
            max_capacity: self.max_capacity,
            tags: self.tags.clone(),
            methods: self.methods.clone(),
            current_load: 0,
            total_executed: 0,
            allocations: HashMap::new(),
            created_at: Utc::now(),
            ant_started_at: self.started_at,
            auto_refresh: true,
            received_at: None,
        }
    }
}
