use crate::error::AntError;
use crate::types::{make_dns1123_compatible, TaskMethod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Description of one task run, handed to a provider when building an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorOptions {
    pub name: String,
    pub method: Option<TaskMethod>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub helper_environment: HashMap<String, String>,
    #[serde(default, rename = "working_dir")]
    pub working_directory: String,
    #[serde(default, rename = "artifacts_dir")]
    pub artifacts_directory: String,
    #[serde(default, rename = "cache_dir")]
    pub cache_directory: String,
    #[serde(default)]
    pub dependent_artifact_ids: Vec<String>,
    #[serde(default, rename = "container")]
    pub main_container: ContainerDefinition,
    #[serde(default, rename = "helper")]
    pub helper_container: ContainerDefinition,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// Toleration key to `"value:effect"` or `"effect"`.
    #[serde(default)]
    pub node_tolerations: HashMap<String, String>,
    #[serde(default)]
    pub pod_labels: HashMap<String, String>,
    #[serde(default)]
    pub pod_annotations: HashMap<String, String>,
    #[serde(default)]
    pub network_mode: String,
    #[serde(default)]
    pub host_network: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, rename = "query")]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub report_stdout: bool,
    #[serde(default)]
    pub cost_factor: f64,
    /// Filled in by the Kubernetes adapter once the pod resources are known.
    #[serde(default)]
    pub applied_cost: f64,
    #[serde(default)]
    pub execute_command_without_shell: bool,
    #[serde(default)]
    pub debug: bool,
}

impl ExecutorOptions {
    pub fn new(name: &str, method: TaskMethod) -> Self {
        Self {
            name: make_dns1123_compatible(name),
            method: Some(method),
            environment: HashMap::new(),
            helper_environment: HashMap::new(),
            working_directory: String::new(),
            artifacts_directory: String::new(),
            cache_directory: String::new(),
            dependent_artifact_ids: Vec::new(),
            main_container: ContainerDefinition::default(),
            helper_container: ContainerDefinition::default(),
            services: Vec::new(),
            privileged: false,
            node_selector: HashMap::new(),
            node_tolerations: HashMap::new(),
            pod_labels: HashMap::new(),
            pod_annotations: HashMap::new(),
            network_mode: String::new(),
            host_network: false,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            report_stdout: false,
            cost_factor: 0.0,
            applied_cost: 0.0,
            execute_command_without_shell: false,
            debug: false,
        }
    }

    pub fn method(&self) -> Result<TaskMethod, AntError> {
        self.method.ok_or_else(|| {
            AntError::Validation("method is not specified in executor-options".to_string())
        })
    }

    pub fn validate(&self) -> Result<(), AntError> {
        self.method()?;
        if self.name.is_empty() {
            return Err(AntError::Validation(
                "name is not specified in executor-options".to_string(),
            ));
        }
        Ok(())
    }

    /// Environment as `NAME=VALUE` pairs, sorted for stable output.
    pub fn environment_pairs(env: &HashMap<String, String>) -> Vec<String> {
        let mut pairs: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort();
        pairs
    }
}

impl std::fmt::Display for ExecutorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Name={} Labels={:?} DependentArtifacts={} Main={}",
            self.name,
            self.pod_labels,
            self.dependent_artifact_ids.len(),
            self.main_container
        )
    }
}

/// Applies an `env NAME=VALUE` command to `env`. Returns false for any other command.
pub fn add_from_env_command(env: &mut HashMap<String, String>, cmd: &str) -> bool {
    let Some(rest) = cmd.strip_prefix("env ") else {
        return false;
    };
    let parts: Vec<&str> = rest.split('=').collect();
    if parts.len() != 2 {
        return false;
    }
    env.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
    true
}

/// Image, volumes and resources of the main or helper container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDefinition {
    #[serde(default)]
    pub image: String,
    /// Docker volumes: `name -> target`, or `target -> source` for keys containing `bind-mount`.
    #[serde(default)]
    pub volumes: HashMap<String, String>,
    #[serde(default)]
    pub kubernetes_volumes: KubernetesVolumes,
    #[serde(default)]
    pub volumes_from: Vec<String>,
    #[serde(default, rename = "bind_dir")]
    pub bind_directory: String,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub cpu_request: String,
    #[serde(default)]
    pub memory_limit: String,
    #[serde(default)]
    pub memory_request: String,
    #[serde(default)]
    pub ephemeral_storage_limit: String,
    #[serde(default)]
    pub ephemeral_storage_request: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
}

impl ContainerDefinition {
    pub fn with_image(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..Self::default()
        }
    }

    pub fn has_docker_volumes(&self) -> bool {
        !self.volumes.is_empty()
    }

    pub fn add_empty_kubernetes_volume(&mut self, name: &str, mount_path: &str) {
        self.kubernetes_volumes.add_empty_volume(name, mount_path);
    }
}

impl std::fmt::Display for ContainerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Image={} CPU={}/{} Memory={}/{}",
            self.image, self.cpu_limit, self.cpu_request, self.memory_limit, self.memory_request
        )
    }
}

/// Sidecar service started next to the main container of a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub volumes: KubernetesVolumes,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub instances: i32,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub cpu_request: String,
    #[serde(default)]
    pub memory_limit: String,
    #[serde(default)]
    pub memory_request: String,
    #[serde(default)]
    pub ephemeral_storage_limit: String,
    #[serde(default)]
    pub ephemeral_storage_request: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Port {
    pub number: i32,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesVolumes {
    #[serde(default)]
    pub host_path: Vec<HostPathVolume>,
    #[serde(default)]
    pub pvc: Vec<PvcVolume>,
    #[serde(default)]
    pub config_map: Vec<ConfigMapVolume>,
    #[serde(default)]
    pub secret: Vec<SecretVolume>,
    #[serde(default)]
    pub empty_dir: Vec<EmptyDirVolume>,
}

impl KubernetesVolumes {
    pub fn is_empty(&self) -> bool {
        self.host_path.is_empty()
            && self.pvc.is_empty()
            && self.config_map.is_empty()
            && self.secret.is_empty()
            && self.empty_dir.is_empty()
    }

    pub fn add_empty_volume(&mut self, name: &str, mount_path: &str) {
        self.empty_dir.push(EmptyDirVolume {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            ..EmptyDirVolume::default()
        });
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostPathVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub host_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PvcVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigMapVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub items: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub items: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyDirVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub size_limit: String,
}
