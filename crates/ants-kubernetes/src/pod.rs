//! Builds the pod (services, main container, optional helper) that backs one
//! Kubernetes executor, plus the cluster objects that go with it.

use crate::resources::{create_resource_list, ResourceList};
use ants_core::config::{AntConfig, HostAliasConfig, KubernetesConfig};
use ants_core::error::AntError;
use ants_core::options::{ExecutorOptions, KubernetesVolumes, Port, Service};
use ants_core::types::make_dns1123_compatible;
use k8s_openapi::api::core::v1::{Pod, Secret, Service as KubeService};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Label linking per-task services to their pod.
pub const POD_LABEL: &str = "ants-pod";

const DEFAULT_CAP_DROP: [&str; 1] = ["NET_RAW"];
const SERVICES_HOST_IP: &str = "127.0.0.1";

/// Everything derived from one set of executor options.
#[derive(Debug, Clone)]
pub struct PodBuild {
    pub pod: Pod,
    /// Cluster services for sidecars that expose ports.
    pub services: Vec<KubeService>,
    pub service_names: Vec<String>,
    pub alias_names: Vec<String>,
    /// Main and service requests relative to the default limits.
    pub cost: f64,
}

/// `command` becomes the container args when an entrypoint is set.
pub fn command_and_args(command: &[String], entrypoint: &[String]) -> (Vec<String>, Vec<String>) {
    if entrypoint.is_empty() {
        (command.to_vec(), Vec::new())
    } else {
        (entrypoint.to_vec(), command.to_vec())
    }
}

/// `NET_RAW` is dropped unless re-added; explicit drops win over adds.
pub fn capabilities(cap_add: &[String], cap_drop: &[String]) -> (Vec<String>, Vec<String>) {
    let mut enabled: BTreeMap<String, bool> = BTreeMap::new();
    for cap in DEFAULT_CAP_DROP {
        enabled.insert(cap.to_string(), false);
    }
    for cap in cap_add {
        enabled.insert(cap.clone(), true);
    }
    for cap in cap_drop {
        enabled.insert(cap.clone(), false);
    }
    let add = enabled
        .iter()
        .filter(|(_, on)| **on)
        .map(|(cap, _)| cap.clone())
        .collect();
    let drop = enabled
        .iter()
        .filter(|(_, on)| !**on)
        .map(|(cap, _)| cap.clone())
        .collect();
    (add, drop)
}

pub fn is_dns1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Hostnames a sidecar answers to: its name without registry port or tag,
/// with `/` turned into `-`.
fn service_aliases(name: &str) -> Vec<String> {
    let without_tag = match name.rsplit_once(':') {
        Some((head, tag)) if !tag.contains('/') => head,
        _ => name,
    };
    let alias = without_tag.replace('/', "-");
    if is_dns1123_subdomain(&alias) {
        vec![alias]
    } else {
        Vec::new()
    }
}

/// Sidecars without ports are reachable on localhost under their aliases.
pub fn host_aliases(
    services: &[Service],
    configured: &[HostAliasConfig],
) -> Result<Vec<HostAliasConfig>, AntError> {
    let mut hostnames = Vec::new();
    for service in services.iter().filter(|s| s.ports.is_empty()) {
        hostnames.extend(service_aliases(&service.name));
        if service.alias.is_empty() {
            continue;
        }
        if !is_dns1123_subdomain(&service.alias) {
            return Err(AntError::Validation(format!(
                "provided host alias {} for service {} is invalid DNS",
                service.alias, service.name
            )));
        }
        hostnames.push(service.alias.clone());
    }

    let mut aliases = Vec::new();
    if !hostnames.is_empty() {
        aliases.push(HostAliasConfig {
            ip: SERVICES_HOST_IP.to_string(),
            hostnames,
        });
    }
    aliases.extend(configured.iter().cloned());
    Ok(aliases)
}

fn tolerations(node_tolerations: &HashMap<String, String>) -> Vec<Value> {
    let mut keys: Vec<&String> = node_tolerations.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|key| {
            let spec = &node_tolerations[key];
            match spec.split_once(':') {
                Some((value, effect)) => json!({
                    "key": key, "operator": "Equal", "value": value, "effect": effect,
                }),
                None if spec.is_empty() => json!({"key": key, "operator": "Exists"}),
                None => json!({"key": key, "operator": "Exists", "effect": spec}),
            }
        })
        .collect()
}

fn key_to_paths(items: &HashMap<String, String>) -> Vec<Value> {
    let sorted: BTreeMap<&String, &String> = items.iter().collect();
    sorted
        .into_iter()
        .map(|(key, path)| json!({"key": key, "path": path}))
        .collect()
}

/// Appends the pod volumes declared in `kv`, skipping names already present.
fn add_volumes(kv: &KubernetesVolumes, volumes: &mut Vec<Value>, seen: &mut BTreeSet<String>) {
    let mut push = |name: &str, volume: Value| {
        if seen.insert(name.to_string()) {
            volumes.push(volume);
        }
    };
    for v in &kv.host_path {
        let path = if v.host_path.is_empty() {
            &v.mount_path
        } else {
            &v.host_path
        };
        push(&v.name, json!({"name": v.name, "hostPath": {"path": path}}));
    }
    for v in &kv.secret {
        let mut source = json!({"secretName": v.name});
        if !v.items.is_empty() {
            source["items"] = Value::Array(key_to_paths(&v.items));
        }
        push(&v.name, json!({"name": v.name, "secret": source}));
    }
    for v in &kv.pvc {
        push(
            &v.name,
            json!({"name": v.name, "persistentVolumeClaim": {"claimName": v.name, "readOnly": v.read_only}}),
        );
    }
    for v in &kv.config_map {
        let mut source = json!({"name": v.name});
        if !v.items.is_empty() {
            source["items"] = Value::Array(key_to_paths(&v.items));
        }
        push(&v.name, json!({"name": v.name, "configMap": source}));
    }
    for v in &kv.empty_dir {
        let mut source = Map::new();
        if !v.medium.is_empty() {
            source.insert("medium".into(), json!(v.medium));
        }
        if !v.size_limit.is_empty() {
            source.insert("sizeLimit".into(), json!(v.size_limit));
        }
        push(&v.name, json!({"name": v.name, "emptyDir": source}));
    }
}

fn volume_mounts(kv: &KubernetesVolumes) -> Vec<Value> {
    let mut mounts = Vec::new();
    let mut seen = BTreeSet::new();
    let mut push = |name: &str, mount_path: &str, sub_path: &str, read_only: bool| {
        if !seen.insert(mount_path.to_string()) {
            return;
        }
        let mut mount = json!({"name": name, "mountPath": mount_path, "readOnly": read_only});
        if !sub_path.is_empty() {
            mount["subPath"] = json!(sub_path);
        }
        mounts.push(mount);
    };
    for v in &kv.host_path {
        push(&v.name, &v.mount_path, &v.sub_path, v.read_only);
    }
    for v in &kv.secret {
        push(&v.name, &v.mount_path, &v.sub_path, v.read_only);
    }
    for v in &kv.pvc {
        push(&v.name, &v.mount_path, &v.sub_path, v.read_only);
    }
    for v in &kv.config_map {
        push(&v.name, &v.mount_path, &v.sub_path, v.read_only);
    }
    for v in &kv.empty_dir {
        push(&v.name, &v.mount_path, &v.sub_path, false);
    }
    mounts
}

fn container_ports(ports: &[Port]) -> Vec<Value> {
    ports
        .iter()
        .map(|port| {
            let mut value = json!({"containerPort": port.number});
            if !port.protocol.is_empty() {
                value["protocol"] = json!(port.protocol.to_uppercase());
            }
            if !port.name.is_empty() {
                value["name"] = json!(port.name);
            }
            value
        })
        .collect()
}

/// Cluster environment, then task environment, then per-instance extras.
fn environment(
    config: &KubernetesConfig,
    env: &HashMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> Vec<Value> {
    let mut merged: BTreeMap<&String, &String> = config.environment.iter().collect();
    merged.extend(env.iter());
    merged.extend(extra.iter());
    merged
        .into_iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect()
}

struct ContainerSpec<'a> {
    name: &'a str,
    working_dir: &'a str,
    image: &'a str,
    command: &'a [String],
    entrypoint: &'a [String],
    ports: &'a [Port],
    requests: ResourceList,
    limits: ResourceList,
    mounts: Vec<Value>,
    env: Vec<Value>,
}

fn container(config: &KubernetesConfig, spec: ContainerSpec<'_>, privileged: bool) -> Value {
    let (command, args) = command_and_args(spec.command, spec.entrypoint);
    let (add, drop) = capabilities(&config.cap_add, &config.cap_drop);
    let mut container = json!({
        "name": spec.name,
        "image": spec.image,
        "imagePullPolicy": config.pull_policy.kubernetes(),
        "env": spec.env,
        "securityContext": {
            "privileged": privileged && config.allow_privilege_escalation,
            "allowPrivilegeEscalation": config.allow_privilege_escalation,
            "capabilities": {"add": add, "drop": drop},
        },
        "stdin": true,
    });
    if !command.is_empty() {
        container["command"] = json!(command);
    }
    if !args.is_empty() {
        container["args"] = json!(args);
    }
    if !spec.ports.is_empty() {
        container["ports"] = Value::Array(container_ports(spec.ports));
    }
    let mut resources = Map::new();
    if !spec.requests.is_empty() {
        resources.insert("requests".into(), spec.requests.to_json());
    }
    if !spec.limits.is_empty() {
        resources.insert("limits".into(), spec.limits.to_json());
    }
    if !resources.is_empty() {
        container["resources"] = Value::Object(resources);
    }
    if !spec.mounts.is_empty() {
        container["volumeMounts"] = Value::Array(spec.mounts);
    }
    if !spec.working_dir.is_empty() {
        container["workingDir"] = json!(spec.working_dir);
    }
    container
}

fn kube_service(namespace: &str, pod: &str, service: &str, ports: &[Port]) -> Result<KubeService, AntError> {
    let ports: Vec<Value> = ports
        .iter()
        .map(|port| {
            let name = if port.name.is_empty() {
                format!("port-{}", port.number)
            } else {
                port.name.clone()
            };
            let protocol = if port.protocol.is_empty() {
                "TCP".to_string()
            } else {
                port.protocol.to_uppercase()
            };
            json!({"name": name, "port": port.number, "targetPort": port.number, "protocol": protocol})
        })
        .collect();
    let mut selector = Map::new();
    selector.insert(POD_LABEL.to_string(), json!(pod));
    Ok(serde_json::from_value(json!({
        "metadata": {
            "name": make_dns1123_compatible(&format!("{}-{}", pod, service)),
            "namespace": namespace,
            "labels": selector,
        },
        "spec": {
            "selector": selector,
            "ports": ports,
        },
    }))?)
}

/// Assembles the pod for `opts`. Empty main or helper entrypoints fall back to
/// the configured default shell.
pub fn build_pod(
    config: &AntConfig,
    opts: &ExecutorOptions,
    credentials: Option<&str>,
) -> Result<PodBuild, AntError> {
    if opts.name.is_empty() {
        return Err(AntError::Validation(
            "container name in executor options not specified".to_string(),
        ));
    }
    if opts.main_container.image.is_empty() {
        return Err(AntError::Validation("image not specified".to_string()));
    }
    let kube = &config.kubernetes;

    let aliases = host_aliases(&opts.services, &kube.host_aliases).map_err(|err| {
        AntError::Validation(format!("failed to create host aliases due to {}", err))
    })?;
    let alias_names: Vec<String> = aliases
        .iter()
        .map(|a| format!("h:{:?}, ip={};", a.hostnames, a.ip))
        .collect();

    let mut containers = Vec::new();
    let mut volumes = Vec::new();
    let mut seen_volumes = BTreeSet::new();
    let mut service_names = Vec::new();
    let mut services = Vec::new();
    let mut total_cost = 0.0;

    for (i, service) in opts.services.iter().enumerate() {
        let base_name = if service.name.is_empty() {
            format!("svc-{}", i)
        } else {
            make_dns1123_compatible(&service.name)
        };
        let instances = service.instances.clamp(1, kube.max_services_per_pod.max(1));
        for j in 0..instances {
            let mut extra = BTreeMap::new();
            let name = if instances > 1 {
                extra.insert("SERVICE_INSTANCE".to_string(), j.to_string());
                extra.insert(
                    format!("{}_SERVICE_INSTANCE", base_name.to_uppercase()),
                    j.to_string(),
                );
                format!("{}-{}", base_name, j)
            } else {
                base_name.clone()
            };

            let (requests, cost) = create_resource_list(
                kube,
                &format!("service-request-{}", name),
                &service.cpu_request,
                &service.memory_request,
                &service.ephemeral_storage_request,
            )
            .map_err(|err| {
                AntError::Validation(format!(
                    "failed to create service request for {} due to {}",
                    name, err
                ))
            })?;
            let (limits, _) = create_resource_list(
                kube,
                &format!("service-limit-{}", name),
                &service.cpu_limit,
                &service.memory_limit,
                &service.ephemeral_storage_limit,
            )
            .map_err(|err| {
                AntError::Validation(format!(
                    "failed to create service limits for {} due to {}",
                    name, err
                ))
            })?;
            total_cost += cost;

            add_volumes(&service.volumes, &mut volumes, &mut seen_volumes);
            containers.push(container(
                kube,
                ContainerSpec {
                    name: &name,
                    working_dir: &service.working_directory,
                    image: &service.image,
                    command: &service.command,
                    entrypoint: &service.entrypoint,
                    ports: &service.ports,
                    requests,
                    limits,
                    mounts: volume_mounts(&service.volumes),
                    env: environment(kube, &opts.environment, &extra),
                },
                opts.privileged,
            ));
            if !service.ports.is_empty() {
                services.push(kube_service(&kube.namespace, &opts.name, &name, &service.ports)?);
            }
            service_names.push(name);
        }
    }

    let main = &opts.main_container;
    let (requests, cost) = create_resource_list(
        kube,
        "request",
        &main.cpu_request,
        &main.memory_request,
        &main.ephemeral_storage_request,
    )
    .map_err(|err| {
        AntError::Validation(format!(
            "failed to create main resource for {} due to {}",
            opts.name, err
        ))
    })?;
    let (limits, _) = create_resource_list(
        kube,
        "limit",
        &main.cpu_limit,
        &main.memory_limit,
        &main.ephemeral_storage_limit,
    )
    .map_err(|err| {
        AntError::Validation(format!(
            "failed to create main limit for {} due to {}",
            opts.name, err
        ))
    })?;
    total_cost += cost;
    let main_entrypoint = if main.entrypoint.is_empty() {
        &config.default_shell
    } else {
        &main.entrypoint
    };
    add_volumes(&main.kubernetes_volumes, &mut volumes, &mut seen_volumes);
    containers.push(container(
        kube,
        ContainerSpec {
            name: &opts.name,
            working_dir: &opts.working_directory,
            image: &main.image,
            command: &main.command,
            entrypoint: main_entrypoint,
            ports: &[],
            requests,
            limits,
            mounts: volume_mounts(&main.kubernetes_volumes),
            env: environment(kube, &opts.environment, &BTreeMap::new()),
        },
        opts.privileged,
    ));

    let helper = &opts.helper_container;
    if !helper.image.is_empty() {
        let helper_name = format!("{}-helper", opts.name);
        let (requests, _) = create_resource_list(
            kube,
            "helper-request",
            &helper.cpu_request,
            &helper.memory_request,
            &helper.ephemeral_storage_request,
        )
        .map_err(|err| {
            AntError::Validation(format!(
                "failed to create helper resource for {} due to {}",
                helper_name, err
            ))
        })?;
        let (limits, _) = create_resource_list(
            kube,
            "helper-limit",
            &helper.cpu_limit,
            &helper.memory_limit,
            &helper.ephemeral_storage_limit,
        )
        .map_err(|err| {
            AntError::Validation(format!(
                "failed to create helper limit for {} due to {}",
                helper_name, err
            ))
        })?;
        let helper_entrypoint = if helper.entrypoint.is_empty() {
            &config.default_shell
        } else {
            &helper.entrypoint
        };
        add_volumes(&helper.kubernetes_volumes, &mut volumes, &mut seen_volumes);
        containers.push(container(
            kube,
            ContainerSpec {
                name: &helper_name,
                working_dir: "",
                image: &helper.image,
                command: &helper.command,
                entrypoint: helper_entrypoint,
                ports: &[],
                requests,
                limits,
                mounts: volume_mounts(&helper.kubernetes_volumes),
                env: environment(kube, &opts.helper_environment, &BTreeMap::new()),
            },
            opts.privileged,
        ));
    }

    let mut labels: BTreeMap<&str, &str> = opts
        .pod_labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    labels.insert(POD_LABEL, &opts.name);
    let mut pull_secrets: Vec<Value> = kube
        .image_pull_secrets
        .iter()
        .map(|name| json!({"name": name}))
        .collect();
    if let Some(secret) = credentials {
        pull_secrets.push(json!({"name": secret}));
    }
    let host_aliases: Vec<Value> = aliases
        .iter()
        .map(|a| json!({"ip": a.ip, "hostnames": a.hostnames}))
        .collect();

    let mut spec = json!({
        "restartPolicy": "Never",
        "containers": containers,
        "hostNetwork": opts.host_network,
        "terminationGracePeriodSeconds": config.termination_grace_period().as_secs(),
    });
    if !kube.service_account.is_empty() {
        spec["serviceAccountName"] = json!(kube.service_account);
    }
    if !opts.node_selector.is_empty() {
        spec["nodeSelector"] = json!(opts.node_selector);
    }
    if !opts.node_tolerations.is_empty() {
        spec["tolerations"] = Value::Array(tolerations(&opts.node_tolerations));
    }
    if !host_aliases.is_empty() {
        spec["hostAliases"] = Value::Array(host_aliases);
    }
    if !pull_secrets.is_empty() {
        spec["imagePullSecrets"] = Value::Array(pull_secrets);
    }
    if !volumes.is_empty() {
        spec["volumes"] = Value::Array(volumes);
    }

    let pod: Pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": opts.name,
            "namespace": kube.namespace,
            "labels": labels,
            "annotations": opts.pod_annotations,
        },
        "spec": spec,
    }))?;
    debug!(
        "Built pod {} services={:?} containers={} cost={}",
        opts.name,
        service_names,
        containers_len(&pod),
        total_cost
    );

    Ok(PodBuild {
        pod,
        services,
        service_names,
        alias_names,
        cost: total_cost,
    })
}

fn containers_len(pod: &Pod) -> usize {
    pod.spec.as_ref().map(|s| s.containers.len()).unwrap_or(0)
}

/// Docker registry credentials stored as a `kubernetes.io/dockercfg` secret.
pub fn registry_secret(config: &KubernetesConfig) -> Result<Secret, AntError> {
    let registry = &config.registry;
    let mut auth = Map::new();
    auth.insert(
        registry.server.clone(),
        json!({"Username": registry.username, "Password": registry.password}),
    );
    let auth = Value::Object(auth);
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "generateName": "credential-secret-",
            "namespace": config.namespace,
        },
        "type": "kubernetes.io/dockercfg",
        "stringData": {".dockercfg": auth.to_string()},
    }))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_and_args() {
        let cmd = vec!["redis-server".to_string()];
        let entry = vec!["sh".to_string(), "-c".to_string()];
        assert_eq!(command_and_args(&cmd, &[]), (cmd.clone(), vec![]));
        assert_eq!(command_and_args(&cmd, &entry), (entry.clone(), cmd.clone()));
    }

    #[test]
    fn test_capabilities_drop_net_raw_by_default() {
        assert_eq!(capabilities(&[], &[]), (vec![], vec!["NET_RAW".to_string()]));
        let (add, drop) = capabilities(
            &["NET_RAW".to_string(), "SYS_TIME".to_string()],
            &["SYS_TIME".to_string()],
        );
        assert_eq!(add, vec!["NET_RAW".to_string()]);
        assert_eq!(drop, vec!["SYS_TIME".to_string()]);
    }

    #[test]
    fn test_dns1123_subdomain() {
        assert!(is_dns1123_subdomain("redis"));
        assert!(is_dns1123_subdomain("db.local"));
        assert!(!is_dns1123_subdomain("Redis"));
        assert!(!is_dns1123_subdomain("-redis"));
        assert!(!is_dns1123_subdomain(""));
    }

    #[test]
    fn test_host_aliases_for_services_without_ports() {
        let services = vec![
            Service {
                name: "library/redis:6".into(),
                alias: "cache".into(),
                ..Service::default()
            },
            Service {
                name: "postgres".into(),
                ports: vec![Port {
                    number: 5432,
                    ..Port::default()
                }],
                ..Service::default()
            },
        ];
        let configured = vec![HostAliasConfig {
            ip: "10.0.0.1".into(),
            hostnames: vec!["registry".into()],
        }];
        let aliases = host_aliases(&services, &configured).unwrap();
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases[0].ip, "127.0.0.1");
        assert_eq!(aliases[0].hostnames, vec!["library-redis", "cache"]);
        assert_eq!(aliases[1].ip, "10.0.0.1");
    }

    #[test]
    fn test_host_aliases_reject_invalid_alias() {
        let services = vec![Service {
            name: "redis".into(),
            alias: "Bad_Alias".into(),
            ..Service::default()
        }];
        let err = host_aliases(&services, &[]).unwrap_err();
        assert!(err
            .to_string()
            .contains("provided host alias Bad_Alias for service redis is invalid DNS"));
    }

    #[test]
    fn test_tolerations() {
        let mut map = HashMap::new();
        map.insert("gpu".to_string(), "true:NoSchedule".to_string());
        map.insert("spot".to_string(), "NoExecute".to_string());
        let values = tolerations(&map);
        assert_eq!(values[0]["operator"], "Equal");
        assert_eq!(values[0]["value"], "true");
        assert_eq!(values[1]["operator"], "Exists");
        assert_eq!(values[1]["effect"], "NoExecute");
    }

    #[test]
    fn test_registry_secret() {
        let mut config = KubernetesConfig::default();
        config.registry.server = "registry.local".into();
        config.registry.username = "bot".into();
        config.registry.password = "pw".into();
        let secret = registry_secret(&config).unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockercfg"));
        let data = secret.string_data.unwrap();
        let cfg: Value = serde_json::from_str(&data[".dockercfg"]).unwrap();
        assert_eq!(cfg["registry.local"]["Username"], "bot");
    }
}
