//! Resource quantities such as `500m` or `1Gi`, and the min/max checks applied
//! to every container request and limit in a pod.

use ants_core::config::{KubernetesConfig, ResourceLimits};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

const CPU_COST_WEIGHT: f64 = 1_000_000_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("failed to parse {resource} {value} due to {reason}")]
    Parse {
        resource: &'static str,
        value: String,
        reason: String,
    },

    #[error("{resource} {kind} {value} is smaller than min-{resource} {min}")]
    BelowMin {
        resource: &'static str,
        kind: String,
        value: String,
        min: String,
    },

    #[error("{resource} {kind} {value} exceeds max-{resource} {max}")]
    AboveMax {
        resource: &'static str,
        kind: String,
        value: String,
        max: String,
    },
}

/// Parses a quantity into thousandths of its base unit, rounding up.
pub fn milli_value(quantity: &str) -> Result<i128, String> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err("empty quantity".to_string());
    }
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let multiplier: i128 = match suffix {
        "m" => 1,
        "" => 1_000,
        "k" => 1_000 * 1_000,
        "M" => 1_000 * 1_000_000,
        "G" => 1_000 * 1_000_000_000,
        "T" => 1_000 * 1_000_000_000_000,
        "P" => 1_000 * 1_000_000_000_000_000,
        "E" => 1_000 * 1_000_000_000_000_000_000,
        "Ki" => 1_000 << 10,
        "Mi" => 1_000 << 20,
        "Gi" => 1_000 << 30,
        "Ti" => 1_000 << 40,
        "Pi" => 1_000 << 50,
        "Ei" => 1_000 << 60,
        other => return Err(format!("unknown suffix '{}'", other)),
    };

    let negative = number.starts_with('-');
    let digits = number.trim_start_matches(['+', '-']);
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    let valid = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !valid(whole) || !valid(fraction) {
        return Err(format!("invalid number '{}'", number));
    }
    if fraction.len() > 18 {
        return Err(format!("too many fraction digits in '{}'", number));
    }
    let mantissa: i128 = format!("{}{}", whole, fraction)
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", number, e))?;
    let scale = 10i128.pow(fraction.len() as u32);
    let value = mantissa
        .checked_mul(multiplier)
        .and_then(|v| v.checked_add(scale - 1))
        .ok_or_else(|| format!("quantity too large '{}'", quantity))?
        / scale;
    Ok(if negative { -value } else { value })
}

/// Requests or limits of one container, keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceList {
    quantities: BTreeMap<String, (String, i128)>,
}

impl ResourceList {
    /// Empty strings and zero quantities are left out of the list.
    pub fn parse(cpu: &str, memory: &str, ephemeral_storage: &str) -> Result<Self, ResourceError> {
        let mut list = ResourceList::default();
        for (name, raw) in [
            (CPU, cpu),
            (MEMORY, memory),
            (EPHEMERAL_STORAGE, ephemeral_storage),
        ] {
            if raw.trim().is_empty() {
                continue;
            }
            let milli = milli_value(raw).map_err(|reason| ResourceError::Parse {
                resource: name,
                value: raw.to_string(),
                reason,
            })?;
            if milli != 0 {
                list.quantities
                    .insert(name.to_string(), (raw.trim().to_string(), milli));
            }
        }
        Ok(list)
    }

    /// Config limits that fail to parse are ignored with a warning.
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        let mut list = ResourceList::default();
        for (name, raw) in [
            (CPU, &limits.cpu),
            (MEMORY, &limits.memory),
            (EPHEMERAL_STORAGE, &limits.ephemeral_storage),
        ] {
            if raw.trim().is_empty() {
                continue;
            }
            match milli_value(raw) {
                Ok(0) => {}
                Ok(milli) => {
                    list.quantities
                        .insert(name.to_string(), (raw.trim().to_string(), milli));
                }
                Err(reason) => warn!("Ignoring configured {} limit {}: {}", name, raw, reason),
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.quantities.is_empty()
    }

    pub fn milli(&self, name: &str) -> i128 {
        self.quantities.get(name).map(|(_, milli)| *milli).unwrap_or(0)
    }

    pub fn quantity(&self, name: &str) -> Option<&str> {
        self.quantities.get(name).map(|(raw, _)| raw.as_str())
    }

    /// Weight of this list relative to `defaults`; CPU dominates memory and storage.
    pub fn cost(&self, defaults: &ResourceList) -> f64 {
        let weight = |list: &ResourceList| {
            list.milli(CPU) as f64 * CPU_COST_WEIGHT
                + list.milli(MEMORY) as f64
                + list.milli(EPHEMERAL_STORAGE) as f64
        };
        let default_weight = weight(defaults);
        if default_weight == 0.0 {
            return 0.0;
        }
        weight(self) / default_weight
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .quantities
            .iter()
            .map(|(name, (raw, _))| (name.clone(), Value::String(raw.clone())))
            .collect();
        Value::Object(map)
    }
}

/// Parses one request or limit and checks it against the configured min and
/// max. Returns the list and its cost relative to the configured defaults.
pub fn create_resource_list(
    config: &KubernetesConfig,
    kind: &str,
    cpu: &str,
    memory: &str,
    ephemeral_storage: &str,
) -> Result<(ResourceList, f64), ResourceError> {
    let list = ResourceList::parse(cpu, memory, ephemeral_storage)?;
    let min = ResourceList::from_limits(&config.min_limits);
    let max = ResourceList::from_limits(&config.max_limits);

    for (name, label, raw) in [
        (CPU, "cpu", cpu),
        (MEMORY, "memory", memory),
        (EPHEMERAL_STORAGE, "storage", ephemeral_storage),
    ] {
        let value = list.milli(name);
        if value == 0 {
            continue;
        }
        if let Some(floor) = min.quantity(name) {
            if value < min.milli(name) {
                return Err(ResourceError::BelowMin {
                    resource: label,
                    kind: kind.to_string(),
                    value: raw.to_string(),
                    min: floor.to_string(),
                });
            }
        }
        if let Some(ceiling) = max.quantity(name) {
            if value > max.milli(name) {
                return Err(ResourceError::AboveMax {
                    resource: label,
                    kind: kind.to_string(),
                    value: raw.to_string(),
                    max: ceiling.to_string(),
                });
            }
        }
    }

    let cost = list.cost(&ResourceList::from_limits(&config.default_limits));
    Ok((list, cost))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(cpu: &str, memory: &str) -> ResourceLimits {
        ResourceLimits {
            cpu: cpu.to_string(),
            memory: memory.to_string(),
            ephemeral_storage: String::new(),
        }
    }

    #[test]
    fn test_milli_value() {
        assert_eq!(milli_value("500m").unwrap(), 500);
        assert_eq!(milli_value("2").unwrap(), 2_000);
        assert_eq!(milli_value("1.5").unwrap(), 1_500);
        assert_eq!(milli_value("1Ki").unwrap(), 1_024_000);
        assert_eq!(milli_value("1Gi").unwrap(), 1_073_741_824_000);
        assert_eq!(milli_value("1G").unwrap(), 1_000_000_000_000);
        assert_eq!(milli_value("0.1m").unwrap(), 1);
        assert!(milli_value("abc").is_err());
        assert!(milli_value("1Qi").is_err());
        assert!(milli_value("").is_err());
    }

    #[test]
    fn test_milli_value_too_large() {
        let err = milli_value("100000000000000000000000000E").unwrap_err();
        assert!(err.starts_with("quantity too large"));
        assert!(milli_value("170141183460469231731687303715884105727Ei").is_err());

        let err = ResourceList::parse("", "100000000000000000000000000E", "").unwrap_err();
        assert!(matches!(err, ResourceError::Parse { resource: MEMORY, .. }));
    }

    #[test]
    fn test_cost_of_huge_quantities_is_finite() {
        let defaults = ResourceList::parse("1", "", "").unwrap();
        let huge = ResourceList::parse("100000000000000000P", "", "").unwrap();
        let cost = huge.cost(&defaults);
        assert!(cost.is_finite());
        assert!(cost > 1.0);
    }

    #[test]
    fn test_parse_skips_empty_and_zero() {
        let list = ResourceList::parse("250m", "", "0").unwrap();
        assert_eq!(list.quantity(CPU), Some("250m"));
        assert_eq!(list.quantity(MEMORY), None);
        assert_eq!(list.quantity(EPHEMERAL_STORAGE), None);
        assert_eq!(list.to_json(), serde_json::json!({"cpu": "250m"}));
    }

    #[test]
    fn test_parse_error_names_resource() {
        let err = ResourceList::parse("", "lots", "").unwrap_err();
        assert!(err.to_string().starts_with("failed to parse memory lots due to"));
    }

    #[test]
    fn test_min_and_max_checks() {
        let mut config = KubernetesConfig::default();
        config.min_limits = limits("100m", "64Mi");
        config.max_limits = limits("2", "4Gi");

        let err = create_resource_list(&config, "request", "50m", "", "").unwrap_err();
        assert_eq!(err.to_string(), "cpu request 50m is smaller than min-cpu 100m");

        let err = create_resource_list(&config, "limit", "", "8Gi", "").unwrap_err();
        assert_eq!(err.to_string(), "memory limit 8Gi exceeds max-memory 4Gi");

        let (list, _) = create_resource_list(&config, "request", "1", "1Gi", "").unwrap();
        assert_eq!(list.quantity(CPU), Some("1"));
    }

    #[test]
    fn test_cost_relative_to_defaults() {
        let mut config = KubernetesConfig::default();
        let (_, cost) = create_resource_list(&config, "request", "1", "", "").unwrap();
        assert_eq!(cost, 0.0);

        config.default_limits = limits("500m", "");
        let (_, cost) = create_resource_list(&config, "request", "1", "", "").unwrap();
        assert!((cost - 2.0).abs() < 1e-9);
    }
}
