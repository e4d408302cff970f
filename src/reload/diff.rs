//! Structural config diffing for hot reload and update classification.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::models::ModelConfig;

/// Field paths that can change without restarting the instance.
const LIVE_APPLICABLE: &[&str] = &["name", "priority", "health_check", "retry_policy"];

/// Dotted paths of every field that differs between two configs.
///
/// `updated_at` is ignored: it changes on every persist and carries no
/// semantic difference.
pub fn change_fields(old: &ModelConfig, new: &ModelConfig) -> BTreeSet<String> {
    let old_value = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_value = serde_json::to_value(new).unwrap_or(Value::Null);

    let mut fields = BTreeSet::new();
    diff_value("", &old_value, &new_value, &mut fields);
    fields.remove("updated_at");
    fields
}

/// Two configs are semantically equal when nothing but `updated_at`
/// differs.
pub fn configs_differ(old: &ModelConfig, new: &ModelConfig) -> bool {
    !change_fields(old, new).is_empty()
}

/// True when any changed field falls outside the live-applicable set.
pub fn requires_restart(fields: &BTreeSet<String>) -> bool {
    fields.iter().any(|field| {
        !LIVE_APPLICABLE
            .iter()
            .any(|live| field == live || field.starts_with(&format!("{live}.")))
    })
}

fn diff_value(prefix: &str, old: &Value, new: &Value, fields: &mut BTreeSet<String>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match (old_map.get(key), new_map.get(key)) {
                    (Some(o), Some(n)) => diff_value(&path, o, n, fields),
                    _ => {
                        fields.insert(path);
                    }
                }
            }
        }
        (o, n) if o != n => {
            fields.insert(prefix.to_string());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Framework, HealthCheckConfig, ResourceRequirement, RetryPolicy};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn config() -> ModelConfig {
        ModelConfig {
            id: "diff-test".to_string(),
            name: "diff-test".to_string(),
            framework: Framework::NativeServer,
            model_path: "/models/test.gguf".to_string(),
            priority: 5,
            gpu_devices: vec![0],
            parameters: BTreeMap::from([("port".to_string(), serde_json::json!(8080))]),
            additional_parameters: None,
            resource_requirements: ResourceRequirement {
                gpu_memory: 4096,
                gpu_devices: vec![0],
                cpu_cores: None,
                system_memory: None,
            },
            health_check: HealthCheckConfig::default(),
            retry_policy: RetryPolicy::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_identical_configs_do_not_differ() {
        let old = config();
        let mut new = old.clone();
        new.updated_at = Utc::now() + chrono::Duration::seconds(10);
        assert!(!configs_differ(&old, &new));
        assert!(change_fields(&old, &new).is_empty());
    }

    #[test]
    fn test_top_level_changes_detected() {
        let old = config();
        let mut new = old.clone();
        new.name = "renamed".to_string();
        new.priority = 8;

        let fields = change_fields(&old, &new);
        assert!(fields.contains("name"));
        assert!(fields.contains("priority"));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_nested_changes_have_dotted_paths() {
        let old = config();
        let mut new = old.clone();
        new.health_check.interval = 60;
        new.parameters
            .insert("port".to_string(), serde_json::json!(9090));

        let fields = change_fields(&old, &new);
        assert!(fields.contains("health_check.interval"));
        assert!(fields.contains("parameters.port"));
    }

    #[test]
    fn test_added_and_removed_keys_detected() {
        let old = config();
        let mut new = old.clone();
        new.parameters
            .insert("ctx_size".to_string(), serde_json::json!(4096));

        let fields = change_fields(&old, &new);
        assert!(fields.contains("parameters.ctx_size"));
    }

    #[test]
    fn test_live_applicable_changes_do_not_require_restart() {
        let fields: BTreeSet<String> = ["name", "priority", "health_check.interval", "retry_policy.max_attempts"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(!requires_restart(&fields));
    }

    #[test]
    fn test_structural_changes_require_restart() {
        for field in [
            "framework",
            "model_path",
            "gpu_devices",
            "parameters.port",
            "additional_parameters",
            "resource_requirements.gpu_memory",
        ] {
            let fields: BTreeSet<String> = [field.to_string()].into_iter().collect();
            assert!(requires_restart(&fields), "{field} should require restart");
        }
    }

    #[test]
    fn test_empty_change_set_requires_nothing() {
        assert!(!requires_restart(&BTreeSet::new()));
    }
}
