//! Job manifest model and repository consistency checks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::config::ResourceConfig;
use crate::error::{LifecycleError, LifecycleResult, ResultExt};
use crate::types::JobKey;

/// Error raised when the submitted manifest differs from the one committed to the repository.
pub const INCONSISTENT_MANIFEST: &str =
    "Submitted job manifest is not consistent with the file found in a repository. \
     Did you forget to git push?";

/// Git source of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitManifest {
    /// URL of the git remote.
    pub remote: String,
    /// Branch to build from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Subdirectory relative to the repository root.
    #[serde(default = "default_git_directory")]
    pub directory: String,
}

fn default_git_directory() -> String {
    ".".to_owned()
}

/// Docker-specific build settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerManifest {
    /// Path to a Dockerfile for custom images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
}

/// Resource demands of a job, in Kubernetes quantity notation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesManifest {
    /// Minimum memory, e.g. `256Mi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_min: Option<String>,
    /// Maximum memory, e.g. `1Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_max: Option<String>,
    /// Minimum CPU, e.g. `10m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_min: Option<String>,
    /// Maximum CPU, e.g. `1000m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_max: Option<String>,
}

/// Build recipe of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Job name.
    pub name: String,
    /// Job version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Email of the job owner.
    #[serde(default)]
    pub owner_email: String,
    /// Git source.
    pub git: GitManifest,
    /// Job type used to wrap the code.
    #[serde(default, alias = "lang", skip_serializing_if = "Option::is_none")]
    pub jobtype: Option<String>,
    /// Relative path to a base manifest this one overlays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Docker-specific settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerManifest>,
    /// Build-time environment variables.
    #[serde(default)]
    pub build_env: BTreeMap<String, String>,
    /// Runtime environment variables.
    #[serde(default)]
    pub runtime_env: BTreeMap<String, String>,
    /// File with secret build-time variables, kept client side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_build_env_file: Option<String>,
    /// File with secret runtime variables, kept client side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_runtime_env_file: Option<String>,
    /// Human metadata.
    #[serde(default)]
    pub labels: BTreeMap<String, Value>,
    /// Endpoints callable without authentication.
    #[serde(default)]
    pub public_endpoints: Vec<String>,
    /// Number of instances.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Resource demands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesManifest>,
    /// Infrastructure target to deploy to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_target: Option<String>,
    /// Job-type-specific settings and any other keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_version() -> String {
    "0.0.1".to_owned()
}

const fn default_replicas() -> u32 {
    1
}

impl Manifest {
    /// Parse and validate a manifest from YAML.
    pub fn from_yaml(yaml: &str) -> LifecycleResult<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)
            .map_err(|e| LifecycleError::validation(format!("invalid manifest YAML: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the fields the orchestrator depends on.
    pub fn validate(&self) -> LifecycleResult<()> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::validation("manifest field \"name\" is empty"));
        }
        if self.version.trim().is_empty() {
            return Err(LifecycleError::validation(
                "manifest field \"version\" is empty",
            ));
        }
        if self.git.remote.trim().is_empty() {
            return Err(LifecycleError::validation(
                "manifest field \"git.remote\" is empty",
            ));
        }
        if self.jobtype.is_none() && self.docker.is_none() {
            return Err(LifecycleError::validation(
                "manifest should declare \"jobtype\" or \"docker\" section",
            ));
        }
        if self.replicas == 0 {
            return Err(LifecycleError::validation("replicas should be at least 1"));
        }
        Ok(())
    }

    /// The `(name, version)` identity declared by the manifest.
    #[must_use]
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.name, &self.version)
    }
}

/// Resource limits resolved against configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedResources {
    /// Minimum memory.
    pub memory_min: String,
    /// Maximum memory.
    pub memory_max: String,
    /// Minimum CPU.
    pub cpu_min: String,
    /// Maximum CPU.
    pub cpu_max: String,
}

/// Fill missing resource demands with defaults and check them against the configured ceiling.
pub fn resolve_resources(
    manifest: &Manifest,
    config: &ResourceConfig,
) -> LifecycleResult<ResolvedResources> {
    let declared = manifest.resources.clone().unwrap_or_default();
    let resolved = ResolvedResources {
        memory_min: declared
            .memory_min
            .unwrap_or_else(|| config.default_memory_min.clone()),
        memory_max: declared
            .memory_max
            .unwrap_or_else(|| config.default_memory_max.clone()),
        cpu_min: declared
            .cpu_min
            .unwrap_or_else(|| config.default_cpu_min.clone()),
        cpu_max: declared
            .cpu_max
            .unwrap_or_else(|| config.default_cpu_max.clone()),
    };

    let memory_min = parse_quantity(&resolved.memory_min)?;
    let memory_max = parse_quantity(&resolved.memory_max)?;
    let memory_ceiling = parse_quantity(&config.max_job_memory_limit)?;
    if memory_min > memory_max {
        return Err(LifecycleError::validation(format!(
            "memory_min {} is greater than memory_max {}",
            resolved.memory_min, resolved.memory_max
        )));
    }
    if memory_max > memory_ceiling {
        return Err(LifecycleError::validation(format!(
            "memory_max {} exceeds the limit of {}",
            resolved.memory_max, config.max_job_memory_limit
        )));
    }
    if parse_quantity(&resolved.cpu_min)? > parse_quantity(&resolved.cpu_max)? {
        return Err(LifecycleError::validation(format!(
            "cpu_min {} is greater than cpu_max {}",
            resolved.cpu_min, resolved.cpu_max
        )));
    }

    Ok(resolved)
}

/// Parse a Kubernetes-style quantity (`256Mi`, `1G`, `500m`, `2`) into a plain number.
pub fn parse_quantity(quantity: &str) -> LifecycleResult<f64> {
    const SUFFIXES: [(&str, f64); 10] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("m", 1e-3),
    ];

    let quantity = quantity.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            quantity
                .strip_suffix(suffix)
                .map(|number| (number, *multiplier))
        })
        .unwrap_or((quantity, 1.0));

    number
        .parse::<f64>()
        .map(|n| n * multiplier)
        .map_err(|_| LifecycleError::validation(format!("invalid quantity: {quantity}")))
}

/// Manifest file found in a job's source repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryManifest {
    /// Raw YAML of the manifest file.
    pub content: String,
    /// Raw YAML of the base manifest named by `extends`, if any.
    pub base: Option<String>,
}

/// Verify that the submitted manifest matches the one committed to the repository.
///
/// Both documents are compared as YAML values after the repository manifest is
/// merged over its base, so formatting and key order don't matter.
pub fn verify_manifest_consistency(
    submitted_yaml: &str,
    repository: &RepositoryManifest,
) -> LifecycleResult<()> {
    let submitted = parse_yaml(submitted_yaml).context("parsing YAML manifest")?;
    let mut repo = parse_yaml(&repository.content).context("parsing YAML manifest")?;

    if let Some(base_yaml) = &repository.base {
        let base = parse_yaml(base_yaml).context("loading base manifest")?;
        if base.get("extends").is_some_and(|v| !v.is_null()) {
            return Err(LifecycleError::validation(
                "base manifest cannot extend another one",
            ))
            .context("extending base manifest with overlay");
        }
        repo = merge_values(base, repo);
        if let Value::Mapping(map) = &mut repo {
            map.insert(Value::from("extends"), Value::Null);
        }
    }

    if normalise(&submitted) != normalise(&repo) {
        info!(
            differing_keys = ?differing_keys(&repo, &submitted),
            "submitted manifest differs from repository"
        );
        return Err(LifecycleError::validation(INCONSISTENT_MANIFEST));
    }
    Ok(())
}

fn parse_yaml(yaml: &str) -> LifecycleResult<Value> {
    serde_yaml::from_str(yaml).map_err(|e| LifecycleError::validation(format!("invalid YAML: {e}")))
}

/// Merge `overlay` into `base` recursively; overlay entries win.
#[must_use]
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

// Null-valued keys are equivalent to absent ones.
fn normalise(value: &Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut out = Mapping::new();
            for (k, v) in map {
                if !v.is_null() {
                    out.insert(k.clone(), normalise(v));
                }
            }
            Value::Mapping(out)
        }
        Value::Sequence(items) => Value::Sequence(items.iter().map(normalise).collect()),
        other => other.clone(),
    }
}

fn differing_keys(a: &Value, b: &Value) -> Vec<String> {
    let (Some(a), Some(b)) = (a.as_mapping(), b.as_mapping()) else {
        return Vec::new();
    };
    let mut keys: Vec<String> = a
        .keys()
        .chain(b.keys())
        .filter(|k| a.get(*k).map(normalise) != b.get(*k).map(normalise))
        .filter_map(|k| k.as_str().map(ToOwned::to_owned))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ADDER: &str = r"
name: adder
owner_email: owner@example.com
version: 1.0.0
jobtype: python3:latest
git:
  remote: https://github.com/example/adder
  directory: sample/python-class
runtime_env:
  GREETING: hello
";

    #[test]
    fn parses_manifest_with_defaults() {
        let manifest = Manifest::from_yaml(ADDER).unwrap();
        assert_eq!(manifest.key(), JobKey::new("adder", "1.0.0"));
        assert_eq!(manifest.replicas, 1);
        assert_eq!(manifest.git.directory, "sample/python-class");
        assert_eq!(manifest.runtime_env.get("GREETING").unwrap(), "hello");
    }

    #[test]
    fn manifest_without_jobtype_or_docker_is_rejected() {
        let err = Manifest::from_yaml("name: x\ngit:\n  remote: r\n").unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[test]
    fn consistency_ignores_key_order_and_formatting() {
        let reordered = r"
git: {remote: 'https://github.com/example/adder', directory: sample/python-class}
version: '1.0.0'
name: adder
jobtype: python3:latest
owner_email: owner@example.com
runtime_env: {GREETING: hello}
";
        let repo = RepositoryManifest {
            content: reordered.to_owned(),
            base: None,
        };
        verify_manifest_consistency(ADDER, &repo).unwrap();
    }

    #[test]
    fn inconsistent_manifest_asks_about_push() {
        let repo = RepositoryManifest {
            content: ADDER.replace("hello", "goodbye"),
            base: None,
        };
        let err = verify_manifest_consistency(ADDER, &repo).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("not consistent"));
        assert!(message.contains("forget to git push"));
        assert!(!message.contains("goodbye"));
    }

    #[test]
    fn repository_overlay_is_merged_with_base() {
        let base = r"
name: adder
owner_email: owner@example.com
jobtype: python3:latest
git:
  remote: https://github.com/example/adder
runtime_env:
  GREETING: hello
";
        let overlay = r"
extends: ./base.yaml
version: 1.0.0
git:
  directory: sample/python-class
";
        let repo = RepositoryManifest {
            content: overlay.to_owned(),
            base: Some(base.to_owned()),
        };
        verify_manifest_consistency(ADDER, &repo).unwrap();
    }

    #[test]
    fn quantities_parse_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity("256Mi").unwrap(), 268_435_456.0);
        assert_eq!(parse_quantity("1G").unwrap(), 1e9);
        assert!((parse_quantity("10m").unwrap() - 0.01).abs() < f64::EPSILON);
        assert!(parse_quantity("lots").is_err());
    }

    #[test]
    fn resources_default_and_respect_ceiling() {
        let mut manifest = Manifest::from_yaml(ADDER).unwrap();
        let config = ResourceConfig::default();
        let resolved = resolve_resources(&manifest, &config).unwrap();
        assert_eq!(resolved.memory_max, "1Gi");
        assert_eq!(resolved.cpu_min, "10m");

        manifest.resources = Some(ResourcesManifest {
            memory_max: Some("16Gi".to_owned()),
            ..ResourcesManifest::default()
        });
        assert!(resolve_resources(&manifest, &config).is_err());
    }
}
