//! Accelerator catalog
//!
//! Maps an accelerator type to its memory and to the node selector and
//! tolerations that land a pod on a node carrying it. The built-in entries
//! for each cloud place accelerator pods on that cloud's preemptible (spot)
//! capacity; operators can replace them with a YAML file.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use kiln_cloud::CloudKind;
use serde::{Deserialize, Serialize};

use crate::SizingError;

/// Extended resource name for NVIDIA GPUs
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Largest accelerator count a single node offers unless the catalog says otherwise
const DEFAULT_MAX_PER_NODE: u32 = 8;

fn default_max_per_node() -> u32 {
    DEFAULT_MAX_PER_NODE
}

/// One accelerator type
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorSpec {
    /// Accelerator memory in GiB
    pub memory_gib: u32,

    /// Largest number of these a single node carries
    #[serde(default = "default_max_per_node")]
    pub max_per_node: u32,

    /// Node labels selecting nodes with this accelerator
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for taints on accelerator nodes
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

/// Accelerator types available on a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AcceleratorCatalog {
    accelerators: BTreeMap<String, AcceleratorSpec>,
}

fn gpu_toleration() -> Toleration {
    Toleration {
        key: Some(GPU_RESOURCE.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }
}

/// Node label and value marking preemptible capacity on each cloud
pub fn spot_capacity(cloud: CloudKind) -> Option<(&'static str, &'static str)> {
    match cloud {
        CloudKind::Gcp => Some(("cloud.google.com/gke-spot", "true")),
        CloudKind::Aws => Some(("karpenter.sh/capacity-type", "spot")),
        CloudKind::Azure => Some(("kubernetes.azure.com/scalesetpriority", "spot")),
        CloudKind::Local => None,
    }
}

fn spot_toleration(key: &str, value: &str) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some("Equal".to_string()),
        value: Some(value.to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }
}

impl AcceleratorCatalog {
    /// Built-in catalog for a cloud
    pub fn for_cloud(cloud: CloudKind) -> Self {
        let (selector_key, entries): (&str, &[(&str, &str, u32)]) = match cloud {
            CloudKind::Gcp => (
                "cloud.google.com/gke-accelerator",
                &[
                    ("nvidia-tesla-t4", "nvidia-tesla-t4", 16),
                    ("nvidia-l4", "nvidia-l4", 24),
                    ("nvidia-tesla-a100", "nvidia-tesla-a100", 40),
                    ("nvidia-a100-80gb", "nvidia-a100-80gb", 80),
                    ("nvidia-h100-80gb", "nvidia-h100-80gb", 80),
                ],
            ),
            CloudKind::Aws => (
                "karpenter.k8s.aws/instance-gpu-name",
                &[
                    ("nvidia-tesla-t4", "t4", 16),
                    ("nvidia-a10g", "a10g", 24),
                    ("nvidia-l4", "l4", 24),
                    ("nvidia-a100", "a100", 40),
                    ("nvidia-h100", "h100", 80),
                ],
            ),
            CloudKind::Azure => (
                "kiln.dev/accelerator",
                &[
                    ("nvidia-tesla-t4", "nvidia-tesla-t4", 16),
                    ("nvidia-a10", "nvidia-a10", 24),
                    ("nvidia-a100-80gb", "nvidia-a100-80gb", 80),
                    ("nvidia-h100", "nvidia-h100", 80),
                ],
            ),
            CloudKind::Local => ("kiln.dev/accelerator", &[("nvidia-gpu", "nvidia-gpu", 16)]),
        };

        let spot = spot_capacity(cloud);
        let accelerators = entries
            .iter()
            .map(|(name, label, memory_gib)| {
                let mut node_selector =
                    BTreeMap::from([(selector_key.to_string(), label.to_string())]);
                let mut tolerations = vec![gpu_toleration()];
                if let Some((key, value)) = spot {
                    node_selector.insert(key.to_string(), value.to_string());
                    tolerations.push(spot_toleration(key, value));
                }
                (
                    name.to_string(),
                    AcceleratorSpec {
                        memory_gib: *memory_gib,
                        max_per_node: DEFAULT_MAX_PER_NODE,
                        node_selector,
                        tolerations,
                    },
                )
            })
            .collect();
        Self { accelerators }
    }

    /// Parse a catalog override.
    ///
    /// ```yaml
    /// accelerators:
    ///   nvidia-l4:
    ///     memoryGib: 24
    ///     nodeSelector: {cloud.google.com/gke-accelerator: nvidia-l4}
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self, SizingError> {
        let catalog: Self =
            serde_yaml::from_str(yaml).map_err(|e| SizingError::InvalidCatalog(e.to_string()))?;
        if let Some((name, _)) = catalog
            .accelerators
            .iter()
            .find(|(_, spec)| spec.memory_gib == 0 || spec.max_per_node == 0)
        {
            return Err(SizingError::InvalidCatalog(format!(
                "accelerator '{name}' must have non-zero memoryGib and maxPerNode"
            )));
        }
        Ok(catalog)
    }

    /// Look up an accelerator type
    pub fn get(&self, name: &str) -> Result<&AcceleratorSpec, SizingError> {
        self.accelerators
            .get(name)
            .ok_or_else(|| SizingError::UnknownAccelerator {
                name: name.to_string(),
                available: self
                    .accelerators
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Accelerator type names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.accelerators.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cloud_has_a_catalog() {
        for cloud in CloudKind::ALL {
            let catalog = AcceleratorCatalog::for_cloud(cloud);
            assert!(catalog.names().count() > 0, "{cloud} catalog empty");
        }
    }

    #[test]
    fn gcp_l4_selects_gke_accelerator_label() {
        let catalog = AcceleratorCatalog::for_cloud(CloudKind::Gcp);
        let l4 = catalog.get("nvidia-l4").unwrap();
        assert_eq!(l4.memory_gib, 24);
        assert_eq!(
            l4.node_selector["cloud.google.com/gke-accelerator"],
            "nvidia-l4"
        );
        assert_eq!(l4.tolerations[0].key.as_deref(), Some(GPU_RESOURCE));
        assert_eq!(l4.node_selector["cloud.google.com/gke-spot"], "true");
    }

    #[test]
    fn accelerators_land_on_spot_capacity() {
        for cloud in CloudKind::ALL {
            let catalog = AcceleratorCatalog::for_cloud(cloud);
            for name in catalog.names() {
                let spec = catalog.get(name).unwrap();
                match spot_capacity(cloud) {
                    Some((key, value)) => {
                        assert_eq!(spec.node_selector[key], value, "{cloud}/{name}");
                        assert!(spec.tolerations.iter().any(|t| {
                            t.key.as_deref() == Some(key) && t.value.as_deref() == Some(value)
                        }));
                    }
                    None => assert_eq!(spec.tolerations.len(), 1),
                }
            }
        }
        assert_eq!(
            spot_capacity(CloudKind::Aws),
            Some(("karpenter.sh/capacity-type", "spot"))
        );
    }

    #[test]
    fn unknown_accelerator_lists_alternatives() {
        let catalog = AcceleratorCatalog::for_cloud(CloudKind::Aws);
        match catalog.get("tpu-v5") {
            Err(SizingError::UnknownAccelerator { available, .. }) => {
                assert!(available.contains("nvidia-a10g"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn story_operator_overrides_catalog_from_yaml() {
        let catalog = AcceleratorCatalog::from_yaml(
            r#"
accelerators:
  rtx-4090:
    memoryGib: 24
    maxPerNode: 2
    nodeSelector:
      gpu: rtx-4090
    tolerations:
      - key: gpu
        operator: Exists
"#,
        )
        .unwrap();
        let spec = catalog.get("rtx-4090").unwrap();
        assert_eq!(spec.max_per_node, 2);
        assert_eq!(spec.node_selector["gpu"], "rtx-4090");
        assert!(catalog.get("nvidia-l4").is_err());
    }

    #[test]
    fn catalog_rejects_zero_memory() {
        let err = AcceleratorCatalog::from_yaml("accelerators:\n  bad:\n    memoryGib: 0\n")
            .unwrap_err();
        assert!(matches!(err, SizingError::InvalidCatalog(_)));
    }
}
