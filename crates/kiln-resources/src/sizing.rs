//! The sizing engine

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kiln_common::crd::{ModelSize, ResourcesSpec};
use tracing::debug;

use crate::catalog::GPU_RESOURCE;
use crate::{AcceleratorCatalog, SizingError};

/// Bytes per GiB
pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Extra host memory for the runtime on top of the weights
const RUNTIME_OVERHEAD_GIB: f64 = 2.0;
/// Safety margin applied to the weight size
const MARGIN: f64 = 1.1;
const MIN_CPU: u32 = 2;
const MIN_EPHEMERAL_GIB: u32 = 100;

const BUILDER_CPU: u32 = 2;
const BUILDER_MEMORY_GIB: u32 = 12;
const BUILDER_CUSHION_GIB: f64 = 10.0;
const BUILDER_MIN_EPHEMERAL_GIB: u32 = 20;

/// What a container is doing with the model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Modeller job
    Trainer,
    /// Inference server
    Server,
    /// Interactive notebook
    Notebook,
    /// Container image builder
    Builder,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Trainer => "trainer",
            Self::Server => "server",
            Self::Notebook => "notebook",
            Self::Builder => "builder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SizingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trainer" | "training" => Ok(Self::Trainer),
            "server" | "serving" => Ok(Self::Server),
            "notebook" => Ok(Self::Notebook),
            "builder" => Ok(Self::Builder),
            other => Err(SizingError::UnknownRole(other.to_string())),
        }
    }
}

/// Inputs to a sizing decision
#[derive(Clone, Copy, Debug)]
pub struct SizingRequest<'a> {
    /// Model size, if known
    pub size: Option<ModelSize>,
    /// Runtime role
    pub role: Role,
    /// User overrides; `gpu.type` selects the accelerator
    pub overrides: Option<&'a ResourcesSpec>,
}

impl<'a> SizingRequest<'a> {
    /// A request for the given role with no size or overrides
    pub fn new(role: Role) -> Self {
        Self {
            size: None,
            role,
            overrides: None,
        }
    }

    /// Set the model size
    pub fn with_size(mut self, size: Option<ModelSize>) -> Self {
        self.size = size;
        self
    }

    /// Set user overrides
    pub fn with_overrides(mut self, overrides: Option<&'a ResourcesSpec>) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Computed resources for one container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourcePlan {
    /// CPU cores
    pub cpu: u32,
    /// Memory in GiB
    pub memory_gib: u32,
    /// Ephemeral storage in GiB
    pub ephemeral_gib: u32,
    /// Accelerators, when one was requested
    pub accelerators: Option<u32>,
    /// Node selector for the accelerator
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations for the accelerator
    pub tolerations: Vec<Toleration>,
}

impl ResourcePlan {
    /// Requests and limits for the container
    pub fn requirements(&self) -> ResourceRequirements {
        let mut quantities = BTreeMap::from([
            ("cpu".to_string(), Quantity(self.cpu.to_string())),
            ("memory".to_string(), Quantity(format!("{}Gi", self.memory_gib))),
            (
                "ephemeral-storage".to_string(),
                Quantity(format!("{}Gi", self.ephemeral_gib)),
            ),
        ]);
        if let Some(count) = self.accelerators {
            quantities.insert(GPU_RESOURCE.to_string(), Quantity(count.to_string()));
        }
        ResourceRequirements {
            requests: Some(quantities.clone()),
            limits: Some(quantities),
            ..Default::default()
        }
    }

    /// Write requests, limits, node selector and tolerations into a pod
    pub fn apply_to(&self, container: &mut Container, pod_spec: &mut PodSpec) {
        container.resources = Some(self.requirements());

        if !self.node_selector.is_empty() {
            pod_spec
                .node_selector
                .get_or_insert_with(BTreeMap::new)
                .extend(self.node_selector.clone());
        }
        if !self.tolerations.is_empty() {
            let tolerations = pod_spec.tolerations.get_or_insert_with(Vec::new);
            for toleration in &self.tolerations {
                if !tolerations.contains(toleration) {
                    tolerations.push(toleration.clone());
                }
            }
        }
    }
}

/// The sizing engine
#[derive(Clone, Debug)]
pub struct Sizer {
    catalog: AcceleratorCatalog,
}

impl Sizer {
    /// Create a sizer over an accelerator catalog
    pub fn new(catalog: AcceleratorCatalog) -> Self {
        Self { catalog }
    }

    /// Compute a resource plan
    pub fn plan(&self, request: SizingRequest<'_>) -> Result<ResourcePlan, SizingError> {
        let bytes = request.size.map(|s| s.bytes()).unwrap_or(0) as f64;
        let required = MARGIN * bytes;

        let mut plan = match request.role {
            Role::Builder => ResourcePlan {
                cpu: BUILDER_CPU,
                memory_gib: BUILDER_MEMORY_GIB,
                ephemeral_gib: (((2.0 * bytes) / GIB + BUILDER_CUSHION_GIB).ceil() as u32)
                    .max(BUILDER_MIN_EPHEMERAL_GIB),
                ..Default::default()
            },
            Role::Trainer | Role::Server | Role::Notebook => {
                let memory_gib = (required / GIB + RUNTIME_OVERHEAD_GIB).ceil() as u32;
                ResourcePlan {
                    cpu: memory_gib.max(MIN_CPU),
                    memory_gib,
                    ephemeral_gib: ((3.0 * bytes / GIB).ceil() as u32).max(MIN_EPHEMERAL_GIB),
                    ..Default::default()
                }
            }
        };

        let overrides = request.overrides;
        let gpu = match request.role {
            Role::Builder => None,
            _ => overrides.and_then(|o| o.gpu.as_ref()),
        };
        if let Some(gpu) = gpu {
            let spec = self.catalog.get(&gpu.type_)?;
            let count = match gpu.count {
                Some(count) => count.max(1),
                None => {
                    let per_accelerator = f64::from(spec.memory_gib) * GIB;
                    ((required / per_accelerator).ceil() as u32)
                        .max(1)
                        .next_power_of_two()
                }
            };
            if count > spec.max_per_node {
                return Err(SizingError::ExceedsNode {
                    accelerator: gpu.type_.clone(),
                    required: count,
                    max: spec.max_per_node,
                });
            }
            plan.accelerators = Some(count);
            plan.node_selector = spec.node_selector.clone();
            plan.tolerations = spec.tolerations.clone();
        }

        if let Some(o) = overrides {
            if let Some(cpu) = o.cpu {
                plan.cpu = cpu;
            }
            if let Some(memory) = o.memory {
                plan.memory_gib = memory;
            }
            if let Some(disk) = o.disk {
                plan.ephemeral_gib = disk;
            }
        }

        debug!(
            role = %request.role,
            cpu = plan.cpu,
            memory_gib = plan.memory_gib,
            ephemeral_gib = plan.ephemeral_gib,
            accelerators = ?plan.accelerators,
            "Computed resource plan"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cloud::CloudKind;
    use kiln_common::crd::GpuSpec;

    fn sizer() -> Sizer {
        Sizer::new(AcceleratorCatalog::for_cloud(CloudKind::Gcp))
    }

    fn small() -> Option<ModelSize> {
        Some(ModelSize {
            parameter_count: 125_000_000,
            parameter_bits: 32,
        })
    }

    fn gpu(type_: &str) -> ResourcesSpec {
        ResourcesSpec {
            gpu: Some(GpuSpec {
                type_: type_.to_string(),
                count: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn story_small_model_trains_on_cpu() {
        let plan = sizer()
            .plan(SizingRequest::new(Role::Trainer).with_size(small()))
            .unwrap();
        assert_eq!(plan.cpu, 3);
        assert_eq!(plan.memory_gib, 3);
        assert_eq!(plan.ephemeral_gib, 100);
        assert_eq!(plan.accelerators, None);
    }

    #[test]
    fn story_small_model_fits_one_l4() {
        let overrides = gpu("nvidia-l4");
        let plan = sizer()
            .plan(
                SizingRequest::new(Role::Trainer)
                    .with_size(small())
                    .with_overrides(Some(&overrides)),
            )
            .unwrap();
        assert_eq!(plan.accelerators, Some(1));
        assert_eq!(
            plan.node_selector["cloud.google.com/gke-accelerator"],
            "nvidia-l4"
        );
    }

    fn accelerators_for(gib_needed: f64) -> Result<Option<u32>, SizingError> {
        // parameter_bits = 8 makes bytes == parameter_count
        let bytes = (gib_needed * GIB / MARGIN) as u64;
        let overrides = gpu("nvidia-l4");
        sizer()
            .plan(
                SizingRequest::new(Role::Server)
                    .with_size(Some(ModelSize {
                        parameter_count: bytes,
                        parameter_bits: 8,
                    }))
                    .with_overrides(Some(&overrides)),
            )
            .map(|p| p.accelerators)
    }

    #[test]
    fn accelerator_counts_round_up_to_powers_of_two() {
        assert_eq!(accelerators_for(20.0).unwrap(), Some(1));
        assert_eq!(accelerators_for(40.0).unwrap(), Some(2));
        assert_eq!(accelerators_for(60.0).unwrap(), Some(4));
        assert_eq!(accelerators_for(170.0).unwrap(), Some(8));
    }

    #[test]
    fn story_huge_model_exceeds_a_node() {
        assert_eq!(
            accelerators_for(200.0),
            Err(SizingError::ExceedsNode {
                accelerator: "nvidia-l4".to_string(),
                required: 16,
                max: 8,
            })
        );
    }

    #[test]
    fn builder_has_fixed_cpu_and_memory() {
        let plan = sizer().plan(SizingRequest::new(Role::Builder)).unwrap();
        assert_eq!((plan.cpu, plan.memory_gib, plan.ephemeral_gib), (2, 12, 20));

        let big = ModelSize {
            parameter_count: 7_000_000_000,
            parameter_bits: 16,
        };
        let plan = sizer()
            .plan(SizingRequest::new(Role::Builder).with_size(Some(big)))
            .unwrap();
        // 2 * 14e9 bytes = 26.08 GiB, + 10 GiB cushion
        assert_eq!(plan.ephemeral_gib, 37);
    }

    #[test]
    fn builder_ignores_accelerator_requests() {
        let overrides = gpu("nvidia-l4");
        let plan = sizer()
            .plan(SizingRequest::new(Role::Builder).with_overrides(Some(&overrides)))
            .unwrap();
        assert_eq!(plan.accelerators, None);
    }

    #[test]
    fn overrides_replace_fields_individually() {
        let overrides = ResourcesSpec {
            cpu: Some(16),
            disk: Some(500),
            ..Default::default()
        };
        let plan = sizer()
            .plan(
                SizingRequest::new(Role::Notebook)
                    .with_size(small())
                    .with_overrides(Some(&overrides)),
            )
            .unwrap();
        assert_eq!(plan.cpu, 16);
        assert_eq!(plan.memory_gib, 3);
        assert_eq!(plan.ephemeral_gib, 500);
    }

    #[test]
    fn unknown_accelerator_and_role_are_errors() {
        let overrides = gpu("tpu-v5");
        assert!(matches!(
            sizer().plan(SizingRequest::new(Role::Server).with_overrides(Some(&overrides))),
            Err(SizingError::UnknownAccelerator { .. })
        ));
        assert_eq!(
            "janitor".parse::<Role>(),
            Err(SizingError::UnknownRole("janitor".to_string()))
        );
        assert_eq!("Trainer".parse::<Role>(), Ok(Role::Trainer));
    }

    #[test]
    fn plan_is_applied_to_pod() {
        let overrides = gpu("nvidia-l4");
        let plan = sizer()
            .plan(
                SizingRequest::new(Role::Server)
                    .with_size(small())
                    .with_overrides(Some(&overrides)),
            )
            .unwrap();
        let mut container = Container::default();
        let mut pod = PodSpec::default();
        plan.apply_to(&mut container, &mut pod);
        plan.apply_to(&mut container, &mut pod);

        let limits = container.resources.unwrap().limits.unwrap();
        assert_eq!(limits[GPU_RESOURCE], Quantity("1".to_string()));
        assert_eq!(limits["memory"], Quantity("3Gi".to_string()));
        let tolerations = pod.tolerations.unwrap();
        assert_eq!(tolerations.len(), 2);
        assert!(tolerations
            .iter()
            .any(|t| t.key.as_deref() == Some("cloud.google.com/gke-spot")));
        let selector = pod.node_selector.unwrap();
        assert!(selector.contains_key("cloud.google.com/gke-accelerator"));
        assert_eq!(selector["cloud.google.com/gke-spot"], "true");
    }
}
