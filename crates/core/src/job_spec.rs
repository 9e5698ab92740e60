//! Kubernetes job descriptor model and builder.
//!
//! [`JobDescriptor`] mirrors the `batch/v1` `Job` manifest the q8s
//! scheduler consumes. [`build`] overlays the user's form values (job name,
//! hardware backend, MPI process count) onto a template descriptor without
//! touching the template itself.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Extended resource key for a single GPU.
pub const RESOURCE_KEY_GPU: &str = "q8s.com/gpu";

/// Extended resource key for multi-GPU MPI jobs. The value is the number of
/// MPI processes rather than a device count.
pub const RESOURCE_KEY_GPU_MPI: &str = "q8s.com/gpu-mpi";

/// Extended resource key for CPU-only execution.
pub const RESOURCE_KEY_CPU: &str = "q8s.com/cpu";

/// Extended resource key for quantum processing units.
pub const RESOURCE_KEY_QPU: &str = "q8s.com/qpu";

/// Process count substituted when the MPI count is missing or invalid.
pub const DEFAULT_MPI_PROCESSES: u32 = 2;

// ---------------------------------------------------------------------------
// Hardware backend
// ---------------------------------------------------------------------------

/// The hardware a job can be scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareBackend {
    SingleGpu,
    MultiGpuMpi,
    Cpu,
    Qpu,
}

impl HardwareBackend {
    /// Every backend, in the order the job form lists them.
    pub const ALL: [HardwareBackend; 4] = [Self::Qpu, Self::SingleGpu, Self::MultiGpuMpi, Self::Cpu];

    /// Short selector id, e.g. `"multi-gpu-mpi"`.
    pub fn selector(&self) -> &'static str {
        match self {
            Self::SingleGpu => "single-gpu",
            Self::MultiGpuMpi => "multi-gpu-mpi",
            Self::Cpu => "cpu",
            Self::Qpu => "qpu",
        }
    }

    /// The extended resource key requested in the container limits.
    pub fn resource_key(&self) -> &'static str {
        match self {
            Self::SingleGpu => RESOURCE_KEY_GPU,
            Self::MultiGpuMpi => RESOURCE_KEY_GPU_MPI,
            Self::Cpu => RESOURCE_KEY_CPU,
            Self::Qpu => RESOURCE_KEY_QPU,
        }
    }

    /// Human-readable label shown in the backend picker.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SingleGpu => "Single GPU",
            Self::MultiGpuMpi => "Multi GPU (MPI)",
            Self::Cpu => "CPU",
            Self::Qpu => "QPU",
        }
    }

    /// Whether this backend takes an MPI process count.
    pub fn uses_process_count(&self) -> bool {
        matches!(self, Self::MultiGpuMpi)
    }

    /// Resolve a selector. Accepts both the short id (`"cpu"`) and the
    /// resource key (`"q8s.com/cpu"`), which is what the form submits.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|b| b.selector() == value || b.resource_key() == value)
            .ok_or_else(|| CoreError::Validation(format!("Unknown hardware backend '{value}'")))
    }
}

impl FromStr for HardwareBackend {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HardwareBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.selector())
    }
}

// ---------------------------------------------------------------------------
// Descriptor model
// ---------------------------------------------------------------------------

/// Manifest keys a struct does not model. Kept verbatim so a template
/// round-trips without losing fields.
pub type Extra = serde_json::Map<String, serde_json::Value>;

/// A `batch/v1` Job manifest.
///
/// Only the fields the builder reads or writes are typed. Everything else
/// in a template (`backoffLimit`, labels, `env`, `args`, ...) lands in the
/// `extra` map of the enclosing struct and is serialized back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Extra::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub template: PodTemplate,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub restart_policy: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Container resources keyed by resource name.
///
/// Values stay raw JSON: extended resources are integers, while standard
/// ones use Kubernetes quantities such as `"1Gi"` or `"500m"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub limits: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A pod volume. The source (`configMap`, `emptyDir`, ...) is kept as raw
/// JSON so templates can use any volume type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: Extra,
}

impl JobDescriptor {
    /// The built-in job template used when no template file is configured.
    pub fn baseline() -> Self {
        let mut source = Extra::new();
        source.insert(
            "configMap".to_string(),
            serde_json::json!({ "name": "task-files" }),
        );

        Self {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            metadata: ObjectMeta::named("quantum-job"),
            spec: JobSpec {
                template: PodTemplate {
                    metadata: ObjectMeta::named("quantum-job-pod"),
                    spec: PodSpec {
                        containers: vec![Container {
                            name: "quantum-task".to_string(),
                            image: "q8s-registry/quantum-task:latest".to_string(),
                            command: vec!["python".to_string(), "/app/main.py".to_string()],
                            resources: ResourceRequirements {
                                limits: BTreeMap::from([(
                                    RESOURCE_KEY_GPU.to_string(),
                                    serde_json::Value::from(1),
                                )]),
                                extra: Extra::new(),
                            },
                            volume_mounts: vec![VolumeMount {
                                name: "source-code-volume".to_string(),
                                mount_path: "/app".to_string(),
                                extra: Extra::new(),
                            }],
                            extra: Extra::new(),
                        }],
                        volumes: vec![Volume {
                            name: "source-code-volume".to_string(),
                            source,
                        }],
                        restart_policy: "Never".to_string(),
                        extra: Extra::new(),
                    },
                    extra: Extra::new(),
                },
                extra: Extra::new(),
            },
            extra: Extra::new(),
        }
    }

    /// Parse a descriptor from its JSON manifest.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Invalid job descriptor: {e}")))
    }

    /// Canonical rendering: JSON indented by two spaces.
    pub fn to_canonical_json(&self) -> Result<String, CoreError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize job descriptor: {e}")))
    }

    /// Resource limits of the primary (first) container.
    pub fn resource_request(&self) -> Option<&BTreeMap<String, serde_json::Value>> {
        self.spec
            .template
            .spec
            .containers
            .first()
            .map(|c| &c.resources.limits)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Parse an MPI process count, falling back to [`DEFAULT_MPI_PROCESSES`]
/// when the value is missing, unparsable or not positive.
pub fn parse_process_count(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MPI_PROCESSES)
}

/// The single resource entry requested for `backend`.
pub fn resource_entry(backend: HardwareBackend, process_count: Option<&str>) -> (String, u32) {
    let value = if backend.uses_process_count() {
        parse_process_count(process_count)
    } else {
        1
    };
    (backend.resource_key().to_string(), value)
}

/// Build a job descriptor from form values.
///
/// Deep-copies `template`, sets `metadata.name` to `name` and replaces the
/// primary container's limits with the single entry derived from
/// `backend_selector` (and `process_count` for the MPI backend). Every
/// other template field is carried over as is.
///
/// Rules:
/// - `name` must not be empty.
/// - `backend_selector` must name a known [`HardwareBackend`].
/// - `template` must define at least one container.
pub fn build(
    template: &JobDescriptor,
    name: &str,
    backend_selector: &str,
    process_count: Option<&str>,
) -> Result<JobDescriptor, CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Job name must not be empty".to_string(),
        ));
    }
    let backend = HardwareBackend::parse(backend_selector)?;

    let mut descriptor = template.clone();
    let container = descriptor
        .spec
        .template
        .spec
        .containers
        .first_mut()
        .ok_or_else(|| {
            CoreError::Validation("Job template must define at least one container".to_string())
        })?;

    let (key, value) = resource_entry(backend, process_count);
    container.resources.limits = BTreeMap::from([(key, serde_json::Value::from(value))]);
    descriptor.metadata.name = name.to_string();

    Ok(descriptor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn limits(d: &JobDescriptor) -> &BTreeMap<String, serde_json::Value> {
        d.resource_request().expect("descriptor has a container")
    }

    #[test]
    fn build_mpi_with_invalid_count_defaults_to_two() {
        let template = JobDescriptor::baseline();
        let d = build(&template, "demo", "multi-gpu-mpi", Some("abc")).unwrap();
        assert_eq!(d.metadata.name, "demo");
        assert_eq!(
            limits(&d),
            &BTreeMap::from([(RESOURCE_KEY_GPU_MPI.to_string(), serde_json::json!(2))])
        );
    }

    #[test]
    fn build_mpi_uses_requested_count() {
        let d = build(&JobDescriptor::baseline(), "demo", "multi-gpu-mpi", Some(" 6 ")).unwrap();
        assert_eq!(limits(&d)[RESOURCE_KEY_GPU_MPI], 6);
    }

    #[test]
    fn build_mpi_missing_or_zero_count_defaults() {
        let template = JobDescriptor::baseline();
        for raw in [None, Some(""), Some("0"), Some("-3"), Some("2.5")] {
            let d = build(&template, "demo", "multi-gpu-mpi", raw).unwrap();
            assert_eq!(limits(&d)[RESOURCE_KEY_GPU_MPI], DEFAULT_MPI_PROCESSES, "raw = {raw:?}");
        }
    }

    #[test]
    fn every_backend_yields_exactly_one_positive_entry() {
        let template = JobDescriptor::baseline();
        for backend in HardwareBackend::ALL {
            let d = build(&template, "job", backend.selector(), Some("4")).unwrap();
            let l = limits(&d);
            assert_eq!(l.len(), 1, "backend {backend}");
            let (key, value) = l.iter().next().unwrap();
            assert_eq!(key, backend.resource_key());
            assert!(value.as_u64().unwrap() >= 1);
            if !backend.uses_process_count() {
                assert_eq!(*value, 1, "only MPI carries a count");
            }
        }
    }

    #[test]
    fn build_accepts_resource_key_as_selector() {
        let d = build(&JobDescriptor::baseline(), "job", "q8s.com/qpu", None).unwrap();
        assert_eq!(limits(&d)[RESOURCE_KEY_QPU], 1);
    }

    #[test]
    fn build_replaces_extra_template_limits() {
        let mut template = JobDescriptor::baseline();
        template.spec.template.spec.containers[0]
            .resources
            .limits
            .insert("memory".to_string(), serde_json::json!("1Gi"));

        let d = build(&template, "job", "cpu", None).unwrap();
        assert_eq!(limits(&d).len(), 1);
    }

    #[test]
    fn build_does_not_mutate_template() {
        let template = JobDescriptor::baseline();
        let before = template.clone();
        let _ = build(&template, "changed", "multi-gpu-mpi", Some("8")).unwrap();
        assert_eq!(template, before);
    }

    #[test]
    fn empty_name_is_rejected() {
        let result = build(&JobDescriptor::baseline(), "", "cpu", None);
        assert_matches!(result, Err(CoreError::Validation(_)));
    }

    #[test]
    fn unknown_selector_is_rejected() {
        let result = build(&JobDescriptor::baseline(), "job", "tpu", None);
        assert_matches!(result, Err(CoreError::Validation(msg)) if msg.contains("tpu"));
    }

    #[test]
    fn template_without_container_is_rejected() {
        let mut template = JobDescriptor::baseline();
        template.spec.template.spec.containers.clear();
        assert_matches!(
            build(&template, "job", "cpu", None),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn baseline_serializes_to_manifest_shape() {
        let value = serde_json::to_value(JobDescriptor::baseline()).unwrap();
        assert_eq!(value["apiVersion"], "batch/v1");
        assert_eq!(value["kind"], "Job");
        assert_eq!(value["metadata"]["name"], "quantum-job");
        let pod = &value["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(pod["containers"][0]["resources"]["limits"]["q8s.com/gpu"], 1);
        assert_eq!(pod["containers"][0]["volumeMounts"][0]["mountPath"], "/app");
        assert_eq!(pod["volumes"][0]["configMap"]["name"], "task-files");
    }

    #[test]
    fn from_json_reads_canonical_output() {
        let text = JobDescriptor::baseline().to_canonical_json().unwrap();
        let parsed = JobDescriptor::from_json(&text).unwrap();
        assert_eq!(parsed, JobDescriptor::baseline());
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert_matches!(
            JobDescriptor::from_json("{\"kind\": 3}"),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn process_count_requires_a_whole_number() {
        // No prefix parsing: trailing text or a fractional part is invalid.
        assert_eq!(parse_process_count(Some("4")), 4);
        assert_eq!(parse_process_count(Some("4.0")), DEFAULT_MPI_PROCESSES);
        assert_eq!(parse_process_count(Some("3 procs")), DEFAULT_MPI_PROCESSES);
    }

    #[test]
    fn build_keeps_unmodeled_template_fields() {
        let text = r#"{
          "apiVersion": "batch/v1",
          "kind": "Job",
          "metadata": { "name": "tmpl", "labels": { "team": "q" } },
          "spec": {
            "backoffLimit": 4,
            "template": {
              "metadata": { "name": "tmpl-pod" },
              "spec": {
                "containers": [{
                  "name": "task",
                  "image": "img",
                  "args": ["--shots", "1000"],
                  "env": [{ "name": "SHOTS", "value": "1000" }],
                  "resources": {
                    "limits": { "memory": "1Gi" },
                    "requests": { "cpu": "500m" }
                  }
                }],
                "restartPolicy": "Never",
                "nodeSelector": { "pool": "gpu" }
              }
            }
          }
        }"#;
        let template = JobDescriptor::from_json(text).unwrap();
        let d = build(&template, "demo", "cpu", None).unwrap();
        let value = serde_json::to_value(&d).unwrap();

        assert_eq!(value["metadata"]["name"], "demo");
        assert_eq!(value["metadata"]["labels"]["team"], "q");
        assert_eq!(value["spec"]["backoffLimit"], 4);
        let pod = &value["spec"]["template"]["spec"];
        assert_eq!(pod["nodeSelector"]["pool"], "gpu");
        let container = &pod["containers"][0];
        assert_eq!(container["env"][0]["name"], "SHOTS");
        assert_eq!(container["args"][1], "1000");
        assert_eq!(container["resources"]["requests"]["cpu"], "500m");
        assert_eq!(
            container["resources"]["limits"],
            serde_json::json!({ "q8s.com/cpu": 1 })
        );
    }

    #[test]
    fn unmodeled_fields_survive_canonical_round_trip() {
        let mut template = JobDescriptor::baseline();
        template
            .spec
            .extra
            .insert("ttlSecondsAfterFinished".to_string(), serde_json::json!(600));

        let text = template.to_canonical_json().unwrap();
        assert_eq!(JobDescriptor::from_json(&text).unwrap(), template);
    }

    #[test]
    fn backend_display_is_selector() {
        assert_eq!(HardwareBackend::MultiGpuMpi.to_string(), "multi-gpu-mpi");
        assert_eq!("single-gpu".parse::<HardwareBackend>().unwrap(), HardwareBackend::SingleGpu);
    }
}
