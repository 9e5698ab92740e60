//! Declarative schema for the job configuration form.
//!
//! Rendering layers walk [`job_form_schema`] in order and use
//! [`is_field_visible`] to decide which conditional fields to show for the
//! currently selected backend. Submitted values are collected into
//! [`JobFormValues`] and turned into a descriptor with
//! [`JobFormValues::build`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job_spec::{self, HardwareBackend, JobDescriptor, DEFAULT_MPI_PROCESSES};

pub const FIELD_JOB_NAME: &str = "jobName";
pub const FIELD_HARDWARE_BACKEND: &str = "hardwareBackend";
pub const FIELD_GPU_MPI_COUNT: &str = "gpuMpiCount";
pub const FIELD_QPU_INFO: &str = "qpuInfo";

/// Default job name pre-filled in the form.
pub const DEFAULT_JOB_NAME: &str = "Quantum-Job";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Select { options: Vec<SelectOption> },
    /// An informational link rather than an input.
    Link { href: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormField {
    pub id: &'static str,
    pub label: &'static str,
    #[serde(flatten)]
    pub kind: FieldKind,
    pub default: Option<String>,
    pub required: bool,
}

/// The job form fields, in display order.
pub fn job_form_schema() -> Vec<FormField> {
    let options = HardwareBackend::ALL
        .iter()
        .map(|b| SelectOption {
            value: b.resource_key().to_string(),
            text: b.label().to_string(),
        })
        .collect();

    vec![
        FormField {
            id: FIELD_JOB_NAME,
            label: "Job Name",
            kind: FieldKind::Text,
            default: Some(DEFAULT_JOB_NAME.to_string()),
            required: true,
        },
        FormField {
            id: FIELD_HARDWARE_BACKEND,
            label: "Hardware Backend",
            kind: FieldKind::Select { options },
            default: Some(HardwareBackend::SingleGpu.resource_key().to_string()),
            required: true,
        },
        FormField {
            id: FIELD_GPU_MPI_COUNT,
            label: "Number of MPI Processes",
            kind: FieldKind::Number,
            default: Some(DEFAULT_MPI_PROCESSES.to_string()),
            required: false,
        },
        FormField {
            id: FIELD_QPU_INFO,
            label: "View QPU Info",
            kind: FieldKind::Link {
                href: "https://cdn.prod.website-files.com/6523f13a748909d3e1bbb657/672b3f81dacde04b62361579_IQM-Crystal20-topology.png".to_string(),
            },
            default: None,
            required: false,
        },
    ]
}

/// Whether `field_id` should be shown while `selected_backend` is picked.
///
/// The MPI count only applies to the MPI backend and the QPU info link only
/// to the QPU backend. An unrecognised selection hides both.
pub fn is_field_visible(field_id: &str, selected_backend: &str) -> bool {
    let backend = HardwareBackend::parse(selected_backend).ok();
    match field_id {
        FIELD_GPU_MPI_COUNT => backend == Some(HardwareBackend::MultiGpuMpi),
        FIELD_QPU_INFO => backend == Some(HardwareBackend::Qpu),
        _ => true,
    }
}

/// Raw values submitted from the job form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFormValues {
    pub job_name: String,
    pub hardware_backend: String,
    pub gpu_mpi_count: Option<String>,
}

impl Default for JobFormValues {
    fn default() -> Self {
        Self {
            job_name: DEFAULT_JOB_NAME.to_string(),
            hardware_backend: HardwareBackend::SingleGpu.resource_key().to_string(),
            gpu_mpi_count: Some(DEFAULT_MPI_PROCESSES.to_string()),
        }
    }
}

impl JobFormValues {
    /// Overlay these values onto `template`.
    pub fn build(&self, template: &JobDescriptor) -> Result<JobDescriptor, CoreError> {
        job_spec::build(
            template,
            &self.job_name,
            &self.hardware_backend,
            self.gpu_mpi_count.as_deref(),
        )
    }
}
