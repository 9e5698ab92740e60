//! Configure, preview, confirm.
//!
//! [`preview`] turns the submitted form values into a descriptor and a
//! line diff against the template. Nothing reaches the kernel until the
//! owner confirms the preview with [`submit_preview`].

use std::path::Path;

use q8s_core::diff::{self, DiffRecord};
use q8s_core::form::JobFormValues;
use q8s_core::job_spec::JobDescriptor;

use crate::controller::SessionLifecycleController;
use crate::error::PanelError;

/// A built descriptor awaiting confirmation.
#[derive(Debug, Clone)]
pub struct JobPreview {
    pub descriptor: JobDescriptor,
    /// Line diff of the template against `descriptor`.
    pub diff: DiffRecord,
}

/// Build the descriptor for `values` and diff it against `template`.
///
/// Invalid input (empty job name, unknown backend) fails with
/// [`PanelError::Core`] and produces no preview.
pub fn preview(template: &JobDescriptor, values: &JobFormValues) -> Result<JobPreview, PanelError> {
    let descriptor = values.build(template)?;
    let diff = diff::diff(template, &descriptor)?;

    tracing::debug!(
        job = %descriptor.metadata.name,
        changed_lines = diff.changed_count(),
        "Job preview built",
    );

    Ok(JobPreview { descriptor, diff })
}

/// Send a confirmed preview to the kernel.
pub fn submit_preview(
    controller: &SessionLifecycleController,
    preview: &JobPreview,
) -> Result<(), PanelError> {
    controller.submit(&preview.descriptor)
}

/// Read a JSON job descriptor to use as the template.
pub fn load_template(path: &Path) -> Result<JobDescriptor, PanelError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PanelError::Config(format!("Failed to read job template {}: {e}", path.display()))
    })?;
    JobDescriptor::from_json(&text).map_err(|e| {
        PanelError::Config(format!("Invalid job template {}: {e}", path.display()))
    })
}
