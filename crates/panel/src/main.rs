//! `q8s-panel` -- headless job submission panel.
//!
//! Builds a job descriptor from the configured form values, logs its diff
//! against the template, then connects to the kernel, submits the job and
//! logs every result until Ctrl-C.
//!
//! # Environment variables
//!
//! | Variable            | Required | Default          | Description                              |
//! |---------------------|----------|------------------|------------------------------------------|
//! | `KERNEL_WS_URL`     | no       | --               | Kernel endpoint, or `memory://echo`      |
//! | `COMM_TARGET`       | no       | `my_comm_target` | Comm target registered by the kernel     |
//! | `JOB_TEMPLATE_PATH` | no       | --               | JSON job template, baseline when unset   |
//! | `JOB_NAME`          | no       | `Quantum-Job`    | Job name                                 |
//! | `HARDWARE_BACKEND`  | no       | `q8s.com/gpu`    | Backend selector or resource key         |
//! | `LOG_FORMAT`        | no       | `text`           | `text` or `json`                         |
//!
//! See [`PanelConfig::from_env`] for the full list.

use q8s_core::job_spec::JobDescriptor;
use q8s_kernel::echo::echo_session;
use q8s_kernel::Session;
use q8s_panel::config::{LogFormat, PanelConfig, MEMORY_ECHO_URL};
use q8s_panel::panel::load_template;
use q8s_panel::{preview, submit_preview, SessionLifecycleController};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match PanelConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    init_tracing(config.log_format);

    let template = match &config.job_template_path {
        Some(path) => load_template(path).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to load job template");
            std::process::exit(1);
        }),
        None => JobDescriptor::baseline(),
    };

    let job = preview(&template, &config.form).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Job form rejected");
        std::process::exit(1);
    });

    tracing::info!(
        job = %job.descriptor.metadata.name,
        changed_lines = job.diff.changed_count(),
        "Job preview\n{}",
        job.diff.render(),
    );

    let Some(ws_url) = config.kernel_ws_url.as_deref() else {
        tracing::warn!("KERNEL_WS_URL not set, no backend selected");
        return;
    };

    let mut controller = SessionLifecycleController::new(config.channel.clone());
    let _results = controller.results().subscribe(|event| {
        tracing::info!(result = %event.value, received_at = %event.received_at, "Kernel result");
    });

    // Keeps the loopback kernel alive for the lifetime of the panel.
    let mut _echo = None;
    let session = if ws_url == MEMORY_ECHO_URL {
        let (session, handle) = echo_session(&config.session_name, &config.channel.target_name);
        _echo = Some(handle);
        session
    } else {
        let session = Session::new(&config.session_name);
        if let Err(e) = session.connect(ws_url).await {
            tracing::error!(ws_url = %ws_url, error = %e, "Kernel unreachable");
        }
        session
    };

    if let Err(e) = controller.select_backend(session) {
        tracing::error!(error = %e, "Failed to select kernel backend");
        return;
    }

    tracing::info!(
        ws_url = %ws_url,
        target = %config.channel.target_name,
        "Starting q8s-panel",
    );

    if let Err(e) = controller.start().await {
        tracing::error!(error = %e, "Panel is disconnected");
    } else if let Err(e) = submit_preview(&controller, &job) {
        tracing::error!(error = %e, "Job submission failed");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }

    tracing::info!(state = %controller.state(), "Shutting down");
    controller.dispose();
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "q8s_panel=info,q8s_kernel=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
