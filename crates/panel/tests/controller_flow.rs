//! End-to-end panel flow against the loopback kernel.

use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::mpsc;

use q8s_core::form::JobFormValues;
use q8s_core::job_spec::JobDescriptor;
use q8s_events::Subscription;
use q8s_kernel::echo::echo_session;
use q8s_kernel::messages::{KernelFrame, ReplyStatus};
use q8s_kernel::transport::memory_pair;
use q8s_kernel::{ChannelState, KernelError, Session, SessionState};
use q8s_panel::{
    preview, submit_preview, ChannelConfig, ControllerState, PanelError,
    SessionLifecycleController,
};

const TARGET: &str = "my_comm_target";
const WAIT: Duration = Duration::from_secs(2);

fn config() -> ChannelConfig {
    ChannelConfig {
        ready_timeout: Duration::from_millis(200),
        open_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Forward every broadcast result into a queue.
fn collect(
    controller: &SessionLifecycleController,
) -> (Subscription, mpsc::UnboundedReceiver<serde_json::Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = controller.results().subscribe(move |event| {
        let _ = tx.send(event.value.clone());
    });
    (sub, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<serde_json::Value>) -> serde_json::Value {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a result")
        .expect("result queue closed")
}

async fn wait_for_state(controller: &SessionLifecycleController, expected: ControllerState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while controller.state() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "controller stuck in {}",
            controller.state()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Test: connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_sends_probe_and_broadcasts_result() {
    let (session, _kernel) = echo_session("kernel", TARGET);
    let mut controller = SessionLifecycleController::with_session(config(), session);
    let (_sub, mut results) = collect(&controller);

    controller.start().await.unwrap();

    assert_eq!(controller.state(), ControllerState::ChannelActive);
    let channel = controller.channel().expect("channel kept after start");
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.target_name(), Some(TARGET));
    assert_eq!(next(&mut results).await, serde_json::json!(2));
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let (session, _kernel) = echo_session("kernel", TARGET);
    let mut controller = SessionLifecycleController::with_session(config(), session);
    let (_sub, mut results) = collect(&controller);

    controller.start().await.unwrap();
    let comm_id = controller.channel().unwrap().comm_id().to_string();
    assert_eq!(next(&mut results).await, serde_json::json!(2));

    controller.start().await.unwrap();
    assert_eq!(controller.channel().unwrap().comm_id(), comm_id);

    // No second probe was sent.
    let extra = tokio::time::timeout(Duration::from_millis(50), results.recv()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn unready_session_fails_without_channel() {
    let session = Session::new("unconnected");
    let mut controller = SessionLifecycleController::with_session(config(), session);

    assert_matches!(
        controller.start().await,
        Err(PanelError::Kernel(KernelError::NoBackend(_)))
    );
    assert_eq!(controller.state(), ControllerState::Error);
    assert!(controller.channel().is_none());
}

#[tokio::test]
async fn unknown_target_is_channel_setup_error() {
    let (session, _kernel) = echo_session("kernel", "another_target");
    let mut controller = SessionLifecycleController::with_session(config(), session);

    assert_matches!(
        controller.start().await,
        Err(PanelError::Kernel(KernelError::ChannelSetup(_)))
    );
    assert_eq!(controller.state(), ControllerState::Error);
    assert!(controller.channel().is_none());
}

#[tokio::test]
async fn failed_probe_is_channel_setup_error() {
    let (transport, mut backend) = memory_pair();
    let session = Session::with_transport("kernel", transport);

    // Accept the comm, then hang up before the probe can be sent.
    let kernel = tokio::spawn(async move {
        if let Some(KernelFrame::CommOpen { content, .. }) = backend.recv().await {
            let _ = backend.send(KernelFrame::comm_open_reply(
                &content.comm_id,
                ReplyStatus::Ok,
                None,
            ));
        }
    });

    let mut controller = SessionLifecycleController::with_session(config(), session);
    assert_matches!(
        controller.start().await,
        Err(PanelError::Kernel(KernelError::ChannelSetup(msg))) if msg.contains("probe")
    );
    assert_eq!(controller.state(), ControllerState::Error);
    assert!(controller.channel().is_none());
    kernel.await.unwrap();
}

#[tokio::test]
async fn kernel_close_degrades_until_restarted() {
    let (session, kernel) = echo_session("kernel", TARGET);
    let mut controller = SessionLifecycleController::with_session(config(), session);
    let (_sub, mut results) = collect(&controller);

    controller.start().await.unwrap();
    assert_eq!(next(&mut results).await, serde_json::json!(2));

    kernel.close_all_comms().unwrap();
    wait_for_state(&controller, ControllerState::Error).await;

    assert_matches!(
        controller.submit(&JobDescriptor::baseline()),
        Err(PanelError::Kernel(KernelError::ChannelClosed))
    );

    // A manual retry opens a fresh comm on the same session.
    controller.start().await.unwrap();
    assert_eq!(controller.state(), ControllerState::ChannelActive);
    assert_eq!(next(&mut results).await, serde_json::json!(2));
}

#[tokio::test]
async fn select_backend_switches_sessions() {
    let (first, _k1) = echo_session("first", TARGET);
    let (second, _k2) = echo_session("second", TARGET);
    let mut controller = SessionLifecycleController::with_session(config(), first);
    let (_sub, mut results) = collect(&controller);

    controller.start().await.unwrap();
    assert_eq!(next(&mut results).await, serde_json::json!(2));

    controller.select_backend(second).unwrap();
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(controller.channel().is_none());

    controller.start().await.unwrap();
    assert_eq!(controller.session().unwrap().name(), "second");
    assert_eq!(next(&mut results).await, serde_json::json!(2));
}

#[tokio::test]
async fn dispose_closes_everything() {
    let (session, _kernel) = echo_session("kernel", TARGET);
    let mut watch = session.watch_state();
    let mut controller = SessionLifecycleController::with_session(config(), session);
    controller.start().await.unwrap();

    controller.dispose();
    assert_eq!(controller.state(), ControllerState::Disposed);
    assert!(controller.channel().is_none());
    assert!(controller.session().is_none());
    assert_eq!(*watch.borrow_and_update(), SessionState::Disconnected);

    assert_matches!(controller.start().await, Err(PanelError::Disposed));
}

// ---------------------------------------------------------------------------
// Test: configure, preview, confirm
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmed_preview_is_submitted() {
    let (session, _kernel) = echo_session("kernel", TARGET);
    let mut controller = SessionLifecycleController::with_session(config(), session);
    let (_sub, mut results) = collect(&controller);
    controller.start().await.unwrap();
    assert_eq!(next(&mut results).await, serde_json::json!(2));

    let values = JobFormValues {
        job_name: "bell-state".to_string(),
        hardware_backend: "q8s.com/gpu-mpi".to_string(),
        gpu_mpi_count: Some("4".to_string()),
    };
    let job = preview(&JobDescriptor::baseline(), &values).unwrap();
    assert!(job.diff.has_changes());

    submit_preview(&controller, &job).unwrap();
    assert_eq!(
        next(&mut results).await,
        serde_json::json!({ "submitted": "bell-state" })
    );
}

#[tokio::test]
async fn invalid_form_never_reaches_the_kernel() {
    let (session, _kernel) = echo_session("kernel", TARGET);
    let mut controller = SessionLifecycleController::with_session(config(), session);
    let (_sub, mut results) = collect(&controller);
    controller.start().await.unwrap();
    assert_eq!(next(&mut results).await, serde_json::json!(2));

    let values = JobFormValues {
        job_name: String::new(),
        ..Default::default()
    };
    assert_matches!(
        preview(&JobDescriptor::baseline(), &values),
        Err(PanelError::Core(_))
    );

    let nothing = tokio::time::timeout(Duration::from_millis(50), results.recv()).await;
    assert!(nothing.is_err());
}
