//! In-process loopback kernel.
//!
//! [`spawn_echo_kernel`] serves the kernel end of a [`memory_pair`]
//! transport. It accepts comms for one registered target, rejects every
//! other target, and answers each `{"code": ...}` request with
//! `{"result": ...}`:
//!
//! - integer sums such as `1+1` or `2 + 40` evaluate to their value;
//! - `submit_job(<json>)` answers `{"submitted": <metadata.name>}`;
//! - anything else is echoed back as a string.
//!
//! The returned [`EchoHandle`] can close comms or hang up, which is how
//! tests exercise kernel-initiated teardown.
//!
//! [`memory_pair`]: crate::transport::memory_pair

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::KernelError;
use crate::messages::{KernelFrame, ReplyStatus};
use crate::session::Session;
use crate::transport::{memory_pair, MemoryBackend};

enum EchoControl {
    CloseAll,
    Disconnect,
}

/// Control handle for a running loopback kernel.
pub struct EchoHandle {
    control: mpsc::UnboundedSender<EchoControl>,
    task: JoinHandle<()>,
}

impl EchoHandle {
    /// Close every open comm from the kernel side.
    pub fn close_all_comms(&self) -> Result<(), KernelError> {
        self.control
            .send(EchoControl::CloseAll)
            .map_err(|_| KernelError::Transport("Echo kernel stopped".to_string()))
    }

    /// Hang up the connection.
    pub fn disconnect(&self) -> Result<(), KernelError> {
        self.control
            .send(EchoControl::Disconnect)
            .map_err(|_| KernelError::Transport("Echo kernel stopped".to_string()))
    }

    /// Wait for the kernel task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Serve `backend` as a loopback kernel accepting comms for `target_name`.
pub fn spawn_echo_kernel(backend: MemoryBackend, target_name: impl Into<String>) -> EchoHandle {
    let (control, control_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_echo(backend, target_name.into(), control_rx));
    EchoHandle { control, task }
}

/// Build a ready [`Session`] connected to a fresh loopback kernel.
pub fn echo_session(name: impl Into<String>, target_name: impl Into<String>) -> (Session, EchoHandle) {
    let (transport, backend) = memory_pair();
    let handle = spawn_echo_kernel(backend, target_name);
    (Session::with_transport(name, transport), handle)
}

async fn run_echo(
    mut backend: MemoryBackend,
    target_name: String,
    mut control: mpsc::UnboundedReceiver<EchoControl>,
) {
    let mut open_comms: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            cmd = control.recv() => match cmd {
                Some(EchoControl::CloseAll) => {
                    for comm_id in open_comms.drain() {
                        let _ = backend.send(KernelFrame::comm_close(&comm_id));
                    }
                }
                Some(EchoControl::Disconnect) | None => break,
            },
            frame = backend.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = handle_frame(&backend, &target_name, &mut open_comms, frame) {
                    tracing::warn!(error = %e, "Echo kernel failed to reply");
                    break;
                }
            }
        }
    }

    tracing::debug!("Echo kernel stopped");
}

fn handle_frame(
    backend: &MemoryBackend,
    target_name: &str,
    open_comms: &mut HashSet<String>,
    frame: KernelFrame,
) -> Result<(), KernelError> {
    match frame {
        KernelFrame::CommOpen { content, .. } => {
            if content.target_name == target_name {
                open_comms.insert(content.comm_id.clone());
                backend.send(KernelFrame::comm_open_reply(
                    &content.comm_id,
                    ReplyStatus::Ok,
                    None,
                ))
            } else {
                backend.send(KernelFrame::comm_open_reply(
                    &content.comm_id,
                    ReplyStatus::Error,
                    Some(format!("No comm target named '{}'", content.target_name)),
                ))
            }
        }
        KernelFrame::CommMsg { content, .. } => {
            if !open_comms.contains(&content.comm_id) {
                return Ok(());
            }
            let code = content.code().unwrap_or_default();
            backend.send(KernelFrame::comm_msg(
                &content.comm_id,
                serde_json::json!({ "result": evaluate(code) }),
            ))
        }
        KernelFrame::CommClose { content, .. } => {
            open_comms.remove(&content.comm_id);
            Ok(())
        }
        KernelFrame::CommOpenReply { .. } => Ok(()),
    }
}

/// Evaluate the tiny expression language the loopback kernel understands.
pub fn evaluate(code: &str) -> serde_json::Value {
    if let Some(sum) = evaluate_sum(code) {
        return serde_json::json!(sum);
    }
    if let Some(args) = code
        .trim()
        .strip_prefix("submit_job(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        if let Ok(job) = serde_json::from_str::<serde_json::Value>(args) {
            return serde_json::json!({ "submitted": job["metadata"]["name"] });
        }
    }
    serde_json::Value::String(code.to_string())
}

fn evaluate_sum(code: &str) -> Option<i64> {
    code.split('+')
        .map(|term| term.trim().parse::<i64>().ok())
        .try_fold(0i64, |acc, term| acc.checked_add(term?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_integer_sums() {
        assert_eq!(evaluate("1+1"), serde_json::json!(2));
        assert_eq!(evaluate(" 2 + 40 "), serde_json::json!(42));
        assert_eq!(evaluate("-3+1"), serde_json::json!(-2));
    }

    #[test]
    fn echoes_unknown_code() {
        assert_eq!(evaluate("print('hi')"), serde_json::json!("print('hi')"));
        assert_eq!(evaluate("1+"), serde_json::json!("1+"));
    }

    #[test]
    fn acknowledges_job_submission() {
        let code = r#"submit_job({"metadata":{"name":"demo"}})"#;
        assert_eq!(evaluate(code), serde_json::json!({"submitted": "demo"}));
    }
}
