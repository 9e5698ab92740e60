//! Comm wire frames and parser.
//!
//! Every frame is a JSON object tagged by `msg_type`, carrying a `header`
//! (with a per-message id used for tracing) and a `content` object keyed by
//! `comm_id`. This module (de)serializes them into [`KernelFrame`].

use serde::{Deserialize, Serialize};

/// Per-frame header. `msg_id` is unique per outbound frame and is not used
/// for request/response correlation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(default)]
    pub msg_id: String,
}

impl MessageHeader {
    pub fn new() -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// All comm frame types exchanged with the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum KernelFrame {
    /// Client asks the kernel to open a comm for `target_name`.
    #[serde(rename = "comm_open")]
    CommOpen {
        #[serde(default)]
        header: MessageHeader,
        content: CommOpenContent,
    },

    /// Kernel accepts or rejects a `comm_open`.
    #[serde(rename = "comm_open_reply")]
    CommOpenReply {
        #[serde(default)]
        header: MessageHeader,
        content: CommOpenReplyContent,
    },

    /// Data in either direction on an open comm.
    #[serde(rename = "comm_msg")]
    CommMsg {
        #[serde(default)]
        header: MessageHeader,
        content: CommMsgContent,
    },

    /// Either side tears the comm down.
    #[serde(rename = "comm_close")]
    CommClose {
        #[serde(default)]
        header: MessageHeader,
        content: CommCloseContent,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpenContent {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpenReplyContent {
    pub comm_id: String,
    pub status: ReplyStatus,
    /// Why the kernel rejected the open, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommMsgContent {
    pub comm_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CommMsgContent {
    /// The `data.result` value of a kernel reply, if present.
    pub fn result(&self) -> Option<&serde_json::Value> {
        self.data.get("result")
    }

    /// The `data.code` expression of a client request, if present.
    pub fn code(&self) -> Option<&str> {
        self.data.get("code").and_then(|c| c.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommCloseContent {
    pub comm_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl KernelFrame {
    pub fn comm_open(comm_id: &str, target_name: &str) -> Self {
        Self::CommOpen {
            header: MessageHeader::new(),
            content: CommOpenContent {
                comm_id: comm_id.to_string(),
                target_name: target_name.to_string(),
                data: serde_json::json!({}),
            },
        }
    }

    pub fn comm_open_reply(comm_id: &str, status: ReplyStatus, reason: Option<String>) -> Self {
        Self::CommOpenReply {
            header: MessageHeader::new(),
            content: CommOpenReplyContent {
                comm_id: comm_id.to_string(),
                status,
                reason,
            },
        }
    }

    pub fn comm_msg(comm_id: &str, data: serde_json::Value) -> Self {
        Self::CommMsg {
            header: MessageHeader::new(),
            content: CommMsgContent {
                comm_id: comm_id.to_string(),
                data,
            },
        }
    }

    /// A client request asking the kernel to evaluate `code`.
    pub fn execute(comm_id: &str, code: &str) -> Self {
        Self::comm_msg(comm_id, serde_json::json!({ "code": code }))
    }

    pub fn comm_close(comm_id: &str) -> Self {
        Self::CommClose {
            header: MessageHeader::new(),
            content: CommCloseContent {
                comm_id: comm_id.to_string(),
                data: serde_json::json!({}),
            },
        }
    }

    pub fn comm_id(&self) -> &str {
        match self {
            Self::CommOpen { content, .. } => &content.comm_id,
            Self::CommOpenReply { content, .. } => &content.comm_id,
            Self::CommMsg { content, .. } => &content.comm_id,
            Self::CommClose { content, .. } => &content.comm_id,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            Self::CommOpen { header, .. }
            | Self::CommOpenReply { header, .. }
            | Self::CommMsg { header, .. }
            | Self::CommClose { header, .. } => header,
        }
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::CommOpen { .. } => "comm_open",
            Self::CommOpenReply { .. } => "comm_open_reply",
            Self::CommMsg { .. } => "comm_msg",
            Self::CommClose { .. } => "comm_close",
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parse a text frame into a typed [`KernelFrame`].
///
/// Returns `Err` for malformed JSON or unknown `msg_type` values.
/// Callers should log and skip such frames.
pub fn parse_frame(text: &str) -> Result<KernelFrame, serde_json::Error> {
    serde_json::from_str(text)
}
