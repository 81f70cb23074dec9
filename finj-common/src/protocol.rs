//! Controller/engine wire protocol.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON object tagged
//! by its `type` field. One persistent TCP stream carries frames in both
//! directions for a controller/engine pair.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{SeqNum, SessionEpoch, StatusEvent, Task};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("Connection closed in the middle of a frame")]
    TruncatedFrame,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Claim (or reclaim) mastership of an engine.
    #[serde(rename = "command_session_s")]
    SessionStart(SessionStart),

    /// Release mastership.
    #[serde(rename = "command_session_e")]
    SessionEnd { epoch: SessionEpoch },

    /// Run a task. The timestamp is absolute.
    #[serde(rename = "command_start")]
    TaskCommand(Task),

    #[serde(rename = "command_greet")]
    Greet,

    /// Shut the engine down; only honoured from the master.
    #[serde(rename = "command_term")]
    Terminate,

    #[serde(rename = "ack_session")]
    SessionAck(SessionAck),

    #[serde(rename = "ack_task")]
    TaskAck {
        #[serde(rename = "seqNum")]
        seq_num: SeqNum,
    },

    #[serde(rename = "status_greet")]
    GreetReply(GreetReply),

    #[serde(rename = "status")]
    Status(StatusEvent),
}

impl Message {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStart(_) => "command_session_s",
            Self::SessionEnd { .. } => "command_session_e",
            Self::TaskCommand(_) => "command_start",
            Self::Greet => "command_greet",
            Self::Terminate => "command_term",
            Self::SessionAck(_) => "ack_session",
            Self::TaskAck { .. } => "ack_task",
            Self::GreetReply(_) => "status_greet",
            Self::Status(_) => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    pub epoch: SessionEpoch,
    /// Absolute session start time (unix seconds).
    pub timestamp: i64,
    /// Drop any tasks the engine kept for this epoch instead of recovering
    /// them.
    #[serde(default)]
    pub fresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAck {
    pub epoch: SessionEpoch,
    pub accepted: bool,
    /// The engine kept the TaskRuns of this epoch across a disconnect.
    #[serde(default)]
    pub recovered: bool,
    /// The engine served this epoch before. Every event it produced for the
    /// epoch, a `status_reset` included, is delivered on this connection.
    #[serde(default)]
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GreetReply {
    pub active_tasks: usize,
    pub mastered: bool,
}

/// Write one message as a length-prefixed frame and flush it.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::TruncatedFrame)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut body).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::TruncatedFrame,
            _ => ProtocolError::Io(e),
        });
    }
    Ok(Some(serde_json::from_slice(&body)?))
}
