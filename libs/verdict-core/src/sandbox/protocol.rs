//! Line protocol between the grading process and the in-sandbox harness.
//!
//! The harness writes one startup line, then answers each request line with
//! exactly one reply line. Expected outputs never cross this boundary.

use super::{CallOutcome, Invocation, LoadError};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("sandbox closed the channel")]
    Closed,
    #[error("sandbox reply exceeded {limit} bytes")]
    Oversized { limit: usize },
    #[error("malformed sandbox message: {0}")]
    Malformed(String),
    #[error("sandbox channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailureKind {
    CompileError,
    DefinitionMissing,
}

/// First message written by the harness
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Startup {
    Loaded,
    LoadFailed { kind: LoadFailureKind, message: String },
}

impl Startup {
    pub fn into_result(self) -> Result<(), LoadError> {
        match self {
            Startup::Loaded => Ok(()),
            Startup::LoadFailed {
                kind: LoadFailureKind::CompileError,
                message,
            } => Err(LoadError::Compile(message)),
            Startup::LoadFailed {
                kind: LoadFailureKind::DefinitionMissing,
                message,
            } => Err(LoadError::DefinitionMissing(message)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyFailure {
    RuntimeError,
    ResourceExceeded,
    Unserializable,
}

/// Answer to one call request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub kind: Option<ReplyFailure>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub traceback: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl From<Reply> for CallOutcome {
    fn from(reply: Reply) -> Self {
        if reply.ok {
            return CallOutcome::Returned {
                value: reply.value,
                stdout: reply.stdout,
                stderr: reply.stderr,
            };
        }

        match reply.kind.unwrap_or(ReplyFailure::RuntimeError) {
            ReplyFailure::RuntimeError => CallOutcome::Raised {
                message: reply.message,
                traceback: reply.traceback,
                stderr: reply.stderr,
            },
            ReplyFailure::ResourceExceeded => CallOutcome::ResourceExceeded {
                message: reply.message,
            },
            ReplyFailure::Unserializable => CallOutcome::Unrepresentable {
                message: reply.message,
            },
        }
    }
}

/// Bidirectional JSON-lines channel to one harness instance
pub struct HarnessChannel {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    max_response_bytes: usize,
}

impl HarnessChannel {
    pub fn new(
        reader: Box<dyn AsyncBufRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        max_response_bytes: usize,
    ) -> Self {
        Self {
            reader,
            writer,
            max_response_bytes,
        }
    }

    async fn read_line(&mut self) -> Result<String, ChannelError> {
        let limit = self.max_response_bytes as u64 + 1;
        let mut buf = Vec::new();

        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;

        if read == 0 {
            return Err(ChannelError::Closed);
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() as u64 >= limit {
                return Err(ChannelError::Oversized {
                    limit: self.max_response_bytes,
                });
            }
            return Err(ChannelError::Closed);
        }

        String::from_utf8(buf).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    /// Wait for the harness to report whether the submission loaded
    pub async fn startup(&mut self) -> Result<Startup, ChannelError> {
        let line = self.read_line().await?;
        serde_json::from_str(line.trim_end()).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    /// Send one invocation and wait for its reply
    pub async fn call(&mut self, invocation: &Invocation) -> Result<Reply, ChannelError> {
        let mut payload =
            serde_json::to_vec(invocation).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        payload.push(b'\n');

        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;

        let line = self.read_line().await?;
        serde_json::from_str(line.trim_end()).map_err(|e| ChannelError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn channel(script: &str, max_response_bytes: usize) -> HarnessChannel {
        HarnessChannel::new(
            Box::new(Cursor::new(script.as_bytes().to_vec())),
            Box::new(tokio::io::sink()),
            max_response_bytes,
        )
    }

    #[tokio::test]
    async fn test_startup_loaded() {
        let mut ch = channel("{\"event\":\"loaded\"}\n", 1024);
        assert_eq!(ch.startup().await.unwrap(), Startup::Loaded);
    }

    #[tokio::test]
    async fn test_startup_load_failed() {
        let mut ch = channel(
            "{\"event\":\"load_failed\",\"kind\":\"definition_missing\",\"message\":\"no add\"}\n",
            1024,
        );
        let startup = ch.startup().await.unwrap();
        assert!(matches!(
            startup.into_result(),
            Err(LoadError::DefinitionMissing(m)) if m == "no add"
        ));
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let mut ch = channel(
            "{\"ok\":true,\"value\":5,\"stdout\":\"hi\\n\",\"stderr\":\"\"}\n",
            1024,
        );
        let invocation = Invocation::from_input(&json!({"a": 2, "b": 3}));
        let reply = ch.call(&invocation).await.unwrap();
        assert_eq!(
            CallOutcome::from(reply),
            CallOutcome::Returned {
                value: json!(5),
                stdout: "hi\n".to_string(),
                stderr: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_failure_replies() {
        let mut ch = channel(
            concat!(
                "{\"ok\":false,\"kind\":\"runtime_error\",\"message\":\"ZeroDivisionError: division by zero\",\"traceback\":\"tb\"}\n",
                "{\"ok\":false,\"kind\":\"resource_exceeded\",\"message\":\"MemoryError\"}\n",
                "{\"ok\":false,\"kind\":\"unserializable\",\"message\":\"object\"}\n",
            ),
            1024,
        );
        let invocation = Invocation::Positional(vec![]);

        let first = CallOutcome::from(ch.call(&invocation).await.unwrap());
        assert!(matches!(first, CallOutcome::Raised { ref message, .. } if message.starts_with("ZeroDivisionError")));

        let second = CallOutcome::from(ch.call(&invocation).await.unwrap());
        assert!(matches!(second, CallOutcome::ResourceExceeded { .. }));

        let third = CallOutcome::from(ch.call(&invocation).await.unwrap());
        assert!(matches!(third, CallOutcome::Unrepresentable { .. }));
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let mut ch = channel("", 1024);
        assert!(matches!(ch.startup().await, Err(ChannelError::Closed)));

        let mut partial = channel("{\"event\":", 1024);
        assert!(matches!(partial.startup().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_reply() {
        let big = format!("{{\"ok\":true,\"value\":\"{}\"}}\n", "x".repeat(200));
        let mut ch = channel(&big, 64);
        let result = ch.call(&Invocation::Positional(vec![])).await;
        assert!(matches!(result, Err(ChannelError::Oversized { limit: 64 })));
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let mut ch = channel("not json\n", 1024);
        assert!(matches!(ch.startup().await, Err(ChannelError::Malformed(_))));
    }
}
