//! Chunk streaming from a running flow to its caller.
//!
//! Over HTTP a stream is framed as newline-delimited JSON: one line per
//! chunk, an empty line as terminator, then the final [`Operation`] on its
//! own line.

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::engine::types::{Operation, OperationResult};
use crate::error::FlowError;

/// A flow started with a chunk consumer attached.
pub struct FlowStream {
    pub flow_id: String,
    /// Chunks in emission order. Closes when the run finishes or blocks.
    pub chunks: UnboundedReceiver<Value>,
    output: JoinHandle<Result<Operation, FlowError>>,
}

impl FlowStream {
    pub(crate) fn new(
        flow_id: String,
        chunks: UnboundedReceiver<Value>,
        output: JoinHandle<Result<Operation, FlowError>>,
    ) -> Self {
        Self {
            flow_id,
            chunks,
            output,
        }
    }

    /// Wait for the run to finish or block and return its operation.
    pub async fn output(self) -> Result<Operation, FlowError> {
        self.output.await.map_err(|e| FlowError::Execution {
            message: format!("flow task ended abnormally: {}", e),
            stacktrace: None,
        })?
    }

    /// Collect every remaining chunk, then the operation.
    pub async fn collect(mut self) -> Result<(Vec<Value>, Operation), FlowError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.chunks.recv().await {
            chunks.push(chunk);
        }
        let operation = self.output().await?;
        Ok((chunks, operation))
    }
}

/// Frame one chunk as a line.
pub fn encode_chunk(chunk: &Value) -> String {
    format!("{}\n", chunk)
}

/// Frame the terminator and the final operation.
pub fn encode_final(operation: &Operation) -> String {
    let body = serde_json::to_string(operation).unwrap_or_else(|e| {
        format!(
            r#"{{"name":{},"done":true,"result":{{"error":"failed to encode operation: {}"}}}}"#,
            Value::String(operation.name.clone()),
            e
        )
    });
    format!("\n{}\n", body)
}

/// Operation reported to a streaming client when the run could not produce one.
pub fn failed_operation(flow_id: &str, err: &FlowError) -> Operation {
    Operation {
        name: flow_id.to_string(),
        done: true,
        blocked_on_step: None,
        result: Some(OperationResult {
            response: None,
            error: Some(err.to_string()),
            stacktrace: None,
        }),
    }
}

/// Decoded element of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(Value),
    Done(Operation),
}

/// Incremental decoder for the framing produced by [`encode_chunk`] and
/// [`encode_final`]. Feed it bytes as they arrive.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    terminated: bool,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete event they produced.
    pub fn push(&mut self, bytes: &[u8]) -> anyhow::Result<Vec<StreamEvent>> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = std::str::from_utf8(&raw)?;
            let line = line.trim_end_matches(['\n', '\r']);
            if self.finished {
                continue;
            }
            if line.is_empty() {
                self.terminated = true;
                continue;
            }
            if self.terminated {
                let operation: Operation = serde_json::from_str(line)?;
                self.finished = true;
                events.push(StreamEvent::Done(operation));
            } else {
                events.push(StreamEvent::Chunk(serde_json::from_str(line)?));
            }
        }

        Ok(events)
    }

    /// Flush a trailing operation that was not newline-terminated.
    pub fn finish(&mut self) -> anyhow::Result<Option<Operation>> {
        if self.finished {
            return Ok(None);
        }
        let rest = std::str::from_utf8(&self.buf)?.trim();
        if self.terminated && !rest.is_empty() {
            let operation = serde_json::from_str(rest)?;
            self.finished = true;
            self.buf.clear();
            return Ok(Some(operation));
        }
        anyhow::bail!("stream ended before the final operation")
    }
}
