use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Status;

use crate::errors::{ErrorKind, TransferError, TransferResult};
use crate::generated::{WriteRequest, WriteResponse};
use crate::pipeline::ChunkSink;

/// Outgoing chunks buffered ahead of the RPC before `write` waits.
pub(crate) const WRITE_QUEUE_DEPTH: usize = 4;

const MIB: i64 = 1024 * 1024;

/// Write side of a `Put` stream: each `write` becomes one chunk stamped with the
/// running byte offset, `close` sends the terminal chunk and waits for the ack.
pub struct KvWriter {
    resource_name: String,
    offset: i64,
    tx: Option<mpsc::Sender<WriteRequest>>,
    response: Option<JoinHandle<Result<WriteResponse, Status>>>,
}

impl KvWriter {
    pub(crate) fn new(
        resource_name: String,
        tx: mpsc::Sender<WriteRequest>,
        response: JoinHandle<Result<WriteResponse, Status>>,
    ) -> Self {
        Self {
            resource_name,
            offset: 0,
            tx: Some(tx),
            response: Some(response),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Bytes accepted so far; also the offset of the next chunk.
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    /// Sends `data` as a single chunk at the current offset.
    ///
    /// A remote that already finished the call yields `StreamClosed`; a remote
    /// that failed it yields a `Transport` error carrying the status.
    pub async fn write(&mut self, data: &[u8]) -> TransferResult<usize> {
        log_progress(self.offset, data.len());

        let request = WriteRequest {
            resource_name: self.resource_name.clone(),
            write_offset: self.offset,
            finish_write: false,
            data: data.to_vec(),
        };
        let sent = match &self.tx {
            Some(tx) => tx.send(request).await.is_ok(),
            None => false,
        };
        if !sent {
            let err = self.remote_outcome("send data").await;
            if err.kind == ErrorKind::Transport {
                error!("error sending data: {err}");
            }
            return Err(err);
        }

        self.offset += data.len() as i64;
        Ok(data.len())
    }

    /// Sends the terminal chunk and waits for the server's acknowledgment.
    pub async fn close(mut self) -> TransferResult<WriteResponse> {
        debug!("sending finish write");
        let request = WriteRequest {
            resource_name: self.resource_name.clone(),
            write_offset: self.offset,
            finish_write: true,
            data: Vec::new(),
        };
        let sent = match self.tx.take() {
            Some(tx) => tx.send(request).await.is_ok(),
            None => false,
        };
        if !sent {
            let cause = self.remote_outcome("send finish write").await;
            error!("error sending finish write: {cause}");
            return Err(TransferError::finalize("send finish write").with_source(cause));
        }

        debug!("closing stream");
        let handle = self
            .response
            .take()
            .ok_or_else(|| TransferError::finalize("close stream: call already completed"))?;
        let response = match handle.await {
            Ok(Ok(response)) => response,
            Ok(Err(status)) => {
                error!("error closing stream: {}", status.message());
                return Err(TransferError::finalize(format!(
                    "close stream: {}",
                    status.message()
                ))
                .with_source(status));
            }
            Err(join) => {
                return Err(
                    TransferError::finalize("close stream: put task failed").with_source(join),
                );
            }
        };

        if response.committed_size != self.offset {
            warn!(
                "server committed {} bytes of {} for {}",
                response.committed_size, self.offset, self.resource_name
            );
        }
        Ok(response)
    }

    /// Resolves why the outgoing channel refused a chunk: the call has ended, so
    /// its result says whether that was a clean finish or a failure.
    async fn remote_outcome(&mut self, context: &str) -> TransferError {
        self.tx = None;
        let Some(handle) = self.response.take() else {
            return TransferError::stream_closed();
        };
        match handle.await {
            Ok(Ok(_)) => TransferError::stream_closed(),
            Ok(Err(status)) => {
                TransferError::transport(format!("{context}: {}", status.message()))
                    .with_source(status)
            }
            Err(join) => {
                TransferError::transport(format!("{context}: put task failed")).with_source(join)
            }
        }
    }
}

impl Drop for KvWriter {
    fn drop(&mut self) {
        // An unfinished call must not outlive its attempt.
        if let Some(handle) = self.response.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ChunkSink for KvWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<usize> {
        self.write(data).await
    }
}

fn log_progress(offset: i64, len: usize) {
    if offset == 0 {
        debug!("sending write request {} bytes", len);
    } else if (len as i64) < MIB || (offset > MIB && (offset / MIB) % 10 == 0) {
        debug!(
            "sending write request {} bytes @ offset {:.2}MB",
            len,
            offset as f64 / MIB as f64
        );
    }
}
