use futures::{Stream, StreamExt};
use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tonic::{Status, Streaming};

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::errors::{TransferError, TransferResult};
use crate::generated::ReadResponse;

const MIB: u64 = 1024 * 1024;

/// Read side of a `Get` stream. Chunk boundaries never leak to the caller:
/// bytes a short destination buffer could not take are kept and handed out by
/// the next `read` before the transport is asked for another chunk.
pub struct KvReader<S = Streaming<ReadResponse>> {
    stream: S,
    resource_name: String,
    leftover: Vec<u8>,
    leftover_pos: usize,
    bytes_read: u64,
}

impl<S> KvReader<S>
where
    S: Stream<Item = Result<ReadResponse, Status>> + Unpin,
{
    pub fn new(resource_name: impl Into<String>, stream: S) -> Self {
        Self {
            stream,
            resource_name: resource_name.into(),
            leftover: Vec::new(),
            leftover_pos: 0,
            bytes_read: 0,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means the remote finished the stream (or `buf` is empty). A remote
    /// `NOT_FOUND` is returned as a cache-miss error, never as end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.log_progress(buf.len());

        if self.leftover_pos < self.leftover.len() {
            let pending = &self.leftover[self.leftover_pos..];
            let n = pending.len().min(buf.len());
            buf[..n].copy_from_slice(&pending[..n]);
            self.leftover_pos += n;
            self.bytes_read += n as u64;
            return Ok(n);
        }
        self.leftover.clear();
        self.leftover_pos = 0;

        loop {
            let response = match self.stream.next().await {
                None => return Ok(0),
                Some(Err(status)) => {
                    return Err(TransferError::from_status(
                        "stream receive",
                        &self.resource_name,
                        status,
                    ))
                }
                Some(Ok(response)) => response,
            };
            // An empty frame carries nothing; it must not read as end of stream.
            if response.data.is_empty() {
                continue;
            }

            let n = response.data.len().min(buf.len());
            buf[..n].copy_from_slice(&response.data[..n]);
            if n < response.data.len() {
                self.leftover = response.data;
                self.leftover_pos = n;
            }
            self.bytes_read += n as u64;
            return Ok(n);
        }
    }

    /// Drains the whole resource into `sink` and returns the byte count.
    pub async fn copy_to<W>(&mut self, sink: &mut W) -> TransferResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; DEFAULT_CHUNK_SIZE];
        let mut copied = 0u64;
        loop {
            let n = self.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buffer[..n])
                .await
                .map_err(|err| TransferError::local_io("writing download sink", err))?;
            copied += n as u64;
        }
        sink.flush()
            .await
            .map_err(|err| TransferError::local_io("flushing download sink", err))?;
        Ok(copied)
    }

    /// Drops any buffered bytes. Safe to call more than once.
    pub fn close(&mut self) {
        self.leftover = Vec::new();
        self.leftover_pos = 0;
    }

    fn log_progress(&self, len: usize) {
        let sum = self.bytes_read;
        if sum == 0 {
            debug!("reading {} bytes", len);
        } else if (len as u64) < MIB || (sum > MIB && (sum / MIB) % 10 == 0) {
            debug!(
                "reading {} bytes. Sum read {:.2}MB",
                len,
                sum as f64 / MIB as f64
            );
        }
    }
}
