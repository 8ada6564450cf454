//! Save and restore flows.
//!
//! Uploads run every attempt against a freshly dialed channel under the retry
//! policy; nothing but the key and checksum carries over between attempts.
//! Downloads run once: a cache miss is a normal outcome, and a half-fed
//! extraction cannot be replayed.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use indicatif::HumanBytes;
use log::{debug, info, warn};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::archive::{compress_command, extract_command, extract_from};
use crate::checksum::{sha256_file, soft_checksum};
use crate::config::TransferConfig;
use crate::errors::{ErrorKind, TransferError, TransferResult};
use crate::pipeline::{Producer, SpillPipeline};
use crate::remote::{KvClient, PutParams};
use crate::retry::AttemptError;

pub fn archive_key(branch: &str) -> String {
    format!("{branch}-archive-stream")
}

pub fn metadata_key(branch: &str) -> String {
    format!("{branch}-metadata-stream")
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub resource_name: String,
    pub bytes: u64,
    pub attempts: u32,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub resource_name: String,
    pub bytes: u64,
}

/// Uploads an existing file under `key`, validated against its SHA-256 when it
/// can be computed.
pub async fn upload_file(config: &TransferConfig, path: &Path, key: &str) -> Result<UploadReport> {
    upload_file_with(config, path, key, sha256_file).await
}

/// [`upload_file`] with the digest computed by `checksum`. A failing checksum
/// only drops validation; the upload still goes ahead.
pub async fn upload_file_with<F>(
    config: &TransferConfig,
    path: &Path,
    key: &str,
    checksum: F,
) -> Result<UploadReport>
where
    F: FnOnce(&Path) -> TransferResult<String> + Send + 'static,
{
    info!("uploading {} to {}", path.display(), config.endpoint);
    let checksum = soft_checksum(path, checksum).await;

    let mut attempts = 0;
    let bytes = config
        .retry_policy()
        .run(|attempt| {
            attempts = attempt + 1;
            upload_file_attempt(config, path, key, checksum.clone(), attempt)
        })
        .await
        .wrap_err("with retries")?;

    Ok(UploadReport {
        resource_name: config.identity.resource_name(key),
        bytes,
        attempts,
        checksum,
    })
}

async fn upload_file_attempt(
    config: &TransferConfig,
    path: &Path,
    key: &str,
    checksum: Option<String>,
    attempt: u32,
) -> Result<u64, AttemptError> {
    if attempt != 0 {
        debug!("retrying upload of {}... (attempt {})", key, attempt + 1);
    }
    let client = connect(config).await?;
    let local = |what: &str, err: std::io::Error| {
        fail("read source")(TransferError::local_io(format!("{what} {}", path.display()), err))
    };

    let mut file = File::open(path).await.map_err(|err| local("open", err))?;
    let size = file.metadata().await.map_err(|err| local("stat", err))?.len();
    info!(
        "uploading {} to {} - size {}",
        path.display(),
        config.endpoint,
        HumanBytes(size)
    );

    let mut writer = client
        .start_put(PutParams {
            key: key.to_string(),
            sha256: checksum,
        })
        .map_err(fail("create kv put client"))?;

    let mut buf = vec![0u8; config.chunk_size.max(1)];
    loop {
        let n = file.read(&mut buf).await.map_err(|err| local("read", err))?;
        if n == 0 {
            break;
        }
        writer
            .write(&buf[..n])
            .await
            .map_err(fail("upload archive"))?;
    }

    let sent = writer.offset();
    if sent != size {
        warn!(
            "{} changed during upload: sent {} of {} stat'ed bytes",
            path.display(),
            sent,
            size
        );
    }
    writer.close().await.map_err(fail("close upload"))?;
    Ok(sent)
}

/// Compresses `sources` into `spill` and uploads the archive while it is being
/// written. The spill file is removed afterwards.
pub async fn upload_archive(
    config: &TransferConfig,
    sources: &[PathBuf],
    spill: &Path,
    key: &str,
) -> Result<UploadReport> {
    let mut producer = compress_command(sources, spill);
    let report = upload_streaming(config, &mut producer, spill, key).await;
    if let Err(err) = fs::remove_file(spill).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove spill file {}: {err}", spill.display());
        }
    }
    report
}

/// Uploads whatever `producer` writes into `spill`, starting before it finishes.
/// The archive's digest is unknown up front, so no validation checksum is sent.
pub async fn upload_streaming<P>(
    config: &TransferConfig,
    producer: &mut P,
    spill: &Path,
    key: &str,
) -> Result<UploadReport>
where
    P: Producer + ?Sized,
{
    info!("streaming {} to {}", key, config.endpoint);
    let pipeline = SpillPipeline::new(spill)
        .buffer_size(config.spill_buffer)
        .backoff(config.spill_backoff);

    // Attempts run one at a time; the lock only lets each borrow the producer.
    let producer = Mutex::new(producer);
    let mut attempts = 0;
    let bytes = config
        .retry_policy()
        .run(|attempt| {
            attempts = attempt + 1;
            upload_streaming_attempt(config, &pipeline, &producer, key, attempt)
        })
        .await
        .wrap_err("with retries")?;
    debug!("streamed {} after {} attempt(s)", HumanBytes(bytes), attempts);

    Ok(UploadReport {
        resource_name: config.identity.resource_name(key),
        bytes,
        attempts,
        checksum: None,
    })
}

async fn upload_streaming_attempt<P>(
    config: &TransferConfig,
    pipeline: &SpillPipeline,
    producer: &Mutex<&mut P>,
    key: &str,
    attempt: u32,
) -> Result<u64, AttemptError>
where
    P: Producer + ?Sized,
{
    let mut producer = producer.lock().await;
    if attempt != 0 {
        debug!("retrying streaming upload of {}... (attempt {})", key, attempt + 1);
    }
    let client = connect(config).await?;
    let writer = client
        .start_put(PutParams {
            key: key.to_string(),
            sha256: None,
        })
        .map_err(fail("create kv put client"))?;

    let (writer, forwarded) = pipeline
        .run(&mut **producer, writer)
        .await
        .map_err(fail("stream archive"))?;
    writer.close().await.map_err(fail("close upload"))?;
    info!("uploaded {} for {}", HumanBytes(forwarded), key);
    Ok(forwarded)
}

/// Downloads `key` into `dest`. On any failure, including a cache miss, the
/// partially written file is removed.
pub async fn download_to_file(
    config: &TransferConfig,
    key: &str,
    dest: &Path,
) -> Result<DownloadReport> {
    info!("downloading {} from {}", key, config.endpoint);
    let client = KvClient::connect(&config.endpoint, config.identity.clone(), config.dial_timeout)
        .await
        .wrap_err("new kv client")?;
    let mut reader = client
        .start_get(key)
        .await
        .wrap_err("create kv get client")?;

    let mut file = File::create(dest)
        .await
        .map_err(|err| TransferError::local_io(format!("create {}", dest.display()), err))?;
    let copied = reader.copy_to(&mut file).await;
    reader.close();

    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(err) => {
            drop(file);
            let _ = fs::remove_file(dest).await;
            return Err(eyre::Report::new(err).wrap_err("failed to download"));
        }
    };
    file.sync_all()
        .await
        .map_err(|err| TransferError::local_io(format!("sync {}", dest.display()), err))?;
    info!("downloaded {} to {}", HumanBytes(bytes), dest.display());

    Ok(DownloadReport {
        resource_name: reader.resource_name().to_string(),
        bytes,
    })
}

/// Downloads `key` and unpacks it with the default `zstd | tar` extraction.
pub async fn download_and_extract(config: &TransferConfig, key: &str) -> Result<DownloadReport> {
    download_and_extract_with(config, key, extract_command()).await
}

/// Downloads `key` straight into `command`'s stdin.
pub async fn download_and_extract_with(
    config: &TransferConfig,
    key: &str,
    command: Command,
) -> Result<DownloadReport> {
    info!("downloading {} from {} for extraction", key, config.endpoint);
    let client = KvClient::connect(&config.endpoint, config.identity.clone(), config.dial_timeout)
        .await
        .wrap_err("new kv client")?;
    let mut reader = client
        .start_get(key)
        .await
        .wrap_err("create kv get client")?;

    let extracted = extract_from(&mut reader, command).await;
    reader.close();
    let bytes = extracted.wrap_err("failed to decompress archive")?;
    info!("extracted {} from {}", HumanBytes(bytes), key);

    Ok(DownloadReport {
        resource_name: reader.resource_name().to_string(),
        bytes,
    })
}

async fn connect(config: &TransferConfig) -> Result<KvClient, AttemptError> {
    KvClient::connect(&config.endpoint, config.identity.clone(), config.dial_timeout)
        .await
        .map_err(fail("new kv client"))
}

/// Wraps a typed failure with context and lets its category pick retry or abort.
/// A remote that closed the upload early gets a fresh attempt.
fn fail(context: &'static str) -> impl FnOnce(TransferError) -> AttemptError {
    move |err| {
        let closed = err.kind == ErrorKind::StreamClosed;
        let report = eyre::Report::new(err).wrap_err(context);
        if closed {
            AttemptError::retry(report)
        } else {
            AttemptError::classify(report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_keys_follow_branch() {
        assert_eq!(archive_key("main"), "main-archive-stream");
        assert_eq!(metadata_key("feature/x"), "feature/x-metadata-stream");
    }
}
