//! Content digests for upload validation

use log::warn;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::errors::{TransferError, TransferResult};

const READ_BUFFER: usize = 256 * 1024;

/// Hash a whole file with SHA-256 and return the lowercase hex digest.
pub fn sha256_file(path: &Path) -> TransferResult<String> {
    let display = path.display().to_string();
    let mut f = File::open(path).map_err(|err| TransferError::checksum(&display, err))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|err| TransferError::checksum(&display, err))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Best-effort digest for the validation header: a file that cannot be read is
/// logged and yields `None`, letting the upload go ahead without validation.
pub async fn checksum_or_empty(path: &Path) -> Option<String> {
    soft_checksum(path, sha256_file).await
}

/// Runs `compute` off the async workers and downgrades any failure to `None`.
pub async fn soft_checksum<F>(path: &Path, compute: F) -> Option<String>
where
    F: FnOnce(&Path) -> TransferResult<String> + Send + 'static,
{
    let owned = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || compute(&owned)).await;
    match result {
        Ok(Ok(digest)) => Some(digest),
        Ok(Err(err)) => {
            warn!("{err}; uploading without checksum validation");
            None
        }
        Err(err) => {
            warn!("checksum task failed for {}: {err}", path.display());
            None
        }
    }
}
