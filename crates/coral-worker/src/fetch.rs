// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle materialization: download (or take inline) and unpack.

use crate::WorkerError;
use std::path::Path;
use tracing::debug;

/// Fetch raw bytes from a bundle or result URI.
///
/// `http(s)` URIs are downloaded; anything else is treated as a local
/// filesystem path.
///
/// # Errors
///
/// Propagates transport and filesystem failures.
pub async fn read_uri(uri: &str) -> Result<Vec<u8>, WorkerError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = reqwest::get(uri).await?.error_for_status()?;
        return Ok(response.bytes().await?.to_vec());
    }
    std::fs::read(uri).map_err(|source| WorkerError::Io {
        path: uri.into(),
        source,
    })
}

/// Unpack a gzip-compressed tar archive into `dest`, creating it first.
///
/// # Errors
///
/// Propagates archive and filesystem failures.
pub fn unpack_bundle(payload: &[u8], dest: &Path) -> Result<(), WorkerError> {
    std::fs::create_dir_all(dest).map_err(|source| WorkerError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    let decoder = flate2::read::GzDecoder::new(payload);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest).map_err(|source| WorkerError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    debug!(dest = %dest.display(), "bundle unpacked");
    Ok(())
}
