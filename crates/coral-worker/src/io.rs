// SPDX-License-Identifier: MIT OR Apache-2.0
//! Result payload transport.

use crate::WorkerError;
use std::path::Path;
use tracing::debug;

/// Write the serialized result to `uri`.
///
/// `http(s)` URIs receive a PUT (signed upload URLs); anything else is a
/// local filesystem path whose parent directories are created.
///
/// # Errors
///
/// Propagates transport and filesystem failures.
pub async fn write_uri(uri: &str, payload: &[u8]) -> Result<(), WorkerError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let client = reqwest::Client::new();
        client
            .put(uri)
            .body(payload.to_vec())
            .send()
            .await?
            .error_for_status()?;
        debug!(uri, bytes = payload.len(), "result uploaded");
        return Ok(());
    }

    let path = Path::new(uri);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| WorkerError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, payload).map_err(|source| WorkerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(uri, bytes = payload.len(), "result written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("results/nested/out.bin");
        write_uri(&target.display().to_string(), b"abc").await.unwrap();
        assert_eq!(std::fs::read(target).unwrap(), b"abc");
    }
}
