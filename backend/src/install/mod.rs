//! Installing downloaded files into the library layout

pub mod manifest;
mod naming;

pub use manifest::Artifact;
pub use naming::{check_template, destination_path};

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("invalid naming template: {0}")]
    InvalidTemplate(String),

    #[error("invalid destination path: {0}")]
    InvalidPath(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// SHA-256 of a file as lowercase hex.
pub async fn hash_file(path: &Path) -> Result<String, InstallError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
