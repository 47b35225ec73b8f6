use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Content storage for original and processed images.
///
/// Files are addressed by `(bucket, filename)`; `save` generates a unique
/// filename that keeps the extension of the uploaded name.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(&self, data: &[u8], original_name: &str, bucket: &str) -> Result<String, StorageError>;

    async fn retrieve(&self, filename: &str, bucket: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, filename: &str, bucket: &str) -> Result<(), StorageError>;
}

/// `<uuid>.<ext>` for an uploaded name; names without an extension are rejected.
pub fn generate_filename(original_name: &str) -> Result<String, StorageError> {
    let ext = extension(original_name)?;
    Ok(format!("{}.{}", Uuid::new_v4(), ext))
}

fn extension(name: &str) -> Result<&str, StorageError> {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            Ok(ext)
        }
        _ => Err(StorageError::InvalidFilename(name.to_string())),
    }
}

/// Bucket and file names must be single path components.
fn check_component(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StorageError::InvalidFilename(name.to_string()));
    }
    Ok(())
}

pub fn content_type(filename: &str) -> &'static str {
    extension(filename)
        .ok()
        .and_then(image::ImageFormat::from_extension)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// Client for Cloudflare R2 object storage (S3-compatible). Buckets map to
/// key prefixes inside one R2 bucket.
pub struct R2BlobStore {
    bucket: Box<Bucket>,
}

impl R2BlobStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    fn key(filename: &str, bucket: &str) -> Result<String, StorageError> {
        check_component(bucket)?;
        check_component(filename)?;
        Ok(format!("{}/{}", bucket, filename))
    }
}

#[async_trait]
impl BlobStore for R2BlobStore {
    async fn save(&self, data: &[u8], original_name: &str, bucket: &str) -> Result<String, StorageError> {
        let filename = generate_filename(original_name)?;
        let key = Self::key(&filename, bucket)?;
        let response = self
            .bucket
            .put_object_with_content_type(&key, data, content_type(&filename))
            .await?;
        if response.status_code() >= 300 {
            return Err(StorageError::Status(response.status_code()));
        }
        Ok(filename)
    }

    async fn retrieve(&self, filename: &str, bucket: &str) -> Result<Vec<u8>, StorageError> {
        let key = Self::key(filename, bucket)?;
        let response = self.bucket.get_object(&key).await?;
        match response.status_code() {
            404 => Err(StorageError::NotFound(key)),
            code if code >= 300 => Err(StorageError::Status(code)),
            _ => Ok(response.to_vec()),
        }
    }

    async fn delete(&self, filename: &str, bucket: &str) -> Result<(), StorageError> {
        let key = Self::key(filename, bucket)?;
        self.bucket.delete_object(&key).await?;
        Ok(())
    }
}

/// Local directory storage; each bucket is a sub-directory of `root`.
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, filename: &str, bucket: &str) -> Result<PathBuf, StorageError> {
        check_component(bucket)?;
        check_component(filename)?;
        Ok(self.root.join(bucket).join(filename))
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn save(&self, data: &[u8], original_name: &str, bucket: &str) -> Result<String, StorageError> {
        let filename = generate_filename(original_name)?;
        let path = self.path(&filename, bucket)?;
        tokio::fs::create_dir_all(self.root.join(bucket)).await?;
        tokio::fs::write(&path, data).await?;
        Ok(filename)
    }

    async fn retrieve(&self, filename: &str, bucket: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(filename, bucket)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, filename: &str, bucket: &str) -> Result<(), StorageError> {
        let path = self.path(filename, bucket)?;
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// In-process blob storage, for tests and single-process runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, data: &[u8], original_name: &str, bucket: &str) -> Result<String, StorageError> {
        let filename = generate_filename(original_name)?;
        self.blobs
            .write()
            .await
            .insert((bucket.to_string(), filename.clone()), data.to_vec());
        Ok(filename)
    }

    async fn retrieve(&self, filename: &str, bucket: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .await
            .get(&(bucket.to_string(), filename.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", bucket, filename)))
    }

    async fn delete(&self, filename: &str, bucket: &str) -> Result<(), StorageError> {
        self.blobs
            .write()
            .await
            .remove(&(bucket.to_string(), filename.to_string()));
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob {0} does not exist")]
    NotFound(String),

    #[error("Invalid file name: {0}")]
    InvalidFilename(String),

    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 request returned HTTP {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
