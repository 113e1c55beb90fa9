//! Image attachment storage: a local directory or an S3 bucket.

use std::path::PathBuf;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use base64::Engine;
use thiserror::Error;

use crate::types::ImageUpload;

const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to decode base64 for {file_name}: {source}")]
    Decode {
        file_name: String,
        source: base64::DecodeError,
    },

    #[error("failed to write image: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to upload to S3: {0}")]
    S3(String),
}

/// True when the file name carries one of the accepted image extensions.
pub fn allowed_file(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reduce a client-supplied name to a safe single path component.
///
/// Directory parts are dropped, whitespace becomes `_`, anything outside `[A-Za-z0-9._-]`
/// is removed and leading dots or underscores are stripped. May return an empty string.
pub fn secure_filename(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_start_matches(['.', '_']).to_string()
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist `bytes` under `file_name` (already sanitised) and return its path.
    /// An existing file with the same name is overwritten.
    async fn save(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String, ImageError>;
}

/// Writes into a fixed directory; paths are returned as `<dir>/<file>`.
pub struct LocalImageStore {
    dir: PathBuf,
}

impl LocalImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn save(
        &self,
        file_name: &str,
        _content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String, ImageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }
}

pub struct S3ImageStore {
    client: S3Client,
    bucket: String,
}

impl S3ImageStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ImageStore for S3ImageStore {
    async fn save(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String, ImageError> {
        let key = format!("uploads/{}", file_name);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes));
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        request.send().await.map_err(|e| {
            tracing::error!("S3 put_object failed for {}: {:?}", key, e);
            ImageError::S3(e.to_string())
        })?;

        Ok(format!("https://{}.s3.amazonaws.com/{}", self.bucket, key))
    }
}

/// Save every acceptable upload and return the stored paths in upload order.
/// Uploads with a disallowed extension or an empty sanitised name are skipped.
pub async fn save_uploads(
    store: &dyn ImageStore,
    uploads: &[ImageUpload],
) -> Result<Vec<String>, ImageError> {
    let mut paths = Vec::with_capacity(uploads.len());
    for upload in uploads {
        if !allowed_file(&upload.file_name) {
            tracing::info!("Skipping upload with disallowed name {:?}", upload.file_name);
            continue;
        }
        let file_name = secure_filename(&upload.file_name);
        if file_name.is_empty() {
            continue;
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&upload.file_data)
            .map_err(|source| ImageError::Decode {
                file_name: upload.file_name.clone(),
                source,
            })?;
        let path = store
            .save(&file_name, upload.content_type.as_deref(), bytes)
            .await?;
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str, data: &[u8]) -> ImageUpload {
        ImageUpload {
            file_name: name.into(),
            content_type: Some("image/png".into()),
            file_data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    #[test]
    fn test_allowed_file() {
        assert!(allowed_file("cat.png"));
        assert!(allowed_file("CAT.JPEG"));
        assert!(allowed_file("archive.tar.gif"));
        assert!(!allowed_file("notes.txt"));
        assert!(!allowed_file("png"));
        assert!(!allowed_file(""));
    }

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("My cat.png"), "My_cat.png");
        assert_eq!(secure_filename("../../etc/passwd.png"), "passwd.png");
        assert_eq!(secure_filename("C:\\Users\\me\\pic.gif"), "pic.gif");
        assert_eq!(secure_filename(".hidden.jpg"), "hidden.jpg");
        assert_eq!(secure_filename("ünï.png"), "n.png");
    }

    #[tokio::test]
    async fn test_save_uploads_filters_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalImageStore::new(dir.path());

        let paths = save_uploads(
            &store,
            &[
                upload("b.png", b"bbb"),
                upload("readme.txt", b"nope"),
                upload("a.jpg", b"aaa"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            paths,
            vec![
                dir.path().join("b.png").to_string_lossy().into_owned(),
                dir.path().join("a.jpg").to_string_lossy().into_owned(),
            ]
        );
        assert_eq!(std::fs::read(dir.path().join("a.jpg")).unwrap(), b"aaa");
        assert!(!dir.path().join("readme.txt").exists());
    }

    #[tokio::test]
    async fn test_same_name_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalImageStore::new(dir.path());

        save_uploads(&store, &[upload("x.png", b"first")]).await.unwrap();
        save_uploads(&store, &[upload("x.png", b"second")]).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("x.png")).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_bad_base64_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalImageStore::new(dir.path());
        let mut bad = upload("x.png", b"");
        bad.file_data = "***".into();

        let err = save_uploads(&store, &[bad]).await.unwrap_err();
        assert!(matches!(err, ImageError::Decode { .. }));
    }
}
