//! Audio artifact storage.
//!
//! The lifecycle engine only ever sees the opaque `artifact_ref` returned by
//! [`ArtifactStore::put`] and hands it back unchanged to
//! [`ArtifactStore::delete`].  [`LocalArtifactStore`] keeps one file per
//! message on disk and uses the public retrieval URL as the reference.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Audio MIME types accepted for upload, with the on-disk extension for each.
const ACCEPTED_AUDIO: &[(&str, &str)] = &[
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/wave", "wav"),
    ("audio/x-m4a", "m4a"),
    ("audio/mp4", "m4a"),
    ("audio/webm", "webm"),
    ("audio/ogg", "ogg"),
];

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid artifact reference: {0}")]
    InvalidRef(String),
    #[error("artifact backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist an audio blob and return its reference.
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<String, ArtifactError>;

    /// Remove the blob behind `artifact_ref`.  Missing blobs are not an error.
    async fn delete(&self, artifact_ref: &str) -> Result<DeleteOutcome, ArtifactError>;
}

/// Strip parameters (`; codecs=opus`) and normalise case.
pub fn base_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// File extension for an accepted audio type, or `None` when the type is not
/// audio the relay takes.
pub fn audio_extension(content_type: &str) -> Option<&'static str> {
    let base = base_content_type(content_type);
    ACCEPTED_AUDIO
        .iter()
        .find(|(mime, _)| *mime == base)
        .map(|(_, ext)| *ext)
}

/// Content type to serve a stored file with, derived from its extension.
pub fn content_type_for_file(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next().unwrap_or("") {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "webm" => "audio/webm",
        "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// Stores artifacts as files under `dir`, addressed by
/// `{public_base_url}/uploads/{file_name}`.
pub struct LocalArtifactStore {
    dir: PathBuf,
    public_base_url: String,
}

impl LocalArtifactStore {
    /// Create the store, making `dir` if needed.
    pub fn open(dir: &Path, public_base_url: &str) -> Result<Self, ArtifactError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, file_name: &str) -> String {
        format!("{}/uploads/{}", self.public_base_url, file_name)
    }

    /// Resolve a bare file name to a path inside the store directory.
    /// Rejects anything that could escape it.
    pub fn path_for(&self, file_name: &str) -> Result<PathBuf, ArtifactError> {
        let valid = !file_name.is_empty()
            && file_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
            && !file_name.starts_with('.');
        if !valid {
            return Err(ArtifactError::InvalidRef(file_name.to_string()));
        }
        Ok(self.dir.join(file_name))
    }

    /// Recover the file name from a reference produced by [`Self::put`].
    fn file_name_of<'a>(&self, artifact_ref: &'a str) -> &'a str {
        artifact_ref
            .split(['?', '#'])
            .next()
            .unwrap_or(artifact_ref)
            .rsplit('/')
            .next()
            .unwrap_or(artifact_ref)
    }

    /// Read a stored file back for serving.  `None` when it does not exist.
    pub async fn read(&self, file_name: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        let path = self.path_for(file_name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArtifactError::Io(e)),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<String, ArtifactError> {
        let ext = audio_extension(content_type).unwrap_or("bin");
        let file_name = format!("audio-{}.{ext}", uuid::Uuid::new_v4().simple());
        let path = self.path_for(&file_name)?;
        tokio::fs::write(&path, &bytes).await?;
        Ok(self.url_for(&file_name))
    }

    async fn delete(&self, artifact_ref: &str) -> Result<DeleteOutcome, ArtifactError> {
        let path = self.path_for(self.file_name_of(artifact_ref))?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome::AlreadyAbsent),
            Err(e) => Err(ArtifactError::Io(e)),
        }
    }
}
