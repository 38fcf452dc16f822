//! Upload Directory - model references handed in by the upload collaborator
//!
//! Clients name a model by its path relative to the uploads directory. The
//! name must stay inside that directory, carry an allowed extension and fit
//! the configured size limit. Whether the file exists is the slicing
//! adapter's concern.

use std::path::{Component, Path, PathBuf};

use crate::config::FileSettings;
use crate::error::QuoteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    /// As supplied by the client and stored with the quote.
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str, settings: &FileSettings) -> Result<ModelRef, QuoteError> {
        let allowed_extensions = &settings.allowed_extensions;
        let relative = Path::new(name);
        if name.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(QuoteError::InvalidParams(
                "model must be a relative path inside the uploads directory".to_string(),
            ));
        }

        let extension = relative
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !allowed_extensions.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
            return Err(QuoteError::InvalidParams(format!(
                "model type not allowed (expected one of: {})",
                allowed_extensions.join(", ")
            )));
        }

        let path = self.root.join(relative);
        if let Ok(meta) = std::fs::metadata(&path) {
            let limit = settings.max_file_size_mb.saturating_mul(1024 * 1024);
            if meta.len() > limit {
                return Err(QuoteError::InvalidParams(format!(
                    "model exceeds the {} MB upload limit",
                    settings.max_file_size_mb
                )));
            }
        }

        Ok(ModelRef {
            name: name.to_string(),
            path,
        })
    }
}
