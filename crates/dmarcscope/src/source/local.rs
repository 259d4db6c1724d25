//! Local-file adapter for report archives on disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::report::ContainerKind;

use super::error::{Result, SourceError};
use super::{SourceDocument, SourceKind};

const REPORT_EXTENSIONS: &[&str] = &["xml", "gz", "gzip", "zip"];

pub struct LocalSource {
    recursive: bool,
}

impl LocalSource {
    pub fn new(recursive: bool) -> Self {
        Self { recursive }
    }

    /// Expands the given paths into report files.
    ///
    /// Directories are walked (recursively unless disabled) and filtered by
    /// extension. Files named explicitly are always taken. A path that does
    /// not exist is an error.
    pub fn collect(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for path in paths {
            if path.is_file() {
                files.push(path.clone());
                continue;
            }
            if !path.exists() {
                return Err(SourceError::Io {
                    path: path.display().to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }

            let max_depth = if self.recursive { usize::MAX } else { 1 };
            let walker = WalkDir::new(path)
                .min_depth(1)
                .max_depth(max_depth)
                .sort_by_file_name();
            for entry in walker {
                let entry = entry.map_err(|source| SourceError::Walk {
                    path: path.display().to_string(),
                    source,
                })?;
                if entry.file_type().is_file() && is_report_file(entry.path()) {
                    debug!("Found report file: {}", entry.path().display());
                    files.push(entry.into_path());
                }
            }
        }

        info!("Collected {} report files", files.len());
        Ok(files)
    }

    /// Reads a file into a document keyed by the SHA-256 of its contents.
    /// Unreadable files are logged and yield `None`.
    pub fn load(&self, path: &Path) -> Option<SourceDocument> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping unreadable file {}: {}", path.display(), e);
                return None;
            }
        };

        let hint = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ContainerKind::from_filename);
        let source_id = content_id(&bytes);

        Some(
            SourceDocument::new(bytes, source_id, SourceKind::Local)
                .with_origin(path.display().to_string())
                .with_hint(hint),
        )
    }
}

impl Default for LocalSource {
    fn default() -> Self {
        Self::new(true)
    }
}

/// `sha256:<hex>` of the given bytes.
pub fn content_id(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn is_report_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| REPORT_EXTENSIONS.iter().any(|r| ext.eq_ignore_ascii_case(r)))
}
