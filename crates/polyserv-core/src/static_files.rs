//! Static file access under a document root, with MIME lookup by extension.
//!
//! Paths are resolved against the configured root; `/` and any path ending
//! in `/` get `index.html` appended. Requests containing a `..` segment are
//! rejected outright so nothing outside the root is reachable.

use std::io;
use std::path::{Path, PathBuf};

/// Resolves request paths under a document root and reads files.
pub struct FileReader {
    document_root: PathBuf,
}

impl FileReader {
    #[must_use]
    pub fn new(document_root: impl Into<PathBuf>) -> Self {
        Self {
            document_root: document_root.into(),
        }
    }

    #[must_use]
    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    /// Map a request path to a filesystem path.
    ///
    /// Returns `None` for traversal attempts (`..` segments).
    #[must_use]
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        if request_path.split('/').any(|segment| segment == "..") {
            return None;
        }

        let mut path = request_path.to_string();
        if path == "/" {
            path = "/index.html".to_string();
        } else if path.ends_with('/') {
            path.push_str("index.html");
        }

        Some(self.document_root.join(path.trim_start_matches('/')))
    }

    /// True iff the request path resolves to a regular file.
    #[must_use]
    pub fn file_exists(&self, request_path: &str) -> bool {
        self.resolve(request_path)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Read the file's bytes.
    pub fn read_file(&self, request_path: &str) -> io::Result<Vec<u8>> {
        let path = self.resolve(request_path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "path escapes document root")
        })?;
        std::fs::read(path)
    }

    pub fn file_size(&self, request_path: &str) -> io::Result<u64> {
        let path = self.resolve(request_path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "path escapes document root")
        })?;
        Ok(std::fs::metadata(path)?.len())
    }
}

/// MIME type by file extension, case-insensitive.
#[must_use]
pub fn mime_type(path: &str) -> &'static str {
    let extension = match path.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match extension.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
