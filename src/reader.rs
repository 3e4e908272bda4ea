//! Source file reading and classification.
//!
//! [`FileReader`] turns a [`LocalFileMeta`] into text plus size and mime
//! metadata. [`FsFileReader`] handles UTF-8 text files from the local
//! filesystem; richer formats plug in behind the same trait.

use std::path::Path;

use async_trait::async_trait;

use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{LocalFileInfo, LocalFileMeta};

/// Text read from a source file plus its enriched metadata.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub info: LocalFileInfo,
    pub text: String,
}

#[async_trait]
pub trait FileReader: Send + Sync {
    async fn read(&self, meta: &LocalFileMeta) -> Result<FileContent>;
}

/// Reads UTF-8 text files with `tokio::fs`.
///
/// - missing file → [`RagError::FileNotFound`] (404)
/// - directory or non-UTF-8 content → [`RagError::InvalidInput`] (400)
#[derive(Debug, Default, Clone, Copy)]
pub struct FsFileReader;

#[async_trait]
impl FileReader for FsFileReader {
    async fn read(&self, meta: &LocalFileMeta) -> Result<FileContent> {
        let path = &meta.path;
        let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                RagError::FileNotFound(path.display().to_string())
            }
            _ => RagError::from(e),
        })?;
        if metadata.is_dir() {
            return Err(RagError::InvalidInput(format!(
                "{} is a directory",
                path.display()
            )));
        }

        let bytes = tokio::fs::read(path).await?;
        let text = String::from_utf8(bytes).map_err(|_| {
            RagError::InvalidInput(format!("{} is not valid UTF-8 text", path.display()))
        })?;

        let mut info = LocalFileInfo::from_meta(meta.clone());
        info.file_size = metadata.len();
        info.mime_type = mime_for_path(path).map(str::to_string);

        Ok(FileContent { info, text })
    }
}

/// Best-effort mime type from the file extension.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        "xml" => "application/xml",
        "rs" => "text/x-rust",
        "py" => "text/x-python",
        "js" => "text/javascript",
        "ts" => "text/x-typescript",
        _ => return None,
    };
    Some(mime)
}
