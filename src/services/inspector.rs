//! Content-derived metadata (hash, size, MIME type) for a local file.
//!
//! The hash is SHA-256 over the full content and the MIME type is sniffed
//! from the leading bytes; the filename and extension play no part in either.

use futures::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Number of leading bytes examined when sniffing the MIME type.
const SNIFF_LEN: usize = 8 * 1024;

pub const MIME_OCTET_STREAM: &str = "application/octet-stream";
pub const MIME_JSON: &str = "application/json";
pub const MIME_TOML: &str = "application/toml";
pub const MIME_YAML: &str = "application/x-yaml";
pub const MIME_EMPTY: &str = "application/x-empty";

const MAGIC_NUMBERS: &[(&[u8], &str)] = &[
    (&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
    (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (&[0x49, 0x49, 0x2A, 0x00], "image/tiff"),
    (&[0x4D, 0x4D, 0x00, 0x2A], "image/tiff"),
    (b"%PDF-", "application/pdf"),
    (&[0x50, 0x4B, 0x03, 0x04], "application/zip"),
    (&[0x1F, 0x8B], "application/gzip"),
    (b"BZh", "application/x-bzip2"),
    (&[0xFD, b'7', b'z', b'X', b'Z', 0x00], "application/x-xz"),
    (&[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C], "application/x-7z-compressed"),
    (&[0x28, 0xB5, 0x2F, 0xFD], "application/zstd"),
    (b"PAR1", "application/vnd.apache.parquet"),
    (b"SQLite format 3\0", "application/vnd.sqlite3"),
    (b"\x93NUMPY", "application/x-npy"),
    (&[0x89, b'H', b'D', b'F', 0x0D, 0x0A, 0x1A, 0x0A], "application/x-hdf5"),
    (b"OggS", "audio/ogg"),
    (b"fLaC", "audio/flac"),
    (b"ID3", "audio/mpeg"),
    (&[0x1A, 0x45, 0xDF, 0xA3], "video/x-matroska"),
    (&[0x7F, b'E', b'L', b'F'], "application/x-executable"),
    (b"BM", "image/bmp"),
];

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("file `{0}` not found")]
    NotFound(PathBuf),
    #[error("file `{path}` is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type InspectResult<T> = Result<T, InspectError>;

/// Metadata computed for one local file.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 digest.
    pub content_hash: String,
    pub mime_type: String,
}

/// Read `path` once, hashing every byte and keeping the head for sniffing.
pub async fn inspect(path: &Path) -> InspectResult<FileMetadata> {
    let unreadable = |source: io::Error| {
        if source.kind() == ErrorKind::NotFound {
            InspectError::NotFound(path.to_path_buf())
        } else {
            InspectError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    };

    let file = File::open(path).await.map_err(unreadable)?;
    let mut stream = ReaderStream::new(file);
    let mut hasher = Sha256::new();
    let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
    let mut size_bytes: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(unreadable)?;
        size_bytes += chunk.len() as u64;
        hasher.update(&chunk);
        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
    }

    let complete = size_bytes as usize == head.len();
    let metadata = FileMetadata {
        path: path.to_path_buf(),
        filename: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes,
        content_hash: hex::encode(hasher.finalize()),
        mime_type: sniff_mime(&head, complete).to_string(),
    };
    debug!(
        file = %path.display(),
        size = metadata.size_bytes,
        mime = %metadata.mime_type,
        "inspected file"
    );
    Ok(metadata)
}

/// Guess a MIME type from the first bytes of a file.
///
/// `complete` is true when `head` holds the entire file, which allows a full
/// JSON parse to settle ambiguous text.
pub fn sniff_mime(head: &[u8], complete: bool) -> &'static str {
    if head.is_empty() {
        return MIME_EMPTY;
    }

    for &(magic, mime) in MAGIC_NUMBERS {
        if head.starts_with(magic) {
            return mime;
        }
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") {
        match &head[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wav",
            b"AVI " => return "video/x-msvideo",
            _ => {}
        }
    }
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return "video/mp4";
    }

    match as_text(head, complete) {
        Some(text) => sniff_text(text, head, complete),
        None => MIME_OCTET_STREAM,
    }
}

fn as_text(head: &[u8], complete: bool) -> Option<&str> {
    if head.contains(&0) {
        return None;
    }
    match std::str::from_utf8(head) {
        Ok(text) => Some(text),
        // A multi-byte character cut off by the sniff window is still text.
        Err(err) if !complete && err.error_len().is_none() => {
            std::str::from_utf8(&head[..err.valid_up_to()]).ok()
        }
        Err(_) => None,
    }
}

fn sniff_text(text: &str, head: &[u8], complete: bool) -> &'static str {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if complete
        && serde_json::from_slice::<serde_json::Value>(head)
            .is_ok_and(|value| value.is_object() || value.is_array())
    {
        return MIME_JSON;
    }
    if trimmed.starts_with('{') {
        return MIME_JSON;
    }
    if trimmed.starts_with("<?xml") {
        return "application/xml";
    }
    if trimmed.starts_with("---") {
        return MIME_YAML;
    }
    let first_line = trimmed
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or_default();
    if looks_like_toml(first_line) {
        return MIME_TOML;
    }
    if looks_like_yaml_mapping(first_line) {
        return MIME_YAML;
    }
    if trimmed.starts_with('[') {
        return MIME_JSON;
    }
    "text/plain"
}

/// A bare `key:` line opening a nested YAML mapping.
fn looks_like_yaml_mapping(line: &str) -> bool {
    match line.strip_suffix(':') {
        Some(key) => {
            let key = key.trim_matches(|c| c == '"' || c == '\'');
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        None => false,
    }
}

fn looks_like_toml(line: &str) -> bool {
    if let Some(inner) = line.strip_prefix("[[").and_then(|l| l.strip_suffix("]]")) {
        return !inner.is_empty();
    }
    if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        return !inner.is_empty() && !inner.contains(['[', ']', ',', '{']);
    }
    match line.split_once('=') {
        Some((key, _)) => {
            let key = key.trim();
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '"'))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn hashes_and_sizes_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello world")
            .unwrap();

        let meta = inspect(&path).await.unwrap();
        assert_eq!(meta.size_bytes, 11);
        assert_eq!(meta.filename, "hello.txt");
        assert_eq!(
            meta.content_hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(meta.mime_type, "text/plain");
    }

    #[tokio::test]
    async fn mime_comes_from_content_not_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("looks_like.txt");
        std::fs::write(&path, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]).unwrap();

        let meta = inspect(&path).await.unwrap();
        assert_eq!(meta.mime_type, "image/png");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = inspect(&dir.path().join("nope.bin")).await.unwrap_err();
        assert!(matches!(err, InspectError::NotFound(_)));
    }

    #[tokio::test]
    async fn directory_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = inspect(dir.path()).await.unwrap_err();
        assert!(matches!(err, InspectError::Unreadable { .. }));
    }

    #[test]
    fn sniffs_structured_text() {
        assert_eq!(sniff_mime(br#"{"a": 1}"#, true), MIME_JSON);
        assert_eq!(sniff_mime(b"[1, 2, 3]", true), MIME_JSON);
        assert_eq!(sniff_mime(b"[abc123]\nid = 1\n", true), MIME_TOML);
        assert_eq!(sniff_mime(b"title = \"x\"\n", true), MIME_TOML);
        assert_eq!(sniff_mime(b"---\nkey: value\n", true), MIME_YAML);
        assert_eq!(sniff_mime(b"abc123:\n  size_bytes: 3\n", true), MIME_YAML);
        assert_eq!(sniff_mime(b"just words", true), "text/plain");
        assert_eq!(sniff_mime(b"Note: read me", true), "text/plain");
        assert_eq!(sniff_mime(b"", true), MIME_EMPTY);
        assert_eq!(sniff_mime(&[0x00, 0x01, 0x02, 0xFE], true), MIME_OCTET_STREAM);
    }

    #[test]
    fn json_scalars_stay_plain_text() {
        assert_eq!(sniff_mime(b"42", true), "text/plain");
        assert_eq!(sniff_mime(b"true\n", true), "text/plain");
        assert_eq!(sniff_mime(b"\"quoted\"", true), "text/plain");
    }

    #[test]
    fn sniffs_riff_containers() {
        let mut webp = b"RIFF\x10\x00\x00\x00WEBP".to_vec();
        webp.extend_from_slice(b"VP8 ");
        assert_eq!(sniff_mime(&webp, true), "image/webp");
    }
}
