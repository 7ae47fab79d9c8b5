// src/engine/io.rs
//
// I/O: input file descriptors, on-demand byte sources and format sniffing.

use crate::error::PressError;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

type IoResult<T> = std::result::Result<T, PressError>;

/// Where the bytes of an input live. Nothing is read until `open()`.
#[derive(Clone, Debug)]
pub enum Source {
    /// In-memory image data (e.g. an upload buffer)
    Memory(Arc<Vec<u8>>),
    /// File path, memory-mapped on demand
    Path(PathBuf),
}

/// Opened bytes of a source. Mapped files are zero-copy.
#[derive(Clone, Debug)]
pub enum SourceBytes {
    Memory(Arc<Vec<u8>>),
    Mapped(Arc<Mmap>),
}

impl SourceBytes {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SourceBytes::Memory(data) => data.as_slice(),
            SourceBytes::Mapped(mmap) => mmap.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Source {
    pub fn open(&self) -> IoResult<SourceBytes> {
        match self {
            Source::Memory(data) => Ok(SourceBytes::Memory(Arc::clone(data))),
            Source::Path(path) => {
                let display = path.to_string_lossy().to_string();
                let file = File::open(path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        PressError::file_not_found(display.clone())
                    } else {
                        PressError::file_read_failed(display.clone(), e)
                    }
                })?;
                // Safety: the file is assumed not to be truncated while an item is
                // being processed; a concurrent truncation can fault the mapping.
                let mmap =
                    unsafe { Mmap::map(&file).map_err(|e| PressError::mmap_failed(display, e))? };
                Ok(SourceBytes::Mapped(Arc::new(mmap)))
            }
        }
    }
}

/// Stable identity of an input: name, size and modification time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub name: String,
    pub byte_size: u64,
    pub last_modified_ms: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.name, self.byte_size, self.last_modified_ms)
    }
}

/// A file offered for admission.
#[derive(Clone, Debug)]
pub struct InputFile {
    pub name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub last_modified_ms: u64,
    pub source: Source,
}

impl InputFile {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        byte_size: u64,
        last_modified_ms: u64,
        source: Source,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            byte_size,
            last_modified_ms,
            source,
        }
    }

    /// In-memory file; the declared size is the buffer length.
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
        last_modified_ms: u64,
    ) -> Self {
        let byte_size = bytes.len() as u64;
        Self::new(
            name,
            mime_type,
            byte_size,
            last_modified_ms,
            Source::Memory(Arc::new(bytes)),
        )
    }

    /// File on disk; MIME type is guessed from the extension, size and mtime from metadata.
    pub fn from_path(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref();
        let display = path.to_string_lossy().to_string();
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PressError::file_not_found(display.clone())
            } else {
                PressError::file_read_failed(display.clone(), e)
            }
        })?;
        let last_modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| display.clone());
        let mime_type = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(mime_from_extension)
            .unwrap_or("application/octet-stream");
        Ok(Self::new(
            name,
            mime_type,
            metadata.len(),
            last_modified_ms,
            Source::Path(path.to_path_buf()),
        ))
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            name: self.name.clone(),
            byte_size: self.byte_size,
            last_modified_ms: self.last_modified_ms,
        }
    }

    /// Extension of the original name, lowercased, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// An admitted input. Immutable and cheap to clone.
#[derive(Clone, Debug)]
pub struct SourceImage(Arc<InputFile>);

impl SourceImage {
    pub(crate) fn admit(file: InputFile) -> Self {
        Self(Arc::new(file))
    }

    /// Wrap a file without running admission checks.
    ///
    /// For callers that already validated the set (e.g. a re-run with new
    /// settings). Unchecked items that turn out to be unreadable fail as
    /// per-item errors inside the run.
    pub fn from_input_unchecked(file: InputFile) -> Self {
        Self::admit(file)
    }

    pub fn file(&self) -> &InputFile {
        &self.0
    }
}

impl Deref for SourceImage {
    type Target = InputFile;

    fn deref(&self) -> &InputFile {
        &self.0
    }
}

pub fn mime_from_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "avif" => Some("image/avif"),
        "tif" | "tiff" => Some("image/tiff"),
        "bmp" => Some("image/bmp"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

/// AVIF files are ISOBMFF containers whose 'ftyp' box carries an 'avif'/'avis' brand.
pub(crate) fn is_avif_data(data: &[u8]) -> bool {
    if data.len() < 12 || &data[4..8] != b"ftyp" {
        return false;
    }
    let ftyp_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if ftyp_size > data.len() || ftyp_size < 12 {
        return false;
    }
    let major_brand = &data[8..12];
    if major_brand == b"avif" || major_brand == b"avis" {
        return true;
    }
    // compatible brands start after major brand + minor version
    if ftyp_size >= 20 {
        return data[16..ftyp_size]
            .chunks_exact(4)
            .any(|brand| brand == b"avif" || brand == b"avis");
    }
    false
}

/// Cheap SVG sniff: an `<svg` element within the first few KB of UTF-8 text.
pub(crate) fn is_svg_data(data: &[u8]) -> bool {
    let head = &data[..data.len().min(4096)];
    match std::str::from_utf8(head) {
        Ok(text) => text.contains("<svg"),
        // a multi-byte char cut at the boundary is still text
        Err(e) => std::str::from_utf8(&head[..e.valid_up_to()])
            .map(|t| t.contains("<svg"))
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fingerprint_display() {
        let file = InputFile::from_bytes("a.png", "image/png", vec![0; 10], 1234);
        assert_eq!(file.fingerprint().to_string(), "a.png-10-1234");
    }

    #[test]
    fn test_memory_source_open() {
        let file = InputFile::from_bytes("a.png", "image/png", vec![1, 2, 3], 0);
        let bytes = file.source.open().unwrap();
        assert_eq!(bytes.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_path_source_is_mapped_on_open() {
        let mut tmp = tempfile::Builder::new().suffix(".jpg").tempfile().unwrap();
        tmp.write_all(b"hello").unwrap();
        let file = InputFile::from_path(tmp.path()).unwrap();
        assert_eq!(file.mime_type, "image/jpeg");
        assert_eq!(file.byte_size, 5);
        let bytes = file.source.open().unwrap();
        assert!(matches!(bytes, SourceBytes::Mapped(_)));
        assert_eq!(bytes.as_bytes(), b"hello");
    }

    #[test]
    fn test_missing_path() {
        let err = InputFile::from_path("/definitely/not/here.png").unwrap_err();
        assert!(matches!(err, PressError::FileNotFound { .. }));
    }

    #[test]
    fn test_sniffers() {
        let mut avif = vec![0, 0, 0, 20];
        avif.extend_from_slice(b"ftypavif");
        avif.extend_from_slice(&[0; 8]);
        assert!(is_avif_data(&avif));
        assert!(!is_avif_data(b"not an avif file"));
        assert!(is_svg_data(
            b"<?xml version=\"1.0\"?><svg xmlns=\"http://www.w3.org/2000/svg\"/>"
        ));
        assert!(!is_svg_data(&[0xFF, 0xD8, 0xFF]));
    }

    #[test]
    fn test_extension_lowercased() {
        let file = InputFile::from_bytes("Photo.JPG", "image/jpeg", vec![], 0);
        assert_eq!(file.extension().as_deref(), Some("jpg"));
    }
}
