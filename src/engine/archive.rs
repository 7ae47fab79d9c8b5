// src/engine/archive.rs
//
// Output naming, the archive collaborator (ZIP with DEFLATE) and delivery of
// a batch's outputs as one file, one archive, or nothing.

use crate::engine::encoder::EncodePlan;
use crate::error::PressError;
use crate::ops::{AspectRatio, OutputFormat, Stages, TransformSettings};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

type ArchiveResult<T> = std::result::Result<T, PressError>;

pub const ARCHIVE_FILE_NAME: &str = "images_optimized.zip";

/// One named output handed to an archiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveEntry<'a> {
    pub name: &'a str,
    pub bytes: &'a [u8],
}

/// Packs named outputs into one payload. Entries are written in the given order.
pub trait Archiver: Send + Sync {
    fn archive(&self, entries: &[ArchiveEntry<'_>], level: u32) -> ArchiveResult<Vec<u8>>;

    /// File name of the produced payload.
    fn file_name(&self) -> &str {
        ARCHIVE_FILE_NAME
    }
}

/// Plain ZIP writer. Level 0 stores entries, 1-9 deflates them.
/// No ZIP64: entries and the archive must stay below 4 GiB.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;
const ZIP_VERSION: u16 = 20;
const FLAG_UTF8: u16 = 1 << 11;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
// 1980-01-01 00:00, the DOS epoch
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = (1 << 5) | 1;

struct CentralRecord {
    name: Vec<u8>,
    method: u16,
    crc: u32,
    compressed: u32,
    uncompressed: u32,
    offset: u32,
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn to_u32(value: usize, what: &str) -> ArchiveResult<u32> {
    u32::try_from(value)
        .map_err(|_| PressError::archive_failed(format!("{what} exceeds the 4 GiB ZIP limit")))
}

fn deflate(data: &[u8], level: u32) -> ArchiveResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| PressError::archive_failed(format!("deflate failed: {e}")))
}

impl Archiver for ZipArchiver {
    fn archive(&self, entries: &[ArchiveEntry<'_>], level: u32) -> ArchiveResult<Vec<u8>> {
        if entries.len() > u16::MAX as usize {
            return Err(PressError::archive_failed(format!(
                "{} entries exceed the ZIP limit of {}",
                entries.len(),
                u16::MAX
            )));
        }
        let level = level.min(9);
        let method = if level == 0 { METHOD_STORED } else { METHOD_DEFLATE };

        let mut out = Vec::new();
        let mut records = Vec::with_capacity(entries.len());

        for entry in entries {
            let name = entry.name.as_bytes();
            let name_len = u16::try_from(name.len())
                .map_err(|_| PressError::archive_failed(format!("entry name too long: {}", entry.name)))?;

            let mut crc = Crc::new();
            crc.update(entry.bytes);

            let deflated;
            let data: &[u8] = if method == METHOD_DEFLATE {
                deflated = deflate(entry.bytes, level)?;
                &deflated
            } else {
                entry.bytes
            };

            let record = CentralRecord {
                name: name.to_vec(),
                method,
                crc: crc.sum(),
                compressed: to_u32(data.len(), "compressed entry")?,
                uncompressed: to_u32(entry.bytes.len(), "entry")?,
                offset: to_u32(out.len(), "archive")?,
            };

            put_u32(&mut out, LOCAL_HEADER_SIG);
            put_u16(&mut out, ZIP_VERSION);
            put_u16(&mut out, FLAG_UTF8);
            put_u16(&mut out, record.method);
            put_u16(&mut out, DOS_TIME);
            put_u16(&mut out, DOS_DATE);
            put_u32(&mut out, record.crc);
            put_u32(&mut out, record.compressed);
            put_u32(&mut out, record.uncompressed);
            put_u16(&mut out, name_len);
            put_u16(&mut out, 0);
            out.extend_from_slice(name);
            out.extend_from_slice(data);

            records.push(record);
        }

        let central_start = out.len();
        for record in &records {
            put_u32(&mut out, CENTRAL_HEADER_SIG);
            put_u16(&mut out, ZIP_VERSION);
            put_u16(&mut out, ZIP_VERSION);
            put_u16(&mut out, FLAG_UTF8);
            put_u16(&mut out, record.method);
            put_u16(&mut out, DOS_TIME);
            put_u16(&mut out, DOS_DATE);
            put_u32(&mut out, record.crc);
            put_u32(&mut out, record.compressed);
            put_u32(&mut out, record.uncompressed);
            put_u16(&mut out, record.name.len() as u16);
            put_u16(&mut out, 0); // extra
            put_u16(&mut out, 0); // comment
            put_u16(&mut out, 0); // disk
            put_u16(&mut out, 0); // internal attrs
            put_u32(&mut out, 0); // external attrs
            put_u32(&mut out, record.offset);
            out.extend_from_slice(&record.name);
        }
        let central_size = to_u32(out.len() - central_start, "central directory")?;
        let central_offset = to_u32(central_start, "archive")?;

        put_u32(&mut out, END_OF_CENTRAL_DIR_SIG);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u16(&mut out, records.len() as u16);
        put_u16(&mut out, records.len() as u16);
        put_u32(&mut out, central_size);
        put_u32(&mut out, central_offset);
        put_u16(&mut out, 0);

        debug!(entries = records.len(), bytes = out.len(), level, "zip archive written");
        Ok(out)
    }
}

/// What a run hands back for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// No item succeeded.
    Empty,
    Single { name: String, bytes: Vec<u8> },
    Archive {
        name: String,
        bytes: Vec<u8>,
        entries: usize,
    },
}

impl Delivery {
    /// One success is delivered directly; more go through the archiver.
    pub fn assemble(
        entries: &[ArchiveEntry<'_>],
        archiver: &dyn Archiver,
        level: u32,
    ) -> ArchiveResult<Self> {
        match entries {
            [] => Ok(Delivery::Empty),
            [entry] => Ok(Delivery::Single {
                name: entry.name.to_string(),
                bytes: entry.bytes.to_vec(),
            }),
            _ => Ok(Delivery::Archive {
                name: archiver.file_name().to_string(),
                bytes: archiver.archive(entries, level)?,
                entries: entries.len(),
            }),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Delivery::Empty => None,
            Delivery::Single { name, .. } | Delivery::Archive { name, .. } => Some(name),
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Delivery::Empty => None,
            Delivery::Single { bytes, .. } | Delivery::Archive { bytes, .. } => Some(bytes),
        }
    }

    /// Write the payload into `dir` atomically. Returns the final path,
    /// or `None` for an empty delivery.
    pub fn write_to_dir(&self, dir: &Path) -> ArchiveResult<Option<PathBuf>> {
        let (Some(name), Some(bytes)) = (self.name(), self.bytes()) else {
            return Ok(None);
        };
        let target = dir.join(sanitize_file_name(name));
        let display = target.to_string_lossy().to_string();
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| PressError::file_write_failed(display.clone(), e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.flush())
            .map_err(|e| PressError::file_write_failed(display.clone(), e))?;
        tmp.persist(&target)
            .map_err(|e| PressError::file_write_failed(display, e.error))?;
        Ok(Some(target))
    }
}

/// Replace path separators and control characters; never returns an empty name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}

fn dimension_tag(ratio: AspectRatio) -> &'static str {
    match ratio {
        AspectRatio::SQUARE => "_1080x1080",
        AspectRatio::WIDESCREEN => "_1920x1080",
        AspectRatio::STORY => "_1080x1920",
        AspectRatio::LANDSCAPE => "_1200x900",
        AspectRatio::PORTRAIT => "_900x1200",
        _ => "",
    }
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && !ext.is_empty() => (base, Some(ext)),
        _ => (name, None),
    }
}

/// `base + suffix + dimension tag + extension` for one output.
///
/// The suffix is the preset's when given, otherwise built from the enabled
/// stages (`_50pct_1x1_webp`), or `_optimized` when none is enabled.
pub fn output_file_name(
    original_name: &str,
    settings: &TransformSettings,
    preset_suffix: Option<&str>,
    plan: &EncodePlan,
) -> String {
    let (base, original_ext) = split_name(original_name);
    // the source spelling (jpeg vs jpg) survives only when it names the actual content
    let extension = original_ext
        .filter(|ext| {
            plan.keeps_source_format && ext.parse::<OutputFormat>().ok() == Some(plan.format)
        })
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| plan.format.extension().to_string());
    let enabled = settings.stages();

    let suffix = match preset_suffix {
        Some(suffix) => suffix.to_string(),
        None => {
            let mut actions = Vec::new();
            if let Some(resize) = &settings.resize {
                actions.push(format!("{}pct", resize.percent));
            }
            if let Some(crop) = &settings.crop {
                actions.push(crop.ratio.label().replace('/', "x"));
            }
            if enabled.contains(Stages::CONVERT) {
                actions.push(plan.format.extension().to_string());
            }
            if enabled.is_empty() {
                "_optimized".to_string()
            } else {
                format!("_{}", actions.join("_"))
            }
        }
    };

    let dimensions = settings
        .crop
        .as_ref()
        .map(|crop| dimension_tag(crop.ratio))
        .unwrap_or("");

    sanitize_file_name(&format!("{base}{suffix}{dimensions}.{extension}"))
}

/// Make names unique in order: later duplicates get `_2`, `_3`, ... before the extension.
pub fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::with_capacity(names.len());
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if used.insert(name.clone()) {
            out.push(name);
            continue;
        }
        let (base, ext) = split_name(&name);
        let mut n = 2;
        let unique = loop {
            let candidate = match ext {
                Some(ext) => format!("{base}_{n}.{ext}"),
                None => format!("{base}_{n}"),
            };
            if used.insert(candidate.clone()) {
                break candidate;
            }
            n += 1;
        };
        out.push(unique);
    }
    out
}
