use img_parts::png::Png;
use img_parts::Bytes;
use nom_exif::*;
use std::path::Path;

use super::MediaKind;

/// Sentinel for a field that is absent or unreadable.
pub const NOT_AVAILABLE: &str = "N/A";

// XP* tag IDs (IFD0)
const TAG_XP_KEYWORDS: u16 = 0x9C9E;

/// Caption and keyword fields already embedded in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFields {
    pub caption: String,
    pub tags: String,
}

impl Default for MetadataFields {
    fn default() -> Self {
        Self {
            caption: NOT_AVAILABLE.to_string(),
            tags: NOT_AVAILABLE.to_string(),
        }
    }
}

/// Read whatever caption/keyword metadata a file already carries.
///
/// Never fails: unsupported formats, unreadable files, and absent fields all
/// degrade to the [`NOT_AVAILABLE`] sentinel per field.
pub fn read_metadata(path: &Path) -> MetadataFields {
    let fields = match MediaKind::from_path(path) {
        Some(MediaKind::Png) => read_png_text(path),
        Some(MediaKind::Jpeg) | Some(MediaKind::WebP) => read_exif_fields(path),
        None => {
            log::debug!("unsupported format for metadata read: {}", path.display());
            None
        }
    };
    fields.unwrap_or_default()
}

/// EXIF read path for JPEG and WebP.
fn read_exif_fields(path: &Path) -> Option<MetadataFields> {
    let mut parser = MediaParser::new();
    let ms = match MediaSource::file_path(path) {
        Ok(ms) => ms,
        Err(e) => {
            log::debug!("failed to open {}: {e}", path.display());
            return None;
        }
    };

    let iter: ExifIter = match parser.parse(ms) {
        Ok(iter) => iter,
        Err(_) => {
            log::debug!("no EXIF data found in {}", path.display());
            return None;
        }
    };
    let exif: Exif = iter.into();

    let mut fields = MetadataFields::default();

    if let Some(val) = exif.get(ExifTag::ImageDescription) {
        if let Some(s) = entry_to_string(val) {
            fields.caption = s;
        }
    }

    // tags live in UserComment, with XPKeywords as fallback
    if let Some(val) = exif.get(ExifTag::UserComment) {
        if let Some(s) = entry_to_string(val) {
            fields.tags = s;
        }
    }
    if fields.tags == NOT_AVAILABLE {
        if let Some(val) = exif.get_by_ifd_tag_code(0, TAG_XP_KEYWORDS) {
            if let Some(s) = entry_to_string(val) {
                fields.tags = s;
            }
        }
    }

    Some(fields)
}

/// PNG read path: scan `tEXt` chunks for the `Description` / `Keywords`
/// keywords the writer uses.
fn read_png_text(path: &Path) -> Option<MetadataFields> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            log::debug!("failed to read {}: {e}", path.display());
            return None;
        }
    };
    let png = match Png::from_bytes(Bytes::from(bytes)) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("failed to parse PNG {}: {e}", path.display());
            return None;
        }
    };

    let mut fields = MetadataFields::default();
    for chunk in png.chunks() {
        if chunk.kind() != *b"tEXt" {
            continue;
        }
        let contents = chunk.contents();
        let Some(split) = contents.iter().position(|&b| b == 0) else {
            continue;
        };
        let keyword = String::from_utf8_lossy(&contents[..split]);
        let value = String::from_utf8_lossy(&contents[split + 1..]).to_string();
        if value.is_empty() {
            continue;
        }
        match keyword.as_ref() {
            "Description" => fields.caption = value,
            "Keywords" => fields.tags = value,
            _ => {}
        }
    }

    Some(fields)
}

/// Convert an EntryValue to an Option<String>.
fn entry_to_string(val: &EntryValue) -> Option<String> {
    let s = val.to_string();
    let s = s.trim().trim_matches('"').to_string();
    if s.is_empty() || s == "\u{0}" {
        None
    } else {
        Some(s)
    }
}
