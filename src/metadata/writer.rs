use anyhow::{Context, Result};
use img_parts::jpeg::{Jpeg, JpegSegment};
use img_parts::png::{Png, PngChunk};
use img_parts::{Bytes, ImageEXIF};
use little_exif::exif_tag::{ExifTag, ExifTagGroup};
use little_exif::exif_tag_format::ExifTagFormat;
use little_exif::endian::Endian;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use std::path::Path;

use super::MediaKind;

// EXIF tag IDs for tags not natively supported by little_exif
const TAG_XP_KEYWORDS: u16 = 0x9C9E;

// little_exif as_u8_vec(JPEG) returns: [APP1 marker 2B][length 2B][Exif\0\0 6B][TIFF data]
// img-parts set_exif() expects just the TIFF data (after Exif\0\0)
const JPEG_EXIF_OVERHEAD: usize = 10; // 2 + 2 + 6

const IPTC_HEADER: &[u8] = b"Photoshop 3.0\0";
const IPTC_8BIM: &[u8] = b"8BIM";

/// Persist a caption and/or tag string into the file's embedded metadata,
/// using the idiom its container format supports and preserving everything
/// else already in the file.
///
/// A `None` field is left untouched. Failures are returned, not panicked —
/// the pipeline reports them as an embedding error distinct from a
/// generation failure.
pub fn write_metadata(path: &Path, caption: Option<&str>, tags: Option<&str>) -> Result<()> {
    if caption.is_none() && tags.is_none() {
        return Ok(());
    }
    match MediaKind::from_path(path) {
        Some(MediaKind::Jpeg) => write_jpeg(path, caption, tags),
        Some(MediaKind::Png) => write_png(path, caption, tags),
        Some(MediaKind::WebP) => write_webp(path, caption, tags),
        None => anyhow::bail!(
            "unsupported format for metadata embedding: {}",
            path.display()
        ),
    }
}

/// Build the EXIF tag set shared by the JPEG and WebP paths: caption in
/// ImageDescription, tags in UserComment (ASCII-prefixed) and XPKeywords.
fn build_exif_tags(caption: Option<&str>, tags: Option<&str>) -> Vec<ExifTag> {
    let mut new_tags = Vec::new();
    if let Some(caption) = caption {
        new_tags.push(ExifTag::ImageDescription(caption.to_string()));
    }
    if let Some(tags) = tags {
        let mut comment = b"ASCII\0\0\0".to_vec();
        comment.extend_from_slice(tags.as_bytes());
        new_tags.push(ExifTag::UserComment(comment));
        if let Some(xp) = make_xp_tag(TAG_XP_KEYWORDS, tags) {
            new_tags.push(xp);
        }
    }
    new_tags
}

/// Encode a string as UTF-16LE bytes (used for XP* tags).
fn encode_utf16le(s: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    bytes.push(0);
    bytes.push(0);
    bytes
}

/// Create an XP* tag (UTF-16LE encoded, IFD0 group).
fn make_xp_tag(tag_id: u16, value: &str) -> Option<ExifTag> {
    let raw_data = encode_utf16le(value);
    ExifTag::from_u16_with_data(
        tag_id,
        &ExifTagFormat::INT8U,
        &raw_data,
        &Endian::Little,
        &ExifTagGroup::IFD0,
    )
    .ok()
}

/// Load existing EXIF metadata with little_exif, suppressing its panics.
/// Returns None when the file has no parseable EXIF.
fn load_existing_metadata(path: &Path) -> Option<Metadata> {
    let path_owned = path.to_path_buf();
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let result = std::panic::catch_unwind(move || Metadata::new_from_path(&path_owned));
    std::panic::set_hook(prev_hook);

    match result {
        Ok(Ok(m)) => {
            if m.data().is_empty() {
                None
            } else {
                log::debug!("little_exif loaded {} existing EXIF tags", m.data().len());
                Some(m)
            }
        }
        Ok(Err(e)) => {
            log::debug!("little_exif could not parse EXIF: {e}");
            None
        }
        Err(_) => {
            log::debug!("little_exif panicked parsing EXIF");
            None
        }
    }
}

// ── JPEG ─────────────────────────────────────────────────────────────

/// JPEG strategy:
/// 1. Parse the whole file with img-parts (preserves all segments)
/// 2. Merge the new tags into existing EXIF via little_exif (fresh EXIF if
///    the file has none)
/// 3. Rewrite the EXIF APP1 segment in place and update the IPTC APP13
///    caption/keyword records
fn write_jpeg(path: &Path, caption: Option<&str>, tags: Option<&str>) -> Result<()> {
    let file_bytes = std::fs::read(path).context("Failed to read image file")?;
    let mut jpeg = Jpeg::from_bytes(Bytes::from(file_bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse JPEG: {e}"))?;

    let orig_exif_pos = find_exif_segment_pos(&jpeg);

    let mut metadata = load_existing_metadata(path).unwrap_or_else(Metadata::new);
    for tag in build_exif_tags(caption, tags) {
        metadata.set_tag(tag);
    }
    let exif_bytes = metadata.as_u8_vec(FileExtension::JPEG);
    if exif_bytes.len() > JPEG_EXIF_OVERHEAD {
        jpeg.set_exif(Some(Bytes::from(exif_bytes[JPEG_EXIF_OVERHEAD..].to_vec())));

        // set_exif() inserts after other APP segments; move the EXIF segment
        // back to its original slot so EXIF stays ahead of XMP/IPTC, which
        // many parsers require.
        if let Some(new_pos) = find_exif_segment_pos(&jpeg) {
            let target_pos = orig_exif_pos.unwrap_or(1).min(new_pos);
            if new_pos != target_pos {
                let segments = jpeg.segments_mut();
                let seg = segments.remove(new_pos);
                segments.insert(target_pos, seg);
            }
        }
    }

    update_iptc_metadata(&mut jpeg, caption, tags);

    let output = jpeg.encoder().bytes();
    std::fs::write(path, &output).context("Failed to write JPEG file")?;
    Ok(())
}

/// Find the EXIF APP1 segment position in a JPEG (marker 0xE1, "Exif\0\0").
fn find_exif_segment_pos(jpeg: &Jpeg) -> Option<usize> {
    const EXIF_PREFIX: &[u8] = b"Exif\0\0";
    jpeg.segments()
        .iter()
        .position(|s| s.marker() == 0xE1 && s.contents().starts_with(EXIF_PREFIX))
}

/// Update or create the IPTC APP13 segment with caption (2:120) and keyword
/// (2:25) records, preserving any other 8BIM resources.
fn update_iptc_metadata(jpeg: &mut Jpeg, caption: Option<&str>, tags: Option<&str>) {
    if caption.is_none() && tags.is_none() {
        return;
    }

    let iptc_pos = jpeg
        .segments()
        .iter()
        .position(|s| s.marker() == 0xED && s.contents().starts_with(IPTC_HEADER));

    let existing = iptc_pos.map(|pos| jpeg.segments()[pos].contents().to_vec());
    let contents = build_iptc_contents(existing.as_deref(), caption, tags);
    let new_segment = JpegSegment::new_with_contents(0xED, Bytes::from(contents));

    let segments = jpeg.segments_mut();
    if let Some(pos) = iptc_pos {
        segments[pos] = new_segment;
    } else {
        let insert_pos = segments.len().min(3);
        segments.insert(insert_pos, new_segment);
    }
}

/// Assemble APP13 contents: existing non-IPTC 8BIM resources are carried
/// over, resource 0x0404 (IPTC-IIM) is rebuilt with our records.
fn build_iptc_contents(
    existing: Option<&[u8]>,
    caption: Option<&str>,
    tags: Option<&str>,
) -> Vec<u8> {
    let mut result = Vec::new();
    result.extend_from_slice(IPTC_HEADER);

    if let Some(data) = existing {
        let mut pos = IPTC_HEADER.len();
        while pos + 12 <= data.len() {
            if &data[pos..pos + 4] != IPTC_8BIM {
                break;
            }
            let resource_id = u16::from_be_bytes([data[pos + 4], data[pos + 5]]);
            let pascal_len = data[pos + 6] as usize;
            let pascal_padded = if (pascal_len + 1) % 2 == 0 {
                pascal_len + 1
            } else {
                pascal_len + 2
            };
            let data_start = pos + 6 + pascal_padded;
            if data_start + 4 > data.len() {
                break;
            }
            let data_len = u32::from_be_bytes([
                data[data_start],
                data[data_start + 1],
                data[data_start + 2],
                data[data_start + 3],
            ]) as usize;
            let resource_end = data_start + 4 + data_len;
            let resource_end_padded = if data_len % 2 == 0 {
                resource_end
            } else {
                resource_end + 1
            };

            if resource_id != 0x0404 {
                let end = resource_end_padded.min(data.len());
                result.extend_from_slice(&data[pos..end]);
            }
            pos = resource_end_padded;
        }
    }

    // IPTC-IIM dataset records
    let mut iptc_data = Vec::new();

    // record version (2:0), required
    iptc_data.extend_from_slice(&[0x1C, 0x02, 0x00, 0x00, 0x02, 0x00, 0x02]);

    // keywords (2:25), one record per keyword
    if let Some(tags) = tags {
        for keyword in split_keywords(tags) {
            let bytes = keyword.as_bytes();
            let len = bytes.len().min(64) as u16;
            iptc_data.extend_from_slice(&[0x1C, 0x02, 0x19]);
            iptc_data.extend_from_slice(&len.to_be_bytes());
            iptc_data.extend_from_slice(&bytes[..len as usize]);
        }
    }

    // caption/abstract (2:120)
    if let Some(caption) = caption {
        let bytes = caption.as_bytes();
        let len = bytes.len().min(2000) as u16;
        iptc_data.extend_from_slice(&[0x1C, 0x02, 0x78]);
        iptc_data.extend_from_slice(&len.to_be_bytes());
        iptc_data.extend_from_slice(&bytes[..len as usize]);
    }

    // wrap the IPTC-IIM block as 8BIM resource 0x0404
    result.extend_from_slice(IPTC_8BIM);
    result.extend_from_slice(&0x0404u16.to_be_bytes());
    result.push(0x00); // empty pascal string
    result.push(0x00); // padding to even
    result.extend_from_slice(&(iptc_data.len() as u32).to_be_bytes());
    result.extend_from_slice(&iptc_data);
    if iptc_data.len() % 2 != 0 {
        result.push(0x00);
    }

    result
}

/// Split a tag string into individual keywords (comma-separated, falling
/// back to whitespace for hashtag-list style values).
fn split_keywords(tags: &str) -> Vec<&str> {
    let tokens: Vec<&str> = if tags.contains(',') {
        tags.split(',').collect()
    } else {
        tags.split_whitespace().collect()
    };
    tokens
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

// ── PNG ──────────────────────────────────────────────────────────────

/// PNG strategy: upsert `tEXt` chunks keyed `Description` and `Keywords`,
/// leaving every other chunk untouched.
fn write_png(path: &Path, caption: Option<&str>, tags: Option<&str>) -> Result<()> {
    let file_bytes = std::fs::read(path).context("Failed to read image file")?;
    let mut png = Png::from_bytes(Bytes::from(file_bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse PNG: {e}"))?;

    if let Some(caption) = caption {
        upsert_text_chunk(&mut png, "Description", caption);
    }
    if let Some(tags) = tags {
        upsert_text_chunk(&mut png, "Keywords", tags);
    }

    let output = png.encoder().bytes();
    std::fs::write(path, &output).context("Failed to write PNG file")?;
    Ok(())
}

fn upsert_text_chunk(png: &mut Png, keyword: &str, value: &str) {
    let mut contents = Vec::with_capacity(keyword.len() + 1 + value.len());
    contents.extend_from_slice(keyword.as_bytes());
    contents.push(0);
    contents.extend_from_slice(value.as_bytes());
    let chunk = PngChunk::new(*b"tEXt", Bytes::from(contents));

    let existing = png.chunks().iter().position(|c| {
        c.kind() == *b"tEXt"
            && c.contents()
                .split(|&b| b == 0)
                .next()
                .map(|k| k == keyword.as_bytes())
                .unwrap_or(false)
    });

    let chunks = png.chunks_mut();
    match existing {
        Some(pos) => chunks[pos] = chunk,
        // after IHDR
        None => chunks.insert(1.min(chunks.len()), chunk),
    }
}

// ── WebP ─────────────────────────────────────────────────────────────

/// WebP strategy: merge into the EXIF chunk via little_exif, which handles
/// the RIFF/VP8X bookkeeping itself.
fn write_webp(path: &Path, caption: Option<&str>, tags: Option<&str>) -> Result<()> {
    let mut metadata = load_existing_metadata(path).unwrap_or_else(Metadata::new);
    for tag in build_exif_tags(caption, tags) {
        metadata.set_tag(tag);
    }
    metadata
        .write_to_file(path)
        .map_err(|e| anyhow::anyhow!("Failed to write WebP metadata: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{read_metadata, NOT_AVAILABLE};
    use tempfile::TempDir;

    fn fresh_image(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        image::RgbImage::from_pixel(8, 8, image::Rgb([120, 60, 30]))
            .save(&path)
            .unwrap();
        path
    }

    // ── round trips ──────────────────────────────────────────────────

    #[test]
    fn jpeg_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = fresh_image(dir.path(), "cat.jpg");

        write_metadata(&path, Some("A cat"), Some("cat, pet")).unwrap();

        let fields = read_metadata(&path);
        assert_eq!(fields.caption, "A cat");
        assert!(
            fields.tags.contains("cat") && fields.tags.contains("pet"),
            "tags not recoverable: {:?}",
            fields.tags
        );

        // the image itself must still decode
        let img = image::open(&path).unwrap();
        assert_eq!(img.width(), 8);
    }

    #[test]
    fn png_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = fresh_image(dir.path(), "cat.png");

        write_metadata(&path, Some("A cat"), Some("cat, pet")).unwrap();

        let fields = read_metadata(&path);
        assert_eq!(fields.caption, "A cat");
        assert_eq!(fields.tags, "cat, pet");

        let img = image::open(&path).unwrap();
        assert_eq!(img.width(), 8);
    }

    #[test]
    fn png_rewrite_replaces_chunk_instead_of_duplicating() {
        let dir = TempDir::new().unwrap();
        let path = fresh_image(dir.path(), "cat.png");

        write_metadata(&path, Some("first"), None).unwrap();
        write_metadata(&path, Some("second"), None).unwrap();

        assert_eq!(read_metadata(&path).caption, "second");

        let png = Png::from_bytes(Bytes::from(std::fs::read(&path).unwrap())).unwrap();
        let description_chunks = png
            .chunks()
            .iter()
            .filter(|c| c.kind() == *b"tEXt" && c.contents().starts_with(b"Description\0"))
            .count();
        assert_eq!(description_chunks, 1);
    }

    #[test]
    fn caption_only_write_leaves_tags_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = fresh_image(dir.path(), "solo.png");

        write_metadata(&path, Some("Just a caption"), None).unwrap();

        let fields = read_metadata(&path);
        assert_eq!(fields.caption, "Just a caption");
        assert_eq!(fields.tags, NOT_AVAILABLE);
    }

    // ── failure paths ────────────────────────────────────────────────

    #[test]
    fn nothing_to_write_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = fresh_image(dir.path(), "noop.jpg");
        let before = std::fs::read(&path).unwrap();
        write_metadata(&path, None, None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn unsupported_format_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        assert!(write_metadata(&path, Some("c"), Some("t")).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = write_metadata(Path::new("/nonexistent/x.jpg"), Some("c"), None);
        assert!(err.is_err());
    }

    #[test]
    fn corrupt_jpeg_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jpg");
        std::fs::write(&path, b"not a jpeg at all").unwrap();
        assert!(write_metadata(&path, Some("c"), None).is_err());
    }

    // ── IPTC builder ─────────────────────────────────────────────────

    #[test]
    fn iptc_contents_contain_caption_and_keyword_records() {
        let contents = build_iptc_contents(None, Some("A cat"), Some("cat, pet"));
        assert!(contents.starts_with(IPTC_HEADER));
        // caption record marker 2:120
        let caption_marker: &[u8] = &[0x1C, 0x02, 0x78];
        assert!(contents.windows(3).any(|w| w == caption_marker));
        // two keyword records 2:25
        let keyword_marker: &[u8] = &[0x1C, 0x02, 0x19];
        let keyword_records = contents
            .windows(3)
            .filter(|w| *w == keyword_marker)
            .count();
        assert_eq!(keyword_records, 2);
    }

    #[test]
    fn split_keywords_handles_both_styles() {
        assert_eq!(split_keywords("a, b , c"), vec!["a", "b", "c"]);
        assert_eq!(split_keywords("a b c"), vec!["a", "b", "c"]);
        assert_eq!(split_keywords(""), Vec::<&str>::new());
    }
}
