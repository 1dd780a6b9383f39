//! Embedded-metadata codec.
//!
//! Two entry points:
//!
//! - [`read_metadata`] — pull any existing caption/keyword fields out of an
//!   image, degrading to a "not available" sentinel instead of erroring
//! - [`write_metadata`] — persist a generated caption and tag list using the
//!   idiom the container format supports, preserving everything else in the
//!   file
//!
//! JPEG carries EXIF (ImageDescription + UserComment + XPKeywords) plus IPTC
//! caption/keyword records, PNG carries `tEXt` chunks, WebP carries EXIF.

mod reader;
mod writer;

pub use reader::{read_metadata, MetadataFields, NOT_AVAILABLE};
pub use writer::write_metadata;

use std::path::Path;

/// Container formats the codec can embed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Jpeg,
    Png,
    WebP,
}

impl MediaKind {
    /// Detect the media kind from a file path extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// MIME type for sending the image to the completion service.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a.jpg")), Some(MediaKind::Jpeg));
        assert_eq!(MediaKind::from_path(Path::new("a.JPEG")), Some(MediaKind::Jpeg));
        assert_eq!(MediaKind::from_path(Path::new("a.png")), Some(MediaKind::Png));
        assert_eq!(MediaKind::from_path(Path::new("a.webp")), Some(MediaKind::WebP));
        assert_eq!(MediaKind::from_path(Path::new("a.gif")), None);
        assert_eq!(MediaKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn mime_types() {
        assert_eq!(MediaKind::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(MediaKind::Png.mime_type(), "image/png");
        assert_eq!(MediaKind::WebP.mime_type(), "image/webp");
    }
}
