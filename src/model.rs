//! Core value types shared by the asset sources, the content index and the
//! cast session controller.

use std::fmt;

/// Raster image formats the cast receiver can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Apng,
    Bmp,
    Gif,
    Jpeg,
    Png,
    Webp,
}

impl MediaType {
    pub const ALL: [MediaType; 6] = [
        MediaType::Apng,
        MediaType::Bmp,
        MediaType::Gif,
        MediaType::Jpeg,
        MediaType::Png,
        MediaType::Webp,
    ];

    /// Parses a MIME type, accepting only the allow-listed image formats.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let normalized = mime.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|media_type| media_type.mime() == normalized)
    }

    pub fn mime(self) -> &'static str {
        match self {
            MediaType::Apng => "image/apng",
            MediaType::Bmp => "image/bmp",
            MediaType::Gif => "image/gif",
            MediaType::Jpeg => "image/jpeg",
            MediaType::Png => "image/png",
            MediaType::Webp => "image/webp",
        }
    }

    /// Maps a sniffed `image` crate format onto the allow-list.
    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(MediaType::Png),
            image::ImageFormat::Jpeg => Some(MediaType::Jpeg),
            image::ImageFormat::Gif => Some(MediaType::Gif),
            image::ImageFormat::WebP => Some(MediaType::Webp),
            image::ImageFormat::Bmp => Some(MediaType::Bmp),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// A displayable photo.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    /// Source-specific identifier: a remote asset id or a root-relative path.
    pub id: String,
    pub media_type: MediaType,
}

impl Asset {
    pub fn new(id: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            id: id.into(),
            media_type,
        }
    }

    /// Ingestion filter: `None` unless the MIME type is allow-listed.
    pub fn from_mime(id: impl Into<String>, mime: &str) -> Option<Self> {
        MediaType::from_mime(mime).map(|media_type| Self::new(id, media_type))
    }
}

/// Snapshot of what the receiver reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Display name of the running receiver application; empty when none runs.
    pub display_name: String,
    pub is_present: bool,
    /// URL of the media currently loaded by the media receiver, if any.
    pub active_content_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{Asset, MediaType};

    #[test]
    fn test_mime_allow_list_accepts_cast_image_formats_only() {
        for media_type in MediaType::ALL {
            assert_eq!(MediaType::from_mime(media_type.mime()), Some(media_type));
        }
        assert_eq!(MediaType::from_mime("IMAGE/JPEG"), Some(MediaType::Jpeg));
        assert_eq!(MediaType::from_mime("image/heic"), None);
        assert_eq!(MediaType::from_mime("video/mp4"), None);
        assert_eq!(MediaType::from_mime(""), None);
    }

    #[test]
    fn test_asset_ingestion_drops_unsupported_types() {
        assert_eq!(
            Asset::from_mime("a1", "image/webp"),
            Some(Asset::new("a1", MediaType::Webp))
        );
        assert_eq!(Asset::from_mime("a2", "image/x-canon-cr2"), None);
    }

    #[test]
    fn test_image_format_mapping() {
        assert_eq!(
            MediaType::from_image_format(image::ImageFormat::Jpeg),
            Some(MediaType::Jpeg)
        );
        assert_eq!(MediaType::from_image_format(image::ImageFormat::Tiff), None);
    }
}
