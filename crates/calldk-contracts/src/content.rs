use std::fmt;

/// Image formats the calling protocol accepts in an image block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Webp,
}

impl ImageFormat {
    /// Maps a format token (`jpg`, `JPEG`, `image/webp`, ...) to a transport format.
    ///
    /// `jpg` becomes `jpeg`; anything unknown falls back to `png`.
    pub fn normalize(raw: &str) -> Self {
        let token = raw.rsplit('/').next().unwrap_or_default();
        match token.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "gif" => Self::Gif,
            "bmp" => Self::Bmp,
            "webp" => Self::Webp,
            _ => Self::Png,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Webp => "webp",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
            Self::Webp => "image/webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of tool output returned to the protocol caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text(String),
    Image { bytes: Vec<u8>, format: ImageFormat },
}

impl ContentBlock {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Image { .. } => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentBlock, ImageFormat};

    #[test]
    fn normalize_maps_jpg_and_unknown_formats() {
        assert_eq!(ImageFormat::normalize("jpg"), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::normalize("image/jpg"), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::normalize("image/JPEG"), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::normalize("image/webp"), ImageFormat::Webp);
        assert_eq!(ImageFormat::normalize("image/tiff"), ImageFormat::Png);
        assert_eq!(ImageFormat::normalize(""), ImageFormat::Png);
    }

    #[test]
    fn content_block_accessors() {
        let text = ContentBlock::text("hello");
        assert_eq!(text.as_text(), Some("hello"));
        assert!(!text.is_image());

        let image = ContentBlock::Image {
            bytes: vec![1, 2, 3],
            format: ImageFormat::Gif,
        };
        assert!(image.is_image());
        assert_eq!(image.as_text(), None);
    }
}
