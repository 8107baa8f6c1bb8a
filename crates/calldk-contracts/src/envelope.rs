use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Upper bound on the size of a source image file, inclusive.
pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

/// MIME types an [`EncodedImage`] may carry.
pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/bmp",
    "image/webp",
];

/// One attached image in transport form.
///
/// `filename` is the basename of the file the operator picked, `data` the
/// standard base64 encoding of the re-encoded image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub filename: String,
    pub data: String,
    pub mime_type: String,
}

impl EncodedImage {
    /// Format token after the `image/` prefix, lowercased.
    pub fn format_token(&self) -> String {
        self.mime_type
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

/// Payload produced by one dialog session and handed back to the caller.
///
/// On disk the text lives under `interactive_calldk`. `command_logs` has no
/// producer anymore; it is read when present and never written when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(rename = "interactive_calldk", default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<EncodedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_logs: Option<String>,
}

impl ResultEnvelope {
    pub fn new(text: impl Into<String>, images: Vec<EncodedImage>) -> Self {
        Self {
            text: text.into(),
            images,
            command_logs: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.images.is_empty()
            && self
                .command_logs
                .as_deref()
                .map(|logs| logs.trim().is_empty())
                .unwrap_or(true)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("result envelope is not valid JSON")
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }
}
