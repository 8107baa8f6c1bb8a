use calldk_contracts::content::{ContentBlock, ImageFormat};
use calldk_contracts::envelope::ResultEnvelope;

use crate::background::CancelToken;
use crate::codec;
use crate::handoff::{DialogLauncher, HandoffError};

pub const TOOL_NAME: &str = "call_dk";
pub const TOOL_DESCRIPTION: &str =
    "Call dk: open a feedback dialog and return the operator's text and attached images.";
pub const DEFAULT_PROJECT_DIRECTORY: &str = ".";
pub const DEFAULT_SUMMARY: &str = "call dk";

/// The zero-argument tool: run one dialog handoff and convert the envelope
/// into content blocks.
#[derive(Debug, Clone)]
pub struct ToolAdapter {
    launcher: DialogLauncher,
    project_directory: String,
    summary: String,
}

impl ToolAdapter {
    pub fn new(launcher: DialogLauncher) -> Self {
        Self {
            launcher,
            project_directory: DEFAULT_PROJECT_DIRECTORY.to_string(),
            summary: DEFAULT_SUMMARY.to_string(),
        }
    }

    pub fn launcher(&self) -> &DialogLauncher {
        &self.launcher
    }

    /// Blocks until the dialog process exits.
    pub fn invoke(&self) -> Result<Vec<ContentBlock>, HandoffError> {
        self.invoke_cancellable(&CancelToken::default())
    }

    /// Cancelling `cancel` closes the open dialog and fails the call.
    pub fn invoke_cancellable(&self, cancel: &CancelToken) -> Result<Vec<ContentBlock>, HandoffError> {
        let envelope = self
            .launcher
            .launch_cancellable(&self.project_directory, &self.summary, cancel)?;
        Ok(content_blocks(&envelope))
    }
}

/// One optional combined text block, then one block per image in envelope
/// order. An image that cannot be decoded becomes a text block naming it.
pub fn content_blocks(envelope: &ResultEnvelope) -> Vec<ContentBlock> {
    let mut blocks = Vec::with_capacity(envelope.images.len() + 1);
    if let Some(text) = combined_text(envelope) {
        blocks.push(ContentBlock::Text(text));
    }
    for image in &envelope.images {
        match codec::decode(image) {
            Ok(bytes) => blocks.push(ContentBlock::Image {
                bytes,
                format: ImageFormat::normalize(&image.format_token()),
            }),
            Err(err) => {
                tracing::warn!(filename = %image.filename, error = %err, "dropping undecodable image");
                blocks.push(ContentBlock::Text(format!(
                    "Image processing error ({}): {err}",
                    image.filename
                )));
            }
        }
    }
    blocks
}

fn combined_text(envelope: &ResultEnvelope) -> Option<String> {
    let feedback = envelope.text.trim();
    let logs = envelope.command_logs.as_deref().unwrap_or_default().trim();

    let mut combined = String::new();
    if !feedback.is_empty() {
        combined.push_str(&format!("User feedback: {feedback}\n\n"));
    }
    if !logs.is_empty() {
        combined.push_str(&format!("Command logs: {logs}"));
    }
    let combined = combined.trim();
    (!combined.is_empty()).then(|| combined.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use calldk_contracts::content::{ContentBlock, ImageFormat};
    use calldk_contracts::envelope::{EncodedImage, ResultEnvelope};
    use image::{DynamicImage, Rgb, RgbImage};

    use super::content_blocks;

    fn png_bytes() -> anyhow::Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([1, 2, 3])))
            .write_to(&mut buffer, image::ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }

    fn encoded(filename: &str, data: String, mime_type: &str) -> EncodedImage {
        EncodedImage {
            filename: filename.to_string(),
            data,
            mime_type: mime_type.to_string(),
        }
    }

    #[test]
    fn empty_envelope_yields_no_blocks() {
        assert!(content_blocks(&ResultEnvelope::default()).is_empty());
    }

    #[test]
    fn text_is_prefixed_and_trimmed() {
        let blocks = content_blocks(&ResultEnvelope::new("  hello  ", Vec::new()));
        assert_eq!(blocks, vec![ContentBlock::text("User feedback: hello")]);
    }

    #[test]
    fn legacy_command_logs_follow_feedback() {
        let mut envelope = ResultEnvelope::new("ship it", Vec::new());
        envelope.command_logs = Some("cargo test: ok\n".to_string());
        let blocks = content_blocks(&envelope);
        assert_eq!(
            blocks,
            vec![ContentBlock::text(
                "User feedback: ship it\n\nCommand logs: cargo test: ok"
            )]
        );

        envelope.text = String::new();
        let blocks = content_blocks(&envelope);
        assert_eq!(blocks, vec![ContentBlock::text("Command logs: cargo test: ok")]);
    }

    #[test]
    fn image_formats_are_normalized() -> anyhow::Result<()> {
        let data = BASE64.encode(png_bytes()?);
        let envelope = ResultEnvelope::new(
            "",
            vec![
                encoded("a.jpg", data.clone(), "image/jpg"),
                encoded("b.tiff", data.clone(), "image/tiff"),
                encoded("c.webp", data, "image/webp"),
            ],
        );
        let formats: Vec<ImageFormat> = content_blocks(&envelope)
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Image { format, .. } => Some(format),
                ContentBlock::Text(_) => None,
            })
            .collect();
        assert_eq!(
            formats,
            vec![ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Webp]
        );
        Ok(())
    }

    #[test]
    fn corrupt_image_becomes_error_text_in_place() -> anyhow::Result<()> {
        let bytes = png_bytes()?;
        let envelope = ResultEnvelope::new(
            "",
            vec![
                encoded("good.png", BASE64.encode(&bytes), "image/png"),
                encoded("broken.png", "%%%corrupt%%%".to_string(), "image/png"),
            ],
        );
        let blocks = content_blocks(&envelope);
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0],
            ContentBlock::Image {
                bytes,
                format: ImageFormat::Png
            }
        );
        let text = blocks[1].as_text().unwrap_or_default();
        assert!(text.starts_with("Image processing error (broken.png):"), "{text}");
        Ok(())
    }

    #[cfg(unix)]
    mod end_to_end {
        use std::fs;
        use std::path::Path;

        use base64::Engine as _;
        use calldk_contracts::content::{ContentBlock, ImageFormat};
        use serde_json::json;

        use super::{png_bytes, BASE64};
        use crate::adapter::ToolAdapter;
        use crate::handoff::{DialogCommand, DialogLauncher, ExitOutcome, HandoffError};

        fn adapter(script: &str, temp_dir: &Path) -> ToolAdapter {
            ToolAdapter::new(
                DialogLauncher::new(
                    DialogCommand::new("sh").with_args(["-c", script, "calldk-dialog"]),
                )
                .with_temp_dir(temp_dir),
            )
        }

        #[test]
        fn submitted_text_becomes_single_text_block() -> anyhow::Result<()> {
            let temp = tempfile::tempdir()?;
            let blocks = adapter(
                r#"printf '%s' '{"interactive_calldk":"hello","images":[]}' > "$6""#,
                temp.path(),
            )
            .invoke()?;
            assert_eq!(blocks.len(), 1);
            assert!(blocks[0].as_text().unwrap_or_default().contains("hello"));
            Ok(())
        }

        #[test]
        fn crashed_dialog_fails_the_call() -> anyhow::Result<()> {
            let temp = tempfile::tempdir()?;
            match adapter("exit 1", temp.path()).invoke() {
                Err(HandoffError::LaunchFailed { outcome }) => {
                    assert_eq!(outcome, ExitOutcome::Code(1))
                }
                other => panic!("expected LaunchFailed, got {other:?}"),
            }
            Ok(())
        }

        #[test]
        fn missing_result_fails_the_call() -> anyhow::Result<()> {
            let temp = tempfile::tempdir()?;
            assert!(matches!(
                adapter(r#"rm -f "$6""#, temp.path()).invoke(),
                Err(HandoffError::MalformedResult { .. })
            ));
            Ok(())
        }

        #[test]
        fn per_image_failure_keeps_order() -> anyhow::Result<()> {
            let temp = tempfile::tempdir()?;
            let work = temp.path().join("handoff");
            fs::create_dir_all(&work)?;
            let bytes = png_bytes()?;
            let fixture = temp.path().join("envelope.json");
            fs::write(
                &fixture,
                serde_json::to_string(&json!({
                    "interactive_calldk": "",
                    "images": [
                        { "filename": "ok.png", "data": BASE64.encode(&bytes), "mime_type": "image/png" },
                        { "filename": "bad.png", "data": "!!not base64!!", "mime_type": "image/png" },
                    ],
                }))?,
            )?;
            let script = format!(r#"cp '{}' "$6""#, fixture.display());

            let blocks = adapter(&script, &work).invoke()?;
            assert_eq!(blocks.len(), 2);
            assert_eq!(
                blocks[0],
                ContentBlock::Image {
                    bytes,
                    format: ImageFormat::Png
                }
            );
            assert!(blocks[1]
                .as_text()
                .unwrap_or_default()
                .contains("bad.png"));
            Ok(())
        }
    }
}
