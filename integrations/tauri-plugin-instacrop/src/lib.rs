use anyhow::Result;
use instacrop_core::{
    export_file_name, presets, resolve_export_config, search_quality_with_telemetry, v1, CoreError, CropRegion, EncodedResult,
    ErrorInfo, ExportConfig, FormatKind, FormatPreset, ImageSize, PlatformTarget, ResampleFilter, SearchOutcome, SearchPolicy,
    SourceMediaType, TelemetryScope,
};
use instacrop_image::{
    decode_source_with_telemetry, encode_preview_png, optimize_image, render_frame, JpegFrameEncoder, OptimizeOptions,
    SourceImage,
};
use instacrop_telemetry::sink_from_env;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ExportState {
    Idle,
    Encoding,
    Completed { fallback: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewFrame {
    pub format: FormatKind,
    pub width: u32,
    pub height: u32,
    pub crop: CropRegion,
    pub png: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub file_name: String,
    pub format: FormatKind,
    pub crop: CropRegion,
    pub result: EncodedResult,
}

/// Frame rendered and ready for the quality search. Produced by
/// [`EditorSession::begin_export`] so the host can repaint its status
/// before the search runs.
pub struct PendingExport {
    encoder: JpegFrameEncoder,
    preset: FormatPreset,
    crop: CropRegion,
    file_name: String,
}

/// Single-screen editor state: one source image, one selected format.
pub struct EditorSession {
    source: Option<SourceImage>,
    file_name: Option<String>,
    format: FormatKind,
    filter: ResampleFilter,
    policy: SearchPolicy,
    export_state: ExportState,
    status: Option<String>,
}

impl Default for EditorSession {
    fn default() -> Self {
        Self {
            source: None,
            file_name: None,
            format: FormatKind::Square,
            filter: ResampleFilter::default(),
            policy: SearchPolicy::default(),
            export_state: ExportState::Idle,
            status: None,
        }
    }
}

impl EditorSession {
    pub fn with_config(config: ExportConfig) -> Result<Self, CoreError> {
        let cfg = resolve_export_config(config);
        Ok(Self {
            format: cfg.format_kind()?,
            filter: cfg.resample_filter()?,
            policy: cfg.search_policy()?,
            ..Self::default()
        })
    }

    pub fn format(&self) -> FormatKind {
        self.format
    }

    pub fn source_size(&self) -> Option<ImageSize> {
        self.source.as_ref().map(SourceImage::size)
    }

    pub fn export_state(&self) -> ExportState {
        self.export_state
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Replaces the current source. An unsupported type or a decode failure
    /// discards whatever was loaded before.
    pub fn load(
        &mut self,
        file_name: Option<&str>,
        mime: &str,
        bytes: &[u8],
        telemetry: TelemetryScope<'_>,
    ) -> Result<ImageSize, CoreError> {
        self.export_state = ExportState::Idle;
        let decoded = SourceMediaType::from_mime(mime)
            .and_then(|media_type| decode_source_with_telemetry(bytes, Some(media_type), telemetry));
        match decoded {
            Ok(source) => {
                let size = source.size();
                self.source = Some(source);
                self.file_name = file_name.map(str::to_string);
                self.status = None;
                Ok(size)
            }
            Err(err) => {
                self.clear();
                self.status = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn clear(&mut self) {
        self.source = None;
        self.file_name = None;
        self.export_state = ExportState::Idle;
        self.status = None;
    }

    /// A finished export belongs to the old format, so the state drops back
    /// to `Idle`.
    pub fn select_format(&mut self, format: FormatKind) {
        self.format = format;
        self.export_state = ExportState::Idle;
    }

    pub fn preview(&mut self) -> Result<PreviewFrame, CoreError> {
        let source = self.source.as_ref().ok_or(CoreError::MissingSource)?;
        let preset = self.format.preset();
        let frame = render_frame(source, &preset, self.filter)?;
        let png = encode_preview_png(&frame.pixels)?;
        self.status = Some("Preview updated. Export when ready.".to_string());
        Ok(PreviewFrame {
            format: self.format,
            width: preset.width,
            height: preset.height,
            crop: frame.crop,
            png,
        })
    }

    pub fn begin_export(&mut self) -> Result<PendingExport, CoreError> {
        let Some(source) = self.source.as_ref() else {
            self.status = Some("Select an image first.".to_string());
            return Err(CoreError::MissingSource);
        };
        let preset = self.format.preset();
        let frame = render_frame(source, &preset, self.filter)?;
        let pending = PendingExport {
            encoder: JpegFrameEncoder::from_rgba(&frame.pixels),
            preset,
            crop: frame.crop,
            file_name: export_file_name(self.file_name.as_deref(), &preset),
        };
        self.export_state = ExportState::Encoding;
        self.status = Some("Optimizing image...".to_string());
        Ok(pending)
    }

    pub fn complete_export(
        &mut self,
        pending: PendingExport,
        telemetry: TelemetryScope<'_>,
    ) -> Result<ExportArtifact, CoreError> {
        match search_quality_with_telemetry(&pending.encoder, &self.policy, telemetry) {
            Ok(result) => {
                self.export_state = ExportState::Completed {
                    fallback: result.outcome == SearchOutcome::Floor,
                };
                self.status = Some(format!(
                    "Export complete! File size: {:.2}MB (quality: {})",
                    result.size_mib(),
                    result.quality
                ));
                Ok(ExportArtifact {
                    file_name: pending.file_name,
                    format: pending.preset.kind,
                    crop: pending.crop,
                    result,
                })
            }
            Err(err) => {
                self.export_state = ExportState::Idle;
                self.status = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn export(&mut self, telemetry: TelemetryScope<'_>) -> Result<ExportArtifact, CoreError> {
        let pending = self.begin_export()?;
        self.complete_export(pending, telemetry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub image_bytes: Vec<u8>,
    pub media_type: Option<String>,
    pub format: Option<String>,
    pub filter: Option<String>,
}

pub fn optimize(request: v1::OptimizeRequest) -> Result<v1::OptimizeResponse> {
    let cfg = resolve_export_config(ExportConfig {
        format: request.format.clone(),
        filter: request.filter.clone().unwrap_or_default(),
        min_bytes: request.min_bytes,
        max_bytes: request.max_bytes,
        initial_quality: request.initial_quality,
        quality_step: request.quality_step,
        min_quality: request.min_quality,
    });
    let options = OptimizeOptions {
        format: cfg.format_kind()?,
        filter: cfg.resample_filter()?,
        policy: cfg.search_policy()?,
    };
    let media_type = request.media_type.as_deref().map(SourceMediaType::from_mime).transpose()?;
    let telemetry = sink_from_env();
    let scope = TelemetryScope::new(
        telemetry.as_ref().map(|sink| sink.as_ref()),
        PlatformTarget::Tauri,
        Some(options.format),
    );
    let optimized = optimize_image(&request.image_bytes, media_type, &options, scope)?;
    Ok(v1::OptimizeResponse {
        file_name: export_file_name(request.file_name.as_deref(), &optimized.preset),
        quality: optimized.result.quality,
        byte_length: optimized.result.byte_len,
        outcome: optimized.result.outcome,
        format: optimized.preset.kind.key().to_string(),
        width: optimized.preset.width,
        height: optimized.preset.height,
        crop: optimized.crop,
        jpeg_bytes: optimized.result.bytes,
    })
}

pub fn optimize_command(request: v1::OptimizeRequest) -> std::result::Result<v1::OptimizeResponse, String> {
    optimize(request).map_err(|err| error_message(&err))
}

pub fn preview_command(request: PreviewRequest) -> std::result::Result<PreviewFrame, String> {
    let mut session = EditorSession::with_config(ExportConfig {
        format: request.format.unwrap_or_default(),
        filter: request.filter.unwrap_or_default(),
        ..ExportConfig::default()
    })
    .map_err(|err| err.to_string())?;
    let media_type = match request.media_type {
        Some(mime) => mime,
        None => instacrop_image::sniff_media_type(&request.image_bytes)
            .map_err(|err| err.to_string())?
            .mime()
            .to_string(),
    };
    session
        .load(None, &media_type, &request.image_bytes, TelemetryScope::disabled())
        .map_err(|err| err.to_string())?;
    session.preview().map_err(|err| err.to_string())
}

pub fn presets_command() -> Vec<FormatPreset> {
    presets()
}

/// Structured form of a command failure, when the error came from the core.
pub fn error_info(err: &anyhow::Error) -> Option<ErrorInfo> {
    err.downcast_ref::<CoreError>().map(CoreError::as_error_info)
}

fn error_message(err: &anyhow::Error) -> String {
    match error_info(err) {
        Some(info) => serde_json::to_string(&info).unwrap_or_else(|_| info.message),
        None => err.to_string(),
    }
}

#[cfg(feature = "tauri-plugin")]
#[tauri::command]
fn tauri_optimize_command(request: v1::OptimizeRequest) -> std::result::Result<v1::OptimizeResponse, String> {
    optimize_command(request)
}

#[cfg(feature = "tauri-plugin")]
#[tauri::command]
fn tauri_preview_command(request: PreviewRequest) -> std::result::Result<PreviewFrame, String> {
    preview_command(request)
}

#[cfg(feature = "tauri-plugin")]
#[tauri::command]
fn tauri_presets_command() -> Vec<FormatPreset> {
    presets_command()
}

#[cfg(feature = "tauri-plugin")]
pub fn init<R: tauri::Runtime>() -> tauri::plugin::TauriPlugin<R> {
    tauri::plugin::Builder::new("instacrop")
        .invoke_handler(tauri::generate_handler![
            tauri_optimize_command,
            tauri_preview_command,
            tauri_presets_command
        ])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255u8, 255, 255])
            } else {
                Rgb([10u8, 10, 10])
            }
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)
            .expect("sample png");
        out
    }

    fn open_window() -> ExportConfig {
        ExportConfig {
            format: String::new(),
            filter: "bilinear".to_string(),
            min_bytes: Some(1),
            max_bytes: Some(u64::MAX),
            initial_quality: None,
            quality_step: None,
            min_quality: None,
        }
    }

    #[test]
    fn unsupported_mime_discards_loaded_source() {
        let mut session = EditorSession::default();
        session
            .load(Some("a.png"), "image/png", &sample_png(10, 10), TelemetryScope::disabled())
            .expect("load png");
        assert!(session.source_size().is_some());

        let err = session
            .load(Some("a.gif"), "image/gif", b"GIF89a", TelemetryScope::disabled())
            .expect_err("gif rejected");
        assert_eq!(err.code(), instacrop_core::ErrorCode::UnsupportedMediaType);
        assert!(session.source_size().is_none());
        assert!(session.status().is_some());
    }

    #[test]
    fn export_without_source_reports_missing_source() {
        let mut session = EditorSession::default();
        let err = session.export(TelemetryScope::disabled()).expect_err("no source");
        assert!(matches!(err, CoreError::MissingSource));
        assert_eq!(session.export_state(), ExportState::Idle);
    }

    #[test]
    fn export_walks_idle_encoding_completed() {
        let mut session = EditorSession::with_config(open_window()).expect("session");
        session
            .load(Some("dog.photo.png"), "image/png", &sample_png(20, 10), TelemetryScope::disabled())
            .expect("load");
        session.select_format(FormatKind::Landscape);
        assert_eq!(session.export_state(), ExportState::Idle);

        let pending = session.begin_export().expect("begin");
        assert_eq!(session.export_state(), ExportState::Encoding);

        let artifact = session
            .complete_export(pending, TelemetryScope::disabled())
            .expect("complete");
        assert_eq!(session.export_state(), ExportState::Completed { fallback: false });
        assert_eq!(artifact.file_name, "dog.photo_insta_landscape_1080x566.jpg");
        assert_eq!(artifact.result.quality, 92);
        assert!(session.status().unwrap_or_default().starts_with("Export complete"));
    }

    #[test]
    fn format_change_resets_completed_export() {
        let mut session = EditorSession::with_config(open_window()).expect("session");
        session
            .load(Some("pier.png"), "image/png", &sample_png(12, 12), TelemetryScope::disabled())
            .expect("load");
        session.export(TelemetryScope::disabled()).expect("export");
        assert_eq!(session.export_state(), ExportState::Completed { fallback: false });

        session.select_format(FormatKind::Portrait);
        assert_eq!(session.export_state(), ExportState::Idle);
        assert_eq!(session.format(), FormatKind::Portrait);
    }

    #[test]
    fn load_accepts_content_that_disagrees_with_mime() {
        let mut session = EditorSession::default();
        let size = session
            .load(Some("renamed.jpg"), "image/jpeg", &sample_png(7, 5), TelemetryScope::disabled())
            .expect("png bytes declared as jpeg");
        assert_eq!(size, ImageSize::new(7, 5));
    }

    #[test]
    fn preview_follows_format_changes() {
        let mut session = EditorSession::default();
        session
            .load(None, "image/png", &sample_png(16, 16), TelemetryScope::disabled())
            .expect("load");
        let square = session.preview().expect("square preview");
        assert_eq!((square.width, square.height), (1080, 1080));
        assert!(square.crop.covers(ImageSize::new(16, 16)));

        session.select_format(FormatKind::StoryReels);
        let story = session.preview().expect("story preview");
        assert_eq!((story.width, story.height), (1080, 1920));
        assert_eq!(story.crop.height, 16.0);
        assert_eq!(story.crop.width, 9.0);
    }

    #[test]
    fn optimize_command_returns_named_jpeg() {
        let response = optimize_command(v1::OptimizeRequest {
            image_bytes: sample_png(12, 12),
            media_type: Some("image/png".to_string()),
            file_name: Some("tile.png".to_string()),
            format: "square".to_string(),
            min_bytes: Some(1),
            max_bytes: Some(u64::MAX),
            initial_quality: Some(80),
            quality_step: None,
            min_quality: None,
            filter: None,
        })
        .expect("command should succeed");
        assert_eq!(response.file_name, "tile_insta_square_1080x1080.jpg");
        assert_eq!(response.quality, 80);
        assert_eq!(response.byte_length, response.jpeg_bytes.len());
    }

    #[test]
    fn optimize_command_rejects_unknown_format() {
        let error = optimize_command(v1::OptimizeRequest {
            image_bytes: vec![1, 2, 3],
            media_type: None,
            file_name: None,
            format: "panorama".to_string(),
            min_bytes: None,
            max_bytes: None,
            initial_quality: None,
            quality_step: None,
            min_quality: None,
            filter: None,
        })
        .expect_err("should fail for unknown format");
        assert!(error.contains("unknown-format"));
    }
}
