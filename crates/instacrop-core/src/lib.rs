use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;
/// 0.8 MiB rounded up: a size must reach the full 838_860.8 bytes.
pub const DEFAULT_MIN_BYTES: u64 = (MIB * 8).div_ceil(10);
pub const DEFAULT_MAX_BYTES: u64 = MIB * 3 / 2;
pub const DEFAULT_INITIAL_QUALITY: u8 = 92;
pub const DEFAULT_QUALITY_STEP: u8 = 5;
pub const DEFAULT_MIN_QUALITY: u8 = 40;
pub const DEFAULT_FILE_STEM: &str = "optimized_image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    Square,
    Portrait,
    Landscape,
    StoryReels,
}

impl FormatKind {
    pub fn all() -> [FormatKind; 4] {
        [
            FormatKind::Square,
            FormatKind::Portrait,
            FormatKind::Landscape,
            FormatKind::StoryReels,
        ]
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::Portrait => "portrait",
            Self::Landscape => "landscape",
            Self::StoryReels => "story_reels",
        }
    }

    pub fn preset(self) -> FormatPreset {
        match self {
            Self::Square => FormatPreset {
                kind: self,
                label: "Square",
                ratio_label: "1:1",
                width: 1080,
                height: 1080,
            },
            Self::Portrait => FormatPreset {
                kind: self,
                label: "Portrait",
                ratio_label: "4:5",
                width: 1080,
                height: 1350,
            },
            Self::Landscape => FormatPreset {
                kind: self,
                label: "Landscape",
                ratio_label: "1.91:1",
                width: 1080,
                height: 566,
            },
            Self::StoryReels => FormatPreset {
                kind: self,
                label: "Story/Reels",
                ratio_label: "9:16",
                width: 1080,
                height: 1920,
            },
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "square" | "1:1" => Ok(Self::Square),
            "portrait" | "4:5" => Ok(Self::Portrait),
            "landscape" | "1.91:1" => Ok(Self::Landscape),
            "story_reels" | "story-reels" | "story" | "reels" | "9:16" => Ok(Self::StoryReels),
            other => Err(CoreError::UnknownFormat(other.to_string())),
        }
    }
}

impl Display for FormatKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// One of the fixed post formats. The target aspect ratio is always derived
/// from the pixel size, so `landscape` crops to 1080/566 rather than the
/// nominal 1.91.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatPreset {
    pub kind: FormatKind,
    pub label: &'static str,
    pub ratio_label: &'static str,
    pub width: u32,
    pub height: u32,
}

impl FormatPreset {
    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    pub fn size(&self) -> ImageSize {
        ImageSize {
            width: self.width,
            height: self.height,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} ({}) - {}x{}px", self.label, self.ratio_label, self.width, self.height)
    }
}

pub fn presets() -> Vec<FormatPreset> {
    FormatKind::all().iter().map(|kind| kind.preset()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMediaType {
    Jpeg,
    Png,
    Webp,
}

impl SourceMediaType {
    pub fn from_mime(mime: &str) -> Result<Self, CoreError> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Ok(Self::Jpeg),
            "image/png" => Ok(Self::Png),
            "image/webp" => Ok(Self::Webp),
            _ => Err(CoreError::UnsupportedMediaType(mime.to_string())),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            _ => Err(CoreError::UnsupportedMediaType(path.display().to_string())),
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }
}

/// Source-space rectangle sampled before scaling to the preset size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropRegion {
    pub fn full(size: ImageSize) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: size.width as f64,
            height: size.height as f64,
        }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width / self.height
    }

    pub fn covers(&self, size: ImageSize) -> bool {
        *self == Self::full(size)
    }
}

pub fn compute_crop(source: ImageSize, target_ratio: f64) -> Result<CropRegion, CoreError> {
    if source.is_empty() {
        return Err(CoreError::DegenerateGeometry {
            width: source.width,
            height: source.height,
        });
    }
    if !target_ratio.is_finite() || target_ratio <= 0.0 {
        return Err(CoreError::InvalidAspectRatio(target_ratio));
    }

    let ow = source.width as f64;
    let oh = source.height as f64;
    let source_ratio = ow / oh;

    let mut region = CropRegion::full(source);
    if source_ratio > target_ratio {
        region.width = (oh * target_ratio).min(ow);
        region.x = (ow - region.width) / 2.0;
    } else if source_ratio < target_ratio {
        region.height = (ow / target_ratio).min(oh);
        region.y = (oh - region.height) / 2.0;
    }
    Ok(region)
}

pub fn crop_for_preset(source: ImageSize, preset: &FormatPreset) -> Result<CropRegion, CoreError> {
    compute_crop(source, preset.aspect_ratio())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResampleFilter {
    Nearest,
    Bilinear,
    CatmullRom,
    Mitchell,
    #[default]
    Lanczos3,
}

impl ResampleFilter {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "bilinear" | "triangle" => Ok(Self::Bilinear),
            "catmull-rom" | "catmullrom" => Ok(Self::CatmullRom),
            "mitchell" => Ok(Self::Mitchell),
            "lanczos3" | "lanczos" | "high" => Ok(Self::Lanczos3),
            other => Err(CoreError::UnknownFilter(other.to_string())),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::CatmullRom => "catmull-rom",
            Self::Mitchell => "mitchell",
            Self::Lanczos3 => "lanczos3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPolicy {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub initial_quality: u8,
    pub quality_step: u8,
    pub min_quality: u8,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_MIN_BYTES,
            max_bytes: DEFAULT_MAX_BYTES,
            initial_quality: DEFAULT_INITIAL_QUALITY,
            quality_step: DEFAULT_QUALITY_STEP,
            min_quality: DEFAULT_MIN_QUALITY,
        }
    }
}

impl SearchPolicy {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.min_bytes >= self.max_bytes {
            return Err(CoreError::InvalidPolicy(format!(
                "min bytes ({}) must be below max bytes ({})",
                self.min_bytes, self.max_bytes
            )));
        }
        if self.quality_step == 0 {
            return Err(CoreError::InvalidPolicy("quality step must be positive".to_string()));
        }
        if self.min_quality == 0 || self.min_quality > self.initial_quality || self.initial_quality > 100 {
            return Err(CoreError::InvalidPolicy(format!(
                "quality range must satisfy 1 <= min ({}) <= initial ({}) <= 100",
                self.min_quality, self.initial_quality
            )));
        }
        Ok(())
    }

    /// Qualities scanned by the search, highest first.
    pub fn schedule(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut quality = self.initial_quality;
        while quality >= self.min_quality {
            out.push(quality);
            match quality.checked_sub(self.quality_step) {
                Some(next) => quality = next,
                None => break,
            }
        }
        out
    }
}

pub trait QualityEncoder {
    fn encode(&self, quality: u8) -> Result<Vec<u8>, CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchOutcome {
    /// Size landed inside `[min_bytes, max_bytes]`.
    InWindow,
    /// Under `max_bytes` but never reached `min_bytes`.
    BestEffort,
    /// Nothing fit under `max_bytes`; floor quality taken as-is.
    Floor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedResult {
    pub bytes: Vec<u8>,
    pub quality: u8,
    pub byte_len: usize,
    pub outcome: SearchOutcome,
    pub attempts: u32,
}

impl EncodedResult {
    fn new(bytes: Vec<u8>, quality: u8, outcome: SearchOutcome, attempts: u32) -> Self {
        Self {
            byte_len: bytes.len(),
            bytes,
            quality,
            outcome,
            attempts,
        }
    }

    pub fn size_mib(&self) -> f64 {
        self.byte_len as f64 / MIB as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformTarget {
    Cli,
    Tauri,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEventType {
    DecodeSuccess,
    DecodeError,
    CropComputed,
    EncodeStart,
    EncodeAttempt,
    EncodeSuccess,
    EncodeFallback,
    EncodeError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub format: Option<FormatKind>,
    pub platform: PlatformTarget,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Carries the fields shared by every event of one pipeline run.
#[derive(Clone, Copy)]
pub struct TelemetryScope<'a> {
    pub sink: Option<&'a dyn TelemetrySink>,
    pub platform: PlatformTarget,
    pub format: Option<FormatKind>,
}

impl<'a> TelemetryScope<'a> {
    pub fn new(sink: Option<&'a dyn TelemetrySink>, platform: PlatformTarget, format: Option<FormatKind>) -> Self {
        Self { sink, platform, format }
    }

    pub fn disabled() -> Self {
        Self::new(None, PlatformTarget::Cli, None)
    }

    pub fn emit(&self, event_type: TelemetryEventType, duration_ms: Option<u64>, detail: Option<String>) {
        if let Some(sink) = self.sink {
            sink.emit(TelemetryEvent {
                event_type,
                format: self.format,
                platform: self.platform,
                duration_ms,
                detail,
            });
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unsupported media type '{0}'; expected JPEG, PNG or WEBP")]
    UnsupportedMediaType(String),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("source image has degenerate geometry {width}x{height}")]
    DegenerateGeometry { width: u32, height: u32 },
    #[error("invalid target aspect ratio {0}")]
    InvalidAspectRatio(f64),
    #[error("invalid search policy: {0}")]
    InvalidPolicy(String),
    #[error("unknown format '{0}'; expected one of: square, portrait, landscape, story_reels")]
    UnknownFormat(String),
    #[error("unknown resample filter '{0}'; expected one of: nearest, bilinear, catmull-rom, mitchell, lanczos3")]
    UnknownFilter(String),
    #[error("no source image loaded")]
    MissingSource,
    #[error("render error: {0}")]
    Render(String),
    #[error("encode error: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    UnsupportedMediaType,
    DecodeError,
    DegenerateGeometry,
    InvalidAspectRatio,
    InvalidPolicy,
    UnknownFormat,
    UnknownFilter,
    MissingSource,
    RenderError,
    EncodeError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedMediaType(_) => ErrorCode::UnsupportedMediaType,
            Self::Decode(_) => ErrorCode::DecodeError,
            Self::DegenerateGeometry { .. } => ErrorCode::DegenerateGeometry,
            Self::InvalidAspectRatio(_) => ErrorCode::InvalidAspectRatio,
            Self::InvalidPolicy(_) => ErrorCode::InvalidPolicy,
            Self::UnknownFormat(_) => ErrorCode::UnknownFormat,
            Self::UnknownFilter(_) => ErrorCode::UnknownFilter,
            Self::MissingSource => ErrorCode::MissingSource,
            Self::Render(_) => ErrorCode::RenderError,
            Self::Encode(_) => ErrorCode::EncodeError,
        }
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    pub format: String,
    pub filter: String,
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    pub initial_quality: Option<u8>,
    pub quality_step: Option<u8>,
    pub min_quality: Option<u8>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        let policy = SearchPolicy::default();
        Self {
            format: FormatKind::Square.key().to_string(),
            filter: ResampleFilter::default().label().to_string(),
            min_bytes: Some(policy.min_bytes),
            max_bytes: Some(policy.max_bytes),
            initial_quality: Some(policy.initial_quality),
            quality_step: Some(policy.quality_step),
            min_quality: Some(policy.min_quality),
        }
    }
}

impl ExportConfig {
    pub fn format_kind(&self) -> Result<FormatKind, CoreError> {
        FormatKind::parse(&self.format)
    }

    pub fn resample_filter(&self) -> Result<ResampleFilter, CoreError> {
        ResampleFilter::parse(&self.filter)
    }

    pub fn search_policy(&self) -> Result<SearchPolicy, CoreError> {
        let defaults = SearchPolicy::default();
        let policy = SearchPolicy {
            min_bytes: self.min_bytes.unwrap_or(defaults.min_bytes),
            max_bytes: self.max_bytes.unwrap_or(defaults.max_bytes),
            initial_quality: self.initial_quality.unwrap_or(defaults.initial_quality),
            quality_step: self.quality_step.unwrap_or(defaults.quality_step),
            min_quality: self.min_quality.unwrap_or(defaults.min_quality),
        };
        policy.validate()?;
        Ok(policy)
    }
}

pub fn resolve_export_config(overrides: ExportConfig) -> ExportConfig {
    let mut cfg = ExportConfig::default();
    if !overrides.format.trim().is_empty() {
        cfg.format = overrides.format;
    }
    if !overrides.filter.trim().is_empty() {
        cfg.filter = overrides.filter;
    }
    cfg.min_bytes = overrides.min_bytes.or(cfg.min_bytes);
    cfg.max_bytes = overrides.max_bytes.or(cfg.max_bytes);
    cfg.initial_quality = overrides.initial_quality.or(cfg.initial_quality);
    cfg.quality_step = overrides.quality_step.or(cfg.quality_step);
    cfg.min_quality = overrides.min_quality.or(cfg.min_quality);
    cfg
}

/// `photo.final.png` + portrait -> `photo.final_insta_portrait_1080x1350.jpg`.
pub fn export_file_name(source_name: Option<&str>, preset: &FormatPreset) -> String {
    let stem = source_name
        .map(|name| match name.rsplit_once('.') {
            Some((stem, _)) => stem,
            None => name,
        })
        .map(str::trim)
        .filter(|stem| !stem.is_empty())
        .unwrap_or(DEFAULT_FILE_STEM);
    format!(
        "{}_insta_{}_{}x{}.jpg",
        stem,
        preset.kind.key(),
        preset.width,
        preset.height
    )
}

pub mod v1 {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct OptimizeRequest {
        pub image_bytes: Vec<u8>,
        pub media_type: Option<String>,
        pub file_name: Option<String>,
        pub format: String,
        pub min_bytes: Option<u64>,
        pub max_bytes: Option<u64>,
        pub initial_quality: Option<u8>,
        pub quality_step: Option<u8>,
        pub min_quality: Option<u8>,
        pub filter: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct OptimizeResponse {
        pub file_name: String,
        pub jpeg_bytes: Vec<u8>,
        pub quality: u8,
        pub byte_length: usize,
        pub outcome: SearchOutcome,
        pub format: String,
        pub width: u32,
        pub height: u32,
        pub crop: CropRegion,
    }
}

pub fn search_quality(encoder: &dyn QualityEncoder, policy: &SearchPolicy) -> Result<EncodedResult, CoreError> {
    search_quality_with_telemetry(encoder, policy, TelemetryScope::disabled())
}

pub fn search_quality_with_telemetry(
    encoder: &dyn QualityEncoder,
    policy: &SearchPolicy,
    telemetry: TelemetryScope<'_>,
) -> Result<EncodedResult, CoreError> {
    policy.validate()?;
    let start = Instant::now();
    telemetry.emit(
        TelemetryEventType::EncodeStart,
        None,
        Some(format!(
            "window={}..{},quality={}..{},step={}",
            policy.min_bytes, policy.max_bytes, policy.initial_quality, policy.min_quality, policy.quality_step
        )),
    );

    let result = run_search(encoder, policy, &telemetry);
    let elapsed = start.elapsed().as_millis() as u64;
    match &result {
        Ok(encoded) => {
            let event_type = match encoded.outcome {
                SearchOutcome::Floor => TelemetryEventType::EncodeFallback,
                SearchOutcome::InWindow | SearchOutcome::BestEffort => TelemetryEventType::EncodeSuccess,
            };
            telemetry.emit(
                event_type,
                Some(elapsed),
                Some(format!(
                    "quality={},bytes={},outcome={:?},attempts={}",
                    encoded.quality, encoded.byte_len, encoded.outcome, encoded.attempts
                )),
            );
        }
        Err(err) => telemetry.emit(TelemetryEventType::EncodeError, Some(elapsed), Some(err.to_string())),
    }
    result
}

fn run_search(
    encoder: &dyn QualityEncoder,
    policy: &SearchPolicy,
    telemetry: &TelemetryScope<'_>,
) -> Result<EncodedResult, CoreError> {
    let mut attempts = 0u32;
    let mut best: Option<(Vec<u8>, u8)> = None;
    let mut floor_encode: Option<Vec<u8>> = None;

    for quality in policy.schedule() {
        let bytes = encoder.encode(quality)?;
        attempts += 1;
        let size = bytes.len() as u64;
        telemetry.emit(
            TelemetryEventType::EncodeAttempt,
            None,
            Some(format!("quality={},bytes={}", quality, size)),
        );

        if size <= policy.max_bytes {
            if size >= policy.min_bytes {
                return Ok(EncodedResult::new(bytes, quality, SearchOutcome::InWindow, attempts));
            }
            best = Some((bytes, quality));
        } else if quality == policy.min_quality {
            floor_encode = Some(bytes);
        }
    }

    if let Some((bytes, quality)) = best {
        return Ok(EncodedResult::new(bytes, quality, SearchOutcome::BestEffort, attempts));
    }

    let bytes = match floor_encode {
        Some(bytes) => bytes,
        None => {
            attempts += 1;
            encoder.encode(policy.min_quality)?
        }
    };
    Ok(EncodedResult::new(bytes, policy.min_quality, SearchOutcome::Floor, attempts))
}
