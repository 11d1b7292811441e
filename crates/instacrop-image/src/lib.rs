use std::time::Instant;

use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, RgbImage, RgbaImage};
use instacrop_core::{
    crop_for_preset, search_quality_with_telemetry, CoreError, CropRegion, EncodedResult, FormatKind, FormatPreset, ImageSize,
    QualityEncoder, ResampleFilter, SearchPolicy, SourceMediaType, TelemetryEventType, TelemetryScope,
};

/// Decoded upload. Replaced wholesale on every new load.
#[derive(Debug, Clone)]
pub struct SourceImage {
    image: DynamicImage,
    media_type: SourceMediaType,
}

impl SourceImage {
    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.image.width(), self.image.height())
    }

    pub fn media_type(&self) -> SourceMediaType {
        self.media_type
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }
}

pub fn sniff_media_type(bytes: &[u8]) -> Result<SourceMediaType, CoreError> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => Ok(SourceMediaType::Jpeg),
        Ok(ImageFormat::Png) => Ok(SourceMediaType::Png),
        Ok(ImageFormat::WebP) => Ok(SourceMediaType::Webp),
        Ok(other) => Err(CoreError::UnsupportedMediaType(format!("{:?}", other).to_ascii_lowercase())),
        Err(_) => Err(CoreError::UnsupportedMediaType("unknown".to_string())),
    }
}

/// The declared type only gates the upload; the decoder follows the
/// content, so a PNG named `.jpg` still loads.
pub fn decode_source(bytes: &[u8], declared: Option<SourceMediaType>) -> Result<SourceImage, CoreError> {
    let media_type = match declared {
        Some(declared) => sniff_media_type(bytes).unwrap_or(declared),
        None => sniff_media_type(bytes)?,
    };
    let image = image::load_from_memory(bytes).map_err(|e| CoreError::Decode(e.to_string()))?;
    let source = SourceImage { image, media_type };
    let size = source.size();
    if size.is_empty() {
        return Err(CoreError::DegenerateGeometry {
            width: size.width,
            height: size.height,
        });
    }
    Ok(source)
}

pub fn decode_source_with_telemetry(
    bytes: &[u8],
    media_type: Option<SourceMediaType>,
    telemetry: TelemetryScope<'_>,
) -> Result<SourceImage, CoreError> {
    let start = Instant::now();
    let decoded = decode_source(bytes, media_type);
    let elapsed = Some(start.elapsed().as_millis() as u64);
    match &decoded {
        Ok(source) => telemetry.emit(
            TelemetryEventType::DecodeSuccess,
            elapsed,
            Some(format!(
                "media={},size={}x{}",
                source.media_type().mime(),
                source.size().width,
                source.size().height
            )),
        ),
        Err(err) => telemetry.emit(TelemetryEventType::DecodeError, elapsed, Some(err.to_string())),
    }
    decoded
}

/// Samples `region` of the source and resamples it straight to
/// `target`, like a canvas `drawImage` with a fractional source rectangle.
pub fn render_region(
    source: &SourceImage,
    region: &CropRegion,
    target: ImageSize,
    filter: ResampleFilter,
) -> Result<RgbaImage, CoreError> {
    if target.is_empty() {
        return Err(CoreError::DegenerateGeometry {
            width: target.width,
            height: target.height,
        });
    }
    let rgba = source.image.to_rgba8();
    let (src_width, src_height) = rgba.dimensions();
    let src_image = fr::images::Image::from_vec_u8(src_width, src_height, rgba.into_raw(), fr::PixelType::U8x4)
        .map_err(|e| CoreError::Render(format!("building source buffer: {}", e)))?;
    let mut dst_image = fr::images::Image::new(target.width, target.height, fr::PixelType::U8x4);

    let options = fr::ResizeOptions::new()
        .crop(region.x, region.y, region.width, region.height)
        .resize_alg(resize_alg(filter));
    fr::Resizer::new()
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| CoreError::Render(e.to_string()))?;

    RgbaImage::from_raw(target.width, target.height, dst_image.into_vec())
        .ok_or_else(|| CoreError::Render("resized buffer has unexpected length".to_string()))
}

fn resize_alg(filter: ResampleFilter) -> fr::ResizeAlg {
    match filter {
        ResampleFilter::Nearest => fr::ResizeAlg::Nearest,
        ResampleFilter::Bilinear => fr::ResizeAlg::Convolution(fr::FilterType::Bilinear),
        ResampleFilter::CatmullRom => fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom),
        ResampleFilter::Mitchell => fr::ResizeAlg::Convolution(fr::FilterType::Mitchell),
        ResampleFilter::Lanczos3 => fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3),
    }
}

#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub preset: FormatPreset,
    pub crop: CropRegion,
    pub pixels: RgbaImage,
}

pub fn render_frame(source: &SourceImage, preset: &FormatPreset, filter: ResampleFilter) -> Result<RenderedFrame, CoreError> {
    let crop = crop_for_preset(source.size(), preset)?;
    let pixels = render_region(source, &crop, preset.size(), filter)?;
    Ok(RenderedFrame {
        preset: *preset,
        crop,
        pixels,
    })
}

/// JPEG has no alpha; transparent pixels end up black.
pub fn flatten_to_rgb(frame: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
        let [r, g, b, a] = frame.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 127) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

pub fn encode_preview_png(frame: &RgbaImage) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(frame.as_raw(), frame.width(), frame.height(), ExtendedColorType::Rgba8)
        .map_err(|e| CoreError::Encode(e.to_string()))?;
    Ok(out)
}

pub struct JpegFrameEncoder {
    frame: RgbImage,
}

impl JpegFrameEncoder {
    pub fn new(frame: RgbImage) -> Self {
        Self { frame }
    }

    pub fn from_rgba(frame: &RgbaImage) -> Self {
        Self::new(flatten_to_rgb(frame))
    }
}

impl QualityEncoder for JpegFrameEncoder {
    fn encode(&self, quality: u8) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .write_image(
                self.frame.as_raw(),
                self.frame.width(),
                self.frame.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| CoreError::Encode(e.to_string()))?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    /// Only set when the pipeline decoded the bytes itself.
    pub decode_ms: Option<u128>,
    pub render_ms: u128,
    pub encode_ms: u128,
}

#[derive(Debug, Clone)]
pub struct OptimizedImage {
    pub preset: FormatPreset,
    pub source_size: ImageSize,
    pub crop: CropRegion,
    pub result: EncodedResult,
    pub timings: StageTimings,
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeOptions {
    pub format: FormatKind,
    pub filter: ResampleFilter,
    pub policy: SearchPolicy,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            format: FormatKind::Square,
            filter: ResampleFilter::default(),
            policy: SearchPolicy::default(),
        }
    }
}

pub fn export_source(
    source: &SourceImage,
    options: &OptimizeOptions,
    telemetry: TelemetryScope<'_>,
) -> Result<OptimizedImage, CoreError> {
    options.policy.validate()?;
    let preset = options.format.preset();

    let render_start = Instant::now();
    let frame = render_frame(source, &preset, options.filter)?;
    telemetry.emit(
        TelemetryEventType::CropComputed,
        Some(render_start.elapsed().as_millis() as u64),
        Some(format!(
            "crop={:.1},{:.1},{:.1}x{:.1},target={}x{}",
            frame.crop.x, frame.crop.y, frame.crop.width, frame.crop.height, preset.width, preset.height
        )),
    );
    let encoder = JpegFrameEncoder::from_rgba(&frame.pixels);
    let render_ms = render_start.elapsed().as_millis();

    let encode_start = Instant::now();
    let result = search_quality_with_telemetry(&encoder, &options.policy, telemetry)?;
    let encode_ms = encode_start.elapsed().as_millis();

    Ok(OptimizedImage {
        preset,
        source_size: source.size(),
        crop: frame.crop,
        result,
        timings: StageTimings {
            decode_ms: None,
            render_ms,
            encode_ms,
        },
    })
}

pub fn optimize_image(
    bytes: &[u8],
    media_type: Option<SourceMediaType>,
    options: &OptimizeOptions,
    telemetry: TelemetryScope<'_>,
) -> Result<OptimizedImage, CoreError> {
    let decode_start = Instant::now();
    let source = decode_source_with_telemetry(bytes, media_type, telemetry)?;
    let decode_ms = decode_start.elapsed().as_millis();
    let mut optimized = export_source(&source, options, telemetry)?;
    optimized.timings.decode_ms = Some(decode_ms);
    Ok(optimized)
}
