use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use instacrop_core::{
    compute_crop, export_file_name, presets, resolve_export_config, ExportConfig, FormatKind, ImageSize, PlatformTarget,
    SourceMediaType, TelemetryScope, TelemetrySink,
};
use instacrop_image::{decode_source_with_telemetry, encode_preview_png, export_source, render_frame, OptimizeOptions};
use instacrop_telemetry::sink_from_env;

#[derive(Parser, Debug)]
#[command(name = "instacrop", version, about = "Crop images to social post formats and compress them to a size window")]
struct Cli {
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    /// List the available post formats.
    Presets,
    /// Print the centre crop for a source size without touching any pixels.
    Crop(CropArgs),
    /// Write a PNG preview of the cropped and resized frame.
    Preview(PreviewArgs),
    /// Crop, resize and compress to a JPEG inside the byte window.
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct CropArgs {
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long, short = 'f', default_value = "square")]
    format: String,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    #[arg(long, short = 'i')]
    input: PathBuf,
    #[arg(long, short = 'f', default_value = "square")]
    format: String,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, default_value = "lanczos3")]
    filter: String,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(long, short = 'i')]
    input: PathBuf,
    #[arg(long, short = 'f', default_value = "square")]
    format: String,
    /// Output JPEG path. Defaults to a derived name beside the input.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Directory for the derived output name; ignored when --output is set.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    min_bytes: Option<u64>,
    #[arg(long)]
    max_bytes: Option<u64>,
    #[arg(long, short = 'q')]
    initial_quality: Option<u8>,
    #[arg(long)]
    quality_step: Option<u8>,
    #[arg(long)]
    min_quality: Option<u8>,
    #[arg(long, default_value = "lanczos3")]
    filter: String,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    profile: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = sink_from_env();
    let telemetry_ref = telemetry.as_ref().map(|sink| sink.as_ref());

    let report = match cli.command {
        TopLevelCommand::Presets => serde_json::to_value(presets())?,
        TopLevelCommand::Crop(args) => run_crop(&args)?,
        TopLevelCommand::Preview(args) => run_preview(&args, telemetry_ref)?,
        TopLevelCommand::Export(args) => run_export(&args, telemetry_ref)?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_crop(args: &CropArgs) -> Result<serde_json::Value> {
    let preset = FormatKind::parse(&args.format)?.preset();
    let region = compute_crop(ImageSize::new(args.width, args.height), preset.aspect_ratio())?;
    Ok(serde_json::json!({
        "format": preset.kind,
        "target": { "width": preset.width, "height": preset.height },
        "crop": region,
    }))
}

fn run_preview(args: &PreviewArgs, telemetry: Option<&dyn TelemetrySink>) -> Result<serde_json::Value> {
    let cfg = resolve_export_config(ExportConfig {
        format: args.format.clone(),
        filter: args.filter.clone(),
        ..ExportConfig::default()
    });
    let format = cfg.format_kind()?;
    let preset = format.preset();
    let scope = TelemetryScope::new(telemetry, PlatformTarget::Cli, Some(format));

    let media_type = SourceMediaType::from_path(&args.input)?;
    let bytes = read_input(&args.input)?;
    let source = decode_source_with_telemetry(&bytes, Some(media_type), scope)
        .with_context(|| format!("decoding {}", args.input.display()))?;
    let frame = render_frame(&source, &preset, cfg.resample_filter()?)?;
    let png = encode_preview_png(&frame.pixels)?;

    let output = match &args.output {
        Some(path) => path.clone(),
        None => default_preview_path(&args.input, format)?,
    };
    write_output(&output, &png)?;

    Ok(serde_json::json!({
        "input": args.input,
        "output": output,
        "format": format,
        "sourceSize": source.size(),
        "crop": frame.crop,
        "width": preset.width,
        "height": preset.height,
    }))
}

fn run_export(args: &ExportArgs, telemetry: Option<&dyn TelemetrySink>) -> Result<serde_json::Value> {
    let total_start = Instant::now();
    let cfg = resolve_export_config(ExportConfig {
        format: args.format.clone(),
        filter: args.filter.clone(),
        min_bytes: args.min_bytes,
        max_bytes: args.max_bytes,
        initial_quality: args.initial_quality,
        quality_step: args.quality_step,
        min_quality: args.min_quality,
    });
    let options = OptimizeOptions {
        format: cfg.format_kind()?,
        filter: cfg.resample_filter()?,
        policy: cfg.search_policy()?,
    };
    let scope = TelemetryScope::new(telemetry, PlatformTarget::Cli, Some(options.format));

    let media_type = SourceMediaType::from_path(&args.input)?;
    let output = resolve_export_output(args, options.format)?;

    let read_start = Instant::now();
    let bytes = read_input(&args.input)?;
    let read_done = Instant::now();
    let source = decode_source_with_telemetry(&bytes, Some(media_type), scope)
        .with_context(|| format!("decoding {}", args.input.display()))?;
    let decode_done = Instant::now();

    eprintln!("Optimizing {} for {}...", args.input.display(), options.format.preset().describe());
    let optimized = export_source(&source, &options, scope)?;
    write_output(&output, &optimized.result.bytes)?;

    let mut timings = serde_json::Map::new();
    if args.profile {
        timings.insert(
            "readInput".to_string(),
            serde_json::json!(read_done.duration_since(read_start).as_millis()),
        );
        timings.insert(
            "decodeInput".to_string(),
            serde_json::json!(decode_done.duration_since(read_done).as_millis()),
        );
        timings.insert("render".to_string(), serde_json::json!(optimized.timings.render_ms));
        timings.insert("encodeSearch".to_string(), serde_json::json!(optimized.timings.encode_ms));
        timings.insert("total".to_string(), serde_json::json!(total_start.elapsed().as_millis()));
    }

    Ok(serde_json::json!({
        "input": args.input,
        "output": output,
        "format": optimized.preset.kind,
        "width": optimized.preset.width,
        "height": optimized.preset.height,
        "sourceSize": optimized.source_size,
        "crop": optimized.crop,
        "quality": optimized.result.quality,
        "bytes": optimized.result.byte_len,
        "sizeMiB": (optimized.result.size_mib() * 100.0).round() / 100.0,
        "outcome": optimized.result.outcome,
        "attempts": optimized.result.attempts,
        "timingsMs": if args.profile { Some(serde_json::Value::Object(timings)) } else { None }
    }))
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| anyhow!("failed to read input {}: {}", path.display(), err))
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn resolve_export_output(args: &ExportArgs, format: FormatKind) -> Result<PathBuf> {
    if let Some(path) = &args.output {
        validate_jpeg_extension(path)?;
        return Ok(path.clone());
    }
    let file_name = export_file_name(args.input.file_name().and_then(|n| n.to_str()), &format.preset());
    let dir = match &args.output_dir {
        Some(dir) => dir.clone(),
        None => args.input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    Ok(dir.join(file_name))
}

fn default_preview_path(input: &Path, format: FormatKind) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("input file must include a valid file name"))?
        .to_string_lossy();
    let filename = format!("{}_preview_{}.png", stem, format.key());
    let out_path = if let Some(parent) = input.parent() {
        parent.join(filename)
    } else {
        PathBuf::from(filename)
    };
    Ok(out_path)
}

fn validate_jpeg_extension(path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if ext != "jpg" && ext != "jpeg" {
        return Err(anyhow!(
            "output must be a .jpg or .jpeg file (received: '{}')",
            path.display()
        ));
    }
    Ok(())
}
