use anyhow::Result;
use image::ImageFormat;
use instacrop_core::{v1, FormatKind, ImageSize, SearchOutcome, TelemetryScope};
use instacrop_image::{decode_source, render_frame};
use smoke_tests::build_sample;
use tauri_plugin_instacrop::{optimize_command, EditorSession, ExportState};

fn request(bytes: Vec<u8>, format: FormatKind) -> v1::OptimizeRequest {
    v1::OptimizeRequest {
        image_bytes: bytes,
        media_type: None,
        file_name: Some("sample.jpg".to_string()),
        format: format.key().to_string(),
        min_bytes: Some(1),
        max_bytes: Some(u64::MAX),
        initial_quality: None,
        quality_step: None,
        min_quality: None,
        filter: Some("bilinear".to_string()),
    }
}

#[test]
fn session_and_command_produce_identical_exports() -> Result<()> {
    let sample = build_sample(48, 32, ImageFormat::Png)?;
    for format in [FormatKind::Portrait, FormatKind::Landscape] {
        let command = optimize_command(request(sample.clone(), format)).map_err(anyhow::Error::msg)?;

        let mut session = EditorSession::with_config(instacrop_core::ExportConfig {
            format: format.key().to_string(),
            filter: "bilinear".to_string(),
            min_bytes: Some(1),
            max_bytes: Some(u64::MAX),
            initial_quality: None,
            quality_step: None,
            min_quality: None,
        })?;
        session.load(Some("sample.jpg"), "image/png", &sample, TelemetryScope::disabled())?;
        let artifact = session.export(TelemetryScope::disabled())?;

        assert_eq!(artifact.file_name, command.file_name);
        assert_eq!(artifact.result.quality, command.quality);
        assert_eq!(artifact.result.bytes, command.jpeg_bytes);
        assert_eq!(artifact.crop, command.crop);
        assert_eq!(session.export_state(), ExportState::Completed { fallback: false });
    }
    Ok(())
}

#[test]
fn jpeg_input_round_trips_to_every_preset() -> Result<()> {
    let sample = build_sample(64, 40, ImageFormat::Jpeg)?;
    let source = decode_source(&sample, None)?;
    for format in FormatKind::all() {
        let preset = format.preset();
        let frame = render_frame(&source, &preset, instacrop_core::ResampleFilter::Nearest)?;
        assert_eq!(frame.pixels.dimensions(), (preset.width, preset.height));
        assert!(frame.crop.x + frame.crop.width <= 64.0);
        assert!(frame.crop.y + frame.crop.height <= 40.0);
    }
    Ok(())
}

#[test]
fn tiny_byte_window_falls_back_to_floor_quality() -> Result<()> {
    let sample = build_sample(16, 16, ImageFormat::Png)?;
    let mut req = request(sample, FormatKind::Square);
    req.min_bytes = Some(1);
    req.max_bytes = Some(64);
    let response = optimize_command(req).map_err(anyhow::Error::msg)?;
    assert_eq!(response.outcome, SearchOutcome::Floor);
    assert_eq!(response.quality, 40);
    let decoded = image::load_from_memory(&response.jpeg_bytes)?;
    assert_eq!((decoded.width(), decoded.height()), (1080, 1080));
    Ok(())
}

#[test]
fn crop_matches_reference_examples() -> Result<()> {
    let square = instacrop_core::compute_crop(ImageSize::new(4000, 2000), 1.0)?;
    assert_eq!((square.x, square.y, square.width, square.height), (1000.0, 0.0, 2000.0, 2000.0));
    let portrait = instacrop_core::compute_crop(ImageSize::new(1000, 2000), 0.8)?;
    assert_eq!((portrait.x, portrait.y, portrait.width, portrait.height), (0.0, 375.0, 1000.0, 1250.0));
    let reply: serde_json::Value = serde_json::to_value(portrait)?;
    assert_eq!(reply["y"], 375.0);
    Ok(())
}
